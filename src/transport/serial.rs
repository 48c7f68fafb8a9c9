//! Serial Transportation.
use std::{
    io::{ErrorKind, Read, Write},
    time::Duration,
};

use serialport::{ClearBuffer, SerialPort};

use super::{Parity, Transport};
use crate::error::{Error, Result};

/// Short timeout used while waiting for the BSL to wake up.
pub const SYNC_TIMEOUT: Duration = Duration::from_millis(500);

impl From<Parity> for serialport::Parity {
    fn from(value: Parity) -> Self {
        match value {
            Parity::None => serialport::Parity::None,
            Parity::Even => serialport::Parity::Even,
        }
    }
}

pub struct SerialTransport {
    serial_port: Option<Box<dyn SerialPort>>,
    name: String,
    baud_rate: u32,
}

impl SerialTransport {
    pub fn scan_ports() -> Result<Vec<String>> {
        let ports = serialport::available_ports()?;
        Ok(ports.into_iter().map(|p| p.port_name).collect())
    }

    /// Open `port` at the handshake baud rate with a short timeout and an
    /// empty input buffer.
    pub fn open(port: &str, baud_rate: u32, parity: Parity) -> Result<Self> {
        log::info!("Opening serial port: \"{}\" @ {} baud", port, baud_rate);
        let serial_port = serialport::new(port, baud_rate)
            .parity(parity.into())
            .timeout(SYNC_TIMEOUT)
            .open()?;
        // Some CH340 drivers ignore the rate given at open time.
        let mut transport = SerialTransport {
            serial_port: Some(serial_port),
            name: port.to_string(),
            baud_rate,
        };
        transport.set_baud_rate(baud_rate)?;
        transport.clear_input()?;
        Ok(transport)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn port(&mut self) -> Result<&mut Box<dyn SerialPort>> {
        self.serial_port
            .as_mut()
            .ok_or_else(|| Error::Io(std::io::Error::new(ErrorKind::NotConnected, "port closed")))
    }
}

impl Transport for SerialTransport {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let port = self.port()?;
        let mut filled = 0;
        while filled < buf.len() {
            match port.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::TimedOut => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        if filled != buf.len() {
            return Err(Error::Timeout(format!(
                "read timeout ({} of {} bytes)",
                filled,
                buf.len()
            )));
        }
        Ok(())
    }

    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let port = self.port()?;
        port.write_all(data)?;
        port.flush()?;
        Ok(())
    }

    fn bytes_to_read(&mut self) -> Result<u32> {
        Ok(self.port()?.bytes_to_read()?)
    }

    fn clear_input(&mut self) -> Result<()> {
        self.port()?.clear(ClearBuffer::Input)?;
        Ok(())
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
        self.port()?.set_baud_rate(baud_rate)?;
        self.baud_rate = baud_rate;
        Ok(())
    }

    fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    fn set_parity(&mut self, parity: Parity) -> Result<()> {
        self.port()?.set_parity(parity.into())?;
        Ok(())
    }

    // serialport has a single timeout; the inter-character limit is
    // implied by it.
    fn set_timeouts(&mut self, read: Duration, _inter_char: Duration) -> Result<()> {
        self.port()?.set_timeout(read)?;
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        self.port()?.write_request_to_send(level)?;
        Ok(())
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        self.port()?.write_data_terminal_ready(level)?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.serial_port.take().is_some() {
            log::debug!("Closed serial port {}", self.name);
        }
        Ok(())
    }
}
