//! Serial session shared by every UART protocol family: port setup, reset,
//! synchronization and packet I/O.
use std::{process::Command, time::Duration};

use crate::constants::{PULSE_SYNC, commands};
use crate::device::McuModel;
use crate::error::{Error, Result};
use crate::packet::{self, Framing, dump_packet};
use crate::transport::{Parity, Transport};
use crate::CancelToken;

/// Timeouts while waiting for the BSL to answer.
const SYNC_TIMEOUT: Duration = Duration::from_millis(500);
/// Timeouts once synchronized, covering slow flash operations.
const SESSION_READ_TIMEOUT: Duration = Duration::from_secs(15);
const SESSION_INTER_CHAR_TIMEOUT: Duration = Duration::from_secs(1);
/// Cadence of the synchronization pulses
const PULSE_INTERVAL: Duration = Duration::from_millis(30);

/// Serial port settings of one session.
#[derive(Debug, Clone, PartialEq)]
pub struct PortConfig {
    pub port: String,
    /// Baud rate used until the handshake switches over
    pub handshake_baud: u32,
    /// Baud rate used for erasing and programming
    pub transfer_baud: u32,
    /// Requested RC oscillator frequency in Hz, 0 to keep the current one
    pub trim_hz: f64,
}

impl Default for PortConfig {
    fn default() -> Self {
        PortConfig {
            port: String::new(),
            handshake_baud: 2400,
            transfer_baud: 19200,
            trim_hz: 0.0,
        }
    }
}

/// Modem control line used to power cycle the target.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ResetPin {
    Rts,
    Dtr,
    RtsInverted,
    DtrInverted,
}

impl ResetPin {
    /// Line and level that cut power to the target.
    fn power_off(self) -> (bool, bool) {
        // (is_rts, level)
        match self {
            ResetPin::Rts => (true, true),
            ResetPin::Dtr => (false, true),
            ResetPin::RtsInverted => (true, false),
            ResetPin::DtrInverted => (false, false),
        }
    }
}

impl std::str::FromStr for ResetPin {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "rts" => Ok(ResetPin::Rts),
            "dtr" => Ok(ResetPin::Dtr),
            "rts-inverted" => Ok(ResetPin::RtsInverted),
            "dtr-inverted" => Ok(ResetPin::DtrInverted),
            _ => Err(Error::InvalidOption(format!("unknown reset pin {s:?}"))),
        }
    }
}

/// How the target is power cycled into its BSL.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum ResetStrategy {
    /// Ask the user to cycle power
    #[default]
    Manual,
    /// Toggle a modem control line
    Pin(ResetPin),
    /// Run a shell command
    Command(String),
}

/// How a family acknowledges the status packet during synchronization.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StatusPolicy {
    /// The status packet must start with this byte.
    Expect(u8),
    /// A leading 0x80 is answered with a raw STC12 re-ack at even parity.
    Reack,
    /// A leading 0x80 is answered with a framed re-ack; the final status
    /// must start with 0x50.
    FramedReack,
    /// Like `Reack`, but the checksum is left unchecked because the family
    /// is not known yet.
    Detect,
}

/// An open serial session with the BSL.
pub struct Link<T: Transport> {
    transport: T,
    framing: Framing,
    config: PortConfig,
    cancel: CancelToken,
    raw_status: Vec<u8>,
}

impl<T: Transport> Link<T> {
    pub fn new(transport: T, config: PortConfig) -> Self {
        Link {
            transport,
            framing: Framing::STC89,
            config,
            cancel: CancelToken::default(),
            raw_status: Vec::new(),
        }
    }

    /// Abort synchronization when `cancel` fires.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &PortConfig {
        &self.config
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    pub(crate) fn set_framing(&mut self, framing: Framing) {
        self.framing = framing;
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Status packet exactly as received, envelope included.
    pub fn raw_status(&self) -> &[u8] {
        &self.raw_status
    }

    /// Re-validate the stored status packet with the current framing.
    pub(crate) fn rewrap_status(&self) -> Result<Vec<u8>> {
        if self.raw_status.is_empty() {
            return Err(Error::protocol("no status packet received"));
        }
        self.framing.extract_payload(&self.raw_status)
    }

    /// Bring the port to the handshake settings with an empty input buffer.
    pub fn open(&mut self, parity: Parity) -> Result<()> {
        self.transport.set_parity(parity)?;
        self.transport.set_baud_rate(self.config.handshake_baud)?;
        self.transport.set_timeouts(SYNC_TIMEOUT, SYNC_TIMEOUT)?;
        self.transport.clear_input()
    }

    pub fn reset(&mut self, strategy: &ResetStrategy) -> Result<()> {
        match strategy {
            ResetStrategy::Manual => {
                log::info!("Waiting for MCU, please cycle power");
            }
            ResetStrategy::Pin(pin) => {
                log::info!("Cycling power via {:?}", pin);
                let (rts, level) = pin.power_off();
                self.set_line(rts, level)?;
                self.transport.delay(Duration::from_millis(250));
                self.set_line(rts, !level)?;
                self.transport.delay(Duration::from_millis(30));
                log::info!("Waiting for MCU");
            }
            ResetStrategy::Command(cmd) => {
                log::info!("Cycling power via shell cmd: {}", cmd);
                run_shell(cmd)?;
                log::info!("Waiting for MCU");
            }
        }
        Ok(())
    }

    fn set_line(&mut self, rts: bool, level: bool) -> Result<()> {
        if rts {
            self.transport.set_rts(level)
        } else {
            self.transport.set_dtr(level)
        }
    }

    /// Pull DTR low for `low` and release it again.
    pub(crate) fn cycle_dtr(&mut self, low: Duration) -> Result<()> {
        log::info!("Cycling power via DTR");
        self.transport.set_dtr(false)?;
        self.transport.delay(low);
        self.transport.set_dtr(true)?;
        log::info!("Waiting for MCU");
        Ok(())
    }

    /// Send `character` every 30 ms until the MCU has something to say.
    pub fn pulse(&mut self, character: u8, timeout: Option<Duration>) -> Result<()> {
        let mut elapsed = Duration::ZERO;
        loop {
            if timeout.is_some_and(|t| elapsed > t) {
                return Err(Error::Timeout("pulse timeout".into()));
            }
            self.transport.write_all(&[character])?;
            self.transport.delay(PULSE_INTERVAL);
            elapsed += PULSE_INTERVAL;
            if self.transport.bytes_to_read()? > 0 {
                return Ok(());
            }
        }
    }

    /// Pulse until a valid status packet of at least `min_len` payload bytes
    /// arrives, then widen the timeouts. There is no retry limit: the user
    /// may take any time to power cycle the target, so only the cancel token
    /// ends the wait.
    pub fn synchronize(&mut self, policy: StatusPolicy, min_len: usize) -> Result<Vec<u8>> {
        let status = loop {
            self.cancel.check()?;
            match self.try_status(policy) {
                Ok(status) if status.len() >= min_len => break status,
                Ok(status) => log::debug!("status packet too short ({} bytes)", status.len()),
                Err(e) if e.is_retryable_during_sync() => log::trace!("sync: {}", e),
                Err(e) => return Err(e),
            }
        };
        log::info!("MCU is responding");

        self.transport
            .set_timeouts(SESSION_READ_TIMEOUT, SESSION_INTER_CHAR_TIMEOUT)?;
        Ok(status)
    }

    fn try_status(&mut self, policy: StatusPolicy) -> Result<Vec<u8>> {
        let verify = policy != StatusPolicy::Detect;
        self.pulse(PULSE_SYNC, None)?;
        let mut status = self.read_status(verify)?;
        if status.is_empty() {
            return Ok(status);
        }

        match policy {
            StatusPolicy::Expect(magic) => {
                if status[0] != magic {
                    return Err(Error::protocol(format!(
                        "incorrect magic in status packet: {:02x}",
                        status[0]
                    )));
                }
            }
            StatusPolicy::Reack | StatusPolicy::Detect => {
                if status[0] == commands::STATUS_REACK {
                    self.transport.set_parity(Parity::Even)?;
                    let packet = Framing::STC12.encode(&[commands::STATUS_REACK]);
                    dump_packet(&packet, false);
                    self.transport.write_all(&packet)?;
                    self.pulse(PULSE_SYNC, None)?;
                    status = self.read_status(verify)?;
                }
            }
            StatusPolicy::FramedReack => {
                if status[0] == commands::STATUS_REACK {
                    self.write_packet(&[commands::STATUS_REACK])?;
                    self.pulse(PULSE_SYNC, None)?;
                    status = self.read_status(verify)?;
                }
                if status.first() != Some(&commands::STATUS) {
                    return Err(Error::protocol("incorrect magic in status packet"));
                }
            }
        }
        Ok(status)
    }

    fn read_status(&mut self, verify: bool) -> Result<Vec<u8>> {
        let raw = packet::read_raw(&mut self.transport, Framing::STC89.envelope_len())?;
        let payload = if verify {
            self.framing.extract_payload(&raw)?
        } else {
            // keep the checksum bytes, the family decides their width later
            raw[5..raw.len() - 1].to_vec()
        };
        dump_packet(&raw, true);
        self.raw_status = raw;
        Ok(payload)
    }

    pub fn resolve_model(&self, status: &[u8]) -> Result<McuModel> {
        super::resolve_model(status)
    }

    pub fn write_packet(&mut self, payload: &[u8]) -> Result<()> {
        self.framing.write_packet(&mut self.transport, payload)
    }

    pub fn write_packet_with_epilogue(&mut self, payload: &[u8], epilogue_len: usize) -> Result<()> {
        self.framing
            .write_packet_with_epilogue(&mut self.transport, payload, epilogue_len)
    }

    pub fn read_packet(&mut self) -> Result<Vec<u8>> {
        self.framing.read_packet(&mut self.transport)
    }

    /// Write a request and read its reply.
    pub fn transfer(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        self.write_packet(payload)?;
        self.read_packet()
    }

    pub fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
        log::debug!("Setting baud rate to {}", baud_rate);
        self.transport.set_baud_rate(baud_rate)
    }

    pub fn use_handshake_baud(&mut self) -> Result<()> {
        self.set_baud_rate(self.config.handshake_baud)
    }

    pub fn use_transfer_baud(&mut self) -> Result<()> {
        self.set_baud_rate(self.config.transfer_baud)
    }

    pub fn set_parity(&mut self, parity: Parity) -> Result<()> {
        self.transport.set_parity(parity)
    }

    pub fn delay(&mut self, duration: Duration) {
        self.transport.delay(duration)
    }

    /// Send the reset command and release the port. The port is closed even
    /// when the command cannot be sent.
    pub fn disconnect(&mut self, reset_command: u8) -> Result<()> {
        let sent = self.write_packet(&[reset_command]);
        self.transport.close()?;
        sent?;
        log::info!("Disconnected!");
        Ok(())
    }
}

fn run_shell(cmd: &str) -> Result<()> {
    let status = if cfg!(windows) {
        Command::new("cmd").args(["/C", cmd]).status()?
    } else {
        Command::new("sh").args(["-c", cmd]).status()?
    };
    if !status.success() {
        log::warn!("Reset command exited with {}", status);
    }
    Ok(())
}
