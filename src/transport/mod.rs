//! Abstract device transport interface.
use std::time::Duration;

use crate::error::Result;

pub use self::mock::{MockPort, MockUsb};
pub use self::serial::SerialTransport;
#[cfg(feature = "usb")]
pub use self::usb::UsbTransport;

pub mod mock;
mod serial;
#[cfg(feature = "usb")]
mod usb;

/// Parity of the UART link. STC89 parts use none, STC12 and later even.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Parity {
    #[default]
    None,
    Even,
}

/// Abstraction of a serial-port-like byte link.
///
/// The protocol engine is the sole owner of the link for the whole session,
/// including its baud rate and parity which change mid-session.
pub trait Transport {
    /// Fill `buf` completely or fail with [`crate::Error::Timeout`].
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()>;
    /// Write all bytes and flush.
    fn write_all(&mut self, data: &[u8]) -> Result<()>;
    /// Number of bytes waiting in the input buffer.
    fn bytes_to_read(&mut self) -> Result<u32>;
    /// Drop everything in the input buffer.
    fn clear_input(&mut self) -> Result<()>;

    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()>;
    fn baud_rate(&self) -> u32;
    fn set_parity(&mut self, parity: Parity) -> Result<()>;
    fn set_timeouts(&mut self, read: Duration, inter_char: Duration) -> Result<()>;

    fn set_rts(&mut self, level: bool) -> Result<()>;
    fn set_dtr(&mut self, level: bool) -> Result<()>;

    /// Release the port. Further I/O fails.
    fn close(&mut self) -> Result<()>;

    /// Block for `duration`. Tests replace this with a no-op.
    fn delay(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Abstraction of a USB device talking over vendor control transfers.
pub trait ControlTransport {
    /// Device-to-host vendor request.
    fn control_in(&mut self, request: u8, value: u16, index: u16, len: usize) -> Result<Vec<u8>>;
    /// Host-to-device vendor request.
    fn control_out(&mut self, request: u8, value: u16, index: u16, data: &[u8]) -> Result<()>;

    /// Control transfers cannot block for a reply, so the protocol polls
    /// with fixed sleeps routed through here.
    fn delay(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        (**self).read_exact(buf)
    }
    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        (**self).write_all(data)
    }
    fn bytes_to_read(&mut self) -> Result<u32> {
        (**self).bytes_to_read()
    }
    fn clear_input(&mut self) -> Result<()> {
        (**self).clear_input()
    }
    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
        (**self).set_baud_rate(baud_rate)
    }
    fn baud_rate(&self) -> u32 {
        (**self).baud_rate()
    }
    fn set_parity(&mut self, parity: Parity) -> Result<()> {
        (**self).set_parity(parity)
    }
    fn set_timeouts(&mut self, read: Duration, inter_char: Duration) -> Result<()> {
        (**self).set_timeouts(read, inter_char)
    }
    fn set_rts(&mut self, level: bool) -> Result<()> {
        (**self).set_rts(level)
    }
    fn set_dtr(&mut self, level: bool) -> Result<()> {
        (**self).set_dtr(level)
    }
    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
    fn delay(&mut self, duration: Duration) {
        (**self).delay(duration)
    }
}
