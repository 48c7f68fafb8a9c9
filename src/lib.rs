//! STC 8051 ISP protocol implementation.
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

pub mod calibration;
pub mod constants;
pub mod device;
pub mod error;
pub mod flashing;
pub mod format;
pub mod options;
pub mod packet;
pub mod progress;
pub mod protocol;
pub mod transport;

pub use self::device::{Family, McuModel, ModelDb};
pub use self::error::{Error, Result};
pub use self::flashing::Flashing;
pub use self::protocol::{McuInfo, PortConfig, Protocol, ResetPin, ResetStrategy};
pub use self::transport::{ControlTransport, Transport};

/// Shared flag that ends the wait for the MCU.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Fail with [`Error::Cancelled`] once [`cancel`](Self::cancel) was called.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_flag() {
        let token = CancelToken::new();
        let other = token.clone();
        assert!(token.check().is_ok());
        other.cancel();
        assert!(token.is_cancelled());
        assert!(matches!(token.check(), Err(Error::Cancelled)));
    }
}
