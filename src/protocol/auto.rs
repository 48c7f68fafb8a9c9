//! Protocol autodetection.
//!
//! The status packet is read without checking its checksum, the model is
//! looked up from its magic, and the session is handed over to the family
//! whose name pattern matches the model.
use super::link::{Link, ResetStrategy, StatusPolicy};
use super::{
    McuInfo, Protocol, Stc12AProtocol, Stc12Protocol, Stc12Variant, Stc15AProtocol,
    Stc15Protocol, Stc8Protocol, Stc8Variant, Stc89AProtocol, Stc89Protocol, not_connected,
};
use crate::constants::{MIN_STATUS_LEN, commands};
use crate::device::{Family, McuModel};
use crate::error::{Error, Result};
use crate::options::OptionSet;
use crate::progress::ProgressSink;
use crate::transport::{Parity, Transport};

/// A family that can take over a session synchronized by autodetection.
trait Attach: Protocol {
    /// Re-validate the stored status packet and decode it as `model`.
    fn attach(&mut self, model: McuModel) -> Result<()>;
}

macro_rules! impl_attach {
    ($($protocol:ident),+) => {
        $(
            impl<T: Transport> Attach for $protocol<T> {
                fn attach(&mut self, model: McuModel) -> Result<()> {
                    $protocol::attach(self, model)
                }
            }
        )+
    };
}

impl_attach!(
    Stc89Protocol,
    Stc89AProtocol,
    Stc12AProtocol,
    Stc12Protocol,
    Stc15AProtocol,
    Stc15Protocol,
    Stc8Protocol
);

/// The serial protocol of `family` over `link`. Families that cannot take
/// over a serial session hand the link back.
fn serial_family<T: Transport + 'static>(
    family: Family,
    link: Link<T>,
) -> std::result::Result<Box<dyn Attach>, Link<T>> {
    Ok(match family {
        Family::Stc89 => Box::new(Stc89Protocol::new(link)),
        Family::Stc89a => Box::new(Stc89AProtocol::new(link)),
        Family::Stc12a => Box::new(Stc12AProtocol::new(link)),
        Family::Stc12 => Box::new(Stc12Protocol::new(link, Stc12Variant::Stc12)),
        Family::Stc12b => Box::new(Stc12Protocol::new(link, Stc12Variant::Stc12b)),
        Family::Stc15a => Box::new(Stc15AProtocol::new(link)),
        Family::Stc15 => Box::new(Stc15Protocol::new(link)),
        Family::Stc8 => Box::new(Stc8Protocol::new(link, Stc8Variant::Stc8)),
        Family::Stc8d => Box::new(Stc8Protocol::new(link, Stc8Variant::Stc8d)),
        Family::Stc8g => Box::new(Stc8Protocol::new(link, Stc8Variant::Stc8g)),
        Family::Auto | Family::Usb15 => return Err(link),
    })
}

/// Detects the family on `connect` and forwards everything else to it.
pub struct AutoProtocol<T: Transport + 'static> {
    pending: Option<Link<T>>,
    protocol: Option<Box<dyn Attach>>,
}

impl<T: Transport + 'static> AutoProtocol<T> {
    pub fn new(link: Link<T>) -> Self {
        AutoProtocol {
            pending: Some(link),
            protocol: None,
        }
    }

    fn inner(&mut self) -> Result<&mut (dyn Attach + 'static)> {
        self.protocol.as_deref_mut().ok_or_else(not_connected)
    }
}

impl<T: Transport + 'static> Protocol for AutoProtocol<T> {
    fn family(&self) -> Family {
        self.protocol.as_ref().map_or(Family::Auto, |p| p.family())
    }

    fn connect(&mut self, reset: &ResetStrategy) -> Result<()> {
        let link = self
            .pending
            .as_mut()
            .ok_or_else(|| Error::protocol("protocol already detected"))?;
        link.open(Parity::None)?;
        link.reset(reset)?;
        let status = link.synchronize(StatusPolicy::Detect, MIN_STATUS_LEN)?;
        let model = link.resolve_model(&status)?;
        let family = Family::autodetect(&model.name)
            .ok_or_else(|| Error::protocol("cannot detect protocol"))?;
        log::info!("Protocol detected: {}", family);

        let link = self.pending.take().ok_or_else(not_connected)?;
        match serial_family(family, link) {
            // kept even when attaching fails so that disconnect can reset
            Ok(protocol) => self.protocol.insert(protocol).attach(model),
            Err(link) => {
                self.pending = Some(link);
                Err(Error::protocol(format!(
                    "{family} cannot take over a serial session"
                )))
            }
        }
    }

    fn handshake(&mut self) -> Result<()> {
        self.inner()?.handshake()
    }

    fn erase_flash(&mut self, erase_size: usize, flash_size: usize) -> Result<()> {
        self.inner()?.erase_flash(erase_size, flash_size)
    }

    fn program_flash(&mut self, data: &[u8], progress: &mut dyn ProgressSink) -> Result<()> {
        self.inner()?.program_flash(data, progress)
    }

    fn set_option(&mut self, name: &str, value: &str) -> Result<()> {
        self.inner()?.set_option(name, value)
    }

    fn program_options(&mut self) -> Result<()> {
        self.inner()?.program_options()
    }

    /// Before detection succeeds the link is closed with the legacy reset.
    fn disconnect(&mut self) -> Result<()> {
        if let Some(protocol) = self.protocol.as_mut() {
            return protocol.disconnect();
        }
        match self.pending.take() {
            Some(mut link) => link.disconnect(commands::RESET_LEGACY),
            None => Ok(()),
        }
    }

    fn mcu_info(&self) -> Option<&McuInfo> {
        self.protocol.as_ref().and_then(|p| p.mcu_info())
    }

    fn uid(&self) -> Option<&[u8]> {
        self.protocol.as_ref().and_then(|p| p.uid())
    }

    fn options(&self) -> Option<&dyn OptionSet> {
        self.protocol.as_ref().and_then(|p| p.options())
    }

    fn memory_split(&self) -> Option<(u32, u32)> {
        self.protocol.as_ref().and_then(|p| p.memory_split())
    }
}
