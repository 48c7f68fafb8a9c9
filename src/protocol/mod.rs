//! BSL protocol families.
//!
//! Every family drives the same session lifecycle:
//!
//! ```text
//! connect -> handshake -> erase_flash -> program_flash -> program_options -> disconnect
//! ```
//!
//! `connect` power cycles the target, synchronizes with the BSL and decodes
//! the status packet into [`McuInfo`] and an [`OptionSet`]. The remaining
//! steps are only valid after a successful `connect`.
use crate::device::{Family, McuModel, ModelDb};
use crate::error::{Error, Result};
use crate::options::OptionSet;
use crate::progress::ProgressSink;
use crate::transport::Transport;
use crate::CancelToken;

pub use self::auto::AutoProtocol;
pub use self::link::{Link, PortConfig, ResetPin, ResetStrategy, StatusPolicy};
pub use self::stc12::{Stc12AProtocol, Stc12Protocol, Stc12Variant};
pub use self::stc15::{Stc15AProtocol, Stc15Protocol};
pub use self::stc8::{Stc8Protocol, Stc8Variant};
pub use self::stc89::{Stc89AProtocol, Stc89Protocol};
pub use self::usb15::StcUsb15Protocol;

pub mod auto;
mod link;
mod stc12;
mod stc15;
mod stc8;
mod stc89;
pub mod usb15;

/// One BSL protocol family.
pub trait Protocol {
    fn family(&self) -> Family;

    /// Power cycle the target, wait for its status packet and decode it.
    fn connect(&mut self, reset: &ResetStrategy) -> Result<()>;

    /// Negotiate the transfer baud rate, calibrating the RC oscillator where
    /// the family supports it.
    fn handshake(&mut self) -> Result<()>;

    /// Erase `erase_size` bytes of a `flash_size` byte array.
    fn erase_flash(&mut self, erase_size: usize, flash_size: usize) -> Result<()>;

    /// Write `data` from address 0, reporting progress after every block.
    fn program_flash(&mut self, data: &[u8], progress: &mut dyn ProgressSink) -> Result<()>;

    /// Change one option in the local copy; nothing is sent until
    /// [`program_options`](Self::program_options).
    fn set_option(&mut self, name: &str, value: &str) -> Result<()>;

    fn program_options(&mut self) -> Result<()>;

    /// Reset the target into user code and release the transport.
    fn disconnect(&mut self) -> Result<()>;

    fn mcu_info(&self) -> Option<&McuInfo>;

    /// Unique chip ID, known after erasing (or option programming on some
    /// families).
    fn uid(&self) -> Option<&[u8]>;

    fn options(&self) -> Option<&dyn OptionSet>;

    /// Code and EEPROM sizes after a program/EEPROM split change.
    fn memory_split(&self) -> Option<(u32, u32)> {
        None
    }
}

/// Everything learned from the status packet.
#[derive(Debug, Clone, PartialEq)]
pub struct McuInfo {
    pub magic: u16,
    pub model: McuModel,
    /// Measured or reported CPU clock in Hz
    pub clock_hz: f64,
    /// BSL version as printed, e.g. `7.2.5T`
    pub bsl_version: String,
    /// BSL version byte, e.g. 0x72
    pub bsl_byte: u8,
    /// Wakeup timer frequency in Hz
    pub wakeup_freq: Option<u16>,
    /// Internal reference voltage in mV
    pub reference_voltage: Option<u16>,
    /// Manufacturing date as (year, month, day)
    pub mfg_date: Option<(u16, u8, u8)>,
}

impl McuInfo {
    pub(crate) fn new(model: McuModel, clock_hz: f64, bsl_version: String, bsl_byte: u8) -> Self {
        McuInfo {
            magic: model.magic,
            model,
            clock_hz,
            bsl_version,
            bsl_byte,
            wakeup_freq: None,
            reference_voltage: None,
            mfg_date: None,
        }
    }

    pub fn print(&self) {
        self.model.print_info();
        log::info!("Target frequency: {:.3} MHz", self.clock_hz / 1e6);
        log::info!("Target BSL version: {}", self.bsl_version);
        if let Some(wakeup) = self.wakeup_freq {
            log::info!("Target wakeup frequency: {:.3} KHz", wakeup as f64 / 1000.0);
        }
        if let Some(voltage) = self.reference_voltage {
            log::info!("Target ref. voltage: {} mV", voltage);
        }
        if let Some((year, month, day)) = self.mfg_date {
            log::info!("Target mfg. date: {:04}-{:02}-{:02}", year, month, day);
        }
    }
}

/// State of a connected session.
#[derive(Debug)]
pub(crate) struct Target<O> {
    pub info: McuInfo,
    pub options: O,
    pub uid: Option<Vec<u8>>,
}

impl<O: OptionSet> Target<O> {
    pub fn new(info: McuInfo, options: O) -> Self {
        Target {
            info,
            options,
            uid: None,
        }
    }

    /// Log the decoded status packet.
    pub fn print(&self) {
        self.info.print();
        self.options.print();
    }
}

pub(crate) fn not_connected() -> Error {
    Error::protocol("not connected to a target")
}

/// Construct the protocol of `family` over a serial transport.
///
/// [`Family::Usb15`] does not use the serial port; open it with
/// [`usb15::open`] instead.
pub fn open_serial<T: Transport + 'static>(family: Family, link: Link<T>) -> Result<Box<dyn Protocol>> {
    Ok(match family {
        Family::Auto => Box::new(AutoProtocol::new(link)),
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
        Family::Usb15 => {
            return Err(Error::InvalidOption(
                "usb15 talks over USB, not a serial port".into(),
            ));
        }
    })
}

/// Open the protocol of `family`, picking the transport it needs.
pub fn open(family: Family, config: PortConfig, cancel: CancelToken) -> Result<Box<dyn Protocol>> {
    if family == Family::Usb15 {
        return usb15::open(cancel);
    }
    let port = crate::transport::SerialTransport::open(
        &config.port,
        config.handshake_baud,
        crate::transport::Parity::None,
    )?;
    open_serial(family, Link::new(port, config).with_cancel(cancel))
}

/// Fail unless the reply starts with `magic`.
pub(crate) fn expect_reply(response: &[u8], magic: u8, what: &str) -> Result<()> {
    match response.first() {
        Some(&b) if b == magic => Ok(()),
        _ => Err(Error::protocol(format!("incorrect magic in {what} packet"))),
    }
}

/// Fail unless the reply is `magic 54`.
pub(crate) fn expect_write_ok(response: &[u8], magic: u8, what: &str) -> Result<()> {
    if response.len() < 2 || response[0] != magic || response[1] != crate::constants::WRITE_OK {
        return Err(Error::protocol(format!("incorrect magic in {what} packet")));
    }
    Ok(())
}

/// Look up the model from the magic word at offset 20 of the status.
pub(crate) fn resolve_model(status: &[u8]) -> Result<McuModel> {
    let magic = crate::packet::be_u16(status, 20)?;
    Ok(ModelDb::global()?.resolve(magic, byte_at(status, 17)?))
}

pub(crate) fn byte_at(data: &[u8], index: usize) -> Result<u8> {
    data.get(index)
        .copied()
        .ok_or_else(|| Error::protocol("status packet too short"))
}

/// Mean of `count` big-endian u16 frequency counters starting at offset 1.
pub(crate) fn average_counter(status: &[u8], count: usize) -> Result<f64> {
    let mut sum = 0u32;
    for i in 0..count {
        sum += crate::packet::be_u16(status, 1 + 2 * i)? as u32;
    }
    Ok(sum as f64 / count as f64)
}

/// `major.minor` plus stepping letter, optionally with a patch digit from
/// the low nibble of byte 22.
pub(crate) fn bsl_version(status: &[u8], with_patch: bool) -> Result<String> {
    let version = byte_at(status, 17)?;
    let stepping = byte_at(status, 18)? as char;
    let (major, minor) = (version >> 4, version & 0x0f);
    if with_patch {
        let patch = byte_at(status, 22)? & 0x0f;
        Ok(format!("{major}.{minor}.{patch}{stepping}"))
    } else {
        Ok(format!("{major}.{minor}{stepping}"))
    }
}

/// Block offset as sent on the wire.
pub(crate) fn wire_offset(offset: usize) -> Result<[u8; 2]> {
    u16::try_from(offset)
        .map(u16::to_be_bytes)
        .map_err(|_| Error::protocol("image does not fit the 64 KiB address space"))
}

/// Split `data` into `block_size` blocks and hand each with its offset to
/// `write`, reporting progress after every block and once more at the end.
pub(crate) fn for_each_block(
    data: &[u8],
    block_size: usize,
    progress: &mut dyn ProgressSink,
    mut write: impl FnMut(usize, &[u8]) -> Result<()>,
) -> Result<()> {
    for (n, block) in data.chunks(block_size).enumerate() {
        let offset = n * block_size;
        write(offset, block)?;
        progress.progress(offset, block_size, data.len());
    }
    progress.progress(data.len(), block_size, data.len());
    Ok(())
}

pub(crate) fn log_uid(uid: Option<&[u8]>) {
    match uid {
        Some(uid) => log::info!("Target UID: {}", hex::encode_upper(uid)),
        None => log::info!("Target UID: unknown"),
    }
}
