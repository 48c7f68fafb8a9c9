//! STC89/STC90 and STC89A protocols.
use std::time::Duration;

use super::{
    McuInfo, Protocol, Target, average_counter, bsl_version, byte_at, expect_reply,
    for_each_block, log_uid, not_connected, wire_offset,
};
use crate::calibration::{brt_89, brt_89a, erase_block_count};
use crate::constants::{MIN_STATUS_LEN, commands};
use crate::device::{Family, McuModel};
use crate::error::{Error, Result};
use crate::options::{OptionSet, Stc89Option};
use crate::packet::{Framing, be_u16};
use crate::progress::ProgressSink;
use crate::transport::{Parity, Transport};

use super::link::{Link, ResetStrategy, StatusPolicy};

const BLOCK_SIZE: usize = 128;
const PING_COUNT: usize = 4;

/// Ping request carrying the model magic, used by STC89 and STC12A.
pub(super) fn ping_packet(magic: u16) -> Vec<u8> {
    let [hi, lo] = magic.to_be_bytes();
    vec![commands::PING, 0x00, 0x00, 0x36, 0x01, hi, lo]
}

/// Program `data` in 128-byte blocks, each acknowledged with `80 csum`
/// where `csum` is the byte sum of the block. Shared by STC89 and STC12A.
pub(super) fn program_checked_blocks<T: Transport>(
    link: &mut Link<T>,
    data: &[u8],
    progress: &mut dyn ProgressSink,
) -> Result<()> {
    for_each_block(data, BLOCK_SIZE, progress, |offset, block| {
        let mut packet = vec![0x00, 0x00, 0x00];
        packet.extend_from_slice(&wire_offset(offset)?);
        packet.extend_from_slice(&(BLOCK_SIZE as u16).to_be_bytes());
        packet.extend_from_slice(block);
        packet.resize(7 + BLOCK_SIZE, 0x00);
        let csum = packet[7..].iter().fold(0u8, |acc, &b| acc.wrapping_add(b));

        let response = link.transfer(&packet)?;
        expect_reply(&response, commands::PING, "write")?;
        if response.get(1) != Some(&csum) {
            return Err(Error::protocol("verification checksum mismatch"));
        }
        Ok(())
    })
}

/// STC89/90 series
pub struct Stc89Protocol<T: Transport> {
    link: Link<T>,
    target: Option<Target<Stc89Option>>,
}

impl<T: Transport> Stc89Protocol<T> {
    pub fn new(mut link: Link<T>) -> Self {
        link.set_framing(Framing::STC89);
        Stc89Protocol { link, target: None }
    }

    /// Take over a session synchronized by autodetection.
    pub(crate) fn attach(&mut self, model: McuModel) -> Result<()> {
        self.link.set_parity(Parity::None)?;
        let status = self.link.rewrap_status()?;
        self.initialize(&status, model)
    }

    fn initialize(&mut self, status: &[u8], model: McuModel) -> Result<()> {
        let options = Stc89Option::new(byte_at(status, 19)?);
        let cpu_t = if options.cpu_6t() { 6.0 } else { 12.0 };
        let counter = average_counter(status, 8)?;
        let clock = self.link.config().handshake_baud as f64 * counter * cpu_t / 7.0;

        let info = McuInfo::new(model, clock, bsl_version(status, false)?, byte_at(status, 17)?);
        let target = Target::new(info, options);
        target.print();
        self.target = Some(target);
        Ok(())
    }

    fn target(&self) -> Result<&Target<Stc89Option>> {
        self.target.as_ref().ok_or_else(not_connected)
    }
}

impl<T: Transport> Protocol for Stc89Protocol<T> {
    fn family(&self) -> Family {
        Family::Stc89
    }

    fn connect(&mut self, reset: &ResetStrategy) -> Result<()> {
        self.link.open(Parity::None)?;
        self.link.reset(reset)?;
        let status = self
            .link
            .synchronize(StatusPolicy::Expect(commands::STATUS_89), MIN_STATUS_LEN)?;
        let model = self.link.resolve_model(&status)?;
        self.initialize(&status, model)
    }

    fn handshake(&mut self) -> Result<()> {
        let target = self.target()?;
        let (clock, magic) = (target.info.clock_hz, target.info.magic);
        let cpu_6t = target.options.cpu_6t();
        let baud = self.link.config().transfer_baud;
        let setting = brt_89(clock, baud, cpu_6t)?;
        let [brt_hi, brt_lo] = setting.brt.to_be_bytes();

        log::info!("Switching to {} baud", baud);
        let packet = [
            commands::HANDSHAKE_CHECK,
            brt_hi,
            brt_lo,
            0xff - brt_hi,
            setting.brt_csum,
            setting.delay,
            setting.iap_wait,
        ];
        self.link.write_packet(&packet)?;
        self.link.delay(Duration::from_millis(100));
        self.link.use_transfer_baud()?;
        let response = self.link.read_packet()?;
        self.link.use_handshake_baud()?;
        expect_reply(&response, commands::HANDSHAKE_CHECK, "handshake")?;

        let packet = [
            commands::HANDSHAKE_SET,
            brt_hi,
            brt_lo,
            0xff - brt_hi,
            setting.brt_csum,
            setting.delay,
        ];
        self.link.write_packet(&packet)?;
        self.link.delay(Duration::from_millis(100));
        self.link.use_transfer_baud()?;
        let response = self.link.read_packet()?;
        expect_reply(&response, commands::HANDSHAKE_SET, "handshake")?;

        for _ in 0..PING_COUNT {
            let response = self.link.transfer(&ping_packet(magic))?;
            expect_reply(&response, commands::PING, "handshake")?;
        }
        Ok(())
    }

    fn erase_flash(&mut self, erase_size: usize, _flash_size: usize) -> Result<()> {
        self.target()?;
        let blocks = u8::try_from(erase_block_count(erase_size))
            .map_err(|_| Error::protocol("erase size exceeds the flash array"))?;
        log::info!("Erasing {} blocks", blocks);
        let mut packet = vec![commands::ERASE_BLOCKS, blocks];
        packet.extend_from_slice(&[0x33; 6]);
        let response = self.link.transfer(&packet)?;
        expect_reply(&response, commands::PING, "erase")
    }

    fn program_flash(&mut self, data: &[u8], progress: &mut dyn ProgressSink) -> Result<()> {
        self.target()?;
        program_checked_blocks(&mut self.link, data, progress)
    }

    fn set_option(&mut self, name: &str, value: &str) -> Result<()> {
        let target = self.target.as_mut().ok_or_else(not_connected)?;
        target.options.set(name, value)
    }

    fn program_options(&mut self) -> Result<()> {
        let msr = self.target()?.options.msr()[0];
        log::info!("Setting options");
        let response = self
            .link
            .transfer(&[commands::OPTIONS_LEGACY, msr, 0xff, 0xff, 0xff])?;
        expect_reply(&response, commands::OPTIONS_LEGACY, "option")
    }

    fn disconnect(&mut self) -> Result<()> {
        self.link.disconnect(commands::RESET_LEGACY)
    }

    fn mcu_info(&self) -> Option<&McuInfo> {
        self.target.as_ref().map(|t| &t.info)
    }

    fn uid(&self) -> Option<&[u8]> {
        None
    }

    fn options(&self) -> Option<&dyn OptionSet> {
        self.target.as_ref().map(|t| &t.options as &dyn OptionSet)
    }
}

/// Magic bytes that follow most STC89A requests
const STC89A_KEY: [u8; 2] = [0x46, 0xb9];
const STC89A_HANDSHAKE: u8 = 0x01;
const STC89A_PING: u8 = 0x05;
const STC89A_ERASE: u8 = 0x03;
const STC89A_OPTIONS: u8 = 0x04;

/// STC89/90 parts with BSL 7.x ("STC89A"), which use 16-bit checksums and
/// their own command set.
pub struct Stc89AProtocol<T: Transport> {
    link: Link<T>,
    target: Option<Target<Stc89Option>>,
}

impl<T: Transport> Stc89AProtocol<T> {
    pub fn new(mut link: Link<T>) -> Self {
        link.set_framing(Framing::STC89A);
        Stc89AProtocol { link, target: None }
    }

    pub(crate) fn attach(&mut self, model: McuModel) -> Result<()> {
        let status = self.link.rewrap_status()?;
        expect_reply(&status, commands::STATUS, "status")?;
        self.initialize(&status, model)
    }

    fn initialize(&mut self, status: &[u8], model: McuModel) -> Result<()> {
        if status.len() < 20 {
            return Err(Error::protocol("invalid options in status packet"));
        }
        let options = Stc89Option::new(byte_at(status, 1)?);
        let clock = 12.0 * be_u16(status, 13)? as f64 * self.link.config().handshake_baud as f64;

        let info = McuInfo::new(model, clock, bsl_version(status, true)?, byte_at(status, 17)?);
        let target = Target::new(info, options);
        target.print();
        self.target = Some(target);
        self.link.set_parity(Parity::Even)
    }

    fn target(&self) -> Result<&Target<Stc89Option>> {
        self.target.as_ref().ok_or_else(not_connected)
    }

    fn keyed(command: u8) -> Vec<u8> {
        let mut packet = vec![command, 0x00, 0x00];
        packet.extend_from_slice(&STC89A_KEY);
        packet
    }
}

impl<T: Transport> Protocol for Stc89AProtocol<T> {
    fn family(&self) -> Family {
        Family::Stc89a
    }

    fn connect(&mut self, reset: &ResetStrategy) -> Result<()> {
        self.link.open(Parity::None)?;
        match reset {
            ResetStrategy::Pin(_) => self.link.cycle_dtr(Duration::from_millis(500))?,
            other => self.link.reset(other)?,
        }
        let status = self
            .link
            .synchronize(StatusPolicy::Expect(commands::STATUS), MIN_STATUS_LEN)?;
        let model = self.link.resolve_model(&status)?;
        self.initialize(&status, model)
    }

    fn handshake(&mut self) -> Result<()> {
        let clock = self.target()?.info.clock_hz;
        let baud = self.link.config().transfer_baud;
        let (brt, iap_wait) = brt_89a(clock, baud)?;
        let [brt_hi, brt_lo] = brt.to_be_bytes();

        log::info!("Switching to {} baud", baud);
        self.link
            .write_packet(&[STC89A_HANDSHAKE, brt_hi, brt_lo, iap_wait])?;
        self.link.delay(Duration::from_millis(200));
        let response = self.link.read_packet()?;
        expect_reply(&response, STC89A_HANDSHAKE, "handshake")?;
        self.link.use_transfer_baud()?;

        let response = self.link.transfer(&Self::keyed(STC89A_PING))?;
        expect_reply(&response, STC89A_PING, "handshake")
    }

    fn erase_flash(&mut self, _erase_size: usize, _flash_size: usize) -> Result<()> {
        self.target()?;
        log::info!("Erasing flash");
        let response = self.link.transfer(&Self::keyed(STC89A_ERASE))?;
        expect_reply(&response, STC89A_ERASE, "erase")?;

        let uid = response
            .get(1..8)
            .ok_or_else(|| Error::protocol("MCU ID missing from erase reply"))?
            .to_vec();
        log::info!("MCU ID: {}", hex::encode_upper(&uid));
        if let Some(target) = self.target.as_mut() {
            target.uid = Some(uid);
        }
        Ok(())
    }

    fn program_flash(&mut self, data: &[u8], progress: &mut dyn ProgressSink) -> Result<()> {
        self.target()?;
        let link = &mut self.link;
        for_each_block(data, BLOCK_SIZE, progress, |offset, block| {
            let mut packet = if offset == 0 {
                vec![commands::WRITE_FIRST, 0x00, 0x00]
            } else {
                let mut p = vec![commands::WRITE_NEXT];
                p.extend_from_slice(&wire_offset(offset)?);
                p
            };
            packet.extend_from_slice(&STC89A_KEY);
            packet.extend_from_slice(block);
            let response = link.transfer(&packet)?;
            expect_reply(&response, commands::WRITE_NEXT, "write")
        })
    }

    fn set_option(&mut self, name: &str, value: &str) -> Result<()> {
        let target = self.target.as_mut().ok_or_else(not_connected)?;
        target.options.set(name, value)
    }

    fn program_options(&mut self) -> Result<()> {
        let msr = self.target()?.options.msr()[0];
        log::info!("Setting options");
        let mut packet = Self::keyed(STC89A_OPTIONS);
        packet.push(msr);
        let response = self.link.transfer(&packet)?;
        expect_reply(&response, STC89A_OPTIONS, "option")?;
        log_uid(self.uid());
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        self.link.disconnect(commands::RESET)
    }

    fn mcu_info(&self) -> Option<&McuInfo> {
        self.target.as_ref().map(|t| &t.info)
    }

    fn uid(&self) -> Option<&[u8]> {
        self.target.as_ref().and_then(|t| t.uid.as_deref())
    }

    fn options(&self) -> Option<&dyn OptionSet> {
        self.target.as_ref().map(|t| &t.options as &dyn OptionSet)
    }
}
