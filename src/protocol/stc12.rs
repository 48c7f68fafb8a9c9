//! STC10/11/12 protocols.
use std::time::Duration;

use super::stc89::{ping_packet, program_checked_blocks};
use super::{
    McuInfo, Protocol, Target, average_counter, bsl_version, byte_at, expect_reply,
    for_each_block, log_uid, not_connected, wire_offset,
};
use crate::calibration::{BaudSetting, brt_12, erase_block_count};
use crate::constants::{MIN_STATUS_LEN, commands};
use crate::device::{Family, McuModel};
use crate::error::{Error, Result};
use crate::options::{OptionSet, Stc12AOption, Stc12Option};
use crate::packet::Framing;
use crate::progress::ProgressSink;
use crate::transport::{Parity, Transport};

use super::link::{Link, ResetStrategy, StatusPolicy};

const BLOCK_SIZE: usize = 128;
/// Last byte (exclusive) of the descending erase countdown
pub(super) const ERASE_COUNTDOWN_12: u8 = 0x0d;

/// Clock derived from the eight frequency counters of the status packet.
pub(super) fn counter_clock(status: &[u8], handshake_baud: u32, counters: usize) -> Result<f64> {
    let counter = average_counter(status, counters)?;
    Ok(handshake_baud as f64 * counter * 12.0 / 7.0)
}

fn block_pairs(size: usize, what: &str) -> Result<u8> {
    u8::try_from(erase_block_count(size))
        .map_err(|_| Error::protocol(format!("{what} size too large for block erase")))
}

/// Block erase request with a countdown tail ending above `countdown`.
pub(super) fn erase_packet(erase_size: usize, flash_size: usize, countdown: u8) -> Result<Vec<u8>> {
    let blocks = block_pairs(erase_size, "erase")?;
    let size = block_pairs(flash_size, "flash")?;
    log::info!("Erasing {} blocks", blocks);
    let mut packet = vec![commands::ERASE_BLOCKS, 0xff, 0x00, blocks, 0x00, 0x00, size];
    packet.extend_from_slice(&[0x00; 12]);
    packet.extend((countdown + 1..=0x80).rev());
    Ok(packet)
}

/// Baud check and set requests of the STC12 handshake.
fn baud_packets(setting: &BaudSetting) -> ([u8; 7], [u8; 6]) {
    let brt = setting.brt as u8;
    let check = [
        commands::HANDSHAKE_CHECK,
        0xc0,
        brt,
        0x3f,
        setting.brt_csum,
        setting.delay,
        setting.iap_wait,
    ];
    let set = [commands::HANDSHAKE_SET, 0xc0, brt, 0x3f, setting.brt_csum, setting.delay];
    (check, set)
}

/// Test the new baud rate and switch to it. Returns the reply to the
/// switch request.
fn switch_baud<T: Transport>(link: &mut Link<T>, setting: &BaudSetting) -> Result<Vec<u8>> {
    let (check, set) = baud_packets(setting);
    link.write_packet(&check)?;
    link.delay(Duration::from_millis(100));
    link.use_transfer_baud()?;
    let response = link.read_packet()?;
    link.use_handshake_baud()?;
    expect_reply(&response, commands::HANDSHAKE_CHECK, "handshake")?;

    link.write_packet(&set)?;
    link.delay(Duration::from_millis(100));
    link.use_transfer_baud()?;
    link.read_packet()
}

/// Option request of the STC12A style, with the clock repeated twice.
fn stc12a_options_packet(msr: &[u8], clock_hz: f64) -> Vec<u8> {
    let clock = (clock_hz as u32).to_be_bytes();
    let mut packet = vec![commands::OPTIONS_LEGACY, msr[0], msr[1], msr[2], 0xff, msr[3]];
    packet.extend_from_slice(&clock);
    packet.push(msr[3]);
    packet.extend_from_slice(&[0xff, msr[0], msr[1], 0xff, 0xff, 0xff, 0xff, msr[2]]);
    packet.extend_from_slice(&[0xff; 7]);
    packet.extend_from_slice(&clock);
    packet.extend_from_slice(&[0xff; 3]);
    packet
}

fn program_stc12a_options<T: Transport>(
    link: &mut Link<T>,
    msr: &[u8],
    info: &McuInfo,
) -> Result<()> {
    log::info!("Setting options");
    let response = link.transfer(&stc12a_options_packet(msr, info.clock_hz))?;
    expect_reply(&response, commands::PING, "option")?;
    if info.bsl_byte >= 0x66 {
        let response = link.transfer(&[commands::STATUS])?;
        expect_reply(&response, 0x10, "option")?;
    }
    Ok(())
}

/// Program `data` in `block_size` blocks acknowledged with `00`, then send
/// the finish request. Shared by STC12 and STC15A.
pub(super) fn program_acked_blocks<T: Transport>(
    link: &mut Link<T>,
    data: &[u8],
    block_size: usize,
    magic: u16,
    progress: &mut dyn ProgressSink,
) -> Result<()> {
    for_each_block(data, block_size, progress, |offset, block| {
        let mut packet = vec![0x00, 0x00, 0x00];
        packet.extend_from_slice(&wire_offset(offset)?);
        packet.extend_from_slice(&(block_size as u16).to_be_bytes());
        packet.extend_from_slice(block);
        packet.resize(7 + block_size, 0x00);
        let response = link.transfer(&packet)?;
        expect_reply(&response, 0x00, "write")
    })?;

    log::info!("Finishing write");
    let response = link.transfer(&magic_packet(commands::FINISH_LEGACY, magic))?;
    expect_reply(&response, commands::OPTIONS_LEGACY, "finish")
}

/// `cmd 00 00 36 01 magic` request of the STC12 and STC15A handshakes.
pub(super) fn magic_packet(command: u8, magic: u16) -> Vec<u8> {
    let mut packet = ping_packet(magic);
    packet[0] = command;
    packet
}

/// Erase reply of STC12/STC15A, which carries the UID on some BSLs.
pub(super) fn erase_uid(response: &[u8]) -> Result<Option<Vec<u8>>> {
    expect_reply(response, 0x00, "erase")?;
    Ok(response.get(1..8).map(<[u8]>::to_vec))
}

/// STC12C5Axx / STC12C52xx, which frame like STC89
pub struct Stc12AProtocol<T: Transport> {
    link: Link<T>,
    target: Option<Target<Stc12AOption>>,
}

impl<T: Transport> Stc12AProtocol<T> {
    pub fn new(mut link: Link<T>) -> Self {
        link.set_framing(Framing::STC89);
        Stc12AProtocol { link, target: None }
    }

    pub(crate) fn attach(&mut self, model: McuModel) -> Result<()> {
        self.link.set_parity(Parity::None)?;
        let status = self.link.rewrap_status()?;
        self.initialize(&status, model)
    }

    fn initialize(&mut self, status: &[u8], model: McuModel) -> Result<()> {
        let clock = counter_clock(status, self.link.config().handshake_baud, 8)?;
        let info = McuInfo::new(model, clock, bsl_version(status, false)?, byte_at(status, 17)?);
        if status.len() < 31 {
            return Err(Error::protocol("invalid options in status packet"));
        }
        let mut msr = status[23..26].to_vec();
        msr.push(status[29]);
        let target = Target::new(info, Stc12AOption::new(&msr)?);
        target.print();
        self.target = Some(target);
        Ok(())
    }

    fn target(&self) -> Result<&Target<Stc12AOption>> {
        self.target.as_ref().ok_or_else(not_connected)
    }
}

impl<T: Transport> Protocol for Stc12AProtocol<T> {
    fn family(&self) -> Family {
        Family::Stc12a
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
        let info = &self.target()?.info;
        let (clock, magic) = (info.clock_hz, info.magic);
        let baud = self.link.config().transfer_baud;
        let setting = brt_12(clock, baud)?;

        log::info!("Switching to {} baud", baud);
        let response = switch_baud(&mut self.link, &setting)?;
        expect_reply(&response, commands::HANDSHAKE_SET, "handshake")?;

        for _ in 0..4 {
            let response = self.link.transfer(&ping_packet(magic))?;
            expect_reply(&response, commands::PING, "handshake")?;
        }
        Ok(())
    }

    fn erase_flash(&mut self, erase_size: usize, flash_size: usize) -> Result<()> {
        self.target()?;
        let packet = erase_packet(erase_size, flash_size, ERASE_COUNTDOWN_12)?;
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
        let target = self.target.as_ref().ok_or_else(not_connected)?;
        program_stc12a_options(&mut self.link, &target.options.msr(), &target.info)
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

/// STC10/11/12 flavours that differ only in how options are programmed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Stc12Variant {
    Stc12,
    /// Programs options like STC12A
    Stc12b,
}

/// STC10/11/12 series with 16-bit checksums and even parity
pub struct Stc12Protocol<T: Transport> {
    link: Link<T>,
    variant: Stc12Variant,
    target: Option<Target<Stc12Option>>,
}

impl<T: Transport> Stc12Protocol<T> {
    pub fn new(mut link: Link<T>, variant: Stc12Variant) -> Self {
        link.set_framing(Framing::STC12);
        Stc12Protocol {
            link,
            variant,
            target: None,
        }
    }

    pub(crate) fn attach(&mut self, model: McuModel) -> Result<()> {
        self.link.set_parity(Parity::Even)?;
        let status = self.link.rewrap_status()?;
        self.initialize(&status, model)
    }

    fn initialize(&mut self, status: &[u8], model: McuModel) -> Result<()> {
        let clock = counter_clock(status, self.link.config().handshake_baud, 8)?;
        let info = McuInfo::new(model, clock, bsl_version(status, false)?, byte_at(status, 17)?);
        if status.len() < 29 {
            return Err(Error::protocol("invalid options in status packet"));
        }
        let mut msr = status[23..26].to_vec();
        msr.push(status[27]);
        let target = Target::new(info, Stc12Option::new(&msr)?);
        target.print();
        self.target = Some(target);
        Ok(())
    }

    fn target(&self) -> Result<&Target<Stc12Option>> {
        self.target.as_ref().ok_or_else(not_connected)
    }
}

impl<T: Transport> Protocol for Stc12Protocol<T> {
    fn family(&self) -> Family {
        match self.variant {
            Stc12Variant::Stc12 => Family::Stc12,
            Stc12Variant::Stc12b => Family::Stc12b,
        }
    }

    fn connect(&mut self, reset: &ResetStrategy) -> Result<()> {
        self.link.open(Parity::Even)?;
        self.link.reset(reset)?;
        let status = self.link.synchronize(StatusPolicy::Reack, MIN_STATUS_LEN)?;
        let model = self.link.resolve_model(&status)?;
        self.initialize(&status, model)
    }

    fn handshake(&mut self) -> Result<()> {
        let info = &self.target()?.info;
        let (clock, magic) = (info.clock_hz, info.magic);
        let baud = self.link.config().transfer_baud;
        let setting = brt_12(clock, baud)?;

        log::info!("Switching to {} baud", baud);
        let response = self.link.transfer(&magic_packet(commands::STATUS, magic))?;
        expect_reply(&response, commands::HANDSHAKE_CHECK, "handshake")?;

        let response = switch_baud(&mut self.link, &setting)?;
        expect_reply(&response, commands::ERASE_BLOCKS, "handshake")
    }

    fn erase_flash(&mut self, erase_size: usize, flash_size: usize) -> Result<()> {
        self.target()?;
        let packet = erase_packet(erase_size, flash_size, ERASE_COUNTDOWN_12)?;
        let response = self.link.transfer(&packet)?;
        if let Some(uid) = erase_uid(&response)? {
            if let Some(target) = self.target.as_mut() {
                target.uid = Some(uid);
            }
        }
        Ok(())
    }

    fn program_flash(&mut self, data: &[u8], progress: &mut dyn ProgressSink) -> Result<()> {
        let magic = self.target()?.info.magic;
        program_acked_blocks(&mut self.link, data, BLOCK_SIZE, magic, progress)
    }

    fn set_option(&mut self, name: &str, value: &str) -> Result<()> {
        let target = self.target.as_mut().ok_or_else(not_connected)?;
        target.options.set(name, value)
    }

    fn program_options(&mut self) -> Result<()> {
        let target = self.target.as_mut().ok_or_else(not_connected)?;
        let msr = target.options.msr();
        if self.variant == Stc12Variant::Stc12b {
            return program_stc12a_options(&mut self.link, &msr, &target.info);
        }

        log::info!("Setting options");
        let mut packet = vec![commands::OPTIONS_LEGACY, msr[0], msr[1], msr[2], msr[3]];
        // msr[3] is written to both known locations
        packet.extend_from_slice(&[0xff, 0xff, 0xff, 0xff, msr[3]]);
        packet.extend_from_slice(&[0xff; 7]);
        packet.extend_from_slice(&(target.info.clock_hz as u32).to_be_bytes());
        let response = self.link.transfer(&packet)?;
        expect_reply(&response, commands::STATUS, "option")?;

        if target.uid.is_none() {
            target.uid = response.get(18..25).map(<[u8]>::to_vec);
        }
        log_uid(target.uid.as_deref());
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        self.link.disconnect(commands::RESET_LEGACY)
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PortConfig;
    use crate::protocol::testutil::{mcu, set_counters, status};
    use crate::transport::MockPort;

    fn stc12_status(first: u8, len: usize, magic: u16) -> Vec<u8> {
        let mut s = status(first, len, 0x68, magic);
        // 2400 * 2688 * 12 / 7 = 11.0592 MHz
        set_counters(&mut s, 8, 2688);
        s[23..31].copy_from_slice(&[0xf7, 0xf8, 0xfe, 0x11, 0xff, 0xe3, 0x22, 0x33]);
        s
    }

    #[test]
    fn erase_packet_counts_down() {
        let packet = erase_packet(1000, 61440, ERASE_COUNTDOWN_12).unwrap();
        assert_eq!(&packet[..7], &[0x84, 0xff, 0x00, 4, 0x00, 0x00, 240]);
        assert_eq!(packet.len(), 19 + (0x80 - 0x0d));
        assert_eq!(packet[19], 0x80);
        assert_eq!(*packet.last().unwrap(), 0x0e);
        assert!(erase_packet(1000, 0x20000, ERASE_COUNTDOWN_12).is_err());
    }

    #[test]
    fn stc12a_options_repeat_clock() {
        let packet = stc12a_options_packet(&[1, 2, 3, 4], 11_059_200.5);
        assert_eq!(packet.len(), 33);
        assert_eq!(&packet[..6], &[0x8d, 1, 2, 3, 0xff, 4]);
        assert_eq!(&packet[6..10], &11_059_200u32.to_be_bytes());
        assert_eq!(&packet[10..19], &[4, 0xff, 1, 2, 0xff, 0xff, 0xff, 0xff, 3]);
        assert_eq!(&packet[26..30], &11_059_200u32.to_be_bytes());
    }

    #[test]
    fn stc12a_session() {
        let f = Framing::STC89;
        let replies = vec![
            mcu(f, &stc12_status(0x00, 31, 0xd17c)),
            mcu(f, &[0x8f]),
            mcu(f, &[0x8e]),
            mcu(f, &[0x80]),
            mcu(f, &[0x80]),
            mcu(f, &[0x80]),
            mcu(f, &[0x80]),
            mcu(f, &[0x80]),
            mcu(f, &[0x80]),
            mcu(f, &[0x10]),
        ];
        let port = MockPort::new(replies);
        let state = port.state();
        let mut protocol = Stc12AProtocol::new(Link::new(port, PortConfig::default()));
        protocol.connect(&ResetStrategy::Manual).unwrap();
        assert_eq!(protocol.mcu_info().unwrap().model.name, "STC12C5A60S2");
        assert_eq!(protocol.options().unwrap().msr(), vec![0xf7, 0xf8, 0xfe, 0x22]);

        protocol.handshake().unwrap();
        protocol.erase_flash(512, 61440).unwrap();
        protocol.program_options().unwrap();

        let state = state.borrow();
        let packets = state.packets();
        // 256 - 11059200 / (19200 * 16) = 220
        assert_eq!(
            f.extract_payload(&packets[0]).unwrap(),
            vec![0x8f, 0xc0, 220, 0x3f, 72, 0x80, 0x83]
        );
        assert_eq!(f.extract_payload(&packets[6]).unwrap()[..4], [0x84, 0xff, 0x00, 2]);
        // bsl 6.8 sends the extra 0x50 request
        assert_eq!(f.extract_payload(&packets[8]).unwrap(), vec![0x50]);
    }

    fn stc12_session(variant: Stc12Variant, option_replies: &[&[u8]]) -> (Stc12Protocol<MockPort>, MockPort) {
        let f = Framing::STC12;
        let mut replies = vec![
            mcu(f, &stc12_status(0x50, 29, 0xd17c)),
            mcu(f, &[0x8f]),
            mcu(f, &[0x8f]),
            mcu(f, &[0x84]),
            mcu(f, &[0x00]),
            mcu(f, &[0x00]),
            mcu(f, &[0x00]),
            mcu(f, &[0x8d]),
        ];
        replies.extend(option_replies.iter().map(|r| mcu(f, r)));
        let port = MockPort::new(replies);
        let mut protocol = Stc12Protocol::new(Link::new(port.clone(), PortConfig::default()), variant);
        protocol.connect(&ResetStrategy::Manual).unwrap();
        protocol.handshake().unwrap();
        protocol.erase_flash(256, 61440).unwrap();
        protocol
            .program_flash(&[0x55; 200], &mut crate::progress::NoProgress)
            .unwrap();
        protocol.program_options().unwrap();
        (protocol, port)
    }

    #[test]
    fn stc12_session_takes_uid_from_option_reply() {
        let mut reply = vec![0x50; 25];
        reply[18..25].copy_from_slice(&[9, 8, 7, 6, 5, 4, 3]);
        let (protocol, port) = stc12_session(Stc12Variant::Stc12, &[reply.as_slice()]);
        assert_eq!(protocol.uid(), Some(&[9u8, 8, 7, 6, 5, 4, 3][..]));
        assert_eq!(protocol.options().unwrap().msr(), vec![0xf7, 0xf8, 0xfe, 0xff]);

        let state = port.state();
        let state = state.borrow();
        assert_eq!(state.parities, vec![Parity::Even]);
        let packets = state.packets();
        let f = Framing::STC12;
        assert_eq!(
            f.extract_payload(&packets[0]).unwrap(),
            vec![0x50, 0x00, 0x00, 0x36, 0x01, 0xd1, 0x7c]
        );
        assert_eq!(
            f.extract_payload(&packets[6]).unwrap(),
            vec![0x69, 0x00, 0x00, 0x36, 0x01, 0xd1, 0x7c]
        );
        let options = f.extract_payload(&packets[7]).unwrap();
        assert_eq!(options.len(), 21);
        assert_eq!(&options[..10], &[0x8d, 0xf7, 0xf8, 0xfe, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff]);
    }

    #[test]
    fn stc12b_programs_options_like_stc12a() {
        let (protocol, port) = stc12_session(Stc12Variant::Stc12b, &[&[0x80][..], &[0x10][..]]);
        assert_eq!(protocol.family(), Family::Stc12b);
        let packets = port.state().borrow().packets();
        let options = Framing::STC12.extract_payload(&packets[7]).unwrap();
        assert_eq!(options.len(), 33);
        assert_eq!(Framing::STC12.extract_payload(&packets[8]).unwrap(), vec![0x50]);
    }
}
