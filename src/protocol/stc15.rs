//! STC15 protocols, plus the unified command set that STC15 shares with
//! STC8 and the USB BSL.
use std::time::Duration;

use super::stc12::{counter_clock, erase_packet, erase_uid, magic_packet, program_acked_blocks};
use super::{
    McuInfo, Protocol, Target, average_counter, bsl_version, byte_at, expect_reply,
    expect_write_ok, for_each_block, log_uid, not_connected, wire_offset,
};
use crate::calibration::{
    CalibrationRound, TrimChallenge, challenge_packet, iap_delay, interpolate_trim, select_range,
};
use crate::constants::{
    BSL72_NONCE, MCU_LOCKED, MIN_STATUS_LEN, PROGRAM_SPEED_HZ, PULSE_CALIBRATE, PULSE_SYNC,
    REFERENCE_SPEED_HZ, commands,
};
use crate::device::{Family, McuModel};
use crate::error::{Error, Result};
use crate::options::{OptionSet, Stc15AOption, Stc15Option};
use crate::packet::{Framing, be_u16, be_u32};
use crate::progress::ProgressSink;
use crate::transport::{Parity, Transport};

use super::link::{Link, ResetStrategy, StatusPolicy};

const CALIBRATION_TIMEOUT: Duration = Duration::from_secs(1);

/// RC trim programmed into the option area.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(super) struct TrimSetting {
    pub value: TrimChallenge,
    /// Resulting frequency in Hz
    pub frequency: u32,
    /// Clock divider, STC8 only
    pub divider: u8,
}

impl TrimSetting {
    /// Factory 24 MHz calibration stored in the status packet.
    pub fn factory(freq_count_24: u8) -> Self {
        TrimSetting {
            value: TrimChallenge::new(freq_count_24, 0x40),
            frequency: REFERENCE_SPEED_HZ,
            divider: 1,
        }
    }
}

/// BSL 7.2 and later want a nonce in most requests.
pub(super) fn needs_nonce(bsl_byte: u8) -> bool {
    bsl_byte >= 0x72
}

/// Timer reload value of the baud switch request.
pub(super) fn timer_reload(value: i64) -> Result<[u8; 2]> {
    u16::try_from(value)
        .map(u16::to_be_bytes)
        .map_err(|_| Error::protocol("baudrate adjustment failed"))
}

/// Clock and calibration fields of an STC15 status packet.
#[derive(Copy, Clone, Debug, PartialEq)]
pub(super) struct Stc15Status {
    pub clock_hz: f64,
    pub external_clock: bool,
    /// Factory trim for 24 MHz at range 0x40
    pub freq_count_24: u8,
    pub wakeup_freq: u16,
}

impl Stc15Status {
    pub fn decode(status: &[u8], handshake_baud: u32) -> Result<Self> {
        let external_clock = byte_at(status, 7)? & 0x01 == 0;
        let clock_hz = if external_clock {
            handshake_baud as f64 * be_u16(status, 13)? as f64
        } else {
            match be_u32(status, 8)? {
                // uncalibrated
                0xffff_ffff => 0.0,
                hz => hz as f64,
            }
        };
        Ok(Stc15Status {
            clock_hz,
            external_clock,
            freq_count_24: byte_at(status, 4)?,
            wakeup_freq: be_u16(status, 1)?,
        })
    }

    pub fn info(&self, status: &[u8], model: McuModel) -> Result<McuInfo> {
        let mut info = McuInfo::new(model, self.clock_hz, bsl_version(status, true)?, byte_at(status, 17)?);
        info.wakeup_freq = Some(self.wakeup_freq);
        Ok(info)
    }
}

/// Option bytes scattered over the STC15 status packet.
pub(super) fn stc15_options(status: &[u8]) -> Result<Stc15Option> {
    if status.len() < 14 {
        return Err(Error::protocol("invalid options in status packet"));
    }
    let mut msr = status[5..8].to_vec();
    msr.push(status[12]);
    msr.extend(status.get(37).copied());
    Stc15Option::new(&msr)
}

/// The 64-byte option area of STC15 parts.
pub(super) fn build_options_15(msr: &[u8], trim: &TrimSetting) -> Vec<u8> {
    let [f3, f2, f1, f0] = trim.frequency.to_be_bytes();
    let mut packet = vec![0xff; 23];
    packet.extend_from_slice(&[f3, 0xff, f2, 0xff, f1, 0xff, f0, 0xff]);
    packet.push(msr[3]);
    packet.extend_from_slice(&[0xff; 23]);
    packet.push(msr.get(4).copied().unwrap_or(0xff));
    packet.extend_from_slice(&[0xff; 3]);
    packet.push(trim.value.trim);
    packet.push(trim.value.range.wrapping_add(0x3f));
    packet.extend_from_slice(&msr[..3]);
    packet
}

/// Send one calibration round and collect the measured counts.
pub(super) fn calibration_round<T: Transport>(
    link: &mut Link<T>,
    challenges: &[TrimChallenge],
    epilogue_len: usize,
) -> Result<CalibrationRound> {
    link.write_packet_with_epilogue(&challenge_packet(challenges), epilogue_len)?;
    link.pulse(PULSE_CALIBRATE, Some(CALIBRATION_TIMEOUT))?;
    let response = link.read_packet()?;
    if response.len() < 2 {
        return Err(Error::protocol("incorrect magic in handshake packet"));
    }
    expect_reply(&response, commands::CALIBRATE, "handshake")?;
    CalibrationRound::new(challenges, &response)
}

/// Unlock the MCU for erasing and programming.
pub(super) fn prepare<T: Transport>(link: &mut Link<T>, bsl_byte: u8) -> Result<()> {
    let mut packet = vec![commands::PREPARE];
    if needs_nonce(bsl_byte) {
        packet.extend_from_slice(&[0x00, 0x00]);
        packet.extend_from_slice(&BSL72_NONCE);
    }
    let response = link.transfer(&packet)?;
    if response == [MCU_LOCKED] {
        return Err(Error::Locked);
    }
    expect_reply(&response, commands::PREPARE, "handshake")
}

/// Erase the flash, and the EEPROM too when `erase_size` exceeds
/// `flash_size`. Returns the UID sent with the reply.
pub(super) fn erase_unified<T: Transport>(
    link: &mut Link<T>,
    bsl_byte: u8,
    erase_size: usize,
    flash_size: usize,
) -> Result<Option<Vec<u8>>> {
    log::info!("Erasing flash");
    let with_eeprom = erase_size > flash_size;
    let mut packet = vec![commands::ERASE, with_eeprom as u8];
    if needs_nonce(bsl_byte) {
        packet.push(0x00);
        packet.extend_from_slice(&BSL72_NONCE);
    }
    let response = link.transfer(&packet)?;
    expect_reply(&response, commands::ERASE, "erase")?;
    Ok(response.get(1..8).map(<[u8]>::to_vec))
}

/// Write `data` in `block_size` blocks, finishing with a write-complete
/// request on BSL 7.2 and later.
pub(super) fn program_unified<T: Transport>(
    link: &mut Link<T>,
    bsl_byte: u8,
    block_size: usize,
    data: &[u8],
    progress: &mut dyn ProgressSink,
) -> Result<()> {
    for_each_block(data, block_size, progress, |offset, block| {
        let command = if offset == 0 {
            commands::WRITE_FIRST
        } else {
            commands::WRITE_NEXT
        };
        let mut packet = vec![command];
        packet.extend_from_slice(&wire_offset(offset)?);
        if needs_nonce(bsl_byte) {
            packet.extend_from_slice(&BSL72_NONCE);
        }
        packet.extend_from_slice(block);
        if packet.len() < block_size + 3 {
            packet.resize(block_size + 3, 0x00);
        }
        let response = link.transfer(&packet)?;
        expect_write_ok(&response, commands::WRITE_NEXT, "write")
    })?;

    if needs_nonce(bsl_byte) {
        log::info!("Finishing write");
        let mut packet = vec![commands::WRITE_FINISH, 0x00, 0x00];
        packet.extend_from_slice(&BSL72_NONCE);
        let response = link.transfer(&packet)?;
        expect_write_ok(&response, commands::WRITE_FINISH, "finish")?;
    }
    Ok(())
}

/// Send a prebuilt option area.
pub(super) fn program_options_unified<T: Transport>(
    link: &mut Link<T>,
    bsl_byte: u8,
    options: &[u8],
) -> Result<()> {
    log::info!("Setting options");
    let mut packet = vec![commands::OPTIONS, 0x00, 0x00];
    if needs_nonce(bsl_byte) {
        packet.extend_from_slice(&BSL72_NONCE);
    }
    packet.extend_from_slice(options);
    let response = link.transfer(&packet)?;
    expect_write_ok(&response, commands::OPTIONS, "option")
}

/// Coarse trim challenges of the first STC15A round, by target frequency.
fn trim_sequence_15a(frequency: f64) -> [[u8; 4]; 4] {
    let samples: [(u8, u8); 4] = match frequency {
        f if f < 7.5e6 => [(0x18, 0x00), (0x18, 0x80), (0x18, 0x80), (0x18, 0xff)],
        f if f < 10e6 => [(0x18, 0x80), (0x18, 0xff), (0x58, 0x00), (0x58, 0xff)],
        f if f < 15e6 => [(0x58, 0x00), (0x58, 0x80), (0x58, 0x80), (0x58, 0xff)],
        f if f < 21e6 => [(0x58, 0x80), (0x58, 0xff), (0x98, 0x00), (0x98, 0x80)],
        f if f < 31e6 => [(0x98, 0x00), (0x98, 0x80), (0x98, 0x80), (0x98, 0xff)],
        _ => [(0xd8, 0x00), (0xd8, 0x80), (0xd8, 0x80), (0xd8, 0xb4)],
    };
    samples.map(|(coarse, fine)| [coarse, fine, 0x02, 0x00])
}

/// `(trim, count)` pair at `offset` of a STC15A trim reply.
fn trim_pair(response: &[u8], offset: usize) -> Result<(u16, u16)> {
    Ok((be_u16(response, offset)?, be_u16(response, offset + 2)?))
}

/// Early STC15 parts (STC15F10x/STC15F20x) with two-round 16-bit trimming
pub struct Stc15AProtocol<T: Transport> {
    link: Link<T>,
    target: Option<Target<Stc15AOption>>,
    /// Factory trim data echoed back during calibration
    trim_data: Vec<u8>,
    freq_counter: f64,
}

impl<T: Transport> Stc15AProtocol<T> {
    const BLOCK_SIZE: usize = 64;
    const ERASE_COUNTDOWN: u8 = 0x5e;

    pub fn new(mut link: Link<T>) -> Self {
        link.set_framing(Framing::STC12);
        Stc15AProtocol {
            link,
            target: None,
            trim_data: Vec::new(),
            freq_counter: 0.0,
        }
    }

    pub(crate) fn attach(&mut self, model: McuModel) -> Result<()> {
        self.link.set_parity(Parity::Even)?;
        let status = self.link.rewrap_status()?;
        expect_reply(&status, commands::STATUS, "status")?;
        self.initialize(&status, model)
    }

    fn initialize(&mut self, status: &[u8], model: McuModel) -> Result<()> {
        let handshake_baud = self.link.config().handshake_baud;
        let clock = counter_clock(status, handshake_baud, 4)?;
        self.freq_counter = average_counter(status, 4)?;
        self.trim_data = status
            .get(51..58)
            .ok_or_else(|| Error::protocol("status packet too short"))?
            .to_vec();

        let info = McuInfo::new(model, clock, bsl_version(status, false)?, byte_at(status, 17)?);
        if status.len() < 37 {
            return Err(Error::protocol("invalid options in status packet"));
        }
        let target = Target::new(info, Stc15AOption::new(&status[23..36])?);
        target.print();
        self.target = Some(target);
        Ok(())
    }

    fn target(&self) -> Result<&Target<Stc15AOption>> {
        self.target.as_ref().ok_or_else(not_connected)
    }

    fn trim_round(&mut self, header: [u8; 2], challenges: &[[u8; 4]], min_len: usize) -> Result<Vec<u8>> {
        let mut packet = vec![commands::TRIM_15A];
        packet.extend_from_slice(&self.trim_data);
        packet.extend_from_slice(&[0xff, 0xff]);
        packet.extend_from_slice(&header);
        packet.extend(challenges.iter().flatten());
        self.link.write_packet(&packet)?;
        self.link.pulse(PULSE_SYNC, Some(CALIBRATION_TIMEOUT))?;
        let response = self.link.read_packet()?;
        if response.len() < min_len {
            return Err(Error::protocol("incorrect magic in handshake packet"));
        }
        expect_reply(&response, commands::TRIM_15A, "handshake")?;
        Ok(response)
    }
}

impl<T: Transport> Protocol for Stc15AProtocol<T> {
    fn family(&self) -> Family {
        Family::Stc15a
    }

    fn connect(&mut self, reset: &ResetStrategy) -> Result<()> {
        self.link.open(Parity::Even)?;
        self.link.reset(reset)?;
        let status = self.link.synchronize(StatusPolicy::FramedReack, MIN_STATUS_LEN)?;
        let model = self.link.resolve_model(&status)?;
        self.initialize(&status, model)
    }

    fn handshake(&mut self) -> Result<()> {
        let info = &self.target()?.info;
        let (clock, magic) = (info.clock_hz, info.magic);
        let config = self.link.config().clone();
        let user_speed = if config.trim_hz > 0.0 { config.trim_hz } else { clock };
        let program_speed = PROGRAM_SPEED_HZ as f64;
        let user_count = (self.freq_counter * (user_speed / clock)) as i64;
        let program_count = (self.freq_counter * (program_speed / clock)) as i64;

        log::info!("Trimming frequency");
        let response = self.link.transfer(&magic_packet(commands::STATUS, magic))?;
        expect_reply(&response, commands::HANDSHAKE_CHECK, "handshake")?;

        // round 1: four coarse challenges around the user frequency, two
        // around the programming frequency
        let mut challenges = trim_sequence_15a(user_speed).to_vec();
        challenges.push([0x98, 0x00, 0x02, 0x00]);
        challenges.push([0x98, 0x80, 0x02, 0x00]);
        let response = self.trim_round([0x06, 0x06], &challenges, 36)?;

        let program_trim = interpolate_trim(
            trim_pair(&response, 28)?,
            trim_pair(&response, 32)?,
            program_count as f64,
        )?;
        let program_trim = u16::try_from(program_trim)
            .map_err(|_| Error::protocol("frequency trimming failed"))?;

        let (a, b) = (trim_pair(&response, 12)?, trim_pair(&response, 16)?);
        let (c, d) = (trim_pair(&response, 20)?, trim_pair(&response, 24)?);
        let (lo, hi) = if (c.1 as i64) <= user_count && (d.1 as i64) >= user_count {
            (c, d)
        } else {
            (a, b)
        };
        let target_trim = interpolate_trim(lo, hi, user_count as f64)?;
        let start = (target_trim - 5).max(lo.0 as i64).min(hi.0 as i64);
        if start < 0 || start + 11 > 0xffff {
            return Err(Error::protocol("frequency trimming failed"));
        }

        // round 2: eleven fine steps
        let challenges: Vec<[u8; 4]> = (0..11)
            .map(|i| {
                let [hi, lo] = ((start + i) as u16).to_be_bytes();
                [hi, lo, 0x02, 0x00]
            })
            .collect();
        let response = self.trim_round([0x06, 0x0b], &challenges, 56)?;

        let (mut best_trim, mut best_count) = (0u16, 0xffffu16);
        for i in 0..11 {
            let (trim, count) = trim_pair(&response, 12 + 4 * i)?;
            if (count as i64 - user_count).abs() < (best_count as i64 - user_count).abs() {
                best_trim = trim;
                best_count = count;
            }
        }
        let final_freq = best_count as f64 / self.freq_counter * clock;
        log::info!("Trimmed frequency: {:.3} MHz", final_freq / 1e6);
        if let Some(target) = self.target.as_mut() {
            target.options.set_trim(best_trim);
        }

        log::info!("Switching to {} baud", config.transfer_baud);
        let mut packet = vec![commands::HANDSHAKE_SET];
        packet.extend_from_slice(&program_trim.to_be_bytes());
        packet.push((230_400 / config.transfer_baud) as u8);
        packet.extend_from_slice(&[0xa1, 0x64, 0xb8, 0x00, iap_delay(program_speed), 0x20, 0xff, 0x00]);
        self.link.write_packet(&packet)?;
        self.link.delay(Duration::from_millis(100));
        self.link.use_transfer_baud()?;
        let response = self.link.read_packet()?;
        expect_reply(&response, commands::ERASE_BLOCKS, "handshake")
    }

    fn erase_flash(&mut self, erase_size: usize, flash_size: usize) -> Result<()> {
        self.target()?;
        let packet = erase_packet(erase_size, flash_size, Self::ERASE_COUNTDOWN)?;
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
        program_acked_blocks(&mut self.link, data, Self::BLOCK_SIZE, magic, progress)
    }

    fn set_option(&mut self, name: &str, value: &str) -> Result<()> {
        let target = self.target.as_mut().ok_or_else(not_connected)?;
        target.options.set(name, value)
    }

    fn program_options(&mut self) -> Result<()> {
        let mut packet = vec![commands::OPTIONS_LEGACY];
        packet.extend(self.target()?.options.msr());
        packet.extend_from_slice(&[0xff; 6]);
        log::info!("Setting options");
        let response = self.link.transfer(&packet)?;
        expect_reply(&response, commands::STATUS, "option")?;
        log_uid(self.uid());
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

/// First calibration round of STC15: three trims in each of four ranges.
const ROUND1_15: [TrimChallenge; 12] = [
    TrimChallenge::new(0x00, 0xc0),
    TrimChallenge::new(0x80, 0xc0),
    TrimChallenge::new(0xff, 0xc0),
    TrimChallenge::new(0x00, 0x80),
    TrimChallenge::new(0x80, 0x80),
    TrimChallenge::new(0xff, 0x80),
    TrimChallenge::new(0x00, 0x40),
    TrimChallenge::new(0x80, 0x40),
    TrimChallenge::new(0xff, 0x40),
    TrimChallenge::new(0x00, 0x00),
    TrimChallenge::new(0x80, 0x00),
    TrimChallenge::new(0xc0, 0x00),
];

/// Later STC15 series (STC15W4K, IAP15 and friends)
pub struct Stc15Protocol<T: Transport> {
    link: Link<T>,
    target: Option<Target<Stc15Option>>,
    status: Option<Stc15Status>,
    trim: Option<TrimSetting>,
}

impl<T: Transport> Stc15Protocol<T> {
    const BLOCK_SIZE: usize = 64;

    pub fn new(mut link: Link<T>) -> Self {
        link.set_framing(Framing::STC12);
        Stc15Protocol {
            link,
            target: None,
            status: None,
            trim: None,
        }
    }

    pub(crate) fn attach(&mut self, model: McuModel) -> Result<()> {
        self.link.set_parity(Parity::Even)?;
        let status = self.link.rewrap_status()?;
        expect_reply(&status, commands::STATUS, "status")?;
        self.initialize(&status, model)
    }

    fn initialize(&mut self, status: &[u8], model: McuModel) -> Result<()> {
        let decoded = Stc15Status::decode(status, self.link.config().handshake_baud)?;
        let info = decoded.info(status, model)?;
        let target = Target::new(info, stc15_options(status)?);
        target.print();
        self.target = Some(target);
        self.status = Some(decoded);
        Ok(())
    }

    fn target(&self) -> Result<&Target<Stc15Option>> {
        self.target.as_ref().ok_or_else(not_connected)
    }

    fn calibrate(&mut self) -> Result<TrimSetting> {
        let info = &self.target()?.info;
        let (clock, magic) = (info.clock_hz, info.magic);
        let config = self.link.config().clone();
        if clock == 0.0 && config.trim_hz <= 0.0 {
            return Err(Error::protocol("uncalibrated, please provide a trim value"));
        }
        let user_speed = if config.trim_hz > 0.0 { config.trim_hz } else { clock };
        let program_speed = PROGRAM_SPEED_HZ as f64;
        let half_baud = config.handshake_baud as f64 / 2.0;
        let target_user = (user_speed / half_baud).round_ties_even() as u32;
        let target_prog = (program_speed / half_baud).round_ties_even() as u32;

        log::info!("Trimming frequency");
        let round = calibration_round(&mut self.link, &ROUND1_15, 0)?;
        let (user_range, _) = select_range(&round, CalibrationRound::choose_range, target_user, 1)?;
        let (prog_range, _) = select_range(&round, CalibrationRound::choose_range, target_prog, 1)?;

        let challenges: Vec<TrimChallenge> = user_range
            .sweep(-3..3)
            .chain(prog_range.sweep(-3..3))
            .collect();
        let round = calibration_round(&mut self.link, &challenges, 0)?;
        let (user_trim, user_count) = round.choose_trim(target_user)?;
        let (prog_trim, _) = round.choose_trim(target_prog)?;
        let frequency = (user_count as f64 * half_baud).round_ties_even() as u32;
        log::info!("Trimmed frequency: {:.3} MHz", frequency as f64 / 1e6);

        log::info!("Switching to {} baud", config.transfer_baud);
        let baud = config.transfer_baud as f64;
        let mut packet = vec![commands::SWITCH_BAUD, prog_trim.trim, prog_trim.range];
        // parts without a hardware UART (STC15F10x) count bit times differently
        if magic >> 8 == 0xf2 {
            packet.extend_from_slice(&timer_reload((65536.0 - program_speed / baud) as i64)?);
            packet.extend_from_slice(&timer_reload(
                (65536.0 - program_speed / 2.0 * 3.0 / baud) as i64,
            )?);
        } else {
            packet.extend_from_slice(&timer_reload((65536.0 - program_speed / (baud * 4.0)) as i64)?);
            packet.extend_from_slice(&[user_trim.range, user_trim.trim]);
        }
        packet.push(iap_delay(program_speed));
        let response = self.link.transfer(&packet)?;
        expect_reply(&response, commands::SWITCH_BAUD, "handshake")?;
        self.link.delay(Duration::from_millis(100));
        self.link.use_transfer_baud()?;

        Ok(TrimSetting {
            value: user_trim,
            frequency,
            divider: 1,
        })
    }

    fn switch_baud_external(&mut self, status: &Stc15Status) -> Result<TrimSetting> {
        let baud = self.link.config().transfer_baud;
        log::info!("Switching to {} baud", baud);
        let reload = (65536.0 - status.clock_hz / baud as f64 / 4.0) as i64;
        let mut packet = vec![commands::SWITCH_BAUD, status.freq_count_24, 0x40];
        packet.extend_from_slice(&timer_reload(reload)?);
        packet.extend_from_slice(&[0x00, 0x00, iap_delay(status.clock_hz)]);
        let response = self.link.transfer(&packet)?;
        expect_reply(&response, commands::SWITCH_BAUD, "handshake")?;
        self.link.delay(Duration::from_millis(100));
        self.link.use_transfer_baud()?;

        // switching back to the RC oscillator needs the factory values
        Ok(TrimSetting::factory(status.freq_count_24))
    }
}

impl<T: Transport> Protocol for Stc15Protocol<T> {
    fn family(&self) -> Family {
        Family::Stc15
    }

    fn connect(&mut self, reset: &ResetStrategy) -> Result<()> {
        self.link.open(Parity::Even)?;
        self.link.reset(reset)?;
        let status = self.link.synchronize(StatusPolicy::FramedReack, MIN_STATUS_LEN)?;
        let model = self.link.resolve_model(&status)?;
        self.initialize(&status, model)
    }

    fn handshake(&mut self) -> Result<()> {
        let status = self.status.ok_or_else(not_connected)?;
        let trim = if status.external_clock {
            self.switch_baud_external(&status)?
        } else {
            self.calibrate()?
        };
        self.trim = Some(trim);
        let bsl_byte = self.target()?.info.bsl_byte;
        prepare(&mut self.link, bsl_byte)
    }

    fn erase_flash(&mut self, erase_size: usize, flash_size: usize) -> Result<()> {
        let bsl_byte = self.target()?.info.bsl_byte;
        let uid = erase_unified(&mut self.link, bsl_byte, erase_size, flash_size)?;
        let target = self.target.as_mut().ok_or_else(not_connected)?;
        if uid.is_some() {
            target.uid = uid;
        }
        if target.uid.is_none() {
            return Err(Error::protocol("UID is missing"));
        }
        Ok(())
    }

    fn program_flash(&mut self, data: &[u8], progress: &mut dyn ProgressSink) -> Result<()> {
        let bsl_byte = self.target()?.info.bsl_byte;
        program_unified(&mut self.link, bsl_byte, Self::BLOCK_SIZE, data, progress)
    }

    fn set_option(&mut self, name: &str, value: &str) -> Result<()> {
        let target = self.target.as_mut().ok_or_else(not_connected)?;
        target.options.set(name, value)
    }

    fn program_options(&mut self) -> Result<()> {
        let target = self.target()?;
        let trim = self
            .trim
            .ok_or_else(|| Error::protocol("handshake required before programming options"))?;
        let options = build_options_15(&target.options.msr(), &trim);
        let bsl_byte = target.info.bsl_byte;
        program_options_unified(&mut self.link, bsl_byte, &options)?;
        log_uid(self.uid());
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
