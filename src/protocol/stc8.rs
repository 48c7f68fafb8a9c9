//! STC8 and STC32 protocols. These speak the unified STC15 command set
//! but calibrate differently and carry a 40-byte option area.
use super::stc15::{
    TrimSetting, calibration_round, erase_unified, prepare, program_options_unified,
    program_unified, timer_reload,
};
use super::{McuInfo, Protocol, Target, bsl_version, byte_at, expect_reply, log_uid, not_connected};
use crate::calibration::{CalibrationRound, RangeChooser, TrimChallenge, TrimRange, iap_delay, select_range};
use crate::constants::{MIN_STATUS_LEN, REFERENCE_SPEED_HZ, commands};
use crate::device::{Family, McuModel};
use crate::error::{Error, Result};
use crate::options::{OptionSet, Stc8Option, parse_int};
use crate::packet::{Framing, be_u16, be_u32};
use crate::progress::ProgressSink;
use crate::transport::{Parity, Transport};

use super::link::{Link, ResetStrategy, StatusPolicy};

const MIN_STC8_STATUS_LEN: usize = 39;
const MAX_DIVIDER: u8 = 5;

/// Calibration flavour of the STC8 family.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Stc8Variant {
    /// STC8A/STC8F: four ranges, counts at half the handshake baud
    Stc8,
    /// STC8A8K64D4, STC8H and STC32
    Stc8d,
    /// STC8G and the small STC8H parts, which want padded requests
    Stc8g,
}

impl Stc8Variant {
    fn family(self) -> Family {
        match self {
            Stc8Variant::Stc8 => Family::Stc8,
            Stc8Variant::Stc8d => Family::Stc8d,
            Stc8Variant::Stc8g => Family::Stc8g,
        }
    }

    /// Measured counts per handshake period.
    fn count_period(self, handshake_baud: u32) -> f64 {
        match self {
            Stc8Variant::Stc8 => handshake_baud as f64 / 2.0,
            Stc8Variant::Stc8d | Stc8Variant::Stc8g => handshake_baud as f64,
        }
    }

    /// Challenges of the coarse round and the epilogue they are sent with.
    fn coarse_round(self) -> (Vec<TrimChallenge>, usize) {
        match self {
            Stc8Variant::Stc8 => {
                let trims = (0..=10).map(|i| 23 * i).chain([255]);
                (trims.map(|t| TrimChallenge::new(t, 0x00)).collect(), 0)
            }
            Stc8Variant::Stc8d => (
                challenges(&[
                    (0x00, 0x00),
                    (0xff, 0x00),
                    (0x00, 0x10),
                    (0xff, 0x10),
                    (0x00, 0x20),
                    (0xff, 0x20),
                    (0x00, 0x30),
                    (0xff, 0x30),
                ]),
                0,
            ),
            Stc8Variant::Stc8g => (
                challenges(&[(0x00, 0x00), (0x80, 0x00), (0x00, 0x80), (0x80, 0x80), (0xff, 0x00)]),
                12,
            ),
        }
    }

    fn range_chooser(self) -> RangeChooser {
        match self {
            Stc8Variant::Stc8 => CalibrationRound::choose_range,
            Stc8Variant::Stc8d | Stc8Variant::Stc8g => CalibrationRound::choose_range_8d,
        }
    }

    /// Challenges of the fine round around the coarse estimate.
    fn fine_round(self, estimate: TrimRange) -> (Vec<TrimChallenge>, usize) {
        match self {
            // the coarse round only probes range 0, so sweep all four
            Stc8Variant::Stc8 => {
                let challenges = (0..4u8)
                    .flat_map(|range| TrimRange { range, ..estimate }.sweep(-1..2))
                    .collect();
                (challenges, 0)
            }
            Stc8Variant::Stc8d => (estimate.sweep(-6..6).collect(), 0),
            Stc8Variant::Stc8g => (estimate.sweep(-6..6).collect(), 19),
        }
    }

    fn iap_wait(self) -> u8 {
        match self {
            Stc8Variant::Stc8 => iap_delay(REFERENCE_SPEED_HZ as f64),
            Stc8Variant::Stc8d | Stc8Variant::Stc8g => 0x98,
        }
    }

    fn supports_split(self) -> bool {
        self != Stc8Variant::Stc8
    }
}

fn challenges(pairs: &[(u8, u8)]) -> Vec<TrimChallenge> {
    pairs.iter().map(|&(trim, range)| TrimChallenge::new(trim, range)).collect()
}

fn decode_bcd(value: u8) -> u8 {
    (value >> 4) * 10 + (value & 0x0f)
}

/// Decoded STC8 status packet.
fn decode_status(status: &[u8], model: McuModel) -> Result<(McuInfo, Stc8Option)> {
    if status.len() < MIN_STC8_STATUS_LEN {
        return Err(Error::protocol("invalid status packet"));
    }
    let clock_hz = match be_u32(status, 1)? {
        0xffff_ffff => 0.0,
        hz => hz as f64,
    };
    let mut info = McuInfo::new(model, clock_hz, bsl_version(status, true)?, byte_at(status, 17)?);
    info.wakeup_freq = Some(be_u16(status, 23)?);
    info.reference_voltage = Some(be_u16(status, 35)?);
    if let Some(&[year, month, day]) = status.get(37..40) {
        info.mfg_date = Some((2000 + decode_bcd(year) as u16, decode_bcd(month), decode_bcd(day)));
    }

    let mut msr = status[9..12].to_vec();
    msr.extend_from_slice(&status[15..17]);
    Ok((info, Stc8Option::new(&msr)?))
}

/// The 40-byte STC8 option area.
fn build_options_8(msr: &[u8], trim: &TrimSetting) -> Vec<u8> {
    let mut packet = vec![0xff; 40];
    packet[3] = 0x00;
    packet[6] = 0x00;
    packet[22] = 0x00;
    packet[24..28].copy_from_slice(&trim.frequency.to_be_bytes());
    packet[28] = trim.value.trim;
    packet[29] = trim.value.range;
    packet[30] = trim.divider;
    packet[32] = msr[0];
    packet[36..40].copy_from_slice(&msr[1..5]);
    packet
}

/// Code and EEPROM sizes for a program/EEPROM split point.
fn split_memory(model: &McuModel, split: u32) -> (u32, u32) {
    if model.mcs251 {
        // STC32 maps code and EEPROM to separate segments
        let eeprom = if split == 0 && model.iap { 0x400 } else { split };
        (0x10000, eeprom)
    } else {
        let code = if split == 0 && model.iap { model.code } else { split };
        (code, model.total.saturating_sub(code))
    }
}

/// STC8 series, see [`Stc8Variant`]
pub struct Stc8Protocol<T: Transport> {
    link: Link<T>,
    variant: Stc8Variant,
    target: Option<Target<Stc8Option>>,
    trim: Option<TrimSetting>,
    split: Option<(u32, u32)>,
}

impl<T: Transport> Stc8Protocol<T> {
    const BLOCK_SIZE: usize = 64;

    pub fn new(mut link: Link<T>, variant: Stc8Variant) -> Self {
        link.set_framing(Framing::STC12);
        Stc8Protocol {
            link,
            variant,
            target: None,
            trim: None,
            split: None,
        }
    }

    pub(crate) fn attach(&mut self, model: McuModel) -> Result<()> {
        self.link.set_parity(Parity::Even)?;
        let status = self.link.rewrap_status()?;
        expect_reply(&status, commands::STATUS, "status")?;
        self.initialize(&status, model)
    }

    fn initialize(&mut self, status: &[u8], model: McuModel) -> Result<()> {
        let (info, options) = decode_status(status, model)?;
        let target = Target::new(info, options);
        target.print();
        self.target = Some(target);
        Ok(())
    }

    fn target(&self) -> Result<&Target<Stc8Option>> {
        self.target.as_ref().ok_or_else(not_connected)
    }

    fn calibrate(&mut self) -> Result<TrimSetting> {
        let clock = self.target()?.info.clock_hz;
        let config = self.link.config().clone();
        if clock == 0.0 && config.trim_hz <= 0.0 {
            return Err(Error::protocol("uncalibrated, please provide a trim value"));
        }
        let user_speed = if config.trim_hz > 0.0 { config.trim_hz } else { clock };
        let period = self.variant.count_period(config.handshake_baud);
        let target_count = (user_speed / period).round_ties_even() as u32;

        log::info!("Trimming frequency");
        let (challenges, epilogue) = self.variant.coarse_round();
        let round = calibration_round(&mut self.link, &challenges, epilogue)?;
        let (estimate, divider) =
            select_range(&round, self.variant.range_chooser(), target_count, MAX_DIVIDER)?;

        let (challenges, epilogue) = self.variant.fine_round(estimate);
        let round = calibration_round(&mut self.link, &challenges, epilogue)?;
        let (value, count) = round.choose_trim(target_count * divider as u32)?;
        let frequency = (count as f64 * period / divider as f64).round_ties_even() as u32;
        log::info!("Target frequency: {:.3} MHz", user_speed / 1e6);
        log::info!(
            "Adjusted frequency: {:.3} MHz ({:.3}%)",
            frequency as f64 / 1e6,
            frequency as f64 * 100.0 / user_speed - 100.0
        );

        log::info!("Switching to {} baud", config.transfer_baud);
        let reload = 65536.0 - REFERENCE_SPEED_HZ as f64 / (config.transfer_baud as f64 * 4.0);
        let mut packet = vec![commands::SWITCH_BAUD, 0x00, 0x00];
        packet.extend_from_slice(&timer_reload(reload.round_ties_even() as i64)?);
        packet.extend_from_slice(&[value.range, value.trim, self.variant.iap_wait()]);
        let response = self.link.transfer(&packet)?;
        expect_reply(&response, commands::SWITCH_BAUD, "handshake")?;
        self.link.use_transfer_baud()?;

        Ok(TrimSetting {
            value,
            frequency,
            divider,
        })
    }
}

impl<T: Transport> Protocol for Stc8Protocol<T> {
    fn family(&self) -> Family {
        self.variant.family()
    }

    fn connect(&mut self, reset: &ResetStrategy) -> Result<()> {
        self.link.open(Parity::Even)?;
        self.link.reset(reset)?;
        let status = self.link.synchronize(StatusPolicy::FramedReack, MIN_STATUS_LEN)?;
        let model = self.link.resolve_model(&status)?;
        self.initialize(&status, model)
    }

    fn handshake(&mut self) -> Result<()> {
        let trim = self.calibrate()?;
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
        target.options.set(name, value)?;
        if name == "program_eeprom_split" && self.variant.supports_split() {
            let split = split_memory(&target.info.model, parse_int(name, value)?);
            log::debug!("program/EEPROM split: code {:#x}, EEPROM {:#x}", split.0, split.1);
            self.split = Some(split);
        }
        Ok(())
    }

    fn program_options(&mut self) -> Result<()> {
        let target = self.target()?;
        let trim = self
            .trim
            .ok_or_else(|| Error::protocol("handshake required before programming options"))?;
        let options = build_options_8(&target.options.msr(), &trim);
        let bsl_byte = target.info.bsl_byte;
        program_options_unified(&mut self.link, bsl_byte, &options)?;
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

    fn memory_split(&self) -> Option<(u32, u32)> {
        self.split
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ModelDb;
    use crate::protocol::PortConfig;
    use crate::protocol::testutil::{mcu, status};
    use crate::transport::MockPort;

    const F: Framing = Framing::STC12;

    fn stc8_status(magic: u16, clock: u32) -> Vec<u8> {
        let mut s = status(0x50, 40, 0x72, magic);
        s[1..5].copy_from_slice(&clock.to_be_bytes());
        s[9..12].copy_from_slice(&[0xff, 0xbf, 0xf7]);
        s[15..17].copy_from_slice(&[0xfd, 0x20]);
        s[22] = 0x01;
        s[23..25].copy_from_slice(&34_500u16.to_be_bytes());
        s[35..37].copy_from_slice(&1_190u16.to_be_bytes());
        s[37..40].copy_from_slice(&[0x19, 0x12, 0x31]);
        s
    }

    fn counts(values: &[u16]) -> Vec<u8> {
        let mut r = vec![0x00, values.len() as u8];
        for v in values {
            r.extend_from_slice(&v.to_be_bytes());
        }
        r
    }

    fn model(name: &str) -> McuModel {
        ModelDb::global().unwrap().find_by_name(name).unwrap().clone()
    }

    #[test]
    fn status_decodes_extended_fields() {
        let (info, options) = decode_status(&stc8_status(0xf749, 24_000_000), model("STC8F2K64S4")).unwrap();
        assert_eq!(info.clock_hz, 24_000_000.0);
        assert_eq!(info.bsl_version, "7.2.1C");
        assert_eq!(info.wakeup_freq, Some(34_500));
        assert_eq!(info.reference_voltage, Some(1_190));
        assert_eq!(info.mfg_date, Some((2019, 12, 31)));
        assert_eq!(options.msr(), vec![0xff, 0xbf, 0xf7, 0xfd, 0x20]);

        let uncalibrated = stc8_status(0xf749, 0xffff_ffff);
        let short = &uncalibrated[..39];
        let (info, _) = decode_status(short, model("STC8F2K64S4")).unwrap();
        assert_eq!(info.clock_hz, 0.0);
        assert_eq!(info.mfg_date, None);
        assert!(decode_status(&short[..38], model("STC8F2K64S4")).is_err());
    }

    #[test]
    fn option_area_layout() {
        let trim = TrimSetting {
            value: TrimChallenge::new(0x7a, 0x01),
            frequency: 11_059_200,
            divider: 2,
        };
        let area = build_options_8(&[1, 2, 3, 4, 5], &trim);
        assert_eq!(area.len(), 40);
        assert_eq!((area[3], area[6], area[22]), (0, 0, 0));
        assert_eq!(area[24..28], 11_059_200u32.to_be_bytes());
        assert_eq!(area[28..31], [0x7a, 0x01, 2]);
        assert_eq!(area[31], 0xff);
        assert_eq!(area[32], 1);
        assert_eq!(area[36..], [2, 3, 4, 5]);
    }

    #[test]
    fn split_follows_memory_model() {
        let stc8h = model("STC8H8K64U");
        assert_eq!(split_memory(&stc8h, 0), (stc8h.code, stc8h.total - stc8h.code));
        assert_eq!(split_memory(&stc8h, 0x8000), (0x8000, stc8h.total - 0x8000));
        let stc32 = model("STC32G12K128");
        assert_eq!(split_memory(&stc32, 0), (0x10000, 0x400));
        assert_eq!(split_memory(&stc32, 0x2000), (0x10000, 0x2000));
        let small = model("STC8H1K08");
        assert_eq!(split_memory(&small, 0), (0, small.total));
    }

    #[test]
    fn coarse_rounds() {
        let (stc8, epilogue) = Stc8Variant::Stc8.coarse_round();
        assert_eq!(stc8.len(), 12);
        assert_eq!(stc8[10], TrimChallenge::new(230, 0));
        assert_eq!(stc8[11], TrimChallenge::new(255, 0));
        assert_eq!(epilogue, 0);
        assert_eq!(Stc8Variant::Stc8d.coarse_round().0.len(), 8);
        let (stc8g, epilogue) = Stc8Variant::Stc8g.coarse_round();
        assert_eq!(stc8g.len(), 5);
        assert_eq!(epilogue, 12);

        let estimate = TrimRange { trim: 100, range: 0x10 };
        let (fine, epilogue) = Stc8Variant::Stc8g.fine_round(estimate);
        assert_eq!(fine.first(), Some(&TrimChallenge::new(94, 0x10)));
        assert_eq!(fine.last(), Some(&TrimChallenge::new(105, 0x10)));
        assert_eq!(epilogue, 19);
        let (fine, _) = Stc8Variant::Stc8.fine_round(TrimRange { trim: 0, range: 0 });
        assert_eq!(fine.len(), 12);
        assert_eq!(fine[0], TrimChallenge::new(0xff, 0));
        assert_eq!(fine[11], TrimChallenge::new(1, 3));
    }

    fn session(variant: Stc8Variant, magic: u16, replies: Vec<Vec<u8>>) -> (Stc8Protocol<MockPort>, MockPort) {
        let mut script = vec![mcu(F, &stc8_status(magic, 24_000_000))];
        script.extend(replies);
        let port = MockPort::new(script);
        let config = PortConfig {
            handshake_baud: 2400,
            transfer_baud: 115_200,
            ..PortConfig::default()
        };
        let mut protocol = Stc8Protocol::new(Link::new(port.clone(), config), variant);
        protocol.connect(&ResetStrategy::Manual).unwrap();
        (protocol, port)
    }

    #[test]
    fn stc8d_session_with_split() {
        // 24 MHz at 2400 baud: target count 10000
        let coarse = counts(&[8000, 9000, 9500, 12050, 12000, 15000, 15000, 20000]);
        // trims 44..55 of range 0x10, 10004 is closest
        let fine = counts(&[
            9900, 9920, 9940, 9960, 9980, 9990, 10004, 10010, 10030, 10050, 10070, 10090,
        ]);
        let replies = vec![
            mcu(F, &coarse),
            mcu(F, &fine),
            mcu(F, &[0x01]),
            mcu(F, &[0x05]),
            mcu(F, &[0x03, 1, 2, 3, 4, 5, 6, 7]),
            mcu(F, &[0x02, 0x54]),
            mcu(F, &[0x07, 0x54]),
            mcu(F, &[0x04, 0x54]),
        ];
        let (mut protocol, port) = session(Stc8Variant::Stc8d, 0xf7e9, replies);
        assert_eq!(protocol.family(), Family::Stc8d);
        protocol.handshake().unwrap();
        protocol.erase_flash(0x8000, 0x10000).unwrap();
        protocol
            .program_flash(&[0x55; 10], &mut crate::progress::NoProgress)
            .unwrap();
        protocol.set_option("program_eeprom_split", "0x8000").unwrap();
        assert_eq!(protocol.memory_split(), Some((0x8000, 0x8000)));
        protocol.program_options().unwrap();
        protocol.disconnect().unwrap();

        let state = port.state();
        let state = state.borrow();
        let packets: Vec<Vec<u8>> = state
            .packets()
            .iter()
            .map(|p| F.extract_payload(p).unwrap())
            .collect();
        assert_eq!(packets[0][..6], [0x00, 8, 0x00, 0x00, 0xff, 0x00]);
        // (10000 - 9500) * 255 / (12050 - 9500) = 50 in range 0x10
        assert_eq!(packets[1][..4], [0x00, 12, 44, 0x10]);
        // 65536 - 24000000 / 460800 = 65483.92
        assert_eq!(packets[2], vec![0x01, 0x00, 0x00, 0xff, 0xcc, 0x10, 50, 0x98]);
        assert_eq!(state.baud_rates.last(), Some(&115_200));
        let options = &packets[7];
        assert_eq!(options[..5], [0x04, 0x00, 0x00, 0x5a, 0xa5]);
        let area = &options[5..];
        assert_eq!(area[24..28], 24_009_600u32.to_be_bytes());
        assert_eq!(area[28..31], [50, 0x10, 1]);
        assert_eq!(area[39], 0x80);
        assert_eq!(packets[8], vec![0xff]);
        assert!(state.closed);
    }

    #[test]
    fn stc8g_pads_calibration_requests() {
        let coarse = counts(&[8000, 12000, 20000, 30000, 40000]);
        let fine = counts(&[10000; 12]);
        let replies = vec![mcu(F, &coarse), mcu(F, &fine), mcu(F, &[0x01]), mcu(F, &[0x05])];
        let (mut protocol, port) = session(Stc8Variant::Stc8g, 0xf794, replies);
        protocol.handshake().unwrap();

        let state = port.state();
        let state = state.borrow();
        let packets = state.packets();
        let coarse = &packets[0];
        assert_eq!(coarse.len(), F.envelope_len() + 12 + 12);
        assert_eq!(coarse[coarse.len() - 13], 0x16);
        assert!(coarse.ends_with(&[0x66; 12]));
        assert_eq!(packets[1].len(), F.envelope_len() + 26 + 19);
        assert!(!packets[2].ends_with(&[0x66]));
    }

    #[test]
    fn stc8_sweeps_all_ranges() {
        // 24 MHz at 2400 baud counts at half rate: target 20000
        let coarse = counts(&[
            2000, 4000, 6000, 8000, 10000, 12000, 14000, 16000, 18000, 19000, 22000, 23000,
        ]);
        let fine = counts(&[
            19800, 19900, 19990, 20100, 20200, 20300, 20400, 20500, 20600, 20700, 20800, 20900,
        ]);
        let replies = vec![mcu(F, &coarse), mcu(F, &fine), mcu(F, &[0x01]), mcu(F, &[0x05])];
        let (mut protocol, port) = session(Stc8Variant::Stc8, 0xf749, replies);
        protocol.handshake().unwrap();
        assert!(protocol.set_option("program_eeprom_split", "0x8000").is_ok());
        assert_eq!(protocol.memory_split(), None);

        let packets = port.state().borrow().packets();
        let fine = F.extract_payload(&packets[1]).unwrap();
        // 207 + (20000 - 19000) * 23 / 3000 = 214.67
        assert_eq!(fine[..4], [0x00, 12, 214, 0x00]);
        assert_eq!(fine[24..26], [216, 0x03]);
        let switch = F.extract_payload(&packets[2]).unwrap();
        assert_eq!(switch[5..], [0x00, 216, 0x80]);
    }

    #[test]
    fn stc8_trims_against_the_divided_clock() {
        // 6 MHz at 2400 baud: 5000 counts, out of reach without a divider
        let coarse = counts(&[
            6000, 8000, 9000, 9500, 11000, 12000, 14000, 16000, 18000, 19000, 22000, 23000,
        ]);
        // 4990 would win against the undivided target
        let fine = counts(&[
            4990, 5100, 5200, 9000, 9500, 9990, 10100, 10200, 10300, 10400, 10500, 10600,
        ]);
        let replies = vec![
            mcu(F, &stc8_status(0xf749, 24_000_000)),
            mcu(F, &coarse),
            mcu(F, &fine),
            mcu(F, &[0x01]),
            mcu(F, &[0x05]),
        ];
        let port = MockPort::new(replies);
        let config = PortConfig {
            handshake_baud: 2400,
            transfer_baud: 115_200,
            trim_hz: 6_000_000.0,
            ..PortConfig::default()
        };
        let mut protocol = Stc8Protocol::new(Link::new(port.clone(), config), Stc8Variant::Stc8);
        protocol.connect(&ResetStrategy::Manual).unwrap();
        protocol.handshake().unwrap();

        let trim = protocol.trim.as_ref().unwrap();
        assert_eq!(trim.divider, 2);
        assert_eq!(trim.value, TrimChallenge::new(78, 0x01));
        // 9990 * 1200 / 2
        assert_eq!(trim.frequency, 5_994_000);

        let packets = port.state().borrow().packets();
        let fine = F.extract_payload(&packets[1]).unwrap();
        // 69 + (10000 - 9500) * 23 / 1500 = 76.67
        assert_eq!(fine[..4], [0x00, 12, 76, 0x00]);
        let switch = F.extract_payload(&packets[2]).unwrap();
        assert_eq!(switch[5..7], [0x01, 78]);
    }
}
