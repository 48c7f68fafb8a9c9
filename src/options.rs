//! Option byte (MSR) models of the STC families.
//!
//! Each family mirrors the configuration fuses reported in its status
//! packet. Values are read and changed by name and serialized back into the
//! raw MSR bytes when options are programmed.
use std::fmt;

use bitfield::bitfield;

use crate::error::{Error, Result};

/// Named view over the option bytes of one family.
pub trait OptionSet: fmt::Debug {
    /// Every option with its current value, in display order.
    fn entries(&self) -> Vec<(&'static str, String)>;

    /// Change one option. Unknown names and bad values are
    /// [`Error::InvalidOption`].
    fn set(&mut self, name: &str, value: &str) -> Result<()>;

    /// Raw MSR bytes as sent in the option packet.
    fn msr(&self) -> Vec<u8>;

    fn get(&self, name: &str) -> Option<String> {
        self.entries()
            .into_iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v)
    }

    fn print(&self) {
        log::info!("Target options:");
        for (name, value) in self.entries() {
            log::info!("  {}={}", name, value);
        }
    }
}

bitfield! {
    /// The single option byte of STC89/90 parts
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct Stc89Msr(u8);
    impl Debug;
    pub cpu_12t, set_cpu_12t: 0;
    pub no_pindetect, set_no_pindetect: 2;
    pub no_eeprom_erase, set_no_eeprom_erase: 3;
    pub clock_gain_high, set_clock_gain_high: 4;
    pub ale, set_ale: 5;
    pub xram, set_xram: 6;
    pub no_watchdog_por, set_no_watchdog_por: 7;
}

bitfield! {
    /// Watchdog control byte shared by STC12 and later
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct WatchdogReg(u8);
    impl Debug;
    pub no_por, set_no_por: 5;
    pub runs_in_idle, set_runs_in_idle: 3;
    pub u8, prescale_exp, set_prescale_exp: 2, 0;
}

bitfield! {
    /// BSL entry and erase behaviour
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct BslReg(u8);
    impl Debug;
    pub no_pindetect, set_no_pindetect: 0;
    pub no_eeprom_erase, set_no_eeprom_erase: 1;
}

bitfield! {
    /// Low voltage detection byte of STC15 and STC8
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct LvdReg(u8);
    impl Debug;
    pub no_eeprom_lvd_inhibit, set_no_eeprom_lvd_inhibit: 7;
    pub no_reset, set_no_reset: 6;
    pub u8, threshold, set_threshold: 2, 0;
}

bitfield! {
    /// Clock and reset pin configuration of STC15 and STC8
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct ClockReg(u8);
    impl Debug;
    pub internal_clock, set_internal_clock: 0;
    pub gain_high, set_gain_high: 1;
    pub rstout_high, set_rstout_high: 3;
    pub reset_pin, set_reset_pin: 4;
    pub uart_push_pull, set_uart_push_pull: 5;
    pub uart_passthrough, set_uart_passthrough: 6;
    pub por_delay_long, set_por_delay_long: 7;
}

fn invalid(name: &str, value: &str) -> Error {
    Error::InvalidOption(format!("invalid value {value:?} for option {name}"))
}

fn unknown(name: &str) -> Error {
    Error::InvalidOption(format!("unknown option {name}"))
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(invalid(name, value)),
    }
}

/// Decimal or `0x` hex number.
pub fn parse_int(name: &str, value: &str) -> Result<u32> {
    let value = value.trim();
    let parsed = match value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|_| invalid(name, value))
}

/// Two-valued option: returns true for `choices.1`.
fn parse_choice(name: &str, value: &str, choices: (&str, &str)) -> Result<bool> {
    let v = value.trim();
    if v.eq_ignore_ascii_case(choices.0) {
        Ok(false)
    } else if v.eq_ignore_ascii_case(choices.1) {
        Ok(true)
    } else {
        Err(invalid(name, value))
    }
}

fn choice(flag: bool, choices: (&'static str, &'static str)) -> String {
    if flag { choices.1 } else { choices.0 }.to_string()
}

/// Watchdog prescaler is a power of two from 2 to 256.
fn parse_prescale(name: &str, value: &str) -> Result<u8> {
    let n = parse_int(name, value)?;
    if !(2..=256).contains(&n) || !n.is_power_of_two() {
        return Err(invalid(name, value));
    }
    Ok((n.trailing_zeros() - 1) as u8)
}

fn watchdog_entries(reg: WatchdogReg, out: &mut Vec<(&'static str, String)>) {
    out.push(("watchdog_por_enabled", (!reg.no_por()).to_string()));
    out.push(("watchdog_stop_idle", (!reg.runs_in_idle()).to_string()));
    out.push(("watchdog_prescale", (2u32 << reg.prescale_exp()).to_string()));
}

/// Returns `Ok(false)` when `name` is not a watchdog option.
fn set_watchdog(reg: &mut WatchdogReg, name: &str, value: &str) -> Result<bool> {
    match name {
        "watchdog_por_enabled" => reg.set_no_por(!parse_bool(name, value)?),
        "watchdog_stop_idle" => reg.set_runs_in_idle(!parse_bool(name, value)?),
        "watchdog_prescale" => reg.set_prescale_exp(parse_prescale(name, value)?),
        _ => return Ok(false),
    }
    Ok(true)
}

fn bsl_entries(reg: BslReg, out: &mut Vec<(&'static str, String)>) {
    out.push(("eeprom_erase_enabled", (!reg.no_eeprom_erase()).to_string()));
    out.push(("bsl_pindetect_enabled", (!reg.no_pindetect()).to_string()));
}

fn set_bsl(reg: &mut BslReg, name: &str, value: &str) -> Result<bool> {
    match name {
        "eeprom_erase_enabled" => reg.set_no_eeprom_erase(!parse_bool(name, value)?),
        "bsl_pindetect_enabled" => reg.set_no_pindetect(!parse_bool(name, value)?),
        _ => return Ok(false),
    }
    Ok(true)
}

fn msr_bytes<const N: usize>(msr: &[u8]) -> Result<[u8; N]> {
    msr.get(..N)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| Error::protocol("invalid options in status packet"))
}

/// STC89/90 options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stc89Option {
    msr: Stc89Msr,
}

impl Stc89Option {
    pub fn new(msr: u8) -> Self {
        Stc89Option { msr: Stc89Msr(msr) }
    }

    pub fn cpu_6t(&self) -> bool {
        !self.msr.cpu_12t()
    }
}

impl OptionSet for Stc89Option {
    fn entries(&self) -> Vec<(&'static str, String)> {
        let m = self.msr;
        vec![
            ("cpu_6t_enabled", (!m.cpu_12t()).to_string()),
            ("bsl_pindetect_enabled", (!m.no_pindetect()).to_string()),
            ("eeprom_erase_enabled", (!m.no_eeprom_erase()).to_string()),
            ("clock_gain", choice(m.clock_gain_high(), ("low", "high"))),
            ("ale_enabled", m.ale().to_string()),
            ("xram_enabled", m.xram().to_string()),
            ("watchdog_por_enabled", (!m.no_watchdog_por()).to_string()),
        ]
    }

    fn set(&mut self, name: &str, value: &str) -> Result<()> {
        let m = &mut self.msr;
        match name {
            "cpu_6t_enabled" => m.set_cpu_12t(!parse_bool(name, value)?),
            "bsl_pindetect_enabled" => m.set_no_pindetect(!parse_bool(name, value)?),
            "eeprom_erase_enabled" => m.set_no_eeprom_erase(!parse_bool(name, value)?),
            "clock_gain" => m.set_clock_gain_high(parse_choice(name, value, ("low", "high"))?),
            "ale_enabled" => m.set_ale(parse_bool(name, value)?),
            "xram_enabled" => m.set_xram(parse_bool(name, value)?),
            "watchdog_por_enabled" => m.set_no_watchdog_por(!parse_bool(name, value)?),
            _ => return Err(unknown(name)),
        }
        Ok(())
    }

    fn msr(&self) -> Vec<u8> {
        vec![self.msr.0]
    }
}

/// STC12C5Axx / STC12C52xx options: clock, watchdog, BSL, low voltage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stc12AOption {
    msr: [u8; 4],
}

impl Stc12AOption {
    pub fn new(msr: &[u8]) -> Result<Self> {
        Ok(Stc12AOption {
            msr: msr_bytes(msr)?,
        })
    }
}

impl OptionSet for Stc12AOption {
    fn entries(&self) -> Vec<(&'static str, String)> {
        let mut out = vec![
            ("low_voltage_reset", (self.msr[3] & 0x40 == 0).to_string()),
            (
                "clock_source",
                choice(self.msr[0] & 0x02 != 0, ("internal", "external")),
            ),
        ];
        watchdog_entries(WatchdogReg(self.msr[1]), &mut out);
        bsl_entries(BslReg(self.msr[2]), &mut out);
        out
    }

    fn set(&mut self, name: &str, value: &str) -> Result<()> {
        let mut watchdog = WatchdogReg(self.msr[1]);
        let mut bsl = BslReg(self.msr[2]);
        if set_watchdog(&mut watchdog, name, value)? {
            self.msr[1] = watchdog.0;
        } else if set_bsl(&mut bsl, name, value)? {
            self.msr[2] = bsl.0;
        } else {
            match name {
                "low_voltage_reset" => {
                    let on = parse_bool(name, value)?;
                    self.msr[3] = (self.msr[3] & !0x40) | if on { 0 } else { 0x40 };
                }
                "clock_source" => {
                    let external = parse_choice(name, value, ("internal", "external"))?;
                    self.msr[0] = (self.msr[0] & !0x02) | if external { 0x02 } else { 0 };
                }
                _ => return Err(unknown(name)),
            }
        }
        Ok(())
    }

    fn msr(&self) -> Vec<u8> {
        self.msr.to_vec()
    }
}

/// STC10/11/12 options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stc12Option {
    msr: [u8; 4],
}

impl Stc12Option {
    pub fn new(msr: &[u8]) -> Result<Self> {
        Ok(Stc12Option {
            msr: msr_bytes(msr)?,
        })
    }
}

impl OptionSet for Stc12Option {
    fn entries(&self) -> Vec<(&'static str, String)> {
        let m0 = self.msr[0];
        let mut out = vec![
            ("reset_pin_enabled", (m0 & 0x01 != 0).to_string()),
            ("low_voltage_reset", (m0 & 0x40 == 0).to_string()),
            (
                "oscillator_stable_delay",
                (1u32 << (((m0 >> 4) & 0x03) + 12)).to_string(),
            ),
            ("por_reset_delay", choice(m0 & 0x04 == 0, ("short", "long"))),
            ("clock_gain", choice(self.msr[1] & 0x01 != 0, ("low", "high"))),
            (
                "clock_source",
                choice(self.msr[1] & 0x02 != 0, ("internal", "external")),
            ),
        ];
        watchdog_entries(WatchdogReg(self.msr[2]), &mut out);
        bsl_entries(BslReg(self.msr[3]), &mut out);
        out
    }

    fn set(&mut self, name: &str, value: &str) -> Result<()> {
        let mut watchdog = WatchdogReg(self.msr[2]);
        let mut bsl = BslReg(self.msr[3]);
        if set_watchdog(&mut watchdog, name, value)? {
            self.msr[2] = watchdog.0;
            return Ok(());
        }
        if set_bsl(&mut bsl, name, value)? {
            self.msr[3] = bsl.0;
            return Ok(());
        }

        let bit = |byte: u8, mask: u8, on: bool| if on { byte | mask } else { byte & !mask };
        match name {
            "reset_pin_enabled" => self.msr[0] = bit(self.msr[0], 0x01, parse_bool(name, value)?),
            "low_voltage_reset" => self.msr[0] = bit(self.msr[0], 0x40, !parse_bool(name, value)?),
            "oscillator_stable_delay" => {
                let delay = parse_int(name, value)?;
                if !(4096..=32768).contains(&delay) || !delay.is_power_of_two() {
                    return Err(invalid(name, value));
                }
                let field = (delay.trailing_zeros() - 12) as u8;
                self.msr[0] = (self.msr[0] & !0x30) | (field << 4);
            }
            "por_reset_delay" => {
                let long = parse_choice(name, value, ("short", "long"))?;
                self.msr[0] = bit(self.msr[0], 0x04, !long);
            }
            "clock_gain" => {
                let high = parse_choice(name, value, ("low", "high"))?;
                self.msr[1] = bit(self.msr[1], 0x01, high);
            }
            "clock_source" => {
                let external = parse_choice(name, value, ("internal", "external"))?;
                self.msr[1] = bit(self.msr[1], 0x02, external);
            }
            _ => return Err(unknown(name)),
        }
        Ok(())
    }

    fn msr(&self) -> Vec<u8> {
        self.msr.to_vec()
    }
}

/// STC15F10x/STC15F20x options, including the RC trim words
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stc15AOption {
    msr: [u8; 13],
}

impl Stc15AOption {
    pub fn new(msr: &[u8]) -> Result<Self> {
        Ok(Stc15AOption {
            msr: msr_bytes(msr)?,
        })
    }

    /// Store the RC trim chosen during calibration.
    pub fn set_trim(&mut self, trim: u16) {
        self.msr[3..5].copy_from_slice(&trim.to_be_bytes());
    }

    pub fn trim(&self) -> u16 {
        u16::from_be_bytes([self.msr[3], self.msr[4]])
    }
}

impl OptionSet for Stc15AOption {
    fn entries(&self) -> Vec<(&'static str, String)> {
        let lvd = LvdReg(self.msr[1]);
        let mut out = vec![("reset_pin_enabled", (self.msr[0] & 0x10 != 0).to_string())];
        watchdog_entries(WatchdogReg(self.msr[2]), &mut out);
        out.push(("low_voltage_reset", lvd.no_reset().to_string()));
        out.push(("low_voltage_threshold", lvd.threshold().to_string()));
        out.push(("eeprom_lvd_inhibit", lvd.no_eeprom_lvd_inhibit().to_string()));
        bsl_entries(BslReg(self.msr[12]), &mut out);
        out
    }

    fn set(&mut self, name: &str, value: &str) -> Result<()> {
        let mut watchdog = WatchdogReg(self.msr[2]);
        let mut bsl = BslReg(self.msr[12]);
        let mut lvd = LvdReg(self.msr[1]);
        if set_watchdog(&mut watchdog, name, value)? {
            self.msr[2] = watchdog.0;
            return Ok(());
        }
        if set_bsl(&mut bsl, name, value)? {
            self.msr[12] = bsl.0;
            return Ok(());
        }
        match name {
            "reset_pin_enabled" => {
                let on = parse_bool(name, value)?;
                self.msr[0] = if on { self.msr[0] | 0x10 } else { self.msr[0] & !0x10 };
            }
            // the 15A parts store these non-inverted
            "low_voltage_reset" => lvd.set_no_reset(parse_bool(name, value)?),
            "eeprom_lvd_inhibit" => lvd.set_no_eeprom_lvd_inhibit(parse_bool(name, value)?),
            "low_voltage_threshold" => {
                let level = parse_int(name, value)?;
                if level > 7 {
                    return Err(invalid(name, value));
                }
                lvd.set_threshold(level as u8);
            }
            _ => return Err(unknown(name)),
        }
        self.msr[1] = lvd.0;
        Ok(())
    }

    fn msr(&self) -> Vec<u8> {
        self.msr.to_vec()
    }
}

const CORE_VOLTAGES: [(u8, &str); 3] = [(0xea, "low"), (0xf7, "mid"), (0xfd, "high")];

/// Later STC15 options, with an optional core voltage byte
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stc15Option {
    watchdog: WatchdogReg,
    lvd: LvdReg,
    clock: ClockReg,
    bsl: BslReg,
    core_voltage: Option<u8>,
}

impl Stc15Option {
    pub fn new(msr: &[u8]) -> Result<Self> {
        let [watchdog, lvd, clock, bsl] = msr_bytes::<4>(msr)?;
        Ok(Stc15Option {
            watchdog: WatchdogReg(watchdog),
            lvd: LvdReg(lvd),
            clock: ClockReg(clock),
            bsl: BslReg(bsl),
            core_voltage: msr.get(4).copied(),
        })
    }

    pub fn external_clock(&self) -> bool {
        !self.clock.internal_clock()
    }
}

impl OptionSet for Stc15Option {
    fn entries(&self) -> Vec<(&'static str, String)> {
        let clock = self.clock;
        let mut out = vec![
            ("reset_pin_enabled", clock.reset_pin().to_string()),
            ("clock_source", choice(!clock.internal_clock(), ("internal", "external"))),
            ("clock_gain", choice(clock.gain_high(), ("low", "high"))),
        ];
        watchdog_entries(self.watchdog, &mut out);
        out.push(("low_voltage_reset", (!self.lvd.no_reset()).to_string()));
        out.push(("low_voltage_threshold", self.lvd.threshold().to_string()));
        out.push((
            "eeprom_lvd_inhibit",
            (!self.lvd.no_eeprom_lvd_inhibit()).to_string(),
        ));
        bsl_entries(self.bsl, &mut out);
        out.push(("por_reset_delay", choice(clock.por_delay_long(), ("short", "long"))));
        out.push(("rstout_por_state", choice(clock.rstout_high(), ("low", "high"))));
        out.push(("uart2_passthrough", clock.uart_passthrough().to_string()));
        out.push((
            "uart2_pin_mode",
            choice(clock.uart_push_pull(), ("normal", "push-pull")),
        ));
        if let Some(voltage) = self.core_voltage {
            let name = CORE_VOLTAGES
                .iter()
                .find(|(v, _)| *v == voltage)
                .map(|(_, n)| n.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            out.push(("cpu_core_voltage", name));
        }
        out
    }

    fn set(&mut self, name: &str, value: &str) -> Result<()> {
        if set_watchdog(&mut self.watchdog, name, value)? || set_bsl(&mut self.bsl, name, value)? {
            return Ok(());
        }
        let clock = &mut self.clock;
        match name {
            "reset_pin_enabled" => clock.set_reset_pin(parse_bool(name, value)?),
            "clock_source" => {
                clock.set_internal_clock(!parse_choice(name, value, ("internal", "external"))?)
            }
            "clock_gain" => clock.set_gain_high(parse_choice(name, value, ("low", "high"))?),
            "por_reset_delay" => {
                clock.set_por_delay_long(parse_choice(name, value, ("short", "long"))?)
            }
            "rstout_por_state" => clock.set_rstout_high(parse_choice(name, value, ("low", "high"))?),
            "uart2_passthrough" => clock.set_uart_passthrough(parse_bool(name, value)?),
            "uart2_pin_mode" => {
                clock.set_uart_push_pull(parse_choice(name, value, ("normal", "push-pull"))?)
            }
            "low_voltage_reset" => self.lvd.set_no_reset(!parse_bool(name, value)?),
            "eeprom_lvd_inhibit" => self.lvd.set_no_eeprom_lvd_inhibit(!parse_bool(name, value)?),
            "low_voltage_threshold" => {
                let level = parse_int(name, value)?;
                if level > 7 {
                    return Err(invalid(name, value));
                }
                self.lvd.set_threshold(level as u8);
            }
            "cpu_core_voltage" if self.core_voltage.is_some() => {
                let voltage = CORE_VOLTAGES
                    .iter()
                    .find(|(_, n)| n.eq_ignore_ascii_case(value.trim()))
                    .map(|(v, _)| *v)
                    .ok_or_else(|| invalid(name, value))?;
                self.core_voltage = Some(voltage);
            }
            _ => return Err(unknown(name)),
        }
        Ok(())
    }

    fn msr(&self) -> Vec<u8> {
        let mut msr = vec![self.watchdog.0, self.lvd.0, self.clock.0, self.bsl.0];
        msr.extend(self.core_voltage);
        msr
    }
}

/// Size of one program/EEPROM split unit
const SPLIT_UNIT: u32 = 256;

/// STC8 options, including the program/EEPROM split
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stc8Option {
    msr: [u8; 5],
}

impl Stc8Option {
    pub fn new(msr: &[u8]) -> Result<Self> {
        Ok(Stc8Option {
            msr: msr_bytes(msr)?,
        })
    }

    /// Code flash size in bytes; the rest of the array is EEPROM.
    pub fn eeprom_split(&self) -> u32 {
        self.msr[4] as u32 * SPLIT_UNIT
    }
}

impl OptionSet for Stc8Option {
    fn entries(&self) -> Vec<(&'static str, String)> {
        let lvd = LvdReg(self.msr[1]);
        let pins = ClockReg(self.msr[2]);
        let mut out = vec![
            ("reset_pin_enabled", (!pins.reset_pin()).to_string()),
        ];
        watchdog_entries(WatchdogReg(self.msr[3]), &mut out);
        out.push(("low_voltage_reset", (!lvd.no_reset()).to_string()));
        out.push(("low_voltage_threshold", (lvd.threshold() & 0x03).to_string()));
        bsl_entries(BslReg(self.msr[2]), &mut out);
        out.push(("por_reset_delay", choice(pins.por_delay_long(), ("short", "long"))));
        out.push(("rstout_por_state", choice(pins.rstout_high(), ("low", "high"))));
        out.push(("uart_passthrough", pins.uart_passthrough().to_string()));
        out.push((
            "uart_pin_mode",
            choice(pins.uart_push_pull(), ("normal", "push-pull")),
        ));
        out.push(("program_eeprom_split", self.eeprom_split().to_string()));
        out
    }

    fn set(&mut self, name: &str, value: &str) -> Result<()> {
        let mut watchdog = WatchdogReg(self.msr[3]);
        if set_watchdog(&mut watchdog, name, value)? {
            self.msr[3] = watchdog.0;
            return Ok(());
        }
        // BSL bits share the byte with the pin configuration
        let mut bsl = BslReg(self.msr[2]);
        if set_bsl(&mut bsl, name, value)? {
            self.msr[2] = bsl.0;
            return Ok(());
        }

        let mut pins = ClockReg(self.msr[2]);
        let mut lvd = LvdReg(self.msr[1]);
        match name {
            "reset_pin_enabled" => pins.set_reset_pin(!parse_bool(name, value)?),
            "por_reset_delay" => pins.set_por_delay_long(parse_choice(name, value, ("short", "long"))?),
            "rstout_por_state" => pins.set_rstout_high(parse_choice(name, value, ("low", "high"))?),
            "uart_passthrough" => pins.set_uart_passthrough(parse_bool(name, value)?),
            "uart_pin_mode" => {
                pins.set_uart_push_pull(parse_choice(name, value, ("normal", "push-pull"))?)
            }
            "low_voltage_reset" => lvd.set_no_reset(!parse_bool(name, value)?),
            "low_voltage_threshold" => {
                let level = parse_int(name, value)?;
                if level > 3 {
                    return Err(invalid(name, value));
                }
                lvd.set_threshold((lvd.threshold() & !0x03) | level as u8);
            }
            "program_eeprom_split" => {
                let split = parse_int(name, value)?;
                if split % SPLIT_UNIT != 0 || split / SPLIT_UNIT > 0xff {
                    return Err(invalid(name, value));
                }
                self.msr[4] = (split / SPLIT_UNIT) as u8;
            }
            _ => return Err(unknown(name)),
        }
        self.msr[1] = lvd.0;
        self.msr[2] = pins.0;
        Ok(())
    }

    fn msr(&self) -> Vec<u8> {
        self.msr.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stc89_option_byte() {
        let mut opts = Stc89Option::new(0xfd);
        assert!(!opts.cpu_6t());
        assert_eq!(opts.get("cpu_6t_enabled").as_deref(), Some("false"));
        assert_eq!(opts.get("bsl_pindetect_enabled").as_deref(), Some("false"));
        assert_eq!(opts.get("clock_gain").as_deref(), Some("high"));

        opts.set("cpu_6t_enabled", "yes").unwrap();
        opts.set("clock_gain", "low").unwrap();
        assert_eq!(opts.msr(), vec![0xec]);
        assert!(opts.cpu_6t());
    }

    #[test]
    fn rejects_unknown_names_and_bad_values() {
        let mut opts = Stc89Option::new(0xff);
        assert!(matches!(opts.set("turbo", "1"), Err(Error::InvalidOption(_))));
        assert!(matches!(opts.set("ale_enabled", "maybe"), Err(Error::InvalidOption(_))));
        assert!(matches!(opts.set("clock_gain", "medium"), Err(Error::InvalidOption(_))));
        assert_eq!(opts.msr(), vec![0xff]);
    }

    #[test]
    fn watchdog_prescale_is_a_power_of_two() {
        let mut opts = Stc12Option::new(&[0xff, 0xff, 0xf8, 0xff]).unwrap();
        assert_eq!(opts.get("watchdog_prescale").as_deref(), Some("2"));
        opts.set("watchdog_prescale", "0x40").unwrap();
        assert_eq!(opts.msr()[2], 0xfd);
        assert_eq!(opts.get("watchdog_prescale").as_deref(), Some("64"));
        assert!(opts.set("watchdog_prescale", "48").is_err());
        assert!(opts.set("watchdog_prescale", "512").is_err());
    }

    #[test]
    fn stc12_options_touch_their_own_bytes() {
        let mut opts = Stc12Option::new(&[0x00, 0x00, 0x00, 0x00]).unwrap();
        opts.set("bsl_pindetect_enabled", "false").unwrap();
        opts.set("clock_source", "external").unwrap();
        opts.set("oscillator_stable_delay", "32768").unwrap();
        assert_eq!(opts.msr(), vec![0x30, 0x02, 0x00, 0x01]);
        assert!(Stc12Option::new(&[0; 3]).is_err());
    }

    #[test]
    fn stc12a_option_layout() {
        let mut opts = Stc12AOption::new(&[0x00, 0xff, 0xff, 0x40]).unwrap();
        assert_eq!(opts.get("low_voltage_reset").as_deref(), Some("false"));
        assert_eq!(opts.get("eeprom_erase_enabled").as_deref(), Some("false"));
        opts.set("low_voltage_reset", "on").unwrap();
        opts.set("watchdog_por_enabled", "1").unwrap();
        assert_eq!(opts.msr(), vec![0x00, 0xdf, 0xff, 0x00]);
    }

    #[test]
    fn stc15a_trim_is_big_endian() {
        let mut opts = Stc15AOption::new(&[0xff; 13]).unwrap();
        opts.set_trim(0x1234);
        assert_eq!(opts.trim(), 0x1234);
        assert_eq!(&opts.msr()[3..5], &[0x12, 0x34]);
        assert_eq!(opts.msr().len(), 13);
    }

    #[test]
    fn stc15_optional_core_voltage() {
        let opts = Stc15Option::new(&[0xff, 0xff, 0xfe, 0xff]).unwrap();
        assert!(opts.external_clock());
        assert_eq!(opts.get("cpu_core_voltage"), None);
        assert_eq!(opts.msr().len(), 4);

        let mut opts = Stc15Option::new(&[0xff, 0xff, 0xff, 0xff, 0xf7]).unwrap();
        assert!(!opts.external_clock());
        assert_eq!(opts.get("cpu_core_voltage").as_deref(), Some("mid"));
        opts.set("cpu_core_voltage", "high").unwrap();
        opts.set("reset_pin_enabled", "false").unwrap();
        assert_eq!(opts.msr(), vec![0xff, 0xff, 0xef, 0xff, 0xfd]);
    }

    #[test]
    fn stc8_eeprom_split() {
        let mut opts = Stc8Option::new(&[0xff, 0xff, 0xff, 0xff, 0x00]).unwrap();
        assert_eq!(opts.eeprom_split(), 0);
        opts.set("program_eeprom_split", "0x8000").unwrap();
        assert_eq!(opts.eeprom_split(), 0x8000);
        assert_eq!(opts.msr()[4], 0x80);
        assert!(opts.set("program_eeprom_split", "1000").is_err());
        assert!(opts.set("program_eeprom_split", "0x10000").is_err());
    }
}
