//! Baud rate register and RC oscillator trim calculations.
//!
//! Rounding follows round-half-to-even throughout, which is what the BSL
//! vendor tool does when it derives register values.
use std::ops::Range;

use crate::error::{Error, Result};
use crate::packet::be_u16;

/// IAP wait states for STC12A and later, by clock frequency.
pub fn iap_delay(clock_hz: f64) -> u8 {
    match clock_hz {
        f if f < 1e6 => 0x87,
        f if f < 2e6 => 0x86,
        f if f < 3e6 => 0x85,
        f if f < 6e6 => 0x84,
        f if f < 12e6 => 0x83,
        f if f < 20e6 => 0x82,
        f if f < 24e6 => 0x81,
        _ => 0x80,
    }
}

fn iap_delay_89(clock_hz: f64) -> u8 {
    match clock_hz {
        f if f < 5e6 => 0x83,
        f if f < 10e6 => 0x82,
        f if f < 20e6 => 0x81,
        _ => 0x80,
    }
}

fn iap_delay_89a(clock_hz: f64) -> u8 {
    match clock_hz {
        f if f < 10e6 => 0x83,
        f if f < 30e6 => 0x82,
        f if f < 50e6 => 0x81,
        _ => 0x80,
    }
}

/// Deviation of the achievable baud rate from the requested one, in percent.
pub fn baud_error_percent(requested: u32, actual: f64) -> f64 {
    (requested as f64 - actual).abs() * 100.0 / requested as f64
}

fn warn_baud_error(requested: u32, actual: f64) {
    let error = baud_error_percent(requested, actual);
    if error > 5.0 {
        log::warn!(
            "baudrate error is {:.2}%. You may need to set a slower rate.",
            error
        );
    }
}

/// UART timer settings sent during the legacy baud rate handshake.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BaudSetting {
    /// Baud rate timer reload value
    pub brt: u16,
    pub brt_csum: u8,
    pub iap_wait: u8,
    /// MCU delay after switching baud rates
    pub delay: u8,
}

fn brt_checksum(brt: i64) -> u8 {
    ((2 * (256 - brt)) & 0xff) as u8
}

/// STC89/90: 16-bit timer, 16 samples per bit in 6T mode and 32 in 12T.
pub fn brt_89(clock_hz: f64, baud: u32, cpu_6t: bool) -> Result<BaudSetting> {
    let sample_rate = if cpu_6t { 16.0 } else { 32.0 };
    let brt = 65536 - (clock_hz / (baud as f64 * sample_rate)).round_ties_even() as i64;
    if !(0..65536).contains(&brt) {
        return Err(Error::protocol("requested baudrate cannot be set"));
    }
    warn_baud_error(baud, clock_hz / (sample_rate * (65536 - brt) as f64));
    Ok(BaudSetting {
        brt: brt as u16,
        brt_csum: brt_checksum(brt),
        iap_wait: iap_delay_89(clock_hz),
        delay: 0xa0,
    })
}

/// STC89A: always 32 samples per bit. Returns the timer value and IAP wait.
pub fn brt_89a(clock_hz: f64, baud: u32) -> Result<(u16, u8)> {
    let brt = 65536 - (clock_hz / (baud as f64 * 32.0)).round_ties_even() as i64;
    if !(0..65536).contains(&brt) {
        return Err(Error::protocol("requested baudrate cannot be set"));
    }
    warn_baud_error(baud, clock_hz / (32.0 * (65536 - brt) as f64));
    Ok((brt as u16, iap_delay_89a(clock_hz)))
}

/// STC12 series: 8-bit timer with 16 samples per bit.
pub fn brt_12(clock_hz: f64, baud: u32) -> Result<BaudSetting> {
    let brt = 256 - (clock_hz / (baud as f64 * 16.0)).round_ties_even() as i64;
    if brt <= 1 || brt > 255 {
        return Err(Error::protocol("requested baudrate cannot be set"));
    }
    warn_baud_error(baud, clock_hz / (16.0 * (256 - brt) as f64));
    Ok(BaudSetting {
        brt: brt as u16,
        brt_csum: brt_checksum(brt),
        iap_wait: iap_delay(clock_hz),
        delay: 0x80,
    })
}

/// Number of 256-byte erase blocks covering `erase_size`, rounded up to
/// whole 512-byte pages.
pub fn erase_block_count(erase_size: usize) -> usize {
    erase_size.div_ceil(512) * 2
}

/// One trim candidate of a calibration round.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TrimChallenge {
    pub trim: u8,
    pub range: u8,
}

impl TrimChallenge {
    pub const fn new(trim: u8, range: u8) -> Self {
        TrimChallenge { trim, range }
    }
}

/// Coarse estimate chosen after the first calibration round.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TrimRange {
    pub trim: i64,
    pub range: u8,
}

impl TrimRange {
    /// Fine-trim challenges at `trim + offset`, wrapped into a byte.
    pub fn sweep(self, offsets: Range<i64>) -> impl Iterator<Item = TrimChallenge> {
        offsets.map(move |i| TrimChallenge::new(((self.trim + i) & 0xff) as u8, self.range))
    }
}

/// Build the payload of a calibration request.
pub fn challenge_packet(challenges: &[TrimChallenge]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(2 + 2 * challenges.len());
    packet.push(0x00);
    packet.push(challenges.len() as u8);
    for c in challenges {
        packet.push(c.trim);
        packet.push(c.range);
    }
    packet
}

/// Challenges of one calibration round together with the frequency counts
/// the MCU measured for each of them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CalibrationRound {
    pub challenges: Vec<TrimChallenge>,
    pub counts: Vec<u16>,
}

impl CalibrationRound {
    /// Pair the challenges that were sent with the counts of the reply
    /// (`00 n count0 count1 ...`).
    pub fn new(challenges: &[TrimChallenge], response: &[u8]) -> Result<Self> {
        let len = *response
            .get(1)
            .ok_or_else(|| Error::protocol("calibration reply too short"))? as usize;
        if response.len() - 2 < 2 * len {
            return Err(Error::protocol("calibration data missing"));
        }
        let counts = (0..len)
            .map(|i| be_u16(response, 2 + 2 * i))
            .collect::<Result<Vec<_>>>()?;
        if challenges.len() < len {
            return Err(Error::protocol("more calibration counts than challenges"));
        }
        Ok(CalibrationRound {
            challenges: challenges[..len].to_vec(),
            counts,
        })
    }

    /// Interpolate between any two neighbouring candidates whose counts
    /// straddle `target` (STC15/STC8).
    pub fn choose_range(&self, target: u32) -> Result<Option<TrimRange>> {
        let target = target as i64;
        for i in 0..self.counts.len().saturating_sub(1) {
            let (count_a, count_b) = (self.counts[i] as i64, self.counts[i + 1] as i64);
            let (a, b) = (self.challenges[i], self.challenges[i + 1]);
            let brackets = (count_a <= target && count_b >= target)
                || (count_b <= target && count_a >= target);
            if !brackets {
                continue;
            }
            let trim = if count_a == count_b {
                a.trim as i64
            } else {
                let m = (b.trim as f64 - a.trim as f64) / (count_b - count_a) as f64;
                let n = a.trim as f64 - m * count_a as f64;
                (m * target as f64 + n).round_ties_even() as i64
            };
            if !(0..=65536).contains(&trim) {
                return Err(Error::protocol("frequency trimming failed"));
            }
            return Ok(Some(TrimRange {
                trim,
                range: b.range,
            }));
        }
        Ok(None)
    }

    /// Like [`choose_range`](Self::choose_range), but candidates come in
    /// ascending (low, high) pairs of the same range (STC8D/STC8G). The
    /// result must leave room for the ±6 sweep of the second round.
    pub fn choose_range_8d(&self, target: u32) -> Result<Option<TrimRange>> {
        let target = target as i64;
        for i in 0..self.counts.len() / 2 {
            let (count_a, count_b) = (self.counts[2 * i] as i64, self.counts[2 * i + 1] as i64);
            let (a, b) = (self.challenges[2 * i], self.challenges[2 * i + 1]);
            if !(count_a <= target && count_b >= target) {
                continue;
            }
            let trim = if count_a == count_b {
                a.trim as i64
            } else {
                ((target - count_a) as f64 * (b.trim as f64 - a.trim as f64)
                    / (count_b - count_a) as f64
                    + a.trim as f64)
                    .round_ties_even() as i64
            };
            if !(6..=250).contains(&trim) {
                return Err(Error::protocol("frequency trimming failed"));
            }
            return Ok(Some(TrimRange {
                trim,
                range: b.range,
            }));
        }
        Ok(None)
    }

    /// Candidate whose measured count is closest to `target`; the first one
    /// wins on ties.
    pub fn choose_trim(&self, target: u32) -> Result<(TrimChallenge, u16)> {
        self.challenges
            .iter()
            .zip(&self.counts)
            .min_by_key(|(_, count)| (**count as i64 - target as i64).abs())
            .map(|(challenge, count)| (*challenge, *count))
            .ok_or_else(|| Error::protocol("frequency trimming failed"))
    }
}

/// Coarse range selection strategy of a family.
pub type RangeChooser = fn(&CalibrationRound, u32) -> Result<Option<TrimRange>>;

/// Find a bracketing range for `target`, trying clock dividers
/// `1..=max_divider` in order. Returns the range and the divider used.
pub fn select_range(
    round: &CalibrationRound,
    chooser: RangeChooser,
    target: u32,
    max_divider: u8,
) -> Result<(TrimRange, u8)> {
    for divider in 1..=max_divider {
        if let Some(range) = chooser(round, target * divider as u32)? {
            return Ok((range, divider));
        }
    }
    Err(Error::protocol("frequency trimming unsuccessful"))
}

/// Straight line through two (trim, count) samples evaluated at `target`.
pub fn interpolate_trim(a: (u16, u16), b: (u16, u16), target: f64) -> Result<i64> {
    let (trim_a, count_a) = (a.0 as f64, a.1 as f64);
    let (trim_b, count_b) = (b.0 as f64, b.1 as f64);
    if a.1 == b.1 {
        return Err(Error::protocol("frequency trimming failed"));
    }
    let m = (trim_b - trim_a) / (count_b - count_a);
    let n = trim_a - m * count_a;
    Ok((m * target + n).round_ties_even() as i64)
}
