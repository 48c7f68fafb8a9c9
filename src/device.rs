//! MCU model definitions and protocol family selection
use std::{fmt, str::FromStr, sync::OnceLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::constants::DUPLICATED_MAGICS;
use crate::error::{Error, Result};

/// Represents an STC MCU model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct McuModel {
    pub name: String,
    #[serde(deserialize_with = "parse_magic")]
    pub magic: u16,
    /// Size of the whole flash array
    #[serde(deserialize_with = "parse_size")]
    pub total: u32,
    /// Default code flash size
    #[serde(deserialize_with = "parse_size")]
    pub code: u32,
    /// Default EEPROM (data flash) size
    #[serde(default, deserialize_with = "parse_size")]
    pub eeprom: u32,
    /// IAP parts can reprogram the whole array
    #[serde(default)]
    pub iap: bool,
    /// 251 core with code at 0xff0000 and EEPROM at 0xfe0000
    #[serde(default)]
    pub mcs251: bool,
}

impl fmt::Display for McuModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(0x{:04x})", self.name, self.magic)
    }
}

impl McuModel {
    /// Placeholder for a magic that is not in the database. Programming may
    /// still work against the guessed 62 KiB layout.
    pub fn unknown(magic: u16) -> Self {
        McuModel {
            name: "UNKNOWN".to_string(),
            magic,
            total: 63488,
            code: 63488,
            eeprom: 0,
            iap: false,
            mcs251: false,
        }
    }

    pub fn print_info(&self) {
        log::info!("Target model:");
        log::info!("  Name: {}", self.name);
        log::info!("  Magic: {:04X}", self.magic);
        log::info!("  Code flash: {:.1} KB", self.code as f64 / 1024.0);
        log::info!("  EEPROM flash: {:.1} KB", self.eeprom as f64 / 1024.0);
    }
}

static MODEL_DB: OnceLock<ModelDb> = OnceLock::new();

/// Read-only table of known models.
#[derive(Debug)]
pub struct ModelDb {
    models: Vec<McuModel>,
}

impl ModelDb {
    pub fn load() -> Result<Self> {
        Self::from_yaml(include_str!("../devices/models.yaml"))
    }

    pub fn from_yaml(source: &str) -> Result<Self> {
        let models: Vec<McuModel> = serde_yaml::from_str(source)?;
        log::trace!("Loaded {} MCU models", models.len());
        Ok(ModelDb { models })
    }

    /// Process-wide database, parsed on first use.
    pub fn global() -> Result<&'static ModelDb> {
        if let Some(db) = MODEL_DB.get() {
            return Ok(db);
        }
        let db = Self::load()?;
        Ok(MODEL_DB.get_or_init(|| db))
    }

    pub fn models(&self) -> &[McuModel] {
        &self.models
    }

    pub fn find(&self, magic: u16) -> Option<&McuModel> {
        self.models.iter().find(|m| m.magic == magic)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&McuModel> {
        self.models.iter().find(|m| m.name.eq_ignore_ascii_case(name))
    }

    /// Resolve the model of a connected MCU from its magic word and the BSL
    /// version byte of its status packet.
    ///
    /// A few magics are shared by an E and a W part; the version byte tells
    /// them apart.
    pub fn resolve(&self, magic: u16, bsl_version: u8) -> McuModel {
        let mut model = match self.find(magic) {
            Some(model) => model.clone(),
            None => {
                log::warn!("Unknown model {:02X}{:02X}!", magic >> 8, magic & 0xff);
                McuModel::unknown(magic)
            }
        };

        if DUPLICATED_MAGICS.contains(&magic) {
            model.name.pop();
            model.name.push(if bsl_version < 0x70 { 'E' } else { 'W' });
        }
        model
    }
}

/// BSL protocol family.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum Family {
    /// Detect from the model name
    #[default]
    Auto,
    Stc89,
    Stc89a,
    Stc12a,
    Stc12b,
    Stc12,
    Stc15a,
    Stc15,
    Usb15,
    Stc8,
    Stc8d,
    Stc8g,
}

/// Model name patterns, matched at the start of the name in this order.
/// Several overlap, so the first match wins.
const DETECTION_TABLE: &[(Family, &str)] = &[
    (Family::Stc89, r"STC(89|90)(C|LE)\d"),
    (Family::Stc12a, r"STC12(C|LE)\d052"),
    (Family::Stc12b, r"STC12(C|LE)(52|56)"),
    (Family::Stc12, r"(STC|IAP)(10|11|12)\D"),
    (Family::Stc15a, r"(STC|IAP)15[FL][012]0\d(E|EA|)$"),
    (Family::Stc15, r"(STC|IAP|IRC)15\D"),
    (Family::Stc8g, r"STC8H1K\d\d$"),
    (Family::Stc8g, r"STC8G"),
    (Family::Stc8d, r"STC8H"),
    (Family::Stc8d, r"STC32"),
    (Family::Stc8d, r"STC8A8K\d\dD\d"),
    (Family::Stc8, r"STC8\D"),
];

fn detection_patterns() -> &'static [(Family, Regex)] {
    static PATTERNS: OnceLock<Vec<(Family, Regex)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        DETECTION_TABLE
            .iter()
            .filter_map(|&(family, pattern)| {
                Regex::new(&format!("^(?:{pattern})"))
                    .map(|re| (family, re))
                    .ok()
            })
            .collect()
    })
}

impl Family {
    pub const ALL: [Family; 12] = [
        Family::Auto,
        Family::Stc89,
        Family::Stc89a,
        Family::Stc12a,
        Family::Stc12b,
        Family::Stc12,
        Family::Stc15a,
        Family::Stc15,
        Family::Usb15,
        Family::Stc8,
        Family::Stc8d,
        Family::Stc8g,
    ];

    /// Pick the protocol family from a model name.
    pub fn autodetect(model_name: &str) -> Option<Family> {
        detection_patterns()
            .iter()
            .find(|(_, re)| re.is_match(model_name))
            .map(|(family, _)| *family)
    }

    pub const fn name(&self) -> &'static str {
        match self {
            Family::Auto => "auto",
            Family::Stc89 => "stc89",
            Family::Stc89a => "stc89a",
            Family::Stc12a => "stc12a",
            Family::Stc12b => "stc12b",
            Family::Stc12 => "stc12",
            Family::Stc15a => "stc15a",
            Family::Stc15 => "stc15",
            Family::Usb15 => "usb15",
            Family::Stc8 => "stc8",
            Family::Stc8d => "stc8d",
            Family::Stc8g => "stc8g",
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Family {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Family::ALL
            .iter()
            .find(|f| f.name().eq_ignore_ascii_case(s))
            .copied()
            .ok_or_else(|| Error::InvalidOption(format!("unknown protocol {s:?}")))
    }
}

fn parse_magic<'de, D>(deserializer: D) -> std::result::Result<u16, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = serde::Deserialize::deserialize(deserializer)?;
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(&s);
    u16::from_str_radix(digits, 16)
        .map_err(|e| serde::de::Error::custom(format!("invalid magic {s:?}: {e}")))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SizeValue {
    Bytes(u32),
    Text(String),
}

fn parse_size<'de, D>(deserializer: D) -> std::result::Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = match SizeValue::deserialize(deserializer)? {
        SizeValue::Bytes(n) => return Ok(n),
        SizeValue::Text(s) => s,
    };
    let invalid = |e: std::num::ParseIntError| {
        serde::de::Error::custom(format!("error while parsing size {s:?}: {e}"))
    };
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).map_err(invalid)
    } else if let Some(kib) = s
        .strip_suffix("KiB")
        .or_else(|| s.strip_suffix("KB"))
        .or_else(|| s.strip_suffix('K'))
    {
        kib.parse::<u32>().map(|k| k * 1024).map_err(invalid)
    } else {
        s.parse().map_err(invalid)
    }
}
