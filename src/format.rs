//! Firmware file formats
use std::path::Path;
use std::str;

use anyhow::Result;

/// Content of unprogrammed flash, used to fill gaps between records.
const FILL: u8 = 0xff;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FirmwareFormat {
    PlainHex,
    IntelHex,
    Binary,
}

pub fn read_firmware_from_file<P: AsRef<Path>>(path: P) -> Result<Vec<u8>> {
    let p = path.as_ref();
    let raw = std::fs::read(p)?;

    let format = guess_format(p, &raw);
    log::info!("Read {} as {:?} format", p.display(), format);
    match format {
        FirmwareFormat::PlainHex => read_hex(str::from_utf8(&raw)?),
        FirmwareFormat::IntelHex => read_ihex(str::from_utf8(&raw)?),
        FirmwareFormat::Binary => Ok(raw),
    }
}

pub fn guess_format(path: &Path, raw: &[u8]) -> FirmwareFormat {
    let ext = path
        .extension()
        .map(|s| s.to_string_lossy())
        .unwrap_or_default()
        .to_lowercase();
    if ["ihex", "ihx", "ihe", "hex", "h86", "a51"].contains(&&*ext) {
        return FirmwareFormat::IntelHex;
    }

    let is_text = |extra: &[u8]| {
        raw.iter()
            .all(|&c| c.is_ascii_hexdigit() || c.is_ascii_whitespace() || extra.contains(&c))
    };
    if raw.is_empty() {
        FirmwareFormat::Binary
    } else if raw[0] == b':' && is_text(b":") {
        FirmwareFormat::IntelHex
    } else if is_text(b"") {
        FirmwareFormat::PlainHex
    } else {
        FirmwareFormat::Binary
    }
}

/// Hex digits with arbitrary whitespace in between.
pub fn read_hex(data: &str) -> Result<Vec<u8>> {
    let digits: String = data.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    Ok(hex::decode(digits)?)
}

/// Place every data record at its absolute address, starting from 0.
pub fn read_ihex(data: &str) -> Result<Vec<u8>> {
    use ihex::Record;

    let mut base_address = 0u32;
    let mut image: Vec<u8> = Vec::new();
    for record in ihex::Reader::new(data) {
        match record? {
            Record::Data { offset, value } => {
                let start = (base_address + offset as u32) as usize;
                let end = start + value.len();
                if image.len() < end {
                    image.resize(end, FILL);
                }
                image[start..end].copy_from_slice(&value);
            }
            Record::ExtendedSegmentAddress(address) => {
                base_address = (address as u32) * 16;
            }
            Record::ExtendedLinearAddress(address) => {
                base_address = (address as u32) << 16;
            }
            Record::EndOfFile
            | Record::StartSegmentAddress { .. }
            | Record::StartLinearAddress(_) => (),
        }
    }
    anyhow::ensure!(!image.is_empty(), "no data records in Intel HEX file");
    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ihex_starts_at_zero_and_fills_gaps() {
        let data = ":0200040000FA\n:020002001234B6\n:0200060056782A\n:00000001FF\n";
        let image = read_ihex(data).unwrap();
        assert_eq!(image, vec![0xff, 0xff, 0x12, 0x34, 0xff, 0xff, 0x56, 0x78]);
    }

    #[test]
    fn plain_hex_ignores_whitespace() {
        assert_eq!(read_hex("02 00\r\n30\n").unwrap(), vec![0x02, 0x00, 0x30]);
        assert!(read_hex("0").is_err());
    }

    #[test]
    fn format_is_guessed() {
        let path = Path::new("firmware");
        assert_eq!(guess_format(Path::new("a.ihx"), b"x"), FirmwareFormat::IntelHex);
        assert_eq!(guess_format(path, b":00000001FF\n"), FirmwareFormat::IntelHex);
        assert_eq!(guess_format(path, b"0200 30\n"), FirmwareFormat::PlainHex);
        assert_eq!(guess_format(path, &[0x02, 0x00, 0x30]), FirmwareFormat::Binary);
        assert_eq!(guess_format(path, b""), FirmwareFormat::Binary);
    }

    #[test]
    fn empty_ihex_is_rejected() {
        assert!(read_ihex(":00000001FF\n").is_err());
    }
}
