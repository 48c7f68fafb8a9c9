//! Packet framing of the STC BSL protocols.
//!
//! A serial packet looks like
//!
//! ```text
//! 46 b9 | dir | len (BE u16) | payload ... | checksum (1 or 2) | 16
//! ```
//!
//! where `dir` is 0x6a for host packets and 0x68 for MCU packets, `len`
//! counts everything but the two start bytes, and the checksum is the sum of
//! every byte from `dir` up to the end of the payload.
use scroll::{BE, Pread};

use crate::constants::{EPILOGUE_BYTE, PACKET_END, PACKET_HOST, PACKET_MCU, PACKET_START};
use crate::error::{Error, Result};
use crate::transport::Transport;

/// Checksum algorithm of a protocol family.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Checksum {
    /// 8-bit byte sum, STC89
    Sum8,
    /// 16-bit byte sum stored big-endian, STC89A, STC12 and later
    Sum16,
}

impl Checksum {
    pub const fn width(self) -> usize {
        match self {
            Checksum::Sum8 => 1,
            Checksum::Sum16 => 2,
        }
    }

    pub fn compute(self, data: &[u8]) -> u16 {
        let sum = data.iter().fold(0u32, |acc, &b| acc.wrapping_add(b as u32));
        match self {
            Checksum::Sum8 => (sum & 0xff) as u16,
            Checksum::Sum16 => (sum & 0xffff) as u16,
        }
    }

    fn append(self, buf: &mut Vec<u8>, value: u16) {
        match self {
            Checksum::Sum8 => buf.push(value as u8),
            Checksum::Sum16 => buf.extend_from_slice(&value.to_be_bytes()),
        }
    }
}

/// Framing parameters of one protocol family.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Framing {
    pub checksum: Checksum,
    /// Whether the family may pad a request with 0x66 bytes after the end
    /// marker. STC89 and STC89A never do.
    pub supports_epilogue: bool,
}

impl Framing {
    pub const STC89: Framing = Framing {
        checksum: Checksum::Sum8,
        supports_epilogue: false,
    };
    pub const STC89A: Framing = Framing {
        checksum: Checksum::Sum16,
        supports_epilogue: false,
    };
    pub const STC12: Framing = Framing {
        checksum: Checksum::Sum16,
        supports_epilogue: true,
    };

    /// Number of bytes surrounding the payload.
    pub const fn envelope_len(&self) -> usize {
        PACKET_START.len() + 1 + 2 + self.checksum.width() + 1
    }

    /// Frame a host packet.
    pub fn encode(&self, payload: &[u8]) -> Vec<u8> {
        let length = (payload.len() + self.envelope_len() - PACKET_START.len()) as u16;
        let mut packet = Vec::with_capacity(payload.len() + self.envelope_len());
        packet.extend_from_slice(&PACKET_START);
        packet.push(PACKET_HOST);
        packet.extend_from_slice(&length.to_be_bytes());
        packet.extend_from_slice(payload);
        let checksum = self.checksum.compute(&packet[2..]);
        self.checksum.append(&mut packet, checksum);
        packet.push(PACKET_END);
        packet
    }

    /// Frame a host packet followed by `epilogue_len` padding bytes.
    pub fn encode_with_epilogue(&self, payload: &[u8], epilogue_len: usize) -> Result<Vec<u8>> {
        if epilogue_len > 0 && !self.supports_epilogue {
            return Err(Error::framing("packet epilogue not supported by this protocol"));
        }
        let mut packet = self.encode(payload);
        packet.resize(packet.len() + epilogue_len, EPILOGUE_BYTE);
        Ok(packet)
    }

    /// Validate a complete packet and return its payload.
    pub fn extract_payload(&self, packet: &[u8]) -> Result<Vec<u8>> {
        let width = self.checksum.width();
        if packet.len() < self.envelope_len() {
            return Err(Error::framing("packet too short"));
        }
        if packet[..2] != PACKET_START {
            return Err(Error::framing("incorrect frame start"));
        }
        if packet[2] != PACKET_MCU && packet[2] != PACKET_HOST {
            return Err(Error::framing("incorrect packet direction magic"));
        }
        let length = be_u16(packet, 3).map_err(|_| Error::framing("truncated length"))?;
        if length as usize + PACKET_START.len() != packet.len() {
            return Err(Error::framing("frame length mismatch"));
        }

        let csum_at = packet.len() - 1 - width;
        let received = match self.checksum {
            Checksum::Sum8 => packet[csum_at] as u16,
            Checksum::Sum16 => be_u16(packet, csum_at)?,
        };
        let calculated = self.checksum.compute(&packet[2..csum_at]);
        if received != calculated {
            dump_packet(packet, true);
            return Err(Error::framing("packet checksum mismatch"));
        }
        if packet[packet.len() - 1] != PACKET_END {
            dump_packet(packet, true);
            return Err(Error::framing("incorrect frame end"));
        }

        Ok(packet[5..csum_at].to_vec())
    }

    /// Read, validate and unwrap one MCU packet.
    pub fn read_packet<T: Transport + ?Sized>(&self, transport: &mut T) -> Result<Vec<u8>> {
        let packet = read_raw(transport, self.envelope_len())?;
        let payload = self.extract_payload(&packet)?;
        dump_packet(&packet, true);
        Ok(payload)
    }

    pub fn write_packet<T: Transport + ?Sized>(&self, transport: &mut T, payload: &[u8]) -> Result<()> {
        self.write_packet_with_epilogue(transport, payload, 0)
    }

    pub fn write_packet_with_epilogue<T: Transport + ?Sized>(
        &self,
        transport: &mut T,
        payload: &[u8],
        epilogue_len: usize,
    ) -> Result<()> {
        let packet = self.encode_with_epilogue(payload, epilogue_len)?;
        dump_packet(&packet, false);
        transport.write_all(&packet)
    }
}

/// Read one packet from the wire, checking everything except the checksum,
/// whose width is not known before the family has been identified.
///
/// Some BSL versions omit the frame start on the status packet, so a lone
/// MCU direction byte is accepted and the header synthesized.
pub fn read_raw<T: Transport + ?Sized>(transport: &mut T, min_len: usize) -> Result<Vec<u8>> {
    let mut byte = [0u8; 1];
    transport.read_exact(&mut byte)?;

    let mut packet = Vec::with_capacity(64);
    if byte[0] == PACKET_MCU {
        packet.extend_from_slice(&PACKET_START);
        packet.push(PACKET_MCU);
    } else {
        packet.push(byte[0]);
        if byte[0] != PACKET_START[0] {
            dump_packet(&packet, true);
            return Err(Error::framing("incorrect frame start"));
        }
        transport.read_exact(&mut byte)?;
        packet.push(byte[0]);
        if byte[0] != PACKET_START[1] {
            dump_packet(&packet, true);
            return Err(Error::framing("incorrect frame start"));
        }
        transport.read_exact(&mut byte)?;
        packet.push(byte[0]);
        if byte[0] != PACKET_MCU {
            dump_packet(&packet, true);
            return Err(Error::framing("incorrect packet direction magic"));
        }
    }

    let mut length = [0u8; 2];
    transport.read_exact(&mut length)?;
    packet.extend_from_slice(&length);
    let length = u16::from_be_bytes(length) as usize;
    if length + PACKET_START.len() < min_len {
        dump_packet(&packet, true);
        return Err(Error::framing("frame length too short"));
    }

    let start = packet.len();
    packet.resize(start + length - 3, 0);
    transport.read_exact(&mut packet[start..])?;

    if packet[packet.len() - 1] != PACKET_END {
        dump_packet(&packet, true);
        return Err(Error::framing("incorrect frame end"));
    }
    Ok(packet)
}

pub(crate) fn dump_packet(data: &[u8], receive: bool) {
    log::debug!(
        "{} Packet data: {}",
        if receive { "<-" } else { "->" },
        hex::encode(data)
    );
}

pub(crate) fn be_u16(data: &[u8], offset: usize) -> Result<u16> {
    data.pread_with::<u16>(offset, BE)
        .map_err(|_| Error::protocol(format!("packet too short to read u16 at {offset}")))
}

pub(crate) fn be_u32(data: &[u8], offset: usize) -> Result<u32> {
    data.pread_with::<u32>(offset, BE)
        .map_err(|_| Error::protocol(format!("packet too short to read u32 at {offset}")))
}

pub mod usb {
    //! Framing of the USB BSL, which tunnels packets through vendor
    //! control transfers.
    use super::dump_packet;
    use crate::constants::PACKET_START;
    use crate::error::{Error, Result};

    /// Control transfers carry at most 8 bytes: 7 data bytes and their
    /// checksum.
    pub const CHUNK_DATA_LEN: usize = 7;

    /// Negated byte sum used by the USB BSL.
    pub fn checksum(data: &[u8]) -> u8 {
        data.iter().fold(0u8, |acc, &b| acc.wrapping_sub(b))
    }

    /// Split `data` into checksummed chunks.
    pub fn encode_chunks(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(data.len() + data.len().div_ceil(CHUNK_DATA_LEN));
        for chunk in data.chunks(CHUNK_DATA_LEN) {
            out.extend_from_slice(chunk);
            out.push(checksum(chunk));
        }
        out
    }

    /// Validate a reply read with a control IN transfer and return its payload.
    pub fn decode_reply(packet: &[u8]) -> Result<Vec<u8>> {
        if packet.len() < 5 || packet[..2] != PACKET_START {
            dump_packet(packet, true);
            return Err(Error::framing("incorrect frame start"));
        }

        // start, length byte, payload and checksum
        let data_len = packet[2] as usize;
        if data_len + 4 > packet.len() {
            dump_packet(packet, true);
            return Err(Error::framing("frame length mismatch"));
        }

        let csum = checksum(&packet[2..packet.len() - 1]);
        if csum != packet[packet.len() - 1] {
            dump_packet(packet, true);
            return Err(Error::framing("frame checksum mismatch"));
        }

        dump_packet(packet, true);
        Ok(packet[3..3 + data_len].to_vec())
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn reply(payload: &[u8]) -> Vec<u8> {
            let mut packet = vec![0x46, 0xb9, payload.len() as u8];
            packet.extend_from_slice(payload);
            packet.push(0);
            let csum = checksum(&packet[2..packet.len() - 1]);
            *packet.last_mut().unwrap() = csum;
            packet
        }

        #[test]
        fn chunks_carry_individual_checksums() {
            let data: Vec<u8> = (1..=10).collect();
            let chunks = encode_chunks(&data);
            assert_eq!(chunks.len(), 12);
            assert_eq!(&chunks[..7], &data[..7]);
            assert_eq!(chunks[7], 0u8.wrapping_sub(28));
            assert_eq!(&chunks[8..11], &data[7..]);
            assert_eq!(chunks[11], 0u8.wrapping_sub(8 + 9 + 10));
        }

        #[test]
        fn decodes_valid_reply() {
            let packet = reply(&[0x02, 0x54]);
            assert_eq!(decode_reply(&packet).unwrap(), vec![0x02, 0x54]);
        }

        #[test]
        fn rejects_corrupted_reply() {
            let mut packet = reply(&[0x03, 1, 2, 3, 4, 5, 6, 7]);
            packet[4] ^= 0x10;
            assert!(matches!(decode_reply(&packet), Err(Error::Framing(_))));

            let packet = [0x46, 0xb8, 1, 0, 0];
            assert!(matches!(decode_reply(&packet), Err(Error::Framing(_))));
        }

        #[test]
        fn rejects_overstated_length() {
            let mut packet = reply(&[0x02, 0x54]);
            packet[2] = 3;
            let last = packet.len() - 1;
            packet[last] = checksum(&packet[2..last]);
            assert!(matches!(decode_reply(&packet), Err(Error::Framing(msg)) if msg.contains("length")));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockPort;

    const FAMILIES: [Framing; 3] = [Framing::STC89, Framing::STC89A, Framing::STC12];

    /// Re-frame a host packet as if the MCU had sent it.
    fn as_mcu(framing: &Framing, payload: &[u8]) -> Vec<u8> {
        let mut packet = framing.encode(payload);
        packet[2] = PACKET_MCU;
        let width = framing.checksum.width();
        let csum_at = packet.len() - 1 - width;
        let csum = framing.checksum.compute(&packet[2..csum_at]);
        match framing.checksum {
            Checksum::Sum8 => packet[csum_at] = csum as u8,
            Checksum::Sum16 => packet[csum_at..csum_at + 2].copy_from_slice(&csum.to_be_bytes()),
        }
        packet
    }

    #[test]
    fn stc89_reset_packet_layout() {
        let packet = Framing::STC89.encode(&[0x82]);
        assert_eq!(packet, vec![0x46, 0xb9, 0x6a, 0x00, 0x06, 0x82, 0xf2, 0x16]);
    }

    #[test]
    fn stc12_reack_packet_layout() {
        let packet = Framing::STC12.encode(&[0x80]);
        assert_eq!(
            packet,
            vec![0x46, 0xb9, 0x6a, 0x00, 0x07, 0x80, 0x00, 0xf1, 0x16]
        );
    }

    #[test]
    fn payload_survives_framing() {
        for framing in FAMILIES {
            for len in [0usize, 1, 128] {
                let payload: Vec<u8> = (0..len).map(|i| (i * 7 + 3) as u8).collect();
                let packet = framing.encode(&payload);
                assert_eq!(packet.len(), payload.len() + framing.envelope_len());
                assert_eq!(framing.extract_payload(&packet).unwrap(), payload);
            }
        }
    }

    #[test]
    fn any_flipped_bit_outside_checksum_is_detected() {
        for framing in FAMILIES {
            let payload = [0x8f, 0xc0, 0xfd, 0x3f, 0x06, 0x80, 0x83];
            let packet = framing.encode(&payload);
            let csum_at = packet.len() - 1 - framing.checksum.width();
            for byte in (0..packet.len()).filter(|&i| i < csum_at || i == packet.len() - 1) {
                for bit in 0..8 {
                    let mut corrupted = packet.clone();
                    corrupted[byte] ^= 1 << bit;
                    assert!(
                        matches!(framing.extract_payload(&corrupted), Err(Error::Framing(_))),
                        "flip of bit {bit} in byte {byte} went unnoticed"
                    );
                }
            }
        }
    }

    #[test]
    fn epilogue_is_a_capability() {
        let padded = Framing::STC12
            .encode_with_epilogue(&[0x00, 0x05], 12)
            .unwrap();
        assert_eq!(padded.len(), 2 + Framing::STC12.envelope_len() + 12);
        assert!(padded.ends_with(&[0x16, 0x66, 0x66]));

        assert!(matches!(
            Framing::STC89A.encode_with_epilogue(&[0x01], 3),
            Err(Error::Framing(_))
        ));
        assert_eq!(
            Framing::STC89A.encode_with_epilogue(&[0x01], 0).unwrap(),
            Framing::STC89A.encode(&[0x01])
        );
    }

    #[test]
    fn reads_mcu_packet_from_stream() {
        let framing = Framing::STC12;
        let packet = as_mcu(&framing, &[0x50, 1, 2, 3]);
        let mut port = MockPort::new([packet]);
        port.write_all(&[0x7f]).unwrap();
        assert_eq!(framing.read_packet(&mut port).unwrap(), vec![0x50, 1, 2, 3]);
    }

    #[test]
    fn accepts_status_packet_without_frame_start() {
        let framing = Framing::STC89;
        let packet = as_mcu(&framing, &[0x00, 0xaa, 0x55]);
        let mut port = MockPort::new([packet[2..].to_vec()]);
        port.write_all(&[0x7f]).unwrap();
        assert_eq!(framing.read_packet(&mut port).unwrap(), vec![0x00, 0xaa, 0x55]);
    }

    #[test]
    fn missing_start_magic_is_a_framing_error() {
        let framing = Framing::STC12;
        let packet = as_mcu(&framing, &[0x50, 1]);
        let mut port = MockPort::new([packet[1..].to_vec()]);
        port.write_all(&[0x7f]).unwrap();
        assert!(matches!(framing.read_packet(&mut port), Err(Error::Framing(_))));
        assert!(matches!(
            framing.extract_payload(&packet[1..]),
            Err(Error::Framing(_))
        ));
    }

    #[test]
    fn truncated_length_is_a_framing_error() {
        let framing = Framing::STC12;
        // length field claims fewer bytes than the envelope itself
        let mut port = MockPort::new([vec![0x46, 0xb9, 0x68, 0x00, 0x02, 0x16]]);
        port.write_all(&[0x7f]).unwrap();
        assert!(matches!(framing.read_packet(&mut port), Err(Error::Framing(_))));

        let packet = as_mcu(&framing, &[0x50, 1, 2]);
        assert!(matches!(
            framing.extract_payload(&packet[..4]),
            Err(Error::Framing(_))
        ));
        assert!(matches!(
            framing.extract_payload(&packet[..packet.len() - 1]),
            Err(Error::Framing(_))
        ));
    }

    #[test]
    fn short_read_is_a_timeout() {
        let framing = Framing::STC89;
        let packet = as_mcu(&framing, &[0x00, 1, 2, 3, 4]);
        let mut port = MockPort::new([packet[..7].to_vec()]);
        port.write_all(&[0x7f]).unwrap();
        assert!(matches!(framing.read_packet(&mut port), Err(Error::Timeout(_))));
    }
}
