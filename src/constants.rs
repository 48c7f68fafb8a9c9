//! Wire constants shared by every STC BSL protocol family.

/// Magic word that starts a packet
pub const PACKET_START: [u8; 2] = [0x46, 0xb9];
/// Magic byte that ends a packet
pub const PACKET_END: u8 = 0x16;
/// Direction magic of packets received from the MCU
pub const PACKET_MCU: u8 = 0x68;
/// Direction magic of packets sent by the host
pub const PACKET_HOST: u8 = 0x6a;
/// Padding byte appended after the end marker by some STC8G exchanges
pub const EPILOGUE_BYTE: u8 = 0x66;

/// Synchronization character sent until the BSL answers
pub const PULSE_SYNC: u8 = 0x7f;
/// Character pulsed while the MCU measures trim challenges
pub const PULSE_CALIBRATE: u8 = 0xfe;

/// Status packets shorter than this are treated as a failed sync.
pub const MIN_STATUS_LEN: usize = 23;
/// Same limit for the USB BSL, which sends a longer status packet.
pub const MIN_USB_STATUS_LEN: usize = 38;

/// Fixed frequency used while programming trimmed (15 series) parts
pub const PROGRAM_SPEED_HZ: u32 = 22_118_400;
/// Factory pre-calibrated RC frequency on 15 and 8 series parts
pub const REFERENCE_SPEED_HZ: u32 = 24_000_000;

/// Nonce required by BSL 7.2 and later
pub const BSL72_NONCE: [u8; 2] = [0x5a, 0xa5];
/// Marker acknowledging a write on unified-protocol families
pub const WRITE_OK: u8 = 0x54;
/// Reply byte of a locked MCU
pub const MCU_LOCKED: u8 = 0x0f;

pub const USB_VID: u16 = 0x5354;
pub const USB_PID: u16 = 0x4312;

/// Magic words shared by two models, resolved with the BSL version byte.
pub const DUPLICATED_MAGICS: [u16; 2] = [0xf294, 0xf2d4];

pub mod commands {
    //! Leading payload bytes of requests and replies.

    pub const STATUS_89: u8 = 0x00;
    pub const STATUS: u8 = 0x50;
    pub const STATUS_REACK: u8 = 0x80;

    pub const HANDSHAKE_CHECK: u8 = 0x8f;
    pub const HANDSHAKE_SET: u8 = 0x8e;
    pub const PING: u8 = 0x80;
    pub const ERASE_BLOCKS: u8 = 0x84;
    pub const OPTIONS_LEGACY: u8 = 0x8d;
    pub const RESET_LEGACY: u8 = 0x82;
    pub const FINISH_LEGACY: u8 = 0x69;
    pub const TRIM_15A: u8 = 0x65;

    pub const CALIBRATE: u8 = 0x00;
    pub const SWITCH_BAUD: u8 = 0x01;
    pub const WRITE_NEXT: u8 = 0x02;
    pub const ERASE: u8 = 0x03;
    pub const OPTIONS: u8 = 0x04;
    pub const PREPARE: u8 = 0x05;
    pub const WRITE_FINISH: u8 = 0x07;
    pub const WRITE_FIRST: u8 = 0x22;
    pub const RESET: u8 = 0xff;
}
