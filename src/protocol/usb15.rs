//! STC15 parts with a USB BSL (IAP15W4K58S4 and friends).
//!
//! Requests go out as vendor control transfers with the payload split into
//! checksummed 8-byte chunks; replies are polled with a control IN
//! transfer since the BSL cannot signal completion.
use std::time::Duration;

use super::stc15::{Stc15Status, TrimSetting, build_options_15, stc15_options};
use super::{
    McuInfo, Protocol, Target, expect_reply, expect_write_ok, for_each_block, log_uid,
    not_connected, resolve_model, wire_offset,
};
use crate::CancelToken;
use crate::constants::{BSL72_NONCE, MCU_LOCKED, MIN_USB_STATUS_LEN, commands};
use crate::device::Family;
use crate::error::{Error, Result};
use crate::options::{OptionSet, Stc15Option};
use crate::packet::usb;
use crate::progress::ProgressSink;
use crate::transport::ControlTransport;

use super::link::ResetStrategy;

/// Largest reply of the BSL
const MAX_REPLY_LEN: usize = 132;
const POLL_INTERVAL: Duration = Duration::from_millis(500);
const ERASE_TIME: Duration = Duration::from_secs(2);
const WRITE_TIME: Duration = Duration::from_millis(100);
const OPTION_TIME: Duration = Duration::from_millis(500);

/// wValue of unlocking requests, the nonce in wire order
const NONCE: u16 = u16::from_le_bytes(BSL72_NONCE);

/// Finds the BSL device. `Ok(None)` means it is not plugged in yet.
type Opener<C> = Box<dyn FnMut() -> Result<Option<C>>>;

/// USB BSL of the STC15 series
pub struct StcUsb15Protocol<C: ControlTransport> {
    opener: Opener<C>,
    device: Option<C>,
    cancel: CancelToken,
    target: Option<Target<Stc15Option>>,
    status: Option<Stc15Status>,
}

impl<C: ControlTransport> StcUsb15Protocol<C> {
    const BLOCK_SIZE: usize = 128;

    pub fn new(opener: impl FnMut() -> Result<Option<C>> + 'static) -> Self {
        StcUsb15Protocol {
            opener: Box::new(opener),
            device: None,
            cancel: CancelToken::new(),
            target: None,
            status: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn device(&mut self) -> Result<&mut C> {
        self.device.as_mut().ok_or_else(not_connected)
    }

    fn target(&self) -> Result<&Target<Stc15Option>> {
        self.target.as_ref().ok_or_else(not_connected)
    }

    fn write(&mut self, request: u8, value: u16, index: u16, data: &[u8]) -> Result<()> {
        let chunks = usb::encode_chunks(data);
        log::debug!(
            "=> bRequest={:02X} wValue={:04X} wIndex={:04X} data: {}",
            request,
            value,
            index,
            hex::encode(&chunks)
        );
        self.device()?.control_out(request, value, index, &chunks)
    }

    fn read(&mut self) -> Result<Vec<u8>> {
        let packet = self.device()?.control_in(0, 0, 0, MAX_REPLY_LEN)?;
        usb::decode_reply(&packet)
    }

    /// Request, wait `settle` for the MCU to finish, then read the reply.
    fn transfer(&mut self, request: u8, value: u16, index: u16, data: &[u8], settle: Duration) -> Result<Vec<u8>> {
        self.write(request, value, index, data)?;
        if !settle.is_zero() {
            self.device()?.delay(settle);
        }
        self.read()
    }

    /// One attempt at finding the device and reading its status packet.
    fn poll_status(&mut self) -> Result<Option<Vec<u8>>> {
        self.device = (self.opener)()?;
        if self.device.is_none() {
            return Ok(None);
        }
        let status = self.read()?;
        if status.len() < MIN_USB_STATUS_LEN {
            log::debug!("status packet too short ({} bytes)", status.len());
            return Ok(None);
        }
        Ok(Some(status))
    }

    fn wait_for_status(&mut self) -> Result<Vec<u8>> {
        log::info!("Waiting for MCU, please cycle power");
        loop {
            self.cancel.check()?;
            match self.poll_status() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) => {}
                Err(e) if e.is_retryable_during_sync() => log::trace!("usb sync: {}", e),
                #[cfg(feature = "usb")]
                Err(Error::Usb(e)) => log::trace!("usb sync: {}", e),
                Err(e) => return Err(e),
            }
            match self.device.as_mut() {
                Some(device) => device.delay(POLL_INTERVAL),
                None => std::thread::sleep(POLL_INTERVAL),
            }
        }
    }
}

impl<C: ControlTransport> Protocol for StcUsb15Protocol<C> {
    fn family(&self) -> Family {
        Family::Usb15
    }

    /// The USB BSL cannot be reset from the host; `reset` is ignored.
    fn connect(&mut self, _reset: &ResetStrategy) -> Result<()> {
        let status = self.wait_for_status()?;
        log::info!("MCU is responding");

        let model = resolve_model(&status)?;
        // there is no UART clock to measure an external oscillator against
        let decoded = Stc15Status::decode(&status, 0)?;
        let info = decoded.info(&status, model)?;
        let target = Target::new(info, stc15_options(&status)?);
        target.print();
        self.target = Some(target);
        self.status = Some(decoded);
        Ok(())
    }

    fn handshake(&mut self) -> Result<()> {
        self.target()?;
        log::info!("Initializing");
        let response = self.transfer(commands::SWITCH_BAUD, 0, 0, &[0x03], Duration::ZERO)?;
        expect_reply(&response, commands::SWITCH_BAUD, "handshake")?;

        let response = self.transfer(commands::PREPARE, NONCE, 0, &[0x00], Duration::ZERO)?;
        if response.first() == Some(&MCU_LOCKED) {
            return Err(Error::Locked);
        }
        expect_reply(&response, commands::PREPARE, "handshake")
    }

    fn erase_flash(&mut self, _erase_size: usize, _flash_size: usize) -> Result<()> {
        log::info!("Erasing flash");
        let response = self.transfer(commands::ERASE, NONCE, 0, &[0x00], ERASE_TIME)?;
        expect_reply(&response, commands::ERASE, "erase")?;
        let uid: Vec<u8> = response.iter().skip(1).take(7).copied().collect();
        let target = self.target.as_mut().ok_or_else(not_connected)?;
        if !uid.is_empty() {
            target.uid = Some(uid);
        }
        Ok(())
    }

    fn program_flash(&mut self, data: &[u8], progress: &mut dyn ProgressSink) -> Result<()> {
        for_each_block(data, Self::BLOCK_SIZE, progress, |offset, block| {
            let command = if offset == 0 {
                commands::WRITE_FIRST
            } else {
                commands::WRITE_NEXT
            };
            let mut block = block.to_vec();
            block.resize(Self::BLOCK_SIZE, 0x00);
            let index = u16::from_be_bytes(wire_offset(offset)?);
            let response = self.transfer(command, NONCE, index, &block, WRITE_TIME)?;
            expect_write_ok(&response, commands::WRITE_NEXT, "write")
        })
    }

    fn set_option(&mut self, name: &str, value: &str) -> Result<()> {
        let target = self.target.as_mut().ok_or_else(not_connected)?;
        target.options.set(name, value)
    }

    fn program_options(&mut self) -> Result<()> {
        let status = self.status.ok_or_else(not_connected)?;
        // always program the factory 24 MHz trim
        let trim = TrimSetting::factory(status.freq_count_24);
        let options = build_options_15(&self.target()?.options.msr(), &trim);

        log::info!("Setting options");
        let response = self.transfer(commands::OPTIONS, NONCE, 0, &options, OPTION_TIME)?;
        expect_write_ok(&response, commands::OPTIONS, "option")?;
        log_uid(self.uid());
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        if self.device.is_some() {
            self.write(commands::RESET, 0, 0, &[0x00])?;
            self.device = None;
            log::info!("Disconnected!");
        }
        Ok(())
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

/// Open the first USB BSL device, waiting for it to appear on `connect`.
#[cfg(feature = "usb")]
pub fn open(cancel: CancelToken) -> Result<Box<dyn Protocol>> {
    let protocol = StcUsb15Protocol::new(crate::transport::UsbTransport::find).with_cancel(cancel);
    Ok(Box::new(protocol))
}

#[cfg(not(feature = "usb"))]
pub fn open(_cancel: CancelToken) -> Result<Box<dyn Protocol>> {
    Err(Error::UsbUnavailable("built without the usb feature".into()))
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;
    use crate::protocol::testutil::status;
    use crate::transport::MockUsb;

    fn reply(payload: &[u8]) -> Vec<u8> {
        let mut packet = vec![0x46, 0xb9, payload.len() as u8];
        packet.extend_from_slice(payload);
        packet.push(usb::checksum(&packet[2..]));
        packet
    }

    fn usb_status() -> Vec<u8> {
        let mut s = status(0x50, 38, 0x72, 0xf449);
        s[4] = 0x9a;
        s[5..8].copy_from_slice(&[0xf7, 0xfe, 0xe1]);
        s[8..12].copy_from_slice(&24_000_000u32.to_be_bytes());
        s[12] = 0xf9;
        s[37] = 0xf7;
        s
    }

    fn protocol(replies: Vec<Vec<u8>>) -> (StcUsb15Protocol<MockUsb>, MockUsb) {
        let usb = MockUsb::new(replies);
        let device = usb.clone();
        (StcUsb15Protocol::new(move || Ok(Some(device.clone()))), usb)
    }

    #[test]
    fn full_session() {
        let replies = vec![
            reply(&[0x50, 0x01]),
            reply(&usb_status()),
            reply(&[0x01]),
            reply(&[0x05]),
            reply(&[0x03, 1, 2, 3, 4, 5, 6, 7]),
            reply(&[0x02, 0x54]),
            reply(&[0x02, 0x54]),
            reply(&[0x04, 0x54]),
        ];
        let (mut protocol, usb) = protocol(replies);
        protocol.connect(&ResetStrategy::Manual).unwrap();
        assert_eq!(protocol.mcu_info().unwrap().model.name, "STC15F2K60S2");
        assert_eq!(protocol.mcu_info().unwrap().clock_hz, 24_000_000.0);

        protocol.handshake().unwrap();
        protocol.erase_flash(0, 0).unwrap();
        protocol
            .program_flash(&[0xa5; 200], &mut crate::progress::NoProgress)
            .unwrap();
        protocol.program_options().unwrap();
        protocol.disconnect().unwrap();
        assert_eq!(protocol.uid(), Some(&[1u8, 2, 3, 4, 5, 6, 7][..]));

        let state = usb.state();
        let state = state.borrow();
        let requests = &state.requests;
        assert_eq!(requests[0], (0x01, 0, 0, vec![0x03, 0xfd]));
        assert_eq!(requests[1], (0x05, 0xa55a, 0, vec![0x00, 0x00]));
        assert_eq!(requests[2], (0x03, 0xa55a, 0, vec![0x00, 0x00]));
        assert_eq!((requests[3].0, requests[3].2), (0x22, 0));
        assert_eq!(requests[3].3.len(), 128 + 19);
        assert_eq!((requests[4].0, requests[4].2), (0x02, 128));
        assert_eq!(requests[5].0, 0x04);
        let options: Vec<u8> = requests[5]
            .3
            .chunks(8)
            .flat_map(|c| c[..c.len() - 1].to_vec())
            .collect();
        assert_eq!(options.len(), 64);
        // factory trim at 24 MHz
        assert_eq!(&options[59..61], &[0x9a, 0x7f]);
        assert_eq!(requests[6], (0xff, 0, 0, vec![0x00, 0x00]));
        assert_eq!(
            state.delays,
            vec![
                POLL_INTERVAL,
                ERASE_TIME,
                WRITE_TIME,
                WRITE_TIME,
                OPTION_TIME
            ]
        );
    }

    #[test]
    fn locked_mcu() {
        let replies = vec![reply(&usb_status()), reply(&[0x01]), reply(&[0x0f])];
        let (mut protocol, _) = protocol(replies);
        protocol.connect(&ResetStrategy::Manual).unwrap();
        assert!(matches!(protocol.handshake(), Err(Error::Locked)));
    }

    #[test]
    fn permission_errors_end_the_wait() {
        let mut protocol = StcUsb15Protocol::<MockUsb>::new(|| {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "denied").into())
        });
        let err = protocol.connect(&ResetStrategy::Manual).unwrap_err();
        assert!(matches!(err, Error::Io(e) if e.kind() == io::ErrorKind::PermissionDenied));
    }

    #[test]
    fn cancellation_ends_the_wait() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let (protocol, _) = protocol(vec![]);
        let mut protocol = protocol.with_cancel(cancel);
        assert!(matches!(
            protocol.connect(&ResetStrategy::Manual),
            Err(Error::Cancelled)
        ));
    }

    #[test]
    fn disconnect_without_device_is_a_no_op() {
        let (mut protocol, usb) = protocol(vec![]);
        protocol.disconnect().unwrap();
        assert!(usb.state().borrow().requests.is_empty());
    }
}
