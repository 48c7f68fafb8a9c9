//! USB Transportation.
use std::time::Duration;

use rusb::{Context, DeviceHandle, Direction, Recipient, RequestType, UsbContext};

use super::ControlTransport;
use crate::constants::{USB_PID, USB_VID};
use crate::error::{Error, Result};

const TIMEOUT_MS: u64 = 5000;

pub struct UsbTransport {
    device_handle: DeviceHandle<rusb::Context>,
}

impl UsbTransport {
    /// Bus locations of every attached STC USB BSL.
    pub fn list_devices() -> Result<Vec<String>> {
        let context = Self::context()?;
        let found = context
            .devices()?
            .iter()
            .filter(is_stc_bsl)
            .map(|device| {
                format!(
                    "STC USB BSL (bus {:03} address {:03})",
                    device.bus_number(),
                    device.address()
                )
            })
            .collect();
        Ok(found)
    }

    /// Look for the first STC USB BSL. `Ok(None)` means nothing is plugged in
    /// yet, which the caller treats as "keep waiting".
    pub fn find() -> Result<Option<UsbTransport>> {
        let context = Self::context()?;

        let Some(device) = context.devices()?.iter().find(is_stc_bsl) else {
            return Ok(None);
        };
        log::debug!("Found USB Device {:?}", device);

        let mut device_handle = device.open().map_err(permission_as_io)?;
        device_handle
            .set_active_configuration(1)
            .map_err(permission_as_io)?;

        Ok(Some(UsbTransport { device_handle }))
    }

    fn context() -> Result<Context> {
        Context::new().map_err(|e| Error::UsbUnavailable(format!("libusb is not working ({e})")))
    }
}

fn is_stc_bsl<T: UsbContext>(device: &rusb::Device<T>) -> bool {
    device
        .device_descriptor()
        .map(|desc| desc.vendor_id() == USB_VID && desc.product_id() == USB_PID)
        .unwrap_or(false)
}

fn permission_as_io(err: rusb::Error) -> Error {
    match err {
        rusb::Error::Access => Error::Io(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "access to the USB device was denied",
        )),
        other => Error::Usb(other),
    }
}

impl ControlTransport for UsbTransport {
    fn control_in(&mut self, request: u8, value: u16, index: u16, len: usize) -> Result<Vec<u8>> {
        let request_type = rusb::request_type(Direction::In, RequestType::Vendor, Recipient::Device);
        let mut buf = vec![0u8; len];
        let nread = self
            .device_handle
            .read_control(
                request_type,
                request,
                value,
                index,
                &mut buf,
                Duration::from_millis(TIMEOUT_MS),
            )
            .map_err(permission_as_io)?;
        buf.truncate(nread);
        Ok(buf)
    }

    fn control_out(&mut self, request: u8, value: u16, index: u16, data: &[u8]) -> Result<()> {
        let request_type =
            rusb::request_type(Direction::Out, RequestType::Vendor, Recipient::Device);
        self.device_handle
            .write_control(
                request_type,
                request,
                value,
                index,
                data,
                Duration::from_millis(TIMEOUT_MS),
            )
            .map_err(permission_as_io)?;
        Ok(())
    }
}
