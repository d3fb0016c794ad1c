//! BCP transport over the controller's USB to I2C bridge.
//!
//! The bridge exposes a pair of vendor control requests that shuttle raw
//! BCP bytes to and from the device. Transfers that complete short are
//! resumed from where they stopped, a few times, before giving up.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::warn;
use rusb::{Context, DeviceHandle, UsbContext};

use crate::error::{Error, Result};
use crate::transport::Transport;
use crate::TIMEOUT;

/// USB identity of the bridge.
const VENDOR_ID: u16 = 0xF055;
const PRODUCT_ID: u16 = 0x3A3A;

/// Vendor control requests understood by the bridge.
const REQUEST_READ: u8 = 0x01;
const REQUEST_WRITE: u8 = 0x02;

/// Transfer attempts before a short transfer is reported as an error.
const ATTEMPTS: u8 = 0x05;

/// Settle time after a completed write; the bridge needs a moment for the
/// device-side I2C round trip.
const WRITE_DELAY: Duration = Duration::from_millis(200);

/// Byte pipe to the device over the bridge's vendor control endpoint.
pub struct UsbTransport {
    handle: DeviceHandle<Context>,
    cancel: Arc<AtomicBool>,
}

impl UsbTransport {
    /// Walks the bus for the controller and opens it.
    pub fn open(context: &Context) -> Result<UsbTransport> {
        for device in context.devices()?.iter() {
            let descriptor = match device.device_descriptor() {
                Ok(descriptor) => descriptor,
                Err(_) => continue,
            };

            if descriptor.vendor_id() == VENDOR_ID
                && descriptor.product_id() == PRODUCT_ID
                && descriptor.class_code() == 0xFF
                && descriptor.sub_class_code() == 0x00
            {
                return Ok(UsbTransport {
                    handle: device.open()?,
                    cancel: Arc::new(AtomicBool::new(false)),
                });
            }
        }

        Err(Error::DeviceNotFound)
    }

    /// Flag polled before every transfer. Setting it (e.g. from a SIGINT
    /// hook) makes the next transfer fail instead of touching the bus, so
    /// the session dies between frames rather than inside one.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }
}

impl Transport for UsbTransport {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() || self.cancel.load(Ordering::SeqCst) {
            return Err(Error::Transport);
        }

        let request_type = rusb::request_type(
            rusb::Direction::In,
            rusb::RequestType::Vendor,
            rusb::Recipient::Device,
        );

        let mut offset = 0x00;
        for _ in 0x00..ATTEMPTS {
            offset += self.handle.read_control(
                request_type,
                REQUEST_READ,
                0x00,
                0x00,
                &mut buf[offset..],
                TIMEOUT,
            )?;

            if offset == buf.len() {
                return Ok(());
            }
            warn!("short USB read, resuming at offset {}", offset);
        }

        Err(Error::Transport)
    }

    fn write_exact(&mut self, buf: &[u8]) -> Result<()> {
        if buf.is_empty() || self.cancel.load(Ordering::SeqCst) {
            return Err(Error::Transport);
        }

        let request_type = rusb::request_type(
            rusb::Direction::Out,
            rusb::RequestType::Vendor,
            rusb::Recipient::Device,
        );

        let mut offset = 0x00;
        for _ in 0x00..ATTEMPTS {
            offset += self.handle.write_control(
                request_type,
                REQUEST_WRITE,
                0x00,
                0x00,
                &buf[offset..],
                TIMEOUT,
            )?;

            if offset == buf.len() {
                // Give the bridge time to push the frame out over I2C.
                thread::sleep(WRITE_DELAY);
                return Ok(());
            }
            warn!("short USB write, resuming at offset {}", offset);
        }

        Err(Error::Transport)
    }
}
