//! This crate talks to the CNC controller's bootloader over the Basic
//! Control Protocol (BCP) and provides everything needed on both ends of
//! the wire: the framed codec itself, the host role the flashing tool
//! uses, and the device role plus page-buffered flash handler the
//! bootloader firmware is built from.
//!
//! BCP is a small request/response protocol — one header byte, one to
//! eight data bytes, an 8-bit CRC — spoken over any blocking byte pipe.
//! The [`Transport`] trait is that pipe; the host side ships a USB
//! implementation, tests use in-memory channels.
//!
//! # Example: Basic flashing
//! ```rust, no_run
//! use cnc_control::{FlashSession, Host, UsbTransport};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Find the controller and shake hands
//! let context = rusb::Context::new()?;
//! let mut bcp = Host::open(UsbTransport::open(&context)?)?;
//!
//! // Program and verify an Intel HEX image
//! let mut session = FlashSession::open(&mut bcp, "application.hex")?;
//! session.write(|| print!("#"), 2)?;
//! session.verify(|| print!("#"), 2)?;
//!
//! let (pages, bytes) = session.size()?;
//! println!("Done: {} pages, {} bytes", pages, bytes);
//! # Ok(())
//! # }
//! ```

mod bcp;
mod bootloader;
mod error;
mod flash;
mod ihex;
mod transport;
mod usb;

pub use bcp::{Device, Host, Memory, FLAG_ADDR_INC};
pub use bootloader::{
    Bootloader, Flash, BOOT_MESSAGE, FLASH_END, ID_ADDRESS, LOCK_ADDRESS, LOCK_KEY,
    PAGE_COUNT_ADDRESS, PAGE_SIZE, UNLOCK_KEY,
};
pub use error::{Error, Result};
pub use flash::FlashSession;
pub use ihex::HexFile;
pub use transport::Transport;
pub use usb::UsbTransport;

/// Timeout for all USB transactions.
const TIMEOUT: std::time::Duration = std::time::Duration::from_millis(1000);
