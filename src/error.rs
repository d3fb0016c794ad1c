use std::error::Error as StdError;
use std::fmt::{self, Display, Formatter};
use std::io;
use std::result::Result as StdResult;

#[derive(Debug)]
pub enum Error {
    /// No device matching the controller's USB identity was found.
    DeviceNotFound,
    /// A transport callback failed, timed out or was cancelled.
    Transport,
    /// Parity or CRC mismatch, or an unexpected response code or size.
    Protocol,
    /// The device speaks a newer BCP revision than this library.
    UnsupportedVersion,
    /// A request was malformed before it touched the wire.
    InvalidRequest,
    /// The device's identifier window did not read back `"BOOTLOAD"`.
    NotInBootloader,
    /// The device rejected the unlock write.
    Unlock,
    /// The final lock write, which commits buffered flash data, failed.
    Commit,
    /// Device memory did not match the file during verification.
    Verification,
    /// Memory access outside the device's address space, or while locked.
    Access,
    /// Intel HEX file could not be opened, rewound or read.
    File(io::Error),
    /// Malformed Intel HEX record.
    Record,
    /// Intel HEX record checksum mismatch.
    Checksum,
    /// No start-address record was seen in the file.
    NoStartAddress,
    /// Error reported by libusb.
    Usb(rusb::Error),
}

impl Display for Error {
    fn fmt(&self, fmt: &mut Formatter) -> StdResult<(), fmt::Error> {
        match self {
            Error::DeviceNotFound => fmt.write_str("Device not found"),
            Error::Transport => fmt.write_str("Transport read/write failed"),
            Error::Protocol => fmt.write_str("General communication error"),
            Error::UnsupportedVersion => {
                fmt.write_str("Device BCP version incompatible with this library")
            }
            Error::InvalidRequest => fmt.write_str("Invalid request"),
            Error::NotInBootloader => fmt.write_str("Device not in flash mode"),
            Error::Unlock => fmt.write_str("Unable to unlock device flash"),
            Error::Commit => fmt.write_str("Failed to commit flash write"),
            Error::Verification => {
                fmt.write_str("Device verification failed, byte mismatch")
            }
            Error::Access => fmt.write_str("Invalid device memory access"),
            Error::File(error) => write!(fmt, "Intel Hex file error: {}", error),
            Error::Record => fmt.write_str("Invalid record field"),
            Error::Checksum => fmt.write_str("Bad record checksum"),
            Error::NoStartAddress => fmt.write_str("Start address not found"),
            Error::Usb(error) => write!(fmt, "USB error: {}", error),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::File(error) => Some(error),
            Error::Usb(error) => Some(error),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        Error::File(error)
    }
}

impl From<rusb::Error> for Error {
    fn from(error: rusb::Error) -> Self {
        Error::Usb(error)
    }
}

pub type Result<T> = StdResult<T, Error>;
