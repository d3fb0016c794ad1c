//! Basic Control Protocol: a small framed request/response protocol spoken
//! between the host tool and the device over an arbitrary byte pipe.
//!
//! A frame is a single header byte (3-bit request/response code, two parity
//! check bits, 3-bit encoded payload size), one to eight payload bytes, and
//! an 8-bit CRC trailer. The same codec serves both ends: [`Host`] issues
//! requests, [`Device`] answers them by delegating memory access to a
//! [`Memory`] handler. Multi-byte integers travel big-endian.

use crc_any::CRCu8;
use std::convert::TryInto;

use crate::error::{Error, Result};
use crate::transport::Transport;

/// BCP version supported by this library (major.minor, 4 bits each).
const VERSION_SUPPORTED: u8 = 0x10;

/// `DeviceInfo` property selector for the version handshake.
const PROPERTY_BCP_VERSION: u8 = 0x00;

/// Session flag: the device advances its address after each memory access.
pub const FLAG_ADDR_INC: u8 = 0x01;

/// Request codes (header bits 7..5, host to device).
mod request {
    pub const DEVICE_INFO: u8 = 0x00;
    pub const SET_FLAGS: u8 = 0x01;
    pub const SET_ADDRESS: u8 = 0x02;
    pub const READ_MEMORY: u8 = 0x03;
    pub const WRITE_MEMORY: u8 = 0x04;
}

/// Response codes (header bits 7..5, device to host).
mod response {
    pub const NONE: u8 = 0x00;
    pub const DATA: u8 = 0x01;
    pub const INVALID: u8 = 0x02;
}

/// Scratch buffer holding one frame: header, up to eight payload bytes and
/// the CRC trailer. Owned by whichever session role holds it.
struct Frame {
    pkt: [u8; 0x0A],
}

impl Frame {
    fn new() -> Self {
        Frame { pkt: [0x00; 0x0A] }
    }

    /// Request/response code in the header's top three bits.
    fn code(&self) -> u8 {
        self.pkt[0x00] >> 0x05
    }

    fn set_code(&mut self, code: u8) {
        self.pkt[0x00] = (self.pkt[0x00] & 0x1F) | (code << 0x05);
    }

    /// Encoded size field: payload length minus one.
    fn size(&self) -> u8 {
        self.pkt[0x00] & 0x07
    }

    fn set_size(&mut self, size: u8) {
        self.pkt[0x00] = (self.pkt[0x00] & 0xF8) | size;
    }

    fn data(&self) -> &[u8] {
        &self.pkt[0x01..self.size() as usize + 0x02]
    }

    fn data_mut(&mut self) -> &mut [u8] {
        let end = self.size() as usize + 0x02;
        &mut self.pkt[0x01..end]
    }

    /// Fills in the check bits and CRC trailer, then writes the whole frame.
    fn send<T: Transport>(&mut self, transport: &mut T) -> Result<()> {
        let size = self.size();

        self.pkt[0x00] &= 0xE7;
        if !even_parity(self.code()) {
            self.pkt[0x00] |= 0x10;
        }
        if !even_parity(size) {
            self.pkt[0x00] |= 0x08;
        }

        let end = size as usize + 0x02;
        self.pkt[end] = crc8(&self.pkt[..end]);

        transport.write_exact(&self.pkt[..=end])
    }

    /// Reads a frame: the header first, then the payload and CRC trailer it
    /// announces. Check-bit or CRC mismatches report [`Error::Protocol`].
    fn receive<T: Transport>(&mut self, transport: &mut T) -> Result<()> {
        transport.read_exact(&mut self.pkt[..0x01])?;

        let size = self.size();
        if even_parity(self.code()) != (self.pkt[0x00] & 0x10 == 0x00)
            || even_parity(size) != (self.pkt[0x00] & 0x08 == 0x00)
        {
            return Err(Error::Protocol);
        }

        let end = size as usize + 0x02;
        transport.read_exact(&mut self.pkt[0x01..=end])?;

        if self.pkt[end] != crc8(&self.pkt[..end]) {
            return Err(Error::Protocol);
        }

        Ok(())
    }
}

/// Whether a 3-bit field has an even number of set bits.
fn even_parity(bits: u8) -> bool {
    match bits {
        0x00 | 0x03 | 0x05 | 0x06 => true,
        _ => false,
    }
}

/// Calculates the frame CRC the way the device does it: polynomial 0xC5,
/// register seeded with 0xFF, message bits shifted in MSB-first and the
/// register flushed with one final zero byte. Preloading the table-driven
/// form with 0x15 (0xFF pushed through the eight flush bits) produces the
/// identical sequence without the augmentation.
pub(crate) fn crc8(data: &[u8]) -> u8 {
    let mut crc = CRCu8::create_crc(0xC5, 8, 0x15, 0x00, false);
    crc.digest(data);
    crc.get_crc()
}

/// Host side of a BCP session: issues requests and validates responses.
///
/// Every operation is a complete, blocking request/response round trip; the
/// device never originates a frame. The session owns its transport and its
/// frame buffer, so a `Host` value is the single point of access to the
/// channel.
pub struct Host<T: Transport> {
    transport: T,
    frame: Frame,
}

impl<T: Transport> Host<T> {
    /// Performs the version handshake and returns the session on success.
    ///
    /// Asks the device for its supported BCP version and fails with
    /// [`Error::UnsupportedVersion`] if the device is newer than this
    /// library. A successful handshake is a prerequisite for every other
    /// call.
    pub fn open(transport: T) -> Result<Self> {
        let mut host = Host {
            transport,
            frame: Frame::new(),
        };

        host.frame.set_code(request::DEVICE_INFO);
        host.frame.set_size(0x00);
        host.frame.data_mut()[0x00] = PROPERTY_BCP_VERSION;
        host.roundtrip()?;

        if host.frame.code() != response::DATA || host.frame.size() != 0x00 {
            return Err(Error::Protocol);
        }
        if host.frame.data()[0x00] > VERSION_SUPPORTED {
            return Err(Error::UnsupportedVersion);
        }

        Ok(host)
    }

    /// Points subsequent memory operations at a device address.
    pub fn set_address(&mut self, address: u64) -> Result<()> {
        self.frame.set_code(request::SET_ADDRESS);
        self.frame.set_size(0x07);
        self.frame.data_mut().copy_from_slice(&address.to_be_bytes());

        self.roundtrip()?;
        self.expect_none()
    }

    /// Replaces the device's session flags.
    pub fn set_flags(&mut self, flags: u8) -> Result<()> {
        self.frame.set_code(request::SET_FLAGS);
        self.frame.set_size(0x00);
        self.frame.data_mut()[0x00] = flags;

        self.roundtrip()?;
        self.expect_none()
    }

    /// Reads `buf.len()` bytes (1 to 8) from the device's current address.
    pub fn read_memory(&mut self, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() || buf.len() > 0x08 {
            return Err(Error::InvalidRequest);
        }

        let size = buf.len() as u8 - 0x01;
        self.frame.set_code(request::READ_MEMORY);
        self.frame.set_size(0x00);
        self.frame.data_mut()[0x00] = size;

        self.roundtrip()?;

        // The response must carry exactly the requested amount.
        if self.frame.code() != response::DATA || self.frame.size() != size {
            return Err(Error::Protocol);
        }
        buf.copy_from_slice(self.frame.data());

        Ok(())
    }

    /// Writes 1 to 8 bytes to the device's current address.
    pub fn write_memory(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() || data.len() > 0x08 {
            return Err(Error::InvalidRequest);
        }

        self.frame.set_code(request::WRITE_MEMORY);
        self.frame.set_size(data.len() as u8 - 0x01);
        self.frame.data_mut().copy_from_slice(data);

        self.roundtrip()?;
        self.expect_none()
    }

    fn roundtrip(&mut self) -> Result<()> {
        self.frame.send(&mut self.transport)?;
        self.frame.receive(&mut self.transport)
    }

    fn expect_none(&mut self) -> Result<()> {
        if self.frame.code() != response::NONE {
            return Err(Error::Protocol);
        }
        Ok(())
    }
}

/// Memory surface a device exposes through BCP read and write requests.
///
/// Implementations decide what the 64-bit address space means; the
/// bootloader maps flash at the bottom and control registers at magic
/// addresses. Any error is reported to the host as an `Invalid` response.
pub trait Memory {
    /// Fills `buf` from device memory starting at `address`.
    fn read(&mut self, address: u64, buf: &mut [u8]) -> Result<()>;

    /// Writes `data` to device memory starting at `address`.
    fn write(&mut self, address: u64, data: &[u8]) -> Result<()>;
}

/// Device side of a BCP session: serves one request per call.
///
/// The device never speaks unprompted; every transmitted frame answers a
/// received one. Session state is the option flags and the current target
/// address, both controlled by the host.
pub struct Device<T: Transport> {
    transport: T,
    frame: Frame,
    flags: u8,
    address: u64,
}

impl<T: Transport> Device<T> {
    /// Creates a device session with cleared flags and address. There is no
    /// handshake; the host drives the session.
    pub fn new(transport: T) -> Self {
        Device {
            transport,
            frame: Frame::new(),
            flags: 0x00,
            address: 0x00,
        }
    }

    /// Blocks for one request, dispatches it and sends the response.
    ///
    /// A request that is framed correctly but malformed at the protocol
    /// level (unknown code, wrong size, rejected by the handler) is
    /// answered with `Invalid` and counts as handled. Errors are returned
    /// only when receiving or sending itself fails; the main loop decides
    /// whether to keep serving.
    pub fn handle_request<M: Memory>(&mut self, memory: &mut M) -> Result<()> {
        self.frame.receive(&mut self.transport)?;

        let size = self.frame.size();
        let handled = match self.frame.code() {
            request::DEVICE_INFO => {
                if size == 0x00 && self.frame.data()[0x00] == PROPERTY_BCP_VERSION {
                    self.frame.set_code(response::DATA);
                    self.frame.data_mut()[0x00] = VERSION_SUPPORTED;
                    true
                } else {
                    false
                }
            }
            request::SET_FLAGS => {
                if size == 0x00 && self.frame.data()[0x00] == FLAG_ADDR_INC {
                    self.flags = FLAG_ADDR_INC;
                    self.frame.set_code(response::NONE);
                    true
                } else {
                    false
                }
            }
            request::SET_ADDRESS => {
                if size == 0x07 {
                    self.address = u64::from_be_bytes(self.frame.data().try_into().unwrap());
                    self.frame.set_code(response::NONE);
                    self.frame.set_size(0x00);
                    true
                } else {
                    false
                }
            }
            request::READ_MEMORY => {
                if size == 0x00 && self.frame.data()[0x00] < 0x08 {
                    let count = self.frame.data()[0x00] + 0x01;
                    self.frame.set_size(count - 0x01);

                    let address = self.address;
                    if memory.read(address, self.frame.data_mut()).is_ok() {
                        if self.flags & FLAG_ADDR_INC != 0x00 {
                            self.address = self.address.wrapping_add(u64::from(count));
                        }
                        self.frame.set_code(response::DATA);
                        true
                    } else {
                        false
                    }
                } else {
                    false
                }
            }
            request::WRITE_MEMORY => {
                let address = self.address;
                if memory.write(address, self.frame.data()).is_ok() {
                    if self.flags & FLAG_ADDR_INC != 0x00 {
                        self.address = self.address.wrapping_add(u64::from(size) + 0x01);
                    }
                    self.frame.set_code(response::NONE);
                    self.frame.set_size(0x00);
                    true
                } else {
                    false
                }
            }
            _ => false,
        };

        if !handled {
            self.frame.set_code(response::INVALID);
            self.frame.set_size(0x00);
        }

        self.frame.send(&mut self.transport)
    }
}
