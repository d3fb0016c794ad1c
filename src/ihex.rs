//! Streaming Intel HEX record reader.
//!
//! Lines are parsed one at a time into `(address, data)` pairs; offset and
//! start-address records are folded into the reader's state as they pass
//! by. The reader is single-pass with a rewind primitive, which is all the
//! flashing session needs.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Seek, SeekFrom};
use std::path::Path;

use crate::error::{Error, Result};

/// Shortest valid record: colon, byte count, address, type and checksum.
const MIN_RECORD: usize = 0x0B;

/// Streaming reader for one Intel HEX file.
///
/// Generic over the underlying line source so tests can feed it from
/// memory; [`open`] wires it to a buffered file.
///
/// [`open`]: #method.open
pub struct HexFile<R> {
    reader: R,
    line: String,
    data: [u8; 0xFF],
    address_offset: u64,
    start_address: Option<u32>,
    end_of_records: bool,
}

impl HexFile<BufReader<File>> {
    /// Opens an Intel HEX file from disk.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(HexFile::new(BufReader::new(File::open(path)?)))
    }
}

impl<R: BufRead + Seek> HexFile<R> {
    /// Wraps a rewindable line source.
    pub fn new(reader: R) -> Self {
        HexFile {
            reader,
            line: String::new(),
            data: [0x00; 0xFF],
            address_offset: 0x00,
            start_address: None,
            end_of_records: false,
        }
    }

    /// Seeks back to the first record.
    ///
    /// The segment offset established by 0x02/0x04 records is left in
    /// place: callers re-walk the file from the top, which replays those
    /// records before any data they apply to.
    pub fn reset(&mut self) -> Result<()> {
        self.reader.seek(SeekFrom::Start(0x00))?;
        self.end_of_records = false;
        Ok(())
    }

    /// Parses records up to and including the next data record and returns
    /// its absolute address and payload. `None` marks the end-of-file
    /// record; further calls keep returning `None` until [`reset`].
    ///
    /// The returned slice borrows the reader's record buffer and is only
    /// valid until the next call.
    ///
    /// [`reset`]: #method.reset
    pub fn next_data(&mut self) -> Result<Option<(u64, &[u8])>> {
        if self.end_of_records {
            return Ok(None);
        }

        loop {
            self.line.clear();
            if self.reader.read_line(&mut self.line)? == 0x00 {
                // Ran off the end of the file without an end-of-file record.
                return Err(Error::File(io::ErrorKind::UnexpectedEof.into()));
            }

            let line = self.line.trim_end_matches(|c| c == '\r' || c == '\n');
            if line.len() < MIN_RECORD || !line.starts_with(':') {
                return Err(Error::Record);
            }

            let count = parse_byte(line, 0x01)? as usize;
            let offset = parse_u16(line, 0x03)?;
            let kind = parse_byte(line, 0x07)?;

            if line.len() != MIN_RECORD + count * 0x02 {
                return Err(Error::Record);
            }

            // The record sums to zero when its trailing checksum is intact.
            let mut sum = 0x00u8;
            let mut at = 0x01;
            while at < line.len() {
                sum = sum.wrapping_add(parse_byte(line, at)?);
                at += 0x02;
            }
            if sum != 0x00 {
                return Err(Error::Checksum);
            }

            match kind {
                // Data
                0x00 => {
                    for index in 0x00..count {
                        self.data[index] = parse_byte(line, 0x09 + index * 0x02)?;
                    }
                    let address = self.address_offset + u64::from(offset);
                    return Ok(Some((address, &self.data[..count])));
                }
                // End-of-file
                0x01 if count == 0x00 => {
                    self.end_of_records = true;
                    return Ok(None);
                }
                // 16-bit address offset. Stored raw, not shifted: files
                // produced for this device encode the full offset here.
                0x02 if count == 0x02 => {
                    self.address_offset = u64::from(parse_u16(line, 0x09)?);
                }
                // Start address (x86 CS:IP form)
                0x03 if count == 0x04 => {
                    self.start_address = Some(parse_u32(line, 0x09)?);
                }
                // 32-bit address offset
                0x04 if count == 0x04 => {
                    self.address_offset = u64::from(parse_u32(line, 0x09)?);
                }
                // 32-bit start address
                0x05 if count == 0x04 => {
                    self.start_address = Some(parse_u32(line, 0x09)?);
                }
                _ => return Err(Error::Record),
            }
        }
    }

    /// Sums the data bytes across the whole file. Leaves the reader rewound.
    pub fn total_size(&mut self) -> Result<u32> {
        self.reset()?;

        let mut size = 0x00u32;
        while let Some((_, data)) = self.next_data()? {
            size += data.len() as u32;
        }

        self.reset()?;
        Ok(size)
    }

    /// Program entry point captured from a start-address record.
    pub fn start_address(&self) -> Result<u32> {
        self.start_address.ok_or(Error::NoStartAddress)
    }
}

/// Decodes two hex digits at `at`.
fn parse_byte(line: &str, at: usize) -> Result<u8> {
    let digits = line.get(at..at + 0x02).ok_or(Error::Record)?;
    if !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(Error::Record);
    }
    u8::from_str_radix(digits, 0x10).map_err(|_| Error::Record)
}

fn parse_u16(line: &str, at: usize) -> Result<u16> {
    Ok(u16::from(parse_byte(line, at)?) << 0x08 | u16::from(parse_byte(line, at + 0x02)?))
}

fn parse_u32(line: &str, at: usize) -> Result<u32> {
    Ok(u32::from(parse_u16(line, at)?) << 0x10 | u32::from(parse_u16(line, at + 0x04)?))
}
