//! Host-side flashing session: walks an Intel HEX file and drives the
//! device's bootloader through BCP.

use std::fs::File;
use std::io::{BufRead, BufReader, Seek};
use std::path::Path;

use log::debug;

use crate::bcp::{Host, FLAG_ADDR_INC};
use crate::bootloader;
use crate::error::{Error, Result};
use crate::ihex::HexFile;
use crate::transport::Transport;

/// One write-then-verify session against an unlocked bootloader.
///
/// Between a successful [`open`] and the end of the session the device is
/// known to be in bootloader mode with flash unlocked. A successful
/// [`write`] commits and re-locks; a failure leaves the device unlocked for
/// the next run to pick up.
///
/// [`open`]: #method.open
/// [`write`]: #method.write
pub struct FlashSession<'a, T: Transport, R: BufRead + Seek = BufReader<File>> {
    file: HexFile<R>,
    bcp: &'a mut Host<T>,
    size: u32,
}

impl<'a, T: Transport> FlashSession<'a, T> {
    /// Opens a HEX file from disk and prepares the device.
    pub fn open<P: AsRef<Path>>(bcp: &'a mut Host<T>, path: P) -> Result<Self> {
        FlashSession::new(bcp, HexFile::open(path)?)
    }
}

impl<'a, T: Transport, R: BufRead + Seek> FlashSession<'a, T, R> {
    /// Checks the device is in bootloader mode, unlocks programming and
    /// scans the file for its total payload size.
    pub fn new(bcp: &'a mut Host<T>, mut file: HexFile<R>) -> Result<Self> {
        // The identifier window answers "BOOTLOAD" only while the
        // bootloader is in charge.
        let mut id = [0x00u8; 0x08];
        let read = bcp
            .set_address(bootloader::ID_ADDRESS)
            .and_then(|_| bcp.read_memory(&mut id));
        if read.is_err() || id != *bootloader::BOOT_MESSAGE {
            return Err(Error::NotInBootloader);
        }

        if bcp
            .set_address(bootloader::LOCK_ADDRESS)
            .and_then(|_| bcp.write_memory(&[bootloader::UNLOCK_KEY]))
            .is_err()
        {
            return Err(Error::Unlock);
        }
        debug!("device unlocked for programming");

        let size = file.total_size()?;
        Ok(FlashSession { file, bcp, size })
    }

    /// Returns the flashed size as device pages and HEX payload bytes.
    pub fn size(&mut self) -> Result<(u8, u32)> {
        let mut pages = [0x00u8];
        self.bcp.set_address(bootloader::PAGE_COUNT_ADDRESS)?;
        self.bcp.read_memory(&mut pages)?;
        Ok((pages[0x00], self.size))
    }

    /// Streams every data record to the device, then commits.
    ///
    /// `progress` fires so that `100 / rate` calls cover the whole file; a
    /// `rate` of zero disables it.
    pub fn write<F: FnMut()>(&mut self, progress: F, rate: u8) -> Result<()> {
        self.run(progress, rate, false)
    }

    /// Re-walks the file and compares device memory byte for byte.
    pub fn verify<F: FnMut()>(&mut self, progress: F, rate: u8) -> Result<()> {
        self.run(progress, rate, true)
    }

    fn run<F: FnMut()>(&mut self, mut progress: F, rate: u8, verify: bool) -> Result<()> {
        let mut chunk_buffer = [0x00u8; 0x08];
        let mut last_address = 0x00u64;
        let mut rw_size = 0x00u32;
        let mut updates = 0x00u32;

        self.file.reset()?;
        self.bcp.set_address(0x00)?;
        self.bcp.set_flags(FLAG_ADDR_INC)?;

        loop {
            let (address, data) = match self.file.next_data()? {
                Some(record) => record,
                None => break,
            };
            if data.is_empty() {
                continue;
            }

            // A fresh set_address only when the record does not continue
            // where the last one left off; the device cursor carries
            // contiguous records by itself.
            if address != last_address {
                self.bcp.set_address(address)?;
                last_address = address;
            }
            last_address += data.len() as u64;

            for chunk in data.chunks(0x08) {
                if verify {
                    let read_back = &mut chunk_buffer[..chunk.len()];
                    self.bcp.read_memory(read_back)?;
                    if read_back[..] != chunk[..] {
                        return Err(Error::Verification);
                    }
                } else {
                    self.bcp.write_memory(chunk)?;
                }

                rw_size += chunk.len() as u32;
                if rate != 0x00 {
                    while updates != (rw_size * 0x64 / self.size) / u32::from(rate) {
                        progress();
                        updates += 0x01;
                    }
                }
            }
        }

        if !verify {
            // Locking commits any partially-filled page still buffered on
            // the device.
            if self
                .bcp
                .set_address(bootloader::LOCK_ADDRESS)
                .and_then(|_| self.bcp.write_memory(&[bootloader::LOCK_KEY]))
                .is_err()
            {
                return Err(Error::Commit);
            }
            debug!("committed {} bytes to device flash", rw_size);
        }

        Ok(())
    }
}
