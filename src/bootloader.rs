//! Device-side flash handler behind the BCP device role.
//!
//! The bootloader presents flash as the bottom of a 64-bit address space
//! and hangs a few control registers at magic addresses: an identifier
//! window at the very top, a committed-page counter just below it, and a
//! lock register far outside flash. Writes are page-buffered: bytes land in
//! a one-page RAM buffer and are committed to flash when the cursor crosses
//! a page boundary or the host locks programming.

use bitflags::bitflags;
use log::debug;

use crate::bcp::Memory;
use crate::error::{Error, Result};

/// Flash page size of the target microcontroller.
pub const PAGE_SIZE: usize = 0x80;

/// First address past the end of application flash.
pub const FLASH_END: u16 = 0x8000;

const PAGE_MASK: u16 = 0xFF80;

/// Identifier read back from [`ID_ADDRESS`] while the bootloader is in
/// charge; the application firmware answers with its own tag there.
pub const BOOT_MESSAGE: &[u8; 8] = b"BOOTLOAD";

/// First byte of the eight-byte identifier window at the top of the
/// address space.
pub const ID_ADDRESS: u64 = 0xFFFF_FFFF_FFFF_FFF8;

/// One-byte count of pages committed since the last unlock.
pub const PAGE_COUNT_ADDRESS: u64 = 0xFFFF_FFFF_FFFF_FFF7;

/// One-byte lock register. Deliberately far outside flash so it can never
/// alias a programmable address.
pub const LOCK_ADDRESS: u64 = 0x0100_00AC_E000_0010;

/// Lock-register payload that unlocks programming and resets the session.
pub const UNLOCK_KEY: u8 = 0x01;

/// Lock-register payload that commits buffered data and locks programming.
pub const LOCK_KEY: u8 = 0x00;

bitflags! {
    /// Bootloader write-state flags.
    struct State: u8 {
        /// Programming has been unlocked through the lock register.
        const UNLOCKED = 0x02;
        /// The page buffer holds modifications not yet in flash.
        const OUTSTANDING = 0x04;
    }
}

/// Page-erase/program backend the bootloader drives.
///
/// On a live target `write_page` must mask interrupts for the duration:
/// erase/program stalls the CPU and shares registers with the transport.
pub trait Flash {
    /// Reads bytes from flash starting at `address`.
    fn read(&mut self, address: u16, buf: &mut [u8]) -> Result<()>;

    /// Erases the page at `address` (page-aligned) and programs `data`,
    /// one full page, into it.
    fn write_page(&mut self, address: u16, data: &[u8]) -> Result<()>;
}

/// Page-buffered flash programmer served through [`Memory`].
pub struct Bootloader<F: Flash> {
    flash: F,
    write_address: u16,
    write_count: u8,
    buffer: [u8; PAGE_SIZE],
    state: State,
}

impl<F: Flash> Bootloader<F> {
    pub fn new(flash: F) -> Self {
        Bootloader {
            flash,
            write_address: 0x0000,
            write_count: 0x00,
            buffer: [0x00; PAGE_SIZE],
            state: State::empty(),
        }
    }

    /// Pages committed since the last unlock.
    pub fn pages_written(&self) -> u8 {
        self.write_count
    }

    /// Hands the backend back, e.g. to inspect flash after a session.
    pub fn into_flash(self) -> F {
        self.flash
    }

    /// Fills the page buffer from the page containing `address`.
    fn load_page(&mut self, address: u16) -> Result<()> {
        self.flash.read(address & PAGE_MASK, &mut self.buffer)
    }

    /// Erases and programs the page at `page` from the buffer. The counter
    /// saturates rather than wrapping.
    fn flush_page(&mut self, page: u16) -> Result<()> {
        if self.write_count != 0xFF {
            self.write_count += 0x01;
        }
        self.state.remove(State::OUTSTANDING);

        debug!("committing flash page at {:#06x}", page);
        self.flash.write_page(page, &self.buffer)
    }
}

impl<F: Flash> Memory for Bootloader<F> {
    fn read(&mut self, address: u64, buf: &mut [u8]) -> Result<()> {
        // Identifier window in the last eight bytes of the address space.
        if address >= ID_ADDRESS {
            let offset = (address & 0x07) as usize;
            if buf.len() > 0x08 - offset {
                return Err(Error::Access);
            }
            buf.copy_from_slice(&BOOT_MESSAGE[offset..offset + buf.len()]);
            return Ok(());
        }

        if address == PAGE_COUNT_ADDRESS && buf.len() == 0x01 {
            buf[0x00] = self.write_count;
            return Ok(());
        }

        // Flash is mapped into the bottom of the address space.
        if address < u64::from(FLASH_END) {
            return self.flash.read(address as u16, buf);
        }

        Err(Error::Access)
    }

    fn write(&mut self, address: u64, data: &[u8]) -> Result<()> {
        if address == LOCK_ADDRESS && data.len() == 0x01 {
            return match data[0x00] {
                LOCK_KEY => {
                    // Flush whatever is still buffered before locking.
                    if self.state.contains(State::OUTSTANDING) {
                        self.flush_page(self.write_address & PAGE_MASK)?;
                    }
                    self.state.remove(State::UNLOCKED);
                    debug!("programming locked, {} pages written", self.write_count);
                    Ok(())
                }
                UNLOCK_KEY => {
                    self.state.insert(State::UNLOCKED);
                    self.state.remove(State::OUTSTANDING);
                    self.write_count = 0x00;
                    self.write_address = 0x0000;
                    debug!("programming unlocked");
                    self.load_page(0x0000)
                }
                _ => Err(Error::Access),
            };
        }

        if address >= u64::from(FLASH_END)
            || address + data.len() as u64 >= u64::from(FLASH_END)
            || !self.state.contains(State::UNLOCKED)
        {
            return Err(Error::Access);
        }
        let address = address as u16;

        // Writes that stray off the buffered page flush it and pull in the
        // new page for read-modify-write.
        if address & PAGE_MASK != self.write_address & PAGE_MASK {
            if self.state.contains(State::OUTSTANDING) {
                self.flush_page(self.write_address & PAGE_MASK)?;
            }
            self.load_page(address)?;
        }
        self.write_address = address;

        for &byte in data {
            self.state.insert(State::OUTSTANDING);
            self.buffer[self.write_address as usize % PAGE_SIZE] = byte;
            self.write_address += 0x01;

            if self.write_address % PAGE_SIZE as u16 == 0x00 {
                self.flush_page(self.write_address - PAGE_SIZE as u16)?;
                self.load_page(self.write_address)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RamFlash {
        cells: Vec<u8>,
    }

    impl RamFlash {
        fn erased() -> Self {
            RamFlash {
                cells: vec![0xFF; FLASH_END as usize],
            }
        }
    }

    impl Flash for RamFlash {
        fn read(&mut self, address: u16, buf: &mut [u8]) -> Result<()> {
            let start = address as usize;
            let cells = self
                .cells
                .get(start..start + buf.len())
                .ok_or(Error::Access)?;
            buf.copy_from_slice(cells);
            Ok(())
        }

        fn write_page(&mut self, address: u16, data: &[u8]) -> Result<()> {
            let start = address as usize;
            let cells = self
                .cells
                .get_mut(start..start + data.len())
                .ok_or(Error::Access)?;
            cells.copy_from_slice(data);
            Ok(())
        }
    }

    fn unlocked() -> Bootloader<RamFlash> {
        let mut boot = Bootloader::new(RamFlash::erased());
        boot.write(LOCK_ADDRESS, &[UNLOCK_KEY]).unwrap();
        boot
    }

    #[test]
    fn identifier_window() {
        let mut boot = Bootloader::new(RamFlash::erased());

        let mut id = [0x00; 8];
        boot.read(ID_ADDRESS, &mut id).unwrap();
        assert_eq!(&id, BOOT_MESSAGE);

        let mut tail = [0x00; 6];
        boot.read(ID_ADDRESS + 2, &mut tail).unwrap();
        assert_eq!(&tail, b"OTLOAD");

        // Reads past the end of the window are refused.
        let mut over = [0x00; 7];
        assert!(boot.read(ID_ADDRESS + 2, &mut over).is_err());
    }

    #[test]
    fn page_counter_needs_single_byte_read() {
        let mut boot = Bootloader::new(RamFlash::erased());

        let mut count = [0x00];
        boot.read(PAGE_COUNT_ADDRESS, &mut count).unwrap();
        assert_eq!(count[0], 0x00);

        let mut two = [0x00; 2];
        assert!(boot.read(PAGE_COUNT_ADDRESS, &mut two).is_err());
    }

    #[test]
    fn writes_require_unlock() {
        let mut boot = Bootloader::new(RamFlash::erased());
        assert!(boot.write(0x0000, &[0x42]).is_err());
    }

    #[test]
    fn lock_register_rejects_unknown_keys() {
        let mut boot = Bootloader::new(RamFlash::erased());
        assert!(boot.write(LOCK_ADDRESS, &[0x02]).is_err());
        assert!(boot.write(LOCK_ADDRESS, &[UNLOCK_KEY, UNLOCK_KEY]).is_err());
    }

    #[test]
    fn partial_page_commit_preserves_remainder() {
        let mut flash = RamFlash::erased();
        for cell in &mut flash.cells[..PAGE_SIZE] {
            *cell = 0xEE;
        }

        let mut boot = Bootloader::new(flash);
        boot.write(LOCK_ADDRESS, &[UNLOCK_KEY]).unwrap();
        boot.write(0x0000, &[0x11; 10]).unwrap();
        boot.write(LOCK_ADDRESS, &[LOCK_KEY]).unwrap();

        assert_eq!(boot.pages_written(), 1);
        let cells = boot.into_flash().cells;
        assert!(cells[..10].iter().all(|&cell| cell == 0x11));
        assert!(cells[10..PAGE_SIZE].iter().all(|&cell| cell == 0xEE));
    }

    #[test]
    fn boundary_crossing_flushes_completed_page() {
        let mut boot = unlocked();
        for chunk in 0..PAGE_SIZE / 8 {
            boot.write((chunk * 8) as u64, &[0x5A; 8]).unwrap();
        }

        // The full page went to flash without an explicit commit.
        assert_eq!(boot.pages_written(), 1);
        let mut readback = [0x00; 8];
        boot.flash.read(0x0000, &mut readback).unwrap();
        assert_eq!(readback, [0x5A; 8]);
    }

    #[test]
    fn page_jump_flushes_outstanding_page() {
        let mut boot = unlocked();
        boot.write(0x0000, &[0x21; 4]).unwrap();
        boot.write(0x1000, &[0x43; 4]).unwrap();
        boot.write(LOCK_ADDRESS, &[LOCK_KEY]).unwrap();

        assert_eq!(boot.pages_written(), 2);
        let cells = boot.into_flash().cells;
        assert!(cells[..4].iter().all(|&cell| cell == 0x21));
        assert!(cells[0x1000..0x1004].iter().all(|&cell| cell == 0x43));
        // The jump landed mid-flash; everything in between stays erased.
        assert!(cells[4..PAGE_SIZE].iter().all(|&cell| cell == 0xFF));
    }

    #[test]
    fn unlock_resets_the_session() {
        let mut boot = unlocked();
        boot.write(0x0000, &[0x77; PAGE_SIZE]).unwrap();
        assert_eq!(boot.pages_written(), 1);

        boot.write(LOCK_ADDRESS, &[UNLOCK_KEY]).unwrap();
        assert_eq!(boot.pages_written(), 0);
    }

    #[test]
    fn writes_must_stay_inside_flash() {
        let mut boot = unlocked();
        assert!(boot.write(u64::from(FLASH_END), &[0x00]).is_err());
        assert!(boot.write(u64::from(FLASH_END) - 8, &[0x00; 8]).is_err());
        // The very top byte is out of reach as well.
        assert!(boot.write(u64::from(FLASH_END) - 1, &[0x00]).is_err());
        boot.write(u64::from(FLASH_END) - 9, &[0x00; 8]).unwrap();
    }

    #[test]
    fn page_counter_saturates() {
        let mut boot = unlocked();
        for _ in 0..0x110 {
            boot.write(0x0000, &[0xA5; PAGE_SIZE]).unwrap();
        }
        assert_eq!(boot.pages_written(), 0xFF);
    }
}
