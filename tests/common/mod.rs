//! Shared plumbing for the integration tests: an in-memory byte channel
//! standing in for the USB to I2C bridge, a RAM-backed flash double and an
//! Intel HEX record builder.

use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use cnc_control::{Device, Error, Flash, Memory, Result, Transport};

/// One end of a byte pipe between host and device.
pub struct Channel {
    tx: Sender<u8>,
    rx: Receiver<u8>,
}

/// Creates a connected transport pair: `(host end, device end)`.
pub fn channel_pair() -> (Channel, Channel) {
    let (host_tx, device_rx) = mpsc::channel();
    let (device_tx, host_rx) = mpsc::channel();
    (
        Channel {
            tx: host_tx,
            rx: host_rx,
        },
        Channel {
            tx: device_tx,
            rx: device_rx,
        },
    )
}

impl Transport for Channel {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        for byte in buf.iter_mut() {
            *byte = self
                .rx
                .recv_timeout(Duration::from_secs(5))
                .map_err(|_| Error::Transport)?;
        }
        Ok(())
    }

    fn write_exact(&mut self, buf: &[u8]) -> Result<()> {
        for &byte in buf {
            self.tx.send(byte).map_err(|_| Error::Transport)?;
        }
        Ok(())
    }
}

/// Serves BCP requests on a thread until the host hangs up, then hands the
/// memory handler back for inspection.
pub fn serve<M: Memory + Send + 'static>(transport: Channel, mut memory: M) -> JoinHandle<M> {
    thread::spawn(move || {
        let mut device = Device::new(transport);
        loop {
            match device.handle_request(&mut memory) {
                Ok(()) => {}
                Err(Error::Transport) => break,
                // A framing error drops the request; keep serving.
                Err(_) => {}
            }
        }
        memory
    })
}

/// RAM-backed stand-in for the microcontroller's flash, starting erased.
pub struct RamFlash {
    pub cells: Vec<u8>,
}

impl RamFlash {
    pub fn erased(size: usize) -> Self {
        RamFlash {
            cells: vec![0xFF; size],
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

/// Builds one Intel HEX record line with a correct checksum.
pub fn record(kind: u8, address: u16, data: &[u8]) -> String {
    let mut line = format!(":{:02X}{:04X}{:02X}", data.len(), address, kind);
    let mut sum = (data.len() as u8)
        .wrapping_add((address >> 8) as u8)
        .wrapping_add(address as u8)
        .wrapping_add(kind);

    for &byte in data {
        line.push_str(&format!("{:02X}", byte));
        sum = sum.wrapping_add(byte);
    }

    line.push_str(&format!("{:02X}\n", sum.wrapping_neg()));
    line
}

/// The end-of-file record every image is terminated with.
pub fn end_record() -> String {
    record(0x01, 0x0000, &[])
}
