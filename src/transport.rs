use crate::error::Result;

/// Blocking byte pipe connecting a BCP session to its peer.
///
/// BCP does not care what carries the bytes: on the host this is a pair of
/// USB control transfers, on the device an I2C slave module, and in tests an
/// in-memory channel. Each call either transfers the whole buffer or fails;
/// there are no partial results.
pub trait Transport {
    /// Fills `buf` completely with bytes from the peer.
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()>;

    /// Delivers all of `buf` to the peer.
    fn write_exact(&mut self, buf: &[u8]) -> Result<()>;
}
