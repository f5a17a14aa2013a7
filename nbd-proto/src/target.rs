//! The block-device shape the transmission phase is generic over, so this
//! crate never depends on how the bytes are actually produced.

use std::io;

pub trait BlockTarget {
    /// Total exported size in bytes. Takes `&mut self` since some backends
    /// (the USB reader) must query the device to learn it.
    fn size(&mut self) -> u64;

    /// Preferred I/O block size advertised to the client.
    fn preferred_block_size(&mut self) -> u32;

    fn read(&mut self, offset: u64, length: u32) -> io::Result<Vec<u8>>;

    fn write(&mut self, offset: u64, data: &[u8]) -> io::Result<()>;
}
