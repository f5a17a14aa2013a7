use thiserror::Error;

/// Errors produced while decoding or mutating a PS1 card image.
#[derive(Error, Debug)]
pub enum Error {
    #[error("card image length {0} does not match expected {1}")]
    BadLength(usize, usize),

    #[error("superblock is missing the 'MC' magic")]
    BadMagic,

    #[error("header {0} failed its XOR checksum")]
    HeaderCorrupt(u8),

    #[error("chain starting at block {0} contains a loop")]
    ChainLoop(u8),

    #[error("block {0} is already allocated")]
    AlreadyAllocated(u8),

    #[error("block {0} is not allocated")]
    NotAllocated(u8),

    #[error("offset {0} length {1} is out of range for a {2}-byte card")]
    OutOfRange(usize, usize, usize),

    #[error("save at block {0} declares size {declared} but its chain implies {actual}", declared = .1, actual = .2)]
    SizeMismatch(u8, u32, u32),

    #[error("write would extend the save past its allocated size")]
    WouldGrow,

    #[error("block index {0} is out of range (must be in 1..16)")]
    BadBlockIndex(u8),
}

pub type Result<T> = std::result::Result<T, Error>;
