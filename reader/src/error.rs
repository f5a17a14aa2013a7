use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("authentication failed after {0} attempt(s)")]
    AuthFailed(u32),

    #[error("USB I/O error: {0}")]
    UsbIoError(String),

    #[error("operation not implemented by the reader: {0}")]
    NotImplemented(&'static str),

    #[error("offset {0} length {1} is out of range for a {2}-byte card")]
    OutOfRange(usize, usize, usize),

    #[error("reader protocol error: {0}")]
    Protocol(String),

    #[error("no card present in the reader")]
    NoCard,

    #[error(transparent)]
    Oracle(#[from] auth_client::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
