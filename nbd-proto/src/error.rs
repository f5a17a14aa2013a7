use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("client I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("client sent an invalid handshake: {0}")]
    BadHandshake(String),

    #[error("client requested an option we don't support: {0}")]
    NotImplemented(&'static str),

    #[error("client disconnected")]
    Disconnected,
}

pub type Result<T> = std::result::Result<T, Error>;
