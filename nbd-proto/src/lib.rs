//! Transport-agnostic NBD protocol engine: newstyle fixed handshake, option
//! negotiation, and the transmission phase, generic over any
//! [`target::BlockTarget`] and any `Read + Write` byte stream.

pub mod constants;
pub mod error;
pub mod session;
pub mod target;

pub use error::{Error, Result};
pub use session::Session;
pub use target::BlockTarget;
