//! Driver for the USB PlayStation memory card reader: framed
//! command/response protocol, the authentication dance required for PS2
//! page access, and byte-granular read/write translation.

pub mod card;
pub mod error;
pub mod protocol;
pub mod transport;

pub use card::{Card, CardType};
pub use error::{Error, Result};
pub use transport::{RusbTransport, UsbTransport};
