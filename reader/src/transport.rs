//! The USB bulk-transfer primitives the framing layer rides on. Kept behind
//! a trait so `protocol`/`card` never touch `rusb` directly — mirrors how
//! the card-image model is generic over its backing store rather than a
//! concrete file.

use std::time::Duration;

use log::debug;

pub const VENDOR_ID: u16 = 0x054c;
pub const PRODUCT_ID: u16 = 0x02ea;
pub const INTERFACE: u8 = 0;
pub const BULK_OUT_ENDPOINT: u8 = 0x02;
pub const BULK_IN_ENDPOINT: u8 = 0x81;
pub const BULK_READ_LENGTH: usize = 64;

pub trait UsbTransport {
    fn bulk_write(&mut self, data: &[u8]) -> Result<(), String>;
    fn bulk_read(&mut self, buf: &mut [u8]) -> Result<usize, String>;
}

/// `rusb`-backed transport against the real card reader (VID 0x054c,
/// PID 0x02ea, interface 0).
pub struct RusbTransport {
    handle: rusb::DeviceHandle<rusb::Context>,
    timeout: Duration,
}

impl RusbTransport {
    pub fn open() -> Result<Self, String> {
        let context = rusb::Context::new().map_err(|e| e.to_string())?;
        let handle = context
            .open_device_with_vid_pid(VENDOR_ID, PRODUCT_ID)
            .ok_or_else(|| "no PlayStation memory card reader found".to_string())?;
        handle.claim_interface(INTERFACE).map_err(|e| e.to_string())?;
        debug!("claimed interface {INTERFACE} on reader {VENDOR_ID:04x}:{PRODUCT_ID:04x}");
        Ok(RusbTransport { handle, timeout: Duration::from_secs(5) })
    }
}

impl UsbTransport for RusbTransport {
    fn bulk_write(&mut self, data: &[u8]) -> Result<(), String> {
        self.handle
            .write_bulk(BULK_OUT_ENDPOINT, data, self.timeout)
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    fn bulk_read(&mut self, buf: &mut [u8]) -> Result<usize, String> {
        self.handle
            .read_bulk(BULK_IN_ENDPOINT, buf, self.timeout)
            .map_err(|e| e.to_string())
    }
}
