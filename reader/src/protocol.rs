//! Byte-level framing of the reader's command/response protocol: a tagged
//! command on bulk OUT, a tagged, possibly multi-chunk response on bulk IN.

use crate::error::{Error, Result};
use crate::transport::{UsbTransport, BULK_READ_LENGTH};

const COMMAND_TAG: u8 = 0xaa;
const COMMAND_TYPE_LONG: u8 = 0x42;
const RESPONSE_TAG: u8 = 0x55;
const RESPONSE_STATUS_SUCCESS: u8 = 0x5a;
const RESPONSE_STATUS_FAIL: u8 = 0xaf;

pub fn send_short(transport: &mut dyn UsbTransport, payload: &[u8]) -> Result<()> {
    let mut frame = Vec::with_capacity(1 + payload.len());
    frame.push(COMMAND_TAG);
    frame.extend_from_slice(payload);
    transport.bulk_write(&frame).map_err(Error::UsbIoError)
}

pub fn send_long(transport: &mut dyn UsbTransport, payload: &[u8]) -> Result<()> {
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.push(COMMAND_TAG);
    frame.push(COMMAND_TYPE_LONG);
    frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    frame.extend_from_slice(payload);
    transport.bulk_write(&frame).map_err(Error::UsbIoError)
}

/// One 64-byte chunk from bulk IN, asserting the response tag.
fn read_chunk(transport: &mut dyn UsbTransport) -> Result<Vec<u8>> {
    let mut buf = [0u8; BULK_READ_LENGTH];
    let n = transport.bulk_read(&mut buf).map_err(Error::UsbIoError)?;
    if n == 0 {
        return Err(Error::Protocol("empty response chunk".into()));
    }
    if buf[0] != RESPONSE_TAG {
        return Err(Error::Protocol(format!("unexpected response tag {:#x}", buf[0])));
    }
    Ok(buf[..n].to_vec())
}

/// Reads a simple (single-byte-status) response, e.g. `isAuthenticated`.
pub fn read_status(transport: &mut dyn UsbTransport) -> Result<bool> {
    let chunk = read_chunk(transport)?;
    match chunk.get(1) {
        Some(&RESPONSE_STATUS_SUCCESS) => Ok(true),
        Some(&RESPONSE_STATUS_FAIL) => Ok(false),
        _ => Err(Error::Protocol("malformed status response".into())),
    }
}

/// Reads a single data byte carried in the status-byte position, e.g.
/// `getCardType`.
pub fn read_value_byte(transport: &mut dyn UsbTransport) -> Result<u8> {
    let chunk = read_chunk(transport)?;
    chunk
        .get(1)
        .copied()
        .ok_or_else(|| Error::Protocol("missing value byte".into()))
}

/// Reads a long response: tag, status, LE-u16 length, then `length` bytes
/// of payload possibly spanning further 64-byte chunks.
pub fn read_long(transport: &mut dyn UsbTransport) -> Result<Vec<u8>> {
    let first = read_chunk(transport)?;
    match first.get(1) {
        Some(&RESPONSE_STATUS_FAIL) => Err(Error::Protocol("reader rejected command".into())),
        Some(&RESPONSE_STATUS_SUCCESS) => {
            let len = u16::from_le_bytes([first[2], first[3]]) as usize;
            let mut payload = first[4..].to_vec();
            while payload.len() < len {
                payload.extend_from_slice(&read_chunk(transport)?);
            }
            payload.truncate(len);
            Ok(payload)
        }
        _ => Err(Error::Protocol("malformed long response".into())),
    }
}

/// Strips the reader's fixed 10-byte header and 2-byte trailer surrounding
/// a frame/page payload embedded in a long-response body.
pub fn strip_response(raw: &[u8]) -> Result<&[u8]> {
    if raw.len() < 0xa + 2 {
        return Err(Error::Protocol("response too short to strip".into()));
    }
    Ok(&raw[0xa..raw.len() - 2])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct MockTransport {
        writes: Vec<Vec<u8>>,
        reads: VecDeque<Vec<u8>>,
    }

    impl MockTransport {
        fn new(reads: Vec<Vec<u8>>) -> Self {
            MockTransport { writes: Vec::new(), reads: reads.into() }
        }
    }

    impl UsbTransport for MockTransport {
        fn bulk_write(&mut self, data: &[u8]) -> std::result::Result<(), String> {
            self.writes.push(data.to_vec());
            Ok(())
        }

        fn bulk_read(&mut self, buf: &mut [u8]) -> std::result::Result<usize, String> {
            let chunk = self.reads.pop_front().ok_or_else(|| "no more mock chunks".to_string())?;
            buf[..chunk.len()].copy_from_slice(&chunk);
            Ok(chunk.len())
        }
    }

    #[test]
    fn send_short_prefixes_command_tag() {
        let mut t = MockTransport::new(vec![]);
        send_short(&mut t, &[0x40]).unwrap();
        assert_eq!(t.writes[0], vec![COMMAND_TAG, 0x40]);
    }

    #[test]
    fn send_long_encodes_type_and_le_length() {
        let mut t = MockTransport::new(vec![]);
        send_long(&mut t, &[1, 2, 3]).unwrap();
        assert_eq!(t.writes[0], vec![COMMAND_TAG, COMMAND_TYPE_LONG, 3, 0, 1, 2, 3]);
    }

    #[test]
    fn read_status_decodes_success_and_failure() {
        let mut t = MockTransport::new(vec![vec![RESPONSE_TAG, RESPONSE_STATUS_SUCCESS]]);
        assert!(read_status(&mut t).unwrap());
        let mut t = MockTransport::new(vec![vec![RESPONSE_TAG, RESPONSE_STATUS_FAIL]]);
        assert!(!read_status(&mut t).unwrap());
    }

    #[test]
    fn read_value_byte_reads_second_byte() {
        let mut t = MockTransport::new(vec![vec![RESPONSE_TAG, 0x02]]);
        assert_eq!(read_value_byte(&mut t).unwrap(), 0x02);
    }

    #[test]
    fn read_long_rejects_failure_status() {
        let mut t = MockTransport::new(vec![vec![RESPONSE_TAG, RESPONSE_STATUS_FAIL]]);
        assert!(read_long(&mut t).is_err());
    }

    #[test]
    fn read_long_single_chunk_round_trips_payload() {
        let payload = vec![0xAB, 0xCD, 0xEF];
        let mut chunk = vec![RESPONSE_TAG, RESPONSE_STATUS_SUCCESS];
        chunk.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        chunk.extend_from_slice(&payload);
        let mut t = MockTransport::new(vec![chunk]);
        assert_eq!(read_long(&mut t).unwrap(), payload);
    }

    #[test]
    fn strip_response_rejects_too_short_input() {
        assert!(strip_response(&[0u8; 5]).is_err());
    }

    #[test]
    fn strip_response_removes_header_and_trailer() {
        let mut raw = vec![0u8; 0xa];
        raw.extend_from_slice(&[1, 2, 3]);
        raw.extend_from_slice(&[0xff, 0xff]);
        assert_eq!(strip_response(&raw).unwrap(), &[1, 2, 3]);
    }
}
