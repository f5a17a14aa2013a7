//! One NBD client connection: newstyle fixed handshake, option negotiation,
//! then the transmission phase, all driven from `run`.

use std::io::{Read, Write};

use log::{debug, info, warn};

use crate::constants::*;
use crate::error::{Error, Result};
use crate::target::BlockTarget;

pub struct Session<S, T> {
    stream: S,
    target: T,
    read_only: bool,
    no_zeroes: bool,
}

enum Flow {
    Continue,
    Stop,
}

impl<S: Read + Write, T: BlockTarget> Session<S, T> {
    pub fn new(stream: S, target: T, read_only: bool) -> Self {
        Session { stream, target, read_only, no_zeroes: false }
    }

    /// Drives the connection end to end: handshake, option loop, and (if
    /// negotiation reaches transmission) the request/response loop.
    pub fn run(mut self) -> Result<()> {
        if self.handshake()? {
            self.serve_transmission()?;
        }
        Ok(())
    }

    fn transmit_flags(&self) -> u16 {
        let mut flags = TRANSMIT_FLAG_HAS_FLAGS | TRANSMIT_FLAG_CAN_MULTI_CONN;
        if self.read_only {
            flags |= TRANSMIT_FLAG_READ_ONLY;
        }
        flags
    }

    fn handshake(&mut self) -> Result<bool> {
        self.stream.write_all(&NBD_MAGIC_IHAVEOPT)?;
        self.stream
            .write_all(&(HANDSHAKE_FLAG_FIXED_NEWSTYLE | HANDSHAKE_FLAG_NO_ZEROES).to_be_bytes())?;
        self.stream.flush()?;

        let mut buf = [0u8; 4];
        self.stream.read_exact(&mut buf)?;
        let client_flags = u32::from_be_bytes(buf);
        if client_flags & !KNOWN_CLIENT_FLAGS != 0 {
            return Err(Error::BadHandshake(format!("unknown client flags {client_flags:#x}")));
        }
        self.no_zeroes = client_flags & CLIENT_FLAG_NO_ZEROES != 0;
        debug!("client handshake flags: {client_flags:#x}");
        self.option_loop()
    }

    fn read_option_header(&mut self) -> Result<(u32, u32)> {
        let mut magic = [0u8; 8];
        self.stream.read_exact(&mut magic)?;
        if magic != IHAVEOPT {
            return Err(Error::BadHandshake("missing IHAVEOPT magic".into()));
        }
        let mut hdr = [0u8; 8];
        self.stream.read_exact(&mut hdr)?;
        let option = u32::from_be_bytes(hdr[0..4].try_into().unwrap());
        let length = u32::from_be_bytes(hdr[4..8].try_into().unwrap());
        Ok((option, length))
    }

    fn send_option_reply(&mut self, option: u32, reply_type: u32, value: &[u8]) -> Result<()> {
        self.stream.write_all(&OPTION_REPLY_MAGIC)?;
        self.stream.write_all(&option.to_be_bytes())?;
        self.stream.write_all(&reply_type.to_be_bytes())?;
        self.stream.write_all(&(value.len() as u32).to_be_bytes())?;
        self.stream.write_all(value)?;
        self.stream.flush()?;
        Ok(())
    }

    fn send_info_replies(&mut self, option: u32) -> Result<()> {
        let mut export_info = Vec::with_capacity(12);
        export_info.extend_from_slice(&INFO_EXPORT.to_be_bytes());
        export_info.extend_from_slice(&self.target.size().to_be_bytes());
        export_info.extend_from_slice(&self.transmit_flags().to_be_bytes());
        self.send_option_reply(option, REP_INFO, &export_info)?;

        self.send_option_reply(option, REP_INFO, &INFO_NAME.to_be_bytes())?;

        let mut block_size_info = Vec::with_capacity(14);
        block_size_info.extend_from_slice(&INFO_BLOCK_SIZE.to_be_bytes());
        block_size_info.extend_from_slice(&1u32.to_be_bytes());
        block_size_info.extend_from_slice(&self.target.preferred_block_size().to_be_bytes());
        block_size_info.extend_from_slice(&MAX_BLOCK_SIZE.to_be_bytes());
        self.send_option_reply(option, REP_INFO, &block_size_info)?;

        self.send_option_reply(option, REP_ACK, &[])
    }

    /// Consumes options until `EXPORT_NAME`/`GO` transitions to transmission
    /// or the client aborts/disconnects.
    fn option_loop(&mut self) -> Result<bool> {
        loop {
            let (option, length) = self.read_option_header()?;
            if length > MAX_OPT_SIZE {
                self.send_option_reply(option, REP_ERR_TOO_BIG, &[])?;
                continue;
            }
            let mut body = vec![0u8; length as usize];
            self.stream.read_exact(&mut body)?;

            match option {
                OPT_EXPORT_NAME => {
                    debug!("client negotiated legacy EXPORT_NAME");
                    self.stream.write_all(&self.target.size().to_be_bytes())?;
                    self.stream.write_all(&self.transmit_flags().to_be_bytes())?;
                    if !self.no_zeroes {
                        self.stream.write_all(&[0u8; 124])?;
                    }
                    self.stream.flush()?;
                    return Ok(true);
                }
                OPT_ABORT => {
                    self.send_option_reply(option, REP_ACK, &[])?;
                    return Ok(false);
                }
                OPT_LIST => {
                    self.send_option_reply(option, REP_SERVER, &0u32.to_be_bytes())?;
                    self.send_option_reply(option, REP_ACK, &[])?;
                }
                OPT_INFO => {
                    self.send_info_replies(option)?;
                }
                OPT_GO => {
                    self.send_info_replies(option)?;
                    info!("client completed GO, entering transmission phase");
                    return Ok(true);
                }
                _ => {
                    warn!("client requested unsupported option {option}");
                    self.send_option_reply(option, REP_ERR_UNSUP, &[])?;
                }
            }
        }
    }

    fn send_simple_reply(&mut self, error: u32, handle: [u8; 8]) -> Result<()> {
        self.stream.write_all(&SIMPLE_REPLY_MAGIC)?;
        self.stream.write_all(&error.to_be_bytes())?;
        self.stream.write_all(&handle)?;
        self.stream.flush()?;
        Ok(())
    }

    fn serve_transmission(&mut self) -> Result<()> {
        loop {
            match self.handle_one_request()? {
                Flow::Continue => {}
                Flow::Stop => return Ok(()),
            }
        }
    }

    fn handle_one_request(&mut self) -> Result<Flow> {
        let mut header = [0u8; 28];
        match self.stream.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(Flow::Stop),
            Err(e) => return Err(e.into()),
        }
        if header[0..4] != REQUEST_MAGIC {
            return Err(Error::BadHandshake("bad request magic".into()));
        }
        let flags = u16::from_be_bytes(header[4..6].try_into().unwrap());
        let command = u16::from_be_bytes(header[6..8].try_into().unwrap());
        let mut handle = [0u8; 8];
        handle.copy_from_slice(&header[8..16]);
        let offset = u64::from_be_bytes(header[16..24].try_into().unwrap());
        let length = u32::from_be_bytes(header[24..28].try_into().unwrap());

        if flags & !KNOWN_CMD_FLAGS != 0 {
            self.send_simple_reply(NBD_ENOTSUP, handle)?;
            return Ok(Flow::Continue);
        }

        match command {
            CMD_READ => self.handle_read(flags, handle, offset, length),
            CMD_WRITE => self.handle_write(flags, handle, offset, length),
            CMD_DISC => {
                debug!("client sent DISC");
                Ok(Flow::Stop)
            }
            other => {
                warn!("unsupported command {other}");
                self.send_simple_reply(NBD_ENOTSUP, handle)?;
                Ok(Flow::Stop)
            }
        }
    }

    fn handle_read(&mut self, flags: u16, handle: [u8; 8], offset: u64, length: u32) -> Result<Flow> {
        if flags & CMD_FLAG_DF != 0 {
            self.send_simple_reply(NBD_ENOTSUP, handle)?;
            return Ok(Flow::Continue);
        }
        if length > MAX_BLOCK_SIZE {
            self.send_simple_reply(NBD_EINVAL, handle)?;
            return Ok(Flow::Continue);
        }
        match self.target.read(offset, length) {
            Ok(data) if data.len() == length as usize => {
                self.send_simple_reply(0, handle)?;
                self.stream.write_all(&data)?;
                self.stream.flush()?;
            }
            Ok(_) => {
                warn!("short read at offset {offset} length {length}");
                self.send_simple_reply(NBD_EIO, handle)?;
            }
            Err(e) => {
                warn!("read error at offset {offset} length {length}: {e}");
                self.send_simple_reply(NBD_EIO, handle)?;
            }
        }
        Ok(Flow::Continue)
    }

    fn handle_write(&mut self, _flags: u16, handle: [u8; 8], offset: u64, length: u32) -> Result<Flow> {
        if self.read_only {
            self.send_simple_reply(NBD_EPERM, handle)?;
            return Ok(Flow::Continue);
        }
        if length > MAX_BLOCK_SIZE {
            self.send_simple_reply(NBD_EINVAL, handle)?;
            return Ok(Flow::Continue);
        }
        let mut body = vec![0u8; length as usize];
        self.stream.read_exact(&mut body)?;

        match self.target.write(offset, &body) {
            Ok(()) => self.send_simple_reply(0, handle)?,
            Err(e) => {
                warn!("write error at offset {offset} length {length}: {e}");
                self.send_simple_reply(NBD_EIO, handle)?;
            }
        }
        Ok(Flow::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    struct MemTarget {
        bytes: Vec<u8>,
    }

    impl BlockTarget for MemTarget {
        fn size(&mut self) -> u64 {
            self.bytes.len() as u64
        }

        fn preferred_block_size(&mut self) -> u32 {
            4096
        }

        fn read(&mut self, offset: u64, length: u32) -> std::io::Result<Vec<u8>> {
            let offset = offset as usize;
            let length = length as usize;
            Ok(self.bytes[offset..offset + length].to_vec())
        }

        fn write(&mut self, offset: u64, data: &[u8]) -> std::io::Result<()> {
            let offset = offset as usize;
            self.bytes[offset..offset + data.len()].copy_from_slice(data);
            Ok(())
        }
    }

    /// A duplex in-memory stream: reads come from `input`, writes append to
    /// `output`, modeling the two independent directions of a TCP socket.
    struct DuplexMem {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl Read for DuplexMem {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for DuplexMem {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.output.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn client_handshake_then_abort() -> Vec<u8> {
        let mut input = Vec::new();
        input.extend_from_slice(&(CLIENT_FLAG_FIXED_NEWSTYLE | CLIENT_FLAG_NO_ZEROES).to_be_bytes());
        input.extend_from_slice(&IHAVEOPT);
        input.extend_from_slice(&OPT_ABORT.to_be_bytes());
        input.extend_from_slice(&0u32.to_be_bytes());
        input
    }

    #[test]
    fn handshake_then_abort_closes_without_transmission() {
        let stream = DuplexMem { input: Cursor::new(client_handshake_then_abort()), output: Vec::new() };
        let target = MemTarget { bytes: vec![0u8; 1024] };
        let session = Session::new(stream, target, false);
        session.run().unwrap();
    }

    #[test]
    fn read_request_returns_exact_bytes() {
        let mut input = Vec::new();
        input.extend_from_slice(&(CLIENT_FLAG_FIXED_NEWSTYLE | CLIENT_FLAG_NO_ZEROES).to_be_bytes());
        input.extend_from_slice(&IHAVEOPT);
        input.extend_from_slice(&OPT_GO.to_be_bytes());
        let mut go_body = Vec::new();
        go_body.extend_from_slice(&0u32.to_be_bytes()); // name length 0
        go_body.extend_from_slice(&0u16.to_be_bytes()); // info request count 0
        input.extend_from_slice(&(go_body.len() as u32).to_be_bytes());
        input.extend_from_slice(&go_body);

        // one READ request for the first 16 bytes
        input.extend_from_slice(&REQUEST_MAGIC);
        input.extend_from_slice(&0u16.to_be_bytes());
        input.extend_from_slice(&CMD_READ.to_be_bytes());
        input.extend_from_slice(&[0xAA; 8]);
        input.extend_from_slice(&0u64.to_be_bytes());
        input.extend_from_slice(&16u32.to_be_bytes());

        input.extend_from_slice(&REQUEST_MAGIC);
        input.extend_from_slice(&0u16.to_be_bytes());
        input.extend_from_slice(&CMD_DISC.to_be_bytes());
        input.extend_from_slice(&[0xBB; 8]);
        input.extend_from_slice(&0u64.to_be_bytes());
        input.extend_from_slice(&0u32.to_be_bytes());

        let mut bytes = vec![0u8; 1024];
        for (i, b) in bytes.iter_mut().enumerate().take(16) {
            *b = i as u8;
        }
        let stream = DuplexMem { input: Cursor::new(input), output: Vec::new() };
        let target = MemTarget { bytes };
        let session = Session::new(stream, target, false);
        session.run().unwrap();
    }
}
