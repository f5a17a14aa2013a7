//! Client for the external authentication oracle: given a 9-byte seed
//! pulled from the card reader during its challenge/response dance, returns
//! three 9-byte replies. Results are cached on disk via `auth-cache` so a
//! previously-seen seed costs no round trip.

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use log::{debug, info, warn};
use thiserror::Error;

use auth_cache::AuthCache;

pub const SEED_LENGTH: usize = 9;

#[derive(Error, Debug)]
pub enum Error {
    #[error("seed length {0} does not match expected {SEED_LENGTH}")]
    BadSeedLen(usize),

    #[error("oracle connection I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("oracle returned a short reply")]
    ShortReply,

    #[error(transparent)]
    Cache(#[from] auth_cache::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Three 9-byte values the reader's authentication dance expects back.
pub type Replies = [[u8; SEED_LENGTH]; 3];

pub trait AuthOracle {
    fn authenticate(&mut self, seed: &[u8; SEED_LENGTH]) -> Result<Replies>;
}

const GREETING: [u8; 8] = [0x55, 0x5a, 0x0e, 0x00, 0xff, 0xff, 0xff, 0x2b];
const GREETING_TRAILER: u8 = 0xff;
const REPLY_FRAME_LEN: usize = 0x12;
const REPLY_PAYLOAD_START: usize = 7;
const REPLY_PAYLOAD_END: usize = REPLY_FRAME_LEN - 2;

/// Talks to the oracle over one lazily-established TCP connection, backed
/// by an on-disk cache of seeds already seen.
pub struct SockAuthenticator<A: ToSocketAddrs> {
    addr: A,
    stream: Option<TcpStream>,
    cache: Option<AuthCache>,
}

impl<A: ToSocketAddrs> SockAuthenticator<A> {
    pub fn new(addr: A, cache: Option<AuthCache>) -> Self {
        SockAuthenticator { addr, stream: None, cache }
    }

    fn connection(&mut self) -> Result<&mut TcpStream> {
        if self.stream.is_none() {
            info!("connecting to authentication oracle");
            let stream = TcpStream::connect(&self.addr)?;
            stream.set_read_timeout(Some(Duration::from_secs(10)))?;
            stream.set_write_timeout(Some(Duration::from_secs(10)))?;
            self.stream = Some(stream);
        }
        Ok(self.stream.as_mut().unwrap())
    }

    fn query_oracle(&mut self, seed: &[u8; SEED_LENGTH]) -> Result<Replies> {
        let stream = self.connection()?;
        let mut frame = Vec::with_capacity(GREETING.len() + SEED_LENGTH + 1);
        frame.extend_from_slice(&GREETING);
        frame.extend_from_slice(seed);
        frame.push(GREETING_TRAILER);
        stream.write_all(&frame)?;

        let mut replies: Replies = [[0u8; SEED_LENGTH]; 3];
        for reply in replies.iter_mut() {
            let mut buf = [0u8; REPLY_FRAME_LEN];
            stream.read_exact(&mut buf).map_err(|e| {
                if e.kind() == io::ErrorKind::UnexpectedEof {
                    Error::ShortReply
                } else {
                    Error::Io(e)
                }
            })?;
            reply.copy_from_slice(&buf[REPLY_PAYLOAD_START..REPLY_PAYLOAD_END]);
        }
        Ok(replies)
    }
}

impl<A: ToSocketAddrs> AuthOracle for SockAuthenticator<A> {
    fn authenticate(&mut self, seed: &[u8; SEED_LENGTH]) -> Result<Replies> {
        if let Some(cache) = &self.cache {
            if let Some(replies) = cache.get(seed) {
                debug!("authentication cache hit");
                return Ok(replies_from_cache(replies));
            }
        }
        let replies = self.query_oracle(seed)?;
        if let Some(cache) = &mut self.cache {
            cache.set(seed, replies_to_cache(&replies))?;
        }
        Ok(replies)
    }
}

/// Stand-in used when no oracle is reachable: waits out the reader's own
/// authentication timeout, then returns zero-filled replies so the dance
/// fails cleanly instead of hanging.
pub struct CachedOnlyAuthenticator {
    cache: AuthCache,
}

impl CachedOnlyAuthenticator {
    pub fn new(cache: AuthCache) -> Self {
        CachedOnlyAuthenticator { cache }
    }
}

impl AuthOracle for CachedOnlyAuthenticator {
    fn authenticate(&mut self, seed: &[u8; SEED_LENGTH]) -> Result<Replies> {
        if let Some(replies) = self.cache.get(seed) {
            return Ok(replies_from_cache(replies));
        }
        warn!("no cached reply for seed and no oracle configured; stalling then returning zeroes");
        std::thread::sleep(Duration::from_secs(1));
        Ok([[0u8; SEED_LENGTH]; 3])
    }
}

fn replies_from_cache(values: &auth_cache::Replies) -> Replies {
    let mut out = [[0u8; SEED_LENGTH]; 3];
    for (dst, src) in out.iter_mut().zip(values.iter()) {
        let len = src.len().min(SEED_LENGTH);
        dst[..len].copy_from_slice(&src[..len]);
    }
    out
}

fn replies_to_cache(values: &Replies) -> auth_cache::Replies {
    [values[0].to_vec(), values[1].to_vec(), values[2].to_vec()]
}

pub fn check_seed_len(seed: &[u8]) -> Result<()> {
    if seed.len() != SEED_LENGTH {
        return Err(Error::BadSeedLen(seed.len()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_wrong_length_seed() {
        assert!(matches!(check_seed_len(&[0u8; 8]), Err(Error::BadSeedLen(8))));
        assert!(check_seed_len(&[0u8; 9]).is_ok());
    }

    #[test]
    fn cached_only_authenticator_returns_cached_value_without_sleeping() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.bin");
        let mut cache = AuthCache::open(&path, false).unwrap();
        cache.set(b"123456789", [vec![9u8; 9], vec![8u8; 9], vec![7u8; 9]]).unwrap();
        let mut auth = CachedOnlyAuthenticator::new(cache);
        let seed = *b"123456789";
        let replies = auth.authenticate(&seed).unwrap();
        assert_eq!(replies[0], [9u8; 9]);
        assert_eq!(replies[2], [7u8; 9]);
    }
}
