//! Append-only, on-disk cache of `seed -> (reply0, reply1, reply2)` records
//! produced by the authentication oracle, so a previously-seen seed never
//! needs a second round trip to the oracle.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::Path;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, info, warn};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("cache file I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("cache file corrupt: truncated record starting at offset {0}")]
    CacheCorrupt(u64),

    #[error("cache opened read-only")]
    ReadOnly,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Three oracle replies associated with one seed.
pub type Replies = [Vec<u8>; 3];

pub struct AuthCache {
    file: Option<File>,
    entries: HashMap<Vec<u8>, Replies>,
}

impl AuthCache {
    pub fn open(path: &Path, read_only: bool) -> Result<Self> {
        let mut read_handle = OpenOptions::new().read(true).create(true).write(!read_only).open(path)?;
        let mut buf = Vec::new();
        read_handle.read_to_end(&mut buf)?;
        let entries = parse_records(&buf)?;
        info!(
            "auth cache {:?} opened with {} record(s) ({})",
            path,
            entries.len(),
            if read_only { "read-only" } else { "read-write" }
        );

        let file = if read_only {
            None
        } else {
            Some(OpenOptions::new().append(true).create(true).open(path)?)
        };
        Ok(AuthCache { file, entries })
    }

    pub fn get(&self, seed: &[u8]) -> Option<&Replies> {
        self.entries.get(seed)
    }

    pub fn set(&mut self, seed: &[u8], replies: Replies) -> Result<()> {
        let file = self.file.as_mut().ok_or(Error::ReadOnly)?;
        write_record(file, seed, &replies)?;
        file.flush()?;
        debug!("cached auth reply for seed (len {})", seed.len());
        self.entries.insert(seed.to_vec(), replies);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn parse_records(buf: &[u8]) -> Result<HashMap<Vec<u8>, Replies>> {
    let mut entries = HashMap::new();
    let mut cursor = io::Cursor::new(buf);
    loop {
        let record_start = cursor.position();
        let key_len = match cursor.read_i16::<BigEndian>() {
            Ok(v) => v,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof && record_start as usize == buf.len() => break,
            Err(_) => return Err(Error::CacheCorrupt(record_start)),
        };
        let key = read_exact_or_corrupt(&mut cursor, key_len as usize, record_start)?;
        let value_count = cursor
            .read_i16::<BigEndian>()
            .map_err(|_| Error::CacheCorrupt(record_start))?;
        let mut values: Vec<Vec<u8>> = Vec::with_capacity(value_count as usize);
        for _ in 0..value_count {
            let item_len = cursor
                .read_i16::<BigEndian>()
                .map_err(|_| Error::CacheCorrupt(record_start))?;
            values.push(read_exact_or_corrupt(&mut cursor, item_len as usize, record_start)?);
        }
        if values.len() != 3 {
            warn!("auth cache record at offset {record_start} has {} values, expected 3", values.len());
        }
        let replies: Replies = [
            values.first().cloned().unwrap_or_default(),
            values.get(1).cloned().unwrap_or_default(),
            values.get(2).cloned().unwrap_or_default(),
        ];
        entries.insert(key, replies);
    }
    Ok(entries)
}

fn read_exact_or_corrupt(cursor: &mut io::Cursor<&[u8]>, len: usize, record_start: u64) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    cursor.read_exact(&mut buf).map_err(|_| Error::CacheCorrupt(record_start))?;
    Ok(buf)
}

fn write_record(file: &mut File, seed: &[u8], replies: &Replies) -> Result<()> {
    file.write_i16::<BigEndian>(seed.len() as i16)?;
    file.write_all(seed)?;
    file.write_i16::<BigEndian>(replies.len() as i16)?;
    for value in replies {
        file.write_i16::<BigEndian>(value.len() as i16)?;
        file.write_all(value)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn round_trips_a_record_across_reopen() {
        let file = NamedTempFile::new().unwrap();
        let path = file.path().to_path_buf();
        {
            let mut cache = AuthCache::open(&path, false).unwrap();
            assert!(cache.is_empty());
            cache
                .set(b"123456789", [vec![0u8; 9], vec![0u8; 9], vec![0u8; 9]])
                .unwrap();
        }
        let cache = AuthCache::open(&path, true).unwrap();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(b"123456789").unwrap()[0], vec![0u8; 9]);
    }

    #[test]
    fn later_write_to_same_seed_wins_on_replay() {
        let file = NamedTempFile::new().unwrap();
        let path = file.path().to_path_buf();
        {
            let mut cache = AuthCache::open(&path, false).unwrap();
            cache.set(b"seed", [vec![1], vec![1], vec![1]]).unwrap();
            cache.set(b"seed", [vec![2], vec![2], vec![2]]).unwrap();
        }
        let cache = AuthCache::open(&path, true).unwrap();
        assert_eq!(cache.get(b"seed").unwrap()[0], vec![2]);
    }

    #[test]
    fn read_only_cache_rejects_writes() {
        let file = NamedTempFile::new().unwrap();
        let mut cache = AuthCache::open(file.path(), true).unwrap();
        assert!(matches!(
            cache.set(b"seed", [vec![], vec![], vec![]]),
            Err(Error::ReadOnly)
        ));
    }

    #[test]
    fn truncated_record_is_corrupt() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&[0x00, 0x04, b'a', b'b']).unwrap();
        let err = AuthCache::open(file.path(), true).unwrap_err();
        assert!(matches!(err, Error::CacheCorrupt(0)));
    }
}
