//! Durable key -> `Offset` storage, persisted as a single flat file and
//! rewritten atomically on every save.
//!
//! The on-disk format is a `u32` entry count followed by that many
//! `(keyLen: u32, key, valLen: u32, Offset-bytes)` records, all
//! big-endian-length-prefixed, matching the original file offset storage's
//! record layout. Saves go through a temp-file-then-rename so a crash
//! mid-write never corrupts the previous, still-valid snapshot.

use crate::errors::{StreamerError, StreamerResult};
use crate::offset::Offset;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{debug, warn};

/// A durable mapping from hypertable canonical name to its replication
/// offset. Implementations must make `save` atomic: a reader must never
/// observe a partially-written file.
#[async_trait::async_trait]
pub trait StateStorage: Send + Sync {
    async fn load(&self) -> StreamerResult<()>;
    async fn save(&self) -> StreamerResult<()>;
    fn get(&self, key: &str) -> Option<Offset>;
    fn set(&self, key: &str, offset: Offset);
    fn entries(&self) -> HashMap<String, Offset>;
}

/// File-backed `StateStorage`. Keeps the full offset map in memory and
/// flushes it to disk on `save`; `get`/`set` are synchronous in-memory
/// operations so the hot dispatch path never blocks on file I/O.
pub struct FileStateStorage {
    path: PathBuf,
    entries: RwLock<HashMap<String, Offset>>,
}

impl FileStateStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileStateStorage { path: path.into(), entries: RwLock::new(HashMap::new()) }
    }

    fn decode(bytes: &[u8]) -> StreamerResult<HashMap<String, Offset>> {
        let mut map = HashMap::new();
        if bytes.len() < 4 {
            return Err(StreamerError::storage("offset file too short to contain an entry count"));
        }
        let count = u32::from_be_bytes(bytes[0..4].try_into().unwrap());
        let mut pos = 4usize;
        for _ in 0..count {
            let key_len = read_u32(bytes, &mut pos)?;
            let key = read_bytes(bytes, &mut pos, key_len as usize)?;
            let key = String::from_utf8(key.to_vec())?;
            let val_len = read_u32(bytes, &mut pos)?;
            let val = read_bytes(bytes, &mut pos, val_len as usize)?;
            let offset = Offset::unmarshal(val)?;
            map.insert(key, offset);
        }
        Ok(map)
    }

    fn encode(entries: &HashMap<String, Offset>) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(entries.len() as u32).to_be_bytes());
        for (key, offset) in entries {
            let key_bytes = key.as_bytes();
            buf.extend_from_slice(&(key_bytes.len() as u32).to_be_bytes());
            buf.extend_from_slice(key_bytes);
            let val_bytes = offset.marshal();
            buf.extend_from_slice(&(val_bytes.len() as u32).to_be_bytes());
            buf.extend_from_slice(&val_bytes);
        }
        buf
    }
}

fn read_u32(bytes: &[u8], pos: &mut usize) -> StreamerResult<u32> {
    if *pos + 4 > bytes.len() {
        return Err(StreamerError::storage("offset file truncated reading a length prefix"));
    }
    let v = u32::from_be_bytes(bytes[*pos..*pos + 4].try_into().unwrap());
    *pos += 4;
    Ok(v)
}

fn read_bytes<'a>(bytes: &'a [u8], pos: &mut usize, len: usize) -> StreamerResult<&'a [u8]> {
    if *pos + len > bytes.len() {
        return Err(StreamerError::storage("offset file truncated reading a record"));
    }
    let slice = &bytes[*pos..*pos + len];
    *pos += len;
    Ok(slice)
}

#[async_trait::async_trait]
impl StateStorage for FileStateStorage {
    async fn load(&self) -> StreamerResult<()> {
        let path = self.path.clone();
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no offset file found, starting with an empty store");
                return Ok(());
            }
            Err(err) => return Err(StreamerError::from(err)),
        };
        if bytes.is_empty() {
            // A zero-length file is treated like "absent": some filesystems
            // leave an empty file behind after a crash between create and write.
            warn!(path = %path.display(), "offset file is zero-length, treating as empty");
            return Ok(());
        }
        let decoded = Self::decode(&bytes)?;
        *self.entries.write().unwrap() = decoded;
        Ok(())
    }

    async fn save(&self) -> StreamerResult<()> {
        let snapshot = self.entries.read().unwrap().clone();
        let bytes = Self::encode(&snapshot);
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&path, &bytes)).await??;
        Ok(())
    }

    fn get(&self, key: &str) -> Option<Offset> {
        self.entries.read().unwrap().get(key).cloned()
    }

    fn set(&self, key: &str, offset: Offset) {
        self.entries.write().unwrap().insert(key.to_string(), offset);
    }

    fn entries(&self) -> HashMap<String, Offset> {
        self.entries.read().unwrap().clone()
    }
}

/// Writes `bytes` to `path` by creating a temp file in the same directory,
/// then renaming it into place, so `path` always names either the old
/// complete file or the new complete file, never a partial write.
///
/// Resolves what was an open question upstream: if the parent directory
/// does not exist, it is created (with its parents) before the temp file is
/// opened, rather than surfacing an opaque "no such file or directory".
fn write_atomic(path: &Path, bytes: &[u8]) -> StreamerResult<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.flush()?;
    tmp.persist(path).map_err(|err| StreamerError::storage(format!("rename into {}: {}", path.display(), err.error)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lsn::Lsn;
    use tempfile::tempdir;

    #[tokio::test]
    async fn loading_missing_file_is_not_an_error() {
        let dir = tempdir().unwrap();
        let storage = FileStateStorage::new(dir.path().join("offsets.bin"));
        storage.load().await.unwrap();
        assert!(storage.entries().is_empty());
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("offsets.bin");
        let storage = FileStateStorage::new(&path);
        storage.set("public.metrics", Offset::new(Lsn(100)));
        storage.set("public.events", Offset::new(Lsn(200)));
        storage.save().await.unwrap();

        let reloaded = FileStateStorage::new(&path);
        reloaded.load().await.unwrap();
        assert_eq!(reloaded.get("public.metrics").unwrap().lsn, Lsn(100));
        assert_eq!(reloaded.get("public.events").unwrap().lsn, Lsn(200));
    }

    #[tokio::test]
    async fn zero_length_file_is_treated_as_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("offsets.bin");
        tokio::fs::write(&path, []).await.unwrap();
        let storage = FileStateStorage::new(&path);
        storage.load().await.unwrap();
        assert!(storage.entries().is_empty());
    }
}
