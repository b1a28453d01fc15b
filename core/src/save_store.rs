//! Durable storage for persistent save memory
//!
//! File layout (little-endian):
//!
//! ```text
//! [LSSV][version:u32][len:u32][crc32:u32][payload...]
//! ```

use std::ffi::OsString;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::engine::SaveStorage;

pub const SAVE_MAGIC: [u8; 4] = *b"LSSV";
pub const SAVE_VERSION: u32 = 1;

/// Upper bound for a stored save memory image (battery RAM is small).
pub const MAX_SAVE_SIZE: usize = 1024 * 1024;

/// Save memory image stored in a single file.
///
/// Missing, foreign, truncated, or checksum-failing files load as "no save".
/// Writes go through a temp file and a rename so a crash mid-write keeps the
/// previous image.
#[derive(Debug, Clone)]
pub struct SaveFile {
    path: PathBuf,
}

impl SaveFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Save file named after a game inside `dir` (e.g. `<dir>/<name>.lssv`).
    pub fn in_dir(dir: &Path, name: &str) -> Self {
        Self::new(dir.join(format!("{name}.lssv")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> io::Result<PathBuf> {
        match self.path.file_name() {
            Some(name) => {
                let mut tmp_name = OsString::from(name);
                tmp_name.push(".tmp");
                Ok(self.path.with_file_name(tmp_name))
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "save file path has no file name",
            )),
        }
    }
}

fn parse_save(bytes: &[u8]) -> io::Result<Option<Vec<u8>>> {
    let mut cursor = io::Cursor::new(bytes);

    let mut magic = [0u8; 4];
    if cursor.read_exact(&mut magic).is_err() || magic != SAVE_MAGIC {
        return Ok(None);
    }

    let Ok(version) = cursor.read_u32::<LittleEndian>() else {
        return Ok(None);
    };
    if version != SAVE_VERSION {
        return Ok(None);
    }

    let (Ok(len), Ok(crc)) = (
        cursor.read_u32::<LittleEndian>(),
        cursor.read_u32::<LittleEndian>(),
    ) else {
        return Ok(None);
    };

    // Oversized entries are corruption worth surfacing; everything else
    // falls back to an empty save.
    if len as usize > MAX_SAVE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "save file entry exceeds MAX_SAVE_SIZE",
        ));
    }

    let mut data = vec![0u8; len as usize];
    if cursor.read_exact(&mut data).is_err() {
        return Ok(None);
    }

    if crc32fast::hash(&data) != crc {
        tracing::warn!("Save file checksum mismatch, ignoring");
        return Ok(None);
    }

    Ok(Some(data))
}

impl SaveStorage for SaveFile {
    fn load(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut file = match fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        parse_save(&bytes)
    }

    fn save(&mut self, data: &[u8]) -> io::Result<()> {
        if data.len() > MAX_SAVE_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "save data exceeds MAX_SAVE_SIZE",
            ));
        }

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp_path = self.tmp_path()?;

        let mut out = Vec::with_capacity(16 + data.len());
        out.extend_from_slice(&SAVE_MAGIC);
        out.write_u32::<LittleEndian>(SAVE_VERSION)?;
        out.write_u32::<LittleEndian>(data.len() as u32)?;
        out.write_u32::<LittleEndian>(crc32fast::hash(data))?;
        out.extend_from_slice(data);

        {
            let mut f = fs::File::create(&tmp_path)?;
            f.write_all(&out)?;
            f.sync_all()?;
        }

        #[cfg(windows)]
        {
            if self.path.exists() {
                // Windows rename fails if destination exists.
                fs::remove_file(&self.path)?;
            }
        }

        fs::rename(&tmp_path, &self.path)?;
        tracing::debug!(path = %self.path.display(), size = data.len(), "Save memory persisted");
        Ok(())
    }
}

/// In-memory storage whose clones share one image.
#[derive(Debug, Clone, Default)]
pub struct MemorySaveStore {
    inner: Arc<Mutex<MemoryInner>>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    data: Option<Vec<u8>>,
    writes: u32,
}

impl MemorySaveStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_data(data: Vec<u8>) -> Self {
        let store = Self::default();
        store.lock().data = Some(data);
        store
    }

    /// Currently stored image.
    pub fn data(&self) -> Option<Vec<u8>> {
        self.lock().data.clone()
    }

    /// Number of completed `save` calls.
    pub fn writes(&self) -> u32 {
        self.lock().writes
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl SaveStorage for MemorySaveStore {
    fn load(&mut self) -> io::Result<Option<Vec<u8>>> {
        Ok(self.lock().data.clone())
    }

    fn save(&mut self, data: &[u8]) -> io::Result<()> {
        let mut inner = self.lock();
        inner.data = Some(data.to_vec());
        inner.writes += 1;
        Ok(())
    }
}
