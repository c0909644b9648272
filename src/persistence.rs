//! Durable key-value storage used by the component cache.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{PipelineError, Result};

/// Default size limit for a single stored document (5 MiB).
pub const DEFAULT_MAX_BYTES: usize = 5 * 1024 * 1024;

pub trait PersistenceStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

#[derive(Default)]
pub struct MemoryStore {
    data: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PersistenceStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let data = self
            .data
            .lock()
            .map_err(|_| PipelineError::CacheIo("memory store poisoned".to_string()))?;
        Ok(data.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut data = self
            .data
            .lock()
            .map_err(|_| PipelineError::CacheIo("memory store poisoned".to_string()))?;
        data.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut data = self
            .data
            .lock()
            .map_err(|_| PipelineError::CacheIo("memory store poisoned".to_string()))?;
        data.remove(key);
        Ok(())
    }
}

/// One JSON file per key inside `dir`, each capped at `max_bytes`.
pub struct FileStore {
    dir: PathBuf,
    max_bytes: usize,
}

impl FileStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self::with_limit(dir, DEFAULT_MAX_BYTES)
    }

    pub fn with_limit(dir: impl AsRef<Path>, max_bytes: usize) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            max_bytes,
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let file: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", file))
    }
}

fn io_error(path: &Path, err: std::io::Error) -> PipelineError {
    PipelineError::CacheIo(format!("{}: {}", path.display(), err))
}

impl PersistenceStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.path_for(key);
        match fs::read_to_string(&path) {
            Ok(s) => Ok(Some(s)),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(&path, e)),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        if value.len() > self.max_bytes {
            return Err(PipelineError::CacheIo(format!(
                "document for \"{}\" is {} bytes, limit is {}",
                key,
                value.len(),
                self.max_bytes
            )));
        }
        fs::create_dir_all(&self.dir).map_err(|e| io_error(&self.dir, e))?;
        let path = self.path_for(key);
        fs::write(&path, value).map_err(|e| io_error(&path, e))
    }

    fn remove(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(&path, e)),
        }
    }
}
