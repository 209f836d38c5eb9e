//! Small persistent key/value store with optimistic commit.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, format_err, Error};

use crate::file_lock::lock_file_timeout;
use crate::tools;

const COMMIT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// Persistent string to integer map stored as a single JSON file.
///
/// Writers stage changes locally and publish them with `commit`, which
/// merges the staged keys into the latest on-disk state under the store
/// lock. Readers never take the lock.
pub struct MetaStore {
    path: PathBuf,
    data: HashMap<String, i64>,
    staged: HashMap<String, i64>,
}

impl MetaStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref().to_owned();
        let data = Self::load(&path)?;
        Ok(Self {
            path,
            data,
            staged: HashMap::new(),
        })
    }

    fn load(path: &Path) -> Result<HashMap<String, i64>, Error> {
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(err) => bail!("unable to read meta file {:?} - {}", path, err),
        };
        serde_json::from_slice(&data)
            .map_err(|err| format_err!("corrupt meta file {:?} - {}", path, err))
    }

    pub fn get(&self, key: &str) -> Option<i64> {
        self.staged.get(key).or_else(|| self.data.get(key)).copied()
    }

    /// Stage a value; peers see it only after `commit`.
    pub fn set(&mut self, key: &str, value: i64) {
        self.staged.insert(key.to_string(), value);
    }

    pub fn commit(&mut self) -> Result<(), Error> {
        if self.staged.is_empty() {
            return Ok(());
        }
        let staged = std::mem::take(&mut self.staged);
        self.update(|data| {
            for (key, value) in &staged {
                data.insert(key.clone(), *value);
            }
        })?;
        Ok(())
    }

    /// Read-modify-write of the whole map under the store lock.
    pub fn update<F, R>(&mut self, func: F) -> Result<R, Error>
    where
        F: FnOnce(&mut HashMap<String, i64>) -> R,
    {
        let _guard = lock_file_timeout(tools::lock_path(&self.path), COMMIT_LOCK_TIMEOUT)?;
        let mut data = Self::load(&self.path)?;
        let result = func(&mut data);
        let serialized = serde_json::to_vec(&data)?;
        tools::replace_file(&self.path, &serialized)?;
        self.data = data;
        Ok(result)
    }

    /// Allocate the next chunk id.
    ///
    /// Ids are strictly increasing and never reused, even when the
    /// allocating process crashes before using one.
    pub fn next_id(&mut self) -> Result<u64, Error> {
        let id = self.update(|data| {
            let id = data.get("id").copied().unwrap_or(0) + 1;
            data.insert("id".to_string(), id);
            id
        })?;
        Ok(id as u64)
    }
}
