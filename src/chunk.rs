//! A single numbered chunk and its sidecar files.

use std::path::{Path, PathBuf};

use anyhow::{bail, Error};
use nix::sys::stat::Mode;

use crate::file_lock::FileLock;
use crate::record_log::{LogCursor, RecordLog, RecordLogWriter};
use crate::stream::{Record, StreamIn};
use crate::tools;

/// One immutable on-disk chunk plus its sidecars.
///
/// `<id>.chunk` holds the payload, `<id>.status` the persistent read
/// cursor, `<id>.lock` the ownership lock of the draining process. Only
/// the process holding `<id>.lock` may advance the cursor or remove the
/// chunk; read-only instances take no lock and never persist progress.
pub struct Chunk {
    dir: PathBuf,
    id: u64,
    read_only: bool,
    lock: Option<FileLock>,
    cursor: Option<LogCursor>,
}

impl Chunk {
    pub fn new<P: AsRef<Path>>(dir: P, id: u64) -> Self {
        Self {
            dir: dir.as_ref().to_owned(),
            id,
            read_only: false,
            lock: None,
            cursor: None,
        }
    }

    pub fn new_ro<P: AsRef<Path>>(dir: P, id: u64) -> Self {
        Self {
            read_only: true,
            ..Self::new(dir, id)
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    fn chunk_path(&self) -> PathBuf {
        self.dir.join(format!("{}.chunk", self.id))
    }

    fn status_path(&self) -> PathBuf {
        self.dir.join(format!("{}.status", self.id))
    }

    fn status_lock_path(&self) -> PathBuf {
        self.dir.join(format!("{}.status.lock", self.id))
    }

    fn lock_path(&self) -> PathBuf {
        self.dir.join(format!("{}.lock", self.id))
    }

    /// Write `records` as the chunk payload and publish it atomically.
    ///
    /// Stages through a `<id>.tmp.*` file with mode 0644, then renames.
    /// A staging file orphaned by a crash is reaped by the next GC run.
    pub fn create(&mut self, records: &[Record]) -> Result<(), Error> {
        if self.cursor.is_some() || self.lock.is_some() {
            bail!("chunk {} is already loaded", self.id);
        }
        let chunk_path = self.chunk_path();
        if chunk_path.exists() {
            bail!("chunk file {:?} already exists", chunk_path);
        }
        let staging = tools::staging_path(&chunk_path)?;
        let mut writer = RecordLogWriter::create(&staging, Mode::from_bits_truncate(0o644))?;
        if let Err(err) = writer.write_records(records) {
            let _ = std::fs::remove_file(&staging);
            return Err(err);
        }
        if let Err(err) = writer.commit() {
            let _ = std::fs::remove_file(&staging);
            return Err(err);
        }
        if let Err(err) = std::fs::rename(&staging, &chunk_path) {
            let _ = std::fs::remove_file(&staging);
            bail!("unable to publish chunk {:?} - {}", chunk_path, err);
        }
        Ok(())
    }

    /// Attach to the on-disk chunk. Idempotent.
    ///
    /// Returns false without side effect when the payload does not
    /// exist or the ownership lock is held elsewhere.
    pub fn load(&mut self) -> Result<bool, Error> {
        if self.cursor.is_some() {
            return Ok(true);
        }
        let chunk_path = self.chunk_path();
        if self.read_only {
            return match Self::open_cursor(&chunk_path, &self.status_path(), true) {
                Ok(cursor) => {
                    self.cursor = Some(cursor);
                    Ok(true)
                }
                Err(err) if chunk_path.exists() => Err(err),
                Err(_) => Ok(false),
            };
        }
        if !chunk_path.exists() {
            return Ok(false);
        }
        // Note: this may leave a lock file behind for a chunk a peer
        // removes in the meantime; the next GC picks it up.
        let lock = match FileLock::try_acquire(self.lock_path())? {
            Some(lock) => lock,
            None => return Ok(false),
        };
        match Self::open_cursor(&chunk_path, &self.status_path(), false) {
            Ok(cursor) => {
                self.lock = Some(lock);
                self.cursor = Some(cursor);
                Ok(true)
            }
            // lost the race against a concurrent remove
            Err(_) if !chunk_path.exists() => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn open_cursor(
        chunk_path: &Path,
        status_path: &Path,
        read_only: bool,
    ) -> Result<LogCursor, Error> {
        let log = RecordLog::open(chunk_path)?;
        if read_only {
            log.cursor_ro(status_path)
        } else {
            log.cursor(status_path)
        }
    }

    pub fn read(&mut self) -> Result<Option<Record>, Error> {
        match self.cursor.as_mut() {
            Some(cursor) => cursor.read(),
            None => bail!("chunk {} is not loaded", self.id),
        }
    }

    pub fn read_chunk(&mut self, count: usize) -> Result<Option<Vec<Record>>, Error> {
        match self.cursor.as_mut() {
            Some(cursor) => cursor.read_chunk(count),
            None => bail!("chunk {} is not loaded", self.id),
        }
    }

    /// Persist the cursor position.
    pub fn commit(&mut self) -> Result<(), Error> {
        if self.read_only {
            bail!("unable to commit read-only chunk {}", self.id);
        }
        match self.cursor.as_mut() {
            Some(cursor) => cursor.commit(),
            None => bail!("chunk {} is not loaded", self.id),
        }
    }

    /// Remaining records. Loads lazily; 0 when the chunk is gone or
    /// cannot be inspected.
    pub fn lag(&mut self) -> Result<u64, Error> {
        match self.load() {
            Ok(true) => (),
            _ => return Ok(0),
        }
        match self.cursor.as_mut() {
            Some(cursor) => cursor.lag(),
            None => Ok(0),
        }
    }

    /// Remove leftover sidecars once the payload is gone.
    ///
    /// Requires the ownership lock, so it cannot race a peer that is
    /// about to load a chunk which just appeared.
    pub fn cleanup(&mut self) -> Result<(), Error> {
        if self.chunk_path().exists() {
            return Ok(());
        }
        if self.lock.is_none() {
            self.lock = match FileLock::try_acquire(self.lock_path())? {
                Some(lock) => Some(lock),
                None => return Ok(()),
            };
        }
        self.remove()
    }

    /// Delete the chunk and all sidecars, ignoring files already gone.
    pub fn remove(&mut self) -> Result<(), Error> {
        self.cursor = None;
        for path in [
            self.chunk_path(),
            self.status_path(),
            self.status_lock_path(),
            self.lock_path(),
        ] {
            match std::fs::remove_file(&path) {
                Ok(()) => (),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => (),
                Err(err) => bail!("unable to remove {:?} - {}", path, err),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn records(items: &[&str]) -> Vec<Record> {
        items.iter().map(|item| item.as_bytes().to_vec()).collect()
    }

    fn setup(name: &str) -> PathBuf {
        let dir = PathBuf::from(name);
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_create_load_commit() -> Result<(), Error> {
        let dir = setup(".test-chunk-basic");

        let mut chunk = Chunk::new(&dir, 1);
        assert!(!chunk.load()?); // nothing on disk yet
        chunk.create(&records(&["a", "b"]))?;
        assert!(chunk.load()?);
        assert_eq!(chunk.read()?, Some(b"a".to_vec()));
        chunk.commit()?;
        drop(chunk);

        // resume at the committed position
        let mut chunk = Chunk::new(&dir, 1);
        assert!(chunk.load()?);
        assert_eq!(chunk.read()?, Some(b"b".to_vec()));
        assert_eq!(chunk.read()?, None);

        // an uncommitted read is re-delivered
        drop(chunk);
        let mut chunk = Chunk::new(&dir, 1);
        assert!(chunk.load()?);
        assert_eq!(chunk.read()?, Some(b"b".to_vec()));

        chunk.remove()?;
        assert_eq!(std::fs::read_dir(&dir)?.count(), 0);

        let _ = std::fs::remove_dir_all(&dir);
        Ok(())
    }

    #[test]
    fn test_create_twice_fails() -> Result<(), Error> {
        let dir = setup(".test-chunk-create-twice");

        let mut chunk = Chunk::new(&dir, 1);
        chunk.create(&records(&["a"]))?;
        assert!(chunk.create(&records(&["a"])).is_err());

        let mut other = Chunk::new(&dir, 1);
        assert!(other.create(&records(&["b"])).is_err());

        let _ = std::fs::remove_dir_all(&dir);
        Ok(())
    }

    #[test]
    fn test_lock_excludes_peers() -> Result<(), Error> {
        let dir = setup(".test-chunk-lock");

        let mut chunk = Chunk::new(&dir, 1);
        chunk.create(&records(&["a"]))?;
        assert!(chunk.load()?);

        let mut peer = Chunk::new(&dir, 1);
        assert!(!peer.load()?);

        // read-only access works while the chunk is held
        let mut ro = Chunk::new_ro(&dir, 1);
        assert!(ro.load()?);
        assert_eq!(ro.read()?, Some(b"a".to_vec()));

        drop(chunk);
        assert!(peer.load()?);

        let _ = std::fs::remove_dir_all(&dir);
        Ok(())
    }

    #[test]
    fn test_cleanup() -> Result<(), Error> {
        let dir = setup(".test-chunk-cleanup");

        let mut chunk = Chunk::new(&dir, 1);
        chunk.create(&records(&["a"]))?;
        assert!(chunk.load()?);
        drop(chunk);

        // payload still there, cleanup must not touch anything
        let mut gc = Chunk::new(&dir, 1);
        gc.cleanup()?;
        assert!(dir.join("1.chunk").exists());

        // orphaned sidecars without payload get removed
        std::fs::remove_file(dir.join("1.chunk"))?;
        let mut gc = Chunk::new(&dir, 1);
        gc.cleanup()?;
        assert_eq!(std::fs::read_dir(&dir)?.count(), 0);

        let _ = std::fs::remove_dir_all(&dir);
        Ok(())
    }

    #[test]
    fn test_lag() -> Result<(), Error> {
        let dir = setup(".test-chunk-lag");

        let mut chunk = Chunk::new(&dir, 1);
        chunk.create(&records(&["a", "b", "c"]))?;
        assert_eq!(chunk.lag()?, 3);
        chunk.read()?;
        assert_eq!(chunk.lag()?, 2);

        // a removed chunk reports no lag
        let mut gone = Chunk::new_ro(&dir, 7);
        assert_eq!(gone.lag()?, 0);

        let _ = std::fs::remove_dir_all(&dir);
        Ok(())
    }
}
