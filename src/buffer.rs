//! Directory-level coordination of chunked fan-out reads.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Error};
use lazy_static::lazy_static;
use regex::Regex;

use crate::chunk::Chunk;
use crate::file_lock::FileLock;
use crate::meta::MetaStore;
use crate::stream::{Record, StreamFactory, StreamIn};
use crate::tools;

/// Minimum age of an orphaned staging file before GC deletes it.
const STALE_STAGING_SECS: i64 = 600;

const DEFAULT_GC_PERIOD_SECS: i64 = 300;

lazy_static! {
    static ref CHUNK_FILE_REGEX: Regex = Regex::new(r"^(\d+)\.chunk$").unwrap();
    static ref SIDECAR_FILE_REGEX: Regex =
        Regex::new(r"^(\d+)\.(?:lock|status|status\.lock)$").unwrap();
    static ref STAGING_FILE_REGEX: Regex = Regex::new(r"^\d+\.tmp\.\d+\.\d+\.\d+$").unwrap();
}

/// Buffer tuning knobs.
#[derive(Clone)]
pub struct BufferOptions {
    gc_period_secs: i64,
    read_only: bool,
    read_lock: bool,
}

impl BufferOptions {
    pub fn new() -> Self {
        Self {
            gc_period_secs: DEFAULT_GC_PERIOD_SECS,
            read_only: false,
            read_lock: true,
        }
    }

    /// Minimum interval between GC runs.
    pub fn gc_period_secs(mut self, secs: i64) -> Self {
        self.gc_period_secs = secs;
        self
    }

    /// Disable all mutation: no locks, no writes, no id allocation, no
    /// GC, no commit. With no loadable chunk left, reads fall through
    /// to a fresh upstream instance.
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Serialize refills across processes (default on). Turn off for
    /// upstream streams that do their own locking.
    pub fn read_lock(mut self, read_lock: bool) -> Self {
        self.read_lock = read_lock;
        self
    }
}

impl Default for BufferOptions {
    fn default() -> Self {
        Self::new()
    }
}

enum Source {
    Buffered(Chunk),
    Passthrough(Box<dyn StreamIn>),
}

enum Refill {
    Loaded(Chunk),
    Retry,
    Exhausted,
}

/// Fan-out buffer over a shared directory.
///
/// Many cooperating processes open the same directory; each drains
/// whole chunks under an exclusive per-chunk lock and refills the
/// directory from the upstream stream when no chunk is available.
/// Chunks drained to the end stay locked until `commit`, which removes
/// them and persists the cursor of the chunk currently being read.
pub struct Buffer {
    dir: PathBuf,
    in_cb: StreamFactory,
    options: BufferOptions,
    current: Option<Source>,
    prev_chunks: HashMap<u64, Chunk>,
    uncommitted_count: usize,
    gc_timestamp_cached: Option<i64>,
}

impl Buffer {
    /// Open the buffer over `dir`, creating the directory when missing
    /// (read-write mode only).
    pub fn open<P: AsRef<Path>>(
        dir: P,
        in_cb: StreamFactory,
        options: BufferOptions,
    ) -> Result<Self, Error> {
        let dir = dir.as_ref().to_owned();
        if !dir.is_dir() {
            if options.read_only {
                bail!("buffer directory {:?} does not exist", dir);
            }
            std::fs::create_dir_all(&dir).map_err(|err| {
                format_err!("unable to create buffer directory {:?} - {}", dir, err)
            })?;
        }
        let mut buffer = Self {
            dir,
            in_cb,
            options,
            current: None,
            prev_chunks: HashMap::new(),
            uncommitted_count: 0,
            gc_timestamp_cached: None,
        };
        if !buffer.options.read_only {
            buffer.try_gc()?;
        }
        Ok(buffer)
    }

    fn meta_path(&self) -> PathBuf {
        self.dir.join("meta")
    }

    fn read_lock_path(&self) -> PathBuf {
        self.dir.join("read_lock")
    }

    /// All chunk ids currently in the directory, oldest first.
    fn chunk_ids(&self) -> Result<Vec<u64>, Error> {
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = match name.to_str() {
                Some(name) => name,
                None => continue,
            };
            if let Some(caps) = CHUNK_FILE_REGEX.captures(name) {
                if let Ok(id) = caps[1].parse() {
                    ids.push(id);
                }
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    /// Try to take ownership of an existing chunk, oldest id first.
    ///
    /// Chunks this process has drained since the last commit are
    /// skipped, chunks locked by a peer as well.
    fn claim_existing(&mut self) -> Result<Option<Chunk>, Error> {
        for id in self.chunk_ids()? {
            if self.prev_chunks.contains_key(&id) {
                continue;
            }
            let mut chunk = if self.options.read_only {
                Chunk::new_ro(&self.dir, id)
            } else {
                Chunk::new(&self.dir, id)
            };
            if chunk.load()? {
                return Ok(Some(chunk));
            }
        }
        Ok(None)
    }

    /// Pull one batch from upstream and materialize it as a new chunk.
    fn refill(&mut self) -> Result<Refill, Error> {
        let read_lock = if self.options.read_lock {
            match FileLock::try_acquire(self.read_lock_path())? {
                Some(lock) => Some(lock),
                // a peer is refilling; its chunk is about to appear
                None => return Ok(Refill::Retry),
            }
        } else {
            None
        };
        let mut upstream = (self.in_cb)()?;
        let records = match upstream.read_chunk(self.uncommitted_count + 1)? {
            Some(records) => records,
            None => return Ok(Refill::Exhausted),
        };
        let new_id = MetaStore::open(self.meta_path())?.next_id()?;
        let mut chunk = Chunk::new(&self.dir, new_id);
        chunk.create(&records)?;
        upstream.commit()?;
        drop(read_lock);
        // the chunk is up for grabs the moment it is renamed in, a peer
        // may lock it before we do
        if chunk.load()? {
            Ok(Refill::Loaded(chunk))
        } else {
            Ok(Refill::Retry)
        }
    }

    fn next_chunk(&mut self) -> Result<Option<Chunk>, Error> {
        loop {
            if let Some(chunk) = self.claim_existing()? {
                return Ok(Some(chunk));
            }
            if self.options.read_only {
                return Ok(None);
            }
            match self.refill()? {
                Refill::Loaded(chunk) => return Ok(Some(chunk)),
                Refill::Retry => continue,
                Refill::Exhausted => return Ok(None),
            }
        }
    }

    /// Remaining records buffered in the directory, excluding chunks
    /// this process has already drained.
    pub fn buffer_lag(&mut self) -> Result<u64, Error> {
        let current_id = match &self.current {
            Some(Source::Buffered(chunk)) => Some(chunk.id()),
            _ => None,
        };
        let mut total = 0;
        for id in self.chunk_ids()? {
            if self.prev_chunks.contains_key(&id) {
                continue;
            }
            if Some(id) == current_id {
                if let Some(Source::Buffered(chunk)) = self.current.as_mut() {
                    total += chunk.lag()?;
                }
            } else {
                total += Chunk::new_ro(&self.dir, id).lag()?;
            }
        }
        Ok(total)
    }

    /// Run GC if the rate limit allows it.
    ///
    /// The first process to ever touch the meta file only arms the
    /// timer, so concurrent constructors do not stampede. The cached
    /// timestamp keeps the read path from consulting meta every time.
    fn try_gc(&mut self) -> Result<(), Error> {
        let now = tools::epoch_i64();
        let gc_period = self.options.gc_period_secs;
        if let Some(cached) = self.gc_timestamp_cached {
            if now <= cached + gc_period {
                return Ok(());
            }
        }
        let mut meta = MetaStore::open(self.meta_path())?;
        let (stamp, run) = meta.update(|data| match data.get("gc_timestamp").copied() {
            None => {
                data.insert("gc_timestamp".to_string(), now);
                (now, false)
            }
            Some(ts) if now > ts + gc_period => {
                data.insert("gc_timestamp".to_string(), now);
                (now, true)
            }
            Some(ts) => (ts, false),
        })?;
        self.gc_timestamp_cached = Some(stamp);
        if run {
            self.gc()?;
        }
        Ok(())
    }

    /// Remove leftovers from the buffer directory: orphaned sidecars,
    /// stale staging files and foreign files. Live chunk payloads are
    /// never touched.
    pub fn gc(&mut self) -> Result<(), Error> {
        if self.options.read_only {
            bail!("unable to run GC on a read-only buffer");
        }
        let now = tools::epoch_i64();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name_os = entry.file_name();
            let name = name_os.to_string_lossy();
            if name == "read_lock" || name.starts_with("meta") {
                continue;
            }
            if CHUNK_FILE_REGEX.is_match(&name) {
                continue;
            }
            if let Some(caps) = SIDECAR_FILE_REGEX.captures(&name) {
                if let Ok(id) = caps[1].parse() {
                    if let Err(err) = Chunk::new(&self.dir, id).cleanup() {
                        log::warn!("cleanup of chunk {} sidecars failed - {}", id, err);
                    }
                }
                continue;
            }
            if STAGING_FILE_REGEX.is_match(&name) {
                let stat = match nix::sys::stat::stat(&entry.path()) {
                    Ok(stat) => stat,
                    Err(_) => continue, // vanished mid-scan
                };
                if now - stat.st_mtime > STALE_STAGING_SECS {
                    log::info!("removing stale staging file {:?}", entry.path());
                    let _ = std::fs::remove_file(entry.path());
                }
                continue;
            }
            log::warn!("removing unknown file {:?} from buffer directory", entry.path());
            if let Err(err) = std::fs::remove_file(entry.path()) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    log::warn!("unable to remove {:?} - {}", entry.path(), err);
                }
            }
        }
        Ok(())
    }
}

impl StreamIn for Buffer {
    fn read_chunk(&mut self, count: usize) -> Result<Option<Vec<Record>>, Error> {
        if !self.options.read_only {
            self.try_gc()?;
        }
        let mut result = Vec::new();
        let mut remaining = count;
        while remaining > 0 {
            if self.current.is_none() {
                match self.next_chunk()? {
                    Some(chunk) => self.current = Some(Source::Buffered(chunk)),
                    None if self.options.read_only => {
                        self.current = Some(Source::Passthrough((self.in_cb)()?));
                    }
                    None => break,
                }
            }
            let mut chunk_drained = false;
            match self.current.as_mut() {
                Some(Source::Buffered(chunk)) => match chunk.read_chunk(remaining)? {
                    Some(records) => {
                        self.uncommitted_count += records.len();
                        remaining -= records.len();
                        result.extend(records);
                    }
                    None => chunk_drained = true,
                },
                Some(Source::Passthrough(upstream)) => match upstream.read_chunk(remaining)? {
                    Some(records) => {
                        self.uncommitted_count += records.len();
                        remaining -= records.len();
                        result.extend(records);
                    }
                    None => break,
                },
                None => break,
            }
            if chunk_drained {
                // drained to the end; stays locked until commit
                if let Some(Source::Buffered(chunk)) = self.current.take() {
                    self.prev_chunks.insert(chunk.id(), chunk);
                }
            }
        }
        if result.is_empty() {
            Ok(None)
        } else {
            Ok(Some(result))
        }
    }

    /// Persist all progress and drop every chunk this process owns.
    fn commit(&mut self) -> Result<(), Error> {
        if self.options.read_only {
            bail!("unable to commit a read-only buffer");
        }
        match self.current.take() {
            Some(Source::Buffered(mut chunk)) => chunk.commit()?,
            Some(Source::Passthrough(mut upstream)) => upstream.commit()?,
            None => (),
        }
        for (_id, mut chunk) in std::mem::take(&mut self.prev_chunks) {
            chunk.remove()?;
        }
        self.uncommitted_count = 0;
        Ok(())
    }

    fn supports_lag(&self) -> bool {
        match (self.in_cb)() {
            Ok(upstream) => upstream.supports_lag(),
            Err(_) => false,
        }
    }

    /// Upstream lag plus everything still buffered on disk.
    fn lag(&mut self) -> Result<u64, Error> {
        let upstream_lag = match self.current.as_mut() {
            Some(Source::Passthrough(upstream)) => upstream.lag()?,
            _ => {
                let mut upstream = (self.in_cb)()?;
                if !upstream.supports_lag() {
                    bail!("upstream stream does not support lag");
                }
                upstream.lag()?
            }
        };
        Ok(upstream_lag + self.buffer_lag()?)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_gc_classification() -> Result<(), Error> {
        let _ = env_logger::builder().is_test(true).try_init();

        let dir = std::path::Path::new(".test-buffer-gc");
        let _ = std::fs::remove_dir_all(dir);
        std::fs::create_dir_all(dir)?;

        let mut chunk = Chunk::new(dir, 3);
        chunk.create(&[b"x".to_vec()])?;
        drop(chunk);

        std::fs::write(dir.join("5.status"), b"{\"pos\":8}")?; // orphan
        std::fs::write(dir.join("5.lock"), b"")?;
        std::fs::write(dir.join("garbage.txt"), b"?")?;
        std::fs::write(dir.join("meta"), b"{}")?;
        std::fs::write(dir.join("read_lock"), b"")?;
        // fresh staging file, must survive
        std::fs::write(dir.join("9.tmp.123.1.0"), b"")?;

        let factory: StreamFactory = Box::new(|| bail!("no upstream"));
        let mut buffer = Buffer::open(dir, factory, BufferOptions::new())?;
        buffer.gc()?;

        assert!(dir.join("3.chunk").exists());
        assert!(dir.join("meta").exists());
        assert!(dir.join("read_lock").exists());
        assert!(dir.join("9.tmp.123.1.0").exists());
        assert!(!dir.join("5.status").exists());
        assert!(!dir.join("5.lock").exists());
        assert!(!dir.join("garbage.txt").exists());

        let _ = std::fs::remove_dir_all(dir);
        Ok(())
    }
}
