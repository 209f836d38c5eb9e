//! Append-once record journal with a persistent read cursor.
//!
//! A record log is written in one go and never modified afterwards;
//! publication is the caller's atomic rename. Consumers track their
//! position in a sibling status file, so progress survives process
//! restarts.
//!
//! Layout: an 8 byte magic, then each record as a little-endian `u32`
//! length followed by the payload bytes.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Error};
use serde::{Deserialize, Serialize};

use crate::file_lock::FileLock;
use crate::stream::{Record, StreamIn};
use crate::tools;

// sha256(b"fanout-buffer record log v1.0")[0..8]
pub const RECORD_LOG_MAGIC_1_0: [u8; 8] = [222, 78, 22, 64, 149, 23, 128, 187];

const HEADER_SIZE: u64 = 8;

/// Writes a fresh record log.
///
/// The file must not exist yet; it is complete once `commit` returns.
pub struct RecordLogWriter {
    file: BufWriter<File>,
    path: PathBuf,
}

impl RecordLogWriter {
    pub fn create<P: AsRef<Path>>(path: P, mode: nix::sys::stat::Mode) -> Result<Self, Error> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|err| format_err!("unable to create record log {:?} - {}", path, err))?;
        // fchmod, so the mode is exact regardless of the umask
        nix::sys::stat::fchmod(file.as_raw_fd(), mode)?;
        let mut file = BufWriter::new(file);
        file.write_all(&RECORD_LOG_MAGIC_1_0)?;
        Ok(Self {
            file,
            path: path.to_owned(),
        })
    }

    pub fn write_records(&mut self, records: &[Record]) -> Result<(), Error> {
        for record in records {
            if record.len() > u32::MAX as usize {
                bail!("record of {} bytes is too large", record.len());
            }
            self.file.write_all(&(record.len() as u32).to_le_bytes())?;
            self.file.write_all(record)?;
        }
        Ok(())
    }

    /// Flush and fsync the log.
    pub fn commit(self) -> Result<(), Error> {
        let path = self.path;
        let file = self
            .file
            .into_inner()
            .map_err(|err| format_err!("flush of {:?} failed - {}", path, err))?;
        file.sync_data()
            .map_err(|err| format_err!("fsync of {:?} failed - {}", path, err))?;
        Ok(())
    }
}

/// An existing, validated record log.
pub struct RecordLog {
    path: PathBuf,
    size: u64,
}

impl RecordLog {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        let mut file = File::open(path)
            .map_err(|err| format_err!("unable to open record log {:?} - {}", path, err))?;
        let mut magic = [0u8; 8];
        file.read_exact(&mut magic)
            .map_err(|err| format_err!("unable to read magic of {:?} - {}", path, err))?;
        if magic != RECORD_LOG_MAGIC_1_0 {
            bail!("record log {:?} has wrong magic number", path);
        }
        let size = file.metadata()?.len();
        Ok(Self {
            path: path.to_owned(),
            size,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open a consuming cursor persisting its progress to `status_path`.
    pub fn cursor<P: AsRef<Path>>(self, status_path: P) -> Result<LogCursor, Error> {
        LogCursor::new(self, status_path.as_ref(), false)
    }

    /// Open a read-only cursor.
    ///
    /// Starts at the persisted position if a status file exists, but
    /// never creates or advances it.
    pub fn cursor_ro<P: AsRef<Path>>(self, status_path: P) -> Result<LogCursor, Error> {
        LogCursor::new(self, status_path.as_ref(), true)
    }
}

#[derive(Serialize, Deserialize)]
struct CursorStatus {
    pos: u64,
}

fn load_status(path: &Path) -> Result<Option<CursorStatus>, Error> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => bail!("unable to read cursor status {:?} - {}", path, err),
    };
    let status: CursorStatus = serde_json::from_slice(&data)
        .map_err(|err| format_err!("corrupt cursor status {:?} - {}", path, err))?;
    Ok(Some(status))
}

/// Consumer cursor over a [RecordLog].
///
/// The position is persisted on `commit` by atomically rewriting the
/// status file under its transient `<status>.lock`. Concurrent cursor
/// instances are allowed; callers serialize commits through their own
/// ownership locks.
pub struct LogCursor {
    file: File,
    log_path: PathBuf,
    status_path: PathBuf,
    pos: u64,
    size: u64,
    read_only: bool,
}

impl LogCursor {
    fn new(log: RecordLog, status_path: &Path, read_only: bool) -> Result<Self, Error> {
        let status = load_status(status_path)?;
        let pos = match &status {
            Some(status) => status.pos,
            None => HEADER_SIZE,
        };
        if pos > log.size {
            bail!(
                "cursor position {} of {:?} is past the end of {:?}",
                pos,
                status_path,
                log.path
            );
        }
        let mut file = File::open(&log.path)?;
        file.seek(SeekFrom::Start(pos))?;
        let mut cursor = Self {
            file,
            log_path: log.path,
            status_path: status_path.to_owned(),
            pos,
            size: log.size,
            read_only,
        };
        if !read_only && status.is_none() {
            cursor.commit_cursor()?;
        }
        Ok(cursor)
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    fn read_record(&mut self) -> Result<Option<Record>, Error> {
        if self.pos >= self.size {
            return Ok(None);
        }
        let mut len = [0u8; 4];
        self.file
            .read_exact(&mut len)
            .map_err(|err| format_err!("unable to read {:?} - {}", self.log_path, err))?;
        let len = u32::from_le_bytes(len) as u64;
        if self.pos + 4 + len > self.size {
            bail!(
                "record log {:?} is truncated at offset {}",
                self.log_path,
                self.pos
            );
        }
        let mut data = vec![0u8; len as usize];
        self.file
            .read_exact(&mut data)
            .map_err(|err| format_err!("unable to read {:?} - {}", self.log_path, err))?;
        self.pos += 4 + len;
        Ok(Some(data))
    }

    fn commit_cursor(&mut self) -> Result<(), Error> {
        if self.read_only {
            bail!("unable to commit a read-only cursor for {:?}", self.log_path);
        }
        let lock_path = tools::lock_path(&self.status_path);
        let _guard = match FileLock::try_acquire(&lock_path)? {
            Some(guard) => guard,
            None => bail!("cursor status {:?} is locked", self.status_path),
        };
        let data = serde_json::to_vec(&CursorStatus { pos: self.pos })?;
        tools::replace_file(&self.status_path, &data)
    }

    /// Records between the live position and the end of the log.
    fn remaining(&mut self) -> Result<u64, Error> {
        let mut count = 0;
        let mut pos = self.pos;
        let mut len = [0u8; 4];
        while pos < self.size {
            self.file.seek(SeekFrom::Start(pos))?;
            self.file.read_exact(&mut len)?;
            pos += 4 + u32::from_le_bytes(len) as u64;
            count += 1;
        }
        self.file.seek(SeekFrom::Start(self.pos))?;
        Ok(count)
    }
}

impl StreamIn for LogCursor {
    fn read_chunk(&mut self, count: usize) -> Result<Option<Vec<Record>>, Error> {
        let mut result = Vec::new();
        while result.len() < count {
            match self.read_record()? {
                Some(record) => result.push(record),
                None => break,
            }
        }
        if result.is_empty() {
            Ok(None)
        } else {
            Ok(Some(result))
        }
    }

    fn commit(&mut self) -> Result<(), Error> {
        self.commit_cursor()
    }

    fn supports_lag(&self) -> bool {
        true
    }

    fn lag(&mut self) -> Result<u64, Error> {
        self.remaining()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use nix::sys::stat::Mode;

    fn records(items: &[&str]) -> Vec<Record> {
        items.iter().map(|item| item.as_bytes().to_vec()).collect()
    }

    fn write_log(path: &Path, items: &[&str]) -> Result<(), Error> {
        let mut writer = RecordLogWriter::create(path, Mode::from_bits_truncate(0o644))?;
        writer.write_records(&records(items))?;
        writer.commit()
    }

    #[test]
    fn test_cursor_roundtrip() -> Result<(), Error> {
        let dir = std::path::Path::new(".test-record-log");
        let _ = std::fs::remove_dir_all(dir);
        std::fs::create_dir_all(dir)?;
        let log_path = dir.join("data.log");
        let status_path = dir.join("data.status");

        write_log(&log_path, &["alpha", "beta", "gamma"])?;

        let mut cursor = RecordLog::open(&log_path)?.cursor(&status_path)?;
        assert_eq!(cursor.lag()?, 3);
        assert_eq!(cursor.read()?, Some(b"alpha".to_vec()));
        assert_eq!(cursor.lag()?, 2);
        cursor.commit()?;
        drop(cursor);

        // progress was persisted
        let mut cursor = RecordLog::open(&log_path)?.cursor(&status_path)?;
        assert_eq!(cursor.read_chunk(10)?, Some(records(&["beta", "gamma"])));
        assert_eq!(cursor.read_chunk(1)?, None);
        drop(cursor);

        // the uncommitted reads above are re-delivered
        let mut cursor = RecordLog::open(&log_path)?.cursor(&status_path)?;
        assert_eq!(cursor.read()?, Some(b"beta".to_vec()));

        let _ = std::fs::remove_dir_all(dir);
        Ok(())
    }

    #[test]
    fn test_read_only_cursor() -> Result<(), Error> {
        let dir = std::path::Path::new(".test-record-log-ro");
        let _ = std::fs::remove_dir_all(dir);
        std::fs::create_dir_all(dir)?;
        let log_path = dir.join("data.log");
        let status_path = dir.join("data.status");

        write_log(&log_path, &["alpha", "beta"])?;

        let mut cursor = RecordLog::open(&log_path)?.cursor_ro(&status_path)?;
        assert_eq!(cursor.read()?, Some(b"alpha".to_vec()));
        assert!(cursor.commit().is_err());
        // a read-only cursor never creates the status file
        assert!(!status_path.exists());

        let _ = std::fs::remove_dir_all(dir);
        Ok(())
    }

    #[test]
    fn test_wrong_magic() -> Result<(), Error> {
        let dir = std::path::Path::new(".test-record-log-magic");
        let _ = std::fs::remove_dir_all(dir);
        std::fs::create_dir_all(dir)?;
        let log_path = dir.join("data.log");

        std::fs::write(&log_path, b"not a record log")?;
        assert!(RecordLog::open(&log_path).is_err());

        let _ = std::fs::remove_dir_all(dir);
        Ok(())
    }
}
