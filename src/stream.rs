//! The stream-input seam between the buffer and its data source.

use anyhow::{bail, Error};

/// A single opaque item flowing through the buffer.
pub type Record = Vec<u8>;

/// Sequential input stream with a persistent cursor.
///
/// `commit` persists consumption; a stream dropped without commit
/// re-delivers everything read since the last commit to the next
/// consumer. Lag reporting is optional, probe with `supports_lag`
/// before calling `lag`.
pub trait StreamIn {
    fn read(&mut self) -> Result<Option<Record>, Error> {
        match self.read_chunk(1)? {
            Some(records) => Ok(records.into_iter().next()),
            None => Ok(None),
        }
    }

    /// Read up to `count` records; `None` once the stream is exhausted.
    fn read_chunk(&mut self, count: usize) -> Result<Option<Vec<Record>>, Error>;

    /// Persist the cursor for everything consumed so far. Idempotent.
    fn commit(&mut self) -> Result<(), Error>;

    fn supports_lag(&self) -> bool {
        false
    }

    /// Records remaining between the cursor and the end of the stream.
    fn lag(&mut self) -> Result<u64, Error> {
        bail!("stream does not support lag");
    }
}

/// Factory yielding a fresh stream instance per call.
///
/// Streams cache their persisted cursor when opened, so every refill
/// needs a new instance to observe the latest committed position. A
/// caller holding a concrete stream wraps it in a closure at this
/// boundary.
pub type StreamFactory = Box<dyn Fn() -> Result<Box<dyn StreamIn>, Error> + Send>;
