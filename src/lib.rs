//! Disk backed fan-out buffer.
//!
//! A fan-out buffer turns one strictly sequential input stream into a
//! stream that many cooperating processes on the same host can consume
//! concurrently, without duplicating or losing records. The buffer is a
//! plain directory of small immutable chunk files; all coordination
//! happens through the filesystem, so readers need nothing but the
//! directory path and a way to open the upstream stream.
//!
//! # On-disk layout
//!
//! For a buffer directory `D` and a chunk id `N`:
//!
//! * `D/N.chunk` - immutable payload, a batch of records pulled from
//!   upstream. Appears atomically via rename, mode 0644.
//! * `D/N.status` - persistent read cursor for that chunk.
//! * `D/N.lock` - ownership lock, held by the process draining the chunk.
//! * `D/N.status.lock` - transient lock guarding cursor rewrites.
//! * `D/N.tmp.<pid>.<time>.<uid>` - staging file for an atomic rename,
//!   reaped by GC when orphaned by a crash.
//! * `D/meta` - id counter and GC timestamp.
//! * `D/read_lock` - serializes pulls from the upstream stream.
//!
//! # Locking
//!
//! Chunk ids are allocated from a strictly increasing counter and never
//! reused. Every lock is a non-blocking advisory `flock(2)`, so a dying
//! process releases everything it held and its chunks become available
//! to the surviving readers, cursors intact. Records consumed but not
//! yet committed when a reader dies are delivered again to the next
//! holder of the chunk lock; consumers get at-least-once semantics
//! across crashes and exactly-once while processes shut down cleanly.
//!
//! Refills are serialized by `D/read_lock`, but a freshly created chunk
//! is published before it is locked, so the creator competes with its
//! peers for the chunk it just wrote and simply refills again when it
//! loses.
//!
//! Chunks are delivered in allocation order within one reader; across
//! concurrent readers the interleaving is arbitrary.

pub mod buffer;
pub mod chunk;
pub mod file_lock;
pub mod meta;
pub mod record_log;
pub mod stream;

mod tools;

pub use buffer::{Buffer, BufferOptions};
pub use chunk::Chunk;
pub use file_lock::{lock_file_timeout, FileLock};
pub use meta::MetaStore;
pub use record_log::{LogCursor, RecordLog, RecordLogWriter};
pub use stream::{Record, StreamFactory, StreamIn};
