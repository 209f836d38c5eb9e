//! Small filesystem helpers shared across the crate.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Error};

/// Current unix time in whole seconds.
pub(crate) fn epoch_i64() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_secs() as i64,
        Err(_) => 0,
    }
}

static NEXT_STAGING_UID: AtomicU64 = AtomicU64::new(0);

/// Staging name for an atomic rewrite of `path`.
///
/// Same directory, named `<stem>.tmp.<pid>.<time>.<uid>`. The uid is a
/// process local counter that keeps names unique within one second;
/// staging files orphaned by a crash are reaped by the buffer GC once
/// they are old enough.
pub(crate) fn staging_path(path: &Path) -> Result<PathBuf, Error> {
    let mut name = match path.file_stem() {
        Some(stem) => stem.to_owned(),
        None => bail!("unable to derive staging name for {:?}", path),
    };
    let uid = NEXT_STAGING_UID.fetch_add(1, Ordering::Relaxed);
    name.push(format!(
        ".tmp.{}.{}.{}",
        nix::unistd::getpid(),
        epoch_i64(),
        uid
    ));
    Ok(match path.parent() {
        Some(parent) => parent.join(&name),
        None => PathBuf::from(name),
    })
}

/// Atomically replace `path`: write a staging file, then rename it over
/// the target.
pub(crate) fn replace_file(path: &Path, data: &[u8]) -> Result<(), Error> {
    let staging = staging_path(path)?;
    if let Err(err) = std::fs::write(&staging, data) {
        let _ = std::fs::remove_file(&staging);
        bail!("unable to write {:?} - {}", staging, err);
    }
    if let Err(err) = std::fs::rename(&staging, path) {
        let _ = std::fs::remove_file(&staging);
        bail!("atomic rename to {:?} failed - {}", path, err);
    }
    Ok(())
}

/// Path of the lock file guarding `path` (`<path>.lock`).
pub(crate) fn lock_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".lock");
    PathBuf::from(os)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_staging_path() -> Result<(), Error> {
        let staged = staging_path(Path::new("buf/7.status"))?;
        let name = staged.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("7.tmp."));
        assert_eq!(staged.parent().unwrap(), Path::new("buf"));

        let staged = staging_path(Path::new("buf/meta"))?;
        let name = staged.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("meta.tmp."));
        Ok(())
    }

    #[test]
    fn test_lock_path() {
        assert_eq!(
            lock_path(Path::new("buf/meta")),
            PathBuf::from("buf/meta.lock")
        );
    }
}
