//! Exclusive cache directory acquirer (C2).
//!
//! Multiple worker processes may share a host. Each needs its own download cache directory, so
//! they don't trample each other's bundle-fetcher state. We probe `N` candidate directories in
//! order and take the first one we can exclusively lock.

use anyhow::{bail, Context as _, Result};
use fs2::FileExt as _;
use std::{
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
};

/// Default number of candidate cache directories to probe.
pub const DEFAULT_CANDIDATE_COUNT: usize = 16;

/// An acquired, exclusively-locked cache directory. The lock is held for the lifetime of this
/// value via the open file handle; dropping it releases the lock (and the OS cleans up on
/// process exit regardless).
pub struct CacheDir {
    path: PathBuf,
    _lock: File,
}

impl CacheDir {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Probe `<base>.0 .. <base>.(count-1)` in order. For each, ensure the directory exists,
    /// then attempt a non-blocking exclusive lock on the co-located `<base>.<i>.lock` file. The
    /// lock file, not the directory, is the authority: directory existence alone says nothing
    /// about ownership.
    pub fn acquire(base: &Path, count: usize) -> Result<Self> {
        for i in 0..count {
            let dir = candidate_dir(base, i);
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("creating cache dir {}", dir.display()))?;
            let lock_path = candidate_lock_path(base, i);
            let lock_file = OpenOptions::new()
                .create(true)
                .write(true)
                .open(&lock_path)
                .with_context(|| format!("opening lock file {}", lock_path.display()))?;
            match lock_file.try_lock_exclusive() {
                Ok(()) => {
                    return Ok(Self {
                        path: dir,
                        _lock: lock_file,
                    });
                }
                Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                    continue;
                }
                Err(e) => return Err(e).with_context(|| format!("locking {}", lock_path.display())),
            }
        }
        bail!("unable to lock any of {count} candidate cache directories under {}.<i>", base.display());
    }
}

fn candidate_dir(base: &Path, i: usize) -> PathBuf {
    let mut s = base.as_os_str().to_owned();
    s.push(format!(".{i}"));
    PathBuf::from(s)
}

fn candidate_lock_path(base: &Path, i: usize) -> PathBuf {
    let mut s = base.as_os_str().to_owned();
    s.push(format!(".{i}.lock"));
    PathBuf::from(s)
}
