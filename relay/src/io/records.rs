//! Atomic JSON record files shared by the task and plan stores.
//!
//! A record file is rewritten whole (temp file + rename) on every commit, so
//! readers observe either the previous or the next version, never a torn one.
//! Writers serialize through [`RecordLock`], which pairs an in-process mutex
//! with an advisory `flock` on a sibling `.lock` file so a CLI invocation and
//! a running dispatcher cannot interleave read-modify-write cycles.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result, anyhow};
use nix::fcntl::{Flock, FlockArg};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

/// Exclusive access to one record file.
#[derive(Debug)]
pub struct RecordLock {
    lock_path: PathBuf,
    inner: Mutex<()>,
}

/// Held for the duration of one read-modify-write cycle.
pub struct RecordGuard<'a> {
    _flock: Flock<File>,
    _guard: MutexGuard<'a, ()>,
}

impl RecordLock {
    pub fn new(record_path: &Path) -> Self {
        Self {
            lock_path: record_path.with_extension("lock"),
            inner: Mutex::new(()),
        }
    }

    pub fn acquire(&self) -> Result<RecordGuard<'_>> {
        // The mutex guards no data; a poisoned lock is still a valid lock.
        let guard = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(parent) = self.lock_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)
            .with_context(|| format!("open lock file {}", self.lock_path.display()))?;
        let flock = Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| {
            anyhow!("lock {}: {errno}", self.lock_path.display())
        })?;
        Ok(RecordGuard {
            _flock: flock,
            _guard: guard,
        })
    }
}

/// Load a record file, or the default value when it does not exist yet.
pub fn load_or_default<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Ok(T::default());
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

/// Serialize `value` as pretty JSON with a trailing newline and replace `path` atomically.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value).context("serialize json")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

/// Atomically replace `path` with `contents` (temp file + rename).
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name = path
        .file_name()
        .with_context(|| format!("path missing file name {}", path.display()))?
        .to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = parent.join(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    debug!(path = %path.display(), bytes = contents.len(), "wrote file atomically");
    Ok(())
}

/// Remove a file, treating "already absent" as success.
pub fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err).with_context(|| format!("remove {}", path.display())),
    }
}
