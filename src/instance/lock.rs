//! System-wide named lock backed by an advisory file lock.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;

/// Exclusive ownership of `<dir>/<key>.lock`.
///
/// The operating system releases the lock when the handle is dropped or the
/// process dies, so a crashed owner never blocks the next launch.
#[derive(Debug)]
pub struct InstanceLock {
    file: File,
    path: PathBuf,
    owner_pid: u32,
}

impl InstanceLock {
    /// Try to take the lock without blocking.
    ///
    /// Returns `Ok(None)` when another handle holds it.
    pub fn try_acquire(path: &Path) -> std::io::Result<Option<Self>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // No truncate: the current owner's pid must survive a losing open
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
                return Ok(None)
            }
            Err(e) => return Err(e),
        }

        let owner_pid = std::process::id();
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        write!(file, "{}", owner_pid)?;
        file.flush()?;

        Ok(Some(Self {
            file,
            path: path.to_path_buf(),
            owner_pid,
        }))
    }

    pub fn owner_pid(&self) -> u32 {
        self.owner_pid
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(error = %e, path = %self.path.display(), "Failed to release instance lock");
        }
    }
}

/// Pid recorded by the current owner, for diagnostics.
pub fn recorded_owner(path: &Path) -> Option<u32> {
    let mut contents = String::new();
    File::open(path).ok()?.read_to_string(&mut contents).ok()?;
    contents.trim().parse().ok()
}
