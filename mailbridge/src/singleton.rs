//! Single-instance guard for the host.
//!
//! Two hosts on one queue would both claim jobs, so a host holds
//! `<root>/native_host.lock` for its whole lifetime. The file contains the
//! owner's PID in decimal; on unix it is also held under an exclusive
//! `flock`, and a held flock means the lock is taken whatever the file
//! says. A lock nobody holds (unix) or whose owner is no longer running
//! (elsewhere) is stale and gets replaced.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

pub const LOCK_FILE_NAME: &str = "native_host.lock";

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("another host (pid {pid}) already owns {}", path.display())]
    AlreadyRunning { pid: u32, path: PathBuf },

    #[error("lost the race for {}", path.display())]
    Contended { path: PathBuf },

    #[error("lock file error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[cfg(unix)]
type LockHandle = nix::fcntl::Flock<File>;
#[cfg(not(unix))]
type LockHandle = File;

/// Held for the lifetime of the host. Dropping it removes the lock file.
pub struct ProcessLock {
    path: PathBuf,
    pid: u32,
    _handle: LockHandle,
}

impl std::fmt::Debug for ProcessLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessLock")
            .field("path", &self.path)
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

enum CreateOutcome {
    Acquired(ProcessLock),
    Exists,
}

/// What the current lock file says about its owner.
enum Owner {
    Alive(u32),
    Dead(u32),
    Unreadable(String),
    Gone,
}

impl ProcessLock {
    /// Take the lock for the queue at `root`, replacing a stale one.
    pub fn acquire(root: &Path) -> Result<Self, LockError> {
        let path = lock_path(root);

        if let CreateOutcome::Acquired(lock) = Self::try_create(&path)? {
            return Ok(lock);
        }

        // Holding the existing file's flock keeps a second starter from
        // replacing it at the same time.
        let _stale = match OpenOptions::new().read(true).open(&path) {
            Ok(file) => match lock_exclusive(file) {
                Ok(handle) => Some(handle),
                Err(_) => {
                    return Err(match read_owner(&path) {
                        Owner::Alive(pid) | Owner::Dead(pid) => LockError::AlreadyRunning { pid, path },
                        Owner::Unreadable(_) | Owner::Gone => LockError::Contended { path },
                    });
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(LockError::Io { path, source: e }),
        };

        match read_owner(&path) {
            Owner::Alive(pid) if !cfg!(unix) => return Err(LockError::AlreadyRunning { pid, path }),
            Owner::Alive(pid) => {
                tracing::info!(pid, path = %path.display(), "Removing unheld lock (pid reused)");
            }
            Owner::Dead(pid) => {
                tracing::info!(pid, path = %path.display(), "Removing stale lock (owner not running)");
            }
            Owner::Unreadable(reason) => {
                tracing::warn!(path = %path.display(), reason = %reason, "Removing unreadable lock file");
            }
            Owner::Gone => {}
        }

        if let Err(e) = fs::remove_file(&path)
            && e.kind() != io::ErrorKind::NotFound
        {
            return Err(LockError::Io { path, source: e });
        }

        match Self::try_create(&path)? {
            CreateOutcome::Acquired(lock) => Ok(lock),
            CreateOutcome::Exists => Err(LockError::Contended { path }),
        }
    }

    fn try_create(path: &Path) -> Result<CreateOutcome, LockError> {
        let file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(CreateOutcome::Exists),
            Err(e) => {
                return Err(LockError::Io {
                    path: path.to_path_buf(),
                    source: e,
                });
            }
        };

        let mut handle = lock_exclusive(file).map_err(|_| LockError::Contended {
            path: path.to_path_buf(),
        })?;
        // Another starter may have replaced the path before we got the flock.
        if !still_at_path(&handle, path) {
            return Err(LockError::Contended {
                path: path.to_path_buf(),
            });
        }

        let pid = std::process::id();
        if let Err(e) = handle
            .write_all(pid.to_string().as_bytes())
            .and_then(|()| handle.sync_all())
        {
            let _ = fs::remove_file(path);
            return Err(LockError::Io {
                path: path.to_path_buf(),
                source: e,
            });
        }

        tracing::debug!(pid, path = %path.display(), "Acquired process lock");
        Ok(CreateOutcome::Acquired(ProcessLock {
            path: path.to_path_buf(),
            pid,
            _handle: handle,
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        // Only delete the file if it is still ours.
        let ours = fs::read_to_string(&self.path)
            .map(|s| s.trim().parse::<u32>().ok() == Some(self.pid))
            .unwrap_or(false);
        if !ours {
            return;
        }
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::warn!(error = %e, path = %self.path.display(), "Failed to remove lock file");
        } else {
            tracing::debug!(path = %self.path.display(), "Released process lock");
        }
    }
}

#[cfg(unix)]
fn lock_exclusive(file: File) -> Result<LockHandle, nix::errno::Errno> {
    use nix::fcntl::{Flock, FlockArg};
    Flock::lock(file, FlockArg::LockExclusiveNonblock).map_err(|(_, errno)| errno)
}

#[cfg(not(unix))]
fn lock_exclusive(file: File) -> Result<LockHandle, io::Error> {
    Ok(file)
}

#[cfg(unix)]
fn still_at_path(file: &File, path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;
    match (file.metadata(), fs::metadata(path)) {
        (Ok(ours), Ok(current)) => ours.dev() == current.dev() && ours.ino() == current.ino(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn still_at_path(_file: &File, _path: &Path) -> bool {
    true
}

pub fn lock_path(root: &Path) -> PathBuf {
    root.join(LOCK_FILE_NAME)
}

/// PID recorded in the lock file at `root`, if there is a readable one.
pub fn lock_owner(root: &Path) -> Option<u32> {
    match read_owner(&lock_path(root)) {
        Owner::Alive(pid) | Owner::Dead(pid) => Some(pid),
        Owner::Unreadable(_) | Owner::Gone => None,
    }
}

fn read_owner(path: &Path) -> Owner {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Owner::Gone,
        Err(e) => return Owner::Unreadable(e.to_string()),
    };

    match contents.trim().parse::<u32>() {
        Ok(0) => Owner::Unreadable("pid 0".to_string()),
        Ok(pid) if is_process_alive(pid) => Owner::Alive(pid),
        Ok(pid) => Owner::Dead(pid),
        Err(_) => Owner::Unreadable(format!("not a pid: {:?}", contents.trim())),
    }
}

/// Check whether a process with `pid` exists.
#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }

    // Signal 0 checks for the process without delivering anything. EPERM means the process
    // exists but belongs to someone else.
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(windows)]
pub fn is_process_alive(pid: u32) -> bool {
    let filter = format!("PID eq {pid}");
    std::process::Command::new("tasklist")
        .args(["/FI", &filter, "/NH", "/FO", "CSV"])
        .output()
        .map(|out| String::from_utf8_lossy(&out.stdout).contains(&format!("\"{pid}\"")))
        .unwrap_or(false)
}

#[cfg(not(any(unix, windows)))]
pub fn is_process_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exited_pid() -> u32 {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        pid
    }

    #[test]
    fn acquire_writes_pid_and_drop_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let lock = ProcessLock::acquire(dir.path()).unwrap();

        let contents = fs::read_to_string(lock.path()).unwrap();
        assert_eq!(contents, std::process::id().to_string());

        let path = lock.path().to_path_buf();
        drop(lock);
        assert!(!path.exists());
    }

    #[test]
    fn second_acquire_fails_while_held() {
        let dir = tempfile::tempdir().unwrap();
        let _lock = ProcessLock::acquire(dir.path()).unwrap();

        match ProcessLock::acquire(dir.path()) {
            Err(LockError::AlreadyRunning { pid, .. }) => assert_eq!(pid, std::process::id()),
            other => panic!("expected AlreadyRunning, got {other:?}"),
        }
    }

    #[test]
    fn stale_lock_from_exited_process_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(lock_path(dir.path()), exited_pid().to_string()).unwrap();

        let lock = ProcessLock::acquire(dir.path()).unwrap();

        assert_eq!(lock.pid(), std::process::id());
    }

    #[test]
    fn out_of_range_pid_is_stale() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(lock_path(dir.path()), "4000000000").unwrap();

        assert!(ProcessLock::acquire(dir.path()).is_ok());
    }

    #[test]
    fn corrupt_lock_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(lock_path(dir.path()), "not-a-pid\n").unwrap();

        assert!(ProcessLock::acquire(dir.path()).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn held_flock_blocks_takeover_before_pid_is_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = lock_path(dir.path());
        let _held = lock_exclusive(File::create(&path).unwrap()).unwrap();

        match ProcessLock::acquire(dir.path()) {
            Err(LockError::Contended { .. }) => {}
            other => panic!("expected Contended, got {other:?}"),
        }
        assert!(path.exists());
    }

    #[cfg(unix)]
    #[test]
    fn unheld_lock_naming_a_live_pid_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let mut sleeper = std::process::Command::new("sleep").arg("5").spawn().unwrap();
        fs::write(lock_path(dir.path()), sleeper.id().to_string()).unwrap();

        let outcome = ProcessLock::acquire(dir.path());
        sleeper.kill().unwrap();
        sleeper.wait().unwrap();

        assert_eq!(outcome.unwrap().pid(), std::process::id());
    }

    #[test]
    fn drop_leaves_foreign_lock_alone() {
        let dir = tempfile::tempdir().unwrap();
        let lock = ProcessLock::acquire(dir.path()).unwrap();
        fs::write(lock.path(), "1").unwrap();

        let path = lock.path().to_path_buf();
        drop(lock);
        assert!(path.exists());
    }

    #[test]
    fn liveness_check() {
        assert!(is_process_alive(std::process::id()));
        assert!(!is_process_alive(0));
        assert!(!is_process_alive(exited_pid()));
    }

    #[test]
    fn lock_owner_reads_pid() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(lock_owner(dir.path()), None);

        let _lock = ProcessLock::acquire(dir.path()).unwrap();
        assert_eq!(lock_owner(dir.path()), Some(std::process::id()));
    }
}
