use async_trait::async_trait;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Answers "is another program holding this file open?".
#[async_trait]
pub trait LockProbe: Send + Sync {
    /// A probe failure reports the file as open.
    async fn is_open_by_other(&self, path: &Path) -> bool;
}

/// Probes the local OS: editor owner files first, then an exclusive
/// non-blocking `flock`, then (Linux) other processes' descriptors.
#[derive(Debug, Clone, Default)]
pub struct OsLockProbe;

#[async_trait]
impl LockProbe for OsLockProbe {
    async fn is_open_by_other(&self, path: &Path) -> bool {
        let owned = path.to_path_buf();
        match tokio::task::spawn_blocking(move || probe(&owned)).await {
            Ok(Ok(open)) => open,
            Ok(Err(err)) => {
                tracing::warn!(path = %path.display(), error = %err, "lock probe failed; assuming file is open");
                true
            }
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "lock probe task failed; assuming file is open");
                true
            }
        }
    }
}

fn probe(path: &Path) -> io::Result<bool> {
    match fs::metadata(path) {
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(err),
    }
    if owner_files(path).iter().any(|owner| owner.exists()) {
        return Ok(true);
    }
    if exclusive_lock_refused(path)? {
        return Ok(true);
    }
    held_by_other_process(path)
}

/// Marker files desktop editors drop next to a document they have open.
fn owner_files(path: &Path) -> Vec<PathBuf> {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return Vec::new();
    };
    vec![
        // Excel
        path.with_file_name(format!("~${name}")),
        // LibreOffice
        path.with_file_name(format!(".~lock.{name}#")),
    ]
}

#[cfg(unix)]
fn exclusive_lock_refused(path: &Path) -> io::Result<bool> {
    use std::os::unix::io::AsRawFd;

    let file = fs::File::open(path)?;
    let fd = file.as_raw_fd();
    let rc = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
    if rc != 0 {
        let err = io::Error::last_os_error();
        return match err.raw_os_error() {
            Some(code) if code == libc::EWOULDBLOCK => Ok(true),
            _ => Err(err),
        };
    }
    unsafe {
        libc::flock(fd, libc::LOCK_UN);
    }
    Ok(false)
}

#[cfg(windows)]
fn exclusive_lock_refused(path: &Path) -> io::Result<bool> {
    use std::os::windows::fs::OpenOptionsExt;

    const ERROR_SHARING_VIOLATION: i32 = 32;
    const ERROR_LOCK_VIOLATION: i32 = 33;
    match fs::OpenOptions::new().read(true).write(true).share_mode(0).open(path) {
        Ok(_) => Ok(false),
        Err(err) => match err.raw_os_error() {
            Some(ERROR_SHARING_VIOLATION) | Some(ERROR_LOCK_VIOLATION) => Ok(true),
            _ => Err(err),
        },
    }
}

#[cfg(not(any(unix, windows)))]
fn exclusive_lock_refused(_path: &Path) -> io::Result<bool> {
    Ok(false)
}

/// Scans `/proc/<pid>/fd` for descriptors pointing at `path`. Processes we
/// cannot inspect are skipped.
#[cfg(target_os = "linux")]
fn held_by_other_process(path: &Path) -> io::Result<bool> {
    let target = fs::canonicalize(path)?;
    let own_pid = std::process::id().to_string();
    let Ok(procs) = fs::read_dir("/proc") else {
        return Ok(false);
    };
    for entry in procs.flatten() {
        let name = entry.file_name();
        let Some(pid) = name.to_str() else {
            continue;
        };
        if pid == own_pid || !pid.bytes().all(|b| b.is_ascii_digit()) {
            continue;
        }
        let Ok(fds) = fs::read_dir(entry.path().join("fd")) else {
            continue;
        };
        for fd in fds.flatten() {
            if fs::read_link(fd.path()).is_ok_and(|link| link == target) {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

#[cfg(not(target_os = "linux"))]
fn held_by_other_process(_path: &Path) -> io::Result<bool> {
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn missing_file_is_not_locked() {
        let dir = TempDir::new().unwrap();
        assert!(!OsLockProbe.is_open_by_other(&dir.path().join("absent.xlsx")).await);
    }

    #[tokio::test]
    async fn idle_file_is_not_locked() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("Log_2026.xlsx");
        fs::write(&path, b"xlsx").unwrap();
        assert!(!OsLockProbe.is_open_by_other(&path).await);
    }

    #[tokio::test]
    async fn excel_owner_file_marks_document_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("Log_2026.xlsx");
        fs::write(&path, b"xlsx").unwrap();
        fs::write(dir.path().join("~$Log_2026.xlsx"), b"owner").unwrap();
        assert!(OsLockProbe.is_open_by_other(&path).await);
    }

    #[tokio::test]
    async fn libreoffice_lock_file_marks_document_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("Log_2026.xlsx");
        fs::write(&path, b"xlsx").unwrap();
        fs::write(dir.path().join(".~lock.Log_2026.xlsx#"), b"owner").unwrap();
        assert!(OsLockProbe.is_open_by_other(&path).await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn held_flock_marks_document_open() {
        use std::os::unix::io::AsRawFd;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("Log_2026.xlsx");
        fs::write(&path, b"xlsx").unwrap();
        let holder = fs::File::open(&path).unwrap();
        let rc = unsafe { libc::flock(holder.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        assert_eq!(rc, 0);

        // flock locks belong to the open file description, so a second open
        // in this process conflicts just like another program would.
        assert!(OsLockProbe.is_open_by_other(&path).await);
        drop(holder);
        assert!(!OsLockProbe.is_open_by_other(&path).await);
    }
}
