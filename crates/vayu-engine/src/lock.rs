use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::Path;

/// Advisory lock over `vayu.lock`, held for the engine's process lifetime.
/// Released automatically when dropped (or when the process exits), since
/// `flock`-held locks don't survive the owning file descriptor closing.
pub struct EngineLock {
    file: File,
}

impl EngineLock {
    /// Acquires the lock non-blocking; returns `Err` immediately if another
    /// engine process already holds it rather than waiting on it, matching
    /// the "fail fast with a lock-conflict" contract at boot.
    pub fn acquire(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).write(true).truncate(false).open(path)?;

        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error());
        }

        let mut file = file;
        file.set_len(0)?;
        write!(file, "{}", std::process::id())?;
        file.flush()?;

        Ok(Self { file })
    }
}

impl Drop for EngineLock {
    fn drop(&mut self) {
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}
