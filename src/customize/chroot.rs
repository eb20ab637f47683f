//! Chroot session management.
//!
//! Re-roots the process into the mounted guest tree so guest-native
//! tooling runs against the guest filesystem. Chroot state is
//! process-wide, so sessions go through an explicit registry: only one
//! may be active at a time, and a second acquisition fails fast instead
//! of silently nesting. The session holds an open handle to the real
//! root so exit can always find its way back.

use std::ffi::CString;
use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{bail, Context, Result};

/// Process-wide registry of the single permitted session.
static SESSION_ACTIVE: AtomicBool = AtomicBool::new(false);

/// An active chroot. Exit restores the original root; dropping an
/// unexited session restores it best-effort.
#[derive(Debug)]
pub struct ChrootSession {
    real_root: File,
    exited: bool,
}

impl ChrootSession {
    /// Re-root the process to `new_root`. Fails if another session is
    /// already active anywhere in the process.
    pub fn enter(new_root: &Path) -> Result<ChrootSession> {
        if SESSION_ACTIVE
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            bail!("a chroot session is already active in this process");
        }

        let result = Self::enter_unregistered(new_root);
        if result.is_err() {
            SESSION_ACTIVE.store(false, Ordering::SeqCst);
        }
        result
    }

    fn enter_unregistered(new_root: &Path) -> Result<ChrootSession> {
        let real_root = File::open("/").context("opening current root directory")?;

        let path = CString::new(new_root.as_os_str().as_encoded_bytes())
            .context("chroot target contains a NUL byte")?;
        // SAFETY: path is a valid NUL-terminated string; chroot has no
        // other preconditions.
        if unsafe { libc::chroot(path.as_ptr()) } != 0 {
            return Err(std::io::Error::last_os_error())
                .with_context(|| format!("chroot into '{}'", new_root.display()));
        }
        if unsafe { libc::chdir(c"/".as_ptr()) } != 0 {
            let e = std::io::Error::last_os_error();
            // Try to climb back out before surfacing the error.
            let _ = Self::restore(&real_root);
            return Err(e).context("chdir into new root");
        }

        tracing::info!(root = %new_root.display(), "entered chroot");
        Ok(ChrootSession {
            real_root,
            exited: false,
        })
    }

    /// Leave the chroot and restore the original root.
    pub fn exit(mut self) -> Result<()> {
        self.exited = true;
        let result = Self::restore(&self.real_root);
        SESSION_ACTIVE.store(false, Ordering::SeqCst);
        result
    }

    fn restore(real_root: &File) -> Result<()> {
        // SAFETY: the fd is owned by real_root and stays open for the
        // duration of both calls.
        if unsafe { libc::fchdir(real_root.as_raw_fd()) } != 0 {
            return Err(std::io::Error::last_os_error()).context("fchdir back to real root");
        }
        if unsafe { libc::chroot(c".".as_ptr()) } != 0 {
            return Err(std::io::Error::last_os_error()).context("chroot back to real root");
        }
        if unsafe { libc::chdir(c"/".as_ptr()) } != 0 {
            return Err(std::io::Error::last_os_error()).context("chdir to restored root");
        }
        tracing::info!("restored original root");
        Ok(())
    }
}

impl Drop for ChrootSession {
    fn drop(&mut self) {
        if !self.exited {
            if let Err(e) = Self::restore(&self.real_root) {
                tracing::warn!(error = %e, "failed to restore root while dropping session");
            }
            SESSION_ACTIVE.store(false, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Entering a real chroot needs root, so the tests cover the
    // registry invariant, which is pure process state.
    #[test]
    fn second_session_fails_fast() {
        assert!(SESSION_ACTIVE
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok());

        let err = ChrootSession::enter(Path::new("/nonexistent")).unwrap_err();
        assert!(format!("{err:#}").contains("already active"));

        SESSION_ACTIVE.store(false, Ordering::SeqCst);
    }
}
