//! Mount stack with strict LIFO unmount.
//!
//! Later mounts (host pseudo-filesystems) live under the guest root
//! mount, and the chroot needs all of them while active, so unmount
//! order is the exact reverse of mount order. The stack records each
//! successful mount and owns the unwind.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::process::{self, Invoker};

/// One mounted filesystem, in acquisition order.
#[derive(Debug, Clone)]
pub struct MountEntry {
    pub source: String,
    pub target: PathBuf,
    pub options: Option<String>,
    pub bind: bool,
}

/// Ordered stack of active mounts.
pub struct MountStack<'a> {
    invoker: &'a dyn Invoker,
    entries: Vec<MountEntry>,
}

impl<'a> MountStack<'a> {
    pub fn new(invoker: &'a dyn Invoker) -> Self {
        Self {
            invoker,
            entries: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Mount a block device with optional `-o` options.
    pub fn mount(&mut self, source: &str, target: &Path, options: Option<&str>) -> Result<()> {
        self.mount_entry(MountEntry {
            source: source.to_string(),
            target: target.to_path_buf(),
            options: options.map(str::to_string),
            bind: false,
        })
    }

    /// Bind-mount a host path into the guest tree.
    pub fn bind_mount(&mut self, source: &str, target: &Path) -> Result<()> {
        self.mount_entry(MountEntry {
            source: source.to_string(),
            target: target.to_path_buf(),
            options: None,
            bind: true,
        })
    }

    fn mount_entry(&mut self, entry: MountEntry) -> Result<()> {
        let mut args: Vec<OsString> = Vec::new();
        if entry.bind {
            args.push("--bind".into());
        }
        if let Some(options) = &entry.options {
            args.push("-o".into());
            args.push(options.into());
        }
        args.push(OsString::from(&entry.source));
        args.push(entry.target.as_os_str().to_os_string());

        process::run(self.invoker, "mount", &args)?;
        tracing::debug!(
            source = entry.source,
            target = %entry.target.display(),
            "mounted"
        );
        self.entries.push(entry);
        Ok(())
    }

    /// Unwind after a failure: unmount everything in reverse order,
    /// logging each failure instead of propagating, so the original
    /// error stays visible.
    pub fn unwind_on_error(&mut self) {
        while let Some(entry) = self.entries.pop() {
            if let Err(e) = self.umount(&entry) {
                tracing::warn!(
                    target = %entry.target.display(),
                    error = %e,
                    "unmount failed during unwind"
                );
            }
        }
    }

    /// Unwind on the success path: unmount everything in reverse order
    /// and propagate the first failure. A job is not successful while
    /// it still holds a mount.
    pub fn finish(&mut self) -> Result<()> {
        let mut first_err = None;
        while let Some(entry) = self.entries.pop() {
            if let Err(e) = self.umount(&entry) {
                tracing::warn!(target = %entry.target.display(), error = %e, "unmount failed");
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn umount(&self, entry: &MountEntry) -> Result<()> {
        process::run(self.invoker, "umount", &[entry.target.as_os_str()])?;
        Ok(())
    }
}
