//! Disk format conversion via qemu-img.
//!
//! Both operations wrap a single tool invocation. A non-zero exit is
//! fatal and carries the captured output; conversion failures are never
//! transient, so there are no retries.

use std::ffi::OsStr;
use std::path::Path;

use crate::error::Result;
use crate::process::{self, Invoker};

/// Convert a qcow2 image into a flat raw image at `dst`.
pub fn convert_to_raw(invoker: &dyn Invoker, src: &Path, dst: &Path) -> Result<()> {
    tracing::info!(src = %src.display(), dst = %dst.display(), "converting qcow2 to raw");
    process::run(
        invoker,
        "qemu-img",
        &[
            OsStr::new("convert"),
            OsStr::new("-f"),
            OsStr::new("qcow2"),
            OsStr::new("-O"),
            OsStr::new("raw"),
            src.as_os_str(),
            dst.as_os_str(),
        ],
    )?;
    Ok(())
}

/// Grow a raw image to an absolute size of `target_gib` GiB.
pub fn resize(invoker: &dyn Invoker, path: &Path, target_gib: u64) -> Result<()> {
    tracing::info!(path = %path.display(), target_gib, "resizing raw image");
    let size = format!("{}G", target_gib);
    process::run(
        invoker,
        "qemu-img",
        &[
            OsStr::new("resize"),
            OsStr::new("-f"),
            OsStr::new("raw"),
            path.as_os_str(),
            OsStr::new(&size),
        ],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::process::testing::FakeInvoker;

    #[test]
    fn convert_requests_qcow2_to_raw() {
        let fake = FakeInvoker::new();
        convert_to_raw(&fake, Path::new("/w/a.qcow2"), Path::new("/w/a.raw")).unwrap();
        let calls = fake.recorded();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "qemu-img");
        assert_eq!(
            calls[0].1,
            vec!["convert", "-f", "qcow2", "-O", "raw", "/w/a.qcow2", "/w/a.raw"]
        );
    }

    #[test]
    fn resize_passes_absolute_gib_size() {
        let fake = FakeInvoker::new();
        resize(&fake, Path::new("/w/a.raw"), 20).unwrap();
        let calls = fake.recorded();
        assert_eq!(calls[0].1, vec!["resize", "-f", "raw", "/w/a.raw", "20G"]);
    }

    #[test]
    fn tool_failure_carries_captured_output() {
        let fake = FakeInvoker::new().respond("qemu-img", 1, "", "Could not open image");
        let err = convert_to_raw(&fake, Path::new("/w/a.qcow2"), Path::new("/w/a.raw"))
            .unwrap_err();
        match err {
            Error::Tool { code, stderr, .. } => {
                assert_eq!(code, 1);
                assert!(stderr.contains("Could not open"));
            }
            other => panic!("expected Tool, got {other:?}"),
        }
    }
}
