//! Loop device management.
//!
//! Binds the raw image file to a loop block device so partition and
//! filesystem tools can operate on it. Loop devices are a host-wide
//! resource: allocation is serialized behind a process mutex, a job
//! holds at most one binding, and release runs on every exit path.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::Result;
use crate::process::{self, Invoker};

/// Serializes find-and-bind across the process. The losetup call is
/// atomic at the OS level, but two jobs racing here would violate the
/// one-binding-per-job accounting.
static LOOP_ALLOC: Mutex<()> = Mutex::new(());

/// An image file bound to a loop device.
///
/// `partition` is the index of the data partition (the last partition
/// in the table, per the product's image layout).
#[derive(Debug)]
pub struct LoopBinding {
    pub backing: PathBuf,
    pub device: String,
    pub partition: u32,
}

impl LoopBinding {
    /// Block device path of the data partition, e.g. `/dev/loop0p3`.
    pub fn partition_device(&self) -> String {
        format!("{}p{}", self.device, self.partition)
    }
}

/// Bind `file` to the next free loop device, rescan its partition
/// table, and determine the data partition.
pub fn bind(invoker: &dyn Invoker, file: &Path) -> Result<LoopBinding> {
    let _guard = LOOP_ALLOC.lock().unwrap_or_else(|e| e.into_inner());

    let output = process::run(
        invoker,
        "losetup",
        &[
            OsStr::new("--find"),
            OsStr::new("--show"),
            file.as_os_str(),
        ],
    )?;
    let device = output.stdout.trim().to_string();
    tracing::info!(file = %file.display(), device, "bound loop device");

    rescan(invoker, &device)?;
    let count = partition_count(invoker, &device)?;

    Ok(LoopBinding {
        backing: file.to_path_buf(),
        device,
        partition: count,
    })
}

/// Force the kernel to re-read the partition table of `device`.
pub fn rescan(invoker: &dyn Invoker, device: &str) -> Result<()> {
    process::run(invoker, "partprobe", &[device])?;
    Ok(())
}

/// Count partitions on `device` by parsing the `sfdisk --dump` table.
pub fn partition_count(invoker: &dyn Invoker, device: &str) -> Result<u32> {
    let output = process::run(invoker, "sfdisk", &["--dump", device])?;
    Ok(count_partition_lines(&output.stdout, device))
}

fn count_partition_lines(dump: &str, device: &str) -> u32 {
    let prefix = format!("{}p", device);
    dump.lines()
        .filter(|line| {
            line.split(':')
                .next()
                .map(|dev| dev.trim().starts_with(&prefix))
                .unwrap_or(false)
        })
        .count() as u32
}

/// Release a loop device. Always attempted during cleanup, where a
/// failure must not mask the error that triggered the unwind, so this
/// logs instead of propagating.
pub fn unbind(invoker: &dyn Invoker, device: &str) {
    match process::run(invoker, "losetup", &["--detach", device]) {
        Ok(_) => tracing::info!(device, "released loop device"),
        Err(e) => tracing::warn!(device, error = %e, "failed to release loop device"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::testing::FakeInvoker;

    const DUMP: &str = "\
label: gpt
label-id: 8A0E9F8C-4A7B-4E52-9D1B-5A6F3C2E1D00
device: /dev/loop0
unit: sectors

/dev/loop0p1 : start=2048, size=204800, type=C12A7328-F81F-11D2-BA4B-00A0C93EC93B
/dev/loop0p2 : start=206848, size=2097152, type=0FC63DAF-8483-4772-8E79-3D69D8477DE4
/dev/loop0p3 : start=2304000, size=18618368, type=0FC63DAF-8483-4772-8E79-3D69D8477DE4
";

    #[test]
    fn bind_discovers_device_and_data_partition() {
        let fake = FakeInvoker::new()
            .respond("losetup", 0, "/dev/loop0\n", "")
            .respond("sfdisk", 0, DUMP, "");
        let binding = bind(&fake, Path::new("/work/disk.raw")).unwrap();
        assert_eq!(binding.device, "/dev/loop0");
        assert_eq!(binding.partition, 3);
        assert_eq!(binding.partition_device(), "/dev/loop0p3");

        let programs: Vec<String> = fake.recorded().into_iter().map(|(p, _)| p).collect();
        assert_eq!(programs, vec!["losetup", "partprobe", "sfdisk"]);
    }

    #[test]
    fn partition_count_ignores_header_lines() {
        assert_eq!(count_partition_lines(DUMP, "/dev/loop0"), 3);
        assert_eq!(count_partition_lines("label: gpt\n", "/dev/loop0"), 0);
    }

    #[test]
    fn partition_count_does_not_match_other_devices() {
        let dump = "/dev/loop10p1 : start=2048, size=100\n";
        assert_eq!(count_partition_lines(dump, "/dev/loop1"), 0);
        assert_eq!(count_partition_lines(dump, "/dev/loop10"), 1);
    }

    #[test]
    fn unbind_swallows_failure() {
        let fake = FakeInvoker::new().respond("losetup", 1, "", "device is busy");
        // Must not panic or propagate; cleanup paths depend on it.
        unbind(&fake, "/dev/loop0");
        assert_eq!(fake.recorded().len(), 1);
    }
}
