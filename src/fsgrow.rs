//! Partition and filesystem growth.
//!
//! After the raw image is resized, the data partition is extended to
//! the end of the backing device and the filesystem inside it is grown
//! with the tool matching its type. btrfs is the odd one out: it can
//! only be resized through a mounted subvolume path, so the caller must
//! mount it first; the others are grown offline against the partition
//! device.

use std::fmt;
use std::path::Path;

use crate::error::{Error, Result};
use crate::process::{self, Invoker};

/// Filesystem types the grower knows how to handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsType {
    Ext2,
    Ext3,
    Ext4,
    Xfs,
    Btrfs,
    /// Anything else the probe reported. Fatal: growing a filesystem we
    /// do not understand could corrupt the image.
    Unknown(String),
}

impl FsType {
    pub fn parse(probe: &str) -> FsType {
        match probe.trim() {
            "ext2" => FsType::Ext2,
            "ext3" => FsType::Ext3,
            "ext4" => FsType::Ext4,
            "xfs" => FsType::Xfs,
            "btrfs" => FsType::Btrfs,
            other => FsType::Unknown(other.to_string()),
        }
    }
}

impl fmt::Display for FsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FsType::Ext2 => write!(f, "ext2"),
            FsType::Ext3 => write!(f, "ext3"),
            FsType::Ext4 => write!(f, "ext4"),
            FsType::Xfs => write!(f, "xfs"),
            FsType::Btrfs => write!(f, "btrfs"),
            FsType::Unknown(s) => write!(f, "{}", s),
        }
    }
}

/// Extend partition `index` of `device` to the end of the backing file.
pub fn grow_partition(invoker: &dyn Invoker, device: &str, index: u32) -> Result<()> {
    tracing::info!(device, index, "growing partition");
    process::run(invoker, "growpart", &[device, &index.to_string()])?;
    Ok(())
}

/// Probe the superblock of `partition_device` for its filesystem type.
pub fn detect_fs_type(invoker: &dyn Invoker, partition_device: &str) -> Result<FsType> {
    let output = process::run(
        invoker,
        "blkid",
        &["-o", "value", "-s", "TYPE", partition_device],
    )?;
    let fs = FsType::parse(&output.stdout);
    tracing::info!(partition_device, %fs, "detected filesystem type");
    Ok(fs)
}

/// Grow the filesystem on `partition_device` to fill its partition.
///
/// For btrfs, `mounted_at` must point at the mounted root subvolume;
/// the resize is issued against that path with size `max`. For the
/// other supported types the partition may be unmounted.
pub fn grow_filesystem(
    invoker: &dyn Invoker,
    partition_device: &str,
    fs: &FsType,
    mounted_at: Option<&Path>,
) -> Result<()> {
    tracing::info!(partition_device, %fs, "growing filesystem");
    match fs {
        FsType::Ext2 | FsType::Ext3 | FsType::Ext4 => {
            process::run(invoker, "resize2fs", &[partition_device])?;
        }
        FsType::Xfs => {
            process::run(invoker, "xfs_growfs", &[partition_device])?;
        }
        FsType::Btrfs => {
            let mount = mounted_at.ok_or_else(|| {
                Error::Io(std::io::Error::other(
                    "btrfs resize requires the filesystem to be mounted first",
                ))
            })?;
            process::run(
                invoker,
                "btrfs",
                &[
                    std::ffi::OsStr::new("filesystem"),
                    std::ffi::OsStr::new("resize"),
                    std::ffi::OsStr::new("max"),
                    mount.as_os_str(),
                ],
            )?;
        }
        FsType::Unknown(name) => {
            return Err(Error::UnsupportedFormat(name.clone()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::testing::FakeInvoker;

    #[test]
    fn probe_output_maps_to_known_types() {
        assert_eq!(FsType::parse("ext4\n"), FsType::Ext4);
        assert_eq!(FsType::parse("xfs"), FsType::Xfs);
        assert_eq!(FsType::parse("btrfs"), FsType::Btrfs);
        assert_eq!(
            FsType::parse("vfat"),
            FsType::Unknown("vfat".to_string())
        );
    }

    #[test]
    fn ext_family_dispatches_to_resize2fs() {
        for fs in [FsType::Ext2, FsType::Ext3, FsType::Ext4] {
            let fake = FakeInvoker::new();
            grow_filesystem(&fake, "/dev/loop0p3", &fs, None).unwrap();
            let calls = fake.recorded();
            assert_eq!(calls[0].0, "resize2fs");
            assert_eq!(calls[0].1, vec!["/dev/loop0p3"]);
        }
    }

    #[test]
    fn xfs_dispatches_to_xfs_growfs() {
        let fake = FakeInvoker::new();
        grow_filesystem(&fake, "/dev/loop0p3", &FsType::Xfs, None).unwrap();
        assert_eq!(fake.recorded()[0].0, "xfs_growfs");
    }

    #[test]
    fn btrfs_resizes_max_against_the_mount_point() {
        let fake = FakeInvoker::new();
        grow_filesystem(
            &fake,
            "/dev/loop0p3",
            &FsType::Btrfs,
            Some(Path::new("/work/root")),
        )
        .unwrap();
        let calls = fake.recorded();
        assert_eq!(calls[0].0, "btrfs");
        assert_eq!(
            calls[0].1,
            vec!["filesystem", "resize", "max", "/work/root"]
        );
    }

    #[test]
    fn btrfs_without_mount_fails_without_invoking_anything() {
        let fake = FakeInvoker::new();
        assert!(grow_filesystem(&fake, "/dev/loop0p3", &FsType::Btrfs, None).is_err());
        assert!(fake.recorded().is_empty());
    }

    #[test]
    fn unknown_type_is_fatal_and_mutates_nothing() {
        let fake = FakeInvoker::new();
        let err =
            grow_filesystem(&fake, "/dev/loop0p3", &FsType::Unknown("ntfs".into()), None)
                .unwrap_err();
        assert!(matches!(err, Error::UnsupportedFormat(ref t) if t == "ntfs"));
        assert!(fake.recorded().is_empty());
    }

    #[test]
    fn detect_parses_blkid_value_output() {
        let fake = FakeInvoker::new().respond("blkid", 0, "xfs\n", "");
        assert_eq!(detect_fs_type(&fake, "/dev/loop0p3").unwrap(), FsType::Xfs);
    }
}
