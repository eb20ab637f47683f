//! Guest customization.
//!
//! Mounts the guest root (and boot partition, when the image has one),
//! bind-mounts the host pseudo-filesystems the customization script
//! needs, stages the generated artifacts, and runs the script inside a
//! chroot. The whole sequence is a straight line through
//! root mount -> boot mount -> host binds -> chroot -> script, and every
//! mount is reversed in strict LIFO order on both the success and the
//! failure path.
//!
//! Container-optimized distros ship ignition-style configuration and
//! need no guest modification; for those the customizer returns
//! immediately without touching the image.

pub mod chroot;
pub mod mounts;

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use anyhow::{bail, Context, Result};

use crate::fsgrow::FsType;
use crate::job::{Distro, Registration};
use crate::loopdev::LoopBinding;
use crate::process::{self, Invoker};
use crate::templates;
use chroot::ChrootSession;
use mounts::MountStack;

/// Host paths bind-mounted into the guest root so the customization
/// script can talk to the running kernel.
pub const HOST_BIND_PATHS: &[&str] = &["/proc", "/dev", "/sys", "/run", "/etc/machine-id"];

/// Entries every usable boot directory must carry. Versioned files
/// match by prefix, directories by exact name. A missing entry means
/// the image is malformed or already stripped, which is fatal.
pub const BOOT_MANIFEST: &[(&str, &str)] = &[
    ("kernel", "vmlinuz-"),
    ("initramfs", "initramfs-"),
    ("kernel config", "config-"),
    ("symbol map", "System.map-"),
    ("GRUB directory", "grub2"),
    ("EFI directory", "efi"),
];

/// Path of the staged customization script inside the guest root.
pub const SETUP_SCRIPT_PATH: &str = "customize.sh";

/// Everything the customizer needs from the job.
pub struct CustomizeSpec<'a> {
    pub distro: Distro,
    pub work_dir: &'a Path,
    pub binding: &'a LoopBinding,
    pub fs_type: &'a FsType,
    pub registration: Option<&'a Registration>,
    pub root_password: Option<&'a str>,
}

/// Run guest customization for one job.
pub fn run(invoker: &dyn Invoker, spec: &CustomizeSpec) -> Result<()> {
    if spec.distro.skips_customization() {
        tracing::info!(distro = %spec.distro, "distro requires no guest customization");
        return Ok(());
    }

    let root_mount = spec.work_dir.join("root");
    fs::create_dir_all(&root_mount)
        .with_context(|| format!("creating root mount point '{}'", root_mount.display()))?;

    let mut stack = MountStack::new(invoker);
    match customize_mounted(invoker, spec, &root_mount, &mut stack) {
        Ok(()) => {
            // On success a lingering mount is a job failure.
            stack.finish()?;
            Ok(())
        }
        Err(e) => {
            stack.unwind_on_error();
            Err(e)
        }
    }
}

fn customize_mounted(
    invoker: &dyn Invoker,
    spec: &CustomizeSpec,
    root_mount: &Path,
    stack: &mut MountStack,
) -> Result<()> {
    // Converted images regularly carry filesystem UUIDs duplicated from
    // their origin host; nouuid lets xfs/ext mount them anyway. btrfs
    // instead needs the product's root subvolume selected.
    let options = match spec.fs_type {
        FsType::Btrfs => "subvol=root",
        _ => "nouuid",
    };
    stack.mount(&spec.binding.partition_device(), root_mount, Some(options))?;

    mount_boot_if_declared(invoker, root_mount, stack)?;
    verify_boot_manifest(&root_mount.join("boot"))?;

    // Must happen before the host binds go up: afterwards the guest's
    // machine-id path is shadowed by the host's own file, and touching
    // it from inside the chroot would mutate the host.
    reset_machine_id(root_mount)?;

    for host_path in HOST_BIND_PATHS {
        let target = root_mount.join(host_path.trim_start_matches('/'));
        stack.bind_mount(host_path, &target)?;
    }

    stage_artifacts(spec, root_mount)?;

    let session = ChrootSession::enter(root_mount)?;
    let script = format!("/{SETUP_SCRIPT_PATH}");
    let script_result = process::run(invoker, &script, &[] as &[&str]);
    match script_result {
        Ok(output) => {
            tracing::info!(stdout = output.stdout.trim(), "customization script finished");
            session.exit()?;
            Ok(())
        }
        Err(e) => {
            // Drop restores the real root best-effort; the script
            // failure is the error worth surfacing.
            drop(session);
            Err(e).context("guest customization script failed")
        }
    }
}

/// Mount the boot partition when the guest fstab declares /boot by
/// UUID. Images without a separate boot partition keep /boot on the
/// root filesystem and need nothing here.
fn mount_boot_if_declared(
    invoker: &dyn Invoker,
    root_mount: &Path,
    stack: &mut MountStack,
) -> Result<()> {
    let fstab_path = root_mount.join("etc/fstab");
    let fstab = match fs::read_to_string(&fstab_path) {
        Ok(content) => content,
        Err(_) => return Ok(()),
    };

    let Some(uuid) = boot_uuid_from_fstab(&fstab) else {
        return Ok(());
    };

    let output = process::run(invoker, "blkid", &["--uuid", &uuid])?;
    let device = output.stdout.trim().to_string();
    if device.is_empty() {
        bail!("fstab declares boot UUID {uuid} but no block device carries it");
    }

    tracing::info!(device, uuid, "mounting boot partition");
    stack.mount(&device, &root_mount.join("boot"), None)?;
    Ok(())
}

/// Extract the UUID of the /boot entry from fstab text, if any.
fn boot_uuid_from_fstab(fstab: &str) -> Option<String> {
    for line in fstab.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split_whitespace();
        let device = fields.next()?;
        let mount_point = fields.next()?;
        if mount_point == "/boot" {
            if let Some(uuid) = device.strip_prefix("UUID=") {
                return Some(uuid.to_string());
            }
        }
    }
    None
}

/// Empty the guest's machine-id so every deployed instance generates
/// its own on first boot.
fn reset_machine_id(root_mount: &Path) -> Result<()> {
    let etc = root_mount.join("etc");
    fs::create_dir_all(&etc)
        .with_context(|| format!("creating '{}'", etc.display()))?;
    let path = etc.join("machine-id");
    fs::write(&path, "").with_context(|| format!("resetting '{}'", path.display()))?;
    Ok(())
}

/// Check the fixed boot manifest against the mounted boot directory.
fn verify_boot_manifest(boot_dir: &Path) -> Result<()> {
    let names: Vec<String> = fs::read_dir(boot_dir)
        .with_context(|| format!("reading boot directory '{}'", boot_dir.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();

    for (label, prefix) in BOOT_MANIFEST {
        let present = names
            .iter()
            .any(|name| name == prefix || name.starts_with(prefix));
        if !present {
            bail!(
                "boot directory '{}' is missing the {} ('{}*'); \
                 the image is malformed or already stripped",
                boot_dir.display(),
                label,
                prefix
            );
        }
    }
    Ok(())
}

/// Write the generated script and static cloud-init texts into the
/// guest root before entering the chroot.
fn stage_artifacts(spec: &CustomizeSpec, root_mount: &Path) -> Result<()> {
    let script = templates::render_setup_script(
        spec.distro.name(),
        spec.registration.map(|r| r.username.as_str()),
        spec.registration.map(|r| r.password.as_str()),
        spec.root_password,
    );
    let script_path = root_mount.join(SETUP_SCRIPT_PATH);
    fs::write(&script_path, script)
        .with_context(|| format!("staging '{}'", script_path.display()))?;
    fs::set_permissions(&script_path, fs::Permissions::from_mode(0o755))?;

    let cloud_dir = root_mount.join("etc/cloud");
    fs::create_dir_all(&cloud_dir)
        .with_context(|| format!("creating '{}'", cloud_dir.display()))?;
    fs::write(cloud_dir.join("cloud.cfg"), templates::cloud_config())?;
    fs::write(
        cloud_dir.join("ds-identify.cfg"),
        templates::ds_identify_policy(),
    )?;

    tracing::debug!(root = %root_mount.display(), "staged customization artifacts");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::testing::FakeInvoker;

    #[test]
    fn coreos_performs_no_operations() {
        let fake = FakeInvoker::new();
        let tmp = tempfile::tempdir().unwrap();
        let binding = LoopBinding {
            backing: tmp.path().join("disk.raw"),
            device: "/dev/loop0".to_string(),
            partition: 3,
        };
        let spec = CustomizeSpec {
            distro: Distro::CoreOs,
            work_dir: tmp.path(),
            binding: &binding,
            fs_type: &FsType::Ext4,
            registration: None,
            root_password: None,
        };
        run(&fake, &spec).unwrap();
        assert!(fake.recorded().is_empty());
    }

    #[test]
    fn fstab_boot_uuid_is_extracted() {
        let fstab = "\
# /etc/fstab
UUID=aaaa-bbbb /      xfs defaults 0 0
UUID=cccc-dddd /boot  xfs defaults 0 0
tmpfs          /tmp   tmpfs defaults 0 0
";
        assert_eq!(
            boot_uuid_from_fstab(fstab).as_deref(),
            Some("cccc-dddd")
        );
    }

    #[test]
    fn fstab_without_boot_entry_yields_none() {
        let fstab = "UUID=aaaa-bbbb / xfs defaults 0 0\n";
        assert_eq!(boot_uuid_from_fstab(fstab), None);
        // Device-path boot entries (no UUID=) also do not qualify.
        let fstab = "/dev/sda1 /boot xfs defaults 0 0\n";
        assert_eq!(boot_uuid_from_fstab(fstab), None);
    }

    #[test]
    fn guest_machine_id_is_emptied_in_place() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir(tmp.path().join("etc")).unwrap();
        fs::write(
            tmp.path().join("etc/machine-id"),
            "6f3c2e1d5a1b9d4e52aa7b4a8c9f0e8a\n",
        )
        .unwrap();

        reset_machine_id(tmp.path()).unwrap();
        assert_eq!(
            fs::read(tmp.path().join("etc/machine-id")).unwrap(),
            b""
        );
    }

    #[test]
    fn complete_boot_manifest_passes() {
        let tmp = tempfile::tempdir().unwrap();
        for name in [
            "vmlinuz-5.14.0-362.el9.x86_64",
            "initramfs-5.14.0-362.el9.x86_64.img",
            "config-5.14.0-362.el9.x86_64",
            "System.map-5.14.0-362.el9.x86_64",
        ] {
            fs::write(tmp.path().join(name), b"").unwrap();
        }
        fs::create_dir(tmp.path().join("grub2")).unwrap();
        fs::create_dir(tmp.path().join("efi")).unwrap();

        verify_boot_manifest(tmp.path()).unwrap();
    }

    #[test]
    fn stripped_boot_directory_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("vmlinuz-5.14.0"), b"").unwrap();
        let err = verify_boot_manifest(tmp.path()).unwrap_err();
        assert!(format!("{err:#}").contains("initramfs"));
    }

    #[test]
    fn staged_artifacts_land_at_fixed_guest_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let binding = LoopBinding {
            backing: tmp.path().join("disk.raw"),
            device: "/dev/loop0".to_string(),
            partition: 3,
        };
        let registration = Registration {
            username: "subs-user".to_string(),
            password: "subs-pass".to_string(),
        };
        let spec = CustomizeSpec {
            distro: Distro::Rhel,
            work_dir: tmp.path(),
            binding: &binding,
            fs_type: &FsType::Xfs,
            registration: Some(&registration),
            root_password: Some("secret"),
        };
        stage_artifacts(&spec, tmp.path()).unwrap();

        let script = fs::read_to_string(tmp.path().join("customize.sh")).unwrap();
        assert!(script.contains("subs-user"));
        assert!(script.contains("root:secret"));
        let mode = fs::metadata(tmp.path().join("customize.sh"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o755);

        assert!(tmp.path().join("etc/cloud/cloud.cfg").exists());
        assert!(tmp.path().join("etc/cloud/ds-identify.cfg").exists());
    }
}
