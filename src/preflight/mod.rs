//! Preflight checks run before any mutating pipeline step.
//!
//! Validates the host before a conversion starts. This prevents cryptic
//! errors halfway through a job that has already bound a loop device or
//! mounted guest filesystems.
//!
//! Rules are data: each carries a name, a read-only check, and a
//! remediation hint. They run in registration order and the first
//! failure aborts the whole pipeline with that rule's name and hint.
//!
//! # Example
//!
//! ```rust,ignore
//! use ova_builder::preflight::{self, PreflightContext};
//!
//! let ctx = PreflightContext {
//!     work_dir: Path::new("/var/tmp"),
//!     output_path: Path::new("./rhel-9.ova.gz"),
//!     target_size_gib: 20,
//! };
//! preflight::validate(&preflight::default_rules(), &ctx, &[])?;
//! ```

use std::path::Path;

use anyhow::{bail, Context as _};

use crate::error::{Error, Result};

/// Free space the working directory must have beyond the target disk
/// size. Conversion holds the qcow2 source, the grown raw disk, and the
/// archive at the same time.
pub const FREE_SPACE_MARGIN_GIB: u64 = 50;

/// Host tools the pipeline shells out to, as (command, package) pairs.
pub const REQUIRED_TOOLS: &[(&str, &str)] = &[
    ("qemu-img", "qemu-img"),
    ("losetup", "util-linux"),
    ("partprobe", "parted"),
    ("sfdisk", "util-linux"),
    ("blkid", "util-linux"),
    ("growpart", "cloud-utils-growpart"),
    ("resize2fs", "e2fsprogs"),
    ("xfs_growfs", "xfsprogs"),
    ("btrfs", "btrfs-progs"),
    ("mount", "util-linux"),
    ("umount", "util-linux"),
];

/// Read-only facts a rule may inspect.
pub struct PreflightContext<'a> {
    /// Directory the job will create its working directory under.
    pub work_dir: &'a Path,
    /// Final artifact path the user asked for.
    pub output_path: &'a Path,
    /// Requested disk size in GiB.
    pub target_size_gib: u64,
}

/// A named validation rule with a remediation hint.
pub struct ValidationRule {
    pub name: &'static str,
    pub hint: &'static str,
    check: fn(&PreflightContext) -> anyhow::Result<()>,
}

/// The registered rule set, in evaluation order.
pub fn default_rules() -> Vec<ValidationRule> {
    vec![
        ValidationRule {
            name: "platform",
            hint: "run the conversion on a 64-bit x86 Linux host",
            check: check_platform,
        },
        ValidationRule {
            name: "privilege",
            hint: "re-run as root; loop devices, mounts and chroot require it",
            check: check_privilege,
        },
        ValidationRule {
            name: "output-absent",
            hint: "remove the existing artifact or choose another image name",
            check: check_output_absent,
        },
        ValidationRule {
            name: "tools",
            hint: "install the listed packages and re-run",
            check: check_tools,
        },
        ValidationRule {
            name: "free-space",
            hint: "free up disk space or point the working directory at a larger volume",
            check: check_free_space,
        },
    ]
}

/// Evaluate rules in registration order, skipping any whose name is in
/// `skip`. Stops at the first failure; later rules do not execute.
pub fn validate(rules: &[ValidationRule], ctx: &PreflightContext, skip: &[String]) -> Result<()> {
    for rule in rules {
        if skip.iter().any(|s| s == rule.name) {
            tracing::info!(rule = rule.name, "preflight check skipped by request");
            continue;
        }
        if let Err(cause) = (rule.check)(ctx) {
            return Err(Error::Validation {
                rule: rule.name.to_string(),
                cause: format!("{cause:#}"),
                hint: rule.hint.to_string(),
            });
        }
        tracing::debug!(rule = rule.name, "preflight check passed");
    }
    Ok(())
}

fn check_platform(_ctx: &PreflightContext) -> anyhow::Result<()> {
    let os = std::env::consts::OS;
    let arch = std::env::consts::ARCH;
    if os != "linux" || arch != "x86_64" {
        bail!("unsupported platform {}/{}", os, arch);
    }
    Ok(())
}

fn check_privilege(_ctx: &PreflightContext) -> anyhow::Result<()> {
    // geteuid never fails.
    let euid = unsafe { libc::geteuid() };
    if euid != 0 {
        bail!("effective uid is {}, not 0", euid);
    }
    Ok(())
}

fn check_output_absent(ctx: &PreflightContext) -> anyhow::Result<()> {
    if ctx.output_path.exists() {
        bail!("artifact '{}' already exists", ctx.output_path.display());
    }
    Ok(())
}

fn check_tools(_ctx: &PreflightContext) -> anyhow::Result<()> {
    let mut missing = Vec::new();
    for (tool, package) in REQUIRED_TOOLS {
        if which::which(tool).is_err() {
            missing.push(format!("  {} (install: {})", tool, package));
        }
    }
    if !missing.is_empty() {
        bail!("missing required host tools:\n{}", missing.join("\n"));
    }
    Ok(())
}

fn check_free_space(ctx: &PreflightContext) -> anyhow::Result<()> {
    let available = fs2::available_space(ctx.work_dir)
        .with_context(|| format!("statfs on '{}'", ctx.work_dir.display()))?;
    let needed = (ctx.target_size_gib + FREE_SPACE_MARGIN_GIB) * 1024 * 1024 * 1024;
    if available < needed {
        bail!(
            "{} GiB available in '{}', need {} GiB (target {} + {} margin)",
            available / (1024 * 1024 * 1024),
            ctx.work_dir.display(),
            ctx.target_size_gib + FREE_SPACE_MARGIN_GIB,
            ctx.target_size_gib,
            FREE_SPACE_MARGIN_GIB,
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ctx<'a>(work_dir: &'a Path, output: &'a Path) -> PreflightContext<'a> {
        PreflightContext {
            work_dir,
            output_path: output,
            target_size_gib: 20,
        }
    }

    #[test]
    fn first_failure_stops_evaluation() {
        static LATER_RAN: AtomicUsize = AtomicUsize::new(0);

        fn fails(_: &PreflightContext) -> anyhow::Result<()> {
            bail!("only 3 GiB available")
        }
        fn counts(_: &PreflightContext) -> anyhow::Result<()> {
            LATER_RAN.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        let rules = vec![
            ValidationRule {
                name: "free-space",
                hint: "free up disk space",
                check: fails,
            },
            ValidationRule {
                name: "after",
                hint: "never reached",
                check: counts,
            },
        ];

        let tmp = tempfile::tempdir().unwrap();
        let output = tmp.path().join("img.ova.gz");
        let err = validate(&rules, &ctx(tmp.path(), &output), &[]).unwrap_err();
        match err {
            Error::Validation { rule, hint, cause } => {
                assert_eq!(rule, "free-space");
                assert_eq!(hint, "free up disk space");
                assert!(cause.contains("3 GiB"));
            }
            other => panic!("expected Validation, got {other:?}"),
        }
        assert_eq!(LATER_RAN.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn skipped_rules_do_not_run() {
        fn fails(_: &PreflightContext) -> anyhow::Result<()> {
            bail!("would fail")
        }
        let rules = vec![ValidationRule {
            name: "privilege",
            hint: "re-run as root",
            check: fails,
        }];

        let tmp = tempfile::tempdir().unwrap();
        let output = tmp.path().join("img.ova.gz");
        validate(&rules, &ctx(tmp.path(), &output), &["privilege".to_string()])
            .expect("skipped rule must not fail validation");
    }

    #[test]
    fn output_absent_rejects_existing_artifact() {
        let tmp = tempfile::tempdir().unwrap();
        let output = tmp.path().join("img.ova.gz");
        std::fs::write(&output, b"old").unwrap();
        let err = validate(&default_rules()[2..3], &ctx(tmp.path(), &output), &[]).unwrap_err();
        match err {
            Error::Validation { rule, .. } => assert_eq!(rule, "output-absent"),
            other => panic!("expected Validation, got {other:?}"),
        }
    }

    #[test]
    fn required_tools_table_is_well_formed() {
        assert!(!REQUIRED_TOOLS.is_empty());
        for (tool, package) in REQUIRED_TOOLS {
            assert!(!tool.is_empty());
            assert!(!package.is_empty());
        }
    }
}
