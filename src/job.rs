//! Conversion jobs and the pipeline that runs them.
//!
//! A [`ConversionJob`] owns one source-to-OVA conversion end to end:
//! preflight, acquisition, format conversion, loop binding, growth,
//! guest customization, packaging, compression. Each job creates a
//! fresh exclusively-owned working directory and removes it when the
//! job ends, success or not. Host-wide resources (the loop device, the
//! working directory) are registered on a LIFO release stack at
//! acquisition time and unwound in one finalization pass.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use url::Url;

use crate::cleanup::ReleaseStack;
use crate::customize::{self, CustomizeSpec};
use crate::fsgrow::{self, FsType};
use crate::preflight::{self, PreflightContext};
use crate::process::Invoker;
use crate::{acquire, compress, convert, loopdev, ova};

/// Target distro families the pipeline knows how to prepare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Distro {
    Rhel,
    Centos,
    Sles,
    Ubuntu,
    CoreOs,
}

impl Distro {
    pub fn parse(tag: &str) -> Result<Distro> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "rhel" => Ok(Distro::Rhel),
            "centos" => Ok(Distro::Centos),
            "sles" => Ok(Distro::Sles),
            "ubuntu" => Ok(Distro::Ubuntu),
            "coreos" => Ok(Distro::CoreOs),
            other => bail!(
                "unsupported distro '{}'; expected one of: rhel, centos, sles, ubuntu, coreos",
                other
            ),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Distro::Rhel => "rhel",
            Distro::Centos => "centos",
            Distro::Sles => "sles",
            Distro::Ubuntu => "ubuntu",
            Distro::CoreOs => "coreos",
        }
    }

    /// Container-optimized images configure themselves on first boot
    /// via ignition and must not be modified here.
    pub fn skips_customization(&self) -> bool {
        matches!(self, Distro::CoreOs)
    }

    /// CIM operating-system identifier written into the OVF descriptor.
    pub fn guest_os_id(&self) -> u32 {
        match self {
            Distro::Rhel | Distro::Centos => 80,
            Distro::Sles => 85,
            Distro::Ubuntu => 94,
            Distro::CoreOs => 101,
        }
    }
}

impl fmt::Display for Distro {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Subscription credentials passed through to the guest setup script.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Registration {
    pub username: String,
    pub password: String,
}

/// On-disk job description, loaded from TOML.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobConfig {
    /// Local path or URL of the qcow2 source image.
    pub source: String,
    /// Target distro tag (rhel, centos, sles, ubuntu, coreos).
    pub distro: String,
    /// Target disk size in GiB.
    pub target_size_gib: u64,
    /// Directory the final artifact is written to. Defaults to the
    /// current directory.
    pub output_dir: Option<PathBuf>,
    /// Directory working state lives under. Defaults to /var/tmp.
    pub work_root: Option<PathBuf>,
    /// Network fetch budget in seconds. Defaults to 30 minutes.
    pub fetch_timeout_secs: Option<u64>,
    pub registration: Option<Registration>,
    pub root_password: Option<String>,
    /// Names of preflight checks to skip.
    #[serde(default)]
    pub skip_checks: Vec<String>,
}

impl JobConfig {
    pub fn load(path: &Path) -> Result<JobConfig> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading job config '{}'", path.display()))?;
        toml::from_str(&text).with_context(|| format!("invalid job config '{}'", path.display()))
    }
}

/// One conversion, validated and ready to run.
pub struct ConversionJob {
    pub source: String,
    pub distro: Distro,
    pub target_size_gib: u64,
    pub image_name: String,
    pub output_dir: PathBuf,
    pub work_root: PathBuf,
    pub fetch_timeout: Duration,
    pub registration: Option<Registration>,
    pub root_password: Option<String>,
    pub skip_checks: Vec<String>,
}

impl ConversionJob {
    pub fn from_config(config: JobConfig) -> Result<ConversionJob> {
        let distro = Distro::parse(&config.distro)?;
        let image_name = image_name_from_source(&config.source)?;
        Ok(ConversionJob {
            source: config.source,
            distro,
            target_size_gib: config.target_size_gib,
            image_name,
            output_dir: config
                .output_dir
                .unwrap_or_else(|| PathBuf::from(".")),
            work_root: config
                .work_root
                .unwrap_or_else(|| PathBuf::from("/var/tmp")),
            fetch_timeout: config
                .fetch_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(acquire::DEFAULT_FETCH_TIMEOUT),
            registration: config.registration,
            root_password: config.root_password,
            skip_checks: config.skip_checks,
        })
    }

    /// Final artifact path: `<output_dir>/<image>.ova.gz`.
    pub fn artifact_path(&self) -> PathBuf {
        self.output_dir.join(format!("{}.ova.gz", self.image_name))
    }

    /// Run the whole pipeline. Returns the final artifact path.
    ///
    /// Once destructive steps begin the job runs to completion or
    /// explicit failure; cleanup (unmount, loop unbind, workdir
    /// removal) happens on every exit path before the error surfaces.
    pub fn run(&self, invoker: &dyn Invoker) -> Result<PathBuf> {
        let artifact = self.artifact_path();
        preflight::validate(
            &preflight::default_rules(),
            &PreflightContext {
                work_dir: &self.work_root,
                output_path: &artifact,
                target_size_gib: self.target_size_gib,
            },
            &self.skip_checks,
        )?;

        let work_dir = self.create_work_dir()?;
        let mut releases = ReleaseStack::new();
        {
            let work_dir = work_dir.clone();
            releases.push("working directory", move || {
                fs::remove_dir_all(&work_dir)
                    .with_context(|| format!("removing '{}'", work_dir.display()))
            });
        }

        match self.run_steps(invoker, &work_dir, &mut releases, &artifact) {
            Ok(path) => {
                releases.finish()?;
                tracing::info!(artifact = %path.display(), "conversion complete");
                Ok(path)
            }
            Err(e) => {
                tracing::warn!(error = %e, "conversion failed, unwinding");
                releases.unwind_on_error();
                Err(e)
            }
        }
    }

    fn run_steps<'a>(
        &'a self,
        invoker: &'a dyn Invoker,
        work_dir: &Path,
        releases: &mut ReleaseStack<'a>,
        artifact: &Path,
    ) -> Result<PathBuf> {
        let source = acquire::acquire(work_dir, &self.source, self.fetch_timeout)
            .context("acquiring source image")?;

        let raw = work_dir.join(format!("{}.raw", self.image_name));
        convert::convert_to_raw(invoker, &source, &raw)?;
        // The qcow2 copy is no longer needed; free its space before the
        // raw image grows.
        fs::remove_file(&source)
            .with_context(|| format!("removing source copy '{}'", source.display()))?;
        convert::resize(invoker, &raw, self.target_size_gib)?;

        let binding = loopdev::bind(invoker, &raw)?;
        {
            let device = binding.device.clone();
            releases.push("loop device", move || {
                loopdev::unbind(invoker, &device);
                Ok(())
            });
        }

        fsgrow::grow_partition(invoker, &binding.device, binding.partition)?;
        loopdev::rescan(invoker, &binding.device)?;

        let partition_device = binding.partition_device();
        let fs_type = fsgrow::detect_fs_type(invoker, &partition_device)?;
        self.grow_filesystem(invoker, work_dir, &partition_device, &fs_type)?;

        customize::run(
            invoker,
            &CustomizeSpec {
                distro: self.distro,
                work_dir,
                binding: &binding,
                fs_type: &fs_type,
                registration: self.registration.as_ref(),
                root_password: self.root_password.as_deref(),
            },
        )
        .context("customizing guest image")?;

        let archive = work_dir.join(format!("{}.ova", self.image_name));
        ova::package(
            work_dir,
            &archive,
            &self.image_name,
            self.target_size_gib,
            self.distro,
        )
        .context("packaging OVA")?;

        let compressed = compress::compress(&archive)?;

        // The artifact under the requested name appears only once
        // packaging and compression have fully completed.
        fs::create_dir_all(&self.output_dir)
            .with_context(|| format!("creating output dir '{}'", self.output_dir.display()))?;
        move_file(&compressed, artifact)?;
        Ok(artifact.to_path_buf())
    }

    /// Grow the filesystem in the data partition. Non-btrfs types grow
    /// offline; btrfs can only be resized through a mounted path, so it
    /// gets a scoped mount of the root subvolume just for the resize.
    fn grow_filesystem(
        &self,
        invoker: &dyn Invoker,
        work_dir: &Path,
        partition_device: &str,
        fs_type: &FsType,
    ) -> Result<()> {
        if *fs_type != FsType::Btrfs {
            fsgrow::grow_filesystem(invoker, partition_device, fs_type, None)?;
            return Ok(());
        }

        let mount_point = work_dir.join("grow");
        fs::create_dir_all(&mount_point)?;
        let mut stack = customize::mounts::MountStack::new(invoker);
        stack.mount(partition_device, &mount_point, Some("subvol=root"))?;
        let result = fsgrow::grow_filesystem(invoker, partition_device, fs_type, Some(&mount_point));
        match result {
            Ok(()) => stack.finish().map_err(Into::into),
            Err(e) => {
                stack.unwind_on_error();
                Err(e.into())
            }
        }
    }

    /// Create the job's exclusively owned working directory. A stale
    /// directory from a crashed run is removed first; the job must
    /// start from an empty tree.
    fn create_work_dir(&self) -> Result<PathBuf> {
        let work_dir = self
            .work_root
            .join(format!("ova-builder-{}", self.image_name));
        if work_dir.exists() {
            fs::remove_dir_all(&work_dir).with_context(|| {
                format!("removing stale working directory '{}'", work_dir.display())
            })?;
        }
        fs::create_dir_all(&work_dir)
            .with_context(|| format!("creating working directory '{}'", work_dir.display()))?;
        Ok(work_dir)
    }
}

/// Image name: basename of the source reference without its extension.
/// URL sources use the parsed path, so query strings and fragments do
/// not leak into the name and it always matches the acquired file.
fn image_name_from_source(source: &str) -> Result<String> {
    let basename = match Url::parse(source) {
        Ok(url) if url.has_host() => url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|s| !s.is_empty())
            .map(str::to_string),
        _ => source
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .map(str::to_string),
    }
    .with_context(|| format!("cannot derive an image name from '{source}'"))?;
    let name = basename.strip_suffix(".qcow2").unwrap_or(&basename);
    if name.is_empty() {
        bail!("cannot derive an image name from '{source}'");
    }
    Ok(name.to_string())
}

fn move_file(from: &Path, to: &Path) -> Result<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    // Cross-filesystem: copy then remove.
    fs::copy(from, to)
        .with_context(|| format!("copying '{}' to '{}'", from.display(), to.display()))?;
    fs::remove_file(from)?;
    Ok(())
}
