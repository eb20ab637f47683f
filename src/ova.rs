//! OVA packaging.
//!
//! Renders the OVF descriptor and volume metadata from the finished raw
//! disk's size and writes a single tar archive containing, in order:
//! descriptor, metadata, raw disk. The disk entry's header records the
//! file's real size and modification time; the bytes go in verbatim.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use anyhow::{Context, Result};
use tar::{Builder, Header};

use crate::job::Distro;

/// Immutable description of one packaged image. Computed once from the
/// finished disk, consumed once by [`package`].
#[derive(Debug, Clone)]
pub struct OvaSpec {
    pub image_name: String,
    pub volume_name: String,
    /// Real byte size of the grown raw disk.
    pub source_size_bytes: u64,
    /// Requested capacity in bytes (GiB * 2^30).
    pub target_size_bytes: u64,
    pub guest_os_id: u32,
}

impl OvaSpec {
    pub fn new(image_name: &str, source_size_bytes: u64, target_size_gib: u64, distro: Distro) -> Self {
        OvaSpec {
            image_name: image_name.to_string(),
            volume_name: format!("{image_name}-vol"),
            source_size_bytes,
            target_size_bytes: target_size_gib << 30,
            guest_os_id: distro.guest_os_id(),
        }
    }

    /// Render the OVF descriptor text.
    pub fn render_descriptor(&self) -> String {
        crate::templates::render_ovf(
            &self.image_name,
            &self.volume_name,
            self.source_size_bytes,
            self.target_size_bytes,
            self.guest_os_id,
        )
    }

    /// Render the volume metadata text.
    pub fn render_meta(&self) -> String {
        crate::templates::render_meta(&self.image_name)
    }
}

/// Bundle the grown raw disk found in `dir` into `target` as an OVA.
///
/// Fails verbatim with the stat error when the raw disk is absent;
/// there is no fallback disk.
pub fn package(
    dir: &Path,
    target: &Path,
    image_name: &str,
    target_size_gib: u64,
    distro: Distro,
) -> Result<PathBuf> {
    let disk_path = dir.join(format!("{image_name}.raw"));
    let disk_meta = fs::metadata(&disk_path)?;

    let spec = OvaSpec::new(image_name, disk_meta.len(), target_size_gib, distro);
    let descriptor = spec.render_descriptor();
    let meta = spec.render_meta();

    tracing::info!(
        disk = %disk_path.display(),
        size = disk_meta.len(),
        target = %target.display(),
        "packaging OVA"
    );

    let archive = File::create(target)
        .with_context(|| format!("creating archive '{}'", target.display()))?;
    let mut builder = Builder::new(archive);

    let mtime = disk_meta
        .modified()?
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    append_text(
        &mut builder,
        &format!("{image_name}.ovf"),
        &descriptor,
        mtime,
    )?;
    append_text(&mut builder, &format!("{image_name}.meta"), &meta, mtime)?;

    let mut disk = File::open(&disk_path)?;
    let mut header = Header::new_gnu();
    header.set_size(disk_meta.len());
    header.set_mtime(mtime);
    header.set_mode(0o644);
    builder
        .append_data(&mut header, format!("{image_name}.raw"), &mut disk)
        .context("appending raw disk to archive")?;

    builder.into_inner().context("finalizing archive")?.sync_all()?;
    Ok(target.to_path_buf())
}

fn append_text(
    builder: &mut Builder<File>,
    name: &str,
    content: &str,
    mtime: u64,
) -> Result<()> {
    let mut header = Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mtime(mtime);
    header.set_mode(0o644);
    builder
        .append_data(&mut header, name, content.as_bytes())
        .with_context(|| format!("appending '{name}' to archive"))
}
