//! Source image acquisition.
//!
//! Resolves a source reference (local path or URL) into a local working
//! copy. Downloads are written to a `.partial` file and renamed into
//! place only after the body is fully received and fsynced, so a
//! half-fetched image is never readable under the destination name.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use url::Url;

use crate::error::{Error, Result};

/// Network fetch budget when the job does not specify one.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Resolve `source` into a file under `dest_dir`.
///
/// An absolute URL with scheme and host is fetched within `timeout`;
/// anything else is treated as a local path and copied verbatim. The
/// destination is `dest_dir/<basename of source>` and on success is
/// byte-identical to the source.
pub fn acquire(dest_dir: &Path, source: &str, timeout: Duration) -> Result<PathBuf> {
    match Url::parse(source) {
        Ok(url) if url.has_host() => fetch_url(dest_dir, &url, timeout),
        _ => copy_local(dest_dir, Path::new(source)),
    }
}

fn fetch_url(dest_dir: &Path, url: &Url, timeout: Duration) -> Result<PathBuf> {
    let name = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|s| !s.is_empty())
        .unwrap_or("image.qcow2")
        .to_string();
    let dest = dest_dir.join(&name);

    tracing::info!(%url, dest = %dest.display(), "fetching source image");

    let client = reqwest::blocking::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| Error::Fetch {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    let mut response = client.get(url.clone()).send().map_err(|e| {
        if e.is_timeout() {
            Error::Timeout {
                url: url.to_string(),
                timeout,
            }
        } else {
            Error::Fetch {
                url: url.to_string(),
                reason: e.to_string(),
            }
        }
    })?;

    if !response.status().is_success() {
        return Err(Error::Fetch {
            url: url.to_string(),
            reason: format!("server returned {}", response.status()),
        });
    }

    let partial = dest.with_extension("partial");
    let result = (|| -> Result<()> {
        let mut file = File::create(&partial)?;
        io::copy(&mut response, &mut file).map_err(|e| {
            if io_timeout(&e) {
                Error::Timeout {
                    url: url.to_string(),
                    timeout,
                }
            } else {
                Error::Io(e)
            }
        })?;
        file.sync_all()?;
        Ok(())
    })();

    if let Err(e) = result {
        let _ = fs::remove_file(&partial);
        return Err(e);
    }

    fs::rename(&partial, &dest)?;
    Ok(dest)
}

/// Whether an io error from the body stream is a timeout.
///
/// A timeout after the headers arrive surfaces as an `Other`-kind io
/// error wrapping a reqwest error, so the kind alone is not enough; the
/// source chain has to be walked.
fn io_timeout(e: &io::Error) -> bool {
    if e.kind() == io::ErrorKind::TimedOut {
        return true;
    }
    let mut source = e
        .get_ref()
        .map(|s| s as &(dyn std::error::Error + 'static));
    while let Some(err) = source {
        if let Some(req) = err.downcast_ref::<reqwest::Error>() {
            if req.is_timeout() {
                return true;
            }
        }
        if let Some(io_err) = err.downcast_ref::<io::Error>() {
            if io_err.kind() == io::ErrorKind::TimedOut {
                return true;
            }
        }
        source = err.source();
    }
    false
}

fn copy_local(dest_dir: &Path, source: &Path) -> Result<PathBuf> {
    if !source.is_file() {
        return Err(Error::BadSource(source.to_path_buf()));
    }
    let name = source
        .file_name()
        .ok_or_else(|| Error::BadSource(source.to_path_buf()))?;
    let dest = dest_dir.join(name);

    tracing::info!(
        source = %source.display(),
        dest = %dest.display(),
        "copying local source image"
    );

    let partial = dest.with_extension("partial");
    let result = (|| -> Result<()> {
        let mut input = File::open(source)?;
        let mut output = File::create(&partial)?;
        io::copy(&mut input, &mut output)?;
        output.sync_all()?;
        Ok(())
    })();

    if let Err(e) = result {
        let _ = fs::remove_file(&partial);
        return Err(e);
    }

    fs::rename(&partial, &dest)?;
    Ok(dest)
}
