//! Archive compression.
//!
//! Single-pass streaming gzip of the finished OVA, with the original
//! base name embedded in the gzip header so decompression restores it.
//! `is_gzip` sniffs a fixed-size header to decide whether an input is
//! gzip-framed; the inspect operation uses it to know whether an image
//! must be decompressed before its metadata can be read.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::{Compression, GzBuilder};

/// Bytes read for content sniffing. Plenty for the gzip frame header.
const SNIFF_LEN: usize = 512;

/// Compress `archive` into `<archive>.gz` next to it.
pub fn compress(archive: &Path) -> Result<PathBuf> {
    let name = archive
        .file_name()
        .context("archive path has no file name")?
        .to_string_lossy()
        .into_owned();
    let target = PathBuf::from(format!("{}.gz", archive.display()));

    tracing::info!(archive = %archive.display(), target = %target.display(), "compressing");

    let mut input = BufReader::new(
        File::open(archive).with_context(|| format!("opening '{}'", archive.display()))?,
    );
    let output = BufWriter::new(
        File::create(&target).with_context(|| format!("creating '{}'", target.display()))?,
    );

    let mut encoder = GzBuilder::new()
        .filename(name.as_str())
        .write(output, Compression::default());
    io::copy(&mut input, &mut encoder).context("compressing archive")?;
    encoder
        .finish()
        .context("finalizing gzip stream")?
        .into_inner()
        .map_err(|e| e.into_error())?
        .sync_all()?;

    Ok(target)
}

/// Decompress a gzip file to `dest`, reproducing the original archive
/// byte-for-byte.
pub fn decompress(gz: &Path, dest: &Path) -> Result<()> {
    let input =
        BufReader::new(File::open(gz).with_context(|| format!("opening '{}'", gz.display()))?);
    let mut decoder = GzDecoder::new(input);
    let mut output = BufWriter::new(
        File::create(dest).with_context(|| format!("creating '{}'", dest.display()))?,
    );
    io::copy(&mut decoder, &mut output).context("decompressing archive")?;
    Ok(())
}

/// Sniff whether `path` is gzip-framed.
///
/// Reads a fixed-size header and lets the MIME sniffer classify it, so
/// a file that merely ends in `.gz` does not fool the inspect path.
pub fn is_gzip(path: &Path) -> Result<bool> {
    let mut file = File::open(path).with_context(|| format!("opening '{}'", path.display()))?;
    let mut header = vec![0u8; SNIFF_LEN];
    let mut filled = 0;
    while filled < header.len() {
        match file.read(&mut header[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    header.truncate(filled);

    Ok(infer::get(&header)
        .map(|kind| kind.mime_type() == "application/gzip")
        .unwrap_or(false))
}
