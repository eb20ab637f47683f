//! Error taxonomy for the image preparation pipeline.
//!
//! Every fatal condition the pipeline can hit maps to one of these
//! variants. Nothing in this crate retries; callers see the first
//! failure after cleanup has run.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// An external tool exited non-zero. Carries the captured output so
    /// the operator sees exactly what the tool printed.
    #[error("'{program}' exited with status {code}\nstdout: {stdout}\nstderr: {stderr}")]
    Tool {
        program: String,
        code: i32,
        stdout: String,
        stderr: String,
    },

    /// A named preflight rule failed before any mutation happened.
    #[error("preflight check '{rule}' failed: {cause}\nhint: {hint}")]
    Validation {
        rule: String,
        cause: String,
        hint: String,
    },

    /// The data partition carries a filesystem we cannot grow. Fatal,
    /// never retried; growing a guessed type could corrupt the image.
    #[error("unsupported filesystem type '{0}' on data partition")]
    UnsupportedFormat(String),

    /// A network fetch exceeded its time budget.
    #[error("fetching '{url}' exceeded the {}s budget", timeout.as_secs())]
    Timeout {
        url: String,
        timeout: std::time::Duration,
    },

    /// A network fetch failed for a reason other than the time budget
    /// (non-success status, connection refused, TLS failure).
    #[error("fetching '{url}' failed: {reason}")]
    Fetch { url: String, reason: String },

    /// A source reference pointed at something that is not a usable file.
    #[error("source '{0}' does not exist or is not a regular file")]
    BadSource(PathBuf),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
