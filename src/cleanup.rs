//! LIFO release stack for host-wide resources.
//!
//! Loop devices, mounts, and the working directory must be released on
//! every exit path, in reverse order of acquisition. Steps push a
//! labelled release action at acquisition time; a single finalization
//! call unwinds the stack. Two finalizers exist because the pipeline is
//! deliberately asymmetric: during failure unwinding a release failure
//! is logged so it cannot mask the original error, while on the success
//! path a release failure is a real job failure and is propagated.

use anyhow::Result;

type Release<'a> = Box<dyn FnOnce() -> Result<()> + 'a>;

/// Ordered stack of release actions, unwound LIFO.
#[derive(Default)]
pub struct ReleaseStack<'a> {
    actions: Vec<(String, Release<'a>)>,
}

impl<'a> ReleaseStack<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a release action. Call this at acquisition time, right
    /// after the resource exists.
    pub fn push<F>(&mut self, label: &str, release: F)
    where
        F: FnOnce() -> Result<()> + 'a,
    {
        self.actions.push((label.to_string(), Box::new(release)));
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Unwind after a failure: run every action in reverse order,
    /// logging failures instead of returning them.
    pub fn unwind_on_error(&mut self) {
        while let Some((label, release)) = self.actions.pop() {
            if let Err(e) = release() {
                tracing::warn!(step = %label, error = %e, "cleanup failed during unwind");
            }
        }
    }

    /// Unwind on the success path: run every action in reverse order
    /// and propagate the first failure after attempting the rest.
    pub fn finish(&mut self) -> Result<()> {
        let mut first_err = None;
        while let Some((label, release)) = self.actions.pop() {
            if let Err(e) = release() {
                tracing::warn!(step = %label, error = %e, "cleanup failed");
                if first_err.is_none() {
                    first_err = Some(e.context(format!("releasing '{label}'")));
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
