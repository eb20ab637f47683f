//! External process invocation.
//!
//! Shelling out to host utilities (losetup, qemu-img, growpart, mount)
//! is the core integration surface of this crate, so it goes through a
//! single capability: args in, exit code plus captured stdout/stderr
//! out. Pipeline code takes `&dyn Invoker`, which lets tests substitute
//! a recording fake and assert on dispatch and ordering without root.

use std::ffi::OsString;
use std::process::Command;

use crate::error::{Error, Result};

/// Captured result of one tool invocation.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// The single external-process capability.
///
/// Implementations run `program` with `args` to completion and report
/// the exit code with captured output. Spawn failures surface as
/// `io::Error`; a non-zero exit is not an error at this layer.
pub trait Invoker {
    fn invoke(&self, program: &str, args: &[OsString]) -> std::io::Result<ToolOutput>;
}

/// Runs tools on the host via `std::process::Command`.
pub struct HostInvoker;

impl Invoker for HostInvoker {
    fn invoke(&self, program: &str, args: &[OsString]) -> std::io::Result<ToolOutput> {
        tracing::debug!(program, ?args, "exec");
        let output = Command::new(program).args(args).output()?;
        Ok(ToolOutput {
            // Exit-by-signal has no code; report -1 rather than panic.
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Run a tool and fail on non-zero exit.
///
/// The returned [`Error::Tool`] carries the exit code and both output
/// streams verbatim. Tool failures in this pipeline are fatal and
/// non-transient; there are no retries.
pub fn run<S: AsRef<std::ffi::OsStr>>(
    invoker: &dyn Invoker,
    program: &str,
    args: &[S],
) -> Result<ToolOutput> {
    let args: Vec<OsString> = args.iter().map(|a| a.as_ref().to_os_string()).collect();
    let output = invoker.invoke(program, &args)?;
    if !output.success() {
        return Err(Error::Tool {
            program: program.to_string(),
            code: output.code,
            stdout: output.stdout,
            stderr: output.stderr,
        });
    }
    Ok(output)
}


#[cfg(test)]
mod tests {
    use super::testing::FakeInvoker;
    use super::*;

    #[test]
    fn run_succeeds_on_zero_exit() {
        let fake = FakeInvoker::new().respond("true", 0, "", "");
        assert!(run(&fake, "true", &["--version"]).is_ok());
    }

    #[test]
    fn run_carries_exit_code_and_output() {
        let fake = FakeInvoker::new().respond("qemu-img", 1, "partial", "no such file");
        let err = run(&fake, "qemu-img", &["convert"]).unwrap_err();
        match err {
            Error::Tool {
                program,
                code,
                stdout,
                stderr,
            } => {
                assert_eq!(program, "qemu-img");
                assert_eq!(code, 1);
                assert_eq!(stdout, "partial");
                assert_eq!(stderr, "no such file");
            }
            other => panic!("expected Tool error, got {other:?}"),
        }
    }

    #[test]
    fn host_invoker_captures_output() {
        let out = HostInvoker
            .invoke("echo", &[OsString::from("hello")])
            .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "hello");
    }
}
