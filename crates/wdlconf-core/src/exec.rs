use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Run an argv vector as a child process in `cwd`, capturing exit code and
/// both standard streams. Blocking; no retry and no timeout. Whether a
/// non-zero exit is a failure is the caller's decision (expected-failure
/// tests invert it).
pub fn run_command(argv: &[String], cwd: &Path) -> Result<ExecOutput> {
    let (program, rest) = argv
        .split_first()
        .context("runner produced an empty command")?;

    let output = Command::new(program)
        .args(rest)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .output()
        .with_context(|| format!("exec {program}"))?;

    Ok(ExecOutput {
        // A signal-terminated child has no exit code; report it as -1 so it
        // still registers as a failed run.
        code: output.status.code().unwrap_or(-1),
        stdout: output.stdout,
        stderr: output.stderr,
    })
}

/// Like [`run_command`] but also captures wall-clock duration around the
/// child invocation. Each unit owns its own child process, so the measured
/// interval is not skewed by other in-flight units.
pub fn run_command_timed(argv: &[String], cwd: &Path) -> Result<(ExecOutput, Duration)> {
    let started = Instant::now();
    let out = run_command(argv, cwd)?;
    Ok((out, started.elapsed()))
}
