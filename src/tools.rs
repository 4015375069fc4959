//! Locations of the external binaries and the small helpers used to run them.
//!
//! Every tool is addressed through [`ToolPaths`] so callers (and tests) can
//! point the pipeline at alternative executables without touching `PATH`.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Output, Stdio};

use anyhow::{Context, Result, bail};
use tracing::debug;

pub const TWSPACE_DL: &str = "twspace_dl";
pub const YT_DLP: &str = "yt-dlp";
pub const FFMPEG: &str = "ffmpeg";
pub const FFPROBE: &str = "ffprobe";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolPaths {
    pub twspace_dl: PathBuf,
    pub yt_dlp: PathBuf,
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            twspace_dl: PathBuf::from(TWSPACE_DL),
            yt_dlp: PathBuf::from(YT_DLP),
            ffmpeg: PathBuf::from(FFMPEG),
            ffprobe: PathBuf::from(FFPROBE),
        }
    }
}

/// Builds a command with stdin detached so tools never wait on a prompt.
pub fn command(program: &Path) -> Command {
    let mut command = Command::new(program);
    command.stdin(Stdio::null());
    command
}

/// Appends `--cookies <file>`-style arguments only when the file exists.
pub fn push_cookie_args(command: &mut Command, flag: &str, cookie_file: Option<&Path>) {
    if let Some(cookies) = cookie_file
        && cookies.exists()
    {
        command.arg(flag).arg(cookies);
    }
}

/// Renders the command line for debug logs.
pub fn describe(command: &Command) -> String {
    let mut parts = vec![command.get_program().to_string_lossy().into_owned()];
    parts.extend(command.get_args().map(quote_arg));
    parts.join(" ")
}

fn quote_arg(arg: &OsStr) -> String {
    let arg = arg.to_string_lossy();
    if arg.is_empty() || arg.contains(|c: char| c.is_whitespace() || c == '"') {
        format!("{arg:?}")
    } else {
        arg.into_owned()
    }
}

/// Runs a command to completion and captures its output.
pub fn run_captured(mut command: Command, label: &str) -> Result<Output> {
    debug!(command = %describe(&command), "running {label}");
    command
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .with_context(|| format!("spawning {label}"))
}

/// Runs a command and fails unless it exits with status 0. The tail of stderr
/// is folded into the error to keep ffmpeg failures readable.
pub fn run_checked(command: Command, label: &str) -> Result<()> {
    let output = run_captured(command, label)?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "{label} exited with status {}: {}",
            output.status,
            tail_lines(&stderr, 5)
        );
    }
    Ok(())
}

/// Runs `<program> <version_flag>` to fail loudly when a dependency is
/// missing.
pub fn ensure_program_available(program: &Path, version_flag: &str) -> Result<()> {
    let status = Command::new(program)
        .arg(version_flag)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();

    match status {
        Ok(status) if status.success() => Ok(()),
        Ok(_) => bail!(
            "{} is installed but returned a failure status",
            program.display()
        ),
        Err(err) => bail!(
            "{} is not installed or not in PATH: {}",
            program.display(),
            err
        ),
    }
}

/// True when the child was stopped by SIGINT or SIGTERM, which is how a
/// Ctrl-C in the terminal reaches the downloader.
#[cfg(unix)]
pub fn killed_by_interrupt(status: &ExitStatus) -> bool {
    use nix::sys::signal::Signal;
    use std::os::unix::process::ExitStatusExt;

    status
        .signal()
        .and_then(|raw| Signal::try_from(raw).ok())
        .is_some_and(|signal| matches!(signal, Signal::SIGINT | Signal::SIGTERM))
}

#[cfg(not(unix))]
pub fn killed_by_interrupt(_status: &ExitStatus) -> bool {
    false
}

fn tail_lines(text: &str, count: usize) -> String {
    let lines: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();
    let start = lines.len().saturating_sub(count);
    lines[start..].join(" | ")
}
