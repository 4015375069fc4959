//! Acquisition strategies and the fallback loop around them.
//!
//! Success is judged by exit status plus a complete media file for the id in
//! scratch. Each strategy may also name stderr markers that are known to mean
//! the download is going nowhere; seeing one kills the child early so the
//! next strategy gets a turn.

use std::collections::VecDeque;
use std::fmt;
use std::fs;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, SystemTime};

use anyhow::Context;
use tracing::{debug, info, warn};

use crate::cancel::CancelFlag;
use crate::config::ToolSelection;
use crate::content_id::ContentId;
use crate::locator;
use crate::tools::{self, ToolPaths};

const POLL_INTERVAL: Duration = Duration::from_millis(200);
/// File timestamps come from a coarse clock and can trail `SystemTime::now`.
const MTIME_SLACK: Duration = Duration::from_secs(2);
const STDERR_TAIL_LINES: usize = 5;

const TWSPACE_DL_MARKERS: &[&str] = &["Cannot get correct #EXTINF value of segment"];
const YT_DLP_MARKERS: &[&str] = &["HTTP Error 400"];

pub struct AcquireRequest<'a> {
    pub id: &'a ContentId,
    pub url: &'a str,
    pub cookie_file: Option<&'a Path>,
    pub scratch_dir: &'a Path,
    pub cancel: &'a CancelFlag,
    pub verbose: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acquired {
    pub path: PathBuf,
    pub freshly_downloaded: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum StrategyError {
    #[error("{tool} is not available: {reason}")]
    Unavailable { tool: &'static str, reason: String },
    #[error("{tool} failed: {reason}")]
    Failed { tool: &'static str, reason: String },
    #[error("{tool} was interrupted")]
    Interrupted { tool: &'static str },
}

#[derive(Debug, thiserror::Error)]
pub enum AcquireError {
    #[error("acquisition interrupted while running {tool}")]
    Interrupted { tool: &'static str },
    #[error("every acquisition strategy failed: {}", join_failures(.failures))]
    Exhausted { failures: Vec<StrategyError> },
    #[error("scratch directory unusable: {0:#}")]
    Scratch(anyhow::Error),
}

fn join_failures(failures: &[StrategyError]) -> String {
    if failures.is_empty() {
        return "no strategy configured".to_string();
    }
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

pub trait AcquisitionStrategy: fmt::Debug + Send + Sync {
    fn name(&self) -> &'static str;
    fn acquire(&self, request: &AcquireRequest<'_>) -> Result<PathBuf, StrategyError>;
}

/// Platform-specific downloader; also writes a metadata sidecar.
#[derive(Debug, Clone)]
pub struct TwspaceDl {
    program: PathBuf,
}

impl TwspaceDl {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl AcquisitionStrategy for TwspaceDl {
    fn name(&self) -> &'static str {
        tools::TWSPACE_DL
    }

    fn acquire(&self, request: &AcquireRequest<'_>) -> Result<PathBuf, StrategyError> {
        let mut command = tools::command(&self.program);
        tools::push_cookie_args(&mut command, "-c", request.cookie_file);
        command
            .arg("-i")
            .arg(request.url)
            .arg("-o")
            .arg(request.scratch_dir.join(request.id.as_str()))
            .arg("-m");
        run_strategy(command, self.name(), TWSPACE_DL_MARKERS, request)
    }
}

/// General-purpose downloader; resumes `.part` files with `--continue`.
#[derive(Debug, Clone)]
pub struct YtDlp {
    program: PathBuf,
}

impl YtDlp {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl AcquisitionStrategy for YtDlp {
    fn name(&self) -> &'static str {
        tools::YT_DLP
    }

    fn acquire(&self, request: &AcquireRequest<'_>) -> Result<PathBuf, StrategyError> {
        let output_template = request
            .scratch_dir
            .join(format!("{}.%(ext)s", request.id));
        let mut command = tools::command(&self.program);
        tools::push_cookie_args(&mut command, "--cookies", request.cookie_file);
        command
            .arg("--write-info-json")
            .arg("--continue")
            .arg("--no-mtime")
            .args(["--retries", "infinite"])
            .args(["--fragment-retries", "infinite"])
            .arg("--no-progress");
        if request.verbose {
            command.arg("--verbose");
        }
        command.arg("-o").arg(output_template).arg(request.url);
        run_strategy(command, self.name(), YT_DLP_MARKERS, request)
    }
}

#[derive(Debug)]
enum Stop {
    Exited(ExitStatus),
    Marker(&'static str),
    Cancelled,
}

fn run_strategy(
    command: Command,
    tool: &'static str,
    markers: &'static [&'static str],
    request: &AcquireRequest<'_>,
) -> Result<PathBuf, StrategyError> {
    let started = SystemTime::now();
    let (stop, tail) = supervise(command, tool, markers, request.cancel)?;

    match stop {
        Stop::Cancelled => return Err(StrategyError::Interrupted { tool }),
        Stop::Exited(status) if tools::killed_by_interrupt(&status) => {
            return Err(StrategyError::Interrupted { tool });
        }
        Stop::Marker(marker) => {
            return Err(StrategyError::Failed {
                tool,
                reason: format!("stopped after stderr reported \"{marker}\""),
            });
        }
        Stop::Exited(status) if !status.success() => {
            return Err(StrategyError::Failed {
                tool,
                reason: format!("exited with {status}: {}", tail.join(" | ")),
            });
        }
        Stop::Exited(_) => {}
    }

    let scan = locator::scan(request.scratch_dir, request.id).map_err(|err| {
        StrategyError::Failed {
            tool,
            reason: format!("could not scan scratch: {err:#}"),
        }
    })?;
    scan.media_since(attempt_floor(started))
        .map(|artifact| artifact.path.clone())
        .ok_or_else(|| StrategyError::Failed {
            tool,
            reason: "exited successfully but left no complete file".to_string(),
        })
}

/// Oldest modification time a file written by an attempt started at
/// `started` can carry.
fn attempt_floor(started: SystemTime) -> SystemTime {
    started.checked_sub(MTIME_SLACK).unwrap_or(started)
}

/// Runs the child while forwarding stderr to the debug log. Returns how it
/// stopped and the last few stderr lines.
fn supervise(
    mut command: Command,
    tool: &'static str,
    markers: &'static [&'static str],
    cancel: &CancelFlag,
) -> Result<(Stop, Vec<String>), StrategyError> {
    debug!(%tool, command = %tools::describe(&command), "starting downloader");
    let mut child = command
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| match err.kind() {
            io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => {
                StrategyError::Unavailable {
                    tool,
                    reason: err.to_string(),
                }
            }
            _ => StrategyError::Failed {
                tool,
                reason: format!("could not start: {err}"),
            },
        })?;

    let (tx, rx) = mpsc::channel::<String>();
    if let Some(stderr) = child.stderr.take() {
        thread::spawn(move || {
            for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                if tx.send(line).is_err() {
                    break;
                }
            }
        });
    }

    let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
    let mut remember = |line: String| {
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    };
    let mut stderr_open = true;

    let stop = loop {
        if cancel.is_cancelled() {
            warn!(%tool, "cancellation requested, stopping downloader");
            terminate(&mut child, tool);
            break Stop::Cancelled;
        }

        if stderr_open {
            match rx.recv_timeout(POLL_INTERVAL) {
                Ok(line) => {
                    debug!(%tool, "{line}");
                    if let Some(marker) = markers.iter().copied().find(|m| line.contains(m)) {
                        warn!(%tool, marker, "known failure marker on stderr, stopping downloader");
                        terminate(&mut child, tool);
                        remember(line);
                        break Stop::Marker(marker);
                    }
                    if !line.trim().is_empty() {
                        remember(line);
                    }
                    continue;
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => stderr_open = false,
            }
        } else {
            thread::sleep(POLL_INTERVAL);
        }

        match child.try_wait() {
            Ok(Some(status)) => break Stop::Exited(status),
            Ok(None) => {}
            Err(err) => {
                terminate(&mut child, tool);
                return Err(StrategyError::Failed {
                    tool,
                    reason: format!("could not wait for process: {err}"),
                });
            }
        }
    };

    for line in rx.try_iter() {
        debug!(%tool, "{line}");
        if !line.trim().is_empty() {
            remember(line);
        }
    }

    Ok((stop, tail.into_iter().collect()))
}

fn terminate(child: &mut std::process::Child, tool: &str) {
    if let Err(err) = child.kill() {
        debug!(%tool, "kill failed (process already gone?): {err}");
    }
    if let Err(err) = child.wait() {
        debug!(%tool, "could not reap process: {err}");
    }
}

/// Ordered strategies with a per-strategy attempt cap.
#[derive(Debug)]
pub struct Acquirer {
    strategies: Vec<Box<dyn AcquisitionStrategy>>,
    attempts: u32,
}

impl Acquirer {
    pub fn new(strategies: Vec<Box<dyn AcquisitionStrategy>>, attempts: u32) -> Self {
        Self {
            strategies,
            attempts: attempts.max(1),
        }
    }

    /// `Auto` tries twspace_dl then yt-dlp; a forced tool runs alone.
    pub fn for_selection(selection: ToolSelection, tools: &ToolPaths, attempts: u32) -> Self {
        let twspace: Box<dyn AcquisitionStrategy> = Box::new(TwspaceDl::new(&tools.twspace_dl));
        let yt_dlp: Box<dyn AcquisitionStrategy> = Box::new(YtDlp::new(&tools.yt_dlp));
        let strategies = match selection {
            ToolSelection::Auto => vec![twspace, yt_dlp],
            ToolSelection::TwspaceDl => vec![twspace],
            ToolSelection::YtDlp => vec![yt_dlp],
        };
        Self::new(strategies, attempts)
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|strategy| strategy.name()).collect()
    }

    /// Reuses a complete scratch file when one exists, otherwise clears stale
    /// partials and works through the strategies.
    pub fn acquire(&self, request: &AcquireRequest<'_>) -> Result<Acquired, AcquireError> {
        fs::create_dir_all(request.scratch_dir)
            .map_err(|err| AcquireError::Scratch(anyhow::Error::new(err)))?;

        let existing =
            locator::locate_existing(request.scratch_dir, request.id).map_err(AcquireError::Scratch)?;
        if let Some(media) = existing.best_media() {
            info!(
                content_id = %request.id,
                path = %media.path.display(),
                "reusing complete download from scratch"
            );
            return Ok(Acquired {
                path: media.path.clone(),
                freshly_downloaded: false,
            });
        }

        let removed = locator::discard_partials(&existing).map_err(AcquireError::Scratch)?;
        if removed > 0 {
            info!(content_id = %request.id, removed, "removed stale partial downloads");
        }

        let mut failures = Vec::new();
        'strategies: for strategy in &self.strategies {
            for attempt in 1..=self.attempts {
                let tool = strategy.name();
                if request.cancel.is_cancelled() {
                    return Err(AcquireError::Interrupted { tool });
                }
                info!(content_id = %request.id, %tool, attempt, "starting download");
                let started = SystemTime::now();
                match strategy.acquire(request) {
                    Ok(path) => {
                        info!(content_id = %request.id, %tool, path = %path.display(), "download finished");
                        return Ok(Acquired {
                            path,
                            freshly_downloaded: true,
                        });
                    }
                    Err(StrategyError::Interrupted { tool }) => {
                        warn!(content_id = %request.id, %tool, "download interrupted, partial files kept");
                        return Err(AcquireError::Interrupted { tool });
                    }
                    Err(err @ StrategyError::Unavailable { .. }) => {
                        warn!(content_id = %request.id, "{err}, trying the next tool");
                        failures.push(err);
                        continue 'strategies;
                    }
                    Err(err) => {
                        warn!(content_id = %request.id, attempt, "{err}");
                        failures.push(err);
                        discard_failed_output(request, tool, started)?;
                    }
                }
            }
        }

        Err(AcquireError::Exhausted { failures })
    }
}

/// Removes media a failed attempt wrote so that a later tool cannot pick it
/// up as its own result. Resumable partials stay.
fn discard_failed_output(
    request: &AcquireRequest<'_>,
    tool: &'static str,
    started: SystemTime,
) -> Result<(), AcquireError> {
    let scan = locator::scan(request.scratch_dir, request.id).map_err(AcquireError::Scratch)?;
    for artifact in scan.fresh_media(attempt_floor(started)) {
        fs::remove_file(&artifact.path)
            .with_context(|| format!("removing {}", artifact.path.display()))
            .map_err(AcquireError::Scratch)?;
        warn!(
            content_id = %request.id,
            %tool,
            path = %artifact.path.display(),
            "discarded output of failed attempt"
        );
    }
    Ok(())
}
