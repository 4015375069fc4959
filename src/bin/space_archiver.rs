use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::filter::{EnvFilter, LevelFilter};

use space_archiver::cancel::CancelFlag;
use space_archiver::config::{self, RuntimeOverrides, ToolSelection};
use space_archiver::pipeline::{ArchiveOutcome, ArchiveRequest, Archiver, RunStatus};
use space_archiver::tools;

const EXIT_FAILURE: u8 = 1;
const EXIT_SOFT_ERRORS: u8 = 2;
const EXIT_INTERRUPTED: u8 = 130;

/// Download a recorded space, verify it and file it into the archive.
#[derive(Parser, Debug)]
#[command(name = "space-archiver", version)]
struct Cli {
    /// Space (or VOD) URL to archive
    url: String,

    /// Netscape cookie file handed to the downloaders
    #[arg(short, long)]
    cookies: Option<PathBuf>,

    /// Archive root; files land in <OUTPUT>/<id>/
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Also copy the archived files to <COPY_TO>/<id>/
    #[arg(long)]
    copy_to: Option<PathBuf>,

    /// Downloader to use: auto, twspace-dl or yt-dlp
    #[arg(long)]
    tool: Option<ToolSelection>,

    /// Creation date (YYYY-MM-DD) used when the recording carries none
    #[arg(long)]
    date: Option<NaiveDate>,

    #[arg(long)]
    scratch_dir: Option<PathBuf>,

    /// TOML file with tuning overrides
    #[arg(long)]
    config: Option<PathBuf>,

    /// dotenv file with path settings
    #[arg(long)]
    env_file: Option<PathBuf>,

    /// Verbose logging, including full tool command lines and output
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_log(cli.debug);

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            error!("{err:#}");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let settings = config::resolve_runtime_settings(RuntimeOverrides {
        archive_root: cli.output,
        scratch_dir: cli.scratch_dir,
        secondary_dir: cli.copy_to,
        cookie_file: cli.cookies,
        tool: cli.tool,
        config_path: cli.config,
        env_path: cli.env_file,
    })?;

    tools::ensure_program_available(&settings.tools.ffmpeg, "-version")?;
    if let Err(err) = tools::ensure_program_available(&settings.tools.ffprobe, "-version") {
        warn!("{err:#}; verification will fail and metadata comes from the source only");
    }

    info!(
        archive_root = %settings.archive_root.display(),
        scratch_dir = %settings.scratch_dir.display(),
        tool = %settings.tool,
        "starting"
    );

    let request = ArchiveRequest {
        source_url: cli.url,
        cookie_file: settings.cookie_file.clone(),
        destination_root: settings.archive_root.clone(),
        secondary_dir: settings.secondary_dir.clone(),
        tool: settings.tool,
        fallback_date: cli.date,
        debug: cli.debug,
    };

    let cancel = CancelFlag::new();
    let archiver = Archiver::new(settings.pipeline_config()).with_cancel_flag(cancel.clone());

    let watcher = tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current step");
            cancel.cancel();
        }
    });
    let outcome = tokio::task::spawn_blocking(move || archiver.run(&request))
        .await
        .context("archiving task panicked")?;
    watcher.abort();

    for file in &outcome.files {
        println!("{}", file.display());
    }
    if let Some(report) = &outcome.report {
        info!(path = %report.display(), "report written");
    }
    Ok(ExitCode::from(exit_code(&outcome)))
}

fn exit_code(outcome: &ArchiveOutcome) -> u8 {
    match outcome.status {
        RunStatus::Succeeded if outcome.had_errors => EXIT_SOFT_ERRORS,
        RunStatus::Succeeded => 0,
        RunStatus::Failed => EXIT_FAILURE,
        RunStatus::Interrupted => EXIT_INTERRUPTED,
    }
}

fn init_log(debug: bool) {
    let default = if debug {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(default.into())
                .from_env_lossy(),
        )
        .with_target(false)
        .init();
}
