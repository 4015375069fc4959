#![forbid(unsafe_code)]

//! Runtime configuration for the archiver.
//!
//! Values are layered: explicit overrides (CLI flags) win over the process
//! environment, which wins over the `.env` file, which wins over defaults.
//! Numeric thresholds live in [`Tuning`] and can be loaded from a TOML file.

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    env, fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use crate::tools::ToolPaths;

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_SCRATCH_SUBDIR: &str = "space-archiver";

/// Which downloader(s) the acquirer may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolSelection {
    /// `twspace_dl` first, `yt-dlp` as fallback.
    #[default]
    Auto,
    /// Only `twspace_dl`, no fallback.
    TwspaceDl,
    /// Only `yt-dlp`, no fallback.
    YtDlp,
}

impl FromStr for ToolSelection {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "auto" => Ok(Self::Auto),
            "twspace_dl" | "twspace-dl" | "twspace" => Ok(Self::TwspaceDl),
            "yt-dlp" | "yt_dlp" | "ytdlp" => Ok(Self::YtDlp),
            other => bail!("unknown downloader selection: {other}"),
        }
    }
}

impl fmt::Display for ToolSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Auto => "auto",
            Self::TwspaceDl => "twspace-dl",
            Self::YtDlp => "yt-dlp",
        })
    }
}

/// Thresholds and limits used by the pipeline steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Tuning {
    /// Shorter recordings are treated as corrupt downloads.
    pub min_duration_secs: f64,
    /// Allowed gap between the advertised and the probed duration.
    pub duration_tolerance_secs: f64,
    /// Filename limit in bytes, extension included.
    pub max_name_len: usize,
    pub mp3_bitrate_kbps: u32,
    /// Recordings longer than this are split into parts.
    pub split_ceiling_secs: f64,
    /// Attempts per downloader before falling back to the next one.
    pub acquire_attempts: u32,
    pub resource_threshold_percent: f64,
    pub throttle_pause_ms: u64,
    pub throttle_max_waits: u32,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            min_duration_secs: 60.0,
            duration_tolerance_secs: 300.0,
            max_name_len: 255,
            mp3_bitrate_kbps: 192,
            split_ceiling_secs: 7200.0,
            acquire_attempts: 2,
            resource_threshold_percent: 90.0,
            throttle_pause_ms: 2000,
            throttle_max_waits: 10,
        }
    }
}

impl Tuning {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let tuning: Self = toml::from_str(raw).context("parsing tuning TOML")?;
        tuning.validate()?;
        Ok(tuning)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let raw =
            fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
        Self::from_toml_str(&raw).with_context(|| format!("Loading {}", path.display()))
    }

    fn validate(&self) -> Result<()> {
        if self.max_name_len < 32 {
            bail!("max_name_len must be at least 32, got {}", self.max_name_len);
        }
        if self.acquire_attempts == 0 {
            bail!("acquire_attempts must be at least 1");
        }
        if self.mp3_bitrate_kbps == 0 {
            bail!("mp3_bitrate_kbps must be positive");
        }
        Ok(())
    }
}

/// Everything the pipeline needs that does not change between requests.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub scratch_dir: PathBuf,
    pub tools: ToolPaths,
    pub tuning: Tuning,
}

#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub archive_root: PathBuf,
    pub scratch_dir: PathBuf,
    pub secondary_dir: Option<PathBuf>,
    pub cookie_file: Option<PathBuf>,
    pub tool: ToolSelection,
    pub tools: ToolPaths,
    pub tuning: Tuning,
}

impl RuntimeSettings {
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            scratch_dir: self.scratch_dir.clone(),
            tools: self.tools.clone(),
            tuning: self.tuning.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub archive_root: Option<PathBuf>,
    pub scratch_dir: Option<PathBuf>,
    pub secondary_dir: Option<PathBuf>,
    pub cookie_file: Option<PathBuf>,
    pub tool: Option<ToolSelection>,
    pub config_path: Option<PathBuf>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_runtime_settings(overrides: RuntimeOverrides) -> Result<RuntimeSettings> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    build_runtime_settings(&file_vars, env_var_string, overrides)
}

fn build_runtime_settings(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> Result<RuntimeSettings> {
    let lookup_path =
        |key: &str| lookup_value(key, file_vars, &env_lookup).map(PathBuf::from);

    let archive_root = overrides
        .archive_root
        .or_else(|| lookup_path("ARCHIVE_ROOT"))
        .ok_or_else(|| anyhow!("ARCHIVE_ROOT not set (pass --output or set ARCHIVE_ROOT)"))?;
    let scratch_dir = overrides
        .scratch_dir
        .or_else(|| lookup_path("SCRATCH_DIR"))
        .unwrap_or_else(|| env::temp_dir().join(DEFAULT_SCRATCH_SUBDIR));
    let secondary_dir = overrides
        .secondary_dir
        .or_else(|| lookup_path("SECONDARY_COPY_DIR"));
    let cookie_file = overrides.cookie_file.or_else(|| lookup_path("COOKIE_FILE"));
    let tool = match overrides.tool {
        Some(tool) => tool,
        None => lookup_value("ARCHIVER_TOOL", file_vars, &env_lookup)
            .map(|value| value.parse::<ToolSelection>())
            .transpose()?
            .unwrap_or_default(),
    };

    let defaults = ToolPaths::default();
    let tools = ToolPaths {
        twspace_dl: lookup_path("TWSPACE_DL_BIN").unwrap_or(defaults.twspace_dl),
        yt_dlp: lookup_path("YT_DLP_BIN").unwrap_or(defaults.yt_dlp),
        ffmpeg: lookup_path("FFMPEG_BIN").unwrap_or(defaults.ffmpeg),
        ffprobe: lookup_path("FFPROBE_BIN").unwrap_or(defaults.ffprobe),
    };

    let tuning = match overrides
        .config_path
        .or_else(|| lookup_path("ARCHIVER_CONFIG"))
    {
        Some(path) => Tuning::from_toml_file(&path)?,
        None => Tuning::default(),
    };

    Ok(RuntimeSettings {
        archive_root,
        scratch_dir,
        secondary_dir,
        cookie_file,
        tool,
        tools,
        tuning,
    })
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key)
        .or_else(|| file_vars.get(key).cloned())
        .filter(|value| !value.trim().is_empty())
}

/// Parses a dotenv-style file. A missing file yields an empty map.
pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}
