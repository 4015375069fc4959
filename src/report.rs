//! JSON summary written next to the archived files.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::content_id::ContentId;
use crate::probe::SourceInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Succeeded,
    Failed,
    Interrupted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportedFile {
    pub path: PathBuf,
    pub size_bytes: u64,
}

impl ReportedFile {
    /// Missing files are reported with size 0.
    pub fn from_path(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            size_bytes: fs::metadata(path).map(|meta| meta.len()).unwrap_or(0),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Engagement {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uploader: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub view_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub like_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repost_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concurrent_view_count: Option<i64>,
}

impl Engagement {
    /// `None` when the source reported nothing worth keeping.
    pub fn from_source(source: &SourceInfo) -> Option<Self> {
        let engagement = Self {
            uploader: source.uploader.clone(),
            view_count: source.view_count,
            like_count: source.like_count,
            repost_count: source.repost_count,
            comment_count: source.comment_count,
            concurrent_view_count: source.concurrent_view_count,
        };
        (engagement != Self::default()).then_some(engagement)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationSummary {
    pub passed: bool,
    pub duration_seconds: Option<f64>,
    pub expected_seconds: Option<f64>,
    pub failure: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveReport {
    pub content_id: ContentId,
    pub source_url: String,
    pub status: ReportStatus,
    /// Stage that ended the run when it did not succeed.
    pub failed_stage: Option<String>,
    pub error: Option<String>,
    pub had_errors: bool,
    pub freshly_downloaded: Option<bool>,
    pub verification: Option<VerificationSummary>,
    pub title: Option<String>,
    pub date: Option<NaiveDate>,
    pub duration_seconds: Option<f64>,
    pub has_video: Option<bool>,
    pub files: Vec<ReportedFile>,
    pub total_size_bytes: u64,
    pub engagement: Option<Engagement>,
    pub generated_at: DateTime<Utc>,
}

impl ArchiveReport {
    pub fn new(content_id: ContentId, source_url: impl Into<String>) -> Self {
        Self {
            content_id,
            source_url: source_url.into(),
            status: ReportStatus::Failed,
            failed_stage: None,
            error: None,
            had_errors: false,
            freshly_downloaded: None,
            verification: None,
            title: None,
            date: None,
            duration_seconds: None,
            has_video: None,
            files: Vec::new(),
            total_size_bytes: 0,
            engagement: None,
            generated_at: Utc::now(),
        }
    }

    pub fn set_files(&mut self, paths: &[PathBuf]) {
        self.files = paths.iter().map(|path| ReportedFile::from_path(path)).collect();
        self.total_size_bytes = self.files.iter().map(|file| file.size_bytes).sum();
    }
}

pub fn report_path(dir: &Path, id: &ContentId) -> PathBuf {
    dir.join(format!("{id}_report.json"))
}

/// Writes `{id}_report.json` in `dir` through a temporary file and returns
/// its path.
pub fn write_report(dir: &Path, report: &ArchiveReport) -> Result<PathBuf> {
    fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let path = report_path(dir, &report.content_id);
    let tmp_path = path.with_extension("json.tmp");
    let payload = serde_json::to_vec_pretty(report)?;
    fs::write(&tmp_path, payload).with_context(|| format!("writing {}", tmp_path.display()))?;
    fs::rename(&tmp_path, &path).with_context(|| format!("replacing {}", path.display()))?;
    Ok(path)
}

pub fn read_report(path: &Path) -> Result<ArchiveReport> {
    let raw = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}
