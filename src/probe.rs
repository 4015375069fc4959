//! Metadata extraction from downloaded files (ffprobe) and from the
//! no-download query against the source (`yt-dlp --dump-single-json`).
//!
//! Nothing in here fails the pipeline: every lookup returns `Option` and the
//! caller degrades to the next source. [`describe`] applies the precedence
//! rules and always produces a complete [`MediaDescriptor`].

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::classify::FormatDescriptor;
use crate::content_id::ContentId;
use crate::tools;

/// Attributes the rest of the pipeline works from. Built once per run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MediaDescriptor {
    pub duration_seconds: f64,
    pub title: String,
    pub creation_date: NaiveDate,
}

/// Where [`MediaDescriptor::creation_date`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DateOrigin {
    CreationTimeTag,
    DateTag,
    SourceMetadata,
    Fallback,
    Today,
}

/// Result of probing a local file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileProbe {
    pub duration_seconds: Option<f64>,
    pub format_name: Option<String>,
    /// Container tags with lowercased keys.
    pub tags: HashMap<String, String>,
    pub codecs: Vec<String>,
    pub has_video_stream: bool,
    pub has_audio_stream: bool,
}

impl FileProbe {
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .get(&key.to_ascii_lowercase())
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    format: Option<FfprobeFormat>,
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    format_name: Option<String>,
    duration: Option<String>,
    #[serde(default)]
    tags: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
}

/// Runs ffprobe against `path`. Returns `None` when ffprobe is missing, exits
/// non-zero or prints something that is not JSON.
pub fn probe_file(ffprobe: &Path, path: &Path) -> Option<FileProbe> {
    let mut command = tools::command(ffprobe);
    command
        .args(["-v", "quiet", "-print_format", "json", "-show_format", "-show_streams"])
        .arg(path);

    let output = match tools::run_captured(command, "ffprobe") {
        Ok(output) => output,
        Err(err) => {
            warn!(path = %path.display(), "could not run ffprobe: {err:#}");
            return None;
        }
    };
    if !output.status.success() {
        warn!(path = %path.display(), status = %output.status, "ffprobe failed");
        return None;
    }
    let parsed = parse_ffprobe_json(&String::from_utf8_lossy(&output.stdout));
    if parsed.is_none() {
        warn!(path = %path.display(), "ffprobe output was not valid JSON");
    }
    parsed
}

pub fn parse_ffprobe_json(raw: &str) -> Option<FileProbe> {
    let parsed: FfprobeOutput = serde_json::from_str(raw).ok()?;
    let mut probe = FileProbe::default();

    if let Some(format) = parsed.format {
        probe.duration_seconds = format
            .duration
            .and_then(|value| value.trim().parse::<f64>().ok())
            .filter(|value| value.is_finite() && *value >= 0.0);
        probe.format_name = format.format_name;
        probe.tags = format
            .tags
            .into_iter()
            .map(|(key, value)| (key.to_ascii_lowercase(), value))
            .collect();
    }

    for stream in parsed.streams {
        match stream.codec_type.as_deref() {
            Some("video") => probe.has_video_stream = true,
            Some("audio") => probe.has_audio_stream = true,
            _ => {}
        }
        if let Some(codec) = stream.codec_name {
            probe.codecs.push(codec);
        }
    }

    Some(probe)
}

/// The subset of yt-dlp's JSON dump the pipeline reads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceInfo {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub fulltitle: Option<String>,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub timestamp: Option<f64>,
    #[serde(default)]
    pub release_timestamp: Option<f64>,
    #[serde(default)]
    pub upload_date: Option<String>,
    #[serde(default)]
    pub uploader: Option<String>,
    #[serde(default)]
    pub view_count: Option<i64>,
    #[serde(default)]
    pub like_count: Option<i64>,
    #[serde(default)]
    pub repost_count: Option<i64>,
    #[serde(default)]
    pub comment_count: Option<i64>,
    #[serde(default)]
    pub concurrent_view_count: Option<i64>,
    #[serde(default)]
    pub formats: Vec<FormatDescriptor>,
    #[serde(default)]
    pub vcodec: Option<String>,
    #[serde(default)]
    pub acodec: Option<String>,
    #[serde(default)]
    pub width: Option<f64>,
    #[serde(default)]
    pub height: Option<f64>,
    #[serde(default)]
    pub fps: Option<f64>,
}

impl SourceInfo {
    pub fn best_title(&self) -> Option<&str> {
        self.title
            .as_deref()
            .or(self.fulltitle.as_deref())
            .map(str::trim)
            .filter(|title| !title.is_empty())
    }

    /// Positive advertised duration, used as the expected value during
    /// verification.
    pub fn expected_duration(&self) -> Option<f64> {
        self.duration.filter(|value| value.is_finite() && *value > 0.0)
    }

    pub fn creation_date(&self) -> Option<NaiveDate> {
        self.release_timestamp
            .or(self.timestamp)
            .and_then(|ts| DateTime::<Utc>::from_timestamp(ts as i64, 0))
            .map(|datetime| datetime.date_naive())
            .or_else(|| self.upload_date.as_deref().and_then(parse_date_value))
    }

    /// The format list, or the top-level stream fields when the extractor
    /// reported a single format without a list.
    pub fn format_descriptors(&self) -> Vec<FormatDescriptor> {
        if !self.formats.is_empty() {
            return self.formats.clone();
        }
        let single = FormatDescriptor {
            vcodec: self.vcodec.clone(),
            acodec: self.acodec.clone(),
            width: self.width,
            height: self.height,
            fps: self.fps,
            ..FormatDescriptor::default()
        };
        if single == FormatDescriptor::default() {
            Vec::new()
        } else {
            vec![single]
        }
    }
}

/// Sidecar holding the raw JSON of the pre-download query.
pub fn source_sidecar_path(scratch_dir: &Path, id: &ContentId) -> PathBuf {
    scratch_dir.join(format!("{id}.source.json"))
}

/// Runs the no-download metadata query. On success the raw JSON is stored as
/// a sidecar in `scratch_dir`; on failure a sidecar from an earlier run (or
/// yt-dlp's own `.info.json`) is used instead.
pub fn query_source(
    yt_dlp: &Path,
    url: &str,
    cookie_file: Option<&Path>,
    scratch_dir: &Path,
    id: &ContentId,
) -> Option<SourceInfo> {
    match fetch_source_json(yt_dlp, url, cookie_file) {
        Some(raw) => match serde_json::from_str::<SourceInfo>(&raw) {
            Ok(info) => {
                let sidecar = source_sidecar_path(scratch_dir, id);
                if let Err(err) = fs::write(&sidecar, &raw) {
                    warn!(path = %sidecar.display(), "could not keep metadata sidecar: {err}");
                }
                return Some(info);
            }
            Err(err) => warn!(%url, "source metadata was not understood: {err}"),
        },
        None => warn!(%url, "source metadata query failed"),
    }
    load_source_sidecar(scratch_dir, id)
}

fn fetch_source_json(yt_dlp: &Path, url: &str, cookie_file: Option<&Path>) -> Option<String> {
    let mut command = tools::command(yt_dlp);
    command
        .arg("--dump-single-json")
        .arg("--skip-download")
        .arg("--no-warnings")
        .arg("--no-progress");
    tools::push_cookie_args(&mut command, "--cookies", cookie_file);
    command.arg(url);

    let output = tools::run_captured(command, "metadata query").ok()?;
    if !output.status.success() {
        debug!(status = %output.status, "metadata query exited unsuccessfully");
        return None;
    }
    String::from_utf8(output.stdout).ok()
}

pub fn load_source_sidecar(scratch_dir: &Path, id: &ContentId) -> Option<SourceInfo> {
    let candidates = [
        source_sidecar_path(scratch_dir, id),
        scratch_dir.join(format!("{id}.info.json")),
    ];
    candidates.iter().find_map(|path| {
        let raw = fs::read_to_string(path).ok()?;
        match serde_json::from_str::<SourceInfo>(&raw) {
            Ok(info) => {
                debug!(path = %path.display(), "using saved source metadata");
                Some(info)
            }
            Err(err) => {
                warn!(path = %path.display(), "could not parse saved metadata: {err}");
                None
            }
        }
    })
}

/// Accepts RFC 3339 timestamps, anything starting with `YYYY-MM-DD`, and
/// compact `YYYYMMDD`.
pub fn parse_date_value(value: &str) -> Option<NaiveDate> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(datetime) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(datetime.with_timezone(&Utc).date_naive());
    }
    if let Some(prefix) = trimmed.get(..10)
        && let Ok(date) = NaiveDate::parse_from_str(prefix, "%Y-%m-%d")
    {
        return Some(date);
    }
    parse_compact_date(trimmed)
}

/// `YYYYMMDD`, the shape yt-dlp uses for `upload_date`.
fn parse_compact_date(value: &str) -> Option<NaiveDate> {
    if value.len() != 8 || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    NaiveDate::from_ymd_opt(
        value[0..4].parse().ok()?,
        value[4..6].parse().ok()?,
        value[6..8].parse().ok()?,
    )
}

/// Finds a `YYYY-MM-DD` or `YYYYMMDD` date embedded in a path, preferring the
/// deepest component.
pub fn date_from_path_hint(path: &Path) -> Option<NaiveDate> {
    path.components().rev().find_map(|component| {
        let text = component.as_os_str().to_string_lossy();
        date_in_text(&text)
    })
}

fn date_in_text(text: &str) -> Option<NaiveDate> {
    let bytes = text.as_bytes();
    for start in 0..bytes.len() {
        if let Some(window) = text.get(start..start + 10)
            && let Ok(date) = NaiveDate::parse_from_str(window, "%Y-%m-%d")
        {
            return Some(date);
        }
    }
    for start in 0..bytes.len() {
        let Some(window) = bytes.get(start..start + 8) else {
            break;
        };
        let bounded = (start == 0 || !bytes[start - 1].is_ascii_digit())
            && bytes.get(start + 8).is_none_or(|b| !b.is_ascii_digit());
        if bounded
            && window.iter().all(u8::is_ascii_digit)
            && let Some(date) = text.get(start..start + 8).and_then(parse_compact_date)
        {
            return Some(date);
        }
    }
    None
}

/// Picks the creation date following the documented precedence.
pub fn resolve_creation_date(
    file: Option<&FileProbe>,
    source: Option<&SourceInfo>,
    fallback: Option<NaiveDate>,
    today: NaiveDate,
) -> (NaiveDate, DateOrigin) {
    if let Some(date) = file
        .and_then(|probe| probe.tag("creation_time"))
        .and_then(parse_date_value)
    {
        return (date, DateOrigin::CreationTimeTag);
    }
    if let Some(date) = file
        .and_then(|probe| probe.tag("date"))
        .and_then(parse_date_value)
    {
        return (date, DateOrigin::DateTag);
    }
    if let Some(date) = source.and_then(SourceInfo::creation_date) {
        return (date, DateOrigin::SourceMetadata);
    }
    if let Some(date) = fallback {
        return (date, DateOrigin::Fallback);
    }
    (today, DateOrigin::Today)
}

/// Combines the file probe and the source metadata into a descriptor,
/// degrading field by field.
pub fn describe(
    id: &ContentId,
    file: Option<&FileProbe>,
    source: Option<&SourceInfo>,
    fallback_date: Option<NaiveDate>,
    today: NaiveDate,
) -> MediaDescriptor {
    let title = file
        .and_then(|probe| probe.tag("title"))
        .or_else(|| source.and_then(SourceInfo::best_title))
        .map(str::to_owned)
        .unwrap_or_else(|| {
            warn!(content_id = %id, "no title found, using a generic one");
            format!("Space {id}")
        });

    let (creation_date, origin) = resolve_creation_date(file, source, fallback_date, today);
    if origin == DateOrigin::Today {
        warn!(content_id = %id, %creation_date, "no creation date found, using today's date");
    } else {
        debug!(content_id = %id, %creation_date, ?origin, "resolved creation date");
    }

    let duration_seconds = file
        .and_then(|probe| probe.duration_seconds)
        .or_else(|| source.and_then(SourceInfo::expected_duration))
        .unwrap_or(0.0);

    MediaDescriptor {
        duration_seconds,
        title,
        creation_date,
    }
}
