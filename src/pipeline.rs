//! The end-to-end archiving run and its failure/cleanup policy.
//!
//! A run never panics and never returns `Err`: everything ends in an
//! [`ArchiveOutcome`] plus, whenever the content id is known, a report file in
//! the destination folder. Scratch files are only removed after a clean
//! success so that any other ending can be resumed.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::acquire::{AcquireError, AcquireRequest, Acquirer};
use crate::cancel::{CancelFlag, Interrupted};
use crate::classify;
use crate::config::{PipelineConfig, ToolSelection};
use crate::content_id::ContentId;
use crate::dedupe;
use crate::locator;
use crate::naming::{self, NameBuilder};
use crate::probe::{self, SourceInfo};
use crate::report::{self, ArchiveReport, Engagement, VerificationSummary};
use crate::split::{self, Splitter};
use crate::tagging::{MetadataWriter, sibling_temp};
use crate::throttle::{ProcMonitor, ResourceMonitor, Throttle};
use crate::transcode::Transcoder;
use crate::verify::Verifier;

pub use crate::report::ReportStatus as RunStatus;

const MP3_EXTENSION: &str = "mp3";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    LocateOrAcquire,
    Verify,
    ProbeMetadata,
    BuildName,
    WriteMetadata,
    Split,
    Place,
    Classify,
    Transcode,
    Deduplicate,
    Cleanup,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LocateOrAcquire => "locate_or_acquire",
            Self::Verify => "verify",
            Self::ProbeMetadata => "probe_metadata",
            Self::BuildName => "build_name",
            Self::WriteMetadata => "write_metadata",
            Self::Split => "split",
            Self::Place => "place",
            Self::Classify => "classify",
            Self::Transcode => "transcode",
            Self::Deduplicate => "deduplicate",
            Self::Cleanup => "cleanup",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct ArchiveRequest {
    pub source_url: String,
    pub cookie_file: Option<PathBuf>,
    pub destination_root: PathBuf,
    pub secondary_dir: Option<PathBuf>,
    pub tool: ToolSelection,
    pub fallback_date: Option<NaiveDate>,
    pub debug: bool,
}

impl ArchiveRequest {
    pub fn new(source_url: impl Into<String>, destination_root: impl Into<PathBuf>) -> Self {
        Self {
            source_url: source_url.into(),
            cookie_file: None,
            destination_root: destination_root.into(),
            secondary_dir: None,
            tool: ToolSelection::Auto,
            fallback_date: None,
            debug: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ArchiveOutcome {
    pub status: RunStatus,
    /// Last stage entered; the failing one when the run did not succeed.
    pub stage: Stage,
    pub had_errors: bool,
    pub files: Vec<PathBuf>,
    pub report: Option<PathBuf>,
    pub error: Option<String>,
}

impl ArchiveOutcome {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Succeeded
    }
}

/// Mutable bookkeeping for one run.
struct RunState {
    stage: Stage,
    had_errors: bool,
    files: Vec<PathBuf>,
    report: ArchiveReport,
}

impl RunState {
    fn enter(&mut self, stage: Stage) {
        self.stage = stage;
    }

    fn soft_error(&mut self, message: fmt::Arguments<'_>) {
        warn!(stage = %self.stage, "{message}");
        self.had_errors = true;
    }
}

#[derive(Debug)]
pub struct Archiver {
    config: PipelineConfig,
    cancel: CancelFlag,
    throttle: Throttle,
}

impl Archiver {
    pub fn new(config: PipelineConfig) -> Self {
        Self::with_monitor(config, Box::new(ProcMonitor))
    }

    pub fn with_monitor(config: PipelineConfig, monitor: Box<dyn ResourceMonitor>) -> Self {
        let throttle = Throttle::new(monitor, &config.tuning);
        Self {
            config,
            cancel: CancelFlag::new(),
            throttle,
        }
    }

    /// Shares `cancel` with whoever handles Ctrl-C.
    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    #[tracing::instrument(skip_all, fields(url = %request.source_url))]
    pub fn run(&self, request: &ArchiveRequest) -> ArchiveOutcome {
        let id = match ContentId::from_url(&request.source_url) {
            Ok(id) => id,
            Err(err) => {
                error!("cannot derive a content id: {err:#}");
                return ArchiveOutcome {
                    status: RunStatus::Failed,
                    stage: Stage::LocateOrAcquire,
                    had_errors: true,
                    files: Vec::new(),
                    report: None,
                    error: Some(format!("{err:#}")),
                };
            }
        };

        let mut state = RunState {
            stage: Stage::LocateOrAcquire,
            had_errors: false,
            files: Vec::new(),
            report: ArchiveReport::new(id.clone(), &request.source_url),
        };
        let result = self.execute(request, &id, &mut state);

        let status = match &result {
            Ok(()) => RunStatus::Succeeded,
            Err(err) if is_interruption(err) => RunStatus::Interrupted,
            Err(_) => RunStatus::Failed,
        };
        match (&result, status) {
            (Err(_), RunStatus::Interrupted) => {
                warn!(content_id = %id, stage = %state.stage, "run interrupted, scratch files kept for resumption");
            }
            (Err(err), _) => {
                error!(content_id = %id, stage = %state.stage, "archiving failed: {err:#}");
            }
            (Ok(()), _) if state.had_errors => {
                warn!(content_id = %id, files = state.files.len(), "archived with soft errors");
            }
            (Ok(()), _) => info!(content_id = %id, files = state.files.len(), "archived"),
        }

        let error = result.as_ref().err().map(|err| format!("{err:#}"));
        let report = self.finish_report(request, &id, &mut state, status, error.clone());

        if status == RunStatus::Succeeded {
            if state.had_errors {
                info!(content_id = %id, "keeping scratch files because of soft errors");
            } else {
                state.enter(Stage::Cleanup);
                match locator::purge(&self.config.scratch_dir, &id) {
                    Ok(removed) => info!(content_id = %id, removed, "cleaned scratch directory"),
                    Err(err) => warn!(content_id = %id, "scratch cleanup incomplete: {err:#}"),
                }
            }
        }

        ArchiveOutcome {
            status,
            stage: state.stage,
            had_errors: state.had_errors,
            files: state.files,
            report,
            error,
        }
    }

    fn execute(&self, request: &ArchiveRequest, id: &ContentId, state: &mut RunState) -> Result<()> {
        let config = &self.config;
        let tuning = &config.tuning;
        let tools = &config.tools;
        let scratch = config.scratch_dir.as_path();
        let cookie_file = request.cookie_file.as_deref();

        state.enter(Stage::LocateOrAcquire);
        self.cancel.check()?;
        fs::create_dir_all(scratch).with_context(|| format!("creating {}", scratch.display()))?;
        let source = probe::query_source(&tools.yt_dlp, &request.source_url, cookie_file, scratch, id);
        state.report.engagement = source.as_ref().and_then(Engagement::from_source);
        let expected = source.as_ref().and_then(SourceInfo::expected_duration);

        let acquirer = Acquirer::for_selection(request.tool, tools, tuning.acquire_attempts);
        let acquired = acquirer.acquire(&AcquireRequest {
            id,
            url: &request.source_url,
            cookie_file,
            scratch_dir: scratch,
            cancel: &self.cancel,
            verbose: request.debug,
        })?;
        state.report.freshly_downloaded = Some(acquired.freshly_downloaded);

        state.enter(Stage::Verify);
        self.cancel.check()?;
        let verification = Verifier::new(&tools.ffprobe, tuning).verify(&acquired.path, expected);
        if let Some(failure) = &verification.failure {
            state.soft_error(format_args!("verification failed: {failure}"));
        } else {
            info!(content_id = %id, duration = verification.duration_seconds, "verification passed");
        }
        state.report.verification = Some(VerificationSummary {
            passed: verification.passed,
            duration_seconds: verification.duration_seconds,
            expected_seconds: expected,
            failure: verification.failure.as_ref().map(ToString::to_string),
        });

        state.enter(Stage::ProbeMetadata);
        self.cancel.check()?;
        let fallback_date = request
            .fallback_date
            .or_else(|| probe::date_from_path_hint(&request.destination_root));
        let descriptor = probe::describe(
            id,
            verification.probe.as_ref(),
            source.as_ref(),
            fallback_date,
            Local::now().date_naive(),
        );
        state.report.title = Some(descriptor.title.clone());
        state.report.date = Some(descriptor.creation_date);
        state.report.duration_seconds = Some(descriptor.duration_seconds);

        state.enter(Stage::BuildName);
        let base = NameBuilder::new(tuning.max_name_len).base_name(
            &descriptor.title,
            descriptor.creation_date,
            id,
        );

        state.enter(Stage::WriteMetadata);
        self.cancel.check()?;
        if let Err(err) = MetadataWriter::new(&tools.ffmpeg).write_tags(
            &acquired.path,
            &descriptor.title,
            descriptor.creation_date,
        ) {
            state.soft_error(format_args!("tagging failed, keeping the untagged file: {err:#}"));
        }

        let pieces = match split::plan(descriptor.duration_seconds, tuning.split_ceiling_secs) {
            Some(plan) => {
                state.enter(Stage::Split);
                info!(content_id = %id, parts = plan.parts, "recording exceeds the split ceiling");
                Splitter::new(&tools.ffmpeg).split(
                    &acquired.path,
                    id,
                    scratch,
                    &plan,
                    &self.throttle,
                    &self.cancel,
                )?
            }
            None => vec![acquired.path.clone()],
        };

        state.enter(Stage::Place);
        self.cancel.check()?;
        // Companion names are reserved before classification decides on them.
        let reserve_mp3 = Transcoder::wants_companion(&acquired.path, true);
        let destination = request.destination_root.join(id.as_str());
        fs::create_dir_all(&destination)
            .with_context(|| format!("creating {}", destination.display()))?;
        let ext = extension_of(&acquired.path);
        let split = pieces.len() > 1;
        let stem = naming::unique_stem(&base, |stem| {
            target_names(stem, pieces.len(), split, &ext, reserve_mp3)
                .iter()
                .all(|name| !destination.join(name).exists())
        });
        for (index, piece) in pieces.iter().enumerate() {
            let target = if split {
                naming::part_path(&destination, &stem, index as u32 + 1, &ext)
            } else {
                destination.join(naming::file_name(&stem, &ext))
            };
            copy_into_place(piece, &target)?;
            info!(content_id = %id, path = %target.display(), "placed file");
            state.files.push(target);
        }

        state.enter(Stage::Classify);
        let formats = source
            .as_ref()
            .map(SourceInfo::format_descriptors)
            .unwrap_or_default();
        let classification = classify::classify(&formats, verification.probe.as_ref());
        state.report.has_video = Some(classification.has_video);
        info!(
            content_id = %id,
            has_video = classification.has_video,
            signal = ?classification.signal,
            "classified recording"
        );
        let wants_mp3 = Transcoder::wants_companion(&acquired.path, classification.has_video);

        state.enter(Stage::Transcode);
        if wants_mp3 {
            self.cancel.check()?;
            let transcoder = Transcoder::new(&tools.ffmpeg, tuning.mp3_bitrate_kbps);
            let masters = state.files.clone();
            for master in masters {
                let output = master.with_extension(MP3_EXTENSION);
                match transcoder.to_mp3(&master, &output, &descriptor.title, descriptor.creation_date) {
                    Ok(()) => state.files.push(output),
                    Err(err) => state.soft_error(format_args!("mp3 companion failed: {err:#}")),
                }
            }
        } else if classification.has_video {
            info!(content_id = %id, "master is already mp3, no companion needed");
        } else {
            info!(content_id = %id, "audio-only recording, skipping mp3 companion");
        }

        if let Some(secondary_root) = &request.secondary_dir {
            let secondary = secondary_root.join(id.as_str());
            match copy_to_secondary(&state.files, &secondary) {
                Ok(copies) => {
                    info!(content_id = %id, path = %secondary.display(), files = copies.len(), "copied to secondary location");
                    if let Err(err) = dedupe::deduplicate(&secondary, id, &copies) {
                        state.soft_error(format_args!("secondary deduplication failed: {err:#}"));
                    }
                }
                Err(err) => state.soft_error(format_args!("secondary copy failed: {err:#}")),
            }
        }

        state.enter(Stage::Deduplicate);
        dedupe::deduplicate(&destination, id, &state.files)?;
        Ok(())
    }

    fn finish_report(
        &self,
        request: &ArchiveRequest,
        id: &ContentId,
        state: &mut RunState,
        status: RunStatus,
        error: Option<String>,
    ) -> Option<PathBuf> {
        let report = &mut state.report;
        report.status = status;
        report.failed_stage = (status != RunStatus::Succeeded).then(|| state.stage.to_string());
        report.error = error;
        report.had_errors = state.had_errors;
        report.set_files(&state.files);
        report.generated_at = chrono::Utc::now();

        let dir = request.destination_root.join(id.as_str());
        match report::write_report(&dir, report) {
            Ok(path) => Some(path),
            Err(err) => {
                warn!(content_id = %id, "could not write report: {err:#}");
                None
            }
        }
    }
}

fn is_interruption(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause.is::<Interrupted>()
            || matches!(
                cause.downcast_ref::<AcquireError>(),
                Some(AcquireError::Interrupted { .. })
            )
    })
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default()
}

/// Every file name a placement under `stem` would create.
fn target_names(stem: &str, pieces: usize, split: bool, ext: &str, mp3: bool) -> Vec<String> {
    let stems: Vec<String> = if split {
        (1..=pieces).map(|k| format!("{stem}_part{k}")).collect()
    } else {
        vec![stem.to_string()]
    };
    let mut names = Vec::with_capacity(stems.len() * 2);
    for stem in &stems {
        names.push(naming::file_name(stem, ext));
        if mp3 {
            names.push(naming::file_name(stem, MP3_EXTENSION));
        }
    }
    names
}

/// Copies through a hidden temp file and refuses to replace an existing
/// target.
fn copy_into_place(source: &Path, target: &Path) -> Result<()> {
    let tmp = sibling_temp(target, "copy")?;
    fs::copy(source, &*tmp)
        .with_context(|| format!("copying {} to {}", source.display(), target.display()))?;
    tmp.persist_noclobber(target)
        .map_err(|err| err.error)
        .with_context(|| format!("placing {}", target.display()))?;
    Ok(())
}

/// Mirrors `files` into `dir`, keeping names. Files already present there are
/// left alone.
fn copy_to_secondary(files: &[PathBuf], dir: &Path) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let mut copies = Vec::with_capacity(files.len());
    for file in files {
        let Some(name) = file.file_name() else {
            continue;
        };
        let target = dir.join(name);
        if !target.exists() {
            copy_into_place(file, &target)?;
        }
        copies.push(target);
    }
    Ok(copies)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Tuning;
    use crate::report::read_report;
    use crate::test_support::{
        STUB_LOCK, call_count, ffprobe_json, install_failing, install_ffprobe, stub_tools,
    };
    use crate::throttle::ResourceUsage;
    use tempfile::{TempDir, tempdir};

    const URL: &str = "https://x.com/i/spaces/1AbCdEf?s=20";

    #[derive(Debug)]
    struct Unmeasured;

    impl ResourceMonitor for Unmeasured {
        fn sample(&self) -> Option<ResourceUsage> {
            None
        }
    }

    struct Fixture {
        dir: TempDir,
        config: PipelineConfig,
    }

    impl Fixture {
        fn new(duration: f64, info_json: &str) -> Self {
            let dir = tempdir().unwrap();
            let bin = dir.path().join("bin");
            fs::create_dir_all(&bin).unwrap();
            let probe = ffprobe_json(duration, Some("Weekly: Update!"), Some("2024-03-05T18:00:00Z"));
            let tools = stub_tools(&bin, &probe, info_json);
            let config = PipelineConfig {
                scratch_dir: dir.path().join("scratch"),
                tools,
                tuning: Tuning {
                    throttle_pause_ms: 0,
                    ..Tuning::default()
                },
            };
            Self { dir, config }
        }

        fn bin(&self) -> PathBuf {
            self.dir.path().join("bin")
        }

        fn root(&self) -> PathBuf {
            self.dir.path().join("archive")
        }

        fn request(&self) -> ArchiveRequest {
            ArchiveRequest::new(URL, self.root())
        }

        fn archiver(&self) -> Archiver {
            Archiver::with_monitor(self.config.clone(), Box::new(Unmeasured))
        }

        fn scratch_scan(&self) -> locator::ScratchScan {
            locator::scan(&self.config.scratch_dir, &ContentId::new("1AbCdEf").unwrap()).unwrap()
        }

        fn media_in_destination(&self) -> Vec<String> {
            let mut names: Vec<String> = fs::read_dir(self.root().join("1AbCdEf"))
                .unwrap()
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.file_name().to_string_lossy().into_owned())
                .filter(|name| !name.ends_with(".json"))
                .collect();
            names.sort();
            names
        }
    }

    fn audio_info(duration: f64) -> String {
        serde_json::json!({
            "id": "1AbCdEf",
            "title": "Weekly: Update!",
            "duration": duration,
            "view_count": 1500,
            "formats": [{ "format_id": "hls", "vcodec": "none", "acodec": "aac" }]
        })
        .to_string()
    }

    #[test]
    fn archives_an_audio_space_and_cleans_scratch() {
        let _lock = STUB_LOCK.lock();
        let fixture = Fixture::new(3600.0, &audio_info(3600.0));

        let outcome = fixture.archiver().run(&fixture.request());

        assert_eq!(outcome.status, RunStatus::Succeeded, "{:?}", outcome.error);
        assert!(!outcome.had_errors);
        assert_eq!(outcome.stage, Stage::Cleanup);
        let expected = fixture
            .root()
            .join("1AbCdEf")
            .join("2024-03-05-Weekly Update-1AbCdEf.m4a");
        assert_eq!(outcome.files, vec![expected.clone()]);
        assert!(expected.exists());
        assert!(fixture.scratch_scan().is_empty());

        let report = read_report(&outcome.report.unwrap()).unwrap();
        assert_eq!(report.status, RunStatus::Succeeded);
        assert_eq!(report.title.as_deref(), Some("Weekly: Update!"));
        assert_eq!(report.has_video, Some(false));
        assert_eq!(report.freshly_downloaded, Some(true));
        assert_eq!(report.engagement.unwrap().view_count, Some(1500));
        let ffmpeg_log = fs::read_to_string(fixture.bin().join("ffmpeg.log")).unwrap();
        assert!(!ffmpeg_log.contains("libmp3lame"));
    }

    #[test]
    fn soft_errors_keep_scratch_for_the_next_run() {
        let _lock = STUB_LOCK.lock();
        let fixture = Fixture::new(3900.0, &audio_info(3600.0));

        let first = fixture.archiver().run(&fixture.request());
        assert_eq!(first.status, RunStatus::Succeeded);
        assert!(first.had_errors);
        assert!(fixture.scratch_scan().best_media().is_some());
        assert_eq!(call_count(&fixture.bin(), "twspace_dl"), 1);

        let second = fixture.archiver().run(&fixture.request());
        assert_eq!(second.status, RunStatus::Succeeded);
        assert_eq!(call_count(&fixture.bin(), "twspace_dl"), 1);
        let report = read_report(&second.report.unwrap()).unwrap();
        assert_eq!(report.freshly_downloaded, Some(false));
        assert!(!report.verification.unwrap().passed);
        assert_eq!(fixture.media_in_destination().len(), 1);
    }

    #[test]
    fn video_sources_get_an_mp3_companion() {
        let _lock = STUB_LOCK.lock();
        let info = serde_json::json!({
            "title": "Weekly: Update!",
            "duration": 3600,
            "formats": [{ "vcodec": "avc1.64001F", "acodec": "mp4a.40.2", "width": 1280, "height": 720 }]
        })
        .to_string();
        let fixture = Fixture::new(3600.0, &info);

        let outcome = fixture.archiver().run(&fixture.request());

        assert_eq!(outcome.status, RunStatus::Succeeded, "{:?}", outcome.error);
        assert_eq!(
            fixture.media_in_destination(),
            vec![
                "2024-03-05-Weekly Update-1AbCdEf.m4a".to_string(),
                "2024-03-05-Weekly Update-1AbCdEf.mp3".to_string(),
            ]
        );
        let ffmpeg_log = fs::read_to_string(fixture.bin().join("ffmpeg.log")).unwrap();
        assert!(ffmpeg_log.contains("-b:a 192k"));
        let report = read_report(&outcome.report.unwrap()).unwrap();
        assert_eq!(report.has_video, Some(true));
    }

    #[test]
    fn classification_falls_back_to_file_streams() {
        let _lock = STUB_LOCK.lock();
        let fixture = Fixture::new(3600.0, "{}");
        let probe = serde_json::json!({
            "streams": [
                { "index": 0, "codec_type": "video", "codec_name": "h264" },
                { "index": 1, "codec_type": "audio", "codec_name": "aac" }
            ],
            "format": {
                "duration": "3600.000000",
                "tags": { "title": "Weekly: Update!", "creation_time": "2024-03-05T18:00:00Z" }
            }
        })
        .to_string();
        install_ffprobe(&fixture.bin(), &probe);

        let outcome = fixture.archiver().run(&fixture.request());

        assert_eq!(outcome.status, RunStatus::Succeeded, "{:?}", outcome.error);
        assert_eq!(outcome.stage, Stage::Cleanup);
        let report = read_report(&outcome.report.unwrap()).unwrap();
        assert_eq!(report.has_video, Some(true));
        assert_eq!(fixture.media_in_destination().len(), 2);
    }

    #[test]
    fn long_recordings_are_placed_as_a_part_set() {
        let _lock = STUB_LOCK.lock();
        let fixture = Fixture::new(9000.0, &audio_info(9000.0));

        let outcome = fixture.archiver().run(&fixture.request());

        assert_eq!(outcome.status, RunStatus::Succeeded, "{:?}", outcome.error);
        assert_eq!(
            fixture.media_in_destination(),
            vec![
                "2024-03-05-Weekly Update-1AbCdEf_part1.m4a".to_string(),
                "2024-03-05-Weekly Update-1AbCdEf_part2.m4a".to_string(),
            ]
        );
        assert!(!locator::parts_dir(&fixture.config.scratch_dir, &ContentId::new("1AbCdEf").unwrap()).exists());
    }

    #[test]
    fn forced_tool_skips_the_primary_downloader() {
        let _lock = STUB_LOCK.lock();
        let fixture = Fixture::new(3600.0, &audio_info(3600.0));
        let mut request = fixture.request();
        request.tool = ToolSelection::YtDlp;

        let outcome = fixture.archiver().run(&request);

        assert_eq!(outcome.status, RunStatus::Succeeded, "{:?}", outcome.error);
        assert_eq!(call_count(&fixture.bin(), "twspace_dl"), 0);
        let log = fs::read_to_string(fixture.bin().join("yt-dlp.log")).unwrap();
        assert!(log.lines().any(|line| line.contains("--write-info-json")));
    }

    #[test]
    fn secondary_location_receives_copies() {
        let _lock = STUB_LOCK.lock();
        let fixture = Fixture::new(3600.0, &audio_info(3600.0));
        let mut request = fixture.request();
        let secondary = fixture.dir.path().join("mirror");
        request.secondary_dir = Some(secondary.clone());

        let outcome = fixture.archiver().run(&request);

        assert!(outcome.is_success());
        assert!(
            secondary
                .join("1AbCdEf")
                .join("2024-03-05-Weekly Update-1AbCdEf.m4a")
                .exists()
        );
    }

    #[test]
    fn exhausted_acquisition_fails_and_still_reports() {
        let _lock = STUB_LOCK.lock();
        let fixture = Fixture::new(3600.0, &audio_info(3600.0));
        install_failing(&fixture.bin(), "twspace_dl");
        install_failing(&fixture.bin(), "yt-dlp");

        let outcome = fixture.archiver().run(&fixture.request());

        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(outcome.stage, Stage::LocateOrAcquire);
        assert!(outcome.error.unwrap().contains("every acquisition strategy failed"));
        let report = read_report(&outcome.report.unwrap()).unwrap();
        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(report.failed_stage.as_deref(), Some("locate_or_acquire"));
    }

    #[test]
    fn cancelled_runs_end_interrupted_without_downloading() {
        let _lock = STUB_LOCK.lock();
        let fixture = Fixture::new(3600.0, &audio_info(3600.0));
        let cancel = CancelFlag::new();
        cancel.cancel();

        let outcome = fixture
            .archiver()
            .with_cancel_flag(cancel)
            .run(&fixture.request());

        assert_eq!(outcome.status, RunStatus::Interrupted);
        assert_eq!(call_count(&fixture.bin(), "twspace_dl"), 0);
    }

    #[test]
    fn unusable_url_fails_without_report() {
        let _lock = STUB_LOCK.lock();
        let fixture = Fixture::new(3600.0, "{}");
        let outcome = fixture.archiver().run(&ArchiveRequest::new("", fixture.root()));
        assert_eq!(outcome.status, RunStatus::Failed);
        assert!(outcome.report.is_none());
    }

    #[test]
    fn target_names_cover_every_sibling() {
        assert_eq!(target_names("s", 1, false, "m4a", false), vec!["s.m4a"]);
        assert_eq!(
            target_names("s", 2, true, "mp4", true),
            vec!["s_part1.mp4", "s_part1.mp3", "s_part2.mp4", "s_part2.mp3"]
        );
    }
}
