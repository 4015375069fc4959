//! Title/date tag injection by stream copy.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use tempfile::TempPath;
use tracing::info;

use crate::tools;

#[derive(Debug, Clone)]
pub struct MetadataWriter {
    ffmpeg: PathBuf,
}

impl MetadataWriter {
    pub fn new(ffmpeg: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
        }
    }

    /// Rewrites `path` with new `title` and `date` tags. The source is only
    /// replaced once ffmpeg has succeeded.
    pub fn write_tags(&self, path: &Path, title: &str, date: NaiveDate) -> Result<()> {
        let tmp = sibling_temp(path, "tag")?;

        let mut command = tools::command(&self.ffmpeg);
        command
            .args(["-hide_banner", "-loglevel", "error", "-y", "-i"])
            .arg(path)
            .args(["-map", "0", "-c", "copy"])
            .arg("-metadata")
            .arg(format!("title={title}"))
            .arg("-metadata")
            .arg(format!("date={}", date.format("%Y-%m-%d")))
            .arg(&*tmp);
        tools::run_checked(command, "ffmpeg tag writer")
            .with_context(|| format!("writing tags to {}", path.display()))?;

        tmp.persist(path)
            .map_err(|err| err.error)
            .with_context(|| format!("replacing {} with the tagged copy", path.display()))?;
        info!(path = %path.display(), %title, %date, "wrote metadata tags");
        Ok(())
    }
}

/// Reserves a hidden temporary file next to `target` that keeps its
/// extension, so ffmpeg picks the same muxer. Dropping the returned path
/// removes the file.
pub(crate) fn sibling_temp(target: &Path, purpose: &str) -> Result<TempPath> {
    let dir = target
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let stem = target
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    let suffix = target
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default();

    let file = tempfile::Builder::new()
        .prefix(&format!(".{stem}.{purpose}-"))
        .suffix(&suffix)
        .tempfile_in(dir)
        .with_context(|| format!("creating temporary file in {}", dir.display()))?;
    Ok(file.into_temp_path())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{STUB_LOCK, install_failing, install_ffmpeg};
    use std::fs;
    use tempfile::tempdir;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 5).unwrap()
    }

    #[test]
    fn tags_are_written_through_a_temp_file() {
        let _lock = STUB_LOCK.lock();
        let dir = tempdir().unwrap();
        let ffmpeg = install_ffmpeg(dir.path());
        let media = dir.path().join("1AbCdEf.m4a");
        fs::write(&media, "audio").unwrap();

        MetadataWriter::new(ffmpeg)
            .write_tags(&media, "Weekly Update", date())
            .unwrap();

        assert_eq!(fs::read_to_string(&media).unwrap(), "audio");
        let log = fs::read_to_string(dir.path().join("ffmpeg.log")).unwrap();
        assert!(log.contains("-map 0 -c copy"));
        assert!(log.contains("-metadata title=Weekly Update"));
        assert!(log.contains("-metadata date=2024-03-05"));
        assert!(log.contains("/.1AbCdEf.tag-"));
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().starts_with('.'))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn failure_leaves_the_source_untouched() {
        let _lock = STUB_LOCK.lock();
        let dir = tempdir().unwrap();
        let ffmpeg = install_failing(dir.path(), "ffmpeg");
        let media = dir.path().join("1AbCdEf.m4a");
        fs::write(&media, "audio").unwrap();

        let err = MetadataWriter::new(ffmpeg)
            .write_tags(&media, "Weekly", date())
            .unwrap_err();

        assert!(format!("{err:#}").contains("simulated failure"));
        assert_eq!(fs::read_to_string(&media).unwrap(), "audio");
        let count = fs::read_dir(dir.path()).unwrap().count();
        // media, stub script and its log
        assert_eq!(count, 3);
    }
}
