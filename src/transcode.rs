//! MP3 companion for recordings that carry video.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::NaiveDate;
use tracing::info;

use crate::tagging::sibling_temp;
use crate::tools;

#[derive(Debug, Clone)]
pub struct Transcoder {
    ffmpeg: PathBuf,
    bitrate_kbps: u32,
}

impl Transcoder {
    pub fn new(ffmpeg: impl Into<PathBuf>, bitrate_kbps: u32) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            bitrate_kbps,
        }
    }

    /// Whether `master` needs an MP3 companion at all.
    pub fn wants_companion(master: &Path, has_video: bool) -> bool {
        has_video
            && !master
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("mp3"))
    }

    /// Encodes the audio of `master` into `output`. Never overwrites an
    /// existing file and leaves the master alone.
    pub fn to_mp3(&self, master: &Path, output: &Path, title: &str, date: NaiveDate) -> Result<()> {
        if output.exists() {
            bail!("{} already exists", output.display());
        }
        let tmp = sibling_temp(output, "mp3")?;

        let mut command = tools::command(&self.ffmpeg);
        command
            .args(["-hide_banner", "-loglevel", "error", "-y", "-i"])
            .arg(master)
            .args(["-vn", "-codec:a", "libmp3lame", "-b:a"])
            .arg(format!("{}k", self.bitrate_kbps))
            .arg("-metadata")
            .arg(format!("title={title}"))
            .arg("-metadata")
            .arg(format!("date={}", date.format("%Y-%m-%d")))
            .arg(&*tmp);
        tools::run_checked(command, "ffmpeg mp3 encoder")
            .with_context(|| format!("transcoding {} to mp3", master.display()))?;

        tmp.persist_noclobber(output)
            .map_err(|err| err.error)
            .with_context(|| format!("moving mp3 into {}", output.display()))?;
        info!(
            master = %master.display(),
            output = %output.display(),
            bitrate_kbps = self.bitrate_kbps,
            "wrote mp3 companion"
        );
        Ok(())
    }
}
