//! Decides whether a recording carried a video track.
//!
//! The source platform has no single "is video" flag, so several redundant
//! signals from the format list are combined; any one of them is enough.

use serde::{Deserialize, Serialize};

use crate::probe::FileProbe;

/// One entry of the `formats` list in yt-dlp's JSON dump. Everything is
/// optional because different extractors fill different subsets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FormatDescriptor {
    #[serde(default)]
    pub format_id: Option<String>,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub format_note: Option<String>,
    #[serde(default)]
    pub ext: Option<String>,
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

/// The first signal that proved a video track exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoSignal {
    VideoCodec,
    Dimensions,
    FrameRate,
    FormatDescription,
    VideoOnlyStream,
    FileStream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub has_video: bool,
    pub signal: Option<VideoSignal>,
}

impl Classification {
    const AUDIO_ONLY: Self = Self {
        has_video: false,
        signal: None,
    };

    fn video(signal: VideoSignal) -> Self {
        Self {
            has_video: true,
            signal: Some(signal),
        }
    }
}

pub fn has_video(formats: &[FormatDescriptor]) -> bool {
    classify_formats(formats).has_video
}

pub fn classify_formats(formats: &[FormatDescriptor]) -> Classification {
    formats
        .iter()
        .find_map(video_signal)
        .map_or(Classification::AUDIO_ONLY, Classification::video)
}

/// Uses the pre-download format list when there is one, otherwise whatever
/// streams ffprobe found in the downloaded file.
pub fn classify(formats: &[FormatDescriptor], file: Option<&FileProbe>) -> Classification {
    if !formats.is_empty() {
        return classify_formats(formats);
    }
    match file {
        Some(probe) if probe.has_video_stream => Classification::video(VideoSignal::FileStream),
        _ => Classification::AUDIO_ONLY,
    }
}

fn video_signal(format: &FormatDescriptor) -> Option<VideoSignal> {
    if format.vcodec.as_deref().is_some_and(is_real_codec) {
        return Some(VideoSignal::VideoCodec);
    }
    if format.width.is_some_and(|w| w > 0.0) && format.height.is_some_and(|h| h > 0.0) {
        return Some(VideoSignal::Dimensions);
    }
    if format.fps.is_some_and(|fps| fps > 0.0) {
        return Some(VideoSignal::FrameRate);
    }
    let mentions_video = |text: &Option<String>| {
        text.as_deref()
            .is_some_and(|text| text.to_ascii_lowercase().contains("video"))
    };
    if mentions_video(&format.format_note) || mentions_video(&format.format) {
        return Some(VideoSignal::FormatDescription);
    }
    if format
        .acodec
        .as_deref()
        .is_some_and(|codec| codec.trim().eq_ignore_ascii_case("none"))
    {
        return Some(VideoSignal::VideoOnlyStream);
    }
    None
}

fn is_real_codec(codec: &str) -> bool {
    let codec = codec.trim();
    !codec.is_empty() && !codec.eq_ignore_ascii_case("none") && !codec.eq_ignore_ascii_case("n/a")
}
