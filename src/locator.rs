//! Scratch-directory scan keyed by content id.
//!
//! The scratch area doubles as a cache: a complete file left behind by an
//! earlier run short-circuits acquisition.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::content_id::ContentId;
use crate::naming;

const MEDIA_EXTENSIONS: &[&str] = &[
    "m4a", "mp3", "mp4", "aac", "webm", "mkv", "opus", "ogg", "flac", "wav", "ts", "mov", "m4v",
    "mka",
];

const SIDECAR_EXTENSIONS: &[&str] = &[
    "json", "m3u8", "m3u", "txt", "description", "jpg", "jpeg", "png", "webp", "log", "vtt", "srt",
];

const PARTIAL_SUFFIXES: &[&str] = &[".part", ".ytdl", ".temp", ".tmp", ".aria2"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Media,
    Sidecar,
    Partial,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScratchArtifact {
    pub path: PathBuf,
    pub kind: ArtifactKind,
    pub size_bytes: u64,
    pub modified: Option<SystemTime>,
    /// Partials the downloader can pick up again (`.part`, `.ytdl`).
    pub resumable: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ScratchScan {
    pub artifacts: Vec<ScratchArtifact>,
}

impl ScratchScan {
    pub fn media(&self) -> impl Iterator<Item = &ScratchArtifact> {
        self.of_kind(ArtifactKind::Media)
    }

    pub fn sidecars(&self) -> impl Iterator<Item = &ScratchArtifact> {
        self.of_kind(ArtifactKind::Sidecar)
    }

    pub fn partials(&self) -> impl Iterator<Item = &ScratchArtifact> {
        self.of_kind(ArtifactKind::Partial)
    }

    /// The largest complete media file, if any.
    pub fn best_media(&self) -> Option<&ScratchArtifact> {
        self.media().max_by_key(|artifact| artifact.size_bytes)
    }

    /// Media files written at or after `since`.
    pub fn fresh_media(&self, since: SystemTime) -> impl Iterator<Item = &ScratchArtifact> {
        self.media()
            .filter(move |artifact| artifact.modified.is_some_and(|modified| modified >= since))
    }

    /// The largest media file written at or after `since`.
    pub fn media_since(&self, since: SystemTime) -> Option<&ScratchArtifact> {
        self.fresh_media(since).max_by_key(|artifact| artifact.size_bytes)
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    fn of_kind(&self, kind: ArtifactKind) -> impl Iterator<Item = &ScratchArtifact> {
        self.artifacts
            .iter()
            .filter(move |artifact| artifact.kind == kind)
    }
}

/// Classifies a file name. Partial markers win over the media extension so
/// that `x.m4a.part` is never mistaken for a finished download.
pub fn classify_name(name: &str) -> ArtifactKind {
    let lower = name.to_ascii_lowercase();
    if is_partial_name(&lower) {
        return ArtifactKind::Partial;
    }
    let Some((_, ext)) = lower.rsplit_once('.') else {
        return ArtifactKind::Sidecar;
    };
    if MEDIA_EXTENSIONS.contains(&ext) {
        return ArtifactKind::Media;
    }
    if SIDECAR_EXTENSIONS.contains(&ext) {
        return ArtifactKind::Sidecar;
    }
    let guess = mime_guess::from_ext(ext).first();
    match guess.as_ref().map(|mime| mime.type_().as_str()) {
        Some("audio" | "video") => ArtifactKind::Media,
        _ => ArtifactKind::Sidecar,
    }
}

fn is_partial_name(lower: &str) -> bool {
    lower.starts_with('.')
        || lower.contains(".part-frag")
        || PARTIAL_SUFFIXES.iter().any(|suffix| lower.ends_with(suffix))
        || is_format_intermediate(lower)
}

/// yt-dlp writes separately downloaded streams as `<name>.f<format_id>.<ext>`
/// before merging them.
fn is_format_intermediate(lower: &str) -> bool {
    lower.split('.').skip(1).any(|segment| {
        segment.len() > 1
            && segment.starts_with('f')
            && segment[1..].bytes().all(|b| b.is_ascii_digit())
    }) && lower.matches('.').count() >= 2
}

fn is_resumable(lower: &str) -> bool {
    lower.ends_with(".part") || lower.ends_with(".ytdl")
}

/// Whether the file `name` belongs to `id`.
///
/// Scratch files are `{id}` or `{id}.*`, plus hidden `.{id}.*` temps. Archived
/// files are `{date}-[{title}-]{id}[_N][_partK].{ext}`. Ids never contain a
/// dot, so an id that merely starts with `id` does not match.
pub fn belongs_to(name: &str, id: &ContentId) -> bool {
    let id = id.as_str();
    let bare = name.strip_prefix('.').unwrap_or(name);
    if bare == id || bare.strip_prefix(id).is_some_and(|rest| rest.starts_with('.')) {
        return true;
    }

    let stem = naming::set_stem(name);
    if !has_date_prefix(stem) {
        return false;
    }
    let owned = |stem: &str| stem.strip_suffix(id).is_some_and(|head| head.ends_with('-'));
    owned(stem) || naming::strip_counter(stem).is_some_and(owned)
}

/// `YYYY-MM-DD-` as written by the name builder.
fn has_date_prefix(stem: &str) -> bool {
    let bytes = stem.as_bytes();
    bytes.len() > 11
        && bytes[..11].iter().enumerate().all(|(i, b)| match i {
            4 | 7 | 10 => *b == b'-',
            _ => b.is_ascii_digit(),
        })
}

/// Lists the files directly inside `scratch_dir` that belong to `id`. A
/// missing directory yields an empty scan.
pub fn scan(scratch_dir: &Path, id: &ContentId) -> Result<ScratchScan> {
    let mut scan = ScratchScan::default();
    if !scratch_dir.exists() {
        return Ok(scan);
    }

    for entry in WalkDir::new(scratch_dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
    {
        let name = entry.file_name().to_string_lossy();
        if !belongs_to(&name, id) {
            continue;
        }
        let lower = name.to_ascii_lowercase();
        let metadata = entry
            .metadata()
            .with_context(|| format!("reading metadata for {}", entry.path().display()))?;
        scan.artifacts.push(ScratchArtifact {
            path: entry.path().to_path_buf(),
            kind: classify_name(&name),
            size_bytes: metadata.len(),
            modified: metadata.modified().ok(),
            resumable: is_resumable(&lower),
        });
    }

    scan.artifacts.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(scan)
}

/// Scans and logs what an earlier run left behind.
pub fn locate_existing(scratch_dir: &Path, id: &ContentId) -> Result<ScratchScan> {
    let scan = scan(scratch_dir, id)?;
    for artifact in &scan.artifacts {
        debug!(
            content_id = %id,
            path = %artifact.path.display(),
            kind = ?artifact.kind,
            size = artifact.size_bytes,
            "found scratch artifact"
        );
    }
    info!(
        content_id = %id,
        media = scan.media().count(),
        sidecars = scan.sidecars().count(),
        partials = scan.partials().count(),
        "scanned scratch directory"
    );
    Ok(scan)
}

/// Removes partials the downloaders cannot resume. Resumable ones are left
/// for `--continue`.
pub fn discard_partials(scan: &ScratchScan) -> Result<usize> {
    let mut removed = 0;
    for artifact in scan.partials().filter(|artifact| !artifact.resumable) {
        fs::remove_file(&artifact.path)
            .with_context(|| format!("removing partial {}", artifact.path.display()))?;
        debug!(path = %artifact.path.display(), "removed stale partial");
        removed += 1;
    }
    Ok(removed)
}

/// Directory holding split parts and their checkpoint.
pub fn parts_dir(scratch_dir: &Path, id: &ContentId) -> PathBuf {
    scratch_dir.join(format!("{id}-parts"))
}

/// Deletes every scratch artifact for `id`, including the parts directory.
/// Individual failures are logged and counted but do not abort the sweep.
pub fn purge(scratch_dir: &Path, id: &ContentId) -> Result<usize> {
    let scan = scan(scratch_dir, id)?;
    let mut removed = 0;
    for artifact in &scan.artifacts {
        match fs::remove_file(&artifact.path) {
            Ok(()) => removed += 1,
            Err(err) => warn!(path = %artifact.path.display(), "could not remove scratch file: {err}"),
        }
    }
    let parts = parts_dir(scratch_dir, id);
    if parts.is_dir() {
        fs::remove_dir_all(&parts).with_context(|| format!("removing {}", parts.display()))?;
        removed += 1;
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn id() -> ContentId {
        ContentId::new("1AbCdEf").unwrap()
    }

    #[test]
    fn classifies_names() {
        assert_eq!(classify_name("1AbCdEf.m4a"), ArtifactKind::Media);
        assert_eq!(classify_name("1AbCdEf.MP4"), ArtifactKind::Media);
        assert_eq!(classify_name("1AbCdEf.info.json"), ArtifactKind::Sidecar);
        assert_eq!(classify_name("1AbCdEf.m3u8"), ArtifactKind::Sidecar);
        assert_eq!(classify_name("1AbCdEf.jpg"), ArtifactKind::Sidecar);
        assert_eq!(classify_name("1AbCdEf.m4a.part"), ArtifactKind::Partial);
        assert_eq!(classify_name("1AbCdEf.m4a.ytdl"), ArtifactKind::Partial);
        assert_eq!(classify_name("1AbCdEf.m4a.part-Frag12"), ArtifactKind::Partial);
        assert_eq!(classify_name("1AbCdEf.f140.m4a"), ArtifactKind::Partial);
        assert_eq!(classify_name(".1AbCdEf.tagging-x.m4a"), ArtifactKind::Partial);
        assert_eq!(classify_name("1AbCdEf.m4a.aria2"), ArtifactKind::Partial);
    }

    #[test]
    fn ids_match_as_whole_tokens() {
        let id = id();
        assert!(belongs_to("1AbCdEf", &id));
        assert!(belongs_to("1AbCdEf.m4a", &id));
        assert!(belongs_to("1AbCdEf.m4a.part", &id));
        assert!(belongs_to(".1AbCdEf.tag-Xy12.m4a", &id));
        assert!(belongs_to("2024-03-05-Weekly Update-1AbCdEf.m4a", &id));
        assert!(belongs_to("2024-03-05-1AbCdEf_2_part3.mp3", &id));
        assert!(!belongs_to("1AbCdEfXYZ.m4a", &id));
        assert!(!belongs_to("1AbCdEf-2.m4a", &id));
        assert!(!belongs_to("X1AbCdEf.m4a", &id));
        assert!(!belongs_to("2024-03-05-Talk-1AbCdEfXYZ.m4a", &id));
        assert!(!belongs_to("2024-03-05-Talk-X1AbCdEf.m4a", &id));
        assert!(!belongs_to("notes about 1AbCdEf.txt", &id));
    }

    #[test]
    fn longer_id_sharing_the_prefix_is_left_alone() {
        let dir = tempdir().unwrap();
        let other = dir.path().join("1AbCdEfXYZ.m4a");
        let other_partial = dir.path().join("1AbCdEfXYZ.m4a.part");
        fs::write(&other, "other recording").unwrap();
        fs::write(&other_partial, "other partial").unwrap();

        assert!(locate_existing(dir.path(), &id()).unwrap().is_empty());
        assert_eq!(purge(dir.path(), &id()).unwrap(), 0);
        assert!(other.exists());
        assert!(other_partial.exists());
    }

    #[test]
    fn missing_directory_is_an_empty_scan() {
        let dir = tempdir().unwrap();
        let scan = scan(&dir.path().join("absent"), &id()).unwrap();
        assert!(scan.is_empty());
    }

    #[test]
    fn scan_filters_by_id_and_picks_largest_media() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("1AbCdEf.m4a"), vec![0u8; 10]).unwrap();
        fs::write(dir.path().join("1AbCdEf.mp4"), vec![0u8; 20]).unwrap();
        fs::write(dir.path().join("1AbCdEf.info.json"), "{}").unwrap();
        fs::write(dir.path().join("1AbCdEf.m4a.part"), "x").unwrap();
        fs::write(dir.path().join("Other.m4a"), vec![0u8; 50]).unwrap();
        fs::create_dir(dir.path().join("1AbCdEf-parts")).unwrap();

        let scan = locate_existing(dir.path(), &id()).unwrap();
        assert_eq!(scan.media().count(), 2);
        assert_eq!(scan.sidecars().count(), 1);
        assert_eq!(scan.partials().count(), 1);
        assert_eq!(
            scan.best_media().unwrap().path,
            dir.path().join("1AbCdEf.mp4")
        );
    }

    #[test]
    fn discard_keeps_resumable_partials() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("1AbCdEf.m4a.part"), "x").unwrap();
        fs::write(dir.path().join("1AbCdEf.m4a.part-Frag3"), "x").unwrap();
        fs::write(dir.path().join("1AbCdEf.temp"), "x").unwrap();

        let scan = scan(dir.path(), &id()).unwrap();
        assert_eq!(discard_partials(&scan).unwrap(), 2);
        assert!(dir.path().join("1AbCdEf.m4a.part").exists());
        assert!(!dir.path().join("1AbCdEf.m4a.part-Frag3").exists());
        assert!(!dir.path().join("1AbCdEf.temp").exists());
    }

    #[test]
    fn purge_removes_everything_for_the_id() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("1AbCdEf.m4a"), "x").unwrap();
        fs::write(dir.path().join("1AbCdEf.source.json"), "{}").unwrap();
        fs::write(dir.path().join("Other.m4a"), "x").unwrap();
        let parts = parts_dir(dir.path(), &id());
        fs::create_dir(&parts).unwrap();
        fs::write(parts.join("checkpoint.json"), "{}").unwrap();

        assert_eq!(purge(dir.path(), &id()).unwrap(), 3);
        assert!(!parts.exists());
        assert!(dir.path().join("Other.m4a").exists());
        assert!(scan(dir.path(), &id()).unwrap().is_empty());
    }
}
