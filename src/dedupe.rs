//! Collapses historical copies of one recording in a destination folder.
//!
//! Files are grouped into sets by stem, so a master, its mp3 companion and
//! all `_partK` pieces live or die together. Only media files are touched.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::content_id::ContentId;
use crate::locator::{self, ArtifactKind};
use crate::naming;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DedupeOutcome {
    pub kept: Vec<PathBuf>,
    pub removed: Vec<PathBuf>,
}

#[derive(Debug)]
struct Member {
    path: PathBuf,
    modified: SystemTime,
}

/// Keeps one set of media files for `id` in `dir` and deletes the rest. The
/// set containing any of `keep` wins; otherwise the newest set does, with
/// ties going to the longer name.
pub fn deduplicate(dir: &Path, id: &ContentId, keep: &[PathBuf]) -> Result<DedupeOutcome> {
    let mut sets: BTreeMap<String, Vec<Member>> = BTreeMap::new();
    if !dir.is_dir() {
        return Ok(DedupeOutcome::default());
    }

    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
    {
        let name = entry.file_name().to_string_lossy();
        if !locator::belongs_to(&name, id) || locator::classify_name(&name) != ArtifactKind::Media {
            continue;
        }
        let modified = entry
            .metadata()
            .with_context(|| format!("reading metadata for {}", entry.path().display()))?
            .modified()
            .unwrap_or(SystemTime::UNIX_EPOCH);
        sets.entry(naming::set_stem(&name).to_string())
            .or_default()
            .push(Member {
                path: entry.path().to_path_buf(),
                modified,
            });
    }

    let Some(winner) = pick_winner(&sets, keep) else {
        return Ok(DedupeOutcome::default());
    };

    let mut outcome = DedupeOutcome::default();
    for (stem, members) in sets {
        if stem == winner {
            outcome.kept.extend(members.into_iter().map(|member| member.path));
            continue;
        }
        for member in members {
            fs::remove_file(&member.path)
                .with_context(|| format!("removing duplicate {}", member.path.display()))?;
            debug!(path = %member.path.display(), "removed duplicate");
            outcome.removed.push(member.path);
        }
    }

    if !outcome.removed.is_empty() {
        info!(
            content_id = %id,
            kept = outcome.kept.len(),
            removed = outcome.removed.len(),
            set = %winner,
            "collapsed duplicate archives"
        );
    }
    Ok(outcome)
}

fn pick_winner(sets: &BTreeMap<String, Vec<Member>>, keep: &[PathBuf]) -> Option<String> {
    if let Some((stem, _)) = sets
        .iter()
        .find(|(_, members)| members.iter().any(|member| keep.contains(&member.path)))
    {
        return Some(stem.clone());
    }
    sets.iter()
        .max_by(|(a_stem, a), (b_stem, b)| {
            newest(a)
                .cmp(&newest(b))
                .then_with(|| a_stem.len().cmp(&b_stem.len()))
        })
        .map(|(stem, _)| stem.clone())
}

fn newest(members: &[Member]) -> SystemTime {
    members
        .iter()
        .map(|member| member.modified)
        .max()
        .unwrap_or(SystemTime::UNIX_EPOCH)
}
