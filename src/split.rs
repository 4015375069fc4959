//! Stream-copy splitting of very long recordings into equal parts.
//!
//! Progress is kept in `checkpoint.json` inside the parts directory, so an
//! interrupted split resumes at the first unfinished part.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cancel::CancelFlag;
use crate::content_id::ContentId;
use crate::locator;
use crate::naming;
use crate::tagging::sibling_temp;
use crate::throttle::Throttle;
use crate::tools;

pub const CHECKPOINT_FILE: &str = "checkpoint.json";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SplitPlan {
    pub parts: u32,
    pub segment_secs: f64,
}

impl SplitPlan {
    pub fn start_of(&self, part: u32) -> f64 {
        f64::from(part.saturating_sub(1)) * self.segment_secs
    }
}

/// `None` when the recording fits under `ceiling_secs`.
pub fn plan(duration_secs: f64, ceiling_secs: f64) -> Option<SplitPlan> {
    if ceiling_secs.is_nan() || ceiling_secs <= 0.0 || !duration_secs.is_finite() {
        return None;
    }
    if duration_secs <= ceiling_secs {
        return None;
    }
    let parts = (duration_secs / ceiling_secs).ceil() as u32;
    Some(SplitPlan {
        parts,
        segment_secs: duration_secs / f64::from(parts),
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitCheckpoint {
    pub content_id: ContentId,
    pub source: PathBuf,
    pub parts: u32,
    pub segment_secs: f64,
    pub completed: BTreeSet<u32>,
}

impl SplitCheckpoint {
    fn fresh(id: &ContentId, source: &Path, plan: &SplitPlan) -> Self {
        Self {
            content_id: id.clone(),
            source: source.to_path_buf(),
            parts: plan.parts,
            segment_secs: plan.segment_secs,
            completed: BTreeSet::new(),
        }
    }

    fn matches(&self, id: &ContentId, source: &Path, plan: &SplitPlan) -> bool {
        &self.content_id == id
            && self.source == source
            && self.parts == plan.parts
            && (self.segment_secs - plan.segment_secs).abs() < 0.001
    }

    pub fn load(path: &Path) -> Option<Self> {
        let raw = fs::read_to_string(path).ok()?;
        match serde_json::from_str(&raw) {
            Ok(checkpoint) => Some(checkpoint),
            Err(err) => {
                warn!(path = %path.display(), "ignoring unreadable split checkpoint: {err}");
                None
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("json.tmp");
        let payload = serde_json::to_vec_pretty(self)?;
        fs::write(&tmp, payload).with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, path).with_context(|| format!("replacing {}", path.display()))?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Splitter {
    ffmpeg: PathBuf,
}

impl Splitter {
    pub fn new(ffmpeg: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
        }
    }

    /// Cuts `source` into `plan.parts` files named `{id}_part{k}.{ext}` in
    /// the id's parts directory under `scratch_dir`. Returns them in order.
    pub fn split(
        &self,
        source: &Path,
        id: &ContentId,
        scratch_dir: &Path,
        plan: &SplitPlan,
        throttle: &Throttle,
        cancel: &CancelFlag,
    ) -> Result<Vec<PathBuf>> {
        let parts_dir = locator::parts_dir(scratch_dir, id);
        fs::create_dir_all(&parts_dir)
            .with_context(|| format!("creating {}", parts_dir.display()))?;
        let checkpoint_path = parts_dir.join(CHECKPOINT_FILE);
        let ext = source
            .extension()
            .map(|ext| ext.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut checkpoint = match SplitCheckpoint::load(&checkpoint_path) {
            Some(existing) if existing.matches(id, source, plan) => {
                info!(
                    content_id = %id,
                    completed = existing.completed.len(),
                    parts = plan.parts,
                    "resuming split from checkpoint"
                );
                existing
            }
            _ => SplitCheckpoint::fresh(id, source, plan),
        };

        let mut outputs = Vec::with_capacity(plan.parts as usize);
        for part in 1..=plan.parts {
            let output = naming::part_path(&parts_dir, id.as_str(), part, &ext);
            if checkpoint.completed.contains(&part) && output.exists() {
                debug!(part, path = %output.display(), "part already done");
                outputs.push(output);
                continue;
            }
            checkpoint.completed.remove(&part);

            throttle.wait_if_busy(cancel, || checkpoint.save(&checkpoint_path))?;
            cancel.check()?;

            self.cut(source, &output, plan, part)?;
            checkpoint.completed.insert(part);
            checkpoint.save(&checkpoint_path)?;
            info!(content_id = %id, part, parts = plan.parts, "wrote part");
            outputs.push(output);
        }

        Ok(outputs)
    }

    fn cut(&self, source: &Path, output: &Path, plan: &SplitPlan, part: u32) -> Result<()> {
        let tmp = sibling_temp(output, "cut")?;
        let mut command = tools::command(&self.ffmpeg);
        command
            .args(["-hide_banner", "-loglevel", "error", "-y", "-ss"])
            .arg(format!("{:.3}", plan.start_of(part)));
        if part < plan.parts {
            command.arg("-t").arg(format!("{:.3}", plan.segment_secs));
        }
        command
            .arg("-i")
            .arg(source)
            .args(["-map", "0", "-c", "copy"])
            .arg(&*tmp);
        tools::run_checked(command, "ffmpeg splitter")
            .with_context(|| format!("cutting part {part} of {}", source.display()))?;
        tmp.persist(output)
            .map_err(|err| err.error)
            .with_context(|| format!("moving part into {}", output.display()))?;
        Ok(())
    }
}
