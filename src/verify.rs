//! Integrity checks for a freshly acquired file.
//!
//! Verification never returns an error. A failed check is reported through
//! [`Verification::passed`] and the orchestrator decides what it means.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::config::Tuning;
use crate::probe::{self, FileProbe};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VerifyFailure {
    ProbeFailed,
    TooShort { actual: f64, minimum: f64 },
    DurationMismatch { expected: f64, actual: f64, tolerance: f64 },
}

impl fmt::Display for VerifyFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProbeFailed => f.write_str("container duration could not be probed"),
            Self::TooShort { actual, minimum } => {
                write!(f, "duration {actual:.1}s is below the {minimum:.0}s minimum")
            }
            Self::DurationMismatch {
                expected,
                actual,
                tolerance,
            } => write!(
                f,
                "duration {actual:.1}s differs from the expected {expected:.1}s by more than {tolerance:.0}s"
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Verification {
    pub passed: bool,
    pub duration_seconds: Option<f64>,
    pub failure: Option<VerifyFailure>,
    /// The probe used for the check, kept so later stages need not re-run it.
    pub probe: Option<FileProbe>,
}

#[derive(Debug, Clone)]
pub struct Verifier {
    ffprobe: PathBuf,
    min_duration_secs: f64,
    tolerance_secs: f64,
}

impl Verifier {
    pub fn new(ffprobe: impl Into<PathBuf>, tuning: &Tuning) -> Self {
        Self {
            ffprobe: ffprobe.into(),
            min_duration_secs: tuning.min_duration_secs,
            tolerance_secs: tuning.duration_tolerance_secs,
        }
    }

    pub fn verify(&self, path: &Path, expected_secs: Option<f64>) -> Verification {
        let probe = probe::probe_file(&self.ffprobe, path);
        let actual = probe.as_ref().and_then(|probe| probe.duration_seconds);
        let mut verification = self.check(actual, expected_secs);
        verification.probe = probe;
        verification
    }

    /// Applies the duration rules to an already probed value. A gap equal to
    /// the tolerance counts as a mismatch.
    pub fn check(&self, actual: Option<f64>, expected_secs: Option<f64>) -> Verification {
        let failure = match actual {
            None => Some(VerifyFailure::ProbeFailed),
            Some(actual) if actual < self.min_duration_secs => Some(VerifyFailure::TooShort {
                actual,
                minimum: self.min_duration_secs,
            }),
            Some(actual) => expected_secs
                .filter(|expected| *expected > 0.0)
                .filter(|expected| (expected - actual).abs() >= self.tolerance_secs)
                .map(|expected| VerifyFailure::DurationMismatch {
                    expected,
                    actual,
                    tolerance: self.tolerance_secs,
                }),
        };

        Verification {
            passed: failure.is_none(),
            duration_seconds: actual,
            failure,
            probe: None,
        }
    }
}
