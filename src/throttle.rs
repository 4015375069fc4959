//! Cooperative CPU/memory backpressure for long ffmpeg jobs.
//!
//! The throttle never fails a run because of load; after `max_waits` pauses
//! it lets the caller proceed.

use std::fmt;
use std::fs;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::cancel::CancelFlag;
use crate::config::Tuning;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceUsage {
    /// One-minute load average relative to the number of CPUs, in percent.
    pub cpu_percent: f64,
    pub memory_percent: f64,
}

impl ResourceUsage {
    pub fn peak(&self) -> f64 {
        self.cpu_percent.max(self.memory_percent)
    }
}

pub trait ResourceMonitor: fmt::Debug + Send + Sync {
    /// `None` when usage cannot be measured on this platform.
    fn sample(&self) -> Option<ResourceUsage>;
}

/// Reads `/proc/loadavg` and `/proc/meminfo`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcMonitor;

impl ResourceMonitor for ProcMonitor {
    fn sample(&self) -> Option<ResourceUsage> {
        let loadavg = fs::read_to_string("/proc/loadavg").ok()?;
        let meminfo = fs::read_to_string("/proc/meminfo").ok()?;
        let cpus = thread::available_parallelism().map_or(1, |n| n.get());
        Some(ResourceUsage {
            cpu_percent: parse_loadavg(&loadavg)? / cpus as f64 * 100.0,
            memory_percent: parse_meminfo(&meminfo)?,
        })
    }
}

fn parse_loadavg(raw: &str) -> Option<f64> {
    raw.split_whitespace().next()?.parse().ok()
}

/// Percentage of memory in use, from `MemTotal` and `MemAvailable`.
fn parse_meminfo(raw: &str) -> Option<f64> {
    let field = |name: &str| -> Option<f64> {
        raw.lines()
            .find_map(|line| line.strip_prefix(name)?.strip_prefix(':'))
            .and_then(|rest| rest.split_whitespace().next())
            .and_then(|value| value.parse().ok())
    };
    let total = field("MemTotal")?;
    let available = field("MemAvailable")?;
    if total <= 0.0 {
        return None;
    }
    Some(((total - available) / total * 100.0).clamp(0.0, 100.0))
}

#[derive(Debug)]
pub struct Throttle {
    monitor: Box<dyn ResourceMonitor>,
    threshold_percent: f64,
    pause: Duration,
    max_waits: u32,
}

impl Throttle {
    pub fn new(monitor: Box<dyn ResourceMonitor>, tuning: &Tuning) -> Self {
        Self {
            monitor,
            threshold_percent: tuning.resource_threshold_percent,
            pause: Duration::from_millis(tuning.throttle_pause_ms),
            max_waits: tuning.throttle_max_waits,
        }
    }

    /// Waits while usage is above the threshold. `on_pressure` runs once, on
    /// the first busy sample, so the caller can save its progress. Returns the
    /// number of pauses taken.
    pub fn wait_if_busy(
        &self,
        cancel: &CancelFlag,
        mut on_pressure: impl FnMut() -> Result<()>,
    ) -> Result<u32> {
        let mut waits = 0;
        loop {
            cancel.check()?;
            let Some(usage) = self.monitor.sample() else {
                return Ok(waits);
            };
            if usage.peak() < self.threshold_percent {
                if waits > 0 {
                    info!(waits, "resource usage back under threshold, resuming");
                }
                return Ok(waits);
            }
            if waits >= self.max_waits {
                warn!(
                    cpu = usage.cpu_percent,
                    memory = usage.memory_percent,
                    waits,
                    "resources still busy, continuing anyway"
                );
                return Ok(waits);
            }
            if waits == 0 {
                on_pressure()?;
            }
            debug!(
                cpu = usage.cpu_percent,
                memory = usage.memory_percent,
                threshold = self.threshold_percent,
                "resource usage high, pausing"
            );
            thread::sleep(self.pause);
            waits += 1;
        }
    }
}
