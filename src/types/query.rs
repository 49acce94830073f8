use std::{collections::HashMap, time::Instant};

use serde::{Deserialize, Serialize};

/// Response of `query-status`.
///
/// Only the most stable fields are modelled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryStatus {
    /// Whether the VM is running.
    #[serde(default)]
    pub running: bool,

    /// Single-step mode.
    #[serde(default)]
    pub singlestep: bool,

    /// Run state string (e.g. "running", "paused").
    pub status: String,
}

/// One entry of `query-block-jobs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockJob {
    /// Job type, e.g. "mirror" or "stream".
    #[serde(rename = "type", default)]
    pub job_type: String,

    /// Job id; the device name for jobs started by name.
    pub device: String,

    /// Maximum progress value.
    #[serde(default)]
    pub len: i64,

    /// Current progress value.
    #[serde(default)]
    pub offset: i64,

    /// Rate limit in bytes per second.
    #[serde(default)]
    pub speed: i64,

    /// Whether the job is waiting to be completed.
    #[serde(default)]
    pub ready: bool,

    /// Job status (QEMU >= 2.12).
    #[serde(default)]
    pub status: String,
}

impl BlockJob {
    /// Progress in percent, 100 when the job has no length.
    #[must_use]
    pub fn percent(&self) -> f64 {
        if self.len <= 0 {
            return 100.0;
        }
        self.offset as f64 / self.len as f64 * 100.0
    }
}

/// Block jobs reduced for progress reporting.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlockJobProgress {
    /// Jobs reported by the last poll.
    pub jobs: usize,
    /// Combined progress of the tracked jobs in percent; 100 when nothing runs.
    pub progress: f64,
    /// Combined throughput in megabits per second, measured between polls.
    pub mbps: f64,
}

impl Default for BlockJobProgress {
    fn default() -> Self {
        Self {
            jobs: 0,
            progress: 100.0,
            mbps: 0.0,
        }
    }
}

#[derive(Debug)]
struct TrackedJob {
    offset: i64,
    len: i64,
    ready: bool,
    polled_at: Instant,
    mbps: f64,
}

/// Per-device job state carried across `query-block-jobs` polls.
///
/// A job that was ready on the previous poll is dropped and counted afresh
/// if it shows up again; jobs missing from a poll are forgotten.
#[derive(Debug, Default)]
pub(crate) struct BlockJobTracker {
    jobs: HashMap<String, TrackedJob>,
    last: BlockJobProgress,
}

impl BlockJobTracker {
    pub(crate) fn update(&mut self, jobs: &[BlockJob], now: Instant) -> BlockJobProgress {
        let mut tracked = HashMap::with_capacity(jobs.len());

        for job in jobs {
            let mbps = match self.jobs.get(&job.device) {
                Some(prev) if prev.ready => continue,
                Some(prev) => {
                    let secs = now.saturating_duration_since(prev.polled_at).as_secs_f64();
                    if secs > 0.0 {
                        (job.offset - prev.offset).max(0) as f64 * 8.0 / 1_000_000.0 / secs
                    } else {
                        prev.mbps
                    }
                }
                None => 0.0,
            };

            tracked.insert(
                job.device.clone(),
                TrackedJob {
                    offset: job.offset,
                    len: job.len,
                    ready: job.ready || job.status == "ready",
                    polled_at: now,
                    mbps,
                },
            );
        }
        self.jobs = tracked;

        let progress = if self.jobs.is_empty() && jobs.is_empty() {
            100.0
        } else {
            let offset: i64 = self.jobs.values().map(|j| j.offset).sum();
            let len: i64 = self.jobs.values().map(|j| j.len).sum();
            offset as f64 / len.max(1) as f64 * 100.0
        };

        self.last = BlockJobProgress {
            jobs: jobs.len(),
            progress,
            mbps: self.jobs.values().map(|j| j.mbps).sum(),
        };
        self.last
    }

    pub(crate) fn last(&self) -> BlockJobProgress {
        self.last
    }
}

/// RAM or disk section of `query-migrate`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TransferStats {
    /// Total bytes to transfer.
    #[serde(default)]
    pub total: i64,
    /// Bytes still to transfer.
    #[serde(default)]
    pub remaining: i64,
    /// Current throughput in megabits per second.
    #[serde(default)]
    pub mbps: f64,
}

/// Response of `query-migrate`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MigrateInfo {
    /// Migration status ("setup", "active", "completed", ...).
    #[serde(default)]
    pub status: String,
    /// RAM transfer counters.
    #[serde(default)]
    pub ram: TransferStats,
    /// Disk transfer counters (block migration only).
    #[serde(default)]
    pub disk: TransferStats,
}

/// Migration status reduced for progress reporting.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrateProgress {
    /// Status string; an active migration is refined to `migrate_disk_copy`
    /// or `migrate_ram_copy`.
    pub status: String,
    /// Progress in percent, only meaningful while active.
    pub progress: f64,
    /// Combined throughput.
    pub mbps: f64,
}

impl From<&MigrateInfo> for MigrateProgress {
    fn from(info: &MigrateInfo) -> Self {
        let mut status = info.status.clone();
        let mbps = info.disk.mbps + info.ram.mbps;
        let mut progress = 0.0;

        if status == "active" {
            if info.disk.remaining > 0 {
                status = "migrate_disk_copy".to_string();
            } else if info.ram.remaining > 0 {
                status = "migrate_ram_copy".to_string();
            }

            // The first half of the bar belongs to the preparation phase.
            let total = info.disk.total + info.ram.total;
            let remaining = info.disk.remaining + info.ram.remaining;
            progress = if total > 0 {
                50.0 + (1.0 - remaining as f64 / total as f64) * 100.0 * 0.5
            } else {
                50.0
            };
        } else if status == "completed" {
            progress = 100.0;
        }

        Self {
            status,
            progress,
            mbps,
        }
    }
}
