//! Per data type extraction progress and stall detection.
//!
//! The tracker is owned by one [`crate::extractor::Extractor`] and shared with its monitor
//! task. Completed data types are remembered until the process exits and are never reported
//! as stalled.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::gauge;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{info, warn};

use crate::concurrency::shutdown::ShutdownRx;
use crate::metrics::{DATA_TYPE_LABEL, DISCOGS_EXTRACTION_STALLED};
use crate::types::DataType;

/// Progress of one data type, as reported by the health endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataTypeProgress {
    pub data_type: DataType,
    pub file: Option<String>,
    /// Records published in the current run, including the ones resumed from a marker.
    pub records: u64,
    pub malformed: u64,
    pub completed: bool,
    pub stalled: bool,
    pub last_activity: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct Entry {
    progress: DataTypeProgress,
    last_activity_at: Instant,
    records_at_last_report: u64,
}

#[derive(Debug, Default)]
struct Inner {
    entries: BTreeMap<DataType, Entry>,
    completed: BTreeSet<DataType>,
}

#[derive(Debug, Clone, Default)]
pub struct ExtractionProgress {
    inner: Arc<Mutex<Inner>>,
}

impl ExtractionProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts tracking `file`. Clears a previous completion of the data type.
    pub fn start_file(&self, data_type: DataType, file: &str, records: u64) {
        let mut inner = self.lock();
        inner.completed.remove(&data_type);
        inner.entries.insert(
            data_type,
            Entry {
                progress: DataTypeProgress {
                    data_type,
                    file: Some(file.to_string()),
                    records,
                    malformed: 0,
                    completed: false,
                    stalled: false,
                    last_activity: Some(Utc::now()),
                },
                last_activity_at: Instant::now(),
                records_at_last_report: records,
            },
        );
    }

    pub fn record_published(&self, data_type: DataType, records: u64) {
        self.touch(data_type, |progress| progress.records = records);
    }

    pub fn record_malformed(&self, data_type: DataType) {
        self.touch(data_type, |progress| progress.malformed += 1);
    }

    /// Adds `data_type` to the completed set.
    pub fn mark_completed(&self, data_type: DataType) {
        let mut inner = self.lock();
        inner.completed.insert(data_type);
        if let Some(entry) = inner.entries.get_mut(&data_type) {
            entry.progress.completed = true;
            entry.progress.stalled = false;
        }
    }

    pub fn is_completed(&self, data_type: DataType) -> bool {
        self.lock().completed.contains(&data_type)
    }

    pub fn completed(&self) -> BTreeSet<DataType> {
        self.lock().completed.clone()
    }

    /// Data types without activity for at least `threshold`, completed ones excluded.
    ///
    /// Updates the stalled flag of every tracked data type.
    pub fn check_stalled(&self, now: Instant, threshold: Duration) -> Vec<DataType> {
        let mut inner = self.lock();
        let Inner { entries, completed } = &mut *inner;

        let mut stalled = Vec::new();
        for (data_type, entry) in entries.iter_mut() {
            let idle = now.saturating_duration_since(entry.last_activity_at);
            entry.progress.stalled = !completed.contains(data_type) && idle >= threshold;
            if entry.progress.stalled {
                stalled.push(*data_type);
            }
        }

        stalled
    }

    pub fn snapshot(&self) -> Vec<DataTypeProgress> {
        self.lock()
            .entries
            .values()
            .map(|entry| entry.progress.clone())
            .collect()
    }

    /// Records published per data type since the previous call.
    fn take_deltas(&self) -> Vec<(DataTypeProgress, u64)> {
        let mut inner = self.lock();
        inner
            .entries
            .values_mut()
            .map(|entry| {
                let delta = entry
                    .progress
                    .records
                    .saturating_sub(entry.records_at_last_report);
                entry.records_at_last_report = entry.progress.records;
                (entry.progress.clone(), delta)
            })
            .collect()
    }

    fn touch(&self, data_type: DataType, update: impl FnOnce(&mut DataTypeProgress)) {
        let mut inner = self.lock();
        if let Some(entry) = inner.entries.get_mut(&data_type) {
            update(&mut entry.progress);
            entry.progress.last_activity = Some(Utc::now());
            entry.progress.stalled = false;
            entry.last_activity_at = Instant::now();
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Spawns the task reporting progress every `interval` and warning about stalled data types.
pub fn spawn_progress_monitor(
    progress: ExtractionProgress,
    interval: Duration,
    stall_threshold: Duration,
    mut shutdown_rx: ShutdownRx,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {
                    info!("progress monitor shutting down");
                    return;
                }

                _ = ticker.tick() => {
                    report(&progress, interval, stall_threshold);
                }
            }
        }
    })
}

fn report(progress: &ExtractionProgress, interval: Duration, stall_threshold: Duration) {
    let stalled = progress.check_stalled(Instant::now(), stall_threshold);

    for (entry, delta) in progress.take_deltas() {
        let rate = delta as f64 / interval.as_secs_f64();
        let is_stalled = stalled.contains(&entry.data_type);
        gauge!(DISCOGS_EXTRACTION_STALLED, DATA_TYPE_LABEL => entry.data_type.as_str())
            .set(if is_stalled { 1.0 } else { 0.0 });

        if entry.completed {
            continue;
        }

        if is_stalled {
            warn!(
                data_type = %entry.data_type,
                file = entry.file.as_deref().unwrap_or_default(),
                records = entry.records,
                last_activity = ?entry.last_activity,
                "extraction stalled, no records for {}s",
                stall_threshold.as_secs()
            );
        } else {
            info!(
                data_type = %entry.data_type,
                records = entry.records,
                malformed = entry.malformed,
                records_per_second = format!("{rate:.1}"),
                "extraction progress"
            );
        }
    }
}
