//! # Resource Monitor
//!
//! Tracks the lifecycle of every admitted unit of work and samples process
//! memory and CPU at a fixed cadence while it runs. All entries live in one
//! map behind a single `RwLock`; sampling loops and `stop_tracking` take the
//! write side, snapshots take the read side.
//!
//! Sampling loops are spawned on a [`TaskTracker`] so the orchestrator can
//! wait for all of them with [`ResourceMonitor::drain`] before it writes a
//! snapshot.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, System};
use tokio::sync::RwLock;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace, warn};

use super::sink::{SinkError, StatsSink};
use super::tasks::{TaskId, TaskKind};

/// One reading of process resource usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    pub memory_kb: u64,
    pub cpu_percent: f32,
}

/// Source of resource readings. Swappable so tests get deterministic values.
pub trait ResourceSampler: Send + Sync {
    fn sample(&self) -> ResourceSample;
}

/// Reads the current process via `sysinfo`.
pub struct ProcessSampler {
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl ProcessSampler {
    #[must_use]
    pub fn new() -> Self {
        let pid = sysinfo::get_current_pid()
            .map_err(|e| warn!("Cannot resolve current pid, falling back to system memory: {}", e))
            .ok();
        Self {
            system: Mutex::new(System::new()),
            pid,
        }
    }
}

impl Default for ProcessSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceSampler for ProcessSampler {
    fn sample(&self) -> ResourceSample {
        let Ok(mut system) = self.system.lock() else {
            return ResourceSample::default();
        };

        match self.pid {
            Some(pid) => {
                system.refresh_process(pid);
                system
                    .process(pid)
                    .map(|process| ResourceSample {
                        memory_kb: process.memory() / 1024,
                        cpu_percent: process.cpu_usage(),
                    })
                    .unwrap_or_default()
            }
            None => {
                system.refresh_memory();
                ResourceSample {
                    memory_kb: system.used_memory() / 1024,
                    cpu_percent: 0.0,
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimedSample<T> {
    pub at: DateTime<Utc>,
    pub value: T,
}

/// Lifecycle and resource history of one unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStats {
    pub id: TaskId,
    pub label: String,
    pub kind: TaskKind,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub memory_samples_kb: Vec<TimedSample<u64>>,
    pub cpu_samples_percent: Vec<TimedSample<f32>>,
    pub peak_memory_kb: u64,
    pub avg_cpu_percent: Option<f32>,
    pub duration_ms: Option<i64>,
    /// Items this unit produced (candidates for discovery, 0/1 for enrichment).
    pub items_found: usize,
}

impl TaskStats {
    fn new(label: String, kind: TaskKind) -> Self {
        Self {
            id: TaskId::new(),
            label,
            kind,
            started_at: Utc::now(),
            ended_at: None,
            memory_samples_kb: Vec::new(),
            cpu_samples_percent: Vec::new(),
            peak_memory_kb: 0,
            avg_cpu_percent: None,
            duration_ms: None,
            items_found: 0,
        }
    }

    #[must_use]
    pub fn is_finalized(&self) -> bool {
        self.ended_at.is_some()
    }

    fn record(&mut self, sample: ResourceSample) {
        let at = Utc::now();
        self.memory_samples_kb.push(TimedSample { at, value: sample.memory_kb });
        self.cpu_samples_percent.push(TimedSample { at, value: sample.cpu_percent });
        self.peak_memory_kb = self.peak_memory_kb.max(sample.memory_kb);
    }

    /// Stamps the end time once; later calls leave the entry untouched.
    #[allow(clippy::cast_precision_loss)]
    fn finalize(&mut self) -> bool {
        if self.is_finalized() {
            return false;
        }
        let ended_at = Utc::now();
        self.duration_ms = Some((ended_at - self.started_at).num_milliseconds());
        self.ended_at = Some(ended_at);
        if !self.cpu_samples_percent.is_empty() {
            let total: f32 = self.cpu_samples_percent.iter().map(|s| s.value).sum();
            self.avg_cpu_percent = Some(total / self.cpu_samples_percent.len() as f32);
        }
        true
    }
}

/// Returned by [`ResourceMonitor::start_tracking`].
#[derive(Debug, Clone)]
pub struct TaskHandle {
    id: TaskId,
    stop: CancellationToken,
}

impl TaskHandle {
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.id
    }
}

/// The whole stats map at one instant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub taken_at: DateTime<Utc>,
    pub tasks: Vec<TaskStats>,
}

impl StatsSnapshot {
    #[must_use]
    pub fn finalized(&self) -> usize {
        self.tasks.iter().filter(|t| t.is_finalized()).count()
    }
}

#[derive(Clone)]
pub struct ResourceMonitor {
    stats: Arc<RwLock<HashMap<TaskId, TaskStats>>>,
    sampler: Arc<dyn ResourceSampler>,
    sample_interval: Duration,
    tracker: TaskTracker,
}

impl ResourceMonitor {
    #[must_use]
    pub fn new(sample_interval: Duration, sampler: Arc<dyn ResourceSampler>) -> Self {
        Self {
            stats: Arc::new(RwLock::new(HashMap::new())),
            sampler,
            sample_interval: sample_interval.max(Duration::from_millis(1)),
            tracker: TaskTracker::new(),
        }
    }

    #[must_use]
    pub fn with_process_sampler(sample_interval: Duration) -> Self {
        Self::new(sample_interval, Arc::new(ProcessSampler::new()))
    }

    /// Registers a new entry and starts its sampling loop.
    ///
    /// The entry is visible to [`snapshot`](Self::snapshot) before this returns.
    pub async fn start_tracking(&self, label: impl Into<String>, kind: TaskKind) -> TaskHandle {
        let entry = TaskStats::new(label.into(), kind);
        let id = entry.id;
        trace!(task_id = %id, label = %entry.label, %kind, "tracking started");
        self.stats.write().await.insert(id, entry);

        let stop = CancellationToken::new();
        let loop_stop = stop.clone();
        let stats = Arc::clone(&self.stats);
        let sampler = Arc::clone(&self.sampler);
        let period = self.sample_interval;

        self.tracker.spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;
                    () = loop_stop.cancelled() => break,
                    _ = ticker.tick() => {
                        let sample = sampler.sample();
                        let mut map = stats.write().await;
                        match map.get_mut(&id) {
                            Some(entry) if !entry.is_finalized() => entry.record(sample),
                            _ => break,
                        }
                    }
                }
            }
        });

        TaskHandle { id, stop }
    }

    /// Stops sampling and finalizes the entry. Unknown or already stopped
    /// handles are a no-op.
    pub async fn stop_tracking(&self, handle: &TaskHandle) {
        handle.stop.cancel();
        let mut map = self.stats.write().await;
        match map.get_mut(&handle.id) {
            Some(entry) => {
                if entry.finalize() {
                    trace!(task_id = %handle.id, samples = entry.cpu_samples_percent.len(), "tracking stopped");
                }
            }
            None => debug!(task_id = %handle.id, "stop_tracking on unknown handle ignored"),
        }
    }

    pub async fn record_items(&self, handle: &TaskHandle, items: usize) {
        if let Some(entry) = self.stats.write().await.get_mut(&handle.id) {
            if !entry.is_finalized() {
                entry.items_found = items;
            }
        }
    }

    /// Finalizes every entry still open, e.g. after a run was cut short.
    pub async fn stop_all(&self) -> usize {
        let mut map = self.stats.write().await;
        map.values_mut().map(TaskStats::finalize).filter(|closed| *closed).count()
    }

    /// Waits for every sampling loop to exit. Call after all handles stopped.
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Copy of the whole map, ordered by start time.
    pub async fn snapshot(&self) -> StatsSnapshot {
        let map = self.stats.read().await;
        let mut tasks: Vec<TaskStats> = map.values().cloned().collect();
        drop(map);
        tasks.sort_by_key(|t| t.started_at);
        StatsSnapshot {
            taken_at: Utc::now(),
            tasks,
        }
    }

    /// Serializes the current map into `sink`.
    pub async fn write_snapshot(&self, sink: &dyn StatsSink) -> Result<StatsSnapshot, SinkError> {
        let snapshot = self.snapshot().await;
        sink.write(&snapshot).await?;
        Ok(snapshot)
    }

    pub async fn tracked(&self) -> usize {
        self.stats.read().await.len()
    }

    /// Discards every entry; used once a run's snapshot has been written.
    pub async fn reset(&self) {
        self.stats.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::FixedSampler;

    fn monitor() -> ResourceMonitor {
        ResourceMonitor::new(Duration::from_secs(1), Arc::new(FixedSampler::new(2048, 12.5)))
    }

    #[tokio::test(start_paused = true)]
    async fn samples_once_per_interval_until_stopped() {
        let monitor = monitor();
        let handle = monitor.start_tracking("tehran/buy-villa", TaskKind::Discovery).await;

        tokio::time::sleep(Duration::from_millis(3500)).await;
        monitor.stop_tracking(&handle).await;
        monitor.drain().await;

        let snapshot = monitor.snapshot().await;
        let stats = &snapshot.tasks[0];
        assert_eq!(stats.memory_samples_kb.len(), 3);
        assert_eq!(stats.peak_memory_kb, 2048);
        assert_eq!(stats.avg_cpu_percent, Some(12.5));
        assert!(stats.is_finalized());
    }

    #[tokio::test(start_paused = true)]
    async fn entry_visible_before_finalized() {
        let monitor = monitor();
        let handle = monitor.start_tracking("u1", TaskKind::Enrichment).await;

        let snapshot = monitor.snapshot().await;
        assert_eq!(snapshot.tasks.len(), 1);
        assert!(!snapshot.tasks[0].is_finalized());

        monitor.stop_tracking(&handle).await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_tracking_is_idempotent() {
        let monitor = monitor();
        let handle = monitor.start_tracking("u1", TaskKind::Enrichment).await;
        monitor.stop_tracking(&handle).await;
        let first = monitor.snapshot().await.tasks[0].clone();

        tokio::time::sleep(Duration::from_secs(5)).await;
        monitor.stop_tracking(&handle).await;
        let second = monitor.snapshot().await.tasks[0].clone();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn unknown_handle_is_noop() {
        let monitor = monitor();
        let other = monitor.clone();
        let handle = other.start_tracking("u1", TaskKind::Enrichment).await;
        monitor.reset().await;

        monitor.stop_tracking(&handle).await;
        assert_eq!(monitor.tracked().await, 0);
        monitor.drain().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_all_finalizes_open_entries() {
        let monitor = monitor();
        let _a = monitor.start_tracking("a", TaskKind::Discovery).await;
        let _b = monitor.start_tracking("b", TaskKind::Discovery).await;

        assert_eq!(monitor.stop_all().await, 2);
        monitor.drain().await;
        assert_eq!(monitor.snapshot().await.finalized(), 2);
    }
}
