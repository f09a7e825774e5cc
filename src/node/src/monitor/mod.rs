// Copyright Warden Project contributors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! In-process peak monitoring.
//!
//! A single sampler reads host metrics every five seconds and drives one
//! finite state machine per monitored metric:
//!
//! ```text
//! IDLE → RISING → PEAK → COOLING → (IDLE | PEAK)
//! ```
//!
//! Opening a peak emits a start event; further samples inside the open peak
//! only update its running maximum (deduplication). Closing requires the
//! value to stay below the hysteresis line for `cool_down_cycles` samples
//! and the peak to have lasted at least `min_duration`, at which point a
//! resolve event with the same dedupe key is emitted. Sequence numbers come
//! from the fsync'd [`seq::SeqFile`], so they survive restarts.

pub mod seq;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use sysinfo::{CpuExt, DiskExt, NetworkExt, NetworksExt, System, SystemExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use warden_service::types::{
    peak_dedupe_key, HostMetrics, NetworkInterfaceMetrics, NodeId, PeakCategory, PeakEvent,
    PeakLevel,
};

use seq::SeqFile;

const EVENT_QUEUE_CAPACITY: usize = 256;
const RETAINED_EVENTS: usize = 1024;

/// Monitoring thresholds and FSM timing.
#[derive(Debug, Clone, Copy)]
pub struct ThresholdConfig {
    pub cpu_warning: f64,
    pub cpu_critical: f64,
    pub memory_warning: f64,
    pub memory_critical: f64,
    /// Percent below the threshold a value must fall to count as cooling.
    pub hysteresis_percent: f64,
    /// Minimum open time before a peak may resolve.
    pub min_duration: Duration,
    /// Consecutive below-hysteresis samples required to close a peak.
    pub cool_down_cycles: u32,
    pub sample_interval: Duration,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        ThresholdConfig {
            cpu_warning: 75.0,
            cpu_critical: 90.0,
            memory_warning: 80.0,
            memory_critical: 95.0,
            hysteresis_percent: 5.0,
            min_duration: Duration::from_secs(30),
            cool_down_cycles: 2,
            sample_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PeakState {
    Idle,
    Rising,
    Peak,
    Cooling,
}

#[derive(Debug)]
struct PeakTracker {
    state: PeakState,
    started_at_ms: i64,
    peak_value: f64,
    threshold: f64,
    level: PeakLevel,
    context: serde_json::Value,
    cool_down: u32,
}

impl PeakTracker {
    fn idle() -> Self {
        PeakTracker {
            state: PeakState::Idle,
            started_at_ms: 0,
            peak_value: 0.0,
            threshold: 0.0,
            level: PeakLevel::Warning,
            context: serde_json::Value::Null,
            cool_down: 0,
        }
    }
}

#[derive(Debug)]
struct EventDraft {
    category: PeakCategory,
    metric: String,
    level: PeakLevel,
    value: f64,
    threshold: f64,
    context: serde_json::Value,
    started_at_ms: i64,
    resolved_at_ms: Option<i64>,
}

/// One host metrics sample, as fed into the FSMs and attached to event
/// context snapshots.
#[derive(Debug, Clone, Serialize)]
pub struct HostSample {
    pub cpu_usage: f64,
    pub load_1min: f64,
    pub memory_percent: f64,
    pub memory_used: u64,
    pub memory_total: u64,
    pub disk_percent: f64,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
    pub timestamp_ms: i64,
}

/// Provides backend context attached to emitted events.
pub type ContextProvider = Arc<dyn Fn() -> serde_json::Value + Send + Sync>;

/// The node's peak monitoring agent.
pub struct PeakMonitor {
    node_id: NodeId,
    config: ThresholdConfig,
    seq: SeqFile,
    trackers: Mutex<HashMap<String, PeakTracker>>,
    queue_tx: mpsc::Sender<PeakEvent>,
    queue_rx: Mutex<Option<mpsc::Receiver<PeakEvent>>>,
    retained: Mutex<VecDeque<PeakEvent>>,
    dropped: AtomicU64,
    context_provider: Option<ContextProvider>,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PeakMonitor {
    pub fn new(
        node_id: NodeId,
        config: ThresholdConfig,
        seq: SeqFile,
        context_provider: Option<ContextProvider>,
    ) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(PeakMonitor {
            node_id,
            config,
            seq,
            trackers: Mutex::new(HashMap::new()),
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            retained: Mutex::new(VecDeque::with_capacity(RETAINED_EVENTS)),
            dropped: AtomicU64::new(0),
            context_provider,
            shutdown_tx,
            task: Mutex::new(None),
        })
    }

    /// Launches the sampling loop. Idempotent.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock().expect("monitor task lock poisoned");
        if task.is_some() {
            warn!(node_id = self.node_id, "peak monitor already running");
            return;
        }
        let monitor = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        *task = Some(tokio::spawn(async move {
            info!(node_id = monitor.node_id, "peak monitoring started");
            let mut interval = tokio::time::interval(monitor.config.sample_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown.changed() => return,
                }
                match tokio::task::spawn_blocking(sample_host).await {
                    Ok(sample) => monitor.process_sample(&sample).await,
                    Err(err) => error!(%err, "host sampling task failed"),
                }
            }
        }));
    }

    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let task = self.task.lock().expect("monitor task lock poisoned").take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
        info!(node_id = self.node_id, "peak monitoring stopped");
    }

    /// Runs every monitored metric through its FSM and emits whatever
    /// events result.
    pub async fn process_sample(&self, sample: &HostSample) {
        let mut context = match &self.context_provider {
            Some(provider) => provider(),
            None => serde_json::json!({}),
        };
        if let Some(object) = context.as_object_mut() {
            object.insert(
                "metrics_snapshot".to_owned(),
                serde_json::to_value(sample).unwrap_or(serde_json::Value::Null),
            );
        }

        let checks = [
            (
                PeakCategory::Cpu,
                "cpu_usage",
                sample.cpu_usage,
                self.config.cpu_warning,
                self.config.cpu_critical,
            ),
            (
                PeakCategory::Memory,
                "memory_percent",
                sample.memory_percent,
                self.config.memory_warning,
                self.config.memory_critical,
            ),
        ];
        for (category, metric, value, warning, critical) in checks {
            let draft =
                self.observe_at(sample.timestamp_ms, category, metric, value, warning, critical, &context);
            if let Some(draft) = draft {
                self.emit(draft).await;
            }
        }
    }

    /// The FSM step for one metric at one instant. Pure except for tracker
    /// state; event sequencing happens in [`Self::emit`].
    fn observe_at(
        &self,
        now_ms: i64,
        category: PeakCategory,
        metric: &str,
        value: f64,
        warning: f64,
        critical: f64,
        context: &serde_json::Value,
    ) -> Option<EventDraft> {
        let violation = if value >= critical {
            Some((PeakLevel::Critical, critical))
        } else if value >= warning {
            Some((PeakLevel::Warning, warning))
        } else {
            None
        };

        let key = format!("{category}:{metric}");
        let mut trackers = self.trackers.lock().expect("trackers lock poisoned");
        let tracker = trackers.entry(key).or_insert_with(PeakTracker::idle);

        match violation {
            Some((level, threshold)) => match tracker.state {
                PeakState::Idle => {
                    *tracker = PeakTracker {
                        state: PeakState::Rising,
                        started_at_ms: now_ms,
                        peak_value: value,
                        threshold,
                        level,
                        context: context.clone(),
                        cool_down: 0,
                    };
                    Some(EventDraft {
                        category,
                        metric: metric.to_owned(),
                        level,
                        value,
                        threshold,
                        context: context.clone(),
                        started_at_ms: now_ms,
                        resolved_at_ms: None,
                    })
                }
                PeakState::Rising | PeakState::Peak | PeakState::Cooling => {
                    tracker.state = PeakState::Peak;
                    tracker.cool_down = 0;
                    if value > tracker.peak_value {
                        tracker.peak_value = value;
                        tracker.threshold = tracker.threshold.max(threshold);
                    }
                    // Severity only ever escalates while a peak is open.
                    if level > tracker.level {
                        tracker.level = level;
                    }
                    None
                }
            },
            None => {
                if tracker.state == PeakState::Idle {
                    return None;
                }
                let hysteresis_line =
                    tracker.threshold * (1.0 - self.config.hysteresis_percent / 100.0);
                if value < hysteresis_line {
                    match tracker.state {
                        PeakState::Rising | PeakState::Peak => {
                            tracker.state = PeakState::Cooling;
                            tracker.cool_down = 1;
                            None
                        }
                        PeakState::Cooling => {
                            tracker.cool_down += 1;
                            let open_for_ms = now_ms - tracker.started_at_ms;
                            if tracker.cool_down >= self.config.cool_down_cycles
                                && open_for_ms >= self.config.min_duration.as_millis() as i64
                            {
                                let draft = EventDraft {
                                    category,
                                    metric: metric.to_owned(),
                                    level: tracker.level,
                                    value: tracker.peak_value,
                                    threshold: tracker.threshold,
                                    context: tracker.context.clone(),
                                    started_at_ms: tracker.started_at_ms,
                                    resolved_at_ms: Some(now_ms),
                                };
                                *tracker = PeakTracker::idle();
                                Some(draft)
                            } else {
                                None
                            }
                        }
                        PeakState::Idle => None,
                    }
                } else {
                    // Bounced back above the hysteresis line.
                    if tracker.state == PeakState::Cooling {
                        tracker.state = PeakState::Peak;
                        tracker.cool_down = 0;
                    }
                    None
                }
            }
        }
    }

    async fn emit(&self, draft: EventDraft) {
        let seq = match self.seq.next().await {
            Ok(seq) => seq,
            Err(err) => {
                error!(node_id = self.node_id, %err, "failed to persist peak sequence");
                return;
            }
        };
        let event = PeakEvent {
            node_id: self.node_id,
            dedupe_key: peak_dedupe_key(self.node_id, draft.category, &draft.metric),
            category: draft.category,
            metric: draft.metric,
            level: draft.level,
            value: draft.value,
            threshold: draft.threshold,
            context_json: draft.context.to_string(),
            started_at_ms: draft.started_at_ms,
            resolved_at_ms: draft.resolved_at_ms,
            seq,
        };
        info!(
            node_id = self.node_id,
            category = %event.category,
            metric = %event.metric,
            level = %event.level,
            value = event.value,
            seq = event.seq,
            kind = if event.is_open() { "start" } else { "resolve" },
            "peak event"
        );

        {
            let mut retained = self.retained.lock().expect("retained lock poisoned");
            if retained.len() == RETAINED_EVENTS {
                retained.pop_front();
            }
            retained.push_back(event.clone());
        }

        // Bounded queue: losing the newest warning beats blocking the
        // sampler.
        if self.queue_tx.try_send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            debug!(node_id = self.node_id, "peak event queue full, dropping event");
        }
    }

    /// Takes the live event receiver. Only one stream may be active; the
    /// receiver must be handed back via [`Self::return_receiver`] when the
    /// stream ends.
    pub fn take_receiver(&self) -> Option<mpsc::Receiver<PeakEvent>> {
        self.queue_rx
            .lock()
            .expect("queue receiver lock poisoned")
            .take()
    }

    pub fn return_receiver(&self, rx: mpsc::Receiver<PeakEvent>) {
        *self
            .queue_rx
            .lock()
            .expect("queue receiver lock poisoned") = Some(rx);
    }

    /// Retained events newer than `since_ms`, optionally filtered by
    /// category, oldest first.
    pub fn retained_since(
        &self,
        since_ms: i64,
        category: Option<PeakCategory>,
    ) -> Vec<PeakEvent> {
        self.retained
            .lock()
            .expect("retained lock poisoned")
            .iter()
            .filter(|e| e.started_at_ms >= since_ms)
            .filter(|e| category.map_or(true, |c| e.category == c))
            .cloned()
            .collect()
    }

    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Collects one [`HostSample`]. Blocking; run on the blocking pool.
pub fn sample_host() -> HostSample {
    let mut sys = System::new_all();
    sys.refresh_cpu();
    std::thread::sleep(Duration::from_millis(250));
    sys.refresh_cpu();
    sys.refresh_memory();
    sys.refresh_disks();
    sys.refresh_networks();

    let memory_total = sys.total_memory();
    let memory_used = sys.used_memory();
    let memory_percent = if memory_total == 0 {
        0.0
    } else {
        memory_used as f64 / memory_total as f64 * 100.0
    };

    let (disk_total, disk_available) = sys
        .disks()
        .iter()
        .find(|d| d.mount_point() == std::path::Path::new("/"))
        .map(|d| (d.total_space(), d.available_space()))
        .unwrap_or((0, 0));
    let disk_percent = if disk_total == 0 {
        0.0
    } else {
        (disk_total - disk_available) as f64 / disk_total as f64 * 100.0
    };

    let mut rx_bytes = 0;
    let mut tx_bytes = 0;
    for (_, data) in sys.networks() {
        rx_bytes += data.total_received();
        tx_bytes += data.total_transmitted();
    }

    HostSample {
        cpu_usage: f64::from(sys.global_cpu_info().cpu_usage()),
        load_1min: sys.load_average().one,
        memory_percent,
        memory_used,
        memory_total,
        disk_percent,
        network_rx_bytes: rx_bytes,
        network_tx_bytes: tx_bytes,
        timestamp_ms: chrono::Utc::now().timestamp_millis(),
    }
}

/// Collects the full host metrics snapshot served by the
/// `GetHostSystemMetrics` RPC. Blocking; run on the blocking pool.
pub fn collect_host_metrics() -> HostMetrics {
    const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

    let mut sys = System::new_all();
    sys.refresh_cpu();
    std::thread::sleep(Duration::from_millis(250));
    sys.refresh_cpu();
    sys.refresh_memory();
    sys.refresh_disks();
    sys.refresh_networks();

    let memory_total = sys.total_memory();
    let memory_percent = if memory_total == 0 {
        0.0
    } else {
        sys.used_memory() as f64 / memory_total as f64 * 100.0
    };
    let (disk_total, disk_available) = sys
        .disks()
        .iter()
        .find(|d| d.mount_point() == std::path::Path::new("/"))
        .map(|d| (d.total_space(), d.available_space()))
        .unwrap_or((0, 0));
    let disk_percent = if disk_total == 0 {
        0.0
    } else {
        (disk_total - disk_available) as f64 / disk_total as f64 * 100.0
    };

    let network_interfaces = sys
        .networks()
        .into_iter()
        .map(|(name, data)| NetworkInterfaceMetrics {
            name: name.clone(),
            bytes_sent: data.total_transmitted(),
            bytes_received: data.total_received(),
            packets_sent: data.total_packets_transmitted(),
            packets_received: data.total_packets_received(),
        })
        .collect();

    let load = sys.load_average();
    HostMetrics {
        cpu_usage: f64::from(sys.global_cpu_info().cpu_usage()),
        memory_usage: memory_percent,
        memory_total_gb: memory_total as f64 / GIB,
        disk_usage: disk_percent,
        disk_total_gb: disk_total as f64 / GIB,
        network_interfaces,
        uptime_seconds: sys.uptime() as i64,
        load_average: [load.one, load.five, load.fifteen],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor_with(config: ThresholdConfig) -> (Arc<PeakMonitor>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let seq = SeqFile::load(dir.path().join("peak_seq")).unwrap();
        (PeakMonitor::new(1, config, seq, None), dir)
    }

    fn quick_config() -> ThresholdConfig {
        ThresholdConfig {
            min_duration: Duration::from_secs(30),
            ..Default::default()
        }
    }

    fn ctx() -> serde_json::Value {
        serde_json::json!({})
    }

    #[tokio::test]
    async fn peak_lifecycle_emits_exactly_start_and_resolve() {
        let (monitor, _dir) = monitor_with(quick_config());
        let t0: i64 = 1_700_000_000_000;
        let second = 1000;

        // 95% CPU for 60 seconds: one start event, nothing else.
        let start = monitor
            .observe_at(t0, PeakCategory::Cpu, "cpu_usage", 95.0, 75.0, 90.0, &ctx())
            .expect("start event");
        assert_eq!(start.level, PeakLevel::Critical);
        assert_eq!(start.threshold, 90.0);
        assert!(start.resolved_at_ms.is_none());

        for i in 1..=12 {
            let draft = monitor.observe_at(
                t0 + i * 5 * second,
                PeakCategory::Cpu,
                "cpu_usage",
                95.0,
                75.0,
                90.0,
                &ctx(),
            );
            assert!(draft.is_none(), "open peak must not re-emit");
        }

        // Back to 20%: two cooling cycles later the resolve event appears.
        let t_cool = t0 + 65 * second;
        assert!(monitor
            .observe_at(t_cool, PeakCategory::Cpu, "cpu_usage", 20.0, 75.0, 90.0, &ctx())
            .is_none());
        let resolve = monitor
            .observe_at(
                t_cool + 5 * second,
                PeakCategory::Cpu,
                "cpu_usage",
                20.0,
                75.0,
                90.0,
                &ctx(),
            )
            .expect("resolve event");
        assert_eq!(resolve.resolved_at_ms, Some(t_cool + 5 * second));
        assert_eq!(resolve.started_at_ms, t0);
        assert_eq!(resolve.value, 95.0);
        assert_eq!(resolve.level, PeakLevel::Critical);
    }

    #[tokio::test]
    async fn short_peaks_do_not_resolve_before_min_duration() {
        let (monitor, _dir) = monitor_with(quick_config());
        let t0: i64 = 1_700_000_000_000;
        let second = 1000;

        monitor
            .observe_at(t0, PeakCategory::Cpu, "cpu_usage", 95.0, 75.0, 90.0, &ctx())
            .expect("start event");
        // Drop below hysteresis after 10 seconds; two cool-down cycles pass
        // but the peak is younger than min_duration, so it stays open.
        assert!(monitor
            .observe_at(t0 + 10 * second, PeakCategory::Cpu, "cpu_usage", 20.0, 75.0, 90.0, &ctx())
            .is_none());
        assert!(monitor
            .observe_at(t0 + 15 * second, PeakCategory::Cpu, "cpu_usage", 20.0, 75.0, 90.0, &ctx())
            .is_none());
        // Once old enough, the next cooling sample closes it.
        let resolve = monitor
            .observe_at(t0 + 31 * second, PeakCategory::Cpu, "cpu_usage", 20.0, 75.0, 90.0, &ctx())
            .expect("resolve event");
        assert_eq!(resolve.resolved_at_ms, Some(t0 + 31 * second));
    }

    #[tokio::test]
    async fn level_upgrades_but_never_downgrades() {
        let (monitor, _dir) = monitor_with(quick_config());
        let t0: i64 = 1_700_000_000_000;

        let start = monitor
            .observe_at(t0, PeakCategory::Cpu, "cpu_usage", 80.0, 75.0, 90.0, &ctx())
            .expect("start event");
        assert_eq!(start.level, PeakLevel::Warning);

        // Escalate to critical, then fall back to warning territory.
        assert!(monitor
            .observe_at(t0 + 5000, PeakCategory::Cpu, "cpu_usage", 95.0, 75.0, 90.0, &ctx())
            .is_none());
        assert!(monitor
            .observe_at(t0 + 10_000, PeakCategory::Cpu, "cpu_usage", 80.0, 75.0, 90.0, &ctx())
            .is_none());

        // Cool down fully; the resolve reports the escalated level and max.
        assert!(monitor
            .observe_at(t0 + 40_000, PeakCategory::Cpu, "cpu_usage", 10.0, 75.0, 90.0, &ctx())
            .is_none());
        let resolve = monitor
            .observe_at(t0 + 45_000, PeakCategory::Cpu, "cpu_usage", 10.0, 75.0, 90.0, &ctx())
            .expect("resolve event");
        assert_eq!(resolve.level, PeakLevel::Critical);
        assert_eq!(resolve.value, 95.0);
    }

    #[tokio::test]
    async fn cooling_bounce_returns_to_peak() {
        let (monitor, _dir) = monitor_with(quick_config());
        let t0: i64 = 1_700_000_000_000;

        monitor
            .observe_at(t0, PeakCategory::Memory, "memory_percent", 96.0, 80.0, 95.0, &ctx())
            .expect("start event");
        // Dip below hysteresis once, then bounce back above the line.
        assert!(monitor
            .observe_at(t0 + 35_000, PeakCategory::Memory, "memory_percent", 20.0, 80.0, 95.0, &ctx())
            .is_none());
        assert!(monitor
            .observe_at(t0 + 40_000, PeakCategory::Memory, "memory_percent", 93.0, 80.0, 95.0, &ctx())
            .is_none());
        // The bounce reset cooling: one below-line sample is not enough.
        assert!(monitor
            .observe_at(t0 + 45_000, PeakCategory::Memory, "memory_percent", 20.0, 80.0, 95.0, &ctx())
            .is_none());
        let resolve = monitor
            .observe_at(t0 + 50_000, PeakCategory::Memory, "memory_percent", 20.0, 80.0, 95.0, &ctx())
            .expect("resolve event");
        assert!(resolve.resolved_at_ms.is_some());
    }

    #[tokio::test]
    async fn emitted_events_are_sequenced_and_deduped_across_restart() {
        let dir = tempfile::tempdir().unwrap();
        let seq_path = dir.path().join("peak_seq");
        let t0: i64 = 1_700_000_000_000;

        let monitor = PeakMonitor::new(
            7,
            quick_config(),
            SeqFile::load(&seq_path).unwrap(),
            None,
        );
        let start = monitor
            .observe_at(t0, PeakCategory::Cpu, "cpu_usage", 95.0, 75.0, 90.0, &ctx())
            .unwrap();
        monitor.emit(start).await;
        let resolve = monitor
            .observe_at(t0 + 60_000, PeakCategory::Cpu, "cpu_usage", 10.0, 75.0, 90.0, &ctx());
        assert!(resolve.is_none());
        let resolve = monitor
            .observe_at(t0 + 65_000, PeakCategory::Cpu, "cpu_usage", 10.0, 75.0, 90.0, &ctx())
            .unwrap();
        monitor.emit(resolve).await;

        let events = monitor.retained_since(0, None);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].dedupe_key, events[1].dedupe_key);
        assert!(events[0].seq < events[1].seq);
        assert!(events[0].is_open());
        assert!(!events[1].is_open());
        let last_seq = events[1].seq;

        // Simulated restart: a fresh monitor over the same sequence file
        // keeps the ordering guarantee.
        let reborn = PeakMonitor::new(
            7,
            quick_config(),
            SeqFile::load(&seq_path).unwrap(),
            None,
        );
        let start = reborn
            .observe_at(t0 + 120_000, PeakCategory::Cpu, "cpu_usage", 95.0, 75.0, 90.0, &ctx())
            .unwrap();
        reborn.emit(start).await;
        let events = reborn.retained_since(0, None);
        assert!(events[0].seq > last_seq);
    }

    #[tokio::test]
    async fn queue_overflow_drops_newest_and_counts() {
        let (monitor, _dir) = monitor_with(quick_config());
        let t0: i64 = 1_700_000_000_000;

        // Fill the queue well past capacity without a consumer. Alternate
        // open/close cycles on distinct metrics to generate many events.
        for i in 0..(EVENT_QUEUE_CAPACITY as i64 + 10) {
            let t = t0 + i * 120_000;
            let start = monitor
                .observe_at(t, PeakCategory::Cpu, "cpu_usage", 95.0, 75.0, 90.0, &ctx())
                .unwrap();
            monitor.emit(start).await;
            assert!(monitor
                .observe_at(t + 60_000, PeakCategory::Cpu, "cpu_usage", 10.0, 75.0, 90.0, &ctx())
                .is_none());
            let resolve = monitor
                .observe_at(t + 65_000, PeakCategory::Cpu, "cpu_usage", 10.0, 75.0, 90.0, &ctx())
                .unwrap();
            monitor.emit(resolve).await;
        }
        assert!(monitor.dropped_events() > 0);

        // The consumer still sees the oldest events, in order.
        let mut rx = monitor.take_receiver().expect("receiver available");
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(first.seq < second.seq);
    }
}
