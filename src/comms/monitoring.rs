//! Message tracing, queue gauges, and latency statistics
//!
//! Everything here is observational: components feed events in, the
//! analytics endpoints read aggregates out. Memory is bounded: traces cap
//! at `max_traces` with oldest-first eviction, latency rings at 1000
//! samples.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::comms::message::MessageType;
use crate::domain_types::{AgentId, CorrelationId, MaxTraces, MessageId};

/// Number of traces evicted in one batch when the cap is reached
const EVICTION_BATCH: usize = 100;

/// Capacity of the latency and processing-time sample rings
const SAMPLE_WINDOW: usize = 1000;

/// Lifecycle status of a traced message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceStatus {
    /// Created but not yet delivered
    InFlight,
    /// Accepted by the recipient's queue
    Delivered,
    /// Consumer confirmed processing
    Acknowledged,
    /// Delivery or processing failed; terminal
    Failed,
}

/// Per-message lifecycle record
#[derive(Debug, Clone, Serialize)]
pub struct MessageTrace {
    /// The traced message
    pub message_id: MessageId,
    /// Correlation id, when the message is part of a request/response pair
    pub correlation_id: Option<CorrelationId>,
    /// Originating participant
    pub sender: AgentId,
    /// Destination participant
    pub recipient: AgentId,
    /// Envelope kind
    pub message_type: MessageType,
    /// Trace creation time
    pub created_at: SystemTime,
    /// Ordered checkpoint labels
    pub route: Vec<String>,
    /// Stage label to time spent there
    pub processing_times: HashMap<String, Duration>,
    /// Current lifecycle status
    pub status: TraceStatus,
    /// Error recorded when the status is failed
    pub error: Option<String>,
}

impl MessageTrace {
    /// Sum of all recorded stage times
    #[must_use]
    pub fn total_time(&self) -> Duration {
        self.processing_times.values().sum()
    }
}

/// Ordering of lifecycle statuses for the monotonic-advance check
fn rank(status: TraceStatus) -> u8 {
    match status {
        TraceStatus::InFlight => 0,
        TraceStatus::Delivered => 1,
        TraceStatus::Acknowledged => 2,
        TraceStatus::Failed => 3,
    }
}

/// Aggregate statistics over terminal trace transitions
#[derive(Debug, Clone, Default, Serialize)]
pub struct MessageAnalytics {
    /// Traces that reached any terminal mark
    pub total_messages: u64,
    /// Marked delivered
    pub total_delivered: u64,
    /// Marked failed
    pub total_failed: u64,
    /// Marked acknowledged
    pub total_acknowledged: u64,
    /// Count per message type
    pub messages_by_type: HashMap<MessageType, u64>,
    /// Count per sender
    pub messages_by_sender: HashMap<AgentId, u64>,
    /// Count per recipient
    pub messages_by_recipient: HashMap<AgentId, u64>,
    /// Running mean of total processing time, seconds
    pub avg_processing_time: f64,
    /// Largest total processing time observed, seconds
    pub max_processing_time: f64,
    /// Smallest total processing time observed, seconds
    pub min_processing_time: Option<f64>,
}

impl MessageAnalytics {
    fn update(&mut self, trace: &MessageTrace) {
        self.total_messages += 1;
        match trace.status {
            TraceStatus::Delivered => self.total_delivered += 1,
            TraceStatus::Failed => self.total_failed += 1,
            TraceStatus::Acknowledged => self.total_acknowledged += 1,
            TraceStatus::InFlight => {}
        }
        *self.messages_by_type.entry(trace.message_type).or_default() += 1;
        *self
            .messages_by_sender
            .entry(trace.sender.clone())
            .or_default() += 1;
        *self
            .messages_by_recipient
            .entry(trace.recipient.clone())
            .or_default() += 1;

        let total = trace.total_time().as_secs_f64();
        if total > 0.0 {
            self.max_processing_time = self.max_processing_time.max(total);
            self.min_processing_time = Some(match self.min_processing_time {
                Some(min) => min.min(total),
                None => total,
            });
            if self.avg_processing_time == 0.0 {
                self.avg_processing_time = total;
            } else {
                self.avg_processing_time = (self.avg_processing_time
                    * (self.total_messages as f64 - 1.0)
                    + total)
                    / self.total_messages as f64;
            }
        }
    }

    /// Fraction of traces that were delivered or acknowledged
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        if self.total_messages == 0 {
            return 0.0;
        }
        (self.total_delivered + self.total_acknowledged) as f64 / self.total_messages as f64
    }

    /// Fraction of traces that failed
    #[must_use]
    pub fn failure_rate(&self) -> f64 {
        if self.total_messages == 0 {
            return 0.0;
        }
        self.total_failed as f64 / self.total_messages as f64
    }
}

/// Tracks messages through their lifecycle, retaining at most `max_traces`
pub struct MessageTracer {
    max_traces: usize,
    traces: Mutex<HashMap<MessageId, MessageTrace>>,
    analytics: Mutex<MessageAnalytics>,
}

impl MessageTracer {
    /// Creates a tracer retaining at most `max_traces` traces
    #[must_use]
    pub fn new(max_traces: MaxTraces) -> Self {
        Self {
            max_traces: max_traces.as_usize(),
            traces: Mutex::new(HashMap::new()),
            analytics: Mutex::new(MessageAnalytics::default()),
        }
    }

    /// Begins tracing a message
    pub fn start_trace(
        &self,
        message_id: MessageId,
        sender: &AgentId,
        recipient: &AgentId,
        message_type: MessageType,
        correlation_id: Option<CorrelationId>,
    ) {
        let mut traces = self.traces.lock().unwrap_or_else(|e| e.into_inner());

        if traces.len() >= self.max_traces {
            let mut oldest: Vec<(MessageId, SystemTime)> = traces
                .iter()
                .map(|(id, trace)| (*id, trace.created_at))
                .collect();
            oldest.sort_by_key(|(_, created)| *created);
            for (id, _) in oldest.into_iter().take(EVICTION_BATCH) {
                traces.remove(&id);
            }
            warn!(evicted = EVICTION_BATCH, "trace capacity reached, evicted oldest");
        }

        let trace = MessageTrace {
            message_id,
            correlation_id,
            sender: sender.clone(),
            recipient: recipient.clone(),
            message_type,
            created_at: SystemTime::now(),
            route: vec![format!("created_by_{sender}")],
            processing_times: HashMap::new(),
            status: TraceStatus::InFlight,
            error: None,
        };
        traces.insert(message_id, trace);
        debug!(message_id = %message_id, "trace started");
    }

    /// Appends a checkpoint label to the message route; unknown ids no-op
    pub fn record_hop(&self, message_id: &MessageId, hop: impl Into<String>) {
        let mut traces = self.traces.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(trace) = traces.get_mut(message_id) {
            trace.route.push(hop.into());
        }
    }

    /// Records time spent in a named stage; unknown ids no-op
    pub fn record_processing_time(
        &self,
        message_id: &MessageId,
        stage: impl Into<String>,
        duration: Duration,
    ) {
        let mut traces = self.traces.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(trace) = traces.get_mut(message_id) {
            trace.processing_times.insert(stage.into(), duration);
        }
    }

    /// Marks the message delivered and folds it into analytics
    pub fn mark_delivered(&self, message_id: &MessageId) {
        self.mark(message_id, TraceStatus::Delivered, None);
    }

    /// Marks the message acknowledged and folds it into analytics
    pub fn mark_acknowledged(&self, message_id: &MessageId) {
        self.mark(message_id, TraceStatus::Acknowledged, None);
    }

    /// Marks the message failed (terminal) and folds it into analytics
    pub fn mark_failed(&self, message_id: &MessageId, error: impl Into<String>) {
        self.mark(message_id, TraceStatus::Failed, Some(error.into()));
    }

    fn mark(&self, message_id: &MessageId, status: TraceStatus, error: Option<String>) {
        let mut traces = self.traces.lock().unwrap_or_else(|e| e.into_inner());
        let Some(trace) = traces.get_mut(message_id) else {
            return;
        };
        // Failed is terminal; every other status only advances. A consumer
        // may acknowledge a message before the publish path marks it
        // delivered, so a late delivered mark must not regress the trace.
        if trace.status == TraceStatus::Failed || rank(status) <= rank(trace.status) {
            return;
        }
        trace.status = status;
        if let Some(error) = error {
            trace.error = Some(error);
        }
        let snapshot = trace.clone();
        drop(traces);
        self.analytics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .update(&snapshot);
    }

    /// Returns a snapshot of one trace
    #[must_use]
    pub fn get_trace(&self, message_id: &MessageId) -> Option<MessageTrace> {
        self.traces
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(message_id)
            .cloned()
    }

    /// All traces sharing a correlation id
    #[must_use]
    pub fn traces_by_correlation(&self, correlation_id: &CorrelationId) -> Vec<MessageTrace> {
        self.traces
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|trace| trace.correlation_id.as_ref() == Some(correlation_id))
            .cloned()
            .collect()
    }

    /// Snapshot of the analytics aggregate
    #[must_use]
    pub fn analytics(&self) -> MessageAnalytics {
        self.analytics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Most recent traces, newest first
    #[must_use]
    pub fn recent_traces(&self, limit: usize) -> Vec<MessageTrace> {
        let traces = self.traces.lock().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<MessageTrace> = traces.values().cloned().collect();
        all.sort_by_key(|t| std::cmp::Reverse(t.created_at));
        all.truncate(limit);
        all
    }

    /// Most recent failed traces, newest first
    #[must_use]
    pub fn failed_traces(&self, limit: usize) -> Vec<MessageTrace> {
        let traces = self.traces.lock().unwrap_or_else(|e| e.into_inner());
        let mut failed: Vec<MessageTrace> = traces
            .values()
            .filter(|t| t.status == TraceStatus::Failed)
            .cloned()
            .collect();
        failed.sort_by_key(|t| std::cmp::Reverse(t.created_at));
        failed.truncate(limit);
        failed
    }

    /// Drops traces older than `max_age`; returns how many were removed
    pub fn clear_older_than(&self, max_age: Duration) -> usize {
        let cutoff = SystemTime::now() - max_age;
        let mut traces = self.traces.lock().unwrap_or_else(|e| e.into_inner());
        let before = traces.len();
        traces.retain(|_, trace| trace.created_at > cutoff);
        before - traces.len()
    }

    /// Number of retained traces
    #[must_use]
    pub fn len(&self) -> usize {
        self.traces.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether no traces are retained
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MessageTracer {
    fn default() -> Self {
        Self::new(MaxTraces::default())
    }
}

/// Health tag derived from queue depth relative to its high-water mark
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueHealth {
    /// Queue is empty
    Idle,
    /// Depth below half the high-water mark
    Healthy,
    /// Depth between 50% and 80% of the high-water mark
    Warning,
    /// Depth at or above 80% of the high-water mark
    Critical,
}

#[derive(Debug, Default, Clone)]
struct QueueGauge {
    depth: usize,
    enqueued: u64,
    dequeued: u64,
    high_water: usize,
    last_activity: Option<SystemTime>,
}

/// Point-in-time statistics for one recipient queue
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    /// Messages currently queued
    pub current_depth: usize,
    /// Deepest the queue has ever been
    pub high_water_mark: usize,
    /// Lifetime enqueue count
    pub total_enqueued: u64,
    /// Lifetime dequeue count
    pub total_dequeued: u64,
    /// Last enqueue or dequeue
    pub last_activity: Option<SystemTime>,
    /// Time since the last activity
    pub idle_time: Duration,
    /// Derived health tag
    pub health: QueueHealth,
}

/// Tracks depth, throughput, and health per recipient queue
#[derive(Default)]
pub struct QueueMonitor {
    gauges: DashMap<AgentId, QueueGauge>,
}

impl QueueMonitor {
    /// Creates an empty monitor
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one message entering the queue
    pub fn record_enqueue(&self, queue: &AgentId) {
        let mut gauge = self.gauges.entry(queue.clone()).or_default();
        gauge.enqueued += 1;
        gauge.depth += 1;
        gauge.high_water = gauge.high_water.max(gauge.depth);
        gauge.last_activity = Some(SystemTime::now());
    }

    /// Records one message leaving the queue
    pub fn record_dequeue(&self, queue: &AgentId) {
        let mut gauge = self.gauges.entry(queue.clone()).or_default();
        gauge.dequeued += 1;
        gauge.depth = gauge.depth.saturating_sub(1);
        gauge.last_activity = Some(SystemTime::now());
    }

    /// Current tracked depth of a queue
    #[must_use]
    pub fn queue_depth(&self, queue: &AgentId) -> usize {
        self.gauges.get(queue).map(|g| g.depth).unwrap_or(0)
    }

    /// Statistics snapshot for one queue
    #[must_use]
    pub fn queue_stats(&self, queue: &AgentId) -> QueueStats {
        let gauge = self
            .gauges
            .get(queue)
            .map(|g| g.value().clone())
            .unwrap_or_default();
        let idle_time = gauge
            .last_activity
            .and_then(|at| SystemTime::now().duration_since(at).ok())
            .unwrap_or(Duration::ZERO);
        QueueStats {
            current_depth: gauge.depth,
            high_water_mark: gauge.high_water,
            total_enqueued: gauge.enqueued,
            total_dequeued: gauge.dequeued,
            last_activity: gauge.last_activity,
            idle_time,
            health: Self::health_of(&gauge),
        }
    }

    /// Statistics for every tracked queue
    #[must_use]
    pub fn all_queue_stats(&self) -> HashMap<AgentId, QueueStats> {
        self.gauges
            .iter()
            .map(|entry| (entry.key().clone(), self.queue_stats(entry.key())))
            .collect()
    }

    /// Total messages dequeued across all queues
    #[must_use]
    pub fn total_throughput(&self) -> u64 {
        self.gauges.iter().map(|entry| entry.dequeued).sum()
    }

    /// Derived health tag for one queue
    #[must_use]
    pub fn queue_health(&self, queue: &AgentId) -> QueueHealth {
        self.gauges
            .get(queue)
            .map(|g| Self::health_of(&g))
            .unwrap_or(QueueHealth::Idle)
    }

    fn health_of(gauge: &QueueGauge) -> QueueHealth {
        if gauge.depth == 0 {
            QueueHealth::Idle
        } else if (gauge.depth as f64) < gauge.high_water as f64 * 0.5 {
            QueueHealth::Healthy
        } else if (gauge.depth as f64) < gauge.high_water as f64 * 0.8 {
            QueueHealth::Warning
        } else {
            QueueHealth::Critical
        }
    }
}

/// Summary of the rolling performance counters
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    /// Seconds since the metrics were created
    pub uptime_seconds: f64,
    /// Mean request latency, milliseconds
    pub avg_latency_ms: f64,
    /// 95th percentile latency, milliseconds
    pub p95_latency_ms: f64,
    /// 99th percentile latency, milliseconds
    pub p99_latency_ms: f64,
    /// Mean processing time, milliseconds
    pub avg_processing_time_ms: f64,
    /// Errors recorded
    pub error_count: u64,
    /// Request timeouts recorded
    pub timeout_count: u64,
    /// Retry attempts recorded
    pub retry_count: u64,
    /// Circuit breaker openings recorded
    pub circuit_breaker_trips: u64,
    /// Errors per minute of uptime
    pub error_rate_per_minute: f64,
}

/// Rolling latency windows and failure counters
pub struct PerformanceMetrics {
    started_at: Instant,
    latencies: Mutex<VecDeque<f64>>,
    processing_times: Mutex<VecDeque<f64>>,
    error_count: AtomicU64,
    timeout_count: AtomicU64,
    retry_count: AtomicU64,
    circuit_breaker_trips: AtomicU64,
}

impl PerformanceMetrics {
    /// Creates metrics anchored at the current instant
    #[must_use]
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            latencies: Mutex::new(VecDeque::with_capacity(SAMPLE_WINDOW)),
            processing_times: Mutex::new(VecDeque::with_capacity(SAMPLE_WINDOW)),
            error_count: AtomicU64::new(0),
            timeout_count: AtomicU64::new(0),
            retry_count: AtomicU64::new(0),
            circuit_breaker_trips: AtomicU64::new(0),
        }
    }

    fn push_sample(ring: &Mutex<VecDeque<f64>>, value: f64) {
        let mut ring = ring.lock().unwrap_or_else(|e| e.into_inner());
        if ring.len() >= SAMPLE_WINDOW {
            ring.pop_front();
        }
        ring.push_back(value);
    }

    /// Records one request latency
    pub fn record_latency(&self, latency: Duration) {
        Self::push_sample(&self.latencies, latency.as_secs_f64());
    }

    /// Records one processing duration
    pub fn record_processing_time(&self, duration: Duration) {
        Self::push_sample(&self.processing_times, duration.as_secs_f64());
    }

    /// Counts an error
    pub fn record_error(&self) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a request timeout
    pub fn record_timeout(&self) {
        self.timeout_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a retry attempt
    pub fn record_retry(&self) {
        self.retry_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a circuit breaker opening
    pub fn record_circuit_breaker_trip(&self) {
        self.circuit_breaker_trips.fetch_add(1, Ordering::Relaxed);
    }

    fn mean(ring: &Mutex<VecDeque<f64>>) -> f64 {
        let ring = ring.lock().unwrap_or_else(|e| e.into_inner());
        if ring.is_empty() {
            return 0.0;
        }
        ring.iter().sum::<f64>() / ring.len() as f64
    }

    fn percentile(ring: &Mutex<VecDeque<f64>>, quantile: f64) -> f64 {
        let ring = ring.lock().unwrap_or_else(|e| e.into_inner());
        if ring.is_empty() {
            return 0.0;
        }
        let mut sorted: Vec<f64> = ring.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let index = ((sorted.len() as f64 * quantile) as usize).min(sorted.len() - 1);
        sorted[index]
    }

    /// Mean request latency in seconds
    #[must_use]
    pub fn avg_latency(&self) -> f64 {
        Self::mean(&self.latencies)
    }

    /// 95th percentile latency in seconds
    #[must_use]
    pub fn p95_latency(&self) -> f64 {
        Self::percentile(&self.latencies, 0.95)
    }

    /// 99th percentile latency in seconds
    #[must_use]
    pub fn p99_latency(&self) -> f64 {
        Self::percentile(&self.latencies, 0.99)
    }

    /// Seconds since creation
    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Errors per minute of uptime
    #[must_use]
    pub fn error_rate_per_minute(&self) -> f64 {
        let minutes = self.uptime().as_secs_f64() / 60.0;
        if minutes == 0.0 {
            return 0.0;
        }
        self.error_count.load(Ordering::Relaxed) as f64 / minutes
    }

    /// Full summary of the rolling counters
    #[must_use]
    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            uptime_seconds: self.uptime().as_secs_f64(),
            avg_latency_ms: self.avg_latency() * 1000.0,
            p95_latency_ms: self.p95_latency() * 1000.0,
            p99_latency_ms: self.p99_latency() * 1000.0,
            avg_processing_time_ms: Self::mean(&self.processing_times) * 1000.0,
            error_count: self.error_count.load(Ordering::Relaxed),
            timeout_count: self.timeout_count.load(Ordering::Relaxed),
            retry_count: self.retry_count.load(Ordering::Relaxed),
            circuit_breaker_trips: self.circuit_breaker_trips.load(Ordering::Relaxed),
            error_rate_per_minute: self.error_rate_per_minute(),
        }
    }
}

impl Default for PerformanceMetrics {
    fn default() -> Self {
        Self::new()
    }
}
