use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::outcome::{ErrorKind, FetchCode};
use crate::record::ModuleVersion;

/// Latency histogram bucket upper bounds, in seconds.
const BUCKETS: [f64; 9] = [0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0];

/// One terminal fetch outcome, as reported by the worker.
#[derive(Clone, Debug)]
pub struct TaskOutcome {
    pub id: ModuleVersion,
    pub code: FetchCode,
    pub kind: ErrorKind,
    pub message: String,
    pub latency: Duration,
    pub at: DateTime<Utc>,
}

#[derive(Serialize, Clone, Debug)]
pub struct FailureRecord {
    pub module_path: String,
    pub version: String,
    pub code: u16,
    pub kind: &'static str,
    pub message: String,
    pub at: DateTime<Utc>,
}

#[derive(Serialize, Debug)]
pub struct Snapshot {
    pub counts: Vec<(u16, u64)>,
    pub latency_buckets: Vec<(String, u64)>,
    pub recent_failures: Vec<FailureRecord>,
    pub dropped: u64,
}

struct State {
    counts: DashMap<u16, u64>,
    latencies: Mutex<[u64; BUCKETS.len() + 1]>,
    failures: Mutex<VecDeque<FailureRecord>>,
    ring_capacity: usize,
    dropped: AtomicU64,
}

/// Collects per-task outcome codes, latencies and the most recent failures
/// for diagnostics.
///
/// Submission never blocks the caller: outcomes go through a bounded
/// channel drained by a background task, and overflow is counted rather
/// than waited on.
#[derive(Clone)]
pub struct Reporter {
    tx: flume::Sender<TaskOutcome>,
    state: Arc<State>,
}

impl Reporter {
    pub fn new(ring_capacity: usize, queue_capacity: usize) -> Self {
        let (tx, rx) = flume::bounded::<TaskOutcome>(queue_capacity);
        let state = Arc::new(State {
            counts: DashMap::new(),
            latencies: Mutex::new([0; BUCKETS.len() + 1]),
            failures: Mutex::new(VecDeque::with_capacity(ring_capacity)),
            ring_capacity,
            dropped: AtomicU64::new(0),
        });

        let drain = Arc::clone(&state);
        tokio::spawn(async move {
            while let Ok(outcome) = rx.recv_async().await {
                Self::apply(&drain, outcome).await;
            }
        });

        Self { tx, state }
    }

    async fn apply(state: &State, outcome: TaskOutcome) {
        *state.counts.entry(outcome.code.as_u16()).or_insert(0) += 1;

        let secs = outcome.latency.as_secs_f64();
        let bucket = BUCKETS
            .iter()
            .position(|&b| secs <= b)
            .unwrap_or(BUCKETS.len());
        state.latencies.lock().await[bucket] += 1;

        if !outcome.code.is_good() {
            let mut failures = state.failures.lock().await;
            if failures.len() == state.ring_capacity {
                failures.pop_front();
            }
            failures.push_back(FailureRecord {
                module_path: outcome.id.module_path.to_string(),
                version: outcome.id.version.to_string(),
                code: outcome.code.as_u16(),
                kind: outcome.kind.as_str(),
                message: outcome.message,
                at: outcome.at,
            });
        }
    }

    /// Best-effort submission; a full queue increments the drop counter.
    pub fn record(&self, outcome: TaskOutcome) {
        if self.tx.try_send(outcome).is_err() {
            self.state.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub async fn snapshot(&self) -> Snapshot {
        let mut counts: Vec<(u16, u64)> = self
            .state
            .counts
            .iter()
            .map(|e| (*e.key(), *e.value()))
            .collect();
        counts.sort();

        let latencies = self.state.latencies.lock().await;
        let mut latency_buckets = Vec::with_capacity(BUCKETS.len() + 1);
        for (i, count) in latencies.iter().enumerate() {
            let label = match BUCKETS.get(i) {
                Some(b) => format!("<= {b}s"),
                None => "> 600s".to_string(),
            };
            latency_buckets.push((label, *count));
        }

        let recent_failures = self
            .state
            .failures
            .lock()
            .await
            .iter()
            .rev()
            .cloned()
            .collect();

        Snapshot {
            counts,
            latency_buckets,
            recent_failures,
            dropped: self.state.dropped.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for Reporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reporter").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(code: FetchCode, kind: ErrorKind) -> TaskOutcome {
        TaskOutcome {
            id: ModuleVersion::new("example.com/a", "v1.0.0"),
            code,
            kind,
            message: "boom".into(),
            latency: Duration::from_millis(700),
            at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn records_counts_and_failures() {
        let reporter = Reporter::new(10, 100);
        reporter.record(outcome(FetchCode::Ok, ErrorKind::None));
        reporter.record(outcome(FetchCode::NotFound, ErrorKind::NotFound));

        // Give the drain task a moment.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let snap = reporter.snapshot().await;
        assert_eq!(snap.counts, vec![(200, 1), (404, 1)]);
        assert_eq!(snap.recent_failures.len(), 1);
        assert_eq!(snap.recent_failures[0].code, 404);
        assert_eq!(snap.latency_buckets[1], ("<= 1s".to_string(), 2));
    }

    #[tokio::test]
    async fn ring_buffer_is_bounded() {
        let reporter = Reporter::new(3, 100);
        for _ in 0..10 {
            reporter.record(outcome(FetchCode::Internal, ErrorKind::Internal));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        let snap = reporter.snapshot().await;
        assert_eq!(snap.recent_failures.len(), 3);
    }
}
