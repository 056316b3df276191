use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use compact_str::CompactString;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::backoff::BackoffConfig;
use crate::record::ModuleVersion;

/// One fetch task as delivered to a worker.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
pub struct Task {
    #[serde(flatten)]
    pub id: ModuleVersion,
    pub app_label: CompactString,
    /// Prior failed deliveries; drives the default backoff.
    #[serde(default)]
    pub attempt: u32,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Enqueued {
    Enqueued,
    /// The same `(module, version, app_label)` is already queued or in
    /// flight.
    Deduped,
}

#[derive(Error, Debug)]
pub enum QueueError {
    /// The queue is at its in-flight bound; try again next cycle.
    #[error("queue is full")]
    Full,

    #[error("queue backend failure: {0}")]
    Backend(String),
}

/// Acknowledgement handle for one delivered task.
#[async_trait]
pub trait Ack: Send {
    /// The task reached a terminal outcome; never redeliver it.
    async fn complete(self: Box<Self>);

    /// The attempt failed; redeliver after `delay`, or after the queue's
    /// own backoff schedule when `None`.
    async fn fail(self: Box<Self>, delay: Option<Duration>);
}

/// The queue contract both backends implement identically.
///
/// Delivery is at-least-once for non-terminal tasks; consumers are
/// idempotent. A task completed as terminal is never redelivered, the
/// same identity enqueued while an attempt is pending or in flight is
/// deduplicated, and at most one task per `module_path` is delivered at a
/// time.
#[async_trait]
pub trait Queue: Send + Sync {
    async fn enqueue(&self, id: ModuleVersion, app_label: &str) -> Result<Enqueued, QueueError>;

    /// Next task, or `None` once the queue has shut down.
    async fn dequeue(&self) -> Option<(Task, Box<dyn Ack>)>;
}

type DedupKey = (ModuleVersion, CompactString);

struct MemoryInner {
    tx: flume::Sender<Task>,
    rx: flume::Receiver<Task>,
    pending: DashMap<DedupKey, ()>,
    busy_modules: DashMap<CompactString, ()>,
    backoff: BackoffConfig,
    /// Pause before redelivering a task whose module is busy.
    redeliver_delay: Duration,
}

/// In-process backend: a bounded channel for admission control plus
/// shared maps for the dedup window and the per-module gate.
#[derive(Clone)]
pub struct MemoryQueue {
    inner: Arc<MemoryInner>,
}

impl MemoryQueue {
    pub fn new(max_in_flight: usize, backoff: BackoffConfig) -> Self {
        Self::with_redeliver_delay(max_in_flight, backoff, Duration::from_secs(1))
    }

    pub fn with_redeliver_delay(
        max_in_flight: usize,
        backoff: BackoffConfig,
        redeliver_delay: Duration,
    ) -> Self {
        let (tx, rx) = flume::bounded(max_in_flight);
        Self {
            inner: Arc::new(MemoryInner {
                tx,
                rx,
                pending: DashMap::new(),
                busy_modules: DashMap::new(),
                backoff,
                redeliver_delay,
            }),
        }
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn enqueue(&self, id: ModuleVersion, app_label: &str) -> Result<Enqueued, QueueError> {
        let key = (id.clone(), CompactString::from(app_label));
        if self.inner.pending.insert(key.clone(), ()).is_some() {
            return Ok(Enqueued::Deduped);
        }

        let task = Task {
            id,
            app_label: key.1.clone(),
            attempt: 0,
        };
        match self.inner.tx.try_send(task) {
            Ok(()) => Ok(Enqueued::Enqueued),
            Err(e) => {
                self.inner.pending.remove(&key);
                match e {
                    flume::TrySendError::Full(_) => Err(QueueError::Full),
                    flume::TrySendError::Disconnected(_) => {
                        Err(QueueError::Backend("queue closed".into()))
                    }
                }
            }
        }
    }

    async fn dequeue(&self) -> Option<(Task, Box<dyn Ack>)> {
        loop {
            let task = self.inner.rx.recv_async().await.ok()?;

            // MaxPerModule = 1: while any version of a module is in
            // flight, other tasks for it circle back after a pause.
            if self
                .inner
                .busy_modules
                .insert(task.id.module_path.clone(), ())
                .is_some()
            {
                let tx = self.inner.tx.clone();
                let delay = self.inner.redeliver_delay;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send_async(task).await;
                });
                continue;
            }

            let ack = MemoryAck {
                inner: Arc::clone(&self.inner),
                task: task.clone(),
            };
            return Some((task, Box::new(ack)));
        }
    }
}

struct MemoryAck {
    inner: Arc<MemoryInner>,
    task: Task,
}

#[async_trait]
impl Ack for MemoryAck {
    async fn complete(self: Box<Self>) {
        let key = (self.task.id.clone(), self.task.app_label.clone());
        self.inner.pending.remove(&key);
        self.inner.busy_modules.remove(&self.task.id.module_path);
    }

    async fn fail(self: Box<Self>, delay: Option<Duration>) {
        // Release the module gate right away; the dedup window stays
        // until the retry itself completes.
        self.inner.busy_modules.remove(&self.task.id.module_path);

        let delay = delay.unwrap_or_else(|| self.inner.backoff.delay(self.task.attempt));
        let mut task = self.task;
        task.attempt += 1;
        let tx = self.inner.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send_async(task).await;
        });
    }
}

#[derive(Deserialize, Debug)]
struct LeaseResponse {
    #[serde(flatten)]
    task: Task,
    ack_token: String,
}

/// Hosted backend: a remote task service spoken to over HTTP. The service
/// owns durability, deduplication and the per-module gate; this client
/// maps its responses onto the queue contract.
pub struct RemoteQueue {
    client: reqwest::Client,
    base: Url,
}

impl RemoteQueue {
    pub fn new(client: reqwest::Client, base: Url) -> Self {
        Self { client, base }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base.as_str().trim_end_matches('/'), path)
    }
}

#[async_trait]
impl Queue for RemoteQueue {
    async fn enqueue(&self, id: ModuleVersion, app_label: &str) -> Result<Enqueued, QueueError> {
        let task = Task {
            id,
            app_label: app_label.into(),
            attempt: 0,
        };
        let res = self
            .client
            .post(self.endpoint("tasks"))
            .json(&task)
            .send()
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;

        match res.status().as_u16() {
            200 | 201 => Ok(Enqueued::Enqueued),
            409 => Ok(Enqueued::Deduped),
            429 => Err(QueueError::Full),
            s => Err(QueueError::Backend(format!("task service returned {s}"))),
        }
    }

    async fn dequeue(&self) -> Option<(Task, Box<dyn Ack>)> {
        loop {
            let res = self
                .client
                .post(self.endpoint("tasks/lease"))
                .json(&serde_json::json!({ "lease_secs": 600 }))
                .send()
                .await;

            match res {
                Ok(res) if res.status().as_u16() == 200 => {
                    match res.json::<LeaseResponse>().await {
                        Ok(lease) => {
                            let ack = RemoteAck {
                                client: self.client.clone(),
                                url: self.endpoint(&format!("tasks/{}", lease.ack_token)),
                            };
                            return Some((lease.task, Box::new(ack)));
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "bad lease response");
                        }
                    }
                }
                Ok(res) if res.status().as_u16() == 204 => {
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
                Ok(res) => {
                    tracing::warn!(status = %res.status(), "task service lease failed");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "task service unreachable");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }
    }
}

struct RemoteAck {
    client: reqwest::Client,
    url: String,
}

#[async_trait]
impl Ack for RemoteAck {
    async fn complete(self: Box<Self>) {
        // At-least-once: a lost ack only means a redelivery, which the
        // fetcher absorbs idempotently.
        if let Err(e) = self
            .client
            .post(format!("{}/complete", self.url))
            .send()
            .await
        {
            tracing::warn!(error = %e, "task completion ack failed");
        }
    }

    async fn fail(self: Box<Self>, delay: Option<Duration>) {
        let body = serde_json::json!({ "delay_secs": delay.map(|d| d.as_secs()) });
        if let Err(e) = self
            .client
            .post(format!("{}/fail", self.url))
            .json(&body)
            .send()
            .await
        {
            tracing::warn!(error = %e, "task failure ack failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn mv(m: &str, v: &str) -> ModuleVersion {
        ModuleVersion::new(m, v)
    }

    fn test_queue(capacity: usize) -> MemoryQueue {
        MemoryQueue::with_redeliver_delay(
            capacity,
            BackoffConfig {
                init_backoff: Duration::from_millis(5),
                max_backoff: Duration::from_millis(50),
                base: 2.0,
            },
            Duration::from_millis(5),
        )
    }

    /// Contract battery, run against any backend.
    async fn check_contract(q: &dyn Queue) {
        // Dedup while queued.
        assert!(matches!(
            q.enqueue(mv("example.com/a", "v1.0.0"), "l1").await.unwrap(),
            Enqueued::Enqueued
        ));
        assert!(matches!(
            q.enqueue(mv("example.com/a", "v1.0.0"), "l1").await.unwrap(),
            Enqueued::Deduped
        ));
        // A different label is a different task identity.
        assert!(matches!(
            q.enqueue(mv("example.com/a", "v1.0.0"), "l2").await.unwrap(),
            Enqueued::Enqueued
        ));

        let (task, ack) = q.dequeue().await.unwrap();
        assert_eq!(task.id, mv("example.com/a", "v1.0.0"));

        // Dedup holds while in flight.
        assert!(matches!(
            q.enqueue(task.id.clone(), task.app_label.as_str()).await.unwrap(),
            Enqueued::Deduped
        ));

        ack.complete().await;

        // After terminal completion the identity may be enqueued again.
        assert!(matches!(
            q.enqueue(task.id.clone(), task.app_label.as_str()).await.unwrap(),
            Enqueued::Enqueued
        ));

        // Drain the rest.
        while let Ok(Some((_, ack))) = timeout(Duration::from_millis(200), q.dequeue()).await {
            ack.complete().await;
        }
    }

    #[tokio::test]
    async fn memory_queue_contract() {
        let q = test_queue(16);
        check_contract(&q).await;
    }

    #[tokio::test]
    #[ignore]
    async fn remote_queue_contract() {
        let base = std::env::var("MODINDEX_TEST_TASKS_URL").expect("set MODINDEX_TEST_TASKS_URL");
        let q = RemoteQueue::new(reqwest::Client::new(), Url::parse(&base).unwrap());
        check_contract(&q).await;
    }

    #[tokio::test]
    async fn failed_task_redelivers_with_attempt_bump() {
        let q = test_queue(16);
        q.enqueue(mv("example.com/a", "v1.0.0"), "l1").await.unwrap();

        let (task, ack) = q.dequeue().await.unwrap();
        assert_eq!(task.attempt, 0);
        ack.fail(Some(Duration::from_millis(5))).await;

        let (task, ack) = timeout(Duration::from_secs(1), q.dequeue())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.attempt, 1);
        ack.complete().await;
    }

    #[tokio::test]
    async fn one_task_per_module_at_a_time() {
        let q = test_queue(16);
        q.enqueue(mv("example.com/a", "v1.0.0"), "l1").await.unwrap();
        q.enqueue(mv("example.com/a", "v2.0.0"), "l1").await.unwrap();
        q.enqueue(mv("example.com/b", "v1.0.0"), "l1").await.unwrap();

        let (first, first_ack) = q.dequeue().await.unwrap();
        assert_eq!(first.id.module_path, "example.com/a");

        // The other version of module a must wait; module b is free.
        let (second, second_ack) = timeout(Duration::from_secs(1), q.dequeue())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.id.module_path, "example.com/b");
        second_ack.complete().await;

        let waiting = timeout(Duration::from_millis(100), q.dequeue()).await;
        assert!(waiting.is_err(), "second version delivered while first in flight");

        first_ack.complete().await;
        let (third, third_ack) = timeout(Duration::from_secs(1), q.dequeue())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(third.id, mv("example.com/a", "v2.0.0"));
        third_ack.complete().await;
    }

    #[tokio::test]
    async fn full_queue_is_backpressure() {
        let q = test_queue(1);
        q.enqueue(mv("example.com/a", "v1.0.0"), "l1").await.unwrap();
        let err = q
            .enqueue(mv("example.com/b", "v1.0.0"), "l1")
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Full));

        // The rejected identity was not left in the dedup window.
        let (_, ack) = q.dequeue().await.unwrap();
        ack.complete().await;
        assert!(matches!(
            q.enqueue(mv("example.com/b", "v1.0.0"), "l1").await.unwrap(),
            Enqueued::Enqueued
        ));
    }
}
