//! Ordered publisher.
//!
//! Every outbound event goes through one FIFO worker:
//!
//! ```text
//!   enqueue ──→ [ job | job | job ] ──→ worker
//!     │                                   │ wait for spacing
//!     │ mark (scope, entity) pending      │ created_at = max(now, last + 1)
//!     │                                   │ sign, record logical clock
//!     │                                   │ send, retrying per RetryPolicy
//!     ▼                                   ▼ clear pending, reply
//!   PublishHandle ◄──────────────────── Result<Event>
//! ```
//!
//! The spacing wait happens before the timestamp is taken, so timestamps
//! stay in queue order however long the queue gets.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use taskrelay_protocol::{Event, Identity, UnsignedEvent};
use taskrelay_relay::RelayPool;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::clock::{lock_state, SharedReplicationState};
use crate::error::{Result, SyncError};

/// Current unix time in seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Where signed events go.
pub trait EventSink: Send + Sync {
    /// Hand `event` to `relays`. Returns how many accepted it locally.
    fn send(&self, relays: &[String], event: &Event) -> Result<usize>;
}

impl EventSink for RelayPool {
    fn send(&self, relays: &[String], event: &Event) -> Result<usize> {
        Ok(self.publish(relays, event)?)
    }
}

/// Source of event timestamps (unix seconds).
pub trait WallClock: Send + Sync {
    fn now(&self) -> u64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl WallClock for SystemClock {
    fn now(&self) -> u64 {
        unix_now()
    }
}

/// Send retries for a single publish.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Minimum gap between consecutive sends.
    pub spacing: Duration,
    pub retry: RetryPolicy,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            spacing: Duration::from_millis(200),
            retry: RetryPolicy::default(),
        }
    }
}

/// Logical clock entry a publish advances.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClockKey {
    Scope {
        scope_tag: String,
    },
    Entity {
        scope_tag: String,
        entity_id: String,
        deleted: bool,
    },
}

#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub event: UnsignedEvent,
    pub relays: Vec<String>,
    pub clock: ClockKey,
}

struct Job {
    request: PublishRequest,
    reply: oneshot::Sender<Result<Event>>,
}

/// Completion of a queued publish. Dropping it does not cancel the publish.
#[derive(Debug)]
pub struct PublishHandle {
    reply: oneshot::Receiver<Result<Event>>,
}

impl PublishHandle {
    /// Wait for the signed event, or the final send error.
    pub async fn wait(self) -> Result<Event> {
        self.reply.await.map_err(|_| SyncError::PublisherClosed)?
    }
}

/// Handle to the publisher worker.
pub struct Publisher {
    jobs: mpsc::UnboundedSender<Job>,
    state: SharedReplicationState,
}

impl Publisher {
    /// Spawn the worker. Must be called inside a tokio runtime.
    pub fn spawn(
        identity: Arc<Identity>,
        sink: Arc<dyn EventSink>,
        clock: Arc<dyn WallClock>,
        state: SharedReplicationState,
        config: PublisherConfig,
    ) -> Self {
        let (jobs, rx) = mpsc::unbounded_channel();
        let worker = Worker {
            identity,
            sink,
            clock,
            state: state.clone(),
            config,
            last_issued: 0,
            last_send: None,
        };
        tokio::spawn(worker.run(rx));
        Self { jobs, state }
    }

    /// Queue a publish. Entity keys count as pending from now until the
    /// worker is done with them.
    pub fn enqueue(&self, request: PublishRequest) -> Result<PublishHandle> {
        if let ClockKey::Entity {
            scope_tag,
            entity_id,
            ..
        } = &request.clock
        {
            lock_state(&self.state).mark_pending(scope_tag, entity_id);
        }
        let clock = request.clock.clone();
        let (reply, rx) = oneshot::channel();
        if self.jobs.send(Job { request, reply }).is_err() {
            clear_pending(&self.state, &clock);
            return Err(SyncError::PublisherClosed);
        }
        Ok(PublishHandle { reply: rx })
    }
}

struct Worker {
    identity: Arc<Identity>,
    sink: Arc<dyn EventSink>,
    clock: Arc<dyn WallClock>,
    state: SharedReplicationState,
    config: PublisherConfig,
    last_issued: u64,
    last_send: Option<Instant>,
}

impl Worker {
    async fn run(mut self, mut jobs: mpsc::UnboundedReceiver<Job>) {
        while let Some(Job { request, reply }) = jobs.recv().await {
            if let Some(last) = self.last_send {
                tokio::time::sleep_until(last + self.config.spacing).await;
            }
            let created_at = self.clock.now().max(self.last_issued + 1);
            self.last_issued = created_at;

            let clock = request.clock.clone();
            let result = self.publish(request, created_at).await;
            self.last_send = Some(Instant::now());
            clear_pending(&self.state, &clock);

            if let Err(e) = &result {
                warn!("Publish failed: {}", e);
            }
            let _ = reply.send(result);
        }
        debug!("Publisher stopped");
    }

    async fn publish(&self, request: PublishRequest, created_at: u64) -> Result<Event> {
        let PublishRequest {
            event,
            relays,
            clock,
        } = request;
        let event = event.sign(&self.identity, created_at)?;

        {
            let mut state = lock_state(&self.state);
            match &clock {
                ClockKey::Scope { scope_tag } => state.record_scope(scope_tag, created_at),
                ClockKey::Entity {
                    scope_tag,
                    entity_id,
                    deleted,
                } => state.record_entity(scope_tag, entity_id, created_at, *deleted),
            }
        }

        let attempts = self.config.retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.sink.send(&relays, &event) {
                Ok(accepted) => {
                    debug!(
                        "Published event {} (kind {}) at {} to {} relays",
                        event.id, event.kind, created_at, accepted
                    );
                    return Ok(event);
                }
                Err(e) if attempt < attempts => {
                    debug!("Publish attempt {}/{} failed: {}", attempt, attempts, e);
                    attempt += 1;
                    tokio::time::sleep(self.config.retry.delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn clear_pending(state: &SharedReplicationState, clock: &ClockKey) {
    if let ClockKey::Entity {
        scope_tag,
        entity_id,
        ..
    } = clock
    {
        lock_state(state).clear_pending(scope_tag, entity_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ReplicationState;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use taskrelay_protocol::KIND_ENTITY;

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<Event>>,
        failures_left: AtomicU32,
    }

    impl EventSink for RecordingSink {
        fn send(&self, _relays: &[String], event: &Event) -> Result<usize> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(taskrelay_relay::Error::NoRelays.into());
            }
            self.events.lock().unwrap().push(event.clone());
            Ok(1)
        }
    }

    struct FixedClock(u64);

    impl WallClock for FixedClock {
        fn now(&self) -> u64 {
            self.0
        }
    }

    fn config(spacing_ms: u64) -> PublisherConfig {
        PublisherConfig {
            spacing: Duration::from_millis(spacing_ms),
            retry: RetryPolicy {
                max_attempts: 3,
                delay: Duration::from_millis(1),
            },
        }
    }

    fn request(entity: &str) -> PublishRequest {
        PublishRequest {
            event: UnsignedEvent::new(KIND_ENTITY, "{}").tag("d", entity),
            relays: vec!["wss://relay.example".into()],
            clock: ClockKey::Entity {
                scope_tag: "T".into(),
                entity_id: entity.into(),
                deleted: false,
            },
        }
    }

    fn spawn(sink: Arc<RecordingSink>, now: u64, spacing_ms: u64) -> (Publisher, SharedReplicationState) {
        let state = ReplicationState::shared();
        let publisher = Publisher::spawn(
            Arc::new(Identity::generate()),
            sink,
            Arc::new(FixedClock(now)),
            state.clone(),
            config(spacing_ms),
        );
        (publisher, state)
    }

    #[tokio::test]
    async fn timestamps_strictly_increase() {
        let sink = Arc::new(RecordingSink::default());
        let (publisher, state) = spawn(sink.clone(), 1000, 1);

        let handles: Vec<_> = (0..3)
            .map(|_| publisher.enqueue(request("x")).unwrap())
            .collect();
        assert!(lock_state(&state).is_pending("T", "x"));

        let mut stamps = Vec::new();
        for handle in handles {
            stamps.push(handle.wait().await.unwrap().created_at);
        }
        assert_eq!(stamps, vec![1000, 1001, 1002]);
        assert_eq!(sink.events.lock().unwrap().len(), 3);

        let state = lock_state(&state);
        assert!(!state.is_pending("T", "x"));
        assert_eq!(state.entity_clock("T", "x").map(|c| c.at), Some(1002));
    }

    #[tokio::test]
    async fn events_are_signed_and_verifiable() {
        let sink = Arc::new(RecordingSink::default());
        let (publisher, _) = spawn(sink, 5, 1);
        let event = publisher.enqueue(request("x")).unwrap().wait().await.unwrap();
        event.verify().unwrap();
        assert_eq!(event.tag_value("d"), Some("x"));
    }

    #[tokio::test]
    async fn spacing_delays_consecutive_sends() {
        let sink = Arc::new(RecordingSink::default());
        let (publisher, _) = spawn(sink, 5, 40);
        let start = std::time::Instant::now();
        let a = publisher.enqueue(request("a")).unwrap();
        let b = publisher.enqueue(request("b")).unwrap();
        let c = publisher.enqueue(request("c")).unwrap();
        a.wait().await.unwrap();
        b.wait().await.unwrap();
        c.wait().await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(80));
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let sink = Arc::new(RecordingSink::default());
        sink.failures_left.store(2, Ordering::SeqCst);
        let (publisher, _) = spawn(sink.clone(), 5, 1);
        publisher.enqueue(request("x")).unwrap().wait().await.unwrap();
        assert_eq!(sink.events.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn persistent_failure_surfaces_and_clears_pending() {
        let sink = Arc::new(RecordingSink::default());
        sink.failures_left.store(10, Ordering::SeqCst);
        let (publisher, state) = spawn(sink, 5, 1);
        let result = publisher.enqueue(request("x")).unwrap().wait().await;
        assert!(matches!(result, Err(SyncError::Transport(_))));

        let state = lock_state(&state);
        assert!(!state.is_pending("T", "x"));
        // The clock still moved: the optimistic local state stays put.
        assert_eq!(state.entity_clock("T", "x").map(|c| c.at), Some(5));
    }
}
