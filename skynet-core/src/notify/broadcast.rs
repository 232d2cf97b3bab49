//! Fan-out of approved notifications to subscriber channels
//!
//! Every subscriber gets its own bounded queue and worker task. A slow or
//! failing subscriber only ever backs up its own queue.
//!
//! Each `(event_key, channel)` is written to the [`NotificationLedger`] before
//! it is queued, moved to `in_flight` before every attempt and to `delivered`
//! only after the subscriber confirmed. [`Broadcaster::recover`] re-queues
//! whatever a previous run left `pending` or `in_flight`.

use super::ledger::NotificationLedger;
use crate::config::NotificationConfig;
use crate::error::Result;
use crate::types::{DeliveryState, Notification};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A delivery channel
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Channel name; also the ledger and rate-limit key
    fn name(&self) -> &str;

    /// Deliver one notification. Retryable errors are retried with backoff.
    async fn deliver(&self, notification: &Notification) -> Result<()>;
}

/// Bounded exponential backoff
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    /// Delay after failed attempt number `attempt` (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base.saturating_mul(factor).min(self.max)
    }
}

impl From<&NotificationConfig> for RetryPolicy {
    fn from(config: &NotificationConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base: Duration::from_millis(config.backoff_base_ms),
            max: Duration::from_millis(config.backoff_max_ms),
        }
    }
}

/// What `publish` did for one channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishStatus {
    /// Recorded and queued for the worker
    Enqueued,
    /// A previous run already delivered it
    AlreadyDelivered,
    /// A previous run gave up on it
    AlreadyFailed,
    /// The channel queue is full; recorded as failed
    Backpressured,
    /// The channel is shutting down
    Closed,
    /// The ledger could not record it
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOutcome {
    pub channel: String,
    pub status: PublishStatus,
}

/// Final result of one delivery, reported by workers
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    Delivered { attempts: u32 },
    Failed { attempts: u32, error: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryReport {
    pub channel: String,
    pub notification: Notification,
    pub outcome: DeliveryOutcome,
}

struct Lane {
    name: String,
    queue: Option<mpsc::Sender<Notification>>,
    task: JoinHandle<()>,
}

/// Per-channel delivery workers
pub struct Broadcaster {
    lanes: Vec<Lane>,
    ledger: Arc<NotificationLedger>,
    reports: Option<mpsc::UnboundedReceiver<DeliveryReport>>,
    cancel: CancellationToken,
}

impl Broadcaster {
    /// Spawn one worker per subscriber.
    ///
    /// `parent` aborts retries and in-progress attempts when cancelled.
    pub fn new(
        subscribers: Vec<Arc<dyn Subscriber>>,
        ledger: Arc<NotificationLedger>,
        policy: RetryPolicy,
        queue_capacity: usize,
        parent: &CancellationToken,
    ) -> Self {
        let cancel = parent.child_token();
        let (report_tx, report_rx) = mpsc::unbounded_channel();

        let lanes = subscribers
            .into_iter()
            .map(|subscriber| {
                let (tx, rx) = mpsc::channel(queue_capacity.max(1));
                let name = subscriber.name().to_string();
                let worker = Worker {
                    subscriber,
                    ledger: Arc::clone(&ledger),
                    policy,
                    reports: report_tx.clone(),
                    cancel: cancel.clone(),
                };
                Lane {
                    name,
                    queue: Some(tx),
                    task: tokio::spawn(worker.run(rx)),
                }
            })
            .collect();

        Self {
            lanes,
            ledger,
            reports: Some(report_rx),
            cancel,
        }
    }

    /// Names of all channels
    pub fn channels(&self) -> Vec<String> {
        self.lanes.iter().map(|l| l.name.clone()).collect()
    }

    /// Take the stream of final delivery results
    pub fn take_reports(&mut self) -> Option<mpsc::UnboundedReceiver<DeliveryReport>> {
        self.reports.take()
    }

    /// Send `notification` to every channel
    pub fn publish(&self, notification: &Notification) -> Vec<ChannelOutcome> {
        self.lanes
            .iter()
            .map(|lane| self.dispatch_to(lane, notification))
            .collect()
    }

    /// Send `notification` to one channel
    pub fn dispatch(&self, channel: &str, notification: &Notification) -> ChannelOutcome {
        match self.lanes.iter().find(|l| l.name == channel) {
            Some(lane) => self.dispatch_to(lane, notification),
            None => ChannelOutcome {
                channel: channel.to_string(),
                status: PublishStatus::Rejected(format!("unknown channel {}", channel)),
            },
        }
    }

    fn dispatch_to(&self, lane: &Lane, notification: &Notification) -> ChannelOutcome {
        let now = Utc::now();
        let status = match self.ledger.record_pending(notification, &lane.name, now) {
            Err(e) => {
                tracing::error!(channel = %lane.name, event_key = %notification.event_key, error = %e, "Cannot record notification");
                PublishStatus::Rejected(e.to_string())
            }
            Ok(DeliveryState::Delivered) => PublishStatus::AlreadyDelivered,
            Ok(DeliveryState::Failed) => PublishStatus::AlreadyFailed,
            Ok(DeliveryState::Pending | DeliveryState::InFlight) => match &lane.queue {
                None => PublishStatus::Closed,
                Some(queue) => match queue.try_send(notification.clone()) {
                    Ok(()) => PublishStatus::Enqueued,
                    Err(mpsc::error::TrySendError::Closed(_)) => PublishStatus::Closed,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::warn!(channel = %lane.name, event_key = %notification.event_key, "Channel queue full");
                        if let Err(e) = self.ledger.mark_failed(
                            &notification.event_key,
                            &lane.name,
                            "queue full",
                            now,
                        ) {
                            tracing::error!(channel = %lane.name, error = %e, "Cannot update ledger");
                        }
                        PublishStatus::Backpressured
                    }
                },
            },
        };
        ChannelOutcome {
            channel: lane.name.clone(),
            status,
        }
    }

    /// Re-queue everything a previous run left unfinished. Returns the count.
    pub async fn recover(&self) -> Result<usize> {
        let mut recovered = 0;
        for lane in &self.lanes {
            let Some(queue) = &lane.queue else {
                continue;
            };
            for record in self.ledger.unfinished(&lane.name)? {
                tracing::info!(
                    channel = %lane.name,
                    event_key = %record.event_key,
                    state = %record.state,
                    "Recovering undelivered notification"
                );
                if queue.send(record.notification).await.is_err() {
                    break;
                }
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    /// Close the queues and wait for workers.
    ///
    /// Workers get `grace` to finish what is queued; after that, attempts and
    /// retry sleeps are abandoned and the records stay unfinished for the
    /// next start.
    pub async fn shutdown(mut self, grace: Duration) {
        for lane in &mut self.lanes {
            lane.queue = None;
        }
        let cancel = self.cancel.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            cancel.cancel();
        });
        for lane in self.lanes.drain(..) {
            if let Err(e) = lane.task.await {
                tracing::warn!(channel = %lane.name, error = %e, "Delivery worker ended abnormally");
            }
        }
        timer.abort();
        tracing::debug!("Broadcaster stopped");
    }
}

struct Worker {
    subscriber: Arc<dyn Subscriber>,
    ledger: Arc<NotificationLedger>,
    policy: RetryPolicy,
    reports: mpsc::UnboundedSender<DeliveryReport>,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(self, mut queue: mpsc::Receiver<Notification>) {
        while let Some(notification) = queue.recv().await {
            if self.cancel.is_cancelled() {
                // Left pending for the next start
                continue;
            }
            if let Some(outcome) = self.deliver(&notification).await {
                let _ = self.reports.send(DeliveryReport {
                    channel: self.subscriber.name().to_string(),
                    notification,
                    outcome,
                });
            }
        }
    }

    /// `None` when the attempt was abandoned for shutdown
    async fn deliver(&self, notification: &Notification) -> Option<DeliveryOutcome> {
        let channel = self.subscriber.name();
        let key = notification.event_key.as_str();

        match self.ledger.get(key, channel) {
            Ok(Some(record)) if !record.state.is_unfinished() => {
                tracing::debug!(channel, event_key = key, state = %record.state, "Already settled, skipping");
                return None;
            }
            Ok(_) => {}
            Err(e) => tracing::error!(channel, event_key = key, error = %e, "Ledger read failed"),
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            if let Err(e) = self.ledger.mark_in_flight(key, channel, Utc::now()) {
                tracing::error!(channel, event_key = key, error = %e, "Ledger update failed");
            }

            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                result = self.subscriber.deliver(notification) => result,
            };

            match result {
                Ok(()) => {
                    if let Err(e) = self.ledger.mark_delivered(key, channel, Utc::now()) {
                        tracing::error!(channel, event_key = key, error = %e, "Ledger update failed");
                    }
                    tracing::debug!(channel, event_key = key, attempt, "Delivered");
                    return Some(DeliveryOutcome::Delivered { attempts: attempt });
                }
                Err(e) if e.is_retryable() && attempt < self.policy.max_attempts => {
                    let delay = self.policy.delay(attempt);
                    tracing::warn!(channel, event_key = key, attempt, error = %e, ?delay, "Delivery failed, retrying");
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => return None,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    let error = e.to_string();
                    tracing::error!(channel, event_key = key, attempt, error = %error, "Delivery failed permanently");
                    if let Err(e) = self.ledger.mark_failed(key, channel, &error, Utc::now()) {
                        tracing::error!(channel, event_key = key, error = %e, "Ledger update failed");
                    }
                    return Some(DeliveryOutcome::Failed {
                        attempts: attempt,
                        error,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::types::{NotificationKind, Priority};
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Records every delivered event key
    #[derive(Default)]
    struct Recorder {
        name: String,
        seen: Mutex<Vec<String>>,
        delay: Duration,
    }

    impl Recorder {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                ..Default::default()
            })
        }

        fn slow(name: &str, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                delay,
                ..Default::default()
            })
        }

        fn counts(&self) -> HashMap<String, usize> {
            let mut counts = HashMap::new();
            for key in self.seen.lock().unwrap().iter() {
                *counts.entry(key.clone()).or_default() += 1;
            }
            counts
        }

        fn len(&self) -> usize {
            self.seen.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Subscriber for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        async fn deliver(&self, notification: &Notification) -> Result<()> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.seen
                .lock()
                .unwrap()
                .push(notification.event_key.clone());
            Ok(())
        }
    }

    /// Always fails with a retryable error
    struct Broken;

    #[async_trait]
    impl Subscriber for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        async fn deliver(&self, _notification: &Notification) -> Result<()> {
            Err(Error::Delivery {
                channel: "broken".to_string(),
                message: "HTTP 503".to_string(),
                retryable: true,
            })
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base: Duration::from_millis(1),
            max: Duration::from_millis(5),
        }
    }

    fn notification(key: &str) -> Notification {
        Notification {
            event_key: key.to_string(),
            session_id: Some("s1".to_string()),
            kind: NotificationKind::ToolError,
            priority: Priority::Normal,
            summary: format!("[ERROR] s1: {}", key),
            timestamp: Utc::now(),
            rollup_count: None,
        }
    }

    async fn wait_for(mut done: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(tokio::time::Instant::now() < deadline, "timed out");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[test]
    fn test_backoff_is_bounded() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base: Duration::from_millis(500),
            max: Duration::from_secs(30),
        };
        assert_eq!(policy.delay(1), Duration::from_millis(500));
        assert_eq!(policy.delay(2), Duration::from_secs(1));
        assert_eq!(policy.delay(4), Duration::from_secs(4));
        assert_eq!(policy.delay(9), Duration::from_secs(30));
        assert_eq!(policy.delay(40), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_slow_or_failing_channel_does_not_block_others() {
        let ledger = Arc::new(NotificationLedger::open_in_memory().unwrap());
        let fast = Recorder::new("fast");
        let slow = Recorder::slow("slow", Duration::from_secs(3));
        let token = CancellationToken::new();
        let subscribers: Vec<Arc<dyn Subscriber>> =
            vec![fast.clone() as Arc<dyn Subscriber>, slow.clone(), Arc::new(Broken)];
        let mut broadcaster = Broadcaster::new(
            subscribers,
            Arc::clone(&ledger),
            policy(),
            16,
            &token,
        );
        let mut reports = broadcaster.take_reports().unwrap();

        for i in 0..5 {
            let outcomes = broadcaster.publish(&notification(&format!("n{}", i)));
            assert!(outcomes.iter().all(|o| o.status == PublishStatus::Enqueued));
        }

        let started = tokio::time::Instant::now();
        wait_for(|| fast.len() == 5).await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(slow.len(), 0);

        // The broken channel gives up after max_attempts and reports it
        let mut failed = 0;
        while failed < 5 {
            let report = tokio::time::timeout(Duration::from_secs(5), reports.recv())
                .await
                .unwrap()
                .unwrap();
            if report.channel == "broken" {
                assert!(matches!(report.outcome, DeliveryOutcome::Failed { attempts: 3, .. }));
                failed += 1;
            }
        }
        let record = ledger.get("n0", "broken").unwrap().unwrap();
        assert_eq!(record.state, DeliveryState::Failed);
        assert_eq!(record.attempts, 3);

        token.cancel();
        broadcaster.shutdown(Duration::ZERO).await;
    }

    #[tokio::test]
    async fn test_publish_is_idempotent_per_channel() {
        let ledger = Arc::new(NotificationLedger::open_in_memory().unwrap());
        let ui = Recorder::new("ui");
        let token = CancellationToken::new();
        let subscribers: Vec<Arc<dyn Subscriber>> = vec![ui.clone() as Arc<dyn Subscriber>];
        let broadcaster =
            Broadcaster::new(subscribers, Arc::clone(&ledger), policy(), 8, &token);

        broadcaster.publish(&notification("once"));
        wait_for(|| ui.len() == 1).await;
        wait_for(|| {
            ledger.get("once", "ui").unwrap().unwrap().state == DeliveryState::Delivered
        })
        .await;

        let outcomes = broadcaster.publish(&notification("once"));
        assert_eq!(outcomes[0].status, PublishStatus::AlreadyDelivered);
        broadcaster.shutdown(Duration::from_secs(1)).await;
        assert_eq!(ui.counts()["once"], 1);
    }

    #[tokio::test]
    async fn test_crash_recovery_delivers_unconfirmed_at_most_twice() {
        let ledger = Arc::new(NotificationLedger::open_in_memory().unwrap());
        let now = Utc::now();

        // State left by a crashed run: "sent" went out but was never
        // confirmed, "queued" never went out, "done" was confirmed.
        let ui = Recorder::new("ui");
        ui.seen.lock().unwrap().push("sent".to_string());
        ui.seen.lock().unwrap().push("done".to_string());
        for key in ["sent", "queued", "done"] {
            ledger.record_pending(&notification(key), "ui", now).unwrap();
        }
        ledger.mark_in_flight("sent", "ui", now).unwrap();
        ledger.mark_in_flight("done", "ui", now).unwrap();
        ledger.mark_delivered("done", "ui", now).unwrap();

        let token = CancellationToken::new();
        let subscribers: Vec<Arc<dyn Subscriber>> = vec![ui.clone() as Arc<dyn Subscriber>];
        let broadcaster =
            Broadcaster::new(subscribers, Arc::clone(&ledger), policy(), 8, &token);
        assert_eq!(broadcaster.recover().await.unwrap(), 2);
        wait_for(|| ui.len() == 4).await;
        broadcaster.shutdown(Duration::from_secs(1)).await;

        let counts = ui.counts();
        assert_eq!(counts["sent"], 2);
        assert_eq!(counts["queued"], 1);
        assert_eq!(counts["done"], 1);
        assert!(ledger.unfinished("ui").unwrap().is_empty());
    }
}
