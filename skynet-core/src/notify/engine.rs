//! Notification engine: classification, dedup and per-channel rate limiting
//!
//! The engine turns store deltas into at most one notification per logical
//! occurrence and decides which channels get it now.
//!
//! - **Cool-down**: a `(session, kind)` pair that was notified less than the
//!   cool-down ago is dropped. The window is anchored at the notification that
//!   opened it; repeats inside it do not extend it. High-priority kinds are
//!   exempt.
//! - **Rate limit**: each channel has a token bucket holding `rate_per_hour`
//!   tokens and refilling continuously. Without a token, the notification is
//!   held in the channel's rollup buffer instead of being dropped.
//! - **Rollups**: [`NotificationEngine::tick`] runs on a schedule. When a
//!   channel has held items and a token again, they leave as one rollup.
//!   A channel only keeps counts of what it holds, never the items.
//! - **Shutdown**: [`NotificationEngine::flush`] hands out every buffer as a
//!   rollup regardless of tokens, so it can be recorded for the next start.
//!
//! All timing takes an explicit `now`; nothing here sleeps.

use super::classify::{classify, Classification, SuppressReason};
use crate::config::{ChannelConfig, NotificationConfig};
use crate::format::{project_name, short_id, truncate};
use crate::types::{Delta, Notification, NotificationKind, Priority};
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap};

/// Longest content excerpt in a summary
const SUMMARY_CONTENT_MAX: usize = 200;

/// Renders notification text
pub trait Summarizer: Send {
    /// Summary of a single notification
    fn summarize(&self, kind: NotificationKind, delta: &Delta) -> String;

    /// Summary of a rollup standing in for `held`
    fn rollup(&self, held: &HeldBatch) -> String;
}

/// `[TAG] shortid - project: content`
#[derive(Debug, Default, Clone)]
pub struct TemplateSummarizer;

impl TemplateSummarizer {
    fn tag(kind: NotificationKind) -> &'static str {
        match kind {
            NotificationKind::SessionFailed => "FAILED",
            NotificationKind::NeedsInput => "INPUT",
            NotificationKind::ToolError => "ERROR",
            NotificationKind::WaitingForInput => "WAITING",
            NotificationKind::Question => "QUESTION",
            NotificationKind::SessionCompleted => "DONE",
            NotificationKind::Rollup => "ROLLUP",
        }
    }
}

impl Summarizer for TemplateSummarizer {
    fn summarize(&self, kind: NotificationKind, delta: &Delta) -> String {
        let message = delta.message.as_ref();
        let content = match kind {
            NotificationKind::SessionFailed => delta
                .detail
                .clone()
                .or_else(|| delta.transition.map(|t| t.reason.as_str().to_string()))
                .unwrap_or_default(),
            NotificationKind::NeedsInput => {
                let name = message.and_then(|m| m.tool_name.as_deref()).unwrap_or("tool");
                let input = message
                    .and_then(|m| m.tool_input.as_ref())
                    .map(|v| v.to_string())
                    .unwrap_or_default();
                format!("{} {}", name, input)
            }
            NotificationKind::ToolError | NotificationKind::Question => message
                .and_then(|m| m.text.clone())
                .unwrap_or_default(),
            NotificationKind::WaitingForInput => "waiting for input".to_string(),
            NotificationKind::SessionCompleted => "session completed".to_string(),
            NotificationKind::Rollup => String::new(),
        };

        let mut header = format!("[{}] {}", Self::tag(kind), short_id(&delta.session_id));
        if let Some(cwd) = &delta.cwd {
            header.push_str(" - ");
            header.push_str(project_name(cwd));
        }
        let content = truncate(&content, SUMMARY_CONTENT_MAX);
        if content.is_empty() {
            header
        } else {
            format!("{}: {}", header, content)
        }
    }

    fn rollup(&self, held: &HeldBatch) -> String {
        let parts: Vec<String> = held
            .counts()
            .iter()
            .map(|(kind, count)| format!("{} {}", count, kind.label()))
            .collect();
        format!(
            "[{}] {} held back by the rate limit: {}",
            Self::tag(NotificationKind::Rollup),
            held.total(),
            parts.join(", ")
        )
    }
}

/// Engine decision for one delta
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Suppress(SuppressReason),
    Notify {
        kind: NotificationKind,
        priority: Priority,
        summary: String,
    },
}

/// A notification bound for one channel
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    pub channel: String,
    pub notification: Notification,
}

/// Engine counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Notifications approved (once per occurrence, regardless of channels)
    pub emitted: u64,
    pub suppressed: u64,
    /// Per-channel notifications parked in a rollup buffer
    pub held: u64,
    pub rollups: u64,
}

/// Continuous-refill token bucket
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last: Option<DateTime<Utc>>,
}

impl TokenBucket {
    /// A full bucket allowing `per_hour` takes per rolling hour
    pub fn per_hour(per_hour: u32) -> Self {
        let capacity = f64::from(per_hour.max(1));
        Self {
            capacity,
            tokens: capacity,
            refill_per_sec: capacity / 3600.0,
            last: None,
        }
    }

    fn refill(&mut self, now: DateTime<Utc>) {
        if let Some(last) = self.last {
            let elapsed = (now - last).num_milliseconds().max(0) as f64 / 1000.0;
            self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        }
        self.last = Some(self.last.map_or(now, |last| last.max(now)));
    }

    /// Take one token if available
    pub fn try_take(&mut self, now: DateTime<Utc>) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// What one channel is holding back
#[derive(Debug, Clone, Default)]
pub struct HeldBatch {
    counts: BTreeMap<NotificationKind, usize>,
    priority: Priority,
    /// Shared by every held item, `None` once sessions mix
    session_id: Option<String>,
    /// Kept while it is the only item, so it can leave as itself
    sole: Option<Notification>,
    /// Holds an item whose key the ledger already settled
    deferred: bool,
}

impl HeldBatch {
    /// Occurrences per kind
    pub fn counts(&self) -> &BTreeMap<NotificationKind, usize> {
        &self.counts
    }

    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    fn push(&mut self, notification: Notification, deferred: bool) {
        let first = self.is_empty();
        *self.counts.entry(notification.kind).or_default() +=
            notification.rollup_count.unwrap_or(1);
        self.priority = self.priority.max(notification.priority);
        self.deferred |= deferred;
        if first {
            self.session_id = notification.session_id.clone();
            self.sole = Some(notification);
        } else {
            if self.session_id != notification.session_id {
                self.session_id = None;
            }
            self.sole = None;
        }
    }

    /// The notification standing in for the batch, and whether it is a rollup
    fn release(
        mut self,
        channel: &str,
        summarizer: &dyn Summarizer,
        now: DateTime<Utc>,
    ) -> (Notification, bool) {
        if !self.deferred {
            if let Some(sole) = self.sole.take() {
                return (sole, false);
            }
        }
        let notification = Notification {
            event_key: format!("rollup:{}:{}", channel, uuid::Uuid::new_v4()),
            session_id: self.session_id.clone(),
            kind: NotificationKind::Rollup,
            priority: self.priority,
            summary: summarizer.rollup(&self),
            timestamp: now,
            rollup_count: Some(self.total()),
        };
        (notification, true)
    }
}

struct ChannelState {
    bucket: TokenBucket,
    muted: bool,
    held: HeldBatch,
}

impl ChannelState {
    fn new(config: &ChannelConfig) -> Self {
        Self {
            bucket: TokenBucket::per_hour(config.rate_per_hour),
            muted: config.muted,
            held: HeldBatch::default(),
        }
    }
}

/// Classifies deltas and meters notifications per channel
pub struct NotificationEngine {
    attention_tools: Vec<String>,
    min_priority: Priority,
    cooldown: Duration,
    summarizer: Box<dyn Summarizer>,
    /// Start of the open cool-down window per `(session, kind)`
    windows: HashMap<(String, NotificationKind), DateTime<Utc>>,
    channels: BTreeMap<String, ChannelState>,
    stats: EngineStats,
}

impl NotificationEngine {
    /// Build an engine delivering to `channels` (subscriber names)
    pub fn new(config: &NotificationConfig, channels: &[String]) -> Self {
        let channels = channels
            .iter()
            .map(|name| (name.clone(), ChannelState::new(&config.channel(name))))
            .collect();
        Self {
            attention_tools: config.attention_tools.clone(),
            min_priority: config.min_priority,
            cooldown: config.cooldown(),
            summarizer: Box::new(TemplateSummarizer),
            windows: HashMap::new(),
            channels,
            stats: EngineStats::default(),
        }
    }

    /// Replace the default summarizer
    pub fn with_summarizer(mut self, summarizer: Box<dyn Summarizer>) -> Self {
        self.summarizer = summarizer;
        self
    }

    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    /// Notifications currently parked for `channel`
    pub fn held(&self, channel: &str) -> usize {
        self.channels.get(channel).map_or(0, |c| c.held.total())
    }

    /// Classification and summary, before dedup and rate limiting
    pub fn classify(&self, delta: &Delta) -> Decision {
        match classify(delta, &self.attention_tools) {
            Classification::Suppress(reason) => Decision::Suppress(reason),
            Classification::Notify { priority, .. } if priority < self.min_priority => {
                Decision::Suppress(SuppressReason::BelowThreshold)
            }
            Classification::Notify { kind, priority } => Decision::Notify {
                kind,
                priority,
                summary: self.summarizer.summarize(kind, delta),
            },
        }
    }

    /// Process one delta. Returns the dispatches allowed right now.
    pub fn process_at(&mut self, delta: &Delta, now: DateTime<Utc>) -> Vec<Dispatch> {
        let (kind, priority, summary) = match self.classify(delta) {
            Decision::Suppress(reason) => return self.suppress(delta, reason),
            Decision::Notify {
                kind,
                priority,
                summary,
            } => (kind, priority, summary),
        };

        // Checked first so a muted occurrence does not open a cool-down window
        if self.channels.values().all(|c| c.muted) {
            return self.suppress(delta, SuppressReason::Muted);
        }

        if priority < Priority::High {
            let key = (delta.session_id.clone(), kind);
            match self.windows.get(&key) {
                Some(opened) if now - *opened < self.cooldown => {
                    return self.suppress(delta, SuppressReason::Cooldown);
                }
                _ => {
                    self.windows.insert(key, now);
                }
            }
        }

        let notification = Notification {
            event_key: event_key(delta),
            session_id: Some(delta.session_id.clone()),
            kind,
            priority,
            summary,
            timestamp: delta.occurred_at,
            rollup_count: None,
        };
        self.stats.emitted += 1;
        tracing::info!(
            event_key = %notification.event_key,
            kind = %kind,
            priority = %priority,
            "Notification approved"
        );

        let mut dispatches = Vec::new();
        for (name, channel) in self.channels.iter_mut() {
            if channel.muted {
                continue;
            }
            // Keep order: once a channel is holding, newer items queue behind
            if channel.held.is_empty() && channel.bucket.try_take(now) {
                dispatches.push(Dispatch {
                    channel: name.clone(),
                    notification: notification.clone(),
                });
            } else {
                tracing::debug!(channel = %name, event_key = %notification.event_key, "Rate limited, holding for rollup");
                channel.held.push(notification.clone(), false);
                self.stats.held += 1;
            }
        }
        dispatches
    }

    fn suppress(&mut self, delta: &Delta, reason: SuppressReason) -> Vec<Dispatch> {
        self.stats.suppressed += 1;
        tracing::trace!(session_id = %delta.session_id, reason = reason.as_str(), "Delta suppressed");
        Vec::new()
    }

    /// Release held notifications of channels that have a token again
    pub fn tick(&mut self, now: DateTime<Utc>) -> Vec<Dispatch> {
        let cooldown = self.cooldown;
        self.windows.retain(|_, opened| now - *opened < cooldown);

        self.release(now, false)
    }

    /// Hand out everything held, tokens or not. Used at shutdown.
    pub fn flush(&mut self, now: DateTime<Utc>) -> Vec<Dispatch> {
        self.release(now, true)
    }

    fn release(&mut self, now: DateTime<Utc>, force: bool) -> Vec<Dispatch> {
        let mut dispatches = Vec::new();
        for (name, channel) in self.channels.iter_mut() {
            if channel.held.is_empty() || channel.muted {
                continue;
            }
            if !force && !channel.bucket.try_take(now) {
                continue;
            }
            let held = std::mem::take(&mut channel.held);
            let (notification, rollup) = held.release(name, self.summarizer.as_ref(), now);
            if rollup {
                self.stats.rollups += 1;
            }
            tracing::info!(channel = %name, event_key = %notification.event_key, count = notification.rollup_count.unwrap_or(1), "Releasing held notifications");
            dispatches.push(Dispatch {
                channel: name.clone(),
                notification,
            });
        }
        dispatches
    }

    /// Park a notification whose delivery failed so it joins the next rollup.
    ///
    /// The rollup gets a fresh key, so the ledger does not see it as settled.
    pub fn defer(&mut self, channel: &str, notification: Notification) {
        match self.channels.get_mut(channel) {
            Some(state) => {
                state.held.push(notification, true);
                self.stats.held += 1;
            }
            None => tracing::warn!(channel, "Cannot defer to unknown channel"),
        }
    }

    /// Mute or unmute a channel. Returns `false` for unknown channels.
    ///
    /// Muting drops whatever the channel was holding.
    pub fn set_muted(&mut self, channel: &str, muted: bool) -> bool {
        let Some(state) = self.channels.get_mut(channel) else {
            return false;
        };
        state.muted = muted;
        if muted {
            state.held = HeldBatch::default();
        }
        tracing::info!(channel, muted, "Channel mute changed");
        true
    }
}

/// Key of the occurrence a delta describes; stable across re-processing
fn event_key(delta: &Delta) -> String {
    if let Some(message) = &delta.message {
        return message.event_id.clone();
    }
    let to = delta
        .transition
        .map(|t| t.to.as_str())
        .unwrap_or("none");
    format!(
        "{}:status:{}:{}",
        delta.session_id,
        to,
        delta.last_event_id.as_deref().unwrap_or("-")
    )
}
