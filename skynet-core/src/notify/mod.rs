//! Notifications: from store deltas to delivered messages
//!
//! ```text
//! Delta ──▶ NotificationEngine ──▶ Dispatch ──▶ Broadcaster ──▶ Subscriber (ui, telegram, ...)
//!           classify, cool-down,                 ledger, per-channel
//!           rate limit, rollups                  queue, retries
//! ```
//!
//! The engine is synchronous and owned by the pipeline task. The broadcaster
//! owns one worker per subscriber.

pub mod broadcast;
pub mod classify;
pub mod engine;
pub mod ledger;
pub mod telegram;
pub mod ui;

pub use broadcast::{
    Broadcaster, ChannelOutcome, DeliveryOutcome, DeliveryReport, PublishStatus, RetryPolicy,
    Subscriber,
};
pub use classify::{classify, Classification, SuppressReason};
pub use engine::{
    Decision, Dispatch, EngineStats, HeldBatch, NotificationEngine, Summarizer, TemplateSummarizer,
    TokenBucket,
};
pub use ledger::NotificationLedger;
pub use telegram::TelegramSubscriber;
pub use ui::UiFeed;
