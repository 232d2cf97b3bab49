//! Notification delivery ledger
//!
//! One record per `(event_key, channel)`, written before the first delivery
//! attempt. The record's state is what survives a crash:
//!
//! | State | On restart |
//! |-------|------------|
//! | `pending` | delivered again |
//! | `in_flight` | delivered again (the one accepted duplicate) |
//! | `delivered` | skipped |
//! | `failed` | skipped |

use crate::db::Database;
use crate::error::Result;
use crate::types::{DeliveryState, Notification, NotificationRecord};
use chrono::{DateTime, Utc};

/// Durable per-channel delivery state
pub struct NotificationLedger {
    db: Database,
}

impl NotificationLedger {
    /// Wrap a database handle; runs migrations
    pub fn new(db: Database) -> Result<Self> {
        db.migrate()?;
        Ok(Self { db })
    }

    /// Ephemeral ledger (tests, dry runs)
    pub fn open_in_memory() -> Result<Self> {
        Self::new(Database::open_in_memory()?)
    }

    /// Record a notification for `channel` unless it already has a record.
    ///
    /// Returns the state now stored.
    pub fn record_pending(
        &self,
        notification: &Notification,
        channel: &str,
        now: DateTime<Utc>,
    ) -> Result<DeliveryState> {
        self.db.insert_notification_record(notification, channel, now)
    }

    /// An attempt is about to start
    pub fn mark_in_flight(&self, event_key: &str, channel: &str, now: DateTime<Utc>) -> Result<()> {
        self.db
            .update_notification_state(event_key, channel, DeliveryState::InFlight, None, now)
    }

    pub fn mark_delivered(&self, event_key: &str, channel: &str, now: DateTime<Utc>) -> Result<()> {
        self.db
            .update_notification_state(event_key, channel, DeliveryState::Delivered, None, now)
    }

    pub fn mark_failed(
        &self,
        event_key: &str,
        channel: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.db.update_notification_state(
            event_key,
            channel,
            DeliveryState::Failed,
            Some(error),
            now,
        )
    }

    pub fn get(&self, event_key: &str, channel: &str) -> Result<Option<NotificationRecord>> {
        self.db.get_notification_record(event_key, channel)
    }

    /// Records of `channel` a restart must deliver again, oldest first
    pub fn unfinished(&self, channel: &str) -> Result<Vec<NotificationRecord>> {
        self.db.unfinished_notification_records(channel)
    }

    /// Most recent records across all channels
    pub fn recent(&self, limit: usize) -> Result<Vec<NotificationRecord>> {
        self.db.recent_notification_records(limit)
    }
}
