//! Notification bus
//!
//! The journal is the only medium shared between contexts, so it doubles as
//! the broadcast channel: `publish` labels a change and appends it inside the
//! writer's transaction, and every context `poll`s the journal from its own
//! cursor and hands new entries to its registry. Delivery is fire-and-forget;
//! an entry whose label no local view is registered under is skipped without
//! a trace.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::Connection;

use crate::channel::{ChannelLabel, ChannelNamer};
use crate::error::{Result, SyncError};
use crate::journal::{ChangeJournal, ChangeRecord, JournalEntry, OperationKind};
use crate::registry::SubscriptionRegistry;
use crate::store::Store;
use crate::view::{LiveView, ViewId};

/// A change delivered to subscribers.
pub type ChangeNotification = JournalEntry;

/// Outcome of one `deliver` call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Notifications handed to the registry
    pub notifications: usize,
    /// View invalidations those notifications caused
    pub invalidated: usize,
}

/// One context's end of the notification bus.
pub struct NotificationBus {
    namer: ChannelNamer,
    origin: String,
    registry: Mutex<SubscriptionRegistry>,
    cursor: AtomicU64,
}

impl NotificationBus {
    /// New bus whose cursor starts at `start_after`; nothing at or before
    /// it is ever delivered.
    pub fn new(namer: ChannelNamer, origin: impl Into<String>, start_after: u64) -> Self {
        Self {
            namer,
            origin: origin.into(),
            registry: Mutex::new(SubscriptionRegistry::new()),
            cursor: AtomicU64::new(start_after),
        }
    }

    pub fn namer(&self) -> &ChannelNamer {
        &self.namer
    }

    /// Label this bus publishes and subscribes `table` under.
    pub fn channel_for(&self, table: &str) -> ChannelLabel {
        self.namer.label(table)
    }

    /// Last journal sequence number this bus has consumed.
    pub fn cursor(&self) -> u64 {
        self.cursor.load(Ordering::SeqCst)
    }

    fn registry(&self) -> Result<MutexGuard<'_, SubscriptionRegistry>> {
        self.registry
            .lock()
            .map_err(|e| SyncError::Storage(format!("registry: {}", e)))
    }

    /// Journal a change to `table` on `conn`, normally the writer's open
    /// transaction. Returns the entry's sequence number.
    pub fn publish(
        &self,
        conn: &Connection,
        table: &str,
        op: OperationKind,
        keys: &[String],
    ) -> Result<u64> {
        let channel = self.channel_for(table);
        let seq = ChangeJournal::new(conn).append(&ChangeRecord {
            channel: &channel,
            table,
            op,
            keys,
            origin: &self.origin,
        })?;
        tracing::debug!(seq, table, %op, keys = keys.len(), channel = %channel, "Published change");
        Ok(seq)
    }

    /// Register `view` under the labels of all of its tables.
    pub fn subscribe(&self, view: Arc<dyn LiveView>) -> Result<ViewId> {
        let id = view.view_id();
        let channels: Vec<ChannelLabel> =
            view.tables().iter().map(|t| self.channel_for(t)).collect();
        tracing::debug!(view = id, channels = channels.len(), "Subscribed view");
        self.registry()?.register(view, channels);
        Ok(id)
    }

    /// Remove a view. Unsubscribing twice is a no-op.
    pub fn unsubscribe(&self, id: ViewId) -> Result<bool> {
        Ok(self.registry()?.unregister(id))
    }

    pub fn is_subscribed(&self, id: ViewId) -> bool {
        self.registry()
            .map(|r| r.is_registered(id))
            .unwrap_or(false)
    }

    pub fn subscriber_count(&self, table: &str) -> usize {
        let channel = self.channel_for(table);
        self.registry()
            .map(|r| r.subscriber_count(&channel))
            .unwrap_or(0)
    }

    /// Read up to `limit` entries past the cursor and advance it.
    pub fn poll(&self, store: &Store, limit: usize) -> Result<Vec<ChangeNotification>> {
        let after = self.cursor();
        let entries = store.with_journal(|j| j.entries_after(after, limit))?;
        if let Some(last) = entries.last() {
            self.cursor.fetch_max(last.seq, Ordering::SeqCst);
        }
        Ok(entries)
    }

    /// Dispatch each notification to the registry.
    pub fn deliver(&self, notifications: &[ChangeNotification]) -> Result<DeliveryReport> {
        let mut registry = self.registry()?;
        let mut report = DeliveryReport::default();
        for note in notifications {
            report.notifications += 1;
            report.invalidated += registry.dispatch(&note.channel);
        }
        if report.invalidated > 0 {
            tracing::debug!(
                notifications = report.notifications,
                invalidated = report.invalidated,
                "Delivered changes"
            );
        }
        Ok(report)
    }
}

impl std::fmt::Debug for NotificationBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationBus")
            .field("naming", &self.namer.naming())
            .field("origin", &self.origin)
            .field("cursor", &self.cursor())
            .finish()
    }
}
