//! Execution contexts
//!
//! A [`Context`] is one independent run of the application against the
//! shared store, the equivalent of a browser tab. Contexts share nothing in
//! memory: writes reach other contexts' views only through the change journal.
//!
//! A context is driven cooperatively. [`Context::pump`] is one scheduler step:
//! read new journal entries, invalidate matching views, then refresh each
//! stale view once.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::bus::NotificationBus;
use crate::channel::{ChannelNamer, ChannelNaming};
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::item::{generate_tab_id, Item, TabId};
use crate::items;
use crate::journal::OperationKind;
use crate::schema::{AppSchema, ITEMS_TABLE};
use crate::store::Store;
use crate::view::{LiveView, ReactiveView, RefreshOutcome, ViewId};

/// Outcome of one [`Context::pump`] step
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PumpReport {
    /// Journal entries read
    pub delivered: usize,
    /// View invalidations those entries caused
    pub invalidated: usize,
    /// Views that refreshed successfully
    pub refreshed: usize,
    /// Views whose refresh failed
    pub failed: usize,
    /// Journal entries removed by retention
    pub pruned: usize,
    /// Journal cursor after the step
    pub cursor: u64,
}

/// Comparison of a view against the direct query path
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Divergence {
    pub view_count: usize,
    pub direct_count: usize,
    /// Stored ids the view does not show
    pub missing_from_view: Vec<String>,
    /// Ids the view shows that are no longer stored
    pub stale_in_view: Vec<String>,
    /// Ids present on both paths whose row content differs
    pub changed_in_view: Vec<String>,
}

impl Divergence {
    pub fn is_diverged(&self) -> bool {
        !self.missing_from_view.is_empty()
            || !self.stale_in_view.is_empty()
            || !self.changed_in_view.is_empty()
    }
}

/// One execution context attached to a shared store.
pub struct Context {
    tab_id: TabId,
    store: Store,
    bus: NotificationBus,
    views: Mutex<Vec<Arc<dyn LiveView>>>,
    max_batch: usize,
    journal_retention: u64,
    /// Cursor position at the last retention prune
    pruned_at: AtomicU64,
}

impl Context {
    /// Attach to the store described by `config`.
    ///
    /// The bus cursor starts at the current journal head: changes committed
    /// before attaching are visible through queries, not notifications.
    pub fn open(config: &SyncConfig) -> Result<Self> {
        config.validate()?;
        let store = Store::open(&config.store, &AppSchema::default())?;
        let tab_id = config.tab_id.clone().unwrap_or_else(generate_tab_id);
        let head = store.journal_head()?;
        let namer = ChannelNamer::new(config.bus.naming);
        tracing::info!(
            tab = %tab_id,
            naming = %config.bus.naming,
            cursor = head,
            "Context attached"
        );
        Ok(Self {
            bus: NotificationBus::new(namer, tab_id.clone(), head),
            tab_id,
            store,
            views: Mutex::new(Vec::new()),
            max_batch: config.bus.max_batch,
            journal_retention: config.bus.journal_retention,
            pruned_at: AtomicU64::new(head),
        })
    }

    pub fn tab_id(&self) -> &str {
        &self.tab_id
    }

    pub fn naming(&self) -> ChannelNaming {
        self.bus.namer().naming()
    }

    /// Direct access to the store (diagnostic bypass).
    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn bus(&self) -> &NotificationBus {
        &self.bus
    }

    fn views(&self) -> Result<MutexGuard<'_, Vec<Arc<dyn LiveView>>>> {
        self.views
            .lock()
            .map_err(|e| SyncError::Storage(format!("views: {}", e)))
    }

    // ---- writes ----

    /// Insert one item and journal it in the same commit.
    pub fn insert_item(&self, item: &Item) -> Result<u64> {
        self.store.transaction(|tx| {
            items::insert(tx, item)?;
            self.bus
                .publish(tx, ITEMS_TABLE, OperationKind::Insert, &[item.id.clone()])
        })
    }

    /// Insert several items atomically under a single journal entry.
    pub fn insert_items(&self, batch: &[Item]) -> Result<u64> {
        if batch.is_empty() {
            return Err(SyncError::Storage("insert_items: empty batch".into()));
        }
        self.store.transaction(|tx| {
            let mut keys = Vec::with_capacity(batch.len());
            for item in batch {
                items::insert(tx, item)?;
                keys.push(item.id.clone());
            }
            self.bus.publish(tx, ITEMS_TABLE, OperationKind::Insert, &keys)
        })
    }

    /// Create and insert an item stamped with this context's tab id.
    pub fn add_item(&self, name: impl Into<String>) -> Result<Item> {
        let item = Item::new(name, self.tab_id.clone());
        tracing::info!(tab = %self.tab_id, name = %item.name, "Adding item");
        self.insert_item(&item)?;
        Ok(item)
    }

    pub fn rename_item(&self, id: &str, name: &str) -> Result<u64> {
        self.store.transaction(|tx| {
            items::rename(tx, id, name)?;
            self.bus
                .publish(tx, ITEMS_TABLE, OperationKind::Update, &[id.to_string()])
        })
    }

    pub fn delete_item(&self, id: &str) -> Result<u64> {
        self.store.transaction(|tx| {
            items::delete(tx, id)?;
            self.bus
                .publish(tx, ITEMS_TABLE, OperationKind::Delete, &[id.to_string()])
        })
    }

    // ---- direct query path ----

    /// Items straight from the store, newest first. No caching.
    pub fn direct_items(&self) -> Result<Vec<Item>> {
        items::list(&self.store)
    }

    pub fn direct_count(&self) -> Result<usize> {
        items::count(&self.store)
    }

    // ---- reactive views ----

    /// Create a view over `tables`, load it, and subscribe it.
    pub fn watch<T, F>(&self, tables: &[&str], query: F) -> Result<Arc<ReactiveView<T>>>
    where
        T: Send + Sync + 'static,
        F: Fn(&Store) -> Result<Vec<T>> + Send + Sync + 'static,
    {
        let view = Arc::new(ReactiveView::new(tables, query));
        // Subscribe before the initial load so a commit landing in between
        // still invalidates the view.
        self.bus.subscribe(view.clone())?;
        if let Err(e) = view.refresh(&self.store) {
            tracing::warn!(view = view.view_id(), "Initial view load failed: {}", e);
        }
        self.views()?.push(view.clone());
        Ok(view)
    }

    /// Live view of all items, newest first.
    pub fn watch_items(&self) -> Result<Arc<ReactiveView<Item>>> {
        self.watch(&[ITEMS_TABLE], items::list)
    }

    /// Unsubscribe and dispose a view. Disposing twice is a no-op.
    pub fn dispose(&self, view: &dyn LiveView) -> Result<bool> {
        let id = view.view_id();
        let unsubscribed = self.bus.unsubscribe(id)?;
        let disposed = view.dispose();
        self.views()?.retain(|v| v.view_id() != id);
        Ok(unsubscribed || disposed)
    }

    pub fn view_count(&self) -> usize {
        self.views().map(|v| v.len()).unwrap_or(0)
    }

    pub fn is_watching(&self, id: ViewId) -> bool {
        self.bus.is_subscribed(id)
    }

    /// One scheduler step: poll, dispatch, refresh.
    ///
    /// A failing view is logged and counted; it does not stop delivery to,
    /// or refresh of, any other view.
    pub fn pump(&self) -> Result<PumpReport> {
        let mut report = PumpReport::default();
        loop {
            let batch = self.bus.poll(&self.store, self.max_batch)?;
            let full = batch.len() == self.max_batch;
            let delivery = self.bus.deliver(&batch)?;
            report.delivered += delivery.notifications;
            report.invalidated += delivery.invalidated;
            if !full {
                break;
            }
        }

        let views: Vec<Arc<dyn LiveView>> = {
            let mut views = self.views()?;
            views.retain(|v| !v.is_disposed());
            views.iter().filter(|v| v.needs_refresh()).cloned().collect()
        };
        for view in views {
            match view.refresh(&self.store) {
                Ok(RefreshOutcome::Updated) => report.refreshed += 1,
                Ok(_) => {}
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(view = view.view_id(), "View refresh failed: {}", e);
                }
            }
        }

        report.cursor = self.bus.cursor();
        report.pruned = self.enforce_retention(report.cursor);
        Ok(report)
    }

    /// Prune once this context has read `journal_retention` entries since
    /// the last prune. Failures are logged; the next step retries.
    fn enforce_retention(&self, cursor: u64) -> usize {
        let last = self.pruned_at.load(Ordering::SeqCst);
        if cursor.saturating_sub(last) < self.journal_retention {
            return 0;
        }
        match self.prune_journal(self.journal_retention) {
            Ok(removed) => {
                self.pruned_at.store(cursor, Ordering::SeqCst);
                removed
            }
            Err(e) => {
                tracing::warn!(tab = %self.tab_id, "Journal retention prune failed: {}", e);
                0
            }
        }
    }

    /// Compare an item view with the direct query.
    ///
    /// This is the only way a label mismatch shows up: the bus itself never
    /// reports one.
    pub fn diagnose(&self, view: &ReactiveView<Item>) -> Result<Divergence> {
        let stored = self.direct_items()?;
        let shown = view.rows();
        let stored_by_id: HashMap<&str, &Item> =
            stored.iter().map(|i| (i.id.as_str(), i)).collect();
        let stored_ids: HashSet<&str> = stored_by_id.keys().copied().collect();
        let shown_ids: HashSet<&str> = shown.iter().map(|i| i.id.as_str()).collect();

        let mut missing_from_view: Vec<String> = stored_ids
            .difference(&shown_ids)
            .map(|s| s.to_string())
            .collect();
        let mut stale_in_view: Vec<String> = shown_ids
            .difference(&stored_ids)
            .map(|s| s.to_string())
            .collect();
        let mut changed_in_view: Vec<String> = shown
            .iter()
            .filter(|i| stored_by_id.get(i.id.as_str()).is_some_and(|s| **s != **i))
            .map(|i| i.id.clone())
            .collect();
        missing_from_view.sort();
        stale_in_view.sort();
        changed_in_view.sort();

        let divergence = Divergence {
            view_count: shown.len(),
            direct_count: stored.len(),
            missing_from_view,
            stale_in_view,
            changed_in_view,
        };
        if divergence.is_diverged() {
            tracing::warn!(
                tab = %self.tab_id,
                view_count = divergence.view_count,
                direct_count = divergence.direct_count,
                "View diverged from store"
            );
        }
        Ok(divergence)
    }

    /// Trim the journal to its newest `keep_last` entries.
    pub fn prune_journal(&self, keep_last: u64) -> Result<usize> {
        let removed = self.store.transaction(|tx| {
            crate::journal::ChangeJournal::new(tx).prune(keep_last)
        })?;
        tracing::info!(removed, keep_last, "Pruned change journal");
        Ok(removed)
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("tab_id", &self.tab_id)
            .field("store", &self.store)
            .field("bus", &self.bus)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(dir: &tempfile::TempDir, tab: &str) -> Context {
        let mut config = SyncConfig::for_path(dir.path().join("store.db"));
        config.tab_id = Some(tab.into());
        Context::open(&config).unwrap()
    }

    #[test]
    fn own_writes_arrive_on_next_pump() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir, "A");
        let view = ctx.watch_items().unwrap();
        assert!(view.is_empty());

        let item = ctx.add_item("Item 1").unwrap();
        // Not synchronous: the view only catches up on pump
        assert!(view.is_empty());

        let report = ctx.pump().unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(report.refreshed, 1);
        assert_eq!(view.rows()[0].id, item.id);
        assert_eq!(view.rows()[0].tab_id, "A");
    }

    #[test]
    fn failed_write_leaves_no_journal_entry() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir, "A");
        let item = ctx.add_item("Item 1").unwrap();
        let head = ctx.store().journal_head().unwrap();

        let err = ctx.insert_item(&item).unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(ctx.store().journal_head().unwrap(), head);

        let other = Item::new("Item 2", "A");
        let err = ctx.insert_items(&[other.clone(), other]).unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(ctx.direct_count().unwrap(), 1);
        assert_eq!(ctx.store().journal_head().unwrap(), head);
    }

    #[test]
    fn rename_and_delete_flow_to_view() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir, "A");
        let view = ctx.watch_items().unwrap();
        let item = ctx.add_item("Item 1").unwrap();
        ctx.pump().unwrap();

        ctx.rename_item(&item.id, "Renamed").unwrap();
        ctx.pump().unwrap();
        assert_eq!(view.rows()[0].name, "Renamed");

        ctx.delete_item(&item.id).unwrap();
        ctx.pump().unwrap();
        assert!(view.is_empty());
        assert!(matches!(
            ctx.delete_item(&item.id),
            Err(SyncError::NotFound(_))
        ));
    }

    #[test]
    fn dispose_twice_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir, "A");
        let view = ctx.watch_items().unwrap();
        assert_eq!(ctx.view_count(), 1);
        assert!(ctx.dispose(view.as_ref()).unwrap());
        assert!(!ctx.dispose(view.as_ref()).unwrap());
        assert_eq!(ctx.view_count(), 0);

        ctx.add_item("Item 1").unwrap();
        let report = ctx.pump().unwrap();
        assert_eq!(report.invalidated, 0);
        assert!(view.is_empty());
    }

    #[test]
    fn diagnose_reports_missing_rows() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir, "A");
        let view = ctx.watch_items().unwrap();
        let item = ctx.add_item("Item 1").unwrap();

        let before = ctx.diagnose(&view).unwrap();
        assert!(before.is_diverged());
        assert_eq!(before.missing_from_view, vec![item.id.clone()]);

        ctx.pump().unwrap();
        let after = ctx.diagnose(&view).unwrap();
        assert!(!after.is_diverged());
        assert_eq!((after.view_count, after.direct_count), (1, 1));
    }

    #[test]
    fn prune_keeps_delivery_working() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir, "A");
        let view = ctx.watch_items().unwrap();
        for i in 0..4 {
            ctx.add_item(format!("Item {}", i + 1)).unwrap();
        }
        ctx.pump().unwrap();
        assert_eq!(ctx.prune_journal(1).unwrap(), 3);

        ctx.add_item("Item 5").unwrap();
        ctx.pump().unwrap();
        assert_eq!(view.len(), 5);
    }

    #[test]
    fn pump_enforces_journal_retention() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SyncConfig::for_path(dir.path().join("store.db"));
        config.bus.journal_retention = 3;
        let ctx = Context::open(&config).unwrap();
        let view = ctx.watch_items().unwrap();

        for i in 0..2 {
            ctx.add_item(format!("Item {}", i + 1)).unwrap();
        }
        assert_eq!(ctx.pump().unwrap().pruned, 0);

        for i in 2..7 {
            ctx.add_item(format!("Item {}", i + 1)).unwrap();
        }
        let report = ctx.pump().unwrap();
        assert_eq!(report.pruned, 4);
        assert_eq!(ctx.store().with_journal(|j| j.len()).unwrap(), 3);
        assert_eq!(view.len(), 7);
    }
}
