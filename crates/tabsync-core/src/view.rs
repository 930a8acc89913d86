//! Reactive views
//!
//! A view holds the materialized result of a query and re-runs it after one
//! of its watched tables is notified as changed.
//!
//! State transitions:
//! ```text
//! Idle ──invalidate──▶ Invalidated ──refresh──▶ Refreshing ──▶ Idle
//!                                                   │ invalidate
//!                                                   ▼
//!                                          (pending: back to Invalidated)
//! any ──dispose──▶ Disposed
//! ```
//!
//! Invalidations arriving while a refresh is in flight collapse into a single
//! pending refresh. A result that arrives after disposal is dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::store::Store;

/// Process-unique identifier of a view.
pub type ViewId = u64;

static NEXT_VIEW_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle state of a view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ViewState {
    /// Holding an up-to-date result
    Idle,
    /// A watched table changed; the result is stale
    Invalidated,
    /// The query is running
    Refreshing,
    /// Unsubscribed; never refreshes again
    Disposed,
}

impl ViewState {
    /// Check if a state transition is valid
    pub fn can_transition_to(&self, target: &ViewState) -> bool {
        match (self, target) {
            (ViewState::Disposed, _) => false,
            (_, ViewState::Disposed) => true,
            (ViewState::Idle, ViewState::Invalidated) => true,
            (ViewState::Invalidated, ViewState::Refreshing) => true,
            (ViewState::Refreshing, ViewState::Idle) => true,
            (ViewState::Refreshing, ViewState::Invalidated) => true,
            _ => false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ViewState::Disposed)
    }
}

/// What a call to [`LiveView::refresh`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Nothing was stale
    Skipped,
    /// A new result was stored and published
    Updated,
    /// The view was disposed while the query ran; result dropped
    Discarded,
}

/// Object-safe surface the registry and the context pump work through.
pub trait LiveView: Send + Sync {
    fn view_id(&self) -> ViewId;

    /// Tables this view watches.
    fn tables(&self) -> &[String];

    /// Mark the result stale. Returns false when nothing changed
    /// (already stale, or disposed).
    fn invalidate(&self) -> bool;

    fn needs_refresh(&self) -> bool;

    /// Re-run the query if stale.
    fn refresh(&self, store: &Store) -> Result<RefreshOutcome>;

    /// Move to `Disposed`. Returns false if it already was.
    fn dispose(&self) -> bool;

    fn is_disposed(&self) -> bool;
}

type QueryFn<T> = dyn Fn(&Store) -> Result<Vec<T>> + Send + Sync;

struct ViewCore<T> {
    state: ViewState,
    rows: Arc<Vec<T>>,
    pending: bool,
    loaded: bool,
    refreshes: u64,
    invalidations: u64,
    last_error: Option<String>,
    listeners: Vec<Sender<Arc<Vec<T>>>>,
}

/// A live query over the store.
pub struct ReactiveView<T> {
    id: ViewId,
    tables: Vec<String>,
    query: Box<QueryFn<T>>,
    core: Mutex<ViewCore<T>>,
}

impl<T> ReactiveView<T>
where
    T: Send + Sync + 'static,
{
    /// New view, initially `Invalidated` with an empty result.
    pub fn new<F>(tables: &[&str], query: F) -> Self
    where
        F: Fn(&Store) -> Result<Vec<T>> + Send + Sync + 'static,
    {
        let mut watched: Vec<String> = tables.iter().map(|t| t.to_string()).collect();
        watched.sort();
        watched.dedup();
        Self {
            id: NEXT_VIEW_ID.fetch_add(1, Ordering::Relaxed),
            tables: watched,
            query: Box::new(query),
            core: Mutex::new(ViewCore {
                state: ViewState::Invalidated,
                rows: Arc::new(Vec::new()),
                pending: false,
                loaded: false,
                refreshes: 0,
                invalidations: 0,
                last_error: None,
                listeners: Vec::new(),
            }),
        }
    }

    fn core(&self) -> MutexGuard<'_, ViewCore<T>> {
        // Core fields are plain values; recover from poisoning
        self.core.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current materialized result.
    pub fn rows(&self) -> Arc<Vec<T>> {
        Arc::clone(&self.core().rows)
    }

    pub fn len(&self) -> usize {
        self.core().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn state(&self) -> ViewState {
        self.core().state
    }

    /// True until the first refresh completes.
    pub fn is_loading(&self) -> bool {
        !self.core().loaded
    }

    /// Completed refreshes, initial load included.
    pub fn refresh_count(&self) -> u64 {
        self.core().refreshes
    }

    /// Notifications that actually changed the state.
    pub fn invalidation_count(&self) -> u64 {
        self.core().invalidations
    }

    /// Error from the most recent refresh, cleared by the next success.
    pub fn last_error(&self) -> Option<String> {
        self.core().last_error.clone()
    }

    /// Receive every new result from now on.
    pub fn listen(&self) -> Receiver<Arc<Vec<T>>> {
        let (tx, rx) = mpsc::channel();
        self.core().listeners.push(tx);
        rx
    }

    /// Claim the refresh slot. `false` if nothing to do.
    fn begin_refresh(&self) -> bool {
        let mut core = self.core();
        if core.state != ViewState::Invalidated {
            return false;
        }
        debug_assert!(core.state.can_transition_to(&ViewState::Refreshing));
        core.state = ViewState::Refreshing;
        core.pending = false;
        true
    }

    /// Publish the outcome of a query started by `begin_refresh`.
    fn complete_refresh(&self, result: Result<Vec<T>>) -> Result<RefreshOutcome> {
        let mut core = self.core();
        if core.state == ViewState::Disposed {
            tracing::debug!(view = self.id, "Dropping refresh result for disposed view");
            return Ok(RefreshOutcome::Discarded);
        }
        let next = if core.pending {
            ViewState::Invalidated
        } else {
            ViewState::Idle
        };
        debug_assert!(core.state.can_transition_to(&next));
        core.pending = false;
        core.state = next;

        match result {
            Ok(rows) => {
                let rows = Arc::new(rows);
                core.rows = Arc::clone(&rows);
                core.loaded = true;
                core.refreshes += 1;
                core.last_error = None;
                // Ignore send errors (listener may be dropped)
                core.listeners.retain(|tx| tx.send(Arc::clone(&rows)).is_ok());
                tracing::debug!(
                    view = self.id,
                    rows = rows.len(),
                    state = ?next,
                    "View refreshed"
                );
                Ok(RefreshOutcome::Updated)
            }
            Err(e) => {
                core.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }
}

impl<T> LiveView for ReactiveView<T>
where
    T: Send + Sync + 'static,
{
    fn view_id(&self) -> ViewId {
        self.id
    }

    fn tables(&self) -> &[String] {
        &self.tables
    }

    fn invalidate(&self) -> bool {
        let mut core = self.core();
        let changed = match core.state {
            ViewState::Idle => {
                debug_assert!(core.state.can_transition_to(&ViewState::Invalidated));
                core.state = ViewState::Invalidated;
                true
            }
            ViewState::Refreshing if !core.pending => {
                core.pending = true;
                true
            }
            ViewState::Refreshing | ViewState::Invalidated | ViewState::Disposed => false,
        };
        if changed {
            core.invalidations += 1;
        }
        changed
    }

    fn needs_refresh(&self) -> bool {
        self.core().state == ViewState::Invalidated
    }

    fn refresh(&self, store: &Store) -> Result<RefreshOutcome> {
        if !self.begin_refresh() {
            return Ok(RefreshOutcome::Skipped);
        }
        // Query runs without holding the view lock
        let result = (self.query)(store);
        self.complete_refresh(result)
    }

    fn dispose(&self) -> bool {
        let mut core = self.core();
        if core.state.is_terminal() {
            return false;
        }
        debug_assert!(core.state.can_transition_to(&ViewState::Disposed));
        core.state = ViewState::Disposed;
        core.pending = false;
        core.listeners.clear();
        true
    }

    fn is_disposed(&self) -> bool {
        self.core().state.is_terminal()
    }
}

impl<T> std::fmt::Debug for ReactiveView<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReactiveView")
            .field("id", &self.id)
            .field("tables", &self.tables)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counting_view() -> ReactiveView<u32> {
        ReactiveView::new(&["items"], |_store| Ok(vec![1, 2, 3]))
    }

    #[test]
    fn test_view_state_transitions() {
        let state = ViewState::Idle;
        assert!(state.can_transition_to(&ViewState::Invalidated));
        assert!(!state.can_transition_to(&ViewState::Refreshing));
        assert!(ViewState::Refreshing.can_transition_to(&ViewState::Invalidated));
        assert!(ViewState::Invalidated.can_transition_to(&ViewState::Disposed));
        assert!(!ViewState::Disposed.can_transition_to(&ViewState::Idle));
        assert!(ViewState::Disposed.is_terminal());
    }

    #[test]
    fn initial_refresh_loads() {
        let store = Store::open_in_memory().unwrap();
        let view = counting_view();
        assert!(view.is_loading());
        assert!(view.needs_refresh());
        assert_eq!(view.refresh(&store).unwrap(), RefreshOutcome::Updated);
        assert_eq!(view.state(), ViewState::Idle);
        assert_eq!(*view.rows(), vec![1, 2, 3]);
        assert!(!view.is_loading());
        // Nothing stale now
        assert_eq!(view.refresh(&store).unwrap(), RefreshOutcome::Skipped);
    }

    #[test]
    fn repeated_invalidation_coalesces() {
        let store = Store::open_in_memory().unwrap();
        let view = counting_view();
        view.refresh(&store).unwrap();
        assert!(view.invalidate());
        assert!(!view.invalidate());
        assert!(!view.invalidate());
        view.refresh(&store).unwrap();
        assert_eq!(view.refresh_count(), 2);
        assert_eq!(view.invalidation_count(), 1);
    }

    #[test]
    fn invalidation_during_refresh_leaves_one_pending() {
        let view = counting_view();
        assert!(view.begin_refresh());
        assert_eq!(view.state(), ViewState::Refreshing);
        assert!(view.invalidate());
        assert!(!view.invalidate());
        view.complete_refresh(Ok(vec![7])).unwrap();
        // One follow-up refresh, not two
        assert_eq!(view.state(), ViewState::Invalidated);
        assert_eq!(*view.rows(), vec![7]);
        assert!(view.begin_refresh());
        view.complete_refresh(Ok(vec![8])).unwrap();
        assert_eq!(view.state(), ViewState::Idle);
    }

    #[test]
    fn disposal_discards_in_flight_result() {
        let view = counting_view();
        let rx = view.listen();
        assert!(view.begin_refresh());
        assert!(view.dispose());
        assert_eq!(
            view.complete_refresh(Ok(vec![9])).unwrap(),
            RefreshOutcome::Discarded
        );
        assert!(view.rows().is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn dispose_is_idempotent_and_final() {
        let store = Store::open_in_memory().unwrap();
        let view = counting_view();
        assert!(view.dispose());
        assert!(!view.dispose());
        assert!(!view.invalidate());
        assert_eq!(view.refresh(&store).unwrap(), RefreshOutcome::Skipped);
        assert!(view.is_disposed());
    }

    #[test]
    fn listeners_receive_results() {
        let store = Store::open_in_memory().unwrap();
        let view = counting_view();
        let rx = view.listen();
        view.refresh(&store).unwrap();
        assert_eq!(*rx.try_recv().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn failed_refresh_keeps_previous_rows() {
        let store = Store::open_in_memory().unwrap();
        let view: ReactiveView<String> = ReactiveView::new(&["items"], |store| {
            store.get_all("SELECT name FROM missing_table", [], |row| row.get(0))
        });
        assert!(view.refresh(&store).is_err());
        assert_eq!(view.state(), ViewState::Idle);
        assert!(view.last_error().is_some());
        assert!(view.is_loading());
    }

    #[test]
    fn watched_tables_are_deduplicated() {
        let view: ReactiveView<u8> = ReactiveView::new(&["items", "items"], |_| Ok(vec![]));
        assert_eq!(view.tables(), &["items".to_string()]);
        assert_ne!(view.view_id(), counting_view().view_id());
    }
}
