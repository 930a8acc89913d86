//! Tabsync Core - Change notification across contexts sharing one store
//!
//! Several independent execution contexts (think browser tabs) open the same
//! SQLite file. Each keeps live views over query results, and a write made in
//! any context has to reach the views in every other context.
//!
//! - **Store**: Shared SQLite file holding the `items` table and the journal
//! - **Journal**: Append-only change log written in the writer's transaction
//! - **Channel**: Labels that name a table on the bus
//! - **Bus**: Per-context publish, subscribe, and journal polling
//! - **Registry**: Label to view dispatch
//! - **View**: Live query with coalesced refresh (Idle→Invalidated→Refreshing)
//! - **Context**: One tab: writes, direct queries, views, and the pump
//! - **Config**: Store location, bus timing, and channel naming
//!
//! # Delivery
//!
//! ```text
//! write ─┬─► items row ──────────────┐
//!        └─► journal entry (label) ──┴─ one commit
//!                    │
//!   every context: poll ► registry[label] ► invalidate ► refresh
//! ```
//!
//! A view only hears about a change when the writer's label for the table is
//! the label the reader subscribed under. [`ChannelNaming::SchemaDerived`]
//! guarantees that; [`ChannelNaming::SessionRandom`] salts labels per context
//! and leaves other contexts' views silently stale.

pub mod bus;
pub mod channel;
pub mod config;
pub mod context;
pub mod error;
pub mod item;
pub mod items;
pub mod journal;
pub mod registry;
pub mod schema;
pub mod store;
pub mod view;

pub use bus::{ChangeNotification, DeliveryReport, NotificationBus};
pub use channel::{schema_label, ChannelLabel, ChannelNamer, ChannelNaming};
pub use config::{BusConfig, ConfigError, StoreConfig, SyncConfig};
pub use context::{Context, Divergence, PumpReport};
pub use error::{Result, SyncError};
pub use item::{generate_tab_id, Item, ItemId, TabId};
pub use journal::{ChangeJournal, JournalEntry, OperationKind};
pub use registry::SubscriptionRegistry;
pub use schema::{AppSchema, ColumnDef, ColumnType, TableDef, ITEMS_TABLE, SCHEMA_VERSION};
pub use store::Store;
pub use view::{LiveView, ReactiveView, RefreshOutcome, ViewId, ViewState};

/// Returns the version of tabsync-core
pub fn version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
    }
}
