//! Channel labels for change notifications
//!
//! A publisher tags every journal entry with the label of the table it
//! changed, and a subscriber registers under the label of each table it
//! watches. Delivery only happens when the two strings are equal, so the
//! label for a logical table has to come out byte-identical in every context
//! that opens the store, across restarts.
//!
//! [`ChannelNaming::SchemaDerived`] hashes the declared table name and nothing
//! else. [`ChannelNaming::SessionRandom`] mixes in per-session entropy the way
//! a per-tab tracking table would; two contexts using it never agree on a
//! label, and their views silently stop seeing each other's writes.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Domain prefix mixed into schema-derived label hashes.
const LABEL_DOMAIN: &str = "tabsync/table/";

/// Strategy for turning a table name into a channel label
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelNaming {
    /// Label is a hash of the declared table name
    #[default]
    SchemaDerived,
    /// Label carries a random per-session suffix
    SessionRandom,
}

impl ChannelNaming {
    /// Config/CLI spelling of the strategy.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelNaming::SchemaDerived => "schema_derived",
            ChannelNaming::SessionRandom => "session_random",
        }
    }

    /// Whether labels agree across contexts and restarts.
    pub fn is_deterministic(&self) -> bool {
        matches!(self, ChannelNaming::SchemaDerived)
    }
}

impl fmt::Display for ChannelNaming {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ChannelNaming {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.replace('-', "_").as_str() {
            "schema_derived" => Ok(ChannelNaming::SchemaDerived),
            "session_random" => Ok(ChannelNaming::SessionRandom),
            other => Err(format!("unknown channel naming: {other}")),
        }
    }
}

/// Label a change notification is published and subscribed under
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelLabel(String);

impl ChannelLabel {
    /// Wrap a label read back from the journal.
    pub fn from_stored(label: impl Into<String>) -> Self {
        Self(label.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Computes channel labels for one context.
///
/// The session salt is drawn once per namer and only used by
/// [`ChannelNaming::SessionRandom`].
#[derive(Debug, Clone)]
pub struct ChannelNamer {
    naming: ChannelNaming,
    session_salt: u32,
}

impl ChannelNamer {
    pub fn new(naming: ChannelNaming) -> Self {
        Self {
            naming,
            session_salt: (Uuid::new_v4().as_u128() & 0xffff_ffff) as u32,
        }
    }

    pub fn naming(&self) -> ChannelNaming {
        self.naming
    }

    /// Label for a logical table under this namer's strategy.
    pub fn label(&self, table: &str) -> ChannelLabel {
        match self.naming {
            ChannelNaming::SchemaDerived => schema_label(table),
            ChannelNaming::SessionRandom => {
                ChannelLabel(format!("__{}_tracking_{:08x}", table, self.session_salt))
            }
        }
    }
}

/// Schema-derived label: `<table>:<sha256 hex>`.
///
/// Pure function of the declared table name.
pub fn schema_label(table: &str) -> ChannelLabel {
    let mut hasher = Sha256::new();
    hasher.update(LABEL_DOMAIN.as_bytes());
    hasher.update(table.as_bytes());
    ChannelLabel(format!("{}:{:x}", table, hasher.finalize()))
}
