//! Change journal: the ordered record of committed mutations
//!
//! Entries are appended through the same connection (and transaction) as the
//! mutation they describe, so a failed commit never leaves an entry behind.
//! `seq` comes from an `AUTOINCREMENT` key: strictly increasing per store and
//! never reused, even after pruning.

use std::fmt;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use crate::channel::ChannelLabel;
use crate::error::{Result, SyncError};
use crate::item::{format_timestamp, parse_timestamp};

/// Kind of mutation recorded in the journal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Insert => "insert",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "insert" => Some(OperationKind::Insert),
            "update" => Some(OperationKind::Update),
            "delete" => Some(OperationKind::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A committed journal entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub seq: u64,
    pub channel: ChannelLabel,
    pub table: String,
    pub op: OperationKind,
    pub keys: Vec<String>,
    pub origin: String,
    pub committed_at: DateTime<Utc>,
}

/// A change about to be journaled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRecord<'a> {
    pub channel: &'a ChannelLabel,
    pub table: &'a str,
    pub op: OperationKind,
    pub keys: &'a [String],
    pub origin: &'a str,
}

/// Journal operations over a borrowed connection or transaction.
pub struct ChangeJournal<'c> {
    conn: &'c Connection,
}

impl<'c> ChangeJournal<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// Append an entry and return its sequence number.
    pub fn append(&self, change: &ChangeRecord<'_>) -> Result<u64> {
        let keys_json = serde_json::to_string(change.keys)?;
        self.conn
            .execute(
                "INSERT INTO change_journal (channel, table_name, op, keys, origin, committed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    change.channel.as_str(),
                    change.table,
                    change.op.as_str(),
                    keys_json,
                    change.origin,
                    format_timestamp(&Utc::now()),
                ],
            )
            .map_err(|e| SyncError::Journal(format!("append: {}", e)))?;
        Ok(self.conn.last_insert_rowid() as u64)
    }

    /// Highest sequence number ever assigned, 0 for a fresh store.
    pub fn head(&self) -> Result<u64> {
        let head: i64 = self
            .conn
            .query_row(
                "SELECT COALESCE(
                    (SELECT seq FROM sqlite_sequence WHERE name = 'change_journal'),
                    0)",
                [],
                |row| row.get(0),
            )
            .map_err(|e| SyncError::Journal(format!("head: {}", e)))?;
        Ok(head as u64)
    }

    /// Entries with `seq > after`, oldest first, at most `limit` of them.
    pub fn entries_after(&self, after: u64, limit: usize) -> Result<Vec<JournalEntry>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT seq, channel, table_name, op, keys, origin, committed_at
                 FROM change_journal WHERE seq > ?1 ORDER BY seq ASC LIMIT ?2",
            )
            .map_err(|e| SyncError::Journal(format!("prepare entries: {}", e)))?;
        let rows = stmt
            .query_map(params![after as i64, limit as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })
            .map_err(|e| SyncError::Journal(format!("query entries: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| SyncError::Journal(format!("collect entries: {}", e)))?;

        let mut entries = Vec::with_capacity(rows.len());
        for (seq, channel, table, op, keys, origin, committed_at) in rows {
            let op = OperationKind::parse(&op)
                .ok_or_else(|| SyncError::Journal(format!("unknown op '{}' at seq {}", op, seq)))?;
            let keys: Vec<String> = serde_json::from_str(&keys)
                .map_err(|e| SyncError::Journal(format!("parse keys at seq {}: {}", seq, e)))?;
            let committed_at = parse_timestamp(&committed_at).ok_or_else(|| {
                SyncError::Journal(format!("bad timestamp at seq {}: {}", seq, committed_at))
            })?;
            entries.push(JournalEntry {
                seq: seq as u64,
                channel: ChannelLabel::from_stored(channel),
                table,
                op,
                keys,
                origin,
                committed_at,
            });
        }
        Ok(entries)
    }

    /// Number of entries currently retained.
    pub fn len(&self) -> Result<u64> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM change_journal", [], |row| row.get(0))
            .map_err(|e| SyncError::Journal(format!("count: {}", e)))?;
        Ok(n as u64)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Drop all but the newest `keep_last` entries. Returns rows removed.
    ///
    /// The head is unaffected; new entries keep counting from it.
    pub fn prune(&self, keep_last: u64) -> Result<usize> {
        let head = self.head()?;
        let cutoff = head.saturating_sub(keep_last);
        self.conn
            .execute(
                "DELETE FROM change_journal WHERE seq <= ?1",
                params![cutoff as i64],
            )
            .map_err(|e| SyncError::Journal(format!("prune: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::schema_label;
    use crate::schema::AppSchema;

    fn journal_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(&AppSchema::items().create_tables()).unwrap();
        conn
    }

    fn append(journal: &ChangeJournal<'_>, op: OperationKind, key: &str) -> u64 {
        let label = schema_label("items");
        let keys = vec![key.to_string()];
        journal
            .append(&ChangeRecord {
                channel: &label,
                table: "items",
                op,
                keys: &keys,
                origin: "tab-a",
            })
            .unwrap()
    }

    #[test]
    fn sequence_numbers_increase() {
        let conn = journal_conn();
        let journal = ChangeJournal::new(&conn);
        assert_eq!(journal.head().unwrap(), 0);
        let a = append(&journal, OperationKind::Insert, "1");
        let b = append(&journal, OperationKind::Update, "1");
        let c = append(&journal, OperationKind::Delete, "1");
        assert!(a < b && b < c);
        assert_eq!(journal.head().unwrap(), c);
    }

    #[test]
    fn entries_after_reads_in_order() {
        let conn = journal_conn();
        let journal = ChangeJournal::new(&conn);
        let first = append(&journal, OperationKind::Insert, "1");
        append(&journal, OperationKind::Insert, "2");
        append(&journal, OperationKind::Delete, "1");

        let entries = journal.entries_after(first, 10).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].keys, vec!["2".to_string()]);
        assert_eq!(entries[1].op, OperationKind::Delete);
        assert_eq!(entries[0].channel, schema_label("items"));
        assert_eq!(entries[0].origin, "tab-a");

        let limited = journal.entries_after(0, 1).unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].seq, first);
    }

    #[test]
    fn prune_keeps_head_and_newest() {
        let conn = journal_conn();
        let journal = ChangeJournal::new(&conn);
        for i in 0..5 {
            append(&journal, OperationKind::Insert, &i.to_string());
        }
        assert_eq!(journal.prune(2).unwrap(), 3);
        assert_eq!(journal.len().unwrap(), 2);
        assert_eq!(journal.head().unwrap(), 5);

        // Numbering continues past pruned entries
        assert_eq!(append(&journal, OperationKind::Insert, "x"), 6);
    }

    #[test]
    fn rolled_back_append_is_invisible() {
        let conn = journal_conn();
        {
            let tx = conn.unchecked_transaction().unwrap();
            append(&ChangeJournal::new(&tx), OperationKind::Insert, "1");
            // dropped without commit
        }
        let journal = ChangeJournal::new(&conn);
        assert!(journal.is_empty().unwrap());
        assert!(journal.entries_after(0, 10).unwrap().is_empty());
    }
}
