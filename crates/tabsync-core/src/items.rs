//! Row-level access to the `items` table
//!
//! Writes take a connection (normally an open transaction) so the caller can
//! journal the change in the same commit. Reads go straight to the store and
//! form the direct query path.

use rusqlite::{params, Connection, Row};

use crate::error::{Result, SyncError};
use crate::item::{parse_timestamp, Item};
use crate::store::Store;

const SELECT_ITEMS: &str =
    "SELECT id, name, created_at, tab_id FROM items ORDER BY created_at DESC, id DESC";

pub(crate) fn insert(conn: &Connection, item: &Item) -> Result<()> {
    conn.execute(
        "INSERT INTO items (id, name, created_at, tab_id) VALUES (?1, ?2, ?3, ?4)",
        params![item.id, item.name, item.created_at_text(), item.tab_id],
    )
    .map_err(|e| {
        if let rusqlite::Error::SqliteFailure(ref err, _) = e {
            if err.code == rusqlite::ErrorCode::ConstraintViolation {
                return SyncError::AlreadyExists(item.id.clone());
            }
        }
        SyncError::Storage(format!("insert: {}", e))
    })?;
    Ok(())
}

pub(crate) fn rename(conn: &Connection, id: &str, name: &str) -> Result<()> {
    let rows = conn
        .execute(
            "UPDATE items SET name = ?1 WHERE id = ?2",
            params![name, id],
        )
        .map_err(|e| SyncError::Storage(format!("rename: {}", e)))?;
    if rows == 0 {
        return Err(SyncError::NotFound(id.to_string()));
    }
    Ok(())
}

pub(crate) fn delete(conn: &Connection, id: &str) -> Result<()> {
    let rows = conn
        .execute("DELETE FROM items WHERE id = ?1", params![id])
        .map_err(|e| SyncError::Storage(format!("delete: {}", e)))?;
    if rows == 0 {
        return Err(SyncError::NotFound(id.to_string()));
    }
    Ok(())
}

fn row_to_item(row: &Row<'_>) -> rusqlite::Result<Item> {
    let created_text: String = row.get(2)?;
    let created_at = parse_timestamp(&created_text).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            format!("bad created_at: {}", created_text).into(),
        )
    })?;
    Ok(Item {
        id: row.get(0)?,
        name: row.get(1)?,
        created_at,
        tab_id: row.get(3)?,
    })
}

/// All items, newest first (ties by id).
pub fn list(store: &Store) -> Result<Vec<Item>> {
    store.get_all(SELECT_ITEMS, [], row_to_item)
}

/// Number of stored items.
pub fn count(store: &Store) -> Result<usize> {
    let n = store
        .get_optional("SELECT COUNT(*) FROM items", [], |row| row.get::<_, i64>(0))?
        .unwrap_or(0);
    Ok(n as usize)
}

/// One item by id.
pub fn get(store: &Store, id: &str) -> Result<Option<Item>> {
    store.get_optional(
        "SELECT id, name, created_at, tab_id FROM items WHERE id = ?1",
        params![id],
        row_to_item,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn item_at(id: &str, secs: u32) -> Item {
        Item {
            id: id.into(),
            name: format!("Item {}", id),
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, secs).unwrap(),
            tab_id: "A".into(),
        }
    }

    #[test]
    fn insert_and_list_newest_first() {
        let store = Store::open_in_memory().unwrap();
        store
            .transaction(|tx| {
                insert(tx, &item_at("1", 1))?;
                insert(tx, &item_at("2", 3))?;
                insert(tx, &item_at("3", 2))
            })
            .unwrap();
        let ids: Vec<_> = list(&store).unwrap().into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec!["2", "3", "1"]);
        assert_eq!(count(&store).unwrap(), 3);
    }

    #[test]
    fn equal_timestamps_order_by_id() {
        let store = Store::open_in_memory().unwrap();
        store
            .transaction(|tx| {
                insert(tx, &item_at("a", 5))?;
                insert(tx, &item_at("b", 5))
            })
            .unwrap();
        let ids: Vec<_> = list(&store).unwrap().into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[test]
    fn duplicate_insert_is_conflict() {
        let store = Store::open_in_memory().unwrap();
        store.transaction(|tx| insert(tx, &item_at("1", 1))).unwrap();
        let err = store
            .transaction(|tx| insert(tx, &item_at("1", 2)))
            .unwrap_err();
        assert!(matches!(err, SyncError::AlreadyExists(ref id) if id == "1"));
    }

    #[test]
    fn rename_and_delete_missing_rows() {
        let store = Store::open_in_memory().unwrap();
        let err = store.transaction(|tx| rename(tx, "x", "y")).unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));
        let err = store.transaction(|tx| delete(tx, "x")).unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));
    }

    #[test]
    fn get_round_trips() {
        let store = Store::open_in_memory().unwrap();
        let item = item_at("1", 1);
        store.transaction(|tx| insert(tx, &item)).unwrap();
        assert_eq!(get(&store, "1").unwrap(), Some(item));
        store.transaction(|tx| rename(tx, "1", "Renamed")).unwrap();
        assert_eq!(get(&store, "1").unwrap().unwrap().name, "Renamed");
        assert!(get(&store, "2").unwrap().is_none());
    }
}
