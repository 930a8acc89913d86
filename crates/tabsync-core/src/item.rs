use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Item identifier (UUID v4 text, generated by the client).
pub type ItemId = String;

/// Identifier of the execution context that wrote a row.
pub type TabId = String;

/// The single domain entity stored in the `items` table.
///
/// Field names serialize in camelCase to match the stored JSON shape used by
/// other clients of the same store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub id: ItemId,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub tab_id: TabId,
}

impl Item {
    /// New item stamped with a fresh id and the current time.
    ///
    /// The timestamp is truncated to milliseconds so it survives a trip
    /// through the store unchanged.
    pub fn new(name: impl Into<String>, tab_id: impl Into<TabId>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            created_at: Utc::now().trunc_subsecs(3),
            tab_id: tab_id.into(),
        }
    }

    /// `createdAt` as stored: RFC 3339, millisecond precision, `Z` suffix.
    ///
    /// Fixed width, so text order in SQLite equals time order.
    pub fn created_at_text(&self) -> String {
        format_timestamp(&self.created_at)
    }
}

pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Short random context identifier, six lowercase alphanumerics.
pub fn generate_tab_id() -> TabId {
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut n = Uuid::new_v4().as_u128();
    (0..6)
        .map(|_| {
            let c = ALPHABET[(n % 36) as usize] as char;
            n /= 36;
            c
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn item_serializes_camel_case() {
        let item = Item {
            id: "1".into(),
            name: "Item 1".into(),
            created_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            tab_id: "A".into(),
        };
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["createdAt"], "2024-05-01T12:00:00Z");
        assert_eq!(json["tabId"], "A");
        let back: Item = serde_json::from_value(json).unwrap();
        assert_eq!(item, back);
    }

    #[test]
    fn timestamp_text_orders_like_time() {
        let earlier = Utc.with_ymd_and_hms(2024, 5, 1, 9, 59, 59).unwrap();
        let later = earlier + chrono::Duration::milliseconds(1);
        assert!(format_timestamp(&earlier) < format_timestamp(&later));
        assert_eq!(format_timestamp(&earlier), "2024-05-01T09:59:59.000Z");
        assert_eq!(parse_timestamp(&format_timestamp(&later)), Some(later));
    }

    #[test]
    fn tab_ids_are_short_and_distinct() {
        let a = generate_tab_id();
        let b = generate_tab_id();
        assert_eq!(a.len(), 6);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }

    #[test]
    fn new_items_get_unique_ids() {
        let a = Item::new("Item 1", "tab");
        let b = Item::new("Item 1", "tab");
        assert_ne!(a.id, b.id);
        assert_eq!(a.tab_id, "tab");
    }
}
