//! Declared tables and the SQLite schema for the shared store
//!
//! Table identity is the declared name. Channel labels hash that name only,
//! so adding a column never moves a table to a new channel.

/// Schema version for migrations
pub const SCHEMA_VERSION: u32 = 1;

/// Name of the only application table.
pub const ITEMS_TABLE: &str = "items";

/// Storage type of a declared column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    Integer,
}

impl ColumnType {
    fn sql(&self) -> &'static str {
        match self {
            ColumnType::Text => "TEXT",
            ColumnType::Integer => "INTEGER",
        }
    }
}

/// A declared column. Every table also gets a `id TEXT PRIMARY KEY`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: &'static str,
    pub column_type: ColumnType,
    pub indexed: bool,
}

impl ColumnDef {
    pub const fn text(name: &'static str) -> Self {
        Self {
            name,
            column_type: ColumnType::Text,
            indexed: false,
        }
    }

    pub const fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }
}

/// A logical table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDef {
    pub name: &'static str,
    pub columns: Vec<ColumnDef>,
}

impl TableDef {
    /// `CREATE TABLE` plus one index per indexed column.
    pub fn create_sql(&self) -> String {
        let mut columns = vec!["id TEXT PRIMARY KEY".to_string()];
        for c in &self.columns {
            columns.push(format!("{} {}", c.name, c.column_type.sql()));
        }
        let mut sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    {}\n);\n",
            self.name,
            columns.join(",\n    ")
        );
        for c in self.columns.iter().filter(|c| c.indexed) {
            sql.push_str(&format!(
                "CREATE INDEX IF NOT EXISTS idx_{table}_{col} ON {table}({col});\n",
                table = self.name,
                col = c.name
            ));
        }
        sql
    }
}

/// The set of tables the application declares
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppSchema {
    pub tables: Vec<TableDef>,
}

impl AppSchema {
    /// The items schema: `name`, `created_at`, `tab_id`, all text.
    pub fn items() -> Self {
        Self {
            tables: vec![TableDef {
                name: ITEMS_TABLE,
                columns: vec![
                    ColumnDef::text("name"),
                    ColumnDef::text("created_at").indexed(),
                    ColumnDef::text("tab_id"),
                ],
            }],
        }
    }

    pub fn table(&self, name: &str) -> Option<&TableDef> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Full DDL: version tracking, the change journal, then every table.
    pub fn create_tables(&self) -> String {
        let mut sql = String::from(
            r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Change journal (append-only, written in the same transaction as the change)
CREATE TABLE IF NOT EXISTS change_journal (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    channel TEXT NOT NULL,
    table_name TEXT NOT NULL,
    op TEXT NOT NULL,
    keys TEXT NOT NULL,
    origin TEXT NOT NULL,
    committed_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_change_journal_channel ON change_journal(channel);
"#,
        );
        for table in &self.tables {
            sql.push('\n');
            sql.push_str(&table.create_sql());
        }
        sql
    }
}

impl Default for AppSchema {
    fn default() -> Self {
        Self::items()
    }
}
