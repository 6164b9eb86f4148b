//! SQL rendering
//!
//! DDL for entity tables plus the handful of parameterized DML shapes the
//! persistence engine issues. Every value travels as a `?` parameter; only
//! identifiers and caller-supplied clauses are spliced into the text.

use super::mapper::TableSchema;
use crate::naming::{self, ID_COLUMN};
use crate::value::Value;
use tracing::warn;

const NULL_MARKER: &str = " NULL";

/// Render `CREATE TABLE IF NOT EXISTS` for a table schema.
///
/// Reserved-word collisions and names that need quoting are reported as
/// warnings; SQLite itself rejects the statement when it cannot parse it.
pub fn create_table(table: &TableSchema) -> String {
    if naming::is_reserved(&table.name) {
        warn!("SQLite reserved word used as table name: {}", table.name);
    } else if !naming::is_valid_identifier(&table.name) {
        warn!("Table name is not a plain identifier: {}", table.name);
    }

    let mut sql = format!(
        "CREATE TABLE IF NOT EXISTS {} ( {} INTEGER PRIMARY KEY AUTOINCREMENT",
        table.name, ID_COLUMN
    );

    for column in &table.columns {
        if column.name.eq_ignore_ascii_case(ID_COLUMN) {
            continue;
        }
        if naming::is_reserved(&column.name) {
            warn!("SQLite reserved word used as column name: {}.{}", table.name, column.name);
        } else if !naming::is_valid_identifier(&column.name) {
            warn!("Column name is not a plain identifier: {}.{}", table.name, column.name);
        }

        let mut sql_type = column.sql_type;
        if !column.nullable {
            sql_type = sql_type.strip_suffix(NULL_MARKER).unwrap_or(sql_type);
        }
        sql.push_str(", ");
        sql.push_str(&column.name);
        sql.push(' ');
        sql.push_str(sql_type);
        if !column.nullable {
            sql.push_str(" NOT NULL");
        }
        if column.unique {
            sql.push_str(" UNIQUE");
        }
    }

    if !table.multi_unique.is_empty() {
        sql.push_str(", UNIQUE(");
        sql.push_str(&table.multi_unique.join(","));
        sql.push_str(") ON CONFLICT REPLACE");
    }

    sql.push_str(" )");
    sql
}

pub fn drop_table(name: &str) -> String {
    format!("DROP TABLE IF EXISTS {}", quote(name))
}

/// Quote an identifier that did not come from a schema descriptor
pub fn quote(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// `?,?,?` with exactly `count` placeholders
pub fn placeholders(count: usize) -> String {
    vec!["?"; count].join(",")
}

/// Render an INSERT; `replace` turns it into an upsert keyed by the row id.
pub fn insert<'a>(table: &str, columns: impl IntoIterator<Item = &'a str>, replace: bool) -> String {
    let columns: Vec<&str> = columns.into_iter().collect();
    let verb = if replace { "INSERT OR REPLACE" } else { "INSERT" };
    if columns.is_empty() {
        return format!("{} INTO {} DEFAULT VALUES", verb, table);
    }
    format!(
        "{} INTO {} ({}) VALUES ({})",
        verb,
        table,
        columns.join(","),
        placeholders(columns.len())
    )
}

/// Render an UPDATE with one `col = ?` per assigned column
pub fn update<'a>(table: &str, columns: impl IntoIterator<Item = &'a str>, filter: Option<&str>) -> String {
    let assignments: Vec<String> = columns.into_iter().map(|c| format!("{} = ?", c)).collect();
    let mut sql = format!("UPDATE {} SET {}", table, assignments.join(", "));
    push_filter(&mut sql, filter);
    sql
}

pub fn delete(table: &str, filter: Option<&str>) -> String {
    let mut sql = format!("DELETE FROM {}", table);
    push_filter(&mut sql, filter);
    sql
}

pub fn count(table: &str, filter: Option<&str>) -> String {
    let mut sql = format!("SELECT count(*) FROM {}", table);
    push_filter(&mut sql, filter);
    sql
}

/// Render a SELECT over `table` for a selection
pub fn select(table: &str, projection: Option<&[&str]>, selection: &Selection) -> String {
    let columns = match projection {
        Some(columns) if !columns.is_empty() => columns.join(", "),
        _ => "*".to_string(),
    };
    let mut sql = format!("SELECT {} FROM {}", columns, table);
    push_filter(&mut sql, selection.filter.as_deref());
    if let Some(group_by) = non_empty(selection.group_by.as_deref()) {
        sql.push_str(" GROUP BY ");
        sql.push_str(group_by);
    }
    if let Some(order_by) = non_empty(selection.order_by.as_deref()) {
        sql.push_str(" ORDER BY ");
        sql.push_str(order_by);
    }
    if selection.limit > 0 {
        sql.push_str(&format!(" LIMIT {}", selection.limit));
    }
    sql
}

fn push_filter(sql: &mut String, filter: Option<&str>) {
    if let Some(filter) = non_empty(filter) {
        sql.push_str(" WHERE ");
        sql.push_str(filter);
    }
}

fn non_empty(clause: Option<&str>) -> Option<&str> {
    clause.map(str::trim).filter(|c| !c.is_empty())
}

/// Predicate, grouping, ordering and limit of an entity query.
///
/// A `limit` of 0 means unbounded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selection {
    pub filter: Option<String>,
    pub args: Vec<Value>,
    pub group_by: Option<String>,
    pub order_by: Option<String>,
    pub limit: u32,
}

impl Selection {
    /// Select every row
    pub fn all() -> Self {
        Self::default()
    }

    /// Select rows matching a parameterized predicate
    pub fn filter<I, V>(clause: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self {
            filter: Some(clause.into()),
            args: args.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn group_by(mut self, clause: impl Into<String>) -> Self {
        self.group_by = Some(clause.into());
        self
    }

    pub fn order_by(mut self, clause: impl Into<String>) -> Self {
        self.order_by = Some(clause.into());
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::mapper::ColumnMapping;

    fn column(name: &str, sql_type: &'static str, nullable: bool, unique: bool) -> ColumnMapping {
        ColumnMapping {
            field: "f",
            name: name.to_string(),
            sql_type,
            nullable,
            unique,
            reference: None,
        }
    }

    fn notes() -> TableSchema {
        TableSchema {
            entity: "Note",
            name: "notes".to_string(),
            columns: vec![
                column("title", "TEXT", true, false),
                column("pinned", "INTEGER", true, true),
            ],
            key_field: Some("id"),
            multi_unique: Vec::new(),
        }
    }

    #[test]
    fn test_create_table() {
        assert_eq!(
            create_table(&notes()),
            "CREATE TABLE IF NOT EXISTS notes ( _id INTEGER PRIMARY KEY AUTOINCREMENT, title TEXT, pinned INTEGER UNIQUE )"
        );
    }

    #[test]
    fn test_not_null_strips_null_marker() {
        let mut table = notes();
        table.columns = vec![column("created", "INTEGER NULL", false, false)];
        assert_eq!(
            create_table(&table),
            "CREATE TABLE IF NOT EXISTS notes ( _id INTEGER PRIMARY KEY AUTOINCREMENT, created INTEGER NOT NULL )"
        );
    }

    #[test]
    fn test_multi_unique_clause() {
        let mut table = notes();
        table.name = "listings".to_string();
        table.columns = vec![column("tenant", "TEXT", true, false), column("slug", "TEXT", true, false)];
        table.multi_unique = vec!["tenant".to_string(), "slug".to_string()];
        assert!(create_table(&table).ends_with(", UNIQUE(tenant,slug) ON CONFLICT REPLACE )"));
    }

    #[test]
    fn test_id_column_never_duplicated() {
        let mut table = notes();
        table.columns.push(column("_ID", "INTEGER", true, false));
        assert_eq!(create_table(&table).matches("_id").count(), 1);
    }

    #[test]
    fn test_generated_ddl_executes() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch(&create_table(&notes())).unwrap();
        conn.execute_batch(&create_table(&notes())).unwrap();
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(placeholders(0), "");
        assert_eq!(placeholders(1), "?");
        assert_eq!(placeholders(3), "?,?,?");
    }

    #[test]
    fn test_insert_and_update() {
        assert_eq!(insert("notes", ["title", "pinned"], false), "INSERT INTO notes (title,pinned) VALUES (?,?)");
        assert_eq!(
            insert("notes", ["_id", "title"], true),
            "INSERT OR REPLACE INTO notes (_id,title) VALUES (?,?)"
        );
        assert_eq!(insert("notes", [], false), "INSERT INTO notes DEFAULT VALUES");
        assert_eq!(
            update("notes", ["title"], Some("pinned = ?")),
            "UPDATE notes SET title = ? WHERE pinned = ?"
        );
    }

    #[test]
    fn test_select() {
        let selection = Selection::filter("title = ?", ["a"]).order_by("_id DESC").limit(5);
        assert_eq!(
            select("notes", None, &selection),
            "SELECT * FROM notes WHERE title = ? ORDER BY _id DESC LIMIT 5"
        );
        assert_eq!(select("notes", Some(&["title"][..]), &Selection::all()), "SELECT title FROM notes");
        assert_eq!(count("notes", Some("  ")), "SELECT count(*) FROM notes");
    }

    #[test]
    fn test_quote() {
        assert_eq!(drop_table("order"), "DROP TABLE IF EXISTS \"order\"");
        assert_eq!(quote("a\"b"), "\"a\"\"b\"");
    }
}
