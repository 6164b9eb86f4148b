//! Table lifecycle
//!
//! Creation is idempotent. Upgrade, downgrade and manual reset are all
//! destructive: every user table is dropped and the declared entity tables
//! are recreated empty. No data is migrated between schema versions.

use super::mapper::SchemaCache;
use super::sql;
use crate::config::CubeConfig;
use crate::Result;
use rusqlite::Connection;
use tracing::{debug, error, info};

/// What opening a database did to its schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaChange {
    Created,
    Upgraded { from: u32, to: u32 },
    Downgraded { from: u32, to: u32 },
    Unchanged,
}

/// Drives table creation and the drop-and-recreate strategies for the
/// configured entity list.
pub struct SchemaGenerator<'a> {
    conn: &'a Connection,
    config: &'a CubeConfig,
    cache: &'a SchemaCache,
}

impl<'a> SchemaGenerator<'a> {
    pub fn new(conn: &'a Connection, config: &'a CubeConfig, cache: &'a SchemaCache) -> Self {
        Self { conn, config, cache }
    }

    /// Create every configured table that does not exist yet.
    ///
    /// A failing table is logged and skipped so the others still get created.
    /// Returns the number of statements that succeeded.
    pub fn create(&self) -> usize {
        let mut created = 0;
        for entity in self.config.entities() {
            let table = entity.table_schema(self.cache);
            let ddl = sql::create_table(&table);
            if self.config.log_queries() {
                debug!("{}", ddl);
            }
            match self.conn.execute_batch(&ddl) {
                Ok(()) => created += 1,
                Err(e) => error!("Failed to create table {} for {}: {}", table.name, table.entity, e),
            }
        }
        if self.config.is_debug() {
            info!("Created {} of {} tables", created, self.config.entities().len());
        }
        created
    }

    /// Drop everything and recreate at the new version
    pub fn upgrade(&self, old: u32, new: u32) -> Result<()> {
        if self.config.is_debug() {
            info!("Upgrading {} from version {} to {}", self.config.database(), old, new);
        }
        self.recreate()
    }

    /// Drop everything and recreate at the older version
    pub fn downgrade(&self, old: u32, new: u32) -> Result<()> {
        if self.config.is_debug() {
            info!("Downgrading {} from version {} to {}", self.config.database(), old, new);
        }
        self.recreate()
    }

    /// Wipe all data outside of the open lifecycle
    pub fn manual_reset(&self) -> Result<()> {
        if self.config.is_debug() {
            info!("Resetting {}", self.config.database());
        }
        self.recreate()
    }

    /// Drop every user table, including ones no longer declared
    pub fn drop_all_tables(&self) -> Result<usize> {
        drop_user_tables(self.conn, self.config.log_queries())
    }

    /// Bring the schema from `old` to `new`, where `old == 0` is a fresh file.
    ///
    /// The caller is responsible for storing the new version afterwards.
    pub fn migrate(&self, old: u32, new: u32) -> Result<SchemaChange> {
        let change = if old == 0 {
            self.create();
            SchemaChange::Created
        } else if new > old {
            self.upgrade(old, new)?;
            SchemaChange::Upgraded { from: old, to: new }
        } else if new < old {
            self.downgrade(old, new)?;
            SchemaChange::Downgraded { from: old, to: new }
        } else {
            SchemaChange::Unchanged
        };
        Ok(change)
    }

    fn recreate(&self) -> Result<()> {
        self.drop_all_tables()?;
        self.create();
        Ok(())
    }
}

/// Names of all user tables, excluding SQLite's internal ones
pub fn user_tables(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(names)
}

/// Drop every user table, returning how many were dropped
pub fn drop_user_tables(conn: &Connection, log_queries: bool) -> Result<usize> {
    let tables = user_tables(conn)?;
    for table in &tables {
        let ddl = sql::drop_table(table);
        if log_queries {
            debug!("{}", ddl);
        }
        conn.execute_batch(&ddl)?;
    }
    Ok(tables.len())
}

pub fn user_version(conn: &Connection) -> Result<u32> {
    let version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(u32::try_from(version).unwrap_or(0))
}

pub fn set_user_version(conn: &Connection, version: u32) -> Result<()> {
    conn.pragma_update(None, "user_version", version)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Entity, EntityDescriptor, Field};

    #[derive(Default)]
    struct Note {
        id: Option<i64>,
        title: String,
    }

    impl Entity for Note {
        fn describe() -> EntityDescriptor<Self> {
            EntityDescriptor::<Self>::new("Note")
                .key("id", |n| n.id, |n, id| n.id = Some(id))
                .field(Field::text("title", |n| n.title.clone().into(), |n, v| {
                    n.title = v.decode()?;
                    Ok(())
                }))
        }
    }

    #[derive(Default)]
    struct Tag {
        label: String,
    }

    impl Entity for Tag {
        fn describe() -> EntityDescriptor<Self> {
            EntityDescriptor::<Self>::new("Tag").field(Field::text("label", |t| t.label.clone().into(), |t, v| {
                t.label = v.decode()?;
                Ok(())
            }))
        }
    }

    #[derive(Default)]
    struct Order {
        total: f64,
    }

    impl Entity for Order {
        fn describe() -> EntityDescriptor<Self> {
            // Unquoted reserved word: SQLite rejects the DDL
            EntityDescriptor::<Self>::new("Order").table("order").field(Field::real(
                "total",
                |o| o.total.into(),
                |o, v| {
                    o.total = v.decode()?;
                    Ok(())
                },
            ))
        }
    }

    fn config() -> CubeConfig {
        CubeConfig::in_memory().with_entity::<Note>().with_entity::<Tag>()
    }

    #[test]
    fn test_create_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        let config = config();
        let cache = SchemaCache::new();
        let generator = SchemaGenerator::new(&conn, &config, &cache);

        assert_eq!(generator.create(), 2);
        assert_eq!(generator.create(), 2);
        assert_eq!(user_tables(&conn).unwrap(), vec!["notes", "tags"]);
    }

    #[test]
    fn test_bad_table_does_not_block_others() {
        let conn = Connection::open_in_memory().unwrap();
        let config = CubeConfig::in_memory()
            .with_entity::<Order>()
            .with_entity::<Note>();
        let cache = SchemaCache::new();

        assert_eq!(SchemaGenerator::new(&conn, &config, &cache).create(), 1);
        assert_eq!(user_tables(&conn).unwrap(), vec!["notes"]);
    }

    #[test]
    fn test_upgrade_leaves_no_orphans() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE legacy (x INTEGER)").unwrap();
        let config = config();
        let cache = SchemaCache::new();
        let generator = SchemaGenerator::new(&conn, &config, &cache);

        generator.create();
        conn.execute("INSERT INTO notes (title) VALUES ('kept?')", []).unwrap();

        assert_eq!(
            generator.migrate(1, 2).unwrap(),
            SchemaChange::Upgraded { from: 1, to: 2 }
        );
        assert_eq!(user_tables(&conn).unwrap(), vec!["notes", "tags"]);
        let rows: i64 = conn.query_row("SELECT count(*) FROM notes", [], |r| r.get(0)).unwrap();
        assert_eq!(rows, 0);
    }

    #[test]
    fn test_migrate_transitions() {
        let conn = Connection::open_in_memory().unwrap();
        let config = config();
        let cache = SchemaCache::new();
        let generator = SchemaGenerator::new(&conn, &config, &cache);

        assert_eq!(generator.migrate(0, 3).unwrap(), SchemaChange::Created);
        assert_eq!(generator.migrate(3, 3).unwrap(), SchemaChange::Unchanged);
        assert_eq!(
            generator.migrate(3, 2).unwrap(),
            SchemaChange::Downgraded { from: 3, to: 2 }
        );
    }

    #[test]
    fn test_manual_reset_clears_rows() {
        let conn = Connection::open_in_memory().unwrap();
        let config = config();
        let cache = SchemaCache::new();
        let generator = SchemaGenerator::new(&conn, &config, &cache);
        generator.create();
        conn.execute("INSERT INTO tags (label) VALUES ('x')", []).unwrap();

        generator.manual_reset().unwrap();
        let rows: i64 = conn.query_row("SELECT count(*) FROM tags", [], |r| r.get(0)).unwrap();
        assert_eq!(rows, 0);
    }

    #[test]
    fn test_user_version_roundtrip() {
        let conn = Connection::open_in_memory().unwrap();
        assert_eq!(user_version(&conn).unwrap(), 0);
        set_user_version(&conn, 4).unwrap();
        assert_eq!(user_version(&conn).unwrap(), 4);
    }
}
