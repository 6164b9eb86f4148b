//! Identity-tracking persistence engine
//!
//! `DataManager` owns one SQLite connection together with the schema cache
//! and identity map. It flattens entities into parameterized statements,
//! inflates rows back into entities and reports changes to the configured
//! notifier. It never opens transactions for individual operations; that
//! is the coordinator's job (see [`crate::transaction::Cube`]).

use super::cursor::EntityCursor;
use super::identity::IdentityMap;
use crate::config::CubeConfig;
use crate::entity::{Accessor, Entity};
use crate::naming::ID_COLUMN;
use crate::schema::generator::{self, SchemaChange, SchemaGenerator};
use crate::schema::mapper::Binding;
use crate::schema::{sql, EntitySchema, SchemaCache, Selection};
use crate::uri::ResourceUri;
use crate::value::{Row, Value};
use crate::{Error, Result};
use rusqlite::{params_from_iter, Connection};
use std::cell::Cell;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Nesting limit for eager reference loading. Deeper references are left
/// unattached, which also breaks reference cycles.
pub const MAX_REFERENCE_DEPTH: usize = 16;

pub struct DataManager {
    conn: Connection,
    config: CubeConfig,
    schemas: Arc<SchemaCache>,
    identities: Arc<IdentityMap>,
    wal: bool,
    schema_change: SchemaChange,
    depth: Cell<usize>,
}

impl DataManager {
    /// Open the configured store and run the version lifecycle.
    pub fn open(config: CubeConfig) -> Result<Self> {
        config.validate()?;

        let opened = if config.is_in_memory() {
            Connection::open_in_memory()
        } else {
            Connection::open(config.database())
        };
        let conn = opened.map_err(|e| report(&config, e.into()))?;

        let wal = configure_journal(&conn, &config).map_err(|e| report(&config, e))?;

        let mut manager = Self {
            conn,
            config,
            schemas: Arc::new(SchemaCache::new()),
            identities: Arc::new(IdentityMap::new()),
            wal,
            schema_change: SchemaChange::Unchanged,
            depth: Cell::new(0),
        };

        let change = match manager.run_lifecycle() {
            Ok(change) => change,
            Err(e) => return Err(report(&manager.config, e)),
        };
        manager.schema_change = change;
        Ok(manager)
    }

    fn run_lifecycle(&self) -> Result<SchemaChange> {
        let tx = self.conn.unchecked_transaction()?;
        let old = generator::user_version(&self.conn)?;
        let new = self.config.version();
        let change = self.generator().migrate(old, new)?;
        if old != new {
            generator::set_user_version(&self.conn, new)?;
        }
        tx.commit()?;

        if self.config.is_debug() {
            info!("Opened {} at version {} ({:?})", self.config.database(), new, change);
        }
        Ok(change)
    }

    pub fn generator(&self) -> SchemaGenerator<'_> {
        SchemaGenerator::new(&self.conn, &self.config, &self.schemas)
    }

    // ========== Entity Operations ==========

    /// Insert the entity, or replace its row when it already has one.
    ///
    /// The resulting id is written to the key field, or recorded in the
    /// identity map for key-less tracked types.
    pub fn save<E: Entity>(&self, entity: &mut E) -> Result<i64> {
        let schema = self.schemas.entity::<E>();
        let table = schema.table();
        let existing = self.assigned_id(&schema, entity);

        let mut columns: Vec<&str> = Vec::with_capacity(schema.bindings().len() + 1);
        let mut values = Vec::with_capacity(schema.bindings().len() + 1);
        if let Some(id) = existing {
            columns.push(ID_COLUMN);
            values.push(Value::Integer(id));
        }
        for binding in schema.bindings() {
            columns.push(&binding.column);
            values.push(self.flatten(entity, binding));
        }

        let sql = sql::insert(&table.name, columns, existing.is_some());
        self.execute(&sql, &values)?;
        let id = self.conn.last_insert_rowid();

        match schema.key() {
            Some(key) => key.set(entity, id),
            None => {
                if let Some(identity) = schema.identity(entity) {
                    self.identities.insert(identity, id);
                }
            }
        }

        if self.config.is_debug() {
            info!("saved {} : {}", table.name, id);
        }
        Ok(id)
    }

    /// Update the row matched by the entity's unique fields.
    ///
    /// Unique fields form the WHERE clause (joined with AND) and every other
    /// mapped field is assigned. Types without unique fields are matched by
    /// their assigned id instead.
    pub fn update<E: Entity>(&self, entity: &E) -> Result<usize> {
        let schema = self.schemas.entity::<E>();
        let table = schema.table();

        let mut assignments = Vec::new();
        let mut values = Vec::new();
        let mut predicates = Vec::new();
        let mut keys = Vec::new();
        for binding in schema.bindings() {
            let value = self.flatten(entity, binding);
            if binding.unique {
                predicates.push(format!("{} = ?", binding.column));
                keys.push(value);
            } else {
                assignments.push(binding.column.as_str());
                values.push(value);
            }
        }

        if predicates.is_empty() {
            let id = self
                .assigned_id(&schema, entity)
                .ok_or_else(|| Error::MissingUpdateKey(table.entity.to_string()))?;
            predicates.push(format!("{} = ?", ID_COLUMN));
            keys.push(Value::Integer(id));
        }
        if assignments.is_empty() {
            return Ok(0);
        }

        let filter = predicates.join(" AND ");
        let sql = sql::update(&table.name, assignments, Some(filter.as_str()));
        values.extend(keys);

        let rows = self.execute(&sql, &values)?;
        if rows > 0 {
            self.notify_change(&self.table_uri(&table.name));
        }
        Ok(rows)
    }

    /// Delete the entity's row. Entities without an assigned key are left
    /// alone and yield `false`.
    pub fn delete<E: Entity>(&self, entity: &E) -> Result<bool> {
        let schema = self.schemas.entity::<E>();
        let table = schema.table();
        let Some(id) = schema.key().and_then(|key| key.get(entity)) else {
            return Ok(false);
        };

        let filter = format!("{} = ?", ID_COLUMN);
        let rows = self.execute(&sql::delete(&table.name, Some(filter.as_str())), &[Value::Integer(id)])?;
        if rows > 0 {
            self.notify_change(&self.row_uri(&table.name, id));
        }
        Ok(rows > 0)
    }

    pub fn load<E: Entity>(&self, id: i64) -> Result<Option<E>> {
        let selection = Selection::filter(format!("{} = ?", ID_COLUMN), [id]).limit(1);
        Ok(self.find::<E>(&selection)?.into_iter().next())
    }

    /// Load every entity whose id is in `ids`
    pub fn load_many<E: Entity>(&self, ids: &[i64]) -> Result<Vec<E>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let filter = format!("{} IN ({})", ID_COLUMN, sql::placeholders(ids.len()));
        self.find(&Selection::filter(filter, ids.iter().copied()))
    }

    pub fn find<E: Entity>(&self, selection: &Selection) -> Result<Vec<E>> {
        let schema = self.schemas.entity::<E>();
        let sql = sql::select(&schema.table().name, None, selection);
        let rows = self.query_rows(&sql, &selection.args)?;
        Ok(self.inflate_all(&schema, &rows))
    }

    pub fn find_where<E, I, V>(&self, filter: &str, args: I) -> Result<Vec<E>>
    where
        E: Entity,
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.find(&Selection::filter(filter, args))
    }

    /// Lazily iterate the entities matching `selection`
    pub fn find_iter<E: Entity>(&self, selection: &Selection) -> Result<EntityCursor<'_, E>> {
        let schema = self.schemas.entity::<E>();
        let sql = sql::select(&schema.table().name, None, selection);
        EntityCursor::open(self, schema, &sql, &selection.args)
    }

    pub fn find_all<E: Entity>(&self) -> Result<EntityCursor<'_, E>> {
        self.find_iter(&Selection::all())
    }

    /// Inflate the rows of an arbitrary SELECT
    pub fn find_with_query<E: Entity>(&self, sql: &str, args: &[Value]) -> Result<Vec<E>> {
        let schema = self.schemas.entity::<E>();
        let rows = self.query_rows(sql, args)?;
        Ok(self.inflate_all(&schema, &rows))
    }

    pub fn find_with_query_iter<E: Entity>(&self, sql: &str, args: &[Value]) -> Result<EntityCursor<'_, E>> {
        EntityCursor::open_query(self, self.schemas.entity::<E>(), sql, args)
    }

    /// Entity with the lowest id
    pub fn first<E: Entity>(&self) -> Result<Option<E>> {
        let selection = Selection::all().order_by(format!("{} ASC", ID_COLUMN)).limit(1);
        Ok(self.find::<E>(&selection)?.into_iter().next())
    }

    /// Entity with the highest id
    pub fn last<E: Entity>(&self) -> Result<Option<E>> {
        let selection = Selection::all().order_by(format!("{} DESC", ID_COLUMN)).limit(1);
        Ok(self.find::<E>(&selection)?.into_iter().next())
    }

    /// Count matching rows; `-1` when the statement cannot be prepared or run
    pub fn count<E: Entity>(&self, filter: Option<&str>, args: &[Value]) -> i64 {
        let schema = self.schemas.entity::<E>();
        let sql = sql::count(&schema.table().name, filter);
        self.log_query(&sql, args);
        let counted = self
            .conn
            .prepare(&sql)
            .and_then(|mut stmt| stmt.query_row(params_from_iter(args.iter()), |row| row.get::<_, i64>(0)));
        match counted {
            Ok(count) => count,
            Err(e) => {
                warn!("Count on {} failed: {}", schema.table().name, e);
                -1
            }
        }
    }

    pub fn count_all<E: Entity>(&self) -> i64 {
        self.count::<E>(None, &[])
    }

    // ========== Raw Statements ==========

    /// Execute a statement, returning the number of changed rows
    pub fn execute(&self, sql: &str, args: &[Value]) -> Result<usize> {
        self.log_query(sql, args);
        Ok(self.conn.execute(sql, params_from_iter(args.iter()))?)
    }

    /// Run a SELECT and capture every row. Rows holding a value that cannot
    /// be decoded are logged and skipped.
    pub fn query_rows(&self, sql: &str, args: &[Value]) -> Result<Vec<Row>> {
        self.log_query(sql, args);
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows = Vec::new();
        for row in stmt.query_map(params_from_iter(args.iter()), Row::from_sql)? {
            match row {
                Ok(row) => rows.push(row),
                Err(e @ rusqlite::Error::FromSqlConversionFailure(..)) => {
                    warn!("Skipping undecodable row: {}", e)
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(rows)
    }

    /// Run a SELECT keeping only its `_id` column, in result order. `None`
    /// when the statement does not project `_id`.
    pub(crate) fn query_ids(&self, sql: &str, args: &[Value]) -> Result<Option<Vec<i64>>> {
        self.log_query(sql, args);
        let mut stmt = self.conn.prepare(sql)?;
        let Some(index) = stmt
            .column_names()
            .iter()
            .position(|name| name.eq_ignore_ascii_case(ID_COLUMN))
        else {
            return Ok(None);
        };
        let ids = stmt
            .query_map(params_from_iter(args.iter()), |row| row.get::<_, Value>(index))?
            .filter_map(|id| id.map(|id| id.as_i64()).transpose())
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(Some(ids))
    }

    pub fn select_rows(&self, table: &str, projection: Option<&[&str]>, selection: &Selection) -> Result<Vec<Row>> {
        self.query_rows(&sql::select(table, projection, selection), &selection.args)
    }

    /// Insert a raw row, returning its id
    pub fn insert_row(&self, table: &str, values: &Row) -> Result<i64> {
        let sql = sql::insert(table, values.names(), false);
        let args: Vec<Value> = values.values().cloned().collect();
        self.execute(&sql, &args)?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn update_rows(&self, table: &str, values: &Row, filter: Option<&str>, args: &[Value]) -> Result<usize> {
        if values.is_empty() {
            return Ok(0);
        }
        let sql = sql::update(table, values.names(), filter);
        let params: Vec<Value> = values.values().chain(args).cloned().collect();
        self.execute(&sql, &params)
    }

    pub fn delete_rows(&self, table: &str, filter: Option<&str>, args: &[Value]) -> Result<usize> {
        self.execute(&sql::delete(table, filter), args)
    }

    // ========== Notifications ==========

    pub fn notify_change(&self, uri: &ResourceUri) {
        self.config.notifier().notify_change(uri);
    }

    pub fn table_uri(&self, table: &str) -> ResourceUri {
        ResourceUri::table(self.config.authority(), table)
    }

    pub fn row_uri(&self, table: &str, id: i64) -> ResourceUri {
        ResourceUri::row(self.config.authority(), table, id)
    }

    // ========== Administration ==========

    /// Drop and recreate every table. All data is lost.
    pub fn reset(&self) -> Result<()> {
        self.generator().manual_reset()
    }

    pub fn table_names(&self) -> Result<Vec<String>> {
        generator::user_tables(&self.conn)
    }

    pub fn count_rows(&self, table: &str) -> Result<i64> {
        let sql = format!("SELECT count(*) FROM {}", sql::quote(table));
        Ok(self.conn.query_row(&sql, [], |row| row.get(0))?)
    }

    pub fn user_version(&self) -> Result<u32> {
        generator::user_version(&self.conn)
    }

    pub fn journal_mode(&self) -> Result<String> {
        Ok(self.conn.pragma_query_value(None, "journal_mode", |row| row.get(0))?)
    }

    /// Whether the store runs in write-ahead-log mode
    pub fn is_wal(&self) -> bool {
        self.wal
    }

    /// What the version lifecycle did on open
    pub fn schema_change(&self) -> SchemaChange {
        self.schema_change
    }

    pub fn config(&self) -> &CubeConfig {
        &self.config
    }

    pub fn schemas(&self) -> &Arc<SchemaCache> {
        &self.schemas
    }

    pub fn identities(&self) -> &Arc<IdentityMap> {
        &self.identities
    }

    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Hand corruption errors to the configured handler
    pub(crate) fn report_corruption(&self, err: &Error) {
        if err.is_corruption() {
            self.config.error_handler().on_corruption(self.config.database(), err);
        }
    }

    // ========== Mapping ==========

    fn assigned_id<E>(&self, schema: &EntitySchema<E>, entity: &E) -> Option<i64> {
        match schema.key() {
            Some(key) => key.get(entity),
            None => schema
                .identity(entity)
                .and_then(|identity| self.identities.get(identity)),
        }
    }

    fn flatten<E>(&self, entity: &E, binding: &Binding<E>) -> Value {
        match &binding.accessor {
            Accessor::Scalar { get, .. } => get(entity),
            Accessor::Reference { id, .. } => id(entity, &*self.identities)
                .filter(|id| *id > 0)
                .map_or(Value::Null, Value::Integer),
            Accessor::Unmapped => Value::Null,
        }
    }

    /// Build an entity from a row. Columns missing from the row keep their
    /// default values.
    pub(crate) fn inflate<E: Entity>(&self, schema: &EntitySchema<E>, row: &Row) -> Result<E> {
        let mut entity = E::default();

        if let Some(id) = row.get(ID_COLUMN).and_then(Value::as_i64) {
            match schema.key() {
                Some(key) => key.set(&mut entity, id),
                None => {
                    if let Some(identity) = schema.identity(&entity) {
                        self.identities.insert(identity, id);
                    }
                }
            }
        }

        for binding in schema.bindings() {
            let Some(value) = row.get(&binding.column) else {
                continue;
            };
            match &binding.accessor {
                Accessor::Scalar { set, .. } => set(&mut entity, value.clone())?,
                Accessor::Reference { attach, .. } => {
                    let depth = self.depth.get();
                    if depth >= MAX_REFERENCE_DEPTH {
                        warn!(
                            "{}.{} not loaded: reference depth {} reached",
                            schema.table().entity,
                            binding.column,
                            MAX_REFERENCE_DEPTH
                        );
                        continue;
                    }
                    let foreign = value.as_i64().filter(|id| *id > 0);
                    self.depth.set(depth + 1);
                    let attached = attach(&mut entity, foreign, self);
                    self.depth.set(depth);
                    attached?;
                }
                Accessor::Unmapped => {}
            }
        }
        Ok(entity)
    }

    fn inflate_all<E: Entity>(&self, schema: &EntitySchema<E>, rows: &[Row]) -> Vec<E> {
        rows.iter()
            .filter_map(|row| match self.inflate(schema, row) {
                Ok(entity) => Some(entity),
                Err(e) => {
                    warn!("Skipping {} row: {}", schema.table().name, e);
                    None
                }
            })
            .collect()
    }

    fn log_query(&self, sql: &str, args: &[Value]) {
        if self.config.log_queries() {
            debug!("{} {:?}", sql, args);
        }
    }
}

impl std::fmt::Debug for DataManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataManager")
            .field("database", &self.config.database())
            .field("wal", &self.wal)
            .field("schemas", &self.schemas)
            .field("identities", &self.identities)
            .finish()
    }
}

fn report(config: &CubeConfig, err: Error) -> Error {
    if err.is_corruption() {
        config.error_handler().on_corruption(config.database(), &err);
    }
    err
}

/// Apply the requested journal mode and report whether WAL is in effect
fn configure_journal(conn: &Connection, config: &CubeConfig) -> Result<bool> {
    let mode: String = if config.is_in_memory() {
        conn.pragma_query_value(None, "journal_mode", |row| row.get(0))?
    } else {
        let requested = if config.write_ahead_logging() { "WAL" } else { "DELETE" };
        conn.pragma_update_and_check(None, "journal_mode", requested, |row| row.get(0))?
    };
    if config.is_debug() {
        info!("{} journal mode: {}", config.database(), mode);
    }
    Ok(mode.eq_ignore_ascii_case("wal"))
}
