//! Lazy entity iteration
//!
//! Opening a cursor runs the query once and keeps only the `_id` of every
//! matching row, in result order. Rows are then read back in fixed windows
//! of ids and inflated one at a time, so the result set is pinned: rows
//! inserted after the cursor opened are not visited, and rows deleted before
//! their window is read are skipped.
//!
//! Selections read back straight from the entity's table. Raw queries are
//! re-run with the window's ids as an extra filter so their projection is
//! kept; a raw query that does not project `_id` is read in full at open.
//!
//! The cursor is finite and single-pass; once it returns `None` it keeps
//! returning `None`.

use super::manager::DataManager;
use crate::entity::Entity;
use crate::naming::ID_COLUMN;
use crate::schema::{sql, EntitySchema};
use crate::value::{Row, Value};
use crate::Result;
use std::collections::{HashMap, VecDeque};
use std::iter::FusedIterator;
use std::sync::Arc;
use tracing::warn;

/// Rows read back per round trip
pub const WINDOW_SIZE: usize = 64;

/// Where windows are read back from
enum Source {
    Table,
    Query { sql: String, args: Vec<Value> },
}

pub struct EntityCursor<'a, E> {
    manager: &'a DataManager,
    schema: Arc<EntitySchema<E>>,
    source: Source,
    pending: VecDeque<i64>,
    buffer: VecDeque<Row>,
}

impl<'a, E: Entity> EntityCursor<'a, E> {
    /// Open a cursor over a SELECT on the entity's own table. The statement
    /// runs here, so a malformed query fails at open rather than
    /// mid-iteration.
    pub(crate) fn open(
        manager: &'a DataManager,
        schema: Arc<EntitySchema<E>>,
        sql: &str,
        args: &[Value],
    ) -> Result<Self> {
        Self::pin(manager, schema, Source::Table, sql, args)
    }

    /// Open a cursor over an arbitrary SELECT
    pub(crate) fn open_query(
        manager: &'a DataManager,
        schema: Arc<EntitySchema<E>>,
        sql: &str,
        args: &[Value],
    ) -> Result<Self> {
        let sql = sql.trim().trim_end_matches(';');
        let source = Source::Query {
            sql: sql.to_string(),
            args: args.to_vec(),
        };
        Self::pin(manager, schema, source, sql, args)
    }

    fn pin(
        manager: &'a DataManager,
        schema: Arc<EntitySchema<E>>,
        source: Source,
        sql: &str,
        args: &[Value],
    ) -> Result<Self> {
        let mut cursor = Self {
            manager,
            schema,
            source,
            pending: VecDeque::new(),
            buffer: VecDeque::new(),
        };
        match manager.query_ids(sql, args)? {
            Some(ids) => cursor.pending = ids.into(),
            None => cursor.buffer = manager.query_rows(sql, args)?.into(),
        }
        Ok(cursor)
    }

    /// Read the next window of pinned ids back from the table
    fn fetch(&mut self) -> Result<()> {
        let take = self.pending.len().min(WINDOW_SIZE);
        let ids: Vec<i64> = self.pending.drain(..take).collect();

        let (from, mut args) = match &self.source {
            Source::Table => (self.schema.table().name.clone(), Vec::new()),
            Source::Query { sql, args } => (format!("({})", sql), args.clone()),
        };
        let window = format!(
            "SELECT * FROM {} WHERE {} IN ({})",
            from,
            ID_COLUMN,
            sql::placeholders(ids.len())
        );
        args.extend(ids.iter().copied().map(Value::Integer));
        let rows: HashMap<i64, Row> = self
            .manager
            .query_rows(&window, &args)?
            .into_iter()
            .filter_map(|row| Some((row.get(ID_COLUMN)?.as_i64()?, row)))
            .collect();

        // Keep result order; ids deleted since open have no row
        self.buffer.extend(ids.iter().filter_map(|id| rows.get(id).cloned()));
        Ok(())
    }

    fn next_row(&mut self) -> Option<Row> {
        while self.buffer.is_empty() && !self.pending.is_empty() {
            if let Err(e) = self.fetch() {
                warn!("Cursor over {} stopped: {}", self.schema.table().name, e);
                self.pending.clear();
            }
        }
        self.buffer.pop_front()
    }

    /// Rows not yet handed out, counting pinned ids that may since be gone
    pub fn remaining(&self) -> usize {
        self.pending.len() + self.buffer.len()
    }
}

impl<E: Entity> Iterator for EntityCursor<'_, E> {
    type Item = E;

    /// Rows that fail to inflate are logged and skipped.
    fn next(&mut self) -> Option<E> {
        loop {
            let row = self.next_row()?;
            match self.manager.inflate(&self.schema, &row) {
                Ok(entity) => return Some(entity),
                Err(e) => warn!("Skipping {} row: {}", self.schema.table().name, e),
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining()))
    }
}

impl<E: Entity> FusedIterator for EntityCursor<'_, E> {}
