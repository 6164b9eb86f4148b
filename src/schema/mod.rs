//! Schema layer
//!
//! - `mapper`: entity descriptors to column mappings, cached per type
//! - `sql`: DDL and DML rendering
//! - `generator`: table lifecycle (create, upgrade, downgrade, reset)

pub mod generator;
pub mod mapper;
pub mod sql;

pub use generator::{SchemaChange, SchemaGenerator};
pub use mapper::{ColumnMapping, EntitySchema, SchemaCache, TableSchema};
pub use sql::Selection;
