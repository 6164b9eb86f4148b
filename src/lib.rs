//! # Cube - Entity-driven persistence over SQLite
//!
//! Cube maps plain Rust structs ("entities") onto SQLite tables.
//!
//! Cube provides:
//! - Schema derivation from registered entity descriptors (no runtime reflection)
//! - DDL generation and a versioned create/upgrade/downgrade/reset lifecycle
//! - Identity-tracked CRUD with eager one-level reference loading
//! - A transaction coordinator that picks its locking strategy from the journal mode
//! - Change notifications addressed by `content://` resource URIs

pub mod config;
pub mod entity;
pub mod naming;
pub mod notify;
pub mod provider;
pub mod schema;
pub mod storage;
pub mod transaction;
pub mod ui;
pub mod uri;
pub mod value;

// Re-exports for convenient access
pub use config::{CorruptionHandler, CubeConfig, EntityRegistry, Manifest};
pub use entity::{Entity, EntityDescriptor, EntityType, Field, FieldType, Identity};
pub use notify::{ChangeNotifier, ChannelNotifier, LogNotifier, RecordingNotifier};
pub use provider::{ContentRouter, Route};
pub use schema::{SchemaCache, SchemaChange, SchemaGenerator, Selection, TableSchema};
pub use storage::{DataManager, EntityCursor, IdentityMap};
pub use transaction::{Cube, Persistable};
pub use uri::ResourceUri;
pub use value::{FromValue, Row, Value};

/// Result type alias for Cube operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for Cube operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Manifest error: {0}")]
    Manifest(#[from] toml::de::Error),

    #[error("Cannot convert {found} value to {expected}")]
    Conversion {
        expected: &'static str,
        found: &'static str,
    },

    #[error("Unknown entity: {0}")]
    UnknownEntity(String),

    #[error("Invalid URI: {0}")]
    InvalidUri(String),

    #[error("No route for URI: {0}")]
    UnroutableUri(String),

    #[error("Cannot update {0}: no unique fields and no assigned id")]
    MissingUpdateKey(String),
}

impl Error {
    /// True when SQLite reports the database file itself as damaged.
    pub fn is_corruption(&self) -> bool {
        match self {
            Error::Storage(rusqlite::Error::SqliteFailure(failure, _)) => matches!(
                failure.code,
                rusqlite::ErrorCode::DatabaseCorrupt | rusqlite::ErrorCode::NotADatabase
            ),
            _ => false,
        }
    }
}
