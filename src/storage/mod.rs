//! Storage Layer - identity-tracking persistence over SQLite
//!
//! - `manager`: the `DataManager` CRUD engine
//! - `identity`: instance to row id associations for key-less types
//! - `cursor`: lazy, windowed entity iteration

pub mod cursor;
pub mod identity;
pub mod manager;

pub use cursor::EntityCursor;
pub use identity::IdentityMap;
pub use manager::{DataManager, MAX_REFERENCE_DEPTH};
