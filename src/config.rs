//! Configuration
//!
//! A [`CubeConfig`] is assembled either in code through its builder or from a
//! `cube.toml` [`Manifest`] whose entity names are resolved against an
//! [`EntityRegistry`].

use crate::entity::{Entity, EntityType};
use crate::notify::{ChangeNotifier, LogNotifier};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::error;

/// Database name selecting a private in-memory store
pub const IN_MEMORY: &str = ":memory:";

/// Appended to the authority when the manifest names no database
pub const DATABASE_DEFAULT_NAME_SUFFIX: &str = "_cube.db";

pub const DEFAULT_AUTHORITY: &str = "cube";

/// Receives storage corruption reports. Implementations log or alert; the
/// engine never attempts a repair itself.
pub trait CorruptionHandler: Send + Sync {
    fn on_corruption(&self, database: &str, error: &Error);
}

/// Default handler: log and carry on
#[derive(Debug, Default)]
pub struct LogCorruptionHandler;

impl CorruptionHandler for LogCorruptionHandler {
    fn on_corruption(&self, database: &str, err: &Error) {
        error!("Database {} reported corruption: {}", database, err);
    }
}

/// Everything the engine needs to open a store.
#[derive(Clone)]
pub struct CubeConfig {
    database: String,
    version: u32,
    authority: String,
    debug: bool,
    log_queries: bool,
    write_ahead_logging: bool,
    entities: Vec<EntityType>,
    error_handler: Arc<dyn CorruptionHandler>,
    notifier: Arc<dyn ChangeNotifier>,
}

impl CubeConfig {
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            version: 1,
            authority: DEFAULT_AUTHORITY.to_string(),
            debug: false,
            log_queries: false,
            write_ahead_logging: true,
            entities: Vec::new(),
            error_handler: Arc::new(LogCorruptionHandler),
            notifier: Arc::new(LogNotifier::new(false)),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(IN_MEMORY)
    }

    /// Build a config from a manifest, resolving entity names in `registry`
    pub fn from_manifest(manifest: &Manifest, registry: &EntityRegistry) -> Result<Self> {
        let database = manifest
            .database_name()
            .ok_or_else(|| Error::Config("manifest names neither a database nor an authority".into()))?;

        let entities = manifest
            .entities
            .iter()
            .map(|name| registry.resolve(name))
            .collect::<Result<Vec<_>>>()?;

        let mut config = Self::new(database)
            .with_version(manifest.version.filter(|v| *v > 0).unwrap_or(1))
            .with_debug(manifest.debug)
            .with_log_queries(manifest.query_log)
            .with_write_ahead_logging(manifest.write_ahead_logging.unwrap_or(true))
            .with_entities(entities);
        if let Some(authority) = manifest.authority.as_deref().filter(|a| !a.is_empty()) {
            config = config.with_authority(authority);
        }
        config.notifier = Arc::new(LogNotifier::new(config.debug));
        Ok(config)
    }

    // ========== Builder ==========

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn with_authority(mut self, authority: impl Into<String>) -> Self {
        self.authority = authority.into();
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_log_queries(mut self, log_queries: bool) -> Self {
        self.log_queries = log_queries;
        self
    }

    pub fn with_write_ahead_logging(mut self, enabled: bool) -> Self {
        self.write_ahead_logging = enabled;
        self
    }

    /// Append an entity type; declaration order is table creation order
    pub fn with_entity<E: Entity>(mut self) -> Self {
        let entity = EntityType::of::<E>();
        if !self.entities.contains(&entity) {
            self.entities.push(entity);
        }
        self
    }

    pub fn with_entities(mut self, entities: Vec<EntityType>) -> Self {
        for entity in entities {
            if !self.entities.contains(&entity) {
                self.entities.push(entity);
            }
        }
        self
    }

    pub fn with_error_handler(mut self, handler: Arc<dyn CorruptionHandler>) -> Self {
        self.error_handler = handler;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn ChangeNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    // ========== Accessors ==========

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    pub fn is_debug(&self) -> bool {
        self.debug
    }

    pub fn log_queries(&self) -> bool {
        self.log_queries
    }

    pub fn write_ahead_logging(&self) -> bool {
        self.write_ahead_logging
    }

    pub fn entities(&self) -> &[EntityType] {
        &self.entities
    }

    pub fn error_handler(&self) -> &Arc<dyn CorruptionHandler> {
        &self.error_handler
    }

    pub fn notifier(&self) -> &Arc<dyn ChangeNotifier> {
        &self.notifier
    }

    pub fn is_in_memory(&self) -> bool {
        self.database == IN_MEMORY
    }

    /// Reject configurations that cannot open a store
    pub fn validate(&self) -> Result<()> {
        if self.database.trim().is_empty() {
            return Err(Error::Config("database name is empty".into()));
        }
        if self.version == 0 {
            return Err(Error::Config("schema version must be positive".into()));
        }
        if self.authority.trim().is_empty() {
            return Err(Error::Config("content authority is empty".into()));
        }
        Ok(())
    }
}

impl std::fmt::Debug for CubeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CubeConfig")
            .field("database", &self.database)
            .field("version", &self.version)
            .field("authority", &self.authority)
            .field("debug", &self.debug)
            .field("log_queries", &self.log_queries)
            .field("write_ahead_logging", &self.write_ahead_logging)
            .field("entities", &self.entities)
            .finish_non_exhaustive()
    }
}

// ========== Manifest ==========

/// On-disk form of the configuration (`cube.toml`).
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct Manifest {
    pub database: Option<String>,
    pub version: Option<u32>,
    pub authority: Option<String>,
    pub debug: bool,
    pub query_log: bool,
    pub write_ahead_logging: Option<bool>,
    pub entities: Vec<String>,
}

impl Manifest {
    /// The configured database name, falling back to `<authority>_cube.db`
    pub fn database_name(&self) -> Option<String> {
        match self.database.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => Some(name.to_string()),
            _ => self
                .authority
                .as_deref()
                .filter(|authority| !authority.is_empty())
                .map(|authority| format!("{}{}", authority, DATABASE_DEFAULT_NAME_SUFFIX)),
        }
    }
}

pub fn default_manifest_path() -> PathBuf {
    PathBuf::from("cube.toml")
}

/// Load a manifest; a missing file is `Ok(None)`
pub fn load_manifest(path: Option<&Path>) -> Result<Option<Manifest>> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(default_manifest_path);
    if !path.exists() {
        return Ok(None);
    }

    let contents = std::fs::read_to_string(&path)?;
    let manifest: Manifest = toml::from_str(&contents)?;
    Ok(Some(manifest))
}

pub fn write_manifest(path: &Path, manifest: &Manifest, force: bool) -> Result<()> {
    if path.exists() && !force {
        return Err(Error::Config(format!(
            "manifest already exists at {} (use --force to overwrite)",
            path.display()
        )));
    }

    let contents = toml::to_string_pretty(manifest).map_err(|e| Error::Config(e.to_string()))?;
    std::fs::write(path, contents)?;
    Ok(())
}

/// Maps manifest entity names to registered Rust types.
#[derive(Debug, Default, Clone)]
pub struct EntityRegistry {
    types: HashMap<String, EntityType>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `E` under its descriptor name
    pub fn register<E: Entity>(&mut self) -> &mut Self {
        let name = E::describe().name();
        self.types.insert(name.to_string(), EntityType::of::<E>());
        self
    }

    pub fn resolve(&self, name: &str) -> Result<EntityType> {
        self.types
            .get(name.trim())
            .copied()
            .ok_or_else(|| Error::UnknownEntity(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{EntityDescriptor, Field};
    use tempfile::TempDir;

    #[derive(Default)]
    struct Note {
        title: String,
    }

    impl Entity for Note {
        fn describe() -> EntityDescriptor<Self> {
            EntityDescriptor::<Self>::new("Note").field(Field::text("title", |n| n.title.clone().into(), |n, v| {
                n.title = v.decode()?;
                Ok(())
            }))
        }
    }

    fn registry() -> EntityRegistry {
        let mut registry = EntityRegistry::new();
        registry.register::<Note>();
        registry
    }

    #[test]
    fn test_defaults() {
        let config = CubeConfig::new("app.db");
        assert_eq!(config.version(), 1);
        assert_eq!(config.authority(), DEFAULT_AUTHORITY);
        assert!(config.write_ahead_logging());
        assert!(!config.is_in_memory());
        assert!(CubeConfig::in_memory().is_in_memory());
    }

    #[test]
    fn test_validate() {
        assert!(CubeConfig::new("app.db").validate().is_ok());
        assert!(matches!(CubeConfig::new(" ").validate(), Err(Error::Config(_))));
        assert!(matches!(
            CubeConfig::new("app.db").with_version(0).validate(),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_entities_are_deduplicated() {
        let config = CubeConfig::in_memory().with_entity::<Note>().with_entity::<Note>();
        assert_eq!(config.entities().len(), 1);
    }

    #[test]
    fn test_manifest_resolution() {
        let manifest: Manifest = toml::from_str(
            r#"
            authority = "com.example.notes"
            version = 3
            query_log = true
            entities = ["Note"]
            "#,
        )
        .unwrap();

        let config = CubeConfig::from_manifest(&manifest, &registry()).unwrap();
        assert_eq!(config.database(), "com.example.notes_cube.db");
        assert_eq!(config.version(), 3);
        assert!(config.log_queries());
        assert!(config.write_ahead_logging());
        assert_eq!(config.entities(), &[EntityType::of::<Note>()]);
    }

    #[test]
    fn test_manifest_version_zero_means_one() {
        let manifest = Manifest {
            database: Some("app.db".into()),
            version: Some(0),
            ..Manifest::default()
        };
        assert_eq!(CubeConfig::from_manifest(&manifest, &registry()).unwrap().version(), 1);
    }

    #[test]
    fn test_unknown_entity_is_fatal() {
        let manifest = Manifest {
            database: Some("app.db".into()),
            entities: vec!["Missing".into()],
            ..Manifest::default()
        };
        let err = CubeConfig::from_manifest(&manifest, &registry()).unwrap_err();
        assert!(matches!(err, Error::UnknownEntity(name) if name == "Missing"));
    }

    #[test]
    fn test_manifest_without_name_or_authority() {
        let err = CubeConfig::from_manifest(&Manifest::default(), &registry()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_write_and_load_manifest() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cube.toml");
        let manifest = Manifest {
            database: Some("notes.db".into()),
            version: Some(2),
            entities: vec!["Note".into()],
            ..Manifest::default()
        };

        write_manifest(&path, &manifest, false).unwrap();
        assert!(write_manifest(&path, &manifest, false).is_err());
        write_manifest(&path, &manifest, true).unwrap();

        let loaded = load_manifest(Some(&path)).unwrap().unwrap();
        assert_eq!(loaded, manifest);
        assert!(load_manifest(Some(&dir.path().join("absent.toml"))).unwrap().is_none());
    }
}
