//! Entity type descriptions
//!
//! An entity is any `Default` struct that describes itself once through an
//! [`EntityDescriptor`]: its name, optional key field, and an ordered list of
//! fields with accessor functions. The descriptor is the only source the
//! schema mapper reads; nothing is discovered at runtime.
//!
//! ```rust,ignore
//! impl Entity for Note {
//!     fn describe() -> EntityDescriptor<Self> {
//!         EntityDescriptor::<Self>::new("Note")
//!             .key("id", |n| n.id, |n, id| n.id = Some(id))
//!             .field(Field::text("title", |n| n.title.clone().into(), |n, v| {
//!                 n.title = v.decode()?;
//!                 Ok(())
//!             }))
//!             .field(
//!                 Field::<Self>::boolean("pinned", |n| n.pinned.into(), |n, v| {
//!                     n.pinned = v.decode()?;
//!                     Ok(())
//!                 })
//!                 .unique(),
//!             )
//!     }
//! }
//! ```
//!
//! A bare `Field::text(..)` passed straight to `field` takes its entity type
//! from the descriptor. Once a modifier such as `unique()` is chained onto it
//! that link is gone, so name the type up front: `Field::<Self>::text(..)`.

use crate::schema::{SchemaCache, TableSchema};
use crate::storage::{DataManager, IdentityMap};
use crate::value::Value;
use crate::Result;
use std::any::TypeId;
use std::sync::{Arc, Weak};

/// Semantic type of an entity field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Integer,
    Real,
    Text,
    Blob,
    Boolean,
    /// Milliseconds since the Unix epoch
    Date,
    /// Reference to another entity type, stored as its row id
    Reference(&'static str),
    /// A type with no SQL mapping; the field is not persisted
    Other(&'static str),
}

/// How a field's value moves between the entity and a column.
pub enum Accessor<E> {
    Scalar {
        get: fn(&E) -> Value,
        set: fn(&mut E, Value) -> Result<()>,
    },
    Reference {
        /// Row id of the referenced entity, if it has one
        id: fn(&E, &IdentityMap) -> Option<i64>,
        /// Receives the stored foreign id (`None` when absent or <= 0)
        attach: fn(&mut E, Option<i64>, &DataManager) -> Result<()>,
    },
    Unmapped,
}

/// A single field of an entity type.
pub struct Field<E> {
    pub(crate) name: &'static str,
    pub(crate) ty: FieldType,
    pub(crate) column: Option<&'static str>,
    pub(crate) unique: bool,
    pub(crate) not_null: bool,
    pub(crate) accessor: Accessor<E>,
}

impl<E> Field<E> {
    /// Create a scalar field of the given semantic type
    pub fn scalar(
        name: &'static str,
        ty: FieldType,
        get: fn(&E) -> Value,
        set: fn(&mut E, Value) -> Result<()>,
    ) -> Self {
        Self {
            name,
            ty,
            column: None,
            unique: false,
            not_null: false,
            accessor: Accessor::Scalar { get, set },
        }
    }

    pub fn integer(name: &'static str, get: fn(&E) -> Value, set: fn(&mut E, Value) -> Result<()>) -> Self {
        Self::scalar(name, FieldType::Integer, get, set)
    }

    pub fn real(name: &'static str, get: fn(&E) -> Value, set: fn(&mut E, Value) -> Result<()>) -> Self {
        Self::scalar(name, FieldType::Real, get, set)
    }

    pub fn text(name: &'static str, get: fn(&E) -> Value, set: fn(&mut E, Value) -> Result<()>) -> Self {
        Self::scalar(name, FieldType::Text, get, set)
    }

    pub fn blob(name: &'static str, get: fn(&E) -> Value, set: fn(&mut E, Value) -> Result<()>) -> Self {
        Self::scalar(name, FieldType::Blob, get, set)
    }

    pub fn boolean(name: &'static str, get: fn(&E) -> Value, set: fn(&mut E, Value) -> Result<()>) -> Self {
        Self::scalar(name, FieldType::Boolean, get, set)
    }

    pub fn date(name: &'static str, get: fn(&E) -> Value, set: fn(&mut E, Value) -> Result<()>) -> Self {
        Self::scalar(name, FieldType::Date, get, set)
    }

    /// A join field holding another entity, persisted as that entity's id
    pub fn reference(
        name: &'static str,
        target: &'static str,
        id: fn(&E, &IdentityMap) -> Option<i64>,
        attach: fn(&mut E, Option<i64>, &DataManager) -> Result<()>,
    ) -> Self {
        Self {
            name,
            ty: FieldType::Reference(target),
            column: None,
            unique: false,
            not_null: false,
            accessor: Accessor::Reference { id, attach },
        }
    }

    /// A field whose type has no column representation
    pub fn other(name: &'static str, type_name: &'static str) -> Self {
        Self {
            name,
            ty: FieldType::Other(type_name),
            column: None,
            unique: false,
            not_null: false,
            accessor: Accessor::Unmapped,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }

    /// Override the derived column name
    pub fn column(mut self, name: &'static str) -> Self {
        self.column = Some(name);
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn field_type(&self) -> FieldType {
        self.ty
    }
}

/// The primary-key field of an entity type.
pub struct KeyField<E> {
    pub(crate) name: &'static str,
    get: fn(&E) -> Option<i64>,
    set: fn(&mut E, i64),
}

impl<E> KeyField<E> {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The assigned id, if positive
    pub fn get(&self, entity: &E) -> Option<i64> {
        (self.get)(entity).filter(|id| *id > 0)
    }

    pub fn set(&self, entity: &mut E, id: i64) {
        (self.set)(entity, id)
    }
}

/// Complete description of an entity type.
pub struct EntityDescriptor<E> {
    pub(crate) name: &'static str,
    pub(crate) table: Option<&'static str>,
    pub(crate) key: Option<KeyField<E>>,
    pub(crate) identity: Option<fn(&E) -> &Identity>,
    pub(crate) fields: Vec<Field<E>>,
    pub(crate) multi_unique: Option<&'static str>,
}

impl<E> EntityDescriptor<E> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            table: None,
            key: None,
            identity: None,
            fields: Vec::new(),
            multi_unique: None,
        }
    }

    /// Use an explicit table name instead of the derived one
    pub fn table(mut self, name: &'static str) -> Self {
        self.table = Some(name);
        self
    }

    /// Declare the integer primary-key field
    pub fn key(mut self, name: &'static str, get: fn(&E) -> Option<i64>, set: fn(&mut E, i64)) -> Self {
        self.key = Some(KeyField { name, get, set });
        self
    }

    /// Track instances of a key-less type through the identity map
    pub fn tracked(mut self, identity: fn(&E) -> &Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn field(mut self, field: Field<E>) -> Self {
        self.fields.push(field);
        self
    }

    /// Composite uniqueness over a comma-separated field list, replace on conflict
    pub fn multi_unique(mut self, fields: &'static str) -> Self {
        self.multi_unique = Some(fields);
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// A type the engine can persist.
pub trait Entity: Default + Send + 'static {
    fn describe() -> EntityDescriptor<Self>;
}

/// Reference identity for instances of key-less entity types.
///
/// Every constructed (or cloned) `Identity` is distinct. The identity map keys
/// on it, so an entry lives exactly as long as the instance carrying it.
pub struct Identity(Arc<()>);

impl Identity {
    pub fn new() -> Self {
        Self(Arc::new(()))
    }

    pub(crate) fn key(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    pub(crate) fn token(&self) -> Weak<()> {
        Arc::downgrade(&self.0)
    }
}

impl Default for Identity {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for Identity {
    /// A clone is a new instance and gets a new identity.
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Identity({:#x})", self.key())
    }
}

/// Type-erased handle to a registered entity type.
#[derive(Clone, Copy)]
pub struct EntityType {
    type_id: TypeId,
    type_name: &'static str,
    schema: fn(&SchemaCache) -> Arc<TableSchema>,
}

impl EntityType {
    pub fn of<E: Entity>() -> Self {
        Self {
            type_id: TypeId::of::<E>(),
            type_name: std::any::type_name::<E>(),
            schema: table_schema_of::<E>,
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Resolve the table schema through the shared cache
    pub fn table_schema(&self, cache: &SchemaCache) -> Arc<TableSchema> {
        (self.schema)(cache)
    }
}

fn table_schema_of<E: Entity>(cache: &SchemaCache) -> Arc<TableSchema> {
    cache.entity::<E>().table().clone()
}

impl std::fmt::Debug for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EntityType({})", self.type_name)
    }
}

impl PartialEq for EntityType {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identities_are_distinct() {
        let a = Identity::new();
        let b = a.clone();
        assert_ne!(a.key(), b.key());
    }

    #[test]
    fn test_key_field_ignores_unassigned() {
        #[derive(Default)]
        struct Thing {
            id: Option<i64>,
        }
        let descriptor: EntityDescriptor<Thing> =
            EntityDescriptor::<Thing>::new("Thing").key("id", |t| t.id, |t, id| t.id = Some(id));
        let key = descriptor.key.unwrap();

        let mut thing = Thing { id: Some(0) };
        assert_eq!(key.get(&thing), None);
        key.set(&mut thing, 5);
        assert_eq!(key.get(&thing), Some(5));
    }

    #[test]
    fn test_field_modifiers() {
        struct Thing {
            slug: String,
        }
        let field = Field::<Thing>::text("slug", |t| t.slug.clone().into(), |t, v| {
            t.slug = v.decode()?;
            Ok(())
        })
        .unique()
        .not_null()
        .column("url_slug");
        assert!(field.unique);
        assert!(field.not_null);
        assert_eq!(field.column, Some("url_slug"));
        assert_eq!(field.field_type(), FieldType::Text);
    }
}
