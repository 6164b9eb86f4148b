//! Schema mapper
//!
//! Turns an [`EntityDescriptor`] into column mappings. Results are cached per
//! Rust type in a [`SchemaCache`]; the cache only ever grows.

use crate::entity::{Accessor, Entity, EntityDescriptor, FieldType, Identity, KeyField};
use crate::naming::{self, ID_COLUMN};
use parking_lot::RwLock;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// One persisted field.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnMapping {
    /// Field name on the entity
    pub field: &'static str,
    /// Column name in the table
    pub name: String,
    pub sql_type: &'static str,
    pub nullable: bool,
    pub unique: bool,
    /// Target entity name for join fields
    pub reference: Option<&'static str>,
}

/// Type-erased table definition of an entity type.
#[derive(Debug, Clone, PartialEq)]
pub struct TableSchema {
    pub entity: &'static str,
    pub name: String,
    /// Mapped columns, excluding the id column
    pub columns: Vec<ColumnMapping>,
    /// Field bound to the id column, if the type declares one
    pub key_field: Option<&'static str>,
    /// Columns of the composite uniqueness constraint, in declaration order
    pub multi_unique: Vec<String>,
}

impl TableSchema {
    pub fn column(&self, name: &str) -> Option<&ColumnMapping> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn unique_columns(&self) -> impl Iterator<Item = &ColumnMapping> {
        self.columns.iter().filter(|c| c.unique)
    }
}

/// Map a semantic field type to its SQL type.
///
/// Types that may legitimately be absent carry a trailing `NULL` marker which
/// the DDL builder strips for `not_null` fields.
pub fn sql_type(ty: FieldType) -> Option<&'static str> {
    match ty {
        FieldType::Integer | FieldType::Boolean => Some("INTEGER"),
        FieldType::Real => Some("REAL"),
        FieldType::Text => Some("TEXT"),
        FieldType::Blob => Some("BLOB"),
        FieldType::Date | FieldType::Reference(_) => Some("INTEGER NULL"),
        FieldType::Other(_) => None,
    }
}

/// A mapped column together with its accessor.
pub struct Binding<E> {
    pub column: String,
    pub unique: bool,
    pub accessor: Accessor<E>,
}

/// Typed schema of an entity: the table definition plus accessors.
pub struct EntitySchema<E> {
    table: Arc<TableSchema>,
    key: Option<KeyField<E>>,
    identity: Option<fn(&E) -> &Identity>,
    bindings: Vec<Binding<E>>,
}

impl<E> EntitySchema<E> {
    /// Derive the schema from a descriptor
    pub fn derive(descriptor: EntityDescriptor<E>) -> Self {
        let EntityDescriptor {
            name: entity,
            table,
            key,
            identity,
            fields,
            multi_unique,
        } = descriptor;

        let table_name = table
            .map(str::to_string)
            .unwrap_or_else(|| naming::table_name(entity));
        let key_name = key.as_ref().map(|k| k.name);

        let mut columns = Vec::with_capacity(fields.len());
        let mut bindings = Vec::with_capacity(fields.len());
        let mut renames = HashMap::new();

        for field in fields {
            if Some(field.name) == key_name {
                continue;
            }

            let column = field
                .column
                .map(str::to_string)
                .unwrap_or_else(|| naming::column_name(field.name));

            if column.eq_ignore_ascii_case(ID_COLUMN) {
                warn!("{}.{} maps onto the reserved {} column; skipped", entity, field.name, ID_COLUMN);
                continue;
            }

            let Some(sql_type) = sql_type(field.ty) else {
                warn!("{}.{} has no SQL mapping ({:?}); not persisted", entity, field.name, field.ty);
                continue;
            };

            if matches!(field.accessor, Accessor::Unmapped) {
                warn!("{}.{} has no accessor; not persisted", entity, field.name);
                continue;
            }

            renames.insert(field.name, column.clone());
            columns.push(ColumnMapping {
                field: field.name,
                name: column.clone(),
                sql_type,
                nullable: !field.not_null,
                unique: field.unique,
                reference: match field.ty {
                    FieldType::Reference(target) => Some(target),
                    _ => None,
                },
            });
            bindings.push(Binding {
                column,
                unique: field.unique,
                accessor: field.accessor,
            });
        }

        let multi_unique = match multi_unique {
            Some(list) => {
                let (columns, unknown) = multi_unique_columns(list, &renames, key_name);
                for field in unknown {
                    warn!("{}: multi-unique field {} is not a mapped field", entity, field);
                }
                columns
            }
            None => Vec::new(),
        };

        Self {
            table: Arc::new(TableSchema {
                entity,
                name: table_name,
                columns,
                key_field: key_name,
                multi_unique,
            }),
            key,
            identity,
            bindings,
        }
    }

    pub fn table(&self) -> &Arc<TableSchema> {
        &self.table
    }

    pub fn key(&self) -> Option<&KeyField<E>> {
        self.key.as_ref()
    }

    /// Identity of a tracked instance, or `None` for untracked types
    pub fn identity<'e>(&self, entity: &'e E) -> Option<&'e Identity> {
        self.identity.map(|identity| identity(entity))
    }

    pub fn bindings(&self) -> &[Binding<E>] {
        &self.bindings
    }
}

/// Process-lifetime cache of derived schemas, keyed by Rust type.
#[derive(Default)]
pub struct SchemaCache {
    entries: RwLock<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl SchemaCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the schema for `E`, deriving it on first use
    pub fn entity<E: Entity>(&self) -> Arc<EntitySchema<E>> {
        let type_id = TypeId::of::<E>();
        if let Some(found) = self.entries.read().get(&type_id).cloned() {
            if let Ok(schema) = found.downcast::<EntitySchema<E>>() {
                return schema;
            }
        }

        let derived = Arc::new(EntitySchema::derive(E::describe()));
        let stored = self
            .entries
            .write()
            .entry(type_id)
            .or_insert_with(|| derived.clone() as Arc<dyn Any + Send + Sync>)
            .clone();
        stored.downcast::<EntitySchema<E>>().unwrap_or(derived)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl std::fmt::Debug for SchemaCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaCache").field("types", &self.len()).finish()
    }
}

/// Resolve a comma-separated field list to column names, alongside the
/// names that match no mapped field. Unknown names fall back to their
/// derived column name.
fn multi_unique_columns<'a>(
    list: &'a str,
    renames: &HashMap<&str, String>,
    key_name: Option<&str>,
) -> (Vec<String>, Vec<&'a str>) {
    let mut columns = Vec::new();
    let mut unknown = Vec::new();
    for field in list.split(',').map(str::trim).filter(|f| !f.is_empty()) {
        if Some(field) == key_name {
            columns.push(ID_COLUMN.to_string());
        } else if let Some(column) = renames.get(field) {
            columns.push(column.clone());
        } else {
            unknown.push(field);
            columns.push(naming::column_name(field));
        }
    }
    (columns, unknown)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Field;

    #[derive(Default)]
    struct Listing {
        id: Option<i64>,
        tenant: String,
        slug: String,
        price: f64,
    }

    impl Entity for Listing {
        fn describe() -> EntityDescriptor<Self> {
            EntityDescriptor::<Self>::new("Listing")
                .key("id", |l| l.id, |l, id| l.id = Some(id))
                .field(Field::integer("id", |l| l.id.into(), |_, _| Ok(())))
                .field(
                    Field::<Self>::text("tenant", |l| l.tenant.clone().into(), |l, v| {
                        l.tenant = v.decode()?;
                        Ok(())
                    })
                    .not_null(),
                )
                .field(
                    Field::<Self>::text("slug", |l| l.slug.clone().into(), |l, v| {
                        l.slug = v.decode()?;
                        Ok(())
                    })
                    .column("url_slug"),
                )
                .field(Field::real("price", |l| l.price.into(), |l, v| {
                    l.price = v.decode()?;
                    Ok(())
                }))
                .field(Field::other("thumbnail", "Bitmap"))
                .multi_unique("tenant, slug")
        }
    }

    #[test]
    fn test_key_field_excluded_from_columns() {
        let schema = EntitySchema::derive(Listing::describe());
        let table = schema.table();
        assert_eq!(table.name, "listings");
        assert_eq!(table.key_field, Some("id"));
        let names: Vec<_> = table.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["tenant", "url_slug", "price"]);
    }

    #[test]
    fn test_unmappable_field_is_skipped() {
        let schema = EntitySchema::derive(Listing::describe());
        assert!(schema.table().columns.iter().all(|c| c.field != "thumbnail"));
        assert_eq!(schema.bindings().len(), 3);
    }

    #[test]
    fn test_column_metadata() {
        let schema = EntitySchema::derive(Listing::describe());
        let tenant = schema.table().column("tenant").unwrap();
        assert_eq!(tenant.sql_type, "TEXT");
        assert!(!tenant.nullable);
        assert!(!tenant.unique);
        assert_eq!(schema.table().column("price").unwrap().sql_type, "REAL");
    }

    #[test]
    fn test_multi_unique_uses_column_names() {
        let schema = EntitySchema::derive(Listing::describe());
        assert_eq!(schema.table().multi_unique, vec!["tenant", "url_slug"]);
    }

    #[test]
    fn test_multi_unique_reports_unknown_fields() {
        let renames = HashMap::from([("slug", "url_slug".to_string())]);
        let (columns, unknown) = multi_unique_columns("id, slug,, sluggish", &renames, Some("id"));
        assert_eq!(columns, vec!["_id", "url_slug", "sluggish"]);
        assert_eq!(unknown, vec!["sluggish"]);
    }

    #[test]
    fn test_cache_returns_same_schema() {
        let cache = SchemaCache::new();
        let a = cache.entity::<Listing>();
        let b = cache.entity::<Listing>();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_sql_types() {
        assert_eq!(sql_type(FieldType::Boolean), Some("INTEGER"));
        assert_eq!(sql_type(FieldType::Date), Some("INTEGER NULL"));
        assert_eq!(sql_type(FieldType::Reference("Author")), Some("INTEGER NULL"));
        assert_eq!(sql_type(FieldType::Other("Bitmap")), None);
    }
}
