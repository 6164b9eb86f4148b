//! Content routing
//!
//! Resolves `content://<authority>/<table>[/<id>]` URIs to configured entity
//! tables and serves raw row queries and mutations against them. Entity `i`
//! in the configuration owns route code `2i+1` for its table and `2i+2` for
//! single rows.

use crate::config::CubeConfig;
use crate::naming::ID_COLUMN;
use crate::schema::{Selection, TableSchema};
use crate::transaction::Cube;
use crate::uri::ResourceUri;
use crate::value::{Row, Value};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// A matched URI
#[derive(Debug, Clone)]
pub struct Route {
    pub code: u32,
    pub table: Arc<TableSchema>,
    pub id: Option<i64>,
}

impl Route {
    pub fn is_item(&self) -> bool {
        self.code % 2 == 0
    }
}

pub struct ContentRouter {
    cube: Cube,
    tables: HashMap<String, (u32, Arc<TableSchema>)>,
    mime_types: Mutex<HashMap<u32, String>>,
}

impl ContentRouter {
    /// Open the configured store and register a route pair per entity
    pub fn new(config: CubeConfig) -> Result<Self> {
        Self::from_cube(Cube::setup(config)?)
    }

    pub fn from_cube(cube: Cube) -> Result<Self> {
        let manager = cube.manager();
        let config = manager.config();
        let mut tables = HashMap::new();

        for (i, entity) in config.entities().iter().enumerate() {
            let table = entity.table_schema(manager.schemas());
            let code = u32::try_from(i * 2 + 1)
                .map_err(|_| Error::Config("too many entity types to route".into()))?;
            if config.is_debug() {
                debug!(
                    "Registering {} -> codes {} and {} for {}",
                    table.name,
                    code,
                    code + 1,
                    table.entity
                );
            }
            tables.insert(table.name.to_lowercase(), (code, table));
        }

        Ok(Self {
            cube,
            tables,
            mime_types: Mutex::new(HashMap::new()),
        })
    }

    pub fn cube(&self) -> &Cube {
        &self.cube
    }

    /// Match a URI against the registered routes
    pub fn route(&self, uri: &ResourceUri) -> Result<Route> {
        let unroutable = || Error::UnroutableUri(uri.to_uri_string());
        if uri.authority != self.cube.manager().config().authority() {
            return Err(unroutable());
        }
        let (code, table) = self.tables.get(&uri.table.to_lowercase()).ok_or_else(unroutable)?;
        Ok(Route {
            code: if uri.is_item() { code + 1 } else { *code },
            table: table.clone(),
            id: uri.id,
        })
    }

    /// MIME type of the resource: `vnd.<authority>.dir/...` for tables,
    /// `vnd.<authority>.item/...` for rows.
    pub fn mime_type(&self, uri: &ResourceUri) -> Result<String> {
        let route = self.route(uri)?;
        let mut cache = self.mime_types.lock();
        let mime = cache.entry(route.code).or_insert_with(|| {
            let authority = self.cube.manager().config().authority();
            format!(
                "vnd.{}.{}/vnd.{}.{}",
                authority,
                if route.is_item() { "item" } else { "dir" },
                authority,
                route.table.name
            )
        });
        Ok(mime.clone())
    }

    pub fn query(
        &self,
        uri: &ResourceUri,
        projection: Option<&[&str]>,
        selection: Option<&str>,
        args: &[Value],
        sort_order: Option<&str>,
    ) -> Result<Vec<Row>> {
        let route = self.route(uri)?;
        let (filter, args) = scoped(&route, selection, args);
        let mut select = Selection {
            filter,
            args,
            ..Selection::default()
        };
        if let Some(order) = sort_order {
            select = select.order_by(order);
        }
        self.cube
            .execute_loader(|dm| dm.select_rows(&route.table.name, projection, &select))
    }

    /// Insert a row, returning its URI when the store assigned an id
    pub fn insert(&self, uri: &ResourceUri, values: &Row) -> Result<Option<ResourceUri>> {
        let route = self.route(uri)?;
        let id = self
            .cube
            .execute_saver(|dm| dm.insert_row(&route.table.name, values))?;
        if id <= 0 {
            return Ok(None);
        }

        let manager = self.cube.manager();
        let created = manager.row_uri(&route.table.name, id);
        manager.notify_change(&created);
        Ok(Some(created))
    }

    pub fn update(&self, uri: &ResourceUri, values: &Row, selection: Option<&str>, args: &[Value]) -> Result<usize> {
        let route = self.route(uri)?;
        let (filter, args) = scoped(&route, selection, args);
        let count = self
            .cube
            .execute_updater(|dm| dm.update_rows(&route.table.name, values, filter.as_deref(), &args))?;
        if count > 0 {
            self.cube.manager().notify_change(uri);
        }
        Ok(count)
    }

    pub fn delete(&self, uri: &ResourceUri, selection: Option<&str>, args: &[Value]) -> Result<usize> {
        let route = self.route(uri)?;
        let (filter, args) = scoped(&route, selection, args);
        let count = self
            .cube
            .execute_deleter(|dm| dm.delete_rows(&route.table.name, filter.as_deref(), &args))?;
        if count > 0 {
            self.cube.manager().notify_change(uri);
        }
        Ok(count)
    }
}

/// Restrict a caller selection to the routed row, if any
fn scoped(route: &Route, selection: Option<&str>, args: &[Value]) -> (Option<String>, Vec<Value>) {
    let selection = selection.map(str::trim).filter(|s| !s.is_empty());
    match route.id {
        None => (selection.map(str::to_string), args.to_vec()),
        Some(id) => {
            let filter = match selection {
                Some(s) => format!("{} = ? AND ({})", ID_COLUMN, s),
                None => format!("{} = ?", ID_COLUMN),
            };
            let mut scoped_args = Vec::with_capacity(args.len() + 1);
            scoped_args.push(Value::Integer(id));
            scoped_args.extend_from_slice(args);
            (Some(filter), scoped_args)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Entity, EntityDescriptor, Field};
    use crate::notify::ChannelNotifier;
    use crossbeam::channel::Receiver;

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
    struct NoteTag {
        label: String,
    }

    impl Entity for NoteTag {
        fn describe() -> EntityDescriptor<Self> {
            EntityDescriptor::<Self>::new("NoteTag").field(Field::text(
                "label",
                |t| t.label.clone().into(),
                |t, v| {
                    t.label = v.decode()?;
                    Ok(())
                },
            ))
        }
    }

    const AUTHORITY: &str = "com.example.notes";

    fn router() -> (ContentRouter, Receiver<ResourceUri>) {
        let (notifier, rx) = ChannelNotifier::unbounded();
        let config = CubeConfig::in_memory()
            .with_authority(AUTHORITY)
            .with_notifier(Arc::new(notifier))
            .with_entity::<Note>()
            .with_entity::<NoteTag>();
        (ContentRouter::new(config).unwrap(), rx)
    }

    fn uri(path: &str) -> ResourceUri {
        ResourceUri::parse(&format!("content://{}/{}", AUTHORITY, path)).unwrap()
    }

    #[test]
    fn test_route_codes() {
        let (router, _rx) = router();
        assert_eq!(router.route(&uri("notes")).unwrap().code, 1);
        assert_eq!(router.route(&uri("notes/4")).unwrap().code, 2);
        assert_eq!(router.route(&uri("note_tags")).unwrap().code, 3);
        assert_eq!(router.route(&uri("NOTE_TAGS/1")).unwrap().code, 4);
    }

    #[test]
    fn test_unroutable() {
        let (router, _rx) = router();
        assert!(matches!(router.route(&uri("missing")), Err(Error::UnroutableUri(_))));
        let foreign = ResourceUri::table("other.authority", "notes");
        assert!(matches!(router.route(&foreign), Err(Error::UnroutableUri(_))));
    }

    #[test]
    fn test_mime_types() {
        let (router, _rx) = router();
        assert_eq!(
            router.mime_type(&uri("notes")).unwrap(),
            "vnd.com.example.notes.dir/vnd.com.example.notes.notes"
        );
        assert_eq!(
            router.mime_type(&uri("notes/9")).unwrap(),
            "vnd.com.example.notes.item/vnd.com.example.notes.notes"
        );
        assert_eq!(router.mime_types.lock().len(), 2);
    }

    #[test]
    fn test_insert_query_update_delete() {
        let (router, rx) = router();

        let created = router
            .insert(&uri("notes"), &Row::new().with("title", "first"))
            .unwrap()
            .unwrap();
        assert_eq!(created, uri("notes/1"));
        assert_eq!(rx.try_recv().unwrap(), created);
        router.insert(&uri("notes"), &Row::new().with("title", "second")).unwrap();
        rx.try_iter().count();

        let rows = router.query(&uri("notes"), None, None, &[], Some("_id DESC")).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("title"), Some(&Value::from("second")));

        let one = router
            .query(&created, Some(&["title"][..]), None, &[], None)
            .unwrap();
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].len(), 1);

        let changed = router
            .update(&created, &Row::new().with("title", "edited"), None, &[])
            .unwrap();
        assert_eq!(changed, 1);
        assert_eq!(rx.try_recv().unwrap(), created);

        let missed = router
            .update(&uri("notes"), &Row::new().with("title", "x"), Some("title = ?"), &[Value::from("nope")])
            .unwrap();
        assert_eq!(missed, 0);
        assert!(rx.try_recv().is_err());

        assert_eq!(router.delete(&uri("notes"), Some("title = ?"), &[Value::from("edited")]).unwrap(), 1);
        assert_eq!(rx.try_recv().unwrap(), uri("notes"));
        assert_eq!(router.cube().manager().count_all::<Note>(), 1);
    }

    #[test]
    fn test_item_scope_combines_with_selection() {
        let (router, _rx) = router();
        router.insert(&uri("notes"), &Row::new().with("title", "a")).unwrap();
        router.insert(&uri("notes"), &Row::new().with("title", "a")).unwrap();

        let rows = router
            .query(&uri("notes/2"), None, Some("title = ?"), &[Value::from("a")], None)
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get(ID_COLUMN), Some(&Value::Integer(2)));
    }
}
