/// Database and sessions
///
/// A `Database` is opened from a validated [`Catalog`]. It owns one table per
/// relation, one backing table and one live state per materialized view, the
/// sequences and the hook registry. It is shared between threads behind an
/// `Arc`; each thread works through its own [`Session`], which hands out
/// cursors. Cursors and lookups stay within their session.

use crate::catalog::Catalog;
use crate::changeset::IncrementalView;
use crate::cursor::Cursor;
use crate::error::{CursorError, Result};
use crate::mview::MaterializedView;
use crate::sequence::Sequence;
use crate::table::{Schema, Table};
use crate::trigger::{TriggerRegistry, TriggerType};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub type SharedView = Arc<Mutex<MaterializedView>>;

pub struct Database {
    catalog: Catalog,
    /// Base tables and materialized view backing tables
    relations: HashMap<String, Arc<RwLock<Table>>>,
    sequences: HashMap<String, Arc<Sequence>>,
    views: HashMap<String, SharedView>,
    /// Views maintained from each source relation, in declaration order
    dependents: HashMap<String, Vec<SharedView>>,
    triggers: TriggerRegistry,
    next_session: AtomicU64,
}

impl Database {
    pub fn new(catalog: Catalog) -> Result<Arc<Self>> {
        catalog.validate()?;

        let mut relations = HashMap::new();
        for schema in &catalog.relations {
            relations.insert(
                schema.name.clone(),
                Arc::new(RwLock::new(Table::new(Arc::new(schema.clone())))),
            );
        }

        let mut sequences = HashMap::new();
        for def in &catalog.sequences {
            sequences.insert(def.name.clone(), Arc::new(Sequence::new(def.clone())?));
        }

        let mut views = HashMap::new();
        let mut dependents: HashMap<String, Vec<SharedView>> = HashMap::new();
        for def in &catalog.materialized_views {
            let source = relations
                .get(&def.source)
                .cloned()
                .ok_or_else(|| CursorError::UnknownRelation(def.source.clone()))?;
            let backing_schema = def.backing_schema(source.read().schema())?;
            let backing = Arc::new(RwLock::new(Table::new(Arc::new(backing_schema))));
            let view = Arc::new(Mutex::new(MaterializedView::new(
                def.clone(),
                source,
                Arc::clone(&backing),
            )?));
            relations.insert(def.name.clone(), backing);
            dependents
                .entry(def.source.clone())
                .or_default()
                .push(Arc::clone(&view));
            views.insert(def.name.clone(), view);
        }

        log::info!(
            "database opened with {} relations, {} sequences and {} materialized views",
            catalog.relations.len(),
            catalog.sequences.len(),
            catalog.materialized_views.len()
        );
        Ok(Arc::new(Database {
            catalog,
            relations,
            sequences,
            views,
            dependents,
            triggers: TriggerRegistry::new(),
            next_session: AtomicU64::new(1),
        }))
    }

    pub fn from_json(json: &str) -> Result<Arc<Self>> {
        Self::new(Catalog::from_json(json)?)
    }

    /// Open a new session.
    pub fn session(self: &Arc<Self>) -> Session {
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        log::debug!("session {} opened", id);
        Session::new(Arc::clone(self), id)
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn relation_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.relations.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn relation(&self, name: &str) -> Result<Arc<RwLock<Table>>> {
        self.relations
            .get(name)
            .cloned()
            .ok_or_else(|| CursorError::UnknownRelation(name.to_string()))
    }

    pub fn schema(&self, name: &str) -> Result<Arc<Schema>> {
        Ok(Arc::clone(self.relation(name)?.read().schema()))
    }

    pub fn sequence(&self, name: &str) -> Result<Arc<Sequence>> {
        self.sequences
            .get(name)
            .cloned()
            .ok_or_else(|| CursorError::UnknownSequence(name.to_string()))
    }

    pub fn materialized_view(&self, name: &str) -> Result<SharedView> {
        self.views
            .get(name)
            .cloned()
            .ok_or_else(|| CursorError::UnknownRelation(name.to_string()))
    }

    /// Re-derive a materialized view from its source table.
    pub fn rebuild_view(&self, name: &str) -> Result<()> {
        let view = self.materialized_view(name)?;
        let mut view = view.lock();
        view.rebuild()
    }

    pub(crate) fn dependent_views(&self, relation: &str) -> Vec<SharedView> {
        self.dependents.get(relation).cloned().unwrap_or_default()
    }

    pub fn triggers(&self) -> &TriggerRegistry {
        &self.triggers
    }

    /// Register a hook on a relation. Hooks run in registration order.
    pub fn register_trigger<F>(&self, relation: &str, trigger: TriggerType, hook: F) -> Result<()>
    where
        F: Fn(&mut Cursor) -> Result<()> + Send + Sync + 'static,
    {
        if !self.relations.contains_key(relation) {
            return Err(CursorError::UnknownRelation(relation.to_string()));
        }
        self.triggers.register(relation, trigger, hook);
        Ok(())
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Database {{ relations: {}, sequences: {}, views: {} }}",
            self.relations.len(),
            self.sequences.len(),
            self.views.len()
        )
    }
}

/// One session's access to a database
#[derive(Clone)]
pub struct Session {
    db: Arc<Database>,
    id: u64,
}

impl Session {
    pub(crate) fn new(db: Arc<Database>, id: u64) -> Self {
        Session { db, id }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// Open a cursor over a relation or materialized view.
    pub fn cursor(&self, relation: &str) -> Result<Cursor> {
        Cursor::new(Arc::clone(&self.db), self.id, relation)
    }

    pub fn next_value(&self, sequence: &str) -> Result<i64> {
        self.db.sequence(sequence)?.next_value()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Session {{ id: {} }}", self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::{Column, ColumnType};
    use crate::mview::MaterializedViewDef;
    use crate::sequence::SequenceDef;
    use std::thread;

    fn catalog() -> Catalog {
        Catalog::new()
            .relation(Schema::new(
                "facts",
                vec![
                    Column::new("id", ColumnType::Int, false),
                    Column::new("var", ColumnType::text(), false),
                    Column::new("amount", ColumnType::Int, true),
                ],
                &["id"],
            ))
            .sequence(SequenceDef::new("ids"))
            .materialized_view(
                MaterializedViewDef::new("totals", "facts")
                    .group_by("var", "var")
                    .sum("s", "amount"),
            )
    }

    #[test]
    fn test_open_and_lookup() {
        let db = Database::new(catalog()).unwrap();
        assert_eq!(db.relation_names(), vec!["facts", "totals"]);
        assert!(db.schema("totals").unwrap().is_read_only());
        assert!(matches!(db.relation("nope"), Err(CursorError::UnknownRelation(_))));
        assert!(matches!(db.sequence("nope"), Err(CursorError::UnknownSequence(_))));
        assert_eq!(db.dependent_views("facts").len(), 1);
        assert!(db.dependent_views("totals").is_empty());
    }

    #[test]
    fn test_sessions_have_distinct_ids() {
        let db = Database::new(catalog()).unwrap();
        let a = db.session();
        let b = db.session();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.cursor("facts").unwrap().session_id(), a.id());
    }

    #[test]
    fn test_register_trigger_requires_relation() {
        let db = Database::new(catalog()).unwrap();
        assert!(db.register_trigger("facts", TriggerType::PreInsert, |_| Ok(())).is_ok());
        assert!(db.register_trigger("nope", TriggerType::PreInsert, |_| Ok(())).is_err());
    }

    #[test]
    fn test_view_cursor_is_read_only() {
        let db = Database::new(catalog()).unwrap();
        let mut totals = db.session().cursor("totals").unwrap();
        totals.set_value("var", "A").unwrap();
        assert!(matches!(totals.insert(), Err(CursorError::ReadOnly(_))));
    }

    #[test]
    fn test_concurrent_writers_keep_view_consistent() {
        let db = Database::new(catalog()).unwrap();
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let db = Arc::clone(&db);
                thread::spawn(move || {
                    let session = db.session();
                    let mut facts = session.cursor("facts").unwrap();
                    for _ in 0..25 {
                        facts.set_value("id", session.next_value("ids").unwrap()).unwrap();
                        facts.set_value("var", if t % 2 == 0 { "even" } else { "odd" }).unwrap();
                        facts.set_value("amount", 2).unwrap();
                        facts.insert().unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let session = db.session();
        assert_eq!(session.cursor("facts").unwrap().count(), 100);
        let mut totals = session.cursor("totals").unwrap();
        totals.get(&["even".into()]).unwrap();
        assert_eq!(totals.value("s").unwrap(), &crate::column::ColumnValue::Int(100));
        totals.get(&["odd".into()]).unwrap();
        assert_eq!(totals.value("s").unwrap(), &crate::column::ColumnValue::Int(100));
    }
}
