use std::fmt;
use std::sync::Arc;

use crate::logic::reconcile::Reconciler;
use crate::model::{
    merge_fields, EmptyState, Evaluated, FieldConfig, Fields, ParentRecord, RelationRegistry, Relationship,
    Row, RowKey, SyncPlan, SyncReport, TableAction, TableColumn, TableView, TempIdGenerator, UuidTempIds,
    WorkingList,
};
use crate::store::{RelationStore, StoreError};

/// What a before-create / before-update hook can see.
pub struct HookContext<'a> {
    /// Proposed field values
    pub data: &'a Fields,
    /// Current working rows
    pub state: &'a [Row],
    /// State of the enclosing form
    pub parent_state: &'a Fields,
    pub record: Option<&'a ParentRecord>,
    pub field: &'a TableField,
}

/// Returning `Some(map)` merges the map over the proposed data, hook keys winning.
pub type Hook = Arc<dyn Fn(&HookContext<'_>) -> Option<Fields> + Send + Sync>;

/// Called after every working-list mutation.
pub trait ChangeNotifier: Send + Sync {
    fn state_changed(&self, field: &str, rows: &[Row]);
}

/// Logs each change at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl ChangeNotifier for LogNotifier {
    fn state_changed(&self, field: &str, rows: &[Row]) {
        log::debug!("Field '{}' now holds {} rows", field, rows.len());
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TableFieldError {
    #[error("The {0} action is disabled for this field")]
    ActionDisabled(TableAction),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// An editable table of related records embedded in a parent record's form.
///
/// Edits only touch the in-memory working list; `save` reconciles it with the
/// store in one transaction.
pub struct TableField {
    name: String,
    relationship_name: Evaluated<Option<String>>,
    create_disabled: Evaluated<bool>,
    edit_disabled: Evaluated<bool>,
    delete_disabled: Evaluated<bool>,
    default_record_data: Evaluated<Fields>,
    heading: Evaluated<Option<String>>,
    columns: Evaluated<Vec<TableColumn>>,
    empty_state_heading: Evaluated<Option<String>>,
    empty_state_description: Evaluated<Option<String>>,
    empty_state_icon: Evaluated<Option<String>>,
    before_create: Option<Hook>,
    before_update: Option<Hook>,
    temp_ids: Arc<dyn TempIdGenerator>,
    notifier: Option<Arc<dyn ChangeNotifier>>,

    parent: Option<ParentRecord>,
    relationship: Option<Relationship>,
    state: WorkingList,
}

impl TableField {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            relationship_name: Evaluated::default(),
            create_disabled: Evaluated::default(),
            edit_disabled: Evaluated::default(),
            delete_disabled: Evaluated::default(),
            default_record_data: Evaluated::default(),
            heading: Evaluated::default(),
            columns: Evaluated::default(),
            empty_state_heading: Evaluated::default(),
            empty_state_description: Evaluated::default(),
            empty_state_icon: Evaluated::default(),
            before_create: None,
            before_update: None,
            temp_ids: Arc::new(UuidTempIds),
            notifier: None,
            parent: None,
            relationship: None,
            state: WorkingList::default(),
        }
    }

    pub fn from_config(config: &FieldConfig) -> Self {
        Self::new(config.name.clone())
            .relationship(config.relationship.clone())
            .heading(config.heading.clone())
            .disable_create(config.disable_create)
            .disable_edit(config.disable_edit)
            .disable_delete(config.disable_delete)
            .default_record_data(config.default_record_data.clone())
            .columns(config.columns.clone())
            .empty_state_heading(config.empty_state.heading.clone())
            .empty_state_description(config.empty_state.description.clone())
            .empty_state_icon(config.empty_state.icon.clone())
    }

    pub fn relationship(mut self, name: impl Into<Evaluated<Option<String>>>) -> Self {
        self.relationship_name = name.into();
        self
    }

    pub fn disable_create(mut self, condition: impl Into<Evaluated<bool>>) -> Self {
        self.create_disabled = condition.into();
        self
    }

    pub fn disable_edit(mut self, condition: impl Into<Evaluated<bool>>) -> Self {
        self.edit_disabled = condition.into();
        self
    }

    pub fn disable_delete(mut self, condition: impl Into<Evaluated<bool>>) -> Self {
        self.delete_disabled = condition.into();
        self
    }

    pub fn default_record_data(mut self, defaults: impl Into<Evaluated<Fields>>) -> Self {
        self.default_record_data = defaults.into();
        self
    }

    pub fn heading(mut self, heading: impl Into<Evaluated<Option<String>>>) -> Self {
        self.heading = heading.into();
        self
    }

    pub fn columns(mut self, columns: impl Into<Evaluated<Vec<TableColumn>>>) -> Self {
        self.columns = columns.into();
        self
    }

    pub fn empty_state_heading(mut self, heading: impl Into<Evaluated<Option<String>>>) -> Self {
        self.empty_state_heading = heading.into();
        self
    }

    pub fn empty_state_description(mut self, description: impl Into<Evaluated<Option<String>>>) -> Self {
        self.empty_state_description = description.into();
        self
    }

    pub fn empty_state_icon(mut self, icon: impl Into<Evaluated<Option<String>>>) -> Self {
        self.empty_state_icon = icon.into();
        self
    }

    pub fn before_create_record(
        mut self,
        hook: impl Fn(&HookContext<'_>) -> Option<Fields> + Send + Sync + 'static,
    ) -> Self {
        self.before_create = Some(Arc::new(hook));
        self
    }

    pub fn before_update_record(
        mut self,
        hook: impl Fn(&HookContext<'_>) -> Option<Fields> + Send + Sync + 'static,
    ) -> Self {
        self.before_update = Some(Arc::new(hook));
        self
    }

    pub fn temp_ids(mut self, generator: impl TempIdGenerator + 'static) -> Self {
        self.temp_ids = Arc::new(generator);
        self
    }

    pub fn on_state_changed(mut self, notifier: impl ChangeNotifier + 'static) -> Self {
        self.notifier = Some(Arc::new(notifier));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rows(&self) -> &[Row] {
        self.state.rows()
    }

    pub fn state(&self) -> &WorkingList {
        &self.state
    }

    pub fn parent(&self) -> Option<&ParentRecord> {
        self.parent.as_ref()
    }

    /// The relationship bound by the last `hydrate`, if any
    pub fn bound_relationship(&self) -> Option<&Relationship> {
        self.relationship.as_ref()
    }

    pub fn is_create_disabled(&self) -> bool {
        self.create_disabled.evaluate()
    }

    pub fn is_edit_disabled(&self) -> bool {
        self.edit_disabled.evaluate()
    }

    pub fn is_delete_disabled(&self) -> bool {
        self.delete_disabled.evaluate()
    }

    /// Binds the field to `parent` and loads the persisted rows.
    ///
    /// Without a resolvable relationship the working list starts empty and stays
    /// transient: `save` will not write anything.
    pub async fn hydrate<S: RelationStore + ?Sized>(
        &mut self,
        store: &S,
        registry: &RelationRegistry,
        parent: Option<ParentRecord>,
    ) -> Result<(), StoreError> {
        let relation_name = self.relationship_name.evaluate();
        self.relationship = registry.resolve(parent.as_ref(), relation_name.as_deref());
        self.parent = parent;

        let rows = match &self.relationship {
            Some(relationship) => store.fetch_related(relationship).await?,
            None => Vec::new(),
        };
        self.state = WorkingList::new(rows);
        Ok(())
    }

    pub fn create_record(&mut self, data: Fields, parent_state: &Fields) -> Result<RowKey, TableFieldError> {
        if self.is_create_disabled() {
            return Err(TableFieldError::ActionDisabled(TableAction::Create));
        }

        let data = match &self.before_create {
            Some(hook) => self.call_hook(hook, data, parent_state),
            None => data,
        };
        let defaults = self.default_record_data.evaluate();
        let temp_id = self.temp_ids.next_temp_id();

        let key = self.state.create(defaults, data, temp_id);
        self.notify();
        Ok(key)
    }

    /// Returns false when no row has `key`; the working list is then unchanged.
    pub fn update_record(&mut self, key: &RowKey, data: Fields, parent_state: &Fields) -> Result<bool, TableFieldError> {
        if self.is_edit_disabled() {
            return Err(TableFieldError::ActionDisabled(TableAction::Edit));
        }

        let data = match &self.before_update {
            Some(hook) => self.call_hook(hook, data, parent_state),
            None => data,
        };

        let updated = self.state.update(key, data);
        self.notify();
        Ok(updated)
    }

    /// Returns false when no row has `key`; the working list is then unchanged.
    pub fn delete_record(&mut self, key: &RowKey) -> Result<bool, TableFieldError> {
        if self.is_delete_disabled() {
            return Err(TableFieldError::ActionDisabled(TableAction::Delete));
        }

        let deleted = self.state.delete(key);
        self.notify();
        Ok(deleted)
    }

    fn call_hook(&self, hook: &Hook, data: Fields, parent_state: &Fields) -> Fields {
        let overlay = {
            let context = HookContext {
                data: &data,
                state: self.state.rows(),
                parent_state,
                record: self.parent.as_ref(),
                field: self,
            };
            hook(&context)
        };

        match overlay {
            Some(overlay) => merge_fields(data, overlay),
            None => data,
        }
    }

    fn notify(&self) {
        if let Some(notifier) = &self.notifier {
            notifier.state_changed(&self.name, self.state.rows());
        }
    }

    /// The plan `save` would apply right now; `None` without a relationship.
    pub async fn preview<S: RelationStore + ?Sized>(&self, store: &S) -> Result<Option<SyncPlan>, StoreError> {
        let Some(relationship) = &self.relationship else {
            return Ok(None);
        };
        let current = store.fetch_related(relationship).await?;
        Ok(Some(Reconciler::plan(relationship, &current, self.state.rows())))
    }

    /// Reconciles the working list with the store, then reloads it.
    ///
    /// On failure nothing from the pass is persisted and the working list is left
    /// as it was, so edits survive for another attempt. Once the pass has committed
    /// the save succeeds: if the reload fails, the rows are rebuilt from the report.
    pub async fn save<S: RelationStore + ?Sized>(&mut self, store: &S) -> Result<Option<SyncReport>, StoreError> {
        let Some(relationship) = &self.relationship else {
            log::debug!("Field '{}' has no relationship, nothing to save", self.name);
            return Ok(None);
        };

        let report = Reconciler::synchronize(store, relationship, self.state.rows()).await?;
        let rows = match store.fetch_related(relationship).await {
            Ok(rows) => rows,
            Err(e) => {
                log::warn!(
                    "Field '{}' saved but reloading {} failed, keeping the saved rows: {}",
                    self.name,
                    relationship.related_table(),
                    e
                );
                settled_rows(relationship, self.state.rows(), &report)
            }
        };
        self.state = WorkingList::new(rows);
        Ok(Some(report))
    }

    /// Resolves every option once.
    pub fn table_view(&self) -> TableView {
        let header_actions = if self.is_create_disabled() {
            Vec::new()
        } else {
            vec![TableAction::Create]
        };

        let mut row_actions = Vec::new();
        if !self.is_edit_disabled() {
            row_actions.push(TableAction::Edit);
        }
        if !self.is_delete_disabled() {
            row_actions.push(TableAction::Delete);
        }

        TableView {
            field: self.name.clone(),
            heading: self.heading.evaluate(),
            columns: self.columns.evaluate(),
            header_actions,
            row_actions,
            empty_state: EmptyState {
                heading: self.empty_state_heading.evaluate(),
                description: self.empty_state_description.evaluate(),
                icon: self.empty_state_icon.evaluate(),
            },
        }
    }
}

impl fmt::Debug for TableField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableField")
            .field("name", &self.name)
            .field("parent", &self.parent)
            .field("relationship", &self.relationship)
            .field("rows", &self.state.len())
            .finish_non_exhaustive()
    }
}

/// The working list as persisted by a committed pass: pending rows take their
/// assigned ids and rows the pass did not keep are dropped.
fn settled_rows(relationship: &Relationship, working: &[Row], report: &SyncReport) -> Vec<Row> {
    let mut settled: Vec<Row> = Vec::with_capacity(report.members.len());
    for row in working {
        let id = match (row.id, &row.temp_id) {
            (Some(id), _) => id,
            (None, Some(temp_id)) => match report.assigned_ids.get(temp_id) {
                Some(id) => *id,
                None => continue,
            },
            (None, None) => continue,
        };
        if !report.members.contains(&id) {
            continue;
        }

        let mut fields = row.attributes().clone();
        if let Relationship::OneToMany(rel) = relationship {
            fields.insert(rel.foreign_key.clone(), rel.parent.id.into());
        }
        match settled.iter_mut().find(|r| r.id == Some(id)) {
            Some(existing) => existing.fields = merge_fields(existing.fields.clone(), fields),
            None => settled.push(Row::persisted(id, fields)),
        }
    }
    settled
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RelationLink, RelationshipDef, SequentialTempIds};
    use crate::store::MemoryStore;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn fields(value: serde_json::Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    fn registry() -> RelationRegistry {
        RelationRegistry::new(vec![
            RelationshipDef {
                parent_table: "posts".into(),
                name: "tags".into(),
                related_table: "tags".into(),
                link: RelationLink::ManyToMany {
                    pivot_table: "post_tag".into(),
                    foreign_pivot_key: "post_id".into(),
                    related_pivot_key: "tag_id".into(),
                },
            },
            RelationshipDef {
                parent_table: "posts".into(),
                name: "comments".into(),
                related_table: "comments".into(),
                link: RelationLink::OneToMany {
                    foreign_key: "post_id".into(),
                },
            },
        ])
    }

    #[derive(Default, Clone)]
    struct CountingNotifier(Arc<Mutex<Vec<usize>>>);

    impl ChangeNotifier for CountingNotifier {
        fn state_changed(&self, _field: &str, rows: &[Row]) {
            self.0.lock().push(rows.len());
        }
    }

    #[test]
    fn test_create_merges_defaults_and_generates_temp_id() {
        let mut field = TableField::new("items")
            .default_record_data(fields(json!({"status": "draft"})))
            .temp_ids(SequentialTempIds::new("t"));

        let key = field
            .create_record(fields(json!({"status": "final", "name": "Z"})), &Fields::new())
            .unwrap();

        assert_eq!(key, RowKey::Temp("t1".into()));
        assert_eq!(
            serde_json::to_value(field.rows()).unwrap(),
            json!([{"status": "final", "name": "Z", "_temp_id": "t1"}])
        );
    }

    #[test]
    fn test_hook_overrides_proposed_data() {
        let seen = Arc::new(Mutex::new(None));
        let seen_by_hook = Arc::clone(&seen);
        let mut field = TableField::new("items")
            .temp_ids(SequentialTempIds::new("t"))
            .before_create_record(move |ctx| {
                *seen_by_hook.lock() = Some((
                    ctx.field.name().to_string(),
                    ctx.state.len(),
                    ctx.parent_state.get("title").cloned(),
                ));
                Some(fields(json!({"name": "override"})))
            });

        field
            .create_record(fields(json!({"name": "orig", "x": 1})), &fields(json!({"title": "Post"})))
            .unwrap();

        assert_eq!(field.rows()[0].fields, fields(json!({"name": "override", "x": 1})));
        assert_eq!(
            *seen.lock(),
            Some(("items".to_string(), 0, Some(json!("Post"))))
        );
    }

    #[test]
    fn test_hook_returning_nothing_keeps_data() {
        let mut field = TableField::new("items")
            .temp_ids(SequentialTempIds::new("t"))
            .before_update_record(|_| None);
        let key = field.create_record(fields(json!({"name": "a"})), &Fields::new()).unwrap();

        assert!(field
            .update_record(&key, fields(json!({"name": "b"})), &Fields::new())
            .unwrap());
        assert_eq!(field.rows()[0].fields, fields(json!({"name": "b"})));
    }

    #[test]
    fn test_disabled_actions_are_rejected() {
        let locked = Arc::new(AtomicBool::new(false));
        let reader = Arc::clone(&locked);
        let mut field = TableField::new("items")
            .disable_create(Evaluated::computed(move || reader.load(Ordering::SeqCst)))
            .disable_delete(true);

        let key = field.create_record(Fields::new(), &Fields::new()).unwrap();
        locked.store(true, Ordering::SeqCst);

        assert!(matches!(
            field.create_record(Fields::new(), &Fields::new()),
            Err(TableFieldError::ActionDisabled(TableAction::Create))
        ));
        assert!(matches!(
            field.delete_record(&key),
            Err(TableFieldError::ActionDisabled(TableAction::Delete))
        ));
        assert_eq!(field.rows().len(), 1);

        let view = field.table_view();
        assert!(view.header_actions.is_empty());
        assert_eq!(view.row_actions, vec![TableAction::Edit]);
    }

    #[test]
    fn test_every_mutation_notifies() {
        let notifier = CountingNotifier::default();
        let mut field = TableField::new("items").on_state_changed(notifier.clone());

        let key = field.create_record(Fields::new(), &Fields::new()).unwrap();
        field.update_record(&key, Fields::new(), &Fields::new()).unwrap();
        field.delete_record(&RowKey::Persisted(404)).unwrap();
        field.delete_record(&key).unwrap();

        assert_eq!(*notifier.0.lock(), vec![1, 1, 1, 0]);
    }

    #[tokio::test]
    async fn test_hydrate_edit_save_many_to_many() {
        let store = MemoryStore::new();
        for name in ["A", "B"] {
            let id = store.insert("tags", fields(json!({"name": name}))).unwrap();
            store.attach("post_tag", "post_id", 1, "tag_id", id);
        }

        let mut field = TableField::new("tags").relationship(Some("tags".to_string()));
        field
            .hydrate(&store, &registry(), Some(ParentRecord::new("posts", 1)))
            .await
            .unwrap();
        assert_eq!(field.rows().len(), 2);

        field
            .update_record(&RowKey::Persisted(1), fields(json!({"name": "A2"})), &Fields::new())
            .unwrap();
        field.delete_record(&RowKey::Persisted(2)).unwrap();
        field.create_record(fields(json!({"name": "C"})), &Fields::new()).unwrap();

        let plan = field.preview(&store).await.unwrap().unwrap();
        assert!(matches!(plan, SyncPlan::ManyToMany(ref p) if p.detach == vec![2]));

        let report = field.save(&store).await.unwrap().unwrap();
        assert_eq!(report.members, vec![1, 3]);
        assert_eq!(
            serde_json::to_value(field.rows()).unwrap(),
            json!([{"id": 1, "name": "A2"}, {"id": 3, "name": "C"}])
        );
    }

    #[tokio::test]
    async fn test_failed_save_keeps_working_list() {
        let store = MemoryStore::new();
        store.insert("comments", fields(json!({"post_id": 1, "body": "a"}))).unwrap();
        store.restrict("comments", 1);

        let mut field = TableField::new("comments")
            .relationship(Some("comments".to_string()))
            .temp_ids(SequentialTempIds::new("t"));
        field
            .hydrate(&store, &registry(), Some(ParentRecord::new("posts", 1)))
            .await
            .unwrap();
        field.delete_record(&RowKey::Persisted(1)).unwrap();
        field.create_record(fields(json!({"body": "b"})), &Fields::new()).unwrap();
        let edited = field.state().clone();

        let err = field.save(&store).await.unwrap_err();
        assert!(err.is_constraint());
        assert_eq!(field.state(), &edited);
        assert_eq!(store.records("comments").len(), 1);
    }

    #[tokio::test]
    async fn test_unresolved_relationship_stays_transient() {
        let store = MemoryStore::new();
        let mut field = TableField::new("notes").relationship(Some("notes".to_string()));
        field
            .hydrate(&store, &registry(), Some(ParentRecord::new("posts", 1)))
            .await
            .unwrap();

        field.create_record(fields(json!({"text": "x"})), &Fields::new()).unwrap();
        assert!(field.preview(&store).await.unwrap().is_none());
        assert!(field.save(&store).await.unwrap().is_none());
        assert_eq!(field.rows().len(), 1);
    }

    #[test]
    fn test_from_config_resolves_view() {
        let config: FieldConfig = serde_json::from_value(json!({
            "name": "tags",
            "relationship": "tags",
            "heading": "Tags",
            "disable_edit": true,
            "columns": [{"name": "name", "label": "Name"}],
            "empty_state": {"heading": "No tags yet"}
        }))
        .unwrap();

        let view = TableField::from_config(&config).table_view();
        assert_eq!(view.heading.as_deref(), Some("Tags"));
        assert_eq!(view.header_actions, vec![TableAction::Create]);
        assert_eq!(view.row_actions, vec![TableAction::Delete]);
        assert_eq!(view.columns, vec![TableColumn::new("name").label("Name")]);
        assert_eq!(view.empty_state.heading.as_deref(), Some("No tags yet"));
    }

    /// Memory store whose plain reads can be switched off; transactions still work.
    struct FailingReads {
        inner: MemoryStore,
        fail: AtomicBool,
    }

    #[async_trait::async_trait]
    impl RelationStore for FailingReads {
        async fn fetch_related(&self, relationship: &Relationship) -> Result<Vec<Row>, StoreError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
            }
            self.inner.fetch_related(relationship).await
        }

        async fn begin(&self) -> Result<Box<dyn crate::store::RelationTransaction>, StoreError> {
            self.inner.begin().await
        }

        fn backend_name(&self) -> &'static str {
            "failing-reads"
        }
    }

    #[tokio::test]
    async fn test_committed_save_survives_failed_reload() {
        let store = FailingReads {
            inner: MemoryStore::new(),
            fail: AtomicBool::new(false),
        };
        store.inner.insert("comments", fields(json!({"post_id": 1, "body": "a"}))).unwrap();
        store.inner.insert("comments", fields(json!({"post_id": 1, "body": "b"}))).unwrap();

        let mut field = TableField::new("comments")
            .relationship(Some("comments".to_string()))
            .temp_ids(SequentialTempIds::new("t"));
        field
            .hydrate(&store, &registry(), Some(ParentRecord::new("posts", 1)))
            .await
            .unwrap();
        field.delete_record(&RowKey::Persisted(2)).unwrap();
        field.create_record(fields(json!({"body": "c"})), &Fields::new()).unwrap();

        store.fail.store(true, Ordering::SeqCst);
        let report = field.save(&store).await.unwrap().unwrap();
        assert_eq!(report.deleted, vec![2]);
        assert_eq!(report.created, vec![3]);
        assert_eq!(
            serde_json::to_value(field.rows()).unwrap(),
            json!([
                {"id": 1, "post_id": 1, "body": "a"},
                {"id": 3, "post_id": 1, "body": "c"}
            ])
        );

        // Saving again replays nothing.
        let retry = field.save(&store).await.unwrap().unwrap();
        assert!(retry.deleted.is_empty());
        assert!(retry.created.is_empty());
        assert_eq!(retry.updated, vec![1, 3]);
        assert_eq!(store.inner.records("comments").len(), 2);
    }
}
