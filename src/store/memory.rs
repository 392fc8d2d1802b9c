use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use crate::model::{
    Fields, ManyToMany, OneToMany, RecordId, Relationship, Row, SyncEntry, SyncTarget, ID_KEY,
};
use crate::store::traits::{AssociationSync, RelationStore, RelationTransaction};
use crate::store::StoreError;

#[derive(Debug, Clone)]
struct MemoryTable {
    next_id: RecordId,
    records: BTreeMap<RecordId, Fields>,
    /// Columns whose non-null values must be distinct
    unique: Vec<String>,
    /// Ids that refuse deletion, like a restricting foreign key elsewhere
    restricted: HashSet<RecordId>,
}

impl Default for MemoryTable {
    fn default() -> Self {
        Self {
            next_id: 1,
            records: BTreeMap::new(),
            unique: Vec::new(),
            restricted: HashSet::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    /// Bumped by every write published to the shared state
    version: u64,
    tables: HashMap<String, MemoryTable>,
    /// Pivot rows in insertion order
    pivots: HashMap<String, Vec<Fields>>,
}

/// In-memory relationship store.
///
/// Tables hold JSON records keyed by an auto-increment id. Transactions work on a
/// snapshot of the whole state and publish it on commit, so a failed pass leaves
/// nothing behind. Transactions are serialized: `begin` waits until the previous
/// one has committed or rolled back. A direct write made while a transaction is
/// open makes its commit fail instead of being overwritten.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    writer: Arc<tokio::sync::Mutex<()>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a record directly, outside any transaction.
    pub fn insert(&self, table: &str, fields: Fields) -> Result<RecordId, StoreError> {
        self.write(|state| state.insert(table, fields))
    }

    fn write<R>(&self, f: impl FnOnce(&mut MemoryState) -> R) -> R {
        let mut state = self.state.lock();
        state.version += 1;
        f(&mut state)
    }

    /// Adds a pivot row linking `parent_id` and `related_id`.
    pub fn attach(
        &self,
        pivot_table: &str,
        foreign_pivot_key: &str,
        parent_id: RecordId,
        related_pivot_key: &str,
        related_id: RecordId,
    ) {
        let mut pivot = Fields::new();
        pivot.insert(foreign_pivot_key.to_string(), parent_id.into());
        pivot.insert(related_pivot_key.to_string(), related_id.into());
        self.write(|state| {
            state
                .pivots
                .entry(pivot_table.to_string())
                .or_default()
                .push(pivot)
        });
    }

    pub fn add_unique(&self, table: &str, column: &str) {
        self.write(|state| {
            state
                .tables
                .entry(table.to_string())
                .or_default()
                .unique
                .push(column.to_string())
        });
    }

    /// Makes deleting `id` from `table` fail with a constraint error.
    pub fn restrict(&self, table: &str, id: RecordId) {
        self.write(|state| {
            state
                .tables
                .entry(table.to_string())
                .or_default()
                .restricted
                .insert(id);
        });
    }

    pub fn record(&self, table: &str, id: RecordId) -> Option<Row> {
        let state = self.state.lock();
        let fields = state.tables.get(table)?.records.get(&id)?;
        Some(Row::persisted(id, fields.clone()))
    }

    pub fn records(&self, table: &str) -> Vec<Row> {
        let state = self.state.lock();
        state
            .tables
            .get(table)
            .map(|t| {
                t.records
                    .iter()
                    .map(|(id, fields)| Row::persisted(*id, fields.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn pivot_rows(&self, pivot_table: &str) -> Vec<Fields> {
        self.state
            .lock()
            .pivots
            .get(pivot_table)
            .cloned()
            .unwrap_or_default()
    }
}

fn id_value(id: RecordId) -> Value {
    Value::from(id)
}

fn column_is(fields: &Fields, column: &str, id: RecordId) -> bool {
    fields.get(column).and_then(Value::as_i64) == Some(id)
}

impl MemoryState {
    fn table_mut(&mut self, table: &str) -> &mut MemoryTable {
        self.tables.entry(table.to_string()).or_default()
    }

    fn check_unique(&self, table: &str, id: Option<RecordId>, fields: &Fields) -> Result<(), StoreError> {
        let Some(t) = self.tables.get(table) else {
            return Ok(());
        };
        for column in &t.unique {
            let Some(value) = fields.get(column).filter(|v| !v.is_null()) else {
                continue;
            };
            let duplicate = t
                .records
                .iter()
                .any(|(other_id, other)| Some(*other_id) != id && other.get(column) == Some(value));
            if duplicate {
                return Err(StoreError::constraint(format!(
                    "duplicate value {} for unique column {}.{}",
                    value, table, column
                )));
            }
        }
        Ok(())
    }

    fn insert(&mut self, table: &str, mut fields: Fields) -> Result<RecordId, StoreError> {
        fields.remove(ID_KEY);
        self.check_unique(table, None, &fields)?;
        let t = self.table_mut(table);
        let id = t.next_id;
        t.next_id += 1;
        t.records.insert(id, fields);
        Ok(id)
    }

    fn update(&mut self, table: &str, id: RecordId, attributes: &Fields) -> Result<(), StoreError> {
        let mut merged = self
            .tables
            .get(table)
            .and_then(|t| t.records.get(&id))
            .cloned()
            .unwrap_or_default();
        for (key, value) in attributes {
            if key != ID_KEY {
                merged.insert(key.clone(), value.clone());
            }
        }
        self.check_unique(table, Some(id), &merged)?;
        self.table_mut(table).records.insert(id, merged);
        Ok(())
    }

    fn exists(&self, table: &str, id: RecordId) -> bool {
        self.tables
            .get(table)
            .map(|t| t.records.contains_key(&id))
            .unwrap_or(false)
    }

    fn fetch_related(&self, relationship: &Relationship) -> Vec<Row> {
        match relationship {
            Relationship::OneToMany(rel) => self
                .tables
                .get(&rel.related_table)
                .map(|t| {
                    t.records
                        .iter()
                        .filter(|(_, fields)| column_is(fields, &rel.foreign_key, rel.parent.id))
                        .map(|(id, fields)| Row::persisted(*id, fields.clone()))
                        .collect()
                })
                .unwrap_or_default(),
            Relationship::ManyToMany(rel) => {
                let Some(related) = self.tables.get(&rel.related_table) else {
                    return Vec::new();
                };
                self.related_ids(rel)
                    .into_iter()
                    .filter_map(|id| related.records.get(&id).map(|f| Row::persisted(id, f.clone())))
                    .collect()
            }
        }
    }

    fn related_ids(&self, rel: &ManyToMany) -> Vec<RecordId> {
        self.pivots
            .get(&rel.pivot_table)
            .map(|rows| {
                rows.iter()
                    .filter(|pivot| column_is(pivot, &rel.foreign_pivot_key, rel.parent.id))
                    .filter_map(|pivot| pivot.get(&rel.related_pivot_key).and_then(Value::as_i64))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn attach(&mut self, rel: &ManyToMany, related_id: RecordId) {
        let mut pivot = Fields::new();
        pivot.insert(rel.foreign_pivot_key.clone(), id_value(rel.parent.id));
        pivot.insert(rel.related_pivot_key.clone(), id_value(related_id));
        self.pivots.entry(rel.pivot_table.clone()).or_default().push(pivot);
    }

    fn detach_where(&mut self, rel: &ManyToMany, remove: impl Fn(RecordId) -> bool) {
        if let Some(rows) = self.pivots.get_mut(&rel.pivot_table) {
            rows.retain(|pivot| {
                if !column_is(pivot, &rel.foreign_pivot_key, rel.parent.id) {
                    return true;
                }
                match pivot.get(&rel.related_pivot_key).and_then(Value::as_i64) {
                    Some(related_id) => !remove(related_id),
                    None => true,
                }
            });
        }
    }

    fn is_child(&self, rel: &OneToMany, id: RecordId) -> bool {
        self.tables
            .get(&rel.related_table)
            .and_then(|t| t.records.get(&id))
            .map(|fields| column_is(fields, &rel.foreign_key, rel.parent.id))
            .unwrap_or(false)
    }
}

#[async_trait::async_trait]
impl RelationStore for MemoryStore {
    async fn fetch_related(&self, relationship: &Relationship) -> Result<Vec<Row>, StoreError> {
        Ok(self.state.lock().fetch_related(relationship))
    }

    async fn begin(&self) -> Result<Box<dyn RelationTransaction>, StoreError> {
        let writer = Arc::clone(&self.writer).lock_owned().await;
        let snapshot = self.state.lock().clone();
        Ok(Box::new(MemoryTransaction {
            shared: Arc::clone(&self.state),
            working: snapshot,
            _writer: writer,
        }))
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

/// Holds the store's writer lock until it is committed, rolled back or dropped.
pub struct MemoryTransaction {
    shared: Arc<Mutex<MemoryState>>,
    working: MemoryState,
    _writer: tokio::sync::OwnedMutexGuard<()>,
}

#[async_trait::async_trait]
impl RelationTransaction for MemoryTransaction {
    async fn fetch_related(&mut self, relationship: &Relationship) -> Result<Vec<Row>, StoreError> {
        Ok(self.working.fetch_related(relationship))
    }

    async fn detach(&mut self, relation: &ManyToMany, ids: &[RecordId]) -> Result<(), StoreError> {
        let ids: HashSet<RecordId> = ids.iter().copied().collect();
        self.working.detach_where(relation, |related_id| ids.contains(&related_id));
        Ok(())
    }

    async fn sync_associations(
        &mut self,
        relation: &ManyToMany,
        entries: &[SyncEntry],
    ) -> Result<AssociationSync, StoreError> {
        let mut outcome = AssociationSync::default();
        let mut attached: HashSet<RecordId> = self.working.related_ids(relation).into_iter().collect();

        for entry in entries {
            let related_id = match &entry.target {
                SyncTarget::Existing(id) => {
                    if !self.working.exists(&relation.related_table, *id) {
                        return Err(StoreError::constraint(format!(
                            "{} {} does not exist",
                            relation.related_table, id
                        )));
                    }
                    if !entry.attributes.is_empty() {
                        self.working.update(&relation.related_table, *id, &entry.attributes)?;
                        outcome.updated.push(*id);
                    }
                    *id
                }
                SyncTarget::New(_) => {
                    let id = self
                        .working
                        .insert(&relation.related_table, entry.attributes.clone())?;
                    outcome.created.push(id);
                    id
                }
            };

            if attached.insert(related_id) {
                self.working.attach(relation, related_id);
            }
            outcome.members.push(related_id);
        }

        let keep: HashSet<RecordId> = outcome.members.iter().copied().collect();
        self.working.detach_where(relation, |related_id| !keep.contains(&related_id));
        Ok(outcome)
    }

    async fn delete_by_ids(&mut self, relation: &OneToMany, ids: &[RecordId]) -> Result<u64, StoreError> {
        let children: Vec<RecordId> = ids
            .iter()
            .copied()
            .filter(|id| self.working.is_child(relation, *id))
            .collect();

        let table = self.working.table_mut(&relation.related_table);
        if let Some(id) = children.iter().find(|id| table.restricted.contains(id)) {
            return Err(StoreError::constraint(format!(
                "{} {} is still referenced",
                relation.related_table, id
            )));
        }
        for id in &children {
            table.records.remove(id);
        }
        Ok(children.len() as u64)
    }

    async fn create_owned(&mut self, relation: &OneToMany, attributes: &Fields) -> Result<RecordId, StoreError> {
        let mut fields = attributes.clone();
        fields.insert(relation.foreign_key.clone(), id_value(relation.parent.id));
        self.working.insert(&relation.related_table, fields)
    }

    async fn update_by_id(
        &mut self,
        relation: &OneToMany,
        id: RecordId,
        attributes: &Fields,
    ) -> Result<bool, StoreError> {
        if !self.working.is_child(relation, id) {
            return Ok(false);
        }
        let mut fields = attributes.clone();
        fields.insert(relation.foreign_key.clone(), id_value(relation.parent.id));
        self.working.update(&relation.related_table, id, &fields)?;
        Ok(true)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let MemoryTransaction {
            shared,
            mut working,
            _writer,
        } = *self;
        let mut state = shared.lock();
        if state.version != working.version {
            return Err(StoreError::transaction(
                "store changed during the transaction",
            ));
        }
        working.version += 1;
        *state = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ParentRecord;
    use serde_json::json;

    fn fields(value: serde_json::Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    fn comments() -> OneToMany {
        OneToMany {
            parent: ParentRecord::new("posts", 1),
            related_table: "comments".into(),
            foreign_key: "post_id".into(),
        }
    }

    fn tags() -> ManyToMany {
        ManyToMany {
            parent: ParentRecord::new("posts", 1),
            related_table: "tags".into(),
            pivot_table: "post_tag".into(),
            foreign_pivot_key: "post_id".into(),
            related_pivot_key: "tag_id".into(),
        }
    }

    #[tokio::test]
    async fn test_one_to_many_fetch_is_scoped_to_parent() {
        let store = MemoryStore::new();
        store.insert("comments", fields(json!({"post_id": 1, "body": "a"}))).unwrap();
        store.insert("comments", fields(json!({"post_id": 2, "body": "b"}))).unwrap();
        store.insert("comments", fields(json!({"post_id": 1, "body": "c"}))).unwrap();

        let rows = store
            .fetch_related(&Relationship::OneToMany(comments()))
            .await
            .unwrap();
        let ids: Vec<_> = rows.iter().map(|r| r.id.unwrap()).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[tokio::test]
    async fn test_uncommitted_writes_are_invisible() {
        let store = MemoryStore::new();
        let rel = comments();

        let mut tx = store.begin().await.unwrap();
        tx.create_owned(&rel, &fields(json!({"body": "draft"}))).await.unwrap();
        assert_eq!(tx.fetch_related(&Relationship::OneToMany(rel.clone())).await.unwrap().len(), 1);
        assert!(store.records("comments").is_empty());

        tx.rollback().await.unwrap();
        assert!(store.records("comments").is_empty());

        let mut tx = store.begin().await.unwrap();
        let id = tx.create_owned(&rel, &fields(json!({"body": "kept"}))).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(
            store.record("comments", id).unwrap().fields,
            fields(json!({"body": "kept", "post_id": 1}))
        );
    }

    #[tokio::test]
    async fn test_update_outside_parent_is_ignored() {
        let store = MemoryStore::new();
        let foreign = store.insert("comments", fields(json!({"post_id": 2, "body": "x"}))).unwrap();

        let mut tx = store.begin().await.unwrap();
        let updated = tx
            .update_by_id(&comments(), foreign, &fields(json!({"body": "hijack"})))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert!(!updated);
        assert_eq!(store.record("comments", foreign).unwrap().fields["body"], json!("x"));
    }

    #[tokio::test]
    async fn test_restricted_delete_and_unique_columns_raise_constraints() {
        let store = MemoryStore::new();
        let id = store.insert("comments", fields(json!({"post_id": 1, "slug": "a"}))).unwrap();
        store.restrict("comments", id);
        store.add_unique("comments", "slug");

        let mut tx = store.begin().await.unwrap();
        assert!(tx.delete_by_ids(&comments(), &[id]).await.unwrap_err().is_constraint());
        assert!(tx
            .create_owned(&comments(), &fields(json!({"slug": "a"})))
            .await
            .unwrap_err()
            .is_constraint());
    }

    #[tokio::test]
    async fn test_sync_associations_attaches_creates_and_prunes() {
        let store = MemoryStore::new();
        let a = store.insert("tags", fields(json!({"name": "A"}))).unwrap();
        let b = store.insert("tags", fields(json!({"name": "B"}))).unwrap();
        let c = store.insert("tags", fields(json!({"name": "C"}))).unwrap();
        store.attach("post_tag", "post_id", 1, "tag_id", a);
        store.attach("post_tag", "post_id", 1, "tag_id", b);
        store.attach("post_tag", "post_id", 2, "tag_id", b);

        let entries = vec![
            SyncEntry {
                target: SyncTarget::Existing(c),
                attributes: Fields::new(),
            },
            SyncEntry {
                target: SyncTarget::New("t1".into()),
                attributes: fields(json!({"name": "D"})),
            },
        ];

        let mut tx = store.begin().await.unwrap();
        let outcome = tx.sync_associations(&tags(), &entries).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(outcome.members, vec![c, 4]);
        assert_eq!(outcome.created, vec![4]);
        assert!(outcome.updated.is_empty());

        let rows = store
            .fetch_related(&Relationship::ManyToMany(tags()))
            .await
            .unwrap();
        let names: Vec<_> = rows.iter().map(|r| r.fields["name"].clone()).collect();
        assert_eq!(names, vec![json!("C"), json!("D")]);

        // The other parent's association is untouched.
        assert!(store
            .pivot_rows("post_tag")
            .iter()
            .any(|p| p["post_id"] == json!(2) && p["tag_id"] == json!(b)));
    }

    #[tokio::test]
    async fn test_sync_with_unknown_existing_target_fails() {
        let store = MemoryStore::new();
        let entries = vec![SyncEntry {
            target: SyncTarget::Existing(42),
            attributes: Fields::new(),
        }];
        let mut tx = store.begin().await.unwrap();
        let err = tx.sync_associations(&tags(), &entries).await.unwrap_err();
        assert!(err.is_constraint());
    }

    #[tokio::test]
    async fn test_overlapping_transactions_keep_both_commits() {
        let store = MemoryStore::new();
        let first = comments();
        let mut second = comments();
        second.parent = ParentRecord::new("posts", 2);

        let mut tx = store.begin().await.unwrap();
        tx.create_owned(&first, &fields(json!({"body": "one"}))).await.unwrap();

        let other = store.clone();
        let pending = tokio::spawn(async move {
            let mut tx = other.begin().await.unwrap();
            tx.create_owned(&second, &fields(json!({"body": "two"}))).await.unwrap();
            tx.commit().await.unwrap();
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        tx.commit().await.unwrap();
        pending.await.unwrap();

        let bodies: Vec<_> = store
            .records("comments")
            .into_iter()
            .map(|r| r.fields["body"].clone())
            .collect();
        assert_eq!(bodies, vec![json!("one"), json!("two")]);
    }

    #[tokio::test]
    async fn test_direct_write_during_transaction_fails_commit() {
        let store = MemoryStore::new();
        let rel = comments();

        let mut tx = store.begin().await.unwrap();
        tx.create_owned(&rel, &fields(json!({"body": "draft"}))).await.unwrap();
        store.insert("comments", fields(json!({"post_id": 1, "body": "direct"}))).unwrap();

        let err = tx.commit().await.unwrap_err();
        assert!(matches!(err, StoreError::Transaction { .. }));

        let bodies: Vec<_> = store
            .records("comments")
            .into_iter()
            .map(|r| r.fields["body"].clone())
            .collect();
        assert_eq!(bodies, vec![json!("direct")]);
    }
}
