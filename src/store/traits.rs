use crate::model::{Fields, ManyToMany, OneToMany, RecordId, Relationship, Row, SyncEntry};
use crate::store::StoreError;

/// Result of one synchronize-associations call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssociationSync {
    /// Related ids attached after the call, in entry order
    pub members: Vec<RecordId>,
    /// Ids of related records created for `SyncTarget::New` entries, in entry order
    pub created: Vec<RecordId>,
    /// Ids of existing related records whose attributes were written
    pub updated: Vec<RecordId>,
}

/// Persistence behind a table field: reads outside a transaction, writes inside one.
#[async_trait::async_trait]
pub trait RelationStore: Send + Sync {
    /// Current persisted rows of the relationship
    async fn fetch_related(&self, relationship: &Relationship) -> Result<Vec<Row>, StoreError>;

    /// Starts a transaction; every write of a reconciliation pass goes through it
    async fn begin(&self) -> Result<Box<dyn RelationTransaction>, StoreError>;

    fn backend_name(&self) -> &'static str;
}

/// Writes made here are invisible to other readers until `commit`.
/// Dropping without commit discards them.
#[async_trait::async_trait]
pub trait RelationTransaction: Send {
    async fn fetch_related(&mut self, relationship: &Relationship) -> Result<Vec<Row>, StoreError>;

    /// Removes the associations of the parent with `ids`
    async fn detach(&mut self, relation: &ManyToMany, ids: &[RecordId]) -> Result<(), StoreError>;

    /// Makes the parent's associations exactly `entries`. Existing targets are attached
    /// and updated with their attributes, new targets are created and attached, and
    /// associations not named by an entry are removed.
    async fn sync_associations(
        &mut self,
        relation: &ManyToMany,
        entries: &[SyncEntry],
    ) -> Result<AssociationSync, StoreError>;

    /// Hard-deletes children of the parent; returns how many were removed
    async fn delete_by_ids(&mut self, relation: &OneToMany, ids: &[RecordId]) -> Result<u64, StoreError>;

    /// Creates a child owned by the parent
    async fn create_owned(&mut self, relation: &OneToMany, attributes: &Fields) -> Result<RecordId, StoreError>;

    /// Updates a child of the parent; false when `id` is not one of its children
    async fn update_by_id(
        &mut self,
        relation: &OneToMany,
        id: RecordId,
        attributes: &Fields,
    ) -> Result<bool, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}
