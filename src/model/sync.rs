use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::model::{Fields, RecordId, RowKey};

/// Target of one many-to-many sync entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTarget {
    /// Already persisted related record; attach if needed and update its attributes
    Existing(RecordId),
    /// Pending row; always creates a new related record, keyed by its temp id
    New(String),
}

impl From<RowKey> for SyncTarget {
    fn from(key: RowKey) -> Self {
        match key {
            RowKey::Persisted(id) => SyncTarget::Existing(id),
            RowKey::Temp(temp_id) => SyncTarget::New(temp_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEntry {
    pub target: SyncTarget,
    pub attributes: Fields,
}

/// One per-row write of a one-to-many pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RowWrite {
    Update {
        id: RecordId,
        attributes: Fields,
    },
    Create {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        temp_id: Option<String>,
        attributes: Fields,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManyToManyPlan {
    /// Detached before the sync call; empty means no detach is issued
    pub detach: Vec<RecordId>,
    /// Final membership, in working-list order
    pub entries: Vec<SyncEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OneToManyPlan {
    /// Hard-deleted before any write; empty means no delete is issued
    pub delete: Vec<RecordId>,
    /// Applied in working-list order
    pub writes: Vec<RowWrite>,
}

/// Operations that make a persisted relationship match a working list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SyncPlan {
    ManyToMany(ManyToManyPlan),
    OneToMany(OneToManyPlan),
}

/// What a committed reconciliation pass did
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    pub detached: Vec<RecordId>,
    pub deleted: Vec<RecordId>,
    pub updated: Vec<RecordId>,
    pub created: Vec<RecordId>,
    /// Updates of records the parent does not own; nothing was written
    #[serde(default)]
    pub skipped: Vec<RecordId>,
    /// Related ids after the pass, in working-list order
    pub members: Vec<RecordId>,
    /// Persisted id of each created pending row, by temp id
    #[serde(default)]
    pub assigned_ids: BTreeMap<String, RecordId>,
}

impl SyncReport {
    /// True when the pass wrote nothing and left no members
    pub fn is_empty(&self) -> bool {
        self.detached.is_empty()
            && self.deleted.is_empty()
            && self.updated.is_empty()
            && self.created.is_empty()
            && self.skipped.is_empty()
            && self.members.is_empty()
    }
}
