use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Identity assigned to a child record by the persistence layer.
pub type RecordId = i64;

/// Field values of one row, keyed by column name.
pub type Fields = serde_json::Map<String, serde_json::Value>;

pub type SessionId = String;

pub const ID_KEY: &str = "id";
pub const TEMP_ID_KEY: &str = "_temp_id";

/// Canonical identity of a row: the persisted id when present, otherwise the temp id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RowKey {
    Persisted(RecordId),
    Temp(String),
}

impl RowKey {
    pub fn persisted_id(&self) -> Option<RecordId> {
        match self {
            RowKey::Persisted(id) => Some(*id),
            RowKey::Temp(_) => None,
        }
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowKey::Persisted(id) => write!(f, "{}", id),
            RowKey::Temp(temp_id) => f.write_str(temp_id),
        }
    }
}

/// Path segments that parse as an integer address persisted rows. Generated temp ids
/// are hyphenated UUIDs, so they never take that branch.
impl FromStr for RowKey {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.parse::<RecordId>() {
            Ok(id) => RowKey::Persisted(id),
            Err(_) => RowKey::Temp(s.to_string()),
        })
    }
}

impl From<RecordId> for RowKey {
    fn from(id: RecordId) -> Self {
        RowKey::Persisted(id)
    }
}

impl From<&str> for RowKey {
    fn from(temp_id: &str) -> Self {
        RowKey::Temp(temp_id.to_string())
    }
}

/// The record that owns a table field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentRecord {
    pub table: String,
    pub id: RecordId,
}

impl ParentRecord {
    pub fn new(table: impl Into<String>, id: RecordId) -> Self {
        Self {
            table: table.into(),
            id,
        }
    }
}

pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}

/// Shallow merge: keys of `overlay` replace keys of `base`.
pub fn merge_fields(mut base: Fields, overlay: Fields) -> Fields {
    for (key, value) in overlay {
        base.insert(key, value);
    }
    base
}
