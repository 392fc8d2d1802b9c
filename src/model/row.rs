use serde::{Deserialize, Serialize};

use crate::model::{Fields, RecordId, RowKey, ID_KEY, TEMP_ID_KEY};

/// One child record as seen by the table.
///
/// A persisted row carries the `id` assigned by the store; a pending row carries a
/// client-generated `_temp_id` instead. When both are present `id` is authoritative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RowRepr", into = "RowRepr")]
pub struct Row {
    pub id: Option<RecordId>,
    pub temp_id: Option<String>,
    pub fields: Fields,
}

/// Flat JSON shape: identity keys next to the field values.
#[derive(Serialize, Deserialize)]
struct RowRepr {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<RecordId>,
    #[serde(rename = "_temp_id", default, skip_serializing_if = "Option::is_none")]
    temp_id: Option<String>,
    #[serde(flatten)]
    fields: Fields,
}

impl TryFrom<RowRepr> for Row {
    type Error = String;

    fn try_from(repr: RowRepr) -> Result<Self, Self::Error> {
        if repr.id.is_none() && repr.temp_id.is_none() {
            return Err(format!("row has neither `{}` nor `{}`", ID_KEY, TEMP_ID_KEY));
        }
        Ok(Row {
            id: repr.id,
            temp_id: repr.temp_id,
            fields: repr.fields,
        })
    }
}

impl From<Row> for RowRepr {
    fn from(row: Row) -> Self {
        RowRepr {
            id: row.id,
            temp_id: row.temp_id,
            fields: row.fields,
        }
    }
}

impl Row {
    pub fn persisted(id: RecordId, fields: Fields) -> Self {
        Self {
            id: Some(id),
            temp_id: None,
            fields,
        }
    }

    pub fn pending(temp_id: impl Into<String>, fields: Fields) -> Self {
        Self {
            id: None,
            temp_id: Some(temp_id.into()),
            fields,
        }
    }

    /// Canonical key used for matching, both in the working list and in reconciliation.
    pub fn key(&self) -> RowKey {
        match (&self.id, &self.temp_id) {
            (Some(id), _) => RowKey::Persisted(*id),
            (None, Some(temp_id)) => RowKey::Temp(temp_id.clone()),
            // Construction paths reject rows without identity.
            (None, None) => RowKey::Temp(String::new()),
        }
    }

    pub fn matches(&self, key: &RowKey) -> bool {
        &self.key() == key
    }

    /// Field values with identity keys stripped.
    pub fn attributes(&self) -> &Fields {
        &self.fields
    }

    /// Shallow-merges `data` into the row, later keys win.
    ///
    /// Identity keys in `data` go to the identity slots: an integer `id` re-keys the
    /// row to that persisted record, a null `id` clears it. Other `id` values are not
    /// addressable and are dropped.
    pub fn merge(&mut self, data: Fields) {
        for (key, value) in data {
            match key.as_str() {
                ID_KEY => match value {
                    serde_json::Value::Null => self.id = None,
                    other => match other.as_i64() {
                        Some(id) => self.id = Some(id),
                        None => log::warn!("Ignoring non-integer row id {}", other),
                    },
                },
                TEMP_ID_KEY => match value {
                    serde_json::Value::String(temp_id) => self.temp_id = Some(temp_id),
                    serde_json::Value::Null => self.temp_id = None,
                    other => log::warn!("Ignoring non-string temp id {}", other),
                },
                _ => {
                    self.fields.insert(key, value);
                }
            }
        }
    }

    /// Builds a row from a JSON object returned by a store.
    pub fn from_value(value: serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    pub fn to_value(&self) -> serde_json::Value {
        let mut object = self.fields.clone();
        if let Some(id) = self.id {
            object.insert(ID_KEY.to_string(), id.into());
        }
        if let Some(temp_id) = &self.temp_id {
            object.insert(TEMP_ID_KEY.to_string(), temp_id.clone().into());
        }
        serde_json::Value::Object(object)
    }
}
