use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::model::{generate_id, Fields, Row, RowKey};

/// Produces temp ids unique within one working list's lifetime.
pub trait TempIdGenerator: Send + Sync {
    fn next_temp_id(&self) -> String;
}

/// Random v4 UUIDs in hyphenated form.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidTempIds;

impl TempIdGenerator for UuidTempIds {
    fn next_temp_id(&self) -> String {
        generate_id()
    }
}

/// `{prefix}{n}` with n counting from 1. Deterministic, used by tests and fixtures.
#[derive(Debug)]
pub struct SequentialTempIds {
    prefix: String,
    next: AtomicU64,
}

impl SequentialTempIds {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next: AtomicU64::new(1),
        }
    }
}

impl TempIdGenerator for SequentialTempIds {
    fn next_temp_id(&self) -> String {
        let n = self.next.fetch_add(1, Ordering::SeqCst);
        format!("{}{}", self.prefix, n)
    }
}

/// The ordered rows of a table field as currently edited. Nothing here touches a store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkingList {
    rows: Vec<Row>,
}

impl WorkingList {
    pub fn new(rows: Vec<Row>) -> Self {
        Self { rows }
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Appends `defaults <- data <- temp_id` and returns the new row's key.
    pub fn create(&mut self, defaults: Fields, data: Fields, temp_id: String) -> RowKey {
        let mut row = Row::pending(temp_id.clone(), Fields::new());
        row.merge(defaults);
        row.merge(data);
        row.temp_id = Some(temp_id);

        let key = row.key();
        self.rows.push(row);
        key
    }

    /// Merges `data` over every row matching `key`. Returns false when nothing matched.
    pub fn update(&mut self, key: &RowKey, data: Fields) -> bool {
        let mut matched = false;
        for row in self.rows.iter_mut().filter(|row| row.matches(key)) {
            row.merge(data.clone());
            matched = true;
        }
        matched
    }

    /// Removes the rows matching `key`, keeping the order of the rest.
    pub fn delete(&mut self, key: &RowKey) -> bool {
        let before = self.rows.len();
        self.rows.retain(|row| !row.matches(key));
        self.rows.len() != before
    }
}

impl From<Vec<Row>> for WorkingList {
    fn from(rows: Vec<Row>) -> Self {
        Self::new(rows)
    }
}
