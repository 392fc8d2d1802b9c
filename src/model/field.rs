use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::model::Fields;

/// A field option given either as a literal or as a closure evaluated on demand.
pub enum Evaluated<T> {
    Value(T),
    Computed(Arc<dyn Fn() -> T + Send + Sync>),
}

impl<T: Clone> Evaluated<T> {
    pub fn computed(f: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Evaluated::Computed(Arc::new(f))
    }

    pub fn evaluate(&self) -> T {
        match self {
            Evaluated::Value(value) => value.clone(),
            Evaluated::Computed(f) => f(),
        }
    }
}

impl<T: Default> Default for Evaluated<T> {
    fn default() -> Self {
        Evaluated::Value(T::default())
    }
}

impl<T> From<T> for Evaluated<T> {
    fn from(value: T) -> Self {
        Evaluated::Value(value)
    }
}

impl<T: Clone> Clone for Evaluated<T> {
    fn clone(&self) -> Self {
        match self {
            Evaluated::Value(value) => Evaluated::Value(value.clone()),
            Evaluated::Computed(f) => Evaluated::Computed(Arc::clone(f)),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Evaluated<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Evaluated::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Evaluated::Computed(_) => f.write_str("Computed(..)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableAction {
    Create,
    Edit,
    Delete,
}

impl fmt::Display for TableAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TableAction::Create => "create",
            TableAction::Edit => "edit",
            TableAction::Delete => "delete",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableColumn {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl TableColumn {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            label: None,
        }
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmptyState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heading: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

/// Every field option resolved once, ready to describe the table to a client.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableView {
    pub field: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heading: Option<String>,
    pub columns: Vec<TableColumn>,
    pub header_actions: Vec<TableAction>,
    pub row_actions: Vec<TableAction>,
    pub empty_state: EmptyState,
}

/// Declarative field definition as read from configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldConfig {
    pub name: String,
    #[serde(default)]
    pub relationship: Option<String>,
    #[serde(default)]
    pub heading: Option<String>,
    #[serde(default)]
    pub disable_create: bool,
    #[serde(default)]
    pub disable_edit: bool,
    #[serde(default)]
    pub disable_delete: bool,
    #[serde(default)]
    pub default_record_data: Fields,
    #[serde(default)]
    pub columns: Vec<TableColumn>,
    #[serde(default)]
    pub empty_state: EmptyState,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_evaluated_resolves_on_demand() {
        let flag = Arc::new(AtomicBool::new(false));
        let reader = Arc::clone(&flag);
        let option = Evaluated::computed(move || reader.load(Ordering::SeqCst));

        assert!(!option.evaluate());
        flag.store(true, Ordering::SeqCst);
        assert!(option.evaluate());

        let literal: Evaluated<bool> = true.into();
        assert!(literal.evaluate());
        assert_eq!(format!("{:?}", option), "Computed(..)");
    }

    #[test]
    fn test_field_config_defaults() {
        let config: FieldConfig = serde_json::from_str(r#"{"name": "tags"}"#).unwrap();
        assert_eq!(config.relationship, None);
        assert!(!config.disable_create);
        assert!(config.default_record_data.is_empty());
        assert!(config.columns.is_empty());
    }
}
