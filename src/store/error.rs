/// Errors raised by a relationship store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A unique, foreign-key or restrict constraint rejected the operation.
    #[error("Constraint violation: {message}")]
    Constraint { message: String },

    /// A table or column name that cannot be used in a statement.
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Transaction error: {message}")]
    Transaction { message: String },

    #[error("Database error: {0}")]
    Database(sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn constraint(message: impl Into<String>) -> Self {
        Self::Constraint {
            message: message.into(),
        }
    }

    pub fn transaction(message: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
        }
    }

    pub fn is_constraint(&self) -> bool {
        matches!(self, StoreError::Constraint { .. })
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(error: sqlx::Error) -> Self {
        if let Some(db_error) = error.as_database_error() {
            if db_error.is_unique_violation()
                || db_error.is_foreign_key_violation()
                || db_error.is_check_violation()
            {
                return StoreError::constraint(db_error.message().to_string());
            }
        }
        StoreError::Database(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constraint_helpers() {
        let err = StoreError::constraint("duplicate name");
        assert!(err.is_constraint());
        assert_eq!(err.to_string(), "Constraint violation: duplicate name");
        assert!(!StoreError::transaction("closed").is_constraint());
    }

    #[test]
    fn test_non_database_sqlx_error_is_not_constraint() {
        let err: StoreError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, StoreError::Database(_)));
    }
}
