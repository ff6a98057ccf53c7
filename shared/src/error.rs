use thiserror::Error;

/// Error taxonomy shared by every service in the platform.
///
/// Business-level outcomes (insufficient stock, unknown SKU) are *not*
/// errors; they are published as first-class events.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("concurrent update conflict on {entity} {id}")]
    Conflict { entity: &'static str, id: String },

    #[error("invalid command: {0}")]
    Validation(String),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("persistence failure: {0}")]
    Persistence(String),
}

pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        CoreError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn conflict(entity: &'static str, id: impl ToString) -> Self {
        CoreError::Conflict {
            entity,
            id: id.to_string(),
        }
    }

    /// Collapses a unique-key violation into `Conflict`; any other database
    /// error stays a persistence failure.
    pub fn unique_conflict(
        e: diesel::result::Error,
        entity: &'static str,
        id: impl ToString,
    ) -> Self {
        match e {
            diesel::result::Error::DatabaseError(
                diesel::result::DatabaseErrorKind::UniqueViolation,
                _,
            ) => CoreError::conflict(entity, id),
            other => other.into(),
        }
    }
}

impl From<diesel::result::Error> for CoreError {
    fn from(e: diesel::result::Error) -> Self {
        CoreError::Persistence(e.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Validation(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_display_names_the_entity() {
        let e = CoreError::not_found("order", "42");
        assert_eq!(e.to_string(), "order 42 not found");
    }

    #[test]
    fn serde_errors_map_to_validation() {
        let bad: Result<uuid::Uuid, _> = serde_json::from_str("\"nope\"");
        let e: CoreError = bad.unwrap_err().into();
        assert!(matches!(e, CoreError::Validation(_)));
    }

    #[test]
    fn diesel_errors_map_to_persistence() {
        let e: CoreError = diesel::result::Error::RollbackTransaction.into();
        assert!(matches!(e, CoreError::Persistence(_)));
    }

    // The dedupe insert relies on the primary key rejecting a duplicate
    // delivery that raced past the pre-check; that rejection must read as a
    // conflict, and everything else stays a persistence failure.
    #[test]
    fn unique_violations_map_to_conflict() {
        let dup = diesel::result::Error::DatabaseError(
            diesel::result::DatabaseErrorKind::UniqueViolation,
            Box::new("duplicate key value".to_string()),
        );
        assert!(matches!(
            CoreError::unique_conflict(dup, "processed event", "e1"),
            CoreError::Conflict { .. }
        ));

        let other = diesel::result::Error::RollbackTransaction;
        assert!(matches!(
            CoreError::unique_conflict(other, "processed event", "e1"),
            CoreError::Persistence(_)
        ));
    }
}
