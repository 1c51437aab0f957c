//! Typed error hierarchy for agencyhub.
//!
//! The database layer works in `anyhow::Result` and attaches context per
//! statement. Service functions convert those failures into `HubError` with
//! [`HubError::from_db`], which recovers any typed error that was raised
//! inside a database closure.

use thiserror::Error;

/// Errors from the service layer (account, access, activity, invitation).
#[derive(Debug, Error)]
pub enum HubError {
    #[error("Agency {id} not found")]
    AgencyNotFound { id: String },

    #[error("Sub-account {id} not found")]
    SubAccountNotFound { id: String },

    #[error("User {id} not found")]
    UserNotFound { id: String },

    #[error("Pipeline {id} not found")]
    PipelineNotFound { id: String },

    #[error("Lane {id} not found")]
    LaneNotFound { id: String },

    #[error("Ticket {id} not found")]
    TicketNotFound { id: String },

    #[error("Media {id} not found")]
    MediaNotFound { id: String },

    #[error("Funnel {id} not found")]
    FunnelNotFound { id: String },

    #[error("Media with the link \"{link}\" already exists")]
    MediaLinkExists { link: String },

    #[error("Not signed in")]
    Unauthenticated,

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Identity provider error: {0}")]
    IdentityProvider(String),

    #[error("Database lock poisoned")]
    LockPoisoned,

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HubError {
    /// Convert a database-layer error, keeping typed errors raised inside
    /// a `DbHandle::call` closure.
    pub fn from_db(err: anyhow::Error) -> Self {
        match err.downcast::<HubError>() {
            Ok(typed) => typed,
            Err(err) => HubError::Database(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_link_exists_carries_link() {
        let err = HubError::MediaLinkExists {
            link: "https://cdn.example/logo.png".into(),
        };
        assert!(err.to_string().contains("https://cdn.example/logo.png"));
    }

    #[test]
    fn from_db_recovers_typed_error() {
        let raised: anyhow::Error = HubError::SubAccountNotFound { id: "sa-1".into() }.into();
        let err = HubError::from_db(raised.context("Failed to load sub-account"));
        match err {
            HubError::SubAccountNotFound { id } => assert_eq!(id, "sa-1"),
            other => panic!("Expected SubAccountNotFound, got {other:?}"),
        }
    }

    #[test]
    fn from_db_wraps_untyped_error() {
        let err = HubError::from_db(anyhow::anyhow!("disk I/O error"));
        assert!(matches!(err, HubError::Database(_)));
        assert!(err.to_string().contains("disk I/O error"));
    }

    #[test]
    fn unauthorized_is_distinct_from_unauthenticated() {
        let denied = HubError::Unauthorized("no permission".into());
        assert!(matches!(denied, HubError::Unauthorized(_)));
        assert!(!matches!(denied, HubError::Unauthenticated));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&HubError::LockPoisoned);
        assert_std_error(&HubError::Validation("name: required".into()));
    }
}
