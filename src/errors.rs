//! Typed error hierarchy for taskhub.
//!
//! - `HubError`: domain failures raised by the store and API layers; they
//!   travel inside `anyhow::Error` and are recovered with `downcast_ref`
//!   at the HTTP edge to pick a status code.
//! - `TransportError`: real-time client socket and handshake failures.

use thiserror::Error;

/// Errors from the REST/store layer.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("Project {id} not found")]
    ProjectNotFound { id: i64 },

    #[error("Task {id} not found")]
    TaskNotFound { id: i64 },

    #[error("Team member {id} not found")]
    MemberNotFound { id: i64 },

    #[error("Invitation {0} not found")]
    InvitationNotFound(String),

    #[error("User {user_id} is already a member of project {project_id}")]
    DuplicateMember { project_id: i64, user_id: i64 },

    #[error("A pending invitation for {email} already exists")]
    InvitationPending { email: String },

    #[error("Invitation has expired")]
    InvitationExpired,

    #[error("Invitation is already {status}")]
    InvitationNotPending { status: String },

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("GitHub API error: {0}")]
    GitHub(String),

    #[error("Database lock poisoned")]
    LockPoisoned,
}

/// Errors from the real-time client transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to open socket to {url}: {message}")]
    Connect { url: String, message: String },

    #[error("Server rejected the connection: {0}")]
    Rejected(String),

    #[error("Socket closed during handshake")]
    ClosedDuringHandshake,

    #[error("No frame received within {0:?}")]
    Timeout(std::time::Duration),

    #[error("Socket error: {0}")]
    Socket(String),

    #[error("Unexpected {0} frame during handshake")]
    UnexpectedFrame(String),

    #[error(transparent)]
    Frame(#[from] taskhub_common::FrameError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hub_error_survives_anyhow_context() {
        let err: anyhow::Error = anyhow::Error::new(HubError::TaskNotFound { id: 7 })
            .context("Failed to move task");
        match err.downcast_ref::<HubError>() {
            Some(HubError::TaskNotFound { id }) => assert_eq!(*id, 7),
            other => panic!("Expected TaskNotFound, got {:?}", other),
        }
    }

    #[test]
    fn hub_error_messages_carry_identifiers() {
        assert!(HubError::ProjectNotFound { id: 42 }.to_string().contains("42"));
        let dup = HubError::DuplicateMember {
            project_id: 1,
            user_id: 9,
        };
        assert!(dup.to_string().contains("User 9"));
        assert_eq!(
            HubError::InvitationNotPending {
                status: "accepted".into()
            }
            .to_string(),
            "Invitation is already accepted"
        );
    }

    #[test]
    fn transport_error_converts_from_frame_error() {
        let err: TransportError = taskhub_common::FrameError::Unterminated.into();
        assert!(matches!(err, TransportError::Frame(_)));
        assert!(err.to_string().contains("NUL"));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error + Send + Sync + 'static>(_: &E) {}
        assert_std_error(&HubError::LockPoisoned);
        assert_std_error(&TransportError::ClosedDuringHandshake);
    }
}
