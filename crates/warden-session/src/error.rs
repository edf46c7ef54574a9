//! Error types for session state.

use thiserror::Error;

/// Errors raised by session and profile management.
#[derive(Debug, Error)]
pub enum SessionError {
    /// No profile is registered for the user.
    #[error("unknown user '{0}'")]
    UnknownUser(String),

    /// No state exists for the session.
    #[error("unknown session '{0}'")]
    UnknownSession(String),
}
