//! Error types for the core pipeline.

use thiserror::Error;

/// Core error type for pipeline construction and operation.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Catalogue loading or reload failed.
    #[error("catalogue error: {0}")]
    Catalog(#[from] warden_catalog::CatalogError),

    /// Flow-control invariant violation.
    #[error("flow error: {0}")]
    Flow(#[from] warden_flow::FlowError),

    /// Session state error.
    #[error("session error: {0}")]
    Session(#[from] warden_session::SessionError),

    /// Configuration is invalid.
    #[error("configuration error: {0}")]
    Config(String),
}
