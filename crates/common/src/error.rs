use thiserror::Error;

/// Errors raised by the shared storage layer.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}
