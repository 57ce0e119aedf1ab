use thiserror::Error;

/// Failures surfaced by an [`IngestStore`](crate::store::IngestStore).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("inconsistent row: {0}")]
    Integrity(String),
    #[cfg(test)]
    #[error("injected failure: {0}")]
    Injected(String),
}
