//! Error types for stratum-state

use thiserror::Error;

/// Errors that can occur in the document persistence layer
#[derive(Error, Debug)]
pub enum StorageError {
    /// Database connection error
    #[error("Database connection failed: {0}")]
    Connection(String),

    /// Database query error
    #[error("Database query failed: {0}")]
    Query(String),

    /// Serialization error
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Deserialization error
    #[error("Deserialization failed: {0}")]
    Deserialization(String),

    /// Document not found
    #[error("Document not found: {collection}/{id}")]
    NotFound { collection: String, id: String },

    /// Invalid content digest format
    #[error("Invalid content digest: {digest}")]
    InvalidDigest { digest: String },

    /// Schema setup error
    #[error("Schema setup failed: {0}")]
    SchemaSetup(String),
}

impl From<surrealdb::Error> for StorageError {
    fn from(err: surrealdb::Error) -> Self {
        StorageError::Query(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}
