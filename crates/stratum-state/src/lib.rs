//! Stratum State - Document Persistence Boundary
//!
//! Layer 0 of the Stratum memory engine. Defines the storage abstractions
//! the engine consumes:
//! - `DocumentStore`: CRUD + indexed query + TTL expiry over memory documents
//! - `Clock`: monotonic time source (system and manual implementations)
//! - `ContentDigest`: SHA-256 content addressing for audit/lineage
//!
//! Two backends satisfy the `DocumentStore` contract:
//! - `fakes::MemoryDocStore` — in-memory, for tests and embedded use
//! - `surreal::SurrealDocStore` — SurrealDB (in-memory or surrealkv file)

pub mod error;
pub mod fakes;
pub mod migrations;
pub mod surreal;
pub mod traits;

pub use error::StorageError;
pub use fakes::{ManualClock, MemoryDocStore};
pub use surreal::SurrealDocStore;
pub use traits::{
    Clock, Collection, ContentDigest, DocId, DocQuery, Document, DocumentStore, StorageResult,
    SystemClock,
};

/// Result type used throughout this crate.
pub type Result<T> = std::result::Result<T, StorageError>;
