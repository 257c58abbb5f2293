//! Core types and error definitions for the Memoria semantic memory engine.
//!
//! This crate provides the foundational types shared across all Memoria crates,
//! including the error taxonomy, the document and vector data model, reviewer
//! types for the proposal workflow, and configuration.
//!
//! # Main types
//!
//! - [`MemoriaError`] - Unified error enum for all Memoria subsystems.
//! - [`MemoriaResult`] - Convenience alias for `Result<T, MemoriaError>`.
//! - [`Document`] - An ingested, immutable text document.
//! - [`NewDocument`] - A document submitted for ingestion.
//! - [`VectorRecord`] - The embedding of a document, tagged with its embedder version.
//! - [`Snapshot`] - Write-once resource manifest captured around a proposal run.
//! - [`MemoriaConfig`] - Top-level configuration loaded from `memoria.toml`.

/// Configuration structs with serde defaults.
pub mod config;
/// Risk levels and reviewer types for the proposal workflow.
pub mod review;

pub use config::{
    EmbedderConfig, IndexConfig, MemoriaConfig, NeuralEmbedderConfig, ProposalConfig,
    RetrievalConfig, RetryPolicy,
};
pub use review::{ReviewChannel, ReviewDecision, ReviewRequest, RiskLevel};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

// --- Error types ---

/// Top-level error type for the Memoria engine.
///
/// Recoverable variants (`Encoding`, `DuplicateContent`) never abort a batch.
/// Structural variants (`PersistenceWrite`, `IndexCorruption`) abort the
/// current operation.
#[derive(Debug, thiserror::Error)]
pub enum MemoriaError {
    /// The embedder rejected its input (empty or without encodable tokens).
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// A document with the same content hash is already stored.
    #[error("Duplicate content {hash} (existing document {existing})")]
    DuplicateContent {
        /// The colliding content hash.
        hash: String,
        /// Id of the document already holding the hash.
        existing: Uuid,
    },

    /// The ANN structure is inconsistent with persistence.
    #[error("Index corruption: {0}")]
    IndexCorruption(String),

    /// A durable write failed. Nothing from the current operation is retained.
    #[error("Persistence write error: {0}")]
    PersistenceWrite(String),

    /// A durable record could not be read back or decoded.
    #[error("Persistence read error: {0}")]
    PersistenceRead(String),

    /// A proposal transition not allowed by the state machine.
    #[error("Invalid proposal transition {from} -> {to}: {reason}")]
    ProposalTransition {
        /// Current status.
        from: String,
        /// Requested status.
        to: String,
        /// Why the transition was refused.
        reason: String,
    },

    /// A single checklist item failed during implementation.
    #[error("Item {index} failed: {reason}")]
    ItemExecution {
        /// Zero-based position of the item in the proposal.
        index: usize,
        /// Failure description reported by the executor.
        reason: String,
    },

    /// A bounded external lookup timed out or failed transiently.
    #[error("Retryable error: {0}")]
    Retryable(String),

    /// A referenced record does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A cooperative cancellation was observed.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MemoriaError {
    /// Whether the caller may retry the operation that produced this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MemoriaError::Retryable(_))
    }

    /// Whether the error aborts the current batch or operation.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MemoriaError::PersistenceWrite(_)
                | MemoriaError::PersistenceRead(_)
                | MemoriaError::IndexCorruption(_)
                | MemoriaError::Io(_)
        )
    }
}

/// A convenience `Result` alias using [`MemoriaError`].
pub type MemoriaResult<T> = Result<T, MemoriaError>;

// --- Document types ---

/// A document submitted for ingestion by an external collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewDocument {
    /// Producer category, e.g. `"market_report"` or `"proposal_outcome"`.
    pub source_type: String,
    /// Raw text to store and index.
    pub text: String,
    /// Arbitrary key-value metadata.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl NewDocument {
    /// Creates a new document submission without metadata.
    pub fn new(source_type: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            source_type: source_type.into(),
            text: text.into(),
            metadata: HashMap::new(),
        }
    }

    /// Attaches a metadata entry. Chainable.
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// A stored document. Append-only: never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Document {
    /// Unique identifier for this document.
    pub id: Uuid,
    /// Producer category.
    pub source_type: String,
    /// The text exactly as submitted.
    pub raw_text: String,
    /// Hex SHA-256 of `raw_text`; unique across documents.
    pub content_hash: String,
    /// Arbitrary key-value metadata.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    /// UTC timestamp of ingestion.
    pub ingested_at: DateTime<Utc>,
}

impl Document {
    /// Materializes a submission into a document with a fresh id.
    pub fn from_new(new: NewDocument) -> Self {
        let content_hash = content_hash(&new.text);
        Self {
            id: Uuid::new_v4(),
            source_type: new.source_type,
            raw_text: new.text,
            content_hash,
            metadata: new.metadata,
            ingested_at: Utc::now(),
        }
    }
}

/// The embedding of one document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VectorRecord {
    /// The document this vector encodes (1:1).
    pub doc_id: Uuid,
    /// Fixed-length embedding.
    pub embedding: Vec<f32>,
    /// Version tag of the embedder that produced `embedding`.
    pub embedder_version: String,
    /// UTC timestamp of encoding.
    pub created_at: DateTime<Utc>,
}

impl VectorRecord {
    /// Creates a record stamped with the current time.
    pub fn new(doc_id: Uuid, embedding: Vec<f32>, embedder_version: impl Into<String>) -> Self {
        Self {
            doc_id,
            embedding,
            embedder_version: embedder_version.into(),
            created_at: Utc::now(),
        }
    }
}

/// When a snapshot was taken relative to an implementation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotPhase {
    /// Before the first item executes.
    Pre,
    /// After every item succeeded.
    Post,
}

/// Immutable record of resource state around a proposal's implementation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    /// Unique identifier.
    pub id: Uuid,
    /// Owning proposal.
    pub proposal_id: Uuid,
    /// Pre or post implementation.
    pub phase: SnapshotPhase,
    /// Resource name to state digest or content.
    pub manifest: BTreeMap<String, String>,
    /// UTC timestamp of capture.
    pub created_at: DateTime<Utc>,
}

impl Snapshot {
    /// Captures a new snapshot with a fresh id.
    pub fn new(proposal_id: Uuid, phase: SnapshotPhase, manifest: BTreeMap<String, String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            proposal_id,
            phase,
            manifest,
            created_at: Utc::now(),
        }
    }
}

/// Hex-encoded SHA-256 of the given text.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_is_stable() {
        let a = content_hash("gold bullish momentum");
        let b = content_hash("gold bullish momentum");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, content_hash("gold bearish momentum"));
    }

    #[test]
    fn test_document_from_new_ignores_metadata_for_hash() {
        let d1 = Document::from_new(
            NewDocument::new("report", "same text").with_metadata("ts", serde_json::json!(1)),
        );
        let d2 = Document::from_new(
            NewDocument::new("report", "same text").with_metadata("ts", serde_json::json!(2)),
        );
        assert_eq!(d1.content_hash, d2.content_hash);
        assert_ne!(d1.id, d2.id);
    }

    #[test]
    fn test_error_classification() {
        assert!(MemoriaError::Retryable("timeout".into()).is_retryable());
        assert!(MemoriaError::PersistenceWrite("disk full".into()).is_fatal());
        assert!(!MemoriaError::Encoding("empty".into()).is_fatal());
    }

    #[test]
    fn test_transition_error_message() {
        let err = MemoriaError::ProposalTransition {
            from: "draft".into(),
            to: "completed".into(),
            reason: "not allowed".into(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid proposal transition draft -> completed: not allowed"
        );
    }
}
