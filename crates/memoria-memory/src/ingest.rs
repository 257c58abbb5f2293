use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use memoria_core::{Document, MemoriaError, MemoriaResult, NewDocument, VectorRecord};
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::hybrid::HybridRetriever;
use crate::index::CancellationToken;
use crate::store::RetentionPolicy;

/// Result of ingesting one document.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IngestOutcome {
    /// Stored and indexed.
    Inserted {
        /// Id of the new document.
        id: Uuid,
    },
    /// Same content already stored; nothing written.
    Duplicate {
        /// Id of the document holding the content.
        existing: Uuid,
    },
    /// Rejected (e.g. nothing to encode); the batch continued.
    Failed {
        /// What went wrong.
        reason: String,
    },
    /// Inserted, then removed when a later write in the batch failed.
    RolledBack {
        /// Id the document had.
        id: Uuid,
    },
}

/// Tally of a batch ingest.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestSummary {
    /// Documents stored.
    pub inserted: usize,
    /// Documents whose content was already stored.
    pub duplicates: usize,
    /// Documents rejected individually.
    pub failed: usize,
    /// Per-document outcomes in input order, up to the abort point.
    pub outcomes: Vec<IngestOutcome>,
    /// Set when a persistence failure aborted the batch.
    pub aborted: Option<String>,
}

impl IngestSummary {
    /// `0` full success, `1` partial success, `2` fatal persistence error.
    pub fn exit_code(&self) -> i32 {
        if self.aborted.is_some() {
            2
        } else if self.duplicates > 0 || self.failed > 0 {
            1
        } else {
            0
        }
    }
}

/// Result of a retention pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PruneReport {
    /// Documents removed.
    pub removed: Vec<Uuid>,
}

/// Result of re-encoding stale vectors.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReencodeReport {
    /// Vectors rewritten with the active embedder.
    pub reencoded: usize,
    /// Documents that could not be encoded.
    pub failed: usize,
    /// Vectors already current.
    pub current: usize,
}

/// Outcome of [`IngestionPipeline::check_index`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IndexHealth {
    /// Index agreed with persistence.
    Healthy,
    /// Divergence found and the index rebuilt from persistence.
    Rebuilt {
        /// What the check found.
        reason: String,
        /// Vectors in the rebuilt index.
        indexed: usize,
    },
}

/// Writes new documents into persistence and both indexes.
///
/// A document is committed to the store (document, then vector) and the
/// indexes together or not at all. Concurrent ingests of the same content
/// are serialized by the store's content-hash reservation.
pub struct IngestionPipeline {
    retriever: Arc<HybridRetriever>,
}

impl IngestionPipeline {
    /// Create a pipeline writing through `retriever`.
    pub fn new(retriever: Arc<HybridRetriever>) -> Self {
        Self { retriever }
    }

    /// The retriever this pipeline feeds.
    pub fn retriever(&self) -> &Arc<HybridRetriever> {
        &self.retriever
    }

    /// Ingest one document.
    ///
    /// Duplicates and encoding failures are outcomes. Only persistence
    /// failures are returned as `Err`, after the partial write is undone.
    pub async fn ingest(&self, new: NewDocument) -> MemoriaResult<IngestOutcome> {
        let doc = Document::from_new(new);
        let store = self.retriever.store();

        if let Err(e) = store.reserve_hash(&doc.content_hash, doc.id) {
            return match e {
                MemoriaError::DuplicateContent { existing, .. } => {
                    info!(existing = %existing, hash = %doc.content_hash, "Duplicate document skipped");
                    Ok(IngestOutcome::Duplicate { existing })
                }
                other => Err(other),
            };
        }

        match self.commit(&doc).await {
            Ok(outcome) => {
                if !matches!(outcome, IngestOutcome::Inserted { .. }) {
                    store.release_hash(&doc.content_hash, doc.id);
                }
                Ok(outcome)
            }
            Err(e) => {
                store.release_hash(&doc.content_hash, doc.id);
                Err(e)
            }
        }
    }

    /// Encode, persist and index a document whose hash is already reserved.
    async fn commit(&self, doc: &Document) -> MemoriaResult<IngestOutcome> {
        let embedder = self.retriever.embedder();
        let embedding = match embedder.encode(&doc.raw_text).await {
            Ok(v) => v,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(doc_id = %doc.id, source_type = %doc.source_type, error = %e, "Document rejected by embedder");
                return Ok(IngestOutcome::Failed {
                    reason: e.to_string(),
                });
            }
        };
        if embedding.len() != embedder.dimension() {
            return Ok(IngestOutcome::Failed {
                reason: format!(
                    "Embedder returned dimension {}, expected {}",
                    embedding.len(),
                    embedder.dimension()
                ),
            });
        }

        let store = self.retriever.store();
        store.put_document(doc).await?;

        let record = VectorRecord::new(doc.id, embedding, embedder.version());
        if let Err(e) = store.put_vector(&record).await {
            self.undo_persist(doc.id).await;
            return Err(e);
        }

        if let Err(e) = self.retriever.index_document(doc, &record.embedding).await {
            self.retriever.unindex_document(doc.id).await;
            self.undo_persist(doc.id).await;
            if e.is_fatal() {
                return Err(e);
            }
            warn!(doc_id = %doc.id, error = %e, "Document could not be indexed");
            return Ok(IngestOutcome::Failed {
                reason: e.to_string(),
            });
        }

        info!(
            doc_id = %doc.id,
            source_type = %doc.source_type,
            hash = %doc.content_hash,
            "Document ingested"
        );
        Ok(IngestOutcome::Inserted { id: doc.id })
    }

    async fn undo_persist(&self, id: Uuid) {
        if let Err(e) = self.retriever.store().delete_document(id).await {
            error!(doc_id = %id, error = %e, "Failed to roll back partially written document");
        }
    }

    /// Ingest a batch in order.
    ///
    /// Per-document failures are counted and the batch continues. A
    /// persistence failure stops the batch and removes every document this
    /// batch inserted.
    pub async fn ingest_batch(&self, docs: Vec<NewDocument>) -> IngestSummary {
        let mut summary = IngestSummary::default();
        let total = docs.len();

        for new in docs {
            match self.ingest(new).await {
                Ok(outcome) => {
                    match &outcome {
                        IngestOutcome::Inserted { .. } => summary.inserted += 1,
                        IngestOutcome::Duplicate { .. } => summary.duplicates += 1,
                        IngestOutcome::Failed { .. } => summary.failed += 1,
                        IngestOutcome::RolledBack { .. } => {}
                    }
                    summary.outcomes.push(outcome);
                }
                Err(e) => {
                    error!(error = %e, processed = summary.outcomes.len(), total, "Batch aborted by persistence failure");
                    self.roll_back_batch(&mut summary).await;
                    summary.aborted = Some(e.to_string());
                    return summary;
                }
            }
        }

        info!(
            total,
            inserted = summary.inserted,
            duplicates = summary.duplicates,
            failed = summary.failed,
            "Batch ingest finished"
        );
        summary
    }

    async fn roll_back_batch(&self, summary: &mut IngestSummary) {
        for outcome in &mut summary.outcomes {
            if let IngestOutcome::Inserted { id } = *outcome {
                if let Err(e) = self.remove_document(id).await {
                    error!(doc_id = %id, error = %e, "Rollback of batch document failed");
                }
                *outcome = IngestOutcome::RolledBack { id };
            }
        }
        summary.inserted = 0;
    }

    /// Remove a document from the indexes and the store.
    pub async fn remove_document(&self, id: Uuid) -> MemoriaResult<bool> {
        self.retriever.unindex_document(id).await;
        self.retriever.store().delete_document(id).await
    }

    /// Apply a retention policy as of `now`.
    pub async fn prune(&self, policy: &RetentionPolicy, now: DateTime<Utc>) -> MemoriaResult<PruneReport> {
        let expired = self.retriever.store().expired(policy, now).await?;
        let mut report = PruneReport::default();
        for id in expired {
            if self.remove_document(id).await? {
                report.removed.push(id);
            }
        }
        info!(
            removed = report.removed.len(),
            max_age_days = ?policy.max_age_days,
            "Retention pass finished"
        );
        Ok(report)
    }

    /// Re-encode every document whose vector was produced by a different
    /// embedder version (or is missing), then rebuild the similarity index.
    pub async fn reencode_stale(&self, cancel: &CancellationToken) -> MemoriaResult<ReencodeReport> {
        let store = self.retriever.store();
        let embedder = self.retriever.embedder();
        let version = embedder.version().to_string();
        let mut report = ReencodeReport::default();

        for doc in store.documents().await {
            if cancel.is_cancelled() {
                return Err(MemoriaError::Cancelled("Re-encode cancelled".to_string()));
            }
            match store.get_vector(doc.id).await? {
                Some(record) if record.embedder_version == version => {
                    report.current += 1;
                    continue;
                }
                _ => {}
            }
            match embedder.encode(&doc.raw_text).await {
                Ok(embedding) => {
                    store
                        .put_vector(&VectorRecord::new(doc.id, embedding, version.as_str()))
                        .await?;
                    report.reencoded += 1;
                }
                Err(e) => {
                    warn!(doc_id = %doc.id, error = %e, "Re-encode failed, keeping old vector");
                    report.failed += 1;
                }
            }
        }

        if report.reencoded > 0 {
            self.retriever.rebuild_vectors(cancel).await?;
        }
        info!(
            reencoded = report.reencoded,
            failed = report.failed,
            current = report.current,
            version = %version,
            "Re-encode finished"
        );
        Ok(report)
    }

    /// Verify both indexes against persistence and rebuild on divergence.
    ///
    /// While the rebuild runs the similarity index answers with exact scans.
    pub async fn check_index(&self, cancel: &CancellationToken) -> MemoriaResult<IndexHealth> {
        let store = self.retriever.store();
        let dimension = self.retriever.embedder().dimension();

        let live: HashSet<Uuid> = store
            .vectors()
            .await?
            .into_iter()
            .filter(|r| r.embedding.len() == dimension)
            .map(|r| r.doc_id)
            .collect();

        if self.retriever.lexical_count().await != store.document_count().await {
            warn!("Lexical index diverged from store, rebuilding");
            self.retriever.rebuild_lexical().await;
        }

        match self.retriever.index().verify_against(&live) {
            Ok(()) => Ok(IndexHealth::Healthy),
            Err(MemoriaError::IndexCorruption(reason)) => {
                let (indexed, _) = self.retriever.rebuild_vectors(cancel).await?;
                info!(indexed, reason = %reason, "Similarity index recovered from persistence");
                Ok(IndexHealth::Rebuilt { reason, indexed })
            }
            Err(e) => Err(e),
        }
    }
}
