use crate::engine::ItemExecutor;
use crate::types::{ChecklistItem, Proposal};
use async_trait::async_trait;
use chrono::Utc;
use memoria_core::{content_hash, MemoriaError, MemoriaResult};
use memoria_memory::{CancellationToken, IngestionPipeline, RetentionPolicy};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{info, warn};

/// Resource name of the document store in a proposal scope.
pub const RESOURCE_DOCUMENTS: &str = "documents";
/// Resource name of the similarity index.
pub const RESOURCE_VECTOR_INDEX: &str = "vector_index";
/// Resource name of the lexical index.
pub const RESOURCE_LEXICAL_INDEX: &str = "lexical_index";

/// Executes maintenance actions against the memory engine.
///
/// Supported actions:
///
/// | action          | params                                   |
/// |-----------------|------------------------------------------|
/// | `compact_index` | none                                     |
/// | `check_index`   | none                                     |
/// | `rebuild_index` | none                                     |
/// | `reencode`      | none                                     |
/// | `prune`         | `{"max_age_days": n, "source_types": []}` |
///
/// Snapshots record a digest of the documents plus the size of both indexes.
/// Those digests describe state but cannot reconstruct it, so `restore` only
/// re-verifies the indexes against persistence.
pub struct MaintenanceExecutor {
    pipeline: Arc<IngestionPipeline>,
    cancel: CancellationToken,
}

impl MaintenanceExecutor {
    /// Executor acting on `pipeline` and its retriever.
    pub fn new(pipeline: Arc<IngestionPipeline>) -> Self {
        Self {
            pipeline,
            cancel: CancellationToken::new(),
        }
    }

    /// Token that interrupts long-running rebuilds.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    async fn documents_digest(&self) -> String {
        let docs = self.pipeline.retriever().store().documents().await;
        let mut hashes: Vec<&str> = docs.iter().map(|d| d.content_hash.as_str()).collect();
        hashes.sort_unstable();
        format!("count={} sha256={}", docs.len(), content_hash(&hashes.join(",")))
    }
}

#[async_trait]
impl ItemExecutor for MaintenanceExecutor {
    async fn execute(
        &self,
        proposal: &Proposal,
        index: usize,
        item: &ChecklistItem,
    ) -> MemoriaResult<String> {
        let retriever = self.pipeline.retriever();
        info!(proposal_id = %proposal.id, index, action = %item.action, "Executing maintenance item");

        match item.action.as_str() {
            "compact_index" => {
                let removed = retriever.index().compact();
                Ok(format!("compacted {removed} tombstones"))
            }
            "check_index" => {
                let health = self.pipeline.check_index(&self.cancel).await?;
                Ok(serde_json::to_string(&health)?)
            }
            "rebuild_index" => {
                let lexical = retriever.rebuild_lexical().await;
                let (indexed, skipped) = retriever.rebuild_vectors(&self.cancel).await?;
                Ok(format!(
                    "lexical={lexical} vectors={indexed} skipped={skipped}"
                ))
            }
            "reencode" => {
                let report = self.pipeline.reencode_stale(&self.cancel).await?;
                Ok(serde_json::to_string(&report)?)
            }
            "prune" => {
                let policy: RetentionPolicy = serde_json::from_value(item.params.clone())
                    .map_err(|e| MemoriaError::Config(format!("invalid prune params: {e}")))?;
                let now = Utc::now();
                if policy.cutoff(now)?.is_none() {
                    return Err(MemoriaError::Config(
                        "prune requires max_age_days".to_string(),
                    ));
                }
                let report = self.pipeline.prune(&policy, now).await?;
                Ok(format!("removed {} documents", report.removed.len()))
            }
            other => Err(MemoriaError::NotFound(format!(
                "unknown maintenance action '{other}'"
            ))),
        }
    }

    async fn manifest(&self, scope: &BTreeSet<String>) -> MemoriaResult<BTreeMap<String, String>> {
        let retriever = self.pipeline.retriever();
        let mut manifest = BTreeMap::new();
        for resource in scope {
            let state = match resource.as_str() {
                RESOURCE_DOCUMENTS => self.documents_digest().await,
                RESOURCE_VECTOR_INDEX => {
                    let index = retriever.index();
                    format!(
                        "kind={:?} len={} tombstones={} corrupted={}",
                        index.kind(),
                        index.len(),
                        index.tombstones(),
                        index.is_corrupted()
                    )
                }
                RESOURCE_LEXICAL_INDEX => format!("len={}", retriever.lexical_count().await),
                _ => "untracked".to_string(),
            };
            manifest.insert(resource.clone(), state);
        }
        Ok(manifest)
    }

    async fn restore(&self, manifest: &BTreeMap<String, String>) -> MemoriaResult<()> {
        if let Some(expected) = manifest.get(RESOURCE_DOCUMENTS) {
            let current = self.documents_digest().await;
            if &current != expected {
                warn!(
                    expected = %expected,
                    current = %current,
                    "Documents changed since the snapshot and cannot be restored"
                );
            }
        }
        let health = self.pipeline.check_index(&self.cancel).await?;
        info!(health = ?health, "Indexes re-verified after rollback");
        Ok(())
    }
}
