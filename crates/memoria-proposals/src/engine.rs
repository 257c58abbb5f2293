use crate::audit::{AuditLog, AuditOutcome};
use crate::queue::ImplementationQueue;
use crate::retry::BoundedRetry;
use crate::types::{ChecklistItem, Issue, ItemState, Proposal, ProposalStatus};
use async_trait::async_trait;
use chrono::Utc;
use memoria_core::{
    MemoriaError, MemoriaResult, NewDocument, ProposalConfig, ReviewChannel, ReviewDecision,
    ReviewRequest, Snapshot, SnapshotPhase,
};
use memoria_memory::{IngestOutcome, IngestionPipeline, Namespace, SearchRequest, Store};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Source type of the summary documents written for completed proposals.
pub const OUTCOME_SOURCE_TYPE: &str = "proposal_outcome";

const ENGINE_ACTOR: &str = "engine";
const AUTO_APPROVER: &str = "auto-approval";
const EVENT_CAPACITY: usize = 256;

/// Lifecycle events published by the engine.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProposalEvent {
    /// A status change was persisted.
    Transitioned {
        /// Proposal concerned.
        proposal_id: Uuid,
        /// Previous status.
        from: ProposalStatus,
        /// New status.
        to: ProposalStatus,
        /// Who caused it.
        actor: String,
    },
    /// A checklist item finished executing.
    ItemFinished {
        /// Proposal concerned.
        proposal_id: Uuid,
        /// Zero-based item position.
        index: usize,
        /// Final item state.
        state: ItemState,
    },
    /// A snapshot was written.
    SnapshotTaken {
        /// Proposal concerned.
        proposal_id: Uuid,
        /// The new snapshot.
        snapshot_id: Uuid,
        /// Pre or post.
        phase: SnapshotPhase,
    },
    /// A reviewer was asked for a decision.
    ReviewSolicited {
        /// Proposal concerned.
        proposal_id: Uuid,
        /// Zero-based attempt number.
        attempt: u32,
    },
    /// A pre snapshot was handed back to the executor.
    RolledBack {
        /// Proposal concerned.
        proposal_id: Uuid,
        /// The restored snapshot.
        snapshot_id: Uuid,
    },
}

impl ProposalEvent {
    /// The proposal the event belongs to.
    pub fn proposal_id(&self) -> Uuid {
        match self {
            ProposalEvent::Transitioned { proposal_id, .. }
            | ProposalEvent::ItemFinished { proposal_id, .. }
            | ProposalEvent::SnapshotTaken { proposal_id, .. }
            | ProposalEvent::ReviewSolicited { proposal_id, .. }
            | ProposalEvent::RolledBack { proposal_id, .. } => *proposal_id,
        }
    }
}

/// Executes checklist items and captures the state of the resources they touch.
#[async_trait]
pub trait ItemExecutor: Send + Sync {
    /// Run one item. The returned string is recorded as the item's detail;
    /// an error marks the item failed and halts the proposal.
    async fn execute(
        &self,
        proposal: &Proposal,
        index: usize,
        item: &ChecklistItem,
    ) -> MemoriaResult<String>;

    /// State digest of each resource in `scope`, stored in snapshots.
    async fn manifest(&self, _scope: &BTreeSet<String>) -> MemoriaResult<BTreeMap<String, String>> {
        Ok(BTreeMap::new())
    }

    /// Bring resources back to the state described by a pre snapshot.
    async fn restore(&self, _manifest: &BTreeMap<String, String>) -> MemoriaResult<()> {
        Ok(())
    }
}

/// The proposal state machine.
///
/// Issues become drafts, drafts enter review, approved proposals wait in a
/// FIFO [`ImplementationQueue`] and run one checklist item at a time between
/// a pre and a post snapshot. Every transition is persisted before it becomes
/// visible, and transitions of one proposal are serialized by its own mutex.
pub struct ProposalEngine {
    pipeline: Arc<IngestionPipeline>,
    executor: Arc<dyn ItemExecutor>,
    reviewer: Option<Arc<dyn ReviewChannel>>,
    config: ProposalConfig,
    proposals: RwLock<HashMap<Uuid, Arc<Mutex<Proposal>>>>,
    queue: parking_lot::Mutex<ImplementationQueue>,
    events: broadcast::Sender<ProposalEvent>,
    audit: Arc<AuditLog>,
}

impl ProposalEngine {
    /// Open the engine over the pipeline's store, reloading persisted
    /// proposals. Approved proposals are re-queued in creation order and
    /// proposals caught mid-implementation are marked failed.
    pub async fn open(
        pipeline: Arc<IngestionPipeline>,
        executor: Arc<dyn ItemExecutor>,
        config: ProposalConfig,
    ) -> MemoriaResult<Self> {
        let audit = match pipeline.retriever().store().root() {
            Some(root) => AuditLog::open(root.join("audit")).await?,
            None => AuditLog::in_memory(),
        };
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let engine = Self {
            pipeline,
            executor,
            reviewer: None,
            config,
            proposals: RwLock::new(HashMap::new()),
            queue: parking_lot::Mutex::new(ImplementationQueue::new()),
            events,
            audit: Arc::new(audit),
        };
        engine.reload().await?;
        Ok(engine)
    }

    /// Attach the channel used by [`ProposalEngine::solicit_review`].
    pub fn with_reviewer(mut self, reviewer: Arc<dyn ReviewChannel>) -> Self {
        self.reviewer = Some(reviewer);
        self
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ProposalEvent> {
        self.events.subscribe()
    }

    /// The audit trail.
    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    /// Engine settings.
    pub fn config(&self) -> &ProposalConfig {
        &self.config
    }

    fn store(&self) -> &Arc<Store> {
        self.pipeline.retriever().store()
    }

    /// A copy of one proposal.
    pub async fn get(&self, id: Uuid) -> Option<Proposal> {
        let handle = self.proposals.read().await.get(&id).cloned()?;
        let proposal = handle.lock().await;
        Some(proposal.clone())
    }

    /// All proposals, oldest first.
    pub async fn list(&self) -> Vec<Proposal> {
        let handles: Vec<_> = self.proposals.read().await.values().cloned().collect();
        let mut out = Vec::with_capacity(handles.len());
        for handle in handles {
            out.push(handle.lock().await.clone());
        }
        out.sort_by_key(|p| (p.created_at, p.id));
        out
    }

    /// Approved proposals waiting to run, in release order.
    pub fn queued(&self) -> Vec<Uuid> {
        self.queue.lock().pending()
    }

    // --- submission and review ---

    /// Turn an issue into a proposal and move it as far as the state machine
    /// allows without outside input.
    pub async fn submit(&self, issue: Issue) -> MemoriaResult<Proposal> {
        let mut draft = Proposal::from_issue(issue);
        self.attach_context(&mut draft).await;
        self.persist(&draft).await?;

        let id = draft.id;
        let handle = Arc::new(Mutex::new(draft));
        let mut proposal = handle.lock().await;
        self.proposals.write().await.insert(id, Arc::clone(&handle));

        info!(
            proposal_id = %id,
            category = %proposal.category,
            items = proposal.items.len(),
            max_risk = %proposal.max_risk(),
            "Proposal drafted"
        );
        self.audit_quietly(
            id,
            "submitted",
            serde_json::json!({
                "category": proposal.category,
                "items": proposal.items.len(),
                "context": proposal.context_doc_ids,
            }),
            AuditOutcome::Success,
        )
        .await;

        if !proposal.is_reviewable() {
            warn!(proposal_id = %id, "Draft lacks a category or items; left in draft");
            return Ok(proposal.clone());
        }
        self.advance(&mut proposal, ProposalStatus::PendingReview, ENGINE_ACTOR, None)
            .await?;

        if self.auto_approvable(&proposal) {
            let reason = format!(
                "every item below {} risk",
                self.config.auto_approve_below
            );
            self.advance(
                &mut proposal,
                ProposalStatus::Approved,
                AUTO_APPROVER,
                Some(reason),
            )
            .await?;
            self.queue
                .lock()
                .enqueue(id, proposal.created_at, proposal.resource_scope.clone());
        }

        Ok(proposal.clone())
    }

    /// Apply an external reviewer decision to a pending proposal.
    pub async fn review(&self, id: Uuid, decision: ReviewDecision) -> MemoriaResult<Proposal> {
        let handle = self.handle(id).await?;
        let mut proposal = handle.lock().await;

        let next = if decision.approved {
            ProposalStatus::Approved
        } else {
            ProposalStatus::Rejected
        };
        if proposal.status != ProposalStatus::PendingReview {
            return Err(MemoriaError::ProposalTransition {
                from: proposal.status.to_string(),
                to: next.to_string(),
                reason: "only pending_review proposals accept review decisions".to_string(),
            });
        }

        let note = decision
            .reason
            .as_ref()
            .map(|r| format!("{}: {r}", decision.reviewer));
        self.advance_with(
            &mut proposal,
            next,
            &decision.reviewer,
            decision.reason.clone(),
            |p| p.review_notes.extend(note),
        )
        .await?;

        let outcome = if decision.approved {
            AuditOutcome::Success
        } else {
            AuditOutcome::Denied
        };
        self.audit_quietly(
            id,
            "reviewed",
            serde_json::json!({
                "reviewer": decision.reviewer,
                "approved": decision.approved,
                "reason": decision.reason,
            }),
            outcome,
        )
        .await;

        if decision.approved {
            self.queue
                .lock()
                .enqueue(id, proposal.created_at, proposal.resource_scope.clone());
        }
        Ok(proposal.clone())
    }

    /// Ask the configured reviewer for a decision, bounding each attempt by
    /// `review_timeout_ms` and retrying with backoff. The proposal stays
    /// pending when every attempt fails.
    pub async fn solicit_review(&self, id: Uuid) -> MemoriaResult<Proposal> {
        let reviewer = self
            .reviewer
            .clone()
            .ok_or_else(|| MemoriaError::Config("no review channel configured".to_string()))?;

        let request = {
            let handle = self.handle(id).await?;
            let proposal = handle.lock().await;
            if proposal.status != ProposalStatus::PendingReview {
                return Err(MemoriaError::ProposalTransition {
                    from: proposal.status.to_string(),
                    to: ProposalStatus::Approved.to_string(),
                    reason: "only pending_review proposals can be sent for review".to_string(),
                });
            }
            ReviewRequest {
                proposal_id: id,
                category: proposal.category.clone(),
                description: proposal.description.clone(),
                max_risk: proposal.max_risk(),
                items: proposal
                    .items
                    .iter()
                    .map(|i| format!("[{}] {}: {}", i.risk, i.action, i.description))
                    .collect(),
            }
        };

        let retry = BoundedRetry::new(
            self.config.retry.clone(),
            Duration::from_millis(self.config.review_timeout_ms),
        );
        let decision = retry
            .run("review", |attempt| {
                let _ = self.events.send(ProposalEvent::ReviewSolicited {
                    proposal_id: id,
                    attempt,
                });
                let reviewer = Arc::clone(&reviewer);
                let request = request.clone();
                async move { reviewer.request_review(request).await }
            })
            .await;

        match decision {
            Ok(decision) => self.review(id, decision).await,
            Err(e) => {
                warn!(proposal_id = %id, error = %e, "Reviewer unavailable");
                self.audit_quietly(
                    id,
                    "review_unavailable",
                    serde_json::json!({ "error": e.to_string() }),
                    AuditOutcome::Error,
                )
                .await;
                Err(e)
            }
        }
    }

    /// Withdraw a proposal that has not started implementing.
    pub async fn supersede(&self, id: Uuid, by: Option<Uuid>) -> MemoriaResult<Proposal> {
        if let Some(replacement) = by {
            if replacement == id {
                return Err(MemoriaError::Config(
                    "a proposal cannot supersede itself".to_string(),
                ));
            }
            self.handle(replacement).await?;
        }

        let handle = self.handle(id).await?;
        let mut proposal = handle.lock().await;
        let reason = by.map(|b| format!("superseded by {b}"));
        self.advance_with(
            &mut proposal,
            ProposalStatus::Superseded,
            ENGINE_ACTOR,
            reason,
            |p| p.superseded_by = by,
        )
        .await?;
        self.queue.lock().remove(id);
        Ok(proposal.clone())
    }

    // --- implementation ---

    /// Start the queue head if its scope is free and run it to a terminal
    /// state. `None` when the queue is empty or the head is blocked.
    pub async fn run_next(&self) -> MemoriaResult<Option<Proposal>> {
        let next = self.queue.lock().try_start_head();
        let Some(id) = next else {
            return Ok(None);
        };
        let result = self.implement(id).await;
        self.queue.lock().finish(id);
        result.map(Some)
    }

    /// Run queued proposals until the queue is empty or blocked.
    pub async fn drive(&self) -> MemoriaResult<Vec<Proposal>> {
        let mut finished = Vec::new();
        while let Some(proposal) = self.run_next().await? {
            finished.push(proposal);
        }
        Ok(finished)
    }

    async fn implement(&self, id: Uuid) -> MemoriaResult<Proposal> {
        let handle = self.handle(id).await?;
        let mut proposal = handle.lock().await;
        if proposal.status != ProposalStatus::Approved {
            warn!(
                proposal_id = %id,
                status = %proposal.status,
                "Dequeued proposal is no longer approved; skipping"
            );
            return Ok(proposal.clone());
        }

        let start = Instant::now();
        self.advance(&mut proposal, ProposalStatus::Implementing, ENGINE_ACTOR, None)
            .await?;

        if let Err(e) = self.take_snapshot(&mut proposal, SnapshotPhase::Pre).await {
            self.fail(&mut proposal, format!("pre snapshot failed: {e}"))
                .await?;
            return Ok(proposal.clone());
        }

        let mut failure: Option<MemoriaError> = None;
        for index in 0..proposal.items.len() {
            proposal.items[index].record.started_at = Some(Utc::now());
            if let Err(e) = self.persist(&proposal).await {
                failure = Some(e);
                break;
            }
            let item = proposal.items[index].clone();
            let result = self.executor.execute(&proposal, index, &item).await;

            let (state, detail) = match result {
                Ok(detail) => (ItemState::Succeeded, detail),
                Err(e) => (ItemState::Failed, e.to_string()),
            };
            let record = &mut proposal.items[index].record;
            record.state = state;
            record.detail = Some(detail.clone());
            record.finished_at = Some(Utc::now());

            let _ = self.events.send(ProposalEvent::ItemFinished {
                proposal_id: id,
                index,
                state,
            });
            let outcome = if state == ItemState::Succeeded {
                AuditOutcome::Success
            } else {
                AuditOutcome::Error
            };
            self.audit_quietly(
                id,
                "item_executed",
                serde_json::json!({
                    "index": index,
                    "action": item.action,
                    "risk": item.risk,
                    "state": state,
                    "detail": detail,
                }),
                outcome,
            )
            .await;

            if state == ItemState::Failed {
                warn!(proposal_id = %id, index, action = %item.action, reason = %detail, "Item failed");
                failure = Some(MemoriaError::ItemExecution {
                    index,
                    reason: detail,
                });
                break;
            }
            if let Err(e) = self.persist(&proposal).await {
                failure = Some(e);
                break;
            }
        }

        if let Some(err) = failure {
            self.fail(&mut proposal, err.to_string()).await?;
            return Ok(proposal.clone());
        }

        if let Err(e) = self.take_snapshot(&mut proposal, SnapshotPhase::Post).await {
            self.fail(&mut proposal, format!("post snapshot failed: {e}"))
                .await?;
            return Ok(proposal.clone());
        }

        match self.record_outcome(&proposal).await {
            Ok(doc_id) => {
                self.advance_with(
                    &mut proposal,
                    ProposalStatus::Completed,
                    ENGINE_ACTOR,
                    None,
                    |p| p.outcome_doc_id = Some(doc_id),
                )
                .await?;
            }
            Err(e) => {
                self.fail(&mut proposal, format!("outcome ingestion failed: {e}"))
                    .await?;
                return Ok(proposal.clone());
            }
        }

        info!(
            proposal_id = %id,
            items = proposal.items.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Proposal completed"
        );
        Ok(proposal.clone())
    }

    async fn fail(&self, proposal: &mut Proposal, reason: String) -> MemoriaResult<()> {
        error!(proposal_id = %proposal.id, reason = %reason, "Proposal failed");
        let recorded = reason.clone();
        self.advance_with(
            proposal,
            ProposalStatus::Failed,
            ENGINE_ACTOR,
            Some(reason),
            move |p| {
                p.failure_reason = Some(recorded);
                skip_pending(p);
            },
        )
        .await
    }

    async fn take_snapshot(
        &self,
        proposal: &mut Proposal,
        phase: SnapshotPhase,
    ) -> MemoriaResult<Uuid> {
        let manifest = self.executor.manifest(&proposal.resource_scope).await?;
        let snapshot = Snapshot::new(proposal.id, phase, manifest);
        self.store().put_snapshot(&snapshot).await?;

        let mut updated = proposal.clone();
        updated.snapshot_ids.push(snapshot.id);
        updated.updated_at = Utc::now();
        self.persist(&updated).await?;
        *proposal = updated;

        info!(
            proposal_id = %proposal.id,
            snapshot_id = %snapshot.id,
            phase = ?phase,
            resources = snapshot.manifest.len(),
            "Snapshot taken"
        );
        let _ = self.events.send(ProposalEvent::SnapshotTaken {
            proposal_id: proposal.id,
            snapshot_id: snapshot.id,
            phase,
        });
        Ok(snapshot.id)
    }

    async fn record_outcome(&self, proposal: &Proposal) -> MemoriaResult<Uuid> {
        let doc = NewDocument::new(OUTCOME_SOURCE_TYPE, outcome_summary(proposal))
            .with_metadata("proposal_id", serde_json::json!(proposal.id.to_string()))
            .with_metadata("category", serde_json::json!(proposal.category));
        match self.pipeline.ingest(doc).await? {
            IngestOutcome::Inserted { id } => Ok(id),
            IngestOutcome::Duplicate { existing } => Ok(existing),
            IngestOutcome::Failed { reason } => Err(MemoriaError::Encoding(reason)),
            IngestOutcome::RolledBack { id } => Err(MemoriaError::PersistenceWrite(format!(
                "outcome document {id} was rolled back"
            ))),
        }
    }

    // --- recovery ---

    /// Hand the pre snapshot of a failed proposal back to the executor.
    /// The proposal stays failed; the rollback is recorded.
    pub async fn rollback(&self, id: Uuid) -> MemoriaResult<Proposal> {
        let handle = self.handle(id).await?;
        let mut proposal = handle.lock().await;
        if proposal.status != ProposalStatus::Failed {
            return Err(MemoriaError::ProposalTransition {
                from: proposal.status.to_string(),
                to: "rolled_back".to_string(),
                reason: "only failed proposals can be rolled back".to_string(),
            });
        }

        let snapshot = self
            .store()
            .snapshots_for(id)
            .await?
            .into_iter()
            .find(|s| s.phase == SnapshotPhase::Pre)
            .ok_or_else(|| MemoriaError::NotFound(format!("pre snapshot of proposal {id}")))?;

        if let Err(e) = self.executor.restore(&snapshot.manifest).await {
            self.audit_quietly(
                id,
                "rollback",
                serde_json::json!({ "snapshot_id": snapshot.id, "error": e.to_string() }),
                AuditOutcome::Error,
            )
            .await;
            return Err(e);
        }

        let mut updated = proposal.clone();
        updated.rolled_back = true;
        updated.updated_at = Utc::now();
        self.persist(&updated).await?;
        *proposal = updated;

        info!(proposal_id = %id, snapshot_id = %snapshot.id, "Proposal rolled back");
        self.audit_quietly(
            id,
            "rollback",
            serde_json::json!({
                "snapshot_id": snapshot.id,
                "resources": snapshot.manifest.len(),
            }),
            AuditOutcome::Success,
        )
        .await;
        let _ = self.events.send(ProposalEvent::RolledBack {
            proposal_id: id,
            snapshot_id: snapshot.id,
        });
        Ok(proposal.clone())
    }

    /// Delete the snapshots of a terminal proposal.
    pub async fn prune_snapshots(&self, id: Uuid) -> MemoriaResult<usize> {
        let handle = self.handle(id).await?;
        let proposal = handle.lock().await;
        self.store()
            .delete_snapshots_for(id, proposal.status.is_terminal())
            .await
    }

    async fn reload(&self) -> MemoriaResult<()> {
        let mut loaded: Vec<Proposal> = self.store().list_records(Namespace::Proposals).await?;
        loaded.sort_by_key(|p| (p.created_at, p.id));

        let mut requeued = 0usize;
        let mut interrupted = 0usize;
        let mut map = HashMap::with_capacity(loaded.len());

        for mut proposal in loaded {
            match proposal.status {
                ProposalStatus::Implementing => {
                    for item in &mut proposal.items {
                        if item.record.state == ItemState::Pending && item.record.started_at.is_some()
                        {
                            item.record.state = ItemState::Failed;
                            item.record.detail = Some("interrupted".to_string());
                        }
                    }
                    self.fail(&mut proposal, "interrupted".to_string()).await?;
                    interrupted += 1;
                }
                ProposalStatus::Approved => {
                    self.queue.lock().enqueue(
                        proposal.id,
                        proposal.created_at,
                        proposal.resource_scope.clone(),
                    );
                    requeued += 1;
                }
                _ => {}
            }
            map.insert(proposal.id, Arc::new(Mutex::new(proposal)));
        }

        let total = map.len();
        *self.proposals.write().await = map;
        info!(proposals = total, requeued, interrupted, "Proposal engine loaded");
        Ok(())
    }

    // --- helpers ---

    async fn handle(&self, id: Uuid) -> MemoriaResult<Arc<Mutex<Proposal>>> {
        self.proposals
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| MemoriaError::NotFound(format!("proposal {id}")))
    }

    fn auto_approvable(&self, proposal: &Proposal) -> bool {
        !proposal.items.is_empty()
            && proposal
                .items
                .iter()
                .all(|i| i.risk < self.config.auto_approve_below)
    }

    async fn attach_context(&self, proposal: &mut Proposal) {
        if self.config.context_k == 0 {
            return;
        }
        let text = format!("{} {}", proposal.category, proposal.description);
        let request = SearchRequest::new(text, self.config.context_k)
            .with_source_type(OUTCOME_SOURCE_TYPE);
        match self.pipeline.retriever().search(request).await {
            Ok(response) => {
                for hit in response.hits.into_iter().filter(|h| h.score > 0.0) {
                    proposal.context_doc_ids.push(hit.document.id);
                    proposal.implementation_plan.push(format!(
                        "Context: prior outcome {} (score {:.3})",
                        hit.document.id, hit.score
                    ));
                }
            }
            Err(e) => {
                warn!(proposal_id = %proposal.id, error = %e, "Context retrieval failed");
            }
        }
    }

    async fn persist(&self, proposal: &Proposal) -> MemoriaResult<()> {
        self.store()
            .put_record(Namespace::Proposals, proposal.id, proposal)
            .await
    }

    async fn advance(
        &self,
        proposal: &mut Proposal,
        next: ProposalStatus,
        actor: &str,
        reason: Option<String>,
    ) -> MemoriaResult<()> {
        self.advance_with(proposal, next, actor, reason, |_| {})
            .await
    }

    /// Apply `edit` and the transition to a copy, persist it, then publish.
    /// The live proposal is untouched if either step fails.
    async fn advance_with<F>(
        &self,
        proposal: &mut Proposal,
        next: ProposalStatus,
        actor: &str,
        reason: Option<String>,
        edit: F,
    ) -> MemoriaResult<()>
    where
        F: FnOnce(&mut Proposal) + Send,
    {
        let from = proposal.status;
        let mut updated = proposal.clone();
        edit(&mut updated);
        updated.transition(next, actor, reason.clone())?;
        self.persist(&updated).await?;
        *proposal = updated;

        info!(
            proposal_id = %proposal.id,
            from = %from,
            to = %next,
            actor = %actor,
            "Proposal transition"
        );
        let _ = self.events.send(ProposalEvent::Transitioned {
            proposal_id: proposal.id,
            from,
            to: next,
            actor: actor.to_string(),
        });
        self.audit_quietly(
            proposal.id,
            "transition",
            serde_json::json!({
                "from": from,
                "to": next,
                "actor": actor,
                "reason": reason,
            }),
            AuditOutcome::Success,
        )
        .await;
        Ok(())
    }

    async fn audit_quietly(
        &self,
        proposal_id: Uuid,
        action: &str,
        details: serde_json::Value,
        outcome: AuditOutcome,
    ) {
        if let Err(e) = self
            .audit
            .log_action(proposal_id, action, details, outcome)
            .await
        {
            error!(proposal_id = %proposal_id, action, error = %e, "Audit write failed");
        }
    }
}

fn skip_pending(proposal: &mut Proposal) {
    for item in &mut proposal.items {
        if item.record.state == ItemState::Pending {
            item.record.state = ItemState::Skipped;
        }
    }
}

fn outcome_summary(proposal: &Proposal) -> String {
    let mut text = format!(
        "Proposal {} [{}] completed: {}.",
        proposal.id, proposal.category, proposal.description
    );
    for (i, item) in proposal.items.iter().enumerate() {
        text.push_str(&format!(
            " {}. {} ({}): {}",
            i + 1,
            item.action,
            item.description,
            item.record.detail.as_deref().unwrap_or("done")
        ));
    }
    text
}
