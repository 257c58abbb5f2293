use chrono::{DateTime, Utc};
use memoria_core::{MemoriaError, MemoriaResult, RiskLevel};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Lifecycle status of a proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    /// Created from an issue; not yet complete enough for review.
    Draft,
    /// Waiting for an approval decision.
    PendingReview,
    /// Approved and queued for implementation.
    Approved,
    /// Checklist items are executing.
    Implementing,
    /// Every item succeeded.
    Completed,
    /// A reviewer refused the proposal.
    Rejected,
    /// An item failed or the run was interrupted.
    Failed,
    /// Replaced by another proposal before implementation started.
    Superseded,
}

impl ProposalStatus {
    /// Terminal states accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProposalStatus::Completed
                | ProposalStatus::Rejected
                | ProposalStatus::Failed
                | ProposalStatus::Superseded
        )
    }

    /// Whether the state machine allows `self -> next`.
    pub fn can_transition_to(self, next: ProposalStatus) -> bool {
        use ProposalStatus::*;
        matches!(
            (self, next),
            (Draft, PendingReview)
                | (Draft, Superseded)
                | (PendingReview, Approved)
                | (PendingReview, Rejected)
                | (PendingReview, Superseded)
                | (Approved, Implementing)
                | (Approved, Superseded)
                | (Implementing, Completed)
                | (Implementing, Failed)
        )
    }
}

impl std::fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProposalStatus::Draft => write!(f, "draft"),
            ProposalStatus::PendingReview => write!(f, "pending_review"),
            ProposalStatus::Approved => write!(f, "approved"),
            ProposalStatus::Implementing => write!(f, "implementing"),
            ProposalStatus::Completed => write!(f, "completed"),
            ProposalStatus::Rejected => write!(f, "rejected"),
            ProposalStatus::Failed => write!(f, "failed"),
            ProposalStatus::Superseded => write!(f, "superseded"),
        }
    }
}

/// One requested action inside an [`Issue`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueItem {
    /// Human-readable description.
    pub description: String,
    /// Risk of executing the action.
    pub risk: RiskLevel,
    /// Action name understood by the item executor.
    pub action: String,
    /// Action parameters.
    #[serde(default)]
    pub params: serde_json::Value,
}

impl IssueItem {
    /// A parameterless item.
    pub fn new(description: impl Into<String>, risk: RiskLevel, action: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            risk,
            action: action.into(),
            params: serde_json::Value::Null,
        }
    }

    /// Attach parameters. Chainable.
    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }
}

/// Input raised by an external collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    /// Maintenance category, e.g. `"index_health"`.
    pub category: String,
    /// What is wrong.
    pub description: String,
    /// Requested actions, executed in order.
    #[serde(default)]
    pub items: Vec<IssueItem>,
    /// Resources the actions touch.
    #[serde(default)]
    pub resource_scope: BTreeSet<String>,
}

impl Issue {
    /// An issue with no items yet.
    pub fn new(category: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            description: description.into(),
            items: Vec::new(),
            resource_scope: BTreeSet::new(),
        }
    }

    /// Append an item. Chainable.
    pub fn with_item(mut self, item: IssueItem) -> Self {
        self.items.push(item);
        self
    }

    /// Add a resource to the scope. Chainable.
    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource_scope.insert(resource.into());
        self
    }
}

/// Execution state of a single checklist item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemState {
    /// Not run yet.
    Pending,
    /// The executor returned success.
    Succeeded,
    /// The executor failed or the run was interrupted.
    Failed,
    /// Never run because an earlier item failed.
    Skipped,
}

/// Per-item execution record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemRecord {
    /// Current state.
    pub state: ItemState,
    /// Executor output on success, failure reason otherwise.
    pub detail: Option<String>,
    /// Persisted before the executor is called.
    pub started_at: Option<DateTime<Utc>>,
    /// Set once the executor returns.
    pub finished_at: Option<DateTime<Utc>>,
}

impl Default for ItemRecord {
    fn default() -> Self {
        Self {
            state: ItemState::Pending,
            detail: None,
            started_at: None,
            finished_at: None,
        }
    }
}

/// A checklist item of a proposal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecklistItem {
    /// Human-readable description.
    pub description: String,
    /// Risk of executing the action.
    pub risk: RiskLevel,
    /// Action name understood by the item executor.
    pub action: String,
    /// Action parameters.
    #[serde(default)]
    pub params: serde_json::Value,
    /// Execution record.
    #[serde(default)]
    pub record: ItemRecord,
}

impl From<IssueItem> for ChecklistItem {
    fn from(item: IssueItem) -> Self {
        Self {
            description: item.description,
            risk: item.risk,
            action: item.action,
            params: item.params,
            record: ItemRecord::default(),
        }
    }
}

/// One entry of a proposal's transition history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transition {
    /// Status before.
    pub from: ProposalStatus,
    /// Status after.
    pub to: ProposalStatus,
    /// When it happened.
    pub at: DateTime<Utc>,
    /// Who caused the transition (`"engine"`, `"auto-approval"`, a reviewer).
    pub actor: String,
    /// Free-form explanation, e.g. a rejection reason.
    pub reason: Option<String>,
}

/// A reviewed, executable and auditable unit of maintenance work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    /// Unique id.
    pub id: Uuid,
    /// Current state.
    pub status: ProposalStatus,
    /// Category copied from the issue.
    pub category: String,
    /// Description copied from the issue.
    pub description: String,
    /// Ordered checklist.
    pub items: Vec<ChecklistItem>,
    /// Resources the checklist touches; overlapping scopes never run together.
    #[serde(default)]
    pub resource_scope: BTreeSet<String>,
    /// Creation time; fixes the queue order.
    pub created_at: DateTime<Utc>,
    /// Last persisted change.
    pub updated_at: DateTime<Utc>,
    /// Reviewer notes, `"reviewer: reason"`.
    #[serde(default)]
    pub review_notes: Vec<String>,
    /// Numbered plan lines plus context references.
    #[serde(default)]
    pub implementation_plan: Vec<String>,
    /// Every transition, oldest first.
    #[serde(default)]
    pub history: Vec<Transition>,
    /// Prior outcome documents retrieved when the proposal was submitted.
    #[serde(default)]
    pub context_doc_ids: Vec<Uuid>,
    /// Replacement proposal, if superseded by one.
    #[serde(default)]
    pub superseded_by: Option<Uuid>,
    /// Pre and post snapshots, in order taken.
    #[serde(default)]
    pub snapshot_ids: Vec<Uuid>,
    /// Outcome summary document written on completion.
    #[serde(default)]
    pub outcome_doc_id: Option<Uuid>,
    /// Why the proposal failed.
    #[serde(default)]
    pub failure_reason: Option<String>,
    /// Set once the pre snapshot has been handed back to the executor.
    #[serde(default)]
    pub rolled_back: bool,
}

impl Proposal {
    /// A fresh draft built from an issue.
    pub fn from_issue(issue: Issue) -> Self {
        let now = Utc::now();
        let implementation_plan = issue
            .items
            .iter()
            .enumerate()
            .map(|(i, item)| {
                format!(
                    "{}. [{}] {}: {}",
                    i + 1,
                    item.risk,
                    item.action,
                    item.description
                )
            })
            .collect();
        Self {
            id: Uuid::new_v4(),
            status: ProposalStatus::Draft,
            category: issue.category,
            description: issue.description,
            items: issue.items.into_iter().map(ChecklistItem::from).collect(),
            resource_scope: issue.resource_scope,
            created_at: now,
            updated_at: now,
            review_notes: Vec::new(),
            implementation_plan,
            history: Vec::new(),
            context_doc_ids: Vec::new(),
            superseded_by: None,
            snapshot_ids: Vec::new(),
            outcome_doc_id: None,
            failure_reason: None,
            rolled_back: false,
        }
    }

    /// Highest item risk; `Low` for an empty checklist.
    pub fn max_risk(&self) -> RiskLevel {
        self.items
            .iter()
            .map(|i| i.risk)
            .max()
            .unwrap_or(RiskLevel::Low)
    }

    /// A draft may enter review once it has a category and at least one item.
    pub fn is_reviewable(&self) -> bool {
        !self.category.trim().is_empty() && !self.items.is_empty()
    }

    /// Move to `next`, recording the transition. Leaves the proposal
    /// untouched when the state machine refuses.
    pub fn transition(
        &mut self,
        next: ProposalStatus,
        actor: impl Into<String>,
        reason: Option<String>,
    ) -> MemoriaResult<()> {
        if !self.status.can_transition_to(next) {
            let why = if self.status.is_terminal() {
                format!("{} is terminal", self.status)
            } else {
                "not allowed by the proposal state machine".to_string()
            };
            return Err(MemoriaError::ProposalTransition {
                from: self.status.to_string(),
                to: next.to_string(),
                reason: why,
            });
        }
        if next == ProposalStatus::PendingReview && !self.is_reviewable() {
            return Err(MemoriaError::ProposalTransition {
                from: self.status.to_string(),
                to: next.to_string(),
                reason: "a draft needs a category and at least one item".to_string(),
            });
        }
        let now = Utc::now();
        self.history.push(Transition {
            from: self.status,
            to: next,
            at: now,
            actor: actor.into(),
            reason,
        });
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// Count of items in the given state.
    pub fn items_in(&self, state: ItemState) -> usize {
        self.items.iter().filter(|i| i.record.state == state).count()
    }
}
