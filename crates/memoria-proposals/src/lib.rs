//! Self-improvement proposals for the Memoria engine.
//!
//! An [`Issue`] raised by a collaborator becomes a [`Proposal`] that moves
//! through a persisted state machine: draft, review (automatic for low-risk
//! checklists), a FIFO implementation queue guarded by resource scopes,
//! snapshot-bracketed execution and an outcome document fed back into
//! memory for future context.
//!
//! # Main types
//!
//! - [`ProposalEngine`] - The state machine and its queue.
//! - [`ItemExecutor`] - Pluggable execution of checklist items.
//! - [`MaintenanceExecutor`] - Index and retention actions over memory.
//! - [`ImplementationQueue`] - Creation-ordered release with scope locking.
//! - [`BoundedRetry`] - Timeout plus backoff for reviewer lookups.
//! - [`AuditLog`] - Append-only JSONL trail.

/// Append-only audit trail.
pub mod audit;
/// The proposal state machine.
pub mod engine;
/// Maintenance actions over the memory engine.
pub mod maintenance;
/// FIFO implementation queue with resource-scope locking.
pub mod queue;
/// Timeout and backoff for external lookups.
pub mod retry;
/// Proposal, issue and checklist types.
pub mod types;

pub use audit::{AuditEntry, AuditLog, AuditOutcome};
pub use engine::{ItemExecutor, ProposalEngine, ProposalEvent, OUTCOME_SOURCE_TYPE};
pub use maintenance::{
    MaintenanceExecutor, RESOURCE_DOCUMENTS, RESOURCE_LEXICAL_INDEX, RESOURCE_VECTOR_INDEX,
};
pub use queue::ImplementationQueue;
pub use retry::BoundedRetry;
pub use types::{
    ChecklistItem, Issue, IssueItem, ItemRecord, ItemState, Proposal, ProposalStatus, Transition,
};
