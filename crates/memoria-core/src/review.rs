//! Reviewer types for the proposal workflow.
//!
//! These types live in `memoria-core` so that both `memoria-proposals` (which
//! drives the review step) and `memoria-cli` (which implements an interactive
//! terminal reviewer) can share them without circular deps.

use crate::MemoriaResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Risk level of a single checklist item. Ordered from least to most risky.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    /// Safe to execute without human sign-off.
    Low,
    /// Changes observable behavior.
    Medium,
    /// Touches critical state.
    High,
    /// Irreversible or wide-reaching.
    Critical,
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RiskLevel::Low => write!(f, "low"),
            RiskLevel::Medium => write!(f, "medium"),
            RiskLevel::High => write!(f, "high"),
            RiskLevel::Critical => write!(f, "critical"),
        }
    }
}

/// A request sent to an external reviewer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewRequest {
    /// The proposal awaiting a decision.
    pub proposal_id: Uuid,
    /// Proposal category.
    pub category: String,
    /// Human-readable summary of the proposal.
    pub description: String,
    /// Highest risk among the proposal's items.
    pub max_risk: RiskLevel,
    /// One line per checklist item.
    pub items: Vec<String>,
}

/// The decision returned by a reviewer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewDecision {
    /// Whether the proposal may proceed.
    pub approved: bool,
    /// Optional justification.
    pub reason: Option<String>,
    /// Who decided.
    pub reviewer: String,
}

impl ReviewDecision {
    /// An approval by `reviewer`.
    pub fn approve(reviewer: impl Into<String>) -> Self {
        Self {
            approved: true,
            reason: None,
            reviewer: reviewer.into(),
        }
    }

    /// A rejection by `reviewer` with a reason.
    pub fn reject(reviewer: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            approved: false,
            reason: Some(reason.into()),
            reviewer: reviewer.into(),
        }
    }
}

/// Channel through which review requests are sent and decisions are received.
/// Implementations can be CLI prompts, chat bots, ticket queues, etc.
#[async_trait]
pub trait ReviewChannel: Send + Sync {
    /// Ask for a decision. Slow channels are bounded by the engine's timeout.
    async fn request_review(&self, request: ReviewRequest) -> MemoriaResult<ReviewDecision>;
}
