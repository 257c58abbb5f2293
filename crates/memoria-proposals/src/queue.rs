use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap, VecDeque};
use uuid::Uuid;

#[derive(Debug, Clone)]
struct Queued {
    id: Uuid,
    created_at: DateTime<Utc>,
    scope: BTreeSet<String>,
}

/// FIFO of approved proposals plus the global lock over active resource scopes.
///
/// Proposals are released strictly in creation order: only the head may
/// start, and it waits while its scope overlaps a running proposal's scope,
/// holding back everything behind it.
#[derive(Debug, Default)]
pub struct ImplementationQueue {
    queued: VecDeque<Queued>,
    active: HashMap<Uuid, BTreeSet<String>>,
}

impl ImplementationQueue {
    /// An empty queue with no active scopes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an approved proposal, keeping creation order. Re-enqueueing an id
    /// already queued or active is a no-op.
    pub fn enqueue(&mut self, id: Uuid, created_at: DateTime<Utc>, scope: BTreeSet<String>) {
        if self.contains(id) {
            return;
        }
        let pos = self
            .queued
            .iter()
            .position(|q| (q.created_at, q.id) > (created_at, id))
            .unwrap_or(self.queued.len());
        self.queued.insert(pos, Queued { id, created_at, scope });
    }

    /// The proposal next in line, if any.
    pub fn head(&self) -> Option<Uuid> {
        self.queued.front().map(|q| q.id)
    }

    /// Whether the head exists but must wait for a conflicting scope.
    pub fn is_blocked(&self) -> bool {
        self.queued
            .front()
            .is_some_and(|q| self.conflicts(&q.scope))
    }

    /// Pop the head and mark its scope active if nothing running overlaps it.
    pub fn try_start_head(&mut self) -> Option<Uuid> {
        let head = self.queued.front()?;
        if self.conflicts(&head.scope) {
            return None;
        }
        let q = self.queued.pop_front()?;
        self.active.insert(q.id, q.scope);
        Some(q.id)
    }

    /// Release the scope held by a finished proposal.
    pub fn finish(&mut self, id: Uuid) -> bool {
        self.active.remove(&id).is_some()
    }

    /// Drop a queued proposal (supersession). Active proposals are not touched.
    pub fn remove(&mut self, id: Uuid) -> bool {
        let before = self.queued.len();
        self.queued.retain(|q| q.id != id);
        self.queued.len() != before
    }

    /// Whether `id` is queued or running.
    pub fn contains(&self, id: Uuid) -> bool {
        self.active.contains_key(&id) || self.queued.iter().any(|q| q.id == id)
    }

    /// Queued ids in release order.
    pub fn pending(&self) -> Vec<Uuid> {
        self.queued.iter().map(|q| q.id).collect()
    }

    /// Number of queued proposals, excluding active ones.
    pub fn len(&self) -> usize {
        self.queued.len()
    }

    /// Whether nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }

    /// Number of proposals currently holding a scope.
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    fn conflicts(&self, scope: &BTreeSet<String>) -> bool {
        self.active
            .values()
            .any(|held| !held.is_disjoint(scope))
    }
}
