use crate::hnsw::{sort_hits, HnswIndex, HnswParams};
use memoria_core::{IndexConfig, MemoriaError, MemoriaResult};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Which implementation backs a [`SimilarityIndex`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexKind {
    /// Layered proximity graph.
    Native,
    /// Exact linear scan.
    Fallback,
}

/// How a particular search was answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchPath {
    /// Approximate graph traversal.
    Graph,
    /// Exact scan (small corpus, fallback backend, or corrupted graph).
    ExactScan,
}

/// Trait for vector index backends. Scores are cosine similarity.
pub trait VectorIndex: Send + Sync {
    /// Which implementation this is.
    fn kind(&self) -> IndexKind;

    /// Insert or replace the vector for `id`.
    fn insert(&mut self, id: Uuid, vector: &[f32]) -> MemoriaResult<()>;

    /// Remove `id`. Returns false if it was not present.
    fn remove(&mut self, id: Uuid) -> bool;

    /// Top-k by the backend's native strategy.
    fn search(&self, query: &[f32], k: usize) -> Vec<(Uuid, f32)>;

    /// Top-k by exhaustive comparison.
    fn exact_search(&self, query: &[f32], k: usize) -> Vec<(Uuid, f32)>;

    /// The stored (normalized) vector for `id`.
    fn vector(&self, id: Uuid) -> Option<&[f32]>;

    /// Whether `id` is live in the index.
    fn contains(&self, id: Uuid) -> bool;

    /// Number of live vectors.
    fn len(&self) -> usize;

    /// Whether the index holds no live vectors.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removed entries not yet reclaimed.
    fn tombstones(&self) -> usize;

    /// Reclaim tombstones. Returns how many were reclaimed.
    fn compact(&mut self) -> usize;

    /// Structural self-check.
    fn verify(&self) -> Result<(), String>;

    /// All live ids.
    fn ids(&self) -> Vec<Uuid>;
}

/// Exact cosine scan over a hash map. Always correct, linear per query.
#[derive(Debug, Default, Clone)]
pub struct ExactIndex {
    dimension: Option<usize>,
    vectors: HashMap<Uuid, Vec<f32>>,
}

impl ExactIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }
}

impl VectorIndex for ExactIndex {
    fn kind(&self) -> IndexKind {
        IndexKind::Fallback
    }

    fn insert(&mut self, id: Uuid, vector: &[f32]) -> MemoriaResult<()> {
        let dim = *self.dimension.get_or_insert(vector.len());
        if vector.len() != dim {
            return Err(MemoriaError::Encoding(format!(
                "Vector dimension {} does not match index dimension {dim}",
                vector.len()
            )));
        }
        self.vectors.insert(id, normalized(vector)?);
        Ok(())
    }

    fn remove(&mut self, id: Uuid) -> bool {
        self.vectors.remove(&id).is_some()
    }

    fn search(&self, query: &[f32], k: usize) -> Vec<(Uuid, f32)> {
        self.exact_search(query, k)
    }

    fn exact_search(&self, query: &[f32], k: usize) -> Vec<(Uuid, f32)> {
        let Ok(query) = normalized(query) else {
            return Vec::new();
        };
        let mut scored: Vec<(Uuid, f32)> = self
            .vectors
            .iter()
            .filter(|(_, v)| v.len() == query.len())
            .map(|(id, v)| (*id, v.iter().zip(&query).map(|(a, b)| a * b).sum()))
            .collect();
        sort_hits(&mut scored);
        scored.truncate(k);
        scored
    }

    fn vector(&self, id: Uuid) -> Option<&[f32]> {
        self.vectors.get(&id).map(Vec::as_slice)
    }

    fn contains(&self, id: Uuid) -> bool {
        self.vectors.contains_key(&id)
    }

    fn len(&self) -> usize {
        self.vectors.len()
    }

    fn tombstones(&self) -> usize {
        0
    }

    fn compact(&mut self) -> usize {
        0
    }

    fn verify(&self) -> Result<(), String> {
        Ok(())
    }

    fn ids(&self) -> Vec<Uuid> {
        self.vectors.keys().copied().collect()
    }
}

/// Cooperative cancellation token wrapping an `AtomicBool`.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Create a new token (not cancelled).
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    /// Check whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

/// A write applied while a rebuild was in flight.
#[derive(Debug, Clone)]
enum JournalOp {
    Insert(Uuid, Vec<f32>),
    Remove(Uuid),
}

/// The vector index used by the rest of the engine.
///
/// The backend is chosen once, at construction, by probing the native graph.
/// Writers are serialized behind the lock; readers share it and always see
/// the last completed write.
pub struct SimilarityIndex {
    config: IndexConfig,
    kind: IndexKind,
    backend: RwLock<Box<dyn VectorIndex>>,
    corrupted: AtomicBool,
    /// Present while a rebuild runs; concurrent writes are replayed onto the
    /// rebuilt backend before it is swapped in.
    journal: Mutex<Option<Vec<JournalOp>>>,
}

impl SimilarityIndex {
    /// Probe capabilities and build an empty index.
    pub fn new(config: IndexConfig) -> Self {
        let kind = if config.ann_enabled && HnswIndex::self_test(&HnswParams::from(&config)) {
            IndexKind::Native
        } else {
            IndexKind::Fallback
        };
        info!(kind = ?kind, m = config.m, ef_search = config.ef_search, "Vector index selected");
        Self::with_kind(config, kind)
    }

    /// Build with an explicit backend, skipping the probe.
    pub fn with_kind(config: IndexConfig, kind: IndexKind) -> Self {
        let backend = make_backend(&config, kind);
        Self {
            config,
            kind,
            backend: RwLock::new(backend),
            corrupted: AtomicBool::new(false),
            journal: Mutex::new(None),
        }
    }

    /// The backend chosen at construction.
    pub fn kind(&self) -> IndexKind {
        self.kind
    }

    /// Insert or replace a vector.
    pub fn insert(&self, id: Uuid, vector: &[f32]) -> MemoriaResult<()> {
        let mut backend = self.backend.write();
        backend.insert(id, vector)?;
        if let Some(journal) = self.journal.lock().as_mut() {
            journal.push(JournalOp::Insert(id, vector.to_vec()));
        }
        Ok(())
    }

    /// Tombstone a vector; compacts once tombstones pass the configured ratio.
    pub fn remove(&self, id: Uuid) -> bool {
        let mut backend = self.backend.write();
        let removed = backend.remove(id);
        if removed {
            if let Some(journal) = self.journal.lock().as_mut() {
                journal.push(JournalOp::Remove(id));
            }
            let tombstones = backend.tombstones();
            if tombstones > 0
                && tombstones as f32 > self.config.compaction_ratio * backend.len() as f32
            {
                let reclaimed = backend.compact();
                debug!(reclaimed, live = backend.len(), "Vector index compacted");
            }
        }
        removed
    }

    /// Top-k nearest neighbors by cosine similarity, descending.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<(Uuid, f32)> {
        self.search_with_path(query, k).0
    }

    /// Like [`SimilarityIndex::search`], also reporting how it was answered.
    pub fn search_with_path(&self, query: &[f32], k: usize) -> (Vec<(Uuid, f32)>, SearchPath) {
        let backend = self.backend.read();
        let exact = backend.kind() == IndexKind::Fallback
            || backend.len() < self.config.exact_threshold
            || self.is_corrupted();
        if exact {
            (backend.exact_search(query, k), SearchPath::ExactScan)
        } else {
            (backend.search(query, k), SearchPath::Graph)
        }
    }

    /// Cosine between `query` and the stored vector of `id`.
    pub fn similarity(&self, id: Uuid, query: &[f32]) -> Option<f32> {
        let query = normalized(query).ok()?;
        let backend = self.backend.read();
        let stored = backend.vector(id)?;
        if stored.len() != query.len() {
            return None;
        }
        Some(stored.iter().zip(&query).map(|(a, b)| a * b).sum())
    }

    /// Whether `id` is live.
    pub fn contains(&self, id: Uuid) -> bool {
        self.backend.read().contains(id)
    }

    /// Number of live vectors.
    pub fn len(&self) -> usize {
        self.backend.read().len()
    }

    /// Whether no vectors are live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tombstones awaiting compaction.
    pub fn tombstones(&self) -> usize {
        self.backend.read().tombstones()
    }

    /// Reclaim tombstones now.
    pub fn compact(&self) -> usize {
        self.backend.write().compact()
    }

    /// Whether searches are currently forced onto the exact scan.
    pub fn is_corrupted(&self) -> bool {
        self.corrupted.load(Ordering::Acquire)
    }

    /// Force exact-scan mode until the next successful rebuild.
    pub fn mark_corrupted(&self, reason: &str) {
        if !self.corrupted.swap(true, Ordering::AcqRel) {
            error!(reason, "Vector index flagged corrupted, falling back to exact scan");
        }
    }

    /// Compare the index with the authoritative id set from persistence.
    pub fn verify_against(&self, live: &HashSet<Uuid>) -> MemoriaResult<()> {
        let problem = {
            let backend = self.backend.read();
            if let Err(reason) = backend.verify() {
                Some(reason)
            } else {
                let indexed: HashSet<Uuid> = backend.ids().into_iter().collect();
                let missing = live.difference(&indexed).count();
                let orphaned = indexed.difference(live).count();
                if missing > 0 || orphaned > 0 {
                    Some(format!(
                        "{missing} persisted vectors missing from index, {orphaned} indexed vectors without a document"
                    ))
                } else {
                    None
                }
            }
        };

        match problem {
            Some(reason) => {
                self.mark_corrupted(&reason);
                Err(MemoriaError::IndexCorruption(reason))
            }
            None => Ok(()),
        }
    }

    /// Rebuild from authoritative records, one segment at a time.
    ///
    /// Cancellation is checked between segments; a cancelled rebuild discards
    /// everything it built and leaves the current backend in place.
    pub async fn rebuild(
        &self,
        records: Vec<(Uuid, Vec<f32>)>,
        cancel: &CancellationToken,
    ) -> MemoriaResult<usize> {
        {
            let mut journal = self.journal.lock();
            if journal.is_some() {
                return Err(MemoriaError::Cancelled(
                    "Another index rebuild is already running".to_string(),
                ));
            }
            *journal = Some(Vec::new());
        }

        let total = records.len();
        let segment_size = self.config.rebuild_segment_size.max(1);
        let mut fresh = make_backend(&self.config, self.kind);
        let mut skipped = 0usize;

        for (segment_no, segment) in records.chunks(segment_size).enumerate() {
            if cancel.is_cancelled() {
                *self.journal.lock() = None;
                warn!(segment = segment_no, total, "Index rebuild cancelled, partial state discarded");
                return Err(MemoriaError::Cancelled("Index rebuild cancelled".to_string()));
            }
            for (id, vector) in segment {
                if let Err(e) = fresh.insert(*id, vector) {
                    skipped += 1;
                    warn!(doc_id = %id, error = %e, "Skipping unindexable vector during rebuild");
                }
            }
            debug!(segment = segment_no, indexed = fresh.len(), total, "Rebuild segment done");
            tokio::task::yield_now().await;
        }

        if cancel.is_cancelled() {
            *self.journal.lock() = None;
            warn!(total, "Index rebuild cancelled before swap, partial state discarded");
            return Err(MemoriaError::Cancelled("Index rebuild cancelled".to_string()));
        }

        let mut backend = self.backend.write();
        let ops = self.journal.lock().take().unwrap_or_default();
        let replayed = ops.len();
        for op in ops {
            match op {
                JournalOp::Insert(id, vector) => {
                    if let Err(e) = fresh.insert(id, &vector) {
                        warn!(doc_id = %id, error = %e, "Skipping journaled insert during rebuild");
                    }
                }
                JournalOp::Remove(id) => {
                    fresh.remove(id);
                }
            }
        }
        *backend = fresh;
        self.corrupted.store(false, Ordering::Release);

        info!(
            indexed = backend.len(),
            skipped,
            replayed,
            kind = ?self.kind,
            "Vector index rebuilt from persistence"
        );
        Ok(backend.len())
    }
}

fn make_backend(config: &IndexConfig, kind: IndexKind) -> Box<dyn VectorIndex> {
    match kind {
        IndexKind::Native => Box::new(HnswIndex::new(HnswParams::from(config))),
        IndexKind::Fallback => Box::new(ExactIndex::new()),
    }
}

/// L2-normalized copy; zero-norm vectors have no direction and are rejected.
pub(crate) fn normalized(vector: &[f32]) -> MemoriaResult<Vec<f32>> {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm < f32::EPSILON || !norm.is_finite() {
        return Err(MemoriaError::Encoding(
            "Cannot index a zero-norm or non-finite vector".to_string(),
        ));
    }
    Ok(vector.iter().map(|x| x / norm).collect())
}

/// Cosine similarity between two vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn config(exact_threshold: usize) -> IndexConfig {
        IndexConfig {
            exact_threshold,
            m: 8,
            ef_construction: 64,
            ef_search: 32,
            rebuild_segment_size: 4,
            ..IndexConfig::default()
        }
    }

    fn axis(dim: usize, i: usize) -> Vec<f32> {
        let mut v = vec![0.1f32; dim];
        v[i % dim] = 1.0;
        v
    }

    #[test]
    fn test_probe_selects_native() {
        let index = SimilarityIndex::new(config(0));
        assert_eq!(index.kind(), IndexKind::Native);
    }

    #[test]
    fn test_probe_respects_disabled_ann() {
        let cfg = IndexConfig {
            ann_enabled: false,
            ..config(0)
        };
        assert_eq!(SimilarityIndex::new(cfg).kind(), IndexKind::Fallback);
    }

    #[test]
    fn test_small_corpus_uses_exact_scan() {
        let index = SimilarityIndex::with_kind(config(100), IndexKind::Native);
        index.insert(Uuid::new_v4(), &axis(4, 0)).unwrap();
        let (_, path) = index.search_with_path(&axis(4, 0), 1);
        assert_eq!(path, SearchPath::ExactScan);
    }

    #[test]
    fn test_large_corpus_uses_graph() {
        let index = SimilarityIndex::with_kind(config(2), IndexKind::Native);
        for i in 0..5 {
            index.insert(Uuid::new_v4(), &axis(8, i)).unwrap();
        }
        let (hits, path) = index.search_with_path(&axis(8, 1), 2);
        assert_eq!(path, SearchPath::Graph);
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn test_corruption_forces_exact_scan() {
        let index = SimilarityIndex::with_kind(config(2), IndexKind::Native);
        for i in 0..5 {
            index.insert(Uuid::new_v4(), &axis(8, i)).unwrap();
        }
        index.mark_corrupted("test");
        let (_, path) = index.search_with_path(&axis(8, 1), 2);
        assert_eq!(path, SearchPath::ExactScan);
    }

    #[test]
    fn test_verify_against_detects_divergence() {
        let index = SimilarityIndex::with_kind(config(0), IndexKind::Native);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        index.insert(a, &axis(4, 0)).unwrap();
        index.insert(b, &axis(4, 1)).unwrap();

        let live: HashSet<Uuid> = [a, b].into_iter().collect();
        assert!(index.verify_against(&live).is_ok());

        let mut with_extra = live.clone();
        with_extra.insert(Uuid::new_v4());
        assert!(matches!(
            index.verify_against(&with_extra),
            Err(MemoriaError::IndexCorruption(_))
        ));
        assert!(index.is_corrupted());
    }

    #[tokio::test]
    async fn test_rebuild_clears_corruption() {
        let index = SimilarityIndex::with_kind(config(0), IndexKind::Native);
        let records: Vec<(Uuid, Vec<f32>)> =
            (0..10).map(|i| (Uuid::new_v4(), axis(6, i))).collect();
        index.mark_corrupted("test");

        let n = index.rebuild(records.clone(), &CancellationToken::new()).await.unwrap();
        assert_eq!(n, 10);
        assert!(!index.is_corrupted());
        let live: HashSet<Uuid> = records.iter().map(|r| r.0).collect();
        assert!(index.verify_against(&live).is_ok());
    }

    #[tokio::test]
    async fn test_cancelled_rebuild_discards_partial_state() {
        let index = SimilarityIndex::with_kind(config(0), IndexKind::Native);
        let keep = Uuid::new_v4();
        index.insert(keep, &axis(6, 0)).unwrap();
        index.mark_corrupted("test");

        let cancel = CancellationToken::new();
        cancel.cancel();
        let records: Vec<(Uuid, Vec<f32>)> =
            (0..10).map(|i| (Uuid::new_v4(), axis(6, i))).collect();
        let err = index.rebuild(records, &cancel).await.unwrap_err();
        assert!(matches!(err, MemoriaError::Cancelled(_)));

        assert_eq!(index.len(), 1);
        assert!(index.contains(keep));
        assert!(index.is_corrupted());
    }

    #[test]
    fn test_remove_triggers_compaction() {
        let cfg = IndexConfig {
            compaction_ratio: 0.5,
            ..config(0)
        };
        let index = SimilarityIndex::with_kind(cfg, IndexKind::Native);
        let ids: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();
        for (i, id) in ids.iter().enumerate() {
            index.insert(*id, &axis(4, i)).unwrap();
        }
        assert!(index.remove(ids[0]));
        assert_eq!(index.tombstones(), 1);
        assert!(index.remove(ids[1]));
        // 2 tombstones > 0.5 * 2 live
        assert_eq!(index.tombstones(), 0);
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn test_exact_index_basics() {
        let mut exact = ExactIndex::new();
        let a = Uuid::new_v4();
        exact.insert(a, &[0.9, 0.1, 0.0]).unwrap();
        exact.insert(Uuid::new_v4(), &[0.0, 0.0, 1.0]).unwrap();
        let hits = exact.search(&[1.0, 0.0, 0.0], 2);
        assert_eq!(hits[0].0, a);
        assert!(hits[0].1 > hits[1].1);
        assert!(exact.remove(a));
        assert_eq!(exact.len(), 1);
    }

    #[test]
    fn test_cosine_similarity_identical_and_orthogonal() {
        let v = vec![1.0, 0.0, 0.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 0.001);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 0.001);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 0.001);
    }
}
