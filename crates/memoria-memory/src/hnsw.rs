//! Hierarchical navigable small-world graph.
//!
//! Nodes are assigned a random top layer drawn from an exponential
//! distribution (`floor(-ln(U) / ln(m))`). Each layer is a proximity graph;
//! upper layers are sparse and route a greedy descent towards the query,
//! layer 0 holds every node and is searched with a breadth of `ef`.
//!
//! Similarity is cosine; vectors are L2 normalized on insert so the inner
//! product is the cosine.
//!
//! Removal leaves a tombstone: the node keeps routing traffic but is never
//! returned. [`HnswIndex::compact`] rebuilds the graph from live nodes.

use crate::index::{normalized, IndexKind, VectorIndex};
use memoria_core::{IndexConfig, MemoriaError, MemoriaResult};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet};
use uuid::Uuid;

/// Hard cap on node levels.
const MAX_LEVEL: usize = 16;

/// Construction and search breadth.
#[derive(Debug, Clone)]
pub struct HnswParams {
    /// Max neighbors on layers above 0.
    pub m: usize,
    /// Max neighbors on layer 0.
    pub m_max0: usize,
    /// Candidate list size while inserting.
    pub ef_construction: usize,
    /// Candidate list size while searching.
    pub ef_search: usize,
    /// Seed for level assignment.
    pub seed: u64,
}

impl HnswParams {
    fn level_mult(&self) -> f64 {
        1.0 / (self.m.max(2) as f64).ln()
    }
}

impl From<&IndexConfig> for HnswParams {
    fn from(config: &IndexConfig) -> Self {
        Self {
            m: config.m,
            m_max0: config.m * 2,
            ef_construction: config.ef_construction,
            ef_search: config.ef_search,
            seed: config.seed,
        }
    }
}

impl Default for HnswParams {
    fn default() -> Self {
        Self::from(&IndexConfig::default())
    }
}

#[derive(Debug, Clone)]
struct Node {
    id: Uuid,
    vector: Vec<f32>,
    /// neighbors[layer] for layer in 0..=level
    neighbors: Vec<Vec<usize>>,
    deleted: bool,
}

impl Node {
    fn level(&self) -> usize {
        self.neighbors.len().saturating_sub(1)
    }
}

/// Candidate ordered by similarity; ties broken by slot for determinism.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Scored {
    sim: f32,
    slot: usize,
}

impl Eq for Scored {}

impl PartialOrd for Scored {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scored {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sim
            .total_cmp(&other.sim)
            .then_with(|| other.slot.cmp(&self.slot))
    }
}

/// The native approximate nearest-neighbor index.
#[derive(Debug, Clone)]
pub struct HnswIndex {
    params: HnswParams,
    dimension: Option<usize>,
    nodes: Vec<Node>,
    /// live id -> slot
    slots: HashMap<Uuid, usize>,
    entry_point: Option<usize>,
    rng: StdRng,
    tombstones: usize,
}

impl HnswIndex {
    /// Create an empty graph.
    pub fn new(params: HnswParams) -> Self {
        let rng = StdRng::seed_from_u64(params.seed);
        Self {
            params,
            dimension: None,
            nodes: Vec::new(),
            slots: HashMap::new(),
            entry_point: None,
            rng,
            tombstones: 0,
        }
    }

    /// Build a small graph and check that every vector finds itself.
    /// Used to decide, once, whether the native index is trustworthy.
    pub fn self_test(params: &HnswParams) -> bool {
        let mut probe = HnswIndex::new(params.clone());
        let dim = 8;
        let mut vectors = Vec::new();
        for i in 0..32u32 {
            let v: Vec<f32> = (0..dim)
                .map(|d| ((i * 7 + d * 13) % 17) as f32 + if d == i % dim { 5.0 } else { 0.0 })
                .collect();
            let id = Uuid::from_u128(u128::from(i) + 1);
            if probe.insert(id, &v).is_err() {
                return false;
            }
            vectors.push((id, v));
        }
        probe.verify().is_ok()
            && vectors
                .iter()
                .all(|(id, v)| probe.search(v, 1).first().map(|(hit, _)| hit) == Some(id))
    }

    fn random_level(&mut self) -> usize {
        let u: f64 = 1.0 - self.rng.gen::<f64>();
        let level = (-u.ln() * self.params.level_mult()).floor() as usize;
        level.min(MAX_LEVEL)
    }

    fn max_neighbors(&self, layer: usize) -> usize {
        if layer == 0 {
            self.params.m_max0
        } else {
            self.params.m
        }
    }

    fn sim_to(&self, query: &[f32], slot: usize) -> f32 {
        dot(query, &self.nodes[slot].vector)
    }

    fn sim_between(&self, a: usize, b: usize) -> f32 {
        dot(&self.nodes[a].vector, &self.nodes[b].vector)
    }

    /// Beam search on one layer. Returns up to `ef` slots sorted by
    /// descending similarity, tombstones included.
    fn search_layer(&self, query: &[f32], entry: &[usize], ef: usize, layer: usize) -> Vec<Scored> {
        let mut visited: HashSet<usize> = entry.iter().copied().collect();
        let mut candidates: BinaryHeap<Scored> = BinaryHeap::new();
        let mut results: BinaryHeap<Reverse<Scored>> = BinaryHeap::new();

        for &slot in entry {
            let scored = Scored {
                sim: self.sim_to(query, slot),
                slot,
            };
            candidates.push(scored);
            results.push(Reverse(scored));
            if results.len() > ef {
                results.pop();
            }
        }

        while let Some(current) = candidates.pop() {
            let worst = results.peek().map(|r| r.0.sim).unwrap_or(f32::NEG_INFINITY);
            if results.len() >= ef && current.sim < worst {
                break;
            }

            let Some(neighbors) = self.nodes[current.slot].neighbors.get(layer) else {
                continue;
            };
            for &next in neighbors {
                if !visited.insert(next) {
                    continue;
                }
                let sim = self.sim_to(query, next);
                let worst = results.peek().map(|r| r.0.sim).unwrap_or(f32::NEG_INFINITY);
                if results.len() < ef || sim > worst {
                    let scored = Scored { sim, slot: next };
                    candidates.push(scored);
                    results.push(Reverse(scored));
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }

        let mut out: Vec<Scored> = results.into_iter().map(|r| r.0).collect();
        out.sort_by(|a, b| b.cmp(a));
        out
    }

    /// Greedy descent from the entry point down to `target_layer + 1`.
    fn descend(&self, query: &[f32], target_layer: usize) -> Option<usize> {
        let mut current = self.entry_point?;
        let top = self.nodes[current].level();
        let mut layer = top;
        while layer > target_layer {
            let found = self.search_layer(query, &[current], 1, layer);
            if let Some(best) = found.first() {
                current = best.slot;
            }
            layer -= 1;
        }
        Some(current)
    }

    /// Neighbor selection heuristic: prefer candidates that are closer to the
    /// base than to any already selected neighbor, then fill with the rest.
    fn select_neighbors(&self, candidates: &[Scored], m: usize) -> Vec<usize> {
        let mut selected: Vec<usize> = Vec::with_capacity(m);
        let mut pruned: Vec<usize> = Vec::new();

        for candidate in candidates {
            if selected.len() >= m {
                break;
            }
            let diverse = selected
                .iter()
                .all(|&s| self.sim_between(candidate.slot, s) < candidate.sim);
            if diverse {
                selected.push(candidate.slot);
            } else {
                pruned.push(candidate.slot);
            }
        }

        for slot in pruned {
            if selected.len() >= m {
                break;
            }
            selected.push(slot);
        }
        selected
    }

    fn connect(&mut self, slot: usize, layer: usize, neighbors: Vec<usize>) {
        self.nodes[slot].neighbors[layer] = neighbors.clone();
        let limit = self.max_neighbors(layer);

        for neighbor in neighbors {
            let over = match self.nodes[neighbor].neighbors.get_mut(layer) {
                Some(list) => {
                    list.push(slot);
                    list.len() > limit
                }
                None => continue,
            };
            if over {
                let mut scored: Vec<Scored> = self.nodes[neighbor].neighbors[layer]
                    .iter()
                    .map(|&other| Scored {
                        sim: self.sim_between(neighbor, other),
                        slot: other,
                    })
                    .collect();
                scored.sort_by(|a, b| b.cmp(a));
                let kept = self.select_neighbors(&scored, limit);
                self.nodes[neighbor].neighbors[layer] = kept;
            }
        }
    }

    fn insert_normalized(&mut self, id: Uuid, vector: Vec<f32>) {
        let level = self.random_level();
        let slot = self.nodes.len();
        self.nodes.push(Node {
            id,
            vector,
            neighbors: vec![Vec::new(); level + 1],
            deleted: false,
        });
        self.slots.insert(id, slot);

        let Some(entry) = self.entry_point else {
            self.entry_point = Some(slot);
            return;
        };

        let top = self.nodes[entry].level();
        let query = self.nodes[slot].vector.clone();
        let mut eps = match self.descend(&query, level) {
            Some(ep) => vec![ep],
            None => vec![entry],
        };

        for layer in (0..=level.min(top)).rev() {
            let found = self.search_layer(&query, &eps, self.params.ef_construction, layer);
            let found: Vec<Scored> = found.into_iter().filter(|s| s.slot != slot).collect();
            let neighbors = self.select_neighbors(&found, self.max_neighbors(layer));
            self.connect(slot, layer, neighbors);
            eps = found.iter().map(|s| s.slot).collect();
            if eps.is_empty() {
                eps.push(entry);
            }
        }

        if level > top {
            self.entry_point = Some(slot);
        }
    }

    fn live_scan(&self, query: &[f32], k: usize) -> Vec<(Uuid, f32)> {
        let mut scored: Vec<(Uuid, f32)> = self
            .nodes
            .iter()
            .filter(|n| !n.deleted)
            .map(|n| (n.id, dot(query, &n.vector)))
            .collect();
        sort_hits(&mut scored);
        scored.truncate(k);
        scored
    }

    /// Number of layers above layer 0 at the entry point.
    pub fn top_level(&self) -> usize {
        self.entry_point
            .map(|ep| self.nodes[ep].level())
            .unwrap_or(0)
    }

    /// Drops a node's adjacency and every edge pointing at it.
    #[cfg(test)]
    fn detach(&mut self, id: Uuid) -> bool {
        let Some(&slot) = self.slots.get(&id) else {
            return false;
        };
        if self.entry_point == Some(slot) {
            return false;
        }
        for node in &mut self.nodes {
            for layer in &mut node.neighbors {
                layer.retain(|&n| n != slot);
            }
        }
        self.nodes[slot].neighbors.clear();
        true
    }
}

impl VectorIndex for HnswIndex {
    fn kind(&self) -> IndexKind {
        IndexKind::Native
    }

    fn insert(&mut self, id: Uuid, vector: &[f32]) -> MemoriaResult<()> {
        let dim = *self.dimension.get_or_insert(vector.len());
        if vector.len() != dim {
            return Err(MemoriaError::Encoding(format!(
                "Vector dimension {} does not match index dimension {dim}",
                vector.len()
            )));
        }
        let unit = normalized(vector)?;

        if self.slots.contains_key(&id) {
            self.remove(id);
        }
        self.insert_normalized(id, unit);
        Ok(())
    }

    fn remove(&mut self, id: Uuid) -> bool {
        let Some(slot) = self.slots.remove(&id) else {
            return false;
        };
        self.nodes[slot].deleted = true;
        self.tombstones += 1;
        true
    }

    fn search(&self, query: &[f32], k: usize) -> Vec<(Uuid, f32)> {
        if k == 0 || self.slots.is_empty() {
            return Vec::new();
        }
        let Ok(query) = normalized(query) else {
            return Vec::new();
        };
        if Some(query.len()) != self.dimension {
            return Vec::new();
        }

        let wanted = k.min(self.slots.len());
        let mut ef = self.params.ef_search.max(k);
        loop {
            let Some(ep) = self.descend(&query, 0) else {
                return Vec::new();
            };
            let found = self.search_layer(&query, &[ep], ef, 0);
            let mut hits: Vec<(Uuid, f32)> = found
                .iter()
                .filter(|s| !self.nodes[s.slot].deleted)
                .map(|s| (self.nodes[s.slot].id, s.sim))
                .collect();
            // widen the beam when tombstones crowd out live results
            if hits.len() >= wanted || ef >= self.nodes.len() {
                sort_hits(&mut hits);
                hits.truncate(k);
                return hits;
            }
            ef = (ef * 2).min(self.nodes.len());
        }
    }

    fn exact_search(&self, query: &[f32], k: usize) -> Vec<(Uuid, f32)> {
        match normalized(query) {
            Ok(q) if Some(q.len()) == self.dimension => self.live_scan(&q, k),
            _ => Vec::new(),
        }
    }

    fn vector(&self, id: Uuid) -> Option<&[f32]> {
        self.slots
            .get(&id)
            .map(|&slot| self.nodes[slot].vector.as_slice())
    }

    fn contains(&self, id: Uuid) -> bool {
        self.slots.contains_key(&id)
    }

    fn len(&self) -> usize {
        self.slots.len()
    }

    fn tombstones(&self) -> usize {
        self.tombstones
    }

    fn compact(&mut self) -> usize {
        if self.tombstones == 0 {
            return 0;
        }
        let reclaimed = self.tombstones;
        let live: Vec<(Uuid, Vec<f32>)> = self
            .nodes
            .drain(..)
            .filter(|n| !n.deleted)
            .map(|n| (n.id, n.vector))
            .collect();

        let dimension = self.dimension;
        *self = HnswIndex::new(self.params.clone());
        self.dimension = dimension;
        for (id, vector) in live {
            self.insert_normalized(id, vector);
        }
        reclaimed
    }

    fn verify(&self) -> Result<(), String> {
        if self.nodes.is_empty() {
            return match self.entry_point {
                None => Ok(()),
                Some(ep) => Err(format!("entry point {ep} set on an empty graph")),
            };
        }
        let Some(entry) = self.entry_point else {
            return Err("graph has nodes but no entry point".to_string());
        };
        if entry >= self.nodes.len() {
            return Err(format!("entry point {entry} out of range"));
        }
        let top = self.nodes[entry].level();

        for (slot, node) in self.nodes.iter().enumerate() {
            if node.neighbors.is_empty() {
                return Err(format!("node {} has no adjacency lists", node.id));
            }
            if node.level() > top {
                return Err(format!("node {slot} is above the entry point level"));
            }
            for (layer, neighbors) in node.neighbors.iter().enumerate() {
                for &n in neighbors {
                    if n >= self.nodes.len() {
                        return Err(format!("node {slot} layer {layer} links missing slot {n}"));
                    }
                    if self.nodes[n].level() < layer {
                        return Err(format!(
                            "node {slot} layer {layer} links node {n} that lives below it"
                        ));
                    }
                }
            }
        }

        let live = self.nodes.iter().filter(|n| !n.deleted).count();
        if live != self.slots.len() {
            return Err(format!(
                "{live} live nodes but {} id mappings",
                self.slots.len()
            ));
        }
        for (id, &slot) in &self.slots {
            let node = self.nodes.get(slot).ok_or_else(|| format!("id {id} maps to missing slot"))?;
            if node.id != *id || node.deleted {
                return Err(format!("id {id} maps to the wrong node"));
            }
        }

        Ok(())
    }

    fn ids(&self) -> Vec<Uuid> {
        self.slots.keys().copied().collect()
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Descending by score, then by id for stable output.
pub(crate) fn sort_hits(hits: &mut [(Uuid, f32)]) {
    hits.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn pseudo_random_vectors(n: usize, dim: usize, seed: u64) -> Vec<(Uuid, Vec<f32>)> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|i| {
                let v: Vec<f32> = (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect();
                (Uuid::from_u128(i as u128 + 1), v)
            })
            .collect()
    }

    fn small_params() -> HnswParams {
        HnswParams {
            m: 8,
            m_max0: 16,
            ef_construction: 64,
            ef_search: 32,
            seed: 42,
        }
    }

    #[test]
    fn test_empty_search() {
        let index = HnswIndex::new(small_params());
        assert!(index.search(&[1.0, 0.0], 5).is_empty());
        assert!(index.verify().is_ok());
    }

    #[test]
    fn test_single_vector_found() {
        let mut index = HnswIndex::new(small_params());
        let id = Uuid::new_v4();
        index.insert(id, &[0.5, 0.5, 0.0]).unwrap();
        let hits = index.search(&[1.0, 1.0, 0.0], 3);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, id);
        assert!((hits[0].1 - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let mut index = HnswIndex::new(small_params());
        index.insert(Uuid::new_v4(), &[1.0, 0.0]).unwrap();
        assert!(matches!(
            index.insert(Uuid::new_v4(), &[1.0, 0.0, 0.0]),
            Err(MemoriaError::Encoding(_))
        ));
    }

    #[test]
    fn test_zero_vector_rejected() {
        let mut index = HnswIndex::new(small_params());
        assert!(index.insert(Uuid::new_v4(), &[0.0, 0.0]).is_err());
    }

    #[test]
    fn test_recall_against_exact_scan() {
        let data = pseudo_random_vectors(600, 24, 7);
        let mut index = HnswIndex::new(small_params());
        for (id, v) in &data {
            index.insert(*id, v).unwrap();
        }
        assert!(index.verify().is_ok());

        let queries = pseudo_random_vectors(20, 24, 99);
        let k = 10;
        let mut found = 0;
        for (_, q) in &queries {
            let truth: HashSet<Uuid> = index.exact_search(q, k).into_iter().map(|h| h.0).collect();
            found += index
                .search(q, k)
                .iter()
                .filter(|h| truth.contains(&h.0))
                .count();
        }
        let recall = found as f32 / (queries.len() * k) as f32;
        assert!(recall >= 0.9, "recall {recall} too low");
    }

    #[test]
    fn test_results_sorted_descending_and_bounded() {
        let data = pseudo_random_vectors(200, 16, 3);
        let mut index = HnswIndex::new(small_params());
        for (id, v) in &data {
            index.insert(*id, v).unwrap();
        }
        let hits = index.search(&data[0].1, 7);
        assert_eq!(hits.len(), 7);
        assert_eq!(hits[0].0, data[0].0);
        assert!(hits.windows(2).all(|w| w[0].1 >= w[1].1));
    }

    #[test]
    fn test_tombstone_hidden_then_compacted() {
        let data = pseudo_random_vectors(50, 8, 11);
        let mut index = HnswIndex::new(small_params());
        for (id, v) in &data {
            index.insert(*id, v).unwrap();
        }

        let victim = data[3].0;
        assert!(index.remove(victim));
        assert!(!index.remove(victim));
        assert_eq!(index.tombstones(), 1);
        assert_eq!(index.len(), 49);
        assert!(index.search(&data[3].1, 50).iter().all(|h| h.0 != victim));

        assert_eq!(index.compact(), 1);
        assert_eq!(index.tombstones(), 0);
        assert_eq!(index.len(), 49);
        assert!(index.verify().is_ok());
        assert_eq!(index.search(&data[4].1, 1)[0].0, data[4].0);
    }

    #[test]
    fn test_reinsert_replaces_vector() {
        let mut index = HnswIndex::new(small_params());
        let id = Uuid::new_v4();
        index.insert(id, &[1.0, 0.0]).unwrap();
        index.insert(id, &[0.0, 1.0]).unwrap();
        assert_eq!(index.len(), 1);
        let v = index.vector(id).unwrap();
        assert!(v[1] > 0.99);
    }

    #[test]
    fn test_same_seed_same_graph() {
        let data = pseudo_random_vectors(120, 12, 5);
        let mut a = HnswIndex::new(small_params());
        let mut b = HnswIndex::new(small_params());
        for (id, v) in &data {
            a.insert(*id, v).unwrap();
            b.insert(*id, v).unwrap();
        }
        let q = &data[17].1;
        assert_eq!(a.search(q, 10), b.search(q, 10));
    }

    #[test]
    fn test_detach_is_reported_by_verify() {
        let data = pseudo_random_vectors(30, 8, 13);
        let mut index = HnswIndex::new(small_params());
        for (id, v) in &data {
            index.insert(*id, v).unwrap();
        }
        assert!(index.verify().is_ok());
        let ep_id = index.nodes[index.entry_point.unwrap()].id;
        let victim = data.iter().map(|d| d.0).find(|id| *id != ep_id).unwrap();
        assert!(index.detach(victim));
        assert!(index.verify().is_err());
    }

    #[test]
    fn test_self_test_passes_with_defaults() {
        assert!(HnswIndex::self_test(&HnswParams::default()));
    }
}
