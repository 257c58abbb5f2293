use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use memoria_core::{Document, MemoriaError, MemoriaResult, RetrievalConfig};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bm25::Bm25Index;
use crate::embedding::Embedder;
use crate::index::{cosine_similarity, CancellationToken, SimilarityIndex};
use crate::store::Store;

/// What the caller is searching with.
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    /// Free text; both sources are available.
    Text(String),
    /// A precomputed embedding; only the vector source is available.
    Vector(Vec<f32>),
}

impl From<&str> for Query {
    fn from(text: &str) -> Self {
        Query::Text(text.to_string())
    }
}

impl From<String> for Query {
    fn from(text: String) -> Self {
        Query::Text(text)
    }
}

impl From<Vec<f32>> for Query {
    fn from(vector: Vec<f32>) -> Self {
        Query::Vector(vector)
    }
}

/// Relative weight of each score source in the fused score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetrievalWeights {
    /// Weight of the normalized cosine score.
    pub vector: f32,
    /// Weight of the normalized BM25 score.
    pub lexical: f32,
}

impl RetrievalWeights {
    /// Explicit weights. Negative values are clamped to zero.
    pub fn new(vector: f32, lexical: f32) -> Self {
        Self {
            vector: vector.max(0.0),
            lexical: lexical.max(0.0),
        }
    }
}

impl Default for RetrievalWeights {
    fn default() -> Self {
        Self::from(&RetrievalConfig::default())
    }
}

impl From<&RetrievalConfig> for RetrievalWeights {
    fn from(config: &RetrievalConfig) -> Self {
        Self::new(config.vector_weight, config.lexical_weight)
    }
}

/// Which sources contributed to a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    /// Vector and lexical scores fused.
    Hybrid,
    /// Cosine only.
    VectorOnly,
    /// BM25 only.
    LexicalOnly,
}

/// A search request. Build with [`SearchRequest::new`] and the `with_*` methods.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    /// Text or vector.
    pub query: Query,
    /// Maximum number of hits.
    pub k: usize,
    /// Source weights.
    pub weights: RetrievalWeights,
    /// Restrict hits to one producer category.
    pub source_type: Option<String>,
}

impl SearchRequest {
    /// A request with default weights.
    pub fn new(query: impl Into<Query>, k: usize) -> Self {
        Self {
            query: query.into(),
            k,
            weights: RetrievalWeights::default(),
            source_type: None,
        }
    }

    /// Override the weights. Chainable.
    pub fn with_weights(mut self, weights: RetrievalWeights) -> Self {
        self.weights = weights;
        self
    }

    /// Restrict to a source type. Chainable.
    pub fn with_source_type(mut self, source_type: impl Into<String>) -> Self {
        self.source_type = Some(source_type.into());
        self
    }
}

/// One ranked document.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    /// The stored document.
    pub document: Document,
    /// Fused score in `[0, 1]`.
    pub score: f32,
    /// Raw cosine similarity, when the vector source was used.
    pub vector_score: Option<f32>,
    /// Raw BM25 score, when the lexical source was used.
    pub lexical_score: Option<f32>,
}

/// Ranked hits plus how they were produced.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    /// At most `k` hits, descending by score.
    pub hits: Vec<SearchHit>,
    /// A source the weights asked for could not be used.
    pub degraded: bool,
    /// Sources that contributed.
    pub mode: SearchMode,
}

/// Counts reported after loading indexes from persistence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Documents added to the lexical index.
    pub lexical: usize,
    /// Vectors added to the similarity index.
    pub vectors: usize,
    /// Vectors left out because their dimension does not match the embedder.
    pub skipped: usize,
}

/// Fused vector + lexical retriever over the store.
///
/// The fused score of a candidate is
///
/// ```text
/// fused = wv * minmax(cosine) + wl * minmax(bm25)      with wv + wl = 1
/// ```
///
/// where the candidate pool is the union of the top `k * candidate_multiplier`
/// from each source. Cosine is computed for every candidate from its stored
/// vector; a candidate without lexical overlap scores 0 on that side.
pub struct HybridRetriever {
    store: Arc<Store>,
    embedder: Arc<dyn Embedder>,
    index: Arc<SimilarityIndex>,
    bm25: RwLock<Bm25Index>,
    config: RetrievalConfig,
}

impl HybridRetriever {
    /// Create a retriever with empty indexes. See [`HybridRetriever::load`].
    pub fn new(
        store: Arc<Store>,
        embedder: Arc<dyn Embedder>,
        index: Arc<SimilarityIndex>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            store,
            embedder,
            index,
            bm25: RwLock::new(Bm25Index::new()),
            config,
        }
    }

    /// The backing store.
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// The active embedder.
    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    /// The similarity index.
    pub fn index(&self) -> &Arc<SimilarityIndex> {
        &self.index
    }

    /// Retrieval defaults.
    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Populate both indexes from persistence.
    pub async fn load(&self, cancel: &CancellationToken) -> MemoriaResult<LoadReport> {
        let lexical = self.rebuild_lexical().await;
        let (vectors, skipped) = self.rebuild_vectors(cancel).await?;
        info!(lexical, vectors, skipped, "Retriever indexes loaded from store");
        Ok(LoadReport {
            lexical,
            vectors,
            skipped,
        })
    }

    /// Rebuild the lexical index from every stored document.
    pub async fn rebuild_lexical(&self) -> usize {
        let mut fresh = Bm25Index::new();
        for doc in self.store.documents().await {
            fresh.add_document(doc.id, &doc.raw_text);
        }
        let count = fresh.document_count();
        *self.bm25.write().await = fresh;
        count
    }

    /// Rebuild the similarity index from persisted vectors.
    ///
    /// Returns `(indexed, skipped)`. Vectors from an embedder with another
    /// dimension are skipped until re-encoded.
    pub async fn rebuild_vectors(&self, cancel: &CancellationToken) -> MemoriaResult<(usize, usize)> {
        let dimension = self.embedder.dimension();
        let mut skipped = 0;
        let records: Vec<(Uuid, Vec<f32>)> = self
            .store
            .vectors()
            .await?
            .into_iter()
            .filter_map(|r| {
                if r.embedding.len() == dimension {
                    Some((r.doc_id, r.embedding))
                } else {
                    skipped += 1;
                    None
                }
            })
            .collect();
        if skipped > 0 {
            warn!(skipped, dimension, "Stored vectors with a foreign dimension left out of the index");
        }
        let indexed = self.index.rebuild(records, cancel).await?;
        Ok((indexed, skipped))
    }

    /// Add a persisted document to both indexes.
    pub async fn index_document(&self, doc: &Document, embedding: &[f32]) -> MemoriaResult<()> {
        self.index.insert(doc.id, embedding)?;
        self.bm25.write().await.add_document(doc.id, &doc.raw_text);
        Ok(())
    }

    /// Remove a document from both indexes.
    pub async fn unindex_document(&self, id: Uuid) {
        self.index.remove(id);
        self.bm25.write().await.remove_document(id);
    }

    /// Number of documents in the lexical index.
    pub async fn lexical_count(&self) -> usize {
        self.bm25.read().await.document_count()
    }

    /// Whether `id` is in the lexical index.
    pub async fn lexical_contains(&self, id: Uuid) -> bool {
        self.bm25.read().await.contains(id)
    }

    /// Search with the configured default weights.
    pub async fn query(&self, query: impl Into<Query>, k: usize) -> MemoriaResult<SearchResponse> {
        let request = SearchRequest::new(query, k).with_weights(RetrievalWeights::from(&self.config));
        self.search(request).await
    }

    /// Run a search.
    pub async fn search(&self, request: SearchRequest) -> MemoriaResult<SearchResponse> {
        let SearchRequest {
            query,
            k,
            weights,
            source_type,
        } = request;

        let (text, query_vector, embed_failed) = match query {
            Query::Vector(v) => (None, Some(v), false),
            Query::Text(t) => {
                let vector = if weights.vector > 0.0 {
                    match self.embedder.encode(&t).await {
                        Ok(v) => Some(v),
                        Err(e) => {
                            warn!(error = %e, "Query encoding failed, vector source unavailable");
                            None
                        }
                    }
                } else {
                    None
                };
                let failed = weights.vector > 0.0 && vector.is_none();
                (Some(t), vector, failed)
            }
        };

        let vector_available = query_vector.is_some();
        let lexical_available = text.is_some();
        let degraded = embed_failed || (weights.lexical > 0.0 && !lexical_available);

        let mut use_vector = vector_available && weights.vector > 0.0;
        let mut use_lexical = lexical_available && weights.lexical > 0.0;
        if !use_vector && !use_lexical {
            use_vector = vector_available;
            use_lexical = !use_vector && lexical_available;
        }

        let (mode, wv, wl) = match (use_vector, use_lexical) {
            (true, true) => {
                let total = weights.vector + weights.lexical;
                (SearchMode::Hybrid, weights.vector / total, weights.lexical / total)
            }
            (true, false) => (SearchMode::VectorOnly, 1.0, 0.0),
            _ => (SearchMode::LexicalOnly, 0.0, 1.0),
        };

        if k == 0 || (!use_vector && !use_lexical) {
            return Ok(SearchResponse {
                hits: Vec::new(),
                degraded,
                mode,
            });
        }

        let fetch = k.saturating_mul(self.config.candidate_multiplier.max(1));
        let lexical_scores: HashMap<Uuid, f32> = match (&text, use_lexical) {
            (Some(t), true) => self.bm25.read().await.score_all(t),
            _ => HashMap::new(),
        };

        // candidate pool
        let mut candidates: Vec<Uuid> = Vec::new();
        let mut seen: HashSet<Uuid> = HashSet::new();
        match &source_type {
            Some(st) => {
                // exact pool: every document of the requested type
                for doc in self.store.documents().await {
                    if &doc.source_type == st && seen.insert(doc.id) {
                        candidates.push(doc.id);
                    }
                }
            }
            None => {
                if let (true, Some(qv)) = (use_vector, &query_vector) {
                    for (id, _) in self.index.search(qv, fetch) {
                        if seen.insert(id) {
                            candidates.push(id);
                        }
                    }
                }
                if use_lexical {
                    let mut top: Vec<(Uuid, f32)> =
                        lexical_scores.iter().map(|(id, s)| (*id, *s)).collect();
                    crate::hnsw::sort_hits(&mut top);
                    for (id, _) in top.into_iter().take(fetch) {
                        if seen.insert(id) {
                            candidates.push(id);
                        }
                    }
                }
            }
        }

        let documents = self.store.get_documents(&candidates).await;

        let mut raw_vector: Vec<Option<f32>> = Vec::with_capacity(documents.len());
        let mut raw_lexical: Vec<Option<f32>> = Vec::with_capacity(documents.len());
        for doc in &documents {
            let cosine = match (use_vector, &query_vector) {
                (true, Some(qv)) => self.stored_cosine(doc.id, qv).await?,
                _ => None,
            };
            raw_vector.push(cosine);
            raw_lexical.push(if use_lexical {
                Some(lexical_scores.get(&doc.id).copied().unwrap_or(0.0))
            } else {
                None
            });
        }

        let norm_vector = min_max(&raw_vector);
        let norm_lexical = min_max(&raw_lexical);

        let mut hits: Vec<SearchHit> = documents
            .into_iter()
            .enumerate()
            .map(|(i, document)| SearchHit {
                document,
                score: wv * norm_vector[i] + wl * norm_lexical[i],
                vector_score: raw_vector[i],
                lexical_score: raw_lexical[i],
            })
            .filter(|hit| mode != SearchMode::LexicalOnly || hit.lexical_score.unwrap_or(0.0) > 0.0)
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| b.document.ingested_at.cmp(&a.document.ingested_at))
                .then_with(|| a.document.id.cmp(&b.document.id))
        });
        hits.truncate(k);

        debug!(
            k,
            returned = hits.len(),
            mode = ?mode,
            degraded,
            corrupted_index = self.index.is_corrupted(),
            "Hybrid search"
        );

        Ok(SearchResponse {
            hits,
            degraded,
            mode,
        })
    }

    /// Cosine against the indexed vector, falling back to the persisted one
    /// when the index has lost it.
    async fn stored_cosine(&self, id: Uuid, query: &[f32]) -> MemoriaResult<Option<f32>> {
        if let Some(sim) = self.index.similarity(id, query) {
            return Ok(Some(sim));
        }
        match self.store.get_vector(id).await {
            Ok(Some(record)) if record.embedding.len() == query.len() => {
                Ok(Some(cosine_similarity(&record.embedding, query)))
            }
            Ok(_) => Ok(None),
            Err(e @ MemoriaError::PersistenceRead(_)) => {
                warn!(doc_id = %id, error = %e, "Unreadable vector record ignored in ranking");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

/// Min-max scale the present values into `[0, 1]`; absent values map to 0.
/// A constant list maps to 1.0 when its value is positive, else 0.0.
fn min_max(values: &[Option<f32>]) -> Vec<f32> {
    let present = values.iter().flatten();
    let (min, max) = present.fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
        (lo.min(v), hi.max(v))
    });
    values
        .iter()
        .map(|v| match v {
            None => 0.0,
            Some(_) if (max - min).abs() <= f32::EPSILON => {
                if max > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Some(x) => (x - min) / (max - min),
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::embedding::LexicalEmbedder;
    use memoria_core::{IndexConfig, NewDocument, VectorRecord};

    async fn retriever_with(texts: &[(&str, &str)]) -> (HybridRetriever, Vec<Document>) {
        let store = Arc::new(Store::in_memory().await.unwrap());
        let embedder: Arc<dyn Embedder> = Arc::new(LexicalEmbedder::new(128));
        let index = Arc::new(SimilarityIndex::new(IndexConfig::default()));
        let retriever = HybridRetriever::new(store.clone(), embedder.clone(), index, RetrievalConfig::default());

        let mut docs = Vec::new();
        for (source_type, text) in texts {
            let doc = Document::from_new(NewDocument::new(*source_type, *text));
            let v = embedder.encode(text).await.unwrap();
            store.put_document(&doc).await.unwrap();
            store
                .put_vector(&VectorRecord::new(doc.id, v.clone(), embedder.version()))
                .await
                .unwrap();
            retriever.index_document(&doc, &v).await.unwrap();
            docs.push(doc);
        }
        (retriever, docs)
    }

    #[test]
    fn test_min_max_scaling() {
        let scaled = min_max(&[Some(2.0), Some(4.0), None, Some(3.0)]);
        assert_eq!(scaled, vec![0.0, 1.0, 0.0, 0.5]);
    }

    #[test]
    fn test_min_max_constant_list() {
        assert_eq!(min_max(&[Some(0.4), Some(0.4)]), vec![1.0, 1.0]);
        assert_eq!(min_max(&[Some(0.0), Some(0.0)]), vec![0.0, 0.0]);
        assert_eq!(min_max(&[Some(-0.2)]), vec![0.0]);
        assert!(min_max(&[]).is_empty());
    }

    #[tokio::test]
    async fn test_hybrid_ranks_best_match_first() {
        let (retriever, docs) = retriever_with(&[
            ("report", "gold bullish momentum building on strong volume"),
            ("report", "oil inventories rise as demand softens"),
            ("report", "cooking recipes for a delicious dinner"),
        ])
        .await;

        let response = retriever.query("gold bullish momentum", 3).await.unwrap();
        assert_eq!(response.mode, SearchMode::Hybrid);
        assert!(!response.degraded);
        assert_eq!(response.hits[0].document.id, docs[0].id);
        assert!(response.hits[0].score > 0.5);
        assert!(response.hits.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[tokio::test]
    async fn test_vector_query_is_vector_only_and_degraded() {
        let (retriever, docs) = retriever_with(&[
            ("report", "copper supply deficit widens"),
            ("report", "wheat harvest beats forecasts"),
        ])
        .await;
        let v = retriever.embedder().encode("copper supply").await.unwrap();

        let response = retriever.query(v.clone(), 2).await.unwrap();
        assert_eq!(response.mode, SearchMode::VectorOnly);
        assert!(response.degraded);
        assert_eq!(response.hits[0].document.id, docs[0].id);

        let request = SearchRequest::new(v, 2).with_weights(RetrievalWeights::new(1.0, 0.0));
        let response = retriever.search(request).await.unwrap();
        assert!(!response.degraded);
    }

    #[tokio::test]
    async fn test_unencodable_query_degrades_to_lexical() {
        let (retriever, _) = retriever_with(&[("report", "gold rally")]).await;
        let response = retriever.query("!!!", 3).await.unwrap();
        assert!(response.degraded);
        assert_eq!(response.mode, SearchMode::LexicalOnly);
        assert!(response.hits.is_empty());
    }

    #[tokio::test]
    async fn test_lexical_only_weights() {
        let (retriever, docs) = retriever_with(&[
            ("report", "silver breaks resistance"),
            ("report", "natural gas storage report"),
        ])
        .await;
        let request =
            SearchRequest::new("silver", 5).with_weights(RetrievalWeights::new(0.0, 1.0));
        let response = retriever.search(request).await.unwrap();
        assert_eq!(response.mode, SearchMode::LexicalOnly);
        assert_eq!(response.hits.len(), 1);
        assert_eq!(response.hits[0].document.id, docs[0].id);
        assert!(response.hits[0].vector_score.is_none());
    }

    #[tokio::test]
    async fn test_source_type_filter() {
        let (retriever, docs) = retriever_with(&[
            ("report", "gold momentum report"),
            ("proposal_outcome", "gold momentum alert threshold tuned"),
        ])
        .await;
        let request = SearchRequest::new("gold momentum", 5).with_source_type("proposal_outcome");
        let response = retriever.search(request).await.unwrap();
        assert_eq!(response.hits.len(), 1);
        assert_eq!(response.hits[0].document.id, docs[1].id);
    }

    #[tokio::test]
    async fn test_zero_k_returns_nothing() {
        let (retriever, _) = retriever_with(&[("report", "gold rally")]).await;
        assert!(retriever.query("gold", 0).await.unwrap().hits.is_empty());
    }

    #[tokio::test]
    async fn test_unindex_removes_from_both_sources() {
        let (retriever, docs) = retriever_with(&[
            ("report", "platinum output cut"),
            ("report", "palladium output cut"),
        ])
        .await;
        retriever.unindex_document(docs[0].id).await;
        assert!(!retriever.lexical_contains(docs[0].id).await);
        assert!(!retriever.index().contains(docs[0].id));
    }

    #[tokio::test]
    async fn test_load_rebuilds_from_store() {
        let (retriever, docs) = retriever_with(&[
            ("report", "cocoa prices hit record"),
            ("report", "coffee futures slide"),
        ])
        .await;
        let fresh = HybridRetriever::new(
            retriever.store().clone(),
            retriever.embedder().clone(),
            Arc::new(SimilarityIndex::new(IndexConfig::default())),
            RetrievalConfig::default(),
        );
        let report = fresh.load(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.lexical, 2);
        assert_eq!(report.vectors, 2);
        let response = fresh.query("cocoa record", 1).await.unwrap();
        assert_eq!(response.hits[0].document.id, docs[0].id);
    }
}
