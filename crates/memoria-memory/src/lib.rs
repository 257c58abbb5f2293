//! Semantic memory: encoding, indexing, persistence and retrieval.
//!
//! Documents are deduplicated by content hash, persisted through a
//! [`Store`], encoded by an [`Embedder`] and indexed twice: a
//! [`SimilarityIndex`] over their vectors and a [`Bm25Index`] over their
//! terms. The [`HybridRetriever`] fuses both score sources.
//!
//! # Main types
//!
//! - [`Embedder`] - Text to fixed-dimension vector.
//! - [`SimilarityIndex`] - HNSW graph with exact-scan fallback.
//! - [`Store`] - Authoritative storage over a [`KvBackend`].
//! - [`HybridRetriever`] - Vector + BM25 fused search.
//! - [`IngestionPipeline`] - Deduplicating, all-or-nothing ingestion.

/// BM25 inverted index for keyword-based retrieval.
pub mod bm25;
/// Embedder trait, lexical projection and optional HTTP client.
pub mod embedding;
/// Hierarchical navigable small-world graph.
pub mod hnsw;
/// Hybrid search combining cosine similarity and BM25.
pub mod hybrid;
/// Vector index trait, exact fallback and the shared index handle.
pub mod index;
/// Ingestion, retention and index maintenance.
pub mod ingest;
/// Durable key-value storage.
pub mod store;

pub use bm25::Bm25Index;
pub use embedding::{negotiate_embedder, Embedder, LexicalEmbedder};
pub use hnsw::{HnswIndex, HnswParams};
pub use hybrid::{
    HybridRetriever, LoadReport, Query, RetrievalWeights, SearchHit, SearchMode, SearchRequest,
    SearchResponse,
};
pub use index::{
    cosine_similarity, CancellationToken, ExactIndex, IndexKind, SearchPath, SimilarityIndex,
    VectorIndex,
};
pub use ingest::{
    IndexHealth, IngestOutcome, IngestSummary, IngestionPipeline, PruneReport, ReencodeReport,
};
pub use store::{FileBackend, KvBackend, MemoryBackend, Namespace, RetentionPolicy, Store, StoreManifest};
