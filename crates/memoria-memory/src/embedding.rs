use crate::bm25::tokenize;
use async_trait::async_trait;
use memoria_core::{EmbedderConfig, MemoriaError, MemoriaResult};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Trait for mapping text to fixed-dimension vectors.
///
/// Implementations must be deterministic for a given (text, version) pair.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Encode a single text. Empty or malformed input is an `Encoding` error.
    async fn encode(&self, text: &str) -> MemoriaResult<Vec<f32>>;

    /// Encode a batch of texts.
    async fn encode_batch(&self, texts: &[&str]) -> MemoriaResult<Vec<Vec<f32>>> {
        let mut results = Vec::with_capacity(texts.len());
        for text in texts {
            results.push(self.encode(text).await?);
        }
        Ok(results)
    }

    /// Dimension of the vectors produced by this embedder.
    fn dimension(&self) -> usize;

    /// Version tag stamped on every vector record this embedder produces.
    fn version(&self) -> &str;
}

/// Lexical frequency projection (no external dependency).
///
/// Each token's term frequency is hashed into three positions with decaying
/// weights, then the vector is L2 normalized.
pub struct LexicalEmbedder {
    dimension: usize,
    version: String,
}

impl LexicalEmbedder {
    /// Create a projection with the given output dimension.
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            version: format!("lexical-fnv1a-v1/{dimension}"),
        }
    }
}

impl Default for LexicalEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl Embedder for LexicalEmbedder {
    async fn encode(&self, text: &str) -> MemoriaResult<Vec<f32>> {
        if text.trim().is_empty() {
            return Err(MemoriaError::Encoding("Cannot encode empty text".to_string()));
        }

        let words = tokenize(text);
        if words.is_empty() {
            return Err(MemoriaError::Encoding(
                "Text contains no encodable tokens".to_string(),
            ));
        }

        let mut freq: HashMap<&str, f32> = HashMap::new();
        for word in &words {
            *freq.entry(word.as_str()).or_insert(0.0) += 1.0;
        }

        let total = words.len() as f32;
        let mut vector = vec![0.0f32; self.dimension];

        for (word, count) in &freq {
            let tf = count / total;
            let hash1 = fnv1a(word.as_bytes()) as usize;
            let hash2 = fnv1a(&[word.as_bytes(), &[1u8]].concat()) as usize;
            let hash3 = fnv1a(&[word.as_bytes(), &[2u8]].concat()) as usize;

            vector[hash1 % self.dimension] += tf;
            vector[hash2 % self.dimension] += tf * 0.7;
            vector[hash3 % self.dimension] += tf * 0.5;
        }

        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }

        Ok(vector)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn version(&self) -> &str {
        &self.version
    }
}

/// FNV-1a, 32 bit.
fn fnv1a(data: &[u8]) -> u32 {
    let mut hash: u32 = 2166136261;
    for &byte in data {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

/// Pick the embedder once at startup.
///
/// A configured neural endpoint is probed with a short encode; any failure
/// (feature not compiled, endpoint down, wrong dimension) falls back to the
/// lexical projection.
pub async fn negotiate_embedder(config: &EmbedderConfig) -> Arc<dyn Embedder> {
    let lexical = || Arc::new(LexicalEmbedder::new(config.dimension)) as Arc<dyn Embedder>;

    let Some(neural) = &config.neural else {
        info!(dimension = config.dimension, "Using lexical embedder");
        return lexical();
    };

    #[cfg(feature = "http-embeddings")]
    {
        let probed = match http::HttpEmbedder::new(neural.clone()) {
            Ok(candidate) => candidate.probe().await.map(|()| candidate),
            Err(e) => Err(e),
        };
        match probed {
            Ok(candidate) => {
                info!(
                    endpoint = %neural.endpoint,
                    model = %neural.model,
                    dimension = neural.dimension,
                    "Neural embedder negotiated"
                );
                Arc::new(candidate) as Arc<dyn Embedder>
            }
            Err(e) => {
                warn!(
                    endpoint = %neural.endpoint,
                    error = %e,
                    "Neural embedder probe failed, falling back to lexical"
                );
                lexical()
            }
        }
    }

    #[cfg(not(feature = "http-embeddings"))]
    {
        warn!(
            endpoint = %neural.endpoint,
            "Neural embedder configured but the http-embeddings feature is disabled"
        );
        lexical()
    }
}

#[cfg(feature = "http-embeddings")]
pub mod http {
    //! OpenAI-compatible embeddings client.

    use super::Embedder;
    use async_trait::async_trait;
    use memoria_core::{MemoriaError, MemoriaResult, NeuralEmbedderConfig};
    use std::time::Duration;

    /// Calls `POST {endpoint}/v1/embeddings`.
    pub struct HttpEmbedder {
        config: NeuralEmbedderConfig,
        http: reqwest::Client,
        version: String,
    }

    impl HttpEmbedder {
        /// Build a client; no request is made until [`HttpEmbedder::probe`] or `encode`.
        pub fn new(config: NeuralEmbedderConfig) -> MemoriaResult<Self> {
            let http = reqwest::Client::builder()
                .timeout(Duration::from_millis(config.timeout_ms))
                .build()
                .map_err(|e| MemoriaError::Config(format!("Failed to build HTTP client: {e}")))?;
            let version = format!("neural-{}/{}", config.model, config.dimension);
            Ok(Self {
                config,
                http,
                version,
            })
        }

        /// Encode a fixed sentence and check the returned dimension.
        pub async fn probe(&self) -> MemoriaResult<()> {
            let vector = self.encode("memoria embedder probe").await?;
            if vector.len() != self.config.dimension {
                return Err(MemoriaError::Config(format!(
                    "Neural embedder returned dimension {}, expected {}",
                    vector.len(),
                    self.config.dimension
                )));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Embedder for HttpEmbedder {
        async fn encode(&self, text: &str) -> MemoriaResult<Vec<f32>> {
            if text.trim().is_empty() {
                return Err(MemoriaError::Encoding("Cannot encode empty text".to_string()));
            }

            let url = format!("{}/v1/embeddings", self.config.endpoint.trim_end_matches('/'));
            let body = serde_json::json!({
                "model": self.config.model,
                "input": text,
            });

            let mut request = self.http.post(&url).json(&body);
            if let Some(key) = &self.config.api_key {
                request = request.header("Authorization", format!("Bearer {key}"));
            }

            let resp = request
                .send()
                .await
                .map_err(|e| MemoriaError::Retryable(format!("Embedding request failed: {e}")))?;

            let status = resp.status();
            let resp_body: serde_json::Value = resp
                .json()
                .await
                .map_err(|e| MemoriaError::Retryable(format!("Embedding response unreadable: {e}")))?;

            if !status.is_success() {
                return Err(MemoriaError::Retryable(format!(
                    "Embedding API error {status}: {resp_body}"
                )));
            }

            parse_embedding(&resp_body)
        }

        fn dimension(&self) -> usize {
            self.config.dimension
        }

        fn version(&self) -> &str {
            &self.version
        }
    }

    /// Extract `data[0].embedding`; every element must be a number.
    pub(crate) fn parse_embedding(body: &serde_json::Value) -> MemoriaResult<Vec<f32>> {
        let values = body["data"][0]["embedding"].as_array().ok_or_else(|| {
            MemoriaError::Encoding("Embedding response missing data[0].embedding".to_string())
        })?;
        values
            .iter()
            .enumerate()
            .map(|(i, v)| {
                v.as_f64().map(|x| x as f32).ok_or_else(|| {
                    MemoriaError::Encoding(format!("Embedding element {i} is not a number: {v}"))
                })
            })
            .collect()
    }

}
