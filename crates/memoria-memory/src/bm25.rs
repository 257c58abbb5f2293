use std::collections::HashMap;
use uuid::Uuid;

/// BM25 parameters.
const K1: f32 = 1.2;
const B: f32 = 0.75;

/// Tokenize text into lowercase words, filtering tokens with length <= 1.
///
/// Shared by the lexical embedder so both score sources see the same terms.
pub(crate) fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .map(str::to_lowercase)
        .filter(|w| w.chars().count() > 1)
        .collect()
}

/// A BM25 inverted index for lexical relevance scoring.
///
/// Maintains an inverted index mapping terms to documents and their
/// term frequencies, along with document length statistics needed
/// for the BM25 scoring formula.
#[derive(Debug, Clone, Default)]
pub struct Bm25Index {
    /// term -> (doc_id -> term_frequency)
    inverted_index: HashMap<String, HashMap<Uuid, f32>>,
    /// doc_id -> distinct terms, so removal only touches its own postings
    doc_terms: HashMap<Uuid, Vec<String>>,
    /// doc_id -> document length (token count)
    doc_lengths: HashMap<Uuid, f32>,
    /// Sum of all document lengths.
    total_length: f32,
}

impl Bm25Index {
    /// Create a new, empty BM25 index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a document to the index. Re-adding an id replaces its postings.
    pub fn add_document(&mut self, id: Uuid, text: &str) {
        if self.doc_lengths.contains_key(&id) {
            self.remove_document(id);
        }

        let tokens = tokenize(text);
        let doc_len = tokens.len() as f32;

        let mut term_freq: HashMap<String, f32> = HashMap::new();
        for token in tokens {
            *term_freq.entry(token).or_insert(0.0) += 1.0;
        }

        let mut terms = Vec::with_capacity(term_freq.len());
        for (term, freq) in term_freq {
            self.inverted_index
                .entry(term.clone())
                .or_default()
                .insert(id, freq);
            terms.push(term);
        }

        self.doc_terms.insert(id, terms);
        self.doc_lengths.insert(id, doc_len);
        self.total_length += doc_len;
    }

    /// Remove a document from the index. Returns false if it was absent.
    pub fn remove_document(&mut self, id: Uuid) -> bool {
        let Some(len) = self.doc_lengths.remove(&id) else {
            return false;
        };
        self.total_length = (self.total_length - len).max(0.0);

        for term in self.doc_terms.remove(&id).unwrap_or_default() {
            if let Some(postings) = self.inverted_index.get_mut(&term) {
                postings.remove(&id);
                if postings.is_empty() {
                    self.inverted_index.remove(&term);
                }
            }
        }
        true
    }

    /// Search the index for documents matching the query, returning up to
    /// `top_k` results sorted by descending BM25 score.
    ///
    /// ```text
    /// score = sum over query terms of:
    ///   IDF(t) * (tf * (k1 + 1)) / (tf + k1 * (1 - b + b * dl / avgdl))
    /// IDF(t) = ln((N - df + 0.5) / (df + 0.5) + 1.0)
    /// ```
    pub fn search(&self, query: &str, top_k: usize) -> Vec<(Uuid, f32)> {
        let mut results: Vec<(Uuid, f32)> = self.score_all(query).into_iter().collect();
        results.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        results.truncate(top_k);
        results
    }

    /// BM25 score of every document sharing at least one term with the query.
    pub fn score_all(&self, query: &str) -> HashMap<Uuid, f32> {
        let mut scores: HashMap<Uuid, f32> = HashMap::new();
        let doc_count = self.doc_lengths.len();
        if doc_count == 0 {
            return scores;
        }

        let mut query_tokens = tokenize(query);
        query_tokens.sort();
        query_tokens.dedup();

        let n = doc_count as f32;
        let avgdl = if self.total_length > 0.0 {
            self.total_length / n
        } else {
            1.0
        };

        for token in &query_tokens {
            let Some(postings) = self.inverted_index.get(token) else {
                continue;
            };
            let df = postings.len() as f32;
            // Robertson's IDF, always non-negative
            let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();

            for (&doc_id, &tf) in postings {
                let dl = self.doc_lengths.get(&doc_id).copied().unwrap_or(0.0);
                let numerator = tf * (K1 + 1.0);
                let denominator = tf + K1 * (1.0 - B + B * dl / avgdl);
                *scores.entry(doc_id).or_insert(0.0) += idf * numerator / denominator;
            }
        }

        scores
    }

    /// Whether the id is indexed.
    pub fn contains(&self, id: Uuid) -> bool {
        self.doc_lengths.contains_key(&id)
    }

    /// Return the number of documents currently in the index.
    pub fn document_count(&self) -> usize {
        self.doc_lengths.len()
    }
}
