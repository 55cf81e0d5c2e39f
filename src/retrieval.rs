//! Staged candidate retrieval.
//!
//! Vector similarity first (cross-script source terms rarely share tokens
//! with English target titles), then lexical full-text, then keyword
//! containment. Each stage only runs when the previous one produced
//! nothing, so a result list always comes from a single ranker and its
//! ordering guarantees hold end to end.

use std::sync::Arc;

use tracing::{debug, instrument};

use crate::database::{TargetCandidate, TargetSearcher};
use crate::error::AppResult;

/// Candidates handed to downstream consumers.
pub const MAX_CANDIDATES: usize = 10;

/// The keyword ranker is cruder, so it gets a deeper pool before truncation.
const KEYWORD_POOL: usize = 15;

/// Vector hits below this cosine similarity are noise.
const MIN_VECTOR_SIMILARITY: f32 = 0.5;

const MAX_KEYWORDS: usize = 5;

const STOP_WORDS: [&str; 9] = [
    "the", "and", "for", "with", "from", "that", "this", "disorder", "disease",
];

pub struct CandidateRetriever {
    searcher: Arc<dyn TargetSearcher>,
}

impl CandidateRetriever {
    pub fn new(searcher: Arc<dyn TargetSearcher>) -> Self {
        Self { searcher }
    }

    /// Retrieve up to [`MAX_CANDIDATES`] ranked candidates for a normalized
    /// source description. `embedding` is the precomputed query vector; when
    /// absent (embedder failure or empty text) retrieval starts at the
    /// lexical stage.
    #[instrument(skip(self, embedding), fields(text_len = text.len()))]
    pub async fn retrieve(
        &self,
        text: &str,
        embedding: Option<&[f32]>,
    ) -> AppResult<Vec<TargetCandidate>> {
        if let Some(query) = embedding.filter(|e| !e.is_empty()) {
            let hits = self
                .searcher
                .search_by_vector(query, MAX_CANDIDATES, MIN_VECTOR_SIMILARITY)
                .await?;
            if !hits.is_empty() {
                debug!(count = hits.len(), "vector retrieval");
                return Ok(hits);
            }
        }

        if !text.is_empty() {
            let hits = self.searcher.search_fulltext(text, MAX_CANDIDATES).await?;
            if !hits.is_empty() {
                debug!(count = hits.len(), "fulltext retrieval");
                return Ok(hits);
            }
        }

        let keywords = derive_keywords(text);
        if keywords.is_empty() {
            return Ok(Vec::new());
        }
        let mut hits = self
            .searcher
            .search_by_keywords(&keywords, KEYWORD_POOL)
            .await?;
        hits.truncate(MAX_CANDIDATES);
        debug!(count = hits.len(), "keyword retrieval");
        Ok(hits)
    }
}

/// Tokens worth searching on: split on whitespace, `-`, `/`, `|`; lowercase;
/// drop short tokens and stop words; keep the first five.
pub fn derive_keywords(text: &str) -> Vec<String> {
    text.split(|c: char| c.is_whitespace() || c == '-' || c == '/' || c == '|')
        .map(|token| token.to_lowercase())
        .filter(|token| token.len() > 3)
        .filter(|token| !STOP_WORDS.contains(&token.as_str()))
        .take(MAX_KEYWORDS)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::RetrievalMethod;
    use crate::models::TargetCode;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use uuid::Uuid;

    fn candidate(code: &str, score: f32, method: RetrievalMethod) -> TargetCandidate {
        TargetCandidate {
            target: TargetCode {
                id: Uuid::new_v4(),
                code: code.to_string(),
                title: format!("title {}", code),
                definition: None,
                category: None,
                parent_code: None,
                synonyms: vec![],
                inclusions: vec![],
                exclusions: vec![],
                traditional_systems: vec![],
            },
            score,
            method,
        }
    }

    /// Scripted searcher recording which stages ran.
    #[derive(Default)]
    struct FakeSearcher {
        vector_hits: Vec<TargetCandidate>,
        fulltext_hits: Vec<TargetCandidate>,
        keyword_hits: Vec<TargetCandidate>,
        calls: Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl TargetSearcher for FakeSearcher {
        async fn search_by_vector(
            &self,
            _embedding: &[f32],
            _k: usize,
            _min_similarity: f32,
        ) -> AppResult<Vec<TargetCandidate>> {
            self.calls.lock().push("vector");
            Ok(self.vector_hits.clone())
        }

        async fn search_fulltext(
            &self,
            _query: &str,
            _k: usize,
        ) -> AppResult<Vec<TargetCandidate>> {
            self.calls.lock().push("fulltext");
            Ok(self.fulltext_hits.clone())
        }

        async fn search_by_keywords(
            &self,
            _keywords: &[String],
            _k: usize,
        ) -> AppResult<Vec<TargetCandidate>> {
            self.calls.lock().push("keyword");
            Ok(self.keyword_hits.clone())
        }
    }

    #[tokio::test]
    async fn vector_hits_stop_the_cascade() {
        let searcher = Arc::new(FakeSearcher {
            vector_hits: vec![candidate("SK00.0", 0.92, RetrievalMethod::Vector)],
            ..Default::default()
        });
        let retriever = CandidateRetriever::new(searcher.clone());

        let hits = retriever
            .retrieve("fever", Some(&[0.1; 768]))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(*searcher.calls.lock(), vec!["vector"]);
    }

    #[tokio::test]
    async fn missing_embedding_skips_vector_stage() {
        let searcher = Arc::new(FakeSearcher {
            fulltext_hits: vec![candidate("SK00.0", 0.4, RetrievalMethod::Fulltext)],
            ..Default::default()
        });
        let retriever = CandidateRetriever::new(searcher.clone());

        let hits = retriever.retrieve("fever", None).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(*searcher.calls.lock(), vec!["fulltext"]);
    }

    #[tokio::test]
    async fn falls_all_the_way_to_keywords() {
        let searcher = Arc::new(FakeSearcher {
            keyword_hits: (0..12)
                .map(|i| candidate(&format!("SK{:02}.0", i), 0.5, RetrievalMethod::Keyword))
                .collect(),
            ..Default::default()
        });
        let retriever = CandidateRetriever::new(searcher.clone());

        let hits = retriever
            .retrieve("periodic fever pattern", Some(&[0.1; 768]))
            .await
            .unwrap();
        assert_eq!(hits.len(), MAX_CANDIDATES);
        assert_eq!(*searcher.calls.lock(), vec!["vector", "fulltext", "keyword"]);
    }

    #[tokio::test]
    async fn no_keywords_means_no_candidates() {
        let searcher = Arc::new(FakeSearcher::default());
        let retriever = CandidateRetriever::new(searcher.clone());

        // Every token is short or a stop word.
        let hits = retriever.retrieve("the and for", None).await.unwrap();
        assert!(hits.is_empty());
        assert_eq!(*searcher.calls.lock(), vec!["fulltext"]);
    }

    #[test]
    fn keyword_derivation_rules() {
        assert_eq!(
            derive_keywords("Chronic fever-like disorder of the skin"),
            vec!["chronic", "fever", "like", "skin"]
        );
        assert_eq!(
            derive_keywords("a/b|c-d"),
            Vec::<String>::new(),
        );
        // First five survivors only.
        assert_eq!(
            derive_keywords("alpha bravo charlie delta echo foxtrot golf"),
            vec!["alpha", "bravo", "charlie", "delta", "echo"]
        );
    }

    #[test]
    fn keyword_derivation_is_deterministic() {
        let a = derive_keywords("recurring bilious fever with vomiting");
        let b = derive_keywords("recurring bilious fever with vomiting");
        assert_eq!(a, b);
    }
}
