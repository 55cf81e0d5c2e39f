//! The mapping pipeline.
//!
//! A linear state machine over one source code:
//! normalize → embed → search → route → (high-confidence accept | LLM
//! adjudication | unmatched). Soft failures accumulate in `errors` and the
//! pipeline keeps going on a degraded path; only the caller enforces the
//! overall deadline.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, instrument, warn};

use crate::cache::{embedding_key, CacheRegistry};
use crate::database::TargetCandidate;
use crate::embedding::Embedder;
use crate::error::AppError;
use crate::llm::Adjudicator;
use crate::models::{Equivalence, SourceCode, TargetCode};
use crate::retrieval::CandidateRetriever;

/// Retrieval score above which the top candidate is accepted without
/// consulting the adjudicator.
const HIGH_CONFIDENCE_THRESHOLD: f32 = 0.9;

/// Floor applied to the confidence of a high-confidence accept.
const HIGH_CONFIDENCE_FLOOR: f32 = 0.85;

/// At most this many candidates are shown to the adjudicator.
const ADJUDICATION_CANDIDATES: usize = 3;

const FALLBACK_CONFIDENCE: f32 = 0.5;
const FALLBACK_REASONING: &str = "AI validation failed; using top search result";
const HIGH_CONFIDENCE_REASONING: &str = "High confidence text match";
const NO_CANDIDATES_REASONING: &str = "No candidates";

/// Which branch resolved the request; used for logging and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineRoute {
    HighConfidence,
    Adjudicated,
    Fallback,
    Unmatched,
}

impl PipelineRoute {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HighConfidence => "high_confidence",
            Self::Adjudicated => "adjudicated",
            Self::Fallback => "fallback",
            Self::Unmatched => "unmatched",
        }
    }
}

/// Final state of one pipeline run. Never an error: degraded runs surface
/// through `errors` and an UNMATCHED outcome.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub source: SourceCode,
    pub normalized: String,
    pub target: Option<TargetCode>,
    pub equivalence: Equivalence,
    pub confidence: f32,
    pub reasoning: String,
    pub route: PipelineRoute,
    pub errors: Vec<String>,
    pub elapsed_ms: u64,
}

pub struct MappingPipeline {
    embedder: Arc<dyn Embedder>,
    adjudicator: Arc<dyn Adjudicator>,
    retriever: CandidateRetriever,
    caches: Arc<CacheRegistry>,
}

impl MappingPipeline {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        adjudicator: Arc<dyn Adjudicator>,
        retriever: CandidateRetriever,
        caches: Arc<CacheRegistry>,
    ) -> Self {
        Self {
            embedder,
            adjudicator,
            retriever,
            caches,
        }
    }

    #[instrument(skip(self, source), fields(code = %source.code, system = %source.system))]
    pub async fn run(&self, source: SourceCode) -> PipelineOutcome {
        let started = Instant::now();
        let mut errors = Vec::new();

        // Normalize. An empty result is recorded but not fatal; retrieval
        // falls back to the bare code.
        let normalized = source.mapping_text();
        if normalized.is_empty() {
            errors.push("No text available for mapping; using code as query".to_string());
        }
        let search_text = if normalized.is_empty() {
            source.code.to_lowercase()
        } else {
            normalized.clone()
        };

        // Embed the query, via the embeddings cache. Failure degrades to
        // lexical retrieval.
        let embedding = self.embed_query(&search_text, &mut errors).await;

        // Search.
        let candidates = match self
            .retriever
            .retrieve(&search_text, (!embedding.is_empty()).then_some(embedding.as_slice()))
            .await
        {
            Ok(candidates) => candidates,
            Err(e) => {
                errors.push(format!("Candidate search failed: {}", e));
                Vec::new()
            }
        };

        // Route.
        let outcome = if candidates.is_empty() {
            debug!("no candidates; unmatched");
            Resolution::unmatched(NO_CANDIDATES_REASONING.to_string())
        } else if candidates[0].score > HIGH_CONFIDENCE_THRESHOLD {
            debug!(score = candidates[0].score, "high-confidence bypass");
            Resolution {
                target: Some(candidates[0].target.clone()),
                equivalence: Equivalence::Equivalent,
                confidence: candidates[0].score.max(HIGH_CONFIDENCE_FLOOR),
                reasoning: HIGH_CONFIDENCE_REASONING.to_string(),
                route: PipelineRoute::HighConfidence,
            }
        } else {
            self.adjudicate(&source, &candidates, &mut errors).await
        };

        PipelineOutcome {
            source,
            normalized,
            target: outcome.target,
            equivalence: outcome.equivalence,
            confidence: outcome.confidence,
            reasoning: outcome.reasoning,
            route: outcome.route,
            errors,
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }

    async fn embed_query(&self, text: &str, errors: &mut Vec<String>) -> Vec<f32> {
        if text.is_empty() {
            return Vec::new();
        }
        let key = embedding_key(text);
        if let Some(cached) = self.caches.embeddings.get(&key) {
            return cached;
        }
        match self.embedder.embed_query(text).await {
            Ok(vector) => {
                self.caches.embeddings.set(key, vector.clone());
                vector
            }
            Err(e) => {
                warn!(error = %e, "embedding failed; degrading to lexical retrieval");
                errors.push(format!("Embedding failed: {}", e));
                Vec::new()
            }
        }
    }

    async fn adjudicate(
        &self,
        source: &SourceCode,
        candidates: &[TargetCandidate],
        errors: &mut Vec<String>,
    ) -> Resolution {
        let pool = &candidates[..candidates.len().min(ADJUDICATION_CANDIDATES)];

        let verdict = match self.adjudicator.adjudicate(source, pool).await {
            Ok(verdict) => verdict,
            Err(e) => {
                warn!(error = %e, "adjudication failed; falling back to top candidate");
                errors.push(format!("Adjudication failed: {}", e));
                return Resolution::fallback(&candidates[0]);
            }
        };

        match verdict.selected_code {
            Some(code) => match pool.iter().find(|c| c.target.code == code) {
                Some(chosen) => Resolution {
                    target: Some(chosen.target.clone()),
                    equivalence: verdict.equivalence,
                    confidence: verdict.confidence,
                    reasoning: verdict.reasoning,
                    route: PipelineRoute::Adjudicated,
                },
                None => {
                    // A code outside the candidate set is an adjudicator
                    // failure, same as a malformed reply.
                    let e = AppError::Upstream(format!(
                        "adjudicator selected '{}', not among the candidates",
                        code
                    ));
                    warn!(error = %e, "falling back to top candidate");
                    errors.push(e.to_string());
                    Resolution::fallback(&candidates[0])
                }
            },
            None => {
                let reasoning = if verdict.reasoning.is_empty() {
                    "No suitable candidate".to_string()
                } else {
                    verdict.reasoning
                };
                Resolution::unmatched(reasoning)
            }
        }
    }
}

struct Resolution {
    target: Option<TargetCode>,
    equivalence: Equivalence,
    confidence: f32,
    reasoning: String,
    route: PipelineRoute,
}

impl Resolution {
    fn unmatched(reasoning: String) -> Self {
        Self {
            target: None,
            equivalence: Equivalence::Unmatched,
            confidence: 0.0,
            reasoning,
            route: PipelineRoute::Unmatched,
        }
    }

    fn fallback(top: &TargetCandidate) -> Self {
        Self {
            target: Some(top.target.clone()),
            equivalence: Equivalence::Inexact,
            confidence: FALLBACK_CONFIDENCE,
            reasoning: FALLBACK_REASONING.to_string(),
            route: PipelineRoute::Fallback,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::database::{RetrievalMethod, TargetSearcher};
    use crate::error::AppResult;
    use crate::llm::Verdict;
    use crate::models::SourceSystem;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use uuid::Uuid;

    fn source_with_text(text: &str) -> SourceCode {
        SourceCode {
            id: Uuid::new_v4(),
            code: "AAA-1".to_string(),
            system: SourceSystem::Ayurveda,
            term: text.to_string(),
            term_normalized: None,
            native_script: None,
            short_definition: None,
            long_definition: None,
            english_name: None,
            searchable_text: None,
        }
    }

    fn candidate(code: &str, score: f32) -> TargetCandidate {
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
            method: RetrievalMethod::Vector,
        }
    }

    struct FakeEmbedder {
        fail: bool,
        calls: Mutex<u32>,
    }

    #[async_trait]
    impl Embedder for FakeEmbedder {
        async fn embed_query(&self, _text: &str) -> AppResult<Vec<f32>> {
            *self.calls.lock() += 1;
            if self.fail {
                Err(AppError::Upstream("embedder down".to_string()))
            } else {
                Ok(vec![0.1; 768])
            }
        }

        async fn embed_document(&self, text: &str) -> AppResult<Vec<f32>> {
            self.embed_query(text).await
        }

        async fn embed_documents(&self, texts: &[String]) -> AppResult<Vec<Vec<f32>>> {
            let mut out = Vec::new();
            for text in texts {
                out.push(self.embed_document(text).await?);
            }
            Ok(out)
        }
    }

    struct FakeAdjudicator {
        verdict: Option<Verdict>,
        calls: Mutex<u32>,
    }

    #[async_trait]
    impl Adjudicator for FakeAdjudicator {
        async fn adjudicate(
            &self,
            _source: &SourceCode,
            _candidates: &[TargetCandidate],
        ) -> AppResult<Verdict> {
            *self.calls.lock() += 1;
            self.verdict
                .clone()
                .ok_or_else(|| AppError::Upstream("model down".to_string()))
        }
    }

    struct FakeSearcher {
        vector_hits: Vec<TargetCandidate>,
    }

    #[async_trait]
    impl TargetSearcher for FakeSearcher {
        async fn search_by_vector(
            &self,
            _embedding: &[f32],
            _k: usize,
            _min_similarity: f32,
        ) -> AppResult<Vec<TargetCandidate>> {
            Ok(self.vector_hits.clone())
        }

        async fn search_fulltext(&self, _q: &str, _k: usize) -> AppResult<Vec<TargetCandidate>> {
            Ok(Vec::new())
        }

        async fn search_by_keywords(
            &self,
            _kw: &[String],
            _k: usize,
        ) -> AppResult<Vec<TargetCandidate>> {
            Ok(Vec::new())
        }
    }

    fn pipeline(
        hits: Vec<TargetCandidate>,
        verdict: Option<Verdict>,
        embed_fail: bool,
    ) -> (MappingPipeline, Arc<FakeAdjudicator>, Arc<FakeEmbedder>) {
        let embedder = Arc::new(FakeEmbedder {
            fail: embed_fail,
            calls: Mutex::new(0),
        });
        let adjudicator = Arc::new(FakeAdjudicator {
            verdict,
            calls: Mutex::new(0),
        });
        let searcher = Arc::new(FakeSearcher { vector_hits: hits });
        let caches = Arc::new(CacheRegistry::new(&CacheConfig::default()));
        let pipeline = MappingPipeline::new(
            embedder.clone(),
            adjudicator.clone(),
            CandidateRetriever::new(searcher),
            caches,
        );
        (pipeline, adjudicator, embedder)
    }

    #[tokio::test]
    async fn high_confidence_bypasses_adjudication() {
        let (pipeline, adjudicator, _) =
            pipeline(vec![candidate("SK00.0", 0.95)], None, false);
        let outcome = pipeline.run(source_with_text("jvara fever")).await;

        assert_eq!(outcome.route, PipelineRoute::HighConfidence);
        assert_eq!(outcome.target.as_ref().unwrap().code, "SK00.0");
        assert_eq!(outcome.equivalence, Equivalence::Equivalent);
        assert!(outcome.confidence >= 0.85);
        assert_eq!(outcome.reasoning, "High confidence text match");
        assert_eq!(*adjudicator.calls.lock(), 0);
    }

    #[tokio::test]
    async fn adjudicator_choice_is_honored() {
        let verdict = Verdict {
            selected_code: Some("SK01.1".to_string()),
            confidence: 0.78,
            equivalence: Equivalence::Narrower,
            reasoning: "subset of the target concept".to_string(),
        };
        let hits = vec![
            candidate("SK00.0", 0.55),
            candidate("SK01.1", 0.52),
            candidate("SK02.2", 0.51),
        ];
        let (pipeline, adjudicator, _) = pipeline(hits, Some(verdict), false);
        let outcome = pipeline.run(source_with_text("jvara fever")).await;

        assert_eq!(outcome.route, PipelineRoute::Adjudicated);
        assert_eq!(outcome.target.as_ref().unwrap().code, "SK01.1");
        assert_eq!(outcome.equivalence, Equivalence::Narrower);
        assert!((outcome.confidence - 0.78).abs() < 1e-6);
        assert_eq!(*adjudicator.calls.lock(), 1);
    }

    #[tokio::test]
    async fn invalid_selection_falls_back_to_top_candidate() {
        let verdict = Verdict {
            selected_code: Some("ZZ99.9".to_string()),
            confidence: 0.9,
            equivalence: Equivalence::Equivalent,
            reasoning: "confabulated".to_string(),
        };
        let hits = vec![candidate("SK00.0", 0.55), candidate("SK01.1", 0.52)];
        let (pipeline, _, _) = pipeline(hits, Some(verdict), false);
        let outcome = pipeline.run(source_with_text("jvara fever")).await;

        assert_eq!(outcome.route, PipelineRoute::Fallback);
        assert_eq!(outcome.target.as_ref().unwrap().code, "SK00.0");
        assert_eq!(outcome.equivalence, Equivalence::Inexact);
        assert!((outcome.confidence - 0.5).abs() < f32::EPSILON);
        assert!(outcome.reasoning.contains("AI validation failed"));
        assert!(!outcome.errors.is_empty());
    }

    #[tokio::test]
    async fn adjudicator_error_falls_back_to_top_candidate() {
        let hits = vec![candidate("SK00.0", 0.6)];
        let (pipeline, _, _) = pipeline(hits, None, false);
        let outcome = pipeline.run(source_with_text("jvara fever")).await;

        assert_eq!(outcome.route, PipelineRoute::Fallback);
        assert_eq!(outcome.target.as_ref().unwrap().code, "SK00.0");
        assert!(outcome.errors.iter().any(|e| e.contains("Adjudication failed")));
    }

    #[tokio::test]
    async fn no_candidates_is_unmatched_without_llm_call() {
        let (pipeline, adjudicator, _) = pipeline(vec![], None, false);
        let outcome = pipeline.run(source_with_text("jvara fever")).await;

        assert_eq!(outcome.route, PipelineRoute::Unmatched);
        assert!(outcome.target.is_none());
        assert_eq!(outcome.equivalence, Equivalence::Unmatched);
        assert_eq!(outcome.confidence, 0.0);
        assert_eq!(*adjudicator.calls.lock(), 0);
    }

    #[tokio::test]
    async fn empty_text_records_error_and_completes() {
        let (pipeline, _, _) = pipeline(vec![], None, false);
        let outcome = pipeline.run(source_with_text("   ")).await;

        assert_eq!(outcome.route, PipelineRoute::Unmatched);
        assert!(outcome
            .errors
            .iter()
            .any(|e| e.contains("No text available")));
        // Retrieval still ran, using the code as the query.
        assert_eq!(outcome.normalized, "");
    }

    #[tokio::test]
    async fn embedder_failure_degrades_but_continues() {
        let (pipeline, _, _) = pipeline(vec![], None, true);
        let outcome = pipeline.run(source_with_text("jvara fever")).await;

        assert!(outcome.errors.iter().any(|e| e.contains("Embedding failed")));
        assert_eq!(outcome.route, PipelineRoute::Unmatched);
    }

    #[tokio::test]
    async fn adjudicator_null_selection_is_unmatched() {
        let verdict = Verdict {
            selected_code: None,
            confidence: 0.2,
            equivalence: Equivalence::Unmatched,
            reasoning: "nothing fits".to_string(),
        };
        let hits = vec![candidate("SK00.0", 0.55)];
        let (pipeline, _, _) = pipeline(hits, Some(verdict), false);
        let outcome = pipeline.run(source_with_text("jvara fever")).await;

        assert_eq!(outcome.route, PipelineRoute::Unmatched);
        assert!(outcome.target.is_none());
        assert_eq!(outcome.confidence, 0.0);
        assert_eq!(outcome.reasoning, "nothing fits");
    }

    #[tokio::test]
    async fn query_embedding_is_cached() {
        let hits = vec![candidate("SK00.0", 0.95)];
        let (pipeline, _, embedder) = pipeline(hits, None, false);
        pipeline.run(source_with_text("jvara fever")).await;
        pipeline.run(source_with_text("jvara fever")).await;
        assert_eq!(*embedder.calls.lock(), 1);
    }
}
