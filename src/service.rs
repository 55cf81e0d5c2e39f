//! Translation orchestration shared by the interactive endpoint, the FHIR
//! translate operation, and the batch worker.
//!
//! Responsibilities around one pipeline run: the hard deadline on it,
//! persistence after it, and the invalidate-then-repopulate of the cache
//! entry. The mappings-cache check before the run belongs to the two
//! handler paths only; the batch worker always starts from the source row.
//! Persistence failures are logged and swallowed; the caller still gets the
//! adjudicated mapping and the cache is left unpopulated so the next
//! request retries.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::cache::{mapping_key, CacheRegistry};
use crate::database::{CodeRepository, MappingRepository, MappingWrite};
use crate::error::{AppError, AppResult};
use crate::metrics::Metrics;
use crate::models::{Equivalence, MappingDetail, MappingSource, SourceSystem};
use crate::pipeline::{MappingPipeline, PipelineOutcome};

/// Label for where a translate response came from.
pub const SOURCE_CACHED: &str = "cached";
pub const SOURCE_AI_WORKFLOW: &str = "ai_workflow";

/// The `mapping` object returned by translate responses and stored in the
/// mappings cache, so a cached replay is byte-identical.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingPayload {
    pub source: SourceRef,
    pub target: Option<TargetRef>,
    pub equivalence: Equivalence,
    pub confidence: f32,
    pub reasoning: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRef {
    pub code: String,
    pub system: SourceSystem,
    pub term: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub english_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetRef {
    pub code: String,
    pub title: String,
}

impl MappingPayload {
    pub fn matched(&self) -> bool {
        self.target.is_some()
    }

    /// Rebuild the payload from a persisted row, for cache seeding and the
    /// sync batch lookup.
    pub fn from_detail(detail: &MappingDetail) -> Self {
        Self {
            source: SourceRef {
                code: detail.source_code.clone(),
                system: detail.source_system,
                term: detail.source_term.clone(),
                english_name: detail.source_english_name.clone(),
            },
            target: Some(TargetRef {
                code: detail.target_code.clone(),
                title: detail.target_title.clone(),
            }),
            equivalence: detail.equivalence,
            confidence: detail.confidence,
            reasoning: detail.reasoning.clone().unwrap_or_default(),
        }
    }

    fn from_outcome(outcome: &PipelineOutcome) -> Self {
        Self {
            source: SourceRef {
                code: outcome.source.code.clone(),
                system: outcome.source.system,
                term: outcome.source.term.clone(),
                english_name: outcome.source.english_name.clone(),
            },
            target: outcome.target.as_ref().map(|t| TargetRef {
                code: t.code.clone(),
                title: t.title.clone(),
            }),
            equivalence: outcome.equivalence,
            confidence: outcome.confidence,
            reasoning: outcome.reasoning.clone(),
        }
    }
}

/// One resolved translate call.
#[derive(Debug, Clone)]
pub struct TranslateOutcome {
    /// "cached" or "ai_workflow".
    pub source_label: &'static str,
    pub mapping: MappingPayload,
    pub processing_time_ms: u64,
    pub errors: Vec<String>,
}

pub struct TranslationService {
    codes: CodeRepository,
    mappings: MappingRepository,
    pipeline: MappingPipeline,
    caches: Arc<CacheRegistry>,
    metrics: Arc<Metrics>,
    deadline: Duration,
}

impl TranslationService {
    pub fn new(
        codes: CodeRepository,
        mappings: MappingRepository,
        pipeline: MappingPipeline,
        caches: Arc<CacheRegistry>,
        metrics: Arc<Metrics>,
        deadline: Duration,
    ) -> Self {
        Self {
            codes,
            mappings,
            pipeline,
            caches,
            metrics,
            deadline,
        }
    }

    /// Handler path: translate one source code, preferring the mappings
    /// cache, running the pipeline under the hard deadline otherwise.
    /// Resolved mappings are persisted. Used by POST /mapping and the FHIR
    /// $translate operation, which share the cache.
    pub async fn translate(
        &self,
        code: &str,
        system: SourceSystem,
    ) -> AppResult<TranslateOutcome> {
        let started = std::time::Instant::now();
        let key = mapping_key(system, code);

        if let Some(cached) = self.caches.mappings.get(&key) {
            return Ok(TranslateOutcome {
                source_label: SOURCE_CACHED,
                mapping: cached,
                processing_time_ms: started.elapsed().as_millis() as u64,
                errors: Vec::new(),
            });
        }

        self.run_pipeline_opts(code, system, true).await
    }

    /// Batch-worker path: always fetch the current source row and run the
    /// pipeline; the mappings cache is never consulted, so a code removed
    /// from the store fails even while a cache entry for it still lives.
    /// `persist` mirrors the job's save_results flag; without it nothing is
    /// written and the cache entry is not populated.
    pub async fn run_pipeline_opts(
        &self,
        code: &str,
        system: SourceSystem,
        persist: bool,
    ) -> AppResult<TranslateOutcome> {
        let started = std::time::Instant::now();
        let key = mapping_key(system, code);

        let source = self
            .codes
            .find_source(code, system)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("source code {} not found in {}", code, system))
            })?;

        let outcome = tokio::time::timeout(self.deadline, self.pipeline.run(source))
            .await
            .map_err(|_| {
                self.metrics.pipeline_outcome("deadline");
                AppError::Deadline("mapping timed out before completion".to_string())
            })?;
        self.metrics.pipeline_outcome(outcome.route.as_str());

        let payload = MappingPayload::from_outcome(&outcome);
        if persist {
            if let Some(target) = &outcome.target {
                self.persist(&outcome, target.id, &key, &payload).await;
            }
        }

        Ok(TranslateOutcome {
            source_label: SOURCE_AI_WORKFLOW,
            mapping: payload,
            processing_time_ms: started.elapsed().as_millis() as u64,
            errors: outcome.errors.clone(),
        })
    }

    /// Upsert the resolved mapping and refresh the cache entry. UNMATCHED
    /// outcomes never reach here, so no sentinel rows exist.
    async fn persist(
        &self,
        outcome: &PipelineOutcome,
        target_id: uuid::Uuid,
        cache_key: &str,
        payload: &MappingPayload,
    ) {
        let write = MappingWrite {
            source_id: outcome.source.id,
            target_id,
            equivalence: outcome.equivalence,
            confidence: outcome.confidence.clamp(0.0, 1.0),
            mapping_source: MappingSource::AiValidated,
            reasoning: Some(outcome.reasoning.clone()),
        };
        match self.mappings.upsert(&write).await {
            Ok(row) => {
                info!(
                    source = %outcome.source.code,
                    target = ?payload.target.as_ref().map(|t| t.code.as_str()),
                    mapping_id = %row.id,
                    "mapping persisted"
                );
                self.caches.mappings.invalidate(cache_key);
                self.caches.mappings.set(cache_key.to_string(), payload.clone());
            }
            Err(e) => {
                // Swallowed: the response still carries the mapping and the
                // unpopulated cache forces a retry on the next request.
                warn!(error = %e, source = %outcome.source.code, "mapping persist failed");
            }
        }
    }

    /// Lookup-only path for the synchronous batch endpoint: no pipeline, no
    /// cache writes, just the best existing row per code.
    pub async fn lookup_existing(
        &self,
        code: &str,
        system: SourceSystem,
    ) -> AppResult<Option<MappingPayload>> {
        let source = match self.codes.find_source(code, system).await? {
            Some(source) => source,
            None => {
                return Err(AppError::NotFound(format!(
                    "source code {} not found in {}",
                    code, system
                )))
            }
        };
        let detail = self.mappings.find_for_source(source.id).await?;
        Ok(detail.as_ref().map(MappingPayload::from_detail))
    }
}

/// Request body accepted by the interactive translate endpoint.
#[derive(Debug, Deserialize)]
pub struct TranslateRequest {
    pub code: String,
    pub system: String,
    #[serde(default)]
    pub term: Option<String>,
    #[serde(default)]
    pub context: Option<String>,
}

impl TranslateRequest {
    pub fn parsed_system(&self) -> AppResult<SourceSystem> {
        self.system
            .parse()
            .map_err(|e: String| AppError::Validation(e))
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.code.trim().is_empty() {
            return Err(AppError::Validation("code must not be empty".to_string()));
        }
        Ok(())
    }
}
