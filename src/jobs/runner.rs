//! Batch item execution against the real translation stack.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::AppError;
use crate::models::SourceSystem;
use crate::service::{MappingPayload, TranslationService};

/// Seam between the queue and the mapping stack; tests substitute scripted
/// runners.
#[async_trait]
pub trait BatchItemRunner: Send + Sync {
    /// Process one `(code, system)` entry. The error string becomes the
    /// item's `error` field.
    async fn run_item(
        &self,
        code: &str,
        system: SourceSystem,
        save_results: bool,
    ) -> Result<MappingPayload, String>;
}

/// Production runner: full pipeline per item, persisting resolved mappings
/// when the job asked for it.
pub struct PipelineItemRunner {
    service: Arc<TranslationService>,
}

impl PipelineItemRunner {
    pub fn new(service: Arc<TranslationService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl BatchItemRunner for PipelineItemRunner {
    async fn run_item(
        &self,
        code: &str,
        system: SourceSystem,
        save_results: bool,
    ) -> Result<MappingPayload, String> {
        let outcome = self
            .service
            .run_pipeline_opts(code, system, save_results)
            .await
            .map_err(item_error)?;
        Ok(outcome.mapping)
    }
}

fn item_error(e: AppError) -> String {
    match e {
        AppError::NotFound(_) => "code not found".to_string(),
        other => other.to_string(),
    }
}
