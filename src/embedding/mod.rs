//! Text embedding via an external model.
//!
//! Query and document task modes produce vectors in the same space, so a
//! query embedding is comparable with stored document embeddings under
//! cosine similarity. The pipeline treats every embedder failure (rate
//! limit, timeout, malformed response) as one kind and degrades to lexical
//! retrieval.

pub mod gemini;

pub use gemini::GeminiEmbedder;

use async_trait::async_trait;

use crate::error::AppResult;

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed text posed as a search query.
    async fn embed_query(&self, text: &str) -> AppResult<Vec<f32>>;

    /// Embed text to be indexed.
    async fn embed_document(&self, text: &str) -> AppResult<Vec<f32>>;

    /// Batched document embedding; output order matches input order, and
    /// each vector equals what `embed_document` would produce for that text.
    async fn embed_documents(&self, texts: &[String]) -> AppResult<Vec<Vec<f32>>>;
}
