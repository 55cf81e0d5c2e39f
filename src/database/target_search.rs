//! Ranked candidate search over the target catalog.
//!
//! Three rankers with one shared contract: scores are nonnegative, results
//! come back in nonincreasing score order, and ties break by target code
//! ascending so candidate lists are deterministic.

use async_trait::async_trait;
use pgvector::Vector;
use serde::Serialize;
use sqlx::PgPool;

use crate::error::AppResult;
use crate::models::TargetCode;

/// Which ranker produced a candidate. The score semantics differ per
/// method: cosine similarity, ts_rank, or matched-keyword fraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalMethod {
    Vector,
    Fulltext,
    Keyword,
}

impl RetrievalMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vector => "vector",
            Self::Fulltext => "fulltext",
            Self::Keyword => "keyword",
        }
    }
}

/// One ranked target candidate.
#[derive(Debug, Clone, Serialize)]
pub struct TargetCandidate {
    pub target: TargetCode,
    pub score: f32,
    pub method: RetrievalMethod,
}

/// Search seam between the retriever and the store, so the pipeline can be
/// exercised without Postgres.
#[async_trait]
pub trait TargetSearcher: Send + Sync {
    /// Candidates with `1 - cosine_distance >= min_similarity`, nearest
    /// first. Rows without an embedding never appear.
    async fn search_by_vector(
        &self,
        embedding: &[f32],
        k: usize,
        min_similarity: f32,
    ) -> AppResult<Vec<TargetCandidate>>;

    /// Lexical full-text ranking over title + definition.
    async fn search_fulltext(&self, query: &str, k: usize) -> AppResult<Vec<TargetCandidate>>;

    /// Fraction-of-keywords containment scoring; zero-score rows dropped.
    async fn search_by_keywords(
        &self,
        keywords: &[String],
        k: usize,
    ) -> AppResult<Vec<TargetCandidate>>;
}

#[derive(Debug, sqlx::FromRow)]
struct ScoredTargetRow {
    #[sqlx(flatten)]
    target: TargetCode,
    score: f32,
}

impl ScoredTargetRow {
    fn into_candidate(self, method: RetrievalMethod) -> TargetCandidate {
        TargetCandidate {
            target: self.target,
            score: self.score,
            method,
        }
    }
}

const TARGET_COLUMNS: &str = "t.id, t.code, t.title, t.definition, t.category, t.parent_code, \
     t.synonyms, t.inclusions, t.exclusions, t.traditional_systems";

#[derive(Clone)]
pub struct PgTargetSearcher {
    pool: PgPool,
}

impl PgTargetSearcher {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TargetSearcher for PgTargetSearcher {
    async fn search_by_vector(
        &self,
        embedding: &[f32],
        k: usize,
        min_similarity: f32,
    ) -> AppResult<Vec<TargetCandidate>> {
        let query_vec = Vector::from(embedding.to_vec());

        let rows = sqlx::query_as::<_, ScoredTargetRow>(&format!(
            "SELECT {TARGET_COLUMNS}, \
                    (1 - (t.embedding <=> $1))::real AS score \
             FROM target_codes t \
             WHERE t.embedding IS NOT NULL \
               AND 1 - (t.embedding <=> $1) >= $2 \
             ORDER BY t.embedding <=> $1 ASC, t.code ASC \
             LIMIT $3"
        ))
        .bind(&query_vec)
        .bind(min_similarity as f64)
        .bind(k as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| r.into_candidate(RetrievalMethod::Vector))
            .collect())
    }

    async fn search_fulltext(&self, query: &str, k: usize) -> AppResult<Vec<TargetCandidate>> {
        let rows = sqlx::query_as::<_, ScoredTargetRow>(&format!(
            "SELECT {TARGET_COLUMNS}, \
                    ts_rank(to_tsvector('english', t.title || ' ' || COALESCE(t.definition, '')), \
                            plainto_tsquery('english', $1))::real AS score \
             FROM target_codes t \
             WHERE to_tsvector('english', t.title || ' ' || COALESCE(t.definition, '')) \
                   @@ plainto_tsquery('english', $1) \
             ORDER BY score DESC, t.code ASC \
             LIMIT $2"
        ))
        .bind(query)
        .bind(k as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| r.into_candidate(RetrievalMethod::Fulltext))
            .collect())
    }

    async fn search_by_keywords(
        &self,
        keywords: &[String],
        k: usize,
    ) -> AppResult<Vec<TargetCandidate>> {
        if keywords.is_empty() {
            return Ok(Vec::new());
        }

        // score = |matched keywords| / |keywords|, matched by case-insensitive
        // containment in title or definition.
        let rows = sqlx::query_as::<_, ScoredTargetRow>(&format!(
            "SELECT {TARGET_COLUMNS}, s.score FROM ( \
                 SELECT t.id AS tid, \
                        ((SELECT COUNT(*) FROM unnest($1::text[]) AS kw \
                          WHERE t.title ILIKE '%' || kw || '%' \
                             OR COALESCE(t.definition, '') ILIKE '%' || kw || '%')::real \
                         / $2::real) AS score \
                 FROM target_codes t \
             ) s \
             JOIN target_codes t ON t.id = s.tid \
             WHERE s.score > 0 \
             ORDER BY s.score DESC, t.code ASC \
             LIMIT $3"
        ))
        .bind(keywords)
        .bind(keywords.len() as i32)
        .bind(k as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| r.into_candidate(RetrievalMethod::Keyword))
            .collect())
    }
}
