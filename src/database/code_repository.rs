//! Lookups and maintenance over the source and target code tables.

use pgvector::Vector;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::AppResult;
use crate::models::{
    EmbeddingCoverage, EmbeddingCoverageReport, SourceCode, SourceSystem, TargetCode,
};

const SOURCE_COLUMNS: &str = "id, code, system, term, term_normalized, native_script, \
     short_definition, long_definition, english_name, searchable_text";

const TARGET_COLUMNS: &str = "id, code, title, definition, category, parent_code, \
     synonyms, inclusions, exclusions, traditional_systems";

#[derive(Clone)]
pub struct CodeRepository {
    pool: PgPool,
}

impl CodeRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Unique lookup on `(code, system)`.
    pub async fn find_source(
        &self,
        code: &str,
        system: SourceSystem,
    ) -> AppResult<Option<SourceCode>> {
        let row = sqlx::query_as::<_, SourceCode>(&format!(
            "SELECT {SOURCE_COLUMNS} FROM source_codes WHERE code = $1 AND system = $2"
        ))
        .bind(code)
        .bind(system)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn find_source_by_id(&self, id: Uuid) -> AppResult<Option<SourceCode>> {
        let row = sqlx::query_as::<_, SourceCode>(&format!(
            "SELECT {SOURCE_COLUMNS} FROM source_codes WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Unique lookup on the globally unique target `code`.
    pub async fn find_target(&self, code: &str) -> AppResult<Option<TargetCode>> {
        let row = sqlx::query_as::<_, TargetCode>(&format!(
            "SELECT {TARGET_COLUMNS} FROM target_codes WHERE code = $1"
        ))
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn find_target_by_id(&self, id: Uuid) -> AppResult<Option<TargetCode>> {
        let row = sqlx::query_as::<_, TargetCode>(&format!(
            "SELECT {TARGET_COLUMNS} FROM target_codes WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Prefix/substring autocomplete over source codes.
    pub async fn autocomplete_source(
        &self,
        query: &str,
        system: Option<SourceSystem>,
        limit: i64,
    ) -> AppResult<Vec<SourceCode>> {
        let pattern = format!("%{}%", query);
        let rows = sqlx::query_as::<_, SourceCode>(&format!(
            "SELECT {SOURCE_COLUMNS} FROM source_codes \
             WHERE ($2::text IS NULL OR system = $2) \
               AND (code ILIKE $1 OR term ILIKE $1 \
                    OR english_name ILIKE $1 OR searchable_text ILIKE $1) \
             ORDER BY code ASC \
             LIMIT $3"
        ))
        .bind(&pattern)
        .bind(system.map(|s| s.as_str()))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Substring autocomplete over the target catalog.
    pub async fn autocomplete_target(&self, query: &str, limit: i64) -> AppResult<Vec<TargetCode>> {
        let pattern = format!("%{}%", query);
        let rows = sqlx::query_as::<_, TargetCode>(&format!(
            "SELECT {TARGET_COLUMNS} FROM target_codes \
             WHERE code ILIKE $1 OR title ILIKE $1 OR definition ILIKE $1 \
             ORDER BY code ASC \
             LIMIT $2"
        ))
        .bind(&pattern)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Paginated source listing with optional substring filter, the shape
    /// ValueSet/$expand consumes.
    pub async fn expand_source_codes(
        &self,
        filter: Option<&str>,
        system: Option<SourceSystem>,
        offset: i64,
        count: i64,
    ) -> AppResult<(i64, Vec<SourceCode>)> {
        let pattern = filter.map(|f| format!("%{}%", f));

        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM source_codes \
             WHERE ($1::text IS NULL OR term ILIKE $1 \
                    OR english_name ILIKE $1 OR searchable_text ILIKE $1) \
               AND ($2::text IS NULL OR system = $2)",
        )
        .bind(pattern.as_deref())
        .bind(system.map(|s| s.as_str()))
        .fetch_one(&self.pool)
        .await?;

        let rows = sqlx::query_as::<_, SourceCode>(&format!(
            "SELECT {SOURCE_COLUMNS} FROM source_codes \
             WHERE ($1::text IS NULL OR term ILIKE $1 \
                    OR english_name ILIKE $1 OR searchable_text ILIKE $1) \
               AND ($2::text IS NULL OR system = $2) \
             ORDER BY system ASC, code ASC \
             OFFSET $3 LIMIT $4"
        ))
        .bind(pattern.as_deref())
        .bind(system.map(|s| s.as_str()))
        .bind(offset)
        .bind(count)
        .fetch_all(&self.pool)
        .await?;

        Ok((total, rows))
    }

    pub async fn count_source_codes(&self, system: SourceSystem) -> AppResult<i64> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM source_codes WHERE system = $1")
            .bind(system)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn count_target_codes(&self) -> AppResult<i64> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM target_codes")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    // ========================================================================
    // Embedding maintenance
    // ========================================================================

    pub async fn embedding_coverage(&self) -> AppResult<EmbeddingCoverageReport> {
        let (source_total, source_embedded): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COUNT(embedding) FROM source_codes",
        )
        .fetch_one(&self.pool)
        .await?;
        let (target_total, target_embedded): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COUNT(embedding) FROM target_codes",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(EmbeddingCoverageReport {
            source: EmbeddingCoverage::new(source_total, source_embedded),
            target: EmbeddingCoverage::new(target_total, target_embedded),
        })
    }

    /// Rows lacking an embedding, with the text that should be embedded for
    /// them. Source rows embed their best mapping text, target rows embed
    /// title plus definition.
    pub async fn source_rows_missing_embedding(
        &self,
        limit: i64,
    ) -> AppResult<Vec<(Uuid, String)>> {
        let rows = sqlx::query_as::<_, (Uuid, String)>(
            "SELECT id, LOWER(TRIM(COALESCE(NULLIF(TRIM(short_definition), ''), \
                                   NULLIF(TRIM(english_name), ''), \
                                   NULLIF(TRIM(long_definition), ''), term))) \
             FROM source_codes WHERE embedding IS NULL ORDER BY system, code LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn target_rows_missing_embedding(
        &self,
        limit: i64,
    ) -> AppResult<Vec<(Uuid, String)>> {
        let rows = sqlx::query_as::<_, (Uuid, String)>(
            "SELECT id, title || COALESCE('. ' || definition, '') \
             FROM target_codes WHERE embedding IS NULL ORDER BY code LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn set_source_embedding(&self, id: Uuid, embedding: Vec<f32>) -> AppResult<()> {
        sqlx::query("UPDATE source_codes SET embedding = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(Vector::from(embedding))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_target_embedding(&self, id: Uuid, embedding: Vec<f32>) -> AppResult<()> {
        sqlx::query("UPDATE target_codes SET embedding = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(Vector::from(embedding))
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
