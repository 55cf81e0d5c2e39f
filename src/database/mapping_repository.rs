//! Mapping persistence: keyed upsert, listing, aggregates, human review.

use serde::Serialize;
use sqlx::{PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{
    Equivalence, Mapping, MappingDetail, MappingSource, SourceSystem, ValidationStatus,
};

const MAPPING_COLUMNS: &str = "id, source_id, target_id, equivalence, confidence, \
     mapping_source, validation_status, validator, validated_at, reasoning, \
     created_at, updated_at";

const DETAIL_SELECT: &str = "SELECT m.id, \
            s.code AS source_code, s.system AS source_system, s.term AS source_term, \
            s.english_name AS source_english_name, \
            t.code AS target_code, t.title AS target_title, \
            m.equivalence, m.confidence, m.mapping_source, m.validation_status, \
            m.reasoning, m.created_at, m.updated_at \
     FROM mappings m \
     JOIN source_codes s ON s.id = m.source_id \
     JOIN target_codes t ON t.id = m.target_id";

/// Fields the pipeline writes on a resolved mapping.
#[derive(Debug, Clone)]
pub struct MappingWrite {
    pub source_id: Uuid,
    pub target_id: Uuid,
    pub equivalence: Equivalence,
    pub confidence: f32,
    pub mapping_source: MappingSource,
    pub reasoning: Option<String>,
}

/// Listing filters; everything optional.
#[derive(Debug, Clone, Default)]
pub struct MappingFilters {
    pub system: Option<SourceSystem>,
    pub equivalence: Option<Equivalence>,
    pub status: Option<ValidationStatus>,
    pub min_confidence: Option<f32>,
    pub max_confidence: Option<f32>,
    pub query: Option<String>,
    pub sort: MappingSort,
    pub descending: bool,
    pub page: i64,
    pub limit: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MappingSort {
    #[default]
    CreatedAt,
    Confidence,
    Equivalence,
}

impl MappingSort {
    fn column(&self) -> &'static str {
        match self {
            Self::CreatedAt => "m.created_at",
            Self::Confidence => "m.confidence",
            Self::Equivalence => "m.equivalence",
        }
    }
}

impl std::str::FromStr for MappingSort {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created_at" => Ok(Self::CreatedAt),
            "confidence" => Ok(Self::Confidence),
            "equivalence" => Ok(Self::Equivalence),
            other => Err(format!(
                "unknown sort key '{}' (expected created_at|confidence|equivalence)",
                other
            )),
        }
    }
}

/// Aggregates for the stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct MappingStats {
    pub total: i64,
    pub by_mapping_source: Vec<GroupCount>,
    pub by_validation_status: Vec<GroupCount>,
    pub average_confidence: Option<f64>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct GroupCount {
    pub key: String,
    pub count: i64,
}

#[derive(Clone)]
pub struct MappingRepository {
    pool: PgPool,
}

impl MappingRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert-or-update keyed on `(source_id, target_id)`.
    ///
    /// Rows a reviewer has taken over (`mapping_source = HUMAN_VALIDATED`)
    /// keep all human-controlled fields; only `updated_at` moves. The
    /// validation columns are never in the update list, so review state
    /// survives any pipeline re-run.
    pub async fn upsert(&self, write: &MappingWrite) -> AppResult<Mapping> {
        let row = sqlx::query_as::<_, Mapping>(&format!(
            "INSERT INTO mappings \
                 (source_id, target_id, equivalence, confidence, mapping_source, reasoning) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (source_id, target_id) DO UPDATE SET \
                 equivalence = CASE WHEN mappings.mapping_source = 'HUMAN_VALIDATED' \
                     THEN mappings.equivalence ELSE EXCLUDED.equivalence END, \
                 confidence = CASE WHEN mappings.mapping_source = 'HUMAN_VALIDATED' \
                     THEN mappings.confidence ELSE EXCLUDED.confidence END, \
                 mapping_source = CASE WHEN mappings.mapping_source = 'HUMAN_VALIDATED' \
                     THEN mappings.mapping_source ELSE EXCLUDED.mapping_source END, \
                 reasoning = CASE WHEN mappings.mapping_source = 'HUMAN_VALIDATED' \
                     THEN mappings.reasoning ELSE EXCLUDED.reasoning END, \
                 updated_at = now() \
             RETURNING {MAPPING_COLUMNS}"
        ))
        .bind(write.source_id)
        .bind(write.target_id)
        .bind(write.equivalence)
        .bind(write.confidence)
        .bind(write.mapping_source)
        .bind(write.reasoning.as_deref())
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    /// Best existing mapping for a source row: highest confidence, then most
    /// recently updated.
    pub async fn find_for_source(&self, source_id: Uuid) -> AppResult<Option<MappingDetail>> {
        let row = sqlx::query_as::<_, MappingDetail>(&format!(
            "{DETAIL_SELECT} WHERE m.source_id = $1 \
             ORDER BY m.confidence DESC, m.updated_at DESC LIMIT 1"
        ))
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn find_detail_by_id(&self, id: Uuid) -> AppResult<Option<MappingDetail>> {
        let row = sqlx::query_as::<_, MappingDetail>(&format!(
            "{DETAIL_SELECT} WHERE m.id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Paginated listing with dynamic filters.
    pub async fn list(&self, filters: &MappingFilters) -> AppResult<(i64, Vec<MappingDetail>)> {
        let mut count_qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "SELECT COUNT(*) FROM mappings m \
             JOIN source_codes s ON s.id = m.source_id \
             JOIN target_codes t ON t.id = m.target_id",
        );
        Self::push_filters(&mut count_qb, filters);
        let total: i64 = count_qb.build_query_scalar().fetch_one(&self.pool).await?;

        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(DETAIL_SELECT);
        Self::push_filters(&mut qb, filters);
        qb.push(" ORDER BY ")
            .push(filters.sort.column())
            .push(if filters.descending { " DESC" } else { " ASC" })
            .push(", m.id ASC");
        let offset = (filters.page.max(1) - 1) * filters.limit;
        qb.push(" OFFSET ").push_bind(offset);
        qb.push(" LIMIT ").push_bind(filters.limit);

        let rows = qb
            .build_query_as::<MappingDetail>()
            .fetch_all(&self.pool)
            .await?;
        Ok((total, rows))
    }

    fn push_filters(qb: &mut QueryBuilder<'_, Postgres>, filters: &MappingFilters) {
        qb.push(" WHERE 1 = 1");
        if let Some(system) = filters.system {
            qb.push(" AND s.system = ").push_bind(system.as_str());
        }
        if let Some(equivalence) = filters.equivalence {
            qb.push(" AND m.equivalence = ").push_bind(equivalence.as_str());
        }
        if let Some(status) = filters.status {
            qb.push(" AND m.validation_status = ").push_bind(status.as_str());
        }
        if let Some(min) = filters.min_confidence {
            qb.push(" AND m.confidence >= ").push_bind(min);
        }
        if let Some(max) = filters.max_confidence {
            qb.push(" AND m.confidence <= ").push_bind(max);
        }
        if let Some(query) = filters.query.as_deref() {
            let pattern = format!("%{}%", query);
            qb.push(" AND (s.code ILIKE ")
                .push_bind(pattern.clone())
                .push(" OR s.term ILIKE ")
                .push_bind(pattern.clone())
                .push(" OR s.english_name ILIKE ")
                .push_bind(pattern.clone())
                .push(" OR t.code ILIKE ")
                .push_bind(pattern.clone())
                .push(" OR t.title ILIKE ")
                .push_bind(pattern)
                .push(")");
        }
    }

    pub async fn stats(&self) -> AppResult<MappingStats> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM mappings")
            .fetch_one(&self.pool)
            .await?;
        let by_mapping_source = sqlx::query_as::<_, GroupCount>(
            "SELECT mapping_source AS key, COUNT(*) AS count \
             FROM mappings GROUP BY mapping_source ORDER BY count DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        let by_validation_status = sqlx::query_as::<_, GroupCount>(
            "SELECT validation_status AS key, COUNT(*) AS count \
             FROM mappings GROUP BY validation_status ORDER BY count DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        let average_confidence: Option<f64> =
            sqlx::query_scalar("SELECT AVG(confidence)::float8 FROM mappings")
                .fetch_one(&self.pool)
                .await?;

        Ok(MappingStats {
            total,
            by_mapping_source,
            by_validation_status,
            average_confidence,
        })
    }

    /// Human review action: sets the validation triple and marks the row
    /// HUMAN_VALIDATED so later pipeline upserts leave it alone.
    pub async fn validate(
        &self,
        id: Uuid,
        status: ValidationStatus,
        validator: &str,
    ) -> AppResult<Mapping> {
        let row = sqlx::query_as::<_, Mapping>(&format!(
            "UPDATE mappings SET \
                 validation_status = $2, validator = $3, validated_at = now(), \
                 mapping_source = 'HUMAN_VALIDATED', updated_at = now() \
             WHERE id = $1 \
             RETURNING {MAPPING_COLUMNS}"
        ))
        .bind(id)
        .bind(status)
        .bind(validator)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("mapping {} not found", id)))?;
        Ok(row)
    }
}
