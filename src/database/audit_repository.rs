//! Audit log persistence.

use sqlx::PgPool;

use crate::error::AppResult;
use crate::models::{AuditRecord, NewAuditRecord};

#[derive(Clone)]
pub struct AuditRepository {
    pool: PgPool,
}

impl AuditRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, record: &NewAuditRecord) -> AppResult<()> {
        sqlx::query(
            "INSERT INTO audit_logs \
                 (action, resource_type, resource_id, actor, ip, user_agent, \
                  method, path, request_body, response_status, duration_ms, metadata) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
        )
        .bind(&record.action)
        .bind(&record.resource_type)
        .bind(record.resource_id.as_deref())
        .bind(record.actor.as_deref())
        .bind(record.ip.as_deref())
        .bind(record.user_agent.as_deref())
        .bind(record.method.as_deref())
        .bind(record.path.as_deref())
        .bind(record.request_body.as_ref())
        .bind(record.response_status)
        .bind(record.duration_ms)
        .bind(record.metadata.as_ref())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Recent records, newest first, optionally filtered by action.
    pub async fn query(
        &self,
        action: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> AppResult<Vec<AuditRecord>> {
        let rows = sqlx::query_as::<_, AuditRecord>(
            "SELECT id, action, resource_type, resource_id, actor, ip, user_agent, \
                    method, path, request_body, response_status, duration_ms, metadata, \
                    created_at \
             FROM audit_logs \
             WHERE ($1::text IS NULL OR action = $1) \
             ORDER BY created_at DESC \
             OFFSET $2 LIMIT $3",
        )
        .bind(action)
        .bind(offset)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
