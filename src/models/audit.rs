//! Audit log rows.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// A persisted audit record.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct AuditRecord {
    pub id: Uuid,
    pub action: String,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub actor: Option<String>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub method: Option<String>,
    pub path: Option<String>,
    pub request_body: Option<serde_json::Value>,
    pub response_status: Option<i32>,
    pub duration_ms: Option<i64>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Record captured off the response path, before it gets an id and a
/// creation timestamp from the store.
#[derive(Debug, Clone, Default)]
pub struct NewAuditRecord {
    pub action: String,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub actor: Option<String>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub method: Option<String>,
    pub path: Option<String>,
    pub request_body: Option<serde_json::Value>,
    pub response_status: Option<i32>,
    pub duration_ms: Option<i64>,
    pub metadata: Option<serde_json::Value>,
}
