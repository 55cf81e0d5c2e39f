//! Postgres access layer.
//!
//! One pool is built at startup; repositories borrow connections per query.
//! No cross-row transactions are used anywhere in the crate; write atomicity
//! comes from the unique keys declared in the schema.

pub mod audit_repository;
pub mod code_repository;
pub mod mapping_repository;
pub mod target_search;

pub use audit_repository::AuditRepository;
pub use code_repository::CodeRepository;
pub use mapping_repository::{
    GroupCount, MappingFilters, MappingRepository, MappingSort, MappingStats, MappingWrite,
};
pub use target_search::{PgTargetSearcher, RetrievalMethod, TargetCandidate, TargetSearcher};

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::config::Config;
use crate::error::AppResult;

/// Build the shared connection pool from configuration.
pub async fn connect(config: &Config) -> AppResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await?;
    Ok(pool)
}
