//! Domain rows and enumerations shared across the store, pipeline, and API.

pub mod audit;
pub mod code;
pub mod mapping;

pub use audit::{AuditRecord, NewAuditRecord};
pub use code::{
    EmbeddingCoverage, EmbeddingCoverageReport, SourceCode, SourceSystem, TargetCode,
};
pub use mapping::{Equivalence, Mapping, MappingDetail, MappingSource, ValidationStatus};
