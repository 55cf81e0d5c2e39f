//! Terminology bridge between the AYUSH classifications (Ayurveda, Siddha,
//! Unani) and WHO ICD-11 Traditional Medicine Module 2.
//!
//! The core is a staged mapping pipeline — normalize, embed, retrieve
//! candidates, route by confidence, adjudicate with an LLM, persist —
//! wrapped in an HTTP service that also speaks the FHIR R4 terminology
//! operations (CodeSystem/$lookup, ConceptMap/$translate, ValueSet/$expand).

pub mod api;
pub mod audit;
pub mod cache;
pub mod config;
pub mod database;
pub mod embedding;
pub mod error;
pub mod fhir;
pub mod jobs;
pub mod llm;
pub mod metrics;
pub mod models;
pub mod pipeline;
pub mod rate_limit;
pub mod retrieval;
pub mod service;

pub use api::{create_app_router, AppState};
pub use config::Config;
pub use error::{AppError, AppResult};
