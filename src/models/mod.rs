//! Core data models for the archive pipeline.
//!
//! These map to SQLite tables via `sqlx::FromRow` and serialize as JSON
//! via `serde` for the HTTP surface and dead-letter payloads.

pub mod chunk;
pub mod object;
pub mod zip_job;
