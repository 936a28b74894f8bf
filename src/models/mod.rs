//! Core data models for the conversion pipeline.
//!
//! These entities describe stored binaries, their chunks, and conversion
//! jobs. They map onto SQLite rows via `sqlx::FromRow` and serialize as JSON
//! via `serde`.

pub mod chunk;
pub mod job;
pub mod object;
