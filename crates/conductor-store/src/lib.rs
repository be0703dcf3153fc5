//! Durable trace storage for conductor
//!
//! This crate provides:
//! - SQLite-backed [`TracePersistence`](conductor_core::TracePersistence) with
//!   append-only steps and finalize-once status writes

pub mod sqlite;

pub use sqlite::SqliteTraceStore;
