//! Storage Layer Module
//!
//! Provides persistence for accounts, index counters and issued programs.
//!
//! This module contains:
//! - Storage trait definitions for abstraction
//! - SQLite implementation for production
//! - In-memory implementation for testing

pub mod memory;
pub mod sqlite;
pub mod traits;

// Re-exports for convenience
pub use memory::MemoryAccountStore;
pub use sqlite::SqliteAccountStore;
pub use traits::{AccountStore, StorageError, StorageResult};
