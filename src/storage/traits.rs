//! Storage Trait Definitions
//!
//! Defines the abstract storage collaborator for accounts, their index
//! counters and issued control programs.
//! Implementations can use SQLite (production) or in-memory (testing).

use async_trait::async_trait;
use bitcoin::Script;
use thiserror::Error;

use crate::types::{Account, Branch, ControlProgram};

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Duplicate record: {0}")]
    Duplicate(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Timed out: {0}")]
    Timeout(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Account storage interface
///
/// Implementations:
/// - `SqliteAccountStore` - Production storage with SQLite
/// - `MemoryAccountStore` - In-memory storage for testing
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Insert a new account together with its branch counters
    async fn insert_account(&self, account: &Account) -> StorageResult<()>;

    /// Get an account by ID, with current counters
    async fn get_account(&self, id: &str) -> StorageResult<Option<Account>>;

    /// Get an account by alias
    async fn find_account_by_alias(&self, alias: &str) -> StorageResult<Option<Account>>;

    /// Set the branch counter to `new` only if it still equals `expected`.
    ///
    /// Returns `Ok(false)` when another writer moved the counter first.
    /// Fails with `NotFound` if the account does not exist.
    async fn compare_and_swap_next_index(
        &self,
        account_id: &str,
        branch: Branch,
        expected: u32,
        new: u32,
    ) -> StorageResult<bool>;

    /// Insert an issued control program
    async fn insert_control_program(&self, program: &ControlProgram) -> StorageResult<()>;

    /// Get an issued control program by its bytes
    async fn get_control_program(&self, program: &Script)
        -> StorageResult<Option<ControlProgram>>;

    /// All programs issued to an account, by branch then index
    async fn list_control_programs(&self, account_id: &str) -> StorageResult<Vec<ControlProgram>>;
}
