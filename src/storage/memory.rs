//! In-Memory Storage Implementation
//!
//! Provides in-memory storage for testing and development.
//! Data is lost when the process exits.

use async_trait::async_trait;
use bitcoin::{Script, ScriptBuf};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::traits::{AccountStore, StorageError, StorageResult};
use crate::types::{Account, Branch, ControlProgram};

/// In-memory account store
///
/// Thread-safe storage for accounts and issued programs.
/// Uses Arc<RwLock<>> for concurrent access.
#[derive(Clone, Default)]
pub struct MemoryAccountStore {
    /// Accounts indexed by ID
    accounts: Arc<RwLock<HashMap<String, Account>>>,
    /// Index: alias -> account ID
    by_alias: Arc<RwLock<HashMap<String, String>>>,
    /// Issued programs indexed by program bytes
    programs: Arc<RwLock<HashMap<ScriptBuf, ControlProgram>>>,
    /// Occupied (account, branch, index) slots
    slots: Arc<RwLock<HashSet<(String, Branch, u32)>>>,
}

impl MemoryAccountStore {
    /// Create a new empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored accounts
    pub async fn account_count(&self) -> usize {
        self.accounts.read().await.len()
    }
}

#[async_trait]
impl AccountStore for MemoryAccountStore {
    async fn insert_account(&self, account: &Account) -> StorageResult<()> {
        let mut accounts = self.accounts.write().await;
        let mut by_alias = self.by_alias.write().await;

        if accounts.contains_key(&account.id) {
            return Err(StorageError::Duplicate(format!("ID: {}", account.id)));
        }

        if let Some(alias) = &account.alias {
            if by_alias.contains_key(alias) {
                return Err(StorageError::Duplicate(format!("alias: {}", alias)));
            }
            by_alias.insert(alias.clone(), account.id.clone());
        }

        accounts.insert(account.id.clone(), account.clone());
        Ok(())
    }

    async fn get_account(&self, id: &str) -> StorageResult<Option<Account>> {
        let accounts = self.accounts.read().await;
        Ok(accounts.get(id).cloned())
    }

    async fn find_account_by_alias(&self, alias: &str) -> StorageResult<Option<Account>> {
        let by_alias = self.by_alias.read().await;
        let id = match by_alias.get(alias) {
            Some(id) => id.clone(),
            None => return Ok(None),
        };
        drop(by_alias);

        self.get_account(&id).await
    }

    async fn compare_and_swap_next_index(
        &self,
        account_id: &str,
        branch: Branch,
        expected: u32,
        new: u32,
    ) -> StorageResult<bool> {
        // Read and write happen under one guard with no await in between.
        let mut accounts = self.accounts.write().await;
        let account = accounts
            .get_mut(account_id)
            .ok_or_else(|| StorageError::NotFound(account_id.to_string()))?;

        if account.next_index.get(branch) != expected {
            return Ok(false);
        }

        account.next_index.set(branch, new);
        Ok(true)
    }

    async fn insert_control_program(&self, program: &ControlProgram) -> StorageResult<()> {
        let mut programs = self.programs.write().await;
        let mut slots = self.slots.write().await;

        let slot = (program.account_id.clone(), program.branch, program.index);
        if slots.contains(&slot) {
            return Err(StorageError::Duplicate(format!(
                "index {} on {} branch of {}",
                program.index, program.branch, program.account_id
            )));
        }

        if programs.contains_key(&program.program) {
            return Err(StorageError::Duplicate(format!(
                "program: {}",
                program.program_hex()
            )));
        }

        slots.insert(slot);
        programs.insert(program.program.clone(), program.clone());
        Ok(())
    }

    async fn get_control_program(
        &self,
        program: &Script,
    ) -> StorageResult<Option<ControlProgram>> {
        let programs = self.programs.read().await;
        Ok(programs.get(program).cloned())
    }

    async fn list_control_programs(&self, account_id: &str) -> StorageResult<Vec<ControlProgram>> {
        let programs = self.programs.read().await;
        let mut listed: Vec<ControlProgram> = programs
            .values()
            .filter(|p| p.account_id == account_id)
            .cloned()
            .collect();
        listed.sort_by_key(|p| (p.branch, p.index));
        Ok(listed)
    }
}
