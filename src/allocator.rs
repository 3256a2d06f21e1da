//! Index Allocator
//!
//! Hands out the next unused derivation index of an account branch. The
//! counter lives in storage and only moves through a compare-and-swap, so an
//! index is consumed the moment the swap commits. Nothing is ever handed back.
//!
//! Allocations in this process are serialized per (account, branch) by an
//! async mutex. Writers in other processes sharing the same database are
//! caught by the swap failing, after which the counter is re-read. A branch
//! mutex only lives while some allocation holds or waits on it.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError};

use tokio::sync::Mutex;

use crate::context::Context;
use crate::derivation::MAX_DERIVATION_INDEX;
use crate::error::{AccountError, Result};
use crate::logging::log_allocation_event;
use crate::storage::{AccountStore, StorageError};
use crate::types::{Account, Branch, DerivationIndex};

/// Attempts before a contended swap is reported as a storage failure
pub const MAX_CAS_ATTEMPTS: usize = 8;

/// A committed reservation and the account snapshot it was taken from
#[derive(Debug, Clone)]
pub struct Allocation {
    pub account: Account,
    pub index: DerivationIndex,
}

type BranchKey = (String, Branch);

type LockMap = HashMap<BranchKey, Arc<Mutex<()>>>;

/// Linearizable per-branch index counter on top of an [`AccountStore`]
pub struct IndexAllocator {
    store: Arc<dyn AccountStore>,
    locks: std::sync::Mutex<LockMap>,
}

/// Share of a branch mutex, removed from the map by its last holder
struct BranchLease<'a> {
    locks: &'a std::sync::Mutex<LockMap>,
    key: BranchKey,
    mutex: Arc<Mutex<()>>,
}

impl Drop for BranchLease<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // the map and this lease are the only owners left
        let idle = locks
            .get(&self.key)
            .is_some_and(|m| Arc::ptr_eq(m, &self.mutex) && Arc::strong_count(m) == 2);
        if idle {
            locks.remove(&self.key);
        }
    }
}

impl IndexAllocator {
    pub fn new(store: Arc<dyn AccountStore>) -> Self {
        Self {
            store,
            locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Reserve the next index on `branch` of `account_id`.
    ///
    /// Fails with `NotFound` for an unknown account. A deadline or cancel that
    /// fires before the swap commits leaves the counter untouched.
    pub async fn allocate(&self, ctx: &Context, account_id: &str, branch: Branch) -> Result<Allocation> {
        ctx.run(self.reserve(account_id, branch)).await
    }

    fn lease(&self, account_id: &str, branch: Branch) -> BranchLease<'_> {
        let key = (account_id.to_string(), branch);
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        let mutex = locks.entry(key.clone()).or_default().clone();
        BranchLease {
            locks: &self.locks,
            key,
            mutex,
        }
    }

    #[cfg(test)]
    fn tracked_branches(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    async fn reserve(&self, account_id: &str, branch: Branch) -> Result<Allocation> {
        let lease = self.lease(account_id, branch);
        let _guard = lease.mutex.lock().await;

        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let account = self
                .store
                .get_account(account_id)
                .await?
                .ok_or_else(|| AccountError::NotFound(account_id.to_string()))?;

            let current = account.next_index.get(branch);
            if current > MAX_DERIVATION_INDEX {
                return Err(AccountError::IndexExhausted {
                    account_id: account_id.to_string(),
                    branch,
                });
            }

            let swapped = self
                .store
                .compare_and_swap_next_index(account_id, branch, current, current + 1)
                .await?;

            if swapped {
                let index = DerivationIndex {
                    account_id: account_id.to_string(),
                    branch,
                    index: current,
                };
                log_allocation_event(&index, attempt);
                return Ok(Allocation { account, index });
            }

            tracing::warn!(
                target: "receivers::allocator",
                account_id = %account_id,
                branch = %branch,
                expected = current,
                attempt,
                "Counter moved by another writer, retrying"
            );
        }

        Err(AccountError::Storage(StorageError::Database(format!(
            "next index for {} on {} branch still contended after {} attempts",
            account_id, branch, MAX_CAS_ATTEMPTS
        ))))
    }
}
