//! Disclosure Pubkeys
//!
//! Public keys handed out for proof of ownership or audit without granting a
//! payment destination. They are derived from the account root key on the
//! dedicated disclosure branch, so their indices never overlap with those of
//! spending programs.

use crate::allocator::IndexAllocator;
use crate::context::Context;
use crate::derivation::{derive_pubkey, relative_path, DerivationError};
use crate::error::Result;
use crate::types::{Account, AccountPubkey, Branch};

/// Disclosure pubkey of `account` at `index`. Pure.
pub fn pubkey_at(account: &Account, index: u32) -> std::result::Result<AccountPubkey, DerivationError> {
    let root = account.root_xpub().ok_or(DerivationError::NoKeys)?;
    let path = relative_path(Branch::Disclosure, index)?;
    let pubkey = derive_pubkey(root, &path)?;

    Ok(AccountPubkey {
        root: *root,
        pubkey: pubkey.to_bytes().to_vec(),
        path,
        index,
    })
}

/// Reserve a disclosure index and derive its pubkey
pub async fn allocate_pubkey(
    allocator: &IndexAllocator,
    ctx: &Context,
    account_id: &str,
) -> Result<AccountPubkey> {
    let allocation = allocator.allocate(ctx, account_id, Branch::Disclosure).await?;
    let info = pubkey_at(&allocation.account, allocation.index.index)?;

    tracing::debug!(
        target: "receivers::pubkey",
        account_id = %account_id,
        path = %info.path,
        "Derived disclosure pubkey"
    );

    Ok(info)
}
