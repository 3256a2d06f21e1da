//! Account Directory
//!
//! Resolves a caller-supplied identifier into an account ID. Alias lookup is
//! best-effort: an identifier that matches no alias, or whose alias lookup
//! fails, is handed on unchanged as an account ID, and only the allocator
//! decides whether that account exists.

use crate::storage::AccountStore;

/// Outcome of resolving an identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The identifier was an alias of this account ID
    ResolvedByAlias(String),
    /// No alias matched; the identifier is used as an account ID as-is
    PassthroughAsId(String),
}

impl Resolution {
    /// The account ID to allocate against
    pub fn account_id(&self) -> &str {
        match self {
            Resolution::ResolvedByAlias(id) | Resolution::PassthroughAsId(id) => id,
        }
    }

    pub fn into_account_id(self) -> String {
        match self {
            Resolution::ResolvedByAlias(id) | Resolution::PassthroughAsId(id) => id,
        }
    }

    pub fn is_alias(&self) -> bool {
        matches!(self, Resolution::ResolvedByAlias(_))
    }
}

/// Resolve `identifier` as an alias, falling through to the raw input.
///
/// A failed alias lookup is logged and treated like a miss.
pub async fn resolve(store: &dyn AccountStore, identifier: &str) -> Resolution {
    let resolution = match store.find_account_by_alias(identifier).await {
        Ok(Some(account)) => Resolution::ResolvedByAlias(account.id),
        Ok(None) => Resolution::PassthroughAsId(identifier.to_string()),
        Err(e) => {
            tracing::warn!(
                target: "receivers::directory",
                identifier = %identifier,
                error = %e,
                "Alias lookup failed, using identifier as account ID"
            );
            Resolution::PassthroughAsId(identifier.to_string())
        }
    };

    tracing::trace!(
        target: "receivers::directory",
        identifier = %identifier,
        account_id = %resolution.account_id(),
        by_alias = resolution.is_alias(),
        "Resolved account identifier"
    );

    resolution
}
