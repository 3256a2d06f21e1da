//! Account Manager
//!
//! Entry point for callers. Composes the directory, allocator, deriver and
//! address encoder into account management and receiver issuance.
//!
//! Data flow for a receiver:
//! identifier -> directory -> allocator -> deriver -> [encoder] -> receiver
//!
//! Every step either succeeds or the whole request fails; a partially built
//! receiver is never returned.

use std::sync::Arc;

use bitcoin::bip32::Xpub;
use bitcoin::{Script, ScriptBuf};
use chrono::{DateTime, Utc};

use crate::address;
use crate::allocator::IndexAllocator;
use crate::context::Context;
use crate::derivation::{derive_program, derive_witness_script, validate_key_material};
use crate::directory::{self, Resolution};
use crate::error::{AccountError, Result};
use crate::logging::{generate_correlation_id, log_account_event, log_receiver_event};
use crate::pubkey;
use crate::storage::AccountStore;
use crate::types::{
    default_receiver_expiry, Account, AccountPubkey, AddressProgram, Branch, ControlProgram,
    DerivationIndex, Receiver,
};

/// Shared manager handle
pub type SharedAccountManager = Arc<AccountManager>;

pub struct AccountManager {
    store: Arc<dyn AccountStore>,
    allocator: IndexAllocator,
    network: bitcoin::Network,
}

impl AccountManager {
    pub fn new(store: Arc<dyn AccountStore>, network: bitcoin::Network) -> Self {
        Self {
            allocator: IndexAllocator::new(store.clone()),
            store,
            network,
        }
    }

    pub fn network(&self) -> bitcoin::Network {
        self.network
    }

    // ------------------------------------------------------------------
    // Accounts
    // ------------------------------------------------------------------

    /// Create an account with zeroed branch counters
    pub async fn create_account(
        &self,
        xpubs: Vec<Xpub>,
        quorum: u8,
        alias: Option<String>,
    ) -> Result<Account> {
        validate_key_material(&xpubs, quorum).map_err(|e| AccountError::validation(e.to_string()))?;

        let alias = alias.map(|a| a.trim().to_string());
        if alias.as_deref() == Some("") {
            return Err(AccountError::validation("alias must not be empty"));
        }

        let account = Account::new(alias, xpubs, quorum);
        self.store.insert_account(&account).await?;

        log_account_event(
            "account_created",
            &account.id,
            account.alias.as_deref(),
            account.xpubs.len(),
            account.quorum,
        );

        Ok(account)
    }

    pub async fn find_by_alias(&self, alias: &str) -> Result<Account> {
        self.store
            .find_account_by_alias(alias)
            .await?
            .ok_or_else(|| AccountError::NotFound(format!("alias {}", alias)))
    }

    pub async fn find_by_id(&self, id: &str) -> Result<Account> {
        self.store
            .get_account(id)
            .await?
            .ok_or_else(|| AccountError::NotFound(id.to_string()))
    }

    pub async fn get_alias_by_id(&self, id: &str) -> Result<Option<String>> {
        Ok(self.find_by_id(id).await?.alias)
    }

    /// Resolve an alias or account ID. Unknown aliases pass through as IDs.
    pub async fn resolve(&self, ctx: &Context, identifier: &str) -> Result<Resolution> {
        ctx.run(async { Ok(directory::resolve(self.store.as_ref(), identifier).await) })
            .await
    }

    // ------------------------------------------------------------------
    // Control programs
    // ------------------------------------------------------------------

    /// Allocate an index on the external (or change) branch, derive its
    /// program and persist the issued record.
    pub async fn create_control_program(
        &self,
        ctx: &Context,
        account_id: &str,
        change: bool,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<ControlProgram> {
        let allocation = self
            .allocator
            .allocate(ctx, account_id, Branch::for_program(change))
            .await?;

        let program = derive_program(&allocation.account, &allocation.index)?;
        let control_program = ControlProgram {
            account_id: allocation.index.account_id,
            branch: allocation.index.branch,
            index: allocation.index.index,
            program,
            created_at: Utc::now(),
            expires_at,
        };

        ctx.run(async {
            self.store
                .insert_control_program(&control_program)
                .await
                .map_err(AccountError::from)
        })
        .await?;

        tracing::debug!(
            target: "receivers::issuer",
            account_id = %control_program.account_id,
            branch = %control_program.branch,
            index = control_program.index,
            program = %control_program.program_hex(),
            "Issued control program"
        );

        Ok(control_program)
    }

    /// Control program plus its address, with the default expiry
    pub async fn create_address(
        &self,
        ctx: &Context,
        account_id: &str,
        change: bool,
    ) -> Result<AddressProgram> {
        let expires_at = Utc::now() + default_receiver_expiry();
        let control_program = self
            .create_control_program(ctx, account_id, change, Some(expires_at))
            .await?;
        let address = address::encode(&control_program.program, self.network)?;

        Ok(AddressProgram {
            control_program,
            address,
        })
    }

    /// All programs issued to an account, by branch then index
    pub async fn list_control_programs(&self, account_id: &str) -> Result<Vec<ControlProgram>> {
        Ok(self.store.list_control_programs(account_id).await?)
    }

    /// The issued record for `program`, if this wallet issued it
    pub async fn is_local_control_program(&self, program: &Script) -> Result<Option<ControlProgram>> {
        Ok(self.store.get_control_program(program).await?)
    }

    /// Witness script behind a multisig program, `None` for single-key accounts.
    ///
    /// Derivation only; nothing is allocated.
    pub async fn witness_script(
        &self,
        account_id: &str,
        branch: Branch,
        index: u32,
    ) -> Result<Option<ScriptBuf>> {
        let account = self.find_by_id(account_id).await?;
        let point = DerivationIndex {
            account_id: account.id.clone(),
            branch,
            index,
        };
        Ok(derive_witness_script(&account, &point)?)
    }

    // ------------------------------------------------------------------
    // Receivers
    // ------------------------------------------------------------------

    /// Program-only receiver. `expires_at` defaults to 30 days from now.
    pub async fn create_receiver(
        &self,
        ctx: &Context,
        identifier: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<Receiver> {
        let correlation_id = generate_correlation_id();
        let result = async {
            let account_id = self.resolve(ctx, identifier).await?.into_account_id();
            let expires_at = expires_at.unwrap_or_else(|| Utc::now() + default_receiver_expiry());
            let control_program = self
                .create_control_program(ctx, &account_id, false, Some(expires_at))
                .await?;
            Ok::<_, AccountError>((control_program, expires_at))
        }
        .await;

        match result {
            Ok((control_program, expires_at)) => {
                log_receiver_event(
                    "receiver_created",
                    &correlation_id,
                    &control_program.account_id,
                    Some(&control_program.derivation_index()),
                    None,
                );
                Ok(Receiver {
                    control_program: control_program.program,
                    address: None,
                    expires_at,
                })
            }
            Err(e) => {
                log_receiver_failure("receiver_failed", &correlation_id, identifier, &e);
                Err(e)
            }
        }
    }

    /// Address receiver with the expiry set at allocation
    pub async fn create_address_receiver(&self, ctx: &Context, identifier: &str) -> Result<Receiver> {
        let correlation_id = generate_correlation_id();
        let result = async {
            let account_id = self.resolve(ctx, identifier).await?.into_account_id();
            self.create_address(ctx, &account_id, false).await
        }
        .await;

        match result {
            Ok(issued) => {
                let control_program = issued.control_program;
                log_receiver_event(
                    "address_receiver_created",
                    &correlation_id,
                    &control_program.account_id,
                    Some(&control_program.derivation_index()),
                    None,
                );
                let expires_at = control_program
                    .expires_at
                    .unwrap_or_else(|| control_program.created_at + default_receiver_expiry());
                Ok(Receiver {
                    control_program: control_program.program,
                    address: Some(issued.address),
                    expires_at,
                })
            }
            Err(e) => {
                log_receiver_failure("address_receiver_failed", &correlation_id, identifier, &e);
                Err(e)
            }
        }
    }

    /// Disclosure pubkey at a freshly allocated index
    pub async fn create_pubkey_info(&self, ctx: &Context, identifier: &str) -> Result<AccountPubkey> {
        let correlation_id = generate_correlation_id();
        let result = async {
            let account_id = self.resolve(ctx, identifier).await?.into_account_id();
            pubkey::allocate_pubkey(&self.allocator, ctx, &account_id).await
        }
        .await;

        if let Err(e) = &result {
            log_receiver_failure("pubkey_failed", &correlation_id, identifier, e);
        }
        result
    }
}

/// Expiry `hours` from now, for callers that take a relative expiry
pub fn expiry_in_hours(hours: i64) -> Result<DateTime<Utc>> {
    if hours <= 0 {
        return Err(AccountError::validation("expiry must be at least one hour ahead"));
    }
    chrono::Duration::try_hours(hours)
        .and_then(|ttl| Utc::now().checked_add_signed(ttl))
        .ok_or_else(|| AccountError::validation(format!("expiry of {} hours is out of range", hours)))
}

fn log_receiver_failure(event_type: &str, correlation_id: &str, identifier: &str, err: &AccountError) {
    let message = err.to_string();
    log_receiver_event(
        event_type,
        correlation_id,
        identifier,
        None,
        Some((err.error_code(), message.as_str())),
    );
}
