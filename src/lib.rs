//! Account Receivers
//!
//! Receive destinations for hierarchical-deterministic accounts. Each account
//! owns one or more xpubs and a persisted next-index counter per branch; every
//! control program, address and disclosure pubkey maps to a unique index of
//! that key tree, also under concurrent requests and across restarts.
//!
//! ## Components
//!
//! 1. **Directory** - alias or ID to account ID, falling through to the raw input
//! 2. **Allocator** - linearizable per-branch counter (lock + compare-and-swap)
//! 3. **Derivation** - pure P2WPKH / sorted-multisig P2WSH programs
//! 4. **Address** - segwit address encoding and decoding
//! 5. **Pubkey** - disclosure keys on a dedicated branch
//! 6. **Manager** - receiver issuance and account management
//!
//! ## Usage
//!
//! ```rust,ignore
//! let store = Arc::new(SqliteAccountStore::new("data/receivers.db")?);
//! let manager = AccountManager::new(store, bitcoin::Network::Testnet);
//!
//! manager.create_account(vec![xpub], 1, Some("alice".into())).await?;
//! let receiver = manager
//!     .create_address_receiver(&Context::with_timeout(Duration::from_secs(5)), "alice")
//!     .await?;
//! ```

pub mod address;
pub mod allocator;
pub mod config;
pub mod context;
pub mod derivation;
pub mod directory;
pub mod error;
pub mod logging;
pub mod manager;
pub mod pubkey;
pub mod storage;
pub mod types;

// Re-exports: core
pub use allocator::{Allocation, IndexAllocator};
pub use context::{CancelHandle, Context};
pub use directory::Resolution;
pub use error::{AccountError, Result};
pub use manager::{expiry_in_hours, AccountManager, SharedAccountManager};

// Re-exports: storage
pub use storage::{AccountStore, MemoryAccountStore, SqliteAccountStore, StorageError};

// Re-exports: configuration
pub use config::{ConfigError, Network, ReceiverConfig, StorageBackend};

// Re-exports: types
pub use types::{
    Account, AccountPubkey, AddressProgram, Branch, ControlProgram, DerivationIndex, NextIndex,
    Receiver,
};
