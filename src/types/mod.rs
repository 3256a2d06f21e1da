//! Shared Types Module
//!
//! Data types shared across the account receivers crate.

pub mod account;
pub mod program;
pub mod receiver;

// Re-exports for convenience
pub use account::{Account, Branch, NextIndex};
pub use program::{AddressProgram, ControlProgram, DerivationIndex};
pub use receiver::{default_receiver_expiry, AccountPubkey, Receiver, DEFAULT_RECEIVER_EXPIRY_DAYS};
