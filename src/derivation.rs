//! Control Program Derivation
//!
//! Deterministic, stateless derivation of spending programs from account key
//! material. The same (keys, quorum, branch, index) always produce the same
//! program bytes, so a wallet can be rebuilt from its xpubs and counters alone.
//!
//! # Layout
//!
//! Every account xpub is derived along the non-hardened path `[branch, index]`.
//! - One key: P2WPKH, `OP_0 <hash160(pubkey)>`
//! - Several keys: P2WSH over `OP_m <sorted pubkeys> OP_n OP_CHECKMULTISIG`

use bitcoin::bip32::{ChildNumber, DerivationPath, Xpub};
use bitcoin::opcodes::all::OP_CHECKMULTISIG;
use bitcoin::script::Builder as ScriptBuilder;
use bitcoin::{CompressedPublicKey, PublicKey, ScriptBuf};
use secp256k1::{All, Secp256k1, SECP256K1};

use crate::types::{Account, Branch, DerivationIndex};

/// Maximum number of keys in a multisig account
pub const MAX_ACCOUNT_KEYS: usize = 15;

/// Largest index usable as a non-hardened child number
pub const MAX_DERIVATION_INDEX: u32 = (1 << 31) - 1;

/// Errors for key derivation
#[derive(Debug, thiserror::Error)]
pub enum DerivationError {
    #[error("account has no keys")]
    NoKeys,
    #[error("too many keys: {0} (max {MAX_ACCOUNT_KEYS})")]
    TooManyKeys(usize),
    #[error("quorum {quorum} invalid for {keys} keys")]
    InvalidQuorum { quorum: u8, keys: usize },
    #[error("index {0} is outside the non-hardened range")]
    IndexOutOfRange(u32),
    #[error("bip32 derivation failed: {0}")]
    Bip32(#[from] bitcoin::bip32::Error),
}

fn secp() -> &'static Secp256k1<All> {
    SECP256K1
}

/// Check that an account's keys and quorum can form a spending program
pub fn validate_key_material(xpubs: &[Xpub], quorum: u8) -> Result<(), DerivationError> {
    if xpubs.is_empty() {
        return Err(DerivationError::NoKeys);
    }
    if xpubs.len() > MAX_ACCOUNT_KEYS {
        return Err(DerivationError::TooManyKeys(xpubs.len()));
    }
    if quorum == 0 || quorum as usize > xpubs.len() {
        return Err(DerivationError::InvalidQuorum {
            quorum,
            keys: xpubs.len(),
        });
    }
    Ok(())
}

/// Path `[branch, index]` below an account key
pub fn relative_path(branch: Branch, index: u32) -> Result<DerivationPath, DerivationError> {
    if index > MAX_DERIVATION_INDEX {
        return Err(DerivationError::IndexOutOfRange(index));
    }

    let path = vec![
        ChildNumber::from_normal_idx(branch.number())?,
        ChildNumber::from_normal_idx(index)?,
    ];
    Ok(DerivationPath::from(path))
}

/// Public key of `xpub` at `path`
pub fn derive_pubkey(xpub: &Xpub, path: &DerivationPath) -> Result<CompressedPublicKey, DerivationError> {
    let child = xpub.derive_pub(secp(), path)?;
    Ok(CompressedPublicKey(child.public_key))
}

/// Public keys of every account key at a derivation point, in account key order
pub fn derive_pubkeys(
    account: &Account,
    index: &DerivationIndex,
) -> Result<Vec<CompressedPublicKey>, DerivationError> {
    let path = relative_path(index.branch, index.index)?;
    account
        .xpubs
        .iter()
        .map(|xpub| derive_pubkey(xpub, &path))
        .collect()
}

/// Build the m-of-n witness script. Keys are sorted so key order does not matter.
pub fn multisig_script(quorum: u8, pubkeys: &[CompressedPublicKey]) -> ScriptBuf {
    let mut sorted = pubkeys.to_vec();
    sorted.sort_by_key(|k| k.to_bytes());

    let mut builder = ScriptBuilder::new().push_int(quorum as i64);
    for key in &sorted {
        builder = builder.push_key(&PublicKey::from(*key));
    }
    builder
        .push_int(sorted.len() as i64)
        .push_opcode(OP_CHECKMULTISIG)
        .into_script()
}

/// Witness script for multisig accounts, `None` for single-key accounts
pub fn derive_witness_script(
    account: &Account,
    index: &DerivationIndex,
) -> Result<Option<ScriptBuf>, DerivationError> {
    validate_key_material(&account.xpubs, account.quorum)?;
    if !account.is_multisig() {
        return Ok(None);
    }

    let pubkeys = derive_pubkeys(account, index)?;
    Ok(Some(multisig_script(account.quorum, &pubkeys)))
}

/// Derive the control program for an account at a derivation point.
///
/// Pure: depends only on the account's keys and quorum plus the branch and index.
pub fn derive_program(account: &Account, index: &DerivationIndex) -> Result<ScriptBuf, DerivationError> {
    validate_key_material(&account.xpubs, account.quorum)?;

    let pubkeys = derive_pubkeys(account, index)?;
    let program = match pubkeys.as_slice() {
        [single] => ScriptBuf::new_p2wpkh(&single.wpubkey_hash()),
        keys => {
            let witness_script = multisig_script(account.quorum, keys);
            ScriptBuf::new_p2wsh(&witness_script.wscript_hash())
        }
    };

    Ok(program)
}
