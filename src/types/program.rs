//! Control Program Types

use bitcoin::ScriptBuf;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::account::Branch;

/// A reserved derivation point, unique per (account, branch)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DerivationIndex {
    pub account_id: String,
    pub branch: Branch,
    pub index: u32,
}

impl std::fmt::Display for DerivationIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.account_id, self.branch, self.index)
    }
}

/// An issued spending program. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlProgram {
    /// Owning account
    pub account_id: String,
    /// Branch the index was allocated on
    pub branch: Branch,
    /// Allocated derivation index
    pub index: u32,
    /// Witness program bytes
    pub program: ScriptBuf,
    /// Issuance time
    pub created_at: DateTime<Utc>,
    /// Time after which payers should stop using the program
    pub expires_at: Option<DateTime<Utc>>,
}

impl ControlProgram {
    /// The derivation point that produced this program
    pub fn derivation_index(&self) -> DerivationIndex {
        DerivationIndex {
            account_id: self.account_id.clone(),
            branch: self.branch,
            index: self.index,
        }
    }

    /// Program bytes as lowercase hex
    pub fn program_hex(&self) -> String {
        hex::encode(self.program.as_bytes())
    }
}

/// A control program together with its display address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressProgram {
    pub control_program: ControlProgram,
    pub address: String,
}
