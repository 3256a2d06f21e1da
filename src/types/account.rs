//! Account Types
//!
//! An account owns one or more extended public keys, a signing quorum and a
//! persisted next-index counter per derivation branch.

use bitcoin::bip32::Xpub;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Namespace partition of derivation indices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Branch {
    /// Receive paths shared with payers
    External,
    /// Internal change paths
    Change,
    /// Disclosure keys handed out without a spending program
    Disclosure,
}

impl Branch {
    /// All branches, in derivation-number order
    pub const ALL: [Branch; 3] = [Branch::External, Branch::Change, Branch::Disclosure];

    /// Child number of this branch below the account key
    pub fn number(&self) -> u32 {
        match self {
            Self::External => 0,
            Self::Change => 1,
            Self::Disclosure => 2,
        }
    }

    /// Branch for a spending program, external unless `change` is set
    pub fn for_program(change: bool) -> Self {
        if change {
            Self::Change
        } else {
            Self::External
        }
    }
}

impl std::fmt::Display for Branch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::External => "external",
            Self::Change => "change",
            Self::Disclosure => "disclosure",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for Branch {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "external" => Ok(Self::External),
            "change" => Ok(Self::Change),
            "disclosure" => Ok(Self::Disclosure),
            _ => Err(format!("unknown branch: {}", s)),
        }
    }
}

/// Next unused derivation index for each branch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NextIndex {
    pub external: u32,
    pub change: u32,
    pub disclosure: u32,
}

impl NextIndex {
    /// Counter value for a branch
    pub fn get(&self, branch: Branch) -> u32 {
        match branch {
            Branch::External => self.external,
            Branch::Change => self.change,
            Branch::Disclosure => self.disclosure,
        }
    }

    /// Overwrite the counter value for a branch
    pub fn set(&mut self, branch: Branch, value: u32) {
        match branch {
            Branch::External => self.external = value,
            Branch::Change => self.change = value,
            Branch::Disclosure => self.disclosure = value,
        }
    }
}

/// Canonical account record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    /// Unique account ID
    pub id: String,
    /// Optional unique human alias
    pub alias: Option<String>,
    /// Account root key material
    pub xpubs: Vec<Xpub>,
    /// Signatures required to spend
    pub quorum: u8,
    /// Persisted next-index counters
    pub next_index: NextIndex,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl Account {
    /// Create a new account record with a fresh ID and zeroed counters
    pub fn new(alias: Option<String>, xpubs: Vec<Xpub>, quorum: u8) -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            alias,
            xpubs,
            quorum,
            next_index: NextIndex::default(),
            created_at: Utc::now(),
        }
    }

    /// The key disclosure pubkeys are derived from
    pub fn root_xpub(&self) -> Option<&Xpub> {
        self.xpubs.first()
    }

    /// Whether spending needs more than a single key
    pub fn is_multisig(&self) -> bool {
        self.xpubs.len() > 1
    }
}
