//! # Contract Parameters
//!
//! Keys, secret commitments and expirations that together fix a collateral
//! instance. Every field flows into the redeem script, so changing any of them
//! yields a different address and orphans collateral funded to the old one.

use crate::error::{CollateralError, CollateralResult};
use bitcoin::hashes::{sha256, Hash};
use bitcoin::{PubkeyHash, PublicKey};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::template::Variant;

/// Parties of a collateral contract.
///
/// The declaration order of the first three roles is the public-key order of
/// the 2-of-3 arbitration branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Borrower,
    Lender,
    Agent,
    Liquidator,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Borrower => "borrower",
            Role::Lender => "lender",
            Role::Agent => "agent",
            Role::Liquidator => "liquidator",
        };
        f.write_str(name)
    }
}

impl FromStr for Role {
    type Err = CollateralError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "borrower" => Ok(Role::Borrower),
            "lender" => Ok(Role::Lender),
            // "arbiter" is the name used by swap-style contracts
            "agent" | "arbiter" => Ok(Role::Agent),
            "liquidator" => Ok(Role::Liquidator),
            other => Err(CollateralError::config(format!(
                "Role must be one of borrower, lender, agent, liquidator (got {})",
                other
            ))),
        }
    }
}

/// Public keys of the contract parties.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartyKeys {
    pub borrower: PublicKey,
    pub lender: PublicKey,
    pub agent: PublicKey,
    /// Only swap-style contracts have a liquidator. The script commits to the
    /// hash of this key; the full key is needed to spend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub liquidator: Option<PublicKey>,
}

impl PartyKeys {
    pub fn new(borrower: PublicKey, lender: PublicKey, agent: PublicKey) -> CollateralResult<Self> {
        let keys = Self {
            borrower,
            lender,
            agent,
            liquidator: None,
        };
        keys.validate()?;
        Ok(keys)
    }

    pub fn with_liquidator(mut self, liquidator: PublicKey) -> CollateralResult<Self> {
        self.liquidator = Some(liquidator);
        self.validate()?;
        Ok(self)
    }

    /// All keys must be 33-byte compressed keys.
    pub fn validate(&self) -> CollateralResult<()> {
        let mut roles = vec![
            (Role::Borrower, self.borrower),
            (Role::Lender, self.lender),
            (Role::Agent, self.agent),
        ];
        if let Some(liquidator) = self.liquidator {
            roles.push((Role::Liquidator, liquidator));
        }
        for (role, key) in roles {
            if !key.compressed {
                return Err(CollateralError::config(format!(
                    "{} public key must be compressed",
                    role
                )));
            }
        }
        Ok(())
    }

    pub fn key(&self, role: Role) -> CollateralResult<PublicKey> {
        match role {
            Role::Borrower => Ok(self.borrower),
            Role::Lender => Ok(self.lender),
            Role::Agent => Ok(self.agent),
            Role::Liquidator => self
                .liquidator
                .ok_or_else(|| CollateralError::config("Missing liquidator public key")),
        }
    }

    pub fn pubkey_hash(&self, role: Role) -> CollateralResult<PubkeyHash> {
        Ok(self.key(role)?.pubkey_hash())
    }

    /// Keys of the arbitration branch, in script order.
    pub fn multisig_keys(&self) -> [(Role, PublicKey); 3] {
        [
            (Role::Borrower, self.borrower),
            (Role::Lender, self.lender),
            (Role::Agent, self.agent),
        ]
    }
}

/// Named secret-hash slots.
///
/// `A*` belong to the borrower, `B*` to the lender and `C*` to the agent.
/// `D1` is the liquidator's secret in swap-style contracts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SecretSlot {
    A1,
    A2,
    B1,
    B2,
    C1,
    C2,
    D1,
}

impl SecretSlot {
    pub const ALL: [SecretSlot; 7] = [
        SecretSlot::A1,
        SecretSlot::A2,
        SecretSlot::B1,
        SecretSlot::B2,
        SecretSlot::C1,
        SecretSlot::C2,
        SecretSlot::D1,
    ];
}

impl fmt::Display for SecretSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "secretHash{:?}", self)
    }
}

impl FromStr for SecretSlot {
    type Err = CollateralError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim_start_matches("secretHash").to_ascii_uppercase();
        Self::ALL
            .into_iter()
            .find(|slot| format!("{:?}", slot) == name)
            .ok_or_else(|| CollateralError::config(format!("Unknown secret slot: {}", s)))
    }
}

/// SHA-256 commitments to the contract secrets. Absent slots are allowed as
/// long as the chosen template never references them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretHashes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub a1: Option<sha256::Hash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub a2: Option<sha256::Hash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub b1: Option<sha256::Hash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub b2: Option<sha256::Hash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub c1: Option<sha256::Hash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub c2: Option<sha256::Hash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub d1: Option<sha256::Hash>,
}

impl SecretHashes {
    pub fn slot(&self, slot: SecretSlot) -> Option<sha256::Hash> {
        match slot {
            SecretSlot::A1 => self.a1,
            SecretSlot::A2 => self.a2,
            SecretSlot::B1 => self.b1,
            SecretSlot::B2 => self.b2,
            SecretSlot::C1 => self.c1,
            SecretSlot::C2 => self.c2,
            SecretSlot::D1 => self.d1,
        }
    }

    /// Hash committed in `slot`, or a configuration error if it was never set.
    pub fn get(&self, slot: SecretSlot) -> CollateralResult<sha256::Hash> {
        self.slot(slot)
            .ok_or_else(|| CollateralError::config(format!("Missing {}", slot)))
    }

    pub fn set(&mut self, slot: SecretSlot, hash: sha256::Hash) {
        let field = match slot {
            SecretSlot::A1 => &mut self.a1,
            SecretSlot::A2 => &mut self.a2,
            SecretSlot::B1 => &mut self.b1,
            SecretSlot::B2 => &mut self.b2,
            SecretSlot::C1 => &mut self.c1,
            SecretSlot::C2 => &mut self.c2,
            SecretSlot::D1 => &mut self.d1,
        };
        *field = Some(hash);
    }
}

/// A 32-byte hash preimage.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Secret([u8; 32]);

impl Secret {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Fresh random secret
    pub fn random() -> Self {
        Self(rand::random())
    }

    pub fn hash(&self) -> sha256::Hash {
        sha256::Hash::hash(&self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

// Secrets never end up in logs by accident.
impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret({})", self.hash())
    }
}

impl FromStr for Secret {
    type Err = CollateralError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)
            .map_err(|e| CollateralError::secret(format!("Secret is not valid hex: {}", e)))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CollateralError::secret("Secret must be exactly 32 bytes"))?;
        Ok(Self(bytes))
    }
}

/// UNIX timestamps closing each period.
///
/// Ordering (`loan < liquidation < seizure`) is the caller's responsibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Expirations {
    /// Loan (approve / swap) expiration
    pub loan: u32,
    /// Liquidation (bidding) expiration
    pub liquidation: u32,
    /// Seizure expiration; swap-style contracts have none
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seizure: Option<u32>,
}

/// Amounts posted to each collateral leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollateralValues {
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub refundable: bitcoin::Amount,
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub seizable: bitcoin::Amount,
}

/// Everything that determines the two redeem scripts of a contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollateralParams {
    pub keys: PartyKeys,
    pub secret_hashes: SecretHashes,
    pub expirations: Expirations,
    #[serde(default)]
    pub variant: Variant,
}

impl CollateralParams {
    /// Save the contract to a JSON file.
    pub fn save_to_file(&self, filename: &str) -> CollateralResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(filename, json)?;
        Ok(())
    }

    /// Load a contract from a JSON file, rejecting uncompressed keys.
    pub fn load_from_file(filename: &str) -> CollateralResult<Self> {
        let json = std::fs::read_to_string(filename)?;
        let params: Self = serde_json::from_str(&json)?;
        params.keys.validate()?;
        Ok(params)
    }
}
