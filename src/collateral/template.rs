//! # Collateral Script Templates
//!
//! A collateral contract locks two outputs, the *refundable* and the
//! *seizable* leg, each behind a redeem script of mutually exclusive
//! branches nested in `OP_IF`/`OP_ELSE`. Every protocol flavour is a
//! [`Variant`] tag; the branch list built from it is the single source of
//! truth for the redeem script, the branch selector pushed at spend time and
//! the locktime a spend must carry.
//!
//! ## Script Structure (`Collateral` protocol)
//!
//! ```text
//! OP_IF
//!     # Loan period: any one of secretB1 / secretC1, borrower signs
//!     OP_SIZE 32 OP_EQUAL OP_SWAP OP_SHA256 <hashB1> OP_EQUAL OP_ADD 2 OP_EQUAL
//!     OP_SWAP OP_SIZE 32 OP_EQUAL OP_SWAP OP_SHA256 <hashC1> OP_EQUAL OP_ADD 2 OP_EQUAL OP_ADD
//!     1 OP_GREATERTHANOREQUAL OP_VERIFY
//!     OP_DUP OP_HASH160 <borrower_pkh> OP_EQUALVERIFY OP_CHECKSIG
//! OP_ELSE
//!     OP_IF
//!         # Liquidation period: 2-of-3 arbitration after the loan expiration
//!         <loan_expiration> OP_CLTV OP_DROP
//!         2 <borrower> <lender> <agent> 3 OP_CHECKMULTISIG
//!     OP_ELSE
//!         OP_IF
//!             # Seizure period: secretA1 after the liquidation expiration
//!             OP_SIZE 32 OP_EQUALVERIFY OP_SHA256 <hashA1> OP_EQUALVERIFY
//!             <liquidation_expiration> OP_CLTV OP_DROP
//!             OP_DUP OP_HASH160 <seizure_party_pkh> OP_EQUALVERIFY OP_CHECKSIG
//!         OP_ELSE
//!             # Refund period: borrower alone after the seizure expiration
//!             <seizure_expiration> OP_CLTV OP_DROP
//!             OP_DUP OP_HASH160 <borrower_pkh> OP_EQUALVERIFY OP_CHECKSIG
//!         OP_ENDIF
//!     OP_ENDIF
//! OP_ENDIF
//! ```
//!
//! The seizure party is the variant's `seizable_guard` on the seizable leg
//! and the borrower on the refundable leg.

use super::params::{CollateralParams, Expirations, Role, Secret, SecretHashes, SecretSlot};
use super::period::Period;
use crate::error::{CollateralError, CollateralResult};
use bitcoin::hashes::Hash;
use bitcoin::opcodes::all::*;
use bitcoin::script::Builder;
use bitcoin::ScriptBuf;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Protocol family a contract follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    /// Four periods: loan, liquidation, seizure, refund
    Collateral,
    /// Three periods: claim by a liquidator, liquidation, final seizure
    CollateralSwap,
}

/// Which optional branch features a contract uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variant {
    pub protocol: Protocol,
    /// Arbitration additionally requires two of secretA2/B2/C2
    #[serde(default)]
    pub arbitration_evidence: bool,
    /// Party guarding the seizure branch of the seizable leg
    #[serde(default = "default_seizable_guard")]
    pub seizable_guard: Role,
}

fn default_seizable_guard() -> Role {
    Role::Lender
}

impl Default for Variant {
    fn default() -> Self {
        Self {
            protocol: Protocol::Collateral,
            arbitration_evidence: false,
            seizable_guard: default_seizable_guard(),
        }
    }
}

impl Variant {
    pub fn swap() -> Self {
        Self {
            protocol: Protocol::CollateralSwap,
            ..Self::default()
        }
    }
}

/// The two outputs of a collateral contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Leg {
    Refundable,
    Seizable,
}

impl Leg {
    pub const BOTH: [Leg; 2] = [Leg::Refundable, Leg::Seizable];
}

impl fmt::Display for Leg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Leg::Refundable => f.write_str("refundable"),
            Leg::Seizable => f.write_str("seizable"),
        }
    }
}

impl std::str::FromStr for Leg {
    type Err = CollateralError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "refundable" => Ok(Leg::Refundable),
            "seizable" => Ok(Leg::Seizable),
            other => Err(CollateralError::config(format!(
                "Leg must be refundable or seizable (got {})",
                other
            ))),
        }
    }
}

/// How a revealed preimage is size-checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeRule {
    /// Counted only when exactly 32 bytes long
    Exact,
    /// Rejected outright when longer than 32 bytes
    AtMost,
}

/// "Any `required` of `slots`" reveal policy, evaluated with a running
/// counter so that unrevealed slots are pushed as empty items.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Threshold {
    pub slots: Vec<SecretSlot>,
    pub required: u8,
    pub size: SizeRule,
}

impl Threshold {
    fn compile(&self, mut builder: Builder, hashes: &SecretHashes) -> CollateralResult<Builder> {
        for (i, slot) in self.slots.iter().enumerate() {
            let hash = hashes.get(*slot)?;
            if i > 0 {
                builder = builder.push_opcode(OP_SWAP);
            }
            builder = match self.size {
                SizeRule::Exact => builder
                    .push_opcode(OP_SIZE)
                    .push_int(32)
                    .push_opcode(OP_EQUAL)
                    .push_opcode(OP_SWAP)
                    .push_opcode(OP_SHA256)
                    .push_slice(hash.to_byte_array())
                    .push_opcode(OP_EQUAL)
                    .push_opcode(OP_ADD)
                    .push_int(2)
                    .push_opcode(OP_EQUAL),
                SizeRule::AtMost => builder
                    .push_opcode(OP_SIZE)
                    .push_int(32)
                    .push_opcode(OP_LESSTHANOREQUAL)
                    .push_opcode(OP_VERIFY)
                    .push_opcode(OP_SHA256)
                    .push_slice(hash.to_byte_array())
                    .push_opcode(OP_EQUAL),
            };
            if i > 0 {
                builder = builder.push_opcode(OP_ADD);
            }
        }
        Ok(builder
            .push_int(self.required as i64)
            .push_opcode(OP_GREATERTHANOREQUAL)
            .push_opcode(OP_VERIFY))
    }

    fn check(&self, revealed: &[Option<Secret>]) -> CollateralResult<()> {
        let count = revealed.iter().filter(|s| s.is_some()).count();
        if count < self.required as usize {
            return Err(CollateralError::secret(format!(
                "Need {} of {} secrets, got {}",
                self.required,
                slot_names(&self.slots),
                count
            )));
        }
        Ok(())
    }
}

/// Expiration a timelocked branch waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    Loan,
    Liquidation,
    Seizure,
}

impl Deadline {
    pub fn resolve(&self, expirations: &Expirations) -> CollateralResult<u32> {
        match self {
            Deadline::Loan => Ok(expirations.loan),
            Deadline::Liquidation => Ok(expirations.liquidation),
            Deadline::Seizure => expirations
                .seizure
                .ok_or_else(|| CollateralError::config("Missing seizure expiration")),
        }
    }
}

/// Who has to sign a branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authority {
    Single(Role),
    /// 2-of-3 over borrower, lender and agent
    Multisig,
}

/// One spending branch of a redeem script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Branch {
    /// Preimage reveal, no timelock
    Reveal {
        threshold: Threshold,
        /// Slot that must be revealed in addition to the threshold
        also: Option<SecretSlot>,
        guard: Role,
    },
    /// Cooperative 2-of-3 spend
    Arbitration {
        after: Deadline,
        evidence: Option<Threshold>,
    },
    /// Timelocked spend that also reveals one secret
    Seizure {
        after: Deadline,
        secret: SecretSlot,
        guard: Role,
    },
    /// Timelocked single-signature spend
    Fallback { after: Deadline, guard: Role },
}

impl Branch {
    pub fn authority(&self) -> Authority {
        match self {
            Branch::Reveal { guard, .. }
            | Branch::Seizure { guard, .. }
            | Branch::Fallback { guard, .. } => Authority::Single(*guard),
            Branch::Arbitration { .. } => Authority::Multisig,
        }
    }

    pub fn deadline(&self) -> Option<Deadline> {
        match self {
            Branch::Reveal { .. } => None,
            Branch::Arbitration { after, .. }
            | Branch::Seizure { after, .. }
            | Branch::Fallback { after, .. } => Some(*after),
        }
    }

    /// Secret slots in the order the branch consumes them from the stack.
    pub fn secret_slots(&self) -> Vec<SecretSlot> {
        match self {
            Branch::Reveal {
                threshold, also, ..
            } => {
                let mut slots = threshold.slots.clone();
                slots.extend(also);
                slots
            }
            Branch::Arbitration {
                evidence: Some(evidence),
                ..
            } => evidence.slots.clone(),
            Branch::Arbitration { evidence: None, .. } => Vec::new(),
            Branch::Seizure { secret, .. } => vec![*secret],
            Branch::Fallback { .. } => Vec::new(),
        }
    }

    /// Place supplied preimages into this branch's slot order.
    ///
    /// Fails when a preimage opens none of the branch's slots or when the
    /// branch's reveal policy is not met, so that nothing is signed for a spend
    /// the network would reject.
    pub fn arrange_secrets(
        &self,
        hashes: &SecretHashes,
        supplied: &[Secret],
    ) -> CollateralResult<Vec<Option<Secret>>> {
        let slots = self.secret_slots();
        let mut arranged: Vec<Option<Secret>> = vec![None; slots.len()];

        for secret in supplied {
            let digest = secret.hash();
            let mut matched = false;
            for (i, slot) in slots.iter().enumerate() {
                if hashes.get(*slot)? == digest {
                    arranged[i] = Some(*secret);
                    matched = true;
                }
            }
            if !matched {
                return Err(CollateralError::secret(if slots.is_empty() {
                    "This branch takes no secrets".to_string()
                } else {
                    format!("Secret must match one of {}", slot_names(&slots))
                }));
            }
        }

        match self {
            Branch::Reveal {
                threshold, also, ..
            } => {
                threshold.check(&arranged[..threshold.slots.len()])?;
                if let Some(slot) = also {
                    if arranged.last().copied().flatten().is_none() {
                        return Err(CollateralError::secret(format!("Missing secret for {}", slot)));
                    }
                }
            }
            Branch::Arbitration {
                evidence: Some(evidence),
                ..
            } => evidence.check(&arranged)?,
            Branch::Seizure { secret, .. } => {
                if arranged[0].is_none() {
                    return Err(CollateralError::secret(format!("Missing secret for {}", secret)));
                }
            }
            Branch::Arbitration { evidence: None, .. } | Branch::Fallback { .. } => {}
        }

        Ok(arranged)
    }

    fn compile(&self, builder: Builder, params: &CollateralParams) -> CollateralResult<Builder> {
        let keys = &params.keys;
        let hashes = &params.secret_hashes;
        let expirations = &params.expirations;

        let builder = match self {
            Branch::Reveal {
                threshold,
                also,
                guard,
            } => {
                let mut builder = threshold.compile(builder, hashes)?;
                if let Some(slot) = also {
                    builder = push_exact_secret(builder, hashes, *slot)?;
                }
                push_pubkey_hash_check(builder, keys.pubkey_hash(*guard)?.to_byte_array())
            }
            Branch::Arbitration { after, evidence } => {
                let mut builder = builder;
                if let Some(evidence) = evidence {
                    builder = evidence.compile(builder, hashes)?;
                }
                let mut builder = builder
                    .push_int(after.resolve(expirations)? as i64)
                    .push_opcode(OP_CLTV)
                    .push_opcode(OP_DROP)
                    .push_int(2);
                for (_, key) in keys.multisig_keys() {
                    builder = builder.push_key(&key);
                }
                builder.push_int(3).push_opcode(OP_CHECKMULTISIG)
            }
            Branch::Seizure {
                after,
                secret,
                guard,
            } => {
                let builder = push_exact_secret(builder, hashes, *secret)?
                    .push_int(after.resolve(expirations)? as i64)
                    .push_opcode(OP_CLTV)
                    .push_opcode(OP_DROP);
                push_pubkey_hash_check(builder, keys.pubkey_hash(*guard)?.to_byte_array())
            }
            Branch::Fallback { after, guard } => {
                let builder = builder
                    .push_int(after.resolve(expirations)? as i64)
                    .push_opcode(OP_CLTV)
                    .push_opcode(OP_DROP);
                push_pubkey_hash_check(builder, keys.pubkey_hash(*guard)?.to_byte_array())
            }
        };
        Ok(builder)
    }
}

fn push_exact_secret(
    builder: Builder,
    hashes: &SecretHashes,
    slot: SecretSlot,
) -> CollateralResult<Builder> {
    Ok(builder
        .push_opcode(OP_SIZE)
        .push_int(32)
        .push_opcode(OP_EQUALVERIFY)
        .push_opcode(OP_SHA256)
        .push_slice(hashes.get(slot)?.to_byte_array())
        .push_opcode(OP_EQUALVERIFY))
}

fn push_pubkey_hash_check(builder: Builder, pubkey_hash: [u8; 20]) -> Builder {
    builder
        .push_opcode(OP_DUP)
        .push_opcode(OP_HASH160)
        .push_slice(pubkey_hash)
        .push_opcode(OP_EQUALVERIFY)
        .push_opcode(OP_CHECKSIG)
}

fn slot_names(slots: &[SecretSlot]) -> String {
    slots
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join(" or ")
}

/// Ordered branch list of one leg of one variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    leg: Leg,
    variant: Variant,
    branches: Vec<(Period, Branch)>,
}

impl Template {
    pub fn new(variant: Variant, leg: Leg) -> Self {
        let seizure_guard = match leg {
            Leg::Seizable => variant.seizable_guard,
            Leg::Refundable => Role::Borrower,
        };
        let arbitration = |after| Branch::Arbitration {
            after,
            evidence: variant.arbitration_evidence.then(|| Threshold {
                slots: vec![SecretSlot::A2, SecretSlot::B2, SecretSlot::C2],
                required: 2,
                size: SizeRule::AtMost,
            }),
        };

        let branches = match variant.protocol {
            Protocol::Collateral => vec![
                (
                    Period::Loan,
                    Branch::Reveal {
                        threshold: Threshold {
                            slots: vec![SecretSlot::B1, SecretSlot::C1],
                            required: 1,
                            size: SizeRule::Exact,
                        },
                        also: None,
                        guard: Role::Borrower,
                    },
                ),
                (Period::Liquidation, arbitration(Deadline::Loan)),
                (
                    Period::Seizure,
                    Branch::Seizure {
                        after: Deadline::Liquidation,
                        secret: SecretSlot::A1,
                        guard: seizure_guard,
                    },
                ),
                (
                    Period::Refund,
                    Branch::Fallback {
                        after: Deadline::Seizure,
                        guard: Role::Borrower,
                    },
                ),
            ],
            Protocol::CollateralSwap => vec![
                (
                    Period::Loan,
                    Branch::Reveal {
                        threshold: Threshold {
                            slots: vec![SecretSlot::A1, SecretSlot::B1, SecretSlot::C1],
                            required: 2,
                            size: SizeRule::Exact,
                        },
                        also: Some(SecretSlot::D1),
                        guard: Role::Liquidator,
                    },
                ),
                (Period::Liquidation, arbitration(Deadline::Loan)),
                (
                    Period::Seizure,
                    Branch::Fallback {
                        after: Deadline::Liquidation,
                        guard: seizure_guard,
                    },
                ),
            ],
        };

        Self {
            leg,
            variant,
            branches,
        }
    }

    pub fn leg(&self) -> Leg {
        self.leg
    }

    pub fn variant(&self) -> Variant {
        self.variant
    }

    pub fn periods(&self) -> impl Iterator<Item = Period> + '_ {
        self.branches.iter().map(|(period, _)| *period)
    }

    fn index(&self, period: Period) -> CollateralResult<usize> {
        self.branches
            .iter()
            .position(|(p, _)| *p == period)
            .ok_or_else(|| CollateralError::UnresolvedBranch {
                period: period.to_string(),
            })
    }

    pub fn branch(&self, period: Period) -> CollateralResult<&Branch> {
        Ok(&self.branches[self.index(period)?].1)
    }

    /// Selector values in push order; the last one is tested by the
    /// outermost `OP_IF`.
    pub fn selector(&self, period: Period) -> CollateralResult<Vec<bool>> {
        let index = self.index(period)?;
        let last = self.branches.len() - 1;
        if index < last {
            let mut selector = vec![true];
            selector.extend(std::iter::repeat(false).take(index));
            Ok(selector)
        } else {
            Ok(vec![false; last])
        }
    }

    /// Transaction locktime for a spend in `period`, zero for untimed branches.
    pub fn locktime(&self, period: Period, expirations: &Expirations) -> CollateralResult<u32> {
        match self.branch(period)?.deadline() {
            Some(deadline) => deadline.resolve(expirations),
            None => Ok(0),
        }
    }

    /// Compile the redeem script. Pure: equal parameters give equal bytes.
    pub fn redeem_script(&self, params: &CollateralParams) -> CollateralResult<ScriptBuf> {
        params.keys.validate()?;

        let last = self.branches.len() - 1;
        let mut builder = Builder::new();
        for (i, (_, branch)) in self.branches.iter().enumerate() {
            if i < last {
                builder = builder.push_opcode(OP_IF);
            }
            builder = branch.compile(builder, params)?;
            if i < last {
                builder = builder.push_opcode(OP_ELSE);
            }
        }
        for _ in 0..last {
            builder = builder.push_opcode(OP_ENDIF);
        }
        Ok(builder.into_script())
    }
}
