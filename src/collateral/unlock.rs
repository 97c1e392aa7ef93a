//! # Unlock Data
//!
//! Compiles the stack items that satisfy one branch of a collateral redeem
//! script. Push order, bottom to top:
//!
//! ```text
//! [OP_0]            # multisig only: CHECKMULTISIG pops one extra item
//! <sig>...          # DER + sighash byte, in public-key order
//! [<pubkey>]        # single-signature branches only
//! <secret_n> ... <secret_1>   # reverse slot order, empty when unrevealed
//! <selector>...     # last item is tested by the outermost OP_IF
//! ```

use crate::error::{CollateralError, CollateralResult};
use bitcoin::ecdsa;
use bitcoin::opcodes::all::{OP_PUSHBYTES_0, OP_PUSHNUM_1};
use bitcoin::script::{Builder, PushBytes};
use bitcoin::PublicKey;

use super::params::Secret;
use super::template::Authority;

/// Longest DER signature plus its sighash byte
pub const MAX_SIGNATURE_LEN: usize = 73;

const COMPRESSED_PUBKEY_LEN: usize = 33;

/// A single stack item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackItem {
    Data(Vec<u8>),
    Bool(bool),
    /// Empty push standing for an unrevealed secret or the multisig dummy
    Empty,
}

impl StackItem {
    /// Raw witness encoding
    pub fn to_witness_bytes(&self) -> Vec<u8> {
        match self {
            StackItem::Data(data) => data.clone(),
            StackItem::Bool(true) => vec![1],
            StackItem::Bool(false) | StackItem::Empty => Vec::new(),
        }
    }
}

/// Signatures authorizing a branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authorization {
    Single {
        signature: ecdsa::Signature,
        pubkey: PublicKey,
    },
    /// Signatures already ordered like the script's public keys
    Multisig(Vec<ecdsa::Signature>),
}

/// Ordered stack items for one input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnlockData {
    items: Vec<StackItem>,
}

impl UnlockData {
    pub fn compile(authorization: &Authorization, secrets: &[Option<Secret>], selector: &[bool]) -> Self {
        let mut items = Vec::new();

        match authorization {
            Authorization::Single { signature, pubkey } => {
                items.push(StackItem::Data(signature.to_vec()));
                items.push(StackItem::Data(pubkey.to_bytes()));
            }
            Authorization::Multisig(signatures) => {
                items.push(StackItem::Empty);
                items.extend(signatures.iter().map(|s| StackItem::Data(s.to_vec())));
            }
        }

        Self::finish(items, secrets, selector)
    }

    /// Unlock data shaped like the real one for `authority`, with every
    /// signature at its maximum length. Sizing a spend with it gives an upper
    /// bound on the size of the signed transaction.
    pub fn placeholder(authority: Authority, secrets: &[Option<Secret>], selector: &[bool]) -> Self {
        let signature = StackItem::Data(vec![0; MAX_SIGNATURE_LEN]);
        let items = match authority {
            Authority::Single(_) => vec![signature, StackItem::Data(vec![0; COMPRESSED_PUBKEY_LEN])],
            Authority::Multisig => vec![StackItem::Empty, signature.clone(), signature],
        };
        Self::finish(items, secrets, selector)
    }

    fn finish(mut items: Vec<StackItem>, secrets: &[Option<Secret>], selector: &[bool]) -> Self {
        items.extend(secrets.iter().rev().map(|secret| match secret {
            Some(secret) => StackItem::Data(secret.as_bytes().to_vec()),
            None => StackItem::Empty,
        }));
        items.extend(selector.iter().map(|b| StackItem::Bool(*b)));
        Self { items }
    }

    pub fn items(&self) -> &[StackItem] {
        &self.items
    }

    /// Witness elements, without the trailing witness script
    pub fn witness_items(&self) -> Vec<Vec<u8>> {
        self.items.iter().map(StackItem::to_witness_bytes).collect()
    }

    /// Append the items to a scriptSig as push operations
    pub fn push_to(&self, mut builder: Builder) -> CollateralResult<Builder> {
        for item in &self.items {
            builder = match item {
                StackItem::Data(data) => {
                    let push: &PushBytes = data.as_slice().try_into().map_err(|_| {
                        CollateralError::transaction("Stack item too large for a script push")
                    })?;
                    builder.push_slice(push)
                }
                StackItem::Bool(true) => builder.push_opcode(OP_PUSHNUM_1),
                StackItem::Bool(false) | StackItem::Empty => builder.push_opcode(OP_PUSHBYTES_0),
            };
        }
        Ok(builder)
    }
}
