//! Signature digests for collateral inputs.
//!
//! Segwit encodings (native and wrapped) sign the BIP143 digest over the
//! redeem script and the previous output value. Plain P2SH signs the legacy
//! digest with the redeem script as script code.

use crate::error::{CollateralError, CollateralResult};
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::Message;
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{PublicKey, Transaction, Txid};

use super::assembler::CollateralLeg;

/// What a signer needs to authorize one input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningRequest {
    pub input_index: usize,
    pub pubkey: PublicKey,
    pub message: Message,
    /// Funding transaction the input spends from
    pub funding_txid: Txid,
}

/// Digest input `index` of `tx` commits to when spending `leg`.
pub fn signature_hash(tx: &Transaction, index: usize, leg: &CollateralLeg) -> CollateralResult<Message> {
    let mut cache = SighashCache::new(tx);
    let digest = if leg.output.kind.is_segwit() {
        cache
            .p2wsh_signature_hash(index, &leg.redeem_script, leg.output.value, EcdsaSighashType::All)
            .map_err(|e| CollateralError::signing(format!("Witness sighash failed: {}", e)))?
            .to_byte_array()
    } else {
        cache
            .legacy_signature_hash(index, &leg.redeem_script, EcdsaSighashType::All.to_u32())
            .map_err(|e| CollateralError::signing(format!("Legacy sighash failed: {}", e)))?
            .to_byte_array()
    };
    Ok(Message::from_digest(digest))
}

/// One digest per input, in input order.
pub fn signature_hashes(tx: &Transaction, legs: &[CollateralLeg]) -> CollateralResult<Vec<Message>> {
    if tx.input.len() != legs.len() {
        return Err(CollateralError::transaction(format!(
            "Transaction has {} inputs but {} collateral legs",
            tx.input.len(),
            legs.len()
        )));
    }
    legs.iter()
        .enumerate()
        .map(|(index, leg)| signature_hash(tx, index, leg))
        .collect()
}

/// Signing requests for every input, each signed by `signers[i]`.
pub fn signing_requests(
    tx: &Transaction,
    legs: &[CollateralLeg],
    signers: &[PublicKey],
) -> CollateralResult<Vec<SigningRequest>> {
    let messages = signature_hashes(tx, legs)?;
    if signers.len() != legs.len() {
        return Err(CollateralError::signing("One signer key is needed per input"));
    }
    Ok(messages
        .into_iter()
        .zip(legs.iter().zip(signers))
        .enumerate()
        .map(|(input_index, (message, (leg, pubkey)))| SigningRequest {
            input_index,
            pubkey: *pubkey,
            message,
            funding_txid: leg.output.outpoint.txid,
        })
        .collect())
}
