//! # Batch Locator
//!
//! Finds the collateral outputs inside funding transactions. Every output is
//! checked against all three encodings of both redeem scripts, so collateral
//! funded under an earlier script mode is still found.

use crate::error::{CollateralError, CollateralResult};
use bitcoin::{Network, OutPoint, ScriptBuf, Transaction};
use log::{debug, warn};
use std::collections::HashSet;

use super::assembler::{CollateralLeg, CollateralOutput};
use super::params::CollateralParams;
use super::template::{Leg, Template};
use super::variants::PaymentVariants;

/// What a funding transaction pays to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputClass {
    Refundable,
    Seizable,
    Both,
    Neither,
}

/// Redeem script of one leg with its derived encodings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegScript {
    pub leg: Leg,
    pub redeem_script: ScriptBuf,
    pub variants: PaymentVariants,
}

/// Matches funding outputs against the scripts of one contract.
#[derive(Debug, Clone)]
pub struct BatchLocator {
    scripts: [LegScript; 2],
}

impl BatchLocator {
    pub fn new(params: &CollateralParams, network: Network) -> CollateralResult<Self> {
        let script = |leg: Leg| -> CollateralResult<LegScript> {
            let redeem_script = Template::new(params.variant, leg).redeem_script(params)?;
            let variants = PaymentVariants::derive(&redeem_script, network)?;
            Ok(LegScript {
                leg,
                redeem_script,
                variants,
            })
        };
        Ok(Self {
            scripts: [script(Leg::Refundable)?, script(Leg::Seizable)?],
        })
    }

    pub fn script(&self, leg: Leg) -> &LegScript {
        match leg {
            Leg::Refundable => &self.scripts[0],
            Leg::Seizable => &self.scripts[1],
        }
    }

    /// Collateral outputs of `tx`, in output order.
    fn matches<'a>(&'a self, tx: &'a Transaction) -> impl Iterator<Item = CollateralLeg> + 'a {
        let txid = tx.compute_txid();
        tx.output.iter().enumerate().flat_map(move |(vout, out)| {
            self.scripts.iter().filter_map(move |script| {
                let kind = script.variants.match_script_pubkey(&out.script_pubkey)?;
                Some(CollateralLeg {
                    leg: script.leg,
                    redeem_script: script.redeem_script.clone(),
                    variants: script.variants.clone(),
                    output: CollateralOutput {
                        outpoint: OutPoint::new(txid, vout as u32),
                        value: out.value,
                        kind,
                        script_pubkey: out.script_pubkey.clone(),
                    },
                })
            })
        })
    }

    pub fn classify(&self, tx: &Transaction) -> OutputClass {
        let (mut refundable, mut seizable) = (false, false);
        for found in self.matches(tx) {
            match found.leg {
                Leg::Refundable => refundable = true,
                Leg::Seizable => seizable = true,
            }
        }
        match (refundable, seizable) {
            (true, true) => OutputClass::Both,
            (true, false) => OutputClass::Refundable,
            (false, true) => OutputClass::Seizable,
            (false, false) => OutputClass::Neither,
        }
    }

    /// Collateral outputs of `tx` belonging to one of `legs`.
    ///
    /// A transaction that pays none of `legs` is rejected rather than
    /// skipped.
    pub fn locate(&self, tx: &Transaction, legs: &[Leg]) -> CollateralResult<Vec<CollateralLeg>> {
        let found: Vec<CollateralLeg> = self.matches(tx).filter(|c| legs.contains(&c.leg)).collect();
        if found.is_empty() {
            return Err(CollateralError::ScriptMismatch {
                txid: tx.compute_txid().to_string(),
            });
        }
        debug!(
            "Funding tx {} ({:?}) provides {} collateral output(s)",
            tx.compute_txid(),
            self.classify(tx),
            found.len()
        );
        Ok(found)
    }

    /// Aggregate the collateral outputs of several funding transactions into
    /// one input list, transaction by transaction. A transaction given twice
    /// contributes its outputs once.
    pub fn locate_all(&self, txs: &[Transaction], legs: &[Leg]) -> CollateralResult<Vec<CollateralLeg>> {
        let mut seen = HashSet::with_capacity(txs.len());
        let mut all = Vec::new();
        for tx in txs {
            let txid = tx.compute_txid();
            if !seen.insert(txid) {
                warn!("Skipping repeated funding transaction {}", txid);
                continue;
            }
            all.extend(self.locate(tx, legs)?);
        }
        Ok(all)
    }
}
