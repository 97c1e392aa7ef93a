//! # Cooperative Arbitration
//!
//! The liquidation branch is a 2-of-3 `OP_CHECKMULTISIG` over borrower, lender
//! and agent. Each party signs on its own, against an unsigned spend every
//! party rebuilds from the same contract, funding txids, payouts and fee
//! rate, and ships a detached [`PartialSignatures`] bundle. Any holder of two
//! bundles can finalize.
//!
//! ```text
//! Unsigned -> PartiallySigned(role) -> Ready([role, role]) -> Finalized
//! ```

use crate::error::{CollateralError, CollateralResult};
use bitcoin::ecdsa;
use bitcoin::secp256k1::{Message, Secp256k1};
use bitcoin::sighash::EcdsaSighashType;
use bitcoin::{Transaction, Txid};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::assembler::{CollateralLeg, TransactionAssembler, UnsignedSpend};
use super::params::{CollateralParams, Role, Secret};
use super::period::Period;
use super::sighash::signature_hashes;
use super::template::Template;
use super::unlock::{Authorization, UnlockData};

/// Progress of a cooperative spend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultisigState {
    Unsigned,
    PartiallySigned(Role),
    /// Two parties signed, in public-key order
    Ready([Role; 2]),
    Finalized,
}

/// Detached signatures of one party over every input of a cooperative spend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialSignatures {
    pub role: Role,
    /// Txid of the unsigned spend the signatures commit to
    pub unsigned_txid: Txid,
    /// sat/vB the spend was built with; co-signers must rebuild with it
    pub fee_rate: u64,
    /// Hex DER signatures with sighash byte, one per input
    pub signatures: Vec<String>,
}

impl PartialSignatures {
    pub fn new(role: Role, spend: &UnsignedSpend, signatures: &[ecdsa::Signature]) -> Self {
        Self {
            role,
            unsigned_txid: spend.tx.compute_txid(),
            fee_rate: spend.fee_rate,
            signatures: signatures.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn decode(&self) -> CollateralResult<Vec<ecdsa::Signature>> {
        self.signatures
            .iter()
            .map(|s| {
                s.parse::<ecdsa::Signature>().map_err(|e| {
                    CollateralError::signing(format!("Invalid {} signature {}: {}", self.role, s, e))
                })
            })
            .collect()
    }
}

/// Upper-bound unlock data for spending `legs` through the arbitration
/// branch, with every evidence slot filled.
pub fn liquidation_bounds(params: &CollateralParams, legs: &[CollateralLeg]) -> CollateralResult<Vec<UnlockData>> {
    legs.iter()
        .map(|leg| {
            let template = Template::new(params.variant, leg.leg);
            let branch = template.branch(Period::Liquidation)?;
            let secrets = vec![Some(Secret::new([0; 32])); branch.secret_slots().len()];
            Ok(UnlockData::placeholder(
                branch.authority(),
                &secrets,
                &template.selector(Period::Liquidation)?,
            ))
        })
        .collect()
}

/// Collects partial signatures for one unsigned arbitration spend.
#[derive(Debug, Clone)]
pub struct MultisigSession {
    spend: UnsignedSpend,
    params: CollateralParams,
    messages: Vec<Message>,
    collected: BTreeMap<Role, Vec<ecdsa::Signature>>,
    finalized: bool,
}

impl MultisigSession {
    pub fn new(spend: UnsignedSpend, params: CollateralParams) -> CollateralResult<Self> {
        let messages = signature_hashes(&spend.tx, &spend.legs)?;
        Ok(Self {
            spend,
            params,
            messages,
            collected: BTreeMap::new(),
            finalized: false,
        })
    }

    pub fn spend(&self) -> &UnsignedSpend {
        &self.spend
    }

    pub fn unsigned_txid(&self) -> Txid {
        self.spend.tx.compute_txid()
    }

    /// Digests a party signs, one per input.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn state(&self) -> MultisigState {
        if self.finalized {
            return MultisigState::Finalized;
        }
        let mut roles = self.collected.keys().copied();
        match (roles.next(), roles.next()) {
            (None, _) => MultisigState::Unsigned,
            (Some(role), None) => MultisigState::PartiallySigned(role),
            (Some(first), Some(second)) => MultisigState::Ready([first, second]),
        }
    }

    /// Verify and record one party's signatures.
    pub fn add(&mut self, partial: &PartialSignatures) -> CollateralResult<MultisigState> {
        let pubkey = self
            .params
            .keys
            .multisig_keys()
            .into_iter()
            .find(|(role, _)| *role == partial.role)
            .map(|(_, key)| key)
            .ok_or_else(|| {
                CollateralError::signing(format!("{} is not a party to the arbitration branch", partial.role))
            })?;

        let expected = self.unsigned_txid();
        if partial.unsigned_txid != expected {
            return Err(CollateralError::signing(format!(
                "Signatures of {} are for transaction {}, expected {}",
                partial.role, partial.unsigned_txid, expected
            )));
        }

        let signatures = partial.decode()?;
        if signatures.len() != self.messages.len() {
            return Err(CollateralError::signing(format!(
                "Expected {} signatures from {}, got {}",
                self.messages.len(),
                partial.role,
                signatures.len()
            )));
        }

        let secp = Secp256k1::verification_only();
        for (index, (signature, message)) in signatures.iter().zip(&self.messages).enumerate() {
            if signature.sighash_type != EcdsaSighashType::All {
                return Err(CollateralError::signing(format!(
                    "Signature of {} on input {} is not SIGHASH_ALL",
                    partial.role, index
                )));
            }
            secp.verify_ecdsa(message, &signature.signature, &pubkey.inner)
                .map_err(|_| {
                    CollateralError::signing(format!(
                        "Signature of {} on input {} does not verify",
                        partial.role, index
                    ))
                })?;
        }

        debug!("Accepted {} signatures from {}", signatures.len(), partial.role);
        self.collected.insert(partial.role, signatures);
        Ok(self.state())
    }

    /// Assemble the fully unlocked spend from the first two signers in key
    /// order. `evidence` supplies preimages when the arbitration branch
    /// requires them.
    pub fn finalize(
        &mut self,
        assembler: &TransactionAssembler,
        evidence: &[Secret],
    ) -> CollateralResult<Transaction> {
        let [first, second] = match self.state() {
            MultisigState::Ready(roles) => roles,
            MultisigState::Finalized => {
                return Err(CollateralError::signing("Cooperative spend already finalized"))
            }
            _ => {
                return Err(CollateralError::signing(
                    "Two of borrower, lender and agent must sign before finalizing",
                ))
            }
        };

        let mut unlocks = Vec::with_capacity(self.spend.legs.len());
        for (index, leg) in self.spend.legs.iter().enumerate() {
            let template = Template::new(self.params.variant, leg.leg);
            let branch = template.branch(Period::Liquidation)?;
            let secrets = branch.arrange_secrets(&self.params.secret_hashes, evidence)?;
            let signatures = vec![self.collected[&first][index], self.collected[&second][index]];
            unlocks.push(UnlockData::compile(
                &Authorization::Multisig(signatures),
                &secrets,
                &template.selector(Period::Liquidation)?,
            ));
        }

        let tx = assembler.finalize(self.spend.clone(), &unlocks)?;
        self.finalized = true;
        info!(
            "Finalized cooperative spend {} signed by {} and {}",
            tx.compute_txid(),
            first,
            second
        );
        Ok(tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collateral::assembler::Payout;
    use crate::collateral::fixtures::{Fixture, NETWORK};
    use crate::collateral::stack_machine::verify_input;
    use crate::collateral::template::{Leg, Variant};
    use crate::collateral::variants::PaymentKind;
    use bitcoin::Amount;

    fn session(fixture: &Fixture, kind: PaymentKind) -> (MultisigSession, Vec<Transaction>) {
        let (fund_r, leg_r) = fixture.funded_leg(Leg::Refundable, kind, Amount::from_sat(400_000));
        let (fund_s, leg_s) = fixture.funded_leg(Leg::Seizable, kind, Amount::from_sat(600_000));
        let destination = fixture.address_of(fixture.agent.pubkey, NETWORK);
        let template = fixture.template(Leg::Seizable);
        let locktime = template
            .locktime(Period::Liquidation, &fixture.params.expirations)
            .unwrap();
        let legs = vec![leg_r, leg_s];
        let bounds = liquidation_bounds(&fixture.params, &legs).unwrap();
        let spend = TransactionAssembler::default()
            .build(legs, &[Payout::to(destination)], &bounds, locktime, 2)
            .unwrap();
        (
            MultisigSession::new(spend, fixture.params.clone()).unwrap(),
            vec![fund_r, fund_s],
        )
    }

    fn sign(fixture: &Fixture, session: &MultisigSession, role: Role) -> PartialSignatures {
        let secp = Secp256k1::new();
        let secret_key = fixture.party(role).secret_key;
        let signatures: Vec<ecdsa::Signature> = session
            .messages()
            .iter()
            .map(|m| ecdsa::Signature::sighash_all(secp.sign_ecdsa(m, &secret_key)))
            .collect();
        PartialSignatures::new(role, session.spend(), &signatures)
    }

    #[test]
    fn test_state_progression_and_valid_spend() {
        let fixture = Fixture::new(Variant::default());
        let (mut session, funding) = session(&fixture, PaymentKind::P2wsh);
        assert_eq!(session.state(), MultisigState::Unsigned);

        // Agent signs first; key order still puts the lender first.
        let state = session.add(&sign(&fixture, &session, Role::Agent)).unwrap();
        assert_eq!(state, MultisigState::PartiallySigned(Role::Agent));
        assert!(session.finalize(&TransactionAssembler::default(), &[]).is_err());

        let state = session.add(&sign(&fixture, &session, Role::Lender)).unwrap();
        assert_eq!(state, MultisigState::Ready([Role::Lender, Role::Agent]));

        let tx = session.finalize(&TransactionAssembler::default(), &[]).unwrap();
        assert_eq!(session.state(), MultisigState::Finalized);
        for (index, funding) in funding.iter().enumerate() {
            verify_input(&tx, index, &funding.output[0]).unwrap();
        }
    }

    #[test]
    fn test_legacy_p2sh_cooperative_spend() {
        let fixture = Fixture::new(Variant::default());
        let (mut session, funding) = session(&fixture, PaymentKind::P2sh);
        session.add(&sign(&fixture, &session, Role::Borrower)).unwrap();
        session.add(&sign(&fixture, &session, Role::Lender)).unwrap();
        let tx = session.finalize(&TransactionAssembler::default(), &[]).unwrap();
        verify_input(&tx, 0, &funding[0].output[0]).unwrap();
        verify_input(&tx, 1, &funding[1].output[0]).unwrap();
    }

    #[test]
    fn test_rejects_wrong_key_and_liquidator() {
        let fixture = Fixture::new(Variant::default());
        let (mut session, _) = session(&fixture, PaymentKind::P2wsh);

        let mut forged = sign(&fixture, &session, Role::Agent);
        forged.role = Role::Borrower;
        assert!(matches!(
            session.add(&forged),
            Err(CollateralError::Signing { .. })
        ));

        let liquidator = sign(&fixture, &session, Role::Liquidator);
        assert!(session.add(&liquidator).is_err());
        assert_eq!(session.state(), MultisigState::Unsigned);
    }

    #[test]
    fn test_rejects_signatures_for_another_spend() {
        let fixture = Fixture::new(Variant::default());
        let (mut session, _) = session(&fixture, PaymentKind::P2wsh);
        let mut partial = sign(&fixture, &session, Role::Lender);
        partial.unsigned_txid = fixture.funding_tx(vec![]).compute_txid();
        assert!(session.add(&partial).is_err());

        let mut partial = sign(&fixture, &session, Role::Lender);
        partial.signatures.pop();
        assert!(session.add(&partial).is_err());
    }

    #[test]
    fn test_bounds_cover_evidence_slots() {
        let fixture = Fixture::new(Variant {
            arbitration_evidence: true,
            ..Variant::default()
        });
        let (_, leg) = fixture.funded_leg(Leg::Seizable, PaymentKind::P2wsh, Amount::from_sat(1));
        let bounds = liquidation_bounds(&fixture.params, &[leg]).unwrap();
        let items = bounds[0].witness_items();
        // dummy, two signatures, three evidence slots, selector
        assert!(items[0].is_empty());
        assert_eq!(items.iter().filter(|i| i.len() == 32).count(), 3);
        assert!(items.len() > 6);
    }

    #[test]
    fn test_partial_signatures_serialize() {
        let fixture = Fixture::new(Variant::default());
        let (session, _) = session(&fixture, PaymentKind::P2wsh);
        let partial = sign(&fixture, &session, Role::Borrower);
        let json = serde_json::to_string(&partial).unwrap();
        assert!(json.contains("\"role\":\"borrower\""));
        let back: PartialSignatures = serde_json::from_str(&json).unwrap();
        assert_eq!(back, partial);
    }

    #[test]
    fn test_evidence_variant_needs_two_preimages() {
        let fixture = Fixture::new(Variant {
            arbitration_evidence: true,
            ..Variant::default()
        });
        let (mut session, funding) = session(&fixture, PaymentKind::P2wsh);
        session.add(&sign(&fixture, &session, Role::Borrower)).unwrap();
        session.add(&sign(&fixture, &session, Role::Agent)).unwrap();

        let a2 = fixture.secret(crate::collateral::params::SecretSlot::A2);
        let c2 = fixture.secret(crate::collateral::params::SecretSlot::C2);
        assert!(session
            .clone()
            .finalize(&TransactionAssembler::default(), &[a2])
            .is_err());

        let tx = session
            .finalize(&TransactionAssembler::default(), &[c2, a2])
            .unwrap();
        verify_input(&tx, 0, &funding[0].output[0]).unwrap();
        verify_input(&tx, 1, &funding[1].output[0]).unwrap();
    }
}
