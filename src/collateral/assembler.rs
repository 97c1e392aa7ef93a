//! # Transaction Assembler
//!
//! Builds unsigned spends of one or more collateral outputs and, once the
//! unlock data is known, finalizes their scriptSig and witness.
//!
//! ## Fee Model
//!
//! The spend is sized by finalizing a copy of it with upper-bound unlock data
//! (maximum-length signatures, every secret slot filled) and measuring its
//! virtual size. The [`FeePolicy`] byte tables act as a floor:
//!
//! - **Segwit**: `203 + 161 × (inputs − 1)` virtual bytes
//! - **Legacy P2SH**: `148 × inputs + 34 × outputs + 10` bytes
//!
//! The fee is taken from the single aggregate output, or split evenly over
//! per-input outputs. A fee that would leave nothing to pay out, a dust
//! output, or a finalized spend paying below its rate is an error.

use crate::config::FeePolicy;
use crate::error::{CollateralError, CollateralResult};
use bitcoin::absolute::LockTime;
use bitcoin::script::{Builder, PushBytes};
use bitcoin::transaction::Version;
use bitcoin::{
    Address, Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness,
};
use log::debug;

use super::template::Leg;
use super::unlock::UnlockData;
use super::variants::{PaymentKind, PaymentVariants};

/// A funding output matched to one of the encodings of a redeem script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollateralOutput {
    pub outpoint: OutPoint,
    pub value: Amount,
    pub kind: PaymentKind,
    pub script_pubkey: ScriptBuf,
}

/// Everything needed to spend one collateral output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollateralLeg {
    pub leg: Leg,
    pub redeem_script: ScriptBuf,
    pub variants: PaymentVariants,
    pub output: CollateralOutput,
}

/// Destination of a spend. Without a value the output receives its inputs
/// minus its share of the fee.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payout {
    pub address: Address,
    pub value: Option<Amount>,
}

impl Payout {
    pub fn to(address: Address) -> Self {
        Self {
            address,
            value: None,
        }
    }

    pub fn with_value(address: Address, value: Amount) -> Self {
        Self {
            address,
            value: Some(value),
        }
    }
}

/// A spend waiting for signatures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedSpend {
    pub tx: Transaction,
    pub legs: Vec<CollateralLeg>,
    /// Inputs minus outputs
    pub fee: Amount,
    /// sat/vB the fee was computed for
    pub fee_rate: u64,
}

/// Builds and finalizes collateral spends under a [`FeePolicy`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TransactionAssembler {
    policy: FeePolicy,
}

impl TransactionAssembler {
    pub fn new(policy: FeePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &FeePolicy {
        &self.policy
    }

    /// Upper bound on the virtual size of spending `legs` into `payouts`,
    /// never below the policy's size table.
    ///
    /// `bounds` holds one upper-bound [`UnlockData`] per leg, see
    /// [`UnlockData::placeholder`].
    pub fn estimate_vsize(
        &self,
        legs: &[CollateralLeg],
        payouts: &[Payout],
        bounds: &[UnlockData],
    ) -> CollateralResult<u64> {
        if bounds.len() != legs.len() {
            return Err(CollateralError::transaction(format!(
                "Expected size bounds for {} inputs, got {}",
                legs.len(),
                bounds.len()
            )));
        }

        // Output values are fixed width, so zero stands in for the real ones.
        let zeros = vec![Amount::ZERO; payouts.len()];
        let mut tx = skeleton(legs, payouts, &zeros, 0);
        for (index, (leg, bound)) in legs.iter().zip(bounds).enumerate() {
            finalize_input(&mut tx, index, leg, bound)?;
        }
        let measured = tx.vsize() as u64;

        let segwit = legs.iter().all(|l| l.output.kind.is_segwit());
        let floor = self.policy.estimated_size(segwit, legs.len(), payouts.len());
        Ok(measured.max(floor))
    }

    /// Fee for spending `legs` into `payouts` at `fee_rate` sat/vB.
    pub fn estimate_fee(
        &self,
        legs: &[CollateralLeg],
        payouts: &[Payout],
        bounds: &[UnlockData],
        fee_rate: u64,
    ) -> CollateralResult<Amount> {
        self.estimate_vsize(legs, payouts, bounds)?
            .checked_mul(fee_rate)
            .map(Amount::from_sat)
            .ok_or_else(|| CollateralError::transaction("Fee computation overflowed"))
    }

    /// Build the unsigned spend of `legs`.
    ///
    /// # Arguments
    /// * `legs` - Collateral outputs to consume, one input each, in order
    /// * `payouts` - Either one payout, or one payout per leg
    /// * `bounds` - Upper-bound unlock data per leg, used to size the fee
    /// * `locktime` - Transaction locktime required by the spent branch
    /// * `fee_rate` - sat/vB
    ///
    /// # Returns
    /// The unsigned spend, or [`CollateralError::FeeExceedsValue`] when the
    /// fee leaves nothing to pay out
    pub fn build(
        &self,
        legs: Vec<CollateralLeg>,
        payouts: &[Payout],
        bounds: &[UnlockData],
        locktime: u32,
        fee_rate: u64,
    ) -> CollateralResult<UnsignedSpend> {
        if legs.is_empty() {
            return Err(CollateralError::transaction("No collateral outputs to spend"));
        }
        if payouts.len() != 1 && payouts.len() != legs.len() {
            return Err(CollateralError::config(format!(
                "Expected 1 or {} payouts, got {}",
                legs.len(),
                payouts.len()
            )));
        }

        let total_in = legs
            .iter()
            .try_fold(Amount::ZERO, |acc, l| acc.checked_add(l.output.value))
            .ok_or_else(|| CollateralError::transaction("Input value overflowed"))?;
        let vsize = self.estimate_vsize(&legs, payouts, bounds)?;
        let fee = vsize
            .checked_mul(fee_rate)
            .map(Amount::from_sat)
            .ok_or_else(|| CollateralError::transaction("Fee computation overflowed"))?;

        let values: Vec<Amount> = if payouts.len() == 1 {
            let value = match payouts[0].value {
                Some(value) => value,
                None => total_in
                    .checked_sub(fee)
                    .filter(|v| *v > Amount::ZERO)
                    .ok_or(CollateralError::FeeExceedsValue {
                        fee: fee.to_sat(),
                        available: total_in.to_sat(),
                    })?,
            };
            vec![value]
        } else {
            let n = legs.len() as u64;
            let share = fee.to_sat() / n;
            legs.iter()
                .zip(payouts)
                .enumerate()
                .map(|(i, (leg, payout))| {
                    if let Some(value) = payout.value {
                        return Ok(value);
                    }
                    // The last output absorbs the rounding remainder.
                    let share = if i as u64 == n - 1 {
                        fee.to_sat() - share * (n - 1)
                    } else {
                        share
                    };
                    leg.output
                        .value
                        .checked_sub(Amount::from_sat(share))
                        .filter(|v| *v > Amount::ZERO)
                        .ok_or(CollateralError::FeeExceedsValue {
                            fee: share,
                            available: leg.output.value.to_sat(),
                        })
                })
                .collect::<CollateralResult<_>>()?
        };

        for (payout, value) in payouts.iter().zip(&values) {
            let minimum = payout.address.script_pubkey().minimal_non_dust();
            if *value < minimum {
                return Err(CollateralError::DustOutput {
                    value: value.to_sat(),
                    minimum: minimum.to_sat(),
                });
            }
        }

        let total_out = values
            .iter()
            .try_fold(Amount::ZERO, |acc, v| acc.checked_add(*v))
            .ok_or_else(|| CollateralError::transaction("Output value overflowed"))?;
        let actual_fee = total_in.checked_sub(total_out).ok_or_else(|| {
            CollateralError::transaction(format!(
                "Outputs of {} exceed inputs of {}",
                total_out, total_in
            ))
        })?;
        // Explicit values may leave less than the rate needs.
        if actual_fee < fee {
            return Err(CollateralError::FeeBelowRate {
                fee: actual_fee.to_sat(),
                vsize,
                fee_rate,
            });
        }

        let tx = skeleton(&legs, payouts, &values, locktime);

        debug!(
            "Built spend of {} collateral inputs ({}), fee {} for at most {} vB at {} sat/vB, locktime {}",
            legs.len(),
            total_in,
            actual_fee,
            vsize,
            fee_rate,
            locktime
        );

        Ok(UnsignedSpend {
            tx,
            legs,
            fee: actual_fee,
            fee_rate,
        })
    }

    /// Attach unlock data to every input and return the broadcastable
    /// transaction.
    pub fn finalize(&self, spend: UnsignedSpend, unlocks: &[UnlockData]) -> CollateralResult<Transaction> {
        if unlocks.len() != spend.legs.len() {
            return Err(CollateralError::transaction(format!(
                "Expected unlock data for {} inputs, got {}",
                spend.legs.len(),
                unlocks.len()
            )));
        }

        let mut tx = spend.tx;
        for (index, (leg, unlock)) in spend.legs.iter().zip(unlocks).enumerate() {
            finalize_input(&mut tx, index, leg, unlock)?;
        }

        check_fee_rate(&tx, spend.fee, spend.fee_rate)?;
        Ok(tx)
    }
}

/// Set the scriptSig and witness of input `index`.
pub fn finalize_input(
    tx: &mut Transaction,
    index: usize,
    leg: &CollateralLeg,
    unlock: &UnlockData,
) -> CollateralResult<()> {
    let input = tx
        .input
        .get_mut(index)
        .ok_or_else(|| CollateralError::transaction(format!("No input at index {}", index)))?;

    match leg.output.kind {
        PaymentKind::P2wsh | PaymentKind::P2shP2wsh => {
            let mut witness = Witness::new();
            for item in unlock.witness_items() {
                witness.push(item);
            }
            witness.push(leg.redeem_script.as_bytes());
            input.witness = witness;

            if leg.output.kind == PaymentKind::P2shP2wsh {
                // The P2SH wrapper is opened by pushing the witness program.
                let program = push_bytes(leg.variants.witness_program().as_bytes())?;
                input.script_sig = Builder::new().push_slice(program).into_script();
            }
        }
        PaymentKind::P2sh => {
            let redeem = push_bytes(leg.redeem_script.as_bytes())?;
            input.script_sig = unlock.push_to(Builder::new())?.push_slice(redeem).into_script();
        }
    }
    Ok(())
}

fn push_bytes(data: &[u8]) -> CollateralResult<&PushBytes> {
    data.try_into()
        .map_err(|_| CollateralError::transaction("Script too large for a push"))
}

fn skeleton(legs: &[CollateralLeg], payouts: &[Payout], values: &[Amount], locktime: u32) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::from_consensus(locktime),
        input: legs
            .iter()
            .map(|leg| TxIn {
                previous_output: leg.output.outpoint,
                script_sig: ScriptBuf::new(),
                // Non-final so that the locktime is enforced
                sequence: Sequence::ZERO,
                witness: Witness::new(),
            })
            .collect(),
        output: payouts
            .iter()
            .zip(values)
            .map(|(payout, value)| TxOut {
                value: *value,
                script_pubkey: payout.address.script_pubkey(),
            })
            .collect(),
    }
}

fn check_fee_rate(tx: &Transaction, fee: Amount, fee_rate: u64) -> CollateralResult<()> {
    let vsize = tx.vsize() as u64;
    let required = vsize.saturating_mul(fee_rate);
    if fee.to_sat() < required {
        return Err(CollateralError::FeeBelowRate {
            fee: fee.to_sat(),
            vsize,
            fee_rate,
        });
    }
    debug!(
        "Spend {} is {} vB, effective fee rate {} sat/vB",
        tx.compute_txid(),
        vsize,
        fee.to_sat() / vsize.max(1)
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collateral::fixtures::Fixture;
    use crate::collateral::template::{Authority, Variant};
    use crate::collateral::unlock::Authorization;
    use bitcoin::Network;

    fn payout(fixture: &Fixture) -> Address {
        fixture.address_of(fixture.borrower.pubkey, Network::Regtest)
    }

    fn bounds(n: usize) -> Vec<UnlockData> {
        vec![UnlockData::placeholder(Authority::Multisig, &[], &[true]); n]
    }

    #[test]
    fn test_single_output_accounts_for_every_sat() {
        let fixture = Fixture::new(Variant::default());
        let legs = vec![
            fixture.funded_leg(Leg::Refundable, PaymentKind::P2wsh, Amount::from_sat(500_000)).1,
            fixture.funded_leg(Leg::Seizable, PaymentKind::P2wsh, Amount::from_sat(1_000_000)).1,
        ];
        let assembler = TransactionAssembler::default();
        let spend = assembler
            .build(legs, &[Payout::to(payout(&fixture))], &bounds(2), 0, 10)
            .unwrap();

        assert_eq!(spend.tx.input.len(), 2);
        assert_eq!(spend.tx.output.len(), 1);
        assert_eq!(
            spend.tx.output[0].value + spend.fee,
            Amount::from_sat(1_500_000)
        );
        assert!(spend.tx.input.iter().all(|i| i.sequence == Sequence::ZERO));
        assert_eq!(spend.tx.lock_time, LockTime::ZERO);

        // Finalized with the bounds themselves, the spend pays exactly its rate.
        let fee = spend.fee;
        let tx = assembler.finalize(spend, &bounds(2)).unwrap();
        let vsize = (tx.vsize() as u64).max(203 + 161);
        assert_eq!(fee, Amount::from_sat(vsize * 10));
    }

    #[test]
    fn test_two_input_spend_meets_requested_rate() {
        let fixture = Fixture::new(Variant::default());
        for kind in [PaymentKind::P2wsh, PaymentKind::P2shP2wsh, PaymentKind::P2sh] {
            let legs = vec![
                fixture.funded_leg(Leg::Refundable, kind, Amount::from_sat(500_000)).1,
                fixture.funded_leg(Leg::Seizable, kind, Amount::from_sat(1_000_000)).1,
            ];
            let assembler = TransactionAssembler::default();
            let spend = assembler
                .build(legs, &[Payout::to(payout(&fixture))], &bounds(2), 0, 1)
                .unwrap();
            let fee = spend.fee.to_sat();
            let heuristic = assembler
                .policy()
                .estimated_size(kind.is_segwit(), 2, 1);

            let tx = assembler.finalize(spend, &bounds(2)).unwrap();
            assert!(fee >= tx.vsize() as u64, "{:?} pays {} for {} vB", kind, fee, tx.vsize());
            assert!(fee >= heuristic);
        }
    }

    #[test]
    fn test_legacy_spend_locktime() {
        let fixture = Fixture::new(Variant::default());
        let legs = vec![
            fixture.funded_leg(Leg::Refundable, PaymentKind::P2sh, Amount::from_sat(200_000)).1,
        ];
        let locktime = fixture.params.expirations.liquidation;
        let assembler = TransactionAssembler::default();
        let expected = assembler
            .estimate_fee(&legs, &[Payout::to(payout(&fixture))], &bounds(1), 2)
            .unwrap();
        let spend = assembler
            .build(legs, &[Payout::to(payout(&fixture))], &bounds(1), locktime, 2)
            .unwrap();

        assert_eq!(spend.fee, expected);
        assert!(spend.fee.to_sat() > (148 + 34 + 10) * 2);
        assert_eq!(spend.tx.lock_time.to_consensus_u32(), locktime);
    }

    #[test]
    fn test_split_outputs_share_the_fee() {
        let fixture = Fixture::new(Variant::default());
        let legs = vec![
            fixture.funded_leg(Leg::Refundable, PaymentKind::P2wsh, Amount::from_sat(300_001)).1,
            fixture.funded_leg(Leg::Seizable, PaymentKind::P2wsh, Amount::from_sat(700_000)).1,
        ];
        let to_borrower = payout(&fixture);
        let to_lender = fixture.address_of(fixture.lender.pubkey, Network::Regtest);
        let payouts = [Payout::to(to_borrower), Payout::to(to_lender)];
        let assembler = TransactionAssembler::default();
        let fee = assembler
            .estimate_fee(&legs, &payouts, &bounds(2), 3)
            .unwrap()
            .to_sat();
        let spend = assembler.build(legs, &payouts, &bounds(2), 0, 3).unwrap();

        assert_eq!(spend.tx.output[0].value.to_sat(), 300_001 - fee / 2);
        assert_eq!(spend.tx.output[1].value.to_sat(), 700_000 - (fee - fee / 2));
        assert_eq!(spend.fee.to_sat(), fee);
    }

    #[test]
    fn test_explicit_values_are_kept() {
        let fixture = Fixture::new(Variant::default());
        let legs = vec![
            fixture.funded_leg(Leg::Refundable, PaymentKind::P2wsh, Amount::from_sat(300_000)).1,
            fixture.funded_leg(Leg::Seizable, PaymentKind::P2wsh, Amount::from_sat(700_000)).1,
        ];
        let payouts = [
            Payout::with_value(payout(&fixture), Amount::from_sat(250_000)),
            Payout::to(payout(&fixture)),
        ];
        let assembler = TransactionAssembler::default();
        let fee = assembler
            .estimate_fee(&legs, &payouts, &bounds(2), 1)
            .unwrap()
            .to_sat();
        let spend = assembler.build(legs, &payouts, &bounds(2), 0, 1).unwrap();
        assert_eq!(spend.tx.output[0].value.to_sat(), 250_000);
        assert_eq!(spend.fee.to_sat(), 50_000 + fee - fee / 2);
    }

    #[test]
    fn test_explicit_value_leaving_short_fee_is_rejected() {
        let fixture = Fixture::new(Variant::default());
        let legs = vec![
            fixture.funded_leg(Leg::Refundable, PaymentKind::P2wsh, Amount::from_sat(300_000)).1,
        ];
        let err = TransactionAssembler::default()
            .build(
                legs,
                &[Payout::with_value(payout(&fixture), Amount::from_sat(299_990))],
                &bounds(1),
                0,
                5,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            CollateralError::FeeBelowRate {
                fee: 10,
                fee_rate: 5,
                ..
            }
        ));
    }

    #[test]
    fn test_dust_outputs_are_rejected() {
        let fixture = Fixture::new(Variant::default());
        let legs = vec![
            fixture.funded_leg(Leg::Refundable, PaymentKind::P2wsh, Amount::from_sat(300_000)).1,
            fixture.funded_leg(Leg::Seizable, PaymentKind::P2wsh, Amount::from_sat(300_000)).1,
        ];
        let to = payout(&fixture);
        let err = TransactionAssembler::default()
            .build(
                legs.clone(),
                &[Payout::with_value(to.clone(), Amount::from_sat(100)), Payout::to(to.clone())],
                &bounds(2),
                0,
                1,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            CollateralError::DustOutput {
                value: 100,
                minimum: 294
            }
        ));

        // A computed remainder below dust is refused as well
        let assembler = TransactionAssembler::default();
        let fee = assembler
            .estimate_fee(&legs[..1], &[Payout::to(to.clone())], &bounds(1), 1)
            .unwrap();
        let leg = fixture
            .funded_leg(Leg::Refundable, PaymentKind::P2wsh, fee + Amount::from_sat(100))
            .1;
        let err = assembler
            .build(vec![leg], &[Payout::to(to)], &bounds(1), 0, 1)
            .unwrap_err();
        assert!(matches!(err, CollateralError::DustOutput { value: 100, .. }));
    }

    #[test]
    fn test_fee_exceeding_value_is_rejected() {
        let fixture = Fixture::new(Variant::default());
        let legs = vec![
            fixture.funded_leg(Leg::Refundable, PaymentKind::P2wsh, Amount::from_sat(1_000)).1,
        ];
        let assembler = TransactionAssembler::default();
        let err = assembler
            .build(legs.clone(), &[Payout::to(payout(&fixture))], &bounds(1), 0, 5)
            .unwrap_err();
        assert!(matches!(
            err,
            CollateralError::FeeExceedsValue {
                available: 1_000,
                ..
            }
        ));

        // exactly zero left is rejected too
        let fee = assembler
            .estimate_fee(&legs, &[Payout::to(payout(&fixture))], &bounds(1), 5)
            .unwrap();
        let legs = vec![fixture.funded_leg(Leg::Refundable, PaymentKind::P2wsh, fee).1];
        let err = assembler
            .build(legs, &[Payout::to(payout(&fixture))], &bounds(1), 0, 5)
            .unwrap_err();
        assert!(matches!(err, CollateralError::FeeExceedsValue { .. }));
    }

    #[test]
    fn test_payout_and_bound_counts_must_match() {
        let fixture = Fixture::new(Variant::default());
        let legs = vec![
            fixture.funded_leg(Leg::Refundable, PaymentKind::P2wsh, Amount::from_sat(100_000)).1,
        ];
        let to = payout(&fixture);
        let err = TransactionAssembler::default()
            .build(legs.clone(), &[Payout::to(to.clone()), Payout::to(to.clone())], &bounds(1), 0, 1)
            .unwrap_err();
        assert!(matches!(err, CollateralError::Configuration { .. }));

        let err = TransactionAssembler::default()
            .build(legs, &[Payout::to(to)], &[], 0, 1)
            .unwrap_err();
        assert!(matches!(err, CollateralError::Transaction { .. }));
    }

    #[test]
    fn test_finalize_rejects_spend_below_its_rate() {
        let fixture = Fixture::new(Variant::default());
        let (_, leg) = fixture.funded_leg(Leg::Refundable, PaymentKind::P2wsh, Amount::from_sat(100_000));
        let assembler = TransactionAssembler::default();
        let mut spend = assembler
            .build(vec![leg], &[Payout::to(payout(&fixture))], &bounds(1), 0, 1)
            .unwrap();
        spend.fee_rate = 50;

        let err = assembler.finalize(spend, &bounds(1)).unwrap_err();
        assert!(matches!(err, CollateralError::FeeBelowRate { fee_rate: 50, .. }));
    }

    #[test]
    fn test_finalize_wrapped_segwit_pushes_witness_program() {
        let fixture = Fixture::new(Variant::default());
        let (_, leg) = fixture.funded_leg(Leg::Refundable, PaymentKind::P2shP2wsh, Amount::from_sat(100_000));
        let program = leg.variants.witness_program().to_owned();
        let redeem = leg.redeem_script.clone();
        let assembler = TransactionAssembler::default();
        let spend = assembler
            .build(vec![leg], &[Payout::to(payout(&fixture))], &bounds(1), 0, 1)
            .unwrap();

        let unlock = UnlockData::compile(&Authorization::Multisig(vec![]), &[], &[true]);
        let tx = assembler.finalize(spend, &[unlock]).unwrap();
        let input = &tx.input[0];
        assert_eq!(input.witness.last().unwrap(), redeem.as_bytes());
        assert_eq!(&input.script_sig.as_bytes()[1..], program.as_bytes());
        assert_eq!(input.script_sig.as_bytes()[0] as usize, program.len());
    }

    #[test]
    fn test_finalize_p2sh_ends_with_redeem_script() {
        let fixture = Fixture::new(Variant::default());
        let (_, leg) = fixture.funded_leg(Leg::Seizable, PaymentKind::P2sh, Amount::from_sat(100_000));
        let redeem = leg.redeem_script.clone();
        let assembler = TransactionAssembler::default();
        let spend = assembler
            .build(vec![leg], &[Payout::to(payout(&fixture))], &bounds(1), 0, 1)
            .unwrap();
        let unlock = UnlockData::compile(&Authorization::Multisig(vec![]), &[], &[false, false, false]);
        let tx = assembler.finalize(spend, &[unlock]).unwrap();
        assert!(tx.input[0].witness.is_empty());
        assert!(tx.input[0].script_sig.as_bytes().ends_with(redeem.as_bytes()));
    }
}
