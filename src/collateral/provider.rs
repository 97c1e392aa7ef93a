//! # Collateral Provider
//!
//! Operations over a contract: fund the two collateral addresses, then spend
//! them through whichever branch the current period opens. Every spend takes
//! a list of funding txids and goes through the [`BatchLocator`], so one call
//! redeems any number of locks of the same contract.
//!
//! | Operation | Legs | Period | Signer |
//! |---|---|---|---|
//! | [`refund`](CollateralProvider::refund) | both | loan | borrower |
//! | [`claim`](CollateralProvider::claim) | both | loan (swap) | liquidator |
//! | [`seize`](CollateralProvider::seize) | seizable | seizure | seizable guard |
//! | [`reclaim_refundable`](CollateralProvider::reclaim_refundable) | refundable | seizure | borrower |
//! | [`refund_refundable`](CollateralProvider::refund_refundable) | refundable | last | borrower |
//! | [`refund_seizable`](CollateralProvider::refund_seizable) | seizable | last | leg guard |
//! | `multisig_*` | both | liquidation | two of three |

use crate::config::ProviderConfig;
use crate::error::{CollateralError, CollateralResult};
use crate::services::{Broadcaster, ChainReader, FeeOracle, Funder, Signer};
use bitcoin::{ecdsa, Address, Amount, PublicKey, Transaction, Txid};
use log::{debug, info, warn};
use std::collections::HashSet;
use tokio::time::{sleep, timeout};

use super::assembler::{CollateralLeg, Payout, TransactionAssembler, UnsignedSpend};
use super::locator::BatchLocator;
use super::multisig::{liquidation_bounds, MultisigSession, PartialSignatures};
use super::params::{CollateralParams, CollateralValues, Role, Secret};
use super::period::Period;
use super::sighash::signing_requests;
use super::template::{Authority, Leg, Protocol, Template};
use super::unlock::{Authorization, UnlockData};

/// Addresses the two legs are funded to under the configured script mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollateralAddresses {
    pub refundable: Address,
    pub seizable: Address,
}

impl CollateralAddresses {
    pub fn get(&self, leg: Leg) -> &Address {
        match leg {
            Leg::Refundable => &self.refundable,
            Leg::Seizable => &self.seizable,
        }
    }
}

/// Funding transactions of a two-transaction lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockReceipt {
    pub refundable: Txid,
    pub seizable: Txid,
}

impl LockReceipt {
    pub fn txids(&self) -> [Txid; 2] {
        [self.refundable, self.seizable]
    }
}

/// Collateral operations over a chain backend `B` and a signer `S`.
#[derive(Debug)]
pub struct CollateralProvider<B, S> {
    backend: B,
    signer: S,
    config: ProviderConfig,
    assembler: TransactionAssembler,
}

impl<B, S> CollateralProvider<B, S> {
    pub fn new(backend: B, signer: S, config: ProviderConfig) -> Self {
        let assembler = TransactionAssembler::new(config.fee_policy);
        Self {
            backend,
            signer,
            config,
            assembler,
        }
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn locator(&self, params: &CollateralParams) -> CollateralResult<BatchLocator> {
        BatchLocator::new(params, self.config.network)
    }

    /// Collateral addresses under the configured script mode.
    pub fn lock_addresses(&self, params: &CollateralParams) -> CollateralResult<CollateralAddresses> {
        let locator = self.locator(params)?;
        let address = |leg| {
            locator
                .script(leg)
                .variants
                .get(self.config.script_mode)
                .address
                .clone()
        };
        Ok(CollateralAddresses {
            refundable: address(Leg::Refundable),
            seizable: address(Leg::Seizable),
        })
    }

    /// Where funds released to `pubkey` are paid.
    pub fn payout_address(&self, pubkey: &PublicKey) -> CollateralResult<Address> {
        self.config.address_mode.address(pubkey, self.config.network)
    }
}

impl<B: Funder, S> CollateralProvider<B, S> {
    /// Fund each leg with its own transaction.
    pub async fn lock(
        &self,
        values: &CollateralValues,
        params: &CollateralParams,
    ) -> CollateralResult<LockReceipt> {
        let addresses = self.lock_addresses(params)?;
        let refundable = self
            .backend
            .send_to_address(&addresses.refundable, values.refundable)
            .await?;
        let seizable = self
            .backend
            .send_to_address(&addresses.seizable, values.seizable)
            .await?;
        info!(
            "Locked {} refundable in {} and {} seizable in {}",
            values.refundable, refundable, values.seizable, seizable
        );
        Ok(LockReceipt {
            refundable,
            seizable,
        })
    }

    /// Fund both legs with a single transaction.
    pub async fn lock_batch(
        &self,
        values: &CollateralValues,
        params: &CollateralParams,
    ) -> CollateralResult<Txid> {
        let addresses = self.lock_addresses(params)?;
        let txid = self
            .backend
            .send_many(&[
                (addresses.refundable, values.refundable),
                (addresses.seizable, values.seizable),
            ])
            .await?;
        info!("Locked both legs in {}", txid);
        Ok(txid)
    }
}

impl<B: ChainReader, S> CollateralProvider<B, S> {
    /// Wait for a transaction funding `leg`, polling every
    /// `poll_interval` until `find_timeout` elapses.
    pub async fn find_lock_transaction(
        &self,
        params: &CollateralParams,
        leg: Leg,
    ) -> CollateralResult<Txid> {
        let addresses = self.lock_addresses(params)?;
        let address = addresses.get(leg);
        let interval = self.config.poll_interval;

        let search = async {
            loop {
                match self.backend.address_transactions(address).await {
                    Ok(txids) => {
                        if let Some(txid) = txids.first() {
                            info!("Found {} lock {} at {}", leg, txid, address);
                            return *txid;
                        }
                        debug!("No transaction at {} yet", address);
                    }
                    Err(e) => warn!("Lookup of {} failed: {}", address, e),
                }
                sleep(interval).await;
            }
        };

        timeout(self.config.find_timeout, search)
            .await
            .map_err(|_| CollateralError::Timeout {
                what: format!("{} lock at {}", leg, address),
                seconds: self.config.find_timeout.as_secs(),
            })
    }

    async fn fetch(&self, txids: &[Txid]) -> CollateralResult<Vec<Transaction>> {
        let mut txs = Vec::with_capacity(txids.len());
        for txid in txids {
            txs.push(self.backend.get_transaction(txid).await?);
        }
        Ok(txs)
    }

    async fn locate(
        &self,
        txids: &[Txid],
        params: &CollateralParams,
        legs: &[Leg],
    ) -> CollateralResult<Vec<CollateralLeg>> {
        if txids.is_empty() {
            return Err(CollateralError::config("No funding transactions given"));
        }
        // A repeated txid would otherwise spend the same outputs twice.
        let mut seen = HashSet::with_capacity(txids.len());
        let unique: Vec<Txid> = txids.iter().copied().filter(|txid| seen.insert(*txid)).collect();
        if unique.len() < txids.len() {
            warn!("Ignoring {} repeated funding txid(s)", txids.len() - unique.len());
        }
        let txs = self.fetch(&unique).await?;
        self.locator(params)?.locate_all(&txs, legs)
    }
}

impl<B: ChainReader + FeeOracle, S> CollateralProvider<B, S> {
    async fn fee_rate(&self) -> u64 {
        match self.backend.fee_rate().await {
            Ok(rate) => rate,
            Err(e) => {
                let fallback = self.config.fee_policy.fallback_fee_rate;
                warn!("Fee estimate unavailable ({}), using {} sat/vB", e, fallback);
                fallback
            }
        }
    }

    /// Unsigned arbitration spend of every collateral output in `txids`.
    ///
    /// Inputs are ordered refundable legs first, then seizable legs. `payouts`
    /// is either one output taking everything, or one output per input in
    /// that order, so a two-leg contract can be paid into the two addresses
    /// of another contract. Co-signers must pass the same payouts and fee rate
    /// to arrive at the same transaction.
    pub async fn multisig_session(
        &self,
        txids: &[Txid],
        params: &CollateralParams,
        payouts: &[Payout],
        fee_rate: Option<u64>,
    ) -> CollateralResult<MultisigSession> {
        let mut legs = self.locate(txids, params, &Leg::BOTH).await?;
        legs.sort_by_key(|l| l.leg);
        let locktime = Template::new(params.variant, Leg::Seizable)
            .locktime(Period::Liquidation, &params.expirations)?;
        let fee_rate = match fee_rate {
            Some(rate) => rate,
            None => self.fee_rate().await,
        };
        let bounds = liquidation_bounds(params, &legs)?;
        let spend = self.assembler.build(legs, payouts, &bounds, locktime, fee_rate)?;
        MultisigSession::new(spend, params.clone())
    }
}

impl<B: ChainReader + FeeOracle + Broadcaster, S: Signer> CollateralProvider<B, S> {
    async fn sign_all(&self, spend: &UnsignedSpend, pubkey: PublicKey) -> CollateralResult<Vec<ecdsa::Signature>> {
        let requests = signing_requests(&spend.tx, &spend.legs, &vec![pubkey; spend.legs.len()])?;
        let signatures = self.signer.sign_batch(&requests).await?;
        Ok(signatures.into_iter().map(ecdsa::Signature::sighash_all).collect())
    }

    /// Build, sign and finalize a single-signature spend of `legs` through
    /// the branch of `period`.
    pub async fn build_spend(
        &self,
        txids: &[Txid],
        params: &CollateralParams,
        legs: &[Leg],
        period: Period,
        secrets: &[Secret],
    ) -> CollateralResult<Transaction> {
        let found = self.locate(txids, params, legs).await?;

        let mut guard = None;
        let mut locktime = 0;
        let mut plans = Vec::with_capacity(found.len());
        for leg in &found {
            let template = Template::new(params.variant, leg.leg);
            let branch = template.branch(period)?;
            let role = match branch.authority() {
                Authority::Single(role) => role,
                Authority::Multisig => {
                    return Err(CollateralError::config(format!(
                        "{} needs two signatures, use the multisig operations",
                        period
                    )))
                }
            };
            if guard.is_some_and(|g| g != role) {
                return Err(CollateralError::config(format!(
                    "Legs spent together in {} must be guarded by the same party",
                    period
                )));
            }
            guard = Some(role);
            locktime = locktime.max(template.locktime(period, &params.expirations)?);
            // Secrets are checked before anything is signed.
            let arranged = branch.arrange_secrets(&params.secret_hashes, secrets)?;
            plans.push((arranged, template.selector(period)?));
        }
        let role = guard.ok_or_else(|| CollateralError::transaction("No collateral outputs to spend"))?;
        let pubkey = params.keys.key(role)?;

        let fee_rate = self.fee_rate().await;
        let payout = Payout::to(self.payout_address(&pubkey)?);
        let bounds: Vec<UnlockData> = plans
            .iter()
            .map(|(secrets, selector)| UnlockData::placeholder(Authority::Single(role), secrets, selector))
            .collect();
        let spend = self.assembler.build(found, &[payout], &bounds, locktime, fee_rate)?;
        let signatures = self.sign_all(&spend, pubkey).await?;

        let unlocks: Vec<UnlockData> = signatures
            .into_iter()
            .zip(&plans)
            .map(|(signature, (secrets, selector))| {
                UnlockData::compile(&Authorization::Single { signature, pubkey }, secrets, selector)
            })
            .collect();

        debug!(
            "Signed {} input(s) for {} by {} with locktime {}",
            unlocks.len(),
            period,
            role,
            locktime
        );
        self.assembler.finalize(spend, &unlocks)
    }

    /// [`build_spend`](Self::build_spend), then broadcast.
    pub async fn spend(
        &self,
        txids: &[Txid],
        params: &CollateralParams,
        legs: &[Leg],
        period: Period,
        secrets: &[Secret],
    ) -> CollateralResult<Txid> {
        let tx = self.build_spend(txids, params, legs, period, secrets).await?;
        let txid = self.backend.broadcast(&tx).await?;
        info!("Spent {} collateral input(s) in {} ({})", tx.input.len(), txid, period);
        Ok(txid)
    }

    /// Borrower takes back both legs during the loan period by revealing
    /// one of the lender's or agent's secrets.
    pub async fn refund(&self, txids: &[Txid], params: &CollateralParams, secret: Secret) -> CollateralResult<Txid> {
        require_protocol(params, Protocol::Collateral, "refund")?;
        self.spend(txids, params, &Leg::BOTH, Period::Loan, &[secret]).await
    }

    /// Liquidator claims both legs of a swap contract with the required
    /// preimages.
    pub async fn claim(&self, txids: &[Txid], params: &CollateralParams, secrets: &[Secret]) -> CollateralResult<Txid> {
        require_protocol(params, Protocol::CollateralSwap, "claim")?;
        self.spend(txids, params, &Leg::BOTH, Period::Loan, secrets).await
    }

    /// Seizable leg to its guard once the liquidation expiration has passed.
    pub async fn seize(
        &self,
        txids: &[Txid],
        params: &CollateralParams,
        secret: Option<Secret>,
    ) -> CollateralResult<Txid> {
        let secrets: Vec<Secret> = secret.into_iter().collect();
        self.spend(txids, params, &[Leg::Seizable], Period::Seizure, &secrets)
            .await
    }

    /// Refundable leg back to the borrower in the seizure period.
    pub async fn reclaim_refundable(
        &self,
        txids: &[Txid],
        params: &CollateralParams,
        secret: Option<Secret>,
    ) -> CollateralResult<Txid> {
        let secrets: Vec<Secret> = secret.into_iter().collect();
        self.spend(txids, params, &[Leg::Refundable], Period::Seizure, &secrets)
            .await
    }

    /// Refundable leg through the final, timelock-only branch.
    pub async fn refund_refundable(&self, txids: &[Txid], params: &CollateralParams) -> CollateralResult<Txid> {
        let period = final_period(params, Leg::Refundable)?;
        self.spend(txids, params, &[Leg::Refundable], period, &[]).await
    }

    /// Seizable leg through the final, timelock-only branch.
    pub async fn refund_seizable(&self, txids: &[Txid], params: &CollateralParams) -> CollateralResult<Txid> {
        let period = final_period(params, Leg::Seizable)?;
        self.spend(txids, params, &[Leg::Seizable], period, &[]).await
    }

    /// Detached signatures of `role` over the cooperative spend to
    /// `payouts`.
    pub async fn multisig_sign(
        &self,
        txids: &[Txid],
        params: &CollateralParams,
        role: Role,
        payouts: &[Payout],
    ) -> CollateralResult<PartialSignatures> {
        let session = self.multisig_session(txids, params, payouts, None).await?;
        let pubkey = params.keys.key(role)?;
        let signatures = self.sign_all(session.spend(), pubkey).await?;
        let partial = PartialSignatures::new(role, session.spend(), &signatures);
        info!(
            "{} signed cooperative spend {} at {} sat/vB",
            role, partial.unsigned_txid, partial.fee_rate
        );
        Ok(partial)
    }

    /// Finalize a cooperative spend from two parties' signatures without
    /// broadcasting it.
    pub async fn multisig_build(
        &self,
        txids: &[Txid],
        params: &CollateralParams,
        payouts: &[Payout],
        partials: &[PartialSignatures],
        evidence: &[Secret],
    ) -> CollateralResult<Transaction> {
        let fee_rate = partials
            .first()
            .map(|p| p.fee_rate)
            .ok_or_else(|| CollateralError::signing("No partial signatures given"))?;
        if partials.iter().any(|p| p.fee_rate != fee_rate) {
            return Err(CollateralError::signing(
                "Partial signatures were made at different fee rates",
            ));
        }

        let mut session = self
            .multisig_session(txids, params, payouts, Some(fee_rate))
            .await?;
        for partial in partials {
            session.add(partial)?;
        }
        session.finalize(&self.assembler, evidence)
    }

    /// [`multisig_build`](Self::multisig_build), then broadcast.
    pub async fn multisig_send(
        &self,
        txids: &[Txid],
        params: &CollateralParams,
        payouts: &[Payout],
        partials: &[PartialSignatures],
        evidence: &[Secret],
    ) -> CollateralResult<Txid> {
        let tx = self
            .multisig_build(txids, params, payouts, partials, evidence)
            .await?;
        self.backend.broadcast(&tx).await
    }
}

fn require_protocol(params: &CollateralParams, protocol: Protocol, operation: &str) -> CollateralResult<()> {
    if params.variant.protocol != protocol {
        return Err(CollateralError::config(format!(
            "{} is not available for {:?} contracts",
            operation, params.variant.protocol
        )));
    }
    Ok(())
}

fn final_period(params: &CollateralParams, leg: Leg) -> CollateralResult<Period> {
    Template::new(params.variant, leg)
        .periods()
        .last()
        .ok_or_else(|| CollateralError::config("Template has no branches"))
}

/// Total value a contract locks.
pub fn locked_value(values: &CollateralValues) -> Amount {
    values.refundable + values.seizable
}
