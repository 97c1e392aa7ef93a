//! In-memory chain backend for provider tests.

use super::{Broadcaster, ChainReader, FeeOracle, Funder};
use crate::error::{CollateralError, CollateralResult};
use async_trait::async_trait;
use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::transaction::Version;
use bitcoin::{
    Address, Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct State {
    transactions: HashMap<Txid, Transaction>,
    broadcast: Vec<Transaction>,
    funded: u32,
}

/// Transactions known to a fake node, shared between clones.
#[derive(Debug, Clone, Default)]
pub struct MemoryChain {
    state: Arc<RwLock<State>>,
    fee_rate: Option<u64>,
}

impl MemoryChain {
    /// A chain whose fee oracle answers `fee_rate`, or fails when `None`.
    pub fn new(fee_rate: Option<u64>) -> Self {
        Self {
            state: Arc::default(),
            fee_rate,
        }
    }

    pub async fn insert(&self, tx: Transaction) -> Txid {
        let txid = tx.compute_txid();
        self.state.write().await.transactions.insert(txid, tx);
        txid
    }

    /// Transactions handed to [`Broadcaster::broadcast`], oldest first.
    pub async fn broadcasted(&self) -> Vec<Transaction> {
        self.state.read().await.broadcast.clone()
    }

    async fn fund(&self, outputs: &[(Address, Amount)]) -> Txid {
        let mut state = self.state.write().await;
        state.funded += 1;
        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::new(Txid::all_zeros(), state.funded),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: outputs
                .iter()
                .map(|(address, value)| TxOut {
                    value: *value,
                    script_pubkey: address.script_pubkey(),
                })
                .collect(),
        };
        let txid = tx.compute_txid();
        state.transactions.insert(txid, tx);
        txid
    }
}

#[async_trait]
impl ChainReader for MemoryChain {
    async fn get_transaction(&self, txid: &Txid) -> CollateralResult<Transaction> {
        self.state
            .read()
            .await
            .transactions
            .get(txid)
            .cloned()
            .ok_or_else(|| CollateralError::operation("get_transaction", format!("unknown txid {}", txid)))
    }

    async fn address_transactions(&self, address: &Address) -> CollateralResult<Vec<Txid>> {
        let script = address.script_pubkey();
        Ok(self
            .state
            .read()
            .await
            .transactions
            .iter()
            .filter(|(_, tx)| tx.output.iter().any(|o| o.script_pubkey == script))
            .map(|(txid, _)| *txid)
            .collect())
    }
}

#[async_trait]
impl Broadcaster for MemoryChain {
    async fn broadcast(&self, tx: &Transaction) -> CollateralResult<Txid> {
        let mut state = self.state.write().await;
        state.broadcast.push(tx.clone());
        let txid = tx.compute_txid();
        state.transactions.insert(txid, tx.clone());
        Ok(txid)
    }
}

#[async_trait]
impl FeeOracle for MemoryChain {
    async fn fee_rate(&self) -> CollateralResult<u64> {
        self.fee_rate
            .ok_or_else(|| CollateralError::operation("fee_rate", "no estimate"))
    }
}

#[async_trait]
impl Funder for MemoryChain {
    async fn send_to_address(&self, address: &Address, amount: Amount) -> CollateralResult<Txid> {
        Ok(self.fund(&[(address.clone(), amount)]).await)
    }

    async fn send_many(&self, outputs: &[(Address, Amount)]) -> CollateralResult<Txid> {
        Ok(self.fund(outputs).await)
    }
}
