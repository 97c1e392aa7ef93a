//! # Services Module
//!
//! Collaborators a [`CollateralProvider`](crate::collateral::CollateralProvider)
//! talks to. Each concern is a narrow async trait so that a node, an explorer
//! and a key store can be mixed freely.
//!
//! ## Components
//!
//! - **RPC Client**: Bitcoin Core wallet node, implements every chain trait
//! - **Explorer Client**: Esplora HTTP API for reads, fee estimates and broadcast
//! - **Signers**: in-memory [`KeyStore`] and the node wallet's [`RpcWalletSigner`]

use crate::collateral::SigningRequest;
use crate::error::CollateralResult;
use async_trait::async_trait;
use bitcoin::secp256k1::{ecdsa::Signature, Message};
use bitcoin::{Address, Amount, PublicKey, Transaction, Txid};

pub mod explorer_client;
#[cfg(test)]
pub mod memory;
pub mod rpc_client;
pub mod signer;

pub use explorer_client::EsploraClient;
pub use rpc_client::BitcoinRpcClient;
pub use signer::{KeyStore, RpcWalletSigner};

/// Read access to transactions.
#[async_trait]
pub trait ChainReader: Send + Sync {
    /// Fetch and decode a transaction by id.
    async fn get_transaction(&self, txid: &Txid) -> CollateralResult<Transaction>;

    /// Ids of transactions paying to `address`. Confirmed payments are
    /// always reported; mempool coverage depends on what the backend indexes.
    async fn address_transactions(&self, address: &Address) -> CollateralResult<Vec<Txid>>;
}

/// Relays finalized transactions.
#[async_trait]
pub trait Broadcaster: Send + Sync {
    async fn broadcast(&self, tx: &Transaction) -> CollateralResult<Txid>;
}

/// Current fee-rate estimate.
#[async_trait]
pub trait FeeOracle: Send + Sync {
    /// sat/vB
    async fn fee_rate(&self) -> CollateralResult<u64>;
}

/// Wallet that funds collateral addresses.
#[async_trait]
pub trait Funder: Send + Sync {
    async fn send_to_address(&self, address: &Address, amount: Amount) -> CollateralResult<Txid>;

    /// One transaction paying every `(address, amount)` pair.
    async fn send_many(&self, outputs: &[(Address, Amount)]) -> CollateralResult<Txid>;
}

/// Produces ECDSA signatures over digests computed by the caller.
#[async_trait]
pub trait Signer: Send + Sync {
    async fn sign(&self, pubkey: &PublicKey, message: &Message) -> CollateralResult<Signature>;

    /// Sign several inputs at once, in request order.
    async fn sign_batch(&self, requests: &[SigningRequest]) -> CollateralResult<Vec<Signature>> {
        let mut signatures = Vec::with_capacity(requests.len());
        for request in requests {
            signatures.push(self.sign(&request.pubkey, &request.message).await?);
        }
        Ok(signatures)
    }
}
