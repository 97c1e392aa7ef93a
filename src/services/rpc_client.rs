use super::{Broadcaster, ChainReader, FeeOracle, Funder};
use crate::config::{env as config_env, network};
use crate::error::{CollateralError, CollateralResult};
use crate::utils::{retry, txid};
use async_trait::async_trait;
use bitcoin::{Address, Amount, Transaction, Txid};
use bitcoincore_rpc::{jsonrpc, Auth, Client, RpcApi};
use log::{debug, info, warn};
use serde_json::{Map, Value};
use std::env;
use std::sync::Arc;
use tokio::task;

/// Entries of wallet history searched for payments to an address
const WALLET_HISTORY_DEPTH: u64 = 1000;

/// Bitcoin Core wallet node.
///
/// `bitcoincore_rpc` blocks on every request, so calls run on tokio's
/// blocking pool through [`call_blocking`](Self::call_blocking).
#[derive(Debug, Clone)]
pub struct BitcoinRpcClient {
    client: Arc<Client>,
    wallet_name: String,
}

impl BitcoinRpcClient {
    /// Create a new RPC client with configuration from environment or defaults
    pub fn new() -> CollateralResult<Self> {
        // Load environment variables
        dotenv::dotenv().ok();

        let rpc_url = env::var(config_env::RPC_URL)
            .unwrap_or_else(|_| network::DEFAULT_RPC_HOST.to_string());
        let rpc_port = env::var(config_env::RPC_PORT)
            .unwrap_or_else(|_| network::DEFAULT_RPC_PORT.to_string());
        let rpc_user = env::var(config_env::RPC_USER)
            .unwrap_or_else(|_| network::DEFAULT_RPC_USER.to_string());
        let rpc_password = env::var(config_env::RPC_PASSWORD)
            .unwrap_or_else(|_| network::DEFAULT_RPC_PASSWORD.to_string());
        let wallet_name = env::var(config_env::RPC_WALLET)
            .unwrap_or_else(|_| network::DEFAULT_WALLET_NAME.to_string());

        Self::connect(&rpc_url, &rpc_port, rpc_user, rpc_password, wallet_name)
    }

    /// Client for the wallet `wallet_name` on `host:port`. Nothing is sent
    /// until the first call.
    pub fn connect(
        host: &str,
        port: &str,
        user: String,
        password: String,
        wallet_name: String,
    ) -> CollateralResult<Self> {
        let auth = Auth::UserPass(user, password);
        let url = format!("http://{}:{}/wallet/{}", host, port, wallet_name);

        let client = Client::new(&url, auth)?;
        info!("Using wallet {} at {}:{}", wallet_name, host, port);

        Ok(BitcoinRpcClient {
            client: Arc::new(client),
            wallet_name,
        })
    }

    pub fn get_wallet_name(&self) -> &str {
        &self.wallet_name
    }

    /// Run `call` against the node on the blocking thread pool.
    pub(crate) async fn call_blocking<T, F>(&self, call: F) -> CollateralResult<T>
    where
        F: FnOnce(&Client) -> CollateralResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let client = Arc::clone(&self.client);
        task::spawn_blocking(move || call(&*client))
            .await
            .map_err(|e| CollateralError::operation("rpc", format!("RPC task failed: {}", e)))?
    }

    /// Get a raw transaction with verbose information
    pub async fn get_raw_transaction_verbose(&self, txid: &Txid) -> CollateralResult<Value> {
        let txid = *txid;
        self.call_blocking(move |client| {
            Ok(client.call::<Value>("getrawtransaction", &[txid.to_string().into(), true.into()])?)
        })
        .await
    }

    /// Get the number of confirmations for a transaction
    pub async fn get_confirmations(&self, txid: &Txid) -> CollateralResult<u32> {
        match self.get_raw_transaction_verbose(txid).await {
            Ok(tx_info) => Ok(tx_info["confirmations"].as_u64().unwrap_or(0) as u32),
            Err(_) => Ok(0), // Transaction not found means 0 confirmations
        }
    }

    /// Scan the UTXO set for outputs paying `address`. Only confirmed
    /// outputs are visible to `scantxoutset`.
    pub async fn scan_utxos_for_address(&self, address: &str) -> CollateralResult<Vec<Value>> {
        let scanobject = format!("addr({})", address);
        let result: Value = self
            .call_blocking(move |client| {
                Ok(client.call(
                    "scantxoutset",
                    &[
                        Value::String("start".to_string()),
                        Value::Array(vec![Value::String(scanobject)]),
                    ],
                )?)
            })
            .await?;

        if let Some(unspents) = result["unspents"].as_array() {
            Ok(unspents.clone())
        } else {
            Ok(vec![])
        }
    }

    /// Recent wallet history, watch-only and unconfirmed entries included.
    pub async fn wallet_transactions(&self) -> CollateralResult<Vec<Value>> {
        let result: Value = self
            .call_blocking(|client| {
                Ok(client.call(
                    "listtransactions",
                    &["*".into(), WALLET_HISTORY_DEPTH.into(), 0.into(), true.into()],
                )?)
            })
            .await?;
        Ok(result.as_array().cloned().unwrap_or_default())
    }
}

/// Txids of wallet history entries paying to `address`, skipping
/// conflicted transactions.
fn wallet_txids(entries: &[Value], address: &str) -> CollateralResult<Vec<Txid>> {
    let mut txids = Vec::new();
    for entry in entries {
        if entry["address"].as_str() != Some(address) {
            continue;
        }
        if entry["confirmations"].as_i64().is_some_and(|c| c < 0) {
            continue;
        }
        if let Some(id) = entry["txid"].as_str() {
            let id = txid::parse(id)?;
            if !txids.contains(&id) {
                txids.push(id);
            }
        }
    }
    Ok(txids)
}

#[async_trait]
impl ChainReader for BitcoinRpcClient {
    async fn get_transaction(&self, txid: &Txid) -> CollateralResult<Transaction> {
        let txid = *txid;
        self.call_blocking(move |client| Ok(client.get_raw_transaction(&txid, None)?))
            .await
    }

    /// Confirmed outputs from the UTXO set, then wallet history, which also
    /// covers mempool transactions the wallet sent or watches. Unconfirmed
    /// payments from outside the wallet only show up once confirmed.
    async fn address_transactions(&self, address: &Address) -> CollateralResult<Vec<Txid>> {
        let address = address.to_string();
        let mut txids = Vec::new();
        for utxo in self.scan_utxos_for_address(&address).await? {
            if let Some(id) = utxo["txid"].as_str() {
                let id = txid::parse(id)?;
                if !txids.contains(&id) {
                    txids.push(id);
                }
            }
        }

        match self.wallet_transactions().await {
            Ok(entries) => {
                for id in wallet_txids(&entries, &address)? {
                    if !txids.contains(&id) {
                        txids.push(id);
                    }
                }
            }
            Err(e) => warn!("Wallet history unavailable, using confirmed outputs only: {}", e),
        }
        Ok(txids)
    }
}

#[async_trait]
impl Broadcaster for BitcoinRpcClient {
    async fn broadcast(&self, tx: &Transaction) -> CollateralResult<Txid> {
        let txid = retry::with_backoff(|| {
            let tx = tx.clone();
            self.call_blocking(move |client| {
                client.send_raw_transaction(&tx).map_err(|e| match e {
                    // The node looked at the transaction and refused it:
                    // retrying cannot help.
                    bitcoincore_rpc::Error::JsonRpc(jsonrpc::Error::Rpc(rejection)) => {
                        CollateralError::transaction(format!(
                            "Node rejected {}: {}",
                            tx.compute_txid(),
                            rejection.message
                        ))
                    }
                    other => CollateralError::from(other),
                })
            })
        })
        .await?;
        info!("Broadcast {}", txid);
        Ok(txid)
    }
}

#[async_trait]
impl FeeOracle for BitcoinRpcClient {
    async fn fee_rate(&self) -> CollateralResult<u64> {
        let estimate = self
            .call_blocking(|client| Ok(client.estimate_smart_fee(6, None)?))
            .await?;
        let per_kvb = estimate.fee_rate.ok_or_else(|| {
            CollateralError::operation(
                "estimatesmartfee",
                estimate
                    .errors
                    .map(|e| e.join("; "))
                    .unwrap_or_else(|| "no estimate".to_string()),
            )
        })?;
        let rate = per_kvb.to_sat().div_ceil(1000).max(1);
        debug!("Node fee estimate: {} sat/vB", rate);
        Ok(rate)
    }
}

#[async_trait]
impl Funder for BitcoinRpcClient {
    async fn send_to_address(&self, address: &Address, amount: Amount) -> CollateralResult<Txid> {
        let params: [Value; 2] = [address.to_string().into(), amount.to_btc().into()];
        let result = self
            .call_blocking(move |client| Ok(client.call::<String>("sendtoaddress", &params)?))
            .await?;
        txid::parse(&result)
    }

    async fn send_many(&self, outputs: &[(Address, Amount)]) -> CollateralResult<Txid> {
        let mut amounts = Map::new();
        for (address, amount) in outputs {
            if amounts
                .insert(address.to_string(), amount.to_btc().into())
                .is_some()
            {
                return Err(CollateralError::config(format!(
                    "Address {} appears twice in one batch send",
                    address
                )));
            }
        }
        let result = self
            .call_blocking(move |client| {
                Ok(client.call::<String>("sendmany", &["".into(), Value::Object(amounts)])?)
            })
            .await?;
        txid::parse(&result)
    }
}
