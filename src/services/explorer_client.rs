use super::{Broadcaster, ChainReader, FeeOracle};
use crate::config::env as config_env;
use crate::config::network::{EXPLORER_API_BASE, REQUEST_TIMEOUT};
use crate::error::{CollateralError, CollateralResult, NetworkError};
use crate::utils::txid;
use async_trait::async_trait;
use bitcoin::{consensus, Address, Transaction, Txid};
use log::debug;
use reqwest::{Client, Response};
use serde::Deserialize;
use std::collections::HashMap;

/// Confirmation target used for fee estimates, in blocks
const FEE_TARGET: &str = "6";

/// Transaction entry of the address history API
#[derive(Debug, Deserialize)]
pub struct AddressTx {
    pub txid: Txid,
    pub status: TxStatus,
}

/// Confirmation status of a transaction
#[derive(Debug, Deserialize)]
pub struct TxStatus {
    pub confirmed: bool,
    #[serde(default)]
    pub block_height: Option<u64>,
}

/// Client for an Esplora-compatible block explorer API
#[derive(Debug, Clone)]
pub struct EsploraClient {
    client: Client,
    api_base: String,
}

impl EsploraClient {
    /// Create a new explorer client, honouring the `EXPLORER_URL` override
    pub fn new() -> CollateralResult<Self> {
        dotenv::dotenv().ok();
        let api_base =
            std::env::var(config_env::EXPLORER_URL).unwrap_or_else(|_| EXPLORER_API_BASE.to_string());
        Self::with_base(&api_base)
    }

    pub fn with_base(api_base: &str) -> CollateralResult<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| CollateralError::operation("client_creation", e.to_string()))?;

        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.api_base, path)
    }

    async fn check(response: Response) -> CollateralResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(NetworkError::HttpError {
            status: status.as_u16(),
            message,
        }
        .into())
    }

    async fn get_text(&self, path: &str) -> CollateralResult<String> {
        let response = self.client.get(self.url(path)).send().await?;
        Ok(Self::check(response).await?.text().await?)
    }

    /// Confirmed and mempool transactions touching an address
    pub async fn get_address_txs(&self, address: &str) -> CollateralResult<Vec<AddressTx>> {
        let response = self
            .client
            .get(self.url(&format!("address/{}/txs", address)))
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    /// Fee estimates in sat/vB keyed by confirmation target
    pub async fn get_fee_estimates(&self) -> CollateralResult<HashMap<String, f64>> {
        let response = self.client.get(self.url("fee-estimates")).send().await?;
        Ok(Self::check(response).await?.json().await?)
    }
}

#[async_trait]
impl ChainReader for EsploraClient {
    async fn get_transaction(&self, txid: &Txid) -> CollateralResult<Transaction> {
        let raw = self.get_text(&format!("tx/{}/hex", txid)).await?;
        let bytes = hex::decode(raw.trim()).map_err(|e| NetworkError::InvalidResponse {
            message: format!("transaction hex: {}", e),
        })?;
        consensus::deserialize(&bytes).map_err(|e| {
            NetworkError::InvalidResponse {
                message: format!("transaction {}: {}", txid, e),
            }
            .into()
        })
    }

    async fn address_transactions(&self, address: &Address) -> CollateralResult<Vec<Txid>> {
        let txs = self.get_address_txs(&address.to_string()).await?;
        debug!(
            "{} has {} transactions ({} unconfirmed)",
            address,
            txs.len(),
            txs.iter().filter(|t| !t.status.confirmed).count()
        );
        Ok(txs.into_iter().map(|t| t.txid).collect())
    }
}

#[async_trait]
impl FeeOracle for EsploraClient {
    async fn fee_rate(&self) -> CollateralResult<u64> {
        let estimates = self.get_fee_estimates().await?;
        let rate = estimates
            .get(FEE_TARGET)
            .copied()
            .or_else(|| estimates.values().copied().reduce(f64::min))
            .ok_or_else(|| NetworkError::InvalidResponse {
                message: "empty fee estimates".to_string(),
            })?;
        Ok((rate.ceil() as u64).max(1))
    }
}

#[async_trait]
impl Broadcaster for EsploraClient {
    async fn broadcast(&self, tx: &Transaction) -> CollateralResult<Txid> {
        let response = self
            .client
            .post(self.url("tx"))
            .body(consensus::encode::serialize_hex(tx))
            .send()
            .await?;
        let body = Self::check(response).await?.text().await?;
        txid::parse(body.trim())
    }
}
