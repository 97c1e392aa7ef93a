//! # Utility Functions
//!
//! Small helpers shared by the provider, the services and the CLI.

use crate::error::{CollateralError, CollateralResult};
use bitcoin::Txid;
use std::str::FromStr;

/// Transaction ID parsing
pub mod txid {
    use super::*;

    /// Parse a transaction ID (64 hex characters)
    pub fn parse(txid: &str) -> CollateralResult<Txid> {
        if txid.len() != 64 {
            return Err(CollateralError::operation(
                "txid_validation",
                format!("Transaction ID must be 64 characters, got {}", txid.len()),
            ));
        }

        Txid::from_str(txid).map_err(|e| CollateralError::operation("txid_validation", e.to_string()))
    }

    /// Parse a list of transaction IDs, failing on the first malformed entry
    pub fn parse_all<S: AsRef<str>>(txids: &[S]) -> CollateralResult<Vec<Txid>> {
        txids.iter().map(|t| parse(t.as_ref())).collect()
    }
}

/// Amount formatting utilities
pub mod amount {
    /// Convert satoshis to BTC with 8 decimal places
    pub fn sats_to_btc(sats: u64) -> f64 {
        sats as f64 / 100_000_000.0
    }

    /// Convert BTC to satoshis
    pub fn btc_to_sats(btc: f64) -> u64 {
        (btc * 100_000_000.0).round() as u64
    }

    /// Format amount with both sats and BTC
    pub fn format_dual(sats: u64) -> String {
        format!("{} sats ({:.8} BTC)", sats, sats_to_btc(sats))
    }
}

/// Retry utilities
pub mod retry {
    use crate::config::network::{MAX_RETRY_ATTEMPTS, RETRY_DELAY};
    use crate::error::CollateralError;
    use std::future::Future;
    use tokio::time::sleep;

    /// Retry an async operation with exponential backoff while its error is
    /// retryable.
    pub async fn with_backoff<F, Fut, T>(mut operation: F) -> Result<T, CollateralError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CollateralError>>,
    {
        let mut attempts = 0;
        loop {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(error) => {
                    attempts += 1;
                    if attempts >= MAX_RETRY_ATTEMPTS || !error.is_retryable() {
                        return Err(error);
                    }

                    let delay = RETRY_DELAY * 2_u32.pow(attempts - 1);
                    log::warn!(
                        "Operation failed (attempt {}), retrying in {:?}: {}",
                        attempts,
                        delay,
                        error
                    );
                    sleep(delay).await;
                }
            }
        }
    }
}
