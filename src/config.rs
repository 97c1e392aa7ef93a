//! # Configuration
//!
//! Named constants grouped by concern, plus the [`ProviderConfig`] a
//! [`CollateralProvider`](crate::collateral::CollateralProvider) is built with.
//!
//! Modes are parsed from strings and rejected immediately when unknown; nothing
//! here silently falls back to a default mode.

use crate::collateral::{AddressMode, PaymentKind};
use crate::error::{CollateralError, CollateralResult};
use bitcoin::Network;
use serde::{Deserialize, Serialize};
use std::{env as std_env, str::FromStr, time::Duration};

/// Network and RPC configuration
pub mod network {
    use std::time::Duration;

    /// Default Bitcoin Core RPC host
    pub const DEFAULT_RPC_HOST: &str = "127.0.0.1";

    /// Default Bitcoin Core RPC port (regtest)
    pub const DEFAULT_RPC_PORT: &str = "18443";

    /// Default RPC username
    pub const DEFAULT_RPC_USER: &str = "user";

    /// Default RPC password
    pub const DEFAULT_RPC_PASSWORD: &str = "password";

    /// Default wallet name for funding and signing operations
    pub const DEFAULT_WALLET_NAME: &str = "collateral_wallet";

    /// Default network the provider derives addresses for
    pub const DEFAULT_NETWORK: &str = "regtest";

    /// Esplora-compatible API endpoint
    pub const EXPLORER_API_BASE: &str = "https://blockstream.info/testnet/api";

    /// Request timeout for network operations
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

    /// Broadcast attempts before giving up on transient failures
    pub const MAX_RETRY_ATTEMPTS: u32 = 3;

    /// Base delay between broadcast attempts, doubled on every retry
    pub const RETRY_DELAY: Duration = Duration::from_millis(1000);
}

/// Fee heuristics
///
/// The byte counts are empirical. They are defaults for [`super::FeePolicy`]
/// and every finalized spend is measured against the fee rate it was built
/// for, so a drift in the actual size shows up in the logs.
pub mod fees {
    /// Legacy P2SH bytes charged per input
    pub const LEGACY_INPUT_BYTES: u64 = 148;

    /// Legacy bytes charged per output
    pub const LEGACY_OUTPUT_BYTES: u64 = 34;

    /// Legacy fixed transaction overhead
    pub const LEGACY_OVERHEAD_BYTES: u64 = 10;

    /// Virtual size of a segwit spend with a single collateral input
    pub const SEGWIT_FIRST_INPUT_VBYTES: u64 = 203;

    /// Virtual size added by each further segwit collateral input
    pub const SEGWIT_EXTRA_INPUT_VBYTES: u64 = 161;

    /// Fee rate (sat/vB) used when the oracle has no estimate
    pub const FALLBACK_FEE_RATE: u64 = 10;

    /// Default script mode for collateral outputs
    pub const DEFAULT_SCRIPT_MODE: &str = "p2wsh";

    /// Default address mode for payouts
    pub const DEFAULT_ADDRESS_MODE: &str = "p2wpkh";
}

/// Polling for funding transactions
pub mod polling {
    use std::time::Duration;

    /// Interval between two address queries
    pub const FIND_INTERVAL: Duration = Duration::from_secs(5);

    /// Upper bound on a single find operation
    pub const FIND_TIMEOUT: Duration = Duration::from_secs(3600);
}

/// Environment variable names
pub mod env {
    /// RPC host override
    pub const RPC_URL: &str = "RPC_URL";

    /// RPC port override
    pub const RPC_PORT: &str = "RPC_PORT";

    /// RPC username override
    pub const RPC_USER: &str = "RPC_USER";

    /// RPC password override
    pub const RPC_PASSWORD: &str = "RPC_PASSWORD";

    /// Wallet name override
    pub const RPC_WALLET: &str = "RPC_WALLET";

    /// Esplora API base override
    pub const EXPLORER_URL: &str = "EXPLORER_URL";

    /// Network name (bitcoin, testnet, signet, regtest)
    pub const NETWORK: &str = "COLLATERAL_NETWORK";

    /// Script mode (p2wsh, p2sh_p2wsh, p2sh)
    pub const SCRIPT_MODE: &str = "COLLATERAL_SCRIPT_MODE";

    /// Address mode (p2wpkh, p2sh_p2wpkh, p2pkh)
    pub const ADDRESS_MODE: &str = "COLLATERAL_ADDRESS_MODE";

    /// Fallback fee rate in sat/vB
    pub const FEE_RATE: &str = "COLLATERAL_FEE_RATE";

    /// Find timeout in seconds
    pub const FIND_TIMEOUT_SECS: &str = "COLLATERAL_FIND_TIMEOUT_SECS";
}

/// Size heuristics that floor the measured size of a collateral spend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeePolicy {
    pub legacy_input_bytes: u64,
    pub legacy_output_bytes: u64,
    pub legacy_overhead_bytes: u64,
    pub segwit_first_input_vbytes: u64,
    pub segwit_extra_input_vbytes: u64,
    /// sat/vB, used when the fee oracle cannot produce an estimate
    pub fallback_fee_rate: u64,
}

impl Default for FeePolicy {
    fn default() -> Self {
        Self {
            legacy_input_bytes: fees::LEGACY_INPUT_BYTES,
            legacy_output_bytes: fees::LEGACY_OUTPUT_BYTES,
            legacy_overhead_bytes: fees::LEGACY_OVERHEAD_BYTES,
            segwit_first_input_vbytes: fees::SEGWIT_FIRST_INPUT_VBYTES,
            segwit_extra_input_vbytes: fees::SEGWIT_EXTRA_INPUT_VBYTES,
            fallback_fee_rate: fees::FALLBACK_FEE_RATE,
        }
    }
}

impl FeePolicy {
    /// Estimated size of a spend, in bytes for legacy inputs and virtual bytes
    /// otherwise.
    pub fn estimated_size(&self, segwit: bool, inputs: usize, outputs: usize) -> u64 {
        let inputs = inputs as u64;
        if segwit {
            self.segwit_first_input_vbytes
                + self.segwit_extra_input_vbytes * inputs.saturating_sub(1)
        } else {
            self.legacy_input_bytes * inputs
                + self.legacy_output_bytes * outputs as u64
                + self.legacy_overhead_bytes
        }
    }
}

/// Everything a provider needs besides its collaborators.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub network: Network,
    /// Encoding collateral outputs are funded with
    pub script_mode: PaymentKind,
    /// Encoding payouts to a party's key are sent to
    pub address_mode: AddressMode,
    pub fee_policy: FeePolicy,
    pub poll_interval: Duration,
    pub find_timeout: Duration,
}

impl ProviderConfig {
    /// Build a configuration from mode strings, failing on unknown values.
    pub fn new(network: Network, script_mode: &str, address_mode: &str) -> CollateralResult<Self> {
        Ok(Self {
            network,
            script_mode: script_mode.parse()?,
            address_mode: address_mode.parse()?,
            fee_policy: FeePolicy::default(),
            poll_interval: polling::FIND_INTERVAL,
            find_timeout: polling::FIND_TIMEOUT,
        })
    }

    /// Load configuration from the environment (and `.env` when present).
    pub fn from_env() -> CollateralResult<Self> {
        dotenv::dotenv().ok();

        let network_name = std_env::var(env::NETWORK)
            .unwrap_or_else(|_| network::DEFAULT_NETWORK.to_string());
        let network = Network::from_str(&network_name)
            .map_err(|_| CollateralError::config(format!("Unknown network: {}", network_name)))?;

        let script_mode = std_env::var(env::SCRIPT_MODE)
            .unwrap_or_else(|_| fees::DEFAULT_SCRIPT_MODE.to_string());
        let address_mode = std_env::var(env::ADDRESS_MODE)
            .unwrap_or_else(|_| fees::DEFAULT_ADDRESS_MODE.to_string());

        let mut config = Self::new(network, &script_mode, &address_mode)?;

        if let Ok(rate) = std_env::var(env::FEE_RATE) {
            config.fee_policy.fallback_fee_rate = rate
                .parse()
                .map_err(|_| CollateralError::config(format!("Invalid fee rate: {}", rate)))?;
        }
        if let Ok(secs) = std_env::var(env::FIND_TIMEOUT_SECS) {
            let secs: u64 = secs
                .parse()
                .map_err(|_| CollateralError::config(format!("Invalid find timeout: {}", secs)))?;
            config.find_timeout = Duration::from_secs(secs);
        }

        Ok(config)
    }

    pub fn with_fee_policy(mut self, fee_policy: FeePolicy) -> Self {
        self.fee_policy = fee_policy;
        self
    }

    pub fn with_polling(mut self, interval: Duration, timeout: Duration) -> Self {
        self.poll_interval = interval;
        self.find_timeout = timeout;
        self
    }
}
