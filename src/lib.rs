//! # Bitcoin Collateral: Script Escrow for Loan Collateral
//!
//! Core library for locking loan collateral in two Bitcoin Script outputs
//! whose spend paths open period by period: borrower reclaim, 2-of-3
//! arbitration, lender seizure and borrower refund.

pub mod collateral;
pub mod config;
pub mod error;
pub mod services;
pub mod utils;

// Re-export commonly used types
pub use collateral::{CollateralParams, CollateralProvider, Leg, Period, Variant};
pub use config::{FeePolicy, ProviderConfig};
pub use error::{CollateralError, CollateralResult};
pub use services::{BitcoinRpcClient, EsploraClient, KeyStore, RpcWalletSigner};
