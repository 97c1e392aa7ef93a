//! # Error Types for Bitcoin Collateral
//!
//! This module provides error handling for script construction, transaction
//! assembly, cooperative signing and the chain collaborators the provider
//! talks to.

use thiserror::Error;

/// Main error type for all collateral operations
#[derive(Debug, Error)]
pub enum CollateralError {
    /// Invalid modes, missing contract parameters, malformed keys
    #[error("Collateral configuration error: {message}")]
    Configuration { message: String },

    /// A referenced funding transaction pays neither collateral address
    #[error("Could not find transaction based on redeem script: {txid}")]
    ScriptMismatch { txid: String },

    /// A supplied preimage does not open the branch being spent
    #[error("Secret mismatch: {message}")]
    SecretMismatch { message: String },

    /// The computed fee would consume the whole collateral
    #[error("Fee of {fee} sats exceeds available input value of {available} sats")]
    FeeExceedsValue { fee: u64, available: u64 },

    /// A finalized spend pays less than its fee rate requires
    #[error("Fee of {fee} sats for {vsize} vB is below the requested {fee_rate} sat/vB")]
    FeeBelowRate { fee: u64, vsize: u64, fee_rate: u64 },

    /// An output the network would refuse to relay
    #[error("Output of {value} sats is below the dust limit of {minimum} sats")]
    DustOutput { value: u64, minimum: u64 },

    /// The requested period has no branch in the redeem script
    #[error("Unresolved branch for period: {period}")]
    UnresolvedBranch { period: String },

    /// Errors during transaction construction or finalization
    #[error("Transaction error: {message}")]
    Transaction { message: String },

    /// Signature production or verification failures
    #[error("Signing error: {message}")]
    Signing { message: String },

    /// Bitcoin RPC communication failures
    #[error("RPC communication failed: {source}")]
    Rpc {
        #[from]
        source: bitcoincore_rpc::Error,
    },

    /// Network request failures (explorer API, etc.)
    #[error("Network request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    /// JSON serialization/deserialization errors
    #[error("JSON processing error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    /// File I/O operations
    #[error("File operation failed: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Bounded polling gave up
    #[error("Timed out after {seconds} seconds waiting for {what}")]
    Timeout { what: String, seconds: u64 },

    /// Generic operation failures with context
    #[error("Operation failed: {operation} - {message}")]
    OperationFailed { operation: String, message: String },
}

/// Result type alias for collateral operations
pub type CollateralResult<T> = Result<T, CollateralError>;

impl CollateralError {
    /// Create a configuration error with a message
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a transaction error with a message
    pub fn transaction(message: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
        }
    }

    /// Create a signing error with a message
    pub fn signing(message: impl Into<String>) -> Self {
        Self::Signing {
            message: message.into(),
        }
    }

    /// Create a secret mismatch error with a message
    pub fn secret(message: impl Into<String>) -> Self {
        Self::SecretMismatch {
            message: message.into(),
        }
    }

    /// Create an operation failed error
    pub fn operation(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::OperationFailed {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Check if this error is retryable (network/temporary issues)
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CollateralError::Network { .. } | CollateralError::Rpc { .. }
        )
    }

    /// Check if this error would lead to an on-chain rejection or a wrong spend
    pub fn is_security_critical(&self) -> bool {
        matches!(
            self,
            CollateralError::SecretMismatch { .. }
                | CollateralError::ScriptMismatch { .. }
                | CollateralError::UnresolvedBranch { .. }
                | CollateralError::FeeBelowRate { .. }
        )
    }
}

/// Network client specific errors
#[derive(Debug, Error)]
pub enum NetworkError {
    /// HTTP request failures
    #[error("HTTP request failed: {status} - {message}")]
    HttpError { status: u16, message: String },

    /// Timeout errors
    #[error("Request timeout after {seconds} seconds")]
    Timeout { seconds: u64 },

    /// API response validation errors
    #[error("Invalid API response: {message}")]
    InvalidResponse { message: String },
}

/// Result type alias for network operations
pub type NetworkResult<T> = Result<T, NetworkError>;

impl From<NetworkError> for CollateralError {
    fn from(err: NetworkError) -> Self {
        CollateralError::operation("network", err.to_string())
    }
}
