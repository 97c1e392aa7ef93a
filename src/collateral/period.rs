//! Lifecycle periods of a collateral contract.

use crate::error::CollateralError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A period selects the branch a spend goes through. Which periods exist,
/// their timelocks and their selectors are owned by the
/// [`Template`](super::Template).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    /// Loan / approve / claim period: hash branch, no timelock
    Loan,
    /// Liquidation / bidding period: 2-of-3 arbitration
    Liquidation,
    /// Seizure period
    Seizure,
    /// Final refund to the borrower
    Refund,
}

impl Period {
    pub const ALL: [Period; 4] = [
        Period::Loan,
        Period::Liquidation,
        Period::Seizure,
        Period::Refund,
    ];
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Period::Loan => "loanPeriod",
            Period::Liquidation => "liquidationPeriod",
            Period::Seizure => "seizurePeriod",
            Period::Refund => "refundPeriod",
        };
        f.write_str(name)
    }
}

impl FromStr for Period {
    type Err = CollateralError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "loanPeriod" | "approvePeriod" | "claimPeriod" | "loan" => Ok(Period::Loan),
            "liquidationPeriod" | "biddingPeriod" | "liquidation" => Ok(Period::Liquidation),
            "seizurePeriod" | "seizure" => Ok(Period::Seizure),
            "refundPeriod" | "refund" => Ok(Period::Refund),
            other => Err(CollateralError::UnresolvedBranch {
                period: other.to_string(),
            }),
        }
    }
}
