//! # Collateral Contracts
//!
//! Bitcoin Script escrow for loan collateral. A contract is fixed by its
//! [`CollateralParams`]; from them each leg gets a redeem script
//! ([`template`]), three payment encodings ([`variants`]) and, at spend time,
//! the unlock data ([`unlock`]) and transaction ([`assembler`]) of the branch
//! the current [`Period`] opens.
//!
//! ## Periods
//!
//! - **Loan**: borrower reclaims with a lender/agent secret (or, in swap
//!   contracts, the liquidator claims with enough secrets)
//! - **Liquidation**: 2-of-3 cooperative spend after the loan expiration
//! - **Seizure**: the seizable leg goes to its guard after the liquidation
//!   expiration
//! - **Refund**: borrower alone after the seizure expiration

pub mod assembler;
pub mod locator;
pub mod multisig;
pub mod params;
pub mod period;
pub mod provider;
pub mod sighash;
pub mod template;
pub mod unlock;
pub mod variants;

#[cfg(test)]
pub(crate) mod fixtures;
#[cfg(test)]
pub(crate) mod stack_machine;

pub use assembler::{CollateralLeg, CollateralOutput, Payout, TransactionAssembler, UnsignedSpend};
pub use locator::{BatchLocator, LegScript, OutputClass};
pub use multisig::{MultisigSession, MultisigState, PartialSignatures};
pub use params::{
    CollateralParams, CollateralValues, Expirations, PartyKeys, Role, Secret, SecretHashes,
    SecretSlot,
};
pub use period::Period;
pub use provider::{CollateralAddresses, CollateralProvider, LockReceipt};
pub use sighash::SigningRequest;
pub use template::{Leg, Protocol, Template, Variant};
pub use unlock::{Authorization, StackItem, UnlockData};
pub use variants::{AddressMode, PaymentKind, PaymentVariant, PaymentVariants};
