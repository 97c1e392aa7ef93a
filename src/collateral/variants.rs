//! # Payment Variants
//!
//! Every redeem script can be funded three ways: native segwit (P2WSH),
//! segwit wrapped in P2SH, and plain P2SH. The provider funds and searches
//! for the configured [`PaymentKind`]; matching a funding output tries all
//! three.

use crate::error::{CollateralError, CollateralResult};
use bitcoin::{Address, CompressedPublicKey, Network, PublicKey, Script, ScriptBuf};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Encoding of a collateral output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentKind {
    P2wsh,
    P2shP2wsh,
    P2sh,
}

impl PaymentKind {
    pub const ALL: [PaymentKind; 3] = [PaymentKind::P2wsh, PaymentKind::P2shP2wsh, PaymentKind::P2sh];

    /// Whether spends use the BIP143 digest and a witness stack
    pub fn is_segwit(&self) -> bool {
        matches!(self, PaymentKind::P2wsh | PaymentKind::P2shP2wsh)
    }
}

impl fmt::Display for PaymentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PaymentKind::P2wsh => "p2wsh",
            PaymentKind::P2shP2wsh => "p2sh_p2wsh",
            PaymentKind::P2sh => "p2sh",
        };
        f.write_str(name)
    }
}

impl FromStr for PaymentKind {
    type Err = CollateralError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "p2wsh" => Ok(PaymentKind::P2wsh),
            "p2sh_p2wsh" => Ok(PaymentKind::P2shP2wsh),
            "p2sh" => Ok(PaymentKind::P2sh),
            _ => Err(CollateralError::config("Mode must be one of p2wsh, p2sh_p2wsh, p2sh")),
        }
    }
}

/// Encoding of a party's own payout address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressMode {
    P2wpkh,
    P2shP2wpkh,
    P2pkh,
}

impl AddressMode {
    /// Address paying to `key` under this mode
    pub fn address(&self, key: &PublicKey, network: Network) -> CollateralResult<Address> {
        match self {
            AddressMode::P2pkh => Ok(Address::p2pkh(key.pubkey_hash(), network)),
            AddressMode::P2wpkh | AddressMode::P2shP2wpkh => {
                let compressed = CompressedPublicKey::try_from(*key)
                    .map_err(|e| CollateralError::config(format!("Invalid payout key: {}", e)))?;
                Ok(if *self == AddressMode::P2wpkh {
                    Address::p2wpkh(&compressed, network)
                } else {
                    Address::p2shwpkh(&compressed, network)
                })
            }
        }
    }
}

impl FromStr for AddressMode {
    type Err = CollateralError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "p2wpkh" => Ok(AddressMode::P2wpkh),
            "p2sh_p2wpkh" => Ok(AddressMode::P2shP2wpkh),
            "p2pkh" => Ok(AddressMode::P2pkh),
            _ => Err(CollateralError::config("Mode must be one of p2wpkh, p2sh_p2wpkh, p2pkh")),
        }
    }
}

/// One funded encoding of a redeem script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentVariant {
    pub kind: PaymentKind,
    pub script_pubkey: ScriptBuf,
    pub address: Address,
}

/// The three encodings of one redeem script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentVariants {
    p2wsh: PaymentVariant,
    p2sh_p2wsh: PaymentVariant,
    p2sh: PaymentVariant,
}

impl PaymentVariants {
    /// Derive all three encodings of `redeem_script`.
    ///
    /// # Arguments
    /// * `redeem_script` - The collateral redeem script
    /// * `network` - Network the addresses are encoded for
    pub fn derive(redeem_script: &Script, network: Network) -> CollateralResult<Self> {
        let p2wsh = ScriptBuf::new_p2wsh(&redeem_script.wscript_hash());
        let p2sh_p2wsh = ScriptBuf::new_p2sh(&p2wsh.script_hash());
        let p2sh = ScriptBuf::new_p2sh(&redeem_script.script_hash());

        let variant = |kind: PaymentKind, script_pubkey: ScriptBuf| -> CollateralResult<PaymentVariant> {
            let address = Address::from_script(&script_pubkey, network)
                .map_err(|e| CollateralError::config(format!("Cannot encode {} address: {}", kind, e)))?;
            Ok(PaymentVariant {
                kind,
                script_pubkey,
                address,
            })
        };

        Ok(Self {
            p2wsh: variant(PaymentKind::P2wsh, p2wsh)?,
            p2sh_p2wsh: variant(PaymentKind::P2shP2wsh, p2sh_p2wsh)?,
            p2sh: variant(PaymentKind::P2sh, p2sh)?,
        })
    }

    pub fn get(&self, kind: PaymentKind) -> &PaymentVariant {
        match kind {
            PaymentKind::P2wsh => &self.p2wsh,
            PaymentKind::P2shP2wsh => &self.p2sh_p2wsh,
            PaymentKind::P2sh => &self.p2sh,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &PaymentVariant> {
        [&self.p2wsh, &self.p2sh_p2wsh, &self.p2sh].into_iter()
    }

    /// Encoding whose locking script equals `script_pubkey`, if any.
    pub fn match_script_pubkey(&self, script_pubkey: &Script) -> Option<PaymentKind> {
        self.iter()
            .find(|v| v.script_pubkey.as_script() == script_pubkey)
            .map(|v| v.kind)
    }

    /// The version-0 witness program the P2SH wrapper commits to.
    pub fn witness_program(&self) -> &Script {
        &self.p2wsh.script_pubkey
    }
}
