use super::Signer;
use crate::collateral::AddressMode;
use crate::error::{CollateralError, CollateralResult};
use async_trait::async_trait;
use bitcoin::secp256k1::{ecdsa::Signature, All, Message, Secp256k1};
use bitcoin::{Network, PrivateKey, PublicKey};
use bitcoincore_rpc::RpcApi;
use log::debug;
use std::collections::HashMap;

use super::rpc_client::BitcoinRpcClient;

/// Private keys held in memory, looked up by public key.
#[derive(Debug, Clone)]
pub struct KeyStore {
    secp: Secp256k1<All>,
    keys: HashMap<PublicKey, PrivateKey>,
}

impl Default for KeyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyStore {
    pub fn new() -> Self {
        Self {
            secp: Secp256k1::new(),
            keys: HashMap::new(),
        }
    }

    /// Add a key, returning its public key.
    pub fn insert(&mut self, key: PrivateKey) -> PublicKey {
        let pubkey = key.public_key(&self.secp);
        self.keys.insert(pubkey, key);
        pubkey
    }

    /// Parse and add a WIF-encoded key.
    pub fn insert_wif(&mut self, wif: &str) -> CollateralResult<PublicKey> {
        let key = PrivateKey::from_wif(wif)
            .map_err(|e| CollateralError::config(format!("Invalid WIF key: {}", e)))?;
        Ok(self.insert(key))
    }

    pub fn contains(&self, pubkey: &PublicKey) -> bool {
        self.keys.contains_key(pubkey)
    }

    fn sign_with(&self, pubkey: &PublicKey, message: &Message) -> CollateralResult<Signature> {
        let key = self
            .keys
            .get(pubkey)
            .ok_or_else(|| CollateralError::signing(format!("No private key for {}", pubkey)))?;
        let mut signature = self.secp.sign_ecdsa(message, &key.inner);
        signature.normalize_s();
        Ok(signature)
    }
}

#[async_trait]
impl Signer for KeyStore {
    async fn sign(&self, pubkey: &PublicKey, message: &Message) -> CollateralResult<Signature> {
        self.sign_with(pubkey, message)
    }
}

/// Signs with keys exported from the node wallet.
///
/// The wallet address of a public key depends on the address mode it was
/// imported under; `dumpprivkey` is asked for that address.
#[derive(Debug)]
pub struct RpcWalletSigner {
    client: BitcoinRpcClient,
    address_mode: AddressMode,
    network: Network,
}

impl RpcWalletSigner {
    pub fn new(client: BitcoinRpcClient, address_mode: AddressMode, network: Network) -> Self {
        Self {
            client,
            address_mode,
            network,
        }
    }

    async fn dump_private_key(&self, pubkey: &PublicKey) -> CollateralResult<PrivateKey> {
        let address = self.address_mode.address(pubkey, self.network)?;
        debug!("Exporting wallet key for {}", address);
        let address = address.to_string();
        let wif: String = self
            .client
            .call_blocking(move |client| Ok(client.call("dumpprivkey", &[address.into()])?))
            .await?;
        let key = PrivateKey::from_wif(&wif)
            .map_err(|e| CollateralError::signing(format!("Wallet returned an invalid key: {}", e)))?;
        Ok(key)
    }
}

#[async_trait]
impl Signer for RpcWalletSigner {
    async fn sign(&self, pubkey: &PublicKey, message: &Message) -> CollateralResult<Signature> {
        let mut store = KeyStore::new();
        let derived = store.insert(self.dump_private_key(pubkey).await?);
        if derived != *pubkey {
            return Err(CollateralError::signing(format!(
                "Wallet key for {} does not match the requested public key",
                pubkey
            )));
        }
        store.sign_with(pubkey, message)
    }
}
