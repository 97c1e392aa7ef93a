//! Shared test fixtures: parties, secrets and funded collateral outputs.

use super::assembler::{CollateralLeg, CollateralOutput};
use super::params::{CollateralParams, Expirations, PartyKeys, Role, Secret, SecretHashes, SecretSlot};
use super::template::{Leg, Template, Variant};
use super::variants::{AddressMode, PaymentKind, PaymentVariants};
use crate::services::KeyStore;
use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{rand::thread_rng, Secp256k1, SecretKey};
use bitcoin::transaction::Version;
use bitcoin::{
    Address, Amount, Network, OutPoint, PrivateKey, PublicKey, ScriptBuf, Sequence, Transaction,
    TxIn, TxOut, Txid, Witness,
};
use std::collections::HashMap;

pub const NETWORK: Network = Network::Regtest;

pub struct Party {
    pub secret_key: SecretKey,
    pub pubkey: PublicKey,
}

impl Party {
    fn random() -> Self {
        let secp = Secp256k1::new();
        let (secret_key, pk) = secp.generate_keypair(&mut thread_rng());
        Self {
            secret_key,
            pubkey: PublicKey::new(pk),
        }
    }
}

pub struct Fixture {
    pub borrower: Party,
    pub lender: Party,
    pub agent: Party,
    pub liquidator: Party,
    pub secrets: HashMap<SecretSlot, Secret>,
    pub params: CollateralParams,
}

impl Fixture {
    pub fn new(variant: Variant) -> Self {
        let borrower = Party::random();
        let lender = Party::random();
        let agent = Party::random();
        let liquidator = Party::random();

        let mut secrets = HashMap::new();
        let mut secret_hashes = SecretHashes::default();
        for slot in [
            SecretSlot::A1,
            SecretSlot::A2,
            SecretSlot::B1,
            SecretSlot::B2,
            SecretSlot::C1,
            SecretSlot::C2,
            SecretSlot::D1,
        ] {
            let secret = Secret::random();
            secret_hashes.set(slot, secret.hash());
            secrets.insert(slot, secret);
        }

        let keys = PartyKeys::new(borrower.pubkey, lender.pubkey, agent.pubkey)
            .and_then(|k| k.with_liquidator(liquidator.pubkey))
            .expect("fixture keys are compressed");

        let params = CollateralParams {
            keys,
            secret_hashes,
            expirations: Expirations {
                loan: 1_700_000_000,
                liquidation: 1_700_086_400,
                seizure: Some(1_700_172_800),
            },
            variant,
        };

        Self {
            borrower,
            lender,
            agent,
            liquidator,
            secrets,
            params,
        }
    }

    pub fn secret(&self, slot: SecretSlot) -> Secret {
        self.secrets[&slot]
    }

    pub fn party(&self, role: Role) -> &Party {
        match role {
            Role::Borrower => &self.borrower,
            Role::Lender => &self.lender,
            Role::Agent => &self.agent,
            Role::Liquidator => &self.liquidator,
        }
    }

    pub fn address_of(&self, pubkey: PublicKey, network: Network) -> Address {
        AddressMode::P2wpkh
            .address(&pubkey, network)
            .expect("compressed key")
    }

    pub fn keystore(&self, roles: &[Role]) -> KeyStore {
        let mut store = KeyStore::new();
        for role in roles {
            store.insert(PrivateKey::new(self.party(*role).secret_key, NETWORK));
        }
        store
    }

    pub fn template(&self, leg: Leg) -> Template {
        Template::new(self.params.variant, leg)
    }

    pub fn redeem_script(&self, leg: Leg) -> ScriptBuf {
        self.template(leg)
            .redeem_script(&self.params)
            .expect("fixture params are complete")
    }

    pub fn variants(&self, leg: Leg) -> PaymentVariants {
        PaymentVariants::derive(&self.redeem_script(leg), NETWORK).expect("valid script")
    }

    /// Transaction paying `outputs`, spending a random dummy outpoint.
    pub fn funding_tx(&self, outputs: Vec<(ScriptBuf, Amount)>) -> Transaction {
        Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::new(Txid::from_byte_array(rand::random()), 0),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: outputs
                .into_iter()
                .map(|(script_pubkey, value)| TxOut {
                    value,
                    script_pubkey,
                })
                .collect(),
        }
    }

    /// Funding transaction with a single collateral output for `leg`.
    pub fn funded_leg(&self, leg: Leg, kind: PaymentKind, value: Amount) -> (Transaction, CollateralLeg) {
        let variants = self.variants(leg);
        let script_pubkey = variants.get(kind).script_pubkey.clone();
        let tx = self.funding_tx(vec![(script_pubkey.clone(), value)]);
        let collateral = CollateralLeg {
            leg,
            redeem_script: self.redeem_script(leg),
            variants,
            output: CollateralOutput {
                outpoint: OutPoint::new(tx.compute_txid(), 0),
                value,
                kind,
                script_pubkey,
            },
        };
        (tx, collateral)
    }
}
