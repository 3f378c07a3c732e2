//! Keystore seam
//!
//! The manager treats signing as an oracle: it asks whether an address is
//! managed and hands over a prepared transaction. [`LocalKeystore`] is the
//! in-process implementation over raw private keys.

use std::collections::HashMap;
use std::env;

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::utils::keccak256;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum KeystoreError {
    #[error("account {0:?} not found in keystore")]
    UnknownAccount(Address),

    #[error("account {0:?} is locked")]
    LockedAccount(Address),

    #[error("signing failed: {0}")]
    Signer(String),
}

/// A signed transaction ready for broadcast
#[derive(Debug, Clone)]
pub struct SignedTx {
    pub hash: H256,
    pub rlp: Bytes,
}

/// Signing oracle for operator accounts
#[async_trait]
pub trait Keystore: Send + Sync + 'static {
    fn has_address(&self, addr: Address) -> bool;

    async fn sign_tx(
        &self,
        addr: Address,
        tx: &TypedTransaction,
        chain_id: u64,
    ) -> Result<SignedTx, KeystoreError>;
}

/// Keystore over in-memory wallets loaded from raw private keys
pub struct LocalKeystore {
    wallets: HashMap<Address, LocalWallet>,
}

impl LocalKeystore {
    pub fn new(wallets: Vec<LocalWallet>) -> Self {
        let wallets = wallets
            .into_iter()
            .map(|wallet| (wallet.address(), wallet))
            .collect();
        Self { wallets }
    }

    /// Load comma-separated private keys from an environment variable
    pub fn from_env(var: &str) -> Result<Self, KeystoreError> {
        let raw = env::var(var).map_err(|_| {
            KeystoreError::Signer(format!("environment variable {} is not set", var))
        })?;

        let mut wallets = Vec::new();
        for key in raw.split(',').map(str::trim).filter(|k| !k.is_empty()) {
            let wallet = key
                .parse::<LocalWallet>()
                .map_err(|e| KeystoreError::Signer(format!("invalid private key: {}", e)))?;
            wallets.push(wallet);
        }

        if wallets.is_empty() {
            return Err(KeystoreError::Signer(format!(
                "no private keys found in {}",
                var
            )));
        }

        info!("Keystore initialized with {} account(s)", wallets.len());
        Ok(Self::new(wallets))
    }

    pub fn addresses(&self) -> Vec<Address> {
        self.wallets.keys().copied().collect()
    }
}

#[async_trait]
impl Keystore for LocalKeystore {
    fn has_address(&self, addr: Address) -> bool {
        self.wallets.contains_key(&addr)
    }

    async fn sign_tx(
        &self,
        addr: Address,
        tx: &TypedTransaction,
        chain_id: u64,
    ) -> Result<SignedTx, KeystoreError> {
        let wallet = self
            .wallets
            .get(&addr)
            .ok_or(KeystoreError::UnknownAccount(addr))?
            .clone()
            .with_chain_id(chain_id);

        let signature = wallet
            .sign_transaction(tx)
            .await
            .map_err(|e| KeystoreError::Signer(e.to_string()))?;

        let rlp = tx.rlp_signed(&signature);
        let hash = H256::from(keccak256(&rlp));

        Ok(SignedTx { hash, rlp })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::TransactionRequest;

    fn wallet() -> LocalWallet {
        // well-known throwaway test key
        "0000000000000000000000000000000000000000000000000000000000000001"
            .parse()
            .unwrap()
    }

    #[test]
    fn has_address_only_for_managed_wallets() {
        let wallet = wallet();
        let addr = wallet.address();
        let keystore = LocalKeystore::new(vec![wallet]);

        assert!(keystore.has_address(addr));
        assert!(!keystore.has_address(Address::repeat_byte(9)));
    }

    #[tokio::test]
    async fn signing_is_deterministic_per_input() {
        let wallet = wallet();
        let addr = wallet.address();
        let keystore = LocalKeystore::new(vec![wallet]);

        let tx: TypedTransaction = TransactionRequest::new()
            .from(addr)
            .to(Address::repeat_byte(2))
            .value(1u64)
            .gas(21_000u64)
            .gas_price(10_000_000_000u64)
            .nonce(0u64)
            .chain_id(1337u64)
            .into();

        let first = keystore.sign_tx(addr, &tx, 1337).await.unwrap();
        let second = keystore.sign_tx(addr, &tx, 1337).await.unwrap();
        assert_eq!(first.hash, second.hash);
        assert_eq!(first.rlp, second.rlp);

        // a different gas price yields a different concrete transaction
        let bumped: TypedTransaction = TransactionRequest::new()
            .from(addr)
            .to(Address::repeat_byte(2))
            .value(1u64)
            .gas(21_000u64)
            .gas_price(12_000_000_000u64)
            .nonce(0u64)
            .chain_id(1337u64)
            .into();
        let third = keystore.sign_tx(addr, &bumped, 1337).await.unwrap();
        assert_ne!(first.hash, third.hash);
    }

    #[tokio::test]
    async fn unknown_account_is_rejected() {
        let keystore = LocalKeystore::new(vec![wallet()]);
        let tx: TypedTransaction = TransactionRequest::new().into();

        let err = keystore
            .sign_tx(Address::repeat_byte(9), &tx, 1337)
            .await
            .unwrap_err();
        assert!(matches!(err, KeystoreError::UnknownAccount(_)));
    }
}
