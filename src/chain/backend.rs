//! Root chain backend abstraction
//!
//! The manager only ever talks to the root chain through [`RootChainBackend`],
//! so tests and alternative transports can be swapped in. Provider error
//! strings are classified into a closed set here and nowhere else; the rest
//! of the crate never matches on message substrings.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::providers::{Http, Provider, Ws};
use futures::StreamExt;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::config::RootChainConfig;

/// Non-send RPC failure
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("root chain connection error: {0}")]
    Connection(String),

    #[error("rpc error: {0}")]
    Rpc(String),

    #[error("new-head subscription error: {0}")]
    Subscription(String),
}

/// Classified outcome of a transaction submission
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendTxError {
    #[error("insufficient funds for gas * price + value")]
    InsufficientFunds,

    #[error("replacement transaction underpriced")]
    ReplaceUnderpriced,

    #[error("known transaction")]
    KnownTransaction,

    #[error("nonce too low")]
    NonceTooLow,

    #[error("rpc error: {0}")]
    Rpc(String),
}

/// Classify a provider error message into the closed [`SendTxError`] set.
///
/// Matching is case-insensitive on substrings the reference node
/// implementations are known to emit.
pub fn classify_send_error(message: &str) -> SendTxError {
    let message_lower = message.to_lowercase();

    if message_lower.contains("insufficient funds") {
        return SendTxError::InsufficientFunds;
    }
    if message_lower.contains("replacement transaction underpriced")
        || message_lower.contains("transaction underpriced")
    {
        return SendTxError::ReplaceUnderpriced;
    }
    if message_lower.contains("known transaction") {
        return SendTxError::KnownTransaction;
    }
    if message_lower.contains("nonce too low") || message_lower.contains("nonce is too low") {
        return SendTxError::NonceTooLow;
    }

    SendTxError::Rpc(message.to_string())
}

/// Read/write surface the manager needs from the root chain
#[async_trait]
pub trait RootChainBackend: Send + Sync + 'static {
    /// Account nonce at the latest block
    async fn nonce_at(&self, addr: Address) -> Result<u64, BackendError>;

    /// Submit a signed transaction; errors come back classified
    async fn send_raw_transaction(&self, rlp: Bytes) -> Result<H256, SendTxError>;

    /// Receipt of a mined transaction, `None` while unknown or pending
    async fn transaction_receipt(
        &self,
        hash: H256,
    ) -> Result<Option<TransactionReceipt>, BackendError>;

    /// Transaction lookup; the flag is true while the tx sits in the mempool
    async fn transaction_by_hash(
        &self,
        hash: H256,
    ) -> Result<Option<(Transaction, bool)>, BackendError>;

    async fn block_by_hash(&self, hash: H256) -> Result<Option<Block<H256>>, BackendError>;

    /// Subscribe to new heads. The channel closes when the subscription
    /// drops; callers are expected to resubscribe.
    async fn subscribe_new_heads(&self) -> Result<mpsc::Receiver<Block<H256>>, BackendError>;
}

/// Backend over an Ethereum-style node: WebSocket for the head subscription,
/// a rotating HTTP provider list for unary calls.
pub struct EthereumBackend {
    ws: Provider<Ws>,
    http_providers: Vec<Provider<Http>>,
    current_provider: AtomicUsize,
}

impl EthereumBackend {
    pub async fn connect(config: &RootChainConfig) -> Result<Self, BackendError> {
        let ws = Provider::<Ws>::connect(&config.ws_url)
            .await
            .map_err(|e| BackendError::Connection(e.to_string()))?;

        let mut http_providers = Vec::new();
        for url in &config.http_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    let provider = provider.interval(Duration::from_millis(100));
                    http_providers.push(provider);
                    debug!("Added HTTP provider: {}", url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(BackendError::Connection(
                "no valid HTTP providers configured".to_string(),
            ));
        }

        Ok(Self {
            ws,
            http_providers,
            current_provider: AtomicUsize::new(0),
        })
    }

    fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Rotate to the next provider after a failed unary call
    fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Root chain provider failover to index {}", next);
    }

    async fn with_failover<T, F, Fut>(&self, mut call: F) -> Result<T, BackendError>
    where
        F: FnMut(Provider<Http>) -> Fut,
        Fut: std::future::Future<Output = Result<T, ProviderError>>,
    {
        let mut last_err = None;
        for _ in 0..self.http_providers.len() {
            match call(self.http().clone()).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!("Root chain call failed: {}", e);
                    last_err = Some(e);
                    self.failover();
                }
            }
        }

        Err(BackendError::Rpc(
            last_err.map(|e| e.to_string()).unwrap_or_else(|| "all providers failed".into()),
        ))
    }
}

#[async_trait]
impl RootChainBackend for EthereumBackend {
    async fn nonce_at(&self, addr: Address) -> Result<u64, BackendError> {
        let nonce = self
            .with_failover(|provider| async move {
                provider.get_transaction_count(addr, None).await
            })
            .await?;
        Ok(nonce.as_u64())
    }

    async fn send_raw_transaction(&self, rlp: Bytes) -> Result<H256, SendTxError> {
        match self.http().send_raw_transaction(rlp).await {
            Ok(pending) => Ok(pending.tx_hash()),
            Err(e) => Err(classify_send_error(&e.to_string())),
        }
    }

    async fn transaction_receipt(
        &self,
        hash: H256,
    ) -> Result<Option<TransactionReceipt>, BackendError> {
        self.with_failover(|provider| async move { provider.get_transaction_receipt(hash).await })
            .await
    }

    async fn transaction_by_hash(
        &self,
        hash: H256,
    ) -> Result<Option<(Transaction, bool)>, BackendError> {
        let tx = self
            .with_failover(|provider| async move { provider.get_transaction(hash).await })
            .await?;
        Ok(tx.map(|tx| {
            let pending = tx.block_hash.is_none();
            (tx, pending)
        }))
    }

    async fn block_by_hash(&self, hash: H256) -> Result<Option<Block<H256>>, BackendError> {
        self.with_failover(|provider| async move { provider.get_block(hash).await })
            .await
    }

    async fn subscribe_new_heads(&self) -> Result<mpsc::Receiver<Block<H256>>, BackendError> {
        let provider = self.ws.clone();
        let (head_tx, head_rx) = mpsc::channel(64);
        let (ready_tx, ready_rx) = oneshot::channel();

        tokio::spawn(async move {
            let mut stream = match provider.subscribe_blocks().await {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    stream
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(BackendError::Subscription(e.to_string())));
                    return;
                }
            };

            while let Some(block) = stream.next().await {
                if head_tx.send(block).await.is_err() {
                    break;
                }
            }
        });

        ready_rx
            .await
            .map_err(|_| BackendError::Subscription("subscription task dropped".to_string()))??;

        Ok(head_rx)
    }
}
