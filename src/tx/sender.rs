//! Send engine: sign, submit, interpret provider errors
//!
//! A single raw transaction is only ever driven by one send sequence at a
//! time (the raw's `send_lock`). The engine never holds the queue lock across
//! a suspension point; it takes it briefly to read the current head, to
//! persist the pending queue, and to maintain the known-transaction counter.

use std::sync::Arc;

use ethers::types::{Address, H256};
use thiserror::Error;
use tokio::sync::{broadcast, watch, RwLock};
use tracing::{debug, error, info, warn};

use crate::chain::backend::{RootChainBackend, SendTxError};
use crate::manager::Queues;
use crate::state::db::{Db, DbError};
use crate::state::schema;
use crate::tx::gas::{gwei, GasPriceController};
use crate::tx::raw::{RawTransaction, SignedVariant, TrackedRaw};
use crate::tx::signer::{Keystore, KeystoreError};

/// Send failure surfaced to the tick worker
#[derive(Error, Debug)]
pub enum SendError {
    #[error("insufficient funds for gas * price + value")]
    InsufficientFunds,

    #[error("replacement transaction underpriced")]
    ReplaceUnderpriced,

    #[error("known transaction {0:?}")]
    KnownTransaction(H256),

    #[error(transparent)]
    Keystore(#[from] KeystoreError),

    #[error("database error: {0}")]
    Db(#[from] DbError),

    #[error("backend error: {0}")]
    Backend(String),
}

/// Non-failure result of one send sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// A fresh variant was accepted by the node
    Sent(H256),
    /// A variant already has a receipt; nothing to do
    AlreadyMined(H256),
    /// The concrete transaction was broadcast earlier; idempotent no-op
    AlreadyPending(H256),
    /// Resubmission suppressed until `send_delay` more blocks pass
    Throttled,
}

pub(crate) struct SendEngine {
    chain_id: u64,
    send_delay: u64,
    max_known_tx: u64,
    backend: Arc<dyn RootChainBackend>,
    keystore: Arc<dyn Keystore>,
    db: Db,
    gas: Arc<GasPriceController>,
    queues: Arc<RwLock<Queues>>,
    heads: broadcast::Sender<u64>,
    quit: watch::Receiver<bool>,
}

impl SendEngine {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        chain_id: u64,
        send_delay: u64,
        max_known_tx: u64,
        backend: Arc<dyn RootChainBackend>,
        keystore: Arc<dyn Keystore>,
        db: Db,
        gas: Arc<GasPriceController>,
        queues: Arc<RwLock<Queues>>,
        heads: broadcast::Sender<u64>,
        quit: watch::Receiver<bool>,
    ) -> Self {
        Self {
            chain_id,
            send_delay,
            max_known_tx,
            backend,
            keystore,
            db,
            gas,
            queues,
            heads,
            quit,
        }
    }

    /// Drive one send sequence for `raw`.
    pub(crate) async fn send(
        &self,
        addr: Address,
        raw: &Arc<TrackedRaw>,
    ) -> Result<SendOutcome, SendError> {
        let _send = raw.send_lock.lock().await;

        // short circuit if a variant was already mined
        if let Some(mined) = raw
            .check_mined(self.backend.as_ref())
            .await
            .map_err(|e| SendError::Backend(e.to_string()))?
        {
            return Ok(SendOutcome::AlreadyMined(mined));
        }

        let current_block = { self.queues.read().await.current_block };
        let last_sent = raw.with(|r| r.last_sent_block_number);
        if last_sent != 0 && current_block.saturating_sub(last_sent) < self.send_delay {
            debug!(delay = self.send_delay, "Too early to resend transaction");
            raw.with_mut(|r| r.last_sent_block_number = current_block);
            return Ok(SendOutcome::Throttled);
        }

        // The loop re-signs and resubmits after a nonce rebind; every other
        // branch leaves it on the first pass.
        loop {
            let gas_price = self.gas.current().await;
            let (tx, nonce) = raw.with(|r| (r.to_transaction(gas_price, self.chain_id), r.nonce));

            let signed = match self.keystore.sign_tx(addr, &tx, self.chain_id).await {
                Ok(signed) => signed,
                Err(e) => {
                    error!(
                        caption = %raw.with(|r| r.caption().to_string()),
                        "Failed to sign transaction: {}", e
                    );
                    return Err(e.into());
                }
            };
            let hash = signed.hash;

            // identical nonce + gas price + payload was broadcast before
            if raw.with(|r| r.has_pending(hash)) {
                return Ok(SendOutcome::AlreadyPending(hash));
            }

            raw.with_mut(|r| {
                r.add_pending(SignedVariant {
                    hash,
                    nonce,
                    gas_price,
                    rlp: signed.rlp.clone(),
                });
                r.last_sent_block_number = current_block;
            });
            self.persist_pending(addr).await?;

            match self.backend.send_raw_transaction(signed.rlp.clone()).await {
                Ok(_) => {
                    info!(
                        hash = ?hash,
                        nonce,
                        caption = %raw.with(|r| r.caption().to_string()),
                        gasprice = %gwei(gas_price),
                        "Transaction sent"
                    );
                    crate::metrics::record_tx_sent();
                    return Ok(SendOutcome::Sent(hash));
                }
                Err(SendTxError::InsufficientFunds) => return Err(SendError::InsufficientFunds),
                Err(SendTxError::ReplaceUnderpriced) => return Err(SendError::ReplaceUnderpriced),
                Err(SendTxError::KnownTransaction) => {
                    // the node has an identical pending tx but no receipt
                    // yet; retry a bounded number of times, pacing on new
                    // heads so the loop cannot spin hot
                    crate::metrics::record_known_tx_retry();
                    let capped = {
                        let mut queues = self.queues.write().await;
                        let counter = queues.num_known_err.entry(hash).or_insert(0);
                        *counter += 1;
                        if *counter >= self.max_known_tx {
                            *counter = 0;
                            true
                        } else {
                            false
                        }
                    };

                    if !capped {
                        let mut heads = self.heads.subscribe();
                        let mut quit = self.quit.clone();
                        tokio::select! {
                            _ = heads.recv() => {}
                            _ = quit.changed() => {}
                        }
                    }

                    return Err(SendError::KnownTransaction(hash));
                }
                Err(SendTxError::NonceTooLow) => {
                    let previous_nonce = nonce;
                    let fresh = match self.backend.nonce_at(addr).await {
                        Ok(fresh) => fresh,
                        Err(e) => {
                            error!("Failed to read account nonce: {}", e);
                            return Err(SendError::Backend(e.to_string()));
                        }
                    };

                    warn!(
                        previous_nonce,
                        current_nonce = fresh,
                        "Account nonce has increased by another transaction"
                    );

                    raw.with_mut(|r| r.nonce = fresh);
                    {
                        let mut queues = self.queues.write().await;
                        let next = queues.nonce.entry(addr).or_insert(0);
                        // the rebound raw occupies `fresh`; the next add
                        // must assign a strictly larger nonce
                        if *next <= fresh {
                            *next = fresh + 1;
                        }
                        schema::write_addr_nonce(&self.db, addr, *next)?;
                    }

                    continue;
                }
                Err(SendTxError::Rpc(message)) => {
                    error!("Failed to send transaction to root chain: {}", message);
                    return Err(SendError::Backend(message));
                }
            }
        }
    }

    async fn persist_pending(&self, addr: Address) -> Result<(), DbError> {
        let snapshot: Vec<RawTransaction> = {
            let queues = self.queues.read().await;
            queues
                .pending
                .get(&addr)
                .map(|pending| pending.iter().map(|raw| raw.snapshot()).collect())
                .unwrap_or_default()
        };
        schema::write_pending(&self.db, addr, &snapshot)
    }
}
