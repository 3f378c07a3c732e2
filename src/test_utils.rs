//! Scripted root chain backend for tests

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use ethers::types::{Address, Block, Bytes, Transaction, TransactionReceipt, H256, U64};
use ethers::utils::keccak256;
use tokio::sync::mpsc;

use crate::chain::backend::{BackendError, RootChainBackend, SendTxError};

#[derive(Default)]
struct MockState {
    nonces: HashMap<Address, u64>,
    /// Scripted outcomes for upcoming submissions; missing entries accept
    send_results: VecDeque<Result<(), SendTxError>>,
    /// Hashes of accepted submissions, in order
    sent: Vec<H256>,
    receipts: HashMap<H256, TransactionReceipt>,
    /// Transactions reorged off the canonical chain
    dropped: HashSet<H256>,
    blocks: HashMap<H256, Block<H256>>,
    /// Mine every accepted submission right away at (block, status)
    mine_on_send: Option<(u64, u64)>,
    /// Fail this many subscription attempts before succeeding
    subscribe_failures: usize,
}

/// [`RootChainBackend`] double driven entirely from the test body.
#[derive(Default)]
pub(crate) struct MockBackend {
    state: Mutex<MockState>,
    head_senders: Mutex<Vec<mpsc::Sender<Block<H256>>>>,
}

impl MockBackend {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_nonce(&self, addr: Address, nonce: u64) {
        self.state().nonces.insert(addr, nonce);
    }

    /// Queue the outcome of the next submission; `Ok(())` accepts it
    pub(crate) fn queue_send_result(&self, result: Result<(), SendTxError>) {
        self.state().send_results.push_back(result);
    }

    /// Give every accepted submission an immediate receipt
    pub(crate) fn mine_on_send(&self, block_number: u64, status: u64) {
        self.state().mine_on_send = Some((block_number, status));
    }

    /// Record a receipt for an already-submitted transaction
    pub(crate) fn mine(&self, hash: H256, block_number: u64, status: u64) {
        self.state()
            .receipts
            .insert(hash, receipt(hash, block_number, status));
    }

    /// Drop a mined transaction off the canonical chain
    pub(crate) fn reorg_out(&self, hash: H256) {
        let mut state = self.state();
        state.receipts.remove(&hash);
        state.dropped.insert(hash);
    }

    pub(crate) fn sent(&self) -> Vec<H256> {
        self.state().sent.clone()
    }

    pub(crate) fn fail_next_subscribes(&self, count: usize) {
        self.state().subscribe_failures = count;
    }

    /// Close every live subscription stream
    pub(crate) fn drop_subscriptions(&self) {
        self.head_senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub(crate) fn put_block(&self, block: Block<H256>) {
        if let Some(hash) = block.hash {
            self.state().blocks.insert(hash, block);
        }
    }

    /// Deliver a head to every live subscription
    pub(crate) async fn push_head(&self, block: Block<H256>) {
        let senders = {
            let guard = self
                .head_senders
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            guard.clone()
        };
        for sender in senders {
            let _ = sender.send(block.clone()).await;
        }
    }
}

#[async_trait]
impl RootChainBackend for MockBackend {
    async fn nonce_at(&self, addr: Address) -> Result<u64, BackendError> {
        Ok(self.state().nonces.get(&addr).copied().unwrap_or(0))
    }

    async fn send_raw_transaction(&self, rlp: Bytes) -> Result<H256, SendTxError> {
        let hash = H256::from(keccak256(&rlp));
        let mut state = self.state();

        if let Some(result) = state.send_results.pop_front() {
            result?;
        }

        state.sent.push(hash);
        if let Some((block_number, status)) = state.mine_on_send {
            state.receipts.insert(hash, receipt(hash, block_number, status));
        }
        Ok(hash)
    }

    async fn transaction_receipt(
        &self,
        hash: H256,
    ) -> Result<Option<TransactionReceipt>, BackendError> {
        Ok(self.state().receipts.get(&hash).cloned())
    }

    async fn transaction_by_hash(
        &self,
        hash: H256,
    ) -> Result<Option<(Transaction, bool)>, BackendError> {
        let state = self.state();
        if state.dropped.contains(&hash) {
            return Ok(None);
        }
        if let Some(receipt) = state.receipts.get(&hash) {
            let mut tx = Transaction::default();
            tx.hash = hash;
            tx.block_hash = receipt.block_hash.or(Some(H256::repeat_byte(0xb1)));
            return Ok(Some((tx, false)));
        }
        if state.sent.contains(&hash) {
            let mut tx = Transaction::default();
            tx.hash = hash;
            return Ok(Some((tx, true)));
        }
        Ok(None)
    }

    async fn block_by_hash(&self, hash: H256) -> Result<Option<Block<H256>>, BackendError> {
        Ok(self.state().blocks.get(&hash).cloned())
    }

    async fn subscribe_new_heads(&self) -> Result<mpsc::Receiver<Block<H256>>, BackendError> {
        {
            let mut state = self.state();
            if state.subscribe_failures > 0 {
                state.subscribe_failures -= 1;
                return Err(BackendError::Subscription("connection refused".to_string()));
            }
        }

        let (sender, receiver) = mpsc::channel(16);
        self.head_senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sender);
        Ok(receiver)
    }
}

fn receipt(hash: H256, block_number: u64, status: u64) -> TransactionReceipt {
    TransactionReceipt {
        transaction_hash: hash,
        block_number: Some(U64::from(block_number)),
        block_hash: Some(H256::repeat_byte(0xb1)),
        status: Some(U64::from(status)),
        ..Default::default()
    }
}

/// Bare header carrying only what the tracker reads
pub(crate) fn head(number: u64) -> Block<H256> {
    Block {
        number: Some(U64::from(number)),
        hash: Some(H256::from_low_u64_be(number)),
        ..Default::default()
    }
}
