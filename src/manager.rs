//! Transaction manager: per-account queues and the tick loop
//!
//! Every account owns three ordered queues. A raw transaction enters
//! `pending` on add, moves to `unconfirmed` once a signed variant is mined,
//! and to the append-only `confirmed` log once it is deep enough. A reorg
//! moves it back from `unconfirmed` to `pending`. Queue passes only ever pop
//! prefixes, which keeps indices and nonces contiguous across the three
//! queues.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ethers::types::{Address, H256};
use tokio::sync::{broadcast, watch, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, trace, warn};

use crate::chain::backend::RootChainBackend;
use crate::chain::listener;
use crate::config::ManagerConfig;
use crate::error::{TxManagerError, TxManagerResult};
use crate::state::db::Db;
use crate::state::schema;
use crate::tx::gas::GasPriceController;
use crate::tx::raw::{RawTransaction, TrackedRaw};
use crate::tx::sender::{SendEngine, SendError, SendOutcome};
use crate::tx::signer::Keystore;

const INSPECT_INTERVAL: Duration = Duration::from_secs(5);

/// Queue state shared by the tick workers, the send engine and the header
/// tracker. All of it lives under one RwLock.
#[derive(Default)]
pub(crate) struct Queues {
    pub(crate) addresses: Vec<Address>,
    pub(crate) pending: HashMap<Address, VecDeque<Arc<TrackedRaw>>>,
    pub(crate) unconfirmed: HashMap<Address, VecDeque<Arc<TrackedRaw>>>,
    pub(crate) confirmed: HashMap<Address, Vec<Arc<TrackedRaw>>>,
    /// Next assignable nonce per account
    pub(crate) nonce: HashMap<Address, u64>,
    /// Latest head number seen by the header tracker
    pub(crate) current_block: u64,
    /// Known-transaction error counter per concrete tx hash
    pub(crate) num_known_err: HashMap<H256, u64>,
    last_inspect: Option<Instant>,
}

struct Inner {
    config: ManagerConfig,
    backend: Arc<dyn RootChainBackend>,
    keystore: Arc<dyn Keystore>,
    db: Db,
    queues: Arc<RwLock<Queues>>,
    gas: Arc<GasPriceController>,
    sender: SendEngine,
    heads: broadcast::Sender<u64>,
    quit: watch::Sender<bool>,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

/// Durable, per-account pipeline binding raw transactions to nonces and
/// tracking them through pending, unconfirmed and confirmed.
#[derive(Clone)]
pub struct TransactionManager {
    inner: Arc<Inner>,
}

impl TransactionManager {
    /// Restore manager state from the store and wire up the send engine.
    pub async fn new(
        keystore: Arc<dyn Keystore>,
        backend: Arc<dyn RootChainBackend>,
        db: Db,
        config: ManagerConfig,
    ) -> TxManagerResult<Self> {
        if config.min_gas_price() > config.max_gas_price() {
            return Err(TxManagerError::Config(
                "min gas price cannot exceed max gas price".to_string(),
            ));
        }

        let gas = Arc::new(GasPriceController::load(db.clone(), &config)?);
        let queues = Arc::new(RwLock::new(Queues::default()));
        let (heads, _) = broadcast::channel(256);
        let (quit, _) = watch::channel(false);

        {
            let mut q = queues.write().await;
            let num_addrs = schema::read_num_addr(&db)?;

            for i in 0..num_addrs {
                let Some(addr) = schema::read_addr(&db, i)? else {
                    error!(index = i, "Missing account record, skipping");
                    continue;
                };

                if q.nonce.contains_key(&addr) {
                    error!(?addr, "Duplicated account found");
                    continue;
                }
                q.addresses.push(addr);

                let num_confirmed = schema::read_num_confirmed(&db, addr)?;
                let mut confirmed = Vec::with_capacity(num_confirmed as usize);
                for j in 0..num_confirmed {
                    match schema::read_confirmed(&db, addr, j)? {
                        Some(raw) => confirmed.push(TrackedRaw::new(raw)),
                        None => error!(?addr, index = j, "Missing confirmed log entry"),
                    }
                }
                info!(?addr, num_confirmed, "Previous account loaded");
                q.confirmed.insert(addr, confirmed);

                let unconfirmed: VecDeque<_> = schema::read_unconfirmed(&db, addr)?
                    .into_iter()
                    .map(TrackedRaw::new)
                    .collect();
                q.unconfirmed.insert(addr, unconfirmed);

                let pending: VecDeque<_> = schema::read_pending(&db, addr)?
                    .into_iter()
                    .map(TrackedRaw::new)
                    .collect();
                info!(?addr, txs = pending.len(), "Previous transactions are loaded");
                q.pending.insert(addr, pending);

                let nonce = match schema::read_addr_nonce(&db, addr)? {
                    Some(nonce) if nonce != 0 => nonce,
                    _ => {
                        let nonce = backend.nonce_at(addr).await.map_err(|e| {
                            error!("Failed to read account nonce: {}", e);
                            e
                        })?;
                        schema::write_addr_nonce(&db, addr, nonce)?;
                        nonce
                    }
                };
                q.nonce.insert(addr, nonce);

                inspect(addr, &q);
            }

            info!(num_accounts = num_addrs, "Transaction manager loaded");
        }

        let sender = SendEngine::new(
            config.chain_id,
            config.send_delay,
            config.max_known_tx,
            backend.clone(),
            keystore.clone(),
            db.clone(),
            gas.clone(),
            queues.clone(),
            heads.clone(),
            quit.subscribe(),
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                backend,
                keystore,
                db,
                queues,
                gas,
                sender,
                heads,
                quit,
                tasks: tokio::sync::Mutex::new(Vec::new()),
            }),
        })
    }

    /// Enqueue a raw transaction: assign index and nonce, persist, enter the
    /// pending queue.
    ///
    /// With `duplicate` unset, a payload hash may only be declared once per
    /// account. With it set, the hash must already exist: that is how callers
    /// intentionally submit identical payloads under independent nonces.
    pub async fn add(
        &self,
        account: Address,
        mut raw: RawTransaction,
        duplicate: bool,
    ) -> TxManagerResult<()> {
        let inner = &self.inner;
        let mut q = inner.queues.write().await;

        if !inner.keystore.has_address(account) {
            return Err(TxManagerError::UnknownAccount);
        }

        raw.from = account;

        // the first raw from an account registers it
        if !q.nonce.contains_key(&account) {
            let registered = q.addresses.len() as u64;
            schema::write_num_addr(&inner.db, registered + 1)?;
            schema::write_addr(&inner.db, registered, account)?;
            q.addresses.push(account);
            q.pending.insert(account, VecDeque::new());
            q.unconfirmed.insert(account, VecDeque::new());
            q.confirmed.insert(account, Vec::new());

            let nonce = inner.backend.nonce_at(account).await?;
            schema::write_addr_nonce(&inner.db, account, nonce)?;
            q.nonce.insert(account, nonce);

            debug!(?account, "New account is added to transaction manager");
        }

        let hash = raw.hash();
        if !duplicate {
            if schema::read_raw_index(&inner.db, account, hash)?.is_some() {
                return Err(TxManagerError::DuplicateRaw);
            }
        } else if schema::read_raw_index(&inner.db, account, hash)?.is_none() {
            return Err(TxManagerError::NoDuplicateRaw);
        }

        // assign index
        let index = schema::read_num_raw(&inner.db, account)?;
        raw.index = index;
        if !duplicate {
            schema::write_raw_index(&inner.db, account, hash, index)?;
        }
        schema::write_num_raw(&inner.db, account, index + 1)?;

        // assign nonce
        let nonce = q.nonce.get(&account).copied().unwrap_or(0);
        raw.nonce = nonce;
        q.nonce.insert(account, nonce + 1);
        schema::write_addr_nonce(&inner.db, account, nonce + 1)?;

        info!(
            caption = raw.caption(),
            from = ?raw.from,
            index,
            nonce,
            "Raw transaction added"
        );

        q.pending.entry(account).or_default().push_back(TrackedRaw::new(raw));
        persist_pending(&inner.db, account, &q)?;

        inspect(account, &q);
        q.last_inspect = Some(Instant::now());

        Ok(())
    }

    /// How many confirmed raw transactions of `account` carry this payload
    /// hash. Callers use it to check inclusion of an operation.
    pub async fn count(&self, account: Address, hash: H256) -> u64 {
        let q = self.inner.queues.read().await;
        q.confirmed
            .get(&account)
            .map(|log| {
                log.iter()
                    .filter(|raw| raw.with(|r| r.hash() == hash))
                    .count() as u64
            })
            .unwrap_or(0)
    }

    /// Start the tick loop and the header tracker.
    pub async fn start(&self) {
        let mut tasks = self.inner.tasks.lock().await;

        let ticker = {
            let manager = self.clone();
            tokio::spawn(async move { manager.tick_loop().await })
        };
        tasks.push(ticker);

        let header = {
            let manager = self.clone();
            let backend = self.inner.backend.clone();
            let quit = self.inner.quit.subscribe();
            let delay = self.inner.config.confirmation_delay;
            tokio::spawn(async move { listener::run_header_loop(backend, manager, quit, delay).await })
        };
        tasks.push(header);

        info!("Transaction manager started");
    }

    /// Signal shutdown and wait for the tick loop (including its in-flight
    /// per-account workers) and the header tracker to finish. Store writes
    /// begun before this returns have committed.
    pub async fn stop(&self) {
        let _ = self.inner.quit.send(true);

        let mut tasks = self.inner.tasks.lock().await;
        for task in tasks.drain(..) {
            if let Err(e) = task.await {
                error!("Manager task ended abnormally: {}", e);
            }
        }

        info!("Transaction manager stopped");
    }

    async fn tick_loop(&self) {
        let mut quit = self.inner.quit.subscribe();
        let mut ticker =
            tokio::time::interval(Duration::from_millis(self.inner.config.interval_ms));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = quit.changed() => {
                    info!("TransactionManager tick loop stopped");
                    return;
                }
                _ = ticker.tick() => {
                    let addresses = {
                        let q = self.inner.queues.read().await;
                        q.addresses.clone()
                    };

                    let mut workers = JoinSet::new();
                    for addr in addresses {
                        let manager = self.clone();
                        workers.spawn(async move { manager.drive_account(addr).await });
                    }
                    while workers.join_next().await.is_some() {}
                }
            }
        }
    }

    /// One tick for one account: detect mining, advance confirmations, then
    /// drive a send attempt on the head of the pending queue.
    pub(crate) async fn drive_account(&self, addr: Address) {
        trace!(?addr, "TransactionManager iterates");

        self.clear_queue(addr).await;
        self.confirm_queue(addr).await;

        let raw = {
            let q = self.inner.queues.read().await;
            q.pending.get(&addr).and_then(|pending| pending.front().cloned())
        };
        let Some(raw) = raw else { return };

        let backend = self.inner.backend.as_ref();
        let first = self.inner.sender.send(addr, &raw).await;

        let hash = match first {
            Ok(SendOutcome::Throttled) | Ok(SendOutcome::AlreadyMined(_)) => return,
            Ok(SendOutcome::Sent(hash)) | Ok(SendOutcome::AlreadyPending(hash)) => hash,
            Err(SendError::ReplaceUnderpriced) => {
                debug!("Gas price is bumped for underpriced transaction error");
                self.inner.gas.bump(&raw, backend).await;
                self.resend(addr, &raw).await;
                return;
            }
            Err(SendError::InsufficientFunds) => {
                error!(?addr, "Account doesn't have enough fund to run the chain.");
                return;
            }
            Err(SendError::KnownTransaction(hash)) => hash,
            Err(SendError::Keystore(e)) => {
                error!(?addr, "Signing failed, not retrying this tick: {}", e);
                return;
            }
            Err(e) => {
                debug!("Unknown transaction error: {}", e);
                self.inner.gas.bump(&raw, backend).await;
                self.resend(addr, &raw).await;
                return;
            }
        };

        // probe whether the submitted variant already has a receipt
        match backend.transaction_receipt(hash).await {
            Ok(Some(receipt)) => {
                debug!(
                    caption = %raw.with(|r| r.caption().to_string()),
                    hash = ?receipt.transaction_hash,
                    "Raw transaction is already mined"
                );
            }
            Ok(None) => {
                // known-transaction retries still counting toward the cap are
                // deferred to the next tick
                let deferred = {
                    let q = self.inner.queues.read().await;
                    q.num_known_err.get(&hash).copied().unwrap_or(0) != 0
                };
                if deferred {
                    return;
                }

                warn!(
                    caption = %raw.with(|r| r.caption().to_string()),
                    hash = ?hash,
                    "Transaction not found after submit. It may be pending"
                );
                self.inner.gas.bump(&raw, backend).await;
                self.resend(addr, &raw).await;
            }
            Err(e) => warn!("Failed to read transaction receipt: {}", e),
        }
    }

    async fn resend(&self, addr: Address, raw: &Arc<TrackedRaw>) {
        match self.inner.sender.send(addr, raw).await {
            Ok(_) | Err(SendError::KnownTransaction(_)) => {}
            Err(e) => error!("Failed to submit transaction to root chain: {}", e),
        }
    }

    /// Detect mined raws at the head of the pending queue and migrate the
    /// mined prefix to `unconfirmed`. The scan halts at the first raw without
    /// a receipt.
    pub(crate) async fn clear_queue(&self, addr: Address) {
        let inner = &self.inner;
        let mut q = inner.queues.write().await;

        let len = q.pending.get(&addr).map(VecDeque::len).unwrap_or(0);
        if len == 0 {
            return;
        }

        let mut mined = 0usize;
        while mined < len {
            let Some(raw) = q.pending.get(&addr).and_then(|p| p.get(mined)).cloned() else {
                break;
            };

            match raw.check_mined(inner.backend.as_ref()).await {
                Err(e) => {
                    error!(
                        caption = %raw.with(|r| r.caption().to_string()),
                        "Failed to clear pending transactions. Check rootchain provider: {}", e
                    );
                    break;
                }
                Ok(None) => break,
                Ok(Some(hash)) => {
                    let (nonce, reverted, allow_revert, caption) = raw.with(|r| {
                        (r.nonce, r.reverted, r.allow_revert, r.caption().to_string())
                    });
                    info!(
                        nonce,
                        %caption,
                        reverted,
                        from = ?addr,
                        hash = ?hash,
                        "Transaction is mined"
                    );
                    if reverted {
                        crate::metrics::record_tx_reverted();
                        if allow_revert {
                            warn!(%caption, hash = ?hash, "Transaction is reverted");
                        } else {
                            error!(%caption, hash = ?hash, "Transaction is reverted");
                        }
                    }

                    // the market tolerated this price; try a lower one next
                    inner.gas.cut(&raw, inner.backend.as_ref()).await;
                    crate::metrics::record_tx_mined();
                    mined += 1;
                }
            }
        }

        if mined > 0 {
            let moved: Vec<_> = match q.pending.get_mut(&addr) {
                Some(pending) => pending.drain(..mined).collect(),
                None => Vec::new(),
            };
            q.unconfirmed.entry(addr).or_default().extend(moved);
            if let Err(e) = persist_pending(&inner.db, addr, &q) {
                error!("Failed to persist pending queue: {}", e);
            }
            if let Err(e) = persist_unconfirmed(&inner.db, addr, &q) {
                error!("Failed to persist unconfirmed queue: {}", e);
            }
        }

        record_queue_sizes(addr, &q);
    }

    /// Advance the unconfirmed queue: re-enqueue reorged raws into pending,
    /// then pop the prefix that reached confirmation depth into the durable
    /// confirmed log.
    pub(crate) async fn confirm_queue(&self, addr: Address) {
        let inner = &self.inner;
        let mut q = inner.queues.write().await;

        if q.last_inspect.map_or(true, |t| t.elapsed() > INSPECT_INTERVAL) {
            inspect(addr, &q);
            q.last_inspect = Some(Instant::now());
        }

        let len = q.unconfirmed.get(&addr).map(VecDeque::len).unwrap_or(0);
        if len == 0 {
            return;
        }

        // reorged raws go back to pending and are resent with a fresh variant
        let mut kept: VecDeque<Arc<TrackedRaw>> = VecDeque::with_capacity(len);
        let mut removed_any = false;
        let mut scanned = 0usize;
        while scanned < len {
            let Some(raw) = q.unconfirmed.get(&addr).and_then(|u| u.get(scanned)).cloned() else {
                break;
            };

            match raw.removed(inner.backend.as_ref()).await {
                Err(e) => {
                    error!("Failed to check transaction is removed: {}", e);
                    break;
                }
                Ok(true) => {
                    info!(
                        ?addr,
                        caption = %raw.with(|r| r.caption().to_string()),
                        "Raw transaction is removed"
                    );
                    crate::metrics::record_tx_reorged();
                    raw.with_mut(|r| r.prepare_to_resend());
                    q.pending.entry(addr).or_default().push_back(raw);
                    removed_any = true;
                }
                Ok(false) => kept.push_back(raw),
            }
            scanned += 1;
        }

        if removed_any {
            if let Some(unconfirmed) = q.unconfirmed.get_mut(&addr) {
                // the unscanned tail survives a mid-pass backend failure
                let tail: Vec<_> = unconfirmed.iter().skip(scanned).cloned().collect();
                kept.extend(tail);
                *unconfirmed = kept;
            }
            if let Some(pending) = q.pending.get_mut(&addr) {
                pending
                    .make_contiguous()
                    .sort_by_key(|raw| raw.with(|r| r.index));
            }
            if let Err(e) = persist_unconfirmed(&inner.db, addr, &q) {
                error!("Failed to persist unconfirmed queue: {}", e);
            }
            if let Err(e) = persist_pending(&inner.db, addr, &q) {
                error!("Failed to persist pending queue: {}", e);
            }
        }

        // pop the confirmed-depth prefix into the durable log
        let current_block = q.current_block;
        let mut num_confirmed = match schema::read_num_confirmed(&inner.db, addr) {
            Ok(count) => count,
            Err(e) => {
                error!("Failed to read confirmed log length: {}", e);
                return;
            }
        };
        let mut advanced = 0usize;

        loop {
            let Some(raw) = q.unconfirmed.get(&addr).and_then(|u| u.front()).cloned() else {
                break;
            };
            debug!(
                ?addr,
                caption = %raw.with(|r| r.caption().to_string()),
                "Check raw transaction is confirmed"
            );

            let confirmed = match raw
                .confirmed_at(
                    inner.backend.as_ref(),
                    current_block,
                    inner.config.confirmations,
                )
                .await
            {
                Ok(confirmed) => confirmed,
                Err(e) => {
                    error!("Failed to check transaction is confirmed: {}", e);
                    break;
                }
            };
            if !confirmed {
                break;
            }

            let (reverted, allow_revert, caption) =
                raw.with(|r| (r.reverted, r.allow_revert, r.caption().to_string()));
            if reverted && !allow_revert {
                // the chain state is final; confirm anyway and make noise
                error!(?addr, %caption, "Reverted transaction is confirmed");
            }

            raw.with_mut(|r| r.confirmed_index = num_confirmed);
            if let Err(e) = schema::write_confirmed(&inner.db, addr, num_confirmed, &raw.snapshot())
            {
                error!("Failed to persist confirmed transaction: {}", e);
                break;
            }

            info!(?addr, %caption, confirmed_index = num_confirmed, "Transaction is confirmed");
            crate::metrics::record_tx_confirmed();

            q.confirmed.entry(addr).or_default().push(raw);
            if let Some(unconfirmed) = q.unconfirmed.get_mut(&addr) {
                unconfirmed.pop_front();
            }
            num_confirmed += 1;
            advanced += 1;
        }

        if advanced > 0 {
            if let Err(e) = schema::write_num_confirmed(&inner.db, addr, num_confirmed) {
                error!("Failed to persist confirmed log length: {}", e);
            }
            if let Err(e) = persist_unconfirmed(&inner.db, addr, &q) {
                error!("Failed to persist unconfirmed queue: {}", e);
            }
        }

        record_queue_sizes(addr, &q);
    }

    /// Record a new head: advance the shared head number and wake any
    /// known-transaction waits.
    pub(crate) async fn on_new_head(&self, number: u64) {
        {
            let mut q = self.inner.queues.write().await;
            if number > q.current_block {
                q.current_block = number;
            }
        }
        crate::metrics::record_block_height(number);
        let _ = self.inner.heads.send(number);
    }

    /// Run a confirmation pass for every known account.
    pub(crate) async fn confirm_all(&self) {
        let addresses = {
            let q = self.inner.queues.read().await;
            q.addresses.clone()
        };
        for addr in addresses {
            self.confirm_queue(addr).await;
        }
    }
}

fn inspect(addr: Address, q: &Queues) {
    let confirmed = q.confirmed.get(&addr).map(Vec::len).unwrap_or(0);
    let unconfirmed = q.unconfirmed.get(&addr).map(VecDeque::len).unwrap_or(0);
    let pending = q.pending.get(&addr).map(VecDeque::len).unwrap_or(0);
    debug!(
        ?addr,
        total = confirmed + unconfirmed + pending,
        confirmed,
        unconfirmed,
        pending,
        "Inspect queue"
    );
}

fn record_queue_sizes(addr: Address, q: &Queues) {
    crate::metrics::record_queue_sizes(
        addr,
        q.pending.get(&addr).map(VecDeque::len).unwrap_or(0),
        q.unconfirmed.get(&addr).map(VecDeque::len).unwrap_or(0),
        q.confirmed.get(&addr).map(Vec::len).unwrap_or(0),
    );
}

fn persist_pending(db: &Db, addr: Address, q: &Queues) -> Result<(), crate::state::db::DbError> {
    let snapshot: Vec<RawTransaction> = q
        .pending
        .get(&addr)
        .map(|pending| pending.iter().map(|raw| raw.snapshot()).collect())
        .unwrap_or_default();
    schema::write_pending(db, addr, &snapshot)
}

fn persist_unconfirmed(
    db: &Db,
    addr: Address,
    q: &Queues,
) -> Result<(), crate::state::db::DbError> {
    let snapshot: Vec<RawTransaction> = q
        .unconfirmed
        .get(&addr)
        .map(|unconfirmed| unconfirmed.iter().map(|raw| raw.snapshot()).collect())
        .unwrap_or_default();
    schema::write_unconfirmed(db, addr, &snapshot)
}

#[cfg(test)]
impl TransactionManager {
    pub(crate) async fn current_block(&self) -> u64 {
        self.inner.queues.read().await.current_block
    }
}
