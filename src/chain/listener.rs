//! Header tracker: new-head subscription with reconnection
//!
//! Owns the single subscription to the root chain's new-head stream. Every
//! head advances the shared head number and is fanned out to the send
//! engine's wait sites; confirmation passes run behind a small debounce so a
//! burst of heads during fast sync does not trigger one pass per head.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::chain::backend::RootChainBackend;
use crate::manager::TransactionManager;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Run the header loop until shutdown. On subscription failure or stream end
/// the loop resubscribes, backing off when the backend stays unreachable.
pub(crate) async fn run_header_loop(
    backend: Arc<dyn RootChainBackend>,
    manager: TransactionManager,
    mut quit: watch::Receiver<bool>,
    confirmation_delay: u64,
) {
    let mut last_confirmed: u64 = 0;

    loop {
        let mut heads = match backend.subscribe_new_heads().await {
            Ok(heads) => heads,
            Err(e) => {
                error!("Failed to subscribe root chain new block event: {}", e);
                tokio::select! {
                    _ = quit.changed() => return,
                    _ = tokio::time::sleep(RECONNECT_DELAY) => continue,
                }
            }
        };
        info!("Subscribed to root chain new block events");

        loop {
            tokio::select! {
                _ = quit.changed() => return,
                head = heads.recv() => {
                    let Some(block) = head else {
                        error!("New block event unsubscribed, re-subscribing");
                        break;
                    };

                    let Some(number) = block.number.map(|n| n.as_u64()) else {
                        continue;
                    };

                    manager.on_new_head(number).await;

                    // the subscription delivers bare headers; fetch the block
                    // for the summary log line
                    if let Some(hash) = block.hash {
                        match backend.block_by_hash(hash).await {
                            Ok(Some(block)) => info!(
                                number,
                                num_txs = block.transactions.len(),
                                gas_used = %block.gas_used,
                                gas_limit = %block.gas_limit,
                                "New root chain block mined"
                            ),
                            Ok(None) => info!(number, "New root chain block mined"),
                            Err(e) => warn!("Failed to read root chain block: {}", e),
                        }
                    }

                    if last_confirmed == 0 {
                        last_confirmed = number;
                    }

                    // debounce: skip confirmation while heads arrive far
                    // ahead of the last confirmed position
                    if last_confirmed + confirmation_delay < number {
                        continue;
                    }

                    last_confirmed = number;
                    manager.confirm_all().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ManagerConfig;
    use crate::manager::TransactionManager;
    use crate::state::db::test_utils::run_test_db;
    use crate::state::db::Db;
    use crate::test_utils::{head, MockBackend};
    use crate::tx::signer::{Keystore, LocalKeystore};
    use ethers::prelude::LocalWallet;
    use tokio::time::timeout;

    async fn manager_with(db: Db, backend: Arc<MockBackend>) -> TransactionManager {
        let wallet: LocalWallet =
            "0000000000000000000000000000000000000000000000000000000000000001"
                .parse()
                .unwrap();
        let keystore: Arc<dyn Keystore> = Arc::new(LocalKeystore::new(vec![wallet]));
        let backend: Arc<dyn RootChainBackend> = backend;
        let config = ManagerConfig {
            chain_id: 1337,
            interval_ms: 50,
            gas_price_gwei: 10,
            min_gas_price_gwei: 1,
            max_gas_price_gwei: 100,
            confirmations: 32,
            confirmation_delay: 4,
            send_delay: 2,
            max_known_tx: 5,
        };
        TransactionManager::new(keystore, backend, db, config)
            .await
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn heads_advance_the_shared_block_number() {
        run_test_db(|db| async move {
            let backend = Arc::new(MockBackend::new());
            let manager = manager_with(db, backend.clone()).await;

            let (quit_tx, quit_rx) = watch::channel(false);
            let task = {
                let backend: Arc<dyn RootChainBackend> = backend.clone();
                let manager = manager.clone();
                tokio::spawn(run_header_loop(backend, manager, quit_rx, 4))
            };

            // the tracker fetches the full block for its summary log line
            backend.put_block(head(100));

            timeout(Duration::from_secs(10), async {
                loop {
                    backend.push_head(head(100)).await;
                    if manager.current_block().await == 100 {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
            .await
            .unwrap();

            let _ = quit_tx.send(true);
            timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn resubscribes_after_subscription_failure() {
        run_test_db(|db| async move {
            let backend = Arc::new(MockBackend::new());
            let manager = manager_with(db, backend.clone()).await;

            // the first attempt is refused; the loop backs off and retries
            backend.fail_next_subscribes(1);

            let (quit_tx, quit_rx) = watch::channel(false);
            let task = {
                let backend: Arc<dyn RootChainBackend> = backend.clone();
                let manager = manager.clone();
                tokio::spawn(run_header_loop(backend, manager, quit_rx, 4))
            };

            // paused time fast-forwards the 5s reconnect delay; heads flow
            // once the second subscription attempt lands
            timeout(Duration::from_secs(30), async {
                loop {
                    backend.push_head(head(42)).await;
                    if manager.current_block().await == 42 {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
            .await
            .unwrap();

            let _ = quit_tx.send(true);
            timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn stream_end_triggers_resubscription() {
        run_test_db(|db| async move {
            let backend = Arc::new(MockBackend::new());
            let manager = manager_with(db, backend.clone()).await;

            let (quit_tx, quit_rx) = watch::channel(false);
            let task = {
                let backend: Arc<dyn RootChainBackend> = backend.clone();
                let manager = manager.clone();
                tokio::spawn(run_header_loop(backend, manager, quit_rx, 4))
            };

            timeout(Duration::from_secs(10), async {
                loop {
                    backend.push_head(head(7)).await;
                    if manager.current_block().await == 7 {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
            .await
            .unwrap();

            // dropping the live subscription ends the stream; the loop must
            // come back with a fresh one and keep following heads
            backend.drop_subscriptions();

            timeout(Duration::from_secs(10), async {
                loop {
                    backend.push_head(head(9)).await;
                    if manager.current_block().await == 9 {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
            .await
            .unwrap();

            let _ = quit_tx.send(true);
            timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        })
        .await;
    }
}
