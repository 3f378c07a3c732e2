//! Process-wide gas price controller
//!
//! A single clamped price shared by every account of the operator. The price
//! is bumped multiplicatively on send failures and cut after successful
//! mining, which converges on the lowest price the network currently accepts.

use ethers::types::U256;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::chain::backend::RootChainBackend;
use crate::config::ManagerConfig;
use crate::state::db::{Db, DbError};
use crate::state::schema;
use crate::tx::raw::TrackedRaw;

/// Fallback initial price when neither the store nor the config carries one
const DEFAULT_GAS_PRICE_WEI: u64 = 10_000_000_000;

pub struct GasPriceController {
    min: U256,
    max: U256,
    price: Mutex<U256>,
    db: Db,
}

impl GasPriceController {
    /// Restore the controller from the store, falling back to the configured
    /// initial price and clamping into the configured bounds.
    pub fn load(db: Db, config: &ManagerConfig) -> Result<Self, DbError> {
        let min = config.min_gas_price();
        let max = config.max_gas_price();

        let mut price = match schema::read_gas_price(&db)? {
            Some(stored) if !stored.is_zero() => stored,
            _ => config.gas_price(),
        };

        if price.is_zero() {
            price = U256::from(DEFAULT_GAS_PRICE_WEI);
            info!(gasprice = %gwei(price), "Use default gas price");
        }

        if price < min {
            warn!("Gas price is below the min gas price.");
            price = min;
        }
        if price > max {
            warn!("Gas price is above the max gas price.");
            price = max;
        }

        schema::write_gas_price(&db, price)?;
        crate::metrics::record_gas_price(price);

        Ok(Self {
            min,
            max,
            price: Mutex::new(price),
            db,
        })
    }

    pub async fn current(&self) -> U256 {
        *self.price.lock().await
    }

    /// Raise the price after a send failure: clamp(current * 1.2)
    pub async fn bump(&self, raw: &TrackedRaw, backend: &dyn RootChainBackend) -> U256 {
        self.adjust(raw, backend, false).await
    }

    /// Lower the price after successful mining: clamp(current * 0.4)
    pub async fn cut(&self, raw: &TrackedRaw, backend: &dyn RootChainBackend) -> U256 {
        self.adjust(raw, backend, true).await
    }

    async fn adjust(
        &self,
        raw: &TrackedRaw,
        backend: &dyn RootChainBackend,
        decrease: bool,
    ) -> U256 {
        let mut price = self.price.lock().await;

        // The price the raw last went out with, for the adjustment log. Read
        // from the chain or the persisted variants rather than in-memory
        // history so the line stays truthful across restarts.
        let previous = match raw.with(|r| r.mined()) {
            Some(mined_hash) => match backend.transaction_by_hash(mined_hash).await {
                Ok(Some((tx, false))) => tx.gas_price.unwrap_or(*price),
                // mined hash without a canonical tx: a reorg is in flight,
                // leave the price alone
                _ => return *price,
            },
            None => raw.with(|r| {
                r.pending_txs
                    .last()
                    .map(|variant| variant.gas_price)
                    .unwrap_or(*price)
            }),
        };

        let adjusted = if decrease {
            *price / 10u64 * 4u64
        } else {
            *price / 10u64 * 12u64
        };
        let adjusted = adjusted.clamp(self.min, self.max);

        *price = adjusted;

        if let Err(e) = schema::write_gas_price(&self.db, adjusted) {
            error!("Failed to persist gas price: {}", e);
        }
        crate::metrics::record_gas_price(adjusted);

        info!(
            caption = %raw.with(|r| r.caption().to_string()),
            decrease,
            previous = %gwei(previous),
            adjusted = %gwei(adjusted),
            "Gas price adjusted"
        );

        adjusted
    }
}

/// Render a wei amount as a gwei string for log lines
pub(crate) fn gwei(price: U256) -> String {
    let gwei_unit = U256::exp10(9);
    let whole = price / gwei_unit;
    let milli = (price % gwei_unit) / U256::exp10(6);
    format!("{}.{:03} gwei", whole, milli.as_u64())
}
