//! Root-chain transaction manager for a Plasma-style layer-2 operator
//!
//! The manager accepts raw transactions from operator subsystems, binds them
//! to monotonically increasing nonces, signs and broadcasts them to the root
//! chain, adapts the gas price to observed failures and tracks each raw
//! through pending, unconfirmed and confirmed, surviving reorgs, restarts
//! and RPC disconnects.

pub mod chain;
pub mod config;
pub mod error;
pub mod manager;
pub mod metrics;
pub mod state;
pub mod tx;

#[cfg(test)]
pub(crate) mod test_utils;

pub use chain::{BackendError, EthereumBackend, RootChainBackend, SendTxError};
pub use config::Settings;
pub use error::{TxManagerError, TxManagerResult};
pub use manager::TransactionManager;
pub use state::{Db, DbError};
pub use tx::{
    Keystore, LocalKeystore, Payload, RawTransaction, SendError, SendOutcome, TrackedRaw,
};
