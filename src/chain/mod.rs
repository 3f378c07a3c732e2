//! Root chain access: the backend seam and the header tracker

pub mod backend;
pub(crate) mod listener;

pub use backend::{
    classify_send_error, BackendError, EthereumBackend, RootChainBackend, SendTxError,
};
