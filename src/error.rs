//! Error types for the transaction manager

use thiserror::Error;

use crate::chain::backend::BackendError;
use crate::state::db::DbError;
use crate::tx::signer::KeystoreError;

/// Top-level error type for manager operations
#[derive(Error, Debug)]
pub enum TxManagerError {
    #[error("account not found in keystore")]
    UnknownAccount,

    #[error("account is locked")]
    LockedAccount,

    #[error("duplicate raw transaction")]
    DuplicateRaw,

    #[error("there is no duplicate raw transaction")]
    NoDuplicateRaw,

    #[error("database error: {0}")]
    Db(#[from] DbError),

    #[error("root chain backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("keystore error: {0}")]
    Keystore(#[from] KeystoreError),

    #[error("configuration error: {0}")]
    Config(String),
}

impl TxManagerError {
    /// Whether the next tick may succeed without operator intervention
    pub fn is_retryable(&self) -> bool {
        matches!(self, TxManagerError::Backend(_))
    }

    /// Whether the error should page the operator
    pub fn should_alert(&self) -> bool {
        matches!(
            self,
            TxManagerError::UnknownAccount
                | TxManagerError::LockedAccount
                | TxManagerError::Keystore(_)
        )
    }
}

/// Result type for manager operations
pub type TxManagerResult<T> = Result<T, TxManagerError>;
