//! Raw transaction entity, gas price control, signing and the send engine

pub mod gas;
pub mod raw;
pub mod sender;
pub mod signer;

pub use gas::GasPriceController;
pub use raw::{Payload, RawTransaction, SignedVariant, TrackedRaw};
pub use sender::{SendError, SendOutcome};
pub use signer::{Keystore, KeystoreError, LocalKeystore, SignedTx};
