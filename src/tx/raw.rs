//! Raw transaction entity
//!
//! A raw transaction is an operator-level outbound request. It may be
//! realized as several signed concrete transactions that differ only in gas
//! price and share one nonce; at most one of them can ever be mined.

use std::io::{self, ErrorKind, Read, Write};
use std::sync::{Arc, Mutex, PoisonError};

use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, TransactionRequest, H256, U256};
use ethers::utils::keccak256;

use crate::chain::backend::{BackendError, RootChainBackend};
use crate::state::db::{Decode, Encode};

/// Encoding version for persisted raw transactions. Decoders ignore unknown
/// trailing bytes so fields can be appended under the same version policy.
const RAW_ENCODING_VERSION: u8 = 1;

/// Contract-level content carried by a raw transaction, opaque to the manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub to: Option<Address>,
    pub value: U256,
    pub data: Bytes,
    pub gas_limit: U256,
    /// Short human-readable tag used in log lines
    pub caption: Option<String>,
}

/// A signed concrete transaction previously broadcast for a raw
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedVariant {
    pub hash: H256,
    pub nonce: u64,
    pub gas_price: U256,
    pub rlp: Bytes,
}

/// Per-submission state of one raw transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTransaction {
    /// Stable per-account submission sequence, assigned on add
    pub index: u64,
    /// On-chain nonce bound to this raw; rebound if the provider reports
    /// "nonce too low"
    pub nonce: u64,
    /// Owning account
    pub from: Address,
    pub payload: Payload,
    /// Signed variants broadcast so far, in broadcast order
    pub pending_txs: Vec<SignedVariant>,
    /// Hash of the mined variant, zero while none is mined
    pub mined_tx_hash: H256,
    /// Block the mined variant was first seen in
    pub mined_block_number: Option<u64>,
    /// Mined receipt had status 0
    pub reverted: bool,
    /// Caller-declared: a revert is tolerated rather than fatal
    pub allow_revert: bool,
    /// Position in the per-account confirmed log
    pub confirmed_index: u64,
    /// Head number at which a variant was last broadcast, resubmit throttle
    pub last_sent_block_number: u64,
}

impl RawTransaction {
    pub fn new(from: Address, payload: Payload, allow_revert: bool) -> Self {
        Self {
            index: 0,
            nonce: 0,
            from,
            payload,
            pending_txs: Vec::new(),
            mined_tx_hash: H256::zero(),
            mined_block_number: None,
            reverted: false,
            allow_revert,
            confirmed_index: 0,
            last_sent_block_number: 0,
        }
    }

    /// Identity hash of the raw: the keccak of the transaction content (to,
    /// value, data, gas limit). The caption and the mutable bookkeeping
    /// fields are excluded, so the hash is stable across nonce rebinding and
    /// duplicate-declared raws share it while occupying distinct indices.
    pub fn hash(&self) -> H256 {
        let mut buf = vec![];
        match self.payload.to {
            Some(to) => {
                buf.push(1);
                buf.extend_from_slice(to.as_bytes());
            }
            None => buf.push(0),
        }
        self.payload
            .value
            .write_to(&mut buf)
            .and_then(|_| self.payload.data.to_vec().write_to(&mut buf))
            .and_then(|_| self.payload.gas_limit.write_to(&mut buf))
            .expect("!alloc");
        H256::from(keccak256(&buf))
    }

    /// Hash of the mined variant, if any
    pub fn mined(&self) -> Option<H256> {
        if self.mined_tx_hash.is_zero() {
            None
        } else {
            Some(self.mined_tx_hash)
        }
    }

    pub fn caption(&self) -> &str {
        self.payload.caption.as_deref().unwrap_or("raw tx")
    }

    /// Build the concrete legacy transaction for the current gas price
    pub fn to_transaction(&self, gas_price: U256, chain_id: u64) -> TypedTransaction {
        let mut request = TransactionRequest::new()
            .from(self.from)
            .value(self.payload.value)
            .data(self.payload.data.clone())
            .gas(self.payload.gas_limit)
            .gas_price(gas_price)
            .nonce(self.nonce)
            .chain_id(chain_id);

        if let Some(to) = self.payload.to {
            request = request.to(to);
        }

        TypedTransaction::Legacy(request)
    }

    pub fn has_pending(&self, hash: H256) -> bool {
        self.pending_txs.iter().any(|v| v.hash == hash)
    }

    pub fn add_pending(&mut self, variant: SignedVariant) {
        if !self.has_pending(variant.hash) {
            self.pending_txs.push(variant);
        }
    }

    /// Reset the raw for resubmission after its mined variant dropped off the
    /// canonical chain. Nonce and index are kept; the stale variants are not.
    pub fn prepare_to_resend(&mut self) {
        self.mined_tx_hash = H256::zero();
        self.mined_block_number = None;
        self.reverted = false;
        self.pending_txs.clear();
        self.last_sent_block_number = 0;
    }
}

impl Encode for Payload {
    fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        match self.to {
            Some(to) => {
                true.write_to(writer)?;
                to.write_to(writer)?;
            }
            None => false.write_to(writer)?,
        }
        self.value.write_to(writer)?;
        self.data.to_vec().write_to(writer)?;
        self.gas_limit.write_to(writer)?;
        match &self.caption {
            Some(caption) => {
                true.write_to(writer)?;
                caption.as_bytes().to_vec().write_to(writer)?;
            }
            None => false.write_to(writer)?,
        }
        Ok(())
    }
}

impl Decode for Payload {
    fn read_from<R: Read>(reader: &mut R) -> io::Result<Self> {
        let to = if bool::read_from(reader)? {
            Some(Address::read_from(reader)?)
        } else {
            None
        };
        let value = U256::read_from(reader)?;
        let data = Bytes::from(Vec::<u8>::read_from(reader)?);
        let gas_limit = U256::read_from(reader)?;
        let caption = if bool::read_from(reader)? {
            let bytes = Vec::<u8>::read_from(reader)?;
            Some(
                String::from_utf8(bytes)
                    .map_err(|e| io::Error::new(ErrorKind::InvalidData, e))?,
            )
        } else {
            None
        };
        Ok(Self {
            to,
            value,
            data,
            gas_limit,
            caption,
        })
    }
}

impl Encode for SignedVariant {
    fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        self.hash.write_to(writer)?;
        self.nonce.write_to(writer)?;
        self.gas_price.write_to(writer)?;
        self.rlp.to_vec().write_to(writer)
    }
}

impl Decode for SignedVariant {
    fn read_from<R: Read>(reader: &mut R) -> io::Result<Self> {
        Ok(Self {
            hash: H256::read_from(reader)?,
            nonce: u64::read_from(reader)?,
            gas_price: U256::read_from(reader)?,
            rlp: Bytes::from(Vec::<u8>::read_from(reader)?),
        })
    }
}

impl Encode for RawTransaction {
    fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&[RAW_ENCODING_VERSION])?;
        self.index.write_to(writer)?;
        self.nonce.write_to(writer)?;
        self.from.write_to(writer)?;
        self.payload.write_to(writer)?;
        (self.pending_txs.len() as u32).write_to(writer)?;
        for variant in &self.pending_txs {
            variant.write_to(writer)?;
        }
        self.mined_tx_hash.write_to(writer)?;
        match self.mined_block_number {
            Some(number) => {
                true.write_to(writer)?;
                number.write_to(writer)?;
            }
            None => false.write_to(writer)?,
        }
        self.reverted.write_to(writer)?;
        self.allow_revert.write_to(writer)?;
        self.confirmed_index.write_to(writer)?;
        self.last_sent_block_number.write_to(writer)
    }
}

impl Decode for RawTransaction {
    fn read_from<R: Read>(reader: &mut R) -> io::Result<Self> {
        let mut version = [0u8; 1];
        reader.read_exact(&mut version)?;
        if version[0] != RAW_ENCODING_VERSION {
            return Err(io::Error::new(
                ErrorKind::InvalidData,
                format!("unknown raw transaction encoding version {}", version[0]),
            ));
        }

        let index = u64::read_from(reader)?;
        let nonce = u64::read_from(reader)?;
        let from = Address::read_from(reader)?;
        let payload = Payload::read_from(reader)?;
        let num_variants = u32::read_from(reader)?;
        let mut pending_txs = Vec::with_capacity(num_variants as usize);
        for _ in 0..num_variants {
            pending_txs.push(SignedVariant::read_from(reader)?);
        }
        let mined_tx_hash = H256::read_from(reader)?;
        let mined_block_number = if bool::read_from(reader)? {
            Some(u64::read_from(reader)?)
        } else {
            None
        };
        let reverted = bool::read_from(reader)?;
        let allow_revert = bool::read_from(reader)?;
        let confirmed_index = u64::read_from(reader)?;
        let last_sent_block_number = u64::read_from(reader)?;

        // Trailing bytes belong to fields appended by newer writers.
        Ok(Self {
            index,
            nonce,
            from,
            payload,
            pending_txs,
            mined_tx_hash,
            mined_block_number,
            reverted,
            allow_revert,
            confirmed_index,
            last_sent_block_number,
        })
    }
}

/// In-memory handle to a queued raw transaction.
///
/// The data mutex is held only for brief synchronous sections; `send_lock`
/// serializes whole send sequences for one raw and is never taken by the
/// queue passes.
#[derive(Debug)]
pub struct TrackedRaw {
    data: Mutex<RawTransaction>,
    pub(crate) send_lock: tokio::sync::Mutex<()>,
}

impl TrackedRaw {
    pub fn new(raw: RawTransaction) -> Arc<Self> {
        Arc::new(Self {
            data: Mutex::new(raw),
            send_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn with<R>(&self, f: impl FnOnce(&RawTransaction) -> R) -> R {
        let guard = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    pub fn with_mut<R>(&self, f: impl FnOnce(&mut RawTransaction) -> R) -> R {
        let mut guard = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    pub fn snapshot(&self) -> RawTransaction {
        self.with(|raw| raw.clone())
    }

    /// Probe the backend for a receipt of any broadcast variant. Records the
    /// mined hash, block and revert status on the first hit. Returns the
    /// mined hash when one variant has a receipt.
    pub async fn check_mined(
        &self,
        backend: &dyn RootChainBackend,
    ) -> Result<Option<H256>, BackendError> {
        if let Some(hash) = self.with(|raw| raw.mined()) {
            return Ok(Some(hash));
        }

        let hashes: Vec<H256> = self.with(|raw| raw.pending_txs.iter().map(|v| v.hash).collect());

        for hash in hashes {
            if let Some(receipt) = backend.transaction_receipt(hash).await? {
                self.with_mut(|raw| {
                    raw.mined_tx_hash = hash;
                    raw.mined_block_number = receipt.block_number.map(|n| n.as_u64());
                    raw.reverted = receipt.status == Some(0.into());
                });
                return Ok(Some(hash));
            }
        }

        Ok(None)
    }

    /// Whether the mined variant has dropped off the canonical chain
    pub async fn removed(&self, backend: &dyn RootChainBackend) -> Result<bool, BackendError> {
        let Some(hash) = self.with(|raw| raw.mined()) else {
            return Ok(false);
        };

        match backend.transaction_by_hash(hash).await? {
            None => Ok(true),
            // back in the mempool after a reorg counts as removed
            Some((_, pending)) => Ok(pending),
        }
    }

    /// Depth check against a fresh receipt, so a confirmation decision never
    /// trusts a block number recorded before a reorg.
    pub async fn confirmed_at(
        &self,
        backend: &dyn RootChainBackend,
        current_block: u64,
        confirmations: u64,
    ) -> Result<bool, BackendError> {
        let Some(hash) = self.with(|raw| raw.mined()) else {
            return Ok(false);
        };

        match backend.transaction_receipt(hash).await? {
            Some(receipt) => match receipt.block_number {
                Some(number) => {
                    Ok(current_block.saturating_sub(number.as_u64()) >= confirmations)
                }
                None => Ok(false),
            },
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(caption: &str) -> Payload {
        Payload {
            to: Some(Address::repeat_byte(0x42)),
            value: U256::from(1_000u64),
            data: Bytes::from(caption.as_bytes().to_vec()),
            gas_limit: U256::from(4_000_000u64),
            caption: Some(caption.to_string()),
        }
    }

    #[test]
    fn hash_is_stable_across_nonce_rebinding() {
        let mut raw = RawTransaction::new(Address::repeat_byte(1), payload("commit"), false);
        let before = raw.hash();

        raw.nonce = 77;
        raw.index = 12;
        raw.last_sent_block_number = 9;

        assert_eq!(raw.hash(), before);
    }

    #[test]
    fn duplicate_declarations_share_a_hash() {
        let a = RawTransaction::new(Address::repeat_byte(1), payload("commit"), true);
        let b = RawTransaction::new(Address::repeat_byte(1), payload("commit"), true);
        assert_eq!(a.hash(), b.hash());

        let c = RawTransaction::new(Address::repeat_byte(1), payload("exit"), true);
        assert_ne!(a.hash(), c.hash());

        // the caption is a log label, not part of the identity
        let mut relabeled = RawTransaction::new(Address::repeat_byte(1), payload("commit"), true);
        relabeled.payload.caption = Some("relabeled".to_string());
        assert_eq!(a.hash(), relabeled.hash());
    }

    #[test]
    fn encode_decode_round_trip() {
        let mut raw = RawTransaction::new(Address::repeat_byte(3), payload("commit"), true);
        raw.index = 5;
        raw.nonce = 11;
        raw.mined_tx_hash = H256::repeat_byte(0xaa);
        raw.mined_block_number = Some(1234);
        raw.reverted = true;
        raw.confirmed_index = 2;
        raw.last_sent_block_number = 1200;
        raw.pending_txs.push(SignedVariant {
            hash: H256::repeat_byte(0xbb),
            nonce: 11,
            gas_price: U256::from(10u64) * U256::exp10(9),
            rlp: Bytes::from(vec![1, 2, 3]),
        });

        let decoded = RawTransaction::from_slice(&raw.to_vec()).unwrap();
        assert_eq!(decoded, raw);
    }

    #[test]
    fn decode_ignores_trailing_bytes() {
        let raw = RawTransaction::new(Address::repeat_byte(3), payload("commit"), false);
        let mut encoded = raw.to_vec();
        encoded.extend_from_slice(&[0xff; 16]);

        let decoded = RawTransaction::from_slice(&encoded).unwrap();
        assert_eq!(decoded, raw);
    }

    #[test]
    fn decode_rejects_unknown_version() {
        let raw = RawTransaction::new(Address::repeat_byte(3), payload("commit"), false);
        let mut encoded = raw.to_vec();
        encoded[0] = 99;

        assert!(RawTransaction::from_slice(&encoded).is_err());
    }

    #[test]
    fn prepare_to_resend_keeps_identity() {
        let mut raw = RawTransaction::new(Address::repeat_byte(3), payload("commit"), false);
        raw.index = 4;
        raw.nonce = 9;
        raw.mined_tx_hash = H256::repeat_byte(0xaa);
        raw.mined_block_number = Some(100);
        raw.reverted = true;
        raw.last_sent_block_number = 90;
        raw.pending_txs.push(SignedVariant {
            hash: H256::repeat_byte(0xbb),
            nonce: 9,
            gas_price: U256::one(),
            rlp: Bytes::new(),
        });

        raw.prepare_to_resend();

        assert_eq!(raw.index, 4);
        assert_eq!(raw.nonce, 9);
        assert!(raw.mined().is_none());
        assert_eq!(raw.mined_block_number, None);
        assert!(!raw.reverted);
        assert!(raw.pending_txs.is_empty());
        assert_eq!(raw.last_sent_block_number, 0);
    }

    #[test]
    fn add_pending_is_idempotent_per_hash() {
        let mut raw = RawTransaction::new(Address::repeat_byte(3), payload("commit"), false);
        let variant = SignedVariant {
            hash: H256::repeat_byte(0xcc),
            nonce: 0,
            gas_price: U256::one(),
            rlp: Bytes::new(),
        };

        raw.add_pending(variant.clone());
        raw.add_pending(variant);
        assert_eq!(raw.pending_txs.len(), 1);
    }
}
