//! Durable key layout for the transaction manager
//!
//! Keys:
//! - `num_addr`                      number of managed accounts
//! - `addr:<i>`                      account address by registration index
//! - `nonce:<addr>`                  next assignable nonce
//! - `num_raw:<addr>`                raw transactions ever added
//! - `raw_hash:<addr>:<hash>`        dedup index by payload hash
//! - `pending:<addr>`                pending queue as one list value
//! - `unconfirmed:<addr>`            unconfirmed queue as one list value
//! - `num_confirmed:<addr>`          confirmed log length
//! - `confirmed:<addr>:<j>`          confirmed log entries, append-only
//! - `gas_price`                     controller price
//!
//! List values carry a u32 entry count followed by length-prefixed entries;
//! each raw transaction entry is itself version-tagged.

use ethers::types::{Address, H256, U256};

use super::db::{Db, DbError, Decode, Encode};
use crate::tx::raw::RawTransaction;

static NUM_ADDR: &[u8] = b"num_addr";
static GAS_PRICE: &[u8] = b"gas_price";

fn addr_key(index: u64) -> Vec<u8> {
    let mut key = b"addr:".to_vec();
    key.extend_from_slice(&index.to_be_bytes());
    key
}

fn prefixed(prefix: &[u8], addr: Address) -> Vec<u8> {
    let mut key = prefix.to_vec();
    key.extend_from_slice(addr.as_bytes());
    key
}

fn raw_hash_key(addr: Address, hash: H256) -> Vec<u8> {
    let mut key = prefixed(b"raw_hash:", addr);
    key.push(b':');
    key.extend_from_slice(hash.as_bytes());
    key
}

fn confirmed_key(addr: Address, index: u64) -> Vec<u8> {
    let mut key = prefixed(b"confirmed:", addr);
    key.push(b':');
    key.extend_from_slice(&index.to_be_bytes());
    key
}

fn read_u64(db: &Db, key: &[u8]) -> Result<Option<u64>, DbError> {
    match db.retrieve(key)? {
        Some(bytes) => Ok(Some(u64::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

pub fn read_num_addr(db: &Db) -> Result<u64, DbError> {
    Ok(read_u64(db, NUM_ADDR)?.unwrap_or(0))
}

pub fn write_num_addr(db: &Db, count: u64) -> Result<(), DbError> {
    db.store(NUM_ADDR, &count.to_vec())
}

pub fn read_addr(db: &Db, index: u64) -> Result<Option<Address>, DbError> {
    match db.retrieve(&addr_key(index))? {
        Some(bytes) => Ok(Some(Address::from_slice_checked(&bytes)?)),
        None => Ok(None),
    }
}

pub fn write_addr(db: &Db, index: u64, addr: Address) -> Result<(), DbError> {
    db.store(&addr_key(index), &addr.to_vec())
}

pub fn read_addr_nonce(db: &Db, addr: Address) -> Result<Option<u64>, DbError> {
    read_u64(db, &prefixed(b"nonce:", addr))
}

pub fn write_addr_nonce(db: &Db, addr: Address, nonce: u64) -> Result<(), DbError> {
    db.store(&prefixed(b"nonce:", addr), &nonce.to_vec())
}

pub fn read_num_raw(db: &Db, addr: Address) -> Result<u64, DbError> {
    Ok(read_u64(db, &prefixed(b"num_raw:", addr))?.unwrap_or(0))
}

pub fn write_num_raw(db: &Db, addr: Address, count: u64) -> Result<(), DbError> {
    db.store(&prefixed(b"num_raw:", addr), &count.to_vec())
}

/// Dedup index: the queue index a payload hash was first declared under
pub fn read_raw_index(db: &Db, addr: Address, hash: H256) -> Result<Option<u64>, DbError> {
    read_u64(db, &raw_hash_key(addr, hash))
}

pub fn write_raw_index(db: &Db, addr: Address, hash: H256, index: u64) -> Result<(), DbError> {
    db.store(&raw_hash_key(addr, hash), &index.to_vec())
}

fn write_raw_list(db: &Db, key: &[u8], raws: &[RawTransaction]) -> Result<(), DbError> {
    let mut buf = vec![];
    (raws.len() as u32).write_to(&mut buf)?;
    for raw in raws {
        raw.to_vec().write_to(&mut buf)?;
    }
    db.store(key, &buf)
}

fn read_raw_list(db: &Db, key: &[u8]) -> Result<Vec<RawTransaction>, DbError> {
    let Some(bytes) = db.retrieve(key)? else {
        return Ok(Vec::new());
    };

    let mut reader = bytes.as_slice();
    let count = u32::read_from(&mut reader)?;
    let mut raws = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let entry = Vec::<u8>::read_from(&mut reader)?;
        raws.push(RawTransaction::from_slice(&entry)?);
    }
    Ok(raws)
}

pub fn read_pending(db: &Db, addr: Address) -> Result<Vec<RawTransaction>, DbError> {
    read_raw_list(db, &prefixed(b"pending:", addr))
}

pub fn write_pending(db: &Db, addr: Address, raws: &[RawTransaction]) -> Result<(), DbError> {
    write_raw_list(db, &prefixed(b"pending:", addr), raws)
}

pub fn read_unconfirmed(db: &Db, addr: Address) -> Result<Vec<RawTransaction>, DbError> {
    read_raw_list(db, &prefixed(b"unconfirmed:", addr))
}

pub fn write_unconfirmed(db: &Db, addr: Address, raws: &[RawTransaction]) -> Result<(), DbError> {
    write_raw_list(db, &prefixed(b"unconfirmed:", addr), raws)
}

pub fn read_num_confirmed(db: &Db, addr: Address) -> Result<u64, DbError> {
    Ok(read_u64(db, &prefixed(b"num_confirmed:", addr))?.unwrap_or(0))
}

pub fn write_num_confirmed(db: &Db, addr: Address, count: u64) -> Result<(), DbError> {
    db.store(&prefixed(b"num_confirmed:", addr), &count.to_vec())
}

pub fn read_confirmed(db: &Db, addr: Address, index: u64) -> Result<Option<RawTransaction>, DbError> {
    match db.retrieve(&confirmed_key(addr, index))? {
        Some(bytes) => Ok(Some(RawTransaction::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

pub fn write_confirmed(
    db: &Db,
    addr: Address,
    index: u64,
    raw: &RawTransaction,
) -> Result<(), DbError> {
    db.store(&confirmed_key(addr, index), &raw.to_vec())
}

pub fn read_gas_price(db: &Db) -> Result<Option<U256>, DbError> {
    match db.retrieve(GAS_PRICE)? {
        Some(bytes) => Ok(Some(U256::from_slice_checked(&bytes)?)),
        None => Ok(None),
    }
}

pub fn write_gas_price(db: &Db, price: U256) -> Result<(), DbError> {
    db.store(GAS_PRICE, &price.to_vec())
}

// `from_slice` on Address/U256 collides with the inherent constructors of the
// ethers types, so the decode path gets explicit helpers.
trait DecodeExt: Decode {
    fn from_slice_checked(bytes: &[u8]) -> Result<Self, DbError>
    where
        Self: Sized,
    {
        Ok(<Self as Decode>::from_slice(bytes)?)
    }
}

impl<T: Decode> DecodeExt for T {}
