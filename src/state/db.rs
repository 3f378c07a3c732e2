//! Byte-addressable key-value store with atomic single-key writes

use std::io::{self, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ethers::types::{Address, H256, U256};
use rocksdb::{Options, DB as Rocks};
use tracing::info;

/// A KV store handle, cheap to clone
#[derive(Debug, Clone)]
pub struct Db(Arc<Rocks>);

/// Store error type
#[derive(thiserror::Error, Debug)]
pub enum DbError {
    #[error("{0}")]
    Rocks(#[from] rocksdb::Error),

    #[error("failed to open {path}, canonicalized as {canonicalized}: {source}")]
    Opening {
        #[source]
        source: rocksdb::Error,
        path: PathBuf,
        canonicalized: PathBuf,
    },

    #[error("invalid database path {1:?}: {0}")]
    InvalidPath(#[source] io::Error, String),

    #[error("decode: {0}")]
    Decode(#[from] io::Error),
}

impl From<Rocks> for Db {
    fn from(rocks: Rocks) -> Self {
        Self(Arc::new(rocks))
    }
}

impl Db {
    /// Opens the store at `db_path`, creating it if missing
    pub fn from_path(db_path: &Path) -> Result<Db, DbError> {
        let path = {
            let mut path = db_path
                .parent()
                .unwrap_or(Path::new("."))
                .canonicalize()
                .map_err(|e| DbError::InvalidPath(e, db_path.to_string_lossy().into()))?;
            if let Some(file_name) = db_path.file_name() {
                path.push(file_name);
            }
            path
        };

        if path.is_dir() {
            info!(path = %path.to_string_lossy(), "Opening existing store");
        } else {
            info!(path = %path.to_string_lossy(), "Creating store");
        }

        let mut opts = Options::default();
        opts.create_if_missing(true);

        Rocks::open(&opts, &path)
            .map_err(|e| DbError::Opening {
                source: e,
                path: db_path.into(),
                canonicalized: path,
            })
            .map(Into::into)
    }

    /// Store a value under a key; single-key puts are atomic
    pub fn store(&self, key: &[u8], value: &[u8]) -> Result<(), DbError> {
        Ok(self.0.put(key, value)?)
    }

    /// Retrieve a value by key
    pub fn retrieve(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DbError> {
        Ok(self.0.get(key)?)
    }
}

/// Canonical binary encoding for persisted types
pub trait Encode {
    fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()>;

    fn to_vec(&self) -> Vec<u8> {
        let mut buf = vec![];
        self.write_to(&mut buf).expect("!alloc");
        buf
    }
}

/// Canonical binary decoding for persisted types
pub trait Decode {
    fn read_from<R: Read>(reader: &mut R) -> io::Result<Self>
    where
        Self: Sized;

    fn from_slice(mut bytes: &[u8]) -> io::Result<Self>
    where
        Self: Sized,
    {
        Self::read_from(&mut bytes)
    }
}

impl Encode for u64 {
    fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.to_be_bytes())
    }
}

impl Decode for u64 {
    fn read_from<R: Read>(reader: &mut R) -> io::Result<Self> {
        let mut buf = [0u8; 8];
        reader.read_exact(&mut buf)?;
        Ok(u64::from_be_bytes(buf))
    }
}

impl Encode for u32 {
    fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.to_be_bytes())
    }
}

impl Decode for u32 {
    fn read_from<R: Read>(reader: &mut R) -> io::Result<Self> {
        let mut buf = [0u8; 4];
        reader.read_exact(&mut buf)?;
        Ok(u32::from_be_bytes(buf))
    }
}

impl Encode for bool {
    fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&[u8::from(*self)])
    }
}

impl Decode for bool {
    fn read_from<R: Read>(reader: &mut R) -> io::Result<Self> {
        let mut buf = [0u8; 1];
        reader.read_exact(&mut buf)?;
        match buf[0] {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(io::Error::new(ErrorKind::InvalidData, "decoded bool invalid")),
        }
    }
}

impl Encode for H256 {
    fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(self.as_bytes())
    }
}

impl Decode for H256 {
    fn read_from<R: Read>(reader: &mut R) -> io::Result<Self> {
        let mut h = H256::zero();
        reader.read_exact(h.as_bytes_mut())?;
        Ok(h)
    }
}

impl Encode for Address {
    fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(self.as_bytes())
    }
}

impl Decode for Address {
    fn read_from<R: Read>(reader: &mut R) -> io::Result<Self> {
        let mut a = Address::zero();
        reader.read_exact(a.as_bytes_mut())?;
        Ok(a)
    }
}

impl Encode for U256 {
    fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        let mut buf = [0u8; 32];
        self.to_little_endian(&mut buf);
        writer.write_all(&buf)
    }
}

impl Decode for U256 {
    fn read_from<R: Read>(reader: &mut R) -> io::Result<Self> {
        let mut buf = [0u8; 32];
        reader.read_exact(&mut buf)?;
        Ok(U256::from_little_endian(&buf))
    }
}

/// Length-prefixed byte strings
impl Encode for Vec<u8> {
    fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        (self.len() as u32).write_to(writer)?;
        writer.write_all(self)
    }
}

impl Decode for Vec<u8> {
    fn read_from<R: Read>(reader: &mut R) -> io::Result<Self> {
        let len = u32::read_from(reader)? as usize;
        let mut buf = vec![0u8; len];
        reader.read_exact(&mut buf)?;
        Ok(buf)
    }
}


#[cfg(test)]
mod tests {
    use super::test_utils::run_test_db;
    use super::*;

    #[tokio::test]
    async fn store_and_retrieve_round_trip() {
        run_test_db(|db| async move {
            assert_eq!(db.retrieve(b"missing").unwrap(), None);

            db.store(b"k", b"v1").unwrap();
            assert_eq!(db.retrieve(b"k").unwrap().as_deref(), Some(&b"v1"[..]));

            // single-key overwrite is atomic; the latest write wins
            db.store(b"k", b"v2").unwrap();
            assert_eq!(db.retrieve(b"k").unwrap().as_deref(), Some(&b"v2"[..]));
        })
        .await;
    }

    #[test]
    fn primitive_codec_round_trips() {
        let n: u64 = 0xdead_beef;
        assert_eq!(u64::from_slice(&n.to_vec()).unwrap(), n);

        let h = H256::repeat_byte(7);
        assert_eq!(<H256 as Decode>::from_slice(&Encode::to_vec(&h)).unwrap(), h);

        let v = U256::from(123_456_789_000u64);
        assert_eq!(<U256 as Decode>::from_slice(&Encode::to_vec(&v)).unwrap(), v);

        let bytes = vec![1u8, 2, 3];
        assert_eq!(Vec::<u8>::from_slice(&Encode::to_vec(&bytes)).unwrap(), bytes);

        assert!(bool::from_slice(&[2]).is_err());
    }
}
