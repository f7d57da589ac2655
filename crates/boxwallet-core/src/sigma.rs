//! Minimal codec for the serialized constants the wallet reads and writes
//! in box registers and context extensions.
//!
//! Only the handful of types the engine needs are covered: `Short`, `Int`,
//! `Long`, `Coll[Byte]`, and `SigmaProp` (carried as opaque bytes).

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};

use crate::error::WalletError;

type Blake2b256 = Blake2b<U32>;

pub fn blake2b256(data: &[u8]) -> [u8; 32] {
    Blake2b256::digest(data).into()
}

const TYPE_SHORT: u8 = 0x03;
const TYPE_INT: u8 = 0x04;
const TYPE_LONG: u8 = 0x05;
const TYPE_SIGMA_PROP: u8 = 0x08;
const TYPE_COLL_BYTE: u8 = 0x0e;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Constant {
    Short(i16),
    Int(i32),
    Long(i64),
    CollByte(Vec<u8>),
    /// Serialized sigma-proposition body, without its type byte.
    SigmaProp(Vec<u8>),
}

impl Constant {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Self::Short(v) => {
                out.push(TYPE_SHORT);
                put_vlq(&mut out, zigzag(i64::from(*v)));
            }
            Self::Int(v) => {
                out.push(TYPE_INT);
                put_vlq(&mut out, zigzag(i64::from(*v)));
            }
            Self::Long(v) => {
                out.push(TYPE_LONG);
                put_vlq(&mut out, zigzag(*v));
            }
            Self::CollByte(bytes) => {
                out.push(TYPE_COLL_BYTE);
                put_vlq(&mut out, bytes.len() as u64);
                out.extend_from_slice(bytes);
            }
            Self::SigmaProp(body) => {
                out.push(TYPE_SIGMA_PROP);
                out.extend_from_slice(body);
            }
        }
        out
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WalletError> {
        let (&tag, rest) = bytes
            .split_first()
            .ok_or_else(|| invalid("empty constant"))?;
        let mut reader = Reader::new(rest);
        let constant = match tag {
            TYPE_SHORT => {
                let v = unzigzag(reader.vlq()?);
                Self::Short(i16::try_from(v).map_err(|_| invalid("short out of range"))?)
            }
            TYPE_INT => {
                let v = unzigzag(reader.vlq()?);
                Self::Int(i32::try_from(v).map_err(|_| invalid("int out of range"))?)
            }
            TYPE_LONG => Self::Long(unzigzag(reader.vlq()?)),
            TYPE_COLL_BYTE => {
                let len = reader.vlq()? as usize;
                Self::CollByte(reader.take(len)?.to_vec())
            }
            TYPE_SIGMA_PROP => return Ok(Self::SigmaProp(rest.to_vec())),
            other => return Err(invalid(&format!("unsupported constant type {other:#04x}"))),
        };
        if !reader.is_empty() {
            return Err(invalid("trailing bytes after constant"));
        }
        Ok(constant)
    }

    pub fn from_hex(s: &str) -> Result<Self, WalletError> {
        let bytes = hex::decode(s).map_err(|e| invalid(&e.to_string()))?;
        Self::from_bytes(&bytes)
    }

    pub fn as_long(&self) -> Option<i64> {
        match self {
            Self::Long(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_coll_byte(&self) -> Option<&[u8]> {
        match self {
            Self::CollByte(v) => Some(v),
            _ => None,
        }
    }
}

fn invalid(message: &str) -> WalletError {
    WalletError::InvalidTransaction(format!("malformed constant: {message}"))
}

// ==============================================================================
// VLQ / ZigZag
// ==============================================================================

pub fn put_vlq(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

fn zigzag(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

fn unzigzag(v: u64) -> i64 {
    ((v >> 1) as i64) ^ -((v & 1) as i64)
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn vlq(&mut self) -> Result<u64, WalletError> {
        let mut result = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = *self
                .bytes
                .get(self.pos)
                .ok_or_else(|| invalid("truncated VLQ"))?;
            self.pos += 1;
            if shift >= 64 {
                return Err(invalid("VLQ overflow"));
            }
            result |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], WalletError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| invalid("truncated collection"))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_encoding_matches_reference_bytes() {
        // 1 -> zigzag 2; -1 -> zigzag 1.
        assert_eq!(Constant::Long(1).to_hex(), "0502");
        assert_eq!(Constant::Long(-1).to_hex(), "0501");
        assert_eq!(Constant::Long(1_000_000).to_hex(), "0580897a");
    }

    #[test]
    fn short_and_collection_decode() {
        assert_eq!(Constant::from_hex("0302").expect("short"), Constant::Short(1));
        let coll = Constant::CollByte(vec![0xaa; 32]);
        let decoded = Constant::from_hex(&coll.to_hex()).expect("coll");
        assert_eq!(decoded.as_coll_byte(), Some(&[0xaa; 32][..]));
    }

    #[test]
    fn truncated_input_is_rejected() {
        assert!(Constant::from_hex("0e20aa").is_err());
        assert!(Constant::from_hex("0580").is_err());
        assert!(Constant::from_hex("").is_err());
    }
}
