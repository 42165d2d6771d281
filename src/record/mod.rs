pub mod zbase32;

use crate::crypto::{sign_bep44, verify_bep44, KeyPair};
use crate::dht::Item;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// 记录值的最大字节数
pub const MAX_VALUE_SIZE: usize = 1000;
pub const KEY_SIZE: usize = 32;
pub const SIGNATURE_SIZE: usize = 64;

/// signature(64) ‖ seq(8, BE) ‖ value
const WIRE_HEADER_SIZE: usize = SIGNATURE_SIZE + 8;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("Invalid key length: expected 32 bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("Value too large: {0} bytes exceeds the 1000 byte limit")]
    ValueTooLarge(usize),

    #[error("Invalid signature length: expected 64 bytes, got {0}")]
    InvalidSignatureLength(usize),

    #[error("Missing sequence number")]
    MissingSequence,

    #[error("Signature does not verify")]
    InvalidSignature,

    #[error("Malformed wire record: {0}")]
    MalformedWire(String),

    #[error("Invalid record id: {0}")]
    InvalidId(String),
}

/// A signed BEP-44 mutable record.
///
/// Fields are public so that records restored from storage can be re-checked
/// with [`Record::is_valid`]. Two records for the same key are equal iff their
/// sequence, value and signature are identical.
#[derive(Clone, PartialEq, Eq)]
pub struct Record {
    pub key: [u8; KEY_SIZE],
    pub value: Vec<u8>,
    pub signature: [u8; SIGNATURE_SIZE],
    pub sequence: i64,
}

/// What callers get back from a lookup. Never carries the key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    pub value: Vec<u8>,
    pub sequence: i64,
    pub signature: [u8; SIGNATURE_SIZE],
}

/// 重发布失败的记录
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedRecord {
    pub id: String,
    pub failure_count: u32,
}

impl Record {
    /// 创建并验证记录。结构检查在签名验证之前进行。
    pub fn new(key: &[u8], value: &[u8], signature: &[u8], sequence: i64) -> Result<Self, RecordError> {
        if key.len() != KEY_SIZE {
            return Err(RecordError::InvalidKeyLength(key.len()));
        }
        if value.len() > MAX_VALUE_SIZE {
            return Err(RecordError::ValueTooLarge(value.len()));
        }
        if signature.len() != SIGNATURE_SIZE {
            return Err(RecordError::InvalidSignatureLength(signature.len()));
        }
        if sequence == 0 {
            return Err(RecordError::MissingSequence);
        }

        let mut k = [0u8; KEY_SIZE];
        k.copy_from_slice(key);
        let mut sig = [0u8; SIGNATURE_SIZE];
        sig.copy_from_slice(signature);

        let record = Self {
            key: k,
            value: value.to_vec(),
            signature: sig,
            sequence,
        };
        record.verify_signature()?;
        Ok(record)
    }

    /// Signs `value` at `sequence` with the given key pair.
    pub fn sign(keypair: &KeyPair, value: &[u8], sequence: i64) -> Result<Self, RecordError> {
        let signature = sign_bep44(keypair, &[], sequence, value);
        Self::new(&keypair.public.to_bytes(), value, &signature, sequence)
    }

    /// Re-runs every structural and cryptographic check.
    pub fn is_valid(&self) -> Result<(), RecordError> {
        if self.value.len() > MAX_VALUE_SIZE {
            return Err(RecordError::ValueTooLarge(self.value.len()));
        }
        if self.sequence == 0 {
            return Err(RecordError::MissingSequence);
        }
        self.verify_signature()
    }

    fn verify_signature(&self) -> Result<(), RecordError> {
        if verify_bep44(&self.key, &[], self.sequence, &self.value, &self.signature) {
            Ok(())
        } else {
            Err(RecordError::InvalidSignature)
        }
    }

    /// z-base-32 id of the key
    pub fn id(&self) -> String {
        zbase32::encode(&self.key)
    }

    pub fn response(&self) -> Response {
        Response {
            value: self.value.clone(),
            sequence: self.sequence,
            signature: self.signature,
        }
    }

    /// 转换为DHT可变条目
    pub fn put(&self) -> Item {
        Item::mutable(self.key, self.value.clone(), self.signature, self.sequence)
    }

    pub fn from_response(key: &[u8], response: &Response) -> Result<Self, RecordError> {
        Self::new(key, &response.value, &response.signature, response.sequence)
    }

    /// Parses the wire layout `signature(64) ‖ seq(u64 BE) ‖ value`.
    pub fn from_wire(key: &[u8], wire: &[u8]) -> Result<Self, RecordError> {
        let response = Response::from_bytes(wire)?;
        Self::from_response(key, &response)
    }

    pub fn to_wire(&self) -> Vec<u8> {
        self.response().to_bytes()
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Record{{K={} V={} Sig={} Seq={}}}",
            self.id(),
            hex::encode(&self.value),
            hex::encode(self.signature),
            self.sequence
        )
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Record({}, seq={}, {} bytes)", self.id(), self.sequence, self.value.len())
    }
}

impl Response {
    /// 序列化为线格式
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(WIRE_HEADER_SIZE + self.value.len());
        out.extend_from_slice(&self.signature);
        out.extend_from_slice(&(self.sequence as u64).to_be_bytes());
        out.extend_from_slice(&self.value);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RecordError> {
        if bytes.len() < WIRE_HEADER_SIZE {
            return Err(RecordError::MalformedWire(format!(
                "expected at least {} bytes, got {}",
                WIRE_HEADER_SIZE,
                bytes.len()
            )));
        }
        if bytes.len() - WIRE_HEADER_SIZE > MAX_VALUE_SIZE {
            return Err(RecordError::ValueTooLarge(bytes.len() - WIRE_HEADER_SIZE));
        }

        let mut signature = [0u8; SIGNATURE_SIZE];
        signature.copy_from_slice(&bytes[..SIGNATURE_SIZE]);
        let mut seq = [0u8; 8];
        seq.copy_from_slice(&bytes[SIGNATURE_SIZE..WIRE_HEADER_SIZE]);

        Ok(Self {
            value: bytes[WIRE_HEADER_SIZE..].to_vec(),
            sequence: u64::from_be_bytes(seq) as i64,
            signature,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_validates_lengths_before_signature() {
        let kp = KeyPair::generate().unwrap();
        let key = kp.public.to_bytes();
        let sig = [0u8; 64];

        assert_eq!(Record::new(&key[..31], b"v", &sig, 1).unwrap_err(), RecordError::InvalidKeyLength(31));
        assert_eq!(Record::new(&[0u8; 33], b"v", &sig, 1).unwrap_err(), RecordError::InvalidKeyLength(33));
        assert_eq!(Record::new(&key, &[0u8; 1001], &sig, 1).unwrap_err(), RecordError::ValueTooLarge(1001));
        assert_eq!(Record::new(&key, b"v", &sig[..63], 1).unwrap_err(), RecordError::InvalidSignatureLength(63));
        assert_eq!(Record::new(&key, b"v", &sig, 0).unwrap_err(), RecordError::MissingSequence);
        assert_eq!(Record::new(&key, b"v", &sig, 1).unwrap_err(), RecordError::InvalidSignature);
    }

    #[test]
    fn test_signature_binds_value_and_sequence() {
        let kp = KeyPair::generate().unwrap();
        let record = Record::sign(&kp, b"hello", 5).unwrap();
        assert!(record.is_valid().is_ok());

        let mut bumped = record.clone();
        bumped.sequence = 6;
        assert_eq!(bumped.is_valid().unwrap_err(), RecordError::InvalidSignature);

        let mut changed = record.clone();
        changed.value = b"hellp".to_vec();
        assert_eq!(changed.is_valid().unwrap_err(), RecordError::InvalidSignature);
    }

    #[test]
    fn test_max_value_is_accepted() {
        let kp = KeyPair::generate().unwrap();
        let record = Record::sign(&kp, &[9u8; MAX_VALUE_SIZE], 1).unwrap();
        assert_eq!(record.value.len(), 1000);
        assert!(Record::sign(&kp, b"", -4).is_ok());
    }

    #[test]
    fn test_response_projection() {
        let kp = KeyPair::generate().unwrap();
        let record = Record::sign(&kp, b"payload", 42).unwrap();
        let response = record.response();

        let restored = Record::from_response(&record.key, &response).unwrap();
        assert_eq!(restored.response(), response);
        assert_eq!(restored, record);
    }

    #[test]
    fn test_wire_layout() {
        let kp = KeyPair::generate().unwrap();
        let record = Record::sign(&kp, b"abc", 0x0102).unwrap();
        let wire = record.to_wire();

        assert_eq!(wire.len(), 64 + 8 + 3);
        assert_eq!(&wire[..64], &record.signature[..]);
        assert_eq!(&wire[64..72], &[0, 0, 0, 0, 0, 0, 1, 2]);
        assert_eq!(&wire[72..], b"abc");

        assert_eq!(Record::from_wire(&record.key, &wire).unwrap(), record);
        assert!(matches!(Record::from_wire(&record.key, &wire[..70]), Err(RecordError::MalformedWire(_))));
    }

    #[test]
    fn test_display_and_id() {
        let kp = KeyPair::generate().unwrap();
        let record = Record::sign(&kp, &[0xab], 3).unwrap();

        assert_eq!(zbase32::decode_id(&record.id()).unwrap(), record.key);
        let shown = record.to_string();
        assert!(shown.starts_with(&format!("Record{{K={} V=ab Sig=", record.id())));
        assert!(shown.ends_with("Seq=3}"));
    }

    #[test]
    fn test_put_projection() {
        let kp = KeyPair::generate().unwrap();
        let record = Record::sign(&kp, b"x", 9).unwrap();
        let item = record.put();

        assert!(item.is_mutable());
        assert_eq!(item.seq, Some(9));
        assert!(item.verify());
    }
}
