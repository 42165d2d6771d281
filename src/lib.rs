//! dht_relay: a store and resolver for signed, mutable DHT records.
//!
//! Records are BEP-44 mutable items keyed by an ed25519 public key. The
//! [`service::RecordService`] keeps them durable in a local store, serves
//! reads through a response cache, and periodically republishes everything
//! so records outlive the DHT's item expiry.

pub mod cache;
pub mod crypto;
pub mod dht;
pub mod record;
pub mod service;
pub mod storage;
pub mod utils;

pub use record::{FailedRecord, Record, RecordError, Response};
pub use service::{Lookup, RecordService, ServiceConfig, ServiceError};
