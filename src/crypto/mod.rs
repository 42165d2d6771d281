mod keys;
mod signing;

pub use keys::{KeyError, KeyPair, PublicKey, SecretKey};
pub use signing::{bencode_bytes, bep44_signable, sign, sign_bep44, verify, verify_bep44, SignatureError};

/// SHA-1 digest, used for mainline DHT targets.
pub fn sha1(data: &[u8]) -> [u8; 20] {
    let digest = ring::digest::digest(&ring::digest::SHA1_FOR_LEGACY_USE_ONLY, data);
    let mut out = [0u8; 20];
    out.copy_from_slice(digest.as_ref());
    out
}

/*
 * Cryptography module
 *
 * - Ed25519 key handling for record owners
 * - BEP-44 signable encoding and signature checks
 * - SHA-1 targets for the mainline keyspace
 */
