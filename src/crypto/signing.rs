use crate::crypto::{KeyPair, PublicKey, SecretKey};
use ed25519_dalek::Verifier;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SignatureError {
    #[error("Verification failed: {0}")]
    VerificationFailed(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),
}

/// 使用私钥签名消息
pub fn sign(secret_key: &SecretKey, message: &[u8]) -> [u8; 64] {
    let signing_key = secret_key.signing_key();

    // 从密钥创建ExpandedSecretKey
    let expanded_key = ed25519_dalek::ExpandedSecretKey::from(signing_key);
    let public_key = ed25519_dalek::PublicKey::from(signing_key);

    expanded_key.sign(message, &public_key).to_bytes()
}

/// 使用公钥验证签名
pub fn verify(public_key: &PublicKey, message: &[u8], signature: &[u8]) -> Result<(), SignatureError> {
    if signature.len() != 64 {
        return Err(SignatureError::VerificationFailed("Invalid signature length".to_string()));
    }

    let sig = ed25519_dalek::Signature::try_from(signature)
        .map_err(|e| SignatureError::VerificationFailed(e.to_string()))?;

    public_key.signing_key().verify(message, &sig)
        .map_err(|e| SignatureError::VerificationFailed(format!("Verification failed: {}", e)))?;

    Ok(())
}

/// Builds the BEP-44 signable buffer for a mutable item:
/// `[4:salt<len>:<salt>]3:seqi<seq>e1:v<bencoded value>`.
///
/// The value is bencoded as a byte string (`<len>:<bytes>`), matching how
/// mainline nodes check signatures on `put` requests.
pub fn bep44_signable(salt: &[u8], seq: i64, value: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(value.len() + salt.len() + 48);

    if !salt.is_empty() {
        buf.extend_from_slice(b"4:salt");
        buf.extend_from_slice(salt.len().to_string().as_bytes());
        buf.push(b':');
        buf.extend_from_slice(salt);
    }

    buf.extend_from_slice(b"3:seqi");
    buf.extend_from_slice(seq.to_string().as_bytes());
    buf.extend_from_slice(b"e1:v");
    buf.extend_from_slice(&bencode_bytes(value));
    buf
}

/// Bencode a byte string: `<len>:<bytes>`.
pub fn bencode_bytes(value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.len() + 6);
    out.extend_from_slice(value.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(value);
    out
}

/// 对BEP-44条目签名
pub fn sign_bep44(keypair: &KeyPair, salt: &[u8], seq: i64, value: &[u8]) -> [u8; 64] {
    sign(&keypair.secret, &bep44_signable(salt, seq, value))
}

/// Verify a BEP-44 mutable item signature. Returns `false` for malformed keys.
pub fn verify_bep44(key: &[u8; 32], salt: &[u8], seq: i64, value: &[u8], signature: &[u8]) -> bool {
    let public_key = match PublicKey::from_bytes(key) {
        Ok(k) => k,
        Err(_) => return false,
    };

    verify(&public_key, &bep44_signable(salt, seq, value), signature).is_ok()
}
