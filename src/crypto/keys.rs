use ed25519_dalek::{PublicKey as EdPublicKey, SecretKey as EdSecretKey};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Key generation failed: {0}")]
    GenerationFailed(String),

    #[error("Key deserialization failed: {0}")]
    DeserializationFailed(String),
}

/// Ed25519 public key identifying a record owner.
#[derive(Clone)]
pub struct PublicKey {
    signing_key: EdPublicKey,
}

impl PublicKey {
    /// 从32字节创建公钥
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        if bytes.len() != 32 {
            return Err(KeyError::DeserializationFailed(format!("Expected 32 bytes, got {}", bytes.len())));
        }

        let signing_key = EdPublicKey::from_bytes(bytes)
            .map_err(|e| KeyError::DeserializationFailed(e.to_string()))?;

        Ok(Self { signing_key })
    }

    /// Returns the Ed25519 verifying key
    pub fn signing_key(&self) -> &EdPublicKey {
        &self.signing_key
    }

    /// 原始字节
    pub fn to_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({}...)", hex::encode(&self.signing_key.as_bytes()[0..4]))
    }
}

impl PartialEq for PublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.signing_key.as_bytes() == other.signing_key.as_bytes()
    }
}

impl Eq for PublicKey {}

/// Ed25519 secret key. Never printed.
pub struct SecretKey {
    signing_key: EdSecretKey,
}

// EdSecretKey不支持Clone，从字节重新创建
impl Clone for SecretKey {
    fn clone(&self) -> Self {
        let bytes = self.signing_key.to_bytes();
        match EdSecretKey::from_bytes(&bytes) {
            Ok(signing_key) => SecretKey { signing_key },
            // 32字节输入不会失败
            Err(_) => unreachable!("secret key bytes always have the correct length"),
        }
    }
}

impl SecretKey {
    /// Returns the signing key
    pub fn signing_key(&self) -> &EdSecretKey {
        &self.signing_key
    }

    /// 从32字节种子创建私钥
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KeyError> {
        if bytes.len() != 32 {
            return Err(KeyError::DeserializationFailed(format!("Expected 32 bytes, got {}", bytes.len())));
        }

        let signing_key = EdSecretKey::from_bytes(bytes)
            .map_err(|e| KeyError::DeserializationFailed(e.to_string()))?;

        Ok(Self { signing_key })
    }

    /// 原始种子字节
    pub fn to_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretKey {{ <redacted> }}")
    }
}

/// Represents a record owner's key pair.
#[derive(Debug, Clone)]
pub struct KeyPair {
    pub public: PublicKey,
    pub secret: SecretKey,
}

impl KeyPair {
    /// Generates a new random key pair
    pub fn generate() -> Result<Self, KeyError> {
        // 生成随机字节作为种子
        let mut seed = [0u8; 32];
        rand::Rng::fill(&mut rand::thread_rng(), &mut seed);

        let secret = SecretKey::from_bytes(&seed)
            .map_err(|e| KeyError::GenerationFailed(e.to_string()))?;

        Ok(Self::from_secret(secret))
    }

    /// Creates a key pair from existing secret key
    pub fn from_secret(secret: SecretKey) -> Self {
        let verifying_key = EdPublicKey::from(&secret.signing_key);

        Self {
            public: PublicKey { signing_key: verifying_key },
            secret,
        }
    }

    /// 从十六进制种子恢复密钥对
    pub fn from_hex_seed(seed: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(seed)
            .map_err(|e| KeyError::DeserializationFailed(e.to_string()))?;
        Ok(Self::from_secret(SecretKey::from_bytes(&bytes)?))
    }
}
