//! z-base-32 codec for record ids.

use crate::record::RecordError;

const ALPHABET: &[u8; 32] = b"ybndrfg8ejkmcpqxot1uwisza345h769";

/// Encode bytes as z-base-32, MSB first, no padding.
pub fn encode(data: &[u8]) -> String {
    let mut out = String::with_capacity((data.len() * 8 + 4) / 5);
    let mut buffer: u32 = 0;
    let mut bits = 0u32;

    for &byte in data {
        buffer = (buffer << 8) | byte as u32;
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            let idx = (buffer >> bits) & 0x1f;
            out.push(ALPHABET[idx as usize] as char);
        }
        buffer &= (1 << bits) - 1;
    }

    if bits > 0 {
        let idx = (buffer << (5 - bits)) & 0x1f;
        out.push(ALPHABET[idx as usize] as char);
    }

    out
}

fn value_of(c: u8) -> Option<u32> {
    ALPHABET.iter().position(|&a| a == c).map(|p| p as u32)
}

/// Decode a z-base-32 string. Trailing bits that do not fill a byte are dropped.
pub fn decode(input: &str) -> Result<Vec<u8>, RecordError> {
    let mut out = Vec::with_capacity(input.len() * 5 / 8);
    let mut buffer: u32 = 0;
    let mut bits = 0u32;

    for c in input.bytes() {
        let v = value_of(c.to_ascii_lowercase())
            .ok_or_else(|| RecordError::InvalidId(format!("invalid character '{}'", c as char)))?;
        buffer = (buffer << 5) | v;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push((buffer >> bits) as u8);
        }
        buffer &= (1 << bits) - 1;
    }

    Ok(out)
}

/// 解码记录ID为32字节公钥
pub fn decode_id(id: &str) -> Result<[u8; 32], RecordError> {
    if id.is_empty() {
        return Err(RecordError::InvalidId("empty id".to_string()));
    }

    let bytes = decode(id)?;
    if bytes.len() != 32 {
        return Err(RecordError::InvalidId(format!("expected 32 bytes, got {}", bytes.len())));
    }

    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    Ok(key)
}
