//! Synchronous input validation.
//!
//! Everything here runs before any remote or filesystem operation; a
//! validation failure is final and is never retried.

use base64::Engine;
use thiserror::Error;

/// Node identifiers are 3-50 characters of `[A-Za-z0-9_-]`.
pub const NODE_ID_MIN_LEN: usize = 3;
pub const NODE_ID_MAX_LEN: usize = 50;

/// WireGuard keys are 32 raw bytes, carried as 44-character base64.
pub const PUBLIC_KEY_RAW_LEN: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid node id {0:?}: expected 3-50 characters of [A-Za-z0-9_-]")]
    InvalidNodeId(String),

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("invalid owner address {0:?}: expected 40 hex digits")]
    InvalidOwnerAddress(String),
}

/// Check a node identifier against the registry naming rules.
pub fn node_id(id: &str) -> Result<(), ValidationError> {
    let len_ok = (NODE_ID_MIN_LEN..=NODE_ID_MAX_LEN).contains(&id.len());
    let chars_ok = id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if len_ok && chars_ok {
        Ok(())
    } else {
        Err(ValidationError::InvalidNodeId(id.to_string()))
    }
}

/// Check that a public key is valid base64 decoding to exactly 32 bytes.
pub fn public_key(key: &str) -> Result<(), ValidationError> {
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(key)
        .map_err(|e| ValidationError::InvalidPublicKey(e.to_string()))?;
    if decoded.len() != PUBLIC_KEY_RAW_LEN {
        return Err(ValidationError::InvalidPublicKey(format!(
            "decoded length {} != {}",
            decoded.len(),
            PUBLIC_KEY_RAW_LEN
        )));
    }
    Ok(())
}

/// Check a ledger owner address: 40 hex digits, optional `0x` prefix.
pub fn owner_address(addr: &str) -> Result<(), ValidationError> {
    let digits = addr.strip_prefix("0x").unwrap_or(addr);
    match hex::decode(digits) {
        Ok(bytes) if bytes.len() == 20 => Ok(()),
        _ => Err(ValidationError::InvalidOwnerAddress(addr.to_string())),
    }
}

/// Mask a key for logging: first and last 8 characters only.
pub fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() < 16 {
        return "***".to_string();
    }
    let head: String = chars[..8].iter().collect();
    let tail: String = chars[chars.len() - 8..].iter().collect();
    format!("{}...{}", head, tail)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_accepts_valid_names() {
        assert!(node_id("node-1").is_ok());
        assert!(node_id("abc").is_ok());
        assert!(node_id("A_b-9").is_ok());
        assert!(node_id(&"x".repeat(50)).is_ok());
    }

    #[test]
    fn node_id_rejects_bad_names() {
        assert!(node_id("").is_err());
        assert!(node_id("ab").is_err());
        assert!(node_id(&"x".repeat(51)).is_err());
        assert!(node_id("node.1").is_err());
        assert!(node_id("node 1").is_err());
        assert!(node_id("nöde-1").is_err());
    }

    #[test]
    fn public_key_requires_32_decoded_bytes() {
        let key = base64::engine::general_purpose::STANDARD.encode([7u8; 32]);
        assert_eq!(key.len(), 44);
        assert!(public_key(&key).is_ok());

        let short = base64::engine::general_purpose::STANDARD.encode([7u8; 16]);
        assert!(public_key(&short).is_err());
        assert!(public_key("not base64 at all!!").is_err());
    }

    #[test]
    fn owner_address_wants_40_hex_digits() {
        assert!(owner_address(&"a".repeat(40)).is_ok());
        assert!(owner_address(&format!("0x{}", "B".repeat(40))).is_ok());
        assert!(owner_address("0x1234").is_err());
        assert!(owner_address(&"g".repeat(40)).is_err());
    }

    #[test]
    fn mask_key_hides_the_middle() {
        let key = "AAAABBBBCCCCDDDDEEEEFFFFGGGGHHHH";
        let masked = mask_key(key);
        assert_eq!(masked, "AAAABBBB...GGGGHHHH");
        assert_eq!(mask_key("short"), "***");
    }
}
