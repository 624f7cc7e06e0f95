//! Preshared-key format, hashing, and constant-time verification.
//!
//! Raw keys look like `amb_pk_<48 base64url chars>` and are shown exactly
//! once at creation. Storage keeps the 8-char prefix (a lookup hint) and a
//! salted keyed hash; authentication always verifies the hash.

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use amb_domain::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Fixed label preceding the random body.
pub const KEY_LABEL: &str = "amb_pk_";
/// Length of the base64url body (36 random bytes encode to exactly 48
/// chars, no padding).
pub const KEY_BODY_LEN: usize = 48;
/// Length of the stored lookup prefix.
pub const KEY_PREFIX_LEN: usize = 8;

const KEY_RANDOM_BYTES: usize = 36;
const SALT_BYTES: usize = 16;

/// A freshly minted preshared key. `raw` is handed to the caller once;
/// everything else is what storage keeps.
pub struct GeneratedKey {
    pub raw: String,
    pub prefix: String,
    pub salt_hex: String,
    pub hash_hex: String,
}

/// Mint a new preshared key with a random body and per-key salt.
pub fn generate_key() -> GeneratedKey {
    use base64::Engine;

    let mut body_bytes = [0u8; KEY_RANDOM_BYTES];
    rand::thread_rng().fill_bytes(&mut body_bytes);
    let body = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(body_bytes);
    debug_assert_eq!(body.len(), KEY_BODY_LEN);
    let raw = format!("{KEY_LABEL}{body}");

    let mut salt = [0u8; SALT_BYTES];
    rand::thread_rng().fill_bytes(&mut salt);

    GeneratedKey {
        prefix: body[..KEY_PREFIX_LEN].to_owned(),
        hash_hex: hash_key(&salt, &raw),
        salt_hex: hex::encode(salt),
        raw,
    }
}

/// Validate the shape of a submitted key and return its body. Shape
/// rejection is cheap by design; it reveals nothing about key existence.
pub fn parse_raw_key(raw: &str) -> Result<&str> {
    let body = raw
        .strip_prefix(KEY_LABEL)
        .ok_or_else(|| Error::InvalidRequest("malformed preshared key".into()))?;
    if body.len() != KEY_BODY_LEN
        || !body
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(Error::InvalidRequest("malformed preshared key".into()));
    }
    Ok(body)
}

/// The stored lookup prefix of a key body.
pub fn key_prefix(body: &str) -> &str {
    &body[..KEY_PREFIX_LEN]
}

/// Keyed hash of the raw key under a per-key salt, hex-encoded.
pub fn hash_key(salt: &[u8], raw_key: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(salt).expect("hmac accepts any salt length");
    mac.update(raw_key.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time verification of a raw key against a stored salt + hash.
pub fn verify_key(salt_hex: &str, hash_hex: &str, raw_key: &str) -> bool {
    let Ok(salt) = hex::decode(salt_hex) else {
        return false;
    };
    let Ok(stored) = hex::decode(hash_hex) else {
        return false;
    };
    let computed = {
        let mut mac = HmacSha256::new_from_slice(&salt).expect("hmac accepts any salt length");
        mac.update(raw_key.as_bytes());
        mac.finalize().into_bytes()
    };
    computed.ct_eq(&stored).into()
}

/// Burn one verification against a fixed dummy record. Called when prefix
/// lookup finds no candidates so the no-match path costs the same as a
/// mismatch, keeping user enumeration out of the timing signal.
pub fn dummy_verify(raw_key: &str) {
    const DUMMY_SALT: &str = "00000000000000000000000000000000";
    const DUMMY_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";
    let _ = verify_key(DUMMY_SALT, DUMMY_HASH, raw_key);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keys_have_the_documented_shape() {
        let key = generate_key();
        assert!(key.raw.starts_with(KEY_LABEL));
        let body = parse_raw_key(&key.raw).unwrap();
        assert_eq!(body.len(), KEY_BODY_LEN);
        assert_eq!(key.prefix, key_prefix(body));
        assert_eq!(key.prefix.len(), KEY_PREFIX_LEN);
    }

    #[test]
    fn generated_keys_are_unique() {
        let a = generate_key();
        let b = generate_key();
        assert_ne!(a.raw, b.raw);
        assert_ne!(a.salt_hex, b.salt_hex);
    }

    #[test]
    fn verify_accepts_the_original_and_nothing_else() {
        let key = generate_key();
        assert!(verify_key(&key.salt_hex, &key.hash_hex, &key.raw));

        let other = generate_key();
        assert!(!verify_key(&key.salt_hex, &key.hash_hex, &other.raw));
        // Same raw key under a different salt hashes differently.
        assert!(!verify_key(&other.salt_hex, &key.hash_hex, &key.raw));
    }

    #[test]
    fn malformed_keys_rejected() {
        assert!(parse_raw_key("").is_err());
        assert!(parse_raw_key("amb_pk_short").is_err());
        assert!(parse_raw_key(&format!("wrong_{}", "A".repeat(48))).is_err());
        assert!(parse_raw_key(&format!("amb_pk_{}", "A".repeat(47))).is_err());
        assert!(parse_raw_key(&format!("amb_pk_{}!", "A".repeat(47))).is_err());
        assert!(parse_raw_key(&format!("amb_pk_{}", "A".repeat(48))).is_ok());
    }

    #[test]
    fn prefix_is_deterministic() {
        let body = "ABCDEFGH0123456789abcdefghijklmnopqrstuvwxyz-_AB";
        assert_eq!(key_prefix(body), "ABCDEFGH");
    }
}
