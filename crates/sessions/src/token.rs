//! HMAC session tokens.
//!
//! The client-held token is `base64url(nonce) . session_id`; storage keeps
//! only `HMAC-SHA256(secret, nonce ∥ session_id)`, so a stolen database
//! cannot forge tokens. The secret lives in an owner-only file replaced by
//! atomic rename on rotation, and is swapped through a lock so readers see
//! either the old or the new value, never a torn one.

use std::path::Path;
use std::sync::Arc;

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use amb_domain::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Nonce size in bytes.
pub const NONCE_BYTES: usize = 32;
/// Secret size in bytes when the gateway generates one.
pub const SECRET_BYTES: usize = 32;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Secret handle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Swappable handle to the active HMAC secret.
pub struct HmacSecret {
    bytes: parking_lot::RwLock<Arc<Vec<u8>>>,
}

impl HmacSecret {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes: parking_lot::RwLock::new(Arc::new(bytes)),
        }
    }

    /// Read the secret from `path`, generating and persisting a fresh one if
    /// the file does not exist yet.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            let bytes = std::fs::read(path).map_err(Error::Io)?;
            if bytes.is_empty() {
                return Err(Error::Config(format!(
                    "HMAC secret file {} is empty",
                    path.display()
                )));
            }
            return Ok(Self::new(bytes));
        }

        let mut bytes = vec![0u8; SECRET_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        persist_secret(path, &bytes)?;
        tracing::info!(path = %path.display(), "generated new HMAC secret");
        Ok(Self::new(bytes))
    }

    /// Cheap clone of the active secret.
    pub fn current(&self) -> Arc<Vec<u8>> {
        self.bytes.read().clone()
    }

    /// Persist `new_bytes` to `path` (write-tmp-then-rename) and only then
    /// swap the in-memory value, so a crash between the two steps leaves the
    /// durable copy ahead of the live one, never behind.
    pub fn rotate(&self, new_bytes: Vec<u8>, path: &Path) -> Result<()> {
        persist_secret(path, &new_bytes)?;
        *self.bytes.write() = Arc::new(new_bytes);
        Ok(())
    }
}

/// Atomic owner-only write: tmp file in the same directory, then rename.
fn persist_secret(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(Error::Io)?;
    }
    let tmp = path.with_extension("tmp");
    {
        use std::io::Write;
        let mut options = std::fs::OpenOptions::new();
        options.create(true).truncate(true).write(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&tmp).map_err(Error::Io)?;
        file.write_all(bytes).map_err(Error::Io)?;
        file.sync_all().map_err(Error::Io)?;
    }
    std::fs::rename(&tmp, path).map_err(Error::Io)?;
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Token mint / verify
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A fresh random secret of the standard size, for rotation.
pub fn random_secret() -> Vec<u8> {
    let mut bytes = vec![0u8; SECRET_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// A minted token plus the parts storage keeps.
pub struct MintedToken {
    /// `base64url(nonce).session_id` — returned to the client exactly once.
    pub token: String,
    pub nonce_hex: String,
    pub hash_hex: String,
}

/// Mint the token for a new session.
pub fn mint_token(secret: &[u8], session_id: Uuid) -> MintedToken {
    use base64::Engine;

    let mut nonce = [0u8; NONCE_BYTES];
    rand::thread_rng().fill_bytes(&mut nonce);

    let encoded = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(nonce);
    MintedToken {
        token: format!("{encoded}.{session_id}"),
        nonce_hex: hex::encode(nonce),
        hash_hex: compute_hash(secret, &nonce, session_id),
    }
}

/// `HMAC-SHA256(secret, nonce ∥ session_id)`, hex-encoded. The session id
/// participates as its canonical hyphenated string.
pub fn compute_hash(secret: &[u8], nonce: &[u8], session_id: Uuid) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any secret length");
    mac.update(nonce);
    mac.update(session_id.to_string().as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Split a presented token into `(nonce, session_id)`. Failures are shape
/// errors only; nothing here consults storage.
pub fn decode_token(token: &str) -> Result<(Vec<u8>, Uuid)> {
    use base64::Engine;

    let (encoded_nonce, session_part) = token
        .split_once('.')
        .ok_or(Error::Unauthorized)?;
    let nonce = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(encoded_nonce)
        .map_err(|_| Error::Unauthorized)?;
    if nonce.len() != NONCE_BYTES {
        return Err(Error::Unauthorized);
    }
    let session_id = Uuid::parse_str(session_part).map_err(|_| Error::Unauthorized)?;
    Ok((nonce, session_id))
}

/// Constant-time comparison of a recomputed hash against the stored one.
pub fn verify_token_hash(
    secret: &[u8],
    nonce: &[u8],
    session_id: Uuid,
    stored_hash_hex: &str,
) -> bool {
    let Ok(stored) = hex::decode(stored_hash_hex) else {
        return false;
    };
    let computed = {
        let mut mac =
            HmacSha256::new_from_slice(secret).expect("hmac accepts any secret length");
        mac.update(nonce);
        mac.update(session_id.to_string().as_bytes());
        mac.finalize().into_bytes()
    };
    computed.ct_eq(&stored).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mint_then_verify_roundtrip() {
        let secret = b"test-secret".to_vec();
        let session_id = Uuid::new_v4();
        let minted = mint_token(&secret, session_id);

        let (nonce, decoded_id) = decode_token(&minted.token).unwrap();
        assert_eq!(decoded_id, session_id);
        assert_eq!(hex::encode(&nonce), minted.nonce_hex);
        assert!(verify_token_hash(&secret, &nonce, session_id, &minted.hash_hex));
    }

    #[test]
    fn verification_fails_under_a_different_secret() {
        let session_id = Uuid::new_v4();
        let minted = mint_token(b"old-secret", session_id);
        let (nonce, _) = decode_token(&minted.token).unwrap();
        assert!(!verify_token_hash(
            b"new-secret",
            &nonce,
            session_id,
            &minted.hash_hex
        ));
    }

    #[test]
    fn tampered_session_id_fails() {
        let secret = b"s".to_vec();
        let minted = mint_token(&secret, Uuid::new_v4());
        let (nonce, _) = decode_token(&minted.token).unwrap();
        assert!(!verify_token_hash(
            &secret,
            &nonce,
            Uuid::new_v4(),
            &minted.hash_hex
        ));
    }

    #[test]
    fn malformed_tokens_rejected() {
        assert!(decode_token("").is_err());
        assert!(decode_token("no-dot-here").is_err());
        assert!(decode_token("!!!.not-a-uuid").is_err());
        // Short nonce.
        use base64::Engine;
        let short = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode([0u8; 8]);
        assert!(decode_token(&format!("{short}.{}", Uuid::new_v4())).is_err());
    }

    #[test]
    fn secret_file_roundtrip_and_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hmac.secret");

        let secret = HmacSecret::load_or_create(&path).unwrap();
        let original = secret.current();
        assert_eq!(original.len(), SECRET_BYTES);

        // Reloading reads the same bytes back.
        let reloaded = HmacSecret::load_or_create(&path).unwrap();
        assert_eq!(*reloaded.current(), *original);

        // Rotation persists and swaps.
        let fresh = vec![7u8; SECRET_BYTES];
        secret.rotate(fresh.clone(), &path).unwrap();
        assert_eq!(*secret.current(), fresh);
        assert_eq!(std::fs::read(&path).unwrap(), fresh);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }
}
