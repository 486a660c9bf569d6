//! Session token generation and salted-hash verification.
//!
//! Raw tokens exist only in the value returned from an approval. The broker
//! keeps a random salt and `SHA-256(salt || token)`, and compares digests in
//! constant time.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Prefix that makes leaked tokens easy to grep for.
const TOKEN_PREFIX: &str = "sbt_";

/// Random bytes per token.
const TOKEN_BYTES: usize = 32;

/// Random bytes per salt.
const SALT_BYTES: usize = 16;

/// Generate a fresh opaque session token.
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("{TOKEN_PREFIX}{}", URL_SAFE_NO_PAD.encode(bytes))
}

/// Salted digest of a session token.
#[derive(Clone)]
pub struct TokenHash {
    salt: [u8; SALT_BYTES],
    digest: [u8; 32],
}

impl TokenHash {
    /// Hash `token` under a fresh random salt.
    pub fn new(token: &str) -> Self {
        let mut salt = [0u8; SALT_BYTES];
        rand::thread_rng().fill_bytes(&mut salt);
        let digest = digest(&salt, token);
        Self { salt, digest }
    }

    /// Constant-time check of a presented token against the stored digest.
    pub fn verify(&self, presented: &str) -> bool {
        let candidate = digest(&self.salt, presented);
        bool::from(candidate[..].ct_eq(&self.digest[..]))
    }

    /// Short non-secret identifier for log correlation.
    pub fn fingerprint(&self) -> String {
        hex::encode(&self.digest[..6])
    }
}

impl std::fmt::Debug for TokenHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenHash")
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

fn digest(salt: &[u8], token: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(token.as_bytes());
    hasher.finalize().into()
}
