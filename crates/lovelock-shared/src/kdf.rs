//! Shared-key derivation for a pairing.
//!
//! The key is a pure function of the two participant identifiers:
//! `PBKDF2-HMAC-SHA256(min(a, b) ‖ max(a, b), "love-lock-salt", 250 000)`.
//! There is no key exchange and nothing is persisted.
//!
//! Security note: anyone who learns both identifiers can derive the key. The
//! inputs are kept exactly as deployed clients use them so existing
//! conversations stay readable.

use std::collections::HashMap;
use std::fmt;

use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::constants::{KDF_SALT, MIN_PBKDF2_ITERATIONS, PBKDF2_ITERATIONS, SHARED_KEY_SIZE};
use crate::error::DerivationError;
use crate::types::Pairing;

/// 256-bit symmetric key for one pairing. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SharedKey([u8; SHARED_KEY_SIZE]);

impl SharedKey {
    pub fn from_bytes(bytes: [u8; SHARED_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SHARED_KEY_SIZE] {
        &self.0
    }
}

impl PartialEq for SharedKey {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for SharedKey {}

impl fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedKey(..)")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyDeriver {
    iterations: u32,
}

impl KeyDeriver {
    pub fn new() -> Self {
        Self {
            iterations: PBKDF2_ITERATIONS,
        }
    }

    /// Keys derived with anything but [`PBKDF2_ITERATIONS`] cannot read
    /// conversations written by other clients. Meant for tests.
    pub fn with_iterations(iterations: u32) -> Self {
        if iterations < MIN_PBKDF2_ITERATIONS {
            tracing::warn!(iterations, "reduced PBKDF2 iteration count, keys are not interoperable");
        }
        Self {
            iterations: iterations.max(1),
        }
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    pub fn derive(&self, id_a: &str, id_b: &str) -> Result<SharedKey, DerivationError> {
        if id_a.is_empty() || id_b.is_empty() {
            return Err(DerivationError::EmptyIdentifier);
        }

        let mut passphrase = canonical_passphrase(id_a, id_b);
        let mut key = [0u8; SHARED_KEY_SIZE];
        pbkdf2::pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), KDF_SALT, self.iterations, &mut key);
        passphrase.zeroize();

        Ok(SharedKey(key))
    }

    pub fn derive_for(&self, pairing: &Pairing) -> Result<SharedKey, DerivationError> {
        self.derive(pairing.local().as_str(), pairing.remote().as_str())
    }
}

impl Default for KeyDeriver {
    fn default() -> Self {
        Self::new()
    }
}

/// Derive the shared key for two identifiers with the deployed parameters.
pub fn derive_shared_key(id_a: &str, id_b: &str) -> Result<SharedKey, DerivationError> {
    KeyDeriver::new().derive(id_a, id_b)
}

fn canonical_passphrase(id_a: &str, id_b: &str) -> String {
    if id_a < id_b {
        format!("{id_a}{id_b}")
    } else {
        format!("{id_b}{id_a}")
    }
}

/// Per-session memo of derived keys, keyed by the canonical pairing.
#[derive(Debug, Default)]
pub struct KeyCache {
    keys: HashMap<(String, String), SharedKey>,
}

impl KeyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, pairing: &Pairing) -> Option<SharedKey> {
        self.keys.get(&cache_key(pairing)).cloned()
    }

    pub fn insert(&mut self, pairing: &Pairing, key: SharedKey) {
        self.keys.insert(cache_key(pairing), key);
    }

    pub fn get_or_derive(
        &mut self,
        deriver: &KeyDeriver,
        pairing: &Pairing,
    ) -> Result<SharedKey, DerivationError> {
        if let Some(key) = self.get(pairing) {
            return Ok(key);
        }
        let key = deriver.derive_for(pairing)?;
        self.insert(pairing, key.clone());
        Ok(key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn clear(&mut self) {
        self.keys.clear();
    }
}

fn cache_key(pairing: &Pairing) -> (String, String) {
    let (first, second) = pairing.canonical();
    (first.to_string(), second.to_string())
}
