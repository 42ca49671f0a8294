//! Versioned field-level encryption.
//!
//! Wire format (base64): `version_u16_be || salt[32] || nonce[12] ||
//! aead_ciphertext`. The content key is derived per payload with
//! PBKDF2-HMAC-SHA256 from the ring key for that version; the AEAD is
//! AES-256-GCM. Legacy v1 payloads omit the version prefix and remain
//! decryptable behind an opt-in recovery path.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Sha256;
use tracing::{debug, info, warn};
use zeroize::Zeroize;

use crate::errors::{Result, TetherError};

const SALT_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const VERSION_LEN: usize = 2;
const PBKDF2_ITERATIONS: u32 = 100_000;

/// Minimum decoded length of a legacy (unversioned) payload: salt + nonce.
pub const MIN_ENCRYPTED_LEN: usize = SALT_LEN + NONCE_LEN;
/// Minimum decoded length of a versioned payload.
pub const MIN_VERSIONED_LEN: usize = VERSION_LEN + MIN_ENCRYPTED_LEN;

/// Version implied by payloads without a version prefix.
pub const LEGACY_VERSION: u16 = 1;

/// Fixed plaintext round-tripped by [`FieldCipher::validate_all`].
const PROBE_PLAINTEXT: &str = "tether-keyring-probe";

/// Substrings that mark a key as a placeholder unfit for production.
const PLACEHOLDER_MARKERS: [&str; 7] = [
    "dev-",
    "test-",
    "change-me",
    "insecure",
    "default",
    "development",
    "local-",
];

/// The set of keys the cipher can decrypt with: one current key used for
/// all new payloads, plus retired keys kept for reads.
#[derive(Debug)]
pub struct KeyRing {
    current_version: u16,
    current_key: String,
    legacy: HashMap<u16, String>,
}

impl KeyRing {
    pub fn new(version: u16, key: impl Into<String>) -> Result<Self> {
        let key = key.into();
        if version == 0 {
            return Err(TetherError::validation("version", "must be greater than 0"));
        }
        if key.is_empty() {
            return Err(TetherError::validation("key", "must not be empty"));
        }
        Ok(Self {
            current_version: version,
            current_key: key,
            legacy: HashMap::new(),
        })
    }

    pub fn current_version(&self) -> u16 {
        self.current_version
    }

    fn key_for(&self, version: u16) -> Option<&str> {
        if version == self.current_version {
            Some(&self.current_key)
        } else {
            self.legacy.get(&version).map(String::as_str)
        }
    }

    /// Retire the current key to the legacy set and install `new_key` as
    /// `current_version + 1`. Payloads sealed under the old version keep
    /// decrypting.
    fn rotate(&mut self, new_key: impl Into<String>) -> Result<u16> {
        let new_key = new_key.into();
        if new_key.is_empty() {
            return Err(TetherError::validation("key", "must not be empty"));
        }
        let retired = std::mem::replace(&mut self.current_key, new_key);
        self.legacy.insert(self.current_version, retired);
        self.current_version += 1;
        Ok(self.current_version)
    }

    fn add_legacy(&mut self, version: u16, key: impl Into<String>) -> Result<()> {
        let key = key.into();
        if version == 0 {
            return Err(TetherError::validation("version", "must be greater than 0"));
        }
        if key.is_empty() {
            return Err(TetherError::validation("key", "must not be empty"));
        }
        self.legacy.insert(version, key);
        Ok(())
    }

    fn versions(&self) -> Vec<u16> {
        let mut versions: Vec<u16> = self.legacy.keys().copied().collect();
        versions.push(self.current_version);
        versions.sort_unstable();
        versions
    }
}

impl Drop for KeyRing {
    fn drop(&mut self) {
        self.current_key.zeroize();
        for key in self.legacy.values_mut() {
            key.zeroize();
        }
    }
}

/// Process-wide encryptor for sensitive fields. Readers (encrypt/decrypt)
/// share the ring; only `rotate`/`add_legacy` take the write lock.
pub struct FieldCipher {
    ring: RwLock<KeyRing>,
    legacy_fallback: bool,
}

impl FieldCipher {
    pub fn new(ring: KeyRing, legacy_fallback: bool) -> Self {
        Self {
            ring: RwLock::new(ring),
            legacy_fallback,
        }
    }

    pub fn current_version(&self) -> u16 {
        self.read_ring(|ring| ring.current_version())
    }

    fn read_ring<T>(&self, f: impl FnOnce(&KeyRing) -> T) -> T {
        let guard = self.ring.read().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    /// Encrypt a UTF-8 string under the current ring version. Empty
    /// plaintext encrypts to empty output.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        if plaintext.is_empty() {
            return Ok(String::new());
        }
        self.read_ring(|ring| {
            seal(ring.current_version, &ring.current_key, plaintext)
        })
    }

    /// Decrypt a payload produced by any ring version. Empty ciphertext
    /// decrypts to empty plaintext.
    pub fn decrypt(&self, encoded: &str) -> Result<String> {
        if encoded.is_empty() {
            return Ok(String::new());
        }
        let data = BASE64.decode(encoded).map_err(|e| {
            TetherError::validation("ciphertext", format!("not valid base64: {}", e))
        })?;

        self.read_ring(|ring| {
            if data.len() < MIN_VERSIONED_LEN {
                return open_legacy(ring, &data);
            }

            let version = u16::from_be_bytes([data[0], data[1]]);
            match ring.key_for(version) {
                Some(key) => open_versioned(version, key, &data),
                None if self.legacy_fallback => {
                    debug!("no key for version {}, attempting legacy decode", version);
                    open_legacy(ring, &data).map_err(|_| unknown_version(version))
                }
                None => Err(unknown_version(version)),
            }
        })
    }

    /// Install a new current key; the previous one is retired to the
    /// legacy set so outstanding payloads keep decrypting.
    pub fn rotate(&self, new_key: impl Into<String>) -> Result<u16> {
        let mut guard = self.ring.write().unwrap_or_else(PoisonError::into_inner);
        let version = guard.rotate(new_key)?;
        info!("encryption key rotated, current version is now {}", version);
        Ok(version)
    }

    pub fn add_legacy(&self, version: u16, key: impl Into<String>) -> Result<()> {
        let mut guard = self.ring.write().unwrap_or_else(PoisonError::into_inner);
        guard.add_legacy(version, key)
    }

    /// Decrypt with whatever ring key works and re-encrypt under the
    /// current version. The output length differs from the input.
    pub fn migrate(&self, encoded: &str) -> Result<String> {
        let plaintext = self.decrypt(encoded)?;
        self.encrypt(&plaintext)
    }

    /// Round-trip a probe plaintext through the current and every legacy
    /// key. A failure names the offending version.
    pub fn validate_all(&self) -> Result<()> {
        self.read_ring(|ring| {
            for version in ring.versions() {
                let key = ring
                    .key_for(version)
                    .ok_or_else(|| TetherError::Fatal(format!("ring lost key {}", version)))?;
                let sealed = seal(version, key, PROBE_PLAINTEXT)?;
                let data = BASE64.decode(&sealed).map_err(|e| {
                    TetherError::Fatal(format!("probe for version {} undecodable: {}", version, e))
                })?;
                let opened = open_versioned(version, key, &data).map_err(|e| {
                    TetherError::Fatal(format!("key version {} failed validation: {}", version, e))
                })?;
                if opened != PROBE_PLAINTEXT {
                    return Err(TetherError::Fatal(format!(
                        "key version {} corrupted the probe plaintext",
                        version
                    )));
                }
            }
            Ok(())
        })
    }

    /// Report the version prefix of an encoded payload, or
    /// [`LEGACY_VERSION`] for unprefixed payloads. Diagnostic only.
    pub fn payload_version(encoded: &str) -> Result<u16> {
        let data = BASE64.decode(encoded).map_err(|e| {
            TetherError::validation("ciphertext", format!("not valid base64: {}", e))
        })?;
        if data.len() < MIN_VERSIONED_LEN {
            return Ok(LEGACY_VERSION);
        }
        Ok(u16::from_be_bytes([data[0], data[1]]))
    }
}

/// Whether a stored string looks like one of our payloads: valid base64
/// decoding to at least the legacy minimum length.
pub fn is_encrypted(value: &str) -> bool {
    match BASE64.decode(value) {
        Ok(data) => data.len() >= MIN_ENCRYPTED_LEN,
        Err(_) => false,
    }
}

/// Reject placeholder keys and keys too short to be credible secrets.
pub fn production_ready(key: &str) -> Result<()> {
    if key.len() < 16 {
        return Err(TetherError::validation(
            "encryption_key",
            "must be at least 16 bytes",
        ));
    }
    let lower = key.to_lowercase();
    for marker in PLACEHOLDER_MARKERS {
        if lower.contains(marker) {
            return Err(TetherError::validation(
                "encryption_key",
                format!("placeholder value (contains {:?})", marker),
            ));
        }
    }
    Ok(())
}

fn unknown_version(version: u16) -> TetherError {
    TetherError::validation(
        "ciphertext",
        format!("no key in ring for payload version {}", version),
    )
}

/// PBKDF2-HMAC-SHA256 content key for one payload.
fn derive_key(key: &str, salt: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(key.as_bytes(), salt, PBKDF2_ITERATIONS, &mut out);
    out
}

fn seal(version: u16, key: &str, plaintext: &str) -> Result<String> {
    let mut salt = [0u8; SALT_LEN];
    OsRng.try_fill_bytes(&mut salt).map_err(|e| {
        TetherError::Fatal(format!("random source failure generating salt: {}", e))
    })?;
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.try_fill_bytes(&mut nonce_bytes).map_err(|e| {
        TetherError::Fatal(format!("random source failure generating nonce: {}", e))
    })?;

    let mut content_key = derive_key(key, &salt);
    let cipher = Aes256Gcm::new_from_slice(&content_key)
        .map_err(|_| TetherError::Fatal("derived key has wrong length".into()));
    content_key.zeroize();
    let cipher = cipher?;

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
        .map_err(|e| TetherError::Fatal(format!("encryption failed: {}", e)))?;

    let mut packed = Vec::with_capacity(VERSION_LEN + SALT_LEN + NONCE_LEN + ciphertext.len());
    packed.extend_from_slice(&version.to_be_bytes());
    packed.extend_from_slice(&salt);
    packed.extend_from_slice(&nonce_bytes);
    packed.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(packed))
}

fn open_versioned(version: u16, key: &str, data: &[u8]) -> Result<String> {
    if data.len() < MIN_VERSIONED_LEN {
        return Err(TetherError::validation(
            "ciphertext",
            format!("versioned payload shorter than {} bytes", MIN_VERSIONED_LEN),
        ));
    }
    let salt = &data[VERSION_LEN..VERSION_LEN + SALT_LEN];
    let nonce = &data[VERSION_LEN + SALT_LEN..MIN_VERSIONED_LEN];
    let ciphertext = &data[MIN_VERSIONED_LEN..];
    open(key, salt, nonce, ciphertext).map_err(|_| {
        TetherError::validation(
            "ciphertext",
            format!("authenticated decryption failed for version {}", version),
        )
    })
}

/// Unprefixed v1 payload: `salt[32] || nonce[12] || ciphertext`. Uses the
/// registered v1 key if present, the current key otherwise.
fn open_legacy(ring: &KeyRing, data: &[u8]) -> Result<String> {
    if data.len() < MIN_ENCRYPTED_LEN {
        return Err(TetherError::validation(
            "ciphertext",
            format!("payload shorter than {} bytes", MIN_ENCRYPTED_LEN),
        ));
    }
    let key = ring
        .key_for(LEGACY_VERSION)
        .unwrap_or(&ring.current_key);
    let salt = &data[..SALT_LEN];
    let nonce = &data[SALT_LEN..MIN_ENCRYPTED_LEN];
    let ciphertext = &data[MIN_ENCRYPTED_LEN..];
    open(key, salt, nonce, ciphertext).map_err(|_| {
        warn!("legacy payload failed authenticated decryption");
        TetherError::validation(
            "ciphertext",
            format!("authenticated decryption failed for version {}", LEGACY_VERSION),
        )
    })
}

fn open(key: &str, salt: &[u8], nonce: &[u8], ciphertext: &[u8]) -> Result<String> {
    let mut content_key = derive_key(key, salt);
    let cipher = Aes256Gcm::new_from_slice(&content_key)
        .map_err(|_| TetherError::Fatal("derived key has wrong length".into()));
    content_key.zeroize();
    let cipher = cipher?;

    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| TetherError::validation("ciphertext", "authenticated decryption failed"))?;
    String::from_utf8(plaintext)
        .map_err(|e| TetherError::validation("ciphertext", format!("not valid UTF-8: {}", e)))
}

#[cfg(test)]
mod tests;
