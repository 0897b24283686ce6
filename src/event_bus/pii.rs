//! Field-level protection of personally identifiable data.
//!
//! A fixed table of JSON paths is encrypted before events are persisted or
//! queued, decrypted just before a handler runs, and redacted in audit output.

use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::warn;

use super::types::Event;

const NONCE_LEN: usize = 12;

/// Marker prepended to every ciphertext so protected values are recognisable
pub const CIPHERTEXT_PREFIX: &str = "enc:v1:";

pub const REDACTED: &str = "[REDACTED]";

/// A sensitive path, rooted at the event (`["payload", "user_id"]`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PiiField {
    pub path: &'static [&'static str],
    pub encrypt: bool,
    pub redact: bool,
}

impl PiiField {
    pub fn dotted(&self) -> String {
        self.path.join(".")
    }
}

/// Sensitive fields, independent of event type
pub const PII_FIELDS: &[PiiField] = &[
    // Identifiers stay joinable in logs as ciphertext
    PiiField { path: &["payload", "user_id"], encrypt: true, redact: false },
    PiiField { path: &["payload", "account_id"], encrypt: true, redact: false },
    PiiField { path: &["payload", "ip_address"], encrypt: true, redact: true },
    PiiField { path: &["payload", "device_fingerprint"], encrypt: true, redact: true },
    PiiField { path: &["payload", "email"], encrypt: true, redact: true },
    PiiField { path: &["payload", "phone"], encrypt: true, redact: true },
    PiiField { path: &["payload", "recipient"], encrypt: true, redact: true },
    PiiField { path: &["payload", "full_name"], encrypt: true, redact: true },
    PiiField { path: &["metadata", "ip_address"], encrypt: true, redact: true },
    PiiField { path: &["metadata", "user_agent"], encrypt: false, redact: true },
];

#[derive(Debug, thiserror::Error)]
pub enum PiiError {
    #[error("encryption key is empty")]
    EmptyKey,
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("decryption failed")]
    DecryptionFailed,
    #[error("invalid encoding")]
    InvalidEncoding,
    #[error("invalid UTF-8")]
    InvalidUtf8,
    #[error("value is not protected ciphertext")]
    NotCiphertext,
}

/// ChaCha20-Poly1305 over individual JSON values
#[derive(Clone)]
pub struct PiiCipher {
    key: [u8; 32],
}

impl std::fmt::Debug for PiiCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PiiCipher").finish_non_exhaustive()
    }
}

impl PiiCipher {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Derive the 256-bit key from a configured secret (SHA-256)
    pub fn from_secret(secret: &str) -> Result<Self, PiiError> {
        if secret.trim().is_empty() {
            return Err(PiiError::EmptyKey);
        }
        let digest = Sha256::digest(secret.as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        Ok(Self { key })
    }

    /// Encrypt the JSON encoding of `value`.
    /// Returns prefix + base64(nonce + ciphertext).
    pub fn encrypt(&self, value: &Value) -> Result<String, PiiError> {
        let plaintext = serde_json::to_vec(value).map_err(|_| PiiError::EncryptionFailed)?;

        let cipher = ChaCha20Poly1305::new((&self.key).into());
        let mut nonce_bytes = [0u8; NONCE_LEN];
        chacha20poly1305::aead::rand_core::RngCore::fill_bytes(&mut OsRng, &mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_slice())
            .map_err(|_| PiiError::EncryptionFailed)?;

        let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);

        Ok(format!(
            "{CIPHERTEXT_PREFIX}{}",
            base64::engine::general_purpose::STANDARD.encode(&combined)
        ))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<Value, PiiError> {
        let body = encoded
            .strip_prefix(CIPHERTEXT_PREFIX)
            .ok_or(PiiError::NotCiphertext)?;
        let combined = base64::engine::general_purpose::STANDARD
            .decode(body)
            .map_err(|_| PiiError::InvalidEncoding)?;

        if combined.len() < NONCE_LEN {
            return Err(PiiError::InvalidEncoding);
        }

        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let cipher = ChaCha20Poly1305::new((&self.key).into());

        let plaintext = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| PiiError::DecryptionFailed)?;

        serde_json::from_slice(&plaintext).map_err(|_| PiiError::InvalidUtf8)
    }
}

pub fn is_ciphertext(value: &Value) -> bool {
    value
        .as_str()
        .is_some_and(|s| s.starts_with(CIPHERTEXT_PREFIX))
}

/// Applies the PII table to events
///
/// Every method returns a transformed copy; the input event is never mutated.
#[derive(Debug, Clone)]
pub struct PiiProtector {
    cipher: PiiCipher,
    fields: &'static [PiiField],
}

impl PiiProtector {
    pub fn new(cipher: PiiCipher) -> Self {
        Self::with_fields(cipher, PII_FIELDS)
    }

    pub fn with_fields(cipher: PiiCipher, fields: &'static [PiiField]) -> Self {
        Self { cipher, fields }
    }

    pub fn fields(&self) -> &'static [PiiField] {
        self.fields
    }

    /// Encrypt every field flagged `encrypt`; empty and absent fields are skipped
    ///
    /// A value is left alone only when it is ciphertext this cipher can open.
    /// Anything else carrying the prefix is plaintext and gets encrypted.
    pub fn protect(&self, event: &Event) -> Result<Event, PiiError> {
        let mut protected = event.clone();
        for field in self.fields.iter().filter(|f| f.encrypt) {
            let Some(slot) = field_mut(&mut protected, field.path) else {
                continue;
            };
            if is_empty(slot) || self.is_own_ciphertext(slot) {
                continue;
            }
            *slot = Value::String(self.cipher.encrypt(slot)?);
        }
        Ok(protected)
    }

    fn is_own_ciphertext(&self, value: &Value) -> bool {
        value
            .as_str()
            .filter(|s| s.starts_with(CIPHERTEXT_PREFIX))
            .is_some_and(|s| self.cipher.decrypt(s).is_ok())
    }

    /// Decrypt protected fields for a subscriber
    ///
    /// A value that fails to decrypt is left as ciphertext and logged.
    pub fn reveal(&self, event: &Event) -> Event {
        let mut revealed = event.clone();
        for field in self.fields.iter().filter(|f| f.encrypt) {
            let Some(slot) = field_mut(&mut revealed, field.path) else {
                continue;
            };
            let Some(encoded) = slot.as_str().filter(|s| s.starts_with(CIPHERTEXT_PREFIX)) else {
                continue;
            };
            match self.cipher.decrypt(encoded) {
                Ok(plain) => *slot = plain,
                Err(e) => {
                    warn!(
                        event_id = %event.event_id,
                        field = %field.dotted(),
                        error = %e,
                        "PII decryption failed, delivering ciphertext"
                    );
                }
            }
        }
        revealed
    }

    /// Replace every field flagged `redact` with [`REDACTED`]
    pub fn redact(&self, event: &Event) -> Event {
        let mut redacted = event.clone();
        for field in self.fields.iter().filter(|f| f.redact) {
            if let Some(slot) = field_mut(&mut redacted, field.path) {
                if !slot.is_null() {
                    *slot = Value::String(REDACTED.to_string());
                }
            }
        }
        redacted
    }
}

fn field_mut<'a>(event: &'a mut Event, path: &[&str]) -> Option<&'a mut Value> {
    let (root, rest) = path.split_first()?;
    let mut current = match *root {
        "payload" => &mut event.payload,
        "metadata" => event.metadata.as_mut()?,
        _ => return None,
    };
    for key in rest {
        current = current.as_object_mut()?.get_mut(*key)?;
    }
    Some(current)
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}
