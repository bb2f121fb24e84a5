//! Deployment payloads: static config plus resolved secrets, sealed with
//! ChaCha20-Poly1305 before they touch the wire.

use crate::error::{KeelError, Result};
use crate::secrets::{ResolvedSecret, SecretLocator, SecretSet};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;
use zeroize::Zeroizing;

pub const BUNDLE_FORMAT_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// BundleFingerprint
// ---------------------------------------------------------------------------

/// `sha256:<hex>` over the bundle's *shape*: static fields, secret names and
/// key reference. Never covers secret values, so it can be computed from the
/// request alone and stored anywhere.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BundleFingerprint(String);

#[derive(Serialize)]
struct FingerprintInput<'a> {
    version: u32,
    #[serde(rename = "static")]
    static_fields: &'a BTreeMap<String, String>,
    secret_names: Vec<&'a str>,
    key_ref: String,
}

impl BundleFingerprint {
    pub fn compute<'a>(
        static_fields: &'a BTreeMap<String, String>,
        secret_names: impl IntoIterator<Item = &'a str>,
        key_ref: &SecretLocator,
    ) -> Result<Self> {
        let mut names: Vec<&str> = secret_names.into_iter().collect();
        names.sort_unstable();
        names.dedup();
        let canonical = serde_json::to_vec(&FingerprintInput {
            version: BUNDLE_FORMAT_VERSION,
            static_fields,
            secret_names: names,
            key_ref: key_ref.to_string(),
        })?;
        Ok(Self(format!("sha256:{}", hex::encode(Sha256::digest(&canonical)))))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BundleFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// BundleKey
// ---------------------------------------------------------------------------

/// 32-byte symmetric bundle key. Zeroized on drop.
pub struct BundleKey(Zeroizing<[u8; 32]>);

impl BundleKey {
    /// Decode a resolved key secret. Accepts standard base64 or hex.
    pub fn from_secret(secret: &ResolvedSecret) -> Result<Self> {
        let text = secret.expose().trim();
        // 64 hex chars also happen to be valid base64, so check hex first.
        let decoded = if text.len() == 64 && text.bytes().all(|b| b.is_ascii_hexdigit()) {
            hex::decode(text).ok()
        } else {
            B64.decode(text).ok()
        };
        let bytes = Zeroizing::new(
            decoded.ok_or_else(|| KeelError::InvalidBundleKey(secret.name().to_string()))?,
        );
        let arr: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| KeelError::InvalidBundleKey(secret.name().to_string()))?;
        Ok(Self(Zeroizing::new(arr)))
    }

    pub fn generate() -> Self {
        let key = ChaCha20Poly1305::generate_key(&mut OsRng);
        let mut arr = [0u8; 32];
        arr.copy_from_slice(key.as_slice());
        Self(Zeroizing::new(arr))
    }

    /// Base64 form, for provisioning the key into a secret store.
    pub fn to_base64(&self) -> Zeroizing<String> {
        Zeroizing::new(B64.encode(self.0.as_slice()))
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(Key::from_slice(self.0.as_slice()))
    }
}

impl fmt::Debug for BundleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BundleKey([REDACTED])")
    }
}

// ---------------------------------------------------------------------------
// ConfigBundle
// ---------------------------------------------------------------------------

/// Unsealed payload for one attempt. Holds resolved secrets, so it lives
/// only as long as the attempt's remote phases.
#[derive(Debug)]
pub struct ConfigBundle {
    static_fields: BTreeMap<String, String>,
    secrets: SecretSet,
    key_ref: SecretLocator,
    fingerprint: BundleFingerprint,
}

#[derive(Serialize)]
struct PlainPayload<'a> {
    version: u32,
    #[serde(rename = "static")]
    static_fields: &'a BTreeMap<String, String>,
    secrets: BTreeMap<&'a str, &'a str>,
}

/// Combine static config and resolved secrets into one payload.
pub fn bundle(
    static_fields: BTreeMap<String, String>,
    secrets: SecretSet,
    key_ref: SecretLocator,
) -> Result<ConfigBundle> {
    if let Some(name) = secrets.names().find(|n| static_fields.contains_key(*n)) {
        return Err(KeelError::InvalidRequest(format!(
            "'{name}' is both a static field and a secret"
        )));
    }
    let fingerprint = BundleFingerprint::compute(&static_fields, secrets.names(), &key_ref)?;
    Ok(ConfigBundle {
        static_fields,
        secrets,
        key_ref,
        fingerprint,
    })
}

impl ConfigBundle {
    pub fn fingerprint(&self) -> &BundleFingerprint {
        &self.fingerprint
    }

    pub fn key_ref(&self) -> &SecretLocator {
        &self.key_ref
    }

    /// Every secret value in the bundle, for the redaction filter.
    pub fn secret_values(&self) -> impl Iterator<Item = &str> {
        self.secrets.iter().map(ResolvedSecret::expose)
    }

    /// Encrypt the payload. The fingerprint and bundle id are bound as
    /// associated data so a ciphertext cannot be replayed under another shape.
    pub fn seal(&self, key: &BundleKey) -> Result<EncryptedBundle> {
        let payload = PlainPayload {
            version: BUNDLE_FORMAT_VERSION,
            static_fields: &self.static_fields,
            secrets: self
                .secrets
                .iter()
                .map(|s| (s.name(), s.expose()))
                .collect(),
        };
        let plaintext = Zeroizing::new(serde_json::to_vec(&payload)?);
        drop(payload);

        let bundle_id = Uuid::new_v4();
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let aad = associated_data(&self.fingerprint, bundle_id);
        let ciphertext = key
            .cipher()
            .encrypt(
                &nonce,
                Payload {
                    msg: plaintext.as_slice(),
                    aad: &aad,
                },
            )
            .map_err(|_| KeelError::BundleSealFailed)?;

        Ok(EncryptedBundle {
            bundle_id,
            key_ref: self.key_ref.clone(),
            fingerprint: self.fingerprint.clone(),
            nonce: B64.encode(nonce.as_slice()),
            ciphertext: B64.encode(ciphertext),
        })
    }
}

fn associated_data(fingerprint: &BundleFingerprint, bundle_id: Uuid) -> Vec<u8> {
    let mut aad = Vec::with_capacity(fingerprint.as_str().len() + 16);
    aad.extend_from_slice(fingerprint.as_str().as_bytes());
    aad.extend_from_slice(bundle_id.as_bytes());
    aad
}

// ---------------------------------------------------------------------------
// EncryptedBundle
// ---------------------------------------------------------------------------

/// The only form of the payload that is ever written or transmitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedBundle {
    pub bundle_id: Uuid,
    pub key_ref: SecretLocator,
    pub fingerprint: BundleFingerprint,
    /// Base64, 12 bytes.
    pub nonce: String,
    /// Base64 ciphertext with the Poly1305 tag appended.
    pub ciphertext: String,
}

impl EncryptedBundle {
    /// JSON envelope streamed to the host agent's stdin.
    pub fn to_wire(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_wire(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Decrypt to the JSON payload. This is what the host agent does; keel
    /// itself only uses it to check its own output.
    pub fn open(&self, key: &BundleKey) -> Result<Zeroizing<Vec<u8>>> {
        let nonce_bytes = B64
            .decode(&self.nonce)
            .map_err(|_| KeelError::BundleOpenFailed)?;
        if nonce_bytes.len() != 12 {
            return Err(KeelError::BundleOpenFailed);
        }
        let ciphertext = B64
            .decode(&self.ciphertext)
            .map_err(|_| KeelError::BundleOpenFailed)?;
        let aad = associated_data(&self.fingerprint, self.bundle_id);
        let plaintext = key
            .cipher()
            .decrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: &ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| KeelError::BundleOpenFailed)?;
        Ok(Zeroizing::new(plaintext))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
