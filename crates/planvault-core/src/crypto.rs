//! Encryption adapter.
//!
//! - Workspace key: 32 bytes derived from a passphrase with Argon2id, or
//!   supplied directly as a base64 custom key
//! - Payloads: ChaCha20-Poly1305, wire format `base64(nonce(12) || ciphertext || tag(16))`
//! - Shared tables: one random DEK per table, wrapped for the owner under the
//!   workspace key and for each recipient with X25519 + HKDF-SHA256

use std::fmt;

use argon2::Argon2;
use base64::{engine::general_purpose::STANDARD, Engine};
use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::error::CryptoError;

pub type Result<T> = std::result::Result<T, CryptoError>;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

const PASSPHRASE_SALT_CONTEXT: &str = "planvault/workspace-key/v1:";
const KEYPAIR_INFO: &[u8] = b"planvault/x25519/v1";
const DEK_WRAP_INFO: &[u8] = b"planvault/dek-wrap/v1";

/// The user's symmetric workspace key. Never leaves the client.
#[derive(Clone)]
pub struct WorkspaceKey {
    bytes: [u8; KEY_LEN],
}

impl WorkspaceKey {
    /// Derive the key from a passphrase.
    ///
    /// The salt is bound to the account identifier so every device of the
    /// same account derives the same key without storing a salt anywhere.
    pub fn from_passphrase(passphrase: &str, account: &str) -> Result<Self> {
        let salt = Sha256::digest(
            format!("{}{}", PASSPHRASE_SALT_CONTEXT, account.trim().to_lowercase()).as_bytes(),
        );
        let mut bytes = [0u8; KEY_LEN];
        Argon2::default()
            .hash_password_into(passphrase.as_bytes(), &salt[..16], &mut bytes)
            .map_err(|e| CryptoError::KdfFailed(e.to_string()))?;
        Ok(Self { bytes })
    }

    /// Accept a user-managed custom key (base64, 32 bytes)
    pub fn from_custom_key(encoded: &str) -> Result<Self> {
        let raw = STANDARD
            .decode(encoded.trim())
            .map_err(|e| CryptoError::Malformed(format!("custom key is not base64: {}", e)))?;
        let bytes: [u8; KEY_LEN] = raw
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength {
                expected: KEY_LEN,
                got: raw.len(),
            })?;
        Ok(Self { bytes })
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self { bytes }
    }

    /// Generate a random key (custom-key onboarding and tests)
    pub fn generate() -> Self {
        Self {
            bytes: random_key(),
        }
    }

    /// Base64 form of the key, for showing a custom key to the user once
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.bytes)
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String> {
        Ok(STANDARD.encode(seal(&self.bytes, plaintext)?))
    }

    pub fn decrypt(&self, ciphertext: &str) -> Result<Vec<u8>> {
        open(&self.bytes, &decode(ciphertext)?)
    }

    pub fn encrypt_json<T: Serialize>(&self, value: &T) -> Result<String> {
        self.encrypt(&serde_json::to_vec(value)?)
    }

    pub fn decrypt_json<T: DeserializeOwned>(&self, ciphertext: &str) -> Result<T> {
        Ok(serde_json::from_slice(&self.decrypt(ciphertext)?)?)
    }

    /// Wrap a table DEK for the owner's own later use
    pub fn wrap_data_key(&self, dek: &DataKey) -> Result<String> {
        self.encrypt(&dek.bytes)
    }

    pub fn unwrap_data_key(&self, wrapped: &str) -> Result<DataKey> {
        let raw = self.decrypt(wrapped)?;
        DataKey::from_slice(&raw)
    }

    /// The X25519 identity derived from this key
    pub fn keypair(&self) -> Result<KeyPair> {
        let secret = StaticSecret::from(hkdf_expand(&self.bytes, None, KEYPAIR_INFO)?);
        let public = PublicKey::from(&secret);
        Ok(KeyPair { secret, public })
    }
}

impl Drop for WorkspaceKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl fmt::Debug for WorkspaceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WorkspaceKey(..)")
    }
}

/// Per-shared-table data encryption key
#[derive(Clone, PartialEq, Eq)]
pub struct DataKey {
    bytes: [u8; KEY_LEN],
}

impl DataKey {
    pub fn generate() -> Self {
        Self {
            bytes: random_key(),
        }
    }

    fn from_slice(raw: &[u8]) -> Result<Self> {
        let bytes: [u8; KEY_LEN] = raw.try_into().map_err(|_| CryptoError::InvalidKeyLength {
            expected: KEY_LEN,
            got: raw.len(),
        })?;
        Ok(Self { bytes })
    }

    pub fn encrypt_json<T: Serialize>(&self, value: &T) -> Result<String> {
        Ok(STANDARD.encode(seal(&self.bytes, &serde_json::to_vec(value)?)?))
    }

    pub fn decrypt_json<T: DeserializeOwned>(&self, ciphertext: &str) -> Result<T> {
        let plain = open(&self.bytes, &decode(ciphertext)?)?;
        Ok(serde_json::from_slice(&plain)?)
    }

    /// Wrap this key for a recipient given their published public key.
    ///
    /// Output: `base64(ephemeral_public(32) || nonce(12) || ciphertext || tag(16))`
    pub fn wrap_for_recipient(&self, recipient_public_key: &str) -> Result<String> {
        let recipient = decode_public_key(recipient_public_key)?;
        let ephemeral = EphemeralSecret::random_from_rng(OsRng);
        let ephemeral_public = PublicKey::from(&ephemeral);
        let shared = ephemeral.diffie_hellman(&recipient);

        let wrap_key = wrap_key(shared.as_bytes(), &ephemeral_public, &recipient)?;
        let sealed = seal(&wrap_key, &self.bytes)?;

        let mut out = Vec::with_capacity(KEY_LEN + sealed.len());
        out.extend_from_slice(ephemeral_public.as_bytes());
        out.extend_from_slice(&sealed);
        Ok(STANDARD.encode(out))
    }
}

impl Drop for DataKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl fmt::Debug for DataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DataKey(..)")
    }
}

/// X25519 identity used to receive wrapped DEKs
#[derive(Clone)]
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    /// Base64 public key, as published to the key directory
    pub fn public_key(&self) -> String {
        STANDARD.encode(self.public.as_bytes())
    }

    /// Unwrap a DEK produced by [`DataKey::wrap_for_recipient`]
    pub fn unwrap_data_key(&self, wrapped: &str) -> Result<DataKey> {
        let raw = decode(wrapped)?;
        if raw.len() < KEY_LEN + NONCE_LEN + TAG_LEN {
            return Err(CryptoError::Malformed("wrapped key too short".to_string()));
        }
        let (ephemeral, sealed) = raw.split_at(KEY_LEN);
        let ephemeral = PublicKey::from(to_key_array(ephemeral)?);
        let shared = self.secret.diffie_hellman(&ephemeral);

        let wrap_key = wrap_key(shared.as_bytes(), &ephemeral, &self.public)?;
        DataKey::from_slice(&open(&wrap_key, sealed)?)
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public_key())
            .finish_non_exhaustive()
    }
}

/// Whether `encoded` is a base64 X25519 public key
pub fn is_valid_public_key(encoded: &str) -> bool {
    decode_public_key(encoded).is_ok()
}

fn random_key() -> [u8; KEY_LEN] {
    let mut bytes = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

fn seal(key: &[u8; KEY_LEN], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn open(key: &[u8; KEY_LEN], blob: &[u8]) -> Result<Vec<u8>> {
    if blob.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::Malformed("ciphertext too short".to_string()));
    }
    let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::AuthenticationFailed)
}

fn decode(encoded: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(encoded.trim())
        .map_err(|e| CryptoError::Malformed(format!("not base64: {}", e)))
}

fn decode_public_key(encoded: &str) -> Result<PublicKey> {
    Ok(PublicKey::from(to_key_array(&decode(encoded)?)?))
}

fn to_key_array(raw: &[u8]) -> Result<[u8; KEY_LEN]> {
    raw.try_into().map_err(|_| CryptoError::InvalidKeyLength {
        expected: KEY_LEN,
        got: raw.len(),
    })
}

fn hkdf_expand(ikm: &[u8], salt: Option<&[u8]>, info: &[u8]) -> Result<[u8; KEY_LEN]> {
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    let mut okm = [0u8; KEY_LEN];
    hk.expand(info, &mut okm)
        .map_err(|_| CryptoError::KdfFailed("hkdf output length".to_string()))?;
    Ok(okm)
}

// Binds the wrap key to both public keys so a wrapped DEK cannot be
// replayed against a different recipient
fn wrap_key(shared: &[u8], ephemeral: &PublicKey, recipient: &PublicKey) -> Result<[u8; KEY_LEN]> {
    let mut salt = [0u8; KEY_LEN * 2];
    salt[..KEY_LEN].copy_from_slice(ephemeral.as_bytes());
    salt[KEY_LEN..].copy_from_slice(recipient.as_bytes());
    hkdf_expand(shared, Some(&salt), DEK_WRAP_INFO)
}
