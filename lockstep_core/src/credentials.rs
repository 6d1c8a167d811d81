// Credential hashing and sealed secret storage.
//
// Two unrelated jobs live here because they share the randomness plumbing:
//
// 1. **Password hashing for the handshake.** Group passwords never cross the
//    wire in plain text. The client mixes the password with the session salt
//    (the host's server id) and the per-session seed, then hashes:
//
//      buf[i] = password[i] ^ salt[i] ^ (seed >> (i % 32)) as u8
//
//    over `max(SALT_LENGTH, len(password), len(salt))` bytes, zero-padding
//    whichever input is shorter, and sends the SHA-256 hex digest. An empty
//    password hashes to the empty string so "no password" stays
//    recognizable.
//
// 2. **Sealed persistence of session secrets.** The session salt and group
//    passwords are stored inside a saved session as an authenticated,
//    encrypted envelope (XChaCha20-Poly1305):
//
//      token (16) | nonce (24) | tag (16) | ciphertext
//
//    The token identifies which host's storage key sealed the envelope; a
//    foreign token is skipped without attempting decryption. Random padding
//    (0..=255 bytes) is added to the plaintext so the envelope length does
//    not reveal whether any passwords are set.
//
// Randomness comes from an `EntropySource` (the OS generator in production).
// Key material for ids and storage keys falls back to a time-seeded generator
// with a warning when the OS source fails; nonces do not, and sealing fails
// instead.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use chacha20poly1305::aead::{AeadInPlace, KeyInit};
use chacha20poly1305::{Key, Tag, XChaCha20Poly1305, XNonce};
use rand::rngs::{OsRng, StdRng};
use rand::{RngCore, SeedableRng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

/// Minimum number of bytes mixed into a password hash.
pub const SALT_LENGTH: usize = 32;

pub const TOKEN_LENGTH: usize = 16;
pub const NONCE_LENGTH: usize = 24;
pub const TAG_LENGTH: usize = 16;
pub const KEY_LENGTH: usize = 32;

/// Bytes in front of the ciphertext of a `CredentialEnvelope`.
pub const ENVELOPE_HEADER_LENGTH: usize = TOKEN_LENGTH + NONCE_LENGTH + TAG_LENGTH;

#[derive(Debug, Error)]
pub enum CredentialError {
    /// Too short to hold a header plus at least one byte of ciphertext.
    #[error("credential envelope too short: {len} bytes")]
    TooShort { len: usize },

    /// Sealed with another host's storage key.
    #[error("credential envelope was sealed by a different host")]
    ForeignToken,

    /// Decryption failed: wrong key, or the envelope was modified.
    #[error("credential envelope failed authentication")]
    AuthFailure,

    /// No usable randomness for a nonce.
    #[error("no random source available: {0}")]
    NoRandomness(String),

    /// Stored key material is malformed.
    #[error("invalid key material: {0}")]
    InvalidKey(String),

    /// The sealed payload did not decode.
    #[error("invalid sealed payload: {0}")]
    Payload(String),
}

/// Hash a password for transmission during the handshake.
pub fn hash_password(password: &str, salt: &str, seed: u32) -> String {
    if password.is_empty() {
        return String::new();
    }

    let password = password.as_bytes();
    let salt = salt.as_bytes();
    let len = SALT_LENGTH.max(password.len()).max(salt.len());

    let buffer: Vec<u8> = (0..len)
        .map(|i| {
            let p = password.get(i).copied().unwrap_or(0);
            let s = salt.get(i).copied().unwrap_or(0);
            p ^ s ^ (seed >> (i % 32)) as u8
        })
        .collect();

    hex::encode(Sha256::digest(&buffer))
}

/// A source of random bytes that may fail.
pub trait EntropySource {
    fn try_fill(&mut self, dest: &mut [u8]) -> Result<(), rand::Error>;
}

/// The operating system's random generator.
#[derive(Clone, Copy, Debug, Default)]
pub struct OsEntropy;

impl EntropySource for OsEntropy {
    fn try_fill(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        OsRng.try_fill_bytes(dest)
    }
}

/// Whether `fill_random` had to fall back to the weak generator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RandomQuality {
    Strong,
    Degraded,
}

/// Fill `dest` with random bytes, falling back to a time-seeded generator
/// if the source fails. The fallback is logged, never silent.
pub fn fill_random(source: &mut dyn EntropySource, dest: &mut [u8]) -> RandomQuality {
    match source.try_fill(dest) {
        Ok(()) => RandomQuality::Strong,
        Err(err) => {
            warn!(
                error = %err,
                "random source unavailable, using a poor-quality fallback for key generation"
            );
            let nanos = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(0);
            let mut rng = StdRng::seed_from_u64(nanos ^ u64::from(std::process::id()));
            rng.fill_bytes(dest);
            RandomQuality::Degraded
        }
    }
}

/// `bytes` random bytes rendered as lowercase hex.
pub fn random_key_string(source: &mut dyn EntropySource, bytes: usize) -> String {
    let mut buffer = vec![0u8; bytes];
    fill_random(source, &mut buffer);
    hex::encode(buffer)
}

/// Identity token and symmetric key this host seals secrets with.
#[derive(Clone, PartialEq, Eq)]
pub struct StorageKeys {
    pub token: [u8; TOKEN_LENGTH],
    pub key: [u8; KEY_LENGTH],
}

impl StorageKeys {
    pub fn generate(source: &mut dyn EntropySource) -> Self {
        let mut token = [0u8; TOKEN_LENGTH];
        let mut key = [0u8; KEY_LENGTH];
        fill_random(source, &mut token);
        fill_random(source, &mut key);
        StorageKeys { token, key }
    }

    pub fn from_hex(token: &str, key: &str) -> Result<Self, CredentialError> {
        Ok(StorageKeys {
            token: decode_fixed(token, "storage token")?,
            key: decode_fixed(key, "storage secret")?,
        })
    }

    /// `(token, key)` as hex strings, the form kept in the config file.
    pub fn to_hex(&self) -> (String, String) {
        (hex::encode(self.token), hex::encode(self.key))
    }
}

impl std::fmt::Debug for StorageKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageKeys")
            .field("token", &hex::encode(self.token))
            .field("key", &"<redacted>")
            .finish()
    }
}

fn decode_fixed<const N: usize>(text: &str, what: &str) -> Result<[u8; N], CredentialError> {
    let bytes = hex::decode(text).map_err(|e| CredentialError::InvalidKey(format!("{what}: {e}")))?;
    bytes.try_into().map_err(|bytes: Vec<u8>| {
        CredentialError::InvalidKey(format!("{what}: expected {N} bytes, got {}", bytes.len()))
    })
}

/// An authenticated, encrypted blob as stored on disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CredentialEnvelope {
    pub token: [u8; TOKEN_LENGTH],
    pub nonce: [u8; NONCE_LENGTH],
    pub tag: [u8; TAG_LENGTH],
    pub ciphertext: Vec<u8>,
}

impl CredentialEnvelope {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(ENVELOPE_HEADER_LENGTH + self.ciphertext.len());
        out.extend_from_slice(&self.token);
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.tag);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CredentialError> {
        if bytes.len() <= ENVELOPE_HEADER_LENGTH {
            return Err(CredentialError::TooShort { len: bytes.len() });
        }
        let (token, rest) = bytes.split_at(TOKEN_LENGTH);
        let (nonce, rest) = rest.split_at(NONCE_LENGTH);
        let (tag, ciphertext) = rest.split_at(TAG_LENGTH);
        Ok(CredentialEnvelope {
            token: token.try_into().map_err(|_| CredentialError::TooShort { len: bytes.len() })?,
            nonce: nonce.try_into().map_err(|_| CredentialError::TooShort { len: bytes.len() })?,
            tag: tag.try_into().map_err(|_| CredentialError::TooShort { len: bytes.len() })?,
            ciphertext: ciphertext.to_vec(),
        })
    }
}

/// Encrypt `plaintext` under `keys`. Fails rather than use a weak nonce.
pub fn seal(
    plaintext: &[u8],
    keys: &StorageKeys,
    source: &mut dyn EntropySource,
) -> Result<CredentialEnvelope, CredentialError> {
    let mut nonce = [0u8; NONCE_LENGTH];
    source
        .try_fill(&mut nonce)
        .map_err(|e| CredentialError::NoRandomness(e.to_string()))?;

    let cipher = XChaCha20Poly1305::new(Key::from_slice(&keys.key));
    let mut ciphertext = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(XNonce::from_slice(&nonce), &keys.token, &mut ciphertext)
        .map_err(|_| CredentialError::AuthFailure)?;

    let mut tag_bytes = [0u8; TAG_LENGTH];
    tag_bytes.copy_from_slice(tag.as_slice());
    Ok(CredentialEnvelope {
        token: keys.token,
        nonce,
        tag: tag_bytes,
        ciphertext,
    })
}

/// Decrypt an envelope produced by `seal`.
pub fn open(bytes: &[u8], keys: &StorageKeys) -> Result<Vec<u8>, CredentialError> {
    let envelope = CredentialEnvelope::from_bytes(bytes)?;
    if envelope.token != keys.token {
        return Err(CredentialError::ForeignToken);
    }

    let cipher = XChaCha20Poly1305::new(Key::from_slice(&keys.key));
    let mut plaintext = envelope.ciphertext;
    cipher
        .decrypt_in_place_detached(
            XNonce::from_slice(&envelope.nonce),
            &keys.token,
            &mut plaintext,
            Tag::from_slice(&envelope.tag),
        )
        .map_err(|_| CredentialError::AuthFailure)?;
    Ok(plaintext)
}

/// Secrets persisted with a saved session.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSecrets {
    pub session_salt: String,
    pub group_passwords: BTreeMap<u8, String>,
}

/// Seal `secrets` into an opaque blob.
///
/// Plaintext layout: `len (u32 BE) | json | padding`.
pub fn seal_group_secrets(
    secrets: &GroupSecrets,
    keys: &StorageKeys,
    source: &mut dyn EntropySource,
) -> Result<Vec<u8>, CredentialError> {
    let json = serde_json::to_vec(secrets).map_err(|e| CredentialError::Payload(e.to_string()))?;
    let len = u32::try_from(json.len())
        .map_err(|_| CredentialError::Payload("secrets too large".into()))?;

    let mut pad_len = [0u8; 1];
    fill_random(source, &mut pad_len);
    let mut padding = vec![0u8; usize::from(pad_len[0])];
    fill_random(source, &mut padding);

    let mut plaintext = Vec::with_capacity(4 + json.len() + padding.len());
    plaintext.extend_from_slice(&len.to_be_bytes());
    plaintext.extend_from_slice(&json);
    plaintext.extend_from_slice(&padding);

    Ok(seal(&plaintext, keys, source)?.to_bytes())
}

/// Open a blob produced by `seal_group_secrets`. A blob sealed by another
/// host yields `Ok(None)`.
pub fn open_group_secrets(
    bytes: &[u8],
    keys: &StorageKeys,
) -> Result<Option<GroupSecrets>, CredentialError> {
    let plaintext = match open(bytes, keys) {
        Ok(plaintext) => plaintext,
        Err(CredentialError::ForeignToken) => {
            debug!("sealed secrets belong to another host; skipping");
            return Ok(None);
        }
        Err(err) => return Err(err),
    };

    let (prefix, rest) = plaintext
        .split_first_chunk::<4>()
        .ok_or_else(|| CredentialError::Payload("missing length prefix".into()))?;
    let len = u32::from_be_bytes(*prefix) as usize;
    let json = rest
        .get(..len)
        .ok_or_else(|| CredentialError::Payload("length prefix exceeds payload".into()))?;
    let secrets =
        serde_json::from_slice(json).map_err(|e| CredentialError::Payload(e.to_string()))?;
    Ok(Some(secrets))
}
