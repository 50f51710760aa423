//! Per-peer session keys and payload encryption
//!
//! The engine only needs the [`CryptoProvider`] contract; [`SharedSecretCrypto`]
//! implements it on top of a pre-shared secret:
//!
//! ```text
//! key        = HKDF-SHA256(salt = min(a,b) || 0x00 || max(a,b), ikm = secret)
//! ciphertext = nonce (12B) || ChaCha20-Poly1305(key, nonce, plaintext)
//! ```

use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, CHACHA20_POLY1305, NONCE_LEN};
use ring::hkdf;
use ring::rand::{SecureRandom, SystemRandom};

use crate::error::{Error, Result};

/// Bytes added to every encrypted payload
pub const CRYPTO_OVERHEAD: usize = NONCE_LEN + 16;

const KEY_INFO: &[u8] = b"whisper session key v1";

/// Symmetric key shared by the two ends of a session
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SessionKey([u8; 32]);

impl SessionKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionKey(..)")
    }
}

/// Key derivation and authenticated encryption for session payloads
pub trait CryptoProvider {
    fn derive_session_key(&self, peer_id: &str) -> Result<SessionKey>;

    fn encrypt(&self, key: &SessionKey, plaintext: &[u8]) -> Result<Vec<u8>>;

    /// Fails with [`Error::EncryptionFailure`] if the payload does not authenticate
    fn decrypt(&self, key: &SessionKey, ciphertext: &[u8]) -> Result<Vec<u8>>;
}

/// [`CryptoProvider`] keyed by secrets shared out of band
pub struct SharedSecretCrypto {
    local_id: String,
    secret: Vec<u8>,
    peer_secrets: HashMap<String, Vec<u8>>,
    rng: SystemRandom,
}

impl SharedSecretCrypto {
    /// `secret` is used for every peer without its own secret
    pub fn new(local_id: &str, secret: &[u8]) -> Self {
        Self {
            local_id: local_id.to_string(),
            secret: secret.to_vec(),
            peer_secrets: HashMap::new(),
            rng: SystemRandom::new(),
        }
    }

    pub fn with_peer_secret(mut self, peer_id: &str, secret: &[u8]) -> Self {
        self.peer_secrets.insert(peer_id.to_string(), secret.to_vec());
        self
    }

    fn aead_key(key: &SessionKey) -> Result<LessSafeKey> {
        let unbound =
            UnboundKey::new(&CHACHA20_POLY1305, key.as_bytes()).map_err(|_| Error::EncryptionFailure)?;
        Ok(LessSafeKey::new(unbound))
    }
}

impl CryptoProvider for SharedSecretCrypto {
    fn derive_session_key(&self, peer_id: &str) -> Result<SessionKey> {
        let secret = self.peer_secrets.get(peer_id).unwrap_or(&self.secret);
        if secret.is_empty() {
            return Err(Error::EncryptionFailure);
        }

        // Both ends must arrive at the same salt
        let (first, second) = if self.local_id.as_str() <= peer_id {
            (self.local_id.as_str(), peer_id)
        } else {
            (peer_id, self.local_id.as_str())
        };
        let mut salt = Vec::with_capacity(first.len() + second.len() + 1);
        salt.extend_from_slice(first.as_bytes());
        salt.push(0);
        salt.extend_from_slice(second.as_bytes());

        let prk = hkdf::Salt::new(hkdf::HKDF_SHA256, &salt).extract(secret);
        let okm = prk
            .expand(&[KEY_INFO], &CHACHA20_POLY1305)
            .map_err(|_| Error::EncryptionFailure)?;
        let mut key = [0u8; 32];
        okm.fill(&mut key).map_err(|_| Error::EncryptionFailure)?;
        Ok(SessionKey(key))
    }

    fn encrypt(&self, key: &SessionKey, plaintext: &[u8]) -> Result<Vec<u8>> {
        let aead_key = Self::aead_key(key)?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| Error::EncryptionFailure)?;

        let mut in_out = plaintext.to_vec();
        aead_key
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::empty(),
                &mut in_out,
            )
            .map_err(|_| Error::EncryptionFailure)?;

        let mut out = Vec::with_capacity(NONCE_LEN + in_out.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&in_out);
        Ok(out)
    }

    fn decrypt(&self, key: &SessionKey, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < CRYPTO_OVERHEAD {
            return Err(Error::EncryptionFailure);
        }
        let aead_key = Self::aead_key(key)?;

        let (nonce_bytes, sealed) = ciphertext.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes).map_err(|_| Error::EncryptionFailure)?;

        let mut in_out = sealed.to_vec();
        let plaintext_len = aead_key
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| Error::EncryptionFailure)?
            .len();
        in_out.truncate(plaintext_len);
        Ok(in_out)
    }
}

/// A provider bound to one session key
#[derive(Clone)]
pub struct Cipher {
    provider: Rc<dyn CryptoProvider>,
    key: SessionKey,
}

impl Cipher {
    pub fn new(provider: Rc<dyn CryptoProvider>, key: SessionKey) -> Self {
        Self { provider, key }
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.provider.encrypt(&self.key, plaintext)
    }

    pub fn open(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.provider.decrypt(&self.key, ciphertext)
    }
}

impl fmt::Debug for Cipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cipher").field("key", &self.key).finish()
    }
}
