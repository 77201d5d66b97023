//! Device identity keys and session-bound key derivation.
//!
//! # Derivation
//!
//! ```text
//! pairwise = X25519(host_secret, participant_public)
//! session_key = HKDF-SHA256(salt = session_id, ikm = pairwise, info = SESSION_KEY_INFO)
//! ```
//!
//! X25519 is symmetric, so a participant holding the host's public key
//! derives the same key. Salting with the session id means the same pair
//! of devices gets an unrelated key in every session. The pairwise secret
//! never leaves [`DeviceKeyPair::derive_session_key`] and is wiped on drop.
//!
//! Messages are sealed with AES-256-GCM under a fresh random 96-bit nonce.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::SessionError;

/// Nonce size for AES-GCM (96 bits = 12 bytes).
pub const NONCE_SIZE: usize = 12;

/// HKDF info string binding derived keys to this protocol.
const SESSION_KEY_INFO: &[u8] = b"botster-remote/session-key/v1";

/// Symmetric key shared by the host and one participant for one session.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; 32]);

impl SessionKey {
    /// Wrap raw key bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// True once the key has been wiped.
    pub fn is_zeroed(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Encrypt `plaintext` under a fresh random nonce.
    ///
    /// Returns `(ciphertext, nonce)`.
    pub fn seal(&self, plaintext: &[u8]) -> Result<(Vec<u8>, [u8; NONCE_SIZE]), SessionError> {
        let cipher = Aes256Gcm::new(&self.0.into());

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| SessionError::Crypto(format!("encryption failed: {e}")))?;
        Ok((ciphertext, nonce_bytes))
    }

    /// Decrypt a payload produced by [`seal`](Self::seal).
    pub fn open(
        &self,
        nonce: &[u8; NONCE_SIZE],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, SessionError> {
        let cipher = Aes256Gcm::new(&self.0.into());
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| SessionError::Crypto(format!("decryption failed: {e}")))
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey([REDACTED])")
    }
}

/// A device's X25519 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DevicePublicKey([u8; 32]);

impl DevicePublicKey {
    /// Wrap raw public key bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw public key bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Standard base64 encoding, as exchanged during pairing.
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    /// Parse the base64 form produced by [`to_base64`](Self::to_base64).
    pub fn from_base64(encoded: &str) -> Result<Self, SessionError> {
        let bytes = BASE64
            .decode(encoded.trim())
            .map_err(|e| SessionError::InvalidPublicKey(format!("bad base64: {e}")))?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|v: Vec<u8>| {
            SessionError::InvalidPublicKey(format!("expected 32 bytes, got {}", v.len()))
        })?;
        Ok(Self(bytes))
    }
}

impl std::fmt::Debug for DevicePublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let encoded = self.to_base64();
        write!(f, "DevicePublicKey({}...)", &encoded[..8])
    }
}

/// A device's long-term X25519 identity.
pub struct DeviceKeyPair {
    secret: x25519_dalek::StaticSecret,
    public: DevicePublicKey,
}

impl DeviceKeyPair {
    /// Generate a fresh random identity.
    pub fn generate() -> Self {
        let mut secret_bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut secret_bytes);
        let pair = Self::from_secret_bytes(secret_bytes);
        secret_bytes.zeroize();
        pair
    }

    /// Rebuild an identity from stored secret bytes.
    pub fn from_secret_bytes(secret_bytes: [u8; 32]) -> Self {
        let secret = x25519_dalek::StaticSecret::from(secret_bytes);
        let public = DevicePublicKey(x25519_dalek::PublicKey::from(&secret).to_bytes());
        Self { secret, public }
    }

    /// This device's public key.
    pub fn public_key(&self) -> DevicePublicKey {
        self.public
    }

    /// Derive the key shared with `peer` for `session_id`.
    ///
    /// # Errors
    ///
    /// [`SessionError::InvalidPublicKey`] if `peer` is a low-order point
    /// (the exchange would produce an all-zero secret).
    pub fn derive_session_key(
        &self,
        peer: &DevicePublicKey,
        session_id: &str,
    ) -> Result<SessionKey, SessionError> {
        let peer = x25519_dalek::PublicKey::from(peer.0);
        let pairwise = self.secret.diffie_hellman(&peer);
        if !pairwise.was_contributory() {
            return Err(SessionError::InvalidPublicKey(
                "non-contributory key exchange".to_string(),
            ));
        }

        let hk = Hkdf::<Sha256>::new(Some(session_id.as_bytes()), pairwise.as_bytes());
        drop(pairwise);

        let mut okm = [0u8; 32];
        hk.expand(SESSION_KEY_INFO, &mut okm)
            .map_err(|e| SessionError::Crypto(format!("key derivation failed: {e}")))?;
        let key = SessionKey(okm);
        okm.zeroize();
        Ok(key)
    }
}

impl std::fmt::Debug for DeviceKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceKeyPair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}
