//! The sealed-token codec used for clearance cookies and CAPTCHA context:
//! JSON, AES-256-GCM with a 12-byte random nonce prepended, base64.
//!
//! The key is process-global: resolved once at startup from
//! `waf.encryption_key`, or freshly generated when unconfigured.

use crate::prelude::*;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use serde::de::DeserializeOwned;
use serde::Serialize;

const KEY_LEN: usize = 32;

/// An error from sealing or opening a token.
#[derive(Debug)]
pub enum Error {
    /// The token was not valid base64.
    Base64(base64::DecodeError),
    /// The token was shorter than a nonce and a tag.
    TooShort,
    /// Authentication failed: wrong key or tampered token.
    Crypto,
    /// The decrypted payload was not the expected JSON.
    Json(serde_json::Error),
}
impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Base64(err) => write!(f, "token is not valid base64: {err}"),
            Self::TooShort => f.write_str("token is too short"),
            Self::Crypto => f.write_str("token failed authentication"),
            Self::Json(err) => write!(f, "token payload is not valid JSON: {err}"),
        }
    }
}
impl std::error::Error for Error {}

/// The process-global sealing key.
pub struct Key {
    key: LessSafeKey,
    rng: SystemRandom,
}
impl Key {
    /// Resolves the key from configuration. A configured value is used
    /// raw when it is exactly 32 bytes and digested with SHA-256
    /// otherwise; no configuration yields a random key, which makes
    /// sealed tokens valid for the lifetime of the process only.
    #[must_use]
    pub fn resolve(configured: Option<&str>) -> Self {
        let rng = SystemRandom::new();
        let bytes: [u8; KEY_LEN] = match configured.filter(|key| !key.is_empty()) {
            Some(configured) if configured.len() == KEY_LEN => {
                // unwrap is ok; the length was just checked
                configured.as_bytes().try_into().unwrap()
            }
            Some(configured) => {
                let digest = ring::digest::digest(&ring::digest::SHA256, configured.as_bytes());
                // unwrap is ok; a SHA-256 digest is 32 bytes
                digest.as_ref().try_into().unwrap()
            }
            None => {
                let mut bytes = [0; KEY_LEN];
                // fill only fails when the system RNG is broken
                rng.fill(&mut bytes)
                    .expect("system random generator failed");
                info!("No waf.encryption_key configured; generated an ephemeral key");
                bytes
            }
        };
        // unwrap is ok; the key is exactly AES_256_GCM.key_len() bytes
        let key = LessSafeKey::new(UnboundKey::new(&AES_256_GCM, &bytes).unwrap());
        Self { key, rng }
    }

    /// Seals `plaintext`: AES-256-GCM under a fresh 12-byte nonce, the
    /// nonce prepended, the whole base64 encoded.
    ///
    /// # Errors
    ///
    /// Fails only when the system random generator does.
    pub fn seal(&self, plaintext: &[u8]) -> Result<String, Error> {
        let mut nonce = [0; NONCE_LEN];
        self.rng.fill(&mut nonce).map_err(|_| Error::Crypto)?;

        let mut sealed = plaintext.to_vec();
        self.key
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce),
                Aad::empty(),
                &mut sealed,
            )
            .map_err(|_| Error::Crypto)?;

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(BASE64.encode(out))
    }

    /// The inverse of [`Key::seal`].
    ///
    /// # Errors
    ///
    /// See [`Error`]; any mismatch in key, nonce, or ciphertext fails.
    pub fn open(&self, token: &str) -> Result<Vec<u8>, Error> {
        if token.is_empty() {
            return Err(Error::TooShort);
        }
        let raw = BASE64.decode(token).map_err(Error::Base64)?;
        if raw.len() < NONCE_LEN + AES_256_GCM.tag_len() {
            return Err(Error::TooShort);
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        // unwrap is ok; the slice is exactly NONCE_LEN bytes
        let nonce = Nonce::assume_unique_for_key(nonce.try_into().unwrap());

        let mut ciphertext = ciphertext.to_vec();
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut ciphertext)
            .map_err(|_| Error::Crypto)?;
        Ok(plaintext.to_vec())
    }

    /// Seals `payload` serialised as JSON.
    pub fn seal_json<T: Serialize>(&self, payload: &T) -> Result<String, Error> {
        let json = serde_json::to_vec(payload).map_err(Error::Json)?;
        self.seal(&json)
    }

    /// Opens a token and deserialises its JSON payload.
    pub fn open_json<T: DeserializeOwned>(&self, token: &str) -> Result<T, Error> {
        let plaintext = self.open(token)?;
        serde_json::from_slice(&plaintext).map_err(Error::Json)
    }
}
impl Debug for Key {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("Key([sealed])")
    }
}
