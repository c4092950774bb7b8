//! Artifact encryption.
//!
//! Deposits are sealed with XChaCha20-Poly1305. The artifact path is bound
//! as associated data, so a ciphertext copied to another path fails to open.
//! The nonce is an HMAC-SHA256 of the path and plaintext under a subkey of
//! the deposit key: encryption is deterministic, and a retried reduce
//! rewrites byte-identical artifacts.
//!
//! Sealed layout: `MAGIC (4) | VERSION (1) | nonce (24) | ciphertext+tag`.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use chacha20poly1305::{Key, XChaCha20Poly1305};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

const MAGIC: [u8; 4] = *b"ESDP";
const VERSION: u8 = 1;
const NONCE_LEN: usize = 24;
const HEADER_LEN: usize = MAGIC.len() + 1 + NONCE_LEN;
const KEY_LEN: usize = 32;
const NONCE_KEY_LABEL: &[u8] = b"escrow-deposit-nonce-v1";

/// Encrypts and decrypts deposit artifacts.
pub trait Encryptor: Send + Sync + 'static {
    /// Seals `plaintext`, binding it to `context` (the artifact path).
    ///
    /// # Errors
    ///
    /// Returns `Error::Encryption` if sealing fails.
    fn encrypt(&self, context: &str, plaintext: &[u8]) -> Result<Bytes>;

    /// Opens a sealed artifact written for `context`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Encryption` if the data is malformed, was sealed for a
    /// different context, or was tampered with.
    fn decrypt(&self, context: &str, sealed: &[u8]) -> Result<Bytes>;
}

/// XChaCha20-Poly1305 encryptor with deterministic nonces.
pub struct XChaChaEncryptor {
    key: Zeroizing<[u8; KEY_LEN]>,
    nonce_key: Zeroizing<[u8; KEY_LEN]>,
}

impl fmt::Debug for XChaChaEncryptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XChaChaEncryptor").finish_non_exhaustive()
    }
}

fn encryption_err(message: impl Into<String>) -> Error {
    Error::Encryption {
        message: message.into(),
    }
}

impl XChaChaEncryptor {
    /// Creates an encryptor from a 32-byte key.
    ///
    /// # Errors
    ///
    /// Returns `Error::Encryption` if the nonce subkey cannot be derived.
    pub fn new(key: [u8; KEY_LEN]) -> Result<Self> {
        let key = Zeroizing::new(key);
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&key[..])
            .map_err(|e| encryption_err(format!("invalid key: {e}")))?;
        mac.update(NONCE_KEY_LABEL);
        let mut nonce_key = Zeroizing::new([0u8; KEY_LEN]);
        nonce_key.copy_from_slice(&mac.finalize().into_bytes());
        Ok(Self { key, nonce_key })
    }

    /// Creates an encryptor from a hex-encoded 32-byte key.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if the key is not 64 hex digits.
    pub fn from_hex(encoded: &str) -> Result<Self> {
        let decoded = Zeroizing::new(
            hex::decode(encoded.trim())
                .map_err(|e| Error::configuration(format!("deposit key is not hex: {e}")))?,
        );
        let key: [u8; KEY_LEN] = decoded.as_slice().try_into().map_err(|_| {
            Error::configuration(format!(
                "deposit key must be {KEY_LEN} bytes, got {}",
                decoded.len()
            ))
        })?;
        Self::new(key)
    }

    fn nonce(&self, context: &str, plaintext: &[u8]) -> Result<[u8; NONCE_LEN]> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.nonce_key[..])
            .map_err(|e| encryption_err(format!("invalid nonce key: {e}")))?;
        mac.update(context.as_bytes());
        mac.update(&[0]);
        mac.update(plaintext);
        let digest = mac.finalize().into_bytes();
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&digest[..NONCE_LEN]);
        Ok(nonce)
    }

    fn cipher(&self) -> XChaCha20Poly1305 {
        XChaCha20Poly1305::new(Key::from_slice(&self.key[..]))
    }
}

impl Encryptor for XChaChaEncryptor {
    fn encrypt(&self, context: &str, plaintext: &[u8]) -> Result<Bytes> {
        let nonce = self.nonce(context, plaintext)?;
        let ciphertext = self
            .cipher()
            .encrypt(
                &nonce.into(),
                Payload {
                    msg: plaintext,
                    aad: context.as_bytes(),
                },
            )
            .map_err(|e| encryption_err(format!("encryption failed: {e}")))?;

        let mut out = BytesMut::with_capacity(HEADER_LEN + ciphertext.len());
        out.put_slice(&MAGIC);
        out.put_u8(VERSION);
        out.put_slice(&nonce);
        out.put_slice(&ciphertext);
        Ok(out.freeze())
    }

    fn decrypt(&self, context: &str, sealed: &[u8]) -> Result<Bytes> {
        if sealed.len() < HEADER_LEN {
            return Err(encryption_err("sealed artifact too short"));
        }
        if sealed[..MAGIC.len()] != MAGIC {
            return Err(encryption_err("invalid magic bytes"));
        }
        let version = sealed[MAGIC.len()];
        if version != VERSION {
            return Err(encryption_err(format!("unsupported version {version}")));
        }
        let nonce: [u8; NONCE_LEN] = sealed[MAGIC.len() + 1..HEADER_LEN]
            .try_into()
            .map_err(|_| encryption_err("invalid nonce bytes"))?;

        let plaintext = self
            .cipher()
            .decrypt(
                &nonce.into(),
                Payload {
                    msg: &sealed[HEADER_LEN..],
                    aad: context.as_bytes(),
                },
            )
            .map_err(|e| encryption_err(format!("decryption failed: {e}")))?;
        Ok(Bytes::from(plaintext))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_HEX: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    #[test]
    fn sealing_is_deterministic_per_context() {
        let enc = XChaChaEncryptor::from_hex(KEY_HEX).unwrap();
        let a = enc.encrypt("rde/a.deposit.ghostryde", b"payload").unwrap();
        let b = enc.encrypt("rde/a.deposit.ghostryde", b"payload").unwrap();
        let c = enc.encrypt("rde/b.deposit.ghostryde", b"payload").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(&a[..4], b"ESDP");
    }

    #[test]
    fn opens_only_under_the_sealing_context() {
        let enc = XChaChaEncryptor::from_hex(KEY_HEX).unwrap();
        let sealed = enc.encrypt("rde/a.report.ghostryde", b"report").unwrap();
        assert_eq!(
            enc.decrypt("rde/a.report.ghostryde", &sealed).unwrap(),
            Bytes::from_static(b"report")
        );
        assert!(enc.decrypt("rde/b.report.ghostryde", &sealed).is_err());

        let mut tampered = sealed.to_vec();
        let last = tampered.len() - 1;
        tampered[last] ^= 1;
        assert!(enc.decrypt("rde/a.report.ghostryde", &tampered).is_err());
    }

    #[test]
    fn rejects_bad_keys() {
        assert!(matches!(
            XChaChaEncryptor::from_hex("abcd"),
            Err(Error::Configuration { .. })
        ));
        assert!(XChaChaEncryptor::from_hex("zz").is_err());
        let other = XChaChaEncryptor::new([7u8; 32]).unwrap();
        let sealed = XChaChaEncryptor::from_hex(KEY_HEX)
            .unwrap()
            .encrypt("p", b"x")
            .unwrap();
        assert!(other.decrypt("p", &sealed).is_err());
    }
}
