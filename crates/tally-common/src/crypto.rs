//! Hybrid payload encryption for request bodies.
//!
//! A fresh AES-256-GCM key seals the body and is itself wrapped with the
//! collector's RSA public key (PKCS#1 v1.5). Envelope layout:
//!
//! ```text
//! u16 BE wrapped-key length | wrapped key | 12-byte nonce | ciphertext + tag
//! ```

use crate::error::CryptoError;
use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use std::path::Path;

/// Header marking an encrypted body.
pub const ENCRYPTION_HEADER: &str = "x-encrypted";
/// Value of [`ENCRYPTION_HEADER`] for this envelope format.
pub const ENCRYPTION_SCHEME: &str = "rsa-aes256gcm";

const AES_KEY_LEN: usize = 32;

fn read_pem(path: &Path) -> Result<String, CryptoError> {
    std::fs::read_to_string(path).map_err(|source| CryptoError::KeyFile {
        path: path.display().to_string(),
        source,
    })
}

fn sealing_key(key_bytes: &[u8]) -> Result<LessSafeKey, CryptoError> {
    let unbound = UnboundKey::new(&AES_256_GCM, key_bytes).map_err(|_| CryptoError::Aead)?;
    Ok(LessSafeKey::new(unbound))
}

/// Generates an RSA key pair, returned as `(public SPKI PEM, private PKCS#8 PEM)`.
pub fn generate_key_pair(bits: usize) -> Result<(String, String), CryptoError> {
    let private_key = RsaPrivateKey::new(&mut rand::rngs::OsRng, bits)?;
    let public_pem = RsaPublicKey::from(&private_key)
        .to_public_key_pem(LineEnding::LF)
        .map_err(|_| CryptoError::KeyFormat)?;
    let private_pem = private_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|_| CryptoError::KeyFormat)?;
    Ok((public_pem, private_pem.to_string()))
}

/// Agent side: encrypts bodies for the holder of the private key.
#[derive(Clone)]
pub struct Encryptor {
    public_key: RsaPublicKey,
}

impl Encryptor {
    /// Accepts SPKI (`BEGIN PUBLIC KEY`) or PKCS#1 (`BEGIN RSA PUBLIC KEY`).
    pub fn from_pem(pem: &str) -> Result<Self, CryptoError> {
        let public_key = RsaPublicKey::from_public_key_pem(pem)
            .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
            .map_err(|_| CryptoError::KeyFormat)?;
        Ok(Self { public_key })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, CryptoError> {
        Self::from_pem(&read_pem(path.as_ref())?)
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let rng = SystemRandom::new();
        let mut key_bytes = [0u8; AES_KEY_LEN];
        rng.fill(&mut key_bytes).map_err(|_| CryptoError::Random)?;
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rng.fill(&mut nonce_bytes).map_err(|_| CryptoError::Random)?;

        let mut in_out = plaintext.to_vec();
        sealing_key(&key_bytes)?
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::empty(),
                &mut in_out,
            )
            .map_err(|_| CryptoError::Aead)?;

        let wrapped = self
            .public_key
            .encrypt(&mut rand::rngs::OsRng, Pkcs1v15Encrypt, &key_bytes)?;
        let wrapped_len = u16::try_from(wrapped.len()).map_err(|_| CryptoError::Envelope)?;

        let mut envelope = Vec::with_capacity(2 + wrapped.len() + NONCE_LEN + in_out.len());
        envelope.extend_from_slice(&wrapped_len.to_be_bytes());
        envelope.extend_from_slice(&wrapped);
        envelope.extend_from_slice(&nonce_bytes);
        envelope.extend_from_slice(&in_out);
        Ok(envelope)
    }
}

/// Server side: opens envelopes produced by [`Encryptor`].
#[derive(Clone)]
pub struct Decryptor {
    private_key: RsaPrivateKey,
}

impl Decryptor {
    /// Accepts PKCS#8 (`BEGIN PRIVATE KEY`) or PKCS#1 (`BEGIN RSA PRIVATE KEY`).
    pub fn from_pem(pem: &str) -> Result<Self, CryptoError> {
        let private_key = RsaPrivateKey::from_pkcs8_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
            .map_err(|_| CryptoError::KeyFormat)?;
        Ok(Self { private_key })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, CryptoError> {
        Self::from_pem(&read_pem(path.as_ref())?)
    }

    pub fn decrypt(&self, envelope: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let (len_bytes, rest) = envelope.split_at_checked(2).ok_or(CryptoError::Envelope)?;
        let wrapped_len = usize::from(u16::from_be_bytes([len_bytes[0], len_bytes[1]]));
        let (wrapped, rest) = rest.split_at_checked(wrapped_len).ok_or(CryptoError::Envelope)?;
        let (nonce_bytes, ciphertext) =
            rest.split_at_checked(NONCE_LEN).ok_or(CryptoError::Envelope)?;
        if ciphertext.len() < aead::AES_256_GCM.tag_len() {
            return Err(CryptoError::Envelope);
        }

        let key_bytes = self.private_key.decrypt(Pkcs1v15Encrypt, wrapped)?;
        if key_bytes.len() != AES_KEY_LEN {
            return Err(CryptoError::Envelope);
        }
        let nonce =
            Nonce::try_assume_unique_for_key(nonce_bytes).map_err(|_| CryptoError::Envelope)?;

        let mut in_out = ciphertext.to_vec();
        let plaintext = sealing_key(&key_bytes)?
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| CryptoError::Aead)?;
        Ok(plaintext.to_vec())
    }
}
