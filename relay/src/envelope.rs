//! Envelope codec for the encrypted replay path.
//!
//! An envelope is the unit exchanged over the durable queue: a fresh random
//! 12-byte nonce followed by the AES-GCM ciphertext and tag, as one contiguous
//! byte sequence. A successfully opened envelope is byte-identical to the
//! original plaintext; a tampered or truncated envelope fails to open.
//!
//! The wire format carries no key identifier and binds no associated data
//! (the queue name is not authenticated). Changing either would break
//! compatibility with deployed peers, so neither is done here.

use aes_gcm::{
    aead::{consts::U12, Aead},
    aes::Aes192,
    Aes128Gcm, Aes256Gcm, AesGcm, KeyInit, Nonce,
};
use rand::{rngs::OsRng, RngCore};
use thiserror::Error;

/// Length of the random nonce prefixed to every envelope.
pub const NONCE_LEN: usize = 12;

/// Errors from sealing or opening envelopes.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// The configured key is not a valid AES key length.
    #[error("invalid key length {0}: expected 16, 24, or 32 bytes")]
    InvalidKeyLength(usize),

    /// The system RNG could not produce a nonce. Not a transient condition;
    /// callers must treat this as fatal for the operation.
    #[error("failed to draw nonce from system RNG: {0}")]
    Rng(#[from] rand::Error),

    /// Sealing failed inside the cipher.
    #[error("failed to seal envelope")]
    Seal,

    /// The envelope failed authentication: wrong key, corruption, tampering,
    /// or an input shorter than the nonce. Callers cannot distinguish these
    /// cases; the message is poisoned either way.
    #[error("envelope failed authentication")]
    Authentication,
}

type Aes192Gcm = AesGcm<Aes192, U12>;

#[derive(Clone)]
enum Cipher {
    Aes128(Aes128Gcm),
    Aes192(Aes192Gcm),
    Aes256(Aes256Gcm),
}

/// A validated symmetric key, shared out-of-band between the sender and
/// receiver deployments. Immutable for the process lifetime.
#[derive(Clone)]
pub struct EnvelopeKey {
    cipher: Cipher,
}

impl std::fmt::Debug for EnvelopeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvelopeKey").finish_non_exhaustive()
    }
}

impl EnvelopeKey {
    /// Build a key from raw bytes. The length selects the cipher:
    /// 16 bytes for AES-128-GCM, 24 for AES-192-GCM, 32 for AES-256-GCM.
    pub fn from_bytes(key: &[u8]) -> Result<Self, EnvelopeError> {
        let invalid = || EnvelopeError::InvalidKeyLength(key.len());
        let cipher = match key.len() {
            16 => Cipher::Aes128(Aes128Gcm::new_from_slice(key).map_err(|_| invalid())?),
            24 => Cipher::Aes192(Aes192Gcm::new_from_slice(key).map_err(|_| invalid())?),
            32 => Cipher::Aes256(Aes256Gcm::new_from_slice(key).map_err(|_| invalid())?),
            other => return Err(EnvelopeError::InvalidKeyLength(other)),
        };
        Ok(Self { cipher })
    }

    /// Seal a plaintext into envelope wire form: `nonce || ciphertext+tag`.
    ///
    /// Each call draws a fresh nonce from the OS CSPRNG; nonce reuse under
    /// the same key breaks both confidentiality and authenticity.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.try_fill_bytes(&mut nonce)?;

        let sealed = match &self.cipher {
            Cipher::Aes128(c) => c.encrypt(Nonce::from_slice(&nonce), plaintext),
            Cipher::Aes192(c) => c.encrypt(Nonce::from_slice(&nonce), plaintext),
            Cipher::Aes256(c) => c.encrypt(Nonce::from_slice(&nonce), plaintext),
        }
        .map_err(|_| EnvelopeError::Seal)?;

        let mut envelope = Vec::with_capacity(NONCE_LEN + sealed.len());
        envelope.extend_from_slice(&nonce);
        envelope.extend_from_slice(&sealed);
        Ok(envelope)
    }

    /// Open an envelope, returning the original plaintext.
    pub fn open(&self, envelope: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
        if envelope.len() < NONCE_LEN {
            return Err(EnvelopeError::Authentication);
        }
        let (nonce, sealed) = envelope.split_at(NONCE_LEN);

        match &self.cipher {
            Cipher::Aes128(c) => c.decrypt(Nonce::from_slice(nonce), sealed),
            Cipher::Aes192(c) => c.decrypt(Nonce::from_slice(nonce), sealed),
            Cipher::Aes256(c) => c.decrypt(Nonce::from_slice(nonce), sealed),
        }
        .map_err(|_| EnvelopeError::Authentication)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    const KEY_128: &[u8] = b"0123456789abcdef";
    const KEY_192: &[u8] = b"0123456789abcdef01234567";
    const KEY_256: &[u8] = b"0123456789abcdef0123456789abcdef";

    #[test]
    fn test_round_trip_all_key_lengths() {
        let payload = b"payload=value&other=1";
        for key_bytes in [KEY_128, KEY_192, KEY_256] {
            let key = EnvelopeKey::from_bytes(key_bytes).unwrap();
            let envelope = key.seal(payload).unwrap();
            assert_eq!(key.open(&envelope).unwrap(), payload);
        }
    }

    #[test]
    fn test_invalid_key_lengths_rejected() {
        for len in [0usize, 1, 15, 17, 23, 25, 31, 33, 64] {
            let result = EnvelopeKey::from_bytes(&vec![0u8; len]);
            assert!(
                matches!(result, Err(EnvelopeError::InvalidKeyLength(l)) if l == len),
                "length {} should be rejected",
                len
            );
        }
    }

    #[test]
    fn test_hello_vector() {
        // AES-256 with an all-zero key: 12-byte nonce + 5-byte ciphertext
        // + 16-byte tag = 33 bytes on the wire.
        let key = EnvelopeKey::from_bytes(&[0u8; 32]).unwrap();
        let envelope = key.seal(b"hello").unwrap();
        assert_eq!(envelope.len(), 33);
        assert_eq!(key.open(&envelope).unwrap(), b"hello");

        let mut flipped = envelope.clone();
        *flipped.last_mut().unwrap() ^= 0x01;
        assert!(matches!(
            key.open(&flipped),
            Err(EnvelopeError::Authentication)
        ));
    }

    #[test]
    fn test_tampering_detected_everywhere() {
        let key = EnvelopeKey::from_bytes(KEY_256).unwrap();
        let envelope = key.seal(b"some webhook body").unwrap();

        // Flip one bit in the nonce, in the ciphertext, and in the tag.
        for index in [0, NONCE_LEN, NONCE_LEN + 3, envelope.len() - 1] {
            let mut tampered = envelope.clone();
            tampered[index] ^= 0x80;
            assert!(
                matches!(key.open(&tampered), Err(EnvelopeError::Authentication)),
                "bit flip at byte {} must fail authentication",
                index
            );
        }
    }

    #[test]
    fn test_truncated_input_never_panics() {
        let key = EnvelopeKey::from_bytes(KEY_256).unwrap();
        for len in 0..NONCE_LEN {
            assert!(matches!(
                key.open(&vec![0u8; len]),
                Err(EnvelopeError::Authentication)
            ));
        }
        // Exactly a nonce with nothing sealed behind it is also invalid:
        // the tag is missing.
        assert!(key.open(&[0u8; NONCE_LEN]).is_err());
    }

    #[test]
    fn test_wrong_key_fails() {
        let key = EnvelopeKey::from_bytes(KEY_256).unwrap();
        let other = EnvelopeKey::from_bytes(&[7u8; 32]).unwrap();
        let envelope = key.seal(b"secret").unwrap();
        assert!(matches!(
            other.open(&envelope),
            Err(EnvelopeError::Authentication)
        ));
    }

    #[test]
    fn test_empty_payload_round_trip() {
        let key = EnvelopeKey::from_bytes(KEY_128).unwrap();
        let envelope = key.seal(b"").unwrap();
        // nonce + tag only
        assert_eq!(envelope.len(), NONCE_LEN + 16);
        assert_eq!(key.open(&envelope).unwrap(), b"");
    }

    #[test]
    fn test_nonces_are_unique() {
        let key = EnvelopeKey::from_bytes(KEY_256).unwrap();
        let mut nonces = HashSet::new();
        for _ in 0..1024 {
            let envelope = key.seal(b"x").unwrap();
            nonces.insert(envelope[..NONCE_LEN].to_vec());
        }
        assert_eq!(nonces.len(), 1024);
    }
}
