//! Authenticated encryption.
//!
//! Message traffic uses AES-256-GCM with a KDF-supplied nonce and a
//! detached 16-byte tag (the envelope codec frames ciphertext and tag as
//! separate fields). Keystore state at rest uses XChaCha20-Poly1305 with a
//! random 24-byte nonce prepended, since the vault has no per-record nonce
//! schedule.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use chacha20poly1305::XChaCha20Poly1305;
use zeroize::Zeroizing;

use crate::error::CryptoError;

pub const TAG_LEN: usize = 16;

/// AES-256-GCM encrypt with detached tag. Returns (ciphertext, tag).
pub fn encrypt_detached(
    key: &[u8; 32],
    nonce: &[u8; 12],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<(Vec<u8>, [u8; TAG_LEN]), CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::AeadAuth)?;
    let mut combined = cipher
        .encrypt(Nonce::from_slice(nonce), Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::AeadAuth)?;
    let split = combined.len() - TAG_LEN;
    let mut tag = [0u8; TAG_LEN];
    tag.copy_from_slice(&combined[split..]);
    combined.truncate(split);
    Ok((combined, tag))
}

/// AES-256-GCM decrypt with detached tag. Fails with `AeadAuth` on mismatch.
pub fn decrypt_detached(
    key: &[u8; 32],
    nonce: &[u8; 12],
    aad: &[u8],
    ciphertext: &[u8],
    tag: &[u8; TAG_LEN],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::AeadAuth)?;
    let mut combined = Vec::with_capacity(ciphertext.len() + TAG_LEN);
    combined.extend_from_slice(ciphertext);
    combined.extend_from_slice(tag);
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce), Payload { msg: &combined, aad })
        .map_err(|_| CryptoError::AeadAuth)?;
    Ok(Zeroizing::new(plaintext))
}

/// Vault encryption: XChaCha20-Poly1305, random nonce prepended.
pub fn vault_encrypt(key: &[u8; 32], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    use chacha20poly1305::aead::{AeadCore, OsRng};
    let cipher = XChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::AeadAuth)?;
    let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::AeadAuth)?;
    let mut out = Vec::with_capacity(24 + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Vault decryption of (nonce || ciphertext+tag).
pub fn vault_decrypt(
    key: &[u8; 32],
    data: &[u8],
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if data.len() < 24 {
        return Err(CryptoError::AeadAuth);
    }
    let (nonce_bytes, ct) = data.split_at(24);
    let cipher = XChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::AeadAuth)?;
    let plaintext = cipher
        .decrypt(chacha20poly1305::XNonce::from_slice(nonce_bytes), Payload { msg: ct, aad })
        .map_err(|_| CryptoError::AeadAuth)?;
    Ok(Zeroizing::new(plaintext))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detached_roundtrip() {
        let key = [3u8; 32];
        let nonce = [4u8; 12];
        let (ct, tag) = encrypt_detached(&key, &nonce, b"aad", b"hello").unwrap();
        let pt = decrypt_detached(&key, &nonce, b"aad", &ct, &tag).unwrap();
        assert_eq!(&pt[..], b"hello");
    }

    #[test]
    fn detached_rejects_tampered_tag() {
        let key = [3u8; 32];
        let nonce = [4u8; 12];
        let (ct, mut tag) = encrypt_detached(&key, &nonce, b"aad", b"hello").unwrap();
        tag[0] ^= 1;
        assert!(matches!(
            decrypt_detached(&key, &nonce, b"aad", &ct, &tag),
            Err(CryptoError::AeadAuth)
        ));
    }

    #[test]
    fn detached_rejects_wrong_aad() {
        let key = [3u8; 32];
        let nonce = [4u8; 12];
        let (ct, tag) = encrypt_detached(&key, &nonce, b"aad", b"hello").unwrap();
        assert!(decrypt_detached(&key, &nonce, b"other", &ct, &tag).is_err());
    }

    #[test]
    fn vault_roundtrip() {
        let key = [9u8; 32];
        let ct = vault_encrypt(&key, b"session state", b"efsec-store").unwrap();
        let pt = vault_decrypt(&key, &ct, b"efsec-store").unwrap();
        assert_eq!(&pt[..], b"session state");
    }
}
