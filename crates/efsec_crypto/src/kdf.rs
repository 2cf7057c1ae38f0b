//! Key derivation.
//!
//! All symmetric schedule steps live here so the derivation constants are
//! in one place:
//!
//!   X3DH      SK        = HKDF(salt=0x00*32, ikm=0xFF*32 || DH1..DH4, "efsec-x3dh", 32)
//!   DH step   (RK', CK) = HKDF(salt=RK, ikm=dh_out, "efsec-rk", 64)
//!   chain     MK  = HMAC(CK, 0x01);  CK' = HMAC(CK, 0x02)
//!   message   key material = HKDF(MK, "", "efsec-mk", 80)
//!   megolm    key material = HKDF(CK_i, "", "efsec-megolm-mk", 80)
//!             CK_{i+1} = HMAC(CK_i, 0x01)
//!
//! The 80-byte message-key block is split as AES-256 key (32) + GCM nonce
//! (12); the remainder is reserved.
//!
//! `vault_key_from_password` (Argon2id) derives the 32-byte key that
//! encrypts keystore state at rest.

use argon2::{Argon2, Params, Version};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

type HmacSha256 = Hmac<Sha256>;

pub const X3DH_INFO: &[u8] = b"efsec-x3dh";
pub const ROOT_INFO: &[u8] = b"efsec-rk";
pub const MESSAGE_INFO: &[u8] = b"efsec-mk";
pub const MEGOLM_MESSAGE_INFO: &[u8] = b"efsec-megolm-mk";

/// Expand `ikm` + `info` into `output.len()` bytes of key material.
pub fn hkdf_expand(
    ikm: &[u8],
    salt: Option<&[u8]>,
    info: &[u8],
    output: &mut [u8],
) -> Result<(), CryptoError> {
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    hk.expand(info, output)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))
}

pub fn hmac_sha256(key: &[u8], msg: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(msg);
    mac.finalize().into_bytes().into()
}

/// Derive the X3DH shared secret from the concatenated DH outputs.
///
/// `dh_concat` is DH1 || DH2 || DH3 [|| DH4]; the caller zeroizes it.
pub fn x3dh_secret(dh_concat: &[u8]) -> Result<[u8; 32], CryptoError> {
    let mut ikm = vec![0xFFu8; 32]; // domain separation pad
    ikm.extend_from_slice(dh_concat);
    let mut sk = [0u8; 32];
    hkdf_expand(&ikm, Some(&[0u8; 32]), X3DH_INFO, &mut sk)?;
    ikm.zeroize();
    Ok(sk)
}

/// KDF_RK: mix a DH output into the root key.
/// Returns (new_root_key, new_chain_key).
pub fn root_step(rk: &[u8; 32], dh_out: &[u8]) -> Result<([u8; 32], [u8; 32]), CryptoError> {
    let mut okm = [0u8; 64];
    hkdf_expand(dh_out, Some(rk), ROOT_INFO, &mut okm)?;
    let mut new_rk = [0u8; 32];
    let mut ck = [0u8; 32];
    new_rk.copy_from_slice(&okm[..32]);
    ck.copy_from_slice(&okm[32..]);
    okm.zeroize();
    Ok((new_rk, ck))
}

/// KDF_CK: chain key -> (message_key, next_chain_key).
pub fn chain_step(ck: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    let mk = hmac_sha256(ck, &[0x01]);
    let next_ck = hmac_sha256(ck, &[0x02]);
    (mk, next_ck)
}

/// Per-message AEAD material derived from a message key. Zeroized on drop.
#[derive(ZeroizeOnDrop)]
pub struct MessageKeyMaterial {
    pub key: [u8; 32],
    pub nonce: [u8; 12],
}

impl MessageKeyMaterial {
    fn from_block(block: &[u8; 80]) -> Self {
        let mut key = [0u8; 32];
        let mut nonce = [0u8; 12];
        key.copy_from_slice(&block[..32]);
        nonce.copy_from_slice(&block[32..44]);
        Self { key, nonce }
    }
}

/// Expand a pairwise message key into AEAD material.
pub fn message_key_material(mk: &[u8; 32]) -> Result<MessageKeyMaterial, CryptoError> {
    let mut block = [0u8; 80];
    hkdf_expand(mk, None, MESSAGE_INFO, &mut block)?;
    let out = MessageKeyMaterial::from_block(&block);
    block.zeroize();
    Ok(out)
}

/// Expand a Megolm chain key at index `i` into AEAD material.
pub fn megolm_key_material(ck: &[u8; 32]) -> Result<MessageKeyMaterial, CryptoError> {
    let mut block = [0u8; 80];
    hkdf_expand(ck, None, MEGOLM_MESSAGE_INFO, &mut block)?;
    let out = MessageKeyMaterial::from_block(&block);
    block.zeroize();
    Ok(out)
}

/// Advance a Megolm chain one step.
pub fn megolm_advance(ck: &[u8; 32]) -> [u8; 32] {
    hmac_sha256(ck, &[0x01])
}

// ── Vault key (Argon2id) ─────────────────────────────────────────────────────

/// 32-byte vault key derived from a user passphrase. Zeroized on drop.
#[derive(ZeroizeOnDrop)]
pub struct VaultKey(pub [u8; 32]);

/// Argon2id parameters, tuned for interactive use.
fn argon2_params() -> Params {
    Params::new(
        64 * 1024, // m_cost: 64 MiB
        3,         // t_cost
        1,         // p_cost
        Some(32),
    )
    .expect("static Argon2 params are valid")
}

/// Derive a vault key from a passphrase + 16-byte salt.
/// The salt is stored alongside the keystore (not secret).
pub fn vault_key_from_password(password: &[u8], salt: &[u8; 16]) -> Result<VaultKey, CryptoError> {
    let argon2 = Argon2::new(argon2::Algorithm::Argon2id, Version::V0x13, argon2_params());
    let mut output = [0u8; 32];
    argon2
        .hash_password_into(password, salt, &mut output)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(VaultKey(output))
}

/// Fresh random 16-byte salt (generate once per keystore; persist it).
pub fn generate_salt() -> [u8; 16] {
    use rand::RngCore;
    let mut salt = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}
