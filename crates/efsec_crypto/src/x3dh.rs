//! X3DH asynchronous key agreement.
//!
//! References:
//!   - Signal X3DH spec: <https://signal.org/docs/specifications/x3dh/>
//!   - RFC 7748 (X25519), RFC 5869 (HKDF)
//!
//! Alice fetches Bob's published bundle:
//!   IK_B  (identity, Ed25519, converted to X25519 for DH)
//!   SPK_B (signed prekey, X25519) + IK_B signature over SPK_B
//!   OPK_B (optional one-time prekey, X25519)
//!
//! Alice generates one ephemeral keypair EK_A and computes
//!   DH1 = DH(IK_A, SPK_B)
//!   DH2 = DH(EK_A, IK_B)
//!   DH3 = DH(EK_A, SPK_B)
//!   DH4 = DH(EK_A, OPK_B)   [if the bundle carried one]
//!
//!   SK = HKDF(salt=0x00*32, ikm=0xFF*32 || DH1 || DH2 || DH3 [|| DH4],
//!             info="efsec-x3dh", L=32)
//!
//! Alice MUST verify the SPK signature before computing any DH. Bob
//! reconstructs the same DH set from the prekey header on the first
//! envelope; if the referenced one-time secret is already consumed the
//! init fails with `UnknownPreKey` rather than silently re-deriving
//! without it.

use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroize;

use crate::error::CryptoError;
use crate::identity::{ed25519_pub_to_x25519, IdentityKeyPair};
use crate::kdf;

/// A peer's published bundle, as consumed by the initiator.
/// `identity_pub` is the Ed25519 key; DH conversions happen here.
#[derive(Debug, Clone)]
pub struct PeerBundle {
    pub identity_pub: [u8; 32],
    pub signed_prekey_id: u32,
    pub signed_prekey_pub: [u8; 32],
    pub signed_prekey_sig: [u8; 64],
    pub one_time: Option<(u32, [u8; 32])>,
}

/// Initiator output: the shared secret plus the material the responder
/// needs to mirror it (carried in the prekey header of the first message).
pub struct Initiation {
    pub shared_key: [u8; 32],
    pub ephemeral_pub: [u8; 32],
    pub signed_prekey_id: u32,
    pub one_time_prekey_id: Option<u32>,
}

/// The prekey prefix an initiator keeps attaching to outgoing messages
/// until the first DH ratchet proves the responder holds the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingPreKey {
    pub identity_pub: [u8; 32],
    pub ephemeral_pub: [u8; 32],
    pub signed_prekey_id: u32,
    pub one_time_prekey_id: Option<u32>,
}

impl Initiation {
    pub fn pending_prekey(&self, my_identity_pub: [u8; 32]) -> PendingPreKey {
        PendingPreKey {
            identity_pub: my_identity_pub,
            ephemeral_pub: self.ephemeral_pub,
            signed_prekey_id: self.signed_prekey_id,
            one_time_prekey_id: self.one_time_prekey_id,
        }
    }
}

/// Alice initiates: verify SPK signature, run the DH set, derive SK.
pub fn initiate(my_ik: &IdentityKeyPair, bundle: &PeerBundle) -> Result<Initiation, CryptoError> {
    // Signature check comes first; a forged SPK must not reach any DH.
    IdentityKeyPair::verify(
        &bundle.identity_pub,
        &bundle.signed_prekey_pub,
        &bundle.signed_prekey_sig,
    )?;

    let ik_b_x = ed25519_pub_to_x25519(&bundle.identity_pub)?;
    let spk_b = X25519Public::from(bundle.signed_prekey_pub);

    let ek_a = StaticSecret::random_from_rng(OsRng);
    let ek_a_pub = X25519Public::from(&ek_a);

    let dh1 = my_ik.dh_secret().diffie_hellman(&spk_b);
    let dh2 = ek_a.diffie_hellman(&ik_b_x);
    let dh3 = ek_a.diffie_hellman(&spk_b);

    let mut concat = Vec::with_capacity(128);
    concat.extend_from_slice(dh1.as_bytes());
    concat.extend_from_slice(dh2.as_bytes());
    concat.extend_from_slice(dh3.as_bytes());

    let mut one_time_prekey_id = None;
    if let Some((opk_id, opk_pub)) = bundle.one_time {
        let dh4 = ek_a.diffie_hellman(&X25519Public::from(opk_pub));
        concat.extend_from_slice(dh4.as_bytes());
        one_time_prekey_id = Some(opk_id);
    }

    let shared_key = kdf::x3dh_secret(&concat)?;
    concat.zeroize();

    Ok(Initiation {
        shared_key,
        ephemeral_pub: *ek_a_pub.as_bytes(),
        signed_prekey_id: bundle.signed_prekey_id,
        one_time_prekey_id,
    })
}

/// Bob responds: mirror the DH set from the prekey header.
///
/// `my_spk_secret` must match the signed prekey id in the header;
/// `my_opk_secret` is the consumed one-time secret when the header
/// references one.
pub fn respond(
    my_ik: &IdentityKeyPair,
    my_spk_secret: &StaticSecret,
    my_opk_secret: Option<&StaticSecret>,
    sender_identity_pub: &[u8; 32],
    sender_ephemeral_pub: &[u8; 32],
) -> Result<[u8; 32], CryptoError> {
    let sender_ik_x = ed25519_pub_to_x25519(sender_identity_pub)?;
    let ek_a = X25519Public::from(*sender_ephemeral_pub);

    let dh1 = my_spk_secret.diffie_hellman(&sender_ik_x);
    let dh2 = my_ik.dh_secret().diffie_hellman(&ek_a);
    let dh3 = my_spk_secret.diffie_hellman(&ek_a);

    let mut concat = Vec::with_capacity(128);
    concat.extend_from_slice(dh1.as_bytes());
    concat.extend_from_slice(dh2.as_bytes());
    concat.extend_from_slice(dh3.as_bytes());

    if let Some(opk) = my_opk_secret {
        let dh4 = opk.diffie_hellman(&ek_a);
        concat.extend_from_slice(dh4.as_bytes());
    }

    let shared_key = kdf::x3dh_secret(&concat)?;
    concat.zeroize();
    Ok(shared_key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::Account;

    fn bundle_for(account: &mut Account, with_otk: bool) -> (PeerBundle, Option<u32>) {
        let published = account.publish_bundle();
        let one_time = if with_otk {
            published.one_time.first().copied()
        } else {
            None
        };
        let otk_id = one_time.map(|(id, _)| id);
        (
            PeerBundle {
                identity_pub: published.identity_pub,
                signed_prekey_id: published.signed_prekey.key_id,
                signed_prekey_pub: published.signed_prekey.public,
                signed_prekey_sig: published.signed_prekey.signature,
                one_time,
            },
            otk_id,
        )
    }

    #[test]
    fn roundtrip_without_one_time_key() {
        let alice_ik = IdentityKeyPair::generate();
        let mut bob = Account::new();
        let (bundle, _) = bundle_for(&mut bob, false);

        let init = initiate(&alice_ik, &bundle).unwrap();
        assert!(init.one_time_prekey_id.is_none());

        let bob_ik = bob.identity();
        let spk = bob.signed_prekey_secret(bundle.signed_prekey_id).unwrap();
        let sk = respond(&bob_ik, &spk, None, &alice_ik.public.0, &init.ephemeral_pub).unwrap();
        assert_eq!(init.shared_key, sk);
    }

    #[test]
    fn roundtrip_with_one_time_key() {
        let alice_ik = IdentityKeyPair::generate();
        let mut bob = Account::new();
        let (bundle, otk_id) = bundle_for(&mut bob, true);

        let init = initiate(&alice_ik, &bundle).unwrap();
        assert_eq!(init.one_time_prekey_id, otk_id);

        let bob_ik = bob.identity();
        let spk = bob.signed_prekey_secret(bundle.signed_prekey_id).unwrap();
        let otk = bob.consume_one_time_private(otk_id.unwrap()).unwrap();
        let sk = respond(&bob_ik, &spk, Some(&otk), &alice_ik.public.0, &init.ephemeral_pub)
            .unwrap();
        assert_eq!(init.shared_key, sk);
    }

    #[test]
    fn with_and_without_otk_derive_different_secrets() {
        let alice_ik = IdentityKeyPair::generate();
        let mut bob = Account::new();
        let (mut bundle, _) = bundle_for(&mut bob, true);

        let with_otk = initiate(&alice_ik, &bundle).unwrap();
        bundle.one_time = None;
        let without_otk = initiate(&alice_ik, &bundle).unwrap();
        assert_ne!(with_otk.shared_key, without_otk.shared_key);
    }

    #[test]
    fn rejects_spk_signed_by_wrong_identity() {
        let alice_ik = IdentityKeyPair::generate();
        let mut bob = Account::new();
        let evil = IdentityKeyPair::generate();

        let (mut bundle, _) = bundle_for(&mut bob, false);
        bundle.signed_prekey_sig = evil.sign(&bundle.signed_prekey_pub);

        assert!(matches!(
            initiate(&alice_ik, &bundle),
            Err(CryptoError::BadSignature)
        ));
    }
}
