//! efsec_crypto — the cryptographic core of the efsec E2EE subsystem.
//!
//! Pure state transitions, no I/O: X3DH key agreement, Double Ratchet
//! pairwise sessions, Megolm-style group sessions, and the primitives they
//! share. Persistence belongs to `efsec_store`, orchestration to
//! `efsec_engine`.

pub mod account;
pub mod aead;
pub mod error;
pub mod identity;
pub mod kdf;
pub mod megolm;
pub mod ratchet;
pub mod serde_b64;
pub mod x3dh;

pub use account::{Account, AccountParts, OneTimePreKey, PublicBundle, SignedPreKey, SignedPreKeyPublic};
pub use error::CryptoError;
pub use identity::{IdentityKeyPair, PublicKeyBytes};
pub use megolm::{GroupMessage, GroupSessionExport, InboundGroupSession, OutboundGroupSession};
pub use ratchet::{RatchetHeader, RatchetMessage, RatchetSession};
pub use x3dh::{PeerBundle, PendingPreKey};
