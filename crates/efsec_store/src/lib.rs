//! efsec_store — the persistent client keystore.
//!
//! All private material lives here and only here, vault-encrypted inside
//! SQLite. State advancement is transactional: a ratchet that committed
//! never rolls back, and a crypto operation's writes land together or not
//! at all.

pub mod db;
pub mod error;
pub mod keystore;
pub mod vault;

pub use db::Store;
pub use error::StoreError;
pub use keystore::{PairwiseSessionRecord, StoredSession};
pub use vault::{new_vault_salt, Vault};
