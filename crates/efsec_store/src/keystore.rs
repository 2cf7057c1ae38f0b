//! Typed keystore operations.
//!
//! Named maps, one table each: `account` (singleton), `signed_prekeys`
//! (current + prior), `one_time_prekeys` (by key_id), `pairwise_sessions`
//! (by peer user+device, skipped-key cache inside the serialized state),
//! `megolm_outbound` / `megolm_inbound`.
//!
//! Every write that belongs to one crypto operation shares one SQL
//! transaction; a failed transaction leaves prior state intact. Callers
//! persist *after* a successful decrypt and *before* surfacing plaintext,
//! so a committed ratchet never rolls back.

use serde::{Deserialize, Serialize};
use sqlx::Row;

use efsec_crypto::account::{Account, AccountParts, OneTimePreKey, SignedPreKey};
use efsec_crypto::megolm::{InboundGroupSession, OutboundGroupSession};
use efsec_crypto::ratchet::RatchetSession;
use efsec_crypto::x3dh::PendingPreKey;

use crate::db::Store;
use crate::error::StoreError;

/// Everything persisted per pairwise session: the ratchet state (with its
/// skipped-key cache) plus the prekey prefix still owed to the peer.
#[derive(Serialize, Deserialize)]
pub struct PairwiseSessionRecord {
    pub session: RatchetSession,
    pub pending_prekey: Option<PendingPreKey>,
}

/// A pairwise session together with its owning peer address.
pub struct StoredSession {
    pub peer_user_id: String,
    pub peer_device_id: String,
    pub record: PairwiseSessionRecord,
}

impl Store {
    // ── Account ──────────────────────────────────────────────────────────

    /// Read the vault salt without touching encrypted state; `None` until
    /// the account row exists.
    pub async fn vault_salt(&self) -> Result<Option<[u8; 16]>, StoreError> {
        let row = sqlx::query("SELECT vault_salt FROM account LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        match row {
            None => Ok(None),
            Some(row) => {
                let hexed: String = row.get("vault_salt");
                let bytes = hex::decode(&hexed)
                    .map_err(|e| StoreError::Conflict(format!("corrupt vault salt: {e}")))?;
                let arr: [u8; 16] = bytes
                    .try_into()
                    .map_err(|_| StoreError::Conflict("vault salt must be 16 bytes".into()))?;
                Ok(Some(arr))
            }
        }
    }

    /// Persist the whole account inventory: identity + counter in the
    /// singleton row, prekey secrets in their maps. One transaction.
    pub async fn save_account(
        &self,
        user_id: &str,
        device_id: &str,
        vault_salt: &[u8; 16],
        account: &Account,
    ) -> Result<(), StoreError> {
        let parts = account.to_parts();

        let identity_enc = self.encrypt_value(&parts.identity_secret).await?;
        let current_enc = self.encrypt_value(&serde_json::to_vec(&parts.signed_prekey)?).await?;
        let prior_enc = match &parts.prior_signed_prekey {
            Some(prior) => Some((prior.key_id, self.encrypt_value(&serde_json::to_vec(prior)?).await?)),
            None => None,
        };
        let mut one_time_enc = Vec::with_capacity(parts.one_time.len());
        for otk in &parts.one_time {
            one_time_enc.push((otk.key_id, self.encrypt_value(&serde_json::to_vec(otk)?).await?));
        }

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO account (user_id, device_id, identity_secret_enc, next_key_id, vault_salt) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT (user_id) DO UPDATE SET \
                identity_secret_enc = excluded.identity_secret_enc, \
                next_key_id = excluded.next_key_id, \
                updated_at = datetime('now')",
        )
        .bind(user_id)
        .bind(device_id)
        .bind(&identity_enc)
        .bind(i64::from(parts.next_key_id))
        .bind(hex::encode(vault_salt))
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM signed_prekeys").execute(&mut *tx).await?;
        sqlx::query("INSERT INTO signed_prekeys (key_id, secret_enc, is_current) VALUES (?, ?, 1)")
            .bind(i64::from(parts.signed_prekey.key_id))
            .bind(&current_enc)
            .execute(&mut *tx)
            .await?;
        if let Some((key_id, enc)) = prior_enc {
            sqlx::query("INSERT INTO signed_prekeys (key_id, secret_enc, is_current) VALUES (?, ?, 0)")
                .bind(i64::from(key_id))
                .bind(&enc)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query("DELETE FROM one_time_prekeys").execute(&mut *tx).await?;
        for (key_id, enc) in &one_time_enc {
            sqlx::query("INSERT INTO one_time_prekeys (key_id, secret_enc) VALUES (?, ?)")
                .bind(i64::from(*key_id))
                .bind(enc)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Load and reassemble the account. `None` on a fresh keystore.
    pub async fn load_account(&self) -> Result<Option<(String, String, Account)>, StoreError> {
        let Some(row) = sqlx::query(
            "SELECT user_id, device_id, identity_secret_enc, next_key_id FROM account LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };

        let user_id: String = row.get("user_id");
        let device_id: String = row.get("device_id");
        let identity_enc: String = row.get("identity_secret_enc");
        let next_key_id: i64 = row.get("next_key_id");

        let identity_bytes = self.decrypt_value(&identity_enc).await?;
        let identity_secret: [u8; 32] = identity_bytes
            .try_into()
            .map_err(|_| StoreError::Conflict("identity secret must be 32 bytes".into()))?;

        let mut signed_prekey: Option<SignedPreKey> = None;
        let mut prior_signed_prekey: Option<SignedPreKey> = None;
        let spk_rows = sqlx::query("SELECT secret_enc, is_current FROM signed_prekeys")
            .fetch_all(&self.pool)
            .await?;
        for row in spk_rows {
            let enc: String = row.get("secret_enc");
            let is_current: i64 = row.get("is_current");
            let spk: SignedPreKey = serde_json::from_slice(&self.decrypt_value(&enc).await?)?;
            if is_current != 0 {
                signed_prekey = Some(spk);
            } else {
                prior_signed_prekey = Some(spk);
            }
        }
        let signed_prekey = signed_prekey
            .ok_or_else(|| StoreError::Conflict("account row without current signed prekey".into()))?;

        let mut one_time = Vec::new();
        let otk_rows = sqlx::query("SELECT secret_enc FROM one_time_prekeys ORDER BY key_id ASC")
            .fetch_all(&self.pool)
            .await?;
        for row in otk_rows {
            let enc: String = row.get("secret_enc");
            let otk: OneTimePreKey = serde_json::from_slice(&self.decrypt_value(&enc).await?)?;
            one_time.push(otk);
        }

        let account = Account::from_parts(AccountParts {
            identity_secret,
            signed_prekey,
            prior_signed_prekey,
            one_time,
            next_key_id: u32::try_from(next_key_id)
                .map_err(|_| StoreError::Conflict("next_key_id out of range".into()))?,
        });
        Ok(Some((user_id, device_id, account)))
    }

    // ── Pairwise sessions ────────────────────────────────────────────────

    pub async fn save_session(
        &self,
        peer_user_id: &str,
        peer_device_id: &str,
        session_hint: &[u8; 16],
        record: &PairwiseSessionRecord,
    ) -> Result<(), StoreError> {
        let state_enc = self.encrypt_value(&serde_json::to_vec(record)?).await?;
        sqlx::query(
            "INSERT INTO pairwise_sessions (peer_user_id, peer_device_id, session_hint, state_enc) \
             VALUES (?, ?, ?, ?) \
             ON CONFLICT (peer_user_id, peer_device_id) DO UPDATE SET \
                session_hint = excluded.session_hint, \
                state_enc = excluded.state_enc, \
                updated_at = datetime('now')",
        )
        .bind(peer_user_id)
        .bind(peer_device_id)
        .bind(hex::encode(session_hint))
        .bind(&state_enc)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_session(
        &self,
        peer_user_id: &str,
        peer_device_id: &str,
    ) -> Result<Option<PairwiseSessionRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT state_enc FROM pairwise_sessions WHERE peer_user_id = ? AND peer_device_id = ?",
        )
        .bind(peer_user_id)
        .bind(peer_device_id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            None => Ok(None),
            Some(row) => {
                let enc: String = row.get("state_enc");
                let record = serde_json::from_slice(&self.decrypt_value(&enc).await?)?;
                Ok(Some(record))
            }
        }
    }

    /// Any session for a peer user, regardless of device, with its stored
    /// hint. Single-active-device deployments have at most one.
    pub async fn load_session_for_user(
        &self,
        peer_user_id: &str,
    ) -> Result<Option<(String, [u8; 16], PairwiseSessionRecord)>, StoreError> {
        let row = sqlx::query(
            "SELECT peer_device_id, session_hint, state_enc FROM pairwise_sessions \
             WHERE peer_user_id = ? ORDER BY created_at ASC LIMIT 1",
        )
        .bind(peer_user_id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            None => Ok(None),
            Some(row) => {
                let hint_hex: String = row.get("session_hint");
                let hint_bytes = hex::decode(&hint_hex)
                    .map_err(|e| StoreError::Conflict(format!("corrupt session hint: {e}")))?;
                let hint: [u8; 16] = hint_bytes
                    .try_into()
                    .map_err(|_| StoreError::Conflict("session hint must be 16 bytes".into()))?;
                let enc: String = row.get("state_enc");
                let record = serde_json::from_slice(&self.decrypt_value(&enc).await?)?;
                Ok(Some((row.get("peer_device_id"), hint, record)))
            }
        }
    }

    /// Resolve an inbound envelope's session hint to its peer session.
    pub async fn find_session_by_hint(
        &self,
        session_hint: &[u8; 16],
    ) -> Result<Option<StoredSession>, StoreError> {
        let row = sqlx::query(
            "SELECT peer_user_id, peer_device_id, state_enc FROM pairwise_sessions \
             WHERE session_hint = ? LIMIT 1",
        )
        .bind(hex::encode(session_hint))
        .fetch_optional(&self.pool)
        .await?;
        match row {
            None => Ok(None),
            Some(row) => {
                let enc: String = row.get("state_enc");
                let record = serde_json::from_slice(&self.decrypt_value(&enc).await?)?;
                Ok(Some(StoredSession {
                    peer_user_id: row.get("peer_user_id"),
                    peer_device_id: row.get("peer_device_id"),
                    record,
                }))
            }
        }
    }

    /// Responder-side session establishment: the consumed one-time prekey
    /// disappears and the fresh session lands in the same transaction, so
    /// a crash cannot leave the prekey spendable twice.
    pub async fn commit_inbound_init(
        &self,
        user_id: &str,
        device_id: &str,
        vault_salt: &[u8; 16],
        account: &Account,
        peer_user_id: &str,
        peer_device_id: &str,
        session_hint: &[u8; 16],
        record: &PairwiseSessionRecord,
    ) -> Result<(), StoreError> {
        // save_account and save_session each run their own transaction;
        // group them by hand here.
        let parts = account.to_parts();
        let identity_enc = self.encrypt_value(&parts.identity_secret).await?;
        let current_enc = self.encrypt_value(&serde_json::to_vec(&parts.signed_prekey)?).await?;
        let prior_enc = match &parts.prior_signed_prekey {
            Some(prior) => Some((prior.key_id, self.encrypt_value(&serde_json::to_vec(prior)?).await?)),
            None => None,
        };
        let mut one_time_enc = Vec::with_capacity(parts.one_time.len());
        for otk in &parts.one_time {
            one_time_enc.push((otk.key_id, self.encrypt_value(&serde_json::to_vec(otk)?).await?));
        }
        let state_enc = self.encrypt_value(&serde_json::to_vec(record)?).await?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO account (user_id, device_id, identity_secret_enc, next_key_id, vault_salt) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT (user_id) DO UPDATE SET \
                identity_secret_enc = excluded.identity_secret_enc, \
                next_key_id = excluded.next_key_id, \
                updated_at = datetime('now')",
        )
        .bind(user_id)
        .bind(device_id)
        .bind(&identity_enc)
        .bind(i64::from(parts.next_key_id))
        .bind(hex::encode(vault_salt))
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM signed_prekeys").execute(&mut *tx).await?;
        sqlx::query("INSERT INTO signed_prekeys (key_id, secret_enc, is_current) VALUES (?, ?, 1)")
            .bind(i64::from(parts.signed_prekey.key_id))
            .bind(&current_enc)
            .execute(&mut *tx)
            .await?;
        if let Some((key_id, enc)) = prior_enc {
            sqlx::query("INSERT INTO signed_prekeys (key_id, secret_enc, is_current) VALUES (?, ?, 0)")
                .bind(i64::from(key_id))
                .bind(&enc)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query("DELETE FROM one_time_prekeys").execute(&mut *tx).await?;
        for (key_id, enc) in &one_time_enc {
            sqlx::query("INSERT INTO one_time_prekeys (key_id, secret_enc) VALUES (?, ?)")
                .bind(i64::from(*key_id))
                .bind(enc)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query(
            "INSERT INTO pairwise_sessions (peer_user_id, peer_device_id, session_hint, state_enc) \
             VALUES (?, ?, ?, ?) \
             ON CONFLICT (peer_user_id, peer_device_id) DO UPDATE SET \
                session_hint = excluded.session_hint, \
                state_enc = excluded.state_enc, \
                updated_at = datetime('now')",
        )
        .bind(peer_user_id)
        .bind(peer_device_id)
        .bind(hex::encode(session_hint))
        .bind(&state_enc)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    // ── Megolm sessions ──────────────────────────────────────────────────

    pub async fn save_megolm_outbound(
        &self,
        group_id: &str,
        session: &OutboundGroupSession,
    ) -> Result<(), StoreError> {
        let state_enc = self.encrypt_value(&serde_json::to_vec(session)?).await?;
        sqlx::query(
            "INSERT INTO megolm_outbound (group_id, session_id, state_enc) VALUES (?, ?, ?) \
             ON CONFLICT (group_id, session_id) DO UPDATE SET \
                state_enc = excluded.state_enc, updated_at = datetime('now')",
        )
        .bind(group_id)
        .bind(hex::encode(session.session_id()))
        .bind(&state_enc)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// The newest outbound session for a group, if any.
    pub async fn load_megolm_outbound(
        &self,
        group_id: &str,
    ) -> Result<Option<OutboundGroupSession>, StoreError> {
        let row = sqlx::query(
            "SELECT state_enc FROM megolm_outbound WHERE group_id = ? \
             ORDER BY created_at DESC, session_id DESC LIMIT 1",
        )
        .bind(group_id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            None => Ok(None),
            Some(row) => {
                let enc: String = row.get("state_enc");
                Ok(Some(serde_json::from_slice(&self.decrypt_value(&enc).await?)?))
            }
        }
    }

    /// Drop every outbound session for a group (rekey-on-leave).
    pub async fn delete_megolm_outbound(&self, group_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM megolm_outbound WHERE group_id = ?")
            .bind(group_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn save_megolm_inbound(
        &self,
        group_id: &str,
        sender_id: &str,
        session: &InboundGroupSession,
    ) -> Result<(), StoreError> {
        let state_enc = self.encrypt_value(&serde_json::to_vec(session)?).await?;
        sqlx::query(
            "INSERT INTO megolm_inbound (group_id, sender_id, session_id, state_enc) \
             VALUES (?, ?, ?, ?) \
             ON CONFLICT (group_id, sender_id, session_id) DO UPDATE SET \
                state_enc = excluded.state_enc, updated_at = datetime('now')",
        )
        .bind(group_id)
        .bind(sender_id)
        .bind(hex::encode(session.session_id()))
        .bind(&state_enc)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_megolm_inbound(
        &self,
        group_id: &str,
        sender_id: &str,
        session_id: &[u8; 16],
    ) -> Result<Option<InboundGroupSession>, StoreError> {
        let row = sqlx::query(
            "SELECT state_enc FROM megolm_inbound \
             WHERE group_id = ? AND sender_id = ? AND session_id = ?",
        )
        .bind(group_id)
        .bind(sender_id)
        .bind(hex::encode(session_id))
        .fetch_optional(&self.pool)
        .await?;
        match row {
            None => Ok(None),
            Some(row) => {
                let enc: String = row.get("state_enc");
                Ok(Some(serde_json::from_slice(&self.decrypt_value(&enc).await?)?))
            }
        }
    }

    /// Locate an inbound group session by session id alone (sender not yet
    /// known to the caller).
    pub async fn find_megolm_inbound(
        &self,
        group_id: &str,
        session_id: &[u8; 16],
    ) -> Result<Option<(String, InboundGroupSession)>, StoreError> {
        let row = sqlx::query(
            "SELECT sender_id, state_enc FROM megolm_inbound \
             WHERE group_id = ? AND session_id = ? LIMIT 1",
        )
        .bind(group_id)
        .bind(hex::encode(session_id))
        .fetch_optional(&self.pool)
        .await?;
        match row {
            None => Ok(None),
            Some(row) => {
                let enc: String = row.get("state_enc");
                let session = serde_json::from_slice(&self.decrypt_value(&enc).await?)?;
                Ok(Some((row.get("sender_id"), session)))
            }
        }
    }
}
