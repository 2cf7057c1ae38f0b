//! Server key registry (SKR) — public key inventory per user.
//!
//! Write-once-ish for identity keys, rotate for signed prekeys,
//! consume-once for one-time prekeys. The one-time claim is a single
//! UPDATE-of-a-subquery so concurrent bundle fetches can never hand the
//! same key out twice, and `used = 1` survives restarts.

use sqlx::{Row, SqlitePool};

use efsec_proto::api::{BundleResponse, OneTimeKeyDto, SignedPreKeyDto, UploadBundleRequest};

use crate::error::ApiError;

/// Store or update a user's bundle: identity, new signed prekey (prior
/// kept but marked for deletion), fresh one-time publics.
pub async fn upload_bundle(
    pool: &SqlitePool,
    user_id: &str,
    req: &UploadBundleRequest,
) -> Result<(), ApiError> {
    if req.identity_pub.is_empty() || req.signed_prekey.public.is_empty() {
        return Err(ApiError::Validation("identity and signed prekey are required".into()));
    }

    let mut tx = pool.begin().await?;

    sqlx::query(
        "INSERT INTO identity_keys (user_id, device_id, identity_pub) VALUES (?, ?, ?) \
         ON CONFLICT (user_id) DO UPDATE SET \
            device_id = excluded.device_id, identity_pub = excluded.identity_pub",
    )
    .bind(user_id)
    .bind(&req.device_id)
    .bind(&req.identity_pub)
    .execute(&mut *tx)
    .await?;

    // Prior signed prekeys stay resolvable during the grace window; the
    // client deletes its secret when the window lapses.
    sqlx::query(
        "UPDATE signed_prekeys SET is_current = 0, pending_delete_at = datetime('now', '+30 days') \
         WHERE user_id = ? AND is_current = 1",
    )
    .bind(user_id)
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        "INSERT INTO signed_prekeys (user_id, key_id, pub, signature, is_current) \
         VALUES (?, ?, ?, ?, 1) \
         ON CONFLICT (user_id, key_id) DO UPDATE SET \
            pub = excluded.pub, signature = excluded.signature, \
            is_current = 1, pending_delete_at = NULL",
    )
    .bind(user_id)
    .bind(i64::from(req.signed_prekey.key_id))
    .bind(&req.signed_prekey.public)
    .bind(&req.signed_prekey.signature)
    .execute(&mut *tx)
    .await?;

    for key in &req.one_time_keys {
        sqlx::query(
            "INSERT INTO one_time_prekeys (user_id, key_id, pub) VALUES (?, ?, ?) \
             ON CONFLICT (user_id, key_id) DO NOTHING",
        )
        .bind(user_id)
        .bind(i64::from(key.key_id))
        .bind(&key.public)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    tracing::info!(
        event = "bundle_uploaded",
        user_id = %user_id,
        signed_prekey_id = req.signed_prekey.key_id,
        one_time_keys = req.one_time_keys.len()
    );
    Ok(())
}

/// Append one-time publics.
pub async fn replenish(
    pool: &SqlitePool,
    user_id: &str,
    keys: &[OneTimeKeyDto],
) -> Result<(), ApiError> {
    if keys.len() > 1000 {
        return Err(ApiError::Validation("at most 1000 one-time keys per upload".into()));
    }
    for key in keys {
        sqlx::query(
            "INSERT INTO one_time_prekeys (user_id, key_id, pub) VALUES (?, ?, ?) \
             ON CONFLICT (user_id, key_id) DO NOTHING",
        )
        .bind(user_id)
        .bind(i64::from(key.key_id))
        .bind(&key.public)
        .execute(pool)
        .await?;
    }
    Ok(())
}

/// Unused one-time count.
pub async fn remaining_one_time(pool: &SqlitePool, user_id: &str) -> Result<i64, ApiError> {
    let row = sqlx::query("SELECT COUNT(*) AS n FROM one_time_prekeys WHERE user_id = ? AND used = 0")
        .bind(user_id)
        .fetch_one(pool)
        .await?;
    Ok(row.get::<i64, _>("n"))
}

/// Atomically claim one unused one-time key; `None` when the pool is dry.
async fn claim_one_time(pool: &SqlitePool, user_id: &str) -> Result<Option<OneTimeKeyDto>, ApiError> {
    let row = sqlx::query(
        "UPDATE one_time_prekeys SET used = 1 \
         WHERE user_id = ? AND key_id = ( \
             SELECT key_id FROM one_time_prekeys \
             WHERE user_id = ? AND used = 0 ORDER BY key_id ASC LIMIT 1) \
         RETURNING key_id, pub",
    )
    .bind(user_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|row| OneTimeKeyDto {
        key_id: row.get::<i64, _>("key_id") as u32,
        public: row.get("pub"),
    }))
}

/// Assemble a bundle for an initiator, consuming one one-time key. A dry
/// pool yields a bundle without one (OPK-less X3DH is the caller's call).
pub async fn claim_bundle(pool: &SqlitePool, user_id: &str) -> Result<BundleResponse, ApiError> {
    let Some(identity) = sqlx::query(
        "SELECT device_id, identity_pub FROM identity_keys WHERE user_id = ?",
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await?
    else {
        return Err(ApiError::NotFound("bundle"));
    };

    let signed = sqlx::query(
        "SELECT key_id, pub, signature FROM signed_prekeys \
         WHERE user_id = ? AND is_current = 1 LIMIT 1",
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await?
    .ok_or(ApiError::NotFound("signed prekey"))?;

    let one_time_key = claim_one_time(pool, user_id).await?;
    if one_time_key.is_none() {
        tracing::warn!(event = "bundle_served_without_one_time_key", user_id = %user_id);
    }

    Ok(BundleResponse {
        user_id: user_id.to_string(),
        device_id: identity.get("device_id"),
        identity_pub: identity.get("identity_pub"),
        signed_prekey: SignedPreKeyDto {
            key_id: signed.get::<i64, _>("key_id") as u32,
            public: signed.get("pub"),
            signature: signed.get("signature"),
        },
        one_time_key,
    })
}
