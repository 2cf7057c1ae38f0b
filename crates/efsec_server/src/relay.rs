//! Ephemeral ciphertext relay (ECR).
//!
//! Per-recipient FIFO of opaque envelopes with TTL. The relay never
//! inspects payload bytes; classification exists purely for retention.
//! Ack removes an envelope from its recipient's queue; a background
//! sweep deletes expired rows.

use chrono::{DateTime, Duration, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use efsec_proto::api::{EnvelopeClass, StoredEnvelopeDto};

use crate::error::ApiError;

/// Retention per envelope class.
fn ttl(class: EnvelopeClass) -> Duration {
    match class {
        EnvelopeClass::Dm | EnvelopeClass::Group => Duration::days(7),
        EnvelopeClass::KeyDist => Duration::hours(24),
    }
}

fn class_tag(class: EnvelopeClass) -> &'static str {
    match class {
        EnvelopeClass::Dm => "dm",
        EnvelopeClass::Group => "group",
        EnvelopeClass::KeyDist => "key_dist",
    }
}

fn parse_class(tag: &str) -> EnvelopeClass {
    match tag {
        "group" => EnvelopeClass::Group,
        "key_dist" => EnvelopeClass::KeyDist,
        _ => EnvelopeClass::Dm,
    }
}

/// Enqueue one envelope for a set of recipients. Returns the shared
/// envelope id and creation time.
pub async fn put(
    pool: &SqlitePool,
    sender: &str,
    recipients: &[String],
    class: EnvelopeClass,
    payload: &[u8],
) -> Result<(Uuid, DateTime<Utc>), ApiError> {
    if recipients.is_empty() {
        return Err(ApiError::Validation("at least one recipient required".into()));
    }
    let envelope_id = Uuid::new_v4();
    let now = Utc::now();
    let expires_at = now + ttl(class);

    let mut tx = pool.begin().await?;
    for recipient in recipients {
        sqlx::query(
            "INSERT INTO envelopes (envelope_id, recipient, sender, class, payload, created_at, expires_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(envelope_id.to_string())
        .bind(recipient)
        .bind(sender)
        .bind(class_tag(class))
        .bind(payload)
        .bind(now.to_rfc3339())
        .bind(expires_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;

    tracing::debug!(
        event = "envelope_stored",
        envelope_id = %envelope_id,
        recipients = recipients.len(),
        class = class_tag(class),
        bytes = payload.len()
    );
    Ok((envelope_id, now))
}

/// Unacked, unexpired envelopes for a recipient, oldest first.
pub async fn list(pool: &SqlitePool, recipient: &str) -> Result<Vec<StoredEnvelopeDto>, ApiError> {
    let rows = sqlx::query(
        "SELECT envelope_id, sender, class, payload, created_at FROM envelopes \
         WHERE recipient = ? AND expires_at > ? ORDER BY created_at ASC, envelope_id ASC",
    )
    .bind(recipient)
    .bind(Utc::now().to_rfc3339())
    .fetch_all(pool)
    .await?;

    let mut envelopes = Vec::with_capacity(rows.len());
    for row in rows {
        let id_text: String = row.get("envelope_id");
        let envelope_id = Uuid::parse_str(&id_text)
            .map_err(|e| ApiError::Validation(format!("corrupt envelope id: {e}")))?;
        let created_text: String = row.get("created_at");
        let created_at = DateTime::parse_from_rfc3339(&created_text)
            .map_err(|e| ApiError::Validation(format!("corrupt timestamp: {e}")))?
            .with_timezone(&Utc);
        let payload: Vec<u8> = row.get("payload");
        envelopes.push(StoredEnvelopeDto {
            envelope_id,
            sender: row.get("sender"),
            class: parse_class(row.get::<String, _>("class").as_str()),
            payload: base64::Engine::encode(
                &base64::engine::general_purpose::URL_SAFE_NO_PAD,
                &payload,
            ),
            created_at,
        });
    }
    Ok(envelopes)
}

/// Remove envelopes from a recipient's queue.
pub async fn ack(pool: &SqlitePool, recipient: &str, envelope_ids: &[Uuid]) -> Result<u64, ApiError> {
    let mut removed = 0u64;
    for envelope_id in envelope_ids {
        let result = sqlx::query("DELETE FROM envelopes WHERE envelope_id = ? AND recipient = ?")
            .bind(envelope_id.to_string())
            .bind(recipient)
            .execute(pool)
            .await?;
        removed += result.rows_affected();
    }
    Ok(removed)
}

/// Delete expired envelopes; bounded by the number of expired rows.
pub async fn sweep_expired(pool: &SqlitePool) -> Result<u64, ApiError> {
    let result = sqlx::query("DELETE FROM envelopes WHERE expires_at <= ?")
        .bind(Utc::now().to_rfc3339())
        .execute(pool)
        .await?;
    let swept = result.rows_affected();
    if swept > 0 {
        tracing::info!(event = "relay_swept", expired = swept);
    }
    Ok(swept)
}
