//! Server group registry (SGR) — membership and a monotone key version.
//!
//! No key material lives here. Removing a member and bumping the key
//! version happen in one transaction so a send racing a removal can
//! never observe the old version with the new membership.

use sqlx::{Row, SqlitePool};

use efsec_proto::api::GroupInfoResponse;

use crate::error::ApiError;

pub async fn create_group(
    pool: &SqlitePool,
    group_id: &str,
    creator: &str,
    members: &[String],
) -> Result<GroupInfoResponse, ApiError> {
    let mut tx = pool.begin().await?;

    let inserted = sqlx::query(
        "INSERT INTO groups (group_id, created_by) VALUES (?, ?) \
         ON CONFLICT (group_id) DO NOTHING",
    )
    .bind(group_id)
    .bind(creator)
    .execute(&mut *tx)
    .await?;
    if inserted.rows_affected() == 0 {
        return Err(ApiError::Conflict(format!("group {group_id} already exists")));
    }

    sqlx::query("INSERT INTO group_members (group_id, user_id) VALUES (?, ?)")
        .bind(group_id)
        .bind(creator)
        .execute(&mut *tx)
        .await?;
    for member in members {
        if member == creator {
            continue;
        }
        sqlx::query(
            "INSERT INTO group_members (group_id, user_id) VALUES (?, ?) \
             ON CONFLICT (group_id, user_id) DO NOTHING",
        )
        .bind(group_id)
        .bind(member)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    tracing::info!(event = "group_created", group_id = %group_id, created_by = %creator);
    group_info(pool, group_id).await
}

pub async fn add_member(
    pool: &SqlitePool,
    group_id: &str,
    user_id: &str,
) -> Result<GroupInfoResponse, ApiError> {
    ensure_group(pool, group_id).await?;
    sqlx::query(
        "INSERT INTO group_members (group_id, user_id) VALUES (?, ?) \
         ON CONFLICT (group_id, user_id) DO NOTHING",
    )
    .bind(group_id)
    .bind(user_id)
    .execute(pool)
    .await?;
    group_info(pool, group_id).await
}

/// Remove a member; the key version increments in the same transaction.
pub async fn remove_member(
    pool: &SqlitePool,
    group_id: &str,
    user_id: &str,
) -> Result<GroupInfoResponse, ApiError> {
    ensure_group(pool, group_id).await?;
    let mut tx = pool.begin().await?;

    let removed = sqlx::query("DELETE FROM group_members WHERE group_id = ? AND user_id = ?")
        .bind(group_id)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;
    if removed.rows_affected() > 0 {
        sqlx::query("UPDATE groups SET key_version = key_version + 1 WHERE group_id = ?")
            .bind(group_id)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    tracing::info!(event = "member_removed", group_id = %group_id, user_id = %user_id);
    group_info(pool, group_id).await
}

/// Force a key-version bump without membership change.
pub async fn bump_key_version(pool: &SqlitePool, group_id: &str) -> Result<GroupInfoResponse, ApiError> {
    ensure_group(pool, group_id).await?;
    sqlx::query("UPDATE groups SET key_version = key_version + 1 WHERE group_id = ?")
        .bind(group_id)
        .execute(pool)
        .await?;
    group_info(pool, group_id).await
}

pub async fn is_member(pool: &SqlitePool, group_id: &str, user_id: &str) -> Result<bool, ApiError> {
    let row = sqlx::query("SELECT 1 FROM group_members WHERE group_id = ? AND user_id = ?")
        .bind(group_id)
        .bind(user_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.is_some())
}

pub async fn group_info(pool: &SqlitePool, group_id: &str) -> Result<GroupInfoResponse, ApiError> {
    let group = sqlx::query("SELECT created_by, key_version FROM groups WHERE group_id = ?")
        .bind(group_id)
        .fetch_optional(pool)
        .await?
        .ok_or(ApiError::NotFound("group"))?;

    let members: Vec<String> =
        sqlx::query("SELECT user_id FROM group_members WHERE group_id = ? ORDER BY joined_at ASC, user_id ASC")
            .bind(group_id)
            .fetch_all(pool)
            .await?
            .into_iter()
            .map(|row| row.get("user_id"))
            .collect();

    Ok(GroupInfoResponse {
        group_id: group_id.to_string(),
        created_by: group.get("created_by"),
        key_version: group.get::<i64, _>("key_version") as u32,
        members,
    })
}

async fn ensure_group(pool: &SqlitePool, group_id: &str) -> Result<(), ApiError> {
    sqlx::query("SELECT 1 FROM groups WHERE group_id = ?")
        .bind(group_id)
        .fetch_optional(pool)
        .await?
        .ok_or(ApiError::NotFound("group"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::AppState;

    #[tokio::test]
    async fn create_lists_creator_and_members() {
        let state = AppState::open_in_memory().await.unwrap();
        let info = create_group(&state.pool, "room", "alice", &["bob".into(), "carol".into()])
            .await
            .unwrap();
        assert_eq!(info.key_version, 1);
        assert_eq!(info.members.len(), 3);
        assert!(info.members.contains(&"alice".to_string()));
    }

    #[tokio::test]
    async fn duplicate_group_is_a_conflict() {
        let state = AppState::open_in_memory().await.unwrap();
        create_group(&state.pool, "room", "alice", &[]).await.unwrap();
        assert!(matches!(
            create_group(&state.pool, "room", "bob", &[]).await,
            Err(ApiError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn removal_bumps_key_version_exactly_once() {
        let state = AppState::open_in_memory().await.unwrap();
        create_group(&state.pool, "room", "alice", &["bob".into()]).await.unwrap();

        let info = remove_member(&state.pool, "room", "bob").await.unwrap();
        assert_eq!(info.key_version, 2);
        assert!(!info.members.contains(&"bob".to_string()));

        // Removing an absent member changes nothing.
        let info = remove_member(&state.pool, "room", "bob").await.unwrap();
        assert_eq!(info.key_version, 2);
    }

    #[tokio::test]
    async fn add_is_idempotent_and_does_not_bump() {
        let state = AppState::open_in_memory().await.unwrap();
        create_group(&state.pool, "room", "alice", &[]).await.unwrap();

        add_member(&state.pool, "room", "bob").await.unwrap();
        let info = add_member(&state.pool, "room", "bob").await.unwrap();
        assert_eq!(info.key_version, 1);
        assert_eq!(info.members.len(), 2);
        assert!(is_member(&state.pool, "room", "bob").await.unwrap());
    }
}
