//! Shared application state and the authenticated-principal extractor.

use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tokio::sync::broadcast;

use efsec_proto::api::{GroupRekeyEvent, PushEvent};

use crate::error::ApiError;

/// What the push channel carries to connected clients.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Envelope(PushEvent),
    GroupRekey { recipients: Vec<String>, event: GroupRekeyEvent },
}

pub struct AppState {
    pub pool: SqlitePool,
    pub push_tx: broadcast::Sender<ServerEvent>,
}

impl AppState {
    pub async fn open(db_path: &str) -> Result<Arc<Self>, sqlx::Error> {
        let opts: SqliteConnectOptions = db_path
            .parse::<SqliteConnectOptions>()?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);
        let pool = SqlitePool::connect_with(opts).await?;
        Self::with_pool(pool).await
    }

    pub async fn open_in_memory() -> Result<Arc<Self>, sqlx::Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Arc<Self>, sqlx::Error> {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| sqlx::Error::Configuration(e.to_string().into()))?;
        let (push_tx, _) = broadcast::channel(1024);
        Ok(Arc::new(Self { pool, push_tx }))
    }
}

/// The verified principal of a request.
///
/// Authentication itself is out of scope: deployments terminate auth
/// upstream (session token, mTLS, gateway) and the verified user id
/// reaches this service as the bearer credential. It is the only source
/// of truth for the caller's identity; request bodies never carry it.
#[derive(Debug, Clone)]
pub struct Principal(pub String);

impl<S: Send + Sync> FromRequestParts<S> for Principal {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .ok_or(ApiError::Unauthenticated)?;
        let user_id = header.strip_prefix("Bearer ").ok_or(ApiError::Unauthenticated)?;
        if user_id.is_empty() {
            return Err(ApiError::Unauthenticated);
        }
        Ok(Principal(user_id.to_string()))
    }
}
