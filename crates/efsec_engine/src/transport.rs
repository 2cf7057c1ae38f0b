//! Transport contract and the HTTP reference implementation.
//!
//! The engine only assumes a request/response channel with at-least-once
//! delivery; push notifications arrive out of band (the application feeds
//! them back into `poll_inbox` / `handle_rekey`). Anything that satisfies
//! this narrow trait — HTTP, WebSocket RPC, an in-process hub in tests —
//! can carry the protocol.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use efsec_proto::api::{
    AckRequest, BundleResponse, CreateGroupRequest, GroupInfoResponse, JoinGroupRequest,
    KeyStatusResponse, ListEnvelopesResponse, ReplenishRequest, SendEnvelopeRequest,
    SendEnvelopeResponse, UploadBundleRequest,
};

/// Bundle fetches must resolve quickly or the send path stalls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport timeout")]
    Timeout,

    #[error("transport refused ({status}): {message}")]
    Refused { status: u16, message: String },

    #[error("transport I/O: {0}")]
    Io(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout
        } else {
            TransportError::Io(err.to_string())
        }
    }
}

/// The request/response surface the coordinator consumes.
#[allow(async_fn_in_trait)]
pub trait Transport {
    async fn publish_bundle(&self, req: &UploadBundleRequest) -> Result<(), TransportError>;
    async fn replenish(&self, req: &ReplenishRequest) -> Result<(), TransportError>;
    async fn key_status(&self) -> Result<KeyStatusResponse, TransportError>;
    /// Fetch-and-claim: the returned one-time key is consumed server-side.
    async fn fetch_bundle(&self, user_id: &str) -> Result<BundleResponse, TransportError>;

    async fn create_group(&self, req: &CreateGroupRequest) -> Result<GroupInfoResponse, TransportError>;
    async fn join_group(&self, group_id: &str, req: &JoinGroupRequest) -> Result<GroupInfoResponse, TransportError>;
    async fn leave_group(&self, group_id: &str, req: &JoinGroupRequest) -> Result<GroupInfoResponse, TransportError>;
    async fn group_info(&self, group_id: &str) -> Result<GroupInfoResponse, TransportError>;

    async fn put_envelope(&self, req: &SendEnvelopeRequest) -> Result<SendEnvelopeResponse, TransportError>;
    async fn list_envelopes(&self) -> Result<ListEnvelopesResponse, TransportError>;
    async fn ack(&self, req: &AckRequest) -> Result<(), TransportError>;
}

// ── HTTP implementation ──────────────────────────────────────────────────────

/// reqwest-backed transport against the coordination server's `/e2e` API.
/// The bearer credential carries the authenticated principal; user ids
/// never ride in request bodies.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    bearer: String,
}

impl HttpTransport {
    pub fn new(base_url: &str, bearer: &str) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(TransportError::from)?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            bearer: bearer.to_string(),
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, TransportError> {
        let resp = self
            .client
            .get(format!("{}{path}", self.base_url))
            .bearer_auth(&self.bearer)
            .send()
            .await?;
        Self::parse(resp).await
    }

    async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, TransportError> {
        let resp = self
            .client
            .post(format!("{}{path}", self.base_url))
            .bearer_auth(&self.bearer)
            .json(body)
            .send()
            .await?;
        Self::parse(resp).await
    }

    async fn parse<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, TransportError> {
        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(TransportError::Refused { status: status.as_u16(), message });
        }
        Ok(resp.json().await?)
    }
}

impl Transport for HttpTransport {
    async fn publish_bundle(&self, req: &UploadBundleRequest) -> Result<(), TransportError> {
        let _: serde_json::Value = self.post_json("/e2e/keys", req).await?;
        Ok(())
    }

    async fn replenish(&self, req: &ReplenishRequest) -> Result<(), TransportError> {
        let _: serde_json::Value = self.post_json("/e2e/keys/replenish", req).await?;
        Ok(())
    }

    async fn key_status(&self) -> Result<KeyStatusResponse, TransportError> {
        self.get_json("/e2e/keys/status").await
    }

    async fn fetch_bundle(&self, user_id: &str) -> Result<BundleResponse, TransportError> {
        self.get_json(&format!("/e2e/bundle/{user_id}")).await
    }

    async fn create_group(&self, req: &CreateGroupRequest) -> Result<GroupInfoResponse, TransportError> {
        self.post_json("/e2e/group/create", req).await
    }

    async fn join_group(&self, group_id: &str, req: &JoinGroupRequest) -> Result<GroupInfoResponse, TransportError> {
        self.post_json(&format!("/e2e/group/{group_id}/join"), req).await
    }

    async fn leave_group(&self, group_id: &str, req: &JoinGroupRequest) -> Result<GroupInfoResponse, TransportError> {
        self.post_json(&format!("/e2e/group/{group_id}/leave"), req).await
    }

    async fn group_info(&self, group_id: &str) -> Result<GroupInfoResponse, TransportError> {
        self.get_json(&format!("/e2e/group/{group_id}/members")).await
    }

    async fn put_envelope(&self, req: &SendEnvelopeRequest) -> Result<SendEnvelopeResponse, TransportError> {
        self.post_json("/e2e/messages/ephemeral", req).await
    }

    async fn list_envelopes(&self) -> Result<ListEnvelopesResponse, TransportError> {
        self.get_json("/e2e/messages").await
    }

    async fn ack(&self, req: &AckRequest) -> Result<(), TransportError> {
        let _: serde_json::Value = self.post_json("/e2e/messages/ack", req).await?;
        Ok(())
    }
}
