//! Route-level tests against the in-memory server.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use tower::ServiceExt;

use efsec_crypto::account::Account;
use efsec_proto::api::{
    AckRequest, BundleResponse, CreateGroupRequest, EnvelopeClass, GroupInfoResponse,
    JoinGroupRequest, KeyStatusResponse, ListEnvelopesResponse, SendEnvelopeRequest,
    SendEnvelopeResponse, UploadBundleRequest,
};
use efsec_server::{routes, AppState, ServerEvent};

async fn app() -> (Router, std::sync::Arc<AppState>) {
    let state = AppState::open_in_memory().await.unwrap();
    (routes::router(state.clone()), state)
}

async fn send<B: serde::Serialize>(
    app: &Router,
    method: &str,
    uri: &str,
    principal: Option<&str>,
    body: Option<&B>,
) -> (StatusCode, Vec<u8>) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(user) = principal {
        builder = builder.header("authorization", format!("Bearer {user}"));
    }
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(body).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, bytes.to_vec())
}

fn parse<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> T {
    serde_json::from_slice(bytes).unwrap()
}

async fn upload_account_bundle(app: &Router, user: &str, account: &mut Account) {
    let bundle = account.publish_bundle();
    let req = UploadBundleRequest::from_bundle("primary", &bundle);
    let (status, _) = send(app, "POST", "/e2e/keys", Some(user), Some(&req)).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn endpoints_require_a_principal() {
    let (app, _state) = app().await;
    let (status, _) =
        send::<()>(&app, "GET", "/e2e/keys/status", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) =
        send::<()>(&app, "GET", "/e2e/bundle/bob", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn bundle_claims_are_single_use_per_key() {
    let (app, _state) = app().await;
    let mut bob = Account::new();
    upload_account_bundle(&app, "bob", &mut bob).await;

    let (status, body) = send::<()>(&app, "GET", "/e2e/keys/status", Some("bob"), None).await;
    assert_eq!(status, StatusCode::OK);
    let status_body: KeyStatusResponse = parse(&body);
    assert_eq!(status_body.remaining_one_time, 50);

    let mut seen = std::collections::HashSet::new();
    for _ in 0..50 {
        let (status, body) = send::<()>(&app, "GET", "/e2e/bundle/bob", Some("alice"), None).await;
        assert_eq!(status, StatusCode::OK);
        let bundle: BundleResponse = parse(&body);
        let key = bundle.one_time_key.expect("pool not yet dry");
        assert!(seen.insert(key.key_id), "key {} handed out twice", key.key_id);
    }

    // Pool dry: bundle still served, weaker X3DH is the caller's choice.
    let (status, body) = send::<()>(&app, "GET", "/e2e/bundle/bob", Some("alice"), None).await;
    assert_eq!(status, StatusCode::OK);
    let bundle: BundleResponse = parse(&body);
    assert!(bundle.one_time_key.is_none());

    let (_, body) = send::<()>(&app, "GET", "/e2e/keys/status", Some("bob"), None).await;
    let status_body: KeyStatusResponse = parse(&body);
    assert_eq!(status_body.remaining_one_time, 0);
}

#[tokio::test]
async fn served_bundles_verify_against_the_identity() {
    let (app, _state) = app().await;
    let mut bob = Account::new();
    upload_account_bundle(&app, "bob", &mut bob).await;

    let (_, body) = send::<()>(&app, "GET", "/e2e/bundle/bob", Some("alice"), None).await;
    let bundle: BundleResponse = parse(&body);
    let peer = bundle.to_peer_bundle().unwrap();

    // The stored signature still verifies under the stored identity key.
    efsec_crypto::IdentityKeyPair::verify(
        &peer.identity_pub,
        &peer.signed_prekey_pub,
        &peer.signed_prekey_sig,
    )
    .unwrap();
}

#[tokio::test]
async fn leave_bumps_key_version_and_membership_gates_apply() {
    let (app, _state) = app().await;

    let create = CreateGroupRequest {
        group_id: "room".into(),
        members: vec!["bob".into(), "carol".into()],
    };
    let (status, body) = send(&app, "POST", "/e2e/group/create", Some("alice"), Some(&create)).await;
    assert_eq!(status, StatusCode::OK);
    let info: GroupInfoResponse = parse(&body);
    assert_eq!(info.key_version, 1);
    assert_eq!(info.members.len(), 3);

    // A non-member cannot mutate membership.
    let leave = JoinGroupRequest { user_id: "carol".into() };
    let (status, _) =
        send(&app, "POST", "/e2e/group/room/leave", Some("mallory"), Some(&leave)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) =
        send(&app, "POST", "/e2e/group/room/leave", Some("alice"), Some(&leave)).await;
    assert_eq!(status, StatusCode::OK);
    let info: GroupInfoResponse = parse(&body);
    assert_eq!(info.key_version, 2);
    assert!(!info.members.contains(&"carol".to_string()));

    let (status, body) =
        send::<()>(&app, "GET", "/e2e/group/room/members", Some("bob"), None).await;
    assert_eq!(status, StatusCode::OK);
    let info: GroupInfoResponse = parse(&body);
    assert_eq!(info.key_version, 2);
}

#[tokio::test]
async fn message_flow_enqueues_lists_and_acks_per_recipient() {
    let (app, state) = app().await;
    let mut push_rx = state.push_tx.subscribe();

    let put = SendEnvelopeRequest::new(
        vec!["bob".into(), "carol".into()],
        EnvelopeClass::Dm,
        b"opaque-bytes",
    );
    let (status, body) =
        send(&app, "POST", "/e2e/messages/ephemeral", Some("alice"), Some(&put)).await;
    assert_eq!(status, StatusCode::OK);
    let receipt: SendEnvelopeResponse = parse(&body);

    // Push notification fired for each recipient.
    let pushed = push_rx.try_recv().unwrap();
    match pushed {
        ServerEvent::Envelope(event) => assert_eq!(event.envelope_id, receipt.envelope_id),
        other => panic!("unexpected push {other:?}"),
    }

    let (status, body) = send::<()>(&app, "GET", "/e2e/messages", Some("bob"), None).await;
    assert_eq!(status, StatusCode::OK);
    let listing: ListEnvelopesResponse = parse(&body);
    assert_eq!(listing.envelopes.len(), 1);
    assert_eq!(listing.envelopes[0].sender, "alice");
    assert_eq!(listing.envelopes[0].payload_bytes().unwrap(), b"opaque-bytes");

    // Carol's queue is independent of Bob's ack.
    let ack = AckRequest { envelope_ids: vec![receipt.envelope_id] };
    let (status, _) = send(&app, "POST", "/e2e/messages/ack", Some("bob"), Some(&ack)).await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = send::<()>(&app, "GET", "/e2e/messages", Some("bob"), None).await;
    let listing: ListEnvelopesResponse = parse(&body);
    assert!(listing.envelopes.is_empty());

    let (_, body) = send::<()>(&app, "GET", "/e2e/messages", Some("carol"), None).await;
    let listing: ListEnvelopesResponse = parse(&body);
    assert_eq!(listing.envelopes.len(), 1);
}
