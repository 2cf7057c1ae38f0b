//! End-to-end coordinator flows over an in-process transport hub.
//!
//! The hub mirrors the coordination server's observable behaviour: bundle
//! claims consume one-time keys, membership changes bump the key version,
//! envelopes fan out to per-recipient queues and stay queued until acked.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use efsec_engine::{Coordinator, GroupRecv, Incoming, Transport, TransportError};
use efsec_proto::api::{
    AckRequest, BundleResponse, CreateGroupRequest, GroupInfoResponse, JoinGroupRequest,
    KeyStatusResponse, ListEnvelopesResponse, OneTimeKeyDto, ReplenishRequest,
    SendEnvelopeRequest, SendEnvelopeResponse, SignedPreKeyDto, StoredEnvelopeDto,
    UploadBundleRequest,
};
use efsec_store::{Store, Vault};

#[derive(Default)]
struct UserKeys {
    device_id: String,
    identity_pub: String,
    signed_prekey: Option<SignedPreKeyDto>,
    one_time: Vec<(OneTimeKeyDto, bool)>,
}

#[derive(Default)]
struct GroupState {
    created_by: String,
    key_version: u32,
    members: Vec<String>,
}

#[derive(Default)]
struct Hub {
    keys: HashMap<String, UserKeys>,
    groups: HashMap<String, GroupState>,
    queues: HashMap<String, Vec<StoredEnvelopeDto>>,
}

impl Hub {
    fn used_one_time(&self, user: &str) -> Vec<u32> {
        self.keys
            .get(user)
            .map(|k| k.one_time.iter().filter(|(_, used)| *used).map(|(k, _)| k.key_id).collect())
            .unwrap_or_default()
    }

    fn queue_len(&self, user: &str) -> usize {
        self.queues.get(user).map(Vec::len).unwrap_or(0)
    }
}

#[derive(Clone)]
struct LoopbackTransport {
    user: String,
    hub: Arc<Mutex<Hub>>,
}

impl Transport for LoopbackTransport {
    async fn publish_bundle(&self, req: &UploadBundleRequest) -> Result<(), TransportError> {
        let mut hub = self.hub.lock().await;
        let entry = hub.keys.entry(self.user.clone()).or_default();
        entry.device_id = req.device_id.clone();
        entry.identity_pub = req.identity_pub.clone();
        entry.signed_prekey = Some(req.signed_prekey.clone());
        for key in &req.one_time_keys {
            entry.one_time.push((key.clone(), false));
        }
        Ok(())
    }

    async fn replenish(&self, req: &ReplenishRequest) -> Result<(), TransportError> {
        let mut hub = self.hub.lock().await;
        let entry = hub.keys.entry(self.user.clone()).or_default();
        for key in &req.one_time_keys {
            entry.one_time.push((key.clone(), false));
        }
        Ok(())
    }

    async fn key_status(&self) -> Result<KeyStatusResponse, TransportError> {
        let hub = self.hub.lock().await;
        let remaining = hub
            .keys
            .get(&self.user)
            .map(|k| k.one_time.iter().filter(|(_, used)| !used).count() as i64)
            .unwrap_or(0);
        Ok(KeyStatusResponse { remaining_one_time: remaining })
    }

    async fn fetch_bundle(&self, user_id: &str) -> Result<BundleResponse, TransportError> {
        let mut hub = self.hub.lock().await;
        let entry = hub.keys.get_mut(user_id).ok_or(TransportError::Refused {
            status: 404,
            message: "no bundle".into(),
        })?;
        let one_time_key = entry.one_time.iter_mut().find(|(_, used)| !used).map(|slot| {
            slot.1 = true;
            slot.0.clone()
        });
        Ok(BundleResponse {
            user_id: user_id.to_string(),
            device_id: entry.device_id.clone(),
            identity_pub: entry.identity_pub.clone(),
            signed_prekey: entry.signed_prekey.clone().ok_or(TransportError::Refused {
                status: 404,
                message: "no signed prekey".into(),
            })?,
            one_time_key,
        })
    }

    async fn create_group(&self, req: &CreateGroupRequest) -> Result<GroupInfoResponse, TransportError> {
        let mut hub = self.hub.lock().await;
        let mut members = req.members.clone();
        if !members.contains(&self.user) {
            members.push(self.user.clone());
        }
        hub.groups.insert(
            req.group_id.clone(),
            GroupState { created_by: self.user.clone(), key_version: 1, members: members.clone() },
        );
        Ok(GroupInfoResponse {
            group_id: req.group_id.clone(),
            created_by: self.user.clone(),
            key_version: 1,
            members,
        })
    }

    async fn join_group(&self, group_id: &str, req: &JoinGroupRequest) -> Result<GroupInfoResponse, TransportError> {
        let mut hub = self.hub.lock().await;
        let group = hub.groups.get_mut(group_id).ok_or(TransportError::Refused {
            status: 404,
            message: "no group".into(),
        })?;
        if !group.members.contains(&req.user_id) {
            group.members.push(req.user_id.clone());
        }
        Ok(GroupInfoResponse {
            group_id: group_id.to_string(),
            created_by: group.created_by.clone(),
            key_version: group.key_version,
            members: group.members.clone(),
        })
    }

    async fn leave_group(&self, group_id: &str, req: &JoinGroupRequest) -> Result<GroupInfoResponse, TransportError> {
        let mut hub = self.hub.lock().await;
        let group = hub.groups.get_mut(group_id).ok_or(TransportError::Refused {
            status: 404,
            message: "no group".into(),
        })?;
        group.members.retain(|member| member != &req.user_id);
        group.key_version += 1;
        Ok(GroupInfoResponse {
            group_id: group_id.to_string(),
            created_by: group.created_by.clone(),
            key_version: group.key_version,
            members: group.members.clone(),
        })
    }

    async fn group_info(&self, group_id: &str) -> Result<GroupInfoResponse, TransportError> {
        let hub = self.hub.lock().await;
        let group = hub.groups.get(group_id).ok_or(TransportError::Refused {
            status: 404,
            message: "no group".into(),
        })?;
        Ok(GroupInfoResponse {
            group_id: group_id.to_string(),
            created_by: group.created_by.clone(),
            key_version: group.key_version,
            members: group.members.clone(),
        })
    }

    async fn put_envelope(&self, req: &SendEnvelopeRequest) -> Result<SendEnvelopeResponse, TransportError> {
        let mut hub = self.hub.lock().await;
        let envelope_id = Uuid::new_v4();
        for recipient in &req.recipients {
            hub.queues.entry(recipient.clone()).or_default().push(StoredEnvelopeDto {
                envelope_id: Uuid::new_v4(),
                sender: self.user.clone(),
                class: req.class,
                payload: req.payload.clone(),
                created_at: Utc::now(),
            });
        }
        Ok(SendEnvelopeResponse { envelope_id, received_at: Utc::now() })
    }

    async fn list_envelopes(&self) -> Result<ListEnvelopesResponse, TransportError> {
        let hub = self.hub.lock().await;
        Ok(ListEnvelopesResponse {
            envelopes: hub.queues.get(&self.user).cloned().unwrap_or_default(),
        })
    }

    async fn ack(&self, req: &AckRequest) -> Result<(), TransportError> {
        let mut hub = self.hub.lock().await;
        if let Some(queue) = hub.queues.get_mut(&self.user) {
            queue.retain(|dto| !req.envelope_ids.contains(&dto.envelope_id));
        }
        Ok(())
    }
}

async fn client(name: &str, hub: &Arc<Mutex<Hub>>) -> Coordinator<LoopbackTransport> {
    let vault = Vault::new();
    vault.unlock_with_key([0x33; 32]).await;
    let store = Store::open_in_memory(vault).await.expect("open store");
    Coordinator::init(
        name,
        "primary",
        [0u8; 16],
        store,
        LoopbackTransport { user: name.to_string(), hub: hub.clone() },
    )
    .await
    .expect("init coordinator")
}

fn dm_bodies(events: &[Incoming]) -> Vec<(String, Vec<u8>)> {
    events
        .iter()
        .filter_map(|event| match event {
            Incoming::Dm { sender, plaintext } => Some((sender.clone(), plaintext.clone())),
            _ => None,
        })
        .collect()
}

async fn group_plaintexts(
    coordinator: &mut Coordinator<LoopbackTransport>,
    group_id: &str,
    events: Vec<Incoming>,
) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    for event in events {
        if let Incoming::Group { sender, envelope } = event {
            match coordinator.recv_group(group_id, &sender, &envelope).await.unwrap() {
                GroupRecv::Plaintext(pt) => out.push(pt),
                GroupRecv::PendingKey => panic!("unexpected PendingKey"),
            }
        }
    }
    out
}

#[tokio::test]
async fn dm_roundtrip_consumes_exactly_one_prekey() {
    let hub = Arc::new(Mutex::new(Hub::default()));
    let mut alice = client("alice", &hub).await;
    let mut bob = client("bob", &hub).await;

    alice.send_dm("bob", b"hello").await.unwrap();
    assert_eq!(hub.lock().await.used_one_time("bob").len(), 1);

    let events = bob.poll_inbox().await.unwrap();
    assert_eq!(dm_bodies(&events), vec![("alice".to_string(), b"hello".to_vec())]);

    bob.send_dm("alice", b"hi").await.unwrap();
    // Bob replies over the session the prekey envelope established; no
    // second claim against Alice's pool beyond the reply path.
    let events = alice.poll_inbox().await.unwrap();
    assert_eq!(dm_bodies(&events), vec![("bob".to_string(), b"hi".to_vec())]);

    // Bob's pool lost exactly one key, and it stays consumed.
    assert_eq!(hub.lock().await.used_one_time("bob").len(), 1);
}

#[tokio::test]
async fn out_of_order_first_messages_all_decrypt() {
    let hub = Arc::new(Mutex::new(Hub::default()));
    let mut alice = client("alice", &hub).await;
    let mut bob = client("bob", &hub).await;

    alice.send_dm("bob", b"m0").await.unwrap();
    alice.send_dm("bob", b"m1").await.unwrap();
    alice.send_dm("bob", b"m2").await.unwrap();

    // Deliver in order m2, m0, m1.
    {
        let mut hub = hub.lock().await;
        let queue = hub.queues.get_mut("bob").unwrap();
        queue.rotate_left(2);
        assert_eq!(queue.len(), 3);
    }

    let events = bob.poll_inbox().await.unwrap();
    let bodies: Vec<Vec<u8>> = dm_bodies(&events).into_iter().map(|(_, b)| b).collect();
    assert_eq!(bodies, vec![b"m2".to_vec(), b"m0".to_vec(), b"m1".to_vec()]);
    assert_eq!(hub.lock().await.queue_len("bob"), 0);
}

#[tokio::test]
async fn stale_messages_survive_a_dh_ratchet() {
    let hub = Arc::new(Mutex::new(Hub::default()));
    let mut alice = client("alice", &hub).await;
    let mut bob = client("bob", &hub).await;

    for i in 0..10u8 {
        alice.send_dm("bob", &[b'm', i]).await.unwrap();
    }

    // Bob only sees the last message for now.
    let stashed: Vec<StoredEnvelopeDto> = {
        let mut hub = hub.lock().await;
        let queue = hub.queues.get_mut("bob").unwrap();
        queue.drain(..9).collect()
    };

    let events = bob.poll_inbox().await.unwrap();
    assert_eq!(dm_bodies(&events), vec![("alice".to_string(), vec![b'm', 9])]);

    // Reply triggers a DH ratchet; Alice keeps sending on the new chain.
    bob.send_dm("alice", b"reply").await.unwrap();
    alice.poll_inbox().await.unwrap();
    alice.send_dm("bob", b"m10").await.unwrap();

    // The delayed envelopes arrive after the ratchet moved on.
    {
        let mut hub = hub.lock().await;
        let queue = hub.queues.entry("bob".to_string()).or_default();
        queue.extend(stashed);
    }

    let events = bob.poll_inbox().await.unwrap();
    let mut bodies: Vec<Vec<u8>> = dm_bodies(&events).into_iter().map(|(_, b)| b).collect();
    assert_eq!(bodies.remove(0), b"m10".to_vec());
    assert_eq!(bodies, (0..9).map(|i| vec![b'm', i]).collect::<Vec<_>>());
}

#[tokio::test]
async fn replayed_envelope_is_rejected_and_drained() {
    let hub = Arc::new(Mutex::new(Hub::default()));
    let mut alice = client("alice", &hub).await;
    let mut bob = client("bob", &hub).await;

    alice.send_dm("bob", b"hello").await.unwrap();

    let replay = hub.lock().await.queues.get("bob").unwrap()[0].clone();
    let events = bob.poll_inbox().await.unwrap();
    assert_eq!(dm_bodies(&events).len(), 1);

    // Same envelope lands again (at-least-once delivery).
    {
        let mut hub = hub.lock().await;
        let mut dto = replay;
        dto.envelope_id = Uuid::new_v4();
        hub.queues.entry("bob".to_string()).or_default().push(dto);
    }

    let events = bob.poll_inbox().await.unwrap();
    assert!(dm_bodies(&events).is_empty(), "replay must not surface plaintext");
    assert_eq!(hub.lock().await.queue_len("bob"), 0, "replay is acked away");

    // Session keeps working afterwards.
    alice.send_dm("bob", b"still alive").await.unwrap();
    let events = bob.poll_inbox().await.unwrap();
    assert_eq!(dm_bodies(&events), vec![("alice".to_string(), b"still alive".to_vec())]);
}

#[tokio::test]
async fn group_create_send_and_late_join() {
    let hub = Arc::new(Mutex::new(Hub::default()));
    let mut alice = client("alice", &hub).await;
    let mut bob = client("bob", &hub).await;
    let mut carol = client("carol", &hub).await;

    alice.create_group("room", &["bob".to_string()]).await.unwrap();

    // Bob installs the distributed key.
    let events = bob.poll_inbox().await.unwrap();
    assert!(matches!(events[0], Incoming::GroupKeyInstalled { .. }));

    alice.send_group("room", b"g0").await.unwrap();
    alice.send_group("room", b"g1").await.unwrap();

    let events = bob.poll_inbox().await.unwrap();
    let plaintexts = group_plaintexts(&mut bob, "room", events).await;
    assert_eq!(plaintexts, vec![b"g0".to_vec(), b"g1".to_vec()]);

    // Carol joins at index 2 and receives the chain at its current point.
    alice.add_member("room", "carol").await.unwrap();
    let events = carol.poll_inbox().await.unwrap();
    assert!(matches!(events[0], Incoming::GroupKeyInstalled { .. }));

    alice.send_group("room", b"g2").await.unwrap();

    let bob_events = bob.poll_inbox().await.unwrap();
    let plaintexts = group_plaintexts(&mut bob, "room", bob_events).await;
    assert_eq!(plaintexts, vec![b"g2".to_vec()]);

    let carol_events = carol.poll_inbox().await.unwrap();
    let plaintexts = group_plaintexts(&mut carol, "room", carol_events).await;
    assert_eq!(plaintexts, vec![b"g2".to_vec()]);
}

#[tokio::test]
async fn late_joiner_cannot_decrypt_history() {
    let hub = Arc::new(Mutex::new(Hub::default()));
    let mut alice = client("alice", &hub).await;
    let mut bob = client("bob", &hub).await;
    let mut carol = client("carol", &hub).await;

    alice.create_group("room", &["bob".to_string()]).await.unwrap();
    bob.poll_inbox().await.unwrap();

    alice.send_group("room", b"g0").await.unwrap();

    // Stash Bob's copy of g0 before he acks it.
    let g0_dto = hub.lock().await.queues.get("bob").unwrap().last().unwrap().clone();

    let events = bob.poll_inbox().await.unwrap();
    let plaintexts = group_plaintexts(&mut bob, "room", events).await;
    assert_eq!(plaintexts, vec![b"g0".to_vec()]);

    // Carol joins after g0; she gets the chain at index 1.
    alice.add_member("room", "carol").await.unwrap();
    carol.poll_inbox().await.unwrap();

    alice.send_group("room", b"g1").await.unwrap();
    let events = carol.poll_inbox().await.unwrap();
    let plaintexts = group_plaintexts(&mut carol, "room", events).await;
    assert_eq!(plaintexts, vec![b"g1".to_vec()]);

    // The pre-join envelope fails with UnknownMessageIndex for Carol.
    let g0_bytes = g0_dto.payload_bytes().unwrap();
    let efsec_proto::Envelope::Group(g0) = efsec_proto::Envelope::decode(&g0_bytes).unwrap()
    else {
        panic!("expected group envelope");
    };
    let err = carol.recv_group("room", "alice", &g0).await.unwrap_err();
    assert!(matches!(
        err,
        efsec_engine::EngineError::Crypto(
            efsec_crypto::CryptoError::UnknownMessageIndex { index: 0 }
        )
    ));
}

#[tokio::test]
async fn member_removal_rotates_the_group_session() {
    let hub = Arc::new(Mutex::new(Hub::default()));
    let mut alice = client("alice", &hub).await;
    let mut bob = client("bob", &hub).await;
    let mut carol = client("carol", &hub).await;

    alice
        .create_group("room", &["bob".to_string(), "carol".to_string()])
        .await
        .unwrap();
    bob.poll_inbox().await.unwrap();
    carol.poll_inbox().await.unwrap();

    alice.send_group("room", b"g0").await.unwrap();
    bob.poll_inbox().await.unwrap();
    carol.poll_inbox().await.unwrap();

    // Carol is removed; the registry bumps the key version.
    alice.remove_member("room", "carol").await.unwrap();
    assert_eq!(hub.lock().await.groups.get("room").unwrap().key_version, 2);

    // Next send creates a new session and distributes to Bob only.
    let (_, recipients) = alice.send_group("room", b"g3").await.unwrap();
    assert_eq!(recipients, vec!["bob".to_string()]);

    let bob_events = bob.poll_inbox().await.unwrap();
    let mut g3 = None;
    let mut installed = false;
    for event in &bob_events {
        match event {
            Incoming::GroupKeyInstalled { .. } => installed = true,
            Incoming::Group { envelope, .. } => g3 = Some(envelope.clone()),
            _ => {}
        }
    }
    assert!(installed, "bob received the rotated key");
    let g3 = g3.unwrap();
    match bob.recv_group("room", "alice", &g3).await.unwrap() {
        GroupRecv::Plaintext(pt) => assert_eq!(pt, b"g3"),
        GroupRecv::PendingKey => panic!("bob should hold the new key"),
    }

    // Carol observes the envelope but has no session for it; her key
    // request is refused because she is no longer a member.
    match carol.recv_group("room", "alice", &g3).await.unwrap() {
        GroupRecv::PendingKey => {}
        GroupRecv::Plaintext(_) => panic!("carol must not decrypt post-removal traffic"),
    }
    let events = alice.poll_inbox().await.unwrap();
    // Alice processed the key request without serving it.
    assert!(events
        .iter()
        .all(|event| matches!(event, Incoming::KeyRequestServed { .. })));
    let carol_events = carol.poll_inbox().await.unwrap();
    assert!(
        !carol_events
            .iter()
            .any(|event| matches!(event, Incoming::GroupKeyInstalled { .. })),
        "no key distribution reaches a removed member"
    );
}

#[tokio::test]
async fn missing_group_key_round_trips_through_key_request() {
    let hub = Arc::new(Mutex::new(Hub::default()));
    let mut alice = client("alice", &hub).await;
    let mut bob = client("bob", &hub).await;

    alice.create_group("room", &["bob".to_string()]).await.unwrap();

    // Bob loses the distribution envelope (TTL expiry, say).
    hub.lock().await.queues.remove("bob");

    alice.send_group("room", b"g0").await.unwrap();
    let events = bob.poll_inbox().await.unwrap();
    let Some(Incoming::Group { sender, envelope }) = events.into_iter().next() else {
        panic!("expected a group envelope");
    };

    // No session: PendingKey, and a key request goes to Alice.
    match bob.recv_group("room", &sender, &envelope).await.unwrap() {
        GroupRecv::PendingKey => {}
        GroupRecv::Plaintext(_) => panic!("no key yet"),
    }

    alice.poll_inbox().await.unwrap(); // serves the request
    let events = bob.poll_inbox().await.unwrap();
    assert!(events
        .iter()
        .any(|event| matches!(event, Incoming::GroupKeyInstalled { .. })));

    // Redelivered envelope decrypts now. Distribution happened at the
    // current index, so g0 (sent before the request) stays unreadable —
    // the next message is the first Bob can read.
    let err = bob.recv_group("room", &sender, &envelope).await.unwrap_err();
    assert!(matches!(
        err,
        efsec_engine::EngineError::Crypto(efsec_crypto::CryptoError::UnknownMessageIndex { .. })
    ));

    alice.send_group("room", b"g1").await.unwrap();
    let events = bob.poll_inbox().await.unwrap();
    let plaintexts = group_plaintexts(&mut bob, "room", events).await;
    assert_eq!(plaintexts, vec![b"g1".to_vec()]);
}

#[tokio::test]
async fn reinit_replenishes_a_low_pool() {
    let hub = Arc::new(Mutex::new(Hub::default()));

    let vault = Vault::new();
    vault.unlock_with_key([0x44; 32]).await;
    let store = Store::open_in_memory(vault).await.unwrap();
    let transport = LoopbackTransport { user: "alice".to_string(), hub: hub.clone() };
    let _alice = Coordinator::init("alice", "primary", [0u8; 16], store.clone(), transport.clone())
        .await
        .unwrap();

    // Drain the pool server-side below the threshold.
    {
        let mut hub = hub.lock().await;
        let keys = hub.keys.get_mut("alice").unwrap();
        for slot in keys.one_time.iter_mut().skip(5) {
            slot.1 = true;
        }
    }

    let _alice = Coordinator::init("alice", "primary", [0u8; 16], store, transport)
        .await
        .unwrap();

    let hub = hub.lock().await;
    let unused = hub
        .keys
        .get("alice")
        .unwrap()
        .one_time
        .iter()
        .filter(|(_, used)| !used)
        .count();
    assert!(unused >= efsec_engine::REPLENISH_BATCH, "pool topped back up, got {unused}");
}
