//! Client coordinator.
//!
//! Orchestrates the whole client side: bundle publication and
//! replenishment, pairwise session establishment (X3DH both ways), the
//! send/receive paths, Megolm key distribution over pairwise sessions,
//! and membership-change reactions.
//!
//! State discipline: ratchet state is committed to the keystore *before*
//! ciphertext leaves on send and *before* plaintext is surfaced on
//! receive. Relay envelopes are acked only once processed, or once their
//! failure is permanent.

use uuid::Uuid;

use efsec_crypto::account::{Account, PublicBundle, SignedPreKeyPublic};
use efsec_crypto::megolm::{GroupSessionExport, InboundGroupSession, OutboundGroupSession};
use efsec_crypto::ratchet::RatchetSession;
use efsec_crypto::x3dh;
use efsec_proto::api::{
    AckRequest, CreateGroupRequest, EnvelopeClass, GroupInfoResponse, JoinGroupRequest,
    ReplenishRequest, SendEnvelopeRequest, SendEnvelopeResponse, UploadBundleRequest,
};
use efsec_proto::codec;
use efsec_proto::control::InnerPayload;
use efsec_proto::envelope::{DmEnvelope, Envelope, GroupEnvelope, PreKeyHeader};
use efsec_store::{PairwiseSessionRecord, Store};

use crate::error::EngineError;
use crate::transport::Transport;

/// Replenish the one-time pool when the server reports fewer than this.
pub const REPLENISH_THRESHOLD: i64 = 10;
/// One-time keys uploaded per replenishment.
pub const REPLENISH_BATCH: usize = 50;
/// Device id recorded for peers until their bundle tells us better.
const PEER_DEVICE_FALLBACK: &str = "primary";

/// What `poll_inbox` hands back to the application.
#[derive(Debug)]
pub enum Incoming {
    /// A decrypted direct message.
    Dm { sender: String, plaintext: Vec<u8> },
    /// A group envelope; the application routes it to `recv_group` with
    /// the room it belongs to.
    Group { sender: String, envelope: GroupEnvelope },
    /// A group key arrived and an inbound session was installed.
    GroupKeyInstalled { group_id: String, sender: String, session_id: [u8; 16] },
    /// A peer asked for a group key and was answered.
    KeyRequestServed { group_id: String, requester: String },
}

/// Outcome of `recv_group`.
#[derive(Debug)]
pub enum GroupRecv {
    Plaintext(Vec<u8>),
    /// No inbound session yet; a key request went out over the pairwise
    /// channel. Re-deliver the envelope once the key installs.
    PendingKey,
}

pub struct Coordinator<T: Transport> {
    user_id: String,
    device_id: String,
    vault_salt: [u8; 16],
    store: Store,
    transport: T,
    account: Account,
}

fn associated_data(initiator_ik: &[u8; 32], responder_ik: &[u8; 32]) -> [u8; 64] {
    let mut ad = [0u8; 64];
    ad[..32].copy_from_slice(initiator_ik);
    ad[32..].copy_from_slice(responder_ik);
    ad
}

fn wire_prekey(pending: &x3dh::PendingPreKey) -> PreKeyHeader {
    PreKeyHeader {
        identity_pub: pending.identity_pub,
        ephemeral_pub: pending.ephemeral_pub,
        signed_prekey_id: pending.signed_prekey_id,
        one_time_prekey_id: pending.one_time_prekey_id,
    }
}

impl<T: Transport> Coordinator<T> {
    /// Open or create the local account, publish the bundle on first run,
    /// and top up the server-side one-time pool when it runs low.
    ///
    /// The store's vault must already be unlocked with `vault_salt`.
    pub async fn init(
        user_id: &str,
        device_id: &str,
        vault_salt: [u8; 16],
        store: Store,
        transport: T,
    ) -> Result<Self, EngineError> {
        let mut coordinator = match store.load_account().await? {
            Some((stored_user, stored_device, account)) => {
                if stored_user != user_id {
                    return Err(EngineError::AccountMismatch);
                }
                tracing::info!(event = "account_loaded", user_id = %user_id, device_id = %stored_device);
                Self {
                    user_id: user_id.to_string(),
                    device_id: stored_device,
                    vault_salt,
                    store,
                    transport,
                    account,
                }
            }
            None => {
                let mut account = Account::new();
                let bundle = account.publish_bundle();
                tracing::info!(
                    event = "account_created",
                    user_id = %user_id,
                    one_time_keys = bundle.one_time.len()
                );
                let coordinator = Self {
                    user_id: user_id.to_string(),
                    device_id: device_id.to_string(),
                    vault_salt,
                    store,
                    transport,
                    account,
                };
                coordinator
                    .transport
                    .publish_bundle(&UploadBundleRequest::from_bundle(device_id, &bundle))
                    .await?;
                coordinator.persist_account().await?;
                return Ok(coordinator);
            }
        };

        let status = coordinator.transport.key_status().await?;
        if status.remaining_one_time < REPLENISH_THRESHOLD {
            coordinator.replenish_one_time_keys().await?;
        }
        Ok(coordinator)
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn identity_fingerprint(&self) -> String {
        self.account.identity().public.fingerprint()
    }

    async fn persist_account(&self) -> Result<(), EngineError> {
        self.store
            .save_account(&self.user_id, &self.device_id, &self.vault_salt, &self.account)
            .await?;
        Ok(())
    }

    /// Generate and upload a fresh one-time batch.
    pub async fn replenish_one_time_keys(&mut self) -> Result<(), EngineError> {
        let publics = self.account.replenish_one_time_keys(REPLENISH_BATCH);
        let req = ReplenishRequest {
            one_time_keys: publics
                .iter()
                .map(|(key_id, public)| efsec_proto::api::OneTimeKeyDto {
                    key_id: *key_id,
                    public: base64::Engine::encode(
                        &base64::engine::general_purpose::URL_SAFE_NO_PAD,
                        public,
                    ),
                })
                .collect(),
        };
        self.transport.replenish(&req).await?;
        self.persist_account().await?;
        tracing::info!(event = "one_time_keys_replenished", count = REPLENISH_BATCH);
        Ok(())
    }

    /// Rotate the signed prekey and re-upload the bundle (prior secret is
    /// retained for in-flight initiations).
    pub async fn rotate_signed_prekey(&mut self) -> Result<(), EngineError> {
        let rotated: SignedPreKeyPublic = self.account.rotate_signed_prekey();
        let bundle = PublicBundle {
            identity_pub: self.account.identity().public.0,
            signed_prekey: rotated,
            one_time: Vec::new(),
        };
        self.transport
            .publish_bundle(&UploadBundleRequest::from_bundle(&self.device_id, &bundle))
            .await?;
        self.persist_account().await?;
        tracing::info!(event = "signed_prekey_rotated", key_id = self.account.signed_prekey.key_id);
        Ok(())
    }

    // ── Pairwise sessions ────────────────────────────────────────────────

    /// Load the session for a peer, or establish one from their bundle.
    async fn ensure_session(
        &mut self,
        peer_id: &str,
    ) -> Result<(String, [u8; 16], PairwiseSessionRecord), EngineError> {
        if let Some((device, hint, record)) = self.store.load_session_for_user(peer_id).await? {
            return Ok((device, hint, record));
        }

        let response = self.transport.fetch_bundle(peer_id).await?;
        let bundle = response.to_peer_bundle()?;
        if bundle.one_time.is_none() {
            // OPK-less X3DH is weaker but valid; the peer should replenish.
            tracing::warn!(event = "bundle_without_one_time_key", peer = %peer_id);
        }

        let my_ik = self.account.identity();
        let init = x3dh::initiate(&my_ik, &bundle)?;
        let ad = associated_data(&my_ik.public.0, &bundle.identity_pub);
        let session =
            RatchetSession::init_initiator(init.shared_key, &bundle.signed_prekey_pub, ad)?;
        let hint: [u8; 16] = *Uuid::new_v4().as_bytes();
        let record = PairwiseSessionRecord {
            session,
            pending_prekey: Some(init.pending_prekey(my_ik.public.0)),
        };
        self.store
            .save_session(peer_id, &response.device_id, &hint, &record)
            .await?;
        tracing::info!(
            event = "session_established_outbound",
            peer = %peer_id,
            one_time_key = init.one_time_prekey_id.is_some()
        );
        Ok((response.device_id, hint, record))
    }

    /// Encrypt and enqueue one pairwise payload. Commits the ratchet
    /// before the envelope reaches the transport.
    async fn send_payload(
        &mut self,
        peer_id: &str,
        peer_device: &str,
        hint: [u8; 16],
        record: &mut PairwiseSessionRecord,
        payload: &InnerPayload,
        class: EnvelopeClass,
    ) -> Result<SendEnvelopeResponse, EngineError> {
        let padded = codec::pad_to_bucket(&payload.encode()?);
        let message = record.session.encrypt(&padded)?;
        if record.session.has_received() {
            record.pending_prekey = None;
        }
        let prekey = record.pending_prekey.as_ref().map(wire_prekey);
        let envelope = DmEnvelope::new(hint, prekey, message);

        self.store.save_session(peer_id, peer_device, &hint, record).await?;

        let request =
            SendEnvelopeRequest::new(vec![peer_id.to_string()], class, &envelope.encode());
        let response = self.transport.put_envelope(&request).await?;
        tracing::debug!(
            event = "envelope_sent",
            peer = %peer_id,
            n = envelope.header.n,
            prekey = envelope.prekey.is_some()
        );
        Ok(response)
    }

    /// Encrypt and send a direct message.
    pub async fn send_dm(
        &mut self,
        peer_id: &str,
        plaintext: &[u8],
    ) -> Result<SendEnvelopeResponse, EngineError> {
        let (device, hint, mut record) = self.ensure_session(peer_id).await?;
        let payload = InnerPayload::Chat { body: plaintext.to_vec() };
        self.send_payload(peer_id, &device, hint, &mut record, &payload, EnvelopeClass::Dm)
            .await
    }

    async fn send_control(&mut self, peer_id: &str, payload: InnerPayload) -> Result<(), EngineError> {
        let (device, hint, mut record) = self.ensure_session(peer_id).await?;
        self.send_payload(peer_id, &device, hint, &mut record, &payload, EnvelopeClass::KeyDist)
            .await?;
        Ok(())
    }

    /// Decrypt one DM envelope: X3DH inbound on a prekey prefix without a
    /// matching session, plain ratchet decrypt otherwise. Returns `None`
    /// when the payload was control traffic consumed internally.
    async fn handle_dm(
        &mut self,
        sender: &str,
        dm: DmEnvelope,
    ) -> Result<Option<Incoming>, EngineError> {
        let existing = self.store.find_session_by_hint(&dm.session_hint).await?;

        let (peer_user, peer_device, mut record, fresh_account) = match existing {
            Some(stored) => (stored.peer_user_id, stored.peer_device_id, stored.record, None),
            None => {
                let Some(ref prekey) = dm.prekey else {
                    return Err(EngineError::UnknownSession(sender.to_string()));
                };
                // Run consumption against a scratch account so a decrypt
                // failure cannot desynchronise memory from the keystore.
                let mut scratch = Account::from_parts(self.account.to_parts());
                let spk_secret = scratch.signed_prekey_secret(prekey.signed_prekey_id)?;
                let otk_secret = match prekey.one_time_prekey_id {
                    Some(id) => Some(scratch.consume_one_time_private(id)?),
                    None => None,
                };
                let shared = x3dh::respond(
                    &scratch.identity(),
                    &spk_secret,
                    otk_secret.as_ref(),
                    &prekey.identity_pub,
                    &prekey.ephemeral_pub,
                )?;
                let ad = associated_data(&prekey.identity_pub, &scratch.identity().public.0);
                let session = RatchetSession::init_responder(shared, &spk_secret, ad);
                tracing::info!(
                    event = "session_established_inbound",
                    peer = %sender,
                    one_time_key = prekey.one_time_prekey_id.is_some()
                );
                (
                    sender.to_string(),
                    PEER_DEVICE_FALLBACK.to_string(),
                    PairwiseSessionRecord { session, pending_prekey: None },
                    Some(scratch),
                )
            }
        };

        let padded = record.session.decrypt(&dm.header, &dm.ciphertext, &dm.tag)?;

        // Commit the advanced ratchet (and the consumed one-time key, in
        // the same transaction) before any plaintext is surfaced.
        match fresh_account {
            Some(scratch) => {
                self.store
                    .commit_inbound_init(
                        &self.user_id,
                        &self.device_id,
                        &self.vault_salt,
                        &scratch,
                        &peer_user,
                        &peer_device,
                        &dm.session_hint,
                        &record,
                    )
                    .await?;
                self.account = scratch;
            }
            None => {
                self.store
                    .save_session(&peer_user, &peer_device, &dm.session_hint, &record)
                    .await?;
            }
        }

        // From here on the peer identity comes from the session, not from
        // the relay's (unauthenticated) sender field.
        match InnerPayload::decode(&codec::unpad(&padded)?)? {
            InnerPayload::Chat { body } => {
                Ok(Some(Incoming::Dm { sender: peer_user, plaintext: body }))
            }
            InnerPayload::KeyDistribution {
                group_id,
                session_id,
                chain_key,
                sig_pub,
                first_known_index,
            } => {
                let export = GroupSessionExport {
                    session_id,
                    message_index: first_known_index,
                    chain_key,
                    sig_pub,
                };
                // Never replace an installed session: the existing one can
                // only know more history than a re-distribution.
                if self
                    .store
                    .load_megolm_inbound(&group_id, &peer_user, &session_id)
                    .await?
                    .is_none()
                {
                    let inbound = InboundGroupSession::from_export(&export);
                    self.store.save_megolm_inbound(&group_id, &peer_user, &inbound).await?;
                    tracing::info!(
                        event = "group_key_installed",
                        group_id = %group_id,
                        sender = %peer_user,
                        first_known_index = export.message_index
                    );
                }
                Ok(Some(Incoming::GroupKeyInstalled {
                    group_id,
                    sender: peer_user,
                    session_id,
                }))
            }
            InnerPayload::KeyRequest { group_id, session_id } => {
                self.serve_key_request(&peer_user, &group_id, session_id).await?;
                Ok(Some(Incoming::KeyRequestServed {
                    group_id,
                    requester: peer_user,
                }))
            }
        }
    }

    /// Decrypt one DM envelope delivered out of band (e.g. straight off
    /// the push channel). `poll_inbox` routes queued envelopes through
    /// the same path.
    pub async fn recv_dm(
        &mut self,
        sender: &str,
        envelope: DmEnvelope,
    ) -> Result<Option<Incoming>, EngineError> {
        self.handle_dm(sender, envelope).await
    }

    async fn serve_key_request(
        &mut self,
        requester: &str,
        group_id: &str,
        session_id: [u8; 16],
    ) -> Result<(), EngineError> {
        // Membership gate: a removed member must never obtain the
        // post-rekey chain by asking for it.
        let info = self.transport.group_info(group_id).await?;
        if !info.members.iter().any(|member| member == requester) {
            tracing::warn!(
                event = "key_request_from_non_member",
                group_id = %group_id,
                requester = %requester
            );
            return Ok(());
        }
        let Some(outbound) = self.store.load_megolm_outbound(group_id).await? else {
            tracing::warn!(event = "key_request_without_outbound", group_id = %group_id);
            return Ok(());
        };
        if outbound.session_id() != session_id {
            // The requested session was rotated away; share the live one.
            tracing::debug!(event = "key_request_for_rotated_session", group_id = %group_id);
        }
        let payload = InnerPayload::key_distribution(group_id, &outbound.export());
        self.send_control(requester, payload).await
    }

    /// Drain the relay queue: decrypt DMs, consume control traffic, hand
    /// group envelopes to the application. Envelopes are acked once
    /// processed or once their failure is permanent.
    pub async fn poll_inbox(&mut self) -> Result<Vec<Incoming>, EngineError> {
        let listing = self.transport.list_envelopes().await?;
        let mut events = Vec::new();
        let mut acks = Vec::new();

        for dto in listing.envelopes {
            let decoded = dto
                .payload_bytes()
                .map_err(EngineError::from)
                .and_then(|bytes| Envelope::decode(&bytes).map_err(EngineError::from));
            let envelope = match decoded {
                Ok(envelope) => envelope,
                Err(error) => {
                    tracing::warn!(event = "envelope_undecodable", envelope_id = %dto.envelope_id, error = %error);
                    acks.push(dto.envelope_id);
                    continue;
                }
            };

            match envelope {
                Envelope::Dm(dm) => match self.handle_dm(&dto.sender, dm).await {
                    Ok(Some(event)) => {
                        events.push(event);
                        acks.push(dto.envelope_id);
                    }
                    Ok(None) => acks.push(dto.envelope_id),
                    Err(error) if error.is_permanent() => {
                        tracing::warn!(
                            event = "envelope_rejected",
                            envelope_id = %dto.envelope_id,
                            sender = %dto.sender,
                            error = %error
                        );
                        acks.push(dto.envelope_id);
                    }
                    Err(error) => {
                        // Transient (keystore/transport): leave unacked for
                        // redelivery.
                        tracing::error!(event = "envelope_deferred", envelope_id = %dto.envelope_id, error = %error);
                    }
                },
                Envelope::Group(group) => {
                    events.push(Incoming::Group { sender: dto.sender.clone(), envelope: group });
                    acks.push(dto.envelope_id);
                }
            }
        }

        if !acks.is_empty() {
            self.transport.ack(&AckRequest { envelope_ids: acks }).await?;
        }
        Ok(events)
    }

    // ── Groups ───────────────────────────────────────────────────────────

    /// Create a fresh outbound session for a group and distribute its
    /// chain state to every listed member.
    async fn rotate_group_session(
        &mut self,
        group_id: &str,
        members: &[String],
    ) -> Result<OutboundGroupSession, EngineError> {
        let outbound = OutboundGroupSession::new();
        self.store.save_megolm_outbound(group_id, &outbound).await?;
        let export = InnerPayload::key_distribution(group_id, &outbound.export());
        for member in members {
            if member == &self.user_id {
                continue;
            }
            self.send_control(member, export.clone()).await?;
        }
        tracing::info!(
            event = "group_session_created",
            group_id = %group_id,
            session_id = %hex::encode(outbound.session_id()),
            members = members.len()
        );
        Ok(outbound)
    }

    /// Register the group with the server, then create and distribute the
    /// first outbound session.
    pub async fn create_group(
        &mut self,
        group_id: &str,
        members: &[String],
    ) -> Result<GroupInfoResponse, EngineError> {
        let info = self
            .transport
            .create_group(&CreateGroupRequest {
                group_id: group_id.to_string(),
                members: members.to_vec(),
            })
            .await?;
        self.rotate_group_session(group_id, &info.members).await?;
        Ok(info)
    }

    /// Encrypt for the group; returns the relay receipt and the recipient
    /// list used for fan-out.
    pub async fn send_group(
        &mut self,
        group_id: &str,
        plaintext: &[u8],
    ) -> Result<(SendEnvelopeResponse, Vec<String>), EngineError> {
        let info = self.transport.group_info(group_id).await?;
        let mut outbound = match self.store.load_megolm_outbound(group_id).await? {
            Some(outbound) => outbound,
            None => self.rotate_group_session(group_id, &info.members).await?,
        };

        let padded = codec::pad_to_bucket(plaintext);
        let message = outbound.encrypt(&padded)?;
        // Chain state advances durably before the ciphertext leaves.
        self.store.save_megolm_outbound(group_id, &outbound).await?;

        let recipients: Vec<String> = info
            .members
            .iter()
            .filter(|member| member.as_str() != self.user_id)
            .cloned()
            .collect();
        let envelope = GroupEnvelope { message };
        let response = self
            .transport
            .put_envelope(&SendEnvelopeRequest::new(
                recipients.clone(),
                EnvelopeClass::Group,
                &envelope.encode(),
            ))
            .await?;
        Ok((response, recipients))
    }

    /// Decrypt a group envelope for a room. Without an inbound session a
    /// key request goes to the sender and the caller gets `PendingKey`.
    pub async fn recv_group(
        &mut self,
        group_id: &str,
        sender: &str,
        envelope: &GroupEnvelope,
    ) -> Result<GroupRecv, EngineError> {
        let session_id = envelope.message.session_id;
        match self.store.load_megolm_inbound(group_id, sender, &session_id).await? {
            None => {
                self.send_control(
                    sender,
                    InnerPayload::KeyRequest { group_id: group_id.to_string(), session_id },
                )
                .await?;
                tracing::info!(
                    event = "group_key_requested",
                    group_id = %group_id,
                    sender = %sender,
                    session_id = %hex::encode(session_id)
                );
                Ok(GroupRecv::PendingKey)
            }
            Some(mut inbound) => {
                let padded = inbound.decrypt(&envelope.message)?;
                self.store.save_megolm_inbound(group_id, sender, &inbound).await?;
                Ok(GroupRecv::Plaintext(codec::unpad(&padded)?))
            }
        }
    }

    /// A member joined: share the current chain state at its live index.
    /// Prior traffic stays unreadable to them.
    pub async fn handle_member_added(
        &mut self,
        group_id: &str,
        new_user: &str,
    ) -> Result<(), EngineError> {
        if let Some(outbound) = self.store.load_megolm_outbound(group_id).await? {
            let payload = InnerPayload::key_distribution(group_id, &outbound.export());
            self.send_control(new_user, payload).await?;
        }
        Ok(())
    }

    /// A member left or the server bumped the key version: discard the
    /// outbound session. The next send creates and redistributes a new one.
    pub async fn handle_member_removed(
        &mut self,
        group_id: &str,
        removed_user: &str,
    ) -> Result<(), EngineError> {
        self.store.delete_megolm_outbound(group_id).await?;
        tracing::info!(
            event = "group_session_discarded",
            group_id = %group_id,
            removed_user = %removed_user
        );
        Ok(())
    }

    /// Server push said the group key version changed.
    pub async fn handle_rekey(&mut self, group_id: &str) -> Result<(), EngineError> {
        self.store.delete_megolm_outbound(group_id).await?;
        Ok(())
    }

    /// Add a member via the registry, then share the current chain state.
    pub async fn add_member(&mut self, group_id: &str, user: &str) -> Result<(), EngineError> {
        self.transport
            .join_group(group_id, &JoinGroupRequest { user_id: user.to_string() })
            .await?;
        self.handle_member_added(group_id, user).await
    }

    /// Remove a member via the registry (key version bumps server-side)
    /// and discard the local outbound session.
    pub async fn remove_member(&mut self, group_id: &str, user: &str) -> Result<(), EngineError> {
        self.transport
            .leave_group(group_id, &JoinGroupRequest { user_id: user.to_string() })
            .await?;
        self.handle_member_removed(group_id, user).await
    }
}
