//! `SessionActor` - per-room actor owning session state.
//!
//! Each `SessionActor`:
//! - Owns the session lifecycle, its participants and the router lease
//! - Applies every event for its room in mailbox order
//! - Runs engine calls in spawned tasks and commits their results when the
//!   completion message comes back
//! - Sweeps stale negotiation resources and enforces the duration cap
//! - Finalizes exactly once: media released, router returned, everyone told
//!
//! A completion is committed only if its participant (and transport) are
//! still there; otherwise the fresh engine resource is closed on the spot.

use super::connection::ConnectionActorHandle;
use super::messages::{
    EndReason, EngineCompletion, JoinAccepted, JoinRequest, RegistryMessage, SessionMessage,
    SessionRequest, SessionState,
};
use super::metrics::{ActorType, MailboxMonitor};
use super::SessionServices;
use crate::audit::{AuditAction, AuditEvent, SYSTEM_ACTOR};
use crate::errors::SignalingError;
use crate::media::types::{DtlsParameters, RtpCapabilities, RtpParameters};
use crate::media::worker_pool::RouterLease;
use crate::media::{EngineError, MediaRouter, MediaTransport};
use crate::observability::metrics as prom;
use crate::session::model::{Session, SessionAuthorization};
use crate::session::participants::{authorize_join, CleanupSet, Participant, ParticipantManager};
use crate::session::records::{ChatMessage, VitalSigns, VitalSignsRecord};
use crate::side_channel::{Delivery, SideChannelCommit, SideChannelRouter};
use crate::signaling::protocol::{
    ConsumedPayload, ConsumerClosedPayload, ConsumerIdPayload, MediaChangedPayload,
    NewProducerPayload, ParticipantDisconnectedPayload, ParticipantJoinedPayload,
    ProducerIdPayload, ProducerStateChangedPayload, RecordingStatePayload, ServerEvent,
    SessionEndedPayload, TransportCreatedPayload, TransportIdPayload,
};

use chrono::Utc;
use common::types::{ChatMessageType, MediaKind, ParticipantRole, TransportDirection};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default channel buffer size for session mailbox.
const SESSION_CHANNEL_BUFFER: usize = 500;

/// Handle to a `SessionActor`.
#[derive(Clone, Debug)]
pub struct SessionActorHandle {
    room_id: String,
    instance_id: u64,
    sender: mpsc::Sender<SessionMessage>,
    cancel_token: CancellationToken,
}

impl SessionActorHandle {
    #[must_use]
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Distinguishes successive sessions of the same room.
    #[must_use]
    pub fn instance_id(&self) -> u64 {
        self.instance_id
    }

    /// Join a connection to the session.
    ///
    /// `SessionEnded` means the actor finished before handling the join;
    /// the caller may ask the registry again.
    pub async fn join(
        &self,
        request: JoinRequest,
        connection: ConnectionActorHandle,
    ) -> Result<JoinAccepted, SignalingError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(SessionMessage::Join {
                request,
                connection,
                respond_to: tx,
            })
            .await
            .map_err(|_| SignalingError::SessionEnded)?;

        rx.await.map_err(|_| SignalingError::SessionEnded)?
    }

    /// Submit a signaling request from a joined connection.
    pub async fn request(
        &self,
        connection_id: String,
        request: SessionRequest,
    ) -> Result<(), SignalingError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(SessionMessage::Request {
                connection_id,
                request,
                respond_to: tx,
            })
            .await
            .map_err(|_| SignalingError::SessionNotFound(self.room_id.clone()))?;

        rx.await
            .map_err(|_| SignalingError::SessionNotFound(self.room_id.clone()))?
    }

    /// Notify the session that a joined connection went away.
    pub async fn connection_closed(&self, connection_id: String) {
        if self
            .sender
            .send(SessionMessage::ConnectionClosed { connection_id })
            .await
            .is_err()
        {
            debug!(
                target: "sig.actor.session",
                room_id = %self.room_id,
                "Session already finished, disconnect ignored"
            );
        }
    }

    /// Get the current session state.
    pub async fn get_state(&self) -> Result<SessionState, SignalingError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(SessionMessage::GetState { respond_to: tx })
            .await
            .map_err(|_| SignalingError::SessionNotFound(self.room_id.clone()))?;

        rx.await
            .map_err(|_| SignalingError::SessionNotFound(self.room_id.clone()))
    }

    /// Cancel the actor. The session ends with reason `shutdown`.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// True once the session has ended or is ending.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// The `SessionActor` implementation.
pub struct SessionActor {
    session: Session,
    instance_id: u64,
    receiver: mpsc::Receiver<SessionMessage>,
    /// Given to engine tasks and the side channel. Weak, so pending work
    /// never keeps a finished session's mailbox open.
    self_sender: mpsc::WeakSender<SessionMessage>,
    registry: mpsc::Sender<RegistryMessage>,
    cancel_token: CancellationToken,
    participants: ParticipantManager,
    router: Arc<dyn MediaRouter>,
    /// Taken exactly once, on finalize.
    lease: Option<RouterLease>,
    side_channel: Option<SideChannelRouter>,
    services: SessionServices,
    /// Set while nobody is in the session.
    empty_since: Option<Instant>,
    finalized: bool,
    mailbox: MailboxMonitor,
}

impl SessionActor {
    /// Spawn a new session actor around `lease`.
    ///
    /// Returns a handle and the task join handle.
    pub fn spawn(
        room_id: String,
        instance_id: u64,
        authorization: SessionAuthorization,
        lease: RouterLease,
        services: SessionServices,
        registry: mpsc::Sender<RegistryMessage>,
        cancel_token: CancellationToken,
    ) -> (SessionActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(SESSION_CHANNEL_BUFFER);

        let (side_channel, _lane) = SideChannelRouter::spawn(
            room_id.clone(),
            authorization.patient_id.clone(),
            Arc::clone(&services.store),
            services.audit.clone(),
            sender.downgrade(),
        );

        let actor = Self {
            session: Session::new(room_id.clone(), authorization),
            instance_id,
            receiver,
            self_sender: sender.downgrade(),
            registry,
            cancel_token: cancel_token.clone(),
            participants: ParticipantManager::new(services.settings.max_participants),
            router: Arc::clone(lease.router()),
            lease: Some(lease),
            side_channel: Some(side_channel),
            empty_since: Some(Instant::now()),
            finalized: false,
            mailbox: MailboxMonitor::new(ActorType::Session, &room_id),
            services,
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = SessionActorHandle {
            room_id,
            instance_id,
            sender,
            cancel_token,
        };

        (handle, task_handle)
    }

    /// Run the actor message loop.
    #[instrument(
        skip_all,
        name = "sig.actor.session",
        fields(room_id = %self.session.room_id(), instance_id = self.instance_id)
    )]
    async fn run(mut self) {
        info!(
            target: "sig.actor.session",
            room_id = %self.session.room_id(),
            router_id = %self.router.id(),
            "SessionActor started"
        );

        let mut sweep = tokio::time::interval(self.services.settings.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "sig.actor.session",
                        room_id = %self.session.room_id(),
                        "SessionActor received cancellation signal"
                    );
                    self.finalize(EndReason::Shutdown);
                }

                _ = sweep.tick() => {
                    self.sweep();
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.observe(self.receiver.len());
                            self.handle_message(message);
                        }
                        None => {
                            info!(
                                target: "sig.actor.session",
                                room_id = %self.session.room_id(),
                                "SessionActor channel closed, exiting"
                            );
                            self.finalize(EndReason::Shutdown);
                        }
                    }
                }
            }

            if self.finalized {
                break;
            }
        }

        self.drain_mailbox();

        if self
            .registry
            .send(RegistryMessage::SessionFinalized {
                room_id: self.session.room_id().to_string(),
                instance_id: self.instance_id,
            })
            .await
            .is_err()
        {
            debug!(
                target: "sig.actor.session",
                room_id = %self.session.room_id(),
                "Registry gone before session finalized"
            );
        }

        info!(
            target: "sig.actor.session",
            room_id = %self.session.room_id(),
            messages_processed = self.mailbox.processed(),
            "SessionActor stopped"
        );
    }

    /// Answers whatever is still queued once the session is over.
    fn drain_mailbox(&mut self) {
        self.receiver.close();
        while let Ok(message) = self.receiver.try_recv() {
            match message {
                SessionMessage::Join { respond_to, .. } => {
                    let _ = respond_to.send(Err(SignalingError::SessionEnded));
                }
                SessionMessage::Request {
                    request: SessionRequest::EndSession,
                    respond_to,
                    ..
                } => {
                    let _ = respond_to.send(Ok(()));
                }
                SessionMessage::Request { respond_to, .. } => {
                    let _ = respond_to.send(Err(SignalingError::SessionNotFound(
                        self.session.room_id().to_string(),
                    )));
                }
                SessionMessage::GetState { respond_to } => {
                    let _ = respond_to.send(self.state());
                }
                SessionMessage::Completed(completion) => completion.discard(),
                SessionMessage::ConnectionClosed { .. }
                | SessionMessage::SideChannelCommitted(_)
                | SessionMessage::TransportClosed { .. } => {}
            }
        }
    }

    /// Handle a single message.
    fn handle_message(&mut self, message: SessionMessage) {
        match message {
            SessionMessage::Join {
                request,
                connection,
                respond_to,
            } => {
                let result = self.handle_join(request, connection);
                let _ = respond_to.send(result);
            }

            SessionMessage::Request {
                connection_id,
                request,
                respond_to,
            } => {
                let result = self.handle_request(&connection_id, request);
                let _ = respond_to.send(result);
            }

            SessionMessage::ConnectionClosed { connection_id } => {
                self.handle_disconnect(&connection_id);
            }

            SessionMessage::GetState { respond_to } => {
                let _ = respond_to.send(self.state());
            }

            SessionMessage::Completed(completion) => self.handle_completion(completion),

            SessionMessage::SideChannelCommitted(commit) => self.handle_commit(commit),

            SessionMessage::TransportClosed {
                connection_id,
                transport_id,
            } => self.handle_transport_closed(&connection_id, &transport_id),
        }
    }

    fn handle_join(
        &mut self,
        request: JoinRequest,
        connection: ConnectionActorHandle,
    ) -> Result<JoinAccepted, SignalingError> {
        if self.session.is_ended() {
            return Err(SignalingError::SessionEnded);
        }

        if let Err(e) = authorize_join(
            self.session.authorization(),
            &request.participant_id,
            request.role,
        ) {
            warn!(
                target: "sig.actor.session",
                room_id = %self.session.room_id(),
                participant_id = %request.participant_id,
                role = %request.role,
                "Join denied"
            );
            self.audit(
                &request.participant_id,
                AuditAction::JoinSession,
                false,
                json!({ "role": request.role, "reason": "not on appointment" }),
            );
            prom::record_join_denied("unauthorized");
            return Err(e);
        }

        let participant = Participant::new(
            request.participant_id.clone(),
            request.name.clone(),
            request.role,
            request.device_info.clone(),
            connection.clone(),
            self.cancel_token.child_token(),
        );
        self.participants.add_participant(participant)?;
        self.empty_since = None;

        // Joiner: capabilities, then who is here, then what they publish
        connection.deliver(ServerEvent::RouterCapabilities(self.router.rtp_capabilities()));
        let others: Vec<&Participant> = self
            .participants
            .iter()
            .filter(|p| p.connection_id() != connection.connection_id())
            .collect();
        for other in &others {
            connection.deliver(ServerEvent::ParticipantJoined(joined_payload(other)));
        }
        for other in &others {
            for entry in other.producers() {
                connection.deliver(ServerEvent::NewProducer(NewProducerPayload {
                    producer_id: entry.producer.id().to_string(),
                    participant_id: other.participant_id.clone(),
                    participant_name: other.name.clone(),
                    kind: entry.producer.kind(),
                }));
            }
        }

        let joined = ServerEvent::ParticipantJoined(ParticipantJoinedPayload {
            participant_id: request.participant_id.clone(),
            role: request.role,
            name: request.name,
            device_info: request.device_info,
        });
        self.participants
            .broadcast(&joined, Some(connection.connection_id()));

        if self.session.transition_if_ready(self.participants.len()) {
            info!(
                target: "sig.actor.session",
                room_id = %self.session.room_id(),
                "Session connected"
            );
            self.persist_status();
        }

        self.audit(
            &request.participant_id,
            AuditAction::JoinSession,
            true,
            json!({ "role": request.role }),
        );
        self.services.metrics.participant_joined();

        info!(
            target: "sig.actor.session",
            room_id = %self.session.room_id(),
            connection_id = %connection.connection_id(),
            participant_id = %request.participant_id,
            role = %request.role,
            participant_count = self.participants.len(),
            "Participant joined"
        );

        Ok(JoinAccepted {
            room_id: self.session.room_id().to_string(),
            participant_id: request.participant_id,
            status: self.session.status(),
        })
    }

    fn handle_request(
        &mut self,
        connection_id: &str,
        request: SessionRequest,
    ) -> Result<(), SignalingError> {
        if !self.participants.contains(connection_id) {
            return Err(SignalingError::ParticipantNotFound(
                "Not joined to this session".to_string(),
            ));
        }

        debug!(
            target: "sig.actor.session",
            room_id = %self.session.room_id(),
            connection_id = %connection_id,
            request = request.name(),
            "Handling request"
        );

        match request {
            SessionRequest::CreateTransport { direction } => {
                self.create_transport(connection_id, direction);
                Ok(())
            }
            SessionRequest::ConnectTransport {
                transport_id,
                dtls_parameters,
            } => self.connect_transport(connection_id, transport_id, dtls_parameters),
            SessionRequest::Produce {
                transport_id,
                kind,
                rtp_parameters,
            } => self.produce(connection_id, transport_id, kind, rtp_parameters),
            SessionRequest::Consume {
                transport_id,
                producer_id,
                rtp_capabilities,
            } => self.consume(connection_id, transport_id, producer_id, rtp_capabilities),
            SessionRequest::ResumeConsumer { consumer_id } => {
                self.resume_consumer(connection_id, consumer_id);
                Ok(())
            }
            SessionRequest::PauseProducer { producer_id } => {
                self.set_producer_paused(connection_id, producer_id, true)
            }
            SessionRequest::ResumeProducer { producer_id } => {
                self.set_producer_paused(connection_id, producer_id, false)
            }
            SessionRequest::CloseTransport { transport_id } => {
                self.close_transport(connection_id, &transport_id)
            }
            SessionRequest::Chat {
                message,
                message_type,
            } => self.chat(connection_id, message, message_type),
            SessionRequest::ShareVitals { vitals } => self.share_vitals(connection_id, vitals),
            SessionRequest::ToggleMedia { kind, enabled } => {
                self.toggle_media(connection_id, kind, enabled);
                Ok(())
            }
            SessionRequest::StartRecording => self.set_recording(connection_id, true),
            SessionRequest::StopRecording => self.set_recording(connection_id, false),
            SessionRequest::EndSession => {
                let by = self
                    .participants
                    .get(connection_id)
                    .map(|p| p.participant_id.clone())
                    .unwrap_or_default();
                self.finalize(EndReason::Requested { by });
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // Media negotiation
    // ------------------------------------------------------------------

    fn create_transport(&self, connection_id: &str, direction: TransportDirection) {
        let router = Arc::clone(&self.router);
        let options = self.services.settings.transport_options.clone();
        let connection_id = connection_id.to_string();
        self.spawn_engine_call("create_webrtc_transport", async move {
            let result = router.create_webrtc_transport(&options).await;
            EngineCompletion::TransportCreated {
                connection_id,
                direction,
                result,
            }
        });
    }

    fn connect_transport(
        &mut self,
        connection_id: &str,
        transport_id: String,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), SignalingError> {
        let entry = self
            .participants
            .get_mut(connection_id)
            .and_then(|p| p.transport_mut(&transport_id))
            .ok_or_else(|| SignalingError::TransportNotFound(transport_id.clone()))?;

        if entry.connected || entry.connecting {
            return Err(SignalingError::InvalidState(
                "Transport is already connected".to_string(),
            ));
        }
        entry.connecting = true;
        let transport = Arc::clone(&entry.transport);

        let connection_id = connection_id.to_string();
        self.spawn_engine_call("connect_transport", async move {
            let result = transport.connect(dtls_parameters).await;
            EngineCompletion::TransportConnected {
                connection_id,
                transport_id,
                result,
            }
        });
        Ok(())
    }

    fn produce(
        &self,
        connection_id: &str,
        transport_id: String,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<(), SignalingError> {
        let entry = self
            .participants
            .get(connection_id)
            .and_then(|p| p.transport(&transport_id))
            .ok_or_else(|| SignalingError::TransportNotFound(transport_id.clone()))?;

        if !entry.connected {
            return Err(SignalingError::InvalidState(
                "Transport is not connected".to_string(),
            ));
        }
        let transport = Arc::clone(&entry.transport);

        let connection_id = connection_id.to_string();
        self.spawn_engine_call("produce", async move {
            let result = transport.produce(kind, rtp_parameters).await;
            EngineCompletion::Produced {
                connection_id,
                transport_id,
                result,
            }
        });
        Ok(())
    }

    fn consume(
        &self,
        connection_id: &str,
        transport_id: String,
        producer_id: String,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<(), SignalingError> {
        let entry = self
            .participants
            .get(connection_id)
            .and_then(|p| p.transport(&transport_id))
            .ok_or_else(|| SignalingError::TransportNotFound(transport_id.clone()))?;

        if self.participants.find_producer(&producer_id).is_none()
            || !self.router.has_producer(&producer_id)
        {
            return Err(SignalingError::ProducerNotFound(producer_id));
        }
        if !self.router.can_consume(&producer_id, &rtp_capabilities) {
            return Err(SignalingError::CapabilityMismatch(format!(
                "cannot consume producer {producer_id}"
            )));
        }
        let transport = Arc::clone(&entry.transport);

        let connection_id = connection_id.to_string();
        self.spawn_engine_call("consume", async move {
            // Consumers start paused until the client is ready
            let result = transport.consume(&producer_id, &rtp_capabilities, true).await;
            EngineCompletion::Consumed {
                connection_id,
                transport_id,
                result,
            }
        });
        Ok(())
    }

    fn resume_consumer(&self, connection_id: &str, consumer_id: String) {
        let Some(participant) = self.participants.get(connection_id) else {
            return;
        };
        let Some(entry) = participant.consumer(&consumer_id) else {
            debug!(
                target: "sig.actor.session",
                room_id = %self.session.room_id(),
                connection_id = %connection_id,
                "Resume for unknown consumer ignored"
            );
            return;
        };
        if entry.resumed {
            participant.send(ServerEvent::ConsumerResumed(ConsumerIdPayload { consumer_id }));
            return;
        }
        let consumer = Arc::clone(&entry.consumer);

        let connection_id = connection_id.to_string();
        self.spawn_engine_call("resume_consumer", async move {
            let result = consumer.resume().await;
            EngineCompletion::ConsumerResumed {
                connection_id,
                consumer_id,
                result,
            }
        });
    }

    fn set_producer_paused(
        &self,
        connection_id: &str,
        producer_id: String,
        paused: bool,
    ) -> Result<(), SignalingError> {
        let Some(participant) = self.participants.get(connection_id) else {
            return Err(SignalingError::ParticipantNotFound(
                "Not joined to this session".to_string(),
            ));
        };
        let Some(entry) = participant.producer(&producer_id) else {
            if self.participants.find_producer(&producer_id).is_some() {
                return Err(SignalingError::PermissionDenied(
                    "Only the producer's owner can change it".to_string(),
                ));
            }
            return Err(SignalingError::ProducerNotFound(producer_id));
        };
        let producer = Arc::clone(&entry.producer);

        let connection_id = connection_id.to_string();
        let operation = if paused { "pause_producer" } else { "resume_producer" };
        self.spawn_engine_call(operation, async move {
            let result = if paused {
                producer.pause().await
            } else {
                producer.resume().await
            };
            EngineCompletion::ProducerPauseChanged {
                connection_id,
                producer_id,
                paused,
                result,
            }
        });
        Ok(())
    }

    fn close_transport(
        &mut self,
        connection_id: &str,
        transport_id: &str,
    ) -> Result<(), SignalingError> {
        let participant = self
            .participants
            .get_mut(connection_id)
            .ok_or_else(|| {
                SignalingError::ParticipantNotFound("Not joined to this session".to_string())
            })?;
        let cleanup = participant
            .remove_transport(transport_id)
            .ok_or_else(|| SignalingError::TransportNotFound(transport_id.to_string()))?;

        participant.send(ServerEvent::TransportClosed(TransportIdPayload {
            transport_id: transport_id.to_string(),
        }));
        self.release(cleanup);
        Ok(())
    }

    /// Runs an engine call off the actor and posts its completion back.
    fn spawn_engine_call<F>(&self, operation: &'static str, call: F)
    where
        F: Future<Output = EngineCompletion> + Send + 'static,
    {
        let sender = self.self_sender.clone();
        tokio::spawn(async move {
            let started = std::time::Instant::now();
            let completion = call.await;
            prom::record_engine_call(operation, completion.is_success(), started.elapsed());

            let Some(sender) = sender.upgrade() else {
                completion.discard();
                return;
            };
            if let Err(mpsc::error::SendError(SessionMessage::Completed(completion))) =
                sender.send(SessionMessage::Completed(completion)).await
            {
                completion.discard();
            }
        });
    }

    fn handle_completion(&mut self, completion: EngineCompletion) {
        match completion {
            EngineCompletion::TransportCreated {
                connection_id,
                direction,
                result,
            } => {
                let Some(participant) = self.participants.get_mut(&connection_id) else {
                    if let Ok(transport) = result {
                        transport.close();
                    }
                    return;
                };
                match result {
                    Ok(transport) => {
                        participant.add_transport(Arc::clone(&transport), direction);
                        participant.send(ServerEvent::TransportCreated(TransportCreatedPayload {
                            id: transport.id().to_string(),
                            ice_parameters: transport.ice_parameters(),
                            ice_candidates: transport.ice_candidates(),
                            dtls_parameters: transport.dtls_parameters(),
                            sctp_parameters: transport.sctp_parameters(),
                        }));
                    }
                    Err(e) => {
                        participant.send(engine_error_event(e));
                    }
                }
            }

            EngineCompletion::TransportConnected {
                connection_id,
                transport_id,
                result,
            } => {
                let Some(participant) = self.participants.get_mut(&connection_id) else {
                    return;
                };
                let Some(entry) = participant.transport_mut(&transport_id) else {
                    return;
                };
                entry.connecting = false;
                match result {
                    Ok(()) => {
                        entry.connected = true;
                        let transport = Arc::clone(&entry.transport);
                        let token = participant.token.clone();
                        participant.send(ServerEvent::TransportConnected(TransportIdPayload {
                            transport_id,
                        }));
                        self.watch_dtls(connection_id, transport, token);
                    }
                    Err(e) => {
                        participant.send(engine_error_event(e));
                    }
                }
            }

            EngineCompletion::Produced {
                connection_id,
                transport_id,
                result,
            } => {
                let owner = self
                    .participants
                    .get_mut(&connection_id)
                    .filter(|p| p.transport(&transport_id).is_some());
                let Some(participant) = owner else {
                    if let Ok(producer) = result {
                        producer.close();
                    }
                    return;
                };
                match result {
                    Ok(producer) => {
                        participant.add_producer(Arc::clone(&producer), &transport_id);
                        participant.send(ServerEvent::Produced(ProducerIdPayload {
                            producer_id: producer.id().to_string(),
                        }));
                        let announcement = ServerEvent::NewProducer(NewProducerPayload {
                            producer_id: producer.id().to_string(),
                            participant_id: participant.participant_id.clone(),
                            participant_name: participant.name.clone(),
                            kind: producer.kind(),
                        });
                        self.participants
                            .broadcast(&announcement, Some(&connection_id));
                    }
                    Err(e) => {
                        participant.send(engine_error_event(e));
                    }
                }
            }

            EngineCompletion::Consumed {
                connection_id,
                transport_id,
                result,
            } => {
                // The producer may have gone while the consumer was being created
                let producer_alive = match &result {
                    Ok(consumer) => self
                        .participants
                        .find_producer(consumer.producer_id())
                        .is_some(),
                    Err(_) => true,
                };
                let owner = self
                    .participants
                    .get_mut(&connection_id)
                    .filter(|p| p.transport(&transport_id).is_some());
                let Some(participant) = owner else {
                    if let Ok(consumer) = result {
                        consumer.close();
                    }
                    return;
                };
                match result {
                    Ok(consumer) if !producer_alive => {
                        consumer.close();
                        participant.send(ServerEvent::error(&SignalingError::ProducerNotFound(
                            consumer.producer_id().to_string(),
                        )));
                    }
                    Ok(consumer) => {
                        participant.add_consumer(Arc::clone(&consumer), &transport_id);
                        participant.send(ServerEvent::Consumed(ConsumedPayload {
                            consumer_id: consumer.id().to_string(),
                            producer_id: consumer.producer_id().to_string(),
                            kind: consumer.kind(),
                            rtp_parameters: consumer.rtp_parameters(),
                            consumer_type: consumer.consumer_type().to_string(),
                            producer_paused: consumer.producer_paused(),
                        }));
                    }
                    Err(e) => {
                        participant.send(engine_error_event(e));
                    }
                }
            }

            EngineCompletion::ConsumerResumed {
                connection_id,
                consumer_id,
                result,
            } => {
                let Some(participant) = self.participants.get_mut(&connection_id) else {
                    return;
                };
                let Some(entry) = participant.consumer_mut(&consumer_id) else {
                    return;
                };
                match result {
                    Ok(()) => {
                        entry.resumed = true;
                        participant.send(ServerEvent::ConsumerResumed(ConsumerIdPayload {
                            consumer_id,
                        }));
                    }
                    Err(e) => {
                        participant.send(engine_error_event(e));
                    }
                }
            }

            EngineCompletion::ProducerPauseChanged {
                connection_id,
                producer_id,
                paused,
                result,
            } => {
                let Some(participant) = self.participants.get(&connection_id) else {
                    return;
                };
                if participant.producer(&producer_id).is_none() {
                    return;
                }
                if let Err(e) = result {
                    participant.send(engine_error_event(e));
                    return;
                }

                let ack = ProducerIdPayload {
                    producer_id: producer_id.clone(),
                };
                participant.send(if paused {
                    ServerEvent::ProducerPaused(ack)
                } else {
                    ServerEvent::ProducerResumed(ack)
                });
                let changed = ServerEvent::ProducerStateChanged(ProducerStateChangedPayload {
                    producer_id,
                    participant_id: participant.participant_id.clone(),
                    paused,
                });
                self.participants.broadcast(&changed, Some(&connection_id));
            }
        }
    }

    /// Posts `TransportClosed` when DTLS on `transport` goes down, unless
    /// the participant leaves first.
    fn watch_dtls(
        &self,
        connection_id: String,
        transport: Arc<dyn MediaTransport>,
        participant_token: CancellationToken,
    ) {
        let sender = self.self_sender.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = participant_token.cancelled() => {}
                () = transport.dtls_closed() => {
                    if let Some(sender) = sender.upgrade() {
                        let _ = sender
                            .send(SessionMessage::TransportClosed {
                                connection_id,
                                transport_id: transport.id().to_string(),
                            })
                            .await;
                    }
                }
            }
        });
    }

    fn handle_transport_closed(&mut self, connection_id: &str, transport_id: &str) {
        let Some(participant) = self.participants.get_mut(connection_id) else {
            return;
        };
        // Already gone when we closed it ourselves
        let Some(cleanup) = participant.remove_transport(transport_id) else {
            return;
        };

        debug!(
            target: "sig.actor.session",
            room_id = %self.session.room_id(),
            connection_id = %connection_id,
            transport_id = %transport_id,
            "Transport DTLS closed"
        );
        participant.send(ServerEvent::TransportClosed(TransportIdPayload {
            transport_id: transport_id.to_string(),
        }));
        self.release(cleanup);
    }

    /// Closes `cleanup`, first detaching every consumer of its producers
    /// from the other participants and telling them.
    fn release(&mut self, cleanup: CleanupSet) {
        for producer_id in cleanup.producer_ids() {
            for (connection, consumer) in
                self.participants.remove_consumers_of_producer(&producer_id)
            {
                consumer.close();
                connection.deliver(ServerEvent::ConsumerClosed(ConsumerClosedPayload {
                    consumer_id: consumer.id().to_string(),
                    producer_id: producer_id.clone(),
                }));
            }
        }
        cleanup.release();
    }

    // ------------------------------------------------------------------
    // Side channel
    // ------------------------------------------------------------------

    fn chat(
        &self,
        connection_id: &str,
        text: String,
        message_type: ChatMessageType,
    ) -> Result<(), SignalingError> {
        let sender = self
            .participants
            .get(connection_id)
            .ok_or_else(|| {
                SignalingError::ParticipantNotFound("Not joined to this session".to_string())
            })?;
        let message = ChatMessage::new(
            self.session.room_id(),
            &sender.participant_id,
            &sender.name,
            text,
            message_type,
        )?;

        self.side_channel()?
            .submit_chat(message, self.delivery(connection_id))
    }

    fn share_vitals(&self, connection_id: &str, vitals: VitalSigns) -> Result<(), SignalingError> {
        let sender = self
            .participants
            .get(connection_id)
            .ok_or_else(|| {
                SignalingError::ParticipantNotFound("Not joined to this session".to_string())
            })?;

        if sender.role != ParticipantRole::Patient {
            self.audit(
                &sender.participant_id,
                AuditAction::ShareVitals,
                false,
                json!({ "role": sender.role, "reason": "not a patient" }),
            );
            return Err(SignalingError::PermissionDenied(
                "Only patients can share vital signs".to_string(),
            ));
        }
        vitals.validate()?;

        let record = VitalSignsRecord::new(
            self.session.room_id(),
            &sender.participant_id,
            &sender.name,
            vitals,
        );
        self.side_channel()?
            .submit_vitals(record, self.delivery(connection_id))
    }

    fn delivery(&self, sender_connection: &str) -> Delivery {
        Delivery {
            sender_connection: sender_connection.to_string(),
            recipients: self
                .participants
                .iter()
                .map(|p| p.connection_id().to_string())
                .collect(),
        }
    }

    fn side_channel(&self) -> Result<&SideChannelRouter, SignalingError> {
        self.side_channel.as_ref().ok_or(SignalingError::SessionEnded)
    }

    fn handle_commit(&mut self, commit: SideChannelCommit) {
        match commit {
            SideChannelCommit::Chat {
                message,
                delivery,
                result,
            } => match result {
                Ok(()) => self.deliver_to(&delivery.recipients, &ServerEvent::ChatMessage(message)),
                Err(e) => self.report_persist_failure("chat message", &delivery, &e.into()),
            },
            SideChannelCommit::Vitals {
                record,
                delivery,
                result,
            } => match result {
                Ok(()) => {
                    self.deliver_to(
                        &delivery.recipients,
                        &ServerEvent::VitalsShared(record.into()),
                    );
                }
                Err(e) => self.report_persist_failure("vital signs", &delivery, &e.into()),
            },
        }
    }

    /// Delivers to the recipients that are still in the session.
    fn deliver_to(&self, recipients: &[String], event: &ServerEvent) {
        for connection_id in recipients {
            if let Some(participant) = self.participants.get(connection_id) {
                participant.send(event.clone());
            }
        }
    }

    fn report_persist_failure(&self, what: &str, delivery: &Delivery, err: &SignalingError) {
        warn!(
            target: "sig.actor.session",
            room_id = %self.session.room_id(),
            connection_id = %delivery.sender_connection,
            error = %err,
            "Failed to persist {what}, not broadcast"
        );
        if let Some(sender) = self.participants.get(&delivery.sender_connection) {
            sender.send(ServerEvent::error(err));
        }
    }

    // ------------------------------------------------------------------
    // Session-level requests
    // ------------------------------------------------------------------

    fn toggle_media(&mut self, connection_id: &str, kind: MediaKind, enabled: bool) {
        let Some(participant) = self.participants.get_mut(connection_id) else {
            return;
        };
        participant.set_media_enabled(kind, enabled);
        let event = ServerEvent::ParticipantMediaChanged(MediaChangedPayload {
            participant_id: participant.participant_id.clone(),
            media_type: kind,
            enabled,
        });
        self.participants.broadcast(&event, Some(connection_id));
    }

    fn set_recording(
        &mut self,
        connection_id: &str,
        recording: bool,
    ) -> Result<(), SignalingError> {
        let participant = self
            .participants
            .get(connection_id)
            .ok_or_else(|| {
                SignalingError::ParticipantNotFound("Not joined to this session".to_string())
            })?;
        if participant.role != ParticipantRole::Doctor {
            return Err(SignalingError::PermissionDenied(
                "Only doctors can control recording".to_string(),
            ));
        }
        let changed_by = participant.participant_id.clone();

        if recording {
            self.session.start_recording()?;
        } else {
            self.session.stop_recording()?;
        }

        let event = ServerEvent::RecordingStateChanged(RecordingStatePayload {
            session_id: self.session.room_id().to_string(),
            recording,
            changed_by: changed_by.clone(),
        });
        self.participants.broadcast(&event, None);
        self.persist_status();

        let action = if recording {
            AuditAction::StartRecording
        } else {
            AuditAction::StopRecording
        };
        self.audit(&changed_by, action, true, json!({}));

        info!(
            target: "sig.actor.session",
            room_id = %self.session.room_id(),
            recording,
            "Recording state changed"
        );
        Ok(())
    }

    fn handle_disconnect(&mut self, connection_id: &str) {
        let Some(removed) = self.participants.remove_participant(connection_id) else {
            return;
        };
        self.release(removed.cleanup);

        let event = ServerEvent::ParticipantDisconnected(ParticipantDisconnectedPayload {
            participant_id: removed.participant_id.clone(),
            participant_name: removed.name,
        });
        self.participants.broadcast(&event, None);

        self.audit(
            &removed.participant_id,
            AuditAction::LeaveSession,
            true,
            json!({ "role": removed.role }),
        );
        self.services.metrics.participant_left();

        info!(
            target: "sig.actor.session",
            room_id = %self.session.room_id(),
            connection_id = %connection_id,
            participant_id = %removed.participant_id,
            remaining = self.participants.len(),
            "Participant left"
        );

        if self.participants.is_empty() {
            self.finalize(EndReason::LastParticipantLeft);
        }
    }

    /// Periodic housekeeping: duration cap, abandoned sessions and stale
    /// negotiation resources.
    fn sweep(&mut self) {
        let now = Instant::now();
        let grace = self.services.settings.negotiation_grace_period;

        if let Some(max) = self.services.settings.max_session_duration {
            if self.session.elapsed() >= max {
                warn!(
                    target: "sig.actor.session",
                    room_id = %self.session.room_id(),
                    max_seconds = max.as_secs(),
                    "Session exceeded maximum duration"
                );
                self.finalize(EndReason::DurationExceeded);
                return;
            }
        }

        if let Some(since) = self.empty_since {
            if now.saturating_duration_since(since) >= grace {
                self.finalize(EndReason::Abandoned);
            }
            return;
        }

        for (connection, cleanup) in self.participants.take_stale(now, grace) {
            for transport in &cleanup.transports {
                connection.deliver(ServerEvent::TransportClosed(TransportIdPayload {
                    transport_id: transport.id().to_string(),
                }));
            }
            for consumer in &cleanup.consumers {
                connection.deliver(ServerEvent::ConsumerClosed(ConsumerClosedPayload {
                    consumer_id: consumer.id().to_string(),
                    producer_id: consumer.producer_id().to_string(),
                }));
            }
            prom::record_stale_reclaimed("transport", cleanup.transports.len());
            prom::record_stale_reclaimed("consumer", cleanup.consumers.len());
            debug!(
                target: "sig.actor.session",
                room_id = %self.session.room_id(),
                connection_id = %connection.connection_id(),
                transports = cleanup.transports.len(),
                consumers = cleanup.consumers.len(),
                "Reclaimed stale negotiation resources"
            );
            self.release(cleanup);
        }
    }

    /// Ends the session. Runs once; later calls do nothing.
    fn finalize(&mut self, reason: EndReason) {
        if self.finalized {
            return;
        }
        self.finalized = true;
        self.session.end();

        let recipients: Vec<ConnectionActorHandle> = self
            .participants
            .iter()
            .map(|p| p.connection.clone())
            .collect();

        let mut cleanup = CleanupSet::default();
        for removed in self.participants.drain_all() {
            cleanup.extend(removed.cleanup);
            self.services.metrics.participant_left();
        }
        cleanup.release();

        if let Some(lease) = self.lease.take() {
            self.services.pool.release(lease);
        }

        let duration = self.session.elapsed();
        let ended = ServerEvent::SessionEnded(SessionEndedPayload {
            session_id: self.session.room_id().to_string(),
            end_time: self.session.ended_at().unwrap_or_else(Utc::now),
            duration: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        });
        for connection in &recipients {
            connection.deliver(ended.clone());
        }

        // Dropping the router lets the lane finish its queue and stop
        if let Some(side_channel) = self.side_channel.take() {
            side_channel.persist_status(self.session.status(), self.session.timestamps());
        }

        let actor_id = match &reason {
            EndReason::Requested { by } => by.clone(),
            _ => SYSTEM_ACTOR.to_string(),
        };
        self.audit(
            &actor_id,
            AuditAction::EndSession,
            true,
            json!({
                "reason": reason.as_str(),
                "durationMs": u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            }),
        );
        prom::record_session_ended(reason.as_str(), duration);

        self.cancel_token.cancel();

        info!(
            target: "sig.actor.session",
            room_id = %self.session.room_id(),
            reason = reason.as_str(),
            duration_secs = duration.as_secs(),
            notified = recipients.len(),
            "Session ended"
        );
    }

    fn persist_status(&self) {
        if let Some(side_channel) = &self.side_channel {
            side_channel.persist_status(self.session.status(), self.session.timestamps());
        }
    }

    /// Queues an audit record for this session. `details` gets the session id.
    fn audit(&self, actor_id: &str, action: AuditAction, success: bool, mut details: Value) {
        if let Value::Object(map) = &mut details {
            map.insert(
                "sessionId".to_string(),
                Value::String(self.session.room_id().to_string()),
            );
        }
        self.services.audit.emit(AuditEvent::new(
            actor_id,
            action,
            &self.session.authorization().patient_id,
            success,
            details,
        ));
    }

    fn state(&self) -> SessionState {
        SessionState {
            room_id: self.session.room_id().to_string(),
            appointment_id: self.session.authorization().appointment_id.clone(),
            status: self.session.status(),
            created_at: self.session.created_at(),
            connected_at: self.session.connected_at(),
            elapsed_ms: u64::try_from(self.session.elapsed().as_millis()).unwrap_or(u64::MAX),
            router_id: self.lease.as_ref().map(|l| l.router().id().to_string()),
            worker_id: self.lease.as_ref().map(|l| l.worker_id().to_string()),
            participants: self.participants.infos(),
        }
    }
}

fn joined_payload(participant: &Participant) -> ParticipantJoinedPayload {
    ParticipantJoinedPayload {
        participant_id: participant.participant_id.clone(),
        role: participant.role,
        name: participant.name.clone(),
        device_info: participant.device_info.clone(),
    }
}

/// Error event for a failed engine call. Capability and lookup failures
/// keep their own codes.
fn engine_error_event(err: EngineError) -> ServerEvent {
    let err = match err {
        EngineError::Incompatible(detail) => SignalingError::CapabilityMismatch(detail),
        EngineError::ProducerNotFound(id) => SignalingError::ProducerNotFound(id),
        other => SignalingError::from(other),
    };
    ServerEvent::error(&err)
}
