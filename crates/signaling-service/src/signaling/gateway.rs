//! Per-connection signaling state machine.
//!
//! One [`SignalingGateway`] sits behind every socket. It parses frames,
//! resolves the room through the registry and forwards requests to the
//! room's session actor. Results come back to the client through the
//! connection mailbox; the gateway only reports failures.
//!
//! ```text
//! Unjoined --join-session--> Joined --socket closed--> Left
//!    ^                          |
//!    +------ session ended -----+
//! ```

use crate::actors::{
    ActorMetrics, ConnectionActorHandle, JoinRequest, SessionActorHandle, SessionRegistryHandle,
    SessionRequest,
};
use crate::audit::{AuditAction, AuditEmitter, AuditEvent};
use crate::errors::SignalingError;
use crate::observability::metrics as prom;
use crate::session::participants::authorize_join;
use crate::signaling::protocol::{ClientEvent, JoinSessionPayload, ServerEvent};
use crate::storage::SessionDirectory;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// A join may race with the room's session ending. One retry picks up the
/// replacement session.
const JOIN_ATTEMPTS: usize = 2;

/// Shared collaborators for every gateway on this instance.
pub struct GatewayContext {
    pub registry: SessionRegistryHandle,
    pub directory: Arc<dyn SessionDirectory>,
    pub audit: AuditEmitter,
    pub metrics: Arc<ActorMetrics>,
}

/// Observable phase of a gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayPhase {
    Unjoined,
    Joined {
        room_id: String,
        participant_id: String,
    },
    Left,
}

enum Phase {
    Unjoined,
    Joined {
        room_id: String,
        participant_id: String,
        session: SessionActorHandle,
    },
    Left,
}

pub struct SignalingGateway {
    connection: ConnectionActorHandle,
    context: Arc<GatewayContext>,
    phase: Phase,
}

impl SignalingGateway {
    #[must_use]
    pub fn new(connection: ConnectionActorHandle, context: Arc<GatewayContext>) -> Self {
        Self {
            connection,
            context,
            phase: Phase::Unjoined,
        }
    }

    #[must_use]
    pub fn connection_id(&self) -> &str {
        self.connection.connection_id()
    }

    #[must_use]
    pub fn phase(&self) -> GatewayPhase {
        match &self.phase {
            Phase::Unjoined => GatewayPhase::Unjoined,
            Phase::Joined {
                room_id,
                participant_id,
                ..
            } => GatewayPhase::Joined {
                room_id: room_id.clone(),
                participant_id: participant_id.clone(),
            },
            Phase::Left => GatewayPhase::Left,
        }
    }

    /// Handles one text frame.
    pub async fn handle_text(&mut self, text: &str) {
        match ClientEvent::parse(text) {
            Ok(event) => self.handle_event(event).await,
            Err(e) => self.reject("unknown", &e),
        }
    }

    /// Handles one parsed event. Failures are sent to this connection only.
    #[instrument(
        skip_all,
        name = "sig.gateway.event",
        fields(connection_id = %self.connection.connection_id(), event = event.name())
    )]
    pub async fn handle_event(&mut self, event: ClientEvent) {
        let name = event.name();
        let start = Instant::now();

        let result = self.dispatch(event).await;
        prom::record_event_latency(name, start.elapsed());

        if let Err(e) = result {
            self.reject(name, &e);
        }
    }

    /// Reports a failed event to the client.
    pub fn reject(&self, event: &str, err: &SignalingError) {
        prom::record_signaling_error(event, err.error_type_label());
        match err {
            SignalingError::Internal(_) | SignalingError::WorkerFatal(_) => warn!(
                target: "sig.gateway",
                connection_id = %self.connection.connection_id(),
                event,
                error = %err,
                "Signaling event failed"
            ),
            _ => debug!(
                target: "sig.gateway",
                connection_id = %self.connection.connection_id(),
                event,
                error = %err,
                "Signaling event rejected"
            ),
        }
        self.connection.deliver(ServerEvent::error(err));
    }

    /// Socket closed. Idempotent.
    pub async fn disconnect(&mut self) {
        let phase = std::mem::replace(&mut self.phase, Phase::Left);
        if let Phase::Joined {
            room_id, session, ..
        } = phase
        {
            debug!(
                target: "sig.gateway",
                connection_id = %self.connection.connection_id(),
                room_id = %room_id,
                "Leaving session"
            );
            session
                .connection_closed(self.connection.connection_id().to_string())
                .await;
        }
    }

    async fn dispatch(&mut self, event: ClientEvent) -> Result<(), SignalingError> {
        self.forget_ended_session();

        if let ClientEvent::JoinSession(payload) = event {
            return self.join(payload).await;
        }

        let is_end = matches!(event, ClientEvent::EndSession(_));
        let Phase::Joined {
            room_id, session, ..
        } = &self.phase
        else {
            // Ending a session this connection is not in changes nothing
            if is_end {
                return Ok(());
            }
            return Err(SignalingError::ParticipantNotFound(
                "Join a session first".to_string(),
            ));
        };

        if event.session_id() != room_id.as_str() {
            return Err(SignalingError::SessionNotFound(event.session_id().to_string()));
        }

        let session = session.clone();
        let Some(request) = session_request(event) else {
            return Ok(());
        };

        match session
            .request(self.connection.connection_id().to_string(), request)
            .await
        {
            Ok(()) => Ok(()),
            Err(SignalingError::SessionNotFound(_) | SignalingError::SessionEnded) if is_end => {
                self.phase = Phase::Unjoined;
                Ok(())
            }
            Err(e @ (SignalingError::SessionNotFound(_) | SignalingError::SessionEnded)) => {
                self.phase = Phase::Unjoined;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    async fn join(&mut self, payload: JoinSessionPayload) -> Result<(), SignalingError> {
        match &self.phase {
            Phase::Joined { .. } => {
                return Err(SignalingError::Conflict(
                    "Connection already joined a session".to_string(),
                ))
            }
            Phase::Left => return Err(SignalingError::SessionEnded),
            Phase::Unjoined => {}
        }

        let room_id = payload.session_id;
        let authorization = self
            .context
            .directory
            .resolve_session_authorization(&room_id)
            .await?
            .ok_or_else(|| SignalingError::SessionNotFound(room_id.clone()))?;

        // Checked here so a denied join never allocates a router
        if let Err(e) = authorize_join(&authorization, &payload.participant_id, payload.role) {
            warn!(
                target: "sig.gateway",
                connection_id = %self.connection.connection_id(),
                room_id = %room_id,
                participant_id = %payload.participant_id,
                role = %payload.role,
                "Join denied"
            );
            self.context.audit.emit(AuditEvent::new(
                &payload.participant_id,
                AuditAction::JoinSession,
                &authorization.patient_id,
                false,
                json!({
                    "sessionId": room_id,
                    "role": payload.role,
                    "reason": "not on appointment"
                }),
            ));
            prom::record_join_denied("unauthorized");
            return Err(e);
        }

        let request = JoinRequest {
            participant_id: payload.participant_id,
            name: payload.name,
            role: payload.role,
            device_info: payload.device_info,
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            let session = self
                .context
                .registry
                .get_or_create(room_id.clone(), authorization.clone())
                .await?;

            match session.join(request.clone(), self.connection.clone()).await {
                Ok(accepted) => {
                    info!(
                        target: "sig.gateway",
                        connection_id = %self.connection.connection_id(),
                        room_id = %accepted.room_id,
                        participant_id = %accepted.participant_id,
                        status = %accepted.status,
                        "Joined session"
                    );
                    self.phase = Phase::Joined {
                        room_id: accepted.room_id,
                        participant_id: accepted.participant_id,
                        session,
                    };
                    return Ok(());
                }
                Err(SignalingError::SessionEnded) if attempt < JOIN_ATTEMPTS => {
                    debug!(
                        target: "sig.gateway",
                        room_id = %room_id,
                        "Session ended during join, retrying"
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// A session that finished (ended by a peer, timed out) drops this
    /// connection back to `Unjoined`.
    fn forget_ended_session(&mut self) {
        if let Phase::Joined { session, .. } = &self.phase {
            if session.is_cancelled() {
                self.phase = Phase::Unjoined;
            }
        }
    }
}

/// Maps a client event onto the session request it carries.
fn session_request(event: ClientEvent) -> Option<SessionRequest> {
    let request = match event {
        ClientEvent::JoinSession(_) => return None,
        ClientEvent::CreateTransport(p) => SessionRequest::CreateTransport {
            direction: p.direction,
        },
        ClientEvent::ConnectTransport(p) => SessionRequest::ConnectTransport {
            transport_id: p.transport_id,
            dtls_parameters: p.dtls_parameters,
        },
        ClientEvent::Produce(p) => SessionRequest::Produce {
            transport_id: p.transport_id,
            kind: p.kind,
            rtp_parameters: p.rtp_parameters,
        },
        ClientEvent::Consume(p) => SessionRequest::Consume {
            transport_id: p.transport_id,
            producer_id: p.producer_id,
            rtp_capabilities: p.rtp_capabilities,
        },
        ClientEvent::ResumeConsumer(p) => SessionRequest::ResumeConsumer {
            consumer_id: p.consumer_id,
        },
        ClientEvent::PauseProducer(p) => SessionRequest::PauseProducer {
            producer_id: p.producer_id,
        },
        ClientEvent::ResumeProducer(p) => SessionRequest::ResumeProducer {
            producer_id: p.producer_id,
        },
        ClientEvent::CloseTransport(p) => SessionRequest::CloseTransport {
            transport_id: p.transport_id,
        },
        ClientEvent::ChatMessage(p) => SessionRequest::Chat {
            message: p.message,
            message_type: p.message_type,
        },
        ClientEvent::ShareVitals(p) => SessionRequest::ShareVitals { vitals: p.vitals },
        ClientEvent::ToggleMedia(p) => SessionRequest::ToggleMedia {
            kind: p.media_type,
            enabled: p.enabled,
        },
        ClientEvent::StartRecording(_) => SessionRequest::StartRecording,
        ClientEvent::StopRecording(_) => SessionRequest::StopRecording,
        ClientEvent::EndSession(_) => SessionRequest::EndSession,
    };
    Some(request)
}
