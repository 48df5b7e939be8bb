//! Participants of one session and the media resources they own.
//!
//! Owned by the session actor; nothing here is shared or locked. Engine
//! handles are only closed through [`CleanupSet::release`], which always
//! goes consumers, then producers, then transports.

use super::model::SessionAuthorization;
use crate::actors::connection::ConnectionActorHandle;
use crate::errors::SignalingError;
use crate::media::{MediaConsumer, MediaProducer, MediaTransport};
use crate::signaling::protocol::ServerEvent;
use chrono::{DateTime, Utc};
use common::types::{MediaKind, ParticipantRole, TransportDirection};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Checks a join claim against the appointment.
///
/// Doctors and patients must match the appointment's ids. Observers are
/// not admitted.
///
/// # Errors
///
/// `Unauthorized` when the claim does not match.
pub fn authorize_join(
    authorization: &SessionAuthorization,
    participant_id: &str,
    role: ParticipantRole,
) -> Result<(), SignalingError> {
    let allowed = match role {
        ParticipantRole::Doctor => authorization.doctor_id == participant_id,
        ParticipantRole::Patient => authorization.patient_id == participant_id,
        ParticipantRole::Observer => false,
    };

    if allowed {
        Ok(())
    } else {
        Err(SignalingError::Unauthorized(
            "Unauthorized access to this session".to_string(),
        ))
    }
}

#[derive(Debug)]
pub struct TransportEntry {
    pub transport: Arc<dyn MediaTransport>,
    pub direction: TransportDirection,
    pub created_at: Instant,
    pub connected: bool,
    /// A connect call is in flight.
    pub connecting: bool,
}

#[derive(Debug)]
pub struct ProducerEntry {
    pub producer: Arc<dyn MediaProducer>,
    pub transport_id: String,
}

#[derive(Debug)]
pub struct ConsumerEntry {
    pub consumer: Arc<dyn MediaConsumer>,
    pub transport_id: String,
    pub created_at: Instant,
    pub resumed: bool,
}

/// Engine handles detached from a participant, waiting to be closed.
#[derive(Debug, Default)]
pub struct CleanupSet {
    pub transports: Vec<Arc<dyn MediaTransport>>,
    pub producers: Vec<Arc<dyn MediaProducer>>,
    pub consumers: Vec<Arc<dyn MediaConsumer>>,
}

impl CleanupSet {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.transports.is_empty() && self.producers.is_empty() && self.consumers.is_empty()
    }

    #[must_use]
    pub fn producer_ids(&self) -> Vec<String> {
        self.producers.iter().map(|p| p.id().to_string()).collect()
    }

    pub fn extend(&mut self, other: CleanupSet) {
        self.transports.extend(other.transports);
        self.producers.extend(other.producers);
        self.consumers.extend(other.consumers);
    }

    /// Closes everything, consumers first.
    pub fn release(self) {
        for consumer in &self.consumers {
            consumer.close();
        }
        for producer in &self.producers {
            producer.close();
        }
        for transport in &self.transports {
            transport.close();
        }
    }
}

/// Where a participant is in media negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum NegotiationPhase {
    Joined,
    NegotiatingTransport,
    Streaming,
}

#[derive(Debug)]
pub struct Participant {
    pub participant_id: String,
    pub name: String,
    pub role: ParticipantRole,
    pub device_info: Option<Value>,
    pub joined_at: DateTime<Utc>,
    pub connection: ConnectionActorHandle,
    /// Child of the session token. Cancelled when the participant leaves.
    pub token: CancellationToken,
    pub audio_enabled: bool,
    pub video_enabled: bool,
    transports: HashMap<String, TransportEntry>,
    producers: HashMap<String, ProducerEntry>,
    consumers: HashMap<String, ConsumerEntry>,
}

impl Participant {
    #[must_use]
    pub fn new(
        participant_id: String,
        name: String,
        role: ParticipantRole,
        device_info: Option<Value>,
        connection: ConnectionActorHandle,
        token: CancellationToken,
    ) -> Self {
        Self {
            participant_id,
            name,
            role,
            device_info,
            joined_at: Utc::now(),
            connection,
            token,
            audio_enabled: true,
            video_enabled: true,
            transports: HashMap::new(),
            producers: HashMap::new(),
            consumers: HashMap::new(),
        }
    }

    #[must_use]
    pub fn connection_id(&self) -> &str {
        self.connection.connection_id()
    }

    /// Queue an event for this participant's client.
    pub fn send(&self, event: ServerEvent) -> bool {
        self.connection.deliver(event)
    }

    pub fn add_transport(
        &mut self,
        transport: Arc<dyn MediaTransport>,
        direction: TransportDirection,
    ) {
        self.transports.insert(
            transport.id().to_string(),
            TransportEntry {
                transport,
                direction,
                created_at: Instant::now(),
                connected: false,
                connecting: false,
            },
        );
    }

    #[must_use]
    pub fn transport(&self, transport_id: &str) -> Option<&TransportEntry> {
        self.transports.get(transport_id)
    }

    pub fn transport_mut(&mut self, transport_id: &str) -> Option<&mut TransportEntry> {
        self.transports.get_mut(transport_id)
    }

    /// Detaches a transport together with every producer and consumer on it.
    pub fn remove_transport(&mut self, transport_id: &str) -> Option<CleanupSet> {
        let entry = self.transports.remove(transport_id)?;
        let mut cleanup = CleanupSet::default();

        let producer_ids: Vec<String> = self
            .producers
            .iter()
            .filter(|(_, p)| p.transport_id == transport_id)
            .map(|(id, _)| id.clone())
            .collect();
        for id in producer_ids {
            if let Some(p) = self.producers.remove(&id) {
                cleanup.producers.push(p.producer);
            }
        }

        let consumer_ids: Vec<String> = self
            .consumers
            .iter()
            .filter(|(_, c)| c.transport_id == transport_id)
            .map(|(id, _)| id.clone())
            .collect();
        for id in consumer_ids {
            if let Some(c) = self.consumers.remove(&id) {
                cleanup.consumers.push(c.consumer);
            }
        }

        cleanup.transports.push(entry.transport);
        Some(cleanup)
    }

    pub fn add_producer(&mut self, producer: Arc<dyn MediaProducer>, transport_id: &str) {
        self.producers.insert(
            producer.id().to_string(),
            ProducerEntry {
                producer,
                transport_id: transport_id.to_string(),
            },
        );
    }

    #[must_use]
    pub fn producer(&self, producer_id: &str) -> Option<&ProducerEntry> {
        self.producers.get(producer_id)
    }

    pub fn producers(&self) -> impl Iterator<Item = &ProducerEntry> {
        self.producers.values()
    }

    pub fn add_consumer(&mut self, consumer: Arc<dyn MediaConsumer>, transport_id: &str) {
        self.consumers.insert(
            consumer.id().to_string(),
            ConsumerEntry {
                consumer,
                transport_id: transport_id.to_string(),
                created_at: Instant::now(),
                resumed: false,
            },
        );
    }

    #[must_use]
    pub fn consumer(&self, consumer_id: &str) -> Option<&ConsumerEntry> {
        self.consumers.get(consumer_id)
    }

    pub fn consumer_mut(&mut self, consumer_id: &str) -> Option<&mut ConsumerEntry> {
        self.consumers.get_mut(consumer_id)
    }

    /// Detaches every consumer of `producer_id`.
    pub fn remove_consumers_of(&mut self, producer_id: &str) -> Vec<Arc<dyn MediaConsumer>> {
        let ids: Vec<String> = self
            .consumers
            .iter()
            .filter(|(_, c)| c.consumer.producer_id() == producer_id)
            .map(|(id, _)| id.clone())
            .collect();
        ids.iter()
            .filter_map(|id| self.consumers.remove(id))
            .map(|c| c.consumer)
            .collect()
    }

    /// Detaches everything the participant owns.
    pub fn take_all(&mut self) -> CleanupSet {
        CleanupSet {
            transports: self.transports.drain().map(|(_, t)| t.transport).collect(),
            producers: self.producers.drain().map(|(_, p)| p.producer).collect(),
            consumers: self.consumers.drain().map(|(_, c)| c.consumer).collect(),
        }
    }

    /// Detaches transports never connected and consumers never resumed
    /// within `grace` of their creation.
    ///
    /// Transports with a connect call in flight are left alone.
    pub fn take_stale(&mut self, now: Instant, grace: Duration) -> CleanupSet {
        let expired = |created_at: Instant| now.saturating_duration_since(created_at) >= grace;

        let stale_transports: Vec<String> = self
            .transports
            .iter()
            .filter(|(_, t)| !t.connected && !t.connecting && expired(t.created_at))
            .map(|(id, _)| id.clone())
            .collect();

        let mut cleanup = CleanupSet::default();
        for id in stale_transports {
            if let Some(set) = self.remove_transport(&id) {
                cleanup.extend(set);
            }
        }

        let stale_consumers: Vec<String> = self
            .consumers
            .iter()
            .filter(|(_, c)| !c.resumed && expired(c.created_at))
            .map(|(id, _)| id.clone())
            .collect();
        for id in stale_consumers {
            if let Some(c) = self.consumers.remove(&id) {
                cleanup.consumers.push(c.consumer);
            }
        }

        cleanup
    }

    pub fn set_media_enabled(&mut self, kind: MediaKind, enabled: bool) {
        match kind {
            MediaKind::Audio => self.audio_enabled = enabled,
            MediaKind::Video => self.video_enabled = enabled,
        }
    }

    #[must_use]
    pub fn negotiation_phase(&self) -> NegotiationPhase {
        let streaming = !self.producers.is_empty() || self.consumers.values().any(|c| c.resumed);
        if streaming {
            NegotiationPhase::Streaming
        } else if self.transports.is_empty() {
            NegotiationPhase::Joined
        } else {
            NegotiationPhase::NegotiatingTransport
        }
    }

    #[must_use]
    pub fn info(&self) -> ParticipantInfo {
        ParticipantInfo {
            participant_id: self.participant_id.clone(),
            role: self.role,
            joined_at: self.joined_at,
            phase: self.negotiation_phase(),
            transports: self.transports.len(),
            producers: self.producers.len(),
            consumers: self.consumers.len(),
            audio_enabled: self.audio_enabled,
            video_enabled: self.video_enabled,
        }
    }
}

/// Operator view of a participant. Carries no names.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantInfo {
    pub participant_id: String,
    pub role: ParticipantRole,
    pub joined_at: DateTime<Utc>,
    pub phase: NegotiationPhase,
    pub transports: usize,
    pub producers: usize,
    pub consumers: usize,
    pub audio_enabled: bool,
    pub video_enabled: bool,
}

/// What is left of a participant after removal.
#[derive(Debug)]
pub struct RemovedParticipant {
    pub participant_id: String,
    pub name: String,
    pub role: ParticipantRole,
    pub connection: ConnectionActorHandle,
    pub cleanup: CleanupSet,
}

/// Participants keyed by connection id.
#[derive(Debug)]
pub struct ParticipantManager {
    participants: HashMap<String, Participant>,
    max_participants: usize,
}

impl ParticipantManager {
    #[must_use]
    pub fn new(max_participants: usize) -> Self {
        Self {
            participants: HashMap::new(),
            max_participants,
        }
    }

    /// # Errors
    ///
    /// `Conflict` if the connection or the participant id is already in the
    /// session, `SessionCapacityExceeded` at the participant cap.
    pub fn add_participant(&mut self, participant: Participant) -> Result<(), SignalingError> {
        let connection_id = participant.connection_id().to_string();

        if self.participants.contains_key(&connection_id) {
            return Err(SignalingError::Conflict(
                "Connection already joined this session".to_string(),
            ));
        }
        if self
            .participants
            .values()
            .any(|p| p.participant_id == participant.participant_id)
        {
            return Err(SignalingError::Conflict(
                "Participant is already connected to this session".to_string(),
            ));
        }
        if self.participants.len() >= self.max_participants {
            return Err(SignalingError::SessionCapacityExceeded(format!(
                "limit {}",
                self.max_participants
            )));
        }

        self.participants.insert(connection_id, participant);
        Ok(())
    }

    /// Removes the participant and detaches all of its resources.
    pub fn remove_participant(&mut self, connection_id: &str) -> Option<RemovedParticipant> {
        let mut participant = self.participants.remove(connection_id)?;
        participant.token.cancel();
        let cleanup = participant.take_all();

        Some(RemovedParticipant {
            participant_id: participant.participant_id,
            name: participant.name,
            role: participant.role,
            connection: participant.connection,
            cleanup,
        })
    }

    #[must_use]
    pub fn get(&self, connection_id: &str) -> Option<&Participant> {
        self.participants.get(connection_id)
    }

    pub fn get_mut(&mut self, connection_id: &str) -> Option<&mut Participant> {
        self.participants.get_mut(connection_id)
    }

    #[must_use]
    pub fn contains(&self, connection_id: &str) -> bool {
        self.participants.contains_key(connection_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.participants.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Participant> {
        self.participants.values()
    }

    /// Queue `event` for every participant except `except` (a connection id).
    pub fn broadcast(&self, event: &ServerEvent, except: Option<&str>) {
        for participant in self.participants.values() {
            if except != Some(participant.connection_id()) {
                participant.send(event.clone());
            }
        }
    }

    /// The participant owning `producer_id` and the producer entry.
    #[must_use]
    pub fn find_producer(&self, producer_id: &str) -> Option<(&Participant, &ProducerEntry)> {
        self.participants
            .values()
            .find_map(|p| p.producer(producer_id).map(|entry| (p, entry)))
    }

    /// Detaches every consumer of `producer_id`, in any participant.
    pub fn remove_consumers_of_producer(
        &mut self,
        producer_id: &str,
    ) -> Vec<(ConnectionActorHandle, Arc<dyn MediaConsumer>)> {
        self.participants
            .values_mut()
            .flat_map(|p| {
                let connection = p.connection.clone();
                p.remove_consumers_of(producer_id)
                    .into_iter()
                    .map(move |c| (connection.clone(), c))
            })
            .collect()
    }

    /// Removes every participant.
    pub fn drain_all(&mut self) -> Vec<RemovedParticipant> {
        let ids: Vec<String> = self.participants.keys().cloned().collect();
        ids.iter()
            .filter_map(|id| self.remove_participant(id))
            .collect()
    }

    /// Stale resources per participant, skipping participants with none.
    pub fn take_stale(
        &mut self,
        now: Instant,
        grace: Duration,
    ) -> Vec<(ConnectionActorHandle, CleanupSet)> {
        self.participants
            .values_mut()
            .filter_map(|p| {
                let set = p.take_stale(now, grace);
                (!set.is_empty()).then(|| (p.connection.clone(), set))
            })
            .collect()
    }

    #[must_use]
    pub fn infos(&self) -> Vec<ParticipantInfo> {
        let mut infos: Vec<ParticipantInfo> =
            self.participants.values().map(Participant::info).collect();
        infos.sort_by(|a, b| a.joined_at.cmp(&b.joined_at));
        infos
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::actors::connection::ConnectionActor;
    use crate::actors::metrics::ActorMetrics;
    use crate::media::loopback::LoopbackEngine;
    use crate::media::types::{
        DtlsFingerprint, DtlsParameters, RtpCapabilities, RtpCodecParameters, RtpParameters,
        WebRtcTransportOptions, WorkerSettings,
    };
    use crate::media::{codecs, MediaEngine, MediaRouter};
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::sync::mpsc;

    fn authorization() -> SessionAuthorization {
        SessionAuthorization {
            appointment_id: "appt-1".to_string(),
            patient_id: "patient-1".to_string(),
            doctor_id: "doctor-1".to_string(),
        }
    }

    fn participant(
        conn: &str,
        id: &str,
        role: ParticipantRole,
    ) -> (Participant, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(32);
        let (handle, _task) = ConnectionActor::spawn(
            conn.to_string(),
            tx,
            CancellationToken::new(),
            ActorMetrics::new(),
        );
        let p = Participant::new(
            id.to_string(),
            format!("name of {id}"),
            role,
            None,
            handle,
            CancellationToken::new(),
        );
        (p, rx)
    }

    fn options() -> WebRtcTransportOptions {
        WebRtcTransportOptions {
            listen_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            announced_ip: None,
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
            enable_sctp: true,
            initial_available_outgoing_bitrate: 1_000_000,
            min_outgoing_bitrate: 600_000,
            max_incoming_bitrate: 1_500_000,
            max_sctp_message_size: 262_144,
        }
    }

    async fn router() -> Arc<dyn MediaRouter> {
        let engine = LoopbackEngine::default();
        let worker = engine
            .create_worker(WorkerSettings {
                rtc_min_port: 10000,
                rtc_max_port: 10099,
            })
            .await
            .unwrap();
        worker.create_router(&codecs::media_codecs()).await.unwrap()
    }

    fn dtls() -> DtlsParameters {
        DtlsParameters {
            role: Some("client".to_string()),
            fingerprints: vec![DtlsFingerprint {
                algorithm: "sha-256".to_string(),
                value: "AA:BB".to_string(),
            }],
        }
    }

    fn opus() -> RtpParameters {
        RtpParameters {
            codecs: vec![RtpCodecParameters {
                mime_type: "audio/opus".to_string(),
                payload_type: 111,
                clock_rate: 48000,
                channels: Some(2),
                parameters: serde_json::Map::new(),
                rtcp_feedback: vec![],
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_authorize_join() {
        let auth = authorization();
        assert!(authorize_join(&auth, "doctor-1", ParticipantRole::Doctor).is_ok());
        assert!(authorize_join(&auth, "patient-1", ParticipantRole::Patient).is_ok());

        // Right id, wrong role
        assert!(authorize_join(&auth, "doctor-1", ParticipantRole::Patient).is_err());
        assert!(authorize_join(&auth, "someone", ParticipantRole::Doctor).is_err());

        let err = authorize_join(&auth, "doctor-1", ParticipantRole::Observer).unwrap_err();
        assert_eq!(err.error_code(), 2);
        assert_eq!(err.client_message(), "Unauthorized access to this session");
    }

    #[tokio::test]
    async fn test_add_participant_conflicts_and_capacity() {
        let mut manager = ParticipantManager::new(2);

        let (doctor, _rx1) = participant("conn-1", "doctor-1", ParticipantRole::Doctor);
        manager.add_participant(doctor).unwrap();

        let (same_conn, _rx2) = participant("conn-1", "patient-1", ParticipantRole::Patient);
        assert!(matches!(
            manager.add_participant(same_conn),
            Err(SignalingError::Conflict(_))
        ));

        let (same_id, _rx3) = participant("conn-9", "doctor-1", ParticipantRole::Doctor);
        assert!(matches!(
            manager.add_participant(same_id),
            Err(SignalingError::Conflict(_))
        ));

        let (patient, _rx4) = participant("conn-2", "patient-1", ParticipantRole::Patient);
        manager.add_participant(patient).unwrap();

        let (third, _rx5) = participant("conn-3", "patient-2", ParticipantRole::Patient);
        assert!(matches!(
            manager.add_participant(third),
            Err(SignalingError::SessionCapacityExceeded(_))
        ));
        assert_eq!(manager.len(), 2);
    }

    #[tokio::test]
    async fn test_broadcast_skips_sender() {
        let mut manager = ParticipantManager::new(4);
        let (doctor, mut doctor_rx) = participant("conn-1", "doctor-1", ParticipantRole::Doctor);
        let (patient, mut patient_rx) =
            participant("conn-2", "patient-1", ParticipantRole::Patient);
        manager.add_participant(doctor).unwrap();
        manager.add_participant(patient).unwrap();

        let event = ServerEvent::TransportClosed(crate::signaling::protocol::TransportIdPayload {
            transport_id: "t-1".to_string(),
        });
        manager.broadcast(&event, Some("conn-1"));

        assert_eq!(patient_rx.recv().await.unwrap(), event);
        assert!(doctor_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_remove_transport_takes_its_media() {
        let router = router().await;
        let (mut p, _rx) = participant("conn-1", "doctor-1", ParticipantRole::Doctor);

        let send = router.create_webrtc_transport(&options()).await.unwrap();
        let recv = router.create_webrtc_transport(&options()).await.unwrap();
        p.add_transport(Arc::clone(&send), TransportDirection::Send);
        p.add_transport(Arc::clone(&recv), TransportDirection::Recv);
        assert_eq!(p.negotiation_phase(), NegotiationPhase::NegotiatingTransport);

        send.connect(dtls()).await.unwrap();
        p.transport_mut(send.id()).unwrap().connected = true;
        let producer = send.produce(MediaKind::Audio, opus()).await.unwrap();
        p.add_producer(Arc::clone(&producer), send.id());
        assert_eq!(p.negotiation_phase(), NegotiationPhase::Streaming);

        let cleanup = p.remove_transport(send.id()).unwrap();
        assert_eq!(cleanup.transports.len(), 1);
        assert_eq!(cleanup.producer_ids(), vec![producer.id().to_string()]);
        assert!(p.producer(producer.id()).is_none());
        assert!(p.transport(recv.id()).is_some());
        assert!(p.remove_transport(send.id()).is_none());
    }

    #[tokio::test]
    async fn test_remove_consumers_of_producer_across_participants() {
        let router = router().await;
        let mut manager = ParticipantManager::new(4);
        let (mut doctor, _rx1) = participant("conn-1", "doctor-1", ParticipantRole::Doctor);
        let (mut patient, _rx2) = participant("conn-2", "patient-1", ParticipantRole::Patient);

        let send = router.create_webrtc_transport(&options()).await.unwrap();
        send.connect(dtls()).await.unwrap();
        let producer = send.produce(MediaKind::Audio, opus()).await.unwrap();
        doctor.add_transport(Arc::clone(&send), TransportDirection::Send);
        doctor.add_producer(Arc::clone(&producer), send.id());

        let recv = router.create_webrtc_transport(&options()).await.unwrap();
        let caps: RtpCapabilities = router.rtp_capabilities();
        let consumer = recv.consume(producer.id(), &caps, true).await.unwrap();
        patient.add_transport(Arc::clone(&recv), TransportDirection::Recv);
        patient.add_consumer(Arc::clone(&consumer), recv.id());

        manager.add_participant(doctor).unwrap();
        manager.add_participant(patient).unwrap();

        let (owner, _) = manager.find_producer(producer.id()).unwrap();
        assert_eq!(owner.participant_id, "doctor-1");

        let removed = manager.remove_consumers_of_producer(producer.id());
        assert_eq!(removed.len(), 1);
        assert_eq!(removed.first().unwrap().0.connection_id(), "conn-2");
        assert!(manager.get("conn-2").unwrap().consumer(consumer.id()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_take_stale_respects_grace_and_connection_state() {
        let router = router().await;
        let (mut p, _rx) = participant("conn-1", "doctor-1", ParticipantRole::Doctor);
        let grace = Duration::from_secs(30);

        let idle = router.create_webrtc_transport(&options()).await.unwrap();
        let connected = router.create_webrtc_transport(&options()).await.unwrap();
        let in_flight = router.create_webrtc_transport(&options()).await.unwrap();
        p.add_transport(Arc::clone(&idle), TransportDirection::Recv);
        p.add_transport(Arc::clone(&connected), TransportDirection::Send);
        p.add_transport(Arc::clone(&in_flight), TransportDirection::Send);
        p.transport_mut(connected.id()).unwrap().connected = true;
        p.transport_mut(in_flight.id()).unwrap().connecting = true;

        assert!(p.take_stale(Instant::now(), grace).is_empty());

        tokio::time::advance(grace).await;
        let stale = p.take_stale(Instant::now(), grace);
        assert_eq!(stale.transports.len(), 1);
        assert_eq!(stale.transports.first().unwrap().id(), idle.id());
        assert!(p.transport(connected.id()).is_some());
        assert!(p.transport(in_flight.id()).is_some());
    }

    #[tokio::test]
    async fn test_remove_participant_cancels_token_and_detaches() {
        let router = router().await;
        let mut manager = ParticipantManager::new(4);
        let (mut doctor, _rx) = participant("conn-1", "doctor-1", ParticipantRole::Doctor);
        let token = doctor.token.clone();
        let transport = router.create_webrtc_transport(&options()).await.unwrap();
        doctor.add_transport(transport, TransportDirection::Send);
        manager.add_participant(doctor).unwrap();

        let removed = manager.remove_participant("conn-1").unwrap();
        assert!(token.is_cancelled());
        assert_eq!(removed.participant_id, "doctor-1");
        assert_eq!(removed.cleanup.transports.len(), 1);
        assert!(manager.is_empty());
        assert!(manager.remove_participant("conn-1").is_none());
    }
}
