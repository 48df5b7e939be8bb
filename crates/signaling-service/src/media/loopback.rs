//! In-process media engine.
//!
//! Implements the engine traits without moving any packets. Id allocation,
//! parameter validation, capability matching and resource lifecycle behave
//! like a real SFU; media does not flow. The binary runs on it until an
//! external SFU is wired in, and tests use its failure hooks to drive error
//! paths.

use crate::media::types::{
    DtlsFingerprint, DtlsParameters, IceCandidate, IceParameters, RtpCapabilities,
    RtpCodecCapability, RtpParameters, SctpParameters, WebRtcTransportOptions, WorkerSettings,
};
use crate::media::{
    EngineError, MediaConsumer, MediaEngine, MediaProducer, MediaRouter, MediaTransport,
    MediaWorker,
};
use async_trait::async_trait;
use common::types::MediaKind;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use uuid::Uuid;

const FIRST_DYNAMIC_PAYLOAD_TYPE: u8 = 100;
const SCTP_PORT: u16 = 5000;
const SCTP_STREAMS: u16 = 1024;
const UDP_CANDIDATE_PRIORITY: u32 = 1_076_302_079;
const TCP_CANDIDATE_PRIORITY: u32 = 1_076_276_479;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Consumes one pending failure, if any are scheduled.
fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[derive(Debug, Default)]
struct FailurePlan {
    routers: AtomicUsize,
    transports: AtomicUsize,
    connects: AtomicUsize,
    produces: AtomicUsize,
    consumes: AtomicUsize,
}

#[derive(Debug)]
struct PortRange {
    min: u16,
    span: u32,
    next: AtomicU32,
}

impl PortRange {
    fn new(settings: &WorkerSettings) -> Self {
        let span = u32::from(settings.rtc_max_port.saturating_sub(settings.rtc_min_port)) + 1;
        Self {
            min: settings.rtc_min_port,
            span,
            next: AtomicU32::new(0),
        }
    }

    fn allocate(&self) -> u16 {
        let offset = self.next.fetch_add(1, Ordering::Relaxed) % self.span;
        u16::try_from(u32::from(self.min) + offset).unwrap_or(self.min)
    }
}

#[derive(Debug, Clone)]
struct ProducerRecord {
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    paused: Arc<AtomicBool>,
}

type ProducerTable = Arc<Mutex<HashMap<String, ProducerRecord>>>;

/// Engine entry point. Keeps every worker it created so tests can reach
/// the concrete resources behind the trait objects.
#[derive(Debug, Default)]
pub struct LoopbackEngine {
    workers: Mutex<Vec<Arc<LoopbackWorker>>>,
    failures: Arc<FailurePlan>,
}

impl LoopbackEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn workers(&self) -> Vec<Arc<LoopbackWorker>> {
        lock(&self.workers).clone()
    }

    pub fn fail_next_router_creations(&self, count: usize) {
        self.failures.routers.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_transport_creations(&self, count: usize) {
        self.failures.transports.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_connects(&self, count: usize) {
        self.failures.connects.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_produces(&self, count: usize) {
        self.failures.produces.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_consumes(&self, count: usize) {
        self.failures.consumes.store(count, Ordering::SeqCst);
    }

    fn routers(&self) -> Vec<Arc<LoopbackRouter>> {
        self.workers()
            .iter()
            .flat_map(|worker| worker.routers())
            .collect()
    }

    /// Routers created and not yet closed, across all workers.
    #[must_use]
    pub fn open_routers(&self) -> usize {
        self.routers().iter().filter(|r| !r.is_closed()).count()
    }

    /// Total `close()` calls received by routers, across all workers.
    #[must_use]
    pub fn router_close_calls(&self) -> usize {
        self.routers().iter().map(|r| r.close_calls()).sum()
    }

    #[must_use]
    pub fn find_transport(&self, transport_id: &str) -> Option<Arc<LoopbackTransport>> {
        self.routers()
            .iter()
            .flat_map(|router| router.transports())
            .find(|t| t.id == transport_id)
    }

    #[must_use]
    pub fn find_producer(&self, producer_id: &str) -> Option<Arc<LoopbackProducer>> {
        self.routers()
            .iter()
            .flat_map(|router| router.transports())
            .flat_map(|t| t.producer_handles())
            .find(|p| p.id == producer_id)
    }

    #[must_use]
    pub fn find_consumer(&self, consumer_id: &str) -> Option<Arc<LoopbackConsumer>> {
        self.routers()
            .iter()
            .flat_map(|router| router.transports())
            .flat_map(|t| t.consumer_handles())
            .find(|c| c.id == consumer_id)
    }
}

#[async_trait]
impl MediaEngine for LoopbackEngine {
    async fn create_worker(
        &self,
        settings: WorkerSettings,
    ) -> Result<Arc<dyn MediaWorker>, EngineError> {
        if settings.rtc_max_port < settings.rtc_min_port {
            return Err(EngineError::InvalidParameters(format!(
                "empty port range {}-{}",
                settings.rtc_min_port, settings.rtc_max_port
            )));
        }
        let (death, _) = watch::channel(None);
        let worker = Arc::new(LoopbackWorker {
            id: new_id(),
            ports: Arc::new(PortRange::new(&settings)),
            settings,
            death,
            routers: Mutex::new(Vec::new()),
            failures: Arc::clone(&self.failures),
            closed: AtomicBool::new(false),
        });
        lock(&self.workers).push(Arc::clone(&worker));
        Ok(worker)
    }
}

#[derive(Debug)]
pub struct LoopbackWorker {
    id: String,
    settings: WorkerSettings,
    ports: Arc<PortRange>,
    death: watch::Sender<Option<String>>,
    routers: Mutex<Vec<Arc<LoopbackRouter>>>,
    failures: Arc<FailurePlan>,
    closed: AtomicBool,
}

impl LoopbackWorker {
    /// Simulates the worker process dying.
    pub fn kill(&self, reason: &str) {
        self.death.send_replace(Some(reason.to_string()));
    }

    #[must_use]
    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    #[must_use]
    pub fn routers(&self) -> Vec<Arc<LoopbackRouter>> {
        lock(&self.routers).clone()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn death_reason(&self) -> Option<String> {
        self.death.borrow().clone()
    }
}

#[async_trait]
impl MediaWorker for LoopbackWorker {
    fn id(&self) -> &str {
        &self.id
    }

    async fn create_router(
        &self,
        media_codecs: &[RtpCodecCapability],
    ) -> Result<Arc<dyn MediaRouter>, EngineError> {
        if let Some(reason) = self.death_reason() {
            return Err(EngineError::WorkerDied(reason));
        }
        if self.is_closed() {
            return Err(EngineError::InvalidState("worker closed".to_string()));
        }
        if take_failure(&self.failures.routers) {
            return Err(EngineError::Request("router creation failed".to_string()));
        }

        let codecs = media_codecs
            .iter()
            .enumerate()
            .map(|(index, codec)| {
                let mut codec = codec.clone();
                codec.preferred_payload_type = u8::try_from(index)
                    .ok()
                    .and_then(|i| FIRST_DYNAMIC_PAYLOAD_TYPE.checked_add(i));
                codec
            })
            .collect();

        let router = Arc::new(LoopbackRouter {
            id: new_id(),
            capabilities: RtpCapabilities {
                codecs,
                header_extensions: Vec::new(),
            },
            producers: Arc::new(Mutex::new(HashMap::new())),
            transports: Mutex::new(Vec::new()),
            ports: Arc::clone(&self.ports),
            death: self.death.subscribe(),
            failures: Arc::clone(&self.failures),
            closed: AtomicBool::new(false),
            close_calls: AtomicUsize::new(0),
        });
        lock(&self.routers).push(Arc::clone(&router));
        Ok(router)
    }

    async fn died(&self) -> String {
        let mut rx = self.death.subscribe();
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(reason) = current {
                return reason;
            }
            if rx.changed().await.is_err() {
                return std::future::pending().await;
            }
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub struct LoopbackRouter {
    id: String,
    capabilities: RtpCapabilities,
    producers: ProducerTable,
    transports: Mutex<Vec<Arc<LoopbackTransport>>>,
    ports: Arc<PortRange>,
    death: watch::Receiver<Option<String>>,
    failures: Arc<FailurePlan>,
    closed: AtomicBool,
    close_calls: AtomicUsize,
}

impl LoopbackRouter {
    #[must_use]
    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn transports(&self) -> Vec<Arc<LoopbackTransport>> {
        lock(&self.transports).clone()
    }
}

#[async_trait]
impl MediaRouter for LoopbackRouter {
    fn id(&self) -> &str {
        &self.id
    }

    fn rtp_capabilities(&self) -> RtpCapabilities {
        self.capabilities.clone()
    }

    fn has_producer(&self, producer_id: &str) -> bool {
        lock(&self.producers).contains_key(producer_id)
    }

    fn can_consume(&self, producer_id: &str, rtp_capabilities: &RtpCapabilities) -> bool {
        let producers = lock(&self.producers);
        let Some(record) = producers.get(producer_id) else {
            return false;
        };
        record
            .rtp_parameters
            .primary_codec()
            .is_some_and(|codec| rtp_capabilities.supports(record.kind, &codec.mime_type))
    }

    async fn create_webrtc_transport(
        &self,
        options: &WebRtcTransportOptions,
    ) -> Result<Arc<dyn MediaTransport>, EngineError> {
        let death_reason = self.death.borrow().clone();
        if let Some(reason) = death_reason {
            return Err(EngineError::WorkerDied(reason));
        }
        if self.is_closed() {
            return Err(EngineError::RouterClosed);
        }
        if take_failure(&self.failures.transports) {
            return Err(EngineError::Request("transport creation failed".to_string()));
        }

        let port = self.ports.allocate();
        let transport = Arc::new(LoopbackTransport::new(
            options,
            port,
            Arc::clone(&self.producers),
            self.capabilities.clone(),
            Arc::clone(&self.failures),
        ));
        lock(&self.transports).push(Arc::clone(&transport));
        Ok(transport)
    }

    fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

fn fake_fingerprint() -> String {
    let first = Uuid::new_v4();
    let second = Uuid::new_v4();
    first
        .as_bytes()
        .iter()
        .chain(second.as_bytes().iter())
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

#[derive(Debug)]
pub struct LoopbackTransport {
    id: String,
    ice_parameters: IceParameters,
    ice_candidates: Vec<IceCandidate>,
    dtls_parameters: DtlsParameters,
    sctp_parameters: Option<SctpParameters>,
    router_producers: ProducerTable,
    router_capabilities: RtpCapabilities,
    failures: Arc<FailurePlan>,
    connected: AtomicBool,
    /// Flips to true on close or DTLS failure.
    dtls_down: watch::Sender<bool>,
    producers: Mutex<Vec<Arc<LoopbackProducer>>>,
    consumers: Mutex<Vec<Arc<LoopbackConsumer>>>,
    next_mid: AtomicUsize,
}

impl LoopbackTransport {
    fn new(
        options: &WebRtcTransportOptions,
        port: u16,
        router_producers: ProducerTable,
        router_capabilities: RtpCapabilities,
        failures: Arc<FailurePlan>,
    ) -> Self {
        let address = options
            .announced_ip
            .clone()
            .unwrap_or_else(|| options.listen_ip.to_string());

        let mut ice_candidates = Vec::new();
        if options.enable_udp {
            ice_candidates.push(IceCandidate {
                foundation: "udpcandidate".to_string(),
                priority: UDP_CANDIDATE_PRIORITY,
                address: address.clone(),
                protocol: "udp".to_string(),
                port,
                candidate_type: "host".to_string(),
            });
        }
        if options.enable_tcp {
            ice_candidates.push(IceCandidate {
                foundation: "tcpcandidate".to_string(),
                priority: TCP_CANDIDATE_PRIORITY,
                address,
                protocol: "tcp".to_string(),
                port,
                candidate_type: "host".to_string(),
            });
        }

        let sctp_parameters = options.enable_sctp.then(|| SctpParameters {
            port: SCTP_PORT,
            os: SCTP_STREAMS,
            mis: SCTP_STREAMS,
            max_message_size: options.max_sctp_message_size,
        });

        let ufrag = Uuid::new_v4().simple().to_string();
        let (dtls_down, _) = watch::channel(false);

        Self {
            id: new_id(),
            ice_parameters: IceParameters {
                username_fragment: ufrag.get(..16).unwrap_or(&ufrag).to_string(),
                password: Uuid::new_v4().simple().to_string(),
                ice_lite: true,
            },
            ice_candidates,
            dtls_parameters: DtlsParameters {
                role: Some("auto".to_string()),
                fingerprints: vec![DtlsFingerprint {
                    algorithm: "sha-256".to_string(),
                    value: fake_fingerprint(),
                }],
            },
            sctp_parameters,
            router_producers,
            router_capabilities,
            failures,
            connected: AtomicBool::new(false),
            dtls_down,
            producers: Mutex::new(Vec::new()),
            consumers: Mutex::new(Vec::new()),
            next_mid: AtomicUsize::new(0),
        }
    }

    /// Simulates the DTLS session failing (peer vanished, network loss).
    pub fn fail_dtls(&self) {
        self.dtls_down.send_replace(true);
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.dtls_down.borrow()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn producer_handles(&self) -> Vec<Arc<LoopbackProducer>> {
        lock(&self.producers).clone()
    }

    #[must_use]
    pub fn consumer_handles(&self) -> Vec<Arc<LoopbackConsumer>> {
        lock(&self.consumers).clone()
    }
}

#[async_trait]
impl MediaTransport for LoopbackTransport {
    fn id(&self) -> &str {
        &self.id
    }

    fn ice_parameters(&self) -> IceParameters {
        self.ice_parameters.clone()
    }

    fn ice_candidates(&self) -> Vec<IceCandidate> {
        self.ice_candidates.clone()
    }

    fn dtls_parameters(&self) -> DtlsParameters {
        self.dtls_parameters.clone()
    }

    fn sctp_parameters(&self) -> Option<SctpParameters> {
        self.sctp_parameters.clone()
    }

    async fn connect(&self, dtls_parameters: DtlsParameters) -> Result<(), EngineError> {
        if self.is_closed() {
            return Err(EngineError::TransportClosed);
        }
        if take_failure(&self.failures.connects) {
            return Err(EngineError::Request("DTLS handshake failed".to_string()));
        }
        if dtls_parameters.fingerprints.is_empty() {
            return Err(EngineError::InvalidParameters(
                "missing DTLS fingerprints".to_string(),
            ));
        }
        if self.connected.swap(true, Ordering::SeqCst) {
            return Err(EngineError::InvalidState(
                "transport already connected".to_string(),
            ));
        }
        Ok(())
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Arc<dyn MediaProducer>, EngineError> {
        if self.is_closed() {
            return Err(EngineError::TransportClosed);
        }
        if !self.is_connected() {
            return Err(EngineError::InvalidState(
                "transport not connected".to_string(),
            ));
        }
        if take_failure(&self.failures.produces) {
            return Err(EngineError::Request("producer creation failed".to_string()));
        }
        let Some(codec) = rtp_parameters.primary_codec() else {
            return Err(EngineError::InvalidParameters(
                "rtpParameters has no codecs".to_string(),
            ));
        };
        if !kind.matches_mime_type(&codec.mime_type) {
            return Err(EngineError::InvalidParameters(format!(
                "{} codec for {kind} producer",
                codec.mime_type
            )));
        }
        if !self.router_capabilities.supports(kind, &codec.mime_type) {
            return Err(EngineError::Incompatible(codec.mime_type.clone()));
        }

        let paused = Arc::new(AtomicBool::new(false));
        let producer = Arc::new(LoopbackProducer {
            id: new_id(),
            kind,
            paused: Arc::clone(&paused),
            router_producers: Arc::clone(&self.router_producers),
            closed: AtomicBool::new(false),
        });
        lock(&self.router_producers).insert(
            producer.id.clone(),
            ProducerRecord {
                kind,
                rtp_parameters,
                paused,
            },
        );
        lock(&self.producers).push(Arc::clone(&producer));
        Ok(producer)
    }

    async fn consume(
        &self,
        producer_id: &str,
        rtp_capabilities: &RtpCapabilities,
        paused: bool,
    ) -> Result<Arc<dyn MediaConsumer>, EngineError> {
        if self.is_closed() {
            return Err(EngineError::TransportClosed);
        }
        if take_failure(&self.failures.consumes) {
            return Err(EngineError::Request("consumer creation failed".to_string()));
        }
        let record = lock(&self.router_producers)
            .get(producer_id)
            .cloned()
            .ok_or_else(|| EngineError::ProducerNotFound(producer_id.to_string()))?;

        let mime_type = record
            .rtp_parameters
            .primary_codec()
            .map(|codec| codec.mime_type.clone())
            .unwrap_or_default();
        if !rtp_capabilities.supports(record.kind, &mime_type) {
            return Err(EngineError::Incompatible(mime_type));
        }

        let mut rtp_parameters = record.rtp_parameters.clone();
        rtp_parameters.mid = Some(self.next_mid.fetch_add(1, Ordering::Relaxed).to_string());

        let consumer = Arc::new(LoopbackConsumer {
            id: new_id(),
            producer_id: producer_id.to_string(),
            kind: record.kind,
            rtp_parameters,
            paused: AtomicBool::new(paused),
            producer_paused: Arc::clone(&record.paused),
            closed: AtomicBool::new(false),
        });
        lock(&self.consumers).push(Arc::clone(&consumer));
        Ok(consumer)
    }

    async fn dtls_closed(&self) {
        let mut rx = self.dtls_down.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            // The sender lives in `self`, so this only fails on teardown.
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    fn close(&self) {
        self.dtls_down.send_replace(true);
    }
}

#[derive(Debug)]
pub struct LoopbackProducer {
    id: String,
    kind: MediaKind,
    paused: Arc<AtomicBool>,
    router_producers: ProducerTable,
    closed: AtomicBool,
}

impl LoopbackProducer {
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaProducer for LoopbackProducer {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    async fn pause(&self) -> Result<(), EngineError> {
        if self.is_closed() {
            return Err(EngineError::InvalidState("producer closed".to_string()));
        }
        self.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn resume(&self) -> Result<(), EngineError> {
        if self.is_closed() {
            return Err(EngineError::InvalidState("producer closed".to_string()));
        }
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            lock(&self.router_producers).remove(&self.id);
        }
    }
}

#[derive(Debug)]
pub struct LoopbackConsumer {
    id: String,
    producer_id: String,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    paused: AtomicBool,
    producer_paused: Arc<AtomicBool>,
    closed: AtomicBool,
}

impl LoopbackConsumer {
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaConsumer for LoopbackConsumer {
    fn id(&self) -> &str {
        &self.id
    }

    fn producer_id(&self) -> &str {
        &self.producer_id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> RtpParameters {
        self.rtp_parameters.clone()
    }

    fn consumer_type(&self) -> &str {
        "simple"
    }

    fn paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn producer_paused(&self) -> bool {
        self.producer_paused.load(Ordering::SeqCst)
    }

    async fn resume(&self) -> Result<(), EngineError> {
        if self.is_closed() {
            return Err(EngineError::InvalidState("consumer closed".to_string()));
        }
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
