//! `SessionRegistryActor` - singleton supervisor for session actors.
//!
//! The `SessionRegistryActor` is the top-level actor of the service:
//!
//! - Singleton per instance
//! - Maps room ids to live `SessionActor`s, creating them on first join
//! - Coalesces concurrent creations for the same room into one router
//! - Owns the root `CancellationToken` for graceful shutdown
//! - Monitors child actor health (panic detection via `JoinHandle`)
//!
//! Router creation runs off the actor; the result comes back as
//! `RouterAcquired`, so a slow engine never stalls lookups for other rooms.
//!
//! # Graceful Shutdown
//!
//! On SIGTERM, the registry:
//! 1. Sets `accepting_new = false`
//! 2. Cancels every session (each notifies its participants and releases its router)
//! 3. Waits for the session tasks, up to the deadline

use super::messages::{RegistryMessage, RegistryStatus};
use super::metrics::{ActorType, MailboxMonitor};
use super::session::{SessionActor, SessionActorHandle};
use super::SessionServices;
use crate::errors::SignalingError;
use crate::media::worker_pool::RouterLease;
use crate::media::EngineError;
use crate::session::model::SessionAuthorization;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Default channel buffer size for the registry mailbox.
const REGISTRY_CHANNEL_BUFFER: usize = 1000;

/// How long shutdown on cancellation waits for sessions to finish.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

type CreateWaiter = oneshot::Sender<Result<SessionActorHandle, SignalingError>>;

/// Handle to the `SessionRegistryActor`.
///
/// This is the public interface for interacting with the registry.
#[derive(Clone, Debug)]
pub struct SessionRegistryHandle {
    sender: mpsc::Sender<RegistryMessage>,
    cancel_token: CancellationToken,
}

impl SessionRegistryHandle {
    /// Create a new `SessionRegistryActor` and return a handle to it.
    ///
    /// `fatal` is cancelled if router creation reports a dead worker.
    #[must_use]
    pub fn new(
        instance_id: String,
        services: SessionServices,
        max_sessions: usize,
        fatal: CancellationToken,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(REGISTRY_CHANNEL_BUFFER);
        let cancel_token = CancellationToken::new();

        let actor = SessionRegistryActor {
            mailbox: MailboxMonitor::new(ActorType::Registry, &instance_id),
            instance_id,
            receiver,
            self_sender: sender.downgrade(),
            cancel_token: cancel_token.clone(),
            sessions: HashMap::new(),
            pending: HashMap::new(),
            accepting_new: true,
            max_sessions,
            services,
            fatal,
            next_instance_id: 0,
        };

        tokio::spawn(actor.run());

        Self {
            sender,
            cancel_token,
        }
    }

    /// Return the live session for `room_id`, creating it if needed.
    ///
    /// Concurrent callers for the same room share one creation.
    pub async fn get_or_create(
        &self,
        room_id: String,
        authorization: SessionAuthorization,
    ) -> Result<SessionActorHandle, SignalingError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::GetOrCreate {
                room_id,
                authorization,
                respond_to: tx,
            })
            .await
            .map_err(|e| SignalingError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SignalingError::Internal(format!("response receive failed: {e}")))?
    }

    /// Look up a live session without creating one.
    pub async fn get(&self, room_id: String) -> Result<Option<SessionActorHandle>, SignalingError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::Get {
                room_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| SignalingError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SignalingError::Internal(format!("response receive failed: {e}")))
    }

    /// Handles of every live session.
    pub async fn list(&self) -> Result<Vec<SessionActorHandle>, SignalingError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::List { respond_to: tx })
            .await
            .map_err(|e| SignalingError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SignalingError::Internal(format!("response receive failed: {e}")))
    }

    /// Get the current registry status.
    pub async fn get_status(&self) -> Result<RegistryStatus, SignalingError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::GetStatus { respond_to: tx })
            .await
            .map_err(|e| SignalingError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SignalingError::Internal(format!("response receive failed: {e}")))
    }

    /// Stop accepting sessions and end every live one.
    ///
    /// Returns once all sessions have finished or `deadline` passed.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), SignalingError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::Shutdown {
                deadline,
                respond_to: tx,
            })
            .await
            .map_err(|e| SignalingError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SignalingError::Internal(format!("response receive failed: {e}")))?
    }

    /// Cancel the actor (for immediate shutdown).
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// Internal state for a managed session.
struct ManagedSession {
    handle: SessionActorHandle,
    /// Join handle for monitoring the actor task.
    task_handle: JoinHandle<()>,
    created_at: Instant,
}

/// The `SessionRegistryActor` implementation.
pub struct SessionRegistryActor {
    instance_id: String,
    receiver: mpsc::Receiver<RegistryMessage>,
    /// Upgraded when spawning sessions and router acquisitions.
    self_sender: mpsc::WeakSender<RegistryMessage>,
    /// Cancellation token (root).
    cancel_token: CancellationToken,
    sessions: HashMap<String, ManagedSession>,
    /// Rooms whose router is being created, with everyone waiting on it.
    pending: HashMap<String, Vec<CreateWaiter>>,
    accepting_new: bool,
    max_sessions: usize,
    services: SessionServices,
    fatal: CancellationToken,
    next_instance_id: u64,
    mailbox: MailboxMonitor,
}

impl SessionRegistryActor {
    /// Run the actor message loop.
    #[instrument(skip_all, name = "sig.actor.registry", fields(instance_id = %self.instance_id))]
    async fn run(mut self) {
        info!(
            target: "sig.actor.registry",
            instance_id = %self.instance_id,
            max_sessions = self.max_sessions,
            "SessionRegistryActor started"
        );

        loop {
            // Check for terminated session actors
            self.check_session_health().await;

            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "sig.actor.registry",
                        instance_id = %self.instance_id,
                        "SessionRegistryActor received cancellation signal"
                    );
                    self.graceful_shutdown(SHUTDOWN_DEADLINE).await;
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.observe(self.receiver.len());
                            self.handle_message(message).await;
                        }
                        None => {
                            info!(
                                target: "sig.actor.registry",
                                instance_id = %self.instance_id,
                                "SessionRegistryActor channel closed, exiting"
                            );
                            self.graceful_shutdown(SHUTDOWN_DEADLINE).await;
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "sig.actor.registry",
            instance_id = %self.instance_id,
            sessions_remaining = self.sessions.len(),
            messages_processed = self.mailbox.processed(),
            "SessionRegistryActor stopped"
        );
    }

    /// Handle a single message.
    async fn handle_message(&mut self, message: RegistryMessage) {
        match message {
            RegistryMessage::GetOrCreate {
                room_id,
                authorization,
                respond_to,
            } => self.get_or_create(room_id, authorization, respond_to),

            RegistryMessage::Get {
                room_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.live(&room_id).cloned());
            }

            RegistryMessage::List { respond_to } => {
                let handles = self
                    .sessions
                    .values()
                    .filter(|m| !m.handle.is_cancelled())
                    .map(|m| m.handle.clone())
                    .collect();
                let _ = respond_to.send(handles);
            }

            RegistryMessage::GetStatus { respond_to } => {
                let _ = respond_to.send(self.get_status());
            }

            RegistryMessage::Shutdown {
                deadline,
                respond_to,
            } => {
                self.graceful_shutdown(deadline).await;
                let _ = respond_to.send(Ok(()));
            }

            RegistryMessage::RouterAcquired {
                room_id,
                authorization,
                result,
            } => self.router_acquired(room_id, authorization, result),

            RegistryMessage::SessionFinalized {
                room_id,
                instance_id,
            } => self.session_finalized(&room_id, instance_id),
        }
    }

    fn live(&self, room_id: &str) -> Option<&SessionActorHandle> {
        self.sessions
            .get(room_id)
            .map(|m| &m.handle)
            .filter(|h| !h.is_cancelled())
    }

    fn get_or_create(
        &mut self,
        room_id: String,
        authorization: SessionAuthorization,
        respond_to: CreateWaiter,
    ) {
        if let Some(handle) = self.live(&room_id) {
            let _ = respond_to.send(Ok(handle.clone()));
            return;
        }

        // An ended session still registered: a new one replaces it
        if self.sessions.contains_key(&room_id) {
            self.forget(&room_id);
        }

        if !self.accepting_new {
            let _ = respond_to.send(Err(SignalingError::Draining));
            return;
        }

        if let Some(waiters) = self.pending.get_mut(&room_id) {
            waiters.push(respond_to);
            return;
        }

        if self.sessions.len() + self.pending.len() >= self.max_sessions {
            warn!(
                target: "sig.actor.registry",
                instance_id = %self.instance_id,
                max_sessions = self.max_sessions,
                "Session capacity reached, rejecting new room"
            );
            let _ = respond_to.send(Err(SignalingError::CapacityExceeded));
            return;
        }

        debug!(
            target: "sig.actor.registry",
            instance_id = %self.instance_id,
            room_id = %room_id,
            "Acquiring router for new session"
        );
        self.pending.insert(room_id.clone(), vec![respond_to]);

        let pool = Arc::clone(&self.services.pool);
        let registry = self.self_sender.clone();
        tokio::spawn(async move {
            let result = pool.acquire_router().await;
            let Some(registry) = registry.upgrade() else {
                if let Ok(lease) = result {
                    pool.release(lease);
                }
                return;
            };
            if let Err(mpsc::error::SendError(RegistryMessage::RouterAcquired {
                result: Ok(lease),
                ..
            })) = registry
                .send(RegistryMessage::RouterAcquired {
                    room_id,
                    authorization,
                    result,
                })
                .await
            {
                pool.release(lease);
            }
        });
    }

    fn router_acquired(
        &mut self,
        room_id: String,
        authorization: SessionAuthorization,
        result: Result<RouterLease, EngineError>,
    ) {
        let waiters = self.pending.remove(&room_id).unwrap_or_default();

        let lease = match result {
            Ok(lease) => lease,
            Err(e) => {
                error!(
                    target: "sig.actor.registry",
                    instance_id = %self.instance_id,
                    room_id = %room_id,
                    error = %e,
                    "Router creation failed"
                );
                if matches!(e, EngineError::WorkerDied(_)) {
                    self.fatal.cancel();
                }
                let err = SignalingError::from(e);
                for waiter in waiters {
                    let _ = waiter.send(Err(err.clone()));
                }
                return;
            }
        };

        if !self.accepting_new {
            self.services.pool.release(lease);
            for waiter in waiters {
                let _ = waiter.send(Err(SignalingError::Draining));
            }
            return;
        }

        let Some(registry) = self.self_sender.upgrade() else {
            self.services.pool.release(lease);
            return;
        };

        self.next_instance_id += 1;
        let (handle, task_handle) = SessionActor::spawn(
            room_id.clone(),
            self.next_instance_id,
            authorization,
            lease,
            self.services.clone(),
            registry,
            self.cancel_token.child_token(),
        );

        for waiter in waiters {
            let _ = waiter.send(Ok(handle.clone()));
        }

        self.sessions.insert(
            room_id.clone(),
            ManagedSession {
                handle,
                task_handle,
                created_at: Instant::now(),
            },
        );
        self.services.metrics.session_created();

        info!(
            target: "sig.actor.registry",
            instance_id = %self.instance_id,
            room_id = %room_id,
            total_sessions = self.sessions.len(),
            "Session actor created"
        );
    }

    fn session_finalized(&mut self, room_id: &str, instance_id: u64) {
        let current = self
            .sessions
            .get(room_id)
            .is_some_and(|m| m.handle.instance_id() == instance_id);
        if !current {
            debug!(
                target: "sig.actor.registry",
                instance_id = %self.instance_id,
                room_id = %room_id,
                session_instance = instance_id,
                "Ignoring finalize from a replaced session"
            );
            return;
        }
        self.forget(room_id);
    }

    /// Drops the registry entry for `room_id` and reaps its task in the
    /// background so the message loop never blocks on it.
    fn forget(&mut self, room_id: &str) {
        let Some(managed) = self.sessions.remove(room_id) else {
            return;
        };
        managed.handle.cancel();

        let room_id_owned = room_id.to_string();
        let instance_id = self.instance_id.clone();
        let lifetime = managed.created_at.elapsed();
        tokio::spawn(async move {
            match tokio::time::timeout(Duration::from_secs(5), managed.task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "sig.actor.registry",
                        instance_id = %instance_id,
                        room_id = %room_id_owned,
                        "Session actor task completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "sig.actor.registry",
                        instance_id = %instance_id,
                        room_id = %room_id_owned,
                        error = ?e,
                        "Session actor task panicked during removal"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "sig.actor.registry",
                        instance_id = %instance_id,
                        room_id = %room_id_owned,
                        "Session actor task cleanup timed out"
                    );
                }
            }
        });

        self.services.metrics.session_removed();

        info!(
            target: "sig.actor.registry",
            instance_id = %self.instance_id,
            room_id = %room_id,
            lifetime_secs = lifetime.as_secs(),
            total_sessions = self.sessions.len(),
            "Session actor removed"
        );
    }

    fn get_status(&self) -> RegistryStatus {
        RegistryStatus {
            session_count: self.sessions.len(),
            pending_creations: self.pending.len(),
            is_draining: !self.accepting_new,
            mailbox_depth: self.mailbox.backlog(),
        }
    }

    /// Ends every session and waits for the tasks, up to `deadline`.
    async fn graceful_shutdown(&mut self, deadline: Duration) {
        info!(
            target: "sig.actor.registry",
            instance_id = %self.instance_id,
            session_count = self.sessions.len(),
            pending = self.pending.len(),
            "Performing graceful shutdown"
        );

        self.accepting_new = false;

        for (_, waiters) in self.pending.drain() {
            for waiter in waiters {
                let _ = waiter.send(Err(SignalingError::Draining));
            }
        }

        for (room_id, managed) in &self.sessions {
            debug!(
                target: "sig.actor.registry",
                instance_id = %self.instance_id,
                room_id = %room_id,
                "Cancelling session actor"
            );
            managed.handle.cancel();
        }

        let give_up_at = Instant::now() + deadline;
        for (room_id, managed) in self.sessions.drain() {
            match tokio::time::timeout_at(give_up_at, managed.task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "sig.actor.registry",
                        instance_id = %self.instance_id,
                        room_id = %room_id,
                        "Session actor completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "sig.actor.registry",
                        instance_id = %self.instance_id,
                        room_id = %room_id,
                        error = ?e,
                        "Session actor task panicked during shutdown"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "sig.actor.registry",
                        instance_id = %self.instance_id,
                        room_id = %room_id,
                        "Session actor shutdown timed out"
                    );
                }
            }
            self.services.metrics.session_removed();
        }

        info!(
            target: "sig.actor.registry",
            instance_id = %self.instance_id,
            "Graceful shutdown complete"
        );
    }

    /// Check health of managed session actors.
    async fn check_session_health(&mut self) {
        let finished: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, managed)| managed.task_handle.is_finished())
            .map(|(room_id, _)| room_id.clone())
            .collect();

        for room_id in finished {
            let Some(managed) = self.sessions.remove(&room_id) else {
                continue;
            };
            match managed.task_handle.await {
                Ok(()) => {
                    // Finalized; its SessionFinalized message is still queued
                    debug!(
                        target: "sig.actor.registry",
                        instance_id = %self.instance_id,
                        room_id = %room_id,
                        "Session actor exited cleanly"
                    );
                }
                Err(join_error) => {
                    if join_error.is_panic() {
                        error!(
                            target: "sig.actor.registry",
                            instance_id = %self.instance_id,
                            room_id = %room_id,
                            error = ?join_error,
                            "Session actor panicked - router and participants abandoned"
                        );
                        self.services.metrics.record_panic(ActorType::Session);
                    }
                }
            }

            self.services.metrics.session_removed();
        }
    }
}
