//! `ConnectionActor` - per-socket outbound mailbox.
//!
//! Each `ConnectionActor`:
//! - Owns the ordered queue of events for exactly one signaling socket
//! - Forwards them to the socket writer in the order they were delivered
//! - Stops when the socket closes, on `Close`, or on cancellation
//!
//! Every event a client sees (direct replies, errors and session
//! broadcasts) goes through this mailbox, so per-connection delivery order
//! is the order in which senders called [`ConnectionActorHandle::deliver`].
//!
//! `deliver` never waits. A session actor broadcasting to a slow client
//! must not stall the whole room, so a full mailbox disconnects that client
//! instead.

use super::messages::ConnectionMessage;
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use crate::signaling::protocol::ServerEvent;

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Connection mailbox capacity. Matches the critical mailbox threshold.
const CONNECTION_CHANNEL_BUFFER: usize = 200;

/// Handle to a `ConnectionActor`.
#[derive(Clone, Debug)]
pub struct ConnectionActorHandle {
    sender: mpsc::Sender<ConnectionMessage>,
    cancel_token: CancellationToken,
    connection_id: String,
}

impl ConnectionActorHandle {
    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Queue an event for the client.
    ///
    /// Returns false if the connection is gone or was just dropped for
    /// falling behind.
    pub fn deliver(&self, event: ServerEvent) -> bool {
        match self.sender.try_send(ConnectionMessage::Deliver(event)) {
            Ok(()) => true,
            Err(TrySendError::Full(ConnectionMessage::Deliver(event))) => {
                warn!(
                    target: "sig.actor.connection",
                    connection_id = %self.connection_id,
                    event = event.name(),
                    "Connection mailbox full, disconnecting slow client"
                );
                self.cancel_token.cancel();
                false
            }
            Err(_) => false,
        }
    }

    /// Ask the actor to flush what it has queued and stop.
    pub fn close(&self, reason: &str) {
        if self
            .sender
            .try_send(ConnectionMessage::Close {
                reason: reason.to_string(),
            })
            .is_err()
        {
            self.cancel_token.cancel();
        }
    }

    /// Queued events not yet handed to the writer.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Resolves once the actor has been cancelled.
    pub async fn cancelled(&self) {
        self.cancel_token.cancelled().await;
    }
}

/// The `ConnectionActor` implementation.
pub struct ConnectionActor {
    connection_id: String,
    receiver: mpsc::Receiver<ConnectionMessage>,
    /// Socket writer side.
    outbound: mpsc::Sender<ServerEvent>,
    cancel_token: CancellationToken,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl ConnectionActor {
    /// Spawn a new connection actor feeding `outbound`.
    ///
    /// Returns a handle and the task join handle.
    pub fn spawn(
        connection_id: String,
        outbound: mpsc::Sender<ServerEvent>,
        cancel_token: CancellationToken,
        metrics: Arc<ActorMetrics>,
    ) -> (ConnectionActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(CONNECTION_CHANNEL_BUFFER);

        metrics.connection_created();

        let actor = Self {
            connection_id: connection_id.clone(),
            receiver,
            outbound,
            cancel_token: cancel_token.clone(),
            metrics,
            mailbox: MailboxMonitor::new(ActorType::Connection, &connection_id),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = ConnectionActorHandle {
            sender,
            cancel_token,
            connection_id,
        };

        (handle, task_handle)
    }

    #[instrument(
        skip_all,
        name = "sig.actor.connection",
        fields(connection_id = %self.connection_id)
    )]
    async fn run(mut self) {
        debug!(
            target: "sig.actor.connection",
            connection_id = %self.connection_id,
            "ConnectionActor started"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!(
                        target: "sig.actor.connection",
                        connection_id = %self.connection_id,
                        "ConnectionActor received cancellation signal"
                    );
                    break;
                }

                msg = self.receiver.recv() => {
                    let Some(message) = msg else {
                        debug!(
                            target: "sig.actor.connection",
                            connection_id = %self.connection_id,
                            "ConnectionActor channel closed, exiting"
                        );
                        break;
                    };

                    self.mailbox.observe(self.receiver.len());
                    let should_exit = self.handle_message(message).await;

                    if should_exit {
                        break;
                    }
                }
            }
        }

        self.metrics.connection_closed();
        // Socket reader watches this token
        self.cancel_token.cancel();

        info!(
            target: "sig.actor.connection",
            connection_id = %self.connection_id,
            messages_processed = self.mailbox.processed(),
            "ConnectionActor stopped"
        );
    }

    /// Handle a single message. Returns true if the actor should exit.
    async fn handle_message(&mut self, message: ConnectionMessage) -> bool {
        match message {
            ConnectionMessage::Deliver(event) => {
                let name = event.name();
                if self.outbound.send(event).await.is_err() {
                    debug!(
                        target: "sig.actor.connection",
                        connection_id = %self.connection_id,
                        event = name,
                        "Socket writer gone, dropping event"
                    );
                    return true;
                }
                false
            }

            ConnectionMessage::Close { reason } => {
                debug!(
                    target: "sig.actor.connection",
                    connection_id = %self.connection_id,
                    reason = %reason,
                    "Closing connection"
                );
                true
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::signaling::protocol::{TransportIdPayload, ProducerIdPayload};
    use std::time::Duration;

    fn transport_connected(id: &str) -> ServerEvent {
        ServerEvent::TransportConnected(TransportIdPayload {
            transport_id: id.to_string(),
        })
    }

    #[tokio::test]
    async fn test_deliver_preserves_order() {
        let metrics = ActorMetrics::new();
        let (outbound_tx, mut outbound_rx) = mpsc::channel(16);
        let (handle, _task) = ConnectionActor::spawn(
            "conn-order".to_string(),
            outbound_tx,
            CancellationToken::new(),
            metrics,
        );

        for i in 0..10 {
            assert!(handle.deliver(transport_connected(&format!("t-{i}"))));
        }

        for i in 0..10 {
            let event = outbound_rx.recv().await.unwrap();
            assert_eq!(event, transport_connected(&format!("t-{i}")));
        }
        handle.cancel();
    }

    #[tokio::test]
    async fn test_close_flushes_queued_events_first() {
        let metrics = ActorMetrics::new();
        let (outbound_tx, mut outbound_rx) = mpsc::channel(16);
        let (handle, task) = ConnectionActor::spawn(
            "conn-close".to_string(),
            outbound_tx,
            CancellationToken::new(),
            Arc::clone(&metrics),
        );

        handle.deliver(ServerEvent::Produced(ProducerIdPayload {
            producer_id: "p-1".to_string(),
        }));
        handle.close("session ended");

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(outbound_rx.recv().await.unwrap().name(), "produced");
        assert!(outbound_rx.recv().await.is_none());
        assert!(handle.is_cancelled());
        assert_eq!(metrics.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_writer_gone_stops_actor() {
        let metrics = ActorMetrics::new();
        let (outbound_tx, outbound_rx) = mpsc::channel(1);
        drop(outbound_rx);

        let (handle, task) = ConnectionActor::spawn(
            "conn-gone".to_string(),
            outbound_tx,
            CancellationToken::new(),
            metrics,
        );

        handle.deliver(transport_connected("t-1"));
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();

        assert!(handle.is_cancelled());
        assert!(!handle.deliver(transport_connected("t-2")));
    }

    #[tokio::test]
    async fn test_full_mailbox_disconnects_client() {
        let metrics = ActorMetrics::new();
        // Writer never drains: the actor blocks on the first event
        let (outbound_tx, _outbound_rx) = mpsc::channel(1);
        let (handle, _task) = ConnectionActor::spawn(
            "conn-slow".to_string(),
            outbound_tx,
            CancellationToken::new(),
            metrics,
        );

        let mut accepted = 0;
        for i in 0..(CONNECTION_CHANNEL_BUFFER + 10) {
            if handle.deliver(transport_connected(&format!("t-{i}"))) {
                accepted += 1;
            } else {
                break;
            }
        }

        assert!(accepted <= CONNECTION_CHANNEL_BUFFER + 2);
        assert!(handle.is_cancelled());
    }

    #[tokio::test]
    async fn test_parent_cancellation_stops_actor() {
        let parent = CancellationToken::new();
        let metrics = ActorMetrics::new();
        let (outbound_tx, _outbound_rx) = mpsc::channel(4);

        let (handle, task) = ConnectionActor::spawn(
            "conn-parent".to_string(),
            outbound_tx,
            parent.child_token(),
            Arc::clone(&metrics),
        );
        assert_eq!(metrics.connection_count(), 1);

        parent.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();

        assert!(handle.is_cancelled());
        assert_eq!(metrics.connection_count(), 0);
    }
}
