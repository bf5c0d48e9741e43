//! The hub: sole owner of the session registry and the chat history.
//!
//! All mutation goes through one task that drains an ordered command
//! queue. Callers only ever hold a [`HubHandle`], which submits commands
//! without blocking, so sessions can always report their own shutdown even
//! while a fan-out is in progress.

pub mod history;

use crate::config::CHAT_HISTORY_SIZE;
use crate::message::{ChatMessage, Outbound, WireMessage};
use crate::peer::Negotiator;
use crate::session::SessionId;
use history::ChatHistory;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Registry-side view of a live session.
pub struct SessionHandle {
    pub id: SessionId,
    pub nick: String,
    mailbox: mpsc::Sender<Outbound>,
    negotiator: Arc<dyn Negotiator>,
    cancel: CancellationToken,
}

impl SessionHandle {
    pub fn new(
        id: SessionId,
        nick: String,
        mailbox: mpsc::Sender<Outbound>,
        negotiator: Arc<dyn Negotiator>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            nick,
            mailbox,
            negotiator,
            cancel,
        }
    }

    /// Stops the receive loop, closes the collaborator, and drops the
    /// hub's end of the mailbox so the send loop drains and exits.
    fn release(self) {
        self.cancel.cancel();
        let negotiator = self.negotiator;
        let session_id = self.id;
        tokio::spawn(async move {
            if let Err(e) = negotiator.close().await {
                warn!(%session_id, error = %e, "failed to close peer connection");
            }
        });
    }
}

enum HubCommand {
    Register(SessionHandle),
    Unregister(SessionId),
    Broadcast(Outbound),
    RecordChat(ChatMessage),
    ConnectionCount(oneshot::Sender<usize>),
    ChatHistory(oneshot::Sender<Vec<ChatMessage>>),
}

/// Cloneable entry point to the hub task.
#[derive(Clone)]
pub struct HubHandle {
    commands: mpsc::UnboundedSender<HubCommand>,
}

impl HubHandle {
    pub fn register(&self, session: SessionHandle) {
        self.submit(HubCommand::Register(session));
    }

    /// Idempotent: unknown or already removed sessions are ignored.
    pub fn unregister(&self, id: SessionId) {
        self.submit(HubCommand::Unregister(id));
    }

    pub fn broadcast(&self, message: Outbound) {
        self.submit(HubCommand::Broadcast(message));
    }

    pub fn record_chat(&self, message: ChatMessage) {
        self.submit(HubCommand::RecordChat(message));
    }

    /// Number of registered sessions; 0 once the hub has stopped.
    pub async fn connection_count(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        self.submit(HubCommand::ConnectionCount(tx));
        rx.await.unwrap_or_default()
    }

    /// Chat history, oldest first.
    pub async fn chat_history(&self) -> Vec<ChatMessage> {
        let (tx, rx) = oneshot::channel();
        self.submit(HubCommand::ChatHistory(tx));
        rx.await.unwrap_or_default()
    }

    /// Guard that unregisters `id` when dropped, however its owner exits.
    pub fn unregister_on_drop(&self, id: SessionId) -> UnregisterGuard {
        UnregisterGuard {
            hub: self.clone(),
            id,
        }
    }

    fn submit(&self, command: HubCommand) {
        if self.commands.send(command).is_err() {
            debug!("hub stopped, command dropped");
        }
    }
}

pub struct UnregisterGuard {
    hub: HubHandle,
    id: SessionId,
}

impl Drop for UnregisterGuard {
    fn drop(&mut self) {
        self.hub.unregister(self.id.clone());
    }
}

enum Delivery {
    Delivered,
    Closed,
    Stalled(SessionId),
}

pub struct Hub {
    sessions: HashMap<SessionId, SessionHandle>,
    history: ChatHistory,
    commands: mpsc::UnboundedReceiver<HubCommand>,
    // Weak so the loop still ends once every external handle is gone.
    loopback: mpsc::WeakUnboundedSender<HubCommand>,
    delivery_timeout: Duration,
}

impl Hub {
    /// `delivery_timeout` bounds how long a fan-out waits on a full
    /// mailbox before giving up on that session.
    pub fn new(delivery_timeout: Duration) -> (Self, HubHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let hub = Self {
            sessions: HashMap::new(),
            history: ChatHistory::new(CHAT_HISTORY_SIZE),
            commands: rx,
            loopback: tx.downgrade(),
            delivery_timeout,
        };
        (hub, HubHandle { commands: tx })
    }

    pub fn spawn(delivery_timeout: Duration) -> HubHandle {
        let (hub, handle) = Self::new(delivery_timeout);
        tokio::spawn(hub.run());
        handle
    }

    pub async fn run(mut self) {
        info!("hub started");
        while let Some(command) = self.commands.recv().await {
            match command {
                HubCommand::Register(session) => self.register(session),
                HubCommand::Unregister(id) => self.unregister(&id),
                HubCommand::Broadcast(message) => self.broadcast(message).await,
                HubCommand::RecordChat(message) => self.history.push(message),
                HubCommand::ConnectionCount(reply) => {
                    let _ = reply.send(self.sessions.len());
                }
                HubCommand::ChatHistory(reply) => {
                    let _ = reply.send(self.history.snapshot());
                }
            }
        }
        for (_, session) in self.sessions.drain() {
            session.release();
        }
        info!("hub stopped");
    }

    fn register(&mut self, session: SessionHandle) {
        // Replayed before insertion so nothing broadcast later can overtake it.
        for chat in self.history.snapshot() {
            let outbound = match WireMessage::chat(&chat).and_then(|m| m.to_outbound()) {
                Ok(outbound) => outbound,
                Err(e) => {
                    warn!(error = %e, "could not encode chat history");
                    break;
                }
            };
            if session.mailbox.try_send(outbound).is_err() {
                warn!(session_id = %session.id, "mailbox full during history replay");
                break;
            }
        }

        let id = session.id.clone();
        info!(session_id = %id, nick = %session.nick, "session registered");
        if let Some(previous) = self.sessions.insert(id, session) {
            warn!(session_id = %previous.id, "replaced session with duplicate id");
            previous.release();
        }
        self.announce_connection_count();
    }

    fn unregister(&mut self, id: &SessionId) {
        let Some(session) = self.sessions.remove(id) else {
            debug!(session_id = %id, "unregister for unknown session ignored");
            return;
        };
        session.release();
        info!(
            session_id = %id,
            connections = self.sessions.len(),
            "session unregistered"
        );
        self.announce_connection_count();
    }

    async fn broadcast(&mut self, message: Outbound) {
        let mut deliveries = JoinSet::new();
        for session in self.sessions.values() {
            let mailbox = session.mailbox.clone();
            let id = session.id.clone();
            let message = message.clone();
            let timeout = self.delivery_timeout;
            deliveries.spawn(async move {
                match mailbox.send_timeout(message, timeout).await {
                    Ok(()) => Delivery::Delivered,
                    Err(SendTimeoutError::Closed(_)) => Delivery::Closed,
                    Err(SendTimeoutError::Timeout(_)) => Delivery::Stalled(id),
                }
            });
        }

        let recipients = deliveries.len();
        let mut stalled = Vec::new();
        while let Some(result) = deliveries.join_next().await {
            match result {
                Ok(Delivery::Stalled(id)) => stalled.push(id),
                Ok(Delivery::Delivered | Delivery::Closed) => {}
                Err(e) => warn!(error = %e, "delivery task failed"),
            }
        }
        debug!(recipients, stalled = stalled.len(), "broadcast delivered");

        for id in stalled {
            warn!(session_id = %id, timeout = ?self.delivery_timeout, "mailbox stalled, disconnecting");
            self.unregister(&id);
        }
    }

    /// Queues an info broadcast behind the commands already waiting, so the
    /// count it carries is the one observed at this point.
    fn announce_connection_count(&self) {
        let info = match WireMessage::info(self.sessions.len()).and_then(|m| m.to_outbound()) {
            Ok(info) => info,
            Err(e) => {
                warn!(error = %e, "could not encode hub info");
                return;
            }
        };
        if let Some(loopback) = self.loopback.upgrade() {
            let _ = loopback.send(HubCommand::Broadcast(info));
        }
    }
}
