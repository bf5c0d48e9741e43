//! HTTP surface: the WebSocket upgrade every client connects through and
//! a health probe.

use crate::config::{HubConfig, SessionTiming};
use crate::error::NegotiationError;
use crate::hub::{HubHandle, SessionHandle};
use crate::message::{EventKind, Outbound, WireMessage};
use crate::peer::{Negotiator, NegotiatorFactory};
use crate::session::{Session, SessionId, SignalSender};
use crate::transport;
use crate::utils::random_nickname;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::{Json, Response};
use axum::routing::get;
use axum::Router;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Shared state accessible from the handlers.
#[derive(Clone)]
pub struct AppState {
    pub hub: HubHandle,
    pub factory: Arc<dyn NegotiatorFactory>,
    pub timing: SessionTiming,
    pub max_message_size: usize,
    pub mailbox_capacity: usize,
    pub start_time: Instant,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(config: &HubConfig, hub: HubHandle, factory: Arc<dyn NegotiatorFactory>) -> Self {
        Self {
            hub,
            factory,
            timing: config.session_timing(),
            max_message_size: config.max_message_size,
            mailbox_capacity: config.mailbox_capacity.max(1),
            start_time: Instant::now(),
            started_at: Utc::now(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub connections: usize,
    pub uptime_secs: u64,
    pub started_at: DateTime<Utc>,
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        connections: state.hub.connection_count().await,
        uptime_secs: state.start_time.elapsed().as_secs(),
        started_at: state.started_at,
    })
}

/// GET /ws
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.max_message_size(state.max_message_size)
        .on_upgrade(move |socket| handle_connection(socket, state))
}

/// Drives one client from upgrade to disconnect: negotiate, send the
/// offer, register with the hub, then run the session loops.
async fn handle_connection(socket: WebSocket, state: AppState) {
    let id = SessionId::random();
    let (mailbox, mailbox_rx) = mpsc::channel::<Outbound>(state.mailbox_capacity);
    let signals = SignalSender::held(&mailbox);

    let negotiator = match state.factory.open(&id, signals.clone()).await {
        Ok(negotiator) => negotiator,
        Err(e) => {
            warn!(session_id = %id, error = %e, "failed to open peer connection");
            return;
        }
    };

    if let Err(e) = queue_offer(negotiator.as_ref(), &mailbox).await {
        warn!(session_id = %id, error = %e, "failed to create offer");
        if let Err(e) = negotiator.close().await {
            debug!(session_id = %id, error = %e, "close after failed offer");
        }
        return;
    }
    signals.release();

    let nick = random_nickname();
    let cancel = CancellationToken::new();
    state.hub.register(SessionHandle::new(
        id.clone(),
        nick.clone(),
        mailbox,
        negotiator.clone(),
        cancel.clone(),
    ));

    let session = Arc::new(Session::new(id, nick, state.hub.clone(), negotiator, state.timing));
    let (sink, source) = transport::split(socket);
    session.run(source, sink, mailbox_rx, cancel).await;
}

async fn queue_offer(
    negotiator: &dyn Negotiator,
    mailbox: &mpsc::Sender<Outbound>,
) -> Result<(), NegotiationError> {
    let offer = negotiator.create_offer().await?;
    let message = WireMessage::encoded(EventKind::Offer, &offer)
        .and_then(|message| message.to_outbound())
        .map_err(|e| NegotiationError::Encode(e.to_string()))?;
    // The mailbox is fresh, so this is its first entry.
    mailbox
        .try_send(message)
        .map_err(|_| NegotiationError::Closed)
}
