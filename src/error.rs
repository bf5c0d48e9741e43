//! Error types for the signaling hub

use std::time::Duration;
use thiserror::Error;

/// Errors raised by the negotiation collaborator.
#[derive(Error, Debug)]
pub enum NegotiationError {
    /// The WebRTC stack rejected the operation
    #[error("WebRTC error: {0}")]
    Rtc(#[from] webrtc::Error),

    /// No local description was available after creating the offer
    #[error("Missing local description")]
    MissingLocalDescription,

    /// A description or candidate could not be serialized for the client
    #[error("Encode error: {0}")]
    Encode(String),

    /// The collaborator has already been closed
    #[error("Peer connection closed")]
    Closed,
}

/// Errors that terminate a client session.
///
/// None of these are retried: the session's loops exit and the hub
/// unregisters it.
#[derive(Error, Debug)]
pub enum SessionError {
    /// Read or write failure on the connection
    #[error("Transport error: {0}")]
    Transport(String),

    /// Malformed envelope or payload
    #[error("Decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// Candidate or description rejected by the peer connection
    #[error("Negotiation error: {0}")]
    Negotiation(#[from] NegotiationError),

    /// Nothing was received within the keepalive deadline
    #[error("No frame received within {0:?}")]
    Timeout(Duration),

    /// The remote end closed the connection
    #[error("Connection closed")]
    Closed,
}

impl SessionError {
    /// Closed connections are the normal way for a session to end.
    pub fn is_expected(&self) -> bool {
        matches!(self, SessionError::Closed)
    }
}
