pub mod connection;
pub mod data_channel;
pub mod ice;
pub mod types;

use crate::error::NegotiationError;
use crate::session::{SessionId, SignalSender};
use async_trait::async_trait;
use std::sync::Arc;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

pub use connection::RtcNegotiatorFactory;
pub use types::IceServerConfig;

/// Negotiation state of one client: the only operations the session and
/// the hub need from the WebRTC stack.
#[async_trait]
pub trait Negotiator: Send + Sync {
    /// Creates the server's offer and installs it as local description.
    async fn create_offer(&self) -> Result<RTCSessionDescription, NegotiationError>;

    async fn apply_remote_candidate(
        &self,
        candidate: RTCIceCandidateInit,
    ) -> Result<(), NegotiationError>;

    async fn set_remote_description(
        &self,
        description: RTCSessionDescription,
    ) -> Result<(), NegotiationError>;

    async fn close(&self) -> Result<(), NegotiationError>;
}

/// Builds a negotiator per accepted connection.
#[async_trait]
pub trait NegotiatorFactory: Send + Sync {
    /// `signals` carries locally gathered candidates back to the client.
    async fn open(
        &self,
        session_id: &SessionId,
        signals: SignalSender,
    ) -> Result<Arc<dyn Negotiator>, NegotiationError>;
}
