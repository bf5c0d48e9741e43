use crate::error::NegotiationError;
use crate::logger::dump_candidate;
use crate::message::{EventKind, WireMessage};
use crate::peer::data_channel::{attach_dc, DATA_CHANNEL_LABEL};
use crate::peer::ice::{apply_pending_candidates, PendingCandidates};
use crate::peer::types::IceServerConfig;
use crate::peer::{Negotiator, NegotiatorFactory};
use crate::session::{SessionId, SignalSender};
use crate::utils::add_ice_url_scheme;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::{
    api::APIBuilder,
    data_channel::data_channel_init::RTCDataChannelInit,
    ice_transport::ice_server::RTCIceServer,
    peer_connection::{
        configuration::RTCConfiguration, peer_connection_state::RTCPeerConnectionState,
        RTCPeerConnection,
    },
};

/// Opens one server-side peer connection per client.
pub struct RtcNegotiatorFactory {
    ice_servers: Vec<IceServerConfig>,
}

impl RtcNegotiatorFactory {
    pub fn new(ice_servers: Vec<IceServerConfig>) -> Self {
        Self { ice_servers }
    }
}

#[async_trait]
impl NegotiatorFactory for RtcNegotiatorFactory {
    async fn open(
        &self,
        session_id: &SessionId,
        signals: SignalSender,
    ) -> Result<Arc<dyn Negotiator>, NegotiationError> {
        let pc = new_peer(session_id, rtc_config(&self.ice_servers), signals).await?;
        Ok(Arc::new(RtcNegotiator {
            session_id: session_id.clone(),
            pc,
            pending: PendingCandidates::default(),
        }))
    }
}

/// Creates the peer, wires its callbacks and offers the data channel.
///
/// Locally gathered candidates are trickled to the client through
/// `signals` as they appear.
pub async fn new_peer(
    session_id: &SessionId,
    config: RTCConfiguration,
    signals: SignalSender,
) -> Result<Arc<RTCPeerConnection>, NegotiationError> {
    let api = APIBuilder::new().build();
    let pc = Arc::new(api.new_peer_connection(config).await?);

    let id = session_id.clone();
    pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
        let id = id.clone();
        let signals = signals.clone();
        Box::pin(async move {
            let Some(c) = cand else {
                debug!(session_id = %id, "ICE candidate gathering completed");
                return;
            };
            dump_candidate(&id, "LOCAL", &c);
            let init = match c.to_json() {
                Ok(init) => init,
                Err(e) => {
                    warn!(session_id = %id, error = %e, "failed to serialize local candidate");
                    return;
                }
            };
            match WireMessage::encoded(EventKind::Candidate, &init) {
                Ok(message) => {
                    if !signals.send(&message) {
                        debug!(session_id = %id, "mailbox gone, dropping local candidate");
                    }
                }
                Err(e) => warn!(session_id = %id, error = %e, "failed to encode local candidate"),
            }
        })
    }));

    let id = session_id.clone();
    pc.on_ice_gathering_state_change(Box::new(move |state| {
        debug!(session_id = %id, ?state, "ICE gathering state changed");
        Box::pin(async {})
    }));

    let id = session_id.clone();
    pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
        match st {
            RTCPeerConnectionState::Connected => info!(session_id = %id, "peer connected"),
            RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Failed => {
                warn!(session_id = %id, state = ?st, "peer connection lost")
            }
            _ => debug!(session_id = %id, state = ?st, "peer connection state changed"),
        }
        Box::pin(async {})
    }));

    let dc = pc
        .create_data_channel(DATA_CHANNEL_LABEL, Some(RTCDataChannelInit::default()))
        .await?;
    attach_dc(session_id, &dc);

    Ok(pc)
}

/// Peer connection configuration for the given ICE servers.
pub fn rtc_config(servers: &[IceServerConfig]) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: ice_servers(servers),
        ice_candidate_pool_size: 10,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

fn ice_servers(servers: &[IceServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}

pub struct RtcNegotiator {
    session_id: SessionId,
    pc: Arc<RTCPeerConnection>,
    pending: PendingCandidates,
}

#[async_trait]
impl Negotiator for RtcNegotiator {
    async fn create_offer(&self) -> Result<RTCSessionDescription, NegotiationError> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer).await?;
        self.pc
            .local_description()
            .await
            .ok_or(NegotiationError::MissingLocalDescription)
    }

    async fn apply_remote_candidate(
        &self,
        candidate: RTCIceCandidateInit,
    ) -> Result<(), NegotiationError> {
        if self.pc.remote_description().await.is_none() {
            debug!(session_id = %self.session_id, "remote description not set, queueing candidate");
            self.pending.push(candidate).await;
            return Ok(());
        }
        self.pc.add_ice_candidate(candidate).await?;
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: RTCSessionDescription,
    ) -> Result<(), NegotiationError> {
        self.pc.set_remote_description(description).await?;
        info!(session_id = %self.session_id, "remote description set");
        apply_pending_candidates(&self.pc, &self.pending).await;
        Ok(())
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        self.pc.close().await?;
        Ok(())
    }
}
