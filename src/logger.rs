use crate::session::SessionId;
use tracing::debug;
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::EnvFilter;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;

/// Installs the global subscriber with millisecond local timestamps.
///
/// `RUST_LOG` wins over `fallback` when it is set.
pub fn init(fallback: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(fallback))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S%.3f".into()))
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!(e))
}

/// Prints an ICE candidate as it appears (trickle ICE).
pub fn dump_candidate(session_id: &SessionId, label: &str, cand: &RTCIceCandidate) {
    if let Ok(init) = cand.to_json() {
        debug!(
            %session_id,
            candidate = %init.candidate,
            sdp_mid = ?init.sdp_mid,
            sdp_mline_index = ?init.sdp_mline_index,
            username_fragment = ?init.username_fragment,
            "trickle {label}"
        );
    }
}
