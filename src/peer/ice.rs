use tokio::sync::Mutex;
use tracing::{debug, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::RTCPeerConnection;

/// Remote candidates that arrived before the remote description.
#[derive(Default)]
pub struct PendingCandidates {
    queue: Mutex<Vec<RTCIceCandidateInit>>,
}

impl PendingCandidates {
    pub async fn push(&self, candidate: RTCIceCandidateInit) {
        self.queue.lock().await.push(candidate);
    }

    pub async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }

    async fn take(&self) -> Vec<RTCIceCandidateInit> {
        std::mem::take(&mut *self.queue.lock().await)
    }
}

/// Applies every queued candidate once the remote description is set.
///
/// Failures are logged and skipped: a stale candidate must not undo an
/// otherwise good negotiation.
pub async fn apply_pending_candidates(pc: &RTCPeerConnection, pending: &PendingCandidates) {
    for candidate in pending.take().await {
        debug!(candidate = %candidate.candidate, "applying pending candidate");
        if let Err(e) = pc.add_ice_candidate(candidate).await {
            warn!(error = %e, "failed to apply pending candidate");
        }
    }
}
