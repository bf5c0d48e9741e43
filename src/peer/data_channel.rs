use crate::session::SessionId;
use std::sync::Arc;
use tracing::{debug, info};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;

/// Label of the data channel the server offers to every client.
pub const DATA_CHANNEL_LABEL: &str = "ssc-data";

/// Shared handlers for the server-side data channel.
pub fn attach_dc(session_id: &SessionId, dc: &Arc<RTCDataChannel>) {
    let id = session_id.clone();
    dc.on_open(Box::new(move || {
        info!(session_id = %id, "data channel open");
        Box::pin(async {})
    }));

    let id = session_id.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        debug!(
            session_id = %id,
            len = msg.data.len(),
            is_string = msg.is_string,
            "data channel message"
        );
        Box::pin(async {})
    }));

    let id = session_id.clone();
    dc.on_close(Box::new(move || {
        info!(session_id = %id, "data channel closed");
        Box::pin(async {})
    }));
}
