use serde::{Deserialize, Serialize};

/// ICE server entry for the server-side peer connections.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct IceServerConfig {
    pub r#type: String, // 'stun' or 'turn'
    pub url: String,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServerConfig {
    /// Builds an entry from a bare URL; the type follows the scheme and
    /// defaults to STUN.
    pub fn from_url(url: &str) -> Self {
        let r#type = if url.starts_with("turn:") || url.starts_with("turns:") {
            "turn"
        } else {
            "stun"
        };
        Self {
            r#type: r#type.into(),
            url: url.into(),
            username: None,
            credential: None,
        }
    }
}
