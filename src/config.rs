use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;

use crate::media::{CaptureKind, CoinFlip, Fixed, SourceSelector};

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// how the capture source is picked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourcePolicy {
    /// coin flip per session
    #[default]
    Random,
    Display,
    Camera,
}

impl SourcePolicy {
    pub fn selector(&self) -> Box<dyn SourceSelector> {
        match self {
            SourcePolicy::Random => Box::new(CoinFlip::new()),
            SourcePolicy::Display => Box::new(Fixed(CaptureKind::Display)),
            SourcePolicy::Camera => Box::new(Fixed(CaptureKind::Camera)),
        }
    }
}

impl std::str::FromStr for SourcePolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "random" => Ok(SourcePolicy::Random),
            "display" | "screen" => Ok(SourcePolicy::Display),
            "camera" => Ok(SourcePolicy::Camera),
            other => anyhow::bail!("unknown source policy: {}", other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// STUN/TURN urls. empty means host candidates only
    pub ice_servers: Vec<String>,
    pub source: SourcePolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![DEFAULT_STUN_SERVER.into()],
            source: SourcePolicy::Random,
        }
    }
}

impl SessionConfig {
    /// configuration for sessions between processes on one host
    pub fn local_only() -> Self {
        Self {
            ice_servers: vec![],
            ..Default::default()
        }
    }

    pub fn rtc_configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.ice_servers.is_empty() {
            vec![]
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}
