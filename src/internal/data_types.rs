use std::fmt;
use std::sync::Arc;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_remote::TrackRemote;

use crate::media::{CaptureKind, LocalStream};

/// which side of the handshake this session plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// creates the offer and waits for a pasted answer
    Offerer,
    /// receives a pasted offer and produces the answer
    Answerer,
}

/// Where a session is in the manual handshake.
///
/// Idle -> AcquiringMedia -> OfferCreated | AnswerCreated -> GatheringCandidates
///      -> LocalDescriptionReady -> AwaitingRemoteDescription -> Connected
///
/// Failed can be entered from AcquiringMedia, OfferCreated and AnswerCreated and is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    AcquiringMedia,
    OfferCreated,
    AnswerCreated,
    GatheringCandidates,
    LocalDescriptionReady,
    AwaitingRemoteDescription,
    Connected,
    Failed,
}

impl SessionPhase {
    // OfferCreated and AnswerCreated are alternatives at the same step
    fn rank(self) -> u8 {
        match self {
            SessionPhase::Idle => 0,
            SessionPhase::AcquiringMedia => 1,
            SessionPhase::OfferCreated | SessionPhase::AnswerCreated => 2,
            SessionPhase::GatheringCandidates => 3,
            SessionPhase::LocalDescriptionReady => 4,
            SessionPhase::AwaitingRemoteDescription => 5,
            SessionPhase::Connected => 6,
            SessionPhase::Failed => 7,
        }
    }

    /// phases only move forward, and nothing leaves Failed
    pub fn can_advance_to(self, next: SessionPhase) -> bool {
        self != SessionPhase::Failed && next.rank() > self.rank()
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionPhase::Idle => "idle",
            SessionPhase::AcquiringMedia => "acquiring-media",
            SessionPhase::OfferCreated => "offer-created",
            SessionPhase::AnswerCreated => "answer-created",
            SessionPhase::GatheringCandidates => "gathering-candidates",
            SessionPhase::LocalDescriptionReady => "local-description-ready",
            SessionPhase::AwaitingRemoteDescription => "awaiting-remote-description",
            SessionPhase::Connected => "connected",
            SessionPhase::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// ICE has found a working path
pub fn ice_is_up(state: RTCIceConnectionState) -> bool {
    matches!(
        state,
        RTCIceConnectionState::Connected | RTCIceConnectionState::Completed
    )
}

/// The stream the remote peer is sending. Only referenced for display; the coordinator does
/// not read from it.
#[derive(Clone)]
pub struct RemoteStream {
    pub stream_id: String,
    pub track_id: String,
    pub kind: RTPCodecType,
    pub track: Option<Arc<TrackRemote>>,
}

impl RemoteStream {
    pub fn from_track(track: Arc<TrackRemote>) -> Self {
        Self {
            stream_id: track.stream_id(),
            track_id: track.id(),
            kind: track.kind(),
            track: Some(track),
        }
    }
}

impl fmt::Debug for RemoteStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteStream")
            .field("stream_id", &self.stream_id)
            .field("track_id", &self.track_id)
            .field("kind", &self.kind)
            .finish()
    }
}

/// the remote description slot. Applying is set while the connection is processing a pasted
/// description so a concurrent paste is refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteSlot {
    Empty,
    Applying,
    Applied,
}

/// value of the local blob watch channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalBlob {
    Pending,
    Ready(String),
    /// the session failed before a local description existed
    Unavailable,
}

pub struct SessionState {
    pub phase: SessionPhase,
    pub role: Option<Role>,
    pub capture: Option<CaptureKind>,
    pub local_stream: Option<LocalStream>,
    pub local_published: bool,
    pub remote: RemoteSlot,
    pub remote_stream: Option<RemoteStream>,
    pub ice_state: RTCIceConnectionState,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            phase: SessionPhase::Idle,
            role: None,
            capture: None,
            local_stream: None,
            local_published: false,
            remote: RemoteSlot::Empty,
            remote_stream: None,
            ice_state: RTCIceConnectionState::New,
        }
    }
}
