use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;

use crate::internal::data_types::{RemoteStream, SessionPhase};

/// Sent to the controlling application. Stands in for the page elements of a browser demo:
/// the log lines, the local description text box and the remote video element.
#[derive(Debug, Clone)]
pub enum EmittedEvents {
    PhaseChanged(SessionPhase),
    /// ICE gathering finished. `blob` must be copied to the remote peer
    LocalDescription { blob: String },
    IceStateChanged(RTCIceConnectionState),
    /// the remote peer is sending media. replaces any stream announced earlier
    RemoteTrack(RemoteStream),
    /// the session is over; no retry is attempted
    Failed { reason: String },
}
