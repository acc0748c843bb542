use base64::{engine::general_purpose::STANDARD, Engine as _};
use derive_more::Display;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

/// Errors produced while turning a pasted blob into a session description, or while applying
/// it. The connection is never modified when one of the decode variants is returned.
#[derive(Debug, Display)]
pub enum SignalError {
    #[display(fmt = "Session Description must not be empty")]
    EmptyDescription,
    #[display(fmt = "session description is not valid base64: {}", _0)]
    Base64(base64::DecodeError),
    #[display(fmt = "session description is not valid JSON: {}", _0)]
    Json(serde_json::Error),
    #[display(fmt = "session description has no usable type (expected offer or answer)")]
    UnknownType,
    #[display(fmt = "a remote description was already accepted for this session")]
    RemoteAlreadySet,
    #[display(fmt = "the session has failed and takes no remote description")]
    SessionFailed,
    #[display(fmt = "remote description rejected by the connection: {}", _0)]
    Rejected(anyhow::Error),
}

impl std::error::Error for SignalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SignalError::Base64(e) => Some(e),
            SignalError::Json(e) => Some(e),
            SignalError::Rejected(e) => Some(&**e),
            _ => None,
        }
    }
}

impl SignalError {
    /// true for the errors caused by what the operator pasted. the operator may paste again.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            SignalError::EmptyDescription
                | SignalError::Base64(_)
                | SignalError::Json(_)
                | SignalError::UnknownType
        )
    }
}

/// base64(JSON(desc)). the JSON matches what a browser produces for
/// `JSON.stringify(pc.localDescription)`
pub fn encode_description(desc: &RTCSessionDescription) -> Result<String, SignalError> {
    let json = serde_json::to_vec(desc).map_err(SignalError::Json)?;
    Ok(STANDARD.encode(json))
}

/// reverses `encode_description`. whitespace anywhere in the blob is ignored: terminals and
/// chat clients like to wrap long lines.
pub fn decode_description(encoded: &str) -> Result<RTCSessionDescription, SignalError> {
    let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() {
        return Err(SignalError::EmptyDescription);
    }

    let json = STANDARD.decode(compact.as_bytes()).map_err(SignalError::Base64)?;
    let desc: RTCSessionDescription = serde_json::from_slice(&json).map_err(SignalError::Json)?;
    if desc.sdp_type == RTCSdpType::Unspecified {
        return Err(SignalError::UnknownType);
    }
    Ok(desc)
}
