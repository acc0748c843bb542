use anyhow::Result;
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use webrtc::api::media_engine::{
    MIME_TYPE_AV1, MIME_TYPE_G722, MIME_TYPE_H264, MIME_TYPE_OPUS, MIME_TYPE_PCMA, MIME_TYPE_PCMU,
    MIME_TYPE_VP8, MIME_TYPE_VP9,
};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

#[cfg(feature = "host-audio")]
mod microphone;
mod synthetic;

#[cfg(feature = "host-audio")]
pub use microphone::MicrophoneDevices;
pub use synthetic::SyntheticDevices;

/// Indicates the device from which the local media stream originates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureKind {
    /// screen capture
    Display,
    /// camera and microphone
    Camera,
}

impl fmt::Display for CaptureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureKind::Display => f.write_str("display"),
            CaptureKind::Camera => f.write_str("camera"),
        }
    }
}

/// what the capture request asks for. the session always asks for both
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

/// represents the MIME types from webrtc::api::media_engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MimeType {
    // patent encumbered, the most widely deployed
    H264,
    // royalty-free, every browser decodes it
    VP8,
    VP9,
    AV1,
    // lossy audio, what browsers send by default
    OPUS,
    G722,
    // G.711 µ-law
    PCMU,
    // G.711 A-law
    PCMA,
}

impl MimeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MimeType::H264 => MIME_TYPE_H264,
            MimeType::VP8 => MIME_TYPE_VP8,
            MimeType::VP9 => MIME_TYPE_VP9,
            MimeType::AV1 => MIME_TYPE_AV1,
            MimeType::OPUS => MIME_TYPE_OPUS,
            MimeType::G722 => MIME_TYPE_G722,
            MimeType::PCMU => MIME_TYPE_PCMU,
            MimeType::PCMA => MIME_TYPE_PCMA,
        }
    }

    /// capability used when creating a local track of this type
    pub fn capability(&self) -> RTCRtpCodecCapability {
        match self {
            MimeType::OPUS => RTCRtpCodecCapability {
                mime_type: self.as_str().into(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".into(),
                ..Default::default()
            },
            MimeType::G722 | MimeType::PCMU | MimeType::PCMA => RTCRtpCodecCapability {
                mime_type: self.as_str().into(),
                clock_rate: 8000,
                ..Default::default()
            },
            _ => RTCRtpCodecCapability {
                mime_type: self.as_str().into(),
                clock_rate: 90000,
                ..Default::default()
            },
        }
    }
}

impl fmt::Display for MimeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// creates a local track which accepts whole media samples
pub fn local_track(mime_type: MimeType, track_id: &str, stream_id: &str) -> Arc<TrackLocalStaticSample> {
    Arc::new(TrackLocalStaticSample::new(
        mime_type.capability(),
        track_id.to_owned(),
        stream_id.to_owned(),
    ))
}

/// keeps whatever produces samples for a stream alive
pub enum StreamGuard {
    Task(JoinHandle<()>),
    /// a capture thread which exits once this sender is dropped
    Thread(std::sync::mpsc::Sender<()>),
}

/// The captured stream: every track shares `id` as its stream id. Dropping it stops the
/// producers.
pub struct LocalStream {
    pub id: String,
    pub kind: CaptureKind,
    pub tracks: Vec<Arc<TrackLocalStaticSample>>,
    guards: Vec<StreamGuard>,
}

impl LocalStream {
    pub fn new(id: String, kind: CaptureKind, tracks: Vec<Arc<TrackLocalStaticSample>>) -> Self {
        Self {
            id,
            kind,
            tracks,
            guards: vec![],
        }
    }

    pub fn with_guard(mut self, guard: StreamGuard) -> Self {
        self.guards.push(guard);
        self
    }

    pub fn push_track(&mut self, track: Arc<TrackLocalStaticSample>) {
        self.tracks.push(track);
    }

    /// stops the producers and waits for the pump tasks to finish. the tracks stay attached
    /// to the connection but go silent
    pub async fn stop(&mut self) {
        let tasks: Vec<JoinHandle<()>> = self
            .guards
            .drain(..)
            .filter_map(|guard| match guard {
                StreamGuard::Task(handle) => {
                    handle.abort();
                    Some(handle)
                }
                StreamGuard::Thread(_) => None,
            })
            .collect();
        futures::future::join_all(tasks).await;
    }
}

impl Drop for LocalStream {
    fn drop(&mut self) {
        for guard in &self.guards {
            if let StreamGuard::Task(handle) = guard {
                handle.abort();
            }
        }
    }
}

/// Media acquisition. Mirrors the two capture calls a browser offers.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn get_display_media(&self, constraints: MediaConstraints) -> Result<LocalStream>;
    async fn get_user_media(&self, constraints: MediaConstraints) -> Result<LocalStream>;
}

/// asks `devices` for exactly one stream of the given kind
pub async fn acquire(devices: &dyn MediaDevices, kind: CaptureKind) -> Result<LocalStream> {
    let constraints = MediaConstraints::default();
    match kind {
        CaptureKind::Display => devices.get_display_media(constraints).await,
        CaptureKind::Camera => devices.get_user_media(constraints).await,
    }
}

/// picks the capture source for a session
pub trait SourceSelector: Send + Sync {
    fn choose(&self) -> CaptureKind;
}

/// unweighted coin flip between display and camera
pub struct CoinFlip {
    rng: Option<Mutex<StdRng>>,
}

impl CoinFlip {
    pub fn new() -> Self {
        Self { rng: None }
    }

    /// reproducible sequence of flips
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Some(Mutex::new(StdRng::seed_from_u64(seed))),
        }
    }
}

impl Default for CoinFlip {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceSelector for CoinFlip {
    fn choose(&self) -> CaptureKind {
        let heads = match &self.rng {
            Some(rng) => match rng.lock() {
                Ok(mut rng) => rng.gen_bool(0.5),
                Err(poisoned) => poisoned.into_inner().gen_bool(0.5),
            },
            None => rand::thread_rng().gen_bool(0.5),
        };
        if heads {
            CaptureKind::Display
        } else {
            CaptureKind::Camera
        }
    }
}

/// always the same source
pub struct Fixed(pub CaptureKind);

impl SourceSelector for Fixed {
    fn choose(&self) -> CaptureKind {
        self.0
    }
}
