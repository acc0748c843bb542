use anyhow::{bail, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;
use webrtc::media::Sample;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use super::{local_track, CaptureKind, LocalStream, MediaConstraints, MediaDevices, MimeType, StreamGuard};

// a single 20ms Opus frame (TOC 0xf8) encoding silence
const OPUS_SILENCE: [u8; 3] = [0xf8, 0xff, 0xfe];
const AUDIO_FRAME: Duration = Duration::from_millis(20);
const VIDEO_FRAME: Duration = Duration::from_millis(33);
const VIDEO_FRAME_LEN: usize = 1200;

/// Media source for hosts without capture hardware, and for tests. Produces an Opus track of
/// silence and a VP8 track of generated frames, written at real-time pace.
///
/// The video payload is a test pattern and is not decodable; it only exercises the transport.
#[derive(Default)]
pub struct SyntheticDevices {
    denied: Vec<CaptureKind>,
}

impl SyntheticDevices {
    pub fn new() -> Self {
        Self::default()
    }

    /// behaves like a user refusing the permission prompt for `kind`
    pub fn denying(kind: CaptureKind) -> Self {
        Self { denied: vec![kind] }
    }

    pub(crate) fn capture(&self, kind: CaptureKind, constraints: MediaConstraints) -> Result<LocalStream> {
        if self.denied.contains(&kind) {
            bail!("permission denied: {} capture", kind);
        }
        if !constraints.audio && !constraints.video {
            bail!("at least one of audio and video must be requested");
        }

        let stream_id = format!("{}-{}", kind, Uuid::new_v4());
        let audio = constraints
            .audio
            .then(|| local_track(MimeType::OPUS, "audio", &stream_id));
        let video = constraints
            .video
            .then(|| local_track(MimeType::VP8, "video", &stream_id));

        let tracks = audio.iter().chain(video.iter()).cloned().collect();
        let pump = tokio::spawn(pump(audio, video));
        log::debug!("synthetic {} stream {} started", kind, stream_id);

        Ok(LocalStream::new(stream_id, kind, tracks).with_guard(StreamGuard::Task(pump)))
    }
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn get_display_media(&self, constraints: MediaConstraints) -> Result<LocalStream> {
        self.capture(CaptureKind::Display, constraints)
    }

    async fn get_user_media(&self, constraints: MediaConstraints) -> Result<LocalStream> {
        self.capture(CaptureKind::Camera, constraints)
    }
}

/// writes one sample per frame interval to each track until aborted. samples written before
/// the track is bound to a connection are dropped by the track.
async fn pump(
    audio: Option<Arc<TrackLocalStaticSample>>,
    video: Option<Arc<TrackLocalStaticSample>>,
) {
    let mut audio_tick = tokio::time::interval(AUDIO_FRAME);
    let mut video_tick = tokio::time::interval(VIDEO_FRAME);
    let mut frame_number: u8 = 0;

    loop {
        tokio::select! {
            _ = audio_tick.tick(), if audio.is_some() => {
                if let Some(track) = &audio {
                    let sample = Sample {
                        data: Bytes::from_static(&OPUS_SILENCE),
                        duration: AUDIO_FRAME,
                        ..Default::default()
                    };
                    if let Err(e) = track.write_sample(&sample).await {
                        log::warn!("failed to write audio sample: {}", e);
                    }
                }
            }
            _ = video_tick.tick(), if video.is_some() => {
                if let Some(track) = &video {
                    frame_number = frame_number.wrapping_add(1);
                    let sample = Sample {
                        data: test_frame(frame_number),
                        duration: VIDEO_FRAME,
                        ..Default::default()
                    };
                    if let Err(e) = track.write_sample(&sample).await {
                        log::warn!("failed to write video sample: {}", e);
                    }
                }
            }
        }
    }
}

fn test_frame(frame_number: u8) -> Bytes {
    Bytes::from(
        (0..VIDEO_FRAME_LEN)
            .map(|i| (i as u8).wrapping_add(frame_number))
            .collect::<Vec<u8>>(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::acquire;
    use webrtc::track::track_local::TrackLocal;

    #[tokio::test]
    async fn camera_stream_has_audio_and_video() {
        let devices = SyntheticDevices::new();
        let stream = acquire(&devices, CaptureKind::Camera).await.unwrap();

        assert_eq!(stream.kind, CaptureKind::Camera);
        assert!(stream.id.starts_with("camera-"));
        let kinds: Vec<&str> = stream.tracks.iter().map(|t| t.id()).collect();
        assert_eq!(kinds, vec!["audio", "video"]);
        assert!(stream.tracks.iter().all(|t| t.stream_id() == stream.id));
    }

    #[tokio::test]
    async fn display_stream_is_labelled() {
        let devices = SyntheticDevices::new();
        let stream = acquire(&devices, CaptureKind::Display).await.unwrap();
        assert!(stream.id.starts_with("display-"));
    }

    #[tokio::test]
    async fn denied_capture_fails() {
        let devices = SyntheticDevices::denying(CaptureKind::Display);
        let err = devices
            .get_display_media(MediaConstraints::default())
            .await
            .err()
            .expect("display capture must fail");
        assert!(err.to_string().contains("permission denied"));
        assert!(devices
            .get_user_media(MediaConstraints::default())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn stop_ends_the_pump() {
        let devices = SyntheticDevices::new();
        let mut stream = acquire(&devices, CaptureKind::Camera).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        stream.stop().await;
        assert_eq!(stream.tracks.len(), 2);
    }
}
