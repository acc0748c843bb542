use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use webrtc::media::Sample;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use super::{
    local_track, CaptureKind, LocalStream, MediaConstraints, MediaDevices, MimeType, StreamGuard,
    SyntheticDevices,
};

const SAMPLE_RATE: u32 = 48000;
// 20ms at 48kHz
const FRAME_SIZE: usize = 960;
const MAX_PACKET: usize = 1500;

/// Camera capture uses the host's default microphone for the audio track; video, and the
/// whole display capture, come from `SyntheticDevices`.
#[derive(Default)]
pub struct MicrophoneDevices {
    synthetic: SyntheticDevices,
}

impl MicrophoneDevices {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MediaDevices for MicrophoneDevices {
    async fn get_display_media(&self, constraints: MediaConstraints) -> Result<LocalStream> {
        self.synthetic.capture(CaptureKind::Display, constraints)
    }

    async fn get_user_media(&self, constraints: MediaConstraints) -> Result<LocalStream> {
        let video_only = MediaConstraints {
            audio: false,
            video: constraints.video,
        };
        if !constraints.audio {
            return self.synthetic.capture(CaptureKind::Camera, video_only);
        }

        let mut stream = if constraints.video {
            self.synthetic.capture(CaptureKind::Camera, video_only)?
        } else {
            LocalStream::new(
                format!("camera-{}", uuid::Uuid::new_v4()),
                CaptureKind::Camera,
                vec![],
            )
        };
        let track = local_track(MimeType::OPUS, "audio", &stream.id);
        let guard = start_capture(track.clone()).await?;
        stream.push_track(track);
        Ok(stream.with_guard(guard))
    }
}

struct OpusFramer {
    // encodes groups of samples (frames)
    encoder: opus::Encoder,
    // queues samples, to build a frame
    raw_samples: Vec<i16>,
    // used for the encoder
    opus_out: Vec<u8>,
}

impl OpusFramer {
    fn init() -> Result<Self> {
        let encoder = opus::Encoder::new(SAMPLE_RATE, opus::Channels::Mono, opus::Application::Voip)?;
        Ok(Self {
            encoder,
            raw_samples: Vec::with_capacity(FRAME_SIZE),
            opus_out: vec![0; MAX_PACKET],
        })
    }

    fn frame(&mut self, sample: i16) -> Option<Bytes> {
        self.raw_samples.push(sample);
        if self.raw_samples.len() < FRAME_SIZE {
            return None;
        }
        let encoded = self.encoder.encode(&self.raw_samples, &mut self.opus_out);
        self.raw_samples.clear();
        match encoded {
            Ok(size) => Some(Bytes::copy_from_slice(&self.opus_out[..size])),
            Err(e) => {
                log::error!("failed to encode opus frame: {}", e);
                None
            }
        }
    }
}

/// cpal streams are not Send, so the input stream lives on its own thread until the returned
/// guard is dropped. encoded frames are written to `track` from a tokio task.
async fn start_capture(track: Arc<TrackLocalStaticSample>) -> Result<StreamGuard> {
    let (producer, mut consumer) = mpsc::unbounded_channel::<Bytes>();
    let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
    let (ready_tx, ready_rx) = oneshot::channel::<Result<()>>();

    std::thread::spawn(move || {
        let stream = match build_input_stream(producer) {
            Ok(stream) => stream,
            Err(e) => {
                let _ = ready_tx.send(Err(e));
                return;
            }
        };
        let _ = ready_tx.send(Ok(()));
        // returns once the guard's sender is dropped
        let _ = stop_rx.recv();
        drop(stream);
        log::debug!("microphone capture stopped");
    });

    ready_rx
        .await
        .map_err(|_| anyhow!("microphone thread exited before starting"))??;

    tokio::spawn(async move {
        while let Some(data) = consumer.recv().await {
            let sample = Sample {
                data,
                duration: Duration::from_millis(20),
                ..Default::default()
            };
            if let Err(e) = track.write_sample(&sample).await {
                log::error!("failed to write microphone sample: {}", e);
            }
        }
    });

    Ok(StreamGuard::Thread(stop_tx))
}

fn build_input_stream(producer: mpsc::UnboundedSender<Bytes>) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let input_device = host
        .default_input_device()
        .ok_or_else(|| anyhow!("no microphone found"))?;
    log::info!(
        "capturing audio from {}",
        input_device.name().unwrap_or_else(|_| "unknown device".into())
    );

    let config = cpal::StreamConfig {
        channels: 1,
        sample_rate: cpal::SampleRate(SAMPLE_RATE),
        buffer_size: cpal::BufferSize::Default,
    };
    let mut framer = OpusFramer::init()?;
    let input_data_fn = move |data: &[i16], _: &cpal::InputCallbackInfo| {
        for sample in data {
            if let Some(bytes) = framer.frame(*sample) {
                if let Err(e) = producer.send(bytes) {
                    log::error!("failed to queue microphone frame: {}", e);
                }
            }
        }
    };

    let stream = input_device.build_input_stream(&config, input_data_fn, err_fn)?;
    stream.play()?;
    Ok(stream)
}

fn err_fn(err: cpal::StreamError) {
    log::error!("an error occurred on the microphone stream: {}", err);
}
