use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::config::SessionConfig;

/// The parts of a peer connection the coordinator drives. Implemented for webrtc-rs'
/// `RTCPeerConnection`; tests substitute their own.
///
/// Events flow the other way: whoever owns the concrete connection forwards its callbacks to
/// the coordinator's `handle_*` methods.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn add_track(&self, track: Arc<TrackLocalStaticSample>) -> Result<()>;
    async fn create_offer(&self) -> Result<RTCSessionDescription>;
    async fn create_answer(&self) -> Result<RTCSessionDescription>;
    async fn set_local_description(&self, desc: RTCSessionDescription) -> Result<()>;
    async fn set_remote_description(&self, desc: RTCSessionDescription) -> Result<()>;
    async fn local_description(&self) -> Option<RTCSessionDescription>;
    async fn close(&self) -> Result<()>;
}

#[async_trait]
impl Connection for RTCPeerConnection {
    /// also starts a task which reads RTCP for the new sender. Interceptors (NACK, receiver
    /// reports) only run while someone reads.
    async fn add_track(&self, track: Arc<TrackLocalStaticSample>) -> Result<()> {
        let track: Arc<dyn TrackLocal + Send + Sync> = track;
        let sender = RTCPeerConnection::add_track(self, track).await?;
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while sender.read(&mut rtcp_buf).await.is_ok() {}
            log::debug!("rtcp reader finished");
        });
        Ok(())
    }

    async fn create_offer(&self) -> Result<RTCSessionDescription> {
        Ok(RTCPeerConnection::create_offer(self, None).await?)
    }

    async fn create_answer(&self) -> Result<RTCSessionDescription> {
        Ok(RTCPeerConnection::create_answer(self, None).await?)
    }

    async fn set_local_description(&self, desc: RTCSessionDescription) -> Result<()> {
        Ok(RTCPeerConnection::set_local_description(self, desc).await?)
    }

    async fn set_remote_description(&self, desc: RTCSessionDescription) -> Result<()> {
        Ok(RTCPeerConnection::set_remote_description(self, desc).await?)
    }

    async fn local_description(&self) -> Option<RTCSessionDescription> {
        RTCPeerConnection::local_description(self).await
    }

    async fn close(&self) -> Result<()> {
        Ok(RTCPeerConnection::close(self).await?)
    }
}

/// media engine with the default codecs plus the default interceptors
pub fn create_api() -> Result<webrtc::api::API> {
    let mut media = MediaEngine::default();
    media.register_default_codecs()?;

    // the interceptor registry is the RTP/RTCP pipeline: NACKs, RTCP reports and so on.
    // every peer connection needs one when the API is built by hand
    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media)?;

    Ok(APIBuilder::new()
        .with_media_engine(media)
        .with_interceptor_registry(registry)
        .build())
}

pub async fn new_peer_connection(config: &SessionConfig) -> Result<Arc<RTCPeerConnection>> {
    let api = create_api()?;
    let pc = api.new_peer_connection(config.rtc_configuration()).await?;
    Ok(Arc::new(pc))
}
