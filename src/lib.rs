use anyhow::{bail, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_remote::TrackRemote;

pub mod config;
pub mod connection;
mod internal;
pub mod media;
pub mod signal;

use crate::internal::data_types::{ice_is_up, LocalBlob, RemoteSlot, SessionState};
use crate::media::{CaptureKind, MediaDevices, SourceSelector};

// public exports
pub use config::{SessionConfig, SourcePolicy};
pub use connection::Connection;
pub use internal::data_types::{RemoteStream, Role, SessionPhase};
pub use internal::events::EmittedEvents;
pub use signal::{decode_description, encode_description, SignalError};

/// manual-webrtc
/// Drives a single webrtc-rs peer connection from "no media" to "media flowing both ways"
/// when the session descriptions are carried between the peers by a person: copied out of
/// one terminal and pasted into another.
///
/// The offering side calls `initialize`, waits for `EmittedEvents::LocalDescription` and hands
/// the blob to the remote operator, then pastes the answer into `accept_remote_description`.
/// The answering side calls `answer` with the pasted offer and hands back its own blob.
///
/// Candidates are not trickled. The local description is published once candidate
/// gathering has finished, so it already lists every candidate.
pub struct Coordinator {
    connection: Arc<dyn Connection>,
    devices: Arc<dyn MediaDevices>,
    selector: Box<dyn SourceSelector>,
    /// used to emit events
    emitted_event_chan: mpsc::UnboundedSender<EmittedEvents>,
    state: Mutex<SessionState>,
    local_blob: watch::Sender<LocalBlob>,
}

// a lazy version of the builder pattern
pub struct InitArgs {
    pub connection: Arc<dyn Connection>,
    pub devices: Arc<dyn MediaDevices>,
    pub selector: Box<dyn SourceSelector>,
    pub emitted_event_chan: mpsc::UnboundedSender<EmittedEvents>,
}

/// The following functions are driven by the operator:
/// initialize
/// answer
/// accept_remote_description
/// close
///
/// The following functions are driven by the peer connection
/// handle_ice_candidate
/// handle_ice_state
/// handle_remote_track
impl Coordinator {
    pub fn init(args: InitArgs) -> Arc<Self> {
        let (local_blob, _) = watch::channel(LocalBlob::Pending);
        Arc::new(Self {
            connection: args.connection,
            devices: args.devices,
            selector: args.selector,
            emitted_event_chan: args.emitted_event_chan,
            state: Mutex::new(SessionState::default()),
            local_blob,
        })
    }

    /// creates a RTCPeerConnection from `config` and a coordinator wired to its callbacks
    pub async fn connect(
        config: &SessionConfig,
        devices: Arc<dyn MediaDevices>,
        emitted_event_chan: mpsc::UnboundedSender<EmittedEvents>,
    ) -> Result<Arc<Self>> {
        let peer_connection = connection::new_peer_connection(config).await?;
        let coordinator = Self::init(InitArgs {
            connection: peer_connection.clone(),
            devices,
            selector: config.source.selector(),
            emitted_event_chan,
        });
        coordinator.attach(&peer_connection);
        Ok(coordinator)
    }

    /// routes the callbacks of `peer_connection` to this coordinator. The callbacks only hold
    /// a weak reference.
    pub fn attach(self: &Arc<Self>, peer_connection: &RTCPeerConnection) {
        let weak = Arc::downgrade(self);
        peer_connection.on_ice_candidate(Box::new(move |c: Option<RTCIceCandidate>| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(coordinator) = weak.upgrade() {
                    // reading the local description must not happen inside the gatherer's callback
                    tokio::spawn(async move { coordinator.handle_ice_candidate(c).await });
                }
            })
        }));

        let weak = Arc::downgrade(self);
        peer_connection.on_ice_connection_state_change(Box::new(
            move |connection_state: RTCIceConnectionState| {
                let weak = weak.clone();
                Box::pin(async move {
                    if let Some(coordinator) = weak.upgrade() {
                        coordinator.handle_ice_state(connection_state).await;
                    }
                })
            },
        ));

        let weak = Arc::downgrade(self);
        peer_connection.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let weak = weak.clone();
                Box::pin(async move {
                    if let Some(coordinator) = weak.upgrade() {
                        coordinator
                            .handle_remote_track(RemoteStream::from_track(track))
                            .await;
                    }
                })
            },
        ));
    }

    /// acquires the local stream, attaches its tracks, creates the offer and sets it as the
    /// local description. Candidate gathering starts here. Any error ends the session.
    pub async fn initialize(&self) -> Result<()> {
        self.start(Role::Offerer).await?;
        if let Err(e) = self.make_offer().await {
            self.fail(&e).await;
            return Err(e);
        }
        Ok(())
    }

    /// answering side of `initialize`: applies the pasted offer, then creates and sets the
    /// answer. A blob which does not decode is returned as a `SignalError` and leaves the
    /// session idle so the operator can paste again.
    pub async fn answer(&self, encoded_offer: &str) -> Result<()> {
        let offer = decode_description(encoded_offer).map_err(|e| {
            log::warn!("pasted offer rejected: {}", e);
            e
        })?;
        self.start(Role::Answerer).await?;
        if let Err(e) = self.make_answer(offer).await {
            self.fail(&e).await;
            return Err(e);
        }
        Ok(())
    }

    /// decodes the blob pasted by the operator and applies it as the remote description.
    /// Nothing is changed when the blob is empty or does not decode. Only one remote
    /// description is accepted per session, and none once the session has failed.
    pub async fn accept_remote_description(&self, encoded: &str) -> Result<(), SignalError> {
        let desc = decode_description(encoded).map_err(|e| {
            log::warn!("pasted description rejected: {}", e);
            e
        })?;
        self.apply_remote(desc).await
    }

    /// a null candidate means gathering is complete: the local description is encoded and
    /// published. Happens at most once per session.
    pub async fn handle_ice_candidate(&self, candidate: Option<RTCIceCandidate>) {
        if let Some(candidate) = candidate {
            log::debug!(
                "local candidate {:?} {}:{}",
                candidate.typ,
                candidate.address,
                candidate.port
            );
            return;
        }

        {
            let state = self.state.lock().await;
            if state.local_published || state.phase == SessionPhase::Failed {
                log::debug!("ignoring end of candidates in phase {}", state.phase);
                return;
            }
        }

        let Some(desc) = self.connection.local_description().await else {
            log::warn!("candidate gathering finished without a local description");
            return;
        };
        let blob = match encode_description(&desc) {
            Ok(blob) => blob,
            Err(e) => {
                log::error!("failed to encode local description: {}", e);
                return;
            }
        };

        let mut state = self.state.lock().await;
        if state.local_published {
            return;
        }
        state.local_published = true;
        self.advance(&mut state, SessionPhase::LocalDescriptionReady);
        log::info!("local {} ready, {} bytes encoded", desc.sdp_type, blob.len());
        self.local_blob.send_replace(LocalBlob::Ready(blob.clone()));
        self.emit(EmittedEvents::LocalDescription { blob });
        // the operator carries the blob over from here
        self.advance(&mut state, SessionPhase::AwaitingRemoteDescription);
    }

    /// records and reports the ICE state. The session counts as connected once ICE is up
    /// and a remote description has been accepted.
    pub async fn handle_ice_state(&self, ice_state: RTCIceConnectionState) {
        log::info!("ICE connection state has changed: {}", ice_state);
        let mut state = self.state.lock().await;
        state.ice_state = ice_state;
        self.emit(EmittedEvents::IceStateChanged(ice_state));
        if ice_is_up(ice_state) && state.remote == RemoteSlot::Applied {
            self.advance(&mut state, SessionPhase::Connected);
        }
    }

    /// remembers the most recent inbound stream for display
    pub async fn handle_remote_track(&self, stream: RemoteStream) {
        log::info!(
            "received remote {:?} track {} of stream {}",
            stream.kind,
            stream.track_id,
            stream.stream_id
        );
        let mut state = self.state.lock().await;
        if let Some(previous) = &state.remote_stream {
            if previous.stream_id != stream.stream_id {
                log::debug!("replacing displayed stream {}", previous.stream_id);
            }
        }
        state.remote_stream = Some(stream.clone());
        self.emit(EmittedEvents::RemoteTrack(stream));
    }

    /// stops the local media and closes the peer connection
    pub async fn close(&self) -> Result<()> {
        let local_stream = self.state.lock().await.local_stream.take();
        if let Some(mut stream) = local_stream {
            stream.stop().await;
        }
        self.connection.close().await
    }

    /// resolves with the encoded local description once gathering has completed
    pub async fn wait_for_local_blob(&self) -> Result<String> {
        let mut rx = self.local_blob.subscribe();
        loop {
            let current = rx.borrow_and_update().clone();
            match current {
                LocalBlob::Ready(blob) => return Ok(blob),
                LocalBlob::Unavailable => {
                    bail!("session failed before the local description was ready")
                }
                LocalBlob::Pending => {}
            }
            rx.changed().await?;
        }
    }

    pub fn local_blob(&self) -> Option<String> {
        match &*self.local_blob.borrow() {
            LocalBlob::Ready(blob) => Some(blob.clone()),
            _ => None,
        }
    }

    pub async fn phase(&self) -> SessionPhase {
        self.state.lock().await.phase
    }

    pub async fn role(&self) -> Option<Role> {
        self.state.lock().await.role
    }

    /// which source the session captured, once media was acquired
    pub async fn capture_kind(&self) -> Option<CaptureKind> {
        self.state.lock().await.capture
    }

    pub async fn local_stream_id(&self) -> Option<String> {
        self.state
            .lock()
            .await
            .local_stream
            .as_ref()
            .map(|s| s.id.clone())
    }

    pub async fn remote_stream(&self) -> Option<RemoteStream> {
        self.state.lock().await.remote_stream.clone()
    }

    /// the last state reported by the connection's callback
    pub async fn ice_state(&self) -> RTCIceConnectionState {
        self.state.lock().await.ice_state
    }

    async fn start(&self, role: Role) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.phase != SessionPhase::Idle {
            bail!("session already started, phase is {}", state.phase);
        }
        state.role = Some(role);
        self.advance(&mut state, SessionPhase::AcquiringMedia);
        Ok(())
    }

    async fn make_offer(&self) -> Result<()> {
        self.attach_local_media().await?;
        let offer = self.connection.create_offer().await?;
        self.advance_to(SessionPhase::OfferCreated).await;
        self.connection.set_local_description(offer).await?;
        self.advance_to(SessionPhase::GatheringCandidates).await;
        Ok(())
    }

    async fn make_answer(&self, offer: RTCSessionDescription) -> Result<()> {
        self.attach_local_media().await?;
        self.apply_remote(offer).await?;
        let answer = self.connection.create_answer().await?;
        self.advance_to(SessionPhase::AnswerCreated).await;
        self.connection.set_local_description(answer).await?;
        self.advance_to(SessionPhase::GatheringCandidates).await;
        Ok(())
    }

    async fn attach_local_media(&self) -> Result<()> {
        let kind = self.selector.choose();
        log::info!("requesting {} capture", kind);
        let stream = media::acquire(self.devices.as_ref(), kind).await?;
        for track in &stream.tracks {
            self.connection.add_track(track.clone()).await?;
        }
        log::debug!(
            "attached {} tracks of stream {}",
            stream.tracks.len(),
            stream.id
        );

        let mut state = self.state.lock().await;
        state.capture = Some(kind);
        state.local_stream = Some(stream);
        Ok(())
    }

    async fn apply_remote(&self, desc: RTCSessionDescription) -> Result<(), SignalError> {
        {
            let mut state = self.state.lock().await;
            if state.phase == SessionPhase::Failed {
                log::warn!("session failed, ignoring paste");
                return Err(SignalError::SessionFailed);
            }
            if state.remote != RemoteSlot::Empty {
                log::warn!("remote description already {:?}, ignoring paste", state.remote);
                return Err(SignalError::RemoteAlreadySet);
            }
            state.remote = RemoteSlot::Applying;
        }

        let sdp_type = desc.sdp_type;
        let result = self.connection.set_remote_description(desc).await;

        let mut state = self.state.lock().await;
        match result {
            Ok(()) => {
                log::info!("remote {} applied", sdp_type);
                state.remote = RemoteSlot::Applied;
                if ice_is_up(state.ice_state) {
                    self.advance(&mut state, SessionPhase::Connected);
                }
                Ok(())
            }
            Err(e) => {
                log::error!("failed to set remote description: {:#}", e);
                state.remote = RemoteSlot::Empty;
                Err(SignalError::Rejected(e))
            }
        }
    }

    async fn fail(&self, err: &anyhow::Error) {
        log::error!("session failed: {:#}", err);
        let mut state = self.state.lock().await;
        self.advance(&mut state, SessionPhase::Failed);
        // dropping the stream stops its producers
        state.local_stream = None;
        if !state.local_published {
            self.local_blob.send_replace(LocalBlob::Unavailable);
        }
        self.emit(EmittedEvents::Failed {
            reason: format!("{:#}", err),
        });
    }

    async fn advance_to(&self, next: SessionPhase) {
        let mut state = self.state.lock().await;
        self.advance(&mut state, next);
    }

    fn advance(&self, state: &mut SessionState, next: SessionPhase) -> bool {
        if !state.phase.can_advance_to(next) {
            return false;
        }
        log::debug!("session phase {} -> {}", state.phase, next);
        state.phase = next;
        self.emit(EmittedEvents::PhaseChanged(next));
        true
    }

    fn emit(&self, event: EmittedEvents) {
        if let Err(e) = self.emitted_event_chan.send(event) {
            log::debug!("nobody is listening for {:?}", e.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{local_track, Fixed, LocalStream, MediaConstraints, MimeType};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::Notify;
    use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
    use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
    use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
    use webrtc::track::track_local::TrackLocal;

    const SDP: &str = "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n";

    fn description(sdp_type: &str) -> RTCSessionDescription {
        serde_json::from_value(serde_json::json!({ "type": sdp_type, "sdp": SDP }))
            .expect("valid description")
    }

    #[derive(Default)]
    struct FakeConnection {
        tracks: std::sync::Mutex<Vec<String>>,
        local: std::sync::Mutex<Option<RTCSessionDescription>>,
        remote: std::sync::Mutex<Option<RTCSessionDescription>>,
        fail_offer: bool,
        reject_remote: AtomicBool,
        remote_calls: AtomicUsize,
        // set_remote_description waits here when present
        hold_remote: Option<Arc<Notify>>,
    }

    #[async_trait]
    impl Connection for FakeConnection {
        async fn add_track(&self, track: Arc<TrackLocalStaticSample>) -> Result<()> {
            self.tracks.lock().unwrap().push(track.id().to_owned());
            Ok(())
        }

        async fn create_offer(&self) -> Result<RTCSessionDescription> {
            if self.fail_offer {
                bail!("offer creation failed");
            }
            Ok(description("offer"))
        }

        async fn create_answer(&self) -> Result<RTCSessionDescription> {
            Ok(description("answer"))
        }

        async fn set_local_description(&self, desc: RTCSessionDescription) -> Result<()> {
            *self.local.lock().unwrap() = Some(desc);
            Ok(())
        }

        async fn set_remote_description(&self, desc: RTCSessionDescription) -> Result<()> {
            self.remote_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(hold) = &self.hold_remote {
                hold.notified().await;
            }
            if self.reject_remote.load(Ordering::SeqCst) {
                bail!("incompatible session description");
            }
            *self.remote.lock().unwrap() = Some(desc);
            Ok(())
        }

        async fn local_description(&self) -> Option<RTCSessionDescription> {
            self.local.lock().unwrap().clone()
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingDevices {
        display: AtomicUsize,
        camera: AtomicUsize,
        deny: bool,
    }

    impl CountingDevices {
        fn capture(&self, kind: CaptureKind) -> Result<LocalStream> {
            if self.deny {
                bail!("permission denied");
            }
            let id = format!("{}-test", kind);
            let tracks = vec![
                local_track(MimeType::OPUS, "audio", &id),
                local_track(MimeType::VP8, "video", &id),
            ];
            Ok(LocalStream::new(id, kind, tracks))
        }

        fn requests(&self) -> usize {
            self.display.load(Ordering::SeqCst) + self.camera.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MediaDevices for CountingDevices {
        async fn get_display_media(&self, _constraints: MediaConstraints) -> Result<LocalStream> {
            self.display.fetch_add(1, Ordering::SeqCst);
            self.capture(CaptureKind::Display)
        }

        async fn get_user_media(&self, _constraints: MediaConstraints) -> Result<LocalStream> {
            self.camera.fetch_add(1, Ordering::SeqCst);
            self.capture(CaptureKind::Camera)
        }
    }

    struct Session {
        coordinator: Arc<Coordinator>,
        connection: Arc<FakeConnection>,
        devices: Arc<CountingDevices>,
        events: mpsc::UnboundedReceiver<EmittedEvents>,
    }

    impl Session {
        fn drain(&mut self) -> Vec<EmittedEvents> {
            let mut events = vec![];
            while let Ok(evt) = self.events.try_recv() {
                events.push(evt);
            }
            events
        }
    }

    fn session_with(
        connection: FakeConnection,
        devices: CountingDevices,
        selector: Box<dyn SourceSelector>,
    ) -> Session {
        let connection = Arc::new(connection);
        let devices = Arc::new(devices);
        let (tx, events) = mpsc::unbounded_channel();
        let coordinator = Coordinator::init(InitArgs {
            connection: connection.clone(),
            devices: devices.clone(),
            selector,
            emitted_event_chan: tx,
        });
        Session {
            coordinator,
            connection,
            devices,
            events,
        }
    }

    fn session() -> Session {
        session_with(
            FakeConnection::default(),
            CountingDevices::default(),
            Box::new(Fixed(CaptureKind::Camera)),
        )
    }

    /// an offering session which has published its blob
    async fn offering_session() -> Session {
        let s = session();
        s.coordinator.initialize().await.unwrap();
        s.coordinator.handle_ice_candidate(None).await;
        s
    }

    fn answer_blob() -> String {
        encode_description(&description("answer")).unwrap()
    }

    #[tokio::test]
    async fn requests_exactly_one_source() {
        for kind in [CaptureKind::Display, CaptureKind::Camera] {
            let s = session_with(
                FakeConnection::default(),
                CountingDevices::default(),
                Box::new(Fixed(kind)),
            );
            s.coordinator.initialize().await.unwrap();

            assert_eq!(s.devices.requests(), 1);
            let wanted = match kind {
                CaptureKind::Display => &s.devices.display,
                CaptureKind::Camera => &s.devices.camera,
            };
            assert_eq!(wanted.load(Ordering::SeqCst), 1);
            assert_eq!(s.coordinator.capture_kind().await, Some(kind));
        }
    }

    // one coin shared by many sessions
    struct SharedFlip(Arc<media::CoinFlip>);

    impl SourceSelector for SharedFlip {
        fn choose(&self) -> CaptureKind {
            self.0.choose()
        }
    }

    #[tokio::test]
    async fn coin_flip_sessions_use_both_sources() {
        let flip = Arc::new(media::CoinFlip::seeded(3));
        let (mut display, mut camera) = (0, 0);
        for _ in 0..40 {
            let s = session_with(
                FakeConnection::default(),
                CountingDevices::default(),
                Box::new(SharedFlip(flip.clone())),
            );
            s.coordinator.initialize().await.unwrap();
            assert_eq!(s.devices.requests(), 1);
            display += s.devices.display.load(Ordering::SeqCst);
            camera += s.devices.camera.load(Ordering::SeqCst);
        }
        assert_eq!(display + camera, 40);
        assert!(display > 0 && camera > 0);
    }

    #[tokio::test]
    async fn initialize_attaches_every_track_and_sets_offer() {
        let s = session();
        s.coordinator.initialize().await.unwrap();

        assert_eq!(*s.connection.tracks.lock().unwrap(), vec!["audio", "video"]);
        let local = s.connection.local.lock().unwrap().clone().unwrap();
        assert_eq!(local.sdp_type, RTCSdpType::Offer);
        assert_eq!(s.coordinator.phase().await, SessionPhase::GatheringCandidates);
        assert_eq!(s.coordinator.role().await, Some(Role::Offerer));
        assert_eq!(
            s.coordinator.local_stream_id().await.as_deref(),
            Some("camera-test")
        );
    }

    #[tokio::test]
    async fn blob_waits_for_end_of_candidates() {
        let mut s = session();
        s.coordinator.initialize().await.unwrap();
        assert_eq!(s.coordinator.local_blob(), None);
        assert!(!s
            .drain()
            .iter()
            .any(|e| matches!(e, EmittedEvents::LocalDescription { .. })));

        s.coordinator.handle_ice_candidate(None).await;
        let blob = s.coordinator.local_blob().expect("published");
        let decoded = decode_description(&blob).unwrap();
        assert_eq!(decoded.sdp_type, RTCSdpType::Offer);
        assert_eq!(decoded.sdp, SDP);
        assert_eq!(
            s.coordinator.phase().await,
            SessionPhase::AwaitingRemoteDescription
        );
        assert_eq!(s.coordinator.wait_for_local_blob().await.unwrap(), blob);
    }

    #[tokio::test]
    async fn blob_is_published_once() {
        let mut s = offering_session().await;
        s.coordinator.handle_ice_candidate(None).await;

        let published = s
            .drain()
            .into_iter()
            .filter(|e| matches!(e, EmittedEvents::LocalDescription { .. }))
            .count();
        assert_eq!(published, 1);
    }

    #[tokio::test]
    async fn end_of_candidates_without_local_description_is_ignored() {
        let s = session();
        s.coordinator.handle_ice_candidate(None).await;
        assert_eq!(s.coordinator.local_blob(), None);
        assert_eq!(s.coordinator.phase().await, SessionPhase::Idle);
    }

    #[tokio::test]
    async fn empty_paste_is_a_validation_error() {
        let s = offering_session().await;
        let err = s.coordinator.accept_remote_description("").await.unwrap_err();

        assert!(matches!(err, SignalError::EmptyDescription));
        assert!(s.connection.remote.lock().unwrap().is_none());
        assert_eq!(s.connection.remote_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn valid_answer_becomes_remote_description() {
        let s = offering_session().await;
        s.coordinator
            .accept_remote_description(&answer_blob())
            .await
            .unwrap();

        let remote = s.connection.remote.lock().unwrap().clone().unwrap();
        assert_eq!(remote.sdp_type, RTCSdpType::Answer);
        assert_eq!(remote.sdp, SDP);
    }

    #[tokio::test]
    async fn garbage_paste_is_surfaced_and_ignored() {
        let s = offering_session().await;
        let err = s
            .coordinator
            .accept_remote_description("not-valid-base64!!")
            .await
            .unwrap_err();

        assert!(err.is_input_error());
        assert!(s.connection.remote.lock().unwrap().is_none());

        // the operator may paste again
        s.coordinator
            .accept_remote_description(&answer_blob())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn second_remote_description_is_refused() {
        let s = offering_session().await;
        s.coordinator
            .accept_remote_description(&answer_blob())
            .await
            .unwrap();
        let err = s
            .coordinator
            .accept_remote_description(&answer_blob())
            .await
            .unwrap_err();

        assert!(matches!(err, SignalError::RemoteAlreadySet));
        assert_eq!(s.connection.remote_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rejected_remote_description_is_reported() {
        let s = offering_session().await;
        s.connection.reject_remote.store(true, Ordering::SeqCst);

        let err = s
            .coordinator
            .accept_remote_description(&answer_blob())
            .await
            .unwrap_err();
        assert!(matches!(err, SignalError::Rejected(_)));
        assert!(s.connection.remote.lock().unwrap().is_none());
        assert_eq!(
            s.coordinator.phase().await,
            SessionPhase::AwaitingRemoteDescription
        );
    }

    #[tokio::test]
    async fn media_failure_is_terminal() {
        let mut s = session_with(
            FakeConnection::default(),
            CountingDevices {
                deny: true,
                ..Default::default()
            },
            Box::new(Fixed(CaptureKind::Display)),
        );
        let err = s.coordinator.initialize().await.unwrap_err();

        assert!(err.to_string().contains("permission denied"));
        assert_eq!(s.coordinator.phase().await, SessionPhase::Failed);
        assert!(s.connection.local.lock().unwrap().is_none());
        assert!(s
            .drain()
            .iter()
            .any(|e| matches!(e, EmittedEvents::Failed { .. })));
        assert!(s.coordinator.wait_for_local_blob().await.is_err());

        // no retry
        assert!(s.coordinator.initialize().await.is_err());
        assert_eq!(s.devices.requests(), 1);
    }

    #[tokio::test]
    async fn offer_failure_is_terminal() {
        let s = session_with(
            FakeConnection {
                fail_offer: true,
                ..Default::default()
            },
            CountingDevices::default(),
            Box::new(Fixed(CaptureKind::Camera)),
        );
        assert!(s.coordinator.initialize().await.is_err());
        assert_eq!(s.coordinator.phase().await, SessionPhase::Failed);
        assert_eq!(s.coordinator.local_stream_id().await, None);

        // a late end of candidates must not publish anything
        s.coordinator.handle_ice_candidate(None).await;
        assert_eq!(s.coordinator.local_blob(), None);
    }

    #[tokio::test]
    async fn failed_session_takes_no_remote_description() {
        let s = session_with(
            FakeConnection {
                fail_offer: true,
                ..Default::default()
            },
            CountingDevices::default(),
            Box::new(Fixed(CaptureKind::Display)),
        );
        assert!(s.coordinator.initialize().await.is_err());

        let err = s
            .coordinator
            .accept_remote_description(&answer_blob())
            .await
            .unwrap_err();
        assert!(matches!(err, SignalError::SessionFailed));
        assert!(!err.is_input_error());
        assert_eq!(s.connection.remote_calls.load(Ordering::SeqCst), 0);
        assert!(s.connection.remote.lock().unwrap().is_none());
        assert_eq!(s.coordinator.phase().await, SessionPhase::Failed);
    }

    #[tokio::test]
    async fn paste_during_apply_is_refused() {
        let release = Arc::new(Notify::new());
        let s = session_with(
            FakeConnection {
                hold_remote: Some(release.clone()),
                ..Default::default()
            },
            CountingDevices::default(),
            Box::new(Fixed(CaptureKind::Camera)),
        );
        s.coordinator.initialize().await.unwrap();
        s.coordinator.handle_ice_candidate(None).await;

        let coordinator = s.coordinator.clone();
        let first = tokio::spawn(async move {
            coordinator
                .accept_remote_description(&answer_blob())
                .await
        });
        while s.connection.remote_calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        let err = s
            .coordinator
            .accept_remote_description(&answer_blob())
            .await
            .unwrap_err();
        assert!(matches!(err, SignalError::RemoteAlreadySet));

        release.notify_one();
        first.await.unwrap().unwrap();
        assert_eq!(s.connection.remote_calls.load(Ordering::SeqCst), 1);
        assert!(s.connection.remote.lock().unwrap().is_some());
    }

    #[tokio::test]
    async fn initialize_twice_is_refused() {
        let s = session();
        s.coordinator.initialize().await.unwrap();
        assert!(s.coordinator.initialize().await.is_err());
        assert_eq!(s.devices.requests(), 1);
    }

    #[tokio::test]
    async fn connected_needs_remote_description_and_ice() {
        let s = offering_session().await;
        s.coordinator
            .handle_ice_state(RTCIceConnectionState::Checking)
            .await;
        s.coordinator
            .handle_ice_state(RTCIceConnectionState::Connected)
            .await;
        assert_eq!(
            s.coordinator.phase().await,
            SessionPhase::AwaitingRemoteDescription
        );

        s.coordinator
            .accept_remote_description(&answer_blob())
            .await
            .unwrap();
        assert_eq!(s.coordinator.phase().await, SessionPhase::Connected);
        assert_eq!(
            s.coordinator.ice_state().await,
            RTCIceConnectionState::Connected
        );
    }

    #[tokio::test]
    async fn ice_state_changes_are_reported() {
        let mut s = offering_session().await;
        s.coordinator
            .accept_remote_description(&answer_blob())
            .await
            .unwrap();
        s.drain();

        for state in [
            RTCIceConnectionState::Checking,
            RTCIceConnectionState::Completed,
        ] {
            s.coordinator.handle_ice_state(state).await;
        }
        let events = s.drain();
        let reported: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                EmittedEvents::IceStateChanged(state) => Some(*state),
                _ => None,
            })
            .collect();
        assert_eq!(
            reported,
            vec![
                RTCIceConnectionState::Checking,
                RTCIceConnectionState::Completed
            ]
        );
        assert_eq!(s.coordinator.phase().await, SessionPhase::Connected);
    }

    #[tokio::test]
    async fn latest_remote_track_wins() {
        let s = offering_session().await;
        for (stream_id, kind) in [("a", RTPCodecType::Audio), ("b", RTPCodecType::Video)] {
            s.coordinator
                .handle_remote_track(RemoteStream {
                    stream_id: stream_id.into(),
                    track_id: format!("{stream_id}-track"),
                    kind,
                    track: None,
                })
                .await;
        }
        let shown = s.coordinator.remote_stream().await.unwrap();
        assert_eq!(shown.stream_id, "b");
        assert_eq!(shown.kind, RTPCodecType::Video);
    }

    #[tokio::test]
    async fn answering_applies_offer_then_answers() {
        let s = session();
        let offer = encode_description(&description("offer")).unwrap();
        s.coordinator.answer(&offer).await.unwrap();

        let remote = s.connection.remote.lock().unwrap().clone().unwrap();
        assert_eq!(remote.sdp_type, RTCSdpType::Offer);
        let local = s.connection.local.lock().unwrap().clone().unwrap();
        assert_eq!(local.sdp_type, RTCSdpType::Answer);
        assert_eq!(s.coordinator.role().await, Some(Role::Answerer));
        assert_eq!(s.devices.requests(), 1);

        s.coordinator.handle_ice_candidate(None).await;
        let blob = s.coordinator.local_blob().unwrap();
        assert_eq!(
            decode_description(&blob).unwrap().sdp_type,
            RTCSdpType::Answer
        );

        // the offer was the one remote description of this session
        assert!(matches!(
            s.coordinator.accept_remote_description(&offer).await,
            Err(SignalError::RemoteAlreadySet)
        ));
    }

    #[tokio::test]
    async fn answering_with_bad_offer_stays_idle() {
        let s = session();
        let err = s.coordinator.answer("   ").await.unwrap_err();

        assert!(matches!(
            err.downcast_ref::<SignalError>(),
            Some(SignalError::EmptyDescription)
        ));
        assert_eq!(s.coordinator.phase().await, SessionPhase::Idle);
        assert_eq!(s.devices.requests(), 0);
    }

    #[tokio::test]
    async fn phase_changes_follow_the_handshake() {
        let mut s = offering_session().await;
        s.coordinator
            .accept_remote_description(&answer_blob())
            .await
            .unwrap();
        s.coordinator
            .handle_ice_state(RTCIceConnectionState::Connected)
            .await;

        let phases: Vec<_> = s
            .drain()
            .into_iter()
            .filter_map(|e| match e {
                EmittedEvents::PhaseChanged(p) => Some(p),
                _ => None,
            })
            .collect();
        assert_eq!(
            phases,
            vec![
                SessionPhase::AcquiringMedia,
                SessionPhase::OfferCreated,
                SessionPhase::GatheringCandidates,
                SessionPhase::LocalDescriptionReady,
                SessionPhase::AwaitingRemoteDescription,
                SessionPhase::Connected,
            ]
        );
    }
}
