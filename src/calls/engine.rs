//! `webrtc`-backed implementation of the peer-engine seam.
//!
//! Everything that touches the engine crate lives here: connection setup,
//! callback wiring, the sample-fed local track type, and the mapping from
//! engine states to the call core's state enums.

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use log::{debug, warn};
use tokio::sync::{Mutex, mpsc};
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8, MediaEngine};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use super::error::{CallError, MediaError};
use super::media::{CaptureProfile, LocalTrack, MediaSource, TrackKind};
use super::peer::{
    EngineConfig, IceConnectionState, PeerConnection, PeerConnectionState, PeerEngine, PeerEvent,
    RemoteTrackInfo,
};
use crate::types::{IceCandidate, Sdp, SdpKind};

/// Peer engine backed by the `webrtc` crate.
pub struct RtcEngine;

impl RtcEngine {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RtcEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PeerEngine for RtcEngine {
    async fn connect(
        &self,
        config: &EngineConfig,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Box<dyn PeerConnection>, CallError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(engine_err)?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(engine_err)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: config
                .ice_servers
                .iter()
                .map(|s| RTCIceServer {
                    urls: s.urls.clone(),
                    username: s.username.clone(),
                    credential: s.credential.clone(),
                })
                .collect(),
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(engine_err)?,
        );
        wire_callbacks(&pc, events);

        Ok(Box::new(RtcConnection {
            pc,
            video_sender: Mutex::new(None),
        }))
    }
}

// Callbacks are registered before any negotiation so no early candidate or
// track notification is lost.
fn wire_callbacks(pc: &Arc<RTCPeerConnection>, events: mpsc::UnboundedSender<PeerEvent>) {
    let tx = events.clone();
    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        let tx = tx.clone();
        Box::pin(async move {
            let kind = match track.kind() {
                RTPCodecType::Video => TrackKind::Video,
                _ => TrackKind::Audio,
            };
            debug!("remote {:?} track arrived (ssrc={})", kind, track.ssrc());
            let _ = tx.send(PeerEvent::RemoteTrack(RemoteTrackInfo {
                ssrc: track.ssrc(),
                kind,
            }));
        })
    }));

    let tx = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate| {
        let tx = tx.clone();
        Box::pin(async move {
            // None marks end of gathering; nothing to signal for it.
            let Some(candidate) = candidate else { return };
            match candidate.to_json() {
                Ok(init) => {
                    let _ = tx.send(PeerEvent::LocalCandidate(init_to_candidate(init)));
                }
                Err(e) => warn!("failed to serialize local ICE candidate: {e}"),
            }
        })
    }));

    let tx = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |state| {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(PeerEvent::ConnectionState(map_peer_state(state)));
        })
    }));

    let tx = events;
    pc.on_ice_connection_state_change(Box::new(move |state| {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(PeerEvent::IceState(map_ice_state(state)));
        })
    }));
}

fn map_peer_state(state: RTCPeerConnectionState) -> PeerConnectionState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => {
            PeerConnectionState::New
        }
        RTCPeerConnectionState::Connecting => PeerConnectionState::Connecting,
        RTCPeerConnectionState::Connected => PeerConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => PeerConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
        RTCPeerConnectionState::Closed => PeerConnectionState::Closed,
    }
}

fn map_ice_state(state: RTCIceConnectionState) -> IceConnectionState {
    match state {
        RTCIceConnectionState::Unspecified | RTCIceConnectionState::New => IceConnectionState::New,
        RTCIceConnectionState::Checking => IceConnectionState::Checking,
        RTCIceConnectionState::Connected => IceConnectionState::Connected,
        RTCIceConnectionState::Completed => IceConnectionState::Completed,
        RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
        RTCIceConnectionState::Failed => IceConnectionState::Failed,
        RTCIceConnectionState::Closed => IceConnectionState::Closed,
    }
}

fn init_to_candidate(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_m_line_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn engine_err(e: webrtc::Error) -> CallError {
    CallError::Engine(e.to_string())
}

fn negotiation_err(e: webrtc::Error) -> CallError {
    CallError::Negotiation(e.to_string())
}

struct RtcConnection {
    pc: Arc<RTCPeerConnection>,
    // Remembered at add_track time so screen sharing can swap it later.
    video_sender: Mutex<Option<Arc<RTCRtpSender>>>,
}

impl RtcConnection {
    fn sample_track(track: &Arc<dyn LocalTrack>) -> Result<Arc<TrackLocalStaticSample>, CallError> {
        track
            .as_any()
            .downcast_ref::<RtcLocalTrack>()
            .map(RtcLocalTrack::sample_track)
            .ok_or_else(|| CallError::Engine("track was not produced by this engine".into()))
    }
}

#[async_trait]
impl PeerConnection for RtcConnection {
    async fn add_track(&self, track: Arc<dyn LocalTrack>) -> Result<(), CallError> {
        let sample = Self::sample_track(&track)?;
        let sender = self
            .pc
            .add_track(sample as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(engine_err)?;
        if track.kind() == TrackKind::Video {
            *self.video_sender.lock().await = Some(sender);
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<Sdp, CallError> {
        let offer = self.pc.create_offer(None).await.map_err(negotiation_err)?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(negotiation_err)?;
        Ok(Sdp::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<Sdp, CallError> {
        let answer = self.pc.create_answer(None).await.map_err(negotiation_err)?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(negotiation_err)?;
        Ok(Sdp::answer(answer.sdp))
    }

    async fn set_remote_description(&self, sdp: Sdp) -> Result<(), CallError> {
        let description = match sdp.kind {
            SdpKind::Offer => RTCSessionDescription::offer(sdp.sdp),
            SdpKind::Answer => RTCSessionDescription::answer(sdp.sdp),
        }
        .map_err(negotiation_err)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(negotiation_err)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), CallError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_m_line_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(engine_err)
    }

    async fn replace_video_track(&self, track: Arc<dyn LocalTrack>) -> Result<bool, CallError> {
        let sender = self.video_sender.lock().await;
        let Some(sender) = sender.as_ref() else {
            return Ok(false);
        };
        let sample = Self::sample_track(&track)?;
        sender
            .replace_track(Some(sample as Arc<dyn TrackLocal + Send + Sync>))
            .await
            .map_err(engine_err)?;
        Ok(true)
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            warn!("error closing peer connection: {e}");
        }
    }
}

/// A sample-fed local track.
///
/// The platform capture loop holds this and pushes encoded samples through
/// [`write_sample`](Self::write_sample); disabling the track drops samples
/// without releasing the device, stopping it is final.
pub struct RtcLocalTrack {
    id: String,
    kind: TrackKind,
    rtc: Arc<TrackLocalStaticSample>,
    enabled: AtomicBool,
    live: AtomicBool,
}

impl RtcLocalTrack {
    fn new(id: &str, kind: TrackKind, codec: RTCRtpCodecCapability) -> Self {
        let rtc = Arc::new(TrackLocalStaticSample::new(
            codec,
            id.to_owned(),
            "confab-call".to_owned(),
        ));
        Self {
            id: id.to_owned(),
            kind,
            rtc,
            enabled: AtomicBool::new(true),
            live: AtomicBool::new(true),
        }
    }

    pub fn audio(id: &str) -> Self {
        Self::new(
            id,
            TrackKind::Audio,
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48_000,
                channels: 2,
                ..Default::default()
            },
        )
    }

    pub fn video(id: &str) -> Self {
        Self::new(
            id,
            TrackKind::Video,
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90_000,
                ..Default::default()
            },
        )
    }

    pub fn sample_track(&self) -> Arc<TrackLocalStaticSample> {
        self.rtc.clone()
    }

    /// Push one encoded sample. Muted or stopped tracks silently drop it.
    pub async fn write_sample(&self, sample: &Sample) -> Result<(), CallError> {
        if !self.is_live() || !self.is_enabled() {
            return Ok(());
        }
        self.rtc.write_sample(sample).await.map_err(engine_err)
    }
}

impl LocalTrack for RtcLocalTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.live.store(false, Ordering::SeqCst);
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Capture backend producing engine-fed tracks.
///
/// Runs in a native process, so the secure-context and capture-support
/// preconditions always hold; device-level failures surface when the capture
/// loop attached to a track cannot start.
pub struct RtcMediaSource;

impl RtcMediaSource {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RtcMediaSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaSource for RtcMediaSource {
    fn is_secure_context(&self) -> bool {
        true
    }

    fn has_capture_support(&self) -> bool {
        true
    }

    async fn acquire_user_media(
        &self,
        profile: &CaptureProfile,
    ) -> Result<Vec<Arc<dyn LocalTrack>>, MediaError> {
        let mut tracks: Vec<Arc<dyn LocalTrack>> = Vec::new();
        if profile.audio.is_some() {
            tracks.push(Arc::new(RtcLocalTrack::audio("mic")));
        }
        if profile.video.is_some() {
            tracks.push(Arc::new(RtcLocalTrack::video("camera")));
        }
        Ok(tracks)
    }

    async fn acquire_display_media(&self) -> Result<Vec<Arc<dyn LocalTrack>>, MediaError> {
        Ok(vec![Arc::new(RtcLocalTrack::video("screen"))])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_state_mapping() {
        assert_eq!(
            map_peer_state(RTCPeerConnectionState::Connected),
            PeerConnectionState::Connected
        );
        assert_eq!(
            map_peer_state(RTCPeerConnectionState::Unspecified),
            PeerConnectionState::New
        );
        assert_eq!(
            map_peer_state(RTCPeerConnectionState::Failed),
            PeerConnectionState::Failed
        );
    }

    #[test]
    fn test_ice_state_mapping() {
        assert_eq!(
            map_ice_state(RTCIceConnectionState::Checking),
            IceConnectionState::Checking
        );
        assert_eq!(
            map_ice_state(RTCIceConnectionState::Completed),
            IceConnectionState::Completed
        );
    }

    #[test]
    fn test_local_track_enable_and_stop() {
        let track = RtcLocalTrack::audio("mic");
        assert!(track.is_enabled());
        assert!(track.is_live());

        track.set_enabled(false);
        assert!(!track.is_enabled());
        assert!(track.is_live());

        track.stop();
        assert!(!track.is_live());
    }

    #[tokio::test]
    async fn test_media_source_track_kinds() {
        let source = RtcMediaSource::new();

        let audio_only = source
            .acquire_user_media(&CaptureProfile::for_kind(crate::types::MediaKind::Audio))
            .await
            .unwrap();
        assert_eq!(audio_only.len(), 1);
        assert_eq!(audio_only[0].kind(), TrackKind::Audio);

        let with_video = source
            .acquire_user_media(&CaptureProfile::for_kind(crate::types::MediaKind::Video))
            .await
            .unwrap();
        assert_eq!(with_video.len(), 2);

        let screen = source.acquire_display_media().await.unwrap();
        assert_eq!(screen[0].kind(), TrackKind::Video);
    }
}
