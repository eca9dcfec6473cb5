//! Shared mock collaborators for unit and integration tests.

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::api::{ApiError, CallRecordApi};
use crate::calls::error::{CallError, MediaError};
use crate::calls::media::{CaptureProfile, LocalTrack, MediaSource, TrackKind};
use crate::calls::peer::{EngineConfig, PeerConnection, PeerEngine, PeerEvent};
use crate::transport::{OutboundSignal, SignalingTransport, TransportError};
use crate::types::{CallId, MediaKind, Sdp, UserId};

/// In-memory track with no device behind it.
pub struct FakeTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    live: AtomicBool,
}

impl FakeTrack {
    pub fn audio(id: &str) -> Self {
        Self::new(id, TrackKind::Audio)
    }

    pub fn video(id: &str) -> Self {
        Self::new(id, TrackKind::Video)
    }

    fn new(id: &str, kind: TrackKind) -> Self {
        Self {
            id: id.to_owned(),
            kind,
            enabled: AtomicBool::new(true),
            live: AtomicBool::new(true),
        }
    }
}

impl LocalTrack for FakeTrack {
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

/// Configurable capture backend.
pub struct MockMediaSource {
    secure: bool,
    capture: bool,
    fail_with: Option<MediaError>,
    delay: Option<Duration>,
    acquisitions: AtomicUsize,
    created: Mutex<Vec<Arc<FakeTrack>>>,
}

impl MockMediaSource {
    pub fn new() -> Self {
        Self {
            secure: true,
            capture: true,
            fail_with: None,
            delay: None,
            acquisitions: AtomicUsize::new(0),
            created: Mutex::new(Vec::new()),
        }
    }

    pub fn insecure(mut self) -> Self {
        self.secure = false;
        self
    }

    pub fn without_capture(mut self) -> Self {
        self.capture = false;
        self
    }

    pub fn failing_with(mut self, error: MediaError) -> Self {
        self.fail_with = Some(error);
        self
    }

    /// Simulate slow device startup.
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn acquisition_count(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }

    /// Look up a previously created track by id.
    pub fn track(&self, id: &str) -> Option<Arc<FakeTrack>> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .find(|t| t.id == id)
            .cloned()
    }

    fn create(&self, track: FakeTrack) -> Arc<dyn LocalTrack> {
        let track = Arc::new(track);
        self.created.lock().unwrap().push(track.clone());
        track
    }
}

impl Default for MockMediaSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaSource for MockMediaSource {
    fn is_secure_context(&self) -> bool {
        self.secure
    }

    fn has_capture_support(&self) -> bool {
        self.capture
    }

    async fn acquire_user_media(
        &self,
        profile: &CaptureProfile,
    ) -> Result<Vec<Arc<dyn LocalTrack>>, MediaError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.fail_with {
            return Err(error);
        }
        let n = self.acquisitions.fetch_add(1, Ordering::SeqCst);
        let mut tracks: Vec<Arc<dyn LocalTrack>> = Vec::new();
        if profile.audio.is_some() {
            tracks.push(self.create(FakeTrack::audio(&format!("mic-{n}"))));
        }
        if profile.video.is_some() {
            tracks.push(self.create(FakeTrack::video(&format!("camera-{n}"))));
        }
        Ok(tracks)
    }

    async fn acquire_display_media(&self) -> Result<Vec<Arc<dyn LocalTrack>>, MediaError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.fail_with {
            return Err(error);
        }
        let n = self.acquisitions.fetch_add(1, Ordering::SeqCst);
        Ok(vec![self.create(FakeTrack::video(&format!("screen-{n}")))])
    }
}

#[derive(Default)]
struct MockPeerInner {
    added_tracks: Mutex<Vec<(String, TrackKind)>>,
    candidates: Mutex<Vec<String>>,
    remote_descriptions: Mutex<Vec<Sdp>>,
    replaced_tracks: Mutex<Vec<String>>,
    close_count: AtomicUsize,
    fail_candidates: AtomicBool,
    events: Mutex<Option<mpsc::UnboundedSender<PeerEvent>>>,
}

/// Scripted peer engine whose connections record everything they are asked
/// to do and let tests inject peer events.
#[derive(Default)]
pub struct MockPeerEngine {
    inner: Arc<MockPeerInner>,
}

impl MockPeerEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_candidates(self) -> Self {
        self.inner.fail_candidates.store(true, Ordering::SeqCst);
        self
    }

    pub fn added_tracks(&self) -> Vec<String> {
        self.inner
            .added_tracks
            .lock()
            .unwrap()
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn applied_candidates(&self) -> Vec<String> {
        self.inner.candidates.lock().unwrap().clone()
    }

    pub fn remote_descriptions(&self) -> Vec<Sdp> {
        self.inner.remote_descriptions.lock().unwrap().clone()
    }

    pub fn replaced_tracks(&self) -> Vec<String> {
        self.inner.replaced_tracks.lock().unwrap().clone()
    }

    pub fn close_count(&self) -> usize {
        self.inner.close_count.load(Ordering::SeqCst)
    }

    /// Sender for the most recently opened connection, for driving
    /// connection-state and remote-track events from tests.
    pub fn events(&self) -> Option<mpsc::UnboundedSender<PeerEvent>> {
        self.inner.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl PeerEngine for MockPeerEngine {
    async fn connect(
        &self,
        _config: &EngineConfig,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Box<dyn PeerConnection>, CallError> {
        *self.inner.events.lock().unwrap() = Some(events);
        Ok(Box::new(MockPeerConnection {
            inner: self.inner.clone(),
        }))
    }
}

struct MockPeerConnection {
    inner: Arc<MockPeerInner>,
}

#[async_trait]
impl PeerConnection for MockPeerConnection {
    async fn add_track(&self, track: Arc<dyn LocalTrack>) -> Result<(), CallError> {
        self.inner
            .added_tracks
            .lock()
            .unwrap()
            .push((track.id().to_owned(), track.kind()));
        Ok(())
    }

    async fn create_offer(&self) -> Result<Sdp, CallError> {
        Ok(Sdp::offer("v=0\r\nmock offer\r\n"))
    }

    async fn create_answer(&self) -> Result<Sdp, CallError> {
        Ok(Sdp::answer("v=0\r\nmock answer\r\n"))
    }

    async fn set_remote_description(&self, sdp: Sdp) -> Result<(), CallError> {
        self.inner.remote_descriptions.lock().unwrap().push(sdp);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: crate::types::IceCandidate) -> Result<(), CallError> {
        if self.inner.fail_candidates.load(Ordering::SeqCst) {
            return Err(CallError::Engine("candidate rejected".into()));
        }
        self.inner
            .candidates
            .lock()
            .unwrap()
            .push(candidate.candidate);
        Ok(())
    }

    async fn replace_video_track(&self, track: Arc<dyn LocalTrack>) -> Result<bool, CallError> {
        let has_video_sender = self
            .inner
            .added_tracks
            .lock()
            .unwrap()
            .iter()
            .any(|(_, kind)| *kind == TrackKind::Video);
        if !has_video_sender {
            return Ok(false);
        }
        self.inner
            .replaced_tracks
            .lock()
            .unwrap()
            .push(track.id().to_owned());
        Ok(true)
    }

    async fn close(&self) {
        self.inner.close_count.fetch_add(1, Ordering::SeqCst);
    }
}

/// Transport that records every outbound signal.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<OutboundSignal>>,
    fail: AtomicBool,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(self) -> Self {
        self.fail.store(true, Ordering::SeqCst);
        self
    }

    pub fn sent(&self) -> Vec<OutboundSignal> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_event_names(&self) -> Vec<&'static str> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(OutboundSignal::event_name)
            .collect()
    }
}

#[async_trait]
impl SignalingTransport for RecordingTransport {
    async fn send(&self, signal: OutboundSignal) -> Result<(), TransportError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        self.sent.lock().unwrap().push(signal);
        Ok(())
    }
}

/// Call-record API that echoes the client call id and records every call.
#[derive(Default)]
pub struct MockRecordApi {
    calls: Mutex<Vec<String>>,
    fail_initiate: AtomicBool,
}

impl MockRecordApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_initiate(self) -> Self {
        self.fail_initiate.store(true, Ordering::SeqCst);
        self
    }

    /// Actions recorded as `"<action> <call id>"`, in order.
    pub fn recorded(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, action: &str, call_id: &CallId) {
        self.calls.lock().unwrap().push(format!("{action} {call_id}"));
    }
}

#[async_trait]
impl CallRecordApi for MockRecordApi {
    async fn initiate(
        &self,
        call_id: &CallId,
        _callee: &UserId,
        _media_kind: MediaKind,
    ) -> Result<CallId, ApiError> {
        if self.fail_initiate.load(Ordering::SeqCst) {
            return Err(ApiError::Status(500));
        }
        self.record("initiate", call_id);
        Ok(call_id.clone())
    }

    async fn accept(&self, call_id: &CallId) -> Result<(), ApiError> {
        self.record("accept", call_id);
        Ok(())
    }

    async fn reject(&self, call_id: &CallId) -> Result<(), ApiError> {
        self.record("reject", call_id);
        Ok(())
    }

    async fn end(&self, call_id: &CallId) -> Result<(), ApiError> {
        self.record("end", call_id);
        Ok(())
    }
}
