//! Peer session lifecycle.
//!
//! [`PeerSession`] wraps one peer connection for one call: it owns the
//! offer/answer exchange for its negotiation role, buffers remote ICE
//! candidates that arrive before the remote description, and handles the
//! outbound video-track swap used for screen sharing. The connection itself
//! lives behind the [`PeerEngine`]/[`PeerConnection`] seam so the session
//! logic and the call manager never touch the engine crate directly.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};
use tokio::sync::mpsc;

use super::error::CallError;
use super::media::{LocalTrack, TrackKind};
use crate::types::{CallRole, IceCandidate, Sdp, SdpKind};

/// Aggregate connection state reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// ICE transport state reported by the engine. Logged for diagnosis; call
/// outcome decisions key off [`PeerConnectionState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

/// An inbound media track announced by the remote peer.
#[derive(Debug, Clone)]
pub struct RemoteTrackInfo {
    pub ssrc: u32,
    pub kind: TrackKind,
}

/// Asynchronous notifications from a live peer connection.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    RemoteTrack(RemoteTrackInfo),
    LocalCandidate(IceCandidate),
    ConnectionState(PeerConnectionState),
    IceState(IceConnectionState),
}

/// One STUN or TURN server entry.
#[derive(Debug, Clone, Default)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

/// Engine-level configuration for a new peer connection.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub ice_servers: Vec<IceServer>,
}

/// Factory for peer connections.
#[async_trait]
pub trait PeerEngine: Send + Sync {
    /// Create a connection. Events flow into `events` until the connection
    /// is closed; the sender is dropped with the connection.
    async fn connect(
        &self,
        config: &EngineConfig,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Box<dyn PeerConnection>, CallError>;
}

/// One live peer connection.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_track(&self, track: Arc<dyn LocalTrack>) -> Result<(), CallError>;
    async fn create_offer(&self) -> Result<Sdp, CallError>;
    async fn create_answer(&self) -> Result<Sdp, CallError>;
    async fn set_remote_description(&self, sdp: Sdp) -> Result<(), CallError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), CallError>;
    /// Swap the outbound video track without renegotiating. `Ok(false)` when
    /// the connection has no video sender.
    async fn replace_video_track(&self, track: Arc<dyn LocalTrack>) -> Result<bool, CallError>;
    async fn close(&self);
}

/// Per-call negotiation session.
pub struct PeerSession {
    role: CallRole,
    engine: Arc<dyn PeerEngine>,
    conn: Option<Box<dyn PeerConnection>>,
    pending_candidates: VecDeque<IceCandidate>,
    have_remote_description: bool,
}

impl PeerSession {
    pub fn new(role: CallRole, engine: Arc<dyn PeerEngine>) -> Self {
        Self {
            role,
            engine,
            conn: None,
            pending_candidates: VecDeque::new(),
            have_remote_description: false,
        }
    }

    pub fn role(&self) -> CallRole {
        self.role
    }

    pub fn is_open(&self) -> bool {
        self.conn.is_some()
    }

    /// Open the connection and attach the local tracks.
    ///
    /// Any previously open connection is closed first so a session never
    /// holds two engine connections at once.
    pub async fn open(
        &mut self,
        config: &EngineConfig,
        tracks: &[Arc<dyn LocalTrack>],
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<(), CallError> {
        if let Some(old) = self.conn.take() {
            debug!("closing stale peer connection before reopening");
            old.close().await;
            self.have_remote_description = false;
            self.pending_candidates.clear();
        }

        let conn = self.engine.connect(config, events).await?;
        for track in tracks {
            conn.add_track(track.clone()).await?;
        }
        self.conn = Some(conn);
        Ok(())
    }

    /// Produce the local offer. Initiator only.
    pub async fn create_offer(&mut self) -> Result<Sdp, CallError> {
        if self.role != CallRole::Initiator {
            return Err(CallError::WrongRole(self.role));
        }
        let conn = self.conn.as_ref().ok_or(CallError::NotOpen)?;
        let offer = conn.create_offer().await?;
        debug_assert_eq!(offer.kind, SdpKind::Offer);
        Ok(offer)
    }

    /// Apply the remote offer and produce the local answer. Receiver only.
    pub async fn accept_offer(&mut self, offer: Sdp) -> Result<Sdp, CallError> {
        if self.role != CallRole::Receiver {
            return Err(CallError::WrongRole(self.role));
        }
        if offer.kind != SdpKind::Offer {
            return Err(CallError::Negotiation(
                "remote description is not an offer".into(),
            ));
        }
        self.apply_remote_description(offer).await?;
        let conn = self.conn.as_ref().ok_or(CallError::NotOpen)?;
        let answer = conn.create_answer().await?;
        debug_assert_eq!(answer.kind, SdpKind::Answer);
        Ok(answer)
    }

    /// Apply the remote answer. Initiator only.
    pub async fn set_answer(&mut self, answer: Sdp) -> Result<(), CallError> {
        if self.role != CallRole::Initiator {
            return Err(CallError::WrongRole(self.role));
        }
        if answer.kind != SdpKind::Answer {
            return Err(CallError::Negotiation(
                "remote description is not an answer".into(),
            ));
        }
        self.apply_remote_description(answer).await
    }

    async fn apply_remote_description(&mut self, sdp: Sdp) -> Result<(), CallError> {
        let conn = self.conn.as_ref().ok_or(CallError::NotOpen)?;
        conn.set_remote_description(sdp).await?;
        self.have_remote_description = true;
        self.drain_pending_candidates().await;
        Ok(())
    }

    /// Hand a remote candidate to the connection, or buffer it if the remote
    /// description has not arrived yet. Buffered candidates are applied in
    /// arrival order exactly once, right after the description is set.
    pub async fn add_remote_candidate(&mut self, candidate: IceCandidate) {
        if !self.have_remote_description {
            debug!("buffering remote candidate (no remote description yet)");
            self.pending_candidates.push_back(candidate);
            return;
        }
        self.apply_candidate(candidate).await;
    }

    async fn drain_pending_candidates(&mut self) {
        if self.pending_candidates.is_empty() {
            return;
        }
        debug!(
            "draining {} buffered remote candidate(s)",
            self.pending_candidates.len()
        );
        let pending = std::mem::take(&mut self.pending_candidates);
        for candidate in pending {
            self.apply_candidate(candidate).await;
        }
    }

    // A malformed or late candidate must not take the call down.
    async fn apply_candidate(&self, candidate: IceCandidate) {
        let Some(conn) = self.conn.as_ref() else {
            debug!("dropping remote candidate, connection closed");
            return;
        };
        if let Err(e) = conn.add_ice_candidate(candidate).await {
            warn!("failed to add remote ICE candidate: {e}");
        }
    }

    /// Swap the outbound video track. `Ok(false)` when there is no video
    /// sender to swap on.
    pub async fn replace_video_track(
        &self,
        track: Arc<dyn LocalTrack>,
    ) -> Result<bool, CallError> {
        let conn = self.conn.as_ref().ok_or(CallError::NotOpen)?;
        conn.replace_video_track(track).await
    }

    /// Close the connection. Safe on a never-opened or already-closed
    /// session.
    pub async fn close(&mut self) {
        self.pending_candidates.clear();
        self.have_remote_description = false;
        if let Some(conn) = self.conn.take() {
            conn.close().await;
            debug!("peer connection closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{FakeTrack, MockPeerEngine};

    fn events() -> mpsc::UnboundedSender<PeerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        // Keep the receiver alive so sends do not error.
        std::mem::forget(rx);
        tx
    }

    async fn open_session(role: CallRole, engine: &Arc<MockPeerEngine>) -> PeerSession {
        let mut session = PeerSession::new(role, engine.clone() as Arc<dyn PeerEngine>);
        session
            .open(&EngineConfig::default(), &[], events())
            .await
            .unwrap();
        session
    }

    #[tokio::test]
    async fn test_offer_requires_initiator_role() {
        let engine = Arc::new(MockPeerEngine::new());
        let mut session = open_session(CallRole::Receiver, &engine).await;

        let err = session.create_offer().await.unwrap_err();
        assert!(matches!(err, CallError::WrongRole(CallRole::Receiver)));
    }

    #[tokio::test]
    async fn test_answer_requires_receiver_role() {
        let engine = Arc::new(MockPeerEngine::new());
        let mut session = open_session(CallRole::Initiator, &engine).await;

        let err = session
            .accept_offer(Sdp::offer("v=0\r\n"))
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::WrongRole(CallRole::Initiator)));
    }

    #[tokio::test]
    async fn test_wrong_sdp_kind_rejected() {
        let engine = Arc::new(MockPeerEngine::new());
        let mut session = open_session(CallRole::Initiator, &engine).await;

        let err = session.set_answer(Sdp::offer("v=0\r\n")).await.unwrap_err();
        assert!(matches!(err, CallError::Negotiation(_)));
    }

    #[tokio::test]
    async fn test_operations_before_open_fail() {
        let engine = Arc::new(MockPeerEngine::new());
        let mut session = PeerSession::new(CallRole::Initiator, engine as Arc<dyn PeerEngine>);

        assert!(matches!(
            session.create_offer().await.unwrap_err(),
            CallError::NotOpen
        ));
    }

    #[tokio::test]
    async fn test_candidates_buffered_until_remote_description() {
        let engine = Arc::new(MockPeerEngine::new());
        let mut session = open_session(CallRole::Initiator, &engine).await;
        session.create_offer().await.unwrap();

        session.add_remote_candidate(IceCandidate::new("candidate:1")).await;
        session.add_remote_candidate(IceCandidate::new("candidate:2")).await;
        assert!(engine.applied_candidates().is_empty());

        session.set_answer(Sdp::answer("v=0\r\n")).await.unwrap();

        // Drained once, in arrival order.
        let applied = engine.applied_candidates();
        assert_eq!(applied, vec!["candidate:1", "candidate:2"]);
    }

    #[tokio::test]
    async fn test_candidates_after_description_apply_directly() {
        let engine = Arc::new(MockPeerEngine::new());
        let mut session = open_session(CallRole::Initiator, &engine).await;
        session.create_offer().await.unwrap();
        session.set_answer(Sdp::answer("v=0\r\n")).await.unwrap();

        session.add_remote_candidate(IceCandidate::new("candidate:3")).await;
        assert_eq!(engine.applied_candidates(), vec!["candidate:3"]);
    }

    #[tokio::test]
    async fn test_candidate_failure_is_swallowed() {
        let engine = Arc::new(MockPeerEngine::new().failing_candidates());
        let mut session = open_session(CallRole::Initiator, &engine).await;
        session.create_offer().await.unwrap();
        session.set_answer(Sdp::answer("v=0\r\n")).await.unwrap();

        // Must not error or panic.
        session.add_remote_candidate(IceCandidate::new("bad")).await;
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_safe_when_never_opened() {
        let engine = Arc::new(MockPeerEngine::new());
        let mut never_opened =
            PeerSession::new(CallRole::Receiver, engine.clone() as Arc<dyn PeerEngine>);
        never_opened.close().await;

        let mut session = open_session(CallRole::Receiver, &engine).await;
        session.close().await;
        session.close().await;
        assert!(!session.is_open());
        assert_eq!(engine.close_count(), 1);
    }

    #[tokio::test]
    async fn test_reopen_closes_previous_connection() {
        let engine = Arc::new(MockPeerEngine::new());
        let mut session = open_session(CallRole::Initiator, &engine).await;

        session
            .open(&EngineConfig::default(), &[], events())
            .await
            .unwrap();
        assert_eq!(engine.close_count(), 1);
        assert!(session.is_open());
    }

    #[tokio::test]
    async fn test_tracks_attached_on_open() {
        let engine = Arc::new(MockPeerEngine::new());
        let mut session = PeerSession::new(CallRole::Initiator, engine.clone() as Arc<dyn PeerEngine>);
        let tracks: Vec<Arc<dyn LocalTrack>> = vec![
            Arc::new(FakeTrack::audio("mic")),
            Arc::new(FakeTrack::video("cam")),
        ];

        session
            .open(&EngineConfig::default(), &tracks, events())
            .await
            .unwrap();
        assert_eq!(engine.added_tracks(), vec!["mic", "cam"]);
    }
}
