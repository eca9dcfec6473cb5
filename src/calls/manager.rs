//! Call manager for orchestrating call lifecycle.
//!
//! The manager owns the single active-call slot and is the only mutator of
//! call state. UI intents and transport callbacks request transitions; the
//! manager reconciles them against the state machine, drives the peer session
//! and media acquisition, and guarantees every exit path releases the call's
//! resources exactly once.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use log::{debug, info, warn};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use super::error::{CallError, MediaError};
use super::events::{CallEnded, CallEventBus, CallSnapshot, IncomingCall, RemoteTrackArrived};
use super::media::{LocalTrack, MediaAcquirer, MediaHandle, MediaSource};
use super::peer::{
    EngineConfig, IceServer, PeerConnectionState, PeerEngine, PeerEvent, PeerSession,
};
use super::state::{CallEndReason, CallSession, CallState, CallTransition};
use crate::api::CallRecordApi;
use crate::transport::{
    CallAcceptedSignal, IceCandidateSignal, InboundSignal, IncomingCallSignal, OutboundSignal,
    SignalHandler, SignalingTransport, UserUnavailableSignal,
};
use crate::types::{CallId, CallRole, MediaKind, Sdp, UserId};

/// Configuration for the call manager.
#[derive(Debug, Clone)]
pub struct CallManagerConfig {
    /// Seconds a ringing call waits for an answer before giving up.
    pub ring_timeout_secs: u64,
    /// STUN/TURN servers handed to every peer connection.
    pub ice_servers: Vec<IceServer>,
}

impl Default for CallManagerConfig {
    fn default() -> Self {
        Self {
            ring_timeout_secs: 45,
            ice_servers: vec![IceServer {
                urls: vec!["stun:stun.l.google.com:19302".to_string()],
                ..Default::default()
            }],
        }
    }
}

/// Screen-share bookkeeping: the display handle plus the camera track to put
/// back when sharing stops.
struct ScreenShare {
    handle: MediaHandle,
    restore: Option<Arc<dyn LocalTrack>>,
}

/// Everything owned by the one in-flight call.
struct ActiveCall {
    /// Stale-result guard: awaited work re-checks this before mutating.
    epoch: u64,
    session: CallSession,
    peer: PeerSession,
    media: Option<MediaHandle>,
    screen: Option<ScreenShare>,
    peer_events: mpsc::UnboundedSender<PeerEvent>,
    pump: JoinHandle<()>,
}

/// Orchestrates the call lifecycle for one client.
pub struct CallManager {
    our_user: UserId,
    config: CallManagerConfig,
    engine: Arc<dyn PeerEngine>,
    media: MediaAcquirer,
    transport: Arc<dyn SignalingTransport>,
    records: Arc<dyn CallRecordApi>,
    events: CallEventBus,
    active: Mutex<Option<ActiveCall>>,
    next_epoch: AtomicU64,
}

impl CallManager {
    pub fn new(
        our_user: UserId,
        config: CallManagerConfig,
        engine: Arc<dyn PeerEngine>,
        media_source: Arc<dyn MediaSource>,
        transport: Arc<dyn SignalingTransport>,
        records: Arc<dyn CallRecordApi>,
    ) -> Arc<Self> {
        Arc::new(Self {
            our_user,
            config,
            engine,
            media: MediaAcquirer::new(media_source),
            transport,
            records,
            events: CallEventBus::new(),
            active: Mutex::new(None),
            next_epoch: AtomicU64::new(1),
        })
    }

    pub fn our_user(&self) -> &UserId {
        &self.our_user
    }

    pub fn events(&self) -> &CallEventBus {
        &self.events
    }

    /// Snapshot of the in-flight call, if any.
    pub async fn current_call(&self) -> Option<CallSession> {
        self.active.lock().await.as_ref().map(|ac| ac.session.clone())
    }

    /// Adapter feeding validated inbound signals into this manager.
    pub fn signal_handler(self: &Arc<Self>) -> Arc<dyn SignalHandler> {
        Arc::new(ManagerSignalHandler(self.clone()))
    }

    // ---- local intents ----

    /// Start an outgoing call: acquire media, record it server-side, open the
    /// peer session and send the offer.
    pub async fn start_call(
        self: &Arc<Self>,
        callee: UserId,
        media_kind: MediaKind,
    ) -> Result<CallId, CallError> {
        let call_id = CallId::generate();
        let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
        {
            let mut active = self.active.lock().await;
            if active.is_some() {
                return Err(CallError::CallInProgress);
            }
            let (peer_events, pump) = self.spawn_event_pump(epoch);
            let session =
                CallSession::new_outgoing(call_id.clone(), callee.clone(), media_kind);
            self.emit_phase(&session);
            *active = Some(ActiveCall {
                epoch,
                session,
                peer: PeerSession::new(CallRole::Initiator, self.engine.clone()),
                media: None,
                screen: None,
                peer_events,
                pump,
            });
        }
        info!("starting {media_kind:?} call {call_id} to {callee}");

        let media = match self.media.acquire(media_kind).await {
            Ok(media) => media,
            Err(e) => {
                self.fail(epoch, CallEndReason::Media(e)).await;
                return Err(e.into());
            }
        };
        {
            let mut active = self.active.lock().await;
            let Some(ac) = active.as_mut().filter(|ac| ac.epoch == epoch) else {
                // Cancelled while acquiring; the handle drops and releases.
                return Err(CallError::NotFound(call_id.to_string()));
            };
            ac.media = Some(media);
        }

        // The server is the authority on the call id; adopt whatever it
        // returns before the offer goes out.
        let call_id = match self.records.initiate(&call_id, &callee, media_kind).await {
            Ok(authoritative) => authoritative,
            Err(e) => {
                warn!("call record initiate failed: {e}");
                self.fail(epoch, CallEndReason::SetupFailed).await;
                return Err(CallError::RecordApi(e.to_string()));
            }
        };

        let offer = {
            let mut active = self.active.lock().await;
            let Some(ac) = active.as_mut().filter(|ac| ac.epoch == epoch) else {
                return Err(CallError::NotFound(call_id.to_string()));
            };
            if ac.session.call_id != call_id {
                debug!("adopting server call id {call_id}");
                ac.session.call_id = call_id.clone();
            }
            let result = match self.negotiate_open(ac).await {
                Ok(()) => ac.peer.create_offer().await,
                Err(e) => Err(e),
            };
            match result {
                Ok(offer) => offer,
                Err(e) => {
                    drop(active);
                    self.fail(epoch, CallEndReason::NegotiationFailed).await;
                    return Err(e);
                }
            }
        };

        let signal = OutboundSignal::CallUser {
            callee_id: callee,
            offer_sdp: offer,
            media_kind,
            call_id: call_id.clone(),
        };
        if let Err(e) = self.transport.send(signal).await {
            self.fail(epoch, CallEndReason::SetupFailed).await;
            return Err(CallError::Transport(e.to_string()));
        }

        {
            let mut active = self.active.lock().await;
            if let Some(ac) = active.as_mut().filter(|ac| ac.epoch == epoch) {
                ac.session.apply_transition(CallTransition::OfferSent)?;
                self.emit_phase(&ac.session);
            }
        }
        self.arm_ring_timeout(epoch);
        Ok(call_id)
    }

    /// Accept the ringing incoming call. If the offer SDP has not arrived
    /// yet, the accept is recorded and negotiation resumes when it does.
    pub async fn accept_call(self: &Arc<Self>) -> Result<(), CallError> {
        let (epoch, offer) = {
            let mut active = self.active.lock().await;
            let ac = active.as_mut().ok_or(CallError::NotInCall)?;
            let offer = match &ac.session.state {
                CallState::IncomingRinging { offer, .. } => offer.clone(),
                _ => None,
            };
            ac.session.apply_transition(CallTransition::LocalAccepted)?;
            self.emit_phase(&ac.session);
            match offer {
                Some(offer) => (ac.epoch, offer),
                None => {
                    info!("accept recorded, waiting for the offer payload");
                    return Ok(());
                }
            }
        };
        self.proceed_accept(epoch, offer).await
    }

    /// Decline the ringing incoming call.
    pub async fn reject_call(&self) -> Result<(), CallError> {
        let ac = {
            let mut active = self.active.lock().await;
            if !active.as_ref().is_some_and(|ac| ac.session.state.can_reject()) {
                return Err(CallError::NotInCall);
            }
            active.take().ok_or(CallError::NotInCall)?
        };

        let to = ac.session.remote.clone();
        let call_id = ac.session.call_id.clone();
        let transport = self.transport.clone();
        let records = self.records.clone();
        tokio::spawn(async move {
            if let Err(e) = transport
                .send(OutboundSignal::RejectCall {
                    to,
                    call_id: call_id.clone(),
                })
                .await
            {
                warn!("failed to send reject signal: {e}");
            }
            if let Err(e) = records.reject(&call_id).await {
                warn!("call record reject failed: {e}");
            }
        });

        self.finish(ac, CallEndReason::LocalRejected).await;
        Ok(())
    }

    /// End (or cancel) the in-flight call.
    pub async fn hang_up(&self) -> Result<(), CallError> {
        let ac = {
            let mut active = self.active.lock().await;
            active.take().ok_or(CallError::NotInCall)?
        };

        let to = ac.session.remote.clone();
        let call_id = ac.session.call_id.clone();
        let transport = self.transport.clone();
        let records = self.records.clone();
        tokio::spawn(async move {
            if let Err(e) = transport
                .send(OutboundSignal::EndCall {
                    to,
                    call_id: call_id.clone(),
                })
                .await
            {
                warn!("failed to send end signal: {e}");
            }
            if let Err(e) = records.end(&call_id).await {
                warn!("call record end failed: {e}");
            }
        });

        self.finish(ac, CallEndReason::LocalHangup).await;
        Ok(())
    }

    /// Mute or unmute the microphone. Valid only while in a call.
    pub async fn set_muted(&self, muted: bool) -> Result<(), CallError> {
        let mut active = self.active.lock().await;
        let ac = active.as_mut().ok_or(CallError::NotInCall)?;
        if !ac.session.state.is_in_call() {
            return Err(CallError::NotInCall);
        }
        if let Some(media) = ac.media.as_ref() {
            media.set_audio_enabled(!muted);
        }
        ac.session
            .apply_transition(CallTransition::AudioMuteChanged { muted })?;
        self.emit_phase(&ac.session);
        Ok(())
    }

    /// Turn the camera on or off. Valid only while in a call.
    pub async fn set_video_enabled(&self, enabled: bool) -> Result<(), CallError> {
        let mut active = self.active.lock().await;
        let ac = active.as_mut().ok_or(CallError::NotInCall)?;
        if !ac.session.state.is_in_call() {
            return Err(CallError::NotInCall);
        }
        if let Some(media) = ac.media.as_ref() {
            media.set_video_enabled(enabled);
        }
        ac.session
            .apply_transition(CallTransition::VideoStateChanged { off: !enabled })?;
        self.emit_phase(&ac.session);
        Ok(())
    }

    /// Swap the outgoing video track for a display capture. A failed or
    /// cancelled capture leaves the call untouched.
    pub async fn start_screen_share(&self) -> Result<(), CallError> {
        let epoch = {
            let active = self.active.lock().await;
            let ac = active.as_ref().ok_or(CallError::NotInCall)?;
            match ac.session.state {
                CallState::Connecting {
                    screen_sharing: false,
                    ..
                }
                | CallState::Active {
                    screen_sharing: false,
                    ..
                } => ac.epoch,
                CallState::Connecting { .. } | CallState::Active { .. } => {
                    debug!("already screen sharing");
                    return Ok(());
                }
                _ => return Err(CallError::NotInCall),
            }
        };

        let handle = self.media.acquire_screen().await?;

        let mut active = self.active.lock().await;
        let Some(ac) = active.as_mut().filter(|ac| ac.epoch == epoch) else {
            return Err(CallError::NotInCall);
        };
        let Some(screen_track) = handle.video_track().cloned() else {
            return Err(MediaError::DeviceNotFound.into());
        };
        if !ac.peer.replace_video_track(screen_track).await? {
            return Err(CallError::Negotiation(
                "no outgoing video track to replace".into(),
            ));
        }
        let restore = ac.media.as_ref().and_then(|m| m.video_track().cloned());
        ac.screen = Some(ScreenShare { handle, restore });
        ac.session
            .apply_transition(CallTransition::ScreenShareChanged { sharing: true })?;
        self.emit_phase(&ac.session);
        Ok(())
    }

    /// Stop sharing and put the camera back on the outgoing sender. If the
    /// original camera track is gone, a fresh one is acquired.
    pub async fn stop_screen_share(&self) -> Result<(), CallError> {
        let (epoch, restore) = {
            let mut active = self.active.lock().await;
            let ac = active.as_mut().ok_or(CallError::NotInCall)?;
            let Some(mut screen) = ac.screen.take() else {
                debug!("not screen sharing");
                return Ok(());
            };
            screen.handle.release();
            (ac.epoch, screen.restore.filter(|t| t.is_live()))
        };

        let (camera, fresh) = match restore {
            Some(track) => (track, None),
            None => {
                let fresh = self.media.acquire_camera().await?;
                let Some(track) = fresh.video_track().cloned() else {
                    return Err(MediaError::DeviceNotFound.into());
                };
                (track, Some(fresh))
            }
        };

        let mut active = self.active.lock().await;
        let Some(ac) = active.as_mut().filter(|ac| ac.epoch == epoch) else {
            return Err(CallError::NotInCall);
        };
        ac.peer.replace_video_track(camera).await?;
        if let Some(fresh) = fresh {
            match ac.media.as_mut() {
                Some(media) => media.absorb(fresh),
                None => ac.media = Some(fresh),
            }
        }
        ac.session
            .apply_transition(CallTransition::ScreenShareChanged { sharing: false })?;
        self.emit_phase(&ac.session);
        Ok(())
    }

    // ---- inbound signaling ----

    pub async fn handle_signal(self: &Arc<Self>, signal: InboundSignal) {
        match signal {
            InboundSignal::IncomingCall(sig) => self.handle_incoming(sig).await,
            InboundSignal::CallAccepted(sig) => self.handle_accepted(sig).await,
            InboundSignal::IceCandidate(sig) => self.handle_remote_candidate(sig).await,
            InboundSignal::CallRejected(sig) => {
                self.end_matching(&sig.call_id, CallEndReason::RemoteRejected)
                    .await;
            }
            InboundSignal::CallEnded(sig) => {
                self.end_matching(&sig.call_id, CallEndReason::RemoteHangup)
                    .await;
            }
            InboundSignal::UserBusy(sig) => {
                self.end_matching(&sig.call_id, CallEndReason::Busy).await;
            }
            InboundSignal::UserUnavailable(sig) => self.handle_unavailable(sig).await,
        }
    }

    async fn handle_incoming(self: &Arc<Self>, sig: IncomingCallSignal) {
        let mut active = self.active.lock().await;
        match active.as_mut() {
            Some(ac) if ac.session.call_id == sig.call_id => {
                // The offer SDP trailing an earlier ring notice.
                let Some(offer) = sig.offer_sdp else {
                    debug!("duplicate ring notice for call {}", sig.call_id);
                    return;
                };
                let accept_pending = matches!(
                    ac.session.state,
                    CallState::IncomingRinging {
                        accept_pending: true,
                        ..
                    }
                );
                if ac
                    .session
                    .apply_transition(CallTransition::OfferPayloadArrived {
                        offer: offer.clone(),
                    })
                    .is_err()
                {
                    debug!("ignoring repeated offer payload for call {}", sig.call_id);
                    return;
                }
                self.emit_phase(&ac.session);
                if accept_pending
                    && ac
                        .session
                        .apply_transition(CallTransition::LocalAccepted)
                        .is_ok()
                {
                    self.emit_phase(&ac.session);
                    let epoch = ac.epoch;
                    drop(active);
                    if let Err(e) = self.proceed_accept(epoch, offer).await {
                        warn!("deferred accept failed: {e}");
                    }
                }
            }
            Some(_) => {
                // Single-active-call invariant: auto-reject the newcomer,
                // leave the ongoing call untouched.
                info!(
                    "busy on another call, rejecting incoming call {} from {}",
                    sig.call_id, sig.from
                );
                let transport = self.transport.clone();
                let signal = OutboundSignal::UserBusy {
                    to: sig.from,
                    call_id: sig.call_id,
                };
                tokio::spawn(async move {
                    if let Err(e) = transport.send(signal).await {
                        warn!("failed to send busy signal: {e}");
                    }
                });
            }
            None => {
                let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
                let (peer_events, pump) = self.spawn_event_pump(epoch);
                let session = CallSession::new_incoming(
                    sig.call_id.clone(),
                    sig.from.clone(),
                    sig.media_kind,
                    sig.offer_sdp,
                    sig.caller_name.clone(),
                    sig.caller_avatar.clone(),
                );
                info!("incoming {:?} call {} from {}", sig.media_kind, sig.call_id, sig.from);
                let _ = self.events.incoming.send(Arc::new(IncomingCall {
                    call_id: sig.call_id,
                    caller: sig.from,
                    caller_name: sig.caller_name,
                    caller_avatar: sig.caller_avatar,
                    media_kind: sig.media_kind,
                    received_at: Utc::now(),
                }));
                self.emit_phase(&session);
                *active = Some(ActiveCall {
                    epoch,
                    session,
                    peer: PeerSession::new(CallRole::Receiver, self.engine.clone()),
                    media: None,
                    screen: None,
                    peer_events,
                    pump,
                });
                drop(active);
                self.arm_ring_timeout(epoch);
            }
        }
    }

    async fn handle_accepted(&self, sig: CallAcceptedSignal) {
        let mut active = self.active.lock().await;
        let Some(ac) = active.as_mut() else {
            debug!("ignoring call-accepted with no call in flight");
            return;
        };
        if ac.session.call_id != sig.call_id {
            debug!("ignoring stale call-accepted for {}", sig.call_id);
            return;
        }
        if ac
            .session
            .apply_transition(CallTransition::RemoteAccepted)
            .is_err()
        {
            debug!("ignoring call-accepted in state {:?}", ac.session.state);
            return;
        }
        self.emit_phase(&ac.session);
        if let Err(e) = ac.peer.set_answer(sig.answer_sdp).await {
            warn!("applying remote answer failed: {e}");
            let epoch = ac.epoch;
            drop(active);
            self.fail(epoch, CallEndReason::NegotiationFailed).await;
        }
    }

    async fn handle_remote_candidate(&self, sig: IceCandidateSignal) {
        let mut active = self.active.lock().await;
        match active.as_mut() {
            // Candidates carry no call id; match by sender.
            Some(ac) if ac.session.remote == sig.from => {
                ac.peer.add_remote_candidate(sig.candidate).await;
            }
            _ => debug!("dropping ICE candidate from {} with no matching call", sig.from),
        }
    }

    async fn handle_unavailable(&self, sig: UserUnavailableSignal) {
        let taken = {
            let mut active = self.active.lock().await;
            if active.as_ref().is_some_and(|ac| {
                ac.session.remote == sig.user_id && ac.session.state.is_ringing()
            }) {
                active.take()
            } else {
                None
            }
        };
        if let Some(ac) = taken {
            self.finish(ac, CallEndReason::Unavailable).await;
        }
    }

    async fn end_matching(&self, call_id: &CallId, reason: CallEndReason) {
        let taken = {
            let mut active = self.active.lock().await;
            if active
                .as_ref()
                .is_some_and(|ac| ac.session.call_id == *call_id)
            {
                active.take()
            } else {
                debug!("ignoring {reason:?} for unknown call {call_id}");
                None
            }
        };
        if let Some(ac) = taken {
            self.finish(ac, reason).await;
        }
    }

    // ---- peer events ----

    async fn handle_peer_event(&self, epoch: u64, event: PeerEvent) {
        match event {
            PeerEvent::RemoteTrack(track) => {
                let active = self.active.lock().await;
                if let Some(ac) = active.as_ref().filter(|ac| ac.epoch == epoch) {
                    let _ = self.events.remote_track.send(Arc::new(RemoteTrackArrived {
                        call_id: ac.session.call_id.clone(),
                        track,
                    }));
                }
            }
            PeerEvent::LocalCandidate(candidate) => {
                let to = {
                    let active = self.active.lock().await;
                    match active.as_ref().filter(|ac| ac.epoch == epoch) {
                        Some(ac) => ac.session.remote.clone(),
                        None => return,
                    }
                };
                if let Err(e) = self
                    .transport
                    .send(OutboundSignal::IceCandidate { candidate, to })
                    .await
                {
                    warn!("failed to send ICE candidate: {e}");
                }
            }
            PeerEvent::ConnectionState(state) => {
                self.handle_connection_state(epoch, state).await;
            }
            PeerEvent::IceState(state) => debug!("ICE state: {state:?}"),
        }
    }

    async fn handle_connection_state(&self, epoch: u64, state: PeerConnectionState) {
        match state {
            PeerConnectionState::Connected => {
                let mut active = self.active.lock().await;
                let Some(ac) = active.as_mut().filter(|ac| ac.epoch == epoch) else {
                    return;
                };
                if ac
                    .session
                    .apply_transition(CallTransition::MediaConnected)
                    .is_ok()
                {
                    info!("call {} is active", ac.session.call_id);
                    self.emit_phase(&ac.session);
                }
            }
            // Transient; recovery or Failed will follow.
            PeerConnectionState::Disconnected => {
                warn!("peer connection disconnected, waiting for recovery");
            }
            PeerConnectionState::Failed => {
                self.fail(epoch, CallEndReason::ConnectionFailed).await;
            }
            PeerConnectionState::Closed => {
                self.fail(epoch, CallEndReason::ConnectionClosed).await;
            }
            PeerConnectionState::New | PeerConnectionState::Connecting => {
                debug!("peer connection state: {state:?}");
            }
        }
    }

    // ---- internals ----

    /// Resume an accepted incoming call once media and the offer are in hand.
    async fn proceed_accept(self: &Arc<Self>, epoch: u64, offer: Sdp) -> Result<(), CallError> {
        let (media_kind, call_id, caller) = {
            let active = self.active.lock().await;
            let Some(ac) = active.as_ref().filter(|ac| ac.epoch == epoch) else {
                return Err(CallError::NotInCall);
            };
            (
                ac.session.media_kind,
                ac.session.call_id.clone(),
                ac.session.remote.clone(),
            )
        };

        let media = match self.media.acquire(media_kind).await {
            Ok(media) => media,
            Err(e) => {
                self.fail(epoch, CallEndReason::Media(e)).await;
                return Err(e.into());
            }
        };

        // Record failures do not take the call down.
        if let Err(e) = self.records.accept(&call_id).await {
            warn!("call record accept failed: {e}");
        }

        let answer = {
            let mut active = self.active.lock().await;
            let Some(ac) = active.as_mut().filter(|ac| ac.epoch == epoch) else {
                return Err(CallError::NotInCall);
            };
            // Mute or camera toggles issued while acquisition was in flight
            // only updated the state flags; apply them to the fresh tracks.
            if let CallState::Connecting {
                audio_muted,
                video_off,
                ..
            } = ac.session.state
            {
                media.set_audio_enabled(!audio_muted);
                media.set_video_enabled(!video_off);
            }
            ac.media = Some(media);
            let result = match self.negotiate_open(ac).await {
                Ok(()) => ac.peer.accept_offer(offer).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(answer) => answer,
                Err(e) => {
                    drop(active);
                    self.fail(epoch, CallEndReason::NegotiationFailed).await;
                    return Err(e);
                }
            }
        };

        let signal = OutboundSignal::AnswerCall {
            answer_sdp: answer,
            to: caller,
            call_id,
        };
        if let Err(e) = self.transport.send(signal).await {
            self.fail(epoch, CallEndReason::SetupFailed).await;
            return Err(CallError::Transport(e.to_string()));
        }
        Ok(())
    }

    /// Open the peer connection with the call's local tracks attached.
    async fn negotiate_open(&self, ac: &mut ActiveCall) -> Result<(), CallError> {
        let tracks: Vec<Arc<dyn LocalTrack>> = ac
            .media
            .as_ref()
            .map(|m| m.tracks().to_vec())
            .unwrap_or_default();
        let config = EngineConfig {
            ice_servers: self.config.ice_servers.clone(),
        };
        ac.peer
            .open(&config, &tracks, ac.peer_events.clone())
            .await
    }

    fn spawn_event_pump(
        self: &Arc<Self>,
        epoch: u64,
    ) -> (mpsc::UnboundedSender<PeerEvent>, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let manager = self.clone();
        let pump = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                manager.handle_peer_event(epoch, event).await;
            }
        });
        (tx, pump)
    }

    fn arm_ring_timeout(self: &Arc<Self>, epoch: u64) {
        let manager = self.clone();
        let timeout = Duration::from_secs(self.config.ring_timeout_secs);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            manager.ring_timeout_fired(epoch).await;
        });
    }

    async fn ring_timeout_fired(&self, epoch: u64) {
        let taken = {
            let mut active = self.active.lock().await;
            if active
                .as_ref()
                .is_some_and(|ac| ac.epoch == epoch && ac.session.state.is_ringing())
            {
                active.take()
            } else {
                None
            }
        };
        let Some(ac) = taken else { return };

        info!("call {} rang unanswered, giving up", ac.session.call_id);
        if ac.session.is_initiator() {
            let to = ac.session.remote.clone();
            let call_id = ac.session.call_id.clone();
            let transport = self.transport.clone();
            let records = self.records.clone();
            tokio::spawn(async move {
                if let Err(e) = transport
                    .send(OutboundSignal::EndCall {
                        to,
                        call_id: call_id.clone(),
                    })
                    .await
                {
                    warn!("failed to send end signal: {e}");
                }
                if let Err(e) = records.end(&call_id).await {
                    warn!("call record end failed: {e}");
                }
            });
        }
        self.finish(ac, CallEndReason::RingTimeout).await;
    }

    /// End the call identified by `epoch`, if it is still the one in flight.
    async fn fail(&self, epoch: u64, reason: CallEndReason) {
        let taken = {
            let mut active = self.active.lock().await;
            if active.as_ref().is_some_and(|ac| ac.epoch == epoch) {
                active.take()
            } else {
                None
            }
        };
        if let Some(ac) = taken {
            self.finish(ac, reason).await;
        }
    }

    /// Tear down a call removed from the slot: close the connection, release
    /// every track, and announce the end exactly once.
    async fn finish(&self, mut ac: ActiveCall, reason: CallEndReason) {
        ac.pump.abort();
        let announced = ac
            .session
            .apply_transition(CallTransition::Terminated { reason })
            .is_ok();
        ac.peer.close().await;
        if let Some(mut screen) = ac.screen.take() {
            screen.handle.release();
        }
        if let Some(mut media) = ac.media.take() {
            media.release();
        }
        if announced {
            self.emit_phase(&ac.session);
            let duration_secs = match &ac.session.state {
                CallState::Ended { duration_secs, .. } => *duration_secs,
                _ => None,
            };
            info!(
                "call {} ended: {:?} (duration {:?}s)",
                ac.session.call_id, reason, duration_secs
            );
            let _ = self.events.ended.send(Arc::new(CallEnded {
                call_id: ac.session.call_id.clone(),
                reason,
                code: reason.code(),
                notice: reason.notice_kind(),
                message: reason.user_message(),
                duration_secs,
            }));
        }
    }

    fn emit_phase(&self, session: &CallSession) {
        let _ = self.events.phase.send(CallSnapshot::of(session));
    }
}

struct ManagerSignalHandler(Arc<CallManager>);

impl SignalHandler for ManagerSignalHandler {
    fn handle(&self, signal: InboundSignal) {
        let manager = self.0.clone();
        tokio::spawn(async move {
            manager.handle_signal(signal).await;
        });
    }
}
