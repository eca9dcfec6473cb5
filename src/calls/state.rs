//! Call state machine implementation.

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use super::error::MediaError;
use crate::types::{CallId, CallRole, MediaKind, Sdp, UserId};

/// Current state of a call.
#[derive(Debug, Clone, Serialize, Default)]
pub enum CallState {
    /// Outgoing call: initializing before the offer is sent.
    #[default]
    Initiating,
    /// Outgoing call: offer sent, waiting for response.
    OutgoingRinging { offer_sent_at: DateTime<Utc> },
    /// Incoming call: ringing locally.
    ///
    /// The offer SDP may trail the ring notice; `accept_pending` records a
    /// local accept that happened before the SDP arrived.
    IncomingRinging {
        received_at: DateTime<Utc>,
        offer: Option<Sdp>,
        accept_pending: bool,
    },
    /// Call accepted, establishing media connection.
    Connecting {
        accepted_at: DateTime<Utc>,
        audio_muted: bool,
        video_off: bool,
        screen_sharing: bool,
    },
    /// Call active with media flowing.
    Active {
        connected_at: DateTime<Utc>,
        audio_muted: bool,
        video_off: bool,
        screen_sharing: bool,
    },
    /// Call ended.
    Ended {
        reason: CallEndReason,
        ended_at: DateTime<Utc>,
        duration_secs: Option<i64>,
    },
}

impl CallState {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active { .. })
    }

    pub fn is_ringing(&self) -> bool {
        matches!(
            self,
            Self::OutgoingRinging { .. } | Self::IncomingRinging { .. }
        )
    }

    pub fn is_ended(&self) -> bool {
        matches!(self, Self::Ended { .. })
    }

    pub fn can_accept(&self) -> bool {
        matches!(
            self,
            Self::IncomingRinging {
                accept_pending: false,
                ..
            }
        )
    }

    pub fn can_reject(&self) -> bool {
        matches!(self, Self::IncomingRinging { .. })
    }

    /// True in Connecting and Active, where mute/video/screen controls apply.
    pub fn is_in_call(&self) -> bool {
        matches!(self, Self::Connecting { .. } | Self::Active { .. })
    }
}

/// State transitions for calls.
#[derive(Debug, Clone)]
pub enum CallTransition {
    OfferSent,
    /// The offer SDP arrived after the ring notice.
    OfferPayloadArrived { offer: Sdp },
    LocalAccepted,
    RemoteAccepted,
    MediaConnected,
    AudioMuteChanged { muted: bool },
    VideoStateChanged { off: bool },
    ScreenShareChanged { sharing: bool },
    Terminated { reason: CallEndReason },
}

/// Why a call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallEndReason {
    LocalHangup,
    RemoteHangup,
    LocalRejected,
    RemoteRejected,
    Busy,
    Unavailable,
    RingTimeout,
    Media(MediaError),
    NegotiationFailed,
    ConnectionFailed,
    ConnectionClosed,
    SetupFailed,
}

/// How the ended notice should be surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EndNoticeKind {
    /// Expected outcome of the call flow.
    Info,
    /// Something went wrong.
    Error,
}

impl CallEndReason {
    /// Stable reason code surfaced on the ended event.
    pub fn code(self) -> &'static str {
        match self {
            Self::LocalHangup => "local-hangup",
            Self::RemoteHangup => "remote-hangup",
            Self::LocalRejected => "local-rejected",
            Self::RemoteRejected => "remote-rejected",
            Self::Busy => "busy",
            Self::Unavailable => "unavailable",
            Self::RingTimeout => "ring-timeout",
            Self::Media(e) => e.code(),
            Self::NegotiationFailed => "negotiation-failed",
            Self::ConnectionFailed => "connection-failed",
            Self::ConnectionClosed => "connection-closed",
            Self::SetupFailed => "setup-failed",
        }
    }

    pub fn notice_kind(self) -> EndNoticeKind {
        match self {
            Self::LocalHangup
            | Self::RemoteHangup
            | Self::LocalRejected
            | Self::RemoteRejected
            | Self::Busy
            | Self::Unavailable
            | Self::RingTimeout
            | Self::ConnectionClosed => EndNoticeKind::Info,
            Self::Media(_)
            | Self::NegotiationFailed
            | Self::ConnectionFailed
            | Self::SetupFailed => EndNoticeKind::Error,
        }
    }

    pub fn user_message(self) -> String {
        match self {
            Self::LocalHangup => "Call ended.".into(),
            Self::RemoteHangup => "The other participant ended the call.".into(),
            Self::LocalRejected => "Call declined.".into(),
            Self::RemoteRejected => "Your call was declined.".into(),
            Self::Busy => "The user is busy on another call.".into(),
            Self::Unavailable => "The user is unavailable right now.".into(),
            Self::RingTimeout => "No answer.".into(),
            Self::Media(e) => e.user_message().into(),
            Self::NegotiationFailed => "The call could not be set up.".into(),
            Self::ConnectionFailed => "The connection to the other participant failed.".into(),
            Self::ConnectionClosed => "The call connection was closed.".into(),
            Self::SetupFailed => "The call could not be started. Try again.".into(),
        }
    }
}

/// Full call session information.
#[derive(Debug, Clone, Serialize)]
pub struct CallSession {
    pub call_id: CallId,
    pub remote: UserId,
    pub media_kind: MediaKind,
    pub role: CallRole,
    pub state: CallState,
    pub created_at: DateTime<Utc>,
    /// Display name of the caller, from the incoming signal.
    pub caller_name: Option<String>,
    pub caller_avatar: Option<String>,
}

impl CallSession {
    pub fn new_outgoing(call_id: CallId, remote: UserId, media_kind: MediaKind) -> Self {
        Self {
            call_id,
            remote,
            media_kind,
            role: CallRole::Initiator,
            state: CallState::Initiating,
            created_at: Utc::now(),
            caller_name: None,
            caller_avatar: None,
        }
    }

    pub fn new_incoming(
        call_id: CallId,
        remote: UserId,
        media_kind: MediaKind,
        offer: Option<Sdp>,
        caller_name: Option<String>,
        caller_avatar: Option<String>,
    ) -> Self {
        Self {
            call_id,
            remote,
            media_kind,
            role: CallRole::Receiver,
            state: CallState::IncomingRinging {
                received_at: Utc::now(),
                offer,
                accept_pending: false,
            },
            created_at: Utc::now(),
            caller_name,
            caller_avatar,
        }
    }

    pub fn is_initiator(&self) -> bool {
        self.role == CallRole::Initiator
    }

    /// Apply a state transition. Returns error if transition is invalid.
    pub fn apply_transition(
        &mut self,
        transition: CallTransition,
    ) -> Result<(), InvalidTransition> {
        let new_state = match (&self.state, transition) {
            (CallState::Initiating, CallTransition::OfferSent) => CallState::OutgoingRinging {
                offer_sent_at: Utc::now(),
            },
            (
                CallState::IncomingRinging {
                    received_at,
                    offer: None,
                    accept_pending,
                },
                CallTransition::OfferPayloadArrived { offer },
            ) => CallState::IncomingRinging {
                received_at: *received_at,
                offer: Some(offer),
                accept_pending: *accept_pending,
            },
            (
                CallState::IncomingRinging {
                    received_at,
                    offer: None,
                    accept_pending: false,
                },
                CallTransition::LocalAccepted,
            ) => {
                // Accepted before the offer SDP arrived; hold until it does.
                CallState::IncomingRinging {
                    received_at: *received_at,
                    offer: None,
                    accept_pending: true,
                }
            }
            (
                CallState::IncomingRinging { offer: Some(_), .. },
                CallTransition::LocalAccepted,
            ) => CallState::Connecting {
                accepted_at: Utc::now(),
                audio_muted: false,
                video_off: !self.media_kind.is_video(),
                screen_sharing: false,
            },
            (CallState::OutgoingRinging { .. }, CallTransition::RemoteAccepted) => {
                CallState::Connecting {
                    accepted_at: Utc::now(),
                    audio_muted: false,
                    video_off: !self.media_kind.is_video(),
                    screen_sharing: false,
                }
            }
            (
                CallState::Connecting {
                    audio_muted,
                    video_off,
                    screen_sharing,
                    ..
                },
                CallTransition::MediaConnected,
            ) => CallState::Active {
                connected_at: Utc::now(),
                audio_muted: *audio_muted,
                video_off: *video_off,
                screen_sharing: *screen_sharing,
            },
            (
                CallState::Connecting {
                    accepted_at,
                    video_off,
                    screen_sharing,
                    ..
                },
                CallTransition::AudioMuteChanged { muted },
            ) => CallState::Connecting {
                accepted_at: *accepted_at,
                audio_muted: muted,
                video_off: *video_off,
                screen_sharing: *screen_sharing,
            },
            (
                CallState::Connecting {
                    accepted_at,
                    audio_muted,
                    screen_sharing,
                    ..
                },
                CallTransition::VideoStateChanged { off },
            ) => CallState::Connecting {
                accepted_at: *accepted_at,
                audio_muted: *audio_muted,
                video_off: off,
                screen_sharing: *screen_sharing,
            },
            (
                CallState::Connecting {
                    accepted_at,
                    audio_muted,
                    video_off,
                    ..
                },
                CallTransition::ScreenShareChanged { sharing },
            ) => CallState::Connecting {
                accepted_at: *accepted_at,
                audio_muted: *audio_muted,
                video_off: *video_off,
                screen_sharing: sharing,
            },
            (
                CallState::Active {
                    connected_at,
                    video_off,
                    screen_sharing,
                    ..
                },
                CallTransition::AudioMuteChanged { muted },
            ) => CallState::Active {
                connected_at: *connected_at,
                audio_muted: muted,
                video_off: *video_off,
                screen_sharing: *screen_sharing,
            },
            (
                CallState::Active {
                    connected_at,
                    audio_muted,
                    screen_sharing,
                    ..
                },
                CallTransition::VideoStateChanged { off },
            ) => CallState::Active {
                connected_at: *connected_at,
                audio_muted: *audio_muted,
                video_off: off,
                screen_sharing: *screen_sharing,
            },
            (
                CallState::Active {
                    connected_at,
                    audio_muted,
                    video_off,
                    ..
                },
                CallTransition::ScreenShareChanged { sharing },
            ) => CallState::Active {
                connected_at: *connected_at,
                audio_muted: *audio_muted,
                video_off: *video_off,
                screen_sharing: sharing,
            },
            (CallState::Active { connected_at, .. }, CallTransition::Terminated { reason }) => {
                let duration = Utc::now()
                    .signed_duration_since(*connected_at)
                    .num_seconds();
                CallState::Ended {
                    reason,
                    ended_at: Utc::now(),
                    duration_secs: Some(duration),
                }
            }
            (current, CallTransition::Terminated { reason }) if !current.is_ended() => {
                CallState::Ended {
                    reason,
                    ended_at: Utc::now(),
                    duration_secs: None,
                }
            }
            (current, transition) => {
                return Err(InvalidTransition {
                    current_state: format!("{:?}", current),
                    attempted: format!("{:?}", transition),
                });
            }
        };
        self.state = new_state;
        Ok(())
    }
}

#[derive(Debug, Clone, Error)]
#[error("invalid transition {attempted} in state {current_state}")]
pub struct InvalidTransition {
    pub current_state: String,
    pub attempted: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_outgoing_call() -> CallSession {
        CallSession::new_outgoing(
            CallId::new("AC90CFD09DF712D981142B172706F9F2"),
            UserId::new("alice"),
            MediaKind::Audio,
        )
    }

    fn make_incoming_call(offer: Option<Sdp>) -> CallSession {
        CallSession::new_incoming(
            CallId::new("BC5BD1EDE9BBE601F408EF3795479E93"),
            UserId::new("bob"),
            MediaKind::Video,
            offer,
            Some("Bob".to_string()),
            None,
        )
    }

    /// Flow: Initiating → OutgoingRinging → Connecting → Active → Ended
    #[test]
    fn test_outgoing_call_flow() {
        let mut call = make_outgoing_call();

        assert!(matches!(call.state, CallState::Initiating));

        call.apply_transition(CallTransition::OfferSent).unwrap();
        assert!(call.state.is_ringing());

        call.apply_transition(CallTransition::RemoteAccepted)
            .unwrap();
        assert!(matches!(call.state, CallState::Connecting { .. }));

        call.apply_transition(CallTransition::MediaConnected)
            .unwrap();
        assert!(call.state.is_active());

        call.apply_transition(CallTransition::Terminated {
            reason: CallEndReason::LocalHangup,
        })
        .unwrap();
        assert!(call.state.is_ended());

        // Duration is recorded only once the call was active.
        if let CallState::Ended { duration_secs, .. } = call.state {
            assert!(duration_secs.is_some());
        }
    }

    /// Flow: IncomingRinging → Connecting → Active → Ended
    #[test]
    fn test_incoming_call_flow() {
        let mut call = make_incoming_call(Some(Sdp::offer("v=0\r\n")));

        assert!(call.state.is_ringing());
        assert!(call.state.can_accept());

        call.apply_transition(CallTransition::LocalAccepted)
            .unwrap();
        assert!(matches!(call.state, CallState::Connecting { .. }));

        call.apply_transition(CallTransition::MediaConnected)
            .unwrap();
        assert!(call.state.is_active());

        call.apply_transition(CallTransition::Terminated {
            reason: CallEndReason::RemoteHangup,
        })
        .unwrap();
        assert!(call.state.is_ended());
    }

    /// Accept before the offer SDP arrives holds in IncomingRinging, then the
    /// trailing payload plus a second accept moves to Connecting.
    #[test]
    fn test_accept_before_offer_payload_waits() {
        let mut call = make_incoming_call(None);

        call.apply_transition(CallTransition::LocalAccepted)
            .unwrap();
        assert!(matches!(
            call.state,
            CallState::IncomingRinging {
                accept_pending: true,
                offer: None,
                ..
            }
        ));

        call.apply_transition(CallTransition::OfferPayloadArrived {
            offer: Sdp::offer("v=0\r\n"),
        })
        .unwrap();
        assert!(matches!(
            call.state,
            CallState::IncomingRinging {
                accept_pending: true,
                offer: Some(_),
                ..
            }
        ));

        call.apply_transition(CallTransition::LocalAccepted)
            .unwrap();
        assert!(matches!(call.state, CallState::Connecting { .. }));
    }

    #[test]
    fn test_rejection_flows() {
        let mut outgoing = make_outgoing_call();
        outgoing.apply_transition(CallTransition::OfferSent).unwrap();
        outgoing
            .apply_transition(CallTransition::Terminated {
                reason: CallEndReason::RemoteRejected,
            })
            .unwrap();
        assert!(outgoing.state.is_ended());

        let mut incoming = make_incoming_call(Some(Sdp::offer("v=0\r\n")));
        assert!(incoming.state.can_reject());
        incoming
            .apply_transition(CallTransition::Terminated {
                reason: CallEndReason::LocalRejected,
            })
            .unwrap();
        assert!(incoming.state.is_ended());
        if let CallState::Ended {
            reason,
            duration_secs,
            ..
        } = incoming.state
        {
            assert_eq!(reason, CallEndReason::LocalRejected);
            assert!(duration_secs.is_none());
        }
    }

    /// Mute set while still Connecting carries into Active.
    #[test]
    fn test_mute_during_connecting_carries_into_active() {
        let mut call = make_outgoing_call();
        call.apply_transition(CallTransition::OfferSent).unwrap();
        call.apply_transition(CallTransition::RemoteAccepted)
            .unwrap();
        call.apply_transition(CallTransition::AudioMuteChanged { muted: true })
            .unwrap();
        call.apply_transition(CallTransition::MediaConnected)
            .unwrap();

        if let CallState::Active { audio_muted, .. } = call.state {
            assert!(audio_muted);
        }
    }

    #[test]
    fn test_video_state_defaults_per_media_kind() {
        let mut audio_call = make_outgoing_call();
        audio_call
            .apply_transition(CallTransition::OfferSent)
            .unwrap();
        audio_call
            .apply_transition(CallTransition::RemoteAccepted)
            .unwrap();
        if let CallState::Connecting { video_off, .. } = audio_call.state {
            assert!(video_off, "audio calls start with video off");
        }

        let mut video_call = make_incoming_call(Some(Sdp::offer("v=0\r\n")));
        video_call
            .apply_transition(CallTransition::LocalAccepted)
            .unwrap();
        if let CallState::Connecting { video_off, .. } = video_call.state {
            assert!(!video_off, "video calls start with video on");
        }
    }

    #[test]
    fn test_screen_share_toggle() {
        let mut call = make_outgoing_call();
        call.apply_transition(CallTransition::OfferSent).unwrap();
        assert!(
            call.apply_transition(CallTransition::ScreenShareChanged { sharing: true })
                .is_err(),
            "not available while still ringing"
        );

        call.apply_transition(CallTransition::RemoteAccepted)
            .unwrap();
        call.apply_transition(CallTransition::ScreenShareChanged { sharing: true })
            .unwrap();
        assert!(matches!(
            call.state,
            CallState::Connecting {
                screen_sharing: true,
                ..
            }
        ));

        call.apply_transition(CallTransition::MediaConnected)
            .unwrap();
        if let CallState::Active { screen_sharing, .. } = call.state {
            assert!(screen_sharing, "sharing carries into Active");
        }
        call.apply_transition(CallTransition::ScreenShareChanged { sharing: false })
            .unwrap();
    }

    #[test]
    fn test_invalid_transitions() {
        let mut call = make_outgoing_call();

        assert!(
            call.apply_transition(CallTransition::RemoteAccepted)
                .is_err()
        );
        assert!(
            call.apply_transition(CallTransition::MediaConnected)
                .is_err()
        );
        assert!(
            call.apply_transition(CallTransition::LocalAccepted)
                .is_err()
        );
    }

    /// Terminated is accepted from every non-ended state, exactly once.
    #[test]
    fn test_ended_call_rejects_transitions() {
        let mut call = make_incoming_call(Some(Sdp::offer("v=0\r\n")));

        call.apply_transition(CallTransition::Terminated {
            reason: CallEndReason::LocalRejected,
        })
        .unwrap();
        assert!(call.state.is_ended());

        assert!(
            call.apply_transition(CallTransition::LocalAccepted)
                .is_err()
        );
        assert!(
            call.apply_transition(CallTransition::Terminated {
                reason: CallEndReason::LocalHangup,
            })
            .is_err()
        );
    }

    #[test]
    fn test_reason_codes_are_stable() {
        assert_eq!(CallEndReason::RingTimeout.code(), "ring-timeout");
        assert_eq!(
            CallEndReason::Media(MediaError::PermissionDenied).code(),
            "permission-denied"
        );
        assert_eq!(CallEndReason::RemoteHangup.code(), "remote-hangup");
    }

    #[test]
    fn test_notice_classification() {
        assert_eq!(
            CallEndReason::RemoteHangup.notice_kind(),
            EndNoticeKind::Info
        );
        assert_eq!(CallEndReason::Busy.notice_kind(), EndNoticeKind::Info);
        assert_eq!(
            CallEndReason::ConnectionFailed.notice_kind(),
            EndNoticeKind::Error
        );
        assert_eq!(
            CallEndReason::Media(MediaError::PermissionDenied).notice_kind(),
            EndNoticeKind::Error
        );
    }

    #[test]
    fn test_call_role() {
        assert!(make_outgoing_call().is_initiator());
        assert!(!make_incoming_call(None).is_initiator());
    }
}
