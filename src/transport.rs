//! Signaling boundary.
//!
//! One closed payload type per signaling event, validated at the boundary:
//! a payload that does not match its event's shape is rejected here and never
//! reaches the call state machine. The transport implementation itself (the
//! real-time channel) lives outside this crate behind [`SignalingTransport`].

use std::sync::{Arc, RwLock, Weak};

use async_trait::async_trait;
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::types::{CallId, IceCandidate, MediaKind, Sdp, UserId};

/// Signaling message sent to the server for relay to the counterpart.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundSignal {
    CallUser {
        callee_id: UserId,
        offer_sdp: Sdp,
        media_kind: MediaKind,
        call_id: CallId,
    },
    AnswerCall {
        answer_sdp: Sdp,
        to: UserId,
        call_id: CallId,
    },
    IceCandidate {
        candidate: IceCandidate,
        to: UserId,
    },
    RejectCall {
        to: UserId,
        call_id: CallId,
    },
    EndCall {
        to: UserId,
        call_id: CallId,
    },
    /// Auto-sent when an incoming call collides with an ongoing one.
    UserBusy {
        to: UserId,
        call_id: CallId,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CallUserWire<'a> {
    callee_id: &'a UserId,
    #[serde(rename = "offerSDP")]
    offer_sdp: &'a Sdp,
    media_kind: MediaKind,
    call_id: &'a CallId,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AnswerCallWire<'a> {
    #[serde(rename = "answerSDP")]
    answer_sdp: &'a Sdp,
    to: &'a UserId,
    call_id: &'a CallId,
}

#[derive(Serialize)]
struct IceCandidateWire<'a> {
    candidate: &'a IceCandidate,
    to: &'a UserId,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AddressedCallWire<'a> {
    to: &'a UserId,
    call_id: &'a CallId,
}

impl OutboundSignal {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::CallUser { .. } => "call-user",
            Self::AnswerCall { .. } => "answer-call",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::RejectCall { .. } => "reject-call",
            Self::EndCall { .. } => "end-call",
            Self::UserBusy { .. } => "user-busy",
        }
    }

    pub fn payload(&self) -> Value {
        let value = match self {
            Self::CallUser {
                callee_id,
                offer_sdp,
                media_kind,
                call_id,
            } => serde_json::to_value(CallUserWire {
                callee_id,
                offer_sdp,
                media_kind: *media_kind,
                call_id,
            }),
            Self::AnswerCall {
                answer_sdp,
                to,
                call_id,
            } => serde_json::to_value(AnswerCallWire {
                answer_sdp,
                to,
                call_id,
            }),
            Self::IceCandidate { candidate, to } => {
                serde_json::to_value(IceCandidateWire { candidate, to })
            }
            Self::RejectCall { to, call_id }
            | Self::EndCall { to, call_id }
            | Self::UserBusy { to, call_id } => {
                serde_json::to_value(AddressedCallWire { to, call_id })
            }
        };
        // Serializing these structs cannot fail.
        value.unwrap_or(Value::Null)
    }
}

/// `incoming-call-signal` payload.
///
/// The offer SDP may trail the ring notice on some relay paths, so it is
/// optional here; the state machine waits for it before negotiating.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct IncomingCallSignal {
    #[serde(rename = "offerSDP", default)]
    pub offer_sdp: Option<Sdp>,
    pub from: UserId,
    #[serde(default)]
    pub caller_name: Option<String>,
    #[serde(default)]
    pub caller_avatar: Option<String>,
    pub media_kind: MediaKind,
    pub call_id: CallId,
}

/// `call-accepted` payload.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CallAcceptedSignal {
    #[serde(rename = "answerSDP")]
    pub answer_sdp: Sdp,
    pub from: UserId,
    pub call_id: CallId,
}

/// `ice-candidate` payload. Carries no call id; it is matched against the
/// active session by sender.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IceCandidateSignal {
    pub candidate: IceCandidate,
    pub from: UserId,
}

/// Payload shared by `call-rejected`, `call-ended` and `user-busy`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CallNoticeSignal {
    pub from: UserId,
    pub call_id: CallId,
}

/// `user-unavailable` payload.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UserUnavailableSignal {
    pub user_id: UserId,
}

/// Validated inbound signaling event.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundSignal {
    IncomingCall(IncomingCallSignal),
    CallAccepted(CallAcceptedSignal),
    IceCandidate(IceCandidateSignal),
    CallRejected(CallNoticeSignal),
    CallEnded(CallNoticeSignal),
    UserBusy(CallNoticeSignal),
    UserUnavailable(UserUnavailableSignal),
}

#[derive(Debug, Error)]
pub enum SignalDecodeError {
    #[error("unknown signaling event '{0}'")]
    UnknownEvent(String),

    #[error("malformed payload for '{event}': {source}")]
    BadPayload {
        event: String,
        #[source]
        source: serde_json::Error,
    },
}

impl InboundSignal {
    /// Decode and validate one wire event. Unknown events and payloads that
    /// do not match the event's shape are rejected.
    pub fn from_wire(event: &str, payload: Value) -> Result<Self, SignalDecodeError> {
        fn decode<T: serde::de::DeserializeOwned>(
            event: &str,
            payload: Value,
        ) -> Result<T, SignalDecodeError> {
            serde_json::from_value(payload).map_err(|source| SignalDecodeError::BadPayload {
                event: event.to_owned(),
                source,
            })
        }

        match event {
            "incoming-call-signal" => Ok(Self::IncomingCall(decode(event, payload)?)),
            "call-accepted" => Ok(Self::CallAccepted(decode(event, payload)?)),
            "ice-candidate" => Ok(Self::IceCandidate(decode(event, payload)?)),
            "call-rejected" => Ok(Self::CallRejected(decode(event, payload)?)),
            "call-ended" => Ok(Self::CallEnded(decode(event, payload)?)),
            "user-busy" => Ok(Self::UserBusy(decode(event, payload)?)),
            "user-unavailable" => Ok(Self::UserUnavailable(decode(event, payload)?)),
            other => Err(SignalDecodeError::UnknownEvent(other.to_owned())),
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is not connected")]
    NotConnected,

    #[error("send failed: {0}")]
    Send(String),
}

/// Outbound half of the real-time channel.
///
/// The channel implementation (socket handling, authentication, reconnect)
/// lives outside this crate; reconnection re-registers listeners but never
/// resumes a call that already ended.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    async fn send(&self, signal: OutboundSignal) -> Result<(), TransportError>;
}

/// A subscriber to validated inbound signals.
pub trait SignalHandler: Send + Sync {
    fn handle(&self, signal: InboundSignal);
}

type HandlerSlot = (u64, Arc<dyn SignalHandler>);

/// Inbound subscription registry.
///
/// The channel implementation feeds raw events into [`dispatch`]
/// (self::SignalListeners::dispatch); handlers receive only payloads that
/// passed validation.
#[derive(Default)]
pub struct SignalListeners {
    inner: Arc<RwLock<Vec<HandlerSlot>>>,
    next_id: std::sync::atomic::AtomicU64,
}

impl SignalListeners {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. The subscription lasts until the returned token
    /// is cancelled or dropped.
    pub fn subscribe(&self, handler: Arc<dyn SignalHandler>) -> ListenerToken {
        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.inner
            .write()
            .expect("listener registry lock poisoned")
            .push((id, handler));
        ListenerToken {
            id,
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// Decode one raw event and fan it out to every handler. Invalid events
    /// are logged and dropped.
    pub fn dispatch(&self, event: &str, payload: Value) {
        let signal = match InboundSignal::from_wire(event, payload) {
            Ok(signal) => signal,
            Err(e) => {
                warn!("dropping inbound signal: {e}");
                return;
            }
        };
        let handlers: Vec<Arc<dyn SignalHandler>> = self
            .inner
            .read()
            .expect("listener registry lock poisoned")
            .iter()
            .map(|(_, h)| h.clone())
            .collect();
        for handler in handlers {
            handler.handle(signal.clone());
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner
            .read()
            .expect("listener registry lock poisoned")
            .len()
    }
}

/// Cancellation token for one subscription. Dropping it unsubscribes.
pub struct ListenerToken {
    id: u64,
    registry: Weak<RwLock<Vec<HandlerSlot>>>,
}

impl ListenerToken {
    pub fn cancel(self) {
        // Drop does the work.
    }
}

impl Drop for ListenerToken {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade()
            && let Ok(mut handlers) = registry.write()
        {
            handlers.retain(|(id, _)| *id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[test]
    fn test_call_user_wire_shape() {
        let signal = OutboundSignal::CallUser {
            callee_id: UserId::new("bob"),
            offer_sdp: Sdp::offer("v=0\r\n"),
            media_kind: MediaKind::Video,
            call_id: CallId::new("AC90CFD09DF712D981142B172706F9F2"),
        };

        assert_eq!(signal.event_name(), "call-user");
        let payload = signal.payload();
        assert_eq!(payload["calleeId"], "bob");
        assert_eq!(payload["offerSDP"]["type"], "offer");
        assert_eq!(payload["mediaKind"], "video");
        assert_eq!(payload["callId"], "AC90CFD09DF712D981142B172706F9F2");
    }

    #[test]
    fn test_addressed_wire_shape() {
        let signal = OutboundSignal::UserBusy {
            to: UserId::new("carol"),
            call_id: CallId::new("BC5BD1EDE9BBE601F408EF3795479E93"),
        };

        assert_eq!(signal.event_name(), "user-busy");
        let payload = signal.payload();
        assert_eq!(payload["to"], "carol");
        assert_eq!(payload["callId"], "BC5BD1EDE9BBE601F408EF3795479E93");
    }

    #[test]
    fn test_incoming_call_decode() {
        let payload = json!({
            "offerSDP": {"type": "offer", "sdp": "v=0\r\n"},
            "from": "alice",
            "callerName": "Alice",
            "mediaKind": "audio",
            "callId": "AC90CFD09DF712D981142B172706F9F2",
        });

        let signal = InboundSignal::from_wire("incoming-call-signal", payload).unwrap();
        let InboundSignal::IncomingCall(incoming) = signal else {
            panic!("wrong variant");
        };
        assert_eq!(incoming.from, UserId::new("alice"));
        assert_eq!(incoming.caller_name.as_deref(), Some("Alice"));
        assert!(incoming.caller_avatar.is_none());
        assert!(incoming.offer_sdp.is_some());
    }

    /// The ring notice may arrive without the SDP.
    #[test]
    fn test_incoming_call_without_offer_sdp() {
        let payload = json!({
            "from": "alice",
            "mediaKind": "video",
            "callId": "AC90CFD09DF712D981142B172706F9F2",
        });

        let signal = InboundSignal::from_wire("incoming-call-signal", payload).unwrap();
        let InboundSignal::IncomingCall(incoming) = signal else {
            panic!("wrong variant");
        };
        assert!(incoming.offer_sdp.is_none());
    }

    #[test]
    fn test_unknown_event_rejected() {
        let err = InboundSignal::from_wire("typing-started", json!({})).unwrap_err();
        assert!(matches!(err, SignalDecodeError::UnknownEvent(_)));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let payload = json!({
            "from": "alice",
            "callId": "AC90CFD09DF712D981142B172706F9F2",
            "extra": true,
        });
        let err = InboundSignal::from_wire("call-rejected", payload).unwrap_err();
        assert!(matches!(err, SignalDecodeError::BadPayload { .. }));
    }

    #[test]
    fn test_missing_field_rejected() {
        let err = InboundSignal::from_wire("call-accepted", json!({"from": "alice"})).unwrap_err();
        assert!(matches!(err, SignalDecodeError::BadPayload { .. }));
    }

    struct CollectingHandler(Mutex<Vec<InboundSignal>>);

    impl SignalHandler for CollectingHandler {
        fn handle(&self, signal: InboundSignal) {
            self.0.lock().unwrap().push(signal);
        }
    }

    #[test]
    fn test_dispatch_and_unsubscribe() {
        let listeners = SignalListeners::new();
        let handler = Arc::new(CollectingHandler(Mutex::new(Vec::new())));
        let token = listeners.subscribe(handler.clone());

        listeners.dispatch("user-unavailable", json!({"userId": "bob"}));
        assert_eq!(handler.0.lock().unwrap().len(), 1);

        // Invalid payloads never reach handlers.
        listeners.dispatch("user-unavailable", json!({"wrong": "shape"}));
        assert_eq!(handler.0.lock().unwrap().len(), 1);

        token.cancel();
        assert_eq!(listeners.len(), 0);
        listeners.dispatch("user-unavailable", json!({"userId": "bob"}));
        assert_eq!(handler.0.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_dropping_token_unsubscribes() {
        let listeners = SignalListeners::new();
        let handler = Arc::new(CollectingHandler(Mutex::new(Vec::new())));
        {
            let _token = listeners.subscribe(handler);
            assert_eq!(listeners.len(), 1);
        }
        assert_eq!(listeners.len(), 0);
    }
}
