//! UI-facing call events.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use super::peer::RemoteTrackInfo;
use super::state::{CallEndReason, CallSession, EndNoticeKind};
use crate::types::{CallId, MediaKind, UserId};

// The size of the broadcast channel buffer.
const CHANNEL_CAPACITY: usize = 100;

/// Snapshot of the session published on every state change.
#[derive(Debug, Clone, Serialize)]
pub struct CallSnapshot {
    pub session: CallSession,
}

impl CallSnapshot {
    pub fn of(session: &CallSession) -> Arc<Self> {
        Arc::new(Self {
            session: session.clone(),
        })
    }
}

/// A new incoming call is ringing.
#[derive(Debug, Clone, Serialize)]
pub struct IncomingCall {
    pub call_id: CallId,
    pub caller: UserId,
    pub caller_name: Option<String>,
    pub caller_avatar: Option<String>,
    pub media_kind: MediaKind,
    pub received_at: DateTime<Utc>,
}

/// A remote media track became available for rendering.
#[derive(Debug, Clone)]
pub struct RemoteTrackArrived {
    pub call_id: CallId,
    pub track: RemoteTrackInfo,
}

/// The call ended. Emitted exactly once per call.
#[derive(Debug, Clone, Serialize)]
pub struct CallEnded {
    pub call_id: CallId,
    pub reason: CallEndReason,
    /// Stable reason code, kebab-case.
    pub code: &'static str,
    pub notice: EndNoticeKind,
    pub message: String,
    pub duration_secs: Option<i64>,
}

// Macro to generate CallEventBus fields and constructor
macro_rules! define_event_bus {
    ($(($field:ident, $type:ty)),* $(,)?) => {
        /// Typed event bus with a separate broadcast channel per event type.
        #[derive(Debug)]
        pub struct CallEventBus {
            $(
                pub $field: broadcast::Sender<$type>,
            )*
        }

        impl CallEventBus {
            pub fn new() -> Self {
                Self {
                    $(
                        $field: broadcast::channel(CHANNEL_CAPACITY).0,
                    )*
                }
            }
        }
    };
}

define_event_bus! {
    (phase, Arc<CallSnapshot>),
    (incoming, Arc<IncomingCall>),
    (remote_track, Arc<RemoteTrackArrived>),
    (ended, Arc<CallEnded>),
}

impl Default for CallEventBus {
    fn default() -> Self {
        Self::new()
    }
}
