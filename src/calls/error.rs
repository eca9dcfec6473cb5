//! Call-related error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CallError {
    #[error("no call found for id: {0}")]
    NotFound(String),

    #[error("invalid call state transition: {0}")]
    InvalidTransition(#[from] super::state::InvalidTransition),

    #[error("another call is already in progress")]
    CallInProgress,

    #[error("not in a call")]
    NotInCall,

    #[error("operation not valid for role {0:?}")]
    WrongRole(crate::types::CallRole),

    #[error("peer connection is not open")]
    NotOpen,

    #[error(transparent)]
    Media(#[from] MediaError),

    #[error("negotiation failed: {0}")]
    Negotiation(String),

    #[error("peer engine error: {0}")]
    Engine(String),

    #[error("signaling transport error: {0}")]
    Transport(String),

    #[error("call record API error: {0}")]
    RecordApi(String),
}

/// Capability errors from media acquisition.
///
/// Each variant maps the platform's raw failure into a stable taxonomy so the
/// UI can render a specific, actionable message. Acquisition failures always
/// terminate the call attempt; they are never retried automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, serde::Serialize)]
pub enum MediaError {
    #[error("permission to use the microphone or camera was denied")]
    PermissionDenied,

    #[error("no matching capture device was found")]
    DeviceNotFound,

    #[error("the capture device is already in use")]
    DeviceBusy,

    #[error("the requested capture quality cannot be satisfied")]
    ConstraintsUnsatisfiable,

    #[error("media capture is not supported in this context")]
    PlatformUnsupported,

    #[error("the capture picker was dismissed")]
    UserCancelled,
}

impl MediaError {
    /// Stable reason code carried through state transitions and events.
    pub fn code(self) -> &'static str {
        match self {
            Self::PermissionDenied => "permission-denied",
            Self::DeviceNotFound => "device-not-found",
            Self::DeviceBusy => "device-busy",
            Self::ConstraintsUnsatisfiable => "constraints-unsatisfiable",
            Self::PlatformUnsupported => "platform-unsupported",
            Self::UserCancelled => "user-cancelled",
        }
    }

    /// Remediation message shown to the user.
    pub fn user_message(self) -> &'static str {
        match self {
            Self::PermissionDenied => {
                "Allow microphone and camera access in your settings, then try again."
            }
            Self::DeviceNotFound => {
                "No microphone or camera was found. Connect a device and try again."
            }
            Self::DeviceBusy => "Your microphone or camera is in use by another application.",
            Self::ConstraintsUnsatisfiable => {
                "Your capture device does not support the required quality settings."
            }
            Self::PlatformUnsupported => "Calling is not supported in this environment.",
            Self::UserCancelled => "Screen sharing was cancelled.",
        }
    }
}
