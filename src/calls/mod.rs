//! Call subsystem: media acquisition, peer sessions, and the call state
//! machine.
//!
//! # Architecture
//!
//! - [`CallState`] & [`CallSession`]: state machine tracking the call
//!   lifecycle from ringing to ended
//! - [`PeerSession`]: one peer connection per call, with candidate buffering
//!   and the screen-share track swap
//! - [`MediaAcquirer`]: capture acquisition with guaranteed track release
//! - [`CallManager`]: orchestrates the single in-flight call, reconciling
//!   local intents with inbound signaling and peer events
//! - [`engine`]: the `webrtc`-backed implementation of the peer seam

pub mod engine;
pub mod error;
pub mod events;
pub mod manager;
pub mod media;
pub mod peer;
pub mod state;

pub use error::{CallError, MediaError};
pub use events::{CallEnded, CallEventBus, CallSnapshot, IncomingCall};
pub use manager::{CallManager, CallManagerConfig};
pub use media::{MediaAcquirer, MediaHandle, MediaSource};
pub use peer::{PeerConnection, PeerEngine, PeerEvent, PeerSession};
pub use state::{CallEndReason, CallSession, CallState, CallTransition, InvalidTransition};
