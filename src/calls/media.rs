//! Media acquisition.
//!
//! Wraps the platform capture backend behind [`MediaSource`] and hands out
//! [`MediaHandle`]s that own their tracks. Release of every acquired track is
//! guaranteed on all exit paths: `release()` is explicit and `Drop` is the
//! backstop.

use std::any::Any;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use log::{debug, warn};

use super::error::MediaError;
use crate::types::MediaKind;

/// Kind of a single captured track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// A single local capture track (one microphone or camera/display stream).
///
/// Implementations come from the engine layer; the call core only enables,
/// disables and stops tracks through this interface.
pub trait LocalTrack: Send + Sync {
    fn id(&self) -> &str;
    fn kind(&self) -> TrackKind;
    /// Enable or disable the track without releasing the device (mute).
    fn set_enabled(&self, enabled: bool);
    fn is_enabled(&self) -> bool;
    /// Stop the track and release the underlying device. Irreversible.
    fn stop(&self);
    /// False once the track has been stopped.
    fn is_live(&self) -> bool;
    fn as_any(&self) -> &dyn Any;
}

/// Ownership wrapper around one acquisition result.
///
/// Whoever holds the handle owns the tracks; dropping it stops them.
pub struct MediaHandle {
    tracks: Vec<Arc<dyn LocalTrack>>,
    released: bool,
}

impl MediaHandle {
    pub fn new(tracks: Vec<Arc<dyn LocalTrack>>) -> Self {
        Self {
            tracks,
            released: false,
        }
    }

    pub fn tracks(&self) -> &[Arc<dyn LocalTrack>] {
        &self.tracks
    }

    pub fn audio_track(&self) -> Option<&Arc<dyn LocalTrack>> {
        self.tracks.iter().find(|t| t.kind() == TrackKind::Audio)
    }

    pub fn video_track(&self) -> Option<&Arc<dyn LocalTrack>> {
        self.tracks.iter().find(|t| t.kind() == TrackKind::Video)
    }

    pub fn set_audio_enabled(&self, enabled: bool) {
        for track in self.tracks.iter().filter(|t| t.kind() == TrackKind::Audio) {
            track.set_enabled(enabled);
        }
    }

    pub fn set_video_enabled(&self, enabled: bool) {
        for track in self.tracks.iter().filter(|t| t.kind() == TrackKind::Video) {
            track.set_enabled(enabled);
        }
    }

    /// Move another handle's tracks into this one without stopping them.
    pub fn absorb(&mut self, mut other: MediaHandle) {
        other.released = true;
        self.tracks.append(&mut other.tracks);
    }

    /// Stop every track. Safe to call more than once.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        for track in &self.tracks {
            track.stop();
        }
        debug!("released media handle ({} tracks)", self.tracks.len());
    }

    pub fn is_released(&self) -> bool {
        self.released
    }
}

impl Drop for MediaHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for MediaHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaHandle")
            .field("tracks", &self.tracks.len())
            .field("released", &self.released)
            .finish()
    }
}

/// Audio quality hints applied to every microphone request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioProfile {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for AudioProfile {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

/// Video quality hints applied to every camera request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoProfile {
    pub ideal_width: u32,
    pub ideal_height: u32,
    pub max_width: u32,
    pub max_height: u32,
    pub max_frame_rate: u32,
}

impl Default for VideoProfile {
    fn default() -> Self {
        Self {
            ideal_width: 1280,
            ideal_height: 720,
            max_width: 1920,
            max_height: 1080,
            max_frame_rate: 60,
        }
    }
}

/// Fixed capture profile for a call: microphone always, camera for video calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CaptureProfile {
    pub audio: Option<AudioProfile>,
    pub video: Option<VideoProfile>,
}

impl CaptureProfile {
    pub fn for_kind(kind: MediaKind) -> Self {
        Self {
            audio: Some(AudioProfile::default()),
            video: kind.is_video().then(VideoProfile::default),
        }
    }

    /// Camera only, used when restoring video after screen sharing if the
    /// original camera track was invalidated.
    pub fn camera_only() -> Self {
        Self {
            audio: None,
            video: Some(VideoProfile::default()),
        }
    }
}

/// Platform capture backend.
///
/// One implementation per platform; [`crate::calls::engine::RtcMediaSource`]
/// is the engine-backed one. Implementations map their raw failures onto
/// [`MediaError`] before returning.
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Whether the execution context is a secure context (loopback or
    /// encrypted origin). Capture is refused outside one.
    fn is_secure_context(&self) -> bool;

    /// Whether the platform exposes capture at all.
    fn has_capture_support(&self) -> bool;

    /// Request microphone (and camera per the profile) tracks.
    async fn acquire_user_media(
        &self,
        profile: &CaptureProfile,
    ) -> Result<Vec<Arc<dyn LocalTrack>>, MediaError>;

    /// Request a single display-surface video track.
    async fn acquire_display_media(&self) -> Result<Vec<Arc<dyn LocalTrack>>, MediaError>;
}

/// Media acquisition front-end used by the call manager.
///
/// Checks preconditions before touching the backend and stops any tracks it
/// previously handed out before requesting new ones, so device handles never
/// leak across acquisitions within the same logical session.
pub struct MediaAcquirer {
    source: Arc<dyn MediaSource>,
    held: Mutex<Vec<Weak<dyn LocalTrack>>>,
}

impl MediaAcquirer {
    pub fn new(source: Arc<dyn MediaSource>) -> Self {
        Self {
            source,
            held: Mutex::new(Vec::new()),
        }
    }

    /// Request microphone, and camera if `kind` is video.
    pub async fn acquire(&self, kind: MediaKind) -> Result<MediaHandle, MediaError> {
        self.check_preconditions()?;
        self.stop_previous();

        let profile = CaptureProfile::for_kind(kind);
        let tracks = self.source.acquire_user_media(&profile).await?;
        debug!("acquired {} local track(s) for {:?} call", tracks.len(), kind);
        Ok(self.wrap(tracks))
    }

    /// Request a replacement camera track only, leaving held tracks running.
    pub async fn acquire_camera(&self) -> Result<MediaHandle, MediaError> {
        self.check_preconditions()?;

        let tracks = self
            .source
            .acquire_user_media(&CaptureProfile::camera_only())
            .await?;
        debug!("acquired replacement camera track");
        Ok(self.wrap(tracks))
    }

    /// Request a single display-surface video track, no audio.
    ///
    /// Screen audio capture is deliberately excluded; adding it later would
    /// require renegotiation (a new track) rather than a sender-level swap.
    pub async fn acquire_screen(&self) -> Result<MediaHandle, MediaError> {
        self.check_preconditions()?;

        let tracks = self.source.acquire_display_media().await?;
        debug!("acquired {} screen track(s)", tracks.len());
        Ok(self.wrap(tracks))
    }

    fn check_preconditions(&self) -> Result<(), MediaError> {
        if !self.source.is_secure_context() {
            warn!("media acquisition refused: not a secure context");
            return Err(MediaError::PlatformUnsupported);
        }
        if !self.source.has_capture_support() {
            warn!("media acquisition refused: no capture support");
            return Err(MediaError::PlatformUnsupported);
        }
        Ok(())
    }

    fn stop_previous(&self) {
        let mut held = self.held.lock().expect("held track lock poisoned");
        for weak in held.drain(..) {
            if let Some(track) = weak.upgrade()
                && track.is_live()
            {
                debug!("stopping previously held track {}", track.id());
                track.stop();
            }
        }
    }

    fn wrap(&self, tracks: Vec<Arc<dyn LocalTrack>>) -> MediaHandle {
        let mut held = self.held.lock().expect("held track lock poisoned");
        held.extend(tracks.iter().map(Arc::downgrade));
        MediaHandle::new(tracks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{FakeTrack, MockMediaSource};

    #[tokio::test]
    async fn test_insecure_context_fails_fast() {
        let source = MockMediaSource::new().insecure();
        let acquirer = MediaAcquirer::new(Arc::new(source));

        let err = acquirer.acquire(MediaKind::Audio).await.unwrap_err();
        assert_eq!(err, MediaError::PlatformUnsupported);
    }

    #[tokio::test]
    async fn test_missing_capture_support_fails_fast() {
        let source = MockMediaSource::new().without_capture();
        let acquirer = MediaAcquirer::new(Arc::new(source));

        let err = acquirer.acquire(MediaKind::Video).await.unwrap_err();
        assert_eq!(err, MediaError::PlatformUnsupported);
    }

    #[tokio::test]
    async fn test_acquire_audio_has_no_video_track() {
        let acquirer = MediaAcquirer::new(Arc::new(MockMediaSource::new()));

        let handle = acquirer.acquire(MediaKind::Audio).await.unwrap();
        assert!(handle.audio_track().is_some());
        assert!(handle.video_track().is_none());
    }

    #[tokio::test]
    async fn test_previous_tracks_stopped_before_reacquire() {
        let acquirer = MediaAcquirer::new(Arc::new(MockMediaSource::new()));

        let first = acquirer.acquire(MediaKind::Video).await.unwrap();
        let first_audio = first.audio_track().unwrap().clone();
        assert!(first_audio.is_live());

        let _second = acquirer.acquire(MediaKind::Video).await.unwrap();
        assert!(!first_audio.is_live());
    }

    #[tokio::test]
    async fn test_release_stops_all_tracks_and_is_idempotent() {
        let acquirer = MediaAcquirer::new(Arc::new(MockMediaSource::new()));

        let mut handle = acquirer.acquire(MediaKind::Video).await.unwrap();
        let tracks: Vec<_> = handle.tracks().to_vec();
        handle.release();
        handle.release();
        assert!(handle.is_released());
        assert!(tracks.iter().all(|t| !t.is_live()));
    }

    #[tokio::test]
    async fn test_drop_releases_tracks() {
        let acquirer = MediaAcquirer::new(Arc::new(MockMediaSource::new()));

        let handle = acquirer.acquire(MediaKind::Audio).await.unwrap();
        let track = handle.audio_track().unwrap().clone();
        drop(handle);
        assert!(!track.is_live());
    }

    #[test]
    fn test_mute_gates_enabled_without_stopping() {
        let track: Arc<dyn LocalTrack> = Arc::new(FakeTrack::audio("mic"));
        let handle = MediaHandle::new(vec![track.clone()]);

        handle.set_audio_enabled(false);
        assert!(!track.is_enabled());
        assert!(track.is_live());

        handle.set_audio_enabled(true);
        assert!(track.is_enabled());
    }

    #[test]
    fn test_capture_profile_per_kind() {
        assert!(CaptureProfile::for_kind(MediaKind::Audio).video.is_none());
        let video = CaptureProfile::for_kind(MediaKind::Video).video.unwrap();
        assert_eq!((video.ideal_width, video.ideal_height), (1280, 720));
        assert_eq!((video.max_width, video.max_height), (1920, 1080));
        assert_eq!(video.max_frame_rate, 60);
    }
}
