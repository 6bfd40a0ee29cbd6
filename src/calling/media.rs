//! Local media: tracks, streams and device acquisition.
//!
//! `MediaAcquisition` is the only place that stops local tracks. Everything
//! else (engine, peer connection) holds clones of the track handles and
//! only toggles `enabled`.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::error::AcquireError;
use super::MediaKind;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn next_id(prefix: &str) -> String {
    format!("{}-{}", prefix, NEXT_ID.fetch_add(1, Ordering::Relaxed))
}

struct TrackInner {
    id: String,
    kind: MediaKind,
    label: String,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

/// Handle to one capture (or remote) track. Clones share state.
#[derive(Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

impl MediaTrack {
    pub fn new(kind: MediaKind, label: &str) -> Self {
        Self {
            inner: Arc::new(TrackInner {
                id: next_id(kind.as_str()),
                kind,
                label: label.to_string(),
                enabled: AtomicBool::new(true),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> MediaKind {
        self.inner.kind
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// Mute/unmute. Does not release the device.
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_live(&self) -> bool {
        !self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Stop the track. Returns false if it was already stopped.
    pub fn stop(&self) -> bool {
        !self.inner.stopped.swap(true, Ordering::SeqCst)
    }

    pub fn same_track(&self, other: &MediaTrack) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("label", &self.inner.label)
            .field("enabled", &self.is_enabled())
            .field("live", &self.is_live())
            .finish()
    }
}

/// An ordered set of tracks.
#[derive(Debug, Clone)]
pub struct MediaStream {
    id: String,
    tracks: Vec<MediaTrack>,
}

impl MediaStream {
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self {
            id: next_id("stream"),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    pub fn tracks_of(&self, kind: MediaKind) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter().filter(move |t| t.kind() == kind)
    }

    pub fn has_kind(&self, kind: MediaKind) -> bool {
        self.tracks_of(kind).next().is_some()
    }

    /// Whether a live, enabled track of this kind exists.
    pub fn has_active(&self, kind: MediaKind) -> bool {
        self.tracks_of(kind).any(|t| t.is_live() && t.is_enabled())
    }

    pub fn add_track(&mut self, track: MediaTrack) {
        if !self.tracks.iter().any(|t| t.same_track(&track)) {
            self.tracks.push(track);
        }
    }

    /// Same id, with `tracks` appended.
    pub fn with_tracks(&self, tracks: &[MediaTrack]) -> Self {
        let mut merged = self.clone();
        for t in tracks {
            merged.add_track(t.clone());
        }
        merged
    }
}

/// Capture device backend.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Open one capture track of `kind`.
    async fn open(&self, kind: MediaKind) -> Result<MediaTrack, AcquireError>;
}

/// Hands out local streams and owns their hardware lifecycle.
pub struct MediaAcquisition {
    devices: Arc<dyn MediaDevices>,
    live: Mutex<Vec<MediaTrack>>,
}

impl MediaAcquisition {
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        Self {
            devices,
            live: Mutex::new(Vec::new()),
        }
    }

    /// Audio → microphone; video → microphone + camera.
    ///
    /// Never downgrades: if the camera fails, the error is returned and the
    /// caller decides whether to retry audio-only.
    pub async fn acquire(&self, kind: MediaKind) -> Result<MediaStream, AcquireError> {
        self.acquire_tracks(kind.track_kinds()).await
    }

    /// Open one track per kind in `kinds`.
    ///
    /// Live tracks of the requested kinds handed out earlier are stopped
    /// first. On failure, tracks opened by this call are stopped.
    pub async fn acquire_tracks(&self, kinds: &[MediaKind]) -> Result<MediaStream, AcquireError> {
        self.stop_live(kinds);

        let mut opened: Vec<MediaTrack> = Vec::with_capacity(kinds.len());
        for kind in kinds {
            match self.devices.open(*kind).await {
                Ok(track) => opened.push(track),
                Err(e) => {
                    tracing::warn!("Failed to open {} device: {}", kind, e);
                    for t in &opened {
                        t.stop();
                    }
                    return Err(e);
                }
            }
        }

        {
            let mut live = self.live.lock().unwrap_or_else(|e| e.into_inner());
            live.retain(|t| t.is_live());
            live.extend(opened.iter().cloned());
        }

        let stream = MediaStream::new(opened);
        tracing::info!(
            "Acquired local stream {} ({})",
            stream.id(),
            stream
                .tracks()
                .iter()
                .map(|t| t.label())
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(stream)
    }

    /// Stop every track of `stream`. Safe to call twice.
    pub fn release(&self, stream: &MediaStream) {
        let mut stopped = 0;
        for t in stream.tracks() {
            if t.stop() {
                stopped += 1;
            }
        }
        let mut live = self.live.lock().unwrap_or_else(|e| e.into_inner());
        live.retain(|t| t.is_live());
        if stopped > 0 {
            tracing::info!("Released {} track(s) of stream {}", stopped, stream.id());
        }
    }

    /// Tracks handed out and not yet stopped.
    pub fn live_tracks(&self) -> Vec<MediaTrack> {
        let live = self.live.lock().unwrap_or_else(|e| e.into_inner());
        live.iter().filter(|t| t.is_live()).cloned().collect()
    }

    fn stop_live(&self, kinds: &[MediaKind]) {
        let mut live = self.live.lock().unwrap_or_else(|e| e.into_inner());
        live.retain(|t| {
            if kinds.contains(&t.kind()) && t.is_live() {
                tracing::debug!("Stopping previous {} track {}", t.kind(), t.id());
                t.stop();
                false
            } else {
                t.is_live()
            }
        });
    }
}

/// Host capture devices.
///
/// Opening a device here only checks it is present; samples are not captured.
pub struct SystemDevices {
    camera_path: PathBuf,
}

impl SystemDevices {
    pub fn new(camera_path: Option<PathBuf>) -> Self {
        Self {
            camera_path: camera_path.unwrap_or_else(|| PathBuf::from("/dev/video0")),
        }
    }
}

impl Default for SystemDevices {
    fn default() -> Self {
        Self::new(None)
    }
}

#[async_trait]
impl MediaDevices for SystemDevices {
    async fn open(&self, kind: MediaKind) -> Result<MediaTrack, AcquireError> {
        let camera_path = self.camera_path.clone();
        let opened = tokio::task::spawn_blocking(move || match kind {
            MediaKind::Audio => open_microphone(),
            MediaKind::Video => open_camera(&camera_path),
        })
        .await
        .map_err(|e| AcquireError::Device {
            kind,
            reason: format!("device task failed: {}", e),
        })?;

        opened.map(|label| MediaTrack::new(kind, &label))
    }
}

#[cfg(feature = "audio")]
fn open_microphone() -> Result<String, AcquireError> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or(AcquireError::NoDevice(MediaKind::Audio))?;
    Ok(device
        .name()
        .unwrap_or_else(|_| "Default microphone".to_string()))
}

#[cfg(not(feature = "audio"))]
fn open_microphone() -> Result<String, AcquireError> {
    Ok("Synthetic microphone".to_string())
}

#[cfg(feature = "video-capture")]
fn open_camera(path: &std::path::Path) -> Result<String, AcquireError> {
    let dev = v4l::Device::with_path(path).map_err(|e| io_to_acquire(MediaKind::Video, e))?;
    let caps = dev
        .query_caps()
        .map_err(|e| io_to_acquire(MediaKind::Video, e))?;
    Ok(caps.card)
}

#[cfg(not(feature = "video-capture"))]
fn open_camera(path: &std::path::Path) -> Result<String, AcquireError> {
    std::fs::OpenOptions::new()
        .read(true)
        .open(path)
        .map_err(|e| io_to_acquire(MediaKind::Video, e))?;
    Ok(format!("Camera {}", path.display()))
}

fn io_to_acquire(kind: MediaKind, e: std::io::Error) -> AcquireError {
    match e.kind() {
        std::io::ErrorKind::NotFound => AcquireError::NoDevice(kind),
        std::io::ErrorKind::PermissionDenied => AcquireError::PermissionDenied(kind),
        _ => AcquireError::Device {
            kind,
            reason: e.to_string(),
        },
    }
}
