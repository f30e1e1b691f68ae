//! System-audio capture for screen sharing.
//!
//! Capturing the machine's own audio output (loopback) is platform-specific:
//! Windows exposes render endpoints for loopback recording, Linux desktops
//! expose monitor sources, and macOS only allows it through a desktop-shell
//! broker that owns the OS permission prompt. Each platform tag gets one
//! backend behind [`SystemAudioCapture`], selected once via [`backend_for`].
//!
//! The one rule every backend observes: a failed system-audio capture is
//! NEVER answered with a microphone stream. Enumeration excludes input
//! devices entirely and failures are classified so the caller can degrade
//! to video-only with an accurate message.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

#[cfg(all(
    feature = "loopback-cpal",
    any(target_os = "windows", target_os = "linux")
))]
mod cpal_backend;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    Windows,
    MacOs,
    Linux,
    Unsupported,
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Platform::Windows => "windows",
            Platform::MacOs => "macos",
            Platform::Linux => "linux",
            Platform::Unsupported => "unsupported",
        };
        f.write_str(name)
    }
}

pub fn detect_platform() -> Platform {
    if cfg!(target_os = "windows") {
        Platform::Windows
    } else if cfg!(target_os = "macos") {
        Platform::MacOs
    } else if cfg!(target_os = "linux") {
        Platform::Linux
    } else {
        Platform::Unsupported
    }
}

/// Whether the platform supports loopback capture at all without a shell
/// broker. macOS needs the desktop shell; see [`backend_for`].
pub fn is_system_audio_capture_available(platform: Platform) -> bool {
    matches!(platform, Platform::Windows | Platform::Linux)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioSourceKind {
    /// A whole output endpoint (speakers, headphones).
    SystemOutput,
    /// A single application's audio, where the platform can isolate it.
    Application,
}

/// Platform-reported capturable endpoint. Transient: re-queried every time
/// the picker opens, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioSourceDescriptor {
    pub id: String,
    pub label: String,
    pub kind: AudioSourceKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConstraints {
    pub sample_rate: u32,
    pub channels: u16,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    pub channels: u16,
    pub timestamp_ms: u64,
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("audio capture permission denied for source '{source}'")]
    PermissionDenied { source: String },
    #[error("system audio capture not available: {reason}")]
    NotAvailable { reason: String },
    #[error("system audio capture failed: {0}")]
    Unknown(#[from] anyhow::Error),
}

pub fn is_permission_error(err: &CaptureError) -> bool {
    matches!(err, CaptureError::PermissionDenied { .. })
}

/// Maps a platform error message onto the capture taxonomy so the caller
/// can tell "grant access in system settings" apart from "this machine
/// can't do it".
pub fn classify_capture_failure(source: &str, message: &str) -> CaptureError {
    let lowered = message.to_ascii_lowercase();
    if lowered.contains("permission")
        || lowered.contains("access denied")
        || lowered.contains("not authorized")
        || lowered.contains("unauthorized")
    {
        CaptureError::PermissionDenied {
            source: source.to_string(),
        }
    } else if lowered.contains("not found")
        || lowered.contains("no such device")
        || lowered.contains("device is no longer valid")
        || lowered.contains("unsupported")
        || lowered.contains("not supported")
    {
        CaptureError::NotAvailable {
            reason: message.to_string(),
        }
    } else {
        CaptureError::Unknown(anyhow::anyhow!("{message}"))
    }
}

/// Live system-audio stream. Frames arrive on an async channel fed by a
/// dedicated stream thread (platform audio streams are not `Send`); dropping
/// the handle stops the thread and releases the endpoint.
pub struct SystemAudioStream {
    source_id: String,
    frames: mpsc::Receiver<AudioFrame>,
    shutdown: Option<std::sync::mpsc::Sender<()>>,
}

impl SystemAudioStream {
    pub fn new(
        source_id: impl Into<String>,
        frames: mpsc::Receiver<AudioFrame>,
        shutdown: Option<std::sync::mpsc::Sender<()>>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            frames,
            shutdown,
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    /// Next captured frame; `None` once the stream has stopped.
    pub async fn next_frame(&mut self) -> Option<AudioFrame> {
        self.frames.recv().await
    }

    pub fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        self.frames.close();
    }
}

impl Drop for SystemAudioStream {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

/// One backend per platform tag. Implementations enumerate only loopback
/// endpoints; microphone inputs are out of bounds by contract.
#[async_trait]
pub trait SystemAudioCapture: Send + Sync {
    fn platform(&self) -> Platform;
    fn is_available(&self) -> bool;
    async fn list_sources(&self) -> Result<Vec<AudioSourceDescriptor>, CaptureError>;
    async fn capture(
        &self,
        source_id: &str,
        constraints: &CaptureConstraints,
    ) -> Result<SystemAudioStream, CaptureError>;
}

/// Desktop-shell collaborator: enumerates and opens audio sources through
/// the wrapper process, which owns the OS permission prompts.
#[async_trait]
pub trait DesktopShell: Send + Sync {
    async fn list_audio_sources(&self) -> Result<Vec<AudioSourceDescriptor>, CaptureError>;
    async fn open_audio_source(
        &self,
        source_id: &str,
        constraints: &CaptureConstraints,
    ) -> Result<SystemAudioStream, CaptureError>;
}

/// Selects the backend for a platform tag, once. Platform dispatch lives
/// here instead of inline conditionals along the capture path.
pub fn backend_for(
    platform: Platform,
    shell: Option<Arc<dyn DesktopShell>>,
) -> Arc<dyn SystemAudioCapture> {
    match platform {
        Platform::Windows => {
            #[cfg(all(feature = "loopback-cpal", target_os = "windows"))]
            {
                Arc::new(cpal_backend::WasapiLoopbackCapture::new())
            }
            #[cfg(not(all(feature = "loopback-cpal", target_os = "windows")))]
            {
                Arc::new(UnsupportedCapture::new(platform))
            }
        }
        Platform::Linux => {
            #[cfg(all(feature = "loopback-cpal", target_os = "linux"))]
            {
                Arc::new(cpal_backend::MonitorSourceCapture::new())
            }
            #[cfg(not(all(feature = "loopback-cpal", target_os = "linux")))]
            {
                Arc::new(UnsupportedCapture::new(platform))
            }
        }
        Platform::MacOs => match shell {
            Some(shell) => Arc::new(ShellBrokeredCapture::new(shell)),
            None => Arc::new(UnsupportedCapture::new(platform)),
        },
        Platform::Unsupported => Arc::new(UnsupportedCapture::new(platform)),
    }
}

/// Stub for platforms without loopback support. Enumerates nothing and
/// refuses capture with `NotAvailable` so callers degrade to video-only.
pub struct UnsupportedCapture {
    platform: Platform,
}

impl UnsupportedCapture {
    pub fn new(platform: Platform) -> Self {
        Self { platform }
    }
}

#[async_trait]
impl SystemAudioCapture for UnsupportedCapture {
    fn platform(&self) -> Platform {
        self.platform
    }

    fn is_available(&self) -> bool {
        false
    }

    async fn list_sources(&self) -> Result<Vec<AudioSourceDescriptor>, CaptureError> {
        Ok(Vec::new())
    }

    async fn capture(
        &self,
        _source_id: &str,
        _constraints: &CaptureConstraints,
    ) -> Result<SystemAudioStream, CaptureError> {
        Err(CaptureError::NotAvailable {
            reason: format!("no system audio backend for platform '{}'", self.platform),
        })
    }
}

/// macOS path: loopback needs the desktop shell, which fronts the screen
/// recording permission and native source enumeration.
pub struct ShellBrokeredCapture {
    shell: Arc<dyn DesktopShell>,
}

impl ShellBrokeredCapture {
    pub fn new(shell: Arc<dyn DesktopShell>) -> Self {
        Self { shell }
    }
}

#[async_trait]
impl SystemAudioCapture for ShellBrokeredCapture {
    fn platform(&self) -> Platform {
        Platform::MacOs
    }

    fn is_available(&self) -> bool {
        true
    }

    async fn list_sources(&self) -> Result<Vec<AudioSourceDescriptor>, CaptureError> {
        self.shell.list_audio_sources().await
    }

    async fn capture(
        &self,
        source_id: &str,
        constraints: &CaptureConstraints,
    ) -> Result<SystemAudioStream, CaptureError> {
        self.shell.open_audio_source(source_id, constraints).await
    }
}

/// PulseAudio/PipeWire expose loopback endpoints as capture devices named
/// "Monitor of ...". Anything else on the input side is a real microphone
/// and must not be offered.
pub(crate) fn looks_like_monitor_source(name: &str) -> bool {
    let lowered = name.to_ascii_lowercase();
    lowered.contains("monitor")
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
