use super::*;
use async_trait::async_trait;
use tokio::sync::mpsc;

struct FakeShell {
    sources: Vec<AudioSourceDescriptor>,
    fail_with: Option<fn(&str) -> CaptureError>,
}

impl FakeShell {
    fn with_sources(sources: Vec<AudioSourceDescriptor>) -> Self {
        Self {
            sources,
            fail_with: None,
        }
    }

    fn failing(fail_with: fn(&str) -> CaptureError) -> Self {
        Self {
            sources: Vec::new(),
            fail_with: Some(fail_with),
        }
    }
}

#[async_trait]
impl DesktopShell for FakeShell {
    async fn list_audio_sources(&self) -> Result<Vec<AudioSourceDescriptor>, CaptureError> {
        Ok(self.sources.clone())
    }

    async fn open_audio_source(
        &self,
        source_id: &str,
        _constraints: &CaptureConstraints,
    ) -> Result<SystemAudioStream, CaptureError> {
        if let Some(fail) = self.fail_with {
            return Err(fail(source_id));
        }
        let (tx, rx) = mpsc::channel(4);
        tx.try_send(AudioFrame {
            samples: vec![0, 1, 2, 3],
            sample_rate: 48_000,
            channels: 2,
            timestamp_ms: 0,
        })
        .expect("seed frame");
        drop(tx);
        Ok(SystemAudioStream::new(source_id, rx, None))
    }
}

fn system_source(id: &str) -> AudioSourceDescriptor {
    AudioSourceDescriptor {
        id: id.to_string(),
        label: format!("Monitor of {id}"),
        kind: AudioSourceKind::SystemOutput,
    }
}

#[test]
fn classifies_permission_failures() {
    let err = classify_capture_failure("speakers", "Access denied by the OS");
    assert!(is_permission_error(&err));

    let err = classify_capture_failure("speakers", "client is not authorized to record");
    assert!(is_permission_error(&err));
}

#[test]
fn classifies_missing_device_failures() {
    let err = classify_capture_failure("speakers", "no such device");
    assert!(matches!(err, CaptureError::NotAvailable { .. }));
    assert!(!is_permission_error(&err));

    let err = classify_capture_failure("speakers", "loopback recording not supported");
    assert!(matches!(err, CaptureError::NotAvailable { .. }));
}

#[test]
fn unclassifiable_failures_stay_unknown() {
    let err = classify_capture_failure("speakers", "alsa buffer underrun xrun");
    assert!(matches!(err, CaptureError::Unknown(_)));
}

#[test]
fn monitor_source_filter_excludes_microphones() {
    assert!(looks_like_monitor_source(
        "Monitor of Built-in Audio Analog Stereo"
    ));
    assert!(looks_like_monitor_source("alsa_output.pci.monitor"));
    assert!(!looks_like_monitor_source("Built-in Microphone"));
    assert!(!looks_like_monitor_source("USB Headset Mic"));
}

#[tokio::test]
async fn unsupported_backend_enumerates_nothing_and_refuses_capture() {
    let backend = UnsupportedCapture::new(Platform::Unsupported);

    assert!(!backend.is_available());
    assert!(backend.list_sources().await.expect("list").is_empty());

    let err = backend
        .capture("anything", &CaptureConstraints::default())
        .await
        .expect_err("must refuse");
    assert!(matches!(err, CaptureError::NotAvailable { .. }));
}

#[tokio::test]
async fn shell_brokered_backend_delegates_enumeration_and_capture() {
    let shell = Arc::new(FakeShell::with_sources(vec![system_source("speakers")]));
    let backend = ShellBrokeredCapture::new(shell);

    assert!(backend.is_available());
    let sources = backend.list_sources().await.expect("list");
    assert_eq!(sources.len(), 1);
    assert_eq!(sources[0].kind, AudioSourceKind::SystemOutput);

    let mut stream = backend
        .capture("speakers", &CaptureConstraints::default())
        .await
        .expect("capture");
    assert_eq!(stream.source_id(), "speakers");
    let frame = stream.next_frame().await.expect("frame");
    assert_eq!(frame.samples, vec![0, 1, 2, 3]);
    assert_eq!(stream.next_frame().await, None);
}

#[tokio::test]
async fn shell_permission_denial_is_classified_not_masked() {
    let shell = Arc::new(FakeShell::failing(|source| CaptureError::PermissionDenied {
        source: source.to_string(),
    }));
    let backend = ShellBrokeredCapture::new(shell);

    let err = backend
        .capture("speakers", &CaptureConstraints::default())
        .await
        .expect_err("must fail");
    assert!(is_permission_error(&err));
}

#[tokio::test]
async fn macos_without_shell_falls_back_to_unsupported_stub() {
    let backend = backend_for(Platform::MacOs, None);

    assert_eq!(backend.platform(), Platform::MacOs);
    assert!(!backend.is_available());
    assert!(matches!(
        backend
            .capture("speakers", &CaptureConstraints::default())
            .await,
        Err(CaptureError::NotAvailable { .. })
    ));
}

#[test]
fn platform_availability_matrix() {
    assert!(is_system_audio_capture_available(Platform::Windows));
    assert!(is_system_audio_capture_available(Platform::Linux));
    assert!(!is_system_audio_capture_available(Platform::MacOs));
    assert!(!is_system_audio_capture_available(Platform::Unsupported));
}

#[test]
fn stream_stop_is_idempotent_and_signals_shutdown() {
    let (shutdown_tx, shutdown_rx) = std::sync::mpsc::channel();
    let (_frame_tx, frame_rx) = mpsc::channel::<AudioFrame>(1);
    let mut stream = SystemAudioStream::new("speakers", frame_rx, Some(shutdown_tx));

    stream.stop();
    stream.stop();
    assert!(shutdown_rx.try_recv().is_ok());
}
