//! cpal-backed loopback capture.
//!
//! The cpal `Stream` is `!Send`, so each capture runs on a dedicated thread
//! that owns the stream and bridges frames into a tokio channel. The thread
//! parks on a shutdown channel; dropping the [`SystemAudioStream`] handle
//! wakes and ends it.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::{
    classify_capture_failure, AudioFrame, AudioSourceDescriptor, AudioSourceKind,
    CaptureConstraints, CaptureError, Platform, SystemAudioCapture, SystemAudioStream,
};

const FRAME_CHANNEL_CAPACITY: usize = 64;

fn spawn_stream_thread(
    device: cpal::Device,
    config: cpal::StreamConfig,
    source_id: String,
) -> (
    oneshot::Receiver<Result<(), String>>,
    mpsc::Receiver<AudioFrame>,
    std::sync::mpsc::Sender<()>,
) {
    let (ready_tx, ready_rx) = oneshot::channel();
    let (frame_tx, frame_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
    let (shutdown_tx, shutdown_rx) = std::sync::mpsc::channel::<()>();

    std::thread::spawn(move || {
        let sample_rate = config.sample_rate.0;
        let channels = config.channels;
        let started = std::time::Instant::now();
        let error_source = source_id.clone();

        let stream = device.build_input_stream(
            &config,
            move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                let samples = data
                    .iter()
                    .map(|sample| (sample * i16::MAX as f32) as i16)
                    .collect();
                let frame = AudioFrame {
                    samples,
                    sample_rate,
                    channels,
                    timestamp_ms: started.elapsed().as_millis() as u64,
                };
                // Drop frames instead of blocking the audio callback when
                // the consumer lags.
                let _ = frame_tx.try_send(frame);
            },
            move |err| {
                warn!(source = %error_source, "system audio stream error: {err}");
            },
            None,
        );

        match stream {
            Ok(stream) => {
                if let Err(err) = stream.play() {
                    let _ = ready_tx.send(Err(err.to_string()));
                    return;
                }
                let _ = ready_tx.send(Ok(()));
                // Park until the handle is stopped or dropped; the stream
                // stays alive exactly as long as this thread does.
                let _ = shutdown_rx.recv();
                debug!(source = %source_id, "system audio stream stopped");
            }
            Err(err) => {
                let _ = ready_tx.send(Err(err.to_string()));
            }
        }
    });

    (ready_rx, frame_rx, shutdown_tx)
}

async fn open_stream(
    device: cpal::Device,
    config: cpal::StreamConfig,
    source_id: &str,
) -> Result<SystemAudioStream, CaptureError> {
    let (ready_rx, frame_rx, shutdown_tx) =
        spawn_stream_thread(device, config, source_id.to_string());

    match ready_rx.await {
        Ok(Ok(())) => Ok(SystemAudioStream::new(
            source_id,
            frame_rx,
            Some(shutdown_tx),
        )),
        Ok(Err(message)) => Err(classify_capture_failure(source_id, &message)),
        Err(_) => Err(CaptureError::Unknown(anyhow::anyhow!(
            "capture thread exited before reporting readiness"
        ))),
    }
}

fn stream_config_for(
    device: &cpal::Device,
    constraints: &CaptureConstraints,
) -> Result<cpal::StreamConfig, String> {
    let default = device.default_input_config().map_err(|err| err.to_string())?;
    let mut config = default.config();
    config.sample_rate = cpal::SampleRate(constraints.sample_rate);
    if constraints.channels > 0 {
        config.channels = constraints.channels;
    }
    Ok(config)
}

/// Windows: WASAPI render endpoints support loopback recording, so the
/// source list is the set of output devices. No input device is touched.
#[cfg(target_os = "windows")]
pub struct WasapiLoopbackCapture {
    host: cpal::Host,
}

#[cfg(target_os = "windows")]
impl WasapiLoopbackCapture {
    pub fn new() -> Self {
        Self {
            host: cpal::default_host(),
        }
    }

    fn find_device(&self, source_id: &str) -> Result<cpal::Device, CaptureError> {
        let devices = self.host.output_devices().map_err(|err| {
            classify_capture_failure(source_id, &err.to_string())
        })?;
        for device in devices {
            if let Ok(name) = device.name() {
                if name == source_id {
                    return Ok(device);
                }
            }
        }
        Err(CaptureError::NotAvailable {
            reason: format!("output endpoint '{source_id}' not found"),
        })
    }
}

#[cfg(target_os = "windows")]
#[async_trait::async_trait]
impl SystemAudioCapture for WasapiLoopbackCapture {
    fn platform(&self) -> Platform {
        Platform::Windows
    }

    fn is_available(&self) -> bool {
        true
    }

    async fn list_sources(&self) -> Result<Vec<AudioSourceDescriptor>, CaptureError> {
        let devices = self
            .host
            .output_devices()
            .map_err(|err| classify_capture_failure("enumeration", &err.to_string()))?;
        let mut sources = Vec::new();
        for device in devices {
            let Ok(name) = device.name() else { continue };
            sources.push(AudioSourceDescriptor {
                id: name.clone(),
                label: name,
                kind: AudioSourceKind::SystemOutput,
            });
        }
        Ok(sources)
    }

    async fn capture(
        &self,
        source_id: &str,
        constraints: &CaptureConstraints,
    ) -> Result<SystemAudioStream, CaptureError> {
        let device = self.find_device(source_id)?;
        // WASAPI opens an input stream on a render endpoint in loopback
        // mode; the default output format is what the endpoint mixes at.
        let config = match device.default_output_config() {
            Ok(supported) => supported.config(),
            Err(_) => stream_config_for(&device, constraints)
                .map_err(|err| classify_capture_failure(source_id, &err))?,
        };
        open_stream(device, config, source_id).await
    }
}

/// Linux: PulseAudio/PipeWire publish "Monitor of ..." capture devices for
/// every sink. Only those are offered; other capture devices are real
/// microphones and are filtered out.
#[cfg(target_os = "linux")]
pub struct MonitorSourceCapture {
    host: cpal::Host,
}

#[cfg(target_os = "linux")]
impl MonitorSourceCapture {
    pub fn new() -> Self {
        Self {
            host: cpal::default_host(),
        }
    }

    fn find_monitor_device(&self, source_id: &str) -> Result<cpal::Device, CaptureError> {
        let devices = self.host.input_devices().map_err(|err| {
            classify_capture_failure(source_id, &err.to_string())
        })?;
        for device in devices {
            let Ok(name) = device.name() else { continue };
            if name == source_id {
                if !crate::looks_like_monitor_source(&name) {
                    return Err(CaptureError::NotAvailable {
                        reason: format!("'{source_id}' is not a monitor source"),
                    });
                }
                return Ok(device);
            }
        }
        Err(CaptureError::NotAvailable {
            reason: format!("monitor source '{source_id}' not found"),
        })
    }
}

#[cfg(target_os = "linux")]
#[async_trait::async_trait]
impl SystemAudioCapture for MonitorSourceCapture {
    fn platform(&self) -> Platform {
        Platform::Linux
    }

    fn is_available(&self) -> bool {
        true
    }

    async fn list_sources(&self) -> Result<Vec<AudioSourceDescriptor>, CaptureError> {
        let devices = self
            .host
            .input_devices()
            .map_err(|err| classify_capture_failure("enumeration", &err.to_string()))?;
        let mut sources = Vec::new();
        for device in devices {
            let Ok(name) = device.name() else { continue };
            if !crate::looks_like_monitor_source(&name) {
                continue;
            }
            sources.push(AudioSourceDescriptor {
                id: name.clone(),
                label: name,
                kind: AudioSourceKind::SystemOutput,
            });
        }
        Ok(sources)
    }

    async fn capture(
        &self,
        source_id: &str,
        constraints: &CaptureConstraints,
    ) -> Result<SystemAudioStream, CaptureError> {
        let device = self.find_monitor_device(source_id)?;
        let config = stream_config_for(&device, constraints)
            .map_err(|err| classify_capture_failure(source_id, &err))?;
        open_stream(device, config, source_id).await
    }
}
