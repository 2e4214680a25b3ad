//! Audio device lifecycle
//!
//! CPAL streams are not `Send` on every platform, so `CpalAudio` opens and
//! owns them on a dedicated thread. Readiness is reported back through a
//! oneshot; dropping the stop channel tears the streams down.

use std::sync::Arc;
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Host};
use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};

use super::capture::{build_input_stream, plan_input};
use super::playback::{build_output_stream, plan_output};
use super::{AudioError, AudioSink, FrameQueue, PlaybackBuffer, SharedPlayback};

/// Audio parameters for one session
#[derive(Debug, Clone, PartialEq)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub frame_ms: u32,
    pub prebuffer_ms: u32,
    pub flush_bound_ms: u32,
    /// Silence ahead of each new run of assistant audio
    pub speak_delay_ms: u32,
    /// Device names; `None` selects the system default
    pub input_device: Option<String>,
    pub output_device: Option<String>,
}

/// Opens capture and playback for a session.
///
/// `start` begins pushing captured frames into `frames` and returns the sink
/// for assistant audio. Runtime device failures are reported on `failures`.
pub trait AudioBackend: Send {
    fn start(
        &mut self,
        config: AudioConfig,
        frames: Arc<FrameQueue>,
        failures: mpsc::UnboundedSender<AudioError>,
    ) -> BoxFuture<'static, Result<Arc<dyn AudioSink>, AudioError>>;

    /// Release the devices. Safe to call more than once.
    fn stop(&mut self);
}

/// Microphone and speaker backend using CPAL
#[derive(Default)]
pub struct CpalAudio {
    stop_tx: Option<std::sync::mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl CpalAudio {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AudioBackend for CpalAudio {
    fn start(
        &mut self,
        config: AudioConfig,
        frames: Arc<FrameQueue>,
        failures: mpsc::UnboundedSender<AudioError>,
    ) -> BoxFuture<'static, Result<Arc<dyn AudioSink>, AudioError>> {
        self.stop();

        let playback = SharedPlayback::from_buffer(
            PlaybackBuffer::new(config.sample_rate, config.prebuffer_ms)
                .with_lead_in(config.speak_delay_ms),
        );
        let (ready_tx, ready_rx) = oneshot::channel::<Result<(), AudioError>>();
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();

        let thread_playback = playback.clone();
        let spawned = std::thread::Builder::new()
            .name("mimamori-audio".into())
            .spawn(move || {
                let streams = match open_streams(&config, frames, thread_playback, failures) {
                    Ok(streams) => streams,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));

                // Blocks until stop() sends or drops the sender
                let _ = stop_rx.recv();
                drop(streams);
                log::info!("Audio streams closed");
            });

        match spawned {
            Ok(handle) => {
                self.stop_tx = Some(stop_tx);
                self.thread = Some(handle);
            }
            Err(e) => {
                let err = AudioError::StreamCreationFailed(e.to_string());
                return Box::pin(async move { Err(err) });
            }
        }

        Box::pin(async move {
            match ready_rx.await {
                Ok(Ok(())) => Ok(Arc::new(playback) as Arc<dyn AudioSink>),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(AudioError::StreamCreationFailed(
                    "audio thread exited before streams were ready".into(),
                )),
            }
        })
    }

    fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                log::error!("Audio thread panicked");
            }
        }
    }
}

impl Drop for CpalAudio {
    fn drop(&mut self) {
        self.stop();
    }
}

fn select_input(host: &Host, name: Option<&str>) -> Result<Device, AudioError> {
    match name {
        Some(name) => host
            .input_devices()
            .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or(AudioError::NoInputDevice),
        None => host.default_input_device().ok_or(AudioError::NoInputDevice),
    }
}

fn select_output(host: &Host, name: Option<&str>) -> Result<Device, AudioError> {
    match name {
        Some(name) => host
            .output_devices()
            .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or(AudioError::NoOutputDevice),
        None => host.default_output_device().ok_or(AudioError::NoOutputDevice),
    }
}

fn open_streams(
    config: &AudioConfig,
    frames: Arc<FrameQueue>,
    playback: SharedPlayback,
    failures: mpsc::UnboundedSender<AudioError>,
) -> Result<(cpal::Stream, cpal::Stream), AudioError> {
    let host = cpal::default_host();

    let input = select_input(&host, config.input_device.as_deref())?;
    log::info!("Using audio input device: {:?}", input.name());
    let output = select_output(&host, config.output_device.as_deref())?;
    log::info!("Using audio output device: {:?}", output.name());

    let input_plan = plan_input(&input, config.sample_rate, config.frame_ms)?;
    let output_plan = plan_output(&output, config.sample_rate, config.flush_bound_ms)?;

    let output_stream = build_output_stream(&output, &output_plan, playback, failures.clone())?;
    let input_stream = build_input_stream(&input, &input_plan, frames, failures)?;

    output_stream
        .play()
        .map_err(|e| AudioError::StreamCreationFailed(format!("Failed to start output: {}", e)))?;
    input_stream
        .play()
        .map_err(|e| AudioError::StreamCreationFailed(format!("Failed to start input: {}", e)))?;

    log::info!(
        "Audio started: {} Hz, {} ms frames",
        config.sample_rate,
        config.frame_ms
    );
    Ok((input_stream, output_stream))
}
