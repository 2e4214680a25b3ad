//! Microphone capture using CPAL
//!
//! The input callback converts whatever the device delivers to mono PCM16 at
//! the session rate, then cuts it into fixed-duration frames for the
//! `FrameQueue`. The callback never blocks on the network.

use std::sync::Arc;

use cpal::traits::DeviceTrait;
use cpal::{Device, SampleFormat, Stream, StreamConfig};
use tokio::sync::mpsc;

use super::convert::{downsample, sample_to_i16, to_mono};
use super::{AudioError, FrameQueue};

/// Cuts a continuous sample stream into frames of a fixed length
#[derive(Debug)]
pub struct FrameAssembler {
    frame_samples: usize,
    pending: Vec<i16>,
}

impl FrameAssembler {
    pub fn new(sample_rate: u32, frame_ms: u32) -> Self {
        let frame_samples = ((sample_rate as u64 * frame_ms as u64) / 1000).max(1) as usize;
        Self {
            frame_samples,
            pending: Vec::with_capacity(frame_samples * 2),
        }
    }

    /// Append samples and return every frame that is now complete.
    pub fn push(&mut self, samples: &[i16]) -> Vec<Vec<i16>> {
        self.pending.extend_from_slice(samples);

        let complete = self.pending.len() / self.frame_samples;
        if complete == 0 {
            return Vec::new();
        }

        let consumed = complete * self.frame_samples;
        let frames = self.pending[..consumed]
            .chunks(self.frame_samples)
            .map(|c| c.to_vec())
            .collect();
        self.pending.drain(..consumed);
        frames
    }

    pub fn frame_samples(&self) -> usize {
        self.frame_samples
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Parameters resolved for the input device
pub(super) struct InputPlan {
    pub config: StreamConfig,
    pub sample_format: SampleFormat,
    pub target_rate: u32,
    pub frame_ms: u32,
}

/// Pick an input configuration that can deliver `target_rate`.
///
/// Prefers a native configuration at the target rate; otherwise falls back to
/// the default configuration when its rate is an integer multiple.
pub(super) fn plan_input(
    device: &Device,
    target_rate: u32,
    frame_ms: u32,
) -> Result<InputPlan, AudioError> {
    let native = device
        .supported_input_configs()
        .map_err(|_| AudioError::NoSupportedConfig)?
        .filter(|range| {
            range.min_sample_rate().0 <= target_rate && range.max_sample_rate().0 >= target_rate
        })
        .find(|range| {
            matches!(
                range.sample_format(),
                SampleFormat::I16 | SampleFormat::F32 | SampleFormat::U16
            )
        })
        .map(|range| range.with_sample_rate(cpal::SampleRate(target_rate)));

    let supported = match native {
        Some(config) => config,
        None => {
            let default = device
                .default_input_config()
                .map_err(|_| AudioError::NoSupportedConfig)?;
            let device_rate = default.sample_rate().0;
            if device_rate < target_rate || device_rate % target_rate != 0 {
                return Err(AudioError::UnsupportedSampleRate {
                    device: device_rate,
                    target: target_rate,
                });
            }
            default
        }
    };

    log::info!(
        "Input config: {} Hz, {} channels, {:?}",
        supported.sample_rate().0,
        supported.channels(),
        supported.sample_format()
    );

    Ok(InputPlan {
        sample_format: supported.sample_format(),
        config: supported.into(),
        target_rate,
        frame_ms,
    })
}

pub(super) fn build_input_stream(
    device: &Device,
    plan: &InputPlan,
    frames: Arc<FrameQueue>,
    failures: mpsc::UnboundedSender<AudioError>,
) -> Result<Stream, AudioError> {
    match plan.sample_format {
        SampleFormat::I16 => build_input_typed::<i16>(device, plan, frames, failures),
        SampleFormat::U16 => build_input_typed::<u16>(device, plan, frames, failures),
        SampleFormat::F32 => build_input_typed::<f32>(device, plan, frames, failures),
        _ => Err(AudioError::NoSupportedConfig),
    }
}

fn build_input_typed<T>(
    device: &Device,
    plan: &InputPlan,
    frames: Arc<FrameQueue>,
    failures: mpsc::UnboundedSender<AudioError>,
) -> Result<Stream, AudioError>
where
    T: cpal::SizedSample + Send + 'static,
    f32: cpal::FromSample<T>,
{
    let channels = plan.config.channels;
    let device_rate = plan.config.sample_rate.0;
    let target_rate = plan.target_rate;
    let mut assembler = FrameAssembler::new(target_rate, plan.frame_ms);

    let err_fn = move |err: cpal::StreamError| {
        log::error!("Audio input stream error: {}", err);
        let _ = failures.send(AudioError::StreamFailed(err.to_string()));
    };

    device
        .build_input_stream(
            &plan.config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                if frames.is_closed() {
                    return;
                }

                let interleaved: Vec<i16> = data.iter().map(|&s| sample_to_i16(s)).collect();
                let mono = to_mono(&interleaved, channels);
                let Some(resampled) = downsample(&mono, device_rate, target_rate) else {
                    return;
                };

                for frame in assembler.push(&resampled) {
                    frames.push(frame);
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))
}
