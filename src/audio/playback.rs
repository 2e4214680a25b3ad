//! Assistant audio playback
//!
//! `PlaybackBuffer` is a small jitter buffer: it holds back output until
//! `prebuffer` worth of audio has arrived, then feeds the device callback.
//! A flush drops everything still queued so that at most one device period
//! (`flush_bound_ms`) of already-submitted audio is heard after barge-in.
//! An optional lead-in of silence is queued ahead of each new reply.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use cpal::traits::DeviceTrait;
use cpal::{BufferSize, Device, SampleFormat, Stream, StreamConfig};
use serde::Serialize;
use tokio::sync::mpsc;

use super::{AudioError, AudioFrame};

/// An inbound frame arrived with a sequence not greater than the last one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceRegression {
    pub last: u64,
    pub got: u64,
}

impl std::fmt::Display for SequenceRegression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Playback sequence regressed: got {} after {}",
            self.got, self.last
        )
    }
}

impl std::error::Error for SequenceRegression {}

/// Counters exposed for the session summary
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlaybackStats {
    pub frames_enqueued: u64,
    pub samples_played: u64,
    pub underruns: u64,
    pub flushes: u64,
    pub samples_flushed: u64,
}

#[derive(Debug)]
pub struct PlaybackBuffer {
    samples: VecDeque<i16>,
    sample_rate: u32,
    prebuffer_samples: usize,
    lead_in_samples: usize,
    /// Silence queued at the head of the current, not yet primed, run
    run_lead_in: usize,
    /// The next frame starts a new run of assistant audio
    run_start: bool,
    /// Output has started for the current run of audio
    primed: bool,
    /// The producer signalled end of stream; play out what remains
    draining: bool,
    last_sequence: Option<u64>,
    stats: PlaybackStats,
}

impl PlaybackBuffer {
    pub fn new(sample_rate: u32, prebuffer_ms: u32) -> Self {
        let prebuffer_samples = (sample_rate as u64 * prebuffer_ms as u64 / 1000) as usize;
        Self {
            samples: VecDeque::new(),
            sample_rate,
            prebuffer_samples,
            lead_in_samples: 0,
            run_lead_in: 0,
            run_start: true,
            primed: false,
            draining: false,
            last_sequence: None,
            stats: PlaybackStats::default(),
        }
    }

    /// Queue `lead_in_ms` of silence ahead of every new run of audio
    pub fn with_lead_in(mut self, lead_in_ms: u32) -> Self {
        self.lead_in_samples = (self.sample_rate as u64 * lead_in_ms as u64 / 1000) as usize;
        self
    }

    /// Queue an inbound frame. Frames must arrive in increasing sequence.
    pub fn enqueue(&mut self, frame: AudioFrame) -> Result<(), SequenceRegression> {
        if let Some(last) = self.last_sequence {
            if frame.sequence <= last {
                return Err(SequenceRegression {
                    last,
                    got: frame.sequence,
                });
            }
        }
        self.last_sequence = Some(frame.sequence);
        self.stats.frames_enqueued += 1;
        self.draining = false;
        if self.run_start {
            self.run_start = false;
            self.run_lead_in = self.lead_in_samples;
            self.samples
                .extend(std::iter::repeat(0).take(self.lead_in_samples));
        }
        self.samples.extend(frame.samples);

        if !self.primed && self.samples.len() >= self.prebuffer_samples + self.run_lead_in {
            self.primed = true;
            self.run_lead_in = 0;
        }
        Ok(())
    }

    /// No more audio is coming for the current response.
    pub fn mark_end(&mut self) {
        self.draining = true;
        self.run_start = true;
        if !self.samples.is_empty() {
            self.primed = true;
            self.run_lead_in = 0;
        }
    }

    /// Fill `out` with queued audio, padding with silence.
    ///
    /// Returns the number of real samples written.
    pub fn fill(&mut self, out: &mut [i16]) -> usize {
        if !self.primed {
            out.fill(0);
            return 0;
        }

        let mut written = 0;
        for slot in out.iter_mut() {
            match self.samples.pop_front() {
                Some(s) => {
                    *slot = s;
                    written += 1;
                }
                None => *slot = 0,
            }
        }
        self.stats.samples_played += written as u64;

        if self.samples.is_empty() {
            if self.draining {
                self.draining = false;
            } else if written < out.len() {
                self.stats.underruns += 1;
            }
            self.primed = false;
        }

        written
    }

    /// Drop all queued audio. Idempotent; returns the number of samples dropped.
    pub fn flush(&mut self) -> usize {
        let dropped = self.samples.len();
        self.samples.clear();
        self.primed = false;
        self.draining = false;
        self.run_start = true;
        self.run_lead_in = 0;
        self.stats.flushes += 1;
        self.stats.samples_flushed += dropped as u64;
        dropped
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn is_primed(&self) -> bool {
        self.primed
    }

    pub fn stats(&self) -> PlaybackStats {
        self.stats
    }
}

/// Destination for assistant audio
pub trait AudioSink: Send + Sync {
    fn enqueue(&self, frame: AudioFrame) -> Result<(), SequenceRegression>;
    fn end_of_stream(&self);
    /// Stop output and discard everything not yet handed to the device
    fn flush(&self);
    fn stats(&self) -> PlaybackStats;
}

/// `PlaybackBuffer` shared between the session and the output callback
#[derive(Debug, Clone)]
pub struct SharedPlayback {
    inner: Arc<Mutex<PlaybackBuffer>>,
}

impl SharedPlayback {
    pub fn new(sample_rate: u32, prebuffer_ms: u32) -> Self {
        Self::from_buffer(PlaybackBuffer::new(sample_rate, prebuffer_ms))
    }

    pub fn from_buffer(buffer: PlaybackBuffer) -> Self {
        Self {
            inner: Arc::new(Mutex::new(buffer)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PlaybackBuffer> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn fill(&self, out: &mut [i16]) -> usize {
        self.lock().fill(out)
    }

    pub fn buffered(&self) -> usize {
        self.lock().len()
    }
}

impl AudioSink for SharedPlayback {
    fn enqueue(&self, frame: AudioFrame) -> Result<(), SequenceRegression> {
        self.lock().enqueue(frame)
    }

    fn end_of_stream(&self) {
        self.lock().mark_end();
    }

    fn flush(&self) {
        let dropped = self.lock().flush();
        if dropped > 0 {
            log::debug!("Playback flushed, {} samples discarded", dropped);
        }
    }

    fn stats(&self) -> PlaybackStats {
        self.lock().stats()
    }
}

/// Parameters resolved for the output device
pub(super) struct OutputPlan {
    pub config: StreamConfig,
    pub sample_format: SampleFormat,
    pub target_rate: u32,
}

pub(super) fn plan_output(
    device: &Device,
    target_rate: u32,
    flush_bound_ms: u32,
) -> Result<OutputPlan, AudioError> {
    let native = device
        .supported_output_configs()
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
                .default_output_config()
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
        "Output config: {} Hz, {} channels, {:?}",
        supported.sample_rate().0,
        supported.channels(),
        supported.sample_format()
    );

    let sample_format = supported.sample_format();
    let mut config: StreamConfig = supported.into();
    let period = (config.sample_rate.0 as u64 * flush_bound_ms as u64 / 1000) as u32;
    if period > 0 {
        config.buffer_size = BufferSize::Fixed(period);
    }

    Ok(OutputPlan {
        config,
        sample_format,
        target_rate,
    })
}

pub(super) fn build_output_stream(
    device: &Device,
    plan: &OutputPlan,
    playback: SharedPlayback,
    failures: mpsc::UnboundedSender<AudioError>,
) -> Result<Stream, AudioError> {
    let attempt = |config: &StreamConfig| match plan.sample_format {
        SampleFormat::I16 => {
            build_output_typed::<i16>(device, config, plan, playback.clone(), failures.clone())
        }
        SampleFormat::U16 => {
            build_output_typed::<u16>(device, config, plan, playback.clone(), failures.clone())
        }
        SampleFormat::F32 => {
            build_output_typed::<f32>(device, config, plan, playback.clone(), failures.clone())
        }
        _ => Err(AudioError::NoSupportedConfig),
    };

    match attempt(&plan.config) {
        Ok(stream) => Ok(stream),
        Err(e) if plan.config.buffer_size != BufferSize::Default => {
            log::warn!("Fixed output period rejected ({}), using device default", e);
            let mut fallback = plan.config.clone();
            fallback.buffer_size = BufferSize::Default;
            attempt(&fallback)
        }
        Err(e) => Err(e),
    }
}

fn build_output_typed<T>(
    device: &Device,
    config: &StreamConfig,
    plan: &OutputPlan,
    playback: SharedPlayback,
    failures: mpsc::UnboundedSender<AudioError>,
) -> Result<Stream, AudioError>
where
    T: cpal::SizedSample + cpal::FromSample<i16> + Send + 'static,
{
    let channels = config.channels.max(1) as usize;
    let device_rate = config.sample_rate.0;
    let target_rate = plan.target_rate;
    let ratio = (device_rate / target_rate.max(1)).max(1) as usize;
    let period_frames = match config.buffer_size {
        BufferSize::Fixed(frames) => frames as usize,
        BufferSize::Default => device_rate as usize / 10,
    };
    let mut scratch: Vec<i16> = vec![0; period_frames / ratio + 1];

    let err_fn = move |err: cpal::StreamError| {
        log::error!("Audio output stream error: {}", err);
        let _ = failures.send(AudioError::StreamFailed(err.to_string()));
    };

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let needed = data.len() / channels / ratio;
                // Grows only if the device hands over a larger period than planned
                if scratch.len() < needed {
                    scratch.resize(needed, 0);
                }
                let mono = &mut scratch[..needed];
                playback.fill(mono);
                render_period(mono, ratio, channels, data);
            },
            err_fn,
            None,
        )
        .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))
}

/// Write mono samples into an interleaved device buffer, repeating each
/// sample `ratio` times. Frames past the end of `mono` get silence.
fn render_period<T>(mono: &[i16], ratio: usize, channels: usize, data: &mut [T])
where
    T: cpal::Sample + cpal::FromSample<i16>,
{
    for (i, frame) in data.chunks_mut(channels).enumerate() {
        let value = match mono.get(i / ratio) {
            Some(&sample) => T::from_sample(sample),
            None => T::EQUILIBRIUM,
        };
        frame.fill(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::Direction;

    fn frame(sequence: u64, samples: Vec<i16>) -> AudioFrame {
        AudioFrame::new(samples, Direction::Inbound, sequence)
    }

    #[test]
    fn test_silence_until_prebuffered() {
        // 1000 Hz, 4ms prebuffer = 4 samples
        let mut buffer = PlaybackBuffer::new(1000, 4);
        buffer.enqueue(frame(0, vec![1, 2])).unwrap();

        let mut out = [9i16; 2];
        assert_eq!(buffer.fill(&mut out), 0);
        assert_eq!(out, [0, 0]);

        buffer.enqueue(frame(1, vec![3, 4])).unwrap();
        assert!(buffer.is_primed());
        assert_eq!(buffer.fill(&mut out), 2);
        assert_eq!(out, [1, 2]);
    }

    #[test]
    fn test_mark_end_plays_short_tail() {
        let mut buffer = PlaybackBuffer::new(1000, 100);
        buffer.enqueue(frame(0, vec![5, 6])).unwrap();
        buffer.mark_end();

        let mut out = [0i16; 4];
        assert_eq!(buffer.fill(&mut out), 2);
        assert_eq!(out, [5, 6, 0, 0]);
        assert_eq!(buffer.stats().underruns, 0);
    }

    #[test]
    fn test_underrun_counted_and_reprimes() {
        let mut buffer = PlaybackBuffer::new(1000, 2);
        buffer.enqueue(frame(0, vec![1, 2])).unwrap();

        let mut out = [0i16; 3];
        assert_eq!(buffer.fill(&mut out), 2);
        assert_eq!(buffer.stats().underruns, 1);
        assert!(!buffer.is_primed());
    }

    #[test]
    fn test_flush_is_idempotent() {
        let mut buffer = PlaybackBuffer::new(1000, 0);
        buffer.enqueue(frame(0, vec![1, 2, 3])).unwrap();

        assert_eq!(buffer.flush(), 3);
        assert_eq!(buffer.flush(), 0);
        assert!(buffer.is_empty());

        let stats = buffer.stats();
        assert_eq!(stats.flushes, 2);
        assert_eq!(stats.samples_flushed, 3);

        let mut out = [7i16; 2];
        assert_eq!(buffer.fill(&mut out), 0);
        assert_eq!(out, [0, 0]);
    }

    #[test]
    fn test_sequence_regression_rejected() {
        let mut buffer = PlaybackBuffer::new(1000, 0);
        buffer.enqueue(frame(5, vec![1])).unwrap();

        let err = buffer.enqueue(frame(5, vec![2])).unwrap_err();
        assert_eq!(err, SequenceRegression { last: 5, got: 5 });
        assert!(buffer.enqueue(frame(3, vec![2])).is_err());
        assert!(buffer.enqueue(frame(6, vec![2])).is_ok());
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn test_lead_in_silence_before_each_reply() {
        // 1000 Hz, 2ms lead-in, no prebuffer
        let mut buffer = PlaybackBuffer::new(1000, 0).with_lead_in(2);
        buffer.enqueue(frame(0, vec![5, 6])).unwrap();
        buffer.enqueue(frame(1, vec![7])).unwrap();
        assert_eq!(buffer.len(), 5);

        let mut out = [9i16; 5];
        assert_eq!(buffer.fill(&mut out), 5);
        assert_eq!(out, [0, 0, 5, 6, 7]);

        // The next reply gets its own lead-in; a flush drops it with the audio
        buffer.mark_end();
        buffer.enqueue(frame(2, vec![8])).unwrap();
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.flush(), 3);
        buffer.enqueue(frame(3, vec![4])).unwrap();
        assert_eq!(buffer.len(), 3);
    }

    #[test]
    fn test_lead_in_does_not_count_toward_prebuffer() {
        let mut buffer = PlaybackBuffer::new(1000, 2).with_lead_in(3);
        buffer.enqueue(frame(0, vec![1])).unwrap();
        assert!(!buffer.is_primed());
        buffer.enqueue(frame(1, vec![2])).unwrap();
        assert!(buffer.is_primed());
    }

    #[test]
    fn test_render_period_repeats_and_pads() {
        // 2x rate, stereo, one frame short of a full period
        let mut data = [9i16; 10];
        render_period(&[1, 2], 2, 2, &mut data);
        assert_eq!(data, [1, 1, 1, 1, 2, 2, 2, 2, 0, 0]);
    }

    #[test]
    fn test_shared_playback_sink() {
        let playback = SharedPlayback::new(1000, 0);
        let sink: &dyn AudioSink = &playback;

        sink.enqueue(frame(0, vec![1, 2, 3])).unwrap();
        assert_eq!(playback.buffered(), 3);

        sink.flush();
        assert_eq!(playback.buffered(), 0);
        assert_eq!(sink.stats().frames_enqueued, 1);
        assert_eq!(sink.stats().flushes, 1);
    }
}
