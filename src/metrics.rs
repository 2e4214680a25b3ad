//! Per-session counters
//!
//! The controller bumps the turn-level counters as it reduces events; the
//! audio and connection counters are collected from their owners when the
//! session ends.

use serde::{Deserialize, Serialize};

use crate::audio::PlaybackStats;

/// Counters reported with every `SessionResult`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    /// Microphone frames produced by the capture pipeline
    pub frames_captured: u64,
    /// Frames evicted from the capture queue under backpressure
    pub frames_dropped: u64,
    /// Frames written to the speech service
    pub frames_sent: u64,
    /// Assistant audio frames handed to playback
    pub frames_played: u64,
    pub playback_flushes: u64,
    pub playback_underruns: u64,
    pub barge_ins: u64,
    pub fillers_suppressed: u64,
    pub reconnects: u64,
    pub protocol_faults: u64,
    pub responses_requested: u64,
    pub responses_cancelled: u64,
}

impl SessionStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold capture queue counters into the stats
    pub fn record_capture(&mut self, captured: u64, dropped: u64) {
        self.frames_captured = captured;
        self.frames_dropped = dropped;
    }

    pub fn record_playback(&mut self, playback: &PlaybackStats) {
        self.playback_flushes = playback.flushes;
        self.playback_underruns = playback.underruns;
    }

    pub fn record_sent(&mut self, frames_sent: u64) {
        self.frames_sent = frames_sent;
    }

    /// Fraction of captured frames lost to backpressure
    pub fn drop_ratio(&self) -> f64 {
        if self.frames_captured == 0 {
            return 0.0;
        }
        self.frames_dropped as f64 / self.frames_captured as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_stats_are_zero() {
        let stats = SessionStats::new();
        assert_eq!(stats, SessionStats::default());
        assert_eq!(stats.drop_ratio(), 0.0);
    }

    #[test]
    fn test_record_external_counters() {
        let mut stats = SessionStats::new();
        stats.record_capture(200, 50);
        stats.record_sent(150);
        stats.record_playback(&PlaybackStats {
            frames_enqueued: 10,
            samples_played: 24000,
            underruns: 2,
            flushes: 3,
            samples_flushed: 4800,
        });

        assert_eq!(stats.frames_captured, 200);
        assert_eq!(stats.frames_sent, 150);
        assert_eq!(stats.playback_flushes, 3);
        assert_eq!(stats.playback_underruns, 2);
        assert!((stats.drop_ratio() - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_stats_serialize_as_flat_object() {
        let stats = SessionStats {
            barge_ins: 1,
            ..Default::default()
        };
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["barge_ins"], 1);
        assert_eq!(json["frames_sent"], 0);
    }
}
