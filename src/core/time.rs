/// Beat-to-seconds conversion across a segment's tempo ramp.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TimeError {
    #[error("cannot compute time over zero total beats")]
    ZeroTotal,
    #[error("tempo must be positive, got {0} bpm")]
    BadTempo(f64),
}

/// Tempo interpolated linearly from `from_bpm` at beat 0 to `to_bpm` at
/// beat `total`, constant at `to_bpm` afterwards.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TempoRamp {
    total: f64,
    from_bpm: f64,
    to_bpm: f64,
}

impl TempoRamp {
    pub fn new(total_beats: f64, from_bpm: f64, to_bpm: f64) -> Result<Self, TimeError> {
        if !(total_beats > 0.0) {
            return Err(TimeError::ZeroTotal);
        }
        for bpm in [from_bpm, to_bpm] {
            if !(bpm.is_finite() && bpm > 0.0) {
                return Err(TimeError::BadTempo(bpm));
            }
        }
        Ok(Self {
            total: total_beats,
            from_bpm,
            to_bpm,
        })
    }

    pub fn tempo_at(&self, beat: f64) -> f64 {
        let t = (beat / self.total).clamp(0.0, 1.0);
        self.from_bpm + (self.to_bpm - self.from_bpm) * t
    }

    /// Seconds elapsed from beat 0 to `beat`.
    ///
    /// Integrates 60 / tempo(b) over the ramp, so a changing tempo bends
    /// time smoothly rather than stepping.
    pub fn seconds_at(&self, beat: f64) -> f64 {
        if beat <= 0.0 {
            return 0.0;
        }
        let within = beat.min(self.total);
        let slope = (self.to_bpm - self.from_bpm) / self.total;
        let ramp = if slope.abs() < 1e-12 {
            60.0 * within / self.from_bpm
        } else {
            60.0 / slope * (self.tempo_at(within) / self.from_bpm).ln()
        };
        let beyond = (beat - self.total).max(0.0);
        ramp + 60.0 * beyond / self.to_bpm
    }
}
