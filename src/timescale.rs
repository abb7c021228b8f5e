//! Frame/tick/beat conversions

use crate::error::{MidiError, Result};

/// Tempo map for a single tempo and meter
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeScale {
    pub sample_rate: u32,
    /// Beats per minute
    pub tempo: f32,
    pub beats_per_bar: u16,
    pub ticks_per_beat: u16,
}

impl Default for TimeScale {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            tempo: 120.0,
            beats_per_bar: 4,
            ticks_per_beat: 960,
        }
    }
}

impl TimeScale {
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(MidiError::ConfigurationError(
                "sample rate must be positive".to_string(),
            ));
        }
        if !(self.tempo.is_finite() && self.tempo > 0.0) {
            return Err(MidiError::ConfigurationError(format!(
                "invalid tempo {}",
                self.tempo
            )));
        }
        if self.beats_per_bar == 0 || self.ticks_per_beat == 0 {
            return Err(MidiError::ConfigurationError(
                "meter and resolution must be positive".to_string(),
            ));
        }
        Ok(())
    }

    fn frames_per_beat(&self) -> f64 {
        60.0 * self.sample_rate as f64 / self.tempo as f64
    }

    pub fn tick_from_frame(&self, frame: u64) -> u64 {
        (frame as f64 * self.ticks_per_beat as f64 / self.frames_per_beat()).round() as u64
    }

    pub fn frame_from_tick(&self, tick: u64) -> u64 {
        (tick as f64 * self.frames_per_beat() / self.ticks_per_beat as f64).round() as u64
    }

    pub fn frame_from_beat(&self, beat: u64) -> u64 {
        (beat as f64 * self.frames_per_beat()).round() as u64
    }

    /// First beat whose boundary lies at or after `frame`
    pub fn beat_at_or_after(&self, frame: u64) -> u64 {
        let mut beat = (frame as f64 / self.frames_per_beat()).ceil() as u64;
        while beat > 0 && self.frame_from_beat(beat - 1) >= frame {
            beat -= 1;
        }
        while self.frame_from_beat(beat) < frame {
            beat += 1;
        }
        beat
    }

    pub fn beat_is_bar(&self, beat: u64) -> bool {
        beat % self.beats_per_bar as u64 == 0
    }
}

/// Conversion from song frames to device queue ticks, anchored at the
/// point where the queue position and the song position were last aligned.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Timing {
    pub scale: TimeScale,
    pub anchor_frame: u64,
    pub anchor_tick: u64,
}

impl Timing {
    pub fn new(scale: TimeScale) -> Self {
        Self {
            scale,
            anchor_frame: 0,
            anchor_tick: 0,
        }
    }

    pub fn anchored(scale: TimeScale, anchor_frame: u64, anchor_tick: u64) -> Self {
        Self {
            scale,
            anchor_frame,
            anchor_tick,
        }
    }

    /// Queue tick at which an event at song `frame` is due
    pub fn device_tick(&self, frame: u64) -> u64 {
        if frame >= self.anchor_frame {
            self.anchor_tick
                .saturating_add(self.scale.tick_from_frame(frame - self.anchor_frame))
        } else {
            self.anchor_tick
                .saturating_sub(self.scale.tick_from_frame(self.anchor_frame - frame))
        }
    }

    /// Song frame corresponding to queue `tick`
    pub fn song_frame(&self, tick: u64) -> u64 {
        if tick >= self.anchor_tick {
            self.anchor_frame
                .saturating_add(self.scale.frame_from_tick(tick - self.anchor_tick))
        } else {
            self.anchor_frame
                .saturating_sub(self.scale.frame_from_tick(self.anchor_tick - tick))
        }
    }
}
