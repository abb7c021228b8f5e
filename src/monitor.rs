//! Lock-free activity meters for bus traffic

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Which side of a bus a monitor watches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorDirection {
    Input,
    Output,
}

/// Peak-hold activity level that decays each time it is read.
///
/// Updated from the real-time paths, read from the UI side; the level is
/// stored as `f32` bits so neither side ever blocks.
#[derive(Debug)]
pub struct Monitor {
    direction: MonitorDirection,
    level: AtomicU32,
    decay: f32,
    count: AtomicU64,
}

/// Default multiplier applied to the level on every read
pub const DEFAULT_DECAY: f32 = 0.8;

impl Monitor {
    pub fn new(direction: MonitorDirection) -> Self {
        Self::with_decay(direction, DEFAULT_DECAY)
    }

    pub fn with_decay(direction: MonitorDirection, decay: f32) -> Self {
        Self {
            direction,
            level: AtomicU32::new(0.0f32.to_bits()),
            decay: decay.clamp(0.0, 1.0),
            count: AtomicU64::new(0),
        }
    }

    pub fn direction(&self) -> MonitorDirection {
        self.direction
    }

    /// Registers an event of 7-bit `value` scaled by `gain`
    pub fn update(&self, value: u8, gain: f32) {
        let level = (value as f32 / 127.0 * gain).clamp(0.0, 1.0);
        self.count.fetch_add(1, Ordering::Relaxed);
        let _ = self
            .level
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                (level > f32::from_bits(bits)).then_some(level.to_bits())
            });
    }

    /// Current level; decays the held peak for the next read
    pub fn value(&self) -> f32 {
        let bits = self
            .level
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                Some((f32::from_bits(bits) * self.decay).to_bits())
            })
            .unwrap_or(0);
        f32::from_bits(bits)
    }

    /// Level without decaying it
    pub fn peek(&self) -> f32 {
        f32::from_bits(self.level.load(Ordering::Acquire))
    }

    /// Number of events seen since the last reset
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.level.store(0.0f32.to_bits(), Ordering::Release);
        self.count.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_holds_peak() {
        let monitor = Monitor::new(MonitorDirection::Output);
        monitor.update(127, 1.0);
        monitor.update(10, 1.0);
        assert_eq!(monitor.peek(), 1.0);
        assert_eq!(monitor.count(), 2);
    }

    #[test]
    fn test_value_decays() {
        let monitor = Monitor::with_decay(MonitorDirection::Input, 0.5);
        monitor.update(127, 1.0);
        assert_eq!(monitor.value(), 1.0);
        assert_eq!(monitor.value(), 0.5);
        assert_eq!(monitor.value(), 0.25);
    }

    #[test]
    fn test_reset_clears_level() {
        let monitor = Monitor::new(MonitorDirection::Input);
        monitor.update(64, 2.0);
        monitor.reset();
        assert_eq!(monitor.peek(), 0.0);
        assert_eq!(monitor.count(), 0);
    }
}
