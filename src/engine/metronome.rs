//! Metronome click generation

use super::shared::Shared;
use crate::bus::{BusId, BusMode};
use crate::config::{ClickSettings, MetronomeSettings};
use crate::error::Result;
use crate::event::Event;
use log::trace;
use std::sync::atomic::Ordering;
use std::sync::TryLockError;

/// Name of the dedicated metronome bus
pub const METRO_BUS_NAME: &str = "Metronome";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MetroConfig {
    pub enabled: bool,
    pub use_bus: bool,
    pub muted: bool,
    pub channel: u8,
    pub bar: ClickSettings,
    pub beat: ClickSettings,
}

impl From<&MetronomeSettings> for MetroConfig {
    fn from(settings: &MetronomeSettings) -> Self {
        Self {
            enabled: settings.enabled,
            use_bus: settings.use_bus,
            muted: false,
            channel: settings.channel & 0x0F,
            bar: settings.bar,
            beat: settings.beat,
        }
    }
}

/// Number of clicks emitted by one `process_metro` call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetroClicks {
    pub bars: usize,
    pub beats: usize,
}

impl MetroClicks {
    pub fn total(&self) -> usize {
        self.bars + self.beats
    }
}

impl Shared {
    fn metro_target(&self, use_bus: bool) -> Option<BusId> {
        let buses = match self.buses.try_read() {
            Ok(buses) => buses,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return None,
        };
        use_bus
            .then_some(buses.metro)
            .flatten()
            .or_else(|| buses.default_output())
    }

    /// Schedules one click per beat boundary in `[start, end)`. A boundary
    /// that starts a bar gets the bar click only. Boundaries already
    /// scheduled since the last start or reposition are skipped, whichever
    /// thread scheduled them.
    pub fn process_metro(&self, start: u64, end: u64) -> MetroClicks {
        let mut clicks = MetroClicks::default();
        let metro = self.metro.load();
        if !metro.enabled || metro.muted || end <= start {
            return clicks;
        }
        let Some(bus) = self.metro_target(metro.use_bus) else {
            return clicks;
        };

        let scale = self.timing.load().scale;
        let mut beat = scale.beat_at_or_after(start);
        loop {
            let frame = scale.frame_from_beat(beat);
            if frame >= end {
                break;
            }
            let current = beat;
            beat += 1;
            if self.metro_frontier.fetch_max(frame + 1, Ordering::AcqRel) > frame {
                continue;
            }
            let click = if scale.beat_is_bar(current) {
                clicks.bars += 1;
                metro.bar
            } else {
                clicks.beats += 1;
                metro.beat
            };
            let off = frame.saturating_add(scale.frame_from_tick(click.duration));
            self.schedule(bus, Event::note_on(metro.channel, click.note, click.velocity, frame));
            self.schedule(bus, Event::note_off(metro.channel, click.note, off));
        }

        if clicks.total() > 0 {
            trace!("Metronome [{}, {}): {:?}", start, end, clicks);
        }
        clicks
    }
}

impl super::Engine {
    pub fn set_metronome(&mut self, enabled: bool) {
        self.update_metro(|metro| metro.enabled = enabled);
        self.settings.metronome.enabled = enabled;
    }

    pub fn is_metronome(&self) -> bool {
        self.shared.metro.load().enabled
    }

    /// Silences the clicks without forgetting the metronome setup
    pub fn set_metro_mute(&self, muted: bool) {
        self.update_metro(|metro| metro.muted = muted);
    }

    pub fn is_metro_mute(&self) -> bool {
        self.shared.metro.load().muted
    }

    /// Routes clicks through a dedicated "Metronome" bus instead of the
    /// default output bus. The bus exists only while this is on.
    pub fn set_metro_bus(&mut self, use_bus: bool) -> Result<()> {
        let existing = self.shared.buses().metro;
        match (use_bus, existing) {
            (true, None) => {
                let id = self.add_bus(METRO_BUS_NAME, BusMode::Output, false)?;
                self.shared.buses_mut().metro = Some(id);
            }
            (false, Some(id)) => self.remove_bus(id)?,
            _ => {}
        }
        self.update_metro(|metro| metro.use_bus = use_bus);
        self.settings.metronome.use_bus = use_bus;
        Ok(())
    }

    pub fn is_metro_bus(&self) -> bool {
        self.shared.metro.load().use_bus
    }

    pub fn metro_bus(&self) -> Option<BusId> {
        self.shared.buses().metro
    }

    /// Closes and reopens the metronome bus, reconnecting its endpoints
    pub fn reset_metro_bus(&mut self) -> Result<()> {
        match self.metro_bus() {
            Some(id) => self.reopen_bus(id, BusMode::Output),
            None => Ok(()),
        }
    }

    pub fn set_metro_channel(&mut self, channel: u8) {
        let channel = channel & 0x0F;
        self.update_metro(|metro| metro.channel = channel);
        self.settings.metronome.channel = channel;
    }

    pub fn metro_channel(&self) -> u8 {
        self.shared.metro.load().channel
    }

    pub fn set_metro_bar(&mut self, note: u8, velocity: u8, duration: u64) {
        let click = ClickSettings {
            note: note & 0x7F,
            velocity: velocity & 0x7F,
            duration,
        };
        self.update_metro(|metro| metro.bar = click);
        self.settings.metronome.bar = click;
    }

    pub fn metro_bar(&self) -> ClickSettings {
        self.shared.metro.load().bar
    }

    pub fn set_metro_beat(&mut self, note: u8, velocity: u8, duration: u64) {
        let click = ClickSettings {
            note: note & 0x7F,
            velocity: velocity & 0x7F,
            duration,
        };
        self.update_metro(|metro| metro.beat = click);
        self.settings.metronome.beat = click;
    }

    pub fn metro_beat(&self) -> ClickSettings {
        self.shared.metro.load().beat
    }

    pub fn process_metro(&self, start: u64, end: u64) -> MetroClicks {
        self.shared.process_metro(start, end)
    }

    fn update_metro(&self, f: impl FnOnce(&mut MetroConfig)) {
        let mut metro = self.shared.metro.load();
        f(&mut metro);
        self.shared.metro.store(metro);
    }
}
