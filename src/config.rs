// config.rs

use crate::error::{MidiError, Result};
use crate::timescale::TimeScale;
use log::{debug, info, LevelFilter};
use serde::Deserialize;
use std::path::Path;

pub const DEFAULT_CLIENT_NAME: &str = "seqengine";
pub const DEFAULT_SAMPLE_RATE: u32 = 48_000;
pub const DEFAULT_TICKS_PER_BEAT: u16 = 960;
pub const DEFAULT_READ_AHEAD: u64 = 4096;
pub const DEFAULT_QUEUE_CAPACITY: usize = 4096;
pub const ENV_PREFIX: &str = "SEQENGINE";

/// Click settings for one boundary type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ClickSettings {
    pub note: u8,
    pub velocity: u8,
    /// Length in ticks
    pub duration: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct MetronomeSettings {
    pub enabled: bool,
    pub use_bus: bool,
    pub channel: u8,
    pub bar: ClickSettings,
    pub beat: ClickSettings,
}

impl Default for MetronomeSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            use_bus: false,
            channel: 9,
            bar: ClickSettings {
                note: 76,
                velocity: 96,
                duration: 48,
            },
            beat: ClickSettings {
                note: 77,
                velocity: 64,
                duration: 24,
            },
        }
    }
}

/// Engine settings. Every field has a default; a settings file and
/// `SEQENGINE_*` environment variables override them.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub client_name: String,
    pub sample_rate: u32,
    pub tempo: f32,
    pub beats_per_bar: u16,
    pub ticks_per_beat: u16,
    pub read_ahead: u64,
    pub queue_capacity: usize,
    pub control_bus: bool,
    pub metronome: MetronomeSettings,
    pub log_level: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            client_name: DEFAULT_CLIENT_NAME.to_string(),
            sample_rate: DEFAULT_SAMPLE_RATE,
            tempo: 120.0,
            beats_per_bar: 4,
            ticks_per_beat: DEFAULT_TICKS_PER_BEAT,
            read_ahead: DEFAULT_READ_AHEAD,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            control_bus: false,
            metronome: MetronomeSettings::default(),
            log_level: "info".to_string(),
        }
    }
}

impl EngineSettings {
    /// Loads settings from an optional file plus the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            info!("Loading engine settings from {}", path.display());
            builder = builder.add_source(::config::File::from(path).required(true));
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let settings: EngineSettings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        debug!("Engine settings: {:?}", settings);
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        self.time_scale().validate()?;
        if self.read_ahead == 0 {
            return Err(MidiError::ConfigurationError(
                "read-ahead must be positive".to_string(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(MidiError::ConfigurationError(
                "queue capacity must be positive".to_string(),
            ));
        }
        if self.metronome.channel > 15 {
            return Err(MidiError::ConfigurationError(format!(
                "metronome channel {} out of range",
                self.metronome.channel
            )));
        }
        self.log_level_filter()?;
        Ok(())
    }

    pub fn time_scale(&self) -> TimeScale {
        TimeScale {
            sample_rate: self.sample_rate,
            tempo: self.tempo,
            beats_per_bar: self.beats_per_bar,
            ticks_per_beat: self.ticks_per_beat,
        }
    }

    pub fn log_level_filter(&self) -> Result<LevelFilter> {
        self.log_level.parse::<LevelFilter>().map_err(|_| {
            MidiError::ConfigurationError(format!("unknown log level '{}'", self.log_level))
        })
    }
}
