pub mod bus;
pub mod cli;
pub mod config;
pub mod document;
pub mod engine;
pub mod error;
pub mod event;
pub mod export;
pub mod logging;
pub mod mmc;
pub mod monitor;
pub mod notify;
pub mod patch;
pub mod timescale;
pub mod transport;
pub mod ui;

pub use bus::{Bus, BusId, BusMode, ConnectItem, ConnectList};
pub use config::EngineSettings;
pub use document::Element;
pub use engine::{Engine, EngineHandle, EngineState, EventSink, MetroClicks, PlaybackFeed};
pub use error::{MidiError, Result};
pub use event::{Event, EventKind, TrackId, TrackRef};
pub use notify::{Notification, NotifyTag};
pub use timescale::{TimeScale, Timing};
pub use transport::{LoopbackTransport, MidirTransport, SequencerTransport};
