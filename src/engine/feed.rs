use super::shared::Shared;
use crate::event::{Event, TrackRef};

/// Receives the events a [`PlaybackFeed`] produces for one window
pub trait EventSink {
    fn enqueue(&mut self, track: &TrackRef, event: Event, time: u64, gain: f32);
}

/// The session's track model as seen by the engine.
///
/// The output worker pulls one read-ahead window at a time while the queue
/// runs; `file_export` pulls the whole export range at once.
pub trait PlaybackFeed: Send {
    /// Emits every event with a time in `[start, end)`
    fn process(&mut self, sink: &mut dyn EventSink, start: u64, end: u64);
}

/// Forwards feed output onto the live output path
pub(crate) struct LiveSink<'a> {
    pub shared: &'a Shared,
}

impl EventSink for LiveSink<'_> {
    fn enqueue(&mut self, track: &TrackRef, event: Event, time: u64, gain: f32) {
        self.shared.enqueue(track, event, time, gain);
    }
}
