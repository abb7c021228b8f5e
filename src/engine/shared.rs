//! State shared between the session clock and both workers

use super::feed::PlaybackFeed;
use super::metronome::MetroConfig;
use super::worker::OutputCommand;
use crate::bus::{BusId, BusTable, Scheduled};
use crate::event::{Event, EventKind, TrackId, TrackRef};
use crate::mmc::{MmcCommand, MMC_FPS};
use crate::notify::{Notifier, NotifyTag};
use crate::timescale::Timing;
use crate::transport::{RawEvent, SequencerTransport};
use crossbeam::atomic::AtomicCell;
use crossbeam::channel::{bounded, unbounded, Receiver, Sender};
use crossbeam::sync::{ShardedLock, ShardedLockReadGuard, ShardedLockWriteGuard};
use log::{debug, info, trace};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, TryLockError};

/// Record-armed track and where its captured events go
pub(crate) struct RecordArm {
    pub track: TrackRef,
    pub omni: bool,
    pub sink: Sender<Event>,
}

pub(crate) struct Shared {
    pub transport: Arc<dyn SequencerTransport>,
    pub buses: ShardedLock<BusTable>,
    pub timing: AtomicCell<Timing>,
    pub read_ahead: AtomicU64,
    pub epoch: AtomicU64,
    seq: AtomicU64,
    pub dropped: AtomicU64,
    pub decode_errors: AtomicU64,
    pub resyncs: AtomicU64,
    pub muted: ShardedLock<HashSet<TrackId>>,
    pub record: ShardedLock<Vec<RecordArm>>,
    pub metro: AtomicCell<MetroConfig>,
    pub notifier: Notifier,
    pub commands_tx: Sender<OutputCommand>,
    pub commands_rx: Receiver<OutputCommand>,
    pub wake_tx: Sender<()>,
    pub wake_rx: Receiver<()>,
    pub feed: Mutex<Option<Box<dyn PlaybackFeed>>>,
    pub feed_frame: AtomicU64,
    /// Frame past the last metronome boundary already scheduled
    pub metro_frontier: AtomicU64,
}

impl Shared {
    pub fn new(
        transport: Arc<dyn SequencerTransport>,
        timing: Timing,
        read_ahead: u64,
        metro: MetroConfig,
    ) -> Self {
        let (commands_tx, commands_rx) = unbounded();
        let (wake_tx, wake_rx) = bounded(1);
        Self {
            transport,
            buses: ShardedLock::new(BusTable::default()),
            timing: AtomicCell::new(timing),
            read_ahead: AtomicU64::new(read_ahead),
            epoch: AtomicU64::new(0),
            seq: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            resyncs: AtomicU64::new(0),
            muted: ShardedLock::new(HashSet::new()),
            record: ShardedLock::new(Vec::new()),
            metro: AtomicCell::new(metro),
            notifier: Notifier::new(),
            commands_tx,
            commands_rx,
            wake_tx,
            wake_rx,
            feed: Mutex::new(None),
            feed_frame: AtomicU64::new(0),
            metro_frontier: AtomicU64::new(0),
        }
    }

    pub fn buses(&self) -> ShardedLockReadGuard<'_, BusTable> {
        self.buses.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn buses_mut(&self) -> ShardedLockWriteGuard<'_, BusTable> {
        self.buses.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_muted(&self, track: TrackId) -> bool {
        match self.muted.try_read() {
            Ok(muted) => muted.contains(&track),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().contains(&track),
            // A mute toggle is in progress; its sweep will follow.
            Err(TryLockError::WouldBlock) => false,
        }
    }

    /// Song frame the queue is currently playing
    pub fn play_frame(&self) -> u64 {
        self.timing.load().song_frame(self.transport.queue_tick())
    }

    /// Schedules a track event. Never blocks; returns false when the event
    /// was suppressed by mute or dropped.
    pub fn enqueue(&self, track: &TrackRef, mut event: Event, time: u64, gain: f32) -> bool {
        if self.is_muted(track.id) && !event.kind.is_note_off() {
            return false;
        }
        event.channel = track.channel & 0x0F;
        event.track = Some(track.id);
        event.time = time;
        event.gain = gain;
        event.kind.apply_gain(gain);
        self.schedule(track.bus, event)
    }

    /// Pushes `event` onto `bus`'s output path at the tick matching
    /// `event.time`. Saturation or a structural change in progress drops it.
    pub fn schedule(&self, bus: BusId, event: Event) -> bool {
        let tick = self.timing.load().device_tick(event.time);

        let buses = match self.buses.try_read() {
            Ok(buses) => buses,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        };
        let Some(target) = buses.get(bus).filter(|b| b.mode().is_output()) else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        };

        if let (Some(monitor), Some(level)) = (target.monitor_out(), event.kind.level()) {
            monitor.update(level, 1.0);
        }

        let item = Scheduled {
            tick,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            epoch: self.epoch.load(Ordering::Acquire),
            event,
        };
        if target.output_queue().push(item).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        drop(buses);

        let _ = self.wake_tx.try_send(());
        true
    }

    /// Normalizes one inbound message and routes it
    pub fn capture(&self, raw: RawEvent) {
        let frame = self.timing.load().song_frame(raw.tick);
        let event = match Event::decode(&raw.data, frame) {
            Ok(event) => event,
            Err(e) => {
                self.decode_errors.fetch_add(1, Ordering::Relaxed);
                debug!("Discarding inbound event on {:?}: {}", raw.port, e);
                return;
            }
        };

        let buses = self.buses();
        let Some(bus_id) = buses.find_by_port(raw.port) else {
            trace!("Inbound event on unknown port {:?}", raw.port);
            return;
        };

        // Without a dedicated control input, MMC arrives on the default input.
        if let EventKind::Sysex(data) = &event.kind {
            if buses.control_in.or_else(|| buses.default_input()) == Some(bus_id) {
                match MmcCommand::from_sysex(data) {
                    Ok(Some(mmc)) => {
                        drop(buses);
                        self.dispatch_mmc(mmc);
                        return;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        self.decode_errors.fetch_add(1, Ordering::Relaxed);
                        debug!("Discarding MMC message: {}", e);
                        return;
                    }
                }
            }
        }

        if let Some(bus) = buses.get(bus_id) {
            if let (Some(monitor), Some(level)) = (bus.monitor_in(), event.kind.level()) {
                monitor.update(level, 1.0);
            }
            if bus.is_passthru() && bus.mode().is_output() {
                if let Some(port) = bus.port() {
                    if let Err(e) = self.transport.send(port, &raw.data) {
                        debug!("Passthru on bus '{}' failed: {}", bus.name(), e);
                    }
                }
            }
        }
        drop(buses);

        let arms = self.record.read().unwrap_or_else(PoisonError::into_inner);
        for arm in arms
            .iter()
            .filter(|arm| arm.track.bus == bus_id)
            .filter(|arm| arm.omni || arm.track.channel == event.channel)
        {
            let mut recorded = event.clone();
            recorded.track = Some(arm.track.id);
            if arm.sink.try_send(recorded).is_err() {
                debug!("Record sink for {:?} unavailable", arm.track.id);
            }
        }
    }

    fn dispatch_mmc(&self, mmc: MmcCommand) {
        info!("MMC {:?} received", mmc.command);
        if let Some(position) = mmc.locate_position() {
            let sample_rate = self.timing.load().scale.sample_rate as u64;
            self.reposition(position as u64 * sample_rate / MMC_FPS as u64, None);
        }
        self.notifier.post(NotifyTag::Mmc(mmc));
    }

    /// Re-anchors song `frame` at the current queue tick, invalidates every
    /// undelivered event and asks the output worker for a note-off sweep.
    pub fn reposition(&self, frame: u64, ack: Option<Sender<()>>) {
        let tick = self.transport.queue_tick();
        let scale = self.timing.load().scale;
        self.timing.store(Timing::anchored(scale, frame, tick));
        self.epoch.fetch_add(1, Ordering::AcqRel);
        self.feed_frame.store(frame, Ordering::Release);
        self.metro_frontier.store(frame, Ordering::Release);
        let _ = self.commands_tx.send(OutputCommand::Discard(ack));
        debug!("Repositioned to frame {} at tick {}", frame, tick);
        self.notifier.post(NotifyTag::Relocated { frame });
    }

    /// Compares the queue position against the audio clock's `audio_frame`
    /// and re-anchors when they drifted apart by more than a quarter of the
    /// read-ahead window. Returns the measured drift in frames.
    pub fn sync(&self, audio_frame: u64) -> i64 {
        let tick = self.transport.queue_tick();
        let timing = self.timing.load();
        let drift = timing.song_frame(tick) as i64 - audio_frame as i64;
        let threshold = (self.read_ahead.load(Ordering::Relaxed) / 4).max(1) as i64;
        if drift.abs() > threshold {
            self.timing
                .store(Timing::anchored(timing.scale, audio_frame, tick));
            self.resyncs.fetch_add(1, Ordering::Relaxed);
            debug!("Queue drift of {} frames corrected", drift);
            self.notifier
                .post(NotifyTag::DriftCorrected { frames: drift });
        }
        drift
    }
}
