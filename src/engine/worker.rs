//! Output and input worker threads

use super::feed::LiveSink;
use super::shared::Shared;
use crate::bus::{BusId, BusTable, Scheduled};
use crate::error::{MidiError, Result};
use crate::event::{EventKind, TrackId};
use crossbeam::channel::{bounded, select, Sender};
use log::{debug, error, info, trace, warn};
use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::Ordering;
use std::sync::{Arc, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// How long a worker may take to report ready after being spawned
pub(crate) const ACTIVATION_TIMEOUT: Duration = Duration::from_secs(2);

/// Longest the output worker sleeps without re-checking the queue
const MAX_SLEEP: Duration = Duration::from_millis(5);

pub(crate) enum OutputCommand {
    /// Deliver what is due, then acknowledge
    Flush(Sender<()>),
    /// Drop everything from earlier epochs and silence sounding notes
    Discard(Option<Sender<()>>),
    /// Silence the notes a freshly muted track left sounding
    MuteSweep(TrackId),
    Stop,
}

struct Pending {
    bus: BusId,
    item: Scheduled,
}

impl Pending {
    fn key(&self) -> (u64, u64) {
        (self.item.tick, self.item.seq)
    }
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.key().cmp(&other.key())
    }
}

type SoundingKey = (BusId, u8, u8);

struct OutputLoop {
    shared: Arc<Shared>,
    pending: BinaryHeap<Reverse<Pending>>,
    sounding: HashMap<SoundingKey, Option<TrackId>>,
}

impl OutputLoop {
    fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            pending: BinaryHeap::new(),
            sounding: HashMap::new(),
        }
    }

    fn run(mut self) {
        info!("MIDI output worker started");
        let commands = self.shared.commands_rx.clone();
        let wake = self.shared.wake_rx.clone();

        'outer: loop {
            let timeout = self.next_timeout();
            select! {
                recv(commands) -> command => match command {
                    Ok(command) => {
                        if self.handle(command) {
                            break 'outer;
                        }
                    }
                    Err(_) => break 'outer,
                },
                recv(wake) -> _ => {}
                default(timeout) => {}
            }
            while let Ok(command) = commands.try_recv() {
                if self.handle(command) {
                    break 'outer;
                }
            }
            self.process();
        }

        self.collect();
        self.deliver_due();
        info!("MIDI output worker stopped");
    }

    /// Returns true when the worker should exit
    fn handle(&mut self, command: OutputCommand) -> bool {
        match command {
            OutputCommand::Flush(ack) => {
                self.collect();
                self.deliver_due();
                let _ = ack.send(());
            }
            OutputCommand::Discard(ack) => {
                self.collect();
                let epoch = self.shared.epoch.load(Ordering::Acquire);
                self.pending.retain(|Reverse(p)| p.item.epoch >= epoch);
                self.sweep(None);
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
            }
            OutputCommand::MuteSweep(track) => {
                // Events queued before the mute still go out, each note-on
                // with its own note-off.
                self.sweep(Some(track));
            }
            OutputCommand::Stop => return true,
        }
        false
    }

    fn process(&mut self) {
        self.collect();
        self.feed();
        self.collect();
        self.deliver_due();
    }

    fn next_timeout(&self) -> Duration {
        let transport = &self.shared.transport;
        match self.pending.peek() {
            Some(Reverse(next)) if transport.queue_running() => {
                let now = transport.queue_tick();
                if next.item.tick <= now {
                    return Duration::ZERO;
                }
                let scale = self.shared.timing.load().scale;
                let ticks = (next.item.tick - now) as f64;
                let secs = ticks * 60.0 / (scale.tempo as f64 * scale.ticks_per_beat as f64);
                Duration::from_secs_f64(secs).min(MAX_SLEEP)
            }
            _ => MAX_SLEEP,
        }
    }

    /// Moves everything waiting on the bus queues into the pending heap,
    /// dropping events from an earlier epoch.
    fn collect(&mut self) {
        let epoch = self.shared.epoch.load(Ordering::Acquire);
        let buses = self.shared.buses();
        let mut stale = 0usize;
        for (id, bus) in buses.iter() {
            while let Some(item) = bus.output_queue().pop() {
                if item.epoch < epoch {
                    stale += 1;
                    continue;
                }
                self.pending.push(Reverse(Pending { bus: id, item }));
            }
        }
        if stale > 0 {
            trace!("Discarded {} stale events", stale);
        }
    }

    /// Pulls the playback feed and the metronome up to one read-ahead
    /// window past the play position.
    fn feed(&mut self) {
        let shared = &*self.shared;
        if !shared.transport.queue_running() {
            return;
        }
        let start = shared.feed_frame.load(Ordering::Acquire);
        let end = shared.play_frame() + shared.read_ahead.load(Ordering::Relaxed);
        if start >= end {
            return;
        }

        {
            let mut feed = shared.feed.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(feed) = feed.as_mut() {
                feed.process(&mut LiveSink { shared }, start, end);
            }
        }
        shared.process_metro(start, end);

        // A reposition in between owns the window now.
        let _ = shared.feed_frame.compare_exchange(
            start,
            end,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    fn deliver_due(&mut self) {
        let transport = &self.shared.transport;
        if self.pending.is_empty() || !transport.queue_running() {
            return;
        }
        let now = transport.queue_tick();
        let epoch = self.shared.epoch.load(Ordering::Acquire);
        let shared = Arc::clone(&self.shared);
        let buses = shared.buses();

        while self
            .pending
            .peek()
            .map_or(false, |Reverse(next)| next.item.tick <= now)
        {
            let Some(Reverse(next)) = self.pending.pop() else {
                break;
            };
            if next.item.epoch < epoch {
                continue;
            }
            self.deliver(&buses, next);
        }
    }

    fn deliver(&mut self, buses: &BusTable, pending: Pending) {
        let Some(port) = buses.get(pending.bus).and_then(|bus| bus.port()) else {
            return;
        };
        let event = &pending.item.event;
        if let Err(e) = self.shared.transport.send(port, &event.to_bytes()) {
            warn!("Delivery on {:?} failed: {}", pending.bus, e);
            return;
        }

        let channel = event.channel & 0x0F;
        match event.kind {
            EventKind::NoteOn { note, velocity } if velocity > 0 => {
                self.sounding.insert((pending.bus, channel, note), event.track);
            }
            EventKind::NoteOn { note, .. } | EventKind::NoteOff { note, .. } => {
                self.sounding.remove(&(pending.bus, channel, note));
            }
            EventKind::Controller { param: 0x78 | 0x7B, .. } => {
                self.sounding
                    .retain(|(bus, ch, _), _| *bus != pending.bus || *ch != channel);
            }
            _ => {}
        }
    }

    /// Sends a note-off for every sounding note, or only for `track`'s
    fn sweep(&mut self, track: Option<TrackId>) {
        if self.sounding.is_empty() {
            return;
        }
        let silenced: Vec<SoundingKey> = self
            .sounding
            .iter()
            .filter(|(_, owner)| track.is_none() || **owner == track)
            .map(|(key, _)| *key)
            .collect();
        if silenced.is_empty() {
            return;
        }

        let shared = Arc::clone(&self.shared);
        let buses = shared.buses();
        for key in &silenced {
            let (bus, channel, note) = *key;
            self.sounding.remove(key);
            let Some(port) = buses.get(bus).and_then(|b| b.port()) else {
                continue;
            };
            if let Err(e) = shared.transport.send(port, &[0x80 | channel, note, 0]) {
                warn!("Note-off sweep on {:?} failed: {}", bus, e);
            }
        }
        debug!("Swept {} sounding notes", silenced.len());
    }
}

/// Thread that turns queued events into transport sends at their due tick
pub(crate) struct OutputWorker {
    thread_handle: Option<JoinHandle<()>>,
}

impl OutputWorker {
    pub fn spawn(shared: Arc<Shared>) -> Result<Self> {
        // Commands left over from an earlier activation no longer apply.
        while shared.commands_rx.try_recv().is_ok() {}

        let (ready_tx, ready_rx) = bounded(1);
        let output_loop = OutputLoop::new(Arc::clone(&shared));
        let thread_handle = thread::Builder::new()
            .name("midi-output".to_string())
            .spawn(move || {
                let _ = ready_tx.send(());
                output_loop.run();
            })
            .map_err(|e| MidiError::ConnectionError(format!("cannot spawn output worker: {}", e)))?;

        ready_rx.recv_timeout(ACTIVATION_TIMEOUT).map_err(|_| {
            MidiError::ConnectionError("output worker did not report ready".to_string())
        })?;
        Ok(Self {
            thread_handle: Some(thread_handle),
        })
    }

    pub fn stop(mut self, shared: &Shared) {
        let _ = shared.commands_tx.send(OutputCommand::Stop);
        if let Some(handle) = self.thread_handle.take() {
            if handle.join().is_err() {
                error!("MIDI output worker panicked");
            }
        }
    }
}

/// Thread that captures inbound transport data
pub(crate) struct InputWorker {
    stop_tx: Sender<()>,
    thread_handle: Option<JoinHandle<()>>,
}

impl InputWorker {
    pub fn spawn(shared: Arc<Shared>) -> Result<Self> {
        let input = shared.transport.input();
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let (ready_tx, ready_rx) = bounded(1);

        let thread_handle = thread::Builder::new()
            .name("midi-input".to_string())
            .spawn(move || {
                info!("MIDI input worker started");
                let _ = ready_tx.send(());
                loop {
                    select! {
                        recv(input) -> raw => match raw {
                            Ok(raw) => {
                                shared.capture(raw);
                                for raw in input.try_iter() {
                                    shared.capture(raw);
                                }
                            }
                            Err(_) => {
                                error!("MIDI input channel disconnected");
                                break;
                            }
                        },
                        recv(stop_rx) -> _ => break,
                    }
                }
                for raw in input.try_iter() {
                    shared.capture(raw);
                }
                info!("MIDI input worker stopped");
            })
            .map_err(|e| MidiError::ConnectionError(format!("cannot spawn input worker: {}", e)))?;

        ready_rx.recv_timeout(ACTIVATION_TIMEOUT).map_err(|_| {
            MidiError::ConnectionError("input worker did not report ready".to_string())
        })?;
        Ok(Self {
            stop_tx,
            thread_handle: Some(thread_handle),
        })
    }

    pub fn stop(mut self) {
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.thread_handle.take() {
            if handle.join().is_err() {
                error!("MIDI input worker panicked");
            }
        }
    }
}
