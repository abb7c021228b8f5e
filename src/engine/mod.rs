//! The MIDI engine: lifecycle, bus management and the session-facing API.
//!
//! An [`Engine`] owns its buses, the sequencer queue and two worker threads.
//! Collaborators that need the real-time path from another thread (the
//! session clock, a track model) take a cloneable [`EngineHandle`].

mod control;
mod feed;
mod metronome;
mod persist;
mod shared;
mod worker;

pub use self::control::{CONTROL_IN_BUS_NAME, CONTROL_OUT_BUS_NAME};
pub use self::feed::{EventSink, PlaybackFeed};
pub use self::metronome::{MetroClicks, METRO_BUS_NAME};

use self::metronome::MetroConfig;
use self::shared::{RecordArm, Shared};
use self::worker::{InputWorker, OutputCommand, OutputWorker};
use crate::bus::{Bus, BusId, BusMode};
use crate::config::EngineSettings;
use crate::error::{MidiError, Result};
use crate::event::{Event, TrackId, TrackRef};
use crate::export;
use crate::notify::{Notification, NotifyTag};
use crate::timescale::{TimeScale, Timing};
use crate::transport::{RawEvent, SequencerTransport};
use crossbeam::channel::{bounded, unbounded, Receiver, Sender};
use log::{debug, error, info, warn};
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::{Arc, PoisonError};
use std::time::Duration;

/// Longest a caller waits for the output worker to acknowledge a command
const COMMAND_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EngineState {
    Idle,
    Initialized,
    Active,
    Playing,
}

pub struct Engine {
    settings: EngineSettings,
    shared: Arc<Shared>,
    state: EngineState,
    control_bus: bool,
    output_worker: Option<OutputWorker>,
    input_worker: Option<InputWorker>,
}

impl Engine {
    pub fn new(transport: Arc<dyn SequencerTransport>, settings: EngineSettings) -> Result<Self> {
        settings.validate()?;
        let shared = Shared::new(
            transport,
            Timing::new(settings.time_scale()),
            settings.read_ahead,
            MetroConfig::from(&settings.metronome),
        );
        let mut engine = Self {
            control_bus: false,
            shared: Arc::new(shared),
            state: EngineState::Idle,
            output_worker: None,
            input_worker: None,
            settings,
        };
        if engine.settings.metronome.use_bus {
            engine.set_metro_bus(true)?;
        }
        if engine.settings.control_bus {
            engine.set_control_bus(true)?;
        }
        Ok(engine)
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn is_active(&self) -> bool {
        self.state >= EngineState::Active
    }

    pub fn is_playing(&self) -> bool {
        self.state == EngineState::Playing
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn transport(&self) -> &Arc<dyn SequencerTransport> {
        &self.shared.transport
    }

    // Lifecycle

    /// Opens the sequencer client under `identity`
    pub fn init(&mut self, identity: &str) -> Result<()> {
        if self.state >= EngineState::Initialized {
            return Ok(());
        }
        self.shared.transport.open_client(identity)?;
        self.state = EngineState::Initialized;
        info!("MIDI engine initialized as '{}'", identity);
        Ok(())
    }

    /// Allocates the queue, opens every bus and starts both workers.
    /// Returns `Ok(false)` when there is no bus to activate yet.
    pub fn activate(&mut self) -> Result<bool> {
        if self.is_active() {
            return Ok(true);
        }
        if self.state == EngineState::Idle {
            let identity = self.settings.client_name.clone();
            self.init(&identity)?;
        }
        if self.shared.buses().is_empty() {
            info!("No MIDI buses configured, activation deferred");
            return Ok(false);
        }

        let transport = Arc::clone(&self.shared.transport);
        transport.alloc_queue()?;
        let scale = self.shared.timing.load().scale;
        if let Err(e) = transport.set_queue_tempo(scale.tempo, scale.ticks_per_beat) {
            transport.free_queue();
            return Err(e);
        }
        self.shared.timing.store(Timing::new(scale));
        self.shared.feed_frame.store(0, Ordering::Release);

        if let Err(e) = self.open_buses() {
            self.close_buses();
            transport.free_queue();
            return Err(e);
        }
        if let Err(e) = self.spawn_workers() {
            error!("MIDI engine activation failed: {}", e);
            self.close_buses();
            transport.free_queue();
            return Err(e);
        }

        self.state = EngineState::Active;
        let connected = self.update_connects();
        info!("MIDI engine activated ({} connections)", connected);
        Ok(true)
    }

    fn open_buses(&self) -> Result<()> {
        let mut buses = self.shared.buses_mut();
        for (_, bus) in buses.iter_mut() {
            bus.open()?;
        }
        Ok(())
    }

    fn close_buses(&self) {
        let mut buses = self.shared.buses_mut();
        for (_, bus) in buses.iter_mut() {
            bus.shut_off(true);
        }
    }

    fn spawn_workers(&mut self) -> Result<()> {
        let output = OutputWorker::spawn(Arc::clone(&self.shared))?;
        match InputWorker::spawn(Arc::clone(&self.shared)) {
            Ok(input) => {
                self.output_worker = Some(output);
                self.input_worker = Some(input);
                Ok(())
            }
            Err(e) => {
                output.stop(&self.shared);
                Err(e)
            }
        }
    }

    /// Starts the queue from song frame zero, activating first if needed
    pub fn start(&mut self) -> Result<bool> {
        if self.is_playing() {
            return Ok(true);
        }
        if !self.is_active() && !self.activate()? {
            return Ok(false);
        }

        let scale = self.shared.timing.load().scale;
        self.shared.timing.store(Timing::new(scale));
        self.shared.feed_frame.store(0, Ordering::Release);
        self.shared.metro_frontier.store(0, Ordering::Release);
        self.shared.transport.start_queue();
        self.state = EngineState::Playing;
        let _ = self.shared.wake_tx.try_send(());
        info!("MIDI engine started");
        Ok(true)
    }

    /// Delivers what is due, stops the queue, drops everything still
    /// undelivered and silences every output.
    pub fn stop(&mut self) {
        if !self.is_playing() {
            return;
        }
        self.flush();
        self.shared.transport.stop_queue();
        let frame = self.shared.play_frame();
        self.discard(frame);

        let mut buses = self.shared.buses_mut();
        for (_, bus) in buses.iter_mut() {
            bus.shut_off(false);
        }
        drop(buses);

        self.state = EngineState::Active;
        info!("MIDI engine stopped at frame {}", frame);
    }

    pub fn deactivate(&mut self) {
        if !self.is_active() {
            return;
        }
        self.stop();
        if let Some(input) = self.input_worker.take() {
            input.stop();
        }
        if let Some(output) = self.output_worker.take() {
            output.stop(&self.shared);
        }
        self.close_buses();
        self.shared.transport.free_queue();
        self.state = EngineState::Initialized;
        info!("MIDI engine deactivated");
    }

    /// Full teardown back to the idle state
    pub fn clean(&mut self) {
        self.deactivate();
        if self.state == EngineState::Initialized {
            self.shared.transport.close_client();
            self.state = EngineState::Idle;
            info!("MIDI engine cleaned up");
        }
    }

    // Output path

    pub fn enqueue(&self, track: &TrackRef, event: Event, time: u64, gain: f32) -> bool {
        self.shared.enqueue(track, event, time, gain)
    }

    /// Sends `command` to the output worker and waits for its ack. False
    /// when no worker runs or it did not answer in time.
    fn request(&self, command: impl FnOnce(Sender<()>) -> OutputCommand) -> bool {
        if self.output_worker.is_none() {
            return false;
        }
        let (ack_tx, ack_rx) = bounded(1);
        if self.shared.commands_tx.send(command(ack_tx)).is_err() {
            return false;
        }
        let acked = ack_rx.recv_timeout(COMMAND_TIMEOUT).is_ok();
        if !acked {
            warn!("MIDI output worker did not acknowledge in time");
        }
        acked
    }

    /// Delivers everything already due
    pub fn flush(&self) -> bool {
        self.request(OutputCommand::Flush)
    }

    fn discard(&self, frame: u64) -> bool {
        if self.output_worker.is_none() {
            self.shared.reposition(frame, None);
            return false;
        }
        let (ack_tx, ack_rx) = bounded(1);
        self.shared.reposition(frame, Some(ack_tx));
        ack_rx.recv_timeout(COMMAND_TIMEOUT).is_ok()
    }

    /// Jumps back to the loop start. Undelivered events are dropped and
    /// every sounding note is released before this returns.
    pub fn restart_loop(&self, frame: u64) -> bool {
        debug!("Loop restart at frame {}", frame);
        self.discard(frame)
    }

    /// Moves the play position without waiting for the worker
    pub fn locate(&self, frame: u64) {
        self.shared.reposition(frame, None);
    }

    pub fn play_frame(&self) -> u64 {
        self.shared.play_frame()
    }

    pub fn sync(&self, audio_frame: u64) -> i64 {
        self.shared.sync(audio_frame)
    }

    pub fn track_mute(&self, track: TrackId, mute: bool) {
        {
            let mut muted = self
                .shared
                .muted
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if mute {
                muted.insert(track);
            } else {
                muted.remove(&track);
            }
        }
        if mute {
            let _ = self.shared.commands_tx.send(OutputCommand::MuteSweep(track));
        }
        debug!("Track {:?} mute {}", track, mute);
    }

    pub fn is_track_muted(&self, track: TrackId) -> bool {
        self.shared
            .muted
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&track)
    }

    pub fn set_feed(&self, feed: Box<dyn PlaybackFeed>) {
        *self.shared.feed.lock().unwrap_or_else(PoisonError::into_inner) = Some(feed);
    }

    pub fn take_feed(&self) -> Option<Box<dyn PlaybackFeed>> {
        self.shared
            .feed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    // Input path

    pub fn capture(&self, raw: RawEvent) {
        self.shared.capture(raw);
    }

    /// Routes events captured on `track`'s bus and channel (every channel
    /// with `omni`) to the returned receiver.
    pub fn arm_record(&self, track: TrackRef, omni: bool) -> Receiver<Event> {
        let (sink, rx) = unbounded();
        let mut arms = self
            .shared
            .record
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        arms.retain(|arm| arm.track.id != track.id);
        arms.push(RecordArm { track, omni, sink });
        rx
    }

    pub fn disarm_record(&self, track: TrackId) {
        self.shared
            .record
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|arm| arm.track.id != track);
    }

    // Timing

    pub fn read_ahead(&self) -> u64 {
        self.shared.read_ahead.load(Ordering::Relaxed)
    }

    pub fn set_read_ahead(&mut self, frames: u64) -> Result<()> {
        if frames == 0 {
            return Err(MidiError::ConfigurationError(
                "read-ahead must be positive".to_string(),
            ));
        }
        self.shared.read_ahead.store(frames, Ordering::Relaxed);
        self.settings.read_ahead = frames;
        Ok(())
    }

    pub fn time_scale(&self) -> TimeScale {
        self.shared.timing.load().scale
    }

    /// Replaces the tempo map; takes effect through `reset_tempo`
    pub fn set_time_scale(&mut self, scale: TimeScale) -> Result<()> {
        scale.validate()?;
        self.settings.sample_rate = scale.sample_rate;
        self.settings.tempo = scale.tempo;
        self.settings.beats_per_bar = scale.beats_per_bar;
        self.settings.ticks_per_beat = scale.ticks_per_beat;
        self.reset_tempo()
    }

    pub fn set_tempo(&mut self, tempo: f32) -> Result<()> {
        let scale = TimeScale {
            tempo,
            ..self.time_scale()
        };
        self.set_time_scale(scale)
    }

    /// Re-anchors the frame/tick conversion at the current position using
    /// the configured tempo. Events already queued keep their ticks.
    pub fn reset_tempo(&mut self) -> Result<()> {
        let scale = self.settings.time_scale();
        scale.validate()?;
        let transport = &self.shared.transport;
        let tick = transport.queue_tick();
        let frame = self.shared.play_frame();
        if self.is_active() {
            transport.set_queue_tempo(scale.tempo, scale.ticks_per_beat)?;
        }
        self.shared
            .timing
            .store(Timing::anchored(scale, frame, tick));
        debug!("Tempo reset to {} BPM at frame {}", scale.tempo, frame);
        Ok(())
    }

    // Buses

    /// Creates a bus; it is opened right away when the engine is active
    pub fn add_bus(&mut self, name: &str, mode: BusMode, passthru: bool) -> Result<BusId> {
        if self.shared.buses().find_by_name(name).is_some() {
            return Err(MidiError::ConfigurationError(format!(
                "bus '{}' already exists",
                name
            )));
        }
        let mut bus = Bus::new(
            Arc::clone(&self.shared.transport),
            name,
            mode,
            passthru,
            self.settings.queue_capacity,
        );
        if self.is_active() {
            bus.open()?;
        }
        let id = self.shared.buses_mut().insert(bus);
        debug!("Bus '{}' added as {:?}", name, id);
        Ok(id)
    }

    pub fn remove_bus(&mut self, id: BusId) -> Result<()> {
        let mut bus = self
            .shared
            .buses_mut()
            .remove(id)
            .ok_or_else(|| MidiError::ConfigurationError(format!("no bus {:?}", id)))?;
        bus.shut_off(true);
        debug!("Bus '{}' removed", bus.name());
        Ok(())
    }

    /// Closes the bus, switches its mode and opens it again when active
    pub fn reopen_bus(&mut self, id: BusId, mode: BusMode) -> Result<()> {
        let active = self.is_active();
        let mut buses = self.shared.buses_mut();
        let bus = buses
            .get_mut(id)
            .ok_or_else(|| MidiError::ConfigurationError(format!("no bus {:?}", id)))?;
        bus.shut_off(true);
        bus.set_mode(mode)?;
        if active {
            bus.open()?;
            let (_, failed) = bus.connect_configured();
            let name = bus.name().to_string();
            drop(buses);
            self.notify_failed(&name, failed);
        }
        Ok(())
    }

    pub fn find_bus(&self, name: &str) -> Option<BusId> {
        self.shared.buses().find_by_name(name)
    }

    pub fn bus_ids(&self) -> Vec<BusId> {
        self.shared.buses().iter().map(|(id, _)| id).collect()
    }

    pub fn with_bus<R>(&self, id: BusId, f: impl FnOnce(&Bus) -> R) -> Option<R> {
        self.shared.buses().get(id).map(f)
    }

    pub fn with_bus_mut<R>(&self, id: BusId, f: impl FnOnce(&mut Bus) -> R) -> Option<R> {
        self.shared.buses_mut().get_mut(id).map(f)
    }

    pub fn default_output_bus(&self) -> Option<BusId> {
        self.shared.buses().default_output()
    }

    pub fn default_input_bus(&self) -> Option<BusId> {
        self.shared.buses().default_input()
    }

    /// Connects every bus to its configured endpoints. Returns the number
    /// of successful attempts; failures are posted as notifications.
    pub fn update_connects(&self) -> usize {
        if !self.is_active() {
            return 0;
        }
        let mut attempts = 0;
        let mut failures = Vec::new();
        {
            let mut buses = self.shared.buses_mut();
            for (_, bus) in buses.iter_mut() {
                let (connected, failed) = bus.connect_configured();
                attempts += connected;
                if !failed.is_empty() {
                    failures.push((bus.name().to_string(), failed));
                }
            }
        }
        for (name, failed) in failures {
            self.notify_failed(&name, failed);
        }
        attempts
    }

    fn notify_failed(&self, bus: &str, failed: Vec<String>) {
        for endpoint in failed {
            self.shared.notifier.post(NotifyTag::ConnectFailed {
                bus: bus.to_string(),
                endpoint,
            });
        }
    }

    // Notifications and monitoring

    pub fn subscribe(&self, target: u64) -> Receiver<Notification> {
        self.shared.notifier.subscribe(target)
    }

    pub fn reset_all_monitors(&self) {
        let buses = self.shared.buses();
        for (_, bus) in buses.iter() {
            for monitor in bus.monitor_in().into_iter().chain(bus.monitor_out()) {
                monitor.reset();
            }
        }
    }

    /// Events dropped because an output buffer was full or busy
    pub fn dropped_events(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    pub fn decode_errors(&self) -> u64 {
        self.shared.decode_errors.load(Ordering::Relaxed)
    }

    pub fn resync_count(&self) -> u64 {
        self.shared.resyncs.load(Ordering::Relaxed)
    }

    // Export

    /// Renders the playback feed between `start` and `end` into a Standard
    /// MIDI File, optionally restricted to one bus. Returns the number of
    /// events written.
    pub fn file_export(
        &self,
        path: &Path,
        start: u64,
        end: u64,
        bus: Option<BusId>,
    ) -> Result<usize> {
        if end <= start {
            return Err(MidiError::ConfigurationError(format!(
                "empty export range {}..{}",
                start, end
            )));
        }
        let mut sink = export::ExportSink::new(start, end, bus);
        {
            let mut feed = self.shared.feed.lock().unwrap_or_else(PoisonError::into_inner);
            let feed = feed.as_mut().ok_or_else(|| {
                MidiError::ConfigurationError("no playback feed to export".to_string())
            })?;
            feed.process(&mut sink, start, end);
        }

        let mut tracks = Vec::new();
        {
            let muted = self
                .shared
                .muted
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            let buses = self.shared.buses();
            for (id, events) in sink.into_events(&muted) {
                let name = buses
                    .get(id)
                    .map(|bus| bus.name().to_string())
                    .unwrap_or_else(|| format!("Bus {}", id.0));
                tracks.push(export::ExportTrack { name, events });
            }
        }
        export::write_smf(path, &self.time_scale(), start, &tracks)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.clean();
    }
}

/// Cloneable access to the engine's real-time path
#[derive(Clone)]
pub struct EngineHandle {
    shared: Arc<Shared>,
}

impl EngineHandle {
    pub fn enqueue(&self, track: &TrackRef, event: Event, time: u64, gain: f32) -> bool {
        self.shared.enqueue(track, event, time, gain)
    }

    pub fn process_metro(&self, start: u64, end: u64) -> MetroClicks {
        self.shared.process_metro(start, end)
    }

    pub fn capture(&self, raw: RawEvent) {
        self.shared.capture(raw);
    }

    pub fn sync(&self, audio_frame: u64) -> i64 {
        self.shared.sync(audio_frame)
    }

    pub fn play_frame(&self) -> u64 {
        self.shared.play_frame()
    }

    pub fn time_scale(&self) -> TimeScale {
        self.shared.timing.load().scale
    }

    pub fn dropped_events(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}
