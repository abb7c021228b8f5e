use clap::Parser;
use dialoguer::Select;
use seqengine::{
    cli::{validate_device, Args},
    logging,
    ui::PositionDisplay,
    BusId, BusMode, Engine, EngineSettings, Event, EventSink, MidiError, Notification, NotifyTag,
    PlaybackFeed, SequencerTransport, TimeScale, TrackId, TrackRef,
};
use crossbeam::channel::Receiver;
use std::io::IsTerminal;
use std::path::Path;
use std::sync::Arc;
use std::{thread, time::Duration};

/// Arpeggio played on the master bus, one note per eighth
struct DemoPattern {
    track: TrackRef,
    scale: TimeScale,
}

const DEMO_NOTES: [u8; 8] = [60, 64, 67, 72, 67, 64, 60, 55];

impl PlaybackFeed for DemoPattern {
    fn process(&mut self, sink: &mut dyn EventSink, start: u64, end: u64) {
        let step = (u64::from(self.scale.ticks_per_beat) / 2).max(1);
        let first = self.scale.tick_from_frame(start).div_ceil(step);
        let mut index = first;
        loop {
            let time = self.scale.frame_from_tick(index * step);
            if time >= end {
                break;
            }
            if time >= start {
                let note = DEMO_NOTES[(index % DEMO_NOTES.len() as u64) as usize];
                let off = self.scale.frame_from_tick(index * step + step * 3 / 4);
                sink.enqueue(&self.track, Event::note_on(0, note, 96, time), time, 1.0);
                sink.enqueue(&self.track, Event::note_off(0, note, off), off, 1.0);
            }
            index += 1;
        }
    }
}

fn main() {
    let args = Args::parse();
    if let Err(e) = run(args) {
        log::error!("{}", e);
        eprintln!("{}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<(), MidiError> {
    let mut settings = EngineSettings::load(args.config.as_deref())?;
    initialize_logging(&settings)?;

    let transport: Arc<dyn SequencerTransport> = Arc::new(seqengine::MidirTransport::new());
    let devices = transport.endpoints(BusMode::Output);

    if args.device_list {
        list_available_devices(&devices);
        return Ok(());
    }

    let device = match &args.connect {
        Some(device_name) => {
            validate_device(device_name, &devices).map_err(MidiError::ConfigurationError)?;
            Some(device_name.clone())
        }
        None => choose_device(&devices),
    };

    if let Some(tempo) = args.tempo {
        settings.tempo = tempo;
    }
    if let Some(read_ahead) = args.read_ahead {
        settings.read_ahead = read_ahead;
    }
    settings.metronome.enabled |= args.metronome;

    let mut engine = Engine::new(Arc::clone(&transport), settings)?;
    let master = engine.add_bus("Master", BusMode::Duplex, false)?;
    if let Some(device) = &device {
        engine.with_bus_mut(master, |bus| bus.add_connect(BusMode::Output, device));
    }
    let scale = engine.time_scale();
    engine.set_feed(Box::new(DemoPattern {
        track: TrackRef::new(TrackId(1), master, 0),
        scale,
    }));

    let bar_frames = scale.frame_from_beat(u64::from(scale.beats_per_bar));
    let end = bar_frames * args.bars.max(1);

    if let Some(path) = &args.export {
        return export(&engine, path, end, master);
    }

    let notifications = engine.subscribe(0);
    if !engine.start()? {
        return Err(MidiError::ConfigurationError("no bus to play on".to_string()));
    }
    play(&mut engine, end, &notifications);
    engine.clean();
    Ok(())
}

fn initialize_logging(settings: &EngineSettings) -> Result<(), MidiError> {
    logging::init_logger(settings.log_level_filter()?)?;
    log::info!("Application starting");
    Ok(())
}

fn list_available_devices(devices: &[String]) {
    println!("Available MIDI devices:");
    for device in devices {
        println!("  - {}", device);
    }
}

fn choose_device(devices: &[String]) -> Option<String> {
    if devices.is_empty() || !std::io::stdin().is_terminal() {
        return None;
    }
    let selection = Select::new()
        .with_prompt("Output device")
        .items(devices)
        .default(0)
        .interact_opt();
    match selection {
        Ok(Some(index)) => devices.get(index).cloned(),
        Ok(None) => None,
        Err(e) => {
            log::warn!("Device selection failed: {}", e);
            None
        }
    }
}

fn export(engine: &Engine, path: &Path, end: u64, master: BusId) -> Result<(), MidiError> {
    let count = engine.file_export(path, 0, end, Some(master))?;
    println!("Wrote {} events to {}", count, path.display());
    Ok(())
}

fn play(engine: &mut Engine, end: u64, notifications: &Receiver<Notification>) {
    let display = PositionDisplay::new(engine.time_scale().beats_per_bar);
    log::info!("Playing until frame {}", end);

    loop {
        thread::sleep(Duration::from_millis(100));
        let frame = engine.play_frame();
        display.update(&engine.time_scale(), frame, engine.dropped_events());

        for notification in notifications.try_iter() {
            if let NotifyTag::ConnectFailed { bus, endpoint } = notification.tag {
                eprintln!("Bus '{}' could not connect to '{}'", bus, endpoint);
            }
        }
        if frame >= end {
            break;
        }
    }

    engine.stop();
    display.finish();
}
