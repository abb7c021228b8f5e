use seqengine::transport::{Delivery, LoopbackTransport, PortId};
use seqengine::*;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn setup_with(settings: EngineSettings) -> (Arc<LoopbackTransport>, Engine) {
    let transport = Arc::new(LoopbackTransport::new());
    let engine = Engine::new(transport.clone(), settings).unwrap();
    (transport, engine)
}

fn setup() -> (Arc<LoopbackTransport>, Engine) {
    setup_with(EngineSettings::default())
}

fn port_of(engine: &Engine, bus: BusId) -> PortId {
    engine.with_bus(bus, |b| b.port()).flatten().unwrap()
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

fn notes_on(deliveries: &[Delivery], port: PortId) -> Vec<u8> {
    deliveries
        .iter()
        .filter(|d| d.port == port && d.data[0] & 0xF0 == 0x90 && d.data[2] > 0)
        .map(|d| d.data[1])
        .collect()
}

#[test]
fn test_lifecycle_stages() {
    let (transport, mut engine) = setup();
    assert_eq!(engine.state(), EngineState::Idle);

    engine.init("test").unwrap();
    assert_eq!(engine.state(), EngineState::Initialized);
    assert_eq!(engine.activate().unwrap(), false);
    assert_eq!(engine.state(), EngineState::Initialized);

    engine.add_bus("Master", BusMode::Duplex, false).unwrap();
    assert!(engine.activate().unwrap());
    assert!(engine.activate().unwrap());
    assert_eq!(transport.port_count(), 1);

    assert!(engine.start().unwrap());
    assert!(engine.is_playing());
    engine.stop();
    engine.stop();
    assert_eq!(engine.state(), EngineState::Active);

    engine.deactivate();
    assert_eq!(engine.state(), EngineState::Initialized);
    assert_eq!(transport.port_count(), 0);

    engine.clean();
    engine.clean();
    assert_eq!(engine.state(), EngineState::Idle);
    assert_eq!(transport.client_name(), None);
}

#[test]
fn test_unreachable_sequencer() {
    let transport = Arc::new(LoopbackTransport::unreachable());
    let mut engine = Engine::new(transport, EngineSettings::default()).unwrap();
    assert!(matches!(
        engine.init("test"),
        Err(MidiError::ConnectionError(_))
    ));
    engine.add_bus("Master", BusMode::Output, false).unwrap();
    assert!(matches!(
        engine.activate(),
        Err(MidiError::ConnectionError(_))
    ));
    assert_eq!(engine.state(), EngineState::Idle);
}

#[test]
fn test_zero_read_ahead_rejected() {
    let (_transport, mut engine) = setup();
    assert!(matches!(
        engine.set_read_ahead(0),
        Err(MidiError::ConfigurationError(_))
    ));
    assert_eq!(engine.read_ahead(), 4096);
    engine.set_read_ahead(512).unwrap();
    assert_eq!(engine.read_ahead(), 512);
}

#[test]
fn test_duplicate_bus_name_rejected() {
    let (_transport, mut engine) = setup();
    engine.add_bus("Master", BusMode::Output, false).unwrap();
    assert!(engine.add_bus("Master", BusMode::Input, false).is_err());
}

#[test]
fn test_note_pair_delivered_at_due_ticks() {
    let (transport, mut engine) = setup();
    engine.set_read_ahead(512).unwrap();
    let bus = engine.add_bus("Master", BusMode::Output, false).unwrap();
    assert!(engine.start().unwrap());
    let port = port_of(&engine, bus);

    let track = TrackRef::new(TrackId(1), bus, 0);
    assert!(engine.enqueue(&track, Event::note_on(0, 60, 100, 0), 0, 1.0));
    assert!(engine.enqueue(&track, Event::note_off(0, 60, 4800), 4800, 1.0));

    assert!(engine.flush());
    let deliveries = transport.deliveries();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].data, vec![0x90, 60, 100]);
    assert_eq!(deliveries[0].tick, 0);

    transport.advance(191);
    assert!(engine.flush());
    assert_eq!(transport.deliveries().len(), 1);

    transport.advance(1);
    assert!(engine.flush());
    let deliveries = transport.deliveries();
    assert_eq!(deliveries.len(), 2);
    assert_eq!(deliveries[1].port, port);
    assert_eq!(deliveries[1].data, vec![0x80, 60, 0]);
    assert_eq!(deliveries[1].tick, 192);
}

#[test]
fn test_gain_scales_velocity_and_channel_follows_track() {
    let (transport, mut engine) = setup();
    let bus = engine.add_bus("Master", BusMode::Output, false).unwrap();
    engine.start().unwrap();

    let track = TrackRef::new(TrackId(3), bus, 0x13);
    engine.enqueue(&track, Event::note_on(0, 64, 100, 0), 0, 0.5);
    engine.flush();
    assert_eq!(transport.deliveries()[0].data, vec![0x93, 64, 50]);
}

#[test]
fn test_per_destination_ordering() {
    let (transport, mut engine) = setup();
    let a = engine.add_bus("A", BusMode::Output, false).unwrap();
    let b = engine.add_bus("B", BusMode::Output, false).unwrap();
    engine.start().unwrap();
    let track_a = TrackRef::new(TrackId(1), a, 0);
    let track_b = TrackRef::new(TrackId(2), b, 1);

    for (track, note, time) in [
        (&track_a, 60, 0),
        (&track_b, 70, 0),
        (&track_a, 61, 0),
        (&track_a, 63, 2400),
        (&track_b, 71, 1200),
        (&track_a, 62, 0),
        (&track_a, 64, 1200),
        (&track_b, 72, 0),
    ] {
        assert!(engine.enqueue(track, Event::note_on(0, note, 90, time), time, 1.0));
    }

    transport.advance(200);
    engine.flush();
    let deliveries = transport.deliveries();
    assert_eq!(notes_on(&deliveries, port_of(&engine, a)), vec![60, 61, 62, 64, 63]);
    assert_eq!(notes_on(&deliveries, port_of(&engine, b)), vec![70, 72, 71]);
}

#[test]
fn test_restart_loop_leaves_no_sounding_notes() {
    let (transport, mut engine) = setup();
    let bus = engine.add_bus("Master", BusMode::Output, false).unwrap();
    engine.start().unwrap();
    let track = TrackRef::new(TrackId(1), bus, 0);

    for note in [60, 64, 67] {
        engine.enqueue(&track, Event::note_on(0, note, 100, 0), 0, 1.0);
        engine.enqueue(&track, Event::note_off(0, note, 48_000), 48_000, 1.0);
    }
    engine.enqueue(&track, Event::note_on(0, 72, 100, 24_000), 24_000, 1.0);
    engine.flush();
    assert_eq!(transport.sounding_notes().len(), 3);

    assert!(engine.restart_loop(0));
    assert!(transport.sounding_notes().is_empty());

    let delivered = transport.deliveries().len();
    transport.advance(4000);
    engine.flush();
    assert_eq!(transport.deliveries().len(), delivered);
}

#[test]
fn test_restart_loop_notifies_relocation() {
    let (_transport, mut engine) = setup();
    engine.add_bus("Master", BusMode::Output, false).unwrap();
    engine.start().unwrap();
    let notifications = engine.subscribe(42);

    engine.restart_loop(96_000);
    let notification = notifications.try_recv().unwrap();
    assert_eq!(notification.target, 42);
    assert_eq!(notification.tag, NotifyTag::Relocated { frame: 96_000 });
    assert_eq!(engine.play_frame(), 96_000);
}

#[test]
fn test_mute_and_unmute_leave_no_stuck_note() {
    let (transport, mut engine) = setup();
    let bus = engine.add_bus("Master", BusMode::Output, false).unwrap();
    engine.start().unwrap();
    let track = TrackRef::new(TrackId(7), bus, 0);
    let other = TrackRef::new(TrackId(8), bus, 1);

    engine.enqueue(&track, Event::note_on(0, 60, 100, 0), 0, 1.0);
    engine.enqueue(&other, Event::note_on(0, 48, 100, 0), 0, 1.0);
    engine.flush();
    assert_eq!(transport.sounding_notes().len(), 2);

    engine.track_mute(TrackId(7), true);
    assert!(engine.is_track_muted(TrackId(7)));
    engine.flush();
    let port = port_of(&engine, bus);
    assert_eq!(transport.sounding_notes(), vec![(port, 1, 48)]);

    assert!(!engine.enqueue(&track, Event::note_on(0, 62, 100, 0), 0, 1.0));
    assert!(engine.enqueue(&track, Event::note_off(0, 62, 0), 0, 1.0));

    engine.track_mute(TrackId(7), false);
    assert!(engine.enqueue(&track, Event::note_on(0, 65, 100, 0), 0, 1.0));
    assert!(engine.enqueue(&track, Event::note_off(0, 65, 0), 0, 1.0));
    engine.enqueue(&other, Event::note_off(0, 48, 0), 0, 1.0);
    engine.flush();
    assert!(transport.sounding_notes().is_empty());
}

#[test]
fn test_mute_keeps_already_queued_events() {
    let (transport, mut engine) = setup();
    let bus = engine.add_bus("Master", BusMode::Output, false).unwrap();
    engine.start().unwrap();
    let track = TrackRef::new(TrackId(1), bus, 0);

    // 4800 frames is 192 ticks at 120 BPM, 48 kHz and 960 PPQ.
    assert!(engine.enqueue(&track, Event::controller(0, 7, 90, 4800), 4800, 1.0));
    engine.flush();
    engine.track_mute(TrackId(1), true);
    assert!(!engine.enqueue(&track, Event::controller(0, 7, 10, 4800), 4800, 1.0));

    transport.advance(192);
    engine.flush();
    let sent: Vec<_> = transport.deliveries().into_iter().map(|d| d.data).collect();
    assert_eq!(sent, vec![vec![0xB0, 7, 90]]);
}

#[test]
fn test_stop_silences_outputs() {
    let (transport, mut engine) = setup();
    let bus = engine.add_bus("Master", BusMode::Output, false).unwrap();
    engine.start().unwrap();
    let track = TrackRef::new(TrackId(1), bus, 0);
    engine.enqueue(&track, Event::note_on(0, 60, 100, 0), 0, 1.0);
    engine.enqueue(&track, Event::note_off(0, 60, 96_000), 96_000, 1.0);
    engine.flush();
    assert_eq!(transport.sounding_notes().len(), 1);

    engine.stop();
    assert!(transport.sounding_notes().is_empty());
    let all_notes_off = transport
        .deliveries()
        .iter()
        .filter(|d| d.data[0] & 0xF0 == 0xB0 && d.data[1] == 0x7B)
        .count();
    assert_eq!(all_notes_off, 16);
}

#[test]
fn test_saturated_buffer_counts_drops() {
    let settings = EngineSettings {
        queue_capacity: 4,
        ..EngineSettings::default()
    };
    let (_transport, mut engine) = setup_with(settings);
    let bus = engine.add_bus("Master", BusMode::Output, false).unwrap();
    let track = TrackRef::new(TrackId(1), bus, 0);

    let accepted = (0..10)
        .filter(|i| engine.enqueue(&track, Event::note_on(0, 60, 100, *i), *i, 1.0))
        .count();
    assert_eq!(accepted, 4);
    assert_eq!(engine.dropped_events(), 6);
}

#[test]
fn test_enqueue_on_input_bus_is_dropped() {
    let (_transport, mut engine) = setup();
    let bus = engine.add_bus("Keys", BusMode::Input, false).unwrap();
    let track = TrackRef::new(TrackId(1), bus, 0);
    assert!(!engine.enqueue(&track, Event::note_on(0, 60, 100, 0), 0, 1.0));
    assert_eq!(engine.dropped_events(), 1);
}

#[test]
fn test_update_connects_without_endpoints() {
    let (_transport, mut engine) = setup();
    engine.add_bus("Master", BusMode::Duplex, false).unwrap();
    engine.activate().unwrap();
    assert_eq!(engine.update_connects(), 0);
}

#[test]
fn test_connect_failures_are_notified() {
    let (transport, mut engine) = setup();
    transport.add_endpoint("Synth", BusMode::Input);
    let notifications = engine.subscribe(1);
    let bus = engine.add_bus("Master", BusMode::Output, false).unwrap();
    engine.with_bus_mut(bus, |b| {
        b.add_connect(BusMode::Output, "Synth");
        b.add_connect(BusMode::Output, "Nowhere");
    });

    engine.activate().unwrap();
    let tags: Vec<_> = notifications.try_iter().map(|n| n.tag).collect();
    assert_eq!(
        tags,
        vec![NotifyTag::ConnectFailed {
            bus: "Master".to_string(),
            endpoint: "Nowhere".to_string(),
        }]
    );
    let connected = engine
        .with_bus(bus, |b| {
            b.outputs()
                .iter()
                .filter(|item| item.connected)
                .map(|item| item.endpoint.clone())
                .collect::<Vec<_>>()
        })
        .unwrap();
    assert_eq!(connected, vec!["Synth"]);

    transport.add_endpoint("Nowhere", BusMode::Input);
    assert_eq!(engine.update_connects(), 1);
}

#[test]
fn test_record_arm_receives_matching_channel() {
    let (transport, mut engine) = setup();
    let bus = engine.add_bus("Keys", BusMode::Duplex, false).unwrap();
    let recorded = engine.arm_record(TrackRef::new(TrackId(5), bus, 2), false);
    engine.activate().unwrap();
    let port = port_of(&engine, bus);

    transport.inject(port, &[0x91, 40, 100]);
    transport.inject(port, &[0x92, 60, 100]);
    let event = recorded.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(event.channel, 2);
    assert_eq!(event.track, Some(TrackId(5)));
    assert_eq!(
        event.kind,
        EventKind::NoteOn {
            note: 60,
            velocity: 100
        }
    );
    assert!(recorded.try_recv().is_err());

    let monitor = engine
        .with_bus(bus, |b| b.monitor_in().cloned())
        .flatten()
        .unwrap();
    assert!(wait_until(|| monitor.count() >= 2));
}

#[test]
fn test_malformed_input_is_counted() {
    let (transport, mut engine) = setup();
    let bus = engine.add_bus("Keys", BusMode::Input, false).unwrap();
    engine.activate().unwrap();
    let port = port_of(&engine, bus);

    transport.inject(port, &[0xF8]);
    transport.inject(port, &[0x90, 60]);
    assert!(wait_until(|| engine.decode_errors() == 2));
}

#[test]
fn test_passthru_echoes_input() {
    let (transport, mut engine) = setup();
    let bus = engine.add_bus("Thru", BusMode::Duplex, true).unwrap();
    engine.activate().unwrap();
    let port = port_of(&engine, bus);

    transport.inject(port, &[0x90, 60, 100]);
    assert!(wait_until(|| transport
        .deliveries()
        .iter()
        .any(|d| d.port == port && d.data == vec![0x90, 60, 100])));
}

#[test]
fn test_sync_corrects_large_drift_only() {
    let (_transport, mut engine) = setup();
    engine.add_bus("Master", BusMode::Output, false).unwrap();
    engine.start().unwrap();
    let notifications = engine.subscribe(0);

    assert_eq!(engine.sync(100), -100);
    assert_eq!(engine.resync_count(), 0);

    assert_eq!(engine.sync(10_000), -10_000);
    assert_eq!(engine.resync_count(), 1);
    assert_eq!(engine.play_frame(), 10_000);
    assert_eq!(
        notifications.try_recv().unwrap().tag,
        NotifyTag::DriftCorrected { frames: -10_000 }
    );
}

#[test]
fn test_tempo_change_keeps_position() {
    let (transport, mut engine) = setup();
    engine.add_bus("Master", BusMode::Output, false).unwrap();
    engine.start().unwrap();

    transport.advance(960);
    assert_eq!(engine.play_frame(), 24_000);

    engine.set_tempo(60.0).unwrap();
    assert_eq!(engine.play_frame(), 24_000);
    transport.advance(960);
    assert_eq!(engine.play_frame(), 72_000);

    assert!(engine.set_tempo(0.0).is_err());
}

#[test]
fn test_playback_feed_is_pulled_within_read_ahead() {
    struct Steady {
        track: TrackRef,
    }

    impl PlaybackFeed for Steady {
        fn process(&mut self, sink: &mut dyn EventSink, start: u64, end: u64) {
            // One note every 2400 frames.
            let first = start.div_ceil(2400) * 2400;
            for time in (first..end).step_by(2400) {
                sink.enqueue(&self.track, Event::note_on(0, 60, 100, time), time, 1.0);
                sink.enqueue(&self.track, Event::note_off(0, 60, time + 1200), time + 1200, 1.0);
            }
        }
    }

    let (transport, mut engine) = setup();
    engine.set_read_ahead(4800).unwrap();
    let bus = engine.add_bus("Master", BusMode::Output, false).unwrap();
    engine.set_feed(Box::new(Steady {
        track: TrackRef::new(TrackId(1), bus, 0),
    }));
    engine.start().unwrap();

    // Notes at frames 0 and 2400 fall inside the first window.
    transport.advance(96);
    assert!(wait_until(|| {
        engine.flush();
        notes_on(&transport.deliveries(), port_of(&engine, bus)).len() == 2
    }));
}

#[test]
fn test_reset_all_monitors() {
    let (_transport, mut engine) = setup();
    let bus = engine.add_bus("Master", BusMode::Output, false).unwrap();
    let track = TrackRef::new(TrackId(1), bus, 0);
    engine.enqueue(&track, Event::note_on(0, 60, 100, 0), 0, 1.0);

    let monitor = engine
        .with_bus(bus, |b| b.monitor_out().cloned())
        .flatten()
        .unwrap();
    assert!(monitor.peek() > 0.0);
    engine.reset_all_monitors();
    assert_eq!(monitor.peek(), 0.0);
}
