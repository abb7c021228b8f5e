use seqengine::patch::BankSelMethod;
use seqengine::transport::LoopbackTransport;
use seqengine::*;
use std::sync::Arc;

fn new_engine() -> Engine {
    Engine::new(Arc::new(LoopbackTransport::new()), EngineSettings::default()).unwrap()
}

fn configured_engine() -> Engine {
    let mut engine = new_engine();
    let master = engine.add_bus("Master", BusMode::Duplex, true).unwrap();
    let keys = engine.add_bus("Keys", BusMode::Input, false).unwrap();
    engine.with_bus_mut(master, |bus| {
        bus.set_patch(0, "Grand Piano", Some(BankSelMethod::Normal), Some(130), Some(1))
            .unwrap();
        bus.set_patch(9, "Drums", None, None, Some(0)).unwrap();
        bus.add_connect(BusMode::Output, "Synth");
    });
    engine.with_bus_mut(keys, |bus| bus.add_connect(BusMode::Input, "Keyboard"));

    engine.set_metronome(true);
    engine.set_metro_channel(10);
    engine.set_metro_bar(80, 120, 60);
    engine.set_metro_beat(81, 90, 30);
    engine.set_metro_bus(true).unwrap();
    let metro = engine.metro_bus().unwrap();
    engine.with_bus_mut(metro, |bus| bus.add_connect(BusMode::Output, "Click"));
    engine.set_control_bus(true).unwrap();
    engine
}

#[test]
fn test_save_load_round_trip_through_json() {
    let engine = configured_engine();
    let saved = engine.save_element();
    assert_eq!(saved.name, "midi-engine");

    let json = serde_json::to_string(&saved).unwrap();
    let parsed: Element = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed, saved);

    let mut restored = new_engine();
    restored.load_element(&parsed).unwrap();
    assert_eq!(restored.save_element(), saved);

    assert!(restored.is_metronome());
    assert!(restored.is_metro_bus());
    assert!(restored.is_control_bus());
    assert_eq!(restored.metro_channel(), 10);
    assert_eq!(restored.metro_bar().velocity, 120);

    let master = restored.find_bus("Master").unwrap();
    let (passthru, instrument) = restored
        .with_bus_mut(master, |bus| {
            (bus.is_passthru(), bus.patch(0).instrument_name.clone())
        })
        .unwrap();
    assert!(passthru);
    assert_eq!(instrument, "Grand Piano");

    let metro = restored.metro_bus().unwrap();
    let click_outputs = restored
        .with_bus(metro, |bus| bus.outputs().len())
        .unwrap();
    assert_eq!(click_outputs, 1);
}

#[test]
fn test_load_replaces_existing_buses() {
    let saved = configured_engine().save_element();
    let mut engine = new_engine();
    engine.add_bus("Old", BusMode::Output, false).unwrap();

    engine.load_element(&saved).unwrap();
    assert_eq!(engine.find_bus("Old"), None);
    assert!(engine.find_bus("Keys").is_some());
}

#[test]
fn test_load_rejects_foreign_element() {
    let mut engine = new_engine();
    assert!(engine.load_element(&Element::new("session")).is_err());

    let mut broken = Element::new("midi-engine");
    let mut buses = Element::new("buses");
    buses.push(Element::new("bus").with_attr("name", "X").with_attr("mode", "sideways"));
    broken.push(buses);
    assert!(matches!(
        engine.load_element(&broken),
        Err(MidiError::ConfigurationError(_))
    ));
}
