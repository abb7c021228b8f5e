use seqengine::patch::BankSelMethod;
use seqengine::transport::{LoopbackTransport, PortId};
use seqengine::*;
use std::sync::Arc;

fn open_bus(mode: BusMode) -> (Arc<LoopbackTransport>, Bus, PortId) {
    let transport = Arc::new(LoopbackTransport::new());
    transport.open_client("test").unwrap();
    let mut bus = Bus::new(transport.clone(), "Master", mode, false, 64);
    bus.open().unwrap();
    let port = bus.port().unwrap();
    (transport, bus, port)
}

fn sent(transport: &LoopbackTransport) -> Vec<Vec<u8>> {
    transport.deliveries().into_iter().map(|d| d.data).collect()
}

#[test]
fn test_patch_channel_is_masked() {
    let transport = Arc::new(LoopbackTransport::new());
    let mut bus = Bus::new(transport, "Master", BusMode::Output, false, 64);

    for channel in 0..=255u8 {
        bus.patch(channel).prog = Some(channel & 0x0F);
    }
    let patches: Vec<_> = bus.patches().map(|(ch, p)| (ch, p.prog)).collect();
    assert_eq!(patches.len(), 16);
    for (channel, prog) in patches {
        assert!(channel < 16);
        assert_eq!(prog, Some(channel));
    }
}

#[test]
fn test_set_patch_sends_bank_and_program() {
    let (transport, mut bus, _port) = open_bus(BusMode::Output);
    bus.set_patch(0x11, "Piano", Some(BankSelMethod::Normal), Some(0x0102), Some(5))
        .unwrap();
    assert_eq!(
        sent(&transport),
        vec![vec![0xB1, 0x00, 0x02], vec![0xB1, 0x20, 0x02], vec![0xC1, 5]]
    );
    assert_eq!(bus.patch(1).instrument_name, "Piano");
}

#[test]
fn test_set_patch_on_closed_bus_only_stores() {
    let transport = Arc::new(LoopbackTransport::new());
    let mut bus = Bus::new(transport.clone(), "Master", BusMode::Output, false, 64);
    bus.set_patch(3, "Strings", None, None, Some(48)).unwrap();
    assert!(transport.deliveries().is_empty());
    assert_eq!(bus.patch(3).prog, Some(48));
}

#[test]
fn test_live_mix_messages() {
    let (transport, mut bus, _port) = open_bus(BusMode::Output);
    bus.set_volume(2, 1.0).unwrap();
    bus.set_panning(2, -1.0).unwrap();
    bus.set_master_volume(1.0).unwrap();
    bus.set_master_panning(0.0).unwrap();

    assert_eq!(
        sent(&transport),
        vec![
            vec![0xB2, 0x07, 127],
            vec![0xB2, 0x0A, 1],
            vec![0xF0, 0x7F, 0x7F, 0x04, 0x01, 0x7F, 0x7F, 0xF7],
            vec![0xF0, 0x7F, 0x7F, 0x04, 0x02, 0x00, 0x40, 0xF7],
        ]
    );
    assert_eq!(bus.channel_mix(2).panning, -1.0);
    assert_eq!(bus.master().volume, 1.0);
}

#[test]
fn test_send_note_updates_output_monitor() {
    let (transport, bus, port) = open_bus(BusMode::Output);
    bus.send_note(0, 60, 127).unwrap();
    assert_eq!(transport.sounding_notes(), vec![(port, 0, 60)]);
    let monitor = bus.monitor_out().unwrap();
    assert_eq!(monitor.count(), 1);
    assert_eq!(monitor.peek(), 1.0);
}

#[test]
fn test_input_bus_cannot_send() {
    let (_transport, bus, _port) = open_bus(BusMode::Input);
    assert!(bus.monitor_out().is_none());
    assert!(bus.monitor_in().is_some());
    assert!(matches!(
        bus.set_controller(0, 7, 100),
        Err(MidiError::SendError(_))
    ));
}

#[test]
fn test_malformed_sysex_rejected() {
    let (_transport, bus, _port) = open_bus(BusMode::Output);
    assert!(bus.send_sysex(&[0xF0, 0x7E, 0x01]).is_err());
    assert!(bus.send_sysex(&[0xF0, 0x7E, 0x01, 0xF7]).is_ok());
}

#[test]
fn test_shut_off_and_close() {
    let (transport, mut bus, _port) = open_bus(BusMode::Output);
    bus.shut_off(false);
    assert_eq!(transport.deliveries().len(), 48);
    assert!(bus.is_open());

    bus.shut_off(true);
    assert!(!bus.is_open());
    bus.close();
    assert_eq!(transport.port_count(), 0);
}

#[test]
fn test_mode_change_requires_closed_bus() {
    let (_transport, mut bus, _port) = open_bus(BusMode::Output);
    assert!(bus.set_mode(BusMode::Duplex).is_err());
    bus.close();
    bus.set_mode(BusMode::Duplex).unwrap();
    assert!(bus.monitor_in().is_some());
    assert!(bus.monitor_out().is_some());
}

#[test]
fn test_update_connects_with_zero_endpoints() {
    let (_transport, bus, _port) = open_bus(BusMode::Duplex);
    let mut list = ConnectList::new();
    assert_eq!(bus.update_connects(BusMode::Input, &mut list, true), 0);
    assert_eq!(bus.update_connects(BusMode::Output, &mut list, true), 0);
    assert_eq!(bus.update_connects(BusMode::Output, &mut list, false), 0);
    assert!(list.is_empty());
}

#[test]
fn test_update_connects_refreshes_from_transport() {
    let (transport, bus, port) = open_bus(BusMode::Output);
    transport.add_endpoint("Synth", BusMode::Input);
    transport.connect(port, BusMode::Output, "Synth").unwrap();

    let mut list = ConnectList::new();
    assert_eq!(bus.update_connects(BusMode::Output, &mut list, false), 1);
    assert_eq!(
        list,
        vec![ConnectItem {
            endpoint: "Synth".to_string(),
            connected: true,
        }]
    );
}

#[test]
fn test_bus_element_round_trip() {
    let transport = Arc::new(LoopbackTransport::new());
    let mut bus = Bus::new(transport.clone(), "Master", BusMode::Duplex, true, 64);
    bus.set_patch(9, "Drums", Some(BankSelMethod::LsbOnly), Some(3), Some(0))
        .unwrap();
    bus.add_connect(BusMode::Input, "Keyboard");
    bus.add_connect(BusMode::Output, "Synth");

    let element = bus.save_element();
    assert_eq!(element.attr("mode"), Some("duplex"));

    let mut restored = Bus::new(transport, "Master", BusMode::Duplex, false, 64);
    restored.load_element(&element).unwrap();
    assert!(restored.is_passthru());
    assert_eq!(restored.patch(9).instrument_name, "Drums");
    assert_eq!(restored.patch(9).bank_sel_method, Some(BankSelMethod::LsbOnly));
    assert_eq!(restored.inputs()[0].endpoint, "Keyboard");
    assert_eq!(restored.save_element(), element);
}
