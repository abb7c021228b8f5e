use super::{PortId, RawEvent, SequencerTransport, SoftQueue};
use crate::bus::BusMode;
use crate::error::{MidiError, Result};
use crossbeam::channel::{unbounded, Receiver, Sender};
use log::{debug, error, info};
use midir::{Ignore, MidiInput, MidiInputConnection, MidiOutput, MidiOutputConnection};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

struct MidirPort {
    name: String,
    mode: BusMode,
    inputs: Vec<(String, MidiInputConnection<()>)>,
    outputs: Vec<(String, MidiOutputConnection)>,
}

#[derive(Default)]
struct MidirState {
    client: Option<String>,
    next_port: u32,
    ports: HashMap<PortId, MidirPort>,
}

/// Transport over the platform MIDI API through midir.
///
/// midir has no client-side sequencer queue, so delivery timing comes from
/// a wall-clock [`SoftQueue`] and every bus port fans out to the external
/// ports it is connected to.
pub struct MidirTransport {
    queue: Arc<SoftQueue>,
    state: Mutex<MidirState>,
    input_tx: Sender<RawEvent>,
    input_rx: Receiver<RawEvent>,
}

impl MidirTransport {
    pub fn new() -> Self {
        let (input_tx, input_rx) = unbounded();
        Self {
            queue: Arc::new(SoftQueue::wall()),
            state: Mutex::new(MidirState::default()),
            input_tx,
            input_rx,
        }
    }

    fn state(&self) -> MutexGuard<'_, MidirState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn client(&self) -> Result<String> {
        self.state()
            .client
            .clone()
            .ok_or_else(|| MidiError::ConnectionError("MIDI client not open".to_string()))
    }

    fn connect_output(&self, client: &str, port_name: &str, endpoint: &str) -> Result<MidiOutputConnection> {
        let midi_out = MidiOutput::new(client)
            .map_err(|e| MidiError::ConnectionError(e.to_string()))?;

        let out_ports = midi_out.ports();
        let out_port = out_ports
            .iter()
            .find(|p| midi_out.port_name(p).unwrap_or_default().contains(endpoint))
            .ok_or_else(|| {
                error!("MIDI output device '{}' not found", endpoint);
                MidiError::ConnectionError(format!("output endpoint '{}' not found", endpoint))
            })?
            .clone();

        midi_out
            .connect(&out_port, port_name)
            .map_err(|e| MidiError::ConnectionError(e.to_string()))
    }

    fn connect_input(
        &self,
        client: &str,
        port: PortId,
        port_name: &str,
        endpoint: &str,
    ) -> Result<MidiInputConnection<()>> {
        let mut midi_in =
            MidiInput::new(client).map_err(|e| MidiError::ConnectionError(e.to_string()))?;
        midi_in.ignore(Ignore::None);

        let in_ports = midi_in.ports();
        let in_port = in_ports
            .iter()
            .find(|p| midi_in.port_name(p).unwrap_or_default().contains(endpoint))
            .ok_or_else(|| {
                error!("MIDI input device '{}' not found", endpoint);
                MidiError::ConnectionError(format!("input endpoint '{}' not found", endpoint))
            })?
            .clone();

        let tx = self.input_tx.clone();
        let queue = Arc::clone(&self.queue);
        midi_in
            .connect(
                &in_port,
                port_name,
                move |_stamp, message, _| {
                    let _ = tx.send(RawEvent {
                        port,
                        data: message.to_vec(),
                        tick: queue.tick(),
                    });
                },
                (),
            )
            .map_err(|e| MidiError::ConnectionError(e.to_string()))
    }
}

impl Default for MidirTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SequencerTransport for MidirTransport {
    fn open_client(&self, name: &str) -> Result<()> {
        // Probe the platform API so an absent sequencer fails here.
        MidiOutput::new(name).map_err(|e| MidiError::ConnectionError(e.to_string()))?;
        MidiInput::new(name).map_err(|e| MidiError::ConnectionError(e.to_string()))?;
        info!("MIDI client '{}' opened", name);
        self.state().client = Some(name.to_string());
        Ok(())
    }

    fn close_client(&self) {
        let mut state = self.state();
        state.ports.clear();
        if let Some(name) = state.client.take() {
            info!("MIDI client '{}' closed", name);
        }
    }

    fn client_name(&self) -> Option<String> {
        self.state().client.clone()
    }

    fn create_port(&self, name: &str, mode: BusMode) -> Result<PortId> {
        let mut state = self.state();
        if state.client.is_none() {
            return Err(MidiError::ConnectionError(format!(
                "cannot create port '{}' without a client",
                name
            )));
        }
        let port = PortId(state.next_port);
        state.next_port += 1;
        state.ports.insert(
            port,
            MidirPort {
                name: name.to_string(),
                mode,
                inputs: Vec::new(),
                outputs: Vec::new(),
            },
        );
        debug!("MIDI port {:?} created for '{}' ({:?})", port, name, mode);
        Ok(port)
    }

    fn delete_port(&self, port: PortId) {
        if let Some(midir_port) = self.state().ports.remove(&port) {
            for (_, conn) in midir_port.outputs {
                conn.close();
            }
            for (_, conn) in midir_port.inputs {
                conn.close();
            }
            debug!("MIDI port {:?} deleted", port);
        }
    }

    fn endpoints(&self, mode: BusMode) -> Vec<String> {
        let mut devices = Vec::new();

        if mode.is_input() {
            if let Ok(midi_in) = MidiInput::new("seqengine-list") {
                for port in midi_in.ports() {
                    if let Ok(name) = midi_in.port_name(&port) {
                        devices.push(name);
                    }
                }
            }
        }
        if mode.is_output() {
            if let Ok(midi_out) = MidiOutput::new("seqengine-list") {
                for port in midi_out.ports() {
                    if let Ok(name) = midi_out.port_name(&port) {
                        if !devices.contains(&name) {
                            devices.push(name);
                        }
                    }
                }
            }
        }

        devices
    }

    fn connect(&self, port: PortId, mode: BusMode, endpoint: &str) -> Result<()> {
        let client = self.client()?;
        let (port_name, port_mode) = {
            let state = self.state();
            let midir_port = state
                .ports
                .get(&port)
                .ok_or_else(|| MidiError::ConnectionError(format!("unknown port {:?}", port)))?;
            (midir_port.name.clone(), midir_port.mode)
        };

        match mode {
            BusMode::Output if port_mode.is_output() => {
                let conn = self.connect_output(&client, &port_name, endpoint)?;
                if let Some(midir_port) = self.state().ports.get_mut(&port) {
                    midir_port.outputs.push((endpoint.to_string(), conn));
                }
            }
            BusMode::Input if port_mode.is_input() => {
                let conn = self.connect_input(&client, port, &port_name, endpoint)?;
                if let Some(midir_port) = self.state().ports.get_mut(&port) {
                    midir_port.inputs.push((endpoint.to_string(), conn));
                }
            }
            _ => {
                return Err(MidiError::ConnectionError(format!(
                    "port '{}' cannot connect as {:?}",
                    port_name, mode
                )))
            }
        }

        info!("Connected '{}' to '{}' ({:?})", port_name, endpoint, mode);
        Ok(())
    }

    fn disconnect(&self, port: PortId, mode: BusMode, endpoint: &str) -> Result<()> {
        let mut state = self.state();
        let midir_port = state
            .ports
            .get_mut(&port)
            .ok_or_else(|| MidiError::ConnectionError(format!("unknown port {:?}", port)))?;

        if mode.is_output() {
            if let Some(index) = midir_port.outputs.iter().position(|(e, _)| e == endpoint) {
                let (_, conn) = midir_port.outputs.remove(index);
                conn.close();
            }
        }
        if mode.is_input() {
            if let Some(index) = midir_port.inputs.iter().position(|(e, _)| e == endpoint) {
                let (_, conn) = midir_port.inputs.remove(index);
                conn.close();
            }
        }
        Ok(())
    }

    fn connections(&self, port: PortId, mode: BusMode) -> Vec<String> {
        let state = self.state();
        let Some(midir_port) = state.ports.get(&port) else {
            return Vec::new();
        };
        let mut names = Vec::new();
        if mode.is_input() {
            names.extend(midir_port.inputs.iter().map(|(e, _)| e.clone()));
        }
        if mode.is_output() {
            names.extend(midir_port.outputs.iter().map(|(e, _)| e.clone()));
        }
        names
    }

    fn send(&self, port: PortId, data: &[u8]) -> Result<()> {
        let mut state = self.state();
        let midir_port = state
            .ports
            .get_mut(&port)
            .ok_or_else(|| MidiError::SendError(format!("unknown port {:?}", port)))?;
        for (endpoint, conn) in midir_port.outputs.iter_mut() {
            conn.send(data)
                .map_err(|e| MidiError::SendError(format!("{}: {}", endpoint, e)))?;
        }
        Ok(())
    }

    fn input(&self) -> Receiver<RawEvent> {
        self.input_rx.clone()
    }

    fn alloc_queue(&self) -> Result<()> {
        self.client()?;
        self.queue.alloc();
        Ok(())
    }

    fn free_queue(&self) {
        self.queue.free();
    }

    fn set_queue_tempo(&self, tempo: f32, ticks_per_beat: u16) -> Result<()> {
        self.queue.set_tempo(tempo, ticks_per_beat);
        Ok(())
    }

    fn start_queue(&self) {
        self.queue.start();
    }

    fn stop_queue(&self) {
        self.queue.stop();
    }

    fn continue_queue(&self) {
        self.queue.resume();
    }

    fn queue_tick(&self) -> u64 {
        self.queue.tick()
    }

    fn queue_running(&self) -> bool {
        self.queue.is_running()
    }
}
