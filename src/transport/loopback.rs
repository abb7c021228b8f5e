use super::{PortId, RawEvent, SequencerTransport, SoftQueue};
use crate::bus::BusMode;
use crate::error::{MidiError, Result};
use crossbeam::channel::{unbounded, Receiver, Sender};
use log::debug;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// One message handed to the transport for output
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub port: PortId,
    pub data: Vec<u8>,
    pub tick: u64,
}

#[derive(Debug)]
struct LoopPort {
    name: String,
    mode: BusMode,
    inputs: Vec<String>,
    outputs: Vec<String>,
}

#[derive(Debug, Default)]
struct LoopState {
    client: Option<String>,
    next_port: u32,
    ports: HashMap<PortId, LoopPort>,
    endpoints: Vec<(String, BusMode)>,
    loopbacks: HashMap<PortId, Vec<PortId>>,
    deliveries: Vec<Delivery>,
}

/// In-memory transport. Records every delivery, can route a port's output
/// back into another port's input, and exposes a set of fake external
/// endpoints for connection management.
pub struct LoopbackTransport {
    reachable: bool,
    queue: SoftQueue,
    state: Mutex<LoopState>,
    input_tx: Sender<RawEvent>,
    input_rx: Receiver<RawEvent>,
}

impl LoopbackTransport {
    /// Transport driven by a manual queue clock
    pub fn new() -> Self {
        Self::with_queue(SoftQueue::manual(), true)
    }

    /// Transport whose queue follows wall-clock time
    pub fn realtime() -> Self {
        Self::with_queue(SoftQueue::wall(), true)
    }

    /// Transport whose client can never be opened
    pub fn unreachable() -> Self {
        Self::with_queue(SoftQueue::manual(), false)
    }

    fn with_queue(queue: SoftQueue, reachable: bool) -> Self {
        let (input_tx, input_rx) = unbounded();
        Self {
            reachable,
            queue,
            state: Mutex::new(LoopState::default()),
            input_tx,
            input_rx,
        }
    }

    fn state(&self) -> MutexGuard<'_, LoopState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a fake external endpoint
    pub fn add_endpoint(&self, name: &str, mode: BusMode) {
        self.state().endpoints.push((name.to_string(), mode));
    }

    /// Routes everything sent on `from` into the input of `to`
    pub fn loopback(&self, from: PortId, to: PortId) {
        self.state().loopbacks.entry(from).or_default().push(to);
    }

    /// Simulates inbound traffic on `port`
    pub fn inject(&self, port: PortId, data: &[u8]) {
        let _ = self.input_tx.send(RawEvent {
            port,
            data: data.to_vec(),
            tick: self.queue.tick(),
        });
    }

    /// Advances the manual queue clock
    pub fn advance(&self, ticks: u64) {
        self.queue.advance(ticks);
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.state().deliveries.clone()
    }

    pub fn clear_deliveries(&self) {
        self.state().deliveries.clear();
    }

    pub fn port_name(&self, port: PortId) -> Option<String> {
        self.state().ports.get(&port).map(|p| p.name.clone())
    }

    pub fn port_count(&self) -> usize {
        self.state().ports.len()
    }

    /// Notes left sounding by the delivered stream, as
    /// (port, channel, note) triples.
    pub fn sounding_notes(&self) -> Vec<(PortId, u8, u8)> {
        let mut sounding: HashSet<(PortId, u8, u8)> = HashSet::new();
        for delivery in &self.state().deliveries {
            let data = &delivery.data;
            if data.len() < 3 {
                continue;
            }
            let channel = data[0] & 0x0F;
            match data[0] & 0xF0 {
                0x90 if data[2] > 0 => {
                    sounding.insert((delivery.port, channel, data[1]));
                }
                0x90 | 0x80 => {
                    sounding.remove(&(delivery.port, channel, data[1]));
                }
                0xB0 if data[1] == 0x78 || data[1] == 0x7B => {
                    sounding.retain(|(port, ch, _)| *port != delivery.port || *ch != channel);
                }
                _ => {}
            }
        }
        let mut notes: Vec<_> = sounding.into_iter().collect();
        notes.sort();
        notes
    }
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SequencerTransport for LoopbackTransport {
    fn open_client(&self, name: &str) -> Result<()> {
        if !self.reachable {
            return Err(MidiError::ConnectionError(
                "loopback sequencer unreachable".to_string(),
            ));
        }
        self.state().client = Some(name.to_string());
        Ok(())
    }

    fn close_client(&self) {
        let mut state = self.state();
        state.client = None;
        state.ports.clear();
        state.loopbacks.clear();
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
            LoopPort {
                name: name.to_string(),
                mode,
                inputs: Vec::new(),
                outputs: Vec::new(),
            },
        );
        debug!("Loopback port {:?} created for '{}'", port, name);
        Ok(port)
    }

    fn delete_port(&self, port: PortId) {
        let mut state = self.state();
        state.ports.remove(&port);
        state.loopbacks.remove(&port);
    }

    fn endpoints(&self, mode: BusMode) -> Vec<String> {
        // An input port reads from endpoints that can output, and vice versa.
        self.state()
            .endpoints
            .iter()
            .filter(|(_, endpoint_mode)| match mode {
                BusMode::Input => endpoint_mode.is_output(),
                BusMode::Output => endpoint_mode.is_input(),
                BusMode::Duplex => true,
            })
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn connect(&self, port: PortId, mode: BusMode, endpoint: &str) -> Result<()> {
        if !self.endpoints(mode).iter().any(|e| e == endpoint) {
            return Err(MidiError::ConnectionError(format!(
                "endpoint '{}' not found",
                endpoint
            )));
        }
        let mut state = self.state();
        let loop_port = state
            .ports
            .get_mut(&port)
            .ok_or_else(|| MidiError::ConnectionError(format!("unknown port {:?}", port)))?;
        let list = match mode {
            BusMode::Input if loop_port.mode.is_input() => &mut loop_port.inputs,
            BusMode::Output if loop_port.mode.is_output() => &mut loop_port.outputs,
            _ => {
                return Err(MidiError::ConnectionError(format!(
                    "port {:?} cannot connect as {:?}",
                    port, mode
                )))
            }
        };
        if !list.iter().any(|e| e == endpoint) {
            list.push(endpoint.to_string());
        }
        Ok(())
    }

    fn disconnect(&self, port: PortId, mode: BusMode, endpoint: &str) -> Result<()> {
        let mut state = self.state();
        let loop_port = state
            .ports
            .get_mut(&port)
            .ok_or_else(|| MidiError::ConnectionError(format!("unknown port {:?}", port)))?;
        match mode {
            BusMode::Input => loop_port.inputs.retain(|e| e != endpoint),
            BusMode::Output => loop_port.outputs.retain(|e| e != endpoint),
            BusMode::Duplex => {
                loop_port.inputs.retain(|e| e != endpoint);
                loop_port.outputs.retain(|e| e != endpoint);
            }
        }
        Ok(())
    }

    fn connections(&self, port: PortId, mode: BusMode) -> Vec<String> {
        let state = self.state();
        match state.ports.get(&port) {
            Some(loop_port) => match mode {
                BusMode::Input => loop_port.inputs.clone(),
                BusMode::Output => loop_port.outputs.clone(),
                BusMode::Duplex => {
                    let mut all = loop_port.inputs.clone();
                    all.extend(loop_port.outputs.iter().cloned());
                    all
                }
            },
            None => Vec::new(),
        }
    }

    fn send(&self, port: PortId, data: &[u8]) -> Result<()> {
        let tick = self.queue.tick();
        let mut state = self.state();
        if !state.ports.contains_key(&port) {
            return Err(MidiError::SendError(format!("unknown port {:?}", port)));
        }
        state.deliveries.push(Delivery {
            port,
            data: data.to_vec(),
            tick,
        });
        if let Some(targets) = state.loopbacks.get(&port) {
            for target in targets {
                let _ = self.input_tx.send(RawEvent {
                    port: *target,
                    data: data.to_vec(),
                    tick,
                });
            }
        }
        Ok(())
    }

    fn input(&self) -> Receiver<RawEvent> {
        self.input_rx.clone()
    }

    fn alloc_queue(&self) -> Result<()> {
        if self.state().client.is_none() {
            return Err(MidiError::ConnectionError(
                "cannot allocate a queue without a client".to_string(),
            ));
        }
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_port_requires_client() {
        let transport = LoopbackTransport::new();
        assert!(transport.create_port("Master", BusMode::Duplex).is_err());
        transport.open_client("test").unwrap();
        assert!(transport.create_port("Master", BusMode::Duplex).is_ok());
    }

    #[test]
    fn test_unreachable_client() {
        let transport = LoopbackTransport::unreachable();
        assert!(matches!(
            transport.open_client("test"),
            Err(MidiError::ConnectionError(_))
        ));
    }

    #[test]
    fn test_loopback_routes_output_to_input() {
        let transport = LoopbackTransport::new();
        transport.open_client("test").unwrap();
        let out = transport.create_port("out", BusMode::Output).unwrap();
        let inp = transport.create_port("in", BusMode::Input).unwrap();
        transport.loopback(out, inp);

        transport.send(out, &[0x90, 60, 100]).unwrap();
        let raw = transport.input().try_recv().unwrap();
        assert_eq!(raw.port, inp);
        assert_eq!(raw.data, vec![0x90, 60, 100]);
    }

    #[test]
    fn test_sounding_notes_tracks_all_notes_off() {
        let transport = LoopbackTransport::new();
        transport.open_client("test").unwrap();
        let port = transport.create_port("out", BusMode::Output).unwrap();
        transport.send(port, &[0x90, 60, 100]).unwrap();
        transport.send(port, &[0x91, 62, 100]).unwrap();
        transport.send(port, &[0x80, 60, 0]).unwrap();
        assert_eq!(transport.sounding_notes(), vec![(port, 1, 62)]);

        transport.send(port, &[0xB1, 0x7B, 0]).unwrap();
        assert!(transport.sounding_notes().is_empty());
    }

    #[test]
    fn test_connect_unknown_endpoint_fails() {
        let transport = LoopbackTransport::new();
        transport.open_client("test").unwrap();
        let port = transport.create_port("out", BusMode::Output).unwrap();
        transport.add_endpoint("Synth", BusMode::Input);
        assert!(transport.connect(port, BusMode::Output, "Synth").is_ok());
        assert!(transport.connect(port, BusMode::Output, "Drums").is_err());
        assert_eq!(transport.connections(port, BusMode::Output), vec!["Synth"]);
    }
}
