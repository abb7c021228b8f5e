//! Buses: named transport ports with per-channel state

use crate::document::Element;
use crate::error::{MidiError, Result};
use crate::event::Event;
use crate::monitor::{Monitor, MonitorDirection};
use crate::patch::{BankSelMethod, Patch};
use crate::transport::{PortId, SequencerTransport};
use crossbeam::queue::ArrayQueue;
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Index of a bus inside the engine's bus table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BusId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusMode {
    Input,
    Output,
    Duplex,
}

impl BusMode {
    pub fn is_input(self) -> bool {
        matches!(self, BusMode::Input | BusMode::Duplex)
    }

    pub fn is_output(self) -> bool {
        matches!(self, BusMode::Output | BusMode::Duplex)
    }
}

impl fmt::Display for BusMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BusMode::Input => "input",
            BusMode::Output => "output",
            BusMode::Duplex => "duplex",
        };
        f.write_str(name)
    }
}

impl FromStr for BusMode {
    type Err = MidiError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "input" => Ok(BusMode::Input),
            "output" => Ok(BusMode::Output),
            "duplex" => Ok(BusMode::Duplex),
            other => Err(MidiError::ConfigurationError(format!(
                "unknown bus mode '{}'",
                other
            ))),
        }
    }
}

/// A configured external endpoint and whether it is currently connected
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectItem {
    pub endpoint: String,
    pub connected: bool,
}

impl ConnectItem {
    pub fn new(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            connected: false,
        }
    }
}

pub type ConnectList = Vec<ConnectItem>;

/// An event waiting on a bus's output path
#[derive(Debug, Clone)]
pub(crate) struct Scheduled {
    pub tick: u64,
    pub seq: u64,
    pub epoch: u64,
    pub event: Event,
}

/// Live mixer state mirrored to the receiving device
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MixState {
    pub volume: f32,
    pub panning: f32,
}

impl Default for MixState {
    fn default() -> Self {
        Self {
            volume: 1.0,
            panning: 0.0,
        }
    }
}

pub struct Bus {
    name: String,
    mode: BusMode,
    passthru: bool,
    port: Option<PortId>,
    transport: Arc<dyn SequencerTransport>,
    patches: BTreeMap<u8, Patch>,
    monitor_in: Option<Arc<Monitor>>,
    monitor_out: Option<Arc<Monitor>>,
    inputs: ConnectList,
    outputs: ConnectList,
    master: MixState,
    channels: BTreeMap<u8, MixState>,
    queue: Arc<ArrayQueue<Scheduled>>,
}

impl Bus {
    pub fn new(
        transport: Arc<dyn SequencerTransport>,
        name: &str,
        mode: BusMode,
        passthru: bool,
        queue_capacity: usize,
    ) -> Self {
        let mut bus = Self {
            name: name.to_string(),
            mode,
            passthru,
            port: None,
            transport,
            patches: BTreeMap::new(),
            monitor_in: None,
            monitor_out: None,
            inputs: ConnectList::new(),
            outputs: ConnectList::new(),
            master: MixState::default(),
            channels: BTreeMap::new(),
            queue: Arc::new(ArrayQueue::new(queue_capacity.max(1))),
        };
        bus.update_bus_mode();
        bus
    }

    // Monitors follow the mode.
    fn update_bus_mode(&mut self) {
        self.monitor_in = self
            .mode
            .is_input()
            .then(|| Arc::new(Monitor::new(MonitorDirection::Input)));
        self.monitor_out = self
            .mode
            .is_output()
            .then(|| Arc::new(Monitor::new(MonitorDirection::Output)));
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> BusMode {
        self.mode
    }

    /// Mode may only change while the bus is closed
    pub fn set_mode(&mut self, mode: BusMode) -> Result<()> {
        if self.port.is_some() {
            return Err(MidiError::ConfigurationError(format!(
                "bus '{}' must be closed to change its mode",
                self.name
            )));
        }
        if self.mode != mode {
            self.mode = mode;
            self.update_bus_mode();
        }
        Ok(())
    }

    pub fn is_passthru(&self) -> bool {
        self.passthru
    }

    pub fn set_passthru(&mut self, passthru: bool) {
        self.passthru = passthru;
    }

    pub fn port(&self) -> Option<PortId> {
        self.port
    }

    pub fn is_open(&self) -> bool {
        self.port.is_some()
    }

    pub fn monitor_in(&self) -> Option<&Arc<Monitor>> {
        self.monitor_in.as_ref()
    }

    pub fn monitor_out(&self) -> Option<&Arc<Monitor>> {
        self.monitor_out.as_ref()
    }

    pub(crate) fn output_queue(&self) -> &Arc<ArrayQueue<Scheduled>> {
        &self.queue
    }

    pub fn inputs(&self) -> &ConnectList {
        &self.inputs
    }

    pub fn outputs(&self) -> &ConnectList {
        &self.outputs
    }

    /// Adds an endpoint to the configured connections of one side
    pub fn add_connect(&mut self, mode: BusMode, endpoint: &str) {
        let list = match mode {
            BusMode::Input => &mut self.inputs,
            _ => &mut self.outputs,
        };
        if !list.iter().any(|item| item.endpoint == endpoint) {
            list.push(ConnectItem::new(endpoint));
        }
    }

    pub fn open(&mut self) -> Result<()> {
        if self.port.is_some() {
            return Ok(());
        }
        let port = self.transport.create_port(&self.name, self.mode)?;
        self.port = Some(port);
        for item in self.inputs.iter_mut().chain(self.outputs.iter_mut()) {
            item.connected = false;
        }
        info!("Bus '{}' opened ({})", self.name, self.mode);
        Ok(())
    }

    pub fn close(&mut self) {
        if let Some(port) = self.port.take() {
            self.transport.delete_port(port);
            for item in self.inputs.iter_mut().chain(self.outputs.iter_mut()) {
                item.connected = false;
            }
            info!("Bus '{}' closed", self.name);
        }
    }

    fn send(&self, data: &[u8]) -> Result<()> {
        let port = self
            .port
            .ok_or_else(|| MidiError::SendError(format!("bus '{}' is not open", self.name)))?;
        if !self.mode.is_output() {
            return Err(MidiError::SendError(format!(
                "bus '{}' has no output",
                self.name
            )));
        }
        self.transport.send(port, data)
    }

    /// Silences every channel: all-sound-off, controller reset and
    /// all-notes-off, optionally followed by `close()`.
    pub fn shut_off(&mut self, also_close: bool) {
        if self.port.is_some() && self.mode.is_output() {
            debug!("Shutting off bus '{}'", self.name);
            for channel in 0..16u8 {
                for param in [0x78, 0x79, 0x7B] {
                    if let Err(e) = self.send(&[0xB0 | channel, param, 0]) {
                        warn!("Shut-off on bus '{}' failed: {}", self.name, e);
                        break;
                    }
                }
            }
        }
        if also_close {
            self.close();
        }
    }

    /// Patch entry of `channel & 0x0F`
    pub fn patch(&mut self, channel: u8) -> &mut Patch {
        self.patches.entry(channel & 0x0F).or_default()
    }

    pub fn patches(&self) -> impl Iterator<Item = (u8, &Patch)> {
        self.patches.iter().map(|(channel, patch)| (*channel, patch))
    }

    /// Stores the patch and sends the bank/program selection right away
    pub fn set_patch(
        &mut self,
        channel: u8,
        instrument_name: &str,
        bank_sel_method: Option<BankSelMethod>,
        bank: Option<u16>,
        prog: Option<u8>,
    ) -> Result<()> {
        let channel = channel & 0x0F;
        let patch = self.patch(channel);
        patch.instrument_name = instrument_name.to_string();
        patch.bank_sel_method = bank_sel_method;
        patch.bank = bank;
        patch.prog = prog;
        let messages = patch.select_messages(channel);

        if self.port.is_none() {
            return Ok(());
        }
        for message in messages {
            self.send(&message)?;
        }
        Ok(())
    }

    pub fn set_controller(&self, channel: u8, controller: u8, value: u8) -> Result<()> {
        self.send(&[0xB0 | (channel & 0x0F), controller & 0x7F, value & 0x7F])
    }

    /// Note-on, or note-off when `velocity` is zero
    pub fn send_note(&self, channel: u8, note: u8, velocity: u8) -> Result<()> {
        self.send(&[0x90 | (channel & 0x0F), note & 0x7F, velocity & 0x7F])?;
        if velocity > 0 {
            if let Some(monitor) = &self.monitor_out {
                monitor.update(velocity, 1.0);
            }
        }
        Ok(())
    }

    pub fn send_sysex(&self, sysex: &[u8]) -> Result<()> {
        if sysex.len() < 2 || sysex[0] != 0xF0 || sysex[sysex.len() - 1] != 0xF7 {
            return Err(MidiError::SendError("malformed SysEx".to_string()));
        }
        self.send(sysex)
    }

    pub fn master(&self) -> MixState {
        self.master
    }

    pub fn channel_mix(&self, channel: u8) -> MixState {
        self.channels
            .get(&(channel & 0x0F))
            .copied()
            .unwrap_or_default()
    }

    /// Universal master volume, `volume` in 0.0..=1.0
    pub fn set_master_volume(&mut self, volume: f32) -> Result<()> {
        let volume = volume.clamp(0.0, 1.0);
        self.master.volume = volume;
        let value = (volume * 16383.0).round() as u16;
        self.send_universal_device_control(0x01, value)
    }

    /// Universal master balance, `panning` in -1.0..=1.0
    pub fn set_master_panning(&mut self, panning: f32) -> Result<()> {
        let panning = panning.clamp(-1.0, 1.0);
        self.master.panning = panning;
        let value = ((panning + 1.0) * 8191.5).round() as u16;
        self.send_universal_device_control(0x02, value)
    }

    fn send_universal_device_control(&self, sub_id: u8, value: u16) -> Result<()> {
        let value = value.min(0x3FFF);
        self.send(&[
            0xF0,
            0x7F,
            0x7F,
            0x04,
            sub_id,
            (value & 0x7F) as u8,
            (value >> 7) as u8,
            0xF7,
        ])
    }

    /// Channel volume (CC#7), `volume` in 0.0..=1.0
    pub fn set_volume(&mut self, channel: u8, volume: f32) -> Result<()> {
        let channel = channel & 0x0F;
        let volume = volume.clamp(0.0, 1.0);
        self.channels.entry(channel).or_default().volume = volume;
        self.set_controller(channel, 0x07, (volume * 127.0).round() as u8)
    }

    /// Channel pan (CC#10), `panning` in -1.0..=1.0
    pub fn set_panning(&mut self, channel: u8, panning: f32) -> Result<()> {
        let channel = channel & 0x0F;
        let panning = panning.clamp(-1.0, 1.0);
        self.channels.entry(channel).or_default().panning = panning;
        let value = (64.0 + panning * 63.0).round() as u8;
        self.set_controller(channel, 0x0A, value)
    }

    /// With `connect`, tries to establish every not yet connected endpoint
    /// in `list` and returns how many succeeded. Without it, refills `list`
    /// from the transport's current connections and returns their number.
    pub fn update_connects(&self, mode: BusMode, list: &mut ConnectList, connect: bool) -> usize {
        let Some(port) = self.port else {
            return 0;
        };
        let side = match mode {
            BusMode::Input if self.mode.is_input() => BusMode::Input,
            BusMode::Output if self.mode.is_output() => BusMode::Output,
            _ => return 0,
        };

        if !connect {
            list.clear();
            list.extend(
                self.transport
                    .connections(port, side)
                    .into_iter()
                    .map(|endpoint| ConnectItem {
                        endpoint,
                        connected: true,
                    }),
            );
            return list.len();
        }

        let mut attempts = 0;
        for item in list.iter_mut().filter(|item| !item.connected) {
            match self.transport.connect(port, side, &item.endpoint) {
                Ok(()) => {
                    item.connected = true;
                    attempts += 1;
                }
                Err(e) => warn!(
                    "Bus '{}' could not connect to '{}': {}",
                    self.name, item.endpoint, e
                ),
            }
        }
        attempts
    }

    /// Connects both sides to their configured endpoints. Returns the
    /// number of successful attempts and the endpoints that failed.
    pub fn connect_configured(&mut self) -> (usize, Vec<String>) {
        let mut inputs = std::mem::take(&mut self.inputs);
        let mut outputs = std::mem::take(&mut self.outputs);
        let attempts = self.update_connects(BusMode::Input, &mut inputs, true)
            + self.update_connects(BusMode::Output, &mut outputs, true);
        self.inputs = inputs;
        self.outputs = outputs;

        let failed = if self.port.is_some() {
            self.inputs
                .iter()
                .filter(|_| self.mode.is_input())
                .chain(self.outputs.iter().filter(|_| self.mode.is_output()))
                .filter(|item| !item.connected)
                .map(|item| item.endpoint.clone())
                .collect()
        } else {
            Vec::new()
        };
        (attempts, failed)
    }

    pub fn save_element(&self) -> Element {
        let mut element = Element::new("bus")
            .with_attr("name", &self.name)
            .with_attr("mode", &self.mode.to_string())
            .with_attr("passthru", &self.passthru.to_string());

        let mut midi_map = Element::new("midi-map");
        for (channel, patch) in self.patches().filter(|(_, patch)| !patch.is_unset()) {
            let mut entry = Element::new("patch").with_attr("channel", &channel.to_string());
            if !patch.instrument_name.is_empty() {
                entry.set_attr("instrument", &patch.instrument_name);
            }
            if let Some(method) = patch.bank_sel_method {
                entry.set_attr("bank-sel-method", &method.index().to_string());
            }
            if let Some(bank) = patch.bank {
                entry.set_attr("bank", &bank.to_string());
            }
            if let Some(prog) = patch.prog {
                entry.set_attr("prog", &prog.to_string());
            }
            midi_map.push(entry);
        }
        element.push(midi_map);

        for (tag, list) in [("inputs", &self.inputs), ("outputs", &self.outputs)] {
            let mut ports = Element::new(tag);
            for item in list {
                ports.push(Element::new("port").with_text(&item.endpoint));
            }
            element.push(ports);
        }

        element
    }

    /// Restores passthru, patches and connection lists. Name and mode are
    /// read by whoever creates the bus.
    pub fn load_element(&mut self, element: &Element) -> Result<()> {
        if let Some(passthru) = element.attr_parse::<bool>("passthru")? {
            self.passthru = passthru;
        }

        if let Some(midi_map) = element.child("midi-map") {
            for entry in midi_map.children_named("patch") {
                let channel = entry.attr_parse::<u8>("channel")?.ok_or_else(|| {
                    MidiError::ConfigurationError("patch without channel".to_string())
                })?;
                let bank_sel_method = match entry.attr_parse::<i32>("bank-sel-method")? {
                    Some(index) => Some(BankSelMethod::from_index(index).ok_or_else(|| {
                        MidiError::ConfigurationError(format!(
                            "unknown bank select method {}",
                            index
                        ))
                    })?),
                    None => None,
                };
                let patch = self.patch(channel);
                patch.instrument_name = entry.attr("instrument").unwrap_or_default().to_string();
                patch.bank_sel_method = bank_sel_method;
                patch.bank = entry.attr_parse("bank")?;
                patch.prog = entry.attr_parse("prog")?;
            }
        }

        for (tag, mode) in [("inputs", BusMode::Input), ("outputs", BusMode::Output)] {
            if let Some(ports) = element.child(tag) {
                for port in ports.children_named("port") {
                    if let Some(endpoint) = port.text.as_deref() {
                        self.add_connect(mode, endpoint);
                    }
                }
            }
        }

        Ok(())
    }
}

impl fmt::Debug for Bus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bus")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .field("passthru", &self.passthru)
            .field("port", &self.port)
            .finish()
    }
}

/// Indexed bus container owned by the engine. Removed buses leave a hole
/// so outstanding `BusId`s never alias a different bus.
#[derive(Debug, Default)]
pub(crate) struct BusTable {
    slots: Vec<Option<Bus>>,
    pub metro: Option<BusId>,
    pub control_in: Option<BusId>,
    pub control_out: Option<BusId>,
}

impl BusTable {
    pub fn insert(&mut self, bus: Bus) -> BusId {
        self.slots.push(Some(bus));
        BusId(self.slots.len() - 1)
    }

    pub fn remove(&mut self, id: BusId) -> Option<Bus> {
        for special in [&mut self.metro, &mut self.control_in, &mut self.control_out] {
            if *special == Some(id) {
                *special = None;
            }
        }
        self.slots.get_mut(id.0).and_then(Option::take)
    }

    pub fn get(&self, id: BusId) -> Option<&Bus> {
        self.slots.get(id.0).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: BusId) -> Option<&mut Bus> {
        self.slots.get_mut(id.0).and_then(Option::as_mut)
    }

    pub fn iter(&self) -> impl Iterator<Item = (BusId, &Bus)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|bus| (BusId(index), bus)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (BusId, &mut Bus)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_mut().map(|bus| (BusId(index), bus)))
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    pub fn is_special(&self, id: BusId) -> bool {
        [self.metro, self.control_in, self.control_out].contains(&Some(id))
    }

    pub fn find_by_name(&self, name: &str) -> Option<BusId> {
        self.iter().find(|(_, bus)| bus.name() == name).map(|(id, _)| id)
    }

    pub fn find_by_port(&self, port: PortId) -> Option<BusId> {
        self.iter()
            .find(|(_, bus)| bus.port() == Some(port))
            .map(|(id, _)| id)
    }

    /// First ordinary bus that can send
    pub fn default_output(&self) -> Option<BusId> {
        self.iter()
            .find(|(id, bus)| !self.is_special(*id) && bus.mode().is_output())
            .map(|(id, _)| id)
    }

    /// First ordinary bus that can receive
    pub fn default_input(&self) -> Option<BusId> {
        self.iter()
            .find(|(id, bus)| !self.is_special(*id) && bus.mode().is_input())
            .map(|(id, _)| id)
    }
}
