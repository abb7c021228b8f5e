use super::metronome::METRO_BUS_NAME;
use super::Engine;
use crate::bus::BusMode;
use crate::config::ClickSettings;
use crate::document::Element;
use crate::error::{MidiError, Result};
use log::info;

const ROLE_METRONOME: &str = "metronome";
const ROLE_CONTROL_IN: &str = "control-in";
const ROLE_CONTROL_OUT: &str = "control-out";

fn click_element(name: &str, click: &ClickSettings) -> Element {
    Element::new(name)
        .with_attr("note", &click.note.to_string())
        .with_attr("velocity", &click.velocity.to_string())
        .with_attr("duration", &click.duration.to_string())
}

fn load_click(element: Option<&Element>, current: ClickSettings) -> Result<ClickSettings> {
    let Some(element) = element else {
        return Ok(current);
    };
    Ok(ClickSettings {
        note: element.attr_parse("note")?.unwrap_or(current.note),
        velocity: element.attr_parse("velocity")?.unwrap_or(current.velocity),
        duration: element.attr_parse("duration")?.unwrap_or(current.duration),
    })
}

impl Engine {
    /// Engine flags, metronome setup and every bus with its patches and
    /// connections
    pub fn save_element(&self) -> Element {
        let mut root = Element::new("midi-engine");

        let metro = self.shared.metro.load();
        let mut metronome = Element::new("metronome")
            .with_attr("enabled", &metro.enabled.to_string())
            .with_attr("use-bus", &metro.use_bus.to_string())
            .with_attr("channel", &metro.channel.to_string());
        metronome.push(click_element("bar", &metro.bar));
        metronome.push(click_element("beat", &metro.beat));
        root.push(metronome);

        root.push(Element::new("control-bus").with_attr("enabled", &self.control_bus.to_string()));

        // Special buses first: loading recreates them before the regular ones.
        let mut list = Element::new("buses");
        let buses = self.shared.buses();
        let special = [
            (buses.metro, ROLE_METRONOME),
            (buses.control_in, ROLE_CONTROL_IN),
            (buses.control_out, ROLE_CONTROL_OUT),
        ];
        for (id, role) in special {
            if let Some(bus) = id.and_then(|id| buses.get(id)) {
                list.push(bus.save_element().with_attr("role", role));
            }
        }
        for (_, bus) in buses.iter().filter(|(id, _)| !buses.is_special(*id)) {
            list.push(bus.save_element());
        }
        root.push(list);

        root
    }

    /// Replaces the current buses and metronome/control setup with the
    /// contents of a `<midi-engine>` element
    pub fn load_element(&mut self, element: &Element) -> Result<()> {
        if element.name != "midi-engine" {
            return Err(MidiError::ConfigurationError(format!(
                "expected <midi-engine>, found <{}>",
                element.name
            )));
        }

        let regular: Vec<_> = {
            let buses = self.shared.buses();
            buses
                .iter()
                .filter(|(id, _)| !buses.is_special(*id))
                .map(|(id, _)| id)
                .collect()
        };
        for id in regular {
            self.remove_bus(id)?;
        }

        if let Some(metronome) = element.child("metronome") {
            if let Some(enabled) = metronome.attr_parse::<bool>("enabled")? {
                self.set_metronome(enabled);
            }
            if let Some(channel) = metronome.attr_parse::<u8>("channel")? {
                self.set_metro_channel(channel);
            }
            let bar = load_click(metronome.child("bar"), self.metro_bar())?;
            self.set_metro_bar(bar.note, bar.velocity, bar.duration);
            let beat = load_click(metronome.child("beat"), self.metro_beat())?;
            self.set_metro_beat(beat.note, beat.velocity, beat.duration);
            self.set_metro_bus(metronome.attr_parse::<bool>("use-bus")?.unwrap_or(false))?;
        }
        if let Some(control) = element.child("control-bus") {
            self.set_control_bus(control.attr_parse::<bool>("enabled")?.unwrap_or(false))?;
        }

        let Some(list) = element.child("buses") else {
            return Ok(());
        };
        for bus_element in list.children_named("bus") {
            let id = match bus_element.attr("role") {
                Some(ROLE_METRONOME) => self.metro_bus(),
                Some(ROLE_CONTROL_IN) => self.shared.buses().control_in,
                Some(ROLE_CONTROL_OUT) => self.shared.buses().control_out,
                _ => {
                    let name = bus_element.attr("name").ok_or_else(|| {
                        MidiError::ConfigurationError("bus without name".to_string())
                    })?;
                    if name == METRO_BUS_NAME && self.metro_bus().is_some() {
                        continue;
                    }
                    let mode = bus_element
                        .attr_parse::<BusMode>("mode")?
                        .unwrap_or(BusMode::Duplex);
                    Some(self.add_bus(name, mode, false)?)
                }
            };
            if let Some(id) = id {
                self.with_bus_mut(id, |bus| bus.load_element(bus_element))
                    .transpose()?;
            }
        }

        self.update_connects();
        info!("MIDI engine state loaded ({} buses)", self.bus_ids().len());
        Ok(())
    }
}
