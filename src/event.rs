//! Normalized MIDI events and their wire encoding

use crate::error::{MidiError, Result};

/// Opaque handle to a track owned by the caller's timeline model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackId(pub u32);

/// What the engine needs to know about a track to schedule its events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackRef {
    pub id: TrackId,
    pub bus: crate::bus::BusId,
    pub channel: u8,
}

impl TrackRef {
    pub fn new(id: TrackId, bus: crate::bus::BusId, channel: u8) -> Self {
        Self {
            id,
            bus,
            channel: channel & 0x0F,
        }
    }
}

/// Channel message payload
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    NoteOn { note: u8, velocity: u8 },
    NoteOff { note: u8, velocity: u8 },
    KeyPress { note: u8, pressure: u8 },
    Controller { param: u8, value: u8 },
    ProgramChange { program: u8 },
    ChannelPressure { pressure: u8 },
    /// -8192 (full down) to +8191 (full up)
    PitchBend { value: i16 },
    /// Complete message including the F0/F7 framing bytes
    Sysex(Vec<u8>),
}

impl EventKind {
    /// Scales velocity-bearing payloads. A sounding note-on never drops to
    /// velocity 0, which receivers would read as a note-off.
    pub fn apply_gain(&mut self, gain: f32) {
        if (gain - 1.0).abs() < f32::EPSILON {
            return;
        }
        match self {
            EventKind::NoteOn { velocity, .. } if *velocity > 0 => {
                *velocity = scale_7bit(*velocity, gain).max(1);
            }
            EventKind::KeyPress { pressure, .. } => {
                *pressure = scale_7bit(*pressure, gain);
            }
            _ => {}
        }
    }

    /// Velocity or pressure carried by the payload, if any
    pub fn level(&self) -> Option<u8> {
        match self {
            EventKind::NoteOn { velocity, .. } => Some(*velocity),
            EventKind::KeyPress { pressure, .. } => Some(*pressure),
            EventKind::ChannelPressure { pressure } => Some(*pressure),
            _ => None,
        }
    }

    pub fn is_note_off(&self) -> bool {
        matches!(
            self,
            EventKind::NoteOff { .. } | EventKind::NoteOn { velocity: 0, .. }
        )
    }
}

fn scale_7bit(value: u8, gain: f32) -> u8 {
    (value as f32 * gain.max(0.0)).round().clamp(0.0, 127.0) as u8
}

/// A timestamped MIDI message on its way into or out of the engine
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub channel: u8,
    pub kind: EventKind,
    /// Song-relative time in frames
    pub time: u64,
    pub track: Option<TrackId>,
    pub gain: f32,
}

impl Event {
    pub fn new(channel: u8, kind: EventKind, time: u64) -> Self {
        Self {
            channel: channel & 0x0F,
            kind,
            time,
            track: None,
            gain: 1.0,
        }
    }

    pub fn note_on(channel: u8, note: u8, velocity: u8, time: u64) -> Self {
        Self::new(channel, EventKind::NoteOn { note, velocity }, time)
    }

    pub fn note_off(channel: u8, note: u8, time: u64) -> Self {
        Self::new(channel, EventKind::NoteOff { note, velocity: 0 }, time)
    }

    pub fn controller(channel: u8, param: u8, value: u8, time: u64) -> Self {
        Self::new(channel, EventKind::Controller { param, value }, time)
    }

    /// Encodes the event as raw MIDI bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let channel = self.channel & 0x0F;
        match &self.kind {
            EventKind::NoteOn { note, velocity } => {
                vec![0x90 | channel, note & 0x7F, velocity & 0x7F]
            }
            EventKind::NoteOff { note, velocity } => {
                vec![0x80 | channel, note & 0x7F, velocity & 0x7F]
            }
            EventKind::KeyPress { note, pressure } => {
                vec![0xA0 | channel, note & 0x7F, pressure & 0x7F]
            }
            EventKind::Controller { param, value } => {
                vec![0xB0 | channel, param & 0x7F, value & 0x7F]
            }
            EventKind::ProgramChange { program } => vec![0xC0 | channel, program & 0x7F],
            EventKind::ChannelPressure { pressure } => vec![0xD0 | channel, pressure & 0x7F],
            EventKind::PitchBend { value } => {
                let raw = (*value as i32 + 8192).clamp(0, 0x3FFF) as u16;
                vec![0xE0 | channel, (raw & 0x7F) as u8, (raw >> 7) as u8]
            }
            EventKind::Sysex(data) => data.clone(),
        }
    }

    /// Decodes raw MIDI bytes. System real-time and common messages other
    /// than SysEx are not events the engine routes and are rejected too.
    pub fn decode(data: &[u8], time: u64) -> Result<Event> {
        let status = *data
            .first()
            .ok_or_else(|| MidiError::ProtocolDecodeError("empty message".to_string()))?;

        if status == 0xF0 {
            if data.len() < 2 || data[data.len() - 1] != 0xF7 {
                return Err(MidiError::ProtocolDecodeError(
                    "unterminated SysEx".to_string(),
                ));
            }
            return Ok(Event::new(0, EventKind::Sysex(data.to_vec()), time));
        }

        let channel = status & 0x0F;
        let data_byte = |i: usize| -> Result<u8> {
            match data.get(i) {
                Some(b) if *b < 0x80 => Ok(*b),
                Some(b) => Err(MidiError::ProtocolDecodeError(format!(
                    "unexpected status byte {:#04X} in data",
                    b
                ))),
                None => Err(MidiError::ProtocolDecodeError(format!(
                    "truncated message with status {:#04X}",
                    status
                ))),
            }
        };

        let kind = match status & 0xF0 {
            0x90 => {
                let (note, velocity) = (data_byte(1)?, data_byte(2)?);
                if velocity == 0 {
                    EventKind::NoteOff { note, velocity: 0 }
                } else {
                    EventKind::NoteOn { note, velocity }
                }
            }
            0x80 => EventKind::NoteOff {
                note: data_byte(1)?,
                velocity: data_byte(2)?,
            },
            0xA0 => EventKind::KeyPress {
                note: data_byte(1)?,
                pressure: data_byte(2)?,
            },
            0xB0 => EventKind::Controller {
                param: data_byte(1)?,
                value: data_byte(2)?,
            },
            0xC0 => EventKind::ProgramChange {
                program: data_byte(1)?,
            },
            0xD0 => EventKind::ChannelPressure {
                pressure: data_byte(1)?,
            },
            0xE0 => {
                let raw = (data_byte(1)? as i16) | ((data_byte(2)? as i16) << 7);
                EventKind::PitchBend { value: raw - 8192 }
            }
            _ => {
                return Err(MidiError::ProtocolDecodeError(format!(
                    "unsupported status {:#04X}",
                    status
                )))
            }
        };

        Ok(Event::new(channel, kind, time))
    }
}
