//! Standard MIDI File export

use crate::bus::BusId;
use crate::engine::EventSink;
use crate::error::{MidiError, Result};
use crate::event::{Event, EventKind, TrackId, TrackRef};
use crate::timescale::TimeScale;
use log::info;
use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

const MAX_VAR_LEN: u32 = 0x0FFF_FFFF;

/// One SMF track: the events of a single bus
#[derive(Debug, Clone, PartialEq)]
pub struct ExportTrack {
    pub name: String,
    pub events: Vec<Event>,
}

/// Collects the feed's events for `[start, end)`, grouped per bus
pub(crate) struct ExportSink {
    start: u64,
    end: u64,
    bus: Option<BusId>,
    events: BTreeMap<BusId, Vec<Event>>,
}

impl ExportSink {
    pub fn new(start: u64, end: u64, bus: Option<BusId>) -> Self {
        Self {
            start,
            end,
            bus,
            events: BTreeMap::new(),
        }
    }

    /// Per-bus events in time order, without those of muted tracks
    pub fn into_events(self, muted: &HashSet<TrackId>) -> Vec<(BusId, Vec<Event>)> {
        self.events
            .into_iter()
            .map(|(bus, mut events)| {
                events.retain(|event| event.track.map_or(true, |id| !muted.contains(&id)));
                events.sort_by_key(|event| event.time);
                (bus, events)
            })
            .filter(|(_, events)| !events.is_empty())
            .collect()
    }
}

impl EventSink for ExportSink {
    fn enqueue(&mut self, track: &TrackRef, mut event: Event, time: u64, gain: f32) {
        if time < self.start || time >= self.end {
            return;
        }
        if self.bus.is_some_and(|bus| bus != track.bus) {
            return;
        }
        event.channel = track.channel & 0x0F;
        event.track = Some(track.id);
        event.time = time;
        event.gain = gain;
        event.kind.apply_gain(gain);
        self.events.entry(track.bus).or_default().push(event);
    }
}

fn write_var_len(out: &mut Vec<u8>, value: u32) {
    let mut value = value.min(MAX_VAR_LEN);
    let mut bytes = vec![(value & 0x7F) as u8];
    value >>= 7;
    while value > 0 {
        bytes.push((value & 0x7F) as u8 | 0x80);
        value >>= 7;
    }
    out.extend(bytes.iter().rev());
}

fn write_chunk(out: &mut impl Write, id: &[u8; 4], data: &[u8]) -> Result<()> {
    out.write_all(id)?;
    out.write_all(&(data.len() as u32).to_be_bytes())?;
    out.write_all(data)?;
    Ok(())
}

fn tempo_track(scale: &TimeScale) -> Vec<u8> {
    let mut data = Vec::new();
    let usecs = (60_000_000.0 / scale.tempo as f64).round() as u32;
    data.extend([0x00, 0xFF, 0x51, 0x03]);
    data.extend(&usecs.to_be_bytes()[1..]);
    // Quarter-note denominator, 24 clocks per click, 8 32nds per quarter.
    data.extend([0x00, 0xFF, 0x58, 0x04, scale.beats_per_bar.min(255) as u8, 0x02, 0x18, 0x08]);
    data.extend([0x00, 0xFF, 0x2F, 0x00]);
    data
}

fn event_track(scale: &TimeScale, start: u64, track: &ExportTrack) -> Vec<u8> {
    let mut data = Vec::new();
    let name = track.name.as_bytes();
    data.extend([0x00, 0xFF, 0x03]);
    write_var_len(&mut data, name.len() as u32);
    data.extend(name);

    let mut last_tick = 0u64;
    for event in &track.events {
        let tick = scale.tick_from_frame(event.time.saturating_sub(start));
        let delta = tick.saturating_sub(last_tick).min(MAX_VAR_LEN as u64) as u32;
        last_tick = tick.max(last_tick);
        write_var_len(&mut data, delta);
        match &event.kind {
            EventKind::Sysex(sysex) => {
                let body = sysex.strip_prefix(&[0xF0]).unwrap_or(sysex);
                data.push(0xF0);
                write_var_len(&mut data, body.len() as u32);
                data.extend(body);
            }
            _ => data.extend(event.to_bytes()),
        }
    }

    data.extend([0x00, 0xFF, 0x2F, 0x00]);
    data
}

/// Writes a format 1 file: a tempo/meter track followed by one track per
/// entry of `tracks`. Event times are frames, `start` maps to tick zero.
/// Returns the number of events written.
pub fn write_smf(path: &Path, scale: &TimeScale, start: u64, tracks: &[ExportTrack]) -> Result<usize> {
    scale.validate()?;
    if scale.ticks_per_beat >= 0x8000 {
        return Err(MidiError::ConfigurationError(format!(
            "{} ticks per beat do not fit an SMF header",
            scale.ticks_per_beat
        )));
    }

    let mut out = BufWriter::new(File::create(path)?);
    let mut header = Vec::with_capacity(6);
    header.extend(1u16.to_be_bytes());
    header.extend(((tracks.len() + 1) as u16).to_be_bytes());
    header.extend(scale.ticks_per_beat.to_be_bytes());
    write_chunk(&mut out, b"MThd", &header)?;

    write_chunk(&mut out, b"MTrk", &tempo_track(scale))?;
    let mut count = 0;
    for track in tracks {
        write_chunk(&mut out, b"MTrk", &event_track(scale, start, track))?;
        count += track.events.len();
    }
    out.flush()?;

    info!(
        "Exported {} events in {} tracks to {}",
        count,
        tracks.len(),
        path.display()
    );
    Ok(count)
}
