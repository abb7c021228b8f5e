//! MIDI Machine Control (MMC) command envelope.
//!
//! Commands travel as universal real-time SysEx:
//! `F0 7F <device> 06 <command> [data...] F7`.

use crate::error::{MidiError, Result};

/// Device id addressing every receiver
pub const MMC_ALL_CALL: u8 = 0x7F;

/// Time-code frames per second used for locate positions (30 fps non-drop)
pub const MMC_FPS: u32 = 30;

const SYSEX_START: u8 = 0xF0;
const SYSEX_END: u8 = 0xF7;
const UNIVERSAL_REALTIME: u8 = 0x7F;
const MMC_COMMAND_ID: u8 = 0x06;
const LOCATE_TARGET: u8 = 0x01;
const FRAME_RATE_30: u8 = 0x60;
const TRACK_BITMAP_OFFSET: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Stop,
    Play,
    DeferredPlay,
    FastForward,
    Rewind,
    RecordStrobe,
    RecordExit,
    RecordPause,
    Pause,
    Eject,
    Chase,
    Reset,
    Write,
    MaskedWrite,
    Locate,
    Shuttle,
    Step,
}

impl Command {
    pub fn code(self) -> u8 {
        match self {
            Command::Stop => 0x01,
            Command::Play => 0x02,
            Command::DeferredPlay => 0x03,
            Command::FastForward => 0x04,
            Command::Rewind => 0x05,
            Command::RecordStrobe => 0x06,
            Command::RecordExit => 0x07,
            Command::RecordPause => 0x08,
            Command::Pause => 0x09,
            Command::Eject => 0x0A,
            Command::Chase => 0x0B,
            Command::Reset => 0x0D,
            Command::Write => 0x40,
            Command::MaskedWrite => 0x41,
            Command::Locate => 0x44,
            Command::Shuttle => 0x47,
            Command::Step => 0x48,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        let command = match code {
            0x01 => Command::Stop,
            0x02 => Command::Play,
            0x03 => Command::DeferredPlay,
            0x04 => Command::FastForward,
            0x05 => Command::Rewind,
            0x06 => Command::RecordStrobe,
            0x07 => Command::RecordExit,
            0x08 => Command::RecordPause,
            0x09 => Command::Pause,
            0x0A => Command::Eject,
            0x0B => Command::Chase,
            0x0D => Command::Reset,
            0x40 => Command::Write,
            0x41 => Command::MaskedWrite,
            0x44 => Command::Locate,
            0x47 => Command::Shuttle,
            0x48 => Command::Step,
            _ => return None,
        };
        Some(command)
    }
}

/// Information fields addressed by masked writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubCommand {
    TrackRecord,
    TrackMute,
    TrackSolo,
}

impl SubCommand {
    pub fn code(self) -> u8 {
        match self {
            SubCommand::TrackRecord => 0x4F,
            SubCommand::TrackMute => 0x62,
            SubCommand::TrackSolo => 0x66,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x4F => Some(SubCommand::TrackRecord),
            0x62 => Some(SubCommand::TrackMute),
            0x66 => Some(SubCommand::TrackSolo),
            _ => None,
        }
    }
}

/// A decoded or to-be-sent MMC request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MmcCommand {
    pub command: Command,
    pub data: Vec<u8>,
}

impl MmcCommand {
    pub fn new(command: Command, data: &[u8]) -> Self {
        Self {
            command,
            data: data.to_vec(),
        }
    }

    /// Locate to `position`, counted in 30 fps time-code frames.
    /// Positions wrap at 24 hours.
    pub fn locate(position: u32) -> Self {
        let frames_per_hour = MMC_FPS * 3600;
        let position = position % (frames_per_hour * 24);
        let hours = position / frames_per_hour;
        let minutes = (position / (MMC_FPS * 60)) % 60;
        let seconds = (position / MMC_FPS) % 60;
        let frames = position % MMC_FPS;
        Self::new(
            Command::Locate,
            &[
                0x06,
                LOCATE_TARGET,
                FRAME_RATE_30 | hours as u8,
                minutes as u8,
                seconds as u8,
                frames as u8,
                0x00,
            ],
        )
    }

    /// Set or clear `track`'s bit in the `sub` bitmap
    pub fn masked_write(sub: SubCommand, track: u32, on: bool) -> Self {
        let bit = track + TRACK_BITMAP_OFFSET;
        let byte = (bit / 7) as u8;
        let mask = 1u8 << (bit % 7);
        Self::new(
            Command::MaskedWrite,
            &[0x04, sub.code(), byte, mask, if on { mask } else { 0 }],
        )
    }

    /// Locate position in time-code frames, if this is a well-formed locate
    pub fn locate_position(&self) -> Option<u32> {
        if self.command != Command::Locate || self.data.len() < 6 {
            return None;
        }
        if self.data[0] < 6 || self.data[1] != LOCATE_TARGET {
            return None;
        }
        let hours = (self.data[2] & 0x1F) as u32;
        let minutes = self.data[3] as u32;
        let seconds = self.data[4] as u32;
        let frames = (self.data[5] & 0x1F) as u32;
        Some(((hours * 60 + minutes) * 60 + seconds) * MMC_FPS + frames)
    }

    /// Sub-command, track and on/off flag of a masked write
    pub fn masked_write_target(&self) -> Option<(SubCommand, u32, bool)> {
        if self.command != Command::MaskedWrite || self.data.len() < 5 {
            return None;
        }
        let sub = SubCommand::from_code(self.data[1])?;
        let mask = self.data[3];
        if mask == 0 {
            return None;
        }
        let bit = self.data[2] as u32 * 7 + mask.trailing_zeros();
        let track = bit.checked_sub(TRACK_BITMAP_OFFSET)?;
        Some((sub, track, self.data[4] & mask != 0))
    }

    pub fn to_sysex(&self, device_id: u8) -> Vec<u8> {
        let mut sysex = Vec::with_capacity(self.data.len() + 6);
        sysex.extend_from_slice(&[
            SYSEX_START,
            UNIVERSAL_REALTIME,
            device_id & 0x7F,
            MMC_COMMAND_ID,
            self.command.code(),
        ]);
        sysex.extend(self.data.iter().map(|b| b & 0x7F));
        sysex.push(SYSEX_END);
        sysex
    }

    /// Returns `Ok(None)` for SysEx that is not MMC at all.
    pub fn from_sysex(sysex: &[u8]) -> Result<Option<Self>> {
        if sysex.len() < 6 || sysex[0] != SYSEX_START {
            return Ok(None);
        }
        if sysex[1] != UNIVERSAL_REALTIME || sysex[3] != MMC_COMMAND_ID {
            return Ok(None);
        }
        if sysex[sysex.len() - 1] != SYSEX_END {
            return Err(MidiError::ProtocolDecodeError(
                "unterminated MMC message".to_string(),
            ));
        }
        let command = Command::from_code(sysex[4]).ok_or_else(|| {
            MidiError::ProtocolDecodeError(format!("unknown MMC command {:#04X}", sysex[4]))
        })?;
        let mmc = Self::new(command, &sysex[5..sysex.len() - 1]);

        let malformed = match command {
            Command::Locate => mmc.locate_position().is_none(),
            Command::MaskedWrite => mmc.masked_write_target().is_none(),
            _ => false,
        };
        if malformed {
            return Err(MidiError::ProtocolDecodeError(format!(
                "malformed MMC {:?} payload",
                command
            )));
        }
        Ok(Some(mmc))
    }
}
