use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// List available MIDI devices
    #[arg(long)]
    pub device_list: bool,

    /// Connect the master bus to a specific MIDI device
    #[arg(long)]
    pub connect: Option<String>,

    /// Engine settings file (TOML, YAML or JSON)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Tempo in beats per minute
    #[arg(long)]
    pub tempo: Option<f32>,

    /// Scheduling look-ahead in frames
    #[arg(long)]
    pub read_ahead: Option<u64>,

    /// Play metronome clicks
    #[arg(long)]
    pub metronome: bool,

    /// Write the demo pattern to a Standard MIDI File instead of playing it
    #[arg(long)]
    pub export: Option<PathBuf>,

    /// Number of bars to play or export
    #[arg(long, default_value_t = 4)]
    pub bars: u64,
}

pub fn validate_device(device_name: &str, devices: &[String]) -> Result<(), String> {
    if !devices.iter().any(|d| d.contains(device_name)) {
        let mut error_msg = format!(
            "Error: Device '{}' not found in available devices:\n",
            device_name
        );
        for device in devices {
            error_msg.push_str(&format!("  - {}\n", device));
        }
        return Err(error_msg);
    }
    Ok(())
}
