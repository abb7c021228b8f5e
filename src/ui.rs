// ui.rs

use crate::timescale::TimeScale;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};

fn bar_style(template: &str, chars: &str) -> ProgressStyle {
    ProgressStyle::with_template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars(chars)
}

fn create_beat_progress(multi_progress: &MultiProgress, beats_per_bar: u16) -> ProgressBar {
    let pb = multi_progress.add(ProgressBar::new(u64::from(beats_per_bar)));
    pb.set_style(bar_style(
        "{prefix:.bold} [{bar:40.cyan}] {pos}/{len}",
        "⣀⣤⣦⣶⣷⣿ ",
    ));
    pb.set_prefix("Beat");
    pb
}

fn create_transport_spinner(multi_progress: &MultiProgress) -> ProgressBar {
    let pb = multi_progress.add(ProgressBar::new_spinner());
    pb.set_style(
        ProgressStyle::with_template("{prefix:.bold.dim} {spinner} {wide_msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_prefix("Transport");
    pb
}

/// One-based bar and beat of song `frame`
pub fn bar_beat(scale: &TimeScale, frame: u64) -> (u64, u64) {
    let beat = scale.tick_from_frame(frame) / u64::from(scale.ticks_per_beat);
    let beats_per_bar = u64::from(scale.beats_per_bar);
    (beat / beats_per_bar + 1, beat % beats_per_bar + 1)
}

/// Terminal view of the play position
pub struct PositionDisplay {
    #[allow(dead_code)]
    multi_progress: MultiProgress,
    beat_pb: ProgressBar,
    transport_pb: ProgressBar,
}

impl PositionDisplay {
    pub fn new(beats_per_bar: u16) -> Self {
        let multi_progress = MultiProgress::with_draw_target(ProgressDrawTarget::stderr());
        let beat_pb = create_beat_progress(&multi_progress, beats_per_bar);
        let transport_pb = create_transport_spinner(&multi_progress);

        PositionDisplay {
            multi_progress,
            beat_pb,
            transport_pb,
        }
    }

    pub fn update(&self, scale: &TimeScale, frame: u64, dropped: u64) {
        let (bar, beat) = bar_beat(scale, frame);
        self.beat_pb.set_position(beat);
        self.transport_pb.set_message(format!(
            "Bar: {}, BPM: {}, Frame: {}, Dropped: {}",
            bar, scale.tempo, frame, dropped
        ));
        self.transport_pb.tick();
    }

    pub fn finish(&self) {
        self.beat_pb.finish_and_clear();
        self.transport_pb.finish_with_message("Stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bar_beat_at_120_bpm() {
        let scale = TimeScale::default();
        assert_eq!(bar_beat(&scale, 0), (1, 1));
        // 24000 frames per beat at 48 kHz
        assert_eq!(bar_beat(&scale, 24_000), (1, 2));
        assert_eq!(bar_beat(&scale, 4 * 24_000), (2, 1));
        assert_eq!(bar_beat(&scale, 4 * 24_000 - 100), (1, 4));
    }
}
