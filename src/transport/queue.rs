use std::sync::{Mutex, PoisonError};
use std::time::Instant;

/// Tick clock of a sequencer queue.
///
/// A wall queue advances with real time at the configured tempo; a manual
/// queue only moves when [`SoftQueue::advance`] is called, which keeps
/// delivery deterministic under test.
#[derive(Debug)]
pub struct SoftQueue {
    manual: bool,
    state: Mutex<QueueState>,
}

#[derive(Debug)]
struct QueueState {
    allocated: bool,
    running: bool,
    base_tick: u64,
    since: Instant,
    manual_ticks: u64,
    tempo: f32,
    ticks_per_beat: u16,
}

impl SoftQueue {
    pub fn wall() -> Self {
        Self::with_clock(false)
    }

    pub fn manual() -> Self {
        Self::with_clock(true)
    }

    fn with_clock(manual: bool) -> Self {
        Self {
            manual,
            state: Mutex::new(QueueState {
                allocated: false,
                running: false,
                base_tick: 0,
                since: Instant::now(),
                manual_ticks: 0,
                tempo: 120.0,
                ticks_per_beat: 960,
            }),
        }
    }

    fn elapsed_ticks(&self, state: &QueueState) -> u64 {
        if !state.running {
            return 0;
        }
        if self.manual {
            return state.manual_ticks;
        }
        let beats = state.since.elapsed().as_secs_f64() * state.tempo as f64 / 60.0;
        (beats * state.ticks_per_beat as f64) as u64
    }

    fn rebase(&self, state: &mut QueueState) {
        state.base_tick += self.elapsed_ticks(state);
        state.manual_ticks = 0;
        state.since = Instant::now();
    }

    pub fn alloc(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.allocated = true;
        state.running = false;
        state.base_tick = 0;
        state.manual_ticks = 0;
    }

    pub fn free(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.allocated = false;
        state.running = false;
    }

    pub fn is_allocated(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .allocated
    }

    /// Changes the tick rate without moving the current tick
    pub fn set_tempo(&self, tempo: f32, ticks_per_beat: u16) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.rebase(&mut state);
        state.tempo = tempo;
        state.ticks_per_beat = ticks_per_beat;
    }

    /// Starts from tick zero
    pub fn start(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.base_tick = 0;
        state.manual_ticks = 0;
        state.since = Instant::now();
        state.running = true;
    }

    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.rebase(&mut state);
        state.running = false;
    }

    /// Resumes from the tick where the queue was stopped
    pub fn resume(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.running {
            state.since = Instant::now();
            state.manual_ticks = 0;
            state.running = true;
        }
    }

    pub fn tick(&self) -> u64 {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.base_tick + self.elapsed_ticks(&state)
    }

    pub fn is_running(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .running
    }

    /// Moves a manual queue forward; ignored by wall queues and stopped queues
    pub fn advance(&self, ticks: u64) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if self.manual && state.running {
            state.manual_ticks += ticks;
        }
    }
}
