//! Fixed-timestep loop for the headless simulation.
//!
//! Wall-clock time is fed in by the caller and accumulated; the world is
//! stepped at a fixed rate no matter how irregular the frames are. Frames
//! that take too long are clamped so a stall never turns into a burst of
//! catch-up steps.

use std::ops::ControlFlow;
use std::time::{Duration, Instant};

use tracing::warn;

/// Fixed simulation step: 60 Hz.
pub const FIXED_DT: Duration = Duration::from_nanos(16_666_667);

/// Longest frame that is fully simulated.
pub const MAX_FRAME_TIME: Duration = Duration::from_millis(250);

pub struct GameLoop {
    step: Duration,
    previous: Instant,
    accumulator: Duration,
    total_sim_time: Duration,
    frame_count: u64,
    update_count: u64,
}

impl GameLoop {
    /// A 60 Hz loop whose first frame is measured from `start`.
    pub fn new(start: Instant) -> Self {
        Self::with_step(FIXED_DT, start)
    }

    pub fn with_step(step: Duration, start: Instant) -> Self {
        Self {
            step,
            previous: start,
            accumulator: Duration::ZERO,
            total_sim_time: Duration::ZERO,
            frame_count: 0,
            update_count: 0,
        }
    }

    /// Runs one frame ending at `now`.
    ///
    /// `update(dt, sim_time)` is called once per whole step in the
    /// accumulator. Returning `Break` stops stepping for this frame and
    /// drops the rest of the accumulated time.
    pub fn advance(
        &mut self,
        now: Instant,
        mut update: impl FnMut(Duration, Duration) -> ControlFlow<()>,
    ) -> ControlFlow<()> {
        let mut frame_time = now.saturating_duration_since(self.previous);
        self.previous = now;

        if frame_time > MAX_FRAME_TIME {
            warn!(
                frame_ms = frame_time.as_millis() as u64,
                max_ms = MAX_FRAME_TIME.as_millis() as u64,
                "frame overran, clamping"
            );
            frame_time = MAX_FRAME_TIME;
        }
        self.accumulator += frame_time;
        self.frame_count += 1;

        while self.accumulator >= self.step {
            let flow = update(self.step, self.total_sim_time);
            self.total_sim_time += self.step;
            self.accumulator -= self.step;
            self.update_count += 1;
            if flow.is_break() {
                self.accumulator = Duration::ZERO;
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    /// Time left until the accumulator holds another whole step.
    pub fn until_next_step(&self) -> Duration {
        self.step.saturating_sub(self.accumulator)
    }

    /// Fraction of a step left in the accumulator, in `[0, 1)`.
    pub fn alpha(&self) -> f64 {
        self.accumulator.as_secs_f64() / self.step.as_secs_f64()
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn update_count(&self) -> u64 {
        self.update_count
    }

    pub fn total_sim_time(&self) -> Duration {
        self.total_sim_time
    }
}
