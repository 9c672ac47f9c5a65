use std::time::Duration;

/// Frame deltas beyond this are clamped so a stall does not trigger a burst of ticks.
pub const MAX_FRAME_DELTA: Duration = Duration::from_millis(250);

pub struct FixedTimestep {
    tick_rate: u32,
    dt: Duration,
    accumulator: Duration,
    tick: u64,
}

impl FixedTimestep {
    pub fn new(tick_rate: u32) -> Self {
        let tick_rate = tick_rate.max(1);
        Self {
            tick_rate,
            dt: Duration::from_secs(1) / tick_rate,
            accumulator: Duration::ZERO,
            tick: 0,
        }
    }

    pub fn tick_rate(&self) -> u32 {
        self.tick_rate
    }

    pub fn dt(&self) -> Duration {
        self.dt
    }

    pub fn dt_secs(&self) -> f32 {
        self.dt.as_secs_f32()
    }

    /// Ticks completed so far.
    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn accumulate(&mut self, delta: Duration) {
        self.accumulator += delta.min(MAX_FRAME_DELTA);
    }

    pub fn should_tick(&self) -> bool {
        self.accumulator >= self.dt
    }

    pub fn consume_tick(&mut self) -> bool {
        if self.accumulator >= self.dt {
            self.accumulator -= self.dt;
            self.tick += 1;
            true
        } else {
            false
        }
    }

    /// Accumulate `delta` and return how many ticks are now due.
    pub fn advance(&mut self, delta: Duration) -> u32 {
        self.accumulate(delta);
        let mut ticks = 0;
        while self.consume_tick() {
            ticks += 1;
        }
        ticks
    }

    pub fn alpha(&self) -> f32 {
        self.accumulator.as_secs_f32() / self.dt.as_secs_f32()
    }

    pub fn reset(&mut self) {
        self.accumulator = Duration::ZERO;
    }
}
