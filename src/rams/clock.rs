//! RAMS stream clock.
//!
//! The interpreter schedules unit output against a 16-bit millisecond
//! clock seeded by each packet's clock reference. The server's clock is
//! taken over whenever it leads; when it lags, the local clock keeps
//! free-running but slowed by 1/512 (about 2000 ppm) so it cannot
//! overtake the server in normal operation. A transient bandwidth
//! shortage therefore stalls output instead of building up latency.

/// Local clock slow-down: one unit withheld every this many units.
const CLOCK_SLOWDOWN_FRACTION: u16 = 512;

#[derive(Debug, Default)]
pub struct RamsClock {
    is_time_set: bool,
    last_time: u16,
    slowdown_remainder: u16,
    is_synchronized: bool,
    current: u16,
}

impl RamsClock {
    pub fn new() -> Self {
        RamsClock::default()
    }

    pub fn reset(&mut self) {
        *self = RamsClock::default();
    }

    pub fn current(&self) -> u16 {
        self.current
    }

    /// A packet arrived with a new clock reference. Returns the clock to
    /// drain scheduled output up to.
    pub fn synchronize(&mut self, rams_clock_ms: u16) -> u16 {
        let mut synchronize = true;
        if self.is_time_set && self.is_synchronized {
            // Positive lead: the stream clock is ahead of our local clock.
            // Lagging values are not taken over.
            let lead = rams_clock_ms.wrapping_sub(self.current) as i16;
            if lead < 0 {
                synchronize = false;
            }
        }

        if synchronize {
            self.current = rams_clock_ms;
            self.is_synchronized = true;
        }

        self.current
    }

    /// Advance by wall-clock time. The absolute origin is arbitrary but
    /// the value must be continuous; wrap-around is fine. Returns the
    /// clock to drain scheduled output up to.
    pub fn set_current_time(&mut self, real_time_ms: u16) -> u16 {
        if !self.is_time_set {
            self.last_time = real_time_ms;
            self.is_time_set = true;
        }

        let mut delta = real_time_ms.wrapping_sub(self.last_time);
        self.last_time = real_time_ms;

        // Withhold the slow-down fraction
        self.slowdown_remainder += delta;
        delta -= self.slowdown_remainder / CLOCK_SLOWDOWN_FRACTION;
        self.slowdown_remainder %= CLOCK_SLOWDOWN_FRACTION;

        self.current = self.current.wrapping_add(delta);
        self.current
    }
}
