use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// A wall clock reporting real time as a duration since the Unix epoch.
pub trait WallClock: Send + Sync {
    fn resolution(&self) -> Duration;
    fn now(&self) -> Duration;
}

/// A monotonic clock reporting nanoseconds since an arbitrary, fixed point
/// in the past. Successive calls never go backwards.
pub trait MonotonicClock: Send + Sync {
    fn resolution(&self) -> u64;
    fn now(&self) -> u64;
}

pub struct HostClocks {
    pub wall: Box<dyn WallClock>,
    pub monotonic: Box<dyn MonotonicClock>,
}

impl Default for HostClocks {
    fn default() -> Self {
        HostClocks {
            wall: Box::new(SystemWallClock),
            monotonic: Box::new(SystemMonotonicClock::new()),
        }
    }
}

pub struct SystemWallClock;

impl WallClock for SystemWallClock {
    fn resolution(&self) -> Duration {
        Duration::from_nanos(1)
    }
    fn now(&self) -> Duration {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
    }
}

pub struct SystemMonotonicClock {
    base: Instant,
}

impl SystemMonotonicClock {
    pub fn new() -> Self {
        SystemMonotonicClock {
            base: Instant::now(),
        }
    }
}

impl Default for SystemMonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock for SystemMonotonicClock {
    fn resolution(&self) -> u64 {
        1
    }
    fn now(&self) -> u64 {
        self.base.elapsed().as_nanos() as u64
    }
}

/// A clock pair frozen at a caller-chosen point, for deterministic tests.
#[derive(Clone, Copy)]
pub struct FixedClock {
    pub wall: Duration,
    pub monotonic: u64,
}

impl WallClock for FixedClock {
    fn resolution(&self) -> Duration {
        Duration::from_secs(1)
    }
    fn now(&self) -> Duration {
        self.wall
    }
}

impl MonotonicClock for FixedClock {
    fn resolution(&self) -> u64 {
        1_000_000_000
    }
    fn now(&self) -> u64 {
        self.monotonic
    }
}
