use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds + fractional seconds, matching the wire header's
/// timestamp field. `frac` is fractional seconds scaled to a 32-bit
/// unsigned range (i.e. `frac / 2^32` seconds), which keeps the
/// on-wire representation fixed-width without pulling in a calendar
/// library for what is, to the core, an opaque tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timestamp {
    pub secs: u32,
    pub frac: u32,
}

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp { secs: 0, frac: 0 };

    pub fn from_system_time(t: SystemTime) -> Timestamp {
        let dur = t.duration_since(UNIX_EPOCH).unwrap_or_default();
        let frac = (dur.subsec_nanos() as u64 * (1u64 << 32) / 1_000_000_000) as u32;

        Timestamp {
            secs: dur.as_secs() as u32,
            frac,
        }
    }
}

/// A source of server time, passed explicitly into everything that
/// needs to stamp a message rather than read from a process-wide
/// global.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// The clock used in production: reads the OS wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_system_time(SystemTime::now())
    }
}

/// A clock with a fixed, settable value. Used by tests in this and
/// downstream crates that need deterministic timestamps.
#[derive(Debug, Default)]
pub struct ManualClock(std::sync::Mutex<Timestamp>);

impl ManualClock {
    pub fn new(t: Timestamp) -> Self {
        ManualClock(std::sync::Mutex::new(t))
    }

    pub fn set(&self, t: Timestamp) {
        *self.0.lock().unwrap() = t;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        *self.0.lock().unwrap()
    }
}
