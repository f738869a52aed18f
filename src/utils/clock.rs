use std::{mem::MaybeUninit, time::Duration};

/// Handle to the system's monotonic clock.
///
/// All timestamps in the daemon (inhibitor `since`, idle hints) are taken
/// from `CLOCK_MONOTONIC`, so they are comparable to each other but not to
/// wall-clock time.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    clk_id: libc::clockid_t,
}

impl Clock {
    /// Initialize a new monotonic clock.
    ///
    /// Probes the clock once so that later reads cannot fail.
    pub fn new() -> std::io::Result<Self> {
        let clk_id = libc::CLOCK_MONOTONIC;
        clock_get_time(clk_id)?;
        Ok(Clock { clk_id })
    }

    /// Returns the current time.
    pub fn now(&self) -> Timestamp {
        // probed in new(), cannot fail anymore
        let tp = clock_get_time(self.clk_id).unwrap_or(libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        });
        Timestamp(Duration::new(
            tp.tv_sec.max(0) as u64,
            tp.tv_nsec.max(0) as u32,
        ))
    }
}

/// A point in monotonic time.
///
/// The zero timestamp ([`Timestamp::ZERO`]) is reserved as "never"; the
/// monotonic clock of a running system is always past it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(Duration);

impl Timestamp {
    /// The "never" timestamp.
    pub const ZERO: Timestamp = Timestamp(Duration::ZERO);

    /// Whether this is the "never" timestamp.
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// The offset from clock start.
    pub fn as_duration(&self) -> Duration {
        self.0
    }

    /// Microseconds since clock start, as stored in state files.
    pub fn as_micros(&self) -> u64 {
        self.0.as_micros() as u64
    }

    /// Rebuilds a timestamp from its state-file representation.
    pub fn from_micros(micros: u64) -> Timestamp {
        Timestamp(Duration::from_micros(micros))
    }
}

impl From<Duration> for Timestamp {
    fn from(d: Duration) -> Self {
        Timestamp(d)
    }
}

fn clock_get_time(clk_id: libc::clockid_t) -> Result<libc::timespec, std::io::Error> {
    let mut tp = MaybeUninit::zeroed();
    unsafe {
        let res = libc::clock_gettime(clk_id, tp.as_mut_ptr());

        if res < 0 {
            return Err(std::io::Error::last_os_error());
        }

        Ok(tp.assume_init())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn monotonic_is_past_zero() {
        let clock = Clock::new().unwrap();
        let now = clock.now();
        assert!(now > Timestamp::ZERO);
        assert!(!now.is_zero());
    }

    #[test]
    fn micros_round_trip() {
        let ts = Timestamp::from(Duration::from_micros(1_234_567));
        assert_eq!(Timestamp::from_micros(ts.as_micros()), ts);
    }

    #[test]
    fn ordering_follows_duration() {
        let early = Timestamp::from(Duration::from_secs(10));
        let late = Timestamp::from(Duration::from_secs(20));
        assert!(early < late);
        assert_eq!(early.max(late), late);
    }
}
