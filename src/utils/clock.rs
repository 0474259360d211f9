//! Monotonic time sources

use std::{
    fmt,
    mem::MaybeUninit,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use tracing::warn;

/// Source of monotonic timestamps
///
/// Timestamps are relative to an arbitrary, but fixed, epoch and never decrease.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Returns the current time
    fn now(&self) -> Duration;
}

/// Clock backed by `CLOCK_MONOTONIC`
#[derive(Debug, Clone, Copy)]
pub struct Monotonic {
    _private: (),
}

impl Monotonic {
    /// Initialize a new clock
    pub fn new() -> std::io::Result<Self> {
        clock_get_time(libc::CLOCK_MONOTONIC)?;
        Ok(Monotonic { _private: () })
    }
}

impl Clock for Monotonic {
    fn now(&self) -> Duration {
        match clock_get_time(libc::CLOCK_MONOTONIC) {
            Ok(tp) => Duration::new(tp.tv_sec as u64, tp.tv_nsec as u32),
            Err(err) => {
                warn!(?err, "failed to read the monotonic clock");
                Duration::ZERO
            }
        }
    }
}

/// Clock that only moves when told to
///
/// Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<Mutex<Duration>>,
}

impl ManualClock {
    /// Create a clock starting at `start`
    pub fn new(start: Duration) -> ManualClock {
        ManualClock {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now = now.saturating_add(by);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
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
    use std::time::Duration;

    use super::{Clock, ManualClock, Monotonic};

    #[test]
    fn monotonic() {
        let clock = Monotonic::new().unwrap();
        let first = clock.now();
        let second = clock.now();
        assert!(second >= first);
    }

    #[test]
    fn manual_clock_is_shared() {
        let clock = ManualClock::new(Duration::from_secs(10));
        let other = clock.clone();
        other.advance(Duration::from_millis(1500));
        assert_eq!(clock.now(), Duration::from_millis(11_500));
    }
}
