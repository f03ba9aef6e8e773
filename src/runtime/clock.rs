//! Runtime clock: wall or virtual.

use std::sync::Mutex;
use std::time::Instant;

use crate::types::Time;

/// The executor's time source.
#[derive(Debug)]
pub(crate) enum Clock {
    /// Wall-clock time anchored at runtime creation.
    Wall {
        /// The instant corresponding to `Time::ZERO`.
        origin: Instant,
    },
    /// Virtual time advanced by the executor when idle.
    Virtual {
        /// Current virtual time in nanoseconds.
        now: Mutex<u64>,
    },
}

impl Clock {
    pub(crate) fn wall() -> Self {
        Self::Wall {
            origin: Instant::now(),
        }
    }

    pub(crate) fn virtual_clock() -> Self {
        Self::Virtual { now: Mutex::new(0) }
    }

    pub(crate) fn is_virtual(&self) -> bool {
        matches!(self, Self::Virtual { .. })
    }

    /// The current logical time.
    pub(crate) fn now(&self) -> Time {
        match self {
            Self::Wall { origin } => Time::from_nanos(origin.elapsed().as_nanos() as u64),
            Self::Virtual { now } => Time::from_nanos(*now.lock().expect("clock lock poisoned")),
        }
    }

    /// Advances a virtual clock to `target`; never moves time backwards.
    ///
    /// A no-op on the wall clock.
    pub(crate) fn advance_to(&self, target: Time) {
        if let Self::Virtual { now } = self {
            let mut now = now.lock().expect("clock lock poisoned");
            if target.as_nanos() > *now {
                *now = target.as_nanos();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virtual_clock_starts_at_zero_and_advances() {
        let clock = Clock::virtual_clock();
        assert_eq!(clock.now(), Time::ZERO);
        clock.advance_to(Time::from_millis(5));
        assert_eq!(clock.now(), Time::from_millis(5));
    }

    #[test]
    fn virtual_clock_never_rewinds() {
        let clock = Clock::virtual_clock();
        clock.advance_to(Time::from_millis(10));
        clock.advance_to(Time::from_millis(3));
        assert_eq!(clock.now(), Time::from_millis(10));
    }

    #[test]
    fn wall_clock_is_monotonic_from_zero() {
        let clock = Clock::wall();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
