//! Interest and readiness bitsets, and socket deadlines.

use std::time::{Duration, Instant};

use bitflags::bitflags;

bitflags! {
    /// Conditions a socket asks the reactor to watch for.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Interest: u8 {
        /// Readable, or a pending connection on a listener.
        const READ   = 0b0001;
        /// Writable.
        const WRITE  = 0b0010;
        /// Exceptional condition (out-of-band data).
        const EXCEPT = 0b0100;
    }
}

bitflags! {
    /// Conditions observed for a socket in one poll cycle.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Ready: u8 {
        const READ    = 0b0001;
        const WRITE   = 0b0010;
        const EXCEPT  = 0b0100;
        /// Synthesized when nothing fired and the socket's deadline elapsed.
        const TIMEOUT = 0b1000;
    }
}

impl Ready {
    /// Readiness bits that come from the wait primitive itself.
    pub const IO: Ready = Ready::READ.union(Ready::WRITE).union(Ready::EXCEPT);
}

/// Absolute time after which a socket's pending operation times out.
///
/// `At` sorts before `Never`, so `min` over deadlines yields the earliest one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Deadline {
    At(Instant),
    #[default]
    Never,
}

impl Deadline {
    /// Deadline `dur` from now.
    pub fn after(dur: Duration) -> Self {
        Self::after_from(Instant::now(), dur)
    }

    /// Deadline `dur` after `now`. Saturates to `Never` on overflow.
    pub fn after_from(now: Instant, dur: Duration) -> Self {
        now.checked_add(dur).map_or(Deadline::Never, Deadline::At)
    }

    /// Whether the deadline has passed at `now`.
    pub fn is_elapsed(&self, now: Instant) -> bool {
        match self {
            Deadline::At(t) => now >= *t,
            Deadline::Never => false,
        }
    }

    pub fn instant(&self) -> Option<Instant> {
        match self {
            Deadline::At(t) => Some(*t),
            Deadline::Never => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_orders_before_never() {
        let now = Instant::now();
        let a = Deadline::At(now);
        assert!(a < Deadline::Never);
        assert_eq!(a.min(Deadline::Never), a);
    }

    #[test]
    fn elapsed_checks() {
        let now = Instant::now();
        assert!(Deadline::At(now).is_elapsed(now));
        assert!(!Deadline::after_from(now, Duration::from_secs(1)).is_elapsed(now));
        assert!(!Deadline::Never.is_elapsed(now + Duration::from_secs(3600)));
    }

    #[test]
    fn io_mask_excludes_timeout() {
        assert!(!Ready::IO.contains(Ready::TIMEOUT));
        assert!(Ready::IO.contains(Ready::READ | Ready::WRITE | Ready::EXCEPT));
    }
}
