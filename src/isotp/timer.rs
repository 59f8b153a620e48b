//! Abstract timer handle used for N_As/N_Bs/N_Cr and STmin pacing.
//!
//! The engine never sleeps or spawns threads to wait out a timeout; it is
//! driven entirely by `poll()` calls from the embedding worker loop (see
//! spec.md §5). A [`Deadline`] is just an absolute instant plus bookkeeping
//! so `poll()` can cheaply ask "has this fired yet" without any OS timer
//! object — the same "caller supplies the clock tick" shape the original
//! source's `k_timer` callbacks reduce to once you strip away the RTOS.

use std::time::{Duration, Instant};

/// A single outstanding deadline. `None` means no timer is armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline(Instant);

impl Deadline {
    pub fn after(now: Instant, timeout: Duration) -> Self {
        Deadline(now + timeout)
    }

    pub fn has_elapsed(self, now: Instant) -> bool {
        now >= self.0
    }

    pub fn instant(self) -> Instant {
        self.0
    }
}

/// One context's optional armed timer. Each `SendContext`/`RecvContext` owns
/// exactly one of these at a time (N_Bs/N_Cr or STmin, never more than one
/// live deadline per direction), matching the one-`k_timer`-per-context
/// layout in the original source.
#[derive(Debug, Clone, Copy, Default)]
pub struct Timer {
    deadline: Option<Deadline>,
}

impl Timer {
    pub fn new() -> Self {
        Timer { deadline: None }
    }

    pub fn arm(&mut self, now: Instant, timeout: Duration) {
        self.deadline = Some(Deadline::after(now, timeout));
    }

    pub fn disarm(&mut self) {
        self.deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Returns `true` exactly once per arm/disarm cycle, the first time
    /// `poll` observes the deadline has passed; does not auto-disarm so
    /// callers can distinguish "still expired" from "never armed" if needed,
    /// but in practice every caller disarms immediately on a `true` result.
    pub fn poll(&self, now: Instant) -> bool {
        self.deadline.map_or(false, |d| d.has_elapsed(now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timer_fires_after_timeout() {
        let mut t = Timer::new();
        let t0 = Instant::now();
        assert!(!t.is_armed());
        t.arm(t0, Duration::from_millis(10));
        assert!(t.is_armed());
        assert!(!t.poll(t0));
        assert!(t.poll(t0 + Duration::from_millis(10)));
        assert!(t.poll(t0 + Duration::from_millis(11)));
    }

    #[test]
    fn disarm_clears_the_timer() {
        let mut t = Timer::new();
        let t0 = Instant::now();
        t.arm(t0, Duration::from_millis(1));
        t.disarm();
        assert!(!t.is_armed());
        assert!(!t.poll(t0 + Duration::from_secs(1)));
    }
}
