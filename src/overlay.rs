use std::time::{Duration, Instant};

use crate::turn::TitleState;

/// Inactivity mask over a running turn. It never touches `TurnState`; the
/// title layer consults `active` when rendering.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeoutOverlay {
    active: bool,
    last_activity: Option<Instant>,
}

impl TimeoutOverlay {
    pub fn new(now: Instant) -> Self {
        Self {
            active: false,
            last_activity: Some(now),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn note_activity(&mut self, now: Instant) {
        self.last_activity = Some(now);
    }

    /// Returns true only when `active` flips.
    pub fn tick(&mut self, now: Instant, state: TitleState, timeout: Duration) -> bool {
        if timeout.is_zero() || state != TitleState::Running {
            return self.clear();
        }
        let last = *self.last_activity.get_or_insert(now);
        let idle = now.saturating_duration_since(last) >= timeout;
        if idle == self.active {
            return false;
        }
        self.active = idle;
        true
    }

    fn clear(&mut self) -> bool {
        std::mem::replace(&mut self.active, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(120);

    #[test]
    fn activates_once_after_idle_running() {
        let start = Instant::now();
        let mut overlay = TimeoutOverlay::new(start);
        assert!(!overlay.tick(start + Duration::from_secs(60), TitleState::Running, TIMEOUT));
        assert!(overlay.tick(start + TIMEOUT, TitleState::Running, TIMEOUT));
        assert!(overlay.is_active());
        assert!(!overlay.tick(start + Duration::from_secs(200), TitleState::Running, TIMEOUT));
        assert!(!overlay.tick(start + Duration::from_secs(300), TitleState::Running, TIMEOUT));
    }

    #[test]
    fn leaving_running_clears_once() {
        let start = Instant::now();
        let mut overlay = TimeoutOverlay::new(start);
        assert!(overlay.tick(start + TIMEOUT, TitleState::Running, TIMEOUT));
        let later = start + TIMEOUT + Duration::from_secs(1);
        assert!(overlay.tick(later, TitleState::DoneNoCommit, TIMEOUT));
        assert!(!overlay.is_active());
        assert!(!overlay.tick(later, TitleState::DoneNoCommit, TIMEOUT));
    }

    #[test]
    fn never_active_outside_running() {
        let start = Instant::now();
        let mut overlay = TimeoutOverlay::new(start);
        let late = start + Duration::from_secs(10_000);
        for state in [
            TitleState::New,
            TitleState::DoneCommitted,
            TitleState::DoneNoCommit,
        ] {
            assert!(!overlay.tick(late, state, TIMEOUT));
            assert!(!overlay.is_active());
        }
    }

    #[test]
    fn zero_timeout_disables_and_clears_once() {
        let start = Instant::now();
        let mut overlay = TimeoutOverlay::new(start);
        assert!(overlay.tick(start + TIMEOUT, TitleState::Running, TIMEOUT));
        let late = start + Duration::from_secs(1_000);
        assert!(overlay.tick(late, TitleState::Running, Duration::ZERO));
        assert!(!overlay.tick(late, TitleState::Running, Duration::ZERO));
    }

    #[test]
    fn activity_resets_the_idle_clock() {
        let start = Instant::now();
        let mut overlay = TimeoutOverlay::new(start);
        assert!(overlay.tick(start + TIMEOUT, TitleState::Running, TIMEOUT));
        let resumed = start + TIMEOUT + Duration::from_secs(5);
        overlay.note_activity(resumed);
        assert!(overlay.tick(resumed, TitleState::Running, TIMEOUT));
        assert!(!overlay.is_active());
        assert!(!overlay.tick(resumed + Duration::from_secs(60), TitleState::Running, TIMEOUT));
        assert!(overlay.tick(resumed + TIMEOUT, TitleState::Running, TIMEOUT));
    }
}
