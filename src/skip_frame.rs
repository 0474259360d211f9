//! Debounce of plane commits around mode transitions
//!
//! Committing a sideband frame while the crtc is still switching modes results in
//! visible corruption on most hardware. Once armed, the [`SkipFrameGuard`] suppresses
//! every commit for a fixed window and then disarms itself.

use std::time::Duration;

use tracing::{debug, trace};

/// Armed/disarmed state of the debounce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SkipFrameGuard {
    armed_at: Option<Duration>,
    window: Duration,
}

impl SkipFrameGuard {
    /// Create a disarmed guard suppressing commits for `window` once armed
    pub fn new(window: Duration) -> SkipFrameGuard {
        SkipFrameGuard { armed_at: None, window }
    }

    /// Arm the guard at time `now`
    ///
    /// Arming an already armed guard restarts the window.
    pub fn arm(&mut self, now: Duration) {
        debug!(window = ?self.window, "arming skip-frame guard");
        self.armed_at = Some(now);
    }

    /// Disarm the guard without waiting for the window to elapse
    pub fn disarm(&mut self) {
        self.armed_at = None;
    }

    /// Returns true if the guard is currently armed
    pub fn is_armed(&self) -> bool {
        self.armed_at.is_some()
    }

    /// Returns true if a commit at time `now` has to be skipped
    ///
    /// Disarms the guard once the window has elapsed.
    pub fn should_skip(&mut self, now: Duration) -> bool {
        let Some(armed_at) = self.armed_at else {
            return false;
        };
        let elapsed = now.saturating_sub(armed_at);
        if elapsed < self.window {
            trace!(?elapsed, "skipping frame");
            true
        } else {
            debug!(?elapsed, "skip-frame window elapsed");
            self.armed_at = None;
            false
        }
    }
}
