//! Exponential reconnect delay.

use std::time::Duration;

/// Doubling delay between a floor and a cap.
///
/// Starts at the floor. Each [`Backoff::advance`] doubles the current
/// delay and clamps it to the cap; [`Backoff::reset`] returns to the floor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    current: Duration,
    floor: Duration,
    cap: Duration,
}

impl Backoff {
    /// Creates a backoff sitting at `floor`.
    #[must_use]
    pub fn new(floor: Duration, cap: Duration) -> Self {
        Self {
            current: floor,
            floor,
            cap: cap.max(floor),
        }
    }

    /// The delay most recently produced (or the floor after a reset).
    #[must_use]
    pub const fn current(&self) -> Duration {
        self.current
    }

    /// Doubles the delay, clamped to the cap, and returns it.
    pub fn advance(&mut self) -> Duration {
        self.current = self.current.saturating_mul(2).min(self.cap);
        self.current
    }

    /// Returns the delay to the floor.
    pub const fn reset(&mut self) {
        self.current = self.floor;
    }
}
