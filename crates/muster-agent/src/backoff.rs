//! Reconnect backoff schedule.
//!
//! The delay depends on how long the agent has been unable to reach any
//! broker, not on the attempt count: a fleet that loses its broker for an
//! hour should not hammer it on the way back up, but a blip should heal in
//! about a second.

use std::time::Duration;

/// Delay before the next dial attempt, given the total time since the
/// outage began. Non-decreasing in `outage`.
pub fn backoff_for(outage: Duration) -> Duration {
    const MINUTE: Duration = Duration::from_secs(60);
    const TEN_MINUTES: Duration = Duration::from_secs(10 * 60);
    const HOUR: Duration = Duration::from_secs(60 * 60);

    if outage < MINUTE {
        Duration::from_secs(1)
    } else if outage < TEN_MINUTES {
        Duration::from_secs(5)
    } else if outage < HOUR {
        Duration::from_secs(30)
    } else {
        Duration::from_secs(120)
    }
}
