use std::time::Duration;

use rand::Rng;

/// Apply +/-20% jitter to a retry delay so co-scheduled activities do not
/// hammer a recovering dependency in lockstep.
pub(crate) fn jittered(delay: Duration) -> Duration {
    let jitter = rand::rng().random_range(0.8..1.2);
    Duration::from_millis((delay.as_millis() as f64 * jitter) as u64)
}
