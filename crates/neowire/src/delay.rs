//! Reconnect delay policies.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::error::Error;

/// Maps the error that ended the previous attempt to the wait before the
/// next one.
pub type Delayer = Arc<dyn Fn(&Error) -> Duration + Send + Sync>;

/// Always waits `delay`.
pub fn constant(delay: Duration) -> Delayer {
    Arc::new(move |_| delay)
}

/// Waits `base` plus a uniformly random extra of up to `jitter`, so a fleet
/// of clients does not redial in lockstep.
pub fn jittered(base: Duration, jitter: Duration) -> Delayer {
    let spread = u64::try_from(jitter.as_micros()).unwrap_or(u64::MAX);
    Arc::new(move |_| {
        if spread == 0 {
            return base;
        }
        let extra = rand::thread_rng().gen_range(0..=spread);
        base + Duration::from_micros(extra)
    })
}
