use std::{env, time::Duration};

/// Get the default PV timeout, either from environment or default 5 seconds
///
/// This is how long the first `get` of a new PV waits for a value to arrive.
pub fn get_default_pv_timeout() -> Duration {
    let seconds = env::var("EPICS_PV_TIMEOUT")
        .ok()
        .and_then(|v| v.parse::<f32>().ok())
        .filter(|v| v.is_finite())
        .unwrap_or(5.0f32)
        .max(0.0f32);
    Duration::from_secs_f32(seconds)
}

/// Get the per-PV update queue depth, either from environment or default 32
///
/// A monitor that falls further behind than this skips to the most recent updates.
pub fn get_default_monitor_capacity() -> usize {
    env::var("EPICS_PV_QUEUE_SIZE")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(32usize)
        .max(1usize)
}
