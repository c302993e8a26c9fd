use std::time::Duration;

use rand::Rng;

pub fn now_ts() -> f64 {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    now.as_secs_f64()
}

/// Exponential reconnect delay (`base * 2^attempt`, capped at `max`) with up to 20% jitter.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exp = base.saturating_mul(1u32 << attempt.min(16));
    let capped = exp.min(max);
    let jitter: f64 = rand::rng().random_range(0.0..=0.2);
    capped.mul_f64(1.0 + jitter).min(max)
}

pub fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}
