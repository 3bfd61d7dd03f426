use rand::Rng;

/// Reconnect backoff for long-lived provider clients.
#[derive(Clone, Debug)]
pub struct BackoffPolicy {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub factor: f64,
    /// Uniform jitter fraction; the computed delay is scaled by a random
    /// factor in `[1 - jitter, 1 + jitter]`.
    pub jitter: f64,
    /// 0 means retry forever.
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_ms: 1_000,
            max_ms: 60_000,
            factor: 2.0,
            jitter: 0.2,
            max_attempts: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Backoff {
    pub delay_ms: u64,
    pub give_up: bool,
}

pub fn next_delay(attempt: u32, policy: &BackoffPolicy) -> Backoff {
    if policy.max_attempts != 0 && attempt >= policy.max_attempts {
        return Backoff {
            delay_ms: 0,
            give_up: true,
        };
    }

    let base = (policy.initial_ms as f64 * policy.factor.powi(attempt as i32))
        .min(policy.max_ms as f64);
    let jitter = policy.jitter.clamp(0.0, 1.0);
    let scale = if jitter > 0.0 {
        rand::rng().random_range(1.0 - jitter..=1.0 + jitter)
    } else {
        1.0
    };

    Backoff {
        delay_ms: (base * scale).round().max(0.0) as u64,
        give_up: false,
    }
}
