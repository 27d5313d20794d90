//! Small utility functions shared by the engine's retry and backoff paths.

use rand::Rng;

/// Calculate exponential backoff delay for retries: `base_delay_ms * 2^attempt`,
/// capped at `max_delay_ms`. Used for both the client session reconnect backoff
/// and the persistence re-upload backoff (1s → cap 8s, ×2 in both cases).
pub fn calculate_backoff_delay(attempt: u32, base_delay_ms: u64, max_delay_ms: u64) -> u64 {
    let delay = base_delay_ms.saturating_mul(2_u64.saturating_pow(attempt.min(10)));
    delay.min(max_delay_ms)
}

/// An 8 hex-character random token, used to make a client's wire id unique
/// across restarts (`client_id_unique`, default true).
pub fn random_token() -> String {
    let mut rng = rand::rng();
    (0..8)
        .map(|_| std::char::from_digit(rng.random_range(0..16), 16).unwrap())
        .collect()
}
