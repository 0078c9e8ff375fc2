//! Shared helpers.

use std::time::Duration;

/// Exponential backoff: `base * 2^attempt` plus a small deterministic jitter, capped at `cap`.
pub fn backoff_delay(base: Duration, attempt: u32, cap: Duration) -> Duration {
    let multiplier = 2u32.saturating_pow(attempt);
    let delay = base.saturating_mul(multiplier);

    // Up to 25% jitter, derived from the attempt number so tests stay stable.
    let jitter_range = delay.as_millis() as u64 / 4;
    let jitter = if jitter_range > 0 {
        (attempt as u64 * 7919) % jitter_range
    } else {
        0
    };

    delay.saturating_add(Duration::from_millis(jitter)).min(cap)
}

/// Turn an arbitrary id into a function name accepted by chat-completion APIs
/// (`[a-zA-Z0-9_-]`, at most 64 chars).
pub fn function_name(id: &str) -> String {
    let mut name: String = id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .take(64)
        .collect();
    if name.is_empty() {
        name.push('_');
    }
    name
}

/// Shorten `text` to at most `max` chars for log lines.
pub fn preview(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        format!("{}...", text.chars().take(max).collect::<String>())
    }
}
