//! Utility functions for kvkeeper

use chrono::{DateTime, SecondsFormat, Utc};
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Parse duration string (e.g., "30s", "5m", "1h", "7d")
pub fn parse_duration(s: &str) -> crate::Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(crate::Error::InvalidConfig("empty duration".into()));
    }

    let (num_str, unit) = if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, "ms")
    } else {
        let split = s.len() - s.chars().last().map(|c| c.len_utf8()).unwrap_or(0);
        (&s[..split], &s[split..])
    };

    let num: u64 = num_str
        .parse()
        .map_err(|_| crate::Error::InvalidConfig(format!("invalid duration: {}", s)))?;

    let secs_per_unit: u64 = match unit {
        "ms" => return Ok(Duration::from_millis(num)),
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86400,
        _ => {
            return Err(crate::Error::InvalidConfig(format!(
                "unknown duration unit: {}",
                unit
            )))
        }
    };
    let secs = num
        .checked_mul(secs_per_unit)
        .ok_or_else(|| crate::Error::InvalidConfig(format!("duration out of range: {}", s)))?;

    Ok(Duration::from_secs(secs))
}

/// Render a timestamp the way annotations store it
pub fn format_timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Parse an RFC 3339 annotation value
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Time elapsed since `since`, clamped to zero for timestamps in the future
pub fn elapsed_since(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or(Duration::ZERO)
}

/// Run `fut` with an upper bound; expiry becomes a retryable timeout error
pub async fn with_timeout<T, F>(limit: Duration, what: &str, fut: F) -> crate::Result<T>
where
    F: Future<Output = crate::Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(res) => res,
        Err(_) => Err(crate::Error::Timeout(format!(
            "{} did not finish within {:?}",
            what, limit
        ))),
    }
}

/// Exponential backoff for the `attempt`-th consecutive failure, capped at
/// `max` with up to 10% jitter.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exp = base.saturating_mul(1u32 << attempt.min(16));
    let capped = exp.min(max);
    let jitter_ms = capped.as_millis() as u64 / 10;
    if jitter_ms == 0 {
        return capped;
    }
    let jitter = rand::thread_rng().gen_range(0..=jitter_ms);
    capped
        .saturating_add(Duration::from_millis(jitter))
        .min(max)
}
