use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;

/// Tunables for the hub. `Default` matches the documented environment defaults.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Bounded outbound queue per session; overflowing it closes the session.
    pub outbound_queue: usize,
    pub heartbeat_interval: Duration,
    pub idle_timeout: Duration,
    pub presence_grace: Duration,
    pub rate_limit_messages: u32,
    pub rate_limit_window: Duration,
    pub max_message_chars: usize,
    pub persist_retries: u32,
    /// First retry delay; doubles on every further attempt.
    pub persist_backoff: Duration,
    pub reaper_interval: Duration,
    pub default_max_members: u32,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            outbound_queue: 256,
            heartbeat_interval: Duration::from_secs(15),
            idle_timeout: Duration::from_secs(60),
            presence_grace: Duration::from_millis(2000),
            rate_limit_messages: 20,
            rate_limit_window: Duration::from_secs(60),
            max_message_chars: 4000,
            persist_retries: 3,
            persist_backoff: Duration::from_millis(50),
            reaper_interval: Duration::from_secs(300),
            default_max_members: 500,
        }
    }
}

impl HubConfig {
    /// Read `AGORA_*` variables, falling back to defaults for unset ones.
    /// A variable that is set but unparsable is an error.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let d = Self::default();
        let idle_secs: u64 = parse_or(&lookup, "AGORA_IDLE_TIMEOUT_SECS", d.idle_timeout.as_secs())?;
        let idle_timeout = Duration::from_secs(idle_secs);

        let config = Self {
            outbound_queue: parse_or(&lookup, "AGORA_OUTBOUND_QUEUE", d.outbound_queue)?,
            // Ping often enough that a live client is seen well within the idle timeout.
            heartbeat_interval: d.heartbeat_interval.min(idle_timeout / 2),
            idle_timeout,
            presence_grace: Duration::from_millis(parse_or(
                &lookup,
                "AGORA_PRESENCE_GRACE_MS",
                d.presence_grace.as_millis() as u64,
            )?),
            rate_limit_messages: parse_or(&lookup, "AGORA_RATE_LIMIT_MESSAGES", d.rate_limit_messages)?,
            rate_limit_window: Duration::from_secs(parse_or(
                &lookup,
                "AGORA_RATE_LIMIT_WINDOW_SECS",
                d.rate_limit_window.as_secs(),
            )?),
            max_message_chars: parse_or(&lookup, "AGORA_MAX_MESSAGE_CHARS", d.max_message_chars)?,
            persist_retries: parse_or(&lookup, "AGORA_PERSIST_RETRIES", d.persist_retries)?,
            persist_backoff: d.persist_backoff,
            reaper_interval: Duration::from_secs(parse_or(
                &lookup,
                "AGORA_REAPER_INTERVAL_SECS",
                d.reaper_interval.as_secs(),
            )?),
            default_max_members: d.default_max_members,
        };

        anyhow::ensure!(config.outbound_queue > 0, "AGORA_OUTBOUND_QUEUE must be positive");
        anyhow::ensure!(config.rate_limit_messages > 0, "AGORA_RATE_LIMIT_MESSAGES must be positive");
        anyhow::ensure!(!config.idle_timeout.is_zero(), "AGORA_IDLE_TIMEOUT_SECS must be positive");
        Ok(config)
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().with_context(|| format!("invalid {}={:?}", key, raw)),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = HubConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.outbound_queue, 256);
        assert_eq!(config.idle_timeout, Duration::from_secs(60));
        assert_eq!(config.presence_grace, Duration::from_secs(2));
        assert_eq!(config.max_message_chars, 4000);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(15));
    }

    #[test]
    fn overrides_and_heartbeat_follows_idle_timeout() {
        let config = HubConfig::from_lookup(lookup(&[
            ("AGORA_IDLE_TIMEOUT_SECS", "10"),
            ("AGORA_RATE_LIMIT_MESSAGES", "5"),
            ("AGORA_OUTBOUND_QUEUE", " 32 "),
        ]))
        .unwrap();
        assert_eq!(config.rate_limit_messages, 5);
        assert_eq!(config.outbound_queue, 32);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
    }

    #[test]
    fn garbage_is_rejected() {
        let err = HubConfig::from_lookup(lookup(&[("AGORA_PERSIST_RETRIES", "many")]))
            .unwrap_err();
        assert!(err.to_string().contains("AGORA_PERSIST_RETRIES"));
        assert!(HubConfig::from_lookup(lookup(&[("AGORA_OUTBOUND_QUEUE", "0")])).is_err());
    }
}
