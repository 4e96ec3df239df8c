//! Shared configuration newtypes used by every binary's own `Config`.
//!
//! Each binary (`batchctl-worker`, `batchctl-watchdog`, `batchctl-dispatcher`,
//! `batchctl-api`) defines its own `envconfig::Envconfig` struct, but they all need the same
//! handful of parsing helpers for durations expressed in milliseconds and for strings that must
//! not be empty (API keys, webhook secrets, database URLs).

use std::str::FromStr;

use envconfig::Envconfig;

/// A `std::time::Duration` parsed from an environment variable holding a millisecond count.
#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration {
    pub value: std::time::Duration,
}

impl FromStr for EnvMsDuration {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let millis: u64 = s
            .parse()
            .map_err(|_| format!("{} is not a valid millisecond count", s))?;
        Ok(EnvMsDuration {
            value: std::time::Duration::from_millis(millis),
        })
    }
}

/// A `String` that is guaranteed non-empty, used for secrets and connection strings where an
/// empty value almost certainly means a missing environment variable rather than an intentional
/// choice.
#[derive(Debug, Clone)]
pub struct NonEmptyString {
    pub value: String,
}

impl FromStr for NonEmptyString {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err("value must not be empty".to_owned());
        }
        Ok(NonEmptyString {
            value: s.to_owned(),
        })
    }
}

/// Configuration shared by every binary that talks to the store: the database connection and
/// the pool size. Binaries embed this with `#[envconfig(nested = true)]`.
#[derive(Envconfig, Debug, Clone)]
pub struct StoreConfig {
    #[envconfig(from = "DATABASE_URL")]
    pub database_url: NonEmptyString,

    #[envconfig(from = "DATABASE_MAX_CONNECTIONS", default = "10")]
    pub max_connections: u32,

    #[envconfig(from = "DATABASE_ACQUIRE_TIMEOUT_MS", default = "5000")]
    pub acquire_timeout: EnvMsDuration,
}

/// Configuration shared by every binary that exposes Prometheus metrics and a liveness probe
/// over HTTP.
#[derive(Envconfig, Debug, Clone)]
pub struct ObservabilityConfig {
    #[envconfig(from = "METRICS_BIND_ADDRESS", default = "0.0.0.0")]
    pub bind_address: String,

    #[envconfig(from = "METRICS_BIND_PORT", default = "9090")]
    pub bind_port: u16,

    #[envconfig(from = "RUST_LOG", default = "info")]
    pub log_filter: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_ms_duration_parses_millis() {
        let parsed: EnvMsDuration = "1500".parse().unwrap();
        assert_eq!(parsed.value, std::time::Duration::from_millis(1500));
    }

    #[test]
    fn env_ms_duration_rejects_garbage() {
        assert!("not-a-number".parse::<EnvMsDuration>().is_err());
    }

    #[test]
    fn non_empty_string_rejects_empty() {
        assert!("".parse::<NonEmptyString>().is_err());
    }

    #[test]
    fn non_empty_string_accepts_value() {
        let parsed: NonEmptyString = "postgres://localhost/batchctl".parse().unwrap();
        assert_eq!(parsed.value, "postgres://localhost/batchctl");
    }
}
