//! Server configuration read once from the environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use bindicator_core::{model::SourceKind, service::ServiceSettings, verifier::VerifySettings};
use bindicator_provider_rbwm::BASE_URL;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8000;
const DEFAULT_CACHE_PATH: &str = "data/cache.json";
const DEFAULT_USER_AGENT: &str = "Bindicator/0.1";
const DEFAULT_TIMEOUT_SECS: u64 = 20;
const DEFAULT_VERIFY_SAMPLE: usize = 3;
const DEFAULT_VERIFY_THROTTLE_HOURS: i64 = 24;
const DEFAULT_VERIFY_DELAY_MS: (u64, u64) = (400, 1200);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
/// A configuration variable could not be used.
pub(crate) enum ConfigError {
    /// The value does not parse or is out of range.
    #[error("{name}={value:?} is invalid: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Log output settings.
pub(crate) struct LogConfig {
    /// `EnvFilter` directives; `None` falls back to `RUST_LOG`.
    pub(crate) filter: Option<String>,
    /// Emit JSON lines instead of human-readable output.
    pub(crate) json: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Everything the binary needs to start.
pub(crate) struct ApiConfig {
    pub(crate) datasource: SourceKind,
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) cache_path: PathBuf,
    /// Exposes the debug routes.
    pub(crate) debug: bool,
    pub(crate) upstream_timeout: Duration,
    pub(crate) verify_sample: usize,
    pub(crate) verify_throttle: chrono::Duration,
    /// Bounds of the random pause between verification calls.
    pub(crate) verify_delay: (Duration, Duration),
    pub(crate) user_agent: String,
    /// Council form the live source scrapes.
    pub(crate) rbwm_url: String,
    pub(crate) log: LogConfig,
}

impl ApiConfig {
    /// Load configuration from environment variables.
    ///
    /// Supported variables:
    /// - `BINDICATOR_DATASOURCE`: `mock` (default), `live` or `rbwm`
    /// - `HOST` / `PORT`: bind address (default `127.0.0.1:8000`)
    /// - `BINDICATOR_CACHE_PATH`: snapshot file (default `data/cache.json`)
    /// - `BINDICATOR_DEBUG`: expose `/api/debug/*` (default false)
    /// - `BINDICATOR_UPSTREAM_TIMEOUT_SECS`: per-call deadline (default 20)
    /// - `BINDICATOR_VERIFY_SAMPLE`: addresses compared per check (default 3, minimum 2)
    /// - `BINDICATOR_VERIFY_THROTTLE_HOURS`: hours between checks of a postcode (default 24)
    /// - `BINDICATOR_VERIFY_DELAY_MS`: `min-max` pause between checks (default `400-1200`)
    /// - `BINDICATOR_USER_AGENT`: upstream user agent (default `Bindicator/0.1`)
    /// - `BINDICATOR_RBWM_URL`: council form URL
    /// - `BINDICATOR_LOG_LEVEL`: log filter, `RUST_LOG` is used when unset
    /// - `BINDICATOR_LOG_FORMAT`: `json` for JSON lines
    pub(crate) fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_owned())
                .filter(|value| !value.is_empty())
        };

        let datasource = match var("BINDICATOR_DATASOURCE") {
            Some(value) => SourceKind::from_str(&value).map_err(|err| ConfigError::Invalid {
                name: "BINDICATOR_DATASOURCE",
                reason: err.to_string(),
                value,
            })?,
            None => SourceKind::Mock,
        };

        let port = parsed(&var, "PORT", DEFAULT_PORT)?;
        let debug = match var("BINDICATOR_DEBUG") {
            Some(value) => parse_flag(&value).ok_or_else(|| ConfigError::Invalid {
                name: "BINDICATOR_DEBUG",
                value,
                reason: "expected true or false".to_owned(),
            })?,
            None => false,
        };

        let timeout_secs: u64 = parsed(&var, "BINDICATOR_UPSTREAM_TIMEOUT_SECS", DEFAULT_TIMEOUT_SECS)?;
        if timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                name: "BINDICATOR_UPSTREAM_TIMEOUT_SECS",
                value: timeout_secs.to_string(),
                reason: "must be at least one second".to_owned(),
            });
        }

        let verify_sample: usize = parsed(&var, "BINDICATOR_VERIFY_SAMPLE", DEFAULT_VERIFY_SAMPLE)?;
        if verify_sample < 2 {
            return Err(ConfigError::Invalid {
                name: "BINDICATOR_VERIFY_SAMPLE",
                value: verify_sample.to_string(),
                reason: "at least two addresses are needed to compare routes".to_owned(),
            });
        }

        let throttle_hours: i64 = parsed(
            &var,
            "BINDICATOR_VERIFY_THROTTLE_HOURS",
            DEFAULT_VERIFY_THROTTLE_HOURS,
        )?;
        let verify_throttle = chrono::Duration::try_hours(throttle_hours)
            .filter(|throttle| *throttle >= chrono::Duration::zero())
            .ok_or_else(|| ConfigError::Invalid {
                name: "BINDICATOR_VERIFY_THROTTLE_HOURS",
                value: throttle_hours.to_string(),
                reason: "must be a non-negative number of hours".to_owned(),
            })?;

        let verify_delay = match var("BINDICATOR_VERIFY_DELAY_MS") {
            Some(value) => parse_delay_range(&value).ok_or_else(|| ConfigError::Invalid {
                name: "BINDICATOR_VERIFY_DELAY_MS",
                value,
                reason: "expected `min-max` milliseconds with min <= max".to_owned(),
            })?,
            None => DEFAULT_VERIFY_DELAY_MS,
        };

        Ok(Self {
            datasource,
            host: var("HOST").unwrap_or_else(|| DEFAULT_HOST.to_owned()),
            port,
            cache_path: var("BINDICATOR_CACHE_PATH")
                .map_or_else(|| PathBuf::from(DEFAULT_CACHE_PATH), PathBuf::from),
            debug,
            upstream_timeout: Duration::from_secs(timeout_secs),
            verify_sample,
            verify_throttle,
            verify_delay: (
                Duration::from_millis(verify_delay.0),
                Duration::from_millis(verify_delay.1),
            ),
            user_agent: var("BINDICATOR_USER_AGENT").unwrap_or_else(|| DEFAULT_USER_AGENT.to_owned()),
            rbwm_url: var("BINDICATOR_RBWM_URL").unwrap_or_else(|| BASE_URL.to_owned()),
            log: LogConfig {
                filter: var("BINDICATOR_LOG_LEVEL").or_else(|| var("RUST_LOG")),
                json: var("BINDICATOR_LOG_FORMAT").is_some_and(|format| format.eq_ignore_ascii_case("json")),
            },
        })
    }

    /// Tunables handed to the resolution service.
    pub(crate) fn service_settings(&self) -> ServiceSettings {
        ServiceSettings {
            upstream_timeout: self.upstream_timeout,
            verify: VerifySettings {
                sample_size: self.verify_sample,
                throttle: self.verify_throttle,
            },
            ..ServiceSettings::default()
        }
    }
}

fn parsed<T>(
    var: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match var(name) {
        Some(value) => value.parse().map_err(|err: T::Err| ConfigError::Invalid {
            name,
            reason: err.to_string(),
            value,
        }),
        None => Ok(default),
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_delay_range(value: &str) -> Option<(u64, u64)> {
    let (min, max) = match value.split_once('-') {
        Some((min, max)) => (min.trim().parse().ok()?, max.trim().parse().ok()?),
        None => {
            let fixed = value.parse().ok()?;
            (fixed, fixed)
        }
    };
    (min <= max).then_some((min, max))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> Result<ApiConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(name, value)| ((*name).to_owned(), (*value).to_owned()))
            .collect();
        ApiConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = config(&[]).unwrap();
        assert_eq!(config.datasource, SourceKind::Mock);
        assert_eq!((config.host.as_str(), config.port), ("127.0.0.1", 8000));
        assert_eq!(config.cache_path, PathBuf::from("data/cache.json"));
        assert!(!config.debug);
        assert_eq!(config.upstream_timeout, Duration::from_secs(20));
        assert_eq!(config.verify_sample, 3);
        assert_eq!(config.verify_throttle, chrono::Duration::hours(24));
        assert_eq!(
            config.verify_delay,
            (Duration::from_millis(400), Duration::from_millis(1200))
        );
        assert_eq!(config.rbwm_url, BASE_URL);
        assert_eq!(config.log, LogConfig { filter: None, json: false });
    }

    #[test]
    fn overrides_are_read() {
        let config = config(&[
            ("BINDICATOR_DATASOURCE", "RBWM"),
            ("HOST", "0.0.0.0"),
            ("PORT", "9000"),
            ("BINDICATOR_DEBUG", "yes"),
            ("BINDICATOR_VERIFY_DELAY_MS", "0-0"),
            ("RUST_LOG", "debug"),
            ("BINDICATOR_LOG_FORMAT", "JSON"),
        ])
        .unwrap();
        assert_eq!(config.datasource, SourceKind::Live);
        assert_eq!((config.host.as_str(), config.port), ("0.0.0.0", 9000));
        assert!(config.debug);
        assert_eq!(config.verify_delay, (Duration::ZERO, Duration::ZERO));
        assert_eq!(config.log.filter.as_deref(), Some("debug"));
        assert!(config.log.json);
    }

    #[test]
    fn log_level_beats_rust_log() {
        let config = config(&[("BINDICATOR_LOG_LEVEL", "warn"), ("RUST_LOG", "debug")]).unwrap();
        assert_eq!(config.log.filter.as_deref(), Some("warn"));
    }

    #[test]
    fn invalid_values_are_reported_by_name() {
        for (name, value) in [
            ("BINDICATOR_DATASOURCE", "excel"),
            ("PORT", "eighty"),
            ("BINDICATOR_DEBUG", "maybe"),
            ("BINDICATOR_UPSTREAM_TIMEOUT_SECS", "0"),
            ("BINDICATOR_VERIFY_SAMPLE", "1"),
            ("BINDICATOR_VERIFY_THROTTLE_HOURS", "-1"),
            ("BINDICATOR_VERIFY_DELAY_MS", "900-100"),
        ] {
            match config(&[(name, value)]) {
                Err(ConfigError::Invalid { name: reported, .. }) => assert_eq!(reported, name),
                Ok(_) => panic!("{name}={value} should be rejected"),
            }
        }
    }

    #[test]
    fn delay_accepts_a_single_value() {
        assert_eq!(parse_delay_range("250"), Some((250, 250)));
        assert_eq!(parse_delay_range(" 100 - 200 "), Some((100, 200)));
        assert_eq!(parse_delay_range("100-"), None);
    }
}
