use crate::channel::http::ApiEndpoint;
use crate::channel::push::PushSettings;
use crate::error::{SyncError, SyncResult};
use serde::Deserialize;
use std::time::Duration;
use url::Url;

pub const DEFAULT_API_BASE: &str = "http://127.0.0.1:8000/";

/// Every tunable delay in the synchronizer. Observed defaults, not protocol constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncTimings {
    pub poll_interval: Duration,
    pub ack_timeout: Duration,
    pub dedup_window: Duration,
    /// Total budget for non-streaming requests. Streamed commands have no total timeout.
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub reconnect_max_backoff: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for SyncTimings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(default_poll_interval_ms()),
            ack_timeout: Duration::from_millis(default_ack_timeout_ms()),
            dedup_window: Duration::from_millis(default_dedup_window_ms()),
            request_timeout: Duration::from_millis(default_request_timeout_ms()),
            connect_timeout: Duration::from_millis(default_connect_timeout_ms()),
            reconnect_max_backoff: Duration::from_millis(default_reconnect_max_backoff_ms()),
            heartbeat_interval: Duration::from_millis(default_heartbeat_interval_ms()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub api_base: Url,
    pub push_url: Url,
    pub token: Option<String>,
    pub timings: SyncTimings,
}

/// Raw `GENBOARD_*` environment, before URLs are resolved.
#[derive(Debug, Deserialize)]
struct EnvConfig {
    #[serde(default)]
    api_base: Option<String>,
    #[serde(default)]
    push_url: Option<String>,
    #[serde(default)]
    token: Option<String>,
    #[serde(default = "default_poll_interval_ms")]
    poll_interval_ms: u64,
    #[serde(default = "default_ack_timeout_ms")]
    ack_timeout_ms: u64,
    #[serde(default = "default_dedup_window_ms")]
    dedup_window_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    request_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    connect_timeout_ms: u64,
    #[serde(default = "default_reconnect_max_backoff_ms")]
    reconnect_max_backoff_ms: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    heartbeat_interval_ms: u64,
}

impl EnvConfig {
    fn normalize(mut self) -> Self {
        self.api_base = normalize_opt(self.api_base.take());
        self.push_url = normalize_opt(self.push_url.take());
        self.token = normalize_opt(self.token.take());
        self
    }

    fn timings(&self) -> SyncResult<SyncTimings> {
        let millis = |name: &str, value: u64| {
            if value == 0 {
                Err(SyncError::InvalidConfig(format!("{name} must be greater than zero")))
            } else {
                Ok(Duration::from_millis(value))
            }
        };
        Ok(SyncTimings {
            poll_interval: millis("poll_interval_ms", self.poll_interval_ms)?,
            ack_timeout: millis("ack_timeout_ms", self.ack_timeout_ms)?,
            dedup_window: Duration::from_millis(self.dedup_window_ms),
            request_timeout: millis("request_timeout_ms", self.request_timeout_ms)?,
            connect_timeout: millis("connect_timeout_ms", self.connect_timeout_ms)?,
            reconnect_max_backoff: millis("reconnect_max_backoff_ms", self.reconnect_max_backoff_ms)?,
            heartbeat_interval: millis("heartbeat_interval_ms", self.heartbeat_interval_ms)?,
        })
    }
}

impl SyncConfig {
    /// Reads `GENBOARD_*` variables. Unset or blank values fall back to defaults.
    pub fn from_env() -> SyncResult<Self> {
        let raw: EnvConfig = config::Config::builder()
            .add_source(
                config::Environment::with_prefix("GENBOARD")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|err| SyncError::InvalidConfig(err.to_string()))?;
        let raw = raw.normalize();
        let timings = raw.timings()?;
        Self::from_parts(
            raw.api_base.as_deref().unwrap_or(DEFAULT_API_BASE),
            raw.push_url.as_deref(),
            raw.token,
            timings,
        )
    }

    pub fn from_parts(
        api_base: &str,
        push_url: Option<&str>,
        token: Option<String>,
        timings: SyncTimings,
    ) -> SyncResult<Self> {
        let api_base = parse_base(api_base)?;
        let push_url = match push_url.map(str::trim).filter(|raw| !raw.is_empty()) {
            Some(raw) => parse_push_url(raw)?,
            None => derive_push_url(&api_base)?,
        };
        Ok(Self {
            api_base,
            push_url,
            token: normalize_opt(token),
            timings,
        })
    }

    pub fn endpoint(&self) -> ApiEndpoint {
        ApiEndpoint::new(self.api_base.clone(), self.token.clone())
    }

    pub fn push_settings(&self) -> PushSettings {
        PushSettings {
            url: self.push_url.clone(),
            credentials: self.token.clone(),
            heartbeat_interval: self.timings.heartbeat_interval,
            connect_timeout: self.timings.connect_timeout,
            max_backoff: self.timings.reconnect_max_backoff,
        }
    }
}

fn parse_base(raw: &str) -> SyncResult<Url> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(SyncError::InvalidConfig("api base must not be empty".into()));
    }
    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("{}{}", infer_scheme(trimmed), trimmed)
    };
    let mut url = Url::parse(&with_scheme)
        .map_err(|err| SyncError::InvalidConfig(format!("invalid api base {trimmed}: {err}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(SyncError::InvalidConfig(format!(
            "api base must be http or https, got {}",
            url.scheme()
        )));
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

fn parse_push_url(raw: &str) -> SyncResult<Url> {
    let with_scheme = if raw.contains("://") {
        raw.to_string()
    } else {
        let scheme = if infer_scheme(raw) == "http://" { "ws://" } else { "wss://" };
        format!("{scheme}{raw}")
    };
    let url = Url::parse(&with_scheme)
        .map_err(|err| SyncError::InvalidConfig(format!("invalid push url {raw}: {err}")))?;
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(SyncError::InvalidConfig(format!(
            "push url must be ws or wss, got {}",
            url.scheme()
        )));
    }
    Ok(url)
}

fn derive_push_url(api_base: &Url) -> SyncResult<Url> {
    let mut url = api_base.clone();
    let scheme = if api_base.scheme() == "https" { "wss" } else { "ws" };
    url.set_scheme(scheme)
        .map_err(|_| SyncError::InvalidConfig(format!("cannot derive push url from {api_base}")))?;
    url.set_path("/ws");
    url.set_query(None);
    Ok(url)
}

fn infer_scheme(base: &str) -> &'static str {
    let host_part = base
        .split('/')
        .next()
        .unwrap_or(base)
        .trim_start_matches('[')
        .split(']')
        .next()
        .unwrap_or(base);
    let host_lower = host_part.to_ascii_lowercase();
    if host_lower.starts_with("localhost")
        || host_lower.starts_with("0.0.0.0")
        || host_lower.starts_with("127.")
        || host_lower == "::1"
        || host_lower.starts_with("10.")
        || host_lower.starts_with("192.168.")
        || host_lower
            .strip_prefix("172.")
            .and_then(|rest| rest.split('.').next())
            .and_then(|octet| octet.parse::<u8>().ok())
            .map(|octet| (16..32).contains(&octet))
            .unwrap_or(false)
    {
        "http://"
    } else {
        "https://"
    }
}

fn normalize_opt(value: Option<String>) -> Option<String> {
    value.and_then(|s| {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn default_poll_interval_ms() -> u64 {
    3_000
}

fn default_ack_timeout_ms() -> u64 {
    5_000
}

fn default_dedup_window_ms() -> u64 {
    5_000
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_reconnect_max_backoff_ms() -> u64 {
    5_000
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_hosts_default_to_http() {
        let config =
            SyncConfig::from_parts("192.168.1.20:8000/api", None, None, SyncTimings::default())
                .unwrap();
        assert_eq!(config.api_base.as_str(), "http://192.168.1.20:8000/api/");
        assert_eq!(config.push_url.as_str(), "ws://192.168.1.20:8000/ws");
    }

    #[test]
    fn public_hosts_default_to_https() {
        let config = SyncConfig::from_parts(
            "api.genboard.io",
            None,
            Some("  ".into()),
            SyncTimings::default(),
        )
        .unwrap();
        assert_eq!(config.api_base.as_str(), "https://api.genboard.io/");
        assert_eq!(config.push_url.as_str(), "wss://api.genboard.io/ws");
        assert!(config.token.is_none());
    }

    #[test]
    fn explicit_push_url_is_kept() {
        let config = SyncConfig::from_parts(
            "http://localhost:8000",
            Some("localhost:9001/socket"),
            Some("secret".into()),
            SyncTimings::default(),
        )
        .unwrap();
        assert_eq!(config.push_url.as_str(), "ws://localhost:9001/socket");
        assert_eq!(config.token.as_deref(), Some("secret"));
    }

    #[test]
    fn rejects_non_http_base() {
        let err = SyncConfig::from_parts("ftp://example.com", None, None, SyncTimings::default())
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidConfig(_)));
    }

    #[test]
    fn defaults_match_observed_constants() {
        let timings = SyncTimings::default();
        assert_eq!(timings.poll_interval, Duration::from_millis(3_000));
        assert_eq!(timings.ack_timeout, Duration::from_millis(5_000));
        assert_eq!(timings.dedup_window, Duration::from_millis(5_000));
    }

    #[test]
    fn environment_overrides_defaults() {
        std::env::set_var("GENBOARD_API_BASE", "10.0.0.5:8000");
        std::env::set_var("GENBOARD_POLL_INTERVAL_MS", "1500");
        std::env::set_var("GENBOARD_TOKEN", "");

        let config = SyncConfig::from_env().unwrap();

        std::env::remove_var("GENBOARD_API_BASE");
        std::env::remove_var("GENBOARD_POLL_INTERVAL_MS");
        std::env::remove_var("GENBOARD_TOKEN");

        assert_eq!(config.api_base.as_str(), "http://10.0.0.5:8000/");
        assert_eq!(config.timings.poll_interval, Duration::from_millis(1_500));
        assert_eq!(config.timings.ack_timeout, Duration::from_millis(5_000));
        assert!(config.token.is_none());
    }
}
