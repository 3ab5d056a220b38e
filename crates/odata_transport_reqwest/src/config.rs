use std::collections::BTreeMap;
use std::env;
use std::time::Duration;

use tracing::warn;

pub const ENV_BASE_URL: &str = "ODATA_BASE_URL";
pub const ENV_TIMEOUT_SECS: &str = "ODATA_TIMEOUT_SECS";
pub const ENV_CONNECT_TIMEOUT_SECS: &str = "ODATA_CONNECT_TIMEOUT_SECS";
pub const ENV_USER_AGENT: &str = "ODATA_USER_AGENT";

pub const DEFAULT_BASE_URL: &str = "http://localhost";

/// Destination and connection settings of a [`crate::ReqwestTransport`].
#[derive(Debug, Clone)]
pub struct ReqwestTransportConfig {
    /// Scheme, host and optional path prefix that request URIs are appended to.
    pub base_url: String,
    /// Total time allowed per request.
    pub timeout: Option<Duration>,
    pub connect_timeout: Option<Duration>,
    /// Optional `User-Agent` override.
    pub user_agent: Option<String>,
    /// Headers sent with every request unless the request sets them itself.
    pub default_headers: BTreeMap<String, String>,
}

impl Default for ReqwestTransportConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: None,
            connect_timeout: None,
            user_agent: None,
            default_headers: BTreeMap::new(),
        }
    }
}

impl ReqwestTransportConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    /// Defaults overridden by the `ODATA_*` environment variables that are set and non-empty.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(base_url) = env_value(ENV_BASE_URL) {
            config.base_url = base_url;
        }
        if let Some(timeout) = env_seconds(ENV_TIMEOUT_SECS) {
            config.timeout = Some(timeout);
        }
        if let Some(timeout) = env_seconds(ENV_CONNECT_TIMEOUT_SECS) {
            config.connect_timeout = Some(timeout);
        }
        if let Some(user_agent) = env_value(ENV_USER_AGENT) {
            config.user_agent = Some(user_agent);
        }
        config
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn insert_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_headers.insert(key.into(), value.into());
        self
    }

    pub fn with_headers(mut self, headers: impl IntoIterator<Item = (String, String)>) -> Self {
        self.default_headers.extend(headers);
        self
    }

    /// `base_url` joined with a request URI that starts at the host root.
    pub fn resolve(&self, uri: &str) -> String {
        let base = self.base_url.trim_end_matches('/');
        if uri.starts_with('/') {
            format!("{base}{uri}")
        } else {
            format!("{base}/{uri}")
        }
    }
}

fn env_value(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_seconds(key: &str) -> Option<Duration> {
    let value = env_value(key)?;
    match value.parse::<u64>() {
        Ok(seconds) => Some(Duration::from_secs(seconds)),
        Err(_) => {
            warn!(key, value, "ignoring unparsable number of seconds");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Mutex, OnceLock};

    use tracing_test::traced_test;

    use super::*;

    struct EnvGuard {
        key: &'static str,
        previous: Option<String>,
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            if let Some(value) = &self.previous {
                env::set_var(self.key, value);
            } else {
                env::remove_var(self.key);
            }
        }
    }

    fn env_lock() -> std::sync::MutexGuard<'static, ()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(()))
            .lock()
            .expect("env lock poisoned")
    }

    fn set_env_guard(key: &'static str, value: Option<&str>) -> EnvGuard {
        let previous = env::var(key).ok();
        if let Some(value) = value {
            env::set_var(key, value);
        } else {
            env::remove_var(key);
        }
        EnvGuard { key, previous }
    }

    #[test]
    fn env_defaults_apply_when_unset() {
        let _lock = env_lock();
        let _g1 = set_env_guard(ENV_BASE_URL, None);
        let _g2 = set_env_guard(ENV_TIMEOUT_SECS, None);
        let _g3 = set_env_guard(ENV_CONNECT_TIMEOUT_SECS, None);
        let _g4 = set_env_guard(ENV_USER_AGENT, None);

        let config = ReqwestTransportConfig::from_env();
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
        assert!(config.timeout.is_none());
        assert!(config.connect_timeout.is_none());
        assert!(config.user_agent.is_none());
    }

    #[test]
    fn env_values_override_defaults() {
        let _lock = env_lock();
        let _g1 = set_env_guard(ENV_BASE_URL, Some("https://host.example/sap"));
        let _g2 = set_env_guard(ENV_TIMEOUT_SECS, Some("30"));
        let _g3 = set_env_guard(ENV_CONNECT_TIMEOUT_SECS, Some(" 5 "));
        let _g4 = set_env_guard(ENV_USER_AGENT, Some("odata-tests"));

        let config = ReqwestTransportConfig::from_env();
        assert_eq!(config.base_url, "https://host.example/sap");
        assert_eq!(config.timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.connect_timeout, Some(Duration::from_secs(5)));
        assert_eq!(config.user_agent.as_deref(), Some("odata-tests"));
    }

    #[test]
    #[traced_test]
    fn empty_and_unparsable_env_values_fall_back() {
        let _lock = env_lock();
        let _g1 = set_env_guard(ENV_BASE_URL, Some("  "));
        let _g2 = set_env_guard(ENV_TIMEOUT_SECS, Some("soon"));
        let _g3 = set_env_guard(ENV_CONNECT_TIMEOUT_SECS, Some(""));
        let _g4 = set_env_guard(ENV_USER_AGENT, None);

        let config = ReqwestTransportConfig::from_env();
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
        assert!(config.timeout.is_none());
        assert!(config.connect_timeout.is_none());
        assert!(logs_contain("ignoring unparsable number of seconds"));
    }

    #[test]
    fn resolve_joins_base_and_request_uri() {
        let config = ReqwestTransportConfig::new("https://host.example/");
        assert_eq!(
            config.resolve("/svc/People?$top=1"),
            "https://host.example/svc/People?$top=1"
        );
        assert_eq!(config.resolve("svc/$batch"), "https://host.example/svc/$batch");
    }

    #[test]
    fn builder_collects_default_headers() {
        let config = ReqwestTransportConfig::default()
            .with_timeout(Duration::from_secs(2))
            .insert_header("sap-client", "001")
            .with_headers([("Authorization".to_string(), "Basic abc".to_string())]);

        assert_eq!(config.timeout, Some(Duration::from_secs(2)));
        assert_eq!(config.default_headers.len(), 2);
        assert_eq!(
            config.default_headers.get("sap-client").map(String::as_str),
            Some("001")
        );
    }
}
