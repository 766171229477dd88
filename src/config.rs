use crate::error::{InterceptError, Result};
use crate::proxy::egress::{format_tcp_addr, split_target};
use std::env;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

/// Platform on which the detour transport is unavailable.
pub const PLATFORM_WITHOUT_DETOUR: &str = "android";

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Proxy server configuration
    pub proxy: ProxyServerConfig,
    /// Connection registry reporting
    pub registry: RegistryConfig,
    /// Logging configuration
    pub log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct ProxyServerConfig {
    /// Port for the proxy server (default: 8080)
    pub port: u16,
    /// Host to bind to (default: 0.0.0.0)
    pub host: String,
    /// QoS class requested when the client does not ask for one
    pub min_qos: i64,
    /// Dial every tunnel directly, never through the detour
    pub proxy_all: bool,
    /// Platform identifier (defaults to the compile-time OS)
    pub platform: String,
    /// Connection timeout in seconds
    pub connect_timeout: u64,
    /// Plain HTTP request timeout in seconds
    pub request_timeout: u64,
    /// Optional egress proxy the detour falls back to
    pub detour_egress: Option<EgressProxyConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EgressProxyProtocol {
    Http,
    Socks5,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EgressProxyConfig {
    pub protocol: EgressProxyProtocol,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Seconds between registry summaries (default: 10)
    pub report_interval: u64,
    /// Age in seconds above which a connection is reported at debug level (default: 600)
    pub long_lived_threshold: u64,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source
    pub fn from_vars<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(lookup);
        Ok(Config {
            proxy: ProxyServerConfig {
                port: vars.parse("PROXY_PORT", 8080, "a valid port number")?,
                host: vars.get_or("PROXY_HOST", "0.0.0.0"),
                min_qos: vars.parse("MIN_QOS", 0, "an integer")?,
                proxy_all: vars.get_or("PROXY_ALL", "false").parse().unwrap_or(false),
                platform: vars.get_or("PLATFORM", env::consts::OS),
                connect_timeout: vars
                    .get_or("PROXY_CONNECT_TIMEOUT", "10")
                    .parse()
                    .unwrap_or(10),
                request_timeout: vars
                    .get_or("PROXY_REQUEST_TIMEOUT", "30")
                    .parse()
                    .unwrap_or(30),
                detour_egress: vars
                    .get("DETOUR_EGRESS_PROXY")
                    .map(|raw| raw.parse::<EgressProxyConfig>())
                    .transpose()?,
            },
            registry: RegistryConfig {
                report_interval: vars.parse(
                    "REGISTRY_REPORT_INTERVAL",
                    10,
                    "a number of seconds",
                )?,
                long_lived_threshold: vars.parse(
                    "REGISTRY_LONG_LIVED_THRESHOLD",
                    600,
                    "a number of seconds",
                )?,
            },
            log: LogConfig {
                level: vars.get_or("LOG_LEVEL", "info"),
                format: vars.get_or("LOG_FORMAT", "pretty"),
            },
        })
    }

    /// Get the proxy server address
    pub fn proxy_addr(&self) -> String {
        format!("{}:{}", self.proxy.host, self.proxy.port)
    }

    /// Whether tunnels must bypass the detour wrapper
    pub fn force_direct(&self) -> bool {
        self.proxy.platform == PLATFORM_WITHOUT_DETOUR || self.proxy.proxy_all
    }
}

impl ProxyServerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }
}

impl RegistryConfig {
    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval.max(1))
    }

    pub fn long_lived_threshold(&self) -> Duration {
        Duration::from_secs(self.long_lived_threshold)
    }
}

impl FromStr for EgressProxyConfig {
    type Err = InterceptError;

    /// Parses `http://[user:pass@]host[:port]` or `socks5://...`.
    fn from_str(raw: &str) -> Result<Self> {
        let invalid =
            |reason: &str| InterceptError::InvalidConfig(format!("DETOUR_EGRESS_PROXY {}", reason));

        let url = Url::parse(raw).map_err(|e| invalid(&format!("is not a URL: {}", e)))?;
        let (protocol, default_port) = match url.scheme() {
            "http" => (EgressProxyProtocol::Http, 80),
            "socks5" | "socks5h" => (EgressProxyProtocol::Socks5, 1080),
            other => return Err(invalid(&format!("has unsupported scheme {}", other))),
        };
        if url.path().len() > 1 || url.query().is_some() || url.fragment().is_some() {
            return Err(invalid("must name only the proxy"));
        }

        let host = url.host_str().unwrap_or_default();
        let (host, port) = split_target(&format_tcp_addr(host, url.port().unwrap_or(default_port)))
            .map_err(|_| invalid("must include a host"))?;

        let username = Some(url.username())
            .filter(|name| !name.is_empty())
            .map(str::to_string);
        let password = username
            .as_ref()
            .map(|_| url.password().unwrap_or_default().to_string());
        // RFC 1929 has no empty-password form.
        if protocol == EgressProxyProtocol::Socks5 && password.as_deref() == Some("") {
            return Err(invalid("socks5 credentials need a password"));
        }

        Ok(Self {
            protocol,
            host,
            port,
            username,
            password,
        })
    }
}

/// Variable source with defaults and typed parsing
struct Vars<F>(F);

impl<F: Fn(&str) -> Option<String>> Vars<F> {
    /// Non-blank value of `key`
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn get_or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    fn parse<T: FromStr>(&self, key: &str, default: T, expected: &str) -> Result<T> {
        match self.get(key) {
            Some(value) => value.parse().map_err(|_| {
                InterceptError::InvalidConfig(format!("{} must be {}", key, expected))
            }),
            None => Ok(default),
        }
    }
}
