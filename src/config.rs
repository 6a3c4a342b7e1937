//! Process configuration.
//!
//! Values come from the environment, optionally layered over a YAML file
//! named by `CONFIG_FILE`. Configuration is resolved once at startup and
//! shared read-only afterwards.

use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::tunnel::Credentials;

pub const DEFAULT_UPSTREAM_BASE_URL: &str = "https://api.openai.com";
pub const DEFAULT_LISTEN_HOST: &str = "0.0.0.0";
pub const DEFAULT_LISTEN_PORT: u16 = 8868;
pub const DEFAULT_PREFIX: &str = "/v1";
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_READ_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("failed to read config file {path}: {source}")]
    File {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Yaml {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}

impl ConfigError {
    fn invalid(key: &'static str, value: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key,
            value: value.into(),
            reason: reason.into(),
        }
    }
}

/// Where the SOCKS5 intermediary lives and how to log in to it.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub host: String,
    pub port: u16,
    pub credentials: Option<Credentials>,
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Scheme, host, port and base path every request is forwarded under.
    pub upstream_base_url: Url,
    pub tunnel: TunnelConfig,
    pub listen_host: String,
    pub listen_port: u16,
    /// Only paths starting with this prefix are relayed.
    pub path_prefix: String,
    pub connect_timeout: Duration,
    /// Per-read idle limit on the upstream connection.
    pub read_timeout: Duration,
    /// Deadline for a whole buffered exchange.
    pub request_timeout: Duration,
    pub debug: bool,
}

/// YAML file layout. Every field is optional; the environment fills gaps.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub upstream_base_url: Option<String>,
    pub tunnel: TunnelSection,
    pub listen: ListenSection,
    pub prefix: Option<String>,
    pub timeouts: TimeoutSection,
    pub debug: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TunnelSection {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ListenSection {
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimeoutSection {
    pub connect_secs: Option<u64>,
    pub read_secs: Option<u64>,
    pub request_secs: Option<u64>,
}

impl FileConfig {
    pub fn from_yaml(path: &str, text: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(text).map_err(|source| ConfigError::Yaml {
            path: path.to_string(),
            source,
        })
    }
}

impl ProxyConfig {
    /// Loads configuration from the process environment and, when
    /// `CONFIG_FILE` is set, from that YAML file underneath it.
    pub fn load() -> Result<Self, ConfigError> {
        let file = match std::env::var("CONFIG_FILE") {
            Ok(path) if !path.trim().is_empty() => {
                let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::File {
                    path: path.clone(),
                    source,
                })?;
                FileConfig::from_yaml(&path, &text)?
            }
            _ => FileConfig::default(),
        };

        Self::resolve(file, |key| std::env::var(key).ok())
    }

    /// Merges `file` with values from `lookup` (environment wins) and
    /// validates the result.
    pub fn resolve<F>(file: FileConfig, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let base = env("UPSTREAM_BASE_URL")
            .or_else(|| env("OPENAI_BASE_URL"))
            .or(file.upstream_base_url)
            .unwrap_or_else(|| DEFAULT_UPSTREAM_BASE_URL.to_string());
        let upstream_base_url = parse_base_url(&base)?;

        let tunnel_host = env("SOCKS5_PROXY_HOST")
            .or(file.tunnel.host)
            .ok_or(ConfigError::Missing("SOCKS5_PROXY_HOST"))?;
        let tunnel_port = match env("SOCKS5_PROXY_PORT") {
            Some(raw) => parse_port("SOCKS5_PROXY_PORT", &raw)?,
            None => file
                .tunnel
                .port
                .ok_or(ConfigError::Missing("SOCKS5_PROXY_PORT"))?,
        };
        if tunnel_port == 0 {
            return Err(ConfigError::invalid("SOCKS5_PROXY_PORT", "0", "port must be non-zero"));
        }

        let username = env("SOCKS5_PROXY_USERNAME").or(file.tunnel.username);
        let password = env("SOCKS5_PROXY_PASSWORD").or(file.tunnel.password);
        let credentials = parse_credentials(username, password)?;

        let listen_host = env("LISTEN_HOST")
            .or(file.listen.host)
            .unwrap_or_else(|| DEFAULT_LISTEN_HOST.to_string());
        let listen_port = match env("LISTEN_PORT") {
            Some(raw) => parse_port("LISTEN_PORT", &raw)?,
            None => file.listen.port.unwrap_or(DEFAULT_LISTEN_PORT),
        };

        let path_prefix = env("PROXY_PREFIX")
            .or(file.prefix)
            .unwrap_or_else(|| DEFAULT_PREFIX.to_string());
        if !path_prefix.starts_with('/') {
            return Err(ConfigError::invalid("PROXY_PREFIX", path_prefix, "must start with '/'"));
        }

        let connect_timeout = timeout_secs(
            "CONNECT_TIMEOUT_SECS",
            env("CONNECT_TIMEOUT_SECS"),
            file.timeouts.connect_secs,
            DEFAULT_CONNECT_TIMEOUT_SECS,
        )?;
        let read_timeout = timeout_secs(
            "READ_TIMEOUT_SECS",
            env("READ_TIMEOUT_SECS"),
            file.timeouts.read_secs,
            DEFAULT_READ_TIMEOUT_SECS,
        )?;
        let request_timeout = timeout_secs(
            "REQUEST_TIMEOUT_SECS",
            env("REQUEST_TIMEOUT_SECS"),
            file.timeouts.request_secs,
            DEFAULT_REQUEST_TIMEOUT_SECS,
        )?;

        let debug = match env("DEBUG") {
            Some(raw) => parse_bool("DEBUG", &raw)?,
            None => file.debug.unwrap_or(false),
        };

        Ok(Self {
            upstream_base_url,
            tunnel: TunnelConfig {
                host: tunnel_host,
                port: tunnel_port,
                credentials,
            },
            listen_host,
            listen_port,
            path_prefix,
            connect_timeout,
            read_timeout,
            request_timeout,
            debug,
        })
    }

    /// Address the listener binds to.
    pub fn listen_addr(&self) -> String {
        if self.listen_host.contains(':') && !self.listen_host.starts_with('[') {
            format!("[{}]:{}", self.listen_host, self.listen_port)
        } else {
            format!("{}:{}", self.listen_host, self.listen_port)
        }
    }

    /// Whether `path` falls under the relayed prefix.
    ///
    /// `/v1` matches `/v1` and `/v1/...` but not `/v1beta`.
    pub fn is_proxied_path(&self, path: &str) -> bool {
        let prefix = self.path_prefix.trim_end_matches('/');
        if prefix.is_empty() {
            return path.starts_with('/');
        }
        match path.strip_prefix(prefix) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }
}

fn parse_base_url(raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw)
        .map_err(|e| ConfigError::invalid("UPSTREAM_BASE_URL", raw, e.to_string()))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::invalid("UPSTREAM_BASE_URL", raw, "scheme must be http or https"));
    }
    if url.host_str().is_none() {
        return Err(ConfigError::invalid("UPSTREAM_BASE_URL", raw, "missing host"));
    }
    if url.query().is_some() || url.fragment().is_some() {
        return Err(ConfigError::invalid(
            "UPSTREAM_BASE_URL",
            raw,
            "must not carry a query or fragment",
        ));
    }

    Ok(url)
}

fn parse_port(key: &'static str, raw: &str) -> Result<u16, ConfigError> {
    raw.parse::<u16>()
        .map_err(|e| ConfigError::invalid(key, raw, e.to_string()))
}

fn parse_credentials(
    username: Option<String>,
    password: Option<String>,
) -> Result<Option<Credentials>, ConfigError> {
    match (username, password) {
        (None, None) => Ok(None),
        (Some(_), None) => Err(ConfigError::Missing("SOCKS5_PROXY_PASSWORD")),
        (None, Some(_)) => Err(ConfigError::Missing("SOCKS5_PROXY_USERNAME")),
        (Some(username), Some(password)) => {
            if username.is_empty() || password.is_empty() {
                return Err(ConfigError::invalid(
                    "SOCKS5_PROXY_USERNAME",
                    "<omitted>",
                    "username and password must not be empty",
                ));
            }
            if username.len() > 255 {
                return Err(ConfigError::invalid(
                    "SOCKS5_PROXY_USERNAME",
                    "<omitted>",
                    "longer than 255 bytes",
                ));
            }
            if password.len() > 255 {
                return Err(ConfigError::invalid(
                    "SOCKS5_PROXY_PASSWORD",
                    "<omitted>",
                    "longer than 255 bytes",
                ));
            }
            Ok(Some(Credentials { username, password }))
        }
    }
}

fn timeout_secs(
    key: &'static str,
    env_value: Option<String>,
    file_value: Option<u64>,
    default: u64,
) -> Result<Duration, ConfigError> {
    let secs = match env_value {
        Some(raw) => raw
            .parse::<u64>()
            .map_err(|e| ConfigError::invalid(key, raw.as_str(), e.to_string()))?,
        None => file_value.unwrap_or(default),
    };
    if secs == 0 {
        return Err(ConfigError::invalid(key, "0", "must be at least one second"));
    }
    Ok(Duration::from_secs(secs))
}

fn parse_bool(key: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::invalid(key, raw, "expected true or false")),
    }
}
