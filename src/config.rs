use std::env;
use std::time::Duration;

/// Default listening port
pub const DEFAULT_PORT: u16 = 8080;

/// Default cap on a buffered playlist body (4 MiB)
pub const DEFAULT_MAX_PLAYLIST_BYTES: usize = 4 * 1024 * 1024;

/// Default cap on a buffered `/proxy` body (64 MiB)
pub const DEFAULT_MAX_PROXY_BODY_BYTES: usize = 64 * 1024 * 1024;

/// Default bound on concurrent upstream fetches
pub const DEFAULT_MAX_UPSTREAM_CONNECTIONS: usize = 256;

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    /// Connect timeout for every upstream fetch
    pub connect_timeout: Duration,
    /// Deadline for upstream response headers, and for reading a buffered
    /// body. Streamed segment bodies have no read deadline.
    pub request_timeout: Duration,
    /// Largest playlist body buffered for rewriting
    pub max_playlist_bytes: usize,
    /// Largest body buffered by the `/proxy` endpoint
    pub max_proxy_body_bytes: usize,
    /// Upper bound on concurrently open upstream fetches
    pub max_upstream_connections: usize,
    /// Reject loopback/private/link-local IP literals as targets
    pub block_private_origins: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            max_playlist_bytes: DEFAULT_MAX_PLAYLIST_BYTES,
            max_proxy_body_bytes: DEFAULT_MAX_PROXY_BODY_BYTES,
            max_upstream_connections: DEFAULT_MAX_UPSTREAM_CONNECTIONS,
            block_private_origins: false,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Every variable is optional; a value that is present but malformed is
    /// an error rather than a silent fallback.
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let defaults = Config::default();

        let port = parse_var("PORT", defaults.port)?;

        let connect_timeout = Duration::from_secs(parse_var(
            "UPSTREAM_CONNECT_TIMEOUT_SECS",
            defaults.connect_timeout.as_secs(),
        )?);

        let request_timeout = Duration::from_secs(parse_var(
            "UPSTREAM_REQUEST_TIMEOUT_SECS",
            defaults.request_timeout.as_secs(),
        )?);

        let max_playlist_bytes = parse_var("MAX_PLAYLIST_BYTES", defaults.max_playlist_bytes)?;
        let max_proxy_body_bytes =
            parse_var("MAX_PROXY_BODY_BYTES", defaults.max_proxy_body_bytes)?;

        // A zero-permit semaphore would stall every request
        let max_upstream_connections: usize =
            parse_var("MAX_UPSTREAM_CONNECTIONS", defaults.max_upstream_connections)?;
        if max_upstream_connections == 0 {
            return Err("MAX_UPSTREAM_CONNECTIONS must be at least 1".into());
        }

        let block_private_origins = match env::var("BLOCK_PRIVATE_ORIGINS") {
            Ok(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"),
            Err(_) => defaults.block_private_origins,
        };

        Ok(Config {
            port,
            connect_timeout,
            request_timeout,
            max_playlist_bytes,
            max_proxy_body_bytes,
            max_upstream_connections,
            block_private_origins,
        })
    }
}

/// Parse `name` from the environment, or return `default` when unset.
fn parse_var<T>(name: &str, default: T) -> Result<T, Box<dyn std::error::Error>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| format!("{name} is not valid ({raw:?}): {e}").into()),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Serialize all env-var tests to prevent races between parallel test threads.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const ALL_VARS: &[&str] = &[
        "PORT",
        "UPSTREAM_CONNECT_TIMEOUT_SECS",
        "UPSTREAM_REQUEST_TIMEOUT_SECS",
        "MAX_PLAYLIST_BYTES",
        "MAX_PROXY_BODY_BYTES",
        "MAX_UPSTREAM_CONNECTIONS",
        "BLOCK_PRIVATE_ORIGINS",
    ];

    /// Set env vars, run `f`, then restore original state.
    ///
    /// `set`: vars to set; `unset`: vars to remove before running `f`.
    fn with_env(set: &[(&str, &str)], unset: &[&str], f: impl FnOnce()) {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|p| p.into_inner());

        let save_set: Vec<(&str, Option<String>)> = set
            .iter()
            .map(|(k, _)| (*k, std::env::var(k).ok()))
            .collect();
        let save_unset: Vec<(&str, Option<String>)> =
            unset.iter().map(|k| (*k, std::env::var(k).ok())).collect();

        for (k, v) in set {
            // SAFETY: serialized by ENV_LOCK, so no other thread modifies env vars concurrently.
            unsafe { std::env::set_var(k, v) };
        }
        for k in unset {
            unsafe { std::env::remove_var(k) };
        }

        f();

        for (k, old) in save_set.into_iter().chain(save_unset) {
            match old {
                Some(v) => unsafe { std::env::set_var(k, v) },
                None => unsafe { std::env::remove_var(k) },
            }
        }
    }

    #[test]
    fn defaults_when_unset() {
        with_env(&[], ALL_VARS, || {
            let config = Config::from_env().expect("defaults should load");
            assert_eq!(config.port, 8080);
            assert_eq!(config.connect_timeout, Duration::from_secs(10));
            assert_eq!(config.request_timeout, Duration::from_secs(30));
            assert_eq!(config.max_playlist_bytes, DEFAULT_MAX_PLAYLIST_BYTES);
            assert_eq!(config.max_proxy_body_bytes, DEFAULT_MAX_PROXY_BODY_BYTES);
            assert_eq!(
                config.max_upstream_connections,
                DEFAULT_MAX_UPSTREAM_CONNECTIONS
            );
            assert!(!config.block_private_origins);
        });
    }

    #[test]
    fn port_parsed() {
        with_env(&[("PORT", "3000")], &[], || {
            let config = Config::from_env().unwrap();
            assert_eq!(config.port, 3000);
        });
    }

    #[test]
    fn malformed_port_is_an_error() {
        with_env(&[("PORT", "eighty")], &[], || {
            assert!(Config::from_env().is_err());
        });
    }

    #[test]
    fn zero_upstream_connections_rejected() {
        with_env(&[("MAX_UPSTREAM_CONNECTIONS", "0")], &["PORT"], || {
            assert!(Config::from_env().is_err());
        });
    }

    #[test]
    fn limits_and_timeouts_parsed() {
        with_env(
            &[
                ("UPSTREAM_CONNECT_TIMEOUT_SECS", "3"),
                ("UPSTREAM_REQUEST_TIMEOUT_SECS", "12"),
                ("MAX_PLAYLIST_BYTES", "1024"),
                ("MAX_PROXY_BODY_BYTES", "2048"),
                ("MAX_UPSTREAM_CONNECTIONS", "8"),
            ],
            &["PORT"],
            || {
                let config = Config::from_env().unwrap();
                assert_eq!(config.connect_timeout, Duration::from_secs(3));
                assert_eq!(config.request_timeout, Duration::from_secs(12));
                assert_eq!(config.max_playlist_bytes, 1024);
                assert_eq!(config.max_proxy_body_bytes, 2048);
                assert_eq!(config.max_upstream_connections, 8);
            },
        );
    }

    #[test]
    fn block_private_origins_flag() {
        with_env(&[("BLOCK_PRIVATE_ORIGINS", "true")], &["PORT"], || {
            assert!(Config::from_env().unwrap().block_private_origins);
        });
        with_env(&[("BLOCK_PRIVATE_ORIGINS", "off")], &["PORT"], || {
            assert!(!Config::from_env().unwrap().block_private_origins);
        });
    }
}
