use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use argh::FromArgs;
use thiserror::Error;

pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;
pub const MAX_CONNECT_TIMEOUT_MS: u64 = 60 * 1000;
pub const MAX_PERIODIC_LOG_MS: u64 = 3600 * 1000;

/// Event-driven layer-4 TCP reverse proxy.
#[derive(FromArgs, Debug)]
pub struct Options {
    /// listen address and port, at least one required
    #[argh(option, short = 'l')]
    pub listen: Vec<String>,

    /// remote address and port, at least one required
    #[argh(option, short = 'r')]
    pub remote: Vec<String>,

    /// connect timeout in milliseconds, default 5000
    #[argh(option, short = 'c', default = "DEFAULT_CONNECT_TIMEOUT_MS")]
    pub connect_timeout_ms: u64,

    /// periodic log interval in milliseconds, 0 = disable, default 0
    #[argh(option, short = 'p', default = "0")]
    pub periodic_log_ms: u64,

    /// flush stdout after each log line
    #[argh(switch, short = 'f')]
    pub flush: bool,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid address:port argument: '{0}'")]
    InvalidAddrPort(String),

    #[error("error resolving address {0}: {1}")]
    Resolve(String, io::Error),

    #[error("address {0} did not resolve to any address")]
    NoAddresses(String),

    #[error("at least one -l listen address is required")]
    MissingListen,

    #[error("at least one -r remote address is required")]
    MissingRemote,

    #[error("invalid connect timeout argument '{0}': must be between 1 and 60000")]
    ConnectTimeoutRange(u64),

    #[error("invalid periodic log argument '{0}': must be between 0 and 3600000")]
    PeriodicLogRange(u64),
}

/// Immutable runtime configuration. Listeners and the upstream pool are
/// fixed at startup; the reactor reads nothing else from the outside.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub listen_addrs: Vec<SocketAddr>,
    pub remote_addrs: Vec<SocketAddr>,
    pub connect_timeout: Duration,
    /// Zero disables the periodic reporter.
    pub periodic_log: Duration,
    pub flush_log: bool,
}

impl ProxyConfig {
    pub fn from_options(opts: &Options) -> Result<ProxyConfig, ConfigError> {
        if opts.listen.is_empty() {
            return Err(ConfigError::MissingListen);
        }
        if opts.remote.is_empty() {
            return Err(ConfigError::MissingRemote);
        }
        if !(1..=MAX_CONNECT_TIMEOUT_MS).contains(&opts.connect_timeout_ms) {
            return Err(ConfigError::ConnectTimeoutRange(opts.connect_timeout_ms));
        }
        if opts.periodic_log_ms > MAX_PERIODIC_LOG_MS {
            return Err(ConfigError::PeriodicLogRange(opts.periodic_log_ms));
        }

        // One socket per -l flag, bound to the first address it resolves to.
        let mut listen_addrs = Vec::new();
        for arg in &opts.listen {
            listen_addrs.push(resolve_addr_port(arg)?[0]);
        }

        // Every address a -r flag resolves to joins the pool.
        let mut remote_addrs = Vec::new();
        for arg in &opts.remote {
            remote_addrs.extend(resolve_addr_port(arg)?);
        }

        Ok(ProxyConfig {
            listen_addrs,
            remote_addrs,
            connect_timeout: Duration::from_millis(opts.connect_timeout_ms),
            periodic_log: Duration::from_millis(opts.periodic_log_ms),
            flush_log: opts.flush,
        })
    }
}

/// Splits `host:port` on the last `:` so numeric IPv6 hosts keep their
/// colons, then resolves everything up front. DNS is never revisited once
/// the proxy is running.
pub fn resolve_addr_port(arg: &str) -> Result<Vec<SocketAddr>, ConfigError> {
    let (host, port) = arg
        .rsplit_once(':')
        .ok_or_else(|| ConfigError::InvalidAddrPort(arg.to_string()))?;

    if host.is_empty() || port.is_empty() {
        return Err(ConfigError::InvalidAddrPort(arg.to_string()));
    }

    let host = host.trim_start_matches('[').trim_end_matches(']');
    let port: u16 = port
        .parse()
        .map_err(|_| ConfigError::InvalidAddrPort(arg.to_string()))?;

    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|e| ConfigError::Resolve(arg.to_string(), e))?
        .collect();

    if addrs.is_empty() {
        return Err(ConfigError::NoAddresses(arg.to_string()));
    }

    Ok(addrs)
}

/// Printable `addr:port` form of a resolved address. Numeric host, no
/// brackets, the way it travels on the wire.
pub fn endpoint_string(addr: &SocketAddr) -> String {
    format!("{}:{}", addr.ip(), addr.port())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(listen: &[&str], remote: &[&str]) -> Options {
        Options {
            listen: listen.iter().map(|s| s.to_string()).collect(),
            remote: remote.iter().map(|s| s.to_string()).collect(),
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            periodic_log_ms: 0,
            flush: false,
        }
    }

    #[test]
    fn resolves_numeric_v4() {
        let addrs = resolve_addr_port("127.0.0.1:8080").unwrap();
        assert_eq!(addrs, vec!["127.0.0.1:8080".parse().unwrap()]);
    }

    #[test]
    fn resolves_numeric_v6_with_and_without_brackets() {
        let addrs = resolve_addr_port("[::1]:8080").unwrap();
        assert_eq!(addrs, vec!["[::1]:8080".parse().unwrap()]);

        // Split on the last colon: everything before it is the host.
        let addrs = resolve_addr_port("::1:8080").unwrap();
        assert_eq!(addrs, vec!["[::1]:8080".parse().unwrap()]);
    }

    #[test]
    fn rejects_missing_pieces() {
        assert!(matches!(
            resolve_addr_port("8080"),
            Err(ConfigError::InvalidAddrPort(_))
        ));
        assert!(matches!(
            resolve_addr_port(":8080"),
            Err(ConfigError::InvalidAddrPort(_))
        ));
        assert!(matches!(
            resolve_addr_port("localhost:"),
            Err(ConfigError::InvalidAddrPort(_))
        ));
        assert!(matches!(
            resolve_addr_port("127.0.0.1:notaport"),
            Err(ConfigError::InvalidAddrPort(_))
        ));
    }

    #[test]
    fn requires_listen_and_remote() {
        let opts = options(&[], &["127.0.0.1:1"]);
        assert!(matches!(
            ProxyConfig::from_options(&opts),
            Err(ConfigError::MissingListen)
        ));

        let opts = options(&["127.0.0.1:0"], &[]);
        assert!(matches!(
            ProxyConfig::from_options(&opts),
            Err(ConfigError::MissingRemote)
        ));
    }

    #[test]
    fn validates_ranges() {
        let mut opts = options(&["127.0.0.1:0"], &["127.0.0.1:1"]);

        opts.connect_timeout_ms = 0;
        assert!(matches!(
            ProxyConfig::from_options(&opts),
            Err(ConfigError::ConnectTimeoutRange(0))
        ));

        opts.connect_timeout_ms = MAX_CONNECT_TIMEOUT_MS + 1;
        assert!(matches!(
            ProxyConfig::from_options(&opts),
            Err(ConfigError::ConnectTimeoutRange(_))
        ));

        opts.connect_timeout_ms = DEFAULT_CONNECT_TIMEOUT_MS;
        opts.periodic_log_ms = MAX_PERIODIC_LOG_MS + 1;
        assert!(matches!(
            ProxyConfig::from_options(&opts),
            Err(ConfigError::PeriodicLogRange(_))
        ));
    }

    #[test]
    fn pool_collects_every_remote_flag() {
        let opts = options(&["127.0.0.1:0"], &["127.0.0.1:1001", "127.0.0.1:1002"]);
        let config = ProxyConfig::from_options(&opts).unwrap();
        assert_eq!(config.remote_addrs.len(), 2);
        assert_eq!(config.listen_addrs.len(), 1);
        assert!(!config.flush_log);
        assert_eq!(config.connect_timeout, Duration::from_millis(5000));
        assert!(config.periodic_log.is_zero());
    }

    #[test]
    fn endpoint_strings_are_bracket_free() {
        let v4: SocketAddr = "127.0.0.1:80".parse().unwrap();
        assert_eq!(endpoint_string(&v4), "127.0.0.1:80");

        let v6: SocketAddr = "[::1]:80".parse().unwrap();
        assert_eq!(endpoint_string(&v6), "::1:80");
    }
}
