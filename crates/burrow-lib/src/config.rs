//! Broker configuration

use burrow_control::TunnelConfig;
use std::net::IpAddr;
use std::time::Duration;

/// Broker configuration, normally filled from CLI flags / environment
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Address public listeners and the control listener bind to
    pub bind_addr: IpAddr,

    /// Control port agents dial; 0 picks an ephemeral port
    pub control_port: u16,

    /// Store DSN (`postgres://...`, `sqlite://...`, `sqlite::memory:`)
    pub database_url: String,

    /// How long shutdown waits for in-flight connections to drain
    pub drain_timeout: Duration,

    /// Per-tunnel timeouts
    pub tunnel: TunnelConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".parse().expect("valid literal"),
            control_port: 9999,
            database_url: "sqlite::memory:".to_string(),
            drain_timeout: Duration::from_secs(30),
            tunnel: TunnelConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BrokerConfig::default();
        assert_eq!(config.bind_addr.to_string(), "0.0.0.0");
        assert_eq!(config.control_port, 9999);
        assert_eq!(config.tunnel.pairing_timeout, Duration::from_secs(10));
    }
}
