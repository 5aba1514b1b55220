use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::bail;

use crate::join::fingerprint::ConfigFingerprint;
use crate::network::connection::ConnectionSettings;

#[derive(Debug, Clone)]
pub struct MessengerConfig {
    /// The host that manages to bind this address becomes the leader (host 0) of initial cluster
    ///  formation, all others join through it.
    pub coordinator_addr: SocketAddr,
    /// The interface to listen on for peer connections. If it is unspecified, the address that
    ///  is advertised to peers is the local address of the connection to the coordinator.
    pub internal_interface: IpAddr,
    /// 0 for an ephemeral port; not used by the leader, which listens on `coordinator_addr`
    pub listen_port: u16,
    pub expected_hosts: usize,
    pub fingerprint: ConfigFingerprint,

    /// if set, this host takes over a failed host's slot in a running cluster, sponsored by
    ///  the live member at this address
    pub rejoin_sponsor: Option<SocketAddr>,

    pub heartbeat_interval: Duration,
    /// a peer that was silent for this long is treated as failed
    pub heartbeat_timeout: Duration,

    /// bound for every single step of a handshake
    pub handshake_timeout: Duration,
    /// bound for the entire join, including retries
    pub join_timeout: Duration,
    pub join_retry_interval: Duration,
    pub rejoin_prepare_timeout: Duration,

    /// number of frames per peer connection
    pub outbound_queue_capacity: usize,
    pub socket_buffer_size: usize,
}

impl MessengerConfig {
    pub fn new(coordinator_addr: SocketAddr, expected_hosts: usize, fingerprint: ConfigFingerprint) -> MessengerConfig {
        let internal_interface = if coordinator_addr.ip().is_loopback() {
            coordinator_addr.ip()
        }
        else {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        };

        MessengerConfig {
            coordinator_addr,
            internal_interface,
            listen_port: 0,
            expected_hosts,
            fingerprint,
            rejoin_sponsor: None,
            heartbeat_interval: Duration::from_secs(1),
            heartbeat_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(5),
            join_timeout: Duration::from_secs(60),
            join_retry_interval: Duration::from_millis(500),
            rejoin_prepare_timeout: Duration::from_secs(10),
            outbound_queue_capacity: 4096,
            socket_buffer_size: 2*1024*1024,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.expected_hosts == 0 {
            bail!("expected_hosts must be at least 1");
        }
        if self.expected_hosts > u16::MAX as usize {
            bail!("expected_hosts must fit the roster size limit of {}", u16::MAX);
        }
        if self.outbound_queue_capacity == 0 {
            bail!("outbound_queue_capacity must be positive");
        }
        if self.heartbeat_interval.is_zero() {
            bail!("heartbeat_interval must be positive");
        }
        if self.heartbeat_timeout <= self.heartbeat_interval {
            bail!("heartbeat_timeout ({:?}) must be larger than heartbeat_interval ({:?})", self.heartbeat_timeout, self.heartbeat_interval);
        }
        if self.handshake_timeout.is_zero() || self.join_timeout.is_zero() {
            bail!("handshake and join timeouts must be positive");
        }
        Ok(())
    }

    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            outbound_queue_capacity: self.outbound_queue_capacity,
            socket_buffer_size: self.socket_buffer_size,
        }
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.internal_interface, self.listen_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn config() -> MessengerConfig {
        MessengerConfig::new("127.0.0.1:3021".parse().unwrap(), 3, ConfigFingerprint::compute(b"c", b"d"))
    }

    #[test]
    fn test_defaults_valid() {
        assert!(config().validate().is_ok());
    }

    #[rstest]
    #[case::loopback("127.0.0.1:3021", "127.0.0.1")]
    #[case::remote("10.1.2.3:3021", "0.0.0.0")]
    fn test_default_interface(#[case] coordinator: &str, #[case] expected: &str) {
        let config = MessengerConfig::new(coordinator.parse().unwrap(), 2, ConfigFingerprint::compute(b"c", b"d"));
        assert_eq!(config.internal_interface, expected.parse::<IpAddr>().unwrap());
    }

    #[rstest]
    #[case::no_hosts(|c: &mut MessengerConfig| c.expected_hosts = 0)]
    #[case::no_queue(|c: &mut MessengerConfig| c.outbound_queue_capacity = 0)]
    #[case::heartbeat_timeout_too_small(|c: &mut MessengerConfig| c.heartbeat_timeout = c.heartbeat_interval)]
    #[case::zero_heartbeat_interval(|c: &mut MessengerConfig| c.heartbeat_interval = Duration::ZERO)]
    #[case::zero_handshake_timeout(|c: &mut MessengerConfig| c.handshake_timeout = Duration::ZERO)]
    fn test_invalid(#[case] modify: fn(&mut MessengerConfig)) {
        let mut config = config();
        modify(&mut config);
        assert!(config.validate().is_err());
    }
}
