use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::join::fingerprint::ConfigFingerprint;
use crate::messaging::codec::MessageRegistry;
use crate::messaging::message::FIRST_APPLICATION_TAG;
use crate::messenger::host_messenger::HostMessenger;
use crate::messenger::messenger_config::MessengerConfig;

/// the application tag registered by [test_registry]
pub const TEST_PAYLOAD_TAG: u8 = FIRST_APPLICATION_TAG;

pub fn test_fingerprint() -> ConfigFingerprint {
    ConfigFingerprint::compute(b"create table t (id bigint not null);", b"<deployment sitesperhost=\"2\"/>")
}

/// a config with timeouts that are short enough for tests on the loopback interface
pub fn test_config(coordinator_addr: SocketAddr, expected_hosts: usize) -> MessengerConfig {
    let mut config = MessengerConfig::new(coordinator_addr, expected_hosts, test_fingerprint());
    config.heartbeat_interval = Duration::from_millis(100);
    config.heartbeat_timeout = Duration::from_secs(3);
    config.handshake_timeout = Duration::from_secs(2);
    config.join_timeout = Duration::from_secs(10);
    config.join_retry_interval = Duration::from_millis(100);
    config.rejoin_prepare_timeout = Duration::from_secs(3);
    config
}

pub fn test_registry() -> MessageRegistry {
    let mut registry = MessageRegistry::new();
    registry.register_payload(TEST_PAYLOAD_TAG)
        .expect("first application tag is free");
    registry
}

/// Starts `n` hosts forming a cluster on a fresh loopback coordinator address, returning them
///  ordered by host id
pub async fn start_test_cluster(n: usize) -> Vec<Arc<HostMessenger>> {
    start_test_cluster_with(n, |_| {}).await
}

pub async fn start_test_cluster_with(n: usize, customize: impl Fn(&mut MessengerConfig)) -> Vec<Arc<HostMessenger>> {
    let coordinator = super::net::free_local_addr();

    let mut starts = Vec::new();
    for i in 0..n {
        let mut config = test_config(coordinator, n);
        customize(&mut config);
        starts.push(tokio::spawn(async move {
            // the first host binds the coordinator address before the others try
            tokio::time::sleep(Duration::from_millis(50 * i as u64)).await;
            HostMessenger::start(config, test_registry()).await
        }));
    }

    let mut result = Vec::new();
    for start in starts {
        result.push(start.await.unwrap().unwrap());
    }
    result.sort_by_key(|m| m.host_id());
    result
}
