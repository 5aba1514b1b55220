use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::timeout;

use crate::join::fingerprint::ConfigFingerprint;
use crate::join::join_messages::RejectReason;
use crate::join::socket_joiner::{JoinError, JoinState, SocketJoiner};
use crate::messaging::mailbox::{BlockingRecv, Mailbox};
use crate::messaging::message::{FailureSiteUpdateData, VoltMessage, TAG_FAILURE_SITE_UPDATE};
use crate::messaging::message_sender::SendError;
use crate::messaging::site_id::{HostId, MailboxId, SiteId};
use crate::messaging::subject::Subject;
use crate::messenger::host_messenger::HostMessenger;
use crate::messenger::messenger_events::{MessengerEvent, PoisonPillData};
use crate::test_util::net::free_local_addr;
use crate::test_util::node::{start_test_cluster, start_test_cluster_with, test_config, test_registry, TEST_PAYLOAD_TAG};

const MAILBOX: MailboxId = MailboxId(7);

fn payload(source: SiteId, body: impl Into<bytes::Bytes>) -> VoltMessage {
    VoltMessage::payload(TEST_PAYLOAD_TAG, Subject::Default, source, body)
}

fn site_with_mailbox(messenger: &HostMessenger, local_index: u32) -> (SiteId, Arc<Mailbox>) {
    let site = messenger.host_id().site(local_index);
    messenger.create_local_site(site).unwrap();
    let mailbox = messenger.create_mailbox(site, MAILBOX, false).unwrap();
    (site, mailbox)
}

async fn wait_for_event(events: &mut broadcast::Receiver<MessengerEvent>, expected: MessengerEvent) {
    let found = timeout(Duration::from_secs(10), async {
        loop {
            if events.recv().await.unwrap() == expected {
                return;
            }
        }
    }).await;
    assert!(found.is_ok(), "{:?} did not arrive in time", expected);
}

async fn recv_on(mailbox: &Mailbox, subjects: &[Subject]) -> VoltMessage {
    match mailbox.recv_blocking(subjects, Some(Duration::from_secs(10))).await {
        BlockingRecv::Message(msg) => msg,
        other => panic!("expected a message, got {:?}", other),
    }
}

/// application payloads only, failure notifications stay queued
async fn recv(mailbox: &Mailbox) -> VoltMessage {
    recv_on(mailbox, &[Subject::Default]).await
}

async fn recv_failure_update(mailbox: &Mailbox) -> FailureSiteUpdateData {
    match recv_on(mailbox, &[Subject::FailureSiteUpdate]).await {
        VoltMessage::FailureSiteUpdate(data) => data,
        other => panic!("expected a failure notification, got {:?}", other),
    }
}

#[tokio::test]
async fn test_two_hosts_converge() {
    let hosts = start_test_cluster(2).await;
    let (a, b) = (&hosts[0], &hosts[1]);

    assert_eq!(a.host_id(), HostId(0));
    assert_eq!(b.host_id(), HostId(1));
    assert_eq!(a.count_foreign_hosts(), 1);
    assert_eq!(b.count_foreign_hosts(), 1);
    assert_eq!(a.live_hosts(), vec![HostId(0), HostId(1)]);
    assert_eq!(b.live_hosts(), vec![HostId(0), HostId(1)]);
    assert_eq!(a.roster(), b.roster());
    assert!(a.failed_hosts().is_empty());

    assert_eq!(a.hostname_for_host(HostId(1)), Some("127.0.0.1".to_string()));
    assert_eq!(a.hostname_for_host(HostId(5)), None);
}

#[tokio::test]
async fn test_three_hosts_full_mesh() {
    let hosts = start_test_cluster(3).await;
    for host in &hosts {
        assert_eq!(host.count_foreign_hosts(), 2);
        assert_eq!(host.live_hosts(), vec![HostId(0), HostId(1), HostId(2)]);
    }
}

#[tokio::test]
async fn test_remote_delivery() {
    let hosts = start_test_cluster(2).await;
    let (site_a, mailbox_a) = site_with_mailbox(&hosts[0], 0);
    let (site_b, mailbox_b) = site_with_mailbox(&hosts[1], 0);

    mailbox_a.send(site_b, MAILBOX, payload(site_a, &b"hello"[..])).await.unwrap();
    assert_eq!(recv(&mailbox_b).await, payload(site_a, &b"hello"[..]));

    // and back, with a payload that spans many reads
    let big: Vec<u8> = (0..3*1024*1024).map(|_| rand::random::<u8>()).collect();
    mailbox_b.send(site_a, MAILBOX, payload(site_b, big.clone())).await.unwrap();
    assert_eq!(recv(&mailbox_a).await, payload(site_b, big));
}

#[tokio::test]
async fn test_local_delivery() {
    let hosts = start_test_cluster(1).await;
    let (site_0, mailbox_0) = site_with_mailbox(&hosts[0], 0);
    let (site_1, mailbox_1) = site_with_mailbox(&hosts[0], 1);

    mailbox_0.send(site_1, MAILBOX, payload(site_0, &b"local"[..])).await.unwrap();
    assert_eq!(mailbox_1.recv_any(), Some(payload(site_0, &b"local"[..])));
    assert_eq!(
        mailbox_0.send(site_1, MailboxId(99), payload(site_0, &b"x"[..])).await,
        Err(SendError::NoSuchMailbox(site_1, MailboxId(99))),
    );
}

#[tokio::test]
async fn test_fifo_per_sender_and_subject() {
    let hosts = start_test_cluster(2).await;
    let (site_a, mailbox_a) = site_with_mailbox(&hosts[0], 0);
    let (site_b, mailbox_b) = site_with_mailbox(&hosts[1], 0);

    for i in 0..200u32 {
        let subject = if i % 3 == 0 { Subject::Failure } else { Subject::Default };
        let msg = VoltMessage::payload(TEST_PAYLOAD_TAG, subject, site_a, i.to_le_bytes().to_vec());
        mailbox_a.send(site_b, MAILBOX, msg).await.unwrap();
    }

    let mut received = Vec::new();
    while received.len() < 200 {
        match mailbox_b.recv_blocking(&[Subject::Default, Subject::Failure], Some(Duration::from_secs(10))).await {
            BlockingRecv::Message(VoltMessage::Payload(p)) => {
                let n = u32::from_le_bytes(p.body[..].try_into().unwrap());
                received.push((p.subject, n));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    for subject in [Subject::Default, Subject::Failure] {
        let sequence: Vec<u32> = received.iter()
            .filter(|(s, _)| *s == subject)
            .map(|(_, n)| *n)
            .collect();
        let mut sorted = sequence.clone();
        sorted.sort();
        assert_eq!(sequence, sorted);
    }
}

#[tokio::test]
async fn test_send_errors() {
    let hosts = start_test_cluster(2).await;
    let a = &hosts[0];
    let (site_a, _mailbox_a) = site_with_mailbox(a, 0);

    assert_eq!(
        a.send(HostId(5).site(0), MAILBOX, payload(site_a, &b"x"[..])).await,
        Err(SendError::UnknownHost(HostId(5))),
    );
    assert_eq!(
        a.send(HostId(1).site(0), MAILBOX, VoltMessage::payload(40, Subject::Default, site_a, &b"x"[..])).await,
        Err(SendError::UnregisteredMessage(40)),
    );
}

#[tokio::test]
async fn test_failure_detection() {
    let hosts = start_test_cluster(2).await;
    let (a, b) = (&hosts[0], &hosts[1]);
    let (site_a, mailbox_a) = site_with_mailbox(a, 0);
    let mut events = a.subscribe();

    assert!(b.close_foreign_host_socket(HostId(0)));
    wait_for_event(&mut events, MessengerEvent::HostFailed(HostId(1))).await;

    assert_eq!(a.count_foreign_hosts(), 0);
    assert_eq!(a.failed_hosts(), vec![HostId(1)]);
    assert_eq!(a.live_hosts(), vec![HostId(0)]);

    assert_eq!(
        mailbox_a.recv(&[Subject::FailureSiteUpdate]),
        Some(VoltMessage::FailureSiteUpdate(FailureSiteUpdateData {
            reporting_host: HostId(0),
            failed_host: HostId(1),
            surviving_hosts: vec![HostId(0)],
        })),
    );

    assert_eq!(
        a.send(HostId(1).site(0), MAILBOX, payload(site_a, &b"x"[..])).await,
        Err(SendError::HostFailed(HostId(1))),
    );
    assert!(!a.close_foreign_host_socket(HostId(1)));
}

#[tokio::test]
async fn test_failure_handling_is_idempotent() {
    let hosts = start_test_cluster(2).await;
    let a = &hosts[0];
    let (_site_a, mailbox_a) = site_with_mailbox(a, 0);
    let mut events = a.subscribe();

    a.report_host_failure(HostId(1));
    let live_once = a.live_hosts();
    let failed_once = a.failed_hosts();

    a.report_host_failure(HostId(1));
    assert_eq!(a.live_hosts(), live_once);
    assert_eq!(a.failed_hosts(), failed_once);

    assert_eq!(events.recv().await.unwrap(), MessengerEvent::HostFailed(HostId(1)));
    assert_eq!(mailbox_a.pending(Subject::FailureSiteUpdate), 1);

    // the aborted connection does not produce another notification
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(matches!(events.try_recv(), Err(broadcast::error::TryRecvError::Empty)));
    assert_eq!(mailbox_a.pending(Subject::FailureSiteUpdate), 1);
}

#[tokio::test]
async fn test_payload_with_builtin_tag_is_refused() {
    let hosts = start_test_cluster(2).await;
    let (site_a, mailbox_a) = site_with_mailbox(&hosts[0], 0);
    let (site_a2, mailbox_a2) = site_with_mailbox(&hosts[0], 1);
    let (site_b, mailbox_b) = site_with_mailbox(&hosts[1], 0);

    let forged = || VoltMessage::payload(TAG_FAILURE_SITE_UPDATE, Subject::Default, site_a, &b"hello"[..]);
    assert_eq!(
        mailbox_a.send(site_b, MAILBOX, forged()).await,
        Err(SendError::UnregisteredMessage(TAG_FAILURE_SITE_UPDATE)),
    );
    assert_eq!(
        mailbox_a.send(site_a2, MAILBOX, forged()).await,
        Err(SendError::UnregisteredMessage(TAG_FAILURE_SITE_UPDATE)),
    );
    let report = mailbox_a.send_multi(&[site_b, site_a2], MAILBOX, forged()).await;
    assert_eq!(report.failed.len(), 2);
    assert_eq!(mailbox_a2.pending(Subject::Default), 0);

    // the link survives and keeps carrying regular traffic
    mailbox_a.send(site_b, MAILBOX, payload(site_a, &b"still here"[..])).await.unwrap();
    assert_eq!(recv(&mailbox_b).await, payload(site_a, &b"still here"[..]));
    assert_eq!(hosts[0].count_foreign_hosts(), 1);
    assert_eq!(hosts[1].count_foreign_hosts(), 1);
    assert!(hosts[0].failed_hosts().is_empty());
    assert!(hosts[1].failed_hosts().is_empty());
}

#[tokio::test]
async fn test_heartbeat_timeout() {
    let coordinator = free_local_addr();
    let mut leader_config = test_config(coordinator, 2);
    leader_config.heartbeat_timeout = Duration::from_millis(500);

    let leader = tokio::spawn(HostMessenger::start(leader_config, test_registry()));
    tokio::time::sleep(Duration::from_millis(100)).await;

    // a peer that joins but never sends anything afterwards
    let silent = SocketJoiner::new(Arc::new(test_config(coordinator, 2)));
    let _joined = silent.join().await.unwrap();

    let leader = leader.await.unwrap().unwrap();
    let mut events = leader.subscribe();
    assert_eq!(leader.count_foreign_hosts(), 1);

    wait_for_event(&mut events, MessengerEvent::HostFailed(HostId(1))).await;
    assert_eq!(leader.count_foreign_hosts(), 0);
}

#[tokio::test]
async fn test_heartbeats_keep_idle_connections_alive() {
    let hosts = start_test_cluster_with(2, |config| {
        config.heartbeat_timeout = Duration::from_millis(500);
    }).await;

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(hosts[0].count_foreign_hosts(), 1);
    assert_eq!(hosts[1].count_foreign_hosts(), 1);
}

#[tokio::test]
async fn test_fingerprint_mismatch_never_joins() {
    let coordinator = free_local_addr();
    let mut leader_config = test_config(coordinator, 2);
    leader_config.join_timeout = Duration::from_secs(1);

    let mut joiner_config = test_config(coordinator, 2);
    joiner_config.fingerprint = ConfigFingerprint::compute(b"create table t (id int);", b"<deployment/>");

    let leader = tokio::spawn(HostMessenger::start(leader_config, test_registry()));
    tokio::time::sleep(Duration::from_millis(100)).await;
    let joiner = HostMessenger::start(joiner_config, test_registry()).await;

    let err = joiner.err().unwrap();
    match err.downcast_ref::<JoinError>() {
        Some(JoinError::Rejected(RejectReason::CatalogMismatch)) => {}
        other => panic!("unexpected {:?}", other),
    }

    // no host was admitted, so the leader never completes formation
    assert!(leader.await.unwrap().is_err());
}

#[tokio::test]
async fn test_fan_out_with_dead_destination() {
    let hosts = start_test_cluster(3).await;
    let (site_a, mailbox_a) = site_with_mailbox(&hosts[0], 0);
    let (site_a2, mailbox_a2) = site_with_mailbox(&hosts[0], 1);
    let (site_b, mailbox_b) = site_with_mailbox(&hosts[1], 0);
    let site_c = HostId(2).site(0);

    let mut events = hosts[0].subscribe();
    hosts[2].shutdown();
    wait_for_event(&mut events, MessengerEvent::HostFailed(HostId(2))).await;

    let report = mailbox_a.send_multi(&[site_b, site_c, site_a2], MAILBOX, payload(site_a, &b"fan-out"[..])).await;
    assert_eq!(report.failed, vec![(site_c, SendError::HostFailed(HostId(2)))]);

    assert_eq!(recv(&mailbox_b).await, payload(site_a, &b"fan-out"[..]));
    assert_eq!(mailbox_a2.recv(&[Subject::Default]), Some(payload(site_a, &b"fan-out"[..])));

    // the surviving peer notified its sites of the failure as well
    assert_eq!(recv_failure_update(&mailbox_b).await.failed_host, HostId(2));
}

#[tokio::test]
async fn test_fan_out_with_duplicate_destinations() {
    let hosts = start_test_cluster(2).await;
    let (site_a, mailbox_a) = site_with_mailbox(&hosts[0], 0);
    let (site_a2, mailbox_a2) = site_with_mailbox(&hosts[0], 1);
    let (site_b, mailbox_b) = site_with_mailbox(&hosts[1], 0);

    // more entries than one routed frame can list, but all of them name the same two sites
    let mut destinations = vec![site_b; 70_000];
    destinations.extend([site_a2, site_a2]);
    let report = mailbox_a.send_multi(&destinations, MAILBOX, payload(site_a, &b"once"[..])).await;
    assert!(report.is_complete());

    assert_eq!(recv(&mailbox_b).await, payload(site_a, &b"once"[..]));
    assert_eq!(mailbox_a2.recv(&[Subject::Default]), Some(payload(site_a, &b"once"[..])));

    // messages from one sender arrive in order, so a duplicate would be queued ahead of this one
    mailbox_a.send(site_b, MAILBOX, payload(site_a, &b"next"[..])).await.unwrap();
    assert_eq!(recv(&mailbox_b).await, payload(site_a, &b"next"[..]));
    assert_eq!(mailbox_b.pending(Subject::Default), 0);
    assert_eq!(mailbox_a2.pending(Subject::Default), 0);

    assert_eq!(hosts[0].count_foreign_hosts(), 1);
    assert_eq!(hosts[1].count_foreign_hosts(), 1);
}

#[tokio::test]
async fn test_fan_out_to_several_sites_of_one_host() {
    let hosts = start_test_cluster(2).await;
    let (site_a, mailbox_a) = site_with_mailbox(&hosts[0], 0);
    let (site_b0, mailbox_b0) = site_with_mailbox(&hosts[1], 0);
    let (site_b1, mailbox_b1) = site_with_mailbox(&hosts[1], 1);

    let report = mailbox_a.send_multi(&[site_b0, site_b1], MAILBOX, payload(site_a, &b"both"[..])).await;
    assert!(report.is_complete());
    assert_eq!(recv(&mailbox_b0).await, payload(site_a, &b"both"[..]));
    assert_eq!(recv(&mailbox_b1).await, payload(site_a, &b"both"[..]));
}

#[tokio::test]
async fn test_rejoin_into_failed_slot() {
    let mut hosts = start_test_cluster(2).await;
    let a = hosts.remove(0);
    let b = hosts.remove(0);
    let (site_a, mailbox_a) = site_with_mailbox(&a, 0);
    let mut events = a.subscribe();

    let old_b_addr = b.listen_addr();
    b.shutdown();
    drop(b);
    wait_for_event(&mut events, MessengerEvent::HostFailed(HostId(1))).await;

    let mut config = test_config(a.config().coordinator_addr, 2);
    config.rejoin_sponsor = Some(a.listen_addr());
    let c = HostMessenger::start(config, test_registry()).await.unwrap();
    assert_eq!(c.host_id(), HostId(1));
    assert_ne!(c.listen_addr(), old_b_addr);

    let rejoined = timeout(Duration::from_secs(10), async {
        loop {
            if let MessengerEvent::HostRejoined(data) = events.recv().await.unwrap() {
                return data;
            }
        }
    }).await.unwrap();
    assert_eq!(rejoined.host_id, HostId(1));
    assert_eq!(rejoined.listen_addr, c.listen_addr());

    assert!(a.failed_hosts().is_empty());
    assert_eq!(a.count_foreign_hosts(), 1);
    assert_eq!(c.count_foreign_hosts(), 1);

    // sends addressed to the slot now reach the new host
    let (site_c, mailbox_c) = site_with_mailbox(&c, 0);
    mailbox_a.send(site_c, MAILBOX, payload(site_a, &b"welcome"[..])).await.unwrap();
    assert_eq!(recv(&mailbox_c).await, payload(site_a, &b"welcome"[..]));

    mailbox_c.send(site_a, MAILBOX, payload(site_c, &b"thanks"[..])).await.unwrap();
    assert_eq!(recv(&mailbox_a).await, payload(site_c, &b"thanks"[..]));

    // the failure of the previous occupant is still queued separately
    let update = recv_failure_update(&mailbox_a).await;
    assert_eq!(update.failed_host, HostId(1));
    assert_eq!(update.surviving_hosts, vec![HostId(0)]);
}

#[tokio::test]
async fn test_rejoin_prepares_all_peers() {
    let hosts = start_test_cluster(3).await;
    let mut events_a = hosts[0].subscribe();
    let mut events_b = hosts[1].subscribe();

    hosts[2].shutdown();
    wait_for_event(&mut events_a, MessengerEvent::HostFailed(HostId(2))).await;
    wait_for_event(&mut events_b, MessengerEvent::HostFailed(HostId(2))).await;

    let mut config = test_config(hosts[0].config().coordinator_addr, 3);
    config.rejoin_sponsor = Some(hosts[0].listen_addr());
    let c = HostMessenger::start(config, test_registry()).await.unwrap();
    assert_eq!(c.host_id(), HostId(2));
    assert_eq!(c.count_foreign_hosts(), 2);

    let rejoined = loop {
        match timeout(Duration::from_secs(10), events_b.recv()).await.unwrap().unwrap() {
            MessengerEvent::HostRejoined(data) => break data,
            _ => continue,
        }
    };
    assert_eq!(rejoined.host_id, HostId(2));
    assert_eq!(hosts[1].count_foreign_hosts(), 2);

    let (site_b, _mailbox_b) = site_with_mailbox(&hosts[1], 0);
    let (site_c, mailbox_c) = site_with_mailbox(&c, 0);
    hosts[1].send(site_c, MAILBOX, payload(site_b, &b"from a peer"[..])).await.unwrap();
    assert_eq!(recv(&mailbox_c).await, payload(site_b, &b"from a peer"[..]));
}

#[tokio::test]
async fn test_refused_prepare_rolls_back() {
    let hosts = start_test_cluster(3).await;
    let mut events_c = hosts[2].subscribe();

    // only the sponsor considers host 2 failed, so host 1 refuses to prepare its rejoin
    hosts[0].report_host_failure(HostId(2));
    wait_for_event(&mut events_c, MessengerEvent::HostFailed(HostId(0))).await;

    let before: Vec<_> = hosts.iter()
        .map(|h| (h.failed_hosts(), h.live_hosts(), h.count_foreign_hosts()))
        .collect();
    assert_eq!(before[0], (vec![HostId(2)], vec![HostId(0), HostId(1)], 1));
    assert_eq!(before[1], (vec![], vec![HostId(0), HostId(1), HostId(2)], 2));

    let mut config = test_config(hosts[0].config().coordinator_addr, 3);
    config.rejoin_sponsor = Some(hosts[0].listen_addr());
    let joiner = SocketJoiner::new(Arc::new(config));
    match joiner.join().await {
        Err(JoinError::Rejected(RejectReason::RejoinPrepareFailed)) => {}
        other => panic!("unexpected {:?}", other.err()),
    }
    assert_eq!(joiner.state(), JoinState::Rejected(RejectReason::RejoinPrepareFailed));

    // give the rollback time to reach the peers
    tokio::time::sleep(Duration::from_millis(300)).await;
    for (host, before) in hosts.iter().zip(&before) {
        assert_eq!((host.failed_hosts(), host.live_hosts(), host.count_foreign_hosts()), *before);
        assert_eq!(host.membership.staged_host_id(), None);
    }
    assert!(!hosts[0].sponsoring_rejoin.load(std::sync::atomic::Ordering::Acquire));
}

#[tokio::test]
async fn test_rejoin_without_failed_slot_is_rejected() {
    let hosts = start_test_cluster(2).await;

    let mut config = test_config(hosts[0].config().coordinator_addr, 2);
    config.rejoin_sponsor = Some(hosts[0].listen_addr());
    let result = HostMessenger::start(config, test_registry()).await;

    match result.err().unwrap().downcast_ref::<JoinError>() {
        Some(JoinError::Rejected(RejectReason::RejoinNotPermitted)) => {}
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(hosts[0].count_foreign_hosts(), 1);
}

#[tokio::test]
async fn test_late_initial_join_is_rejected() {
    let hosts = start_test_cluster(2).await;

    let mut config = test_config(hosts[0].config().coordinator_addr, 2);
    config.join_timeout = Duration::from_secs(1);
    let result = HostMessenger::start(config, test_registry()).await;

    match result.err().unwrap().downcast_ref::<JoinError>() {
        Some(JoinError::Rejected(RejectReason::ClusterFull)) => {}
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(hosts[0].count_foreign_hosts(), 1);
}

#[tokio::test]
async fn test_readiness() {
    let hosts = start_test_cluster(3).await;
    assert!(!hosts[0].wait_for_all_hosts_ready(Duration::from_millis(200)).await);

    for host in &hosts {
        host.send_ready_message().await;
    }
    for host in &hosts {
        assert!(host.wait_for_all_hosts_ready(Duration::from_secs(5)).await);
    }
}

#[tokio::test]
async fn test_poison_pill() {
    let hosts = start_test_cluster(2).await;
    let mut events = hosts[1].subscribe();

    hosts[0].send_poison_pill("catalog update failed").await;
    wait_for_event(&mut events, MessengerEvent::PoisonPill(PoisonPillData {
        from: HostId(0),
        reason: "catalog update failed".to_string(),
    })).await;
}

#[tokio::test]
async fn test_shutdown() {
    let hosts = start_test_cluster(2).await;
    let (site_a, mailbox_a) = site_with_mailbox(&hosts[0], 0);
    let mut events = hosts[1].subscribe();

    let waiter = {
        let mailbox_a = mailbox_a.clone();
        tokio::spawn(async move {
            mailbox_a.recv_blocking(&Subject::ALL, None).await
        })
    };
    tokio::task::yield_now().await;

    hosts[0].shutdown();
    assert_eq!(waiter.await.unwrap(), BlockingRecv::Interrupted);
    assert_eq!(
        hosts[0].send(HostId(1).site(0), MAILBOX, payload(site_a, &b"x"[..])).await,
        Err(SendError::ShuttingDown),
    );

    // the peer sees the closed connection as a host failure
    wait_for_event(&mut events, MessengerEvent::HostFailed(HostId(0))).await;
}

#[tokio::test]
async fn test_remove_local_site() {
    let hosts = start_test_cluster(2).await;
    let (site_a, mailbox_a) = site_with_mailbox(&hosts[0], 0);
    let (site_b, mailbox_b) = site_with_mailbox(&hosts[1], 0);

    assert!(hosts[1].remove_local_site(site_b));
    assert!(mailbox_b.is_closed());
    assert!(hosts[1].local_sites().is_empty());

    // remote sends are accepted, the receiving host drops the message
    mailbox_a.send(site_b, MAILBOX, payload(site_a, &b"x"[..])).await.unwrap();
    assert_eq!(
        mailbox_b.send(site_a, MAILBOX, payload(site_b, &b"x"[..])).await,
        Ok(()),
    );
    assert_eq!(recv(&mailbox_a).await, payload(site_b, &b"x"[..]));
}
