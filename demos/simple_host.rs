use std::net::SocketAddr;
use std::time::Duration;

use anyhow::anyhow;
use clap::Parser;
use hostmesh::join::fingerprint::ConfigFingerprint;
use hostmesh::messaging::codec::MessageRegistry;
use hostmesh::messaging::mailbox::BlockingRecv;
use hostmesh::messaging::message::{VoltMessage, FIRST_APPLICATION_TAG};
use hostmesh::messaging::site_id::{HostId, MailboxId};
use hostmesh::messaging::subject::Subject;
use hostmesh::messenger::host_messenger::HostMessenger;
use hostmesh::messenger::messenger_config::MessengerConfig;
use tokio::select;
use tracing::{info, warn, Level};

const GREETING_TAG: u8 = FIRST_APPLICATION_TAG;
const MAILBOX: MailboxId = MailboxId(1);

/// Starts one host, creates a site with a single mailbox and prints everything it receives. Every
///  few seconds the host greets site 0 of every other live host.
#[derive(Parser)]
struct Args {
    coordinator_address: String,

    #[clap(long, default_value_t = 2)]
    hosts: usize,

    /// a live member's address, for taking over the slot of a failed host
    #[clap(long)]
    rejoin_sponsor: Option<String>,

    #[clap(long, default_value = "demo catalog")]
    catalog: String,

    #[clap(long, default_value = "demo deployment")]
    deployment: String,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    if args.hosts == 0 {
        return Err(anyhow!("a cluster needs at least one host"));
    }

    let coordinator: SocketAddr = args.coordinator_address.parse()?;
    let fingerprint = ConfigFingerprint::compute(args.catalog.as_bytes(), args.deployment.as_bytes());
    let mut config = MessengerConfig::new(coordinator, args.hosts, fingerprint);
    if let Some(sponsor) = args.rejoin_sponsor {
        config.rejoin_sponsor = Some(sponsor.parse()?);
    }

    let mut registry = MessageRegistry::new();
    registry.register_payload(GREETING_TAG)?;

    let messenger = HostMessenger::start(config, registry).await?;
    let site = messenger.host_id().site(0);
    messenger.create_local_site(site)?;
    let mailbox = messenger.create_mailbox(site, MAILBOX, false)?;
    info!("host {:?} is up, site {:?} listening", messenger.host_id(), site);

    messenger.send_ready_message().await;
    let mut events = messenger.subscribe();
    let mut greeting_ticker = tokio::time::interval(Duration::from_secs(3));

    loop {
        select! {
            received = mailbox.recv_blocking(&Subject::ALL, None) => {
                match received {
                    BlockingRecv::Message(VoltMessage::Payload(p)) => {
                        info!("from {:?}: {}", p.source, String::from_utf8_lossy(&p.body));
                    }
                    BlockingRecv::Message(VoltMessage::FailureSiteUpdate(update)) => {
                        warn!("host {:?} failed, surviving hosts: {:?}", update.failed_host, update.surviving_hosts);
                    }
                    BlockingRecv::TimedOut => {}
                    BlockingRecv::Interrupted => return Ok(()),
                }
            }
            event = events.recv() => {
                if let Ok(event) = event {
                    info!("cluster event: {:?}", event);
                }
            }
            _ = greeting_ticker.tick() => {
                let targets: Vec<_> = messenger.live_hosts().into_iter()
                    .filter(|h| *h != messenger.host_id())
                    .map(|h: HostId| h.site(0))
                    .collect();
                let greeting = format!("greetings from host {:?}", messenger.host_id());
                let report = mailbox.send_multi(&targets, MAILBOX, VoltMessage::payload(GREETING_TAG, Subject::Default, site, greeting)).await;
                if !report.is_complete() {
                    warn!("greeting was not sent to {:?}", report.failed_sites());
                }
            }
        }
    }
}
