mod cli;
mod net;
mod node;
mod peerfile;
mod portmap;

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};

use veil_protocol::crypto::{self, KeypairInfo};
use veil_protocol::engine::{Engine, EngineConfig, Registries};
use veil_protocol::keypairs::KeypairRegistry;
use veil_protocol::peers::PeerRegistry;
use veil_protocol::pending::PendingRegistry;
use veil_protocol::scheduler::Scheduler;
use veil_protocol::transports::TransportRegistry;
use veil_protocol::types::{PROTOCOL_VERSION, RELEASE_NAME};

use cli::Cli;
use net::NetHandle;
use node::Node;
use portmap::{DisabledMapper, LogOnlyMapper, PortMapper};

const WORKER_THREADS: usize = 2;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            std::process::exit(cli::error_exit_code(&e));
        }
    };
    if let Err(e) = run(cli) {
        error!(error = format!("{e:#}"), "fatal");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    info!(
        version = PROTOCOL_VERSION,
        release = RELEASE_NAME,
        "veil node starting"
    );

    // Subsystems come up in a fixed order: keypair, message, network
    // identity, peer, network, scheduler. Shutdown walks the same order.

    // Keypair subsystem.
    let keypairs = Arc::new(KeypairRegistry::new());
    for [public, secret, nonce] in cli.import_triples() {
        let info = KeypairInfo {
            public: crypto::import_key(public).context("importing public key")?,
            secret: crypto::import_key(secret).context("importing secret key")?,
            their_public: [0u8; crypto::KEY_LEN],
            their_secret: [0u8; crypto::KEY_LEN],
            nonce: crypto::import_key(nonce).context("importing nonce")?,
        };
        keypairs.add(info).context("registering imported keypair")?;
        info!("imported identity keypair");
    }
    if cli.generate_keypair {
        let id = keypairs.generate().context("generating keypair")?;
        if let Some(entry) = keypairs.get(id) {
            // Printed to stdout so it can be captured and handed to the
            // peer that should message this identity.
            println!("public: {}", crypto::export_key(&entry.info.public));
            println!("secret: {}", crypto::export_key(&entry.info.secret));
            println!("nonce:  {}", crypto::export_key(&entry.info.nonce));
        }
        return Ok(());
    }

    // Message subsystem.
    let pending = Arc::new(PendingRegistry::new());
    let transports = Arc::new(TransportRegistry::new());

    // Network identity subsystem.
    let config = EngineConfig {
        version: PROTOCOL_VERSION.to_string(),
        release_name: RELEASE_NAME.to_string(),
        bind_port: u32::from(cli.bind_port),
    };

    // Peer subsystem.
    let peers = Arc::new(PeerRegistry::new(cli.allow_local_ip));
    let peer_file = Path::new(&cli.peer_file).to_path_buf();
    let saved_peers = peerfile::load(&peer_file)?;
    for peer in &saved_peers {
        if let Err(e) = peers.add(&peer.address, peer.port, None) {
            warn!(address = %peer.address, port = peer.port, error = %e, "skipping saved peer");
        }
    }

    let engine = Engine::new(
        config,
        Registries {
            keypairs,
            transports,
            peers: Arc::clone(&peers),
            pending,
        },
    );

    // Network subsystem.
    let rt = tokio::runtime::Runtime::new().context("starting I/O runtime")?;
    let (net, events) = NetHandle::new(rt.handle().clone());
    net.listen(&cli.bind_address, cli.bind_port)?;
    info!(address = %cli.bind_address, port = cli.bind_port, "listening");

    let mapper: Box<dyn PortMapper> = if cli.disable_port_mapping {
        Box::new(DisabledMapper)
    } else {
        Box::new(LogOnlyMapper)
    };
    if let Err(e) = mapper.request_mapping(cli.bind_port) {
        warn!(error = %e, "port mapping failed, continuing unreachable from outside");
    }

    // Scheduler subsystem.
    let node = Node::new(engine, net, u32::from(cli.bind_port));
    let scheduler = Arc::new(Scheduler::new(veil_protocol::types::REGISTRY_CAPACITY));
    node.install_tasks(&scheduler, events)?;
    let workers = scheduler.spawn_workers(WORKER_THREADS);

    // Bootstrap dials: explicit --connect targets, then saved peers.
    for target in cli.connect_targets()? {
        node.dial(&target.address, target.port);
    }
    for peer in &saved_peers {
        node.dial(&peer.address, peer.port);
    }

    rt.block_on(tokio::signal::ctrl_c())
        .context("waiting for shutdown signal")?;
    info!("shutting down");

    // Teardown walks the same subsystem order, best effort: peer state,
    // then the network surface, the scheduler last.
    let snapshot = {
        let engine = node.engine().lock().unwrap_or_else(|e| e.into_inner());
        engine.registries().peers.addrs()
    };
    if let Err(e) = peerfile::save(&peer_file, &snapshot) {
        warn!(error = %e, "saving peer file failed");
    }
    if let Err(e) = mapper.drop_mapping(cli.bind_port) {
        warn!(error = %e, "releasing port mapping failed");
    }
    scheduler.shutdown();
    for worker in workers {
        if worker.join().is_err() {
            warn!("worker thread panicked during shutdown");
        }
    }
    info!("goodbye");
    Ok(())
}
