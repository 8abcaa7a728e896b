//! In-memory mesh test: three engines wired A—B—C, with B relaying
//! between A and C. No sockets; frames move by hand so every hop is
//! observable.

use std::collections::HashMap;
use std::sync::Arc;

use veil_protocol::engine::{Engine, EngineAction, EngineConfig, Registries};
use veil_protocol::keypairs::KeypairRegistry;
use veil_protocol::peers::PeerRegistry;
use veil_protocol::pending::PendingRegistry;
use veil_protocol::transports::TransportRegistry;
use veil_protocol::types::ConnectionId;

fn new_engine(bind_port: u32) -> Engine {
    Engine::new(
        EngineConfig {
            version: "0.1.0".into(),
            release_name: "obsidian".into(),
            bind_port,
        },
        Registries {
            keypairs: Arc::new(KeypairRegistry::new()),
            transports: Arc::new(TransportRegistry::new()),
            peers: Arc::new(PeerRegistry::new(true)),
            pending: Arc::new(PendingRegistry::new()),
        },
    )
}

/// A bidirectional in-memory link between two engines.
struct Link {
    left: usize,
    right: usize,
    left_conn: ConnectionId,
    right_conn: ConnectionId,
}

struct Mesh {
    engines: Vec<Engine>,
    links: Vec<Link>,
    delivered: HashMap<usize, Vec<Vec<u8>>>,
}

impl Mesh {
    fn new(engines: Vec<Engine>) -> Self {
        Self {
            engines,
            links: Vec::new(),
            delivered: HashMap::new(),
        }
    }

    /// Dial `right` from `left` and run the handshake to completion.
    fn connect(&mut self, left: usize, right: usize) {
        let left_conn = ConnectionId((self.links.len() as u64 + 1) * 2);
        let right_conn = ConnectionId((self.links.len() as u64 + 1) * 2 + 1);
        self.engines[right].on_accepted(right_conn, &format!("10.0.0.{}", left + 1));
        let opening = self.engines[left]
            .on_connected(left_conn, &format!("10.0.0.{}", right + 1))
            .unwrap();
        self.links.push(Link {
            left,
            right,
            left_conn,
            right_conn,
        });
        self.run(left, opening);
    }

    /// Execute a batch of actions, forwarding Sends across links until
    /// the mesh goes quiet. Delivers are collected per engine.
    fn run(&mut self, origin: usize, actions: Vec<EngineAction>) {
        let mut queue: Vec<(usize, EngineAction)> =
            actions.into_iter().map(|a| (origin, a)).collect();
        while let Some((engine_idx, action)) = queue.pop() {
            match action {
                EngineAction::Send { conn, frame } => {
                    let (peer_idx, peer_conn) = self.route(engine_idx, conn);
                    let produced = self.engines[peer_idx].on_data(peer_conn, &frame).unwrap();
                    queue.extend(produced.into_iter().map(|a| (peer_idx, a)));
                }
                EngineAction::Deliver { payload, .. } => {
                    self.delivered.entry(engine_idx).or_default().push(payload);
                }
                EngineAction::Close { conn } => {
                    self.engines[engine_idx].on_closed(conn);
                }
                EngineAction::ConnectTo { .. } => {
                    // Topology is fixed by the test; learned peers are
                    // not dialed.
                }
            }
        }
    }

    /// Map (engine, local conn) to the engine and conn on the far side.
    fn route(&self, engine_idx: usize, conn: ConnectionId) -> (usize, ConnectionId) {
        for link in &self.links {
            if link.left == engine_idx && link.left_conn == conn {
                return (link.right, link.right_conn);
            }
            if link.right == engine_idx && link.right_conn == conn {
                return (link.left, link.left_conn);
            }
        }
        panic!("no link for engine {engine_idx} conn {conn}");
    }
}

#[test]
fn relay_floods_across_an_intermediate_hop() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("warn")
        .try_init();

    let mut mesh = Mesh::new(vec![new_engine(5000), new_engine(5001), new_engine(5002)]);
    mesh.connect(0, 1);
    mesh.connect(1, 2);

    for engine in &mesh.engines {
        assert_eq!(engine.authenticated_count(), engine.connection_count());
    }

    // C holds the recipient identity; A got the keypair out-of-band.
    let recipient_id = mesh.engines[2].registries().keypairs.generate().unwrap();
    let recipient = mesh.engines[2]
        .registries()
        .keypairs
        .get(recipient_id)
        .unwrap()
        .info;

    let mut actions = Vec::new();
    mesh.engines[0]
        .relay_send(
            &recipient,
            b"across the mesh",
            veil_protocol::now_secs(),
            &mut actions,
        )
        .unwrap();
    mesh.run(0, actions);

    // Only C delivered, exactly once. B forwarded without being able to
    // read or address the message.
    assert_eq!(
        mesh.delivered.get(&2).map(Vec::as_slice),
        Some(&[b"across the mesh".to_vec()][..])
    );
    assert!(mesh.delivered.get(&0).is_none());
    assert!(mesh.delivered.get(&1).is_none());

    // The checksum is over the decrypted content, so only the publisher
    // and the recipient could record it; the blind relay in the middle
    // has nothing to dedup with.
    assert_eq!(mesh.engines[0].registries().pending.len(), 1);
    assert_eq!(mesh.engines[1].registries().pending.len(), 0);
    assert_eq!(mesh.engines[2].registries().pending.len(), 1);

    // C's transport slot was created lazily on first delivery.
    assert_eq!(mesh.engines[2].registries().transports.len(), 1);
}

#[test]
fn second_identity_message_uses_its_own_transport() {
    let mut mesh = Mesh::new(vec![new_engine(5000), new_engine(5001)]);
    mesh.connect(0, 1);

    let keypairs = Arc::clone(&mesh.engines[1].registries().keypairs);
    let first = keypairs.get(keypairs.generate().unwrap()).unwrap().info;
    let second = keypairs.get(keypairs.generate().unwrap()).unwrap().info;

    for (recipient, text) in [(&first, b"one".to_vec()), (&second, b"two".to_vec())] {
        let mut actions = Vec::new();
        mesh.engines[0]
            .relay_send(recipient, &text, veil_protocol::now_secs(), &mut actions)
            .unwrap();
        mesh.run(0, actions);
    }

    assert_eq!(
        mesh.delivered.get(&1).map(Vec::as_slice),
        Some(&[b"one".to_vec(), b"two".to_vec()][..])
    );
    assert_eq!(mesh.engines[1].registries().transports.len(), 2);
}

#[test]
fn peerlist_resync_reaches_every_authenticated_peer() {
    let mut mesh = Mesh::new(vec![new_engine(5000), new_engine(5001), new_engine(5002)]);
    mesh.connect(0, 1);
    mesh.connect(0, 2);

    let mut actions = Vec::new();
    mesh.engines[0].resync_peerlists(&mut actions).unwrap();
    assert_eq!(
        actions
            .iter()
            .filter(|a| matches!(a, EngineAction::Send { .. }))
            .count(),
        2
    );
    // The responses parse and settle without error.
    mesh.run(0, actions);
}
