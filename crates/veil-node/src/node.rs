//! Node wiring: scheduler tasks that pump socket events through the
//! protocol engine and carry out the actions it returns.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use veil_protocol::engine::{Engine, EngineAction};
use veil_protocol::scheduler::{Scheduler, TaskOutcome};
use veil_protocol::types::{is_local_address, now_secs, PEERLIST_RESYNC_SECS};
use veil_protocol::DeliveryDispatcher;

use crate::net::{NetEvent, NetHandle};

/// How many queued socket events one poll run handles before yielding.
const POLL_BATCH: usize = 64;

/// Message tag for plain text payloads.
pub const TEXT_TAG: u8 = 1;

pub struct Node {
    engine: Arc<Mutex<Engine>>,
    net: NetHandle,
    dispatcher: Arc<Mutex<DeliveryDispatcher>>,
    bind_port: u32,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Node {
    pub fn new(engine: Engine, net: NetHandle, bind_port: u32) -> Self {
        let mut dispatcher = DeliveryDispatcher::new();
        dispatcher.register(TEXT_TAG, |transport, body| {
            info!(transport, "message: {}", String::from_utf8_lossy(body));
        });
        Self {
            engine: Arc::new(Mutex::new(engine)),
            net,
            dispatcher: Arc::new(Mutex::new(dispatcher)),
            bind_port,
        }
    }

    pub fn engine(&self) -> &Arc<Mutex<Engine>> {
        &self.engine
    }

    /// Dial a peer unless the endpoint looks like our own listener.
    pub fn dial(&self, address: &str, port: u32) {
        if port == self.bind_port && is_local_address(address) {
            debug!(address, port, "not dialing own endpoint");
            return;
        }
        self.net.connect(address.to_string(), port);
    }

    /// Register the recurring protocol tasks on the scheduler.
    pub fn install_tasks(
        &self,
        scheduler: &Arc<Scheduler>,
        mut events: mpsc::UnboundedReceiver<NetEvent>,
    ) -> anyhow::Result<()> {
        let poll_node = self.clone_parts();
        scheduler.add_task("net-poll", Duration::from_millis(10), move || {
            let mut handled = 0;
            while handled < POLL_BATCH {
                match events.try_recv() {
                    Ok(event) => {
                        poll_node.handle_event(event);
                        handled += 1;
                    }
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        warn!("socket event channel closed, stopping poll task");
                        return TaskOutcome::Done;
                    }
                }
            }
            if handled == POLL_BATCH {
                TaskOutcome::Continue
            } else {
                TaskOutcome::Wait
            }
        })?;

        let resync_node = self.clone_parts();
        scheduler.add_task(
            "peerlist-resync",
            Duration::from_secs(PEERLIST_RESYNC_SECS),
            move || {
                let mut actions = Vec::new();
                let result = lock(&resync_node.engine).resync_peerlists(&mut actions);
                match result {
                    Ok(()) => resync_node.apply(actions),
                    Err(e) => warn!(error = %e, "peer list resync failed"),
                }
                TaskOutcome::Wait
            },
        )?;

        let sweep_node = self.clone_parts();
        scheduler.add_task("pending-sweep", Duration::from_secs(5), move || {
            let swept = lock(&sweep_node.engine)
                .registries()
                .pending
                .sweep_expired(now_secs());
            if swept > 0 {
                debug!(swept, "expired pending messages dropped");
            }
            TaskOutcome::Wait
        })?;

        let redial_node = self.clone_parts();
        scheduler.add_task("peer-redial", Duration::from_secs(30), move || {
            let candidates = lock(&redial_node.engine).registries().peers.unconnected();
            for peer in candidates {
                redial_node.dial(&peer.address, peer.port);
            }
            TaskOutcome::Wait
        })?;

        Ok(())
    }

    fn clone_parts(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
            net: self.net.clone(),
            dispatcher: Arc::clone(&self.dispatcher),
            bind_port: self.bind_port,
        }
    }

    fn handle_event(&self, event: NetEvent) {
        match event {
            NetEvent::Connected { conn, address } => {
                // Bind before matching so the engine lock is released.
                let result = lock(&self.engine).on_connected(conn, &address);
                match result {
                    Ok(actions) => self.apply(actions),
                    Err(e) => {
                        warn!(%conn, error = %e, "dropping connection: open failed");
                        self.net.close(conn);
                        lock(&self.engine).on_closed(conn);
                    }
                }
            }
            NetEvent::Accepted { conn, address } => {
                lock(&self.engine).on_accepted(conn, &address);
            }
            NetEvent::Data { conn, bytes } => {
                let result = lock(&self.engine).on_data(conn, &bytes);
                match result {
                    Ok(actions) => self.apply(actions),
                    Err(e) => {
                        warn!(%conn, error = %e, "dropping connection: protocol error");
                        self.net.close(conn);
                        lock(&self.engine).on_closed(conn);
                    }
                }
            }
            NetEvent::Closed { conn } => {
                lock(&self.engine).on_closed(conn);
            }
            NetEvent::DialFailed { address, port } => {
                debug!(address, port, "dial failed, will retry on redial");
            }
        }
    }

    fn apply(&self, actions: Vec<EngineAction>) {
        for action in actions {
            match action {
                EngineAction::Send { conn, frame } => self.net.send(conn, frame),
                EngineAction::Close { conn } => {
                    self.net.close(conn);
                    lock(&self.engine).on_closed(conn);
                }
                EngineAction::ConnectTo { address, port } => self.dial(&address, port),
                EngineAction::Deliver { transport, payload } => {
                    if let Err(e) = lock(&self.dispatcher).handle_incoming(transport, &payload) {
                        warn!(transport, error = %e, "undecodable delivered payload");
                    }
                }
            }
        }
    }
}
