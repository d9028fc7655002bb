use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use tokio::sync::{mpsc, watch};

use super::{
    description::topology::TopologyDescription,
    monitor::Monitor,
    Server,
    ServerDescription,
};
use crate::{
    cmap::{
        conn::ConnectionGeneration,
        establish::{ConnectionEstablisher, EstablisherOptions},
        Connection,
        PoolGeneration,
    },
    error::{Error, Result},
    options::{ClientOptions, ServerAddress},
    runtime::{self, AcknowledgedMessage, WorkerHandle, WorkerHandleListener},
};

/// A handle to the topology worker: the single task that owns the
/// `TopologyDescription` and the set of `Server`s. All mutation flows through the
/// [`TopologyUpdater`]; all observation flows through [`TopologyWatcher`] snapshots.
#[derive(Debug)]
pub(crate) struct Topology {
    watcher: TopologyWatcher,
    updater: TopologyUpdater,
    check_requester: TopologyCheckRequester,
    _worker_handle: WorkerHandle,
}

impl Topology {
    pub(crate) fn new(options: ClientOptions) -> Result<Self> {
        let establisher = ConnectionEstablisher::new(EstablisherOptions::from_client_options(
            &options,
        ))?;

        let mut description = TopologyDescription::default();
        description.initialize(&options);

        let (updater, update_receiver) = TopologyUpdater::channel();
        let (worker_handle, handle_listener) = WorkerHandleListener::channel();
        let check_requester = TopologyCheckRequester::new();

        let (publisher, watch_receiver) = watch::channel(TopologyState {
            description: description.clone(),
            servers: HashMap::new(),
        });
        let watcher = TopologyWatcher {
            receiver: watch_receiver,
        };

        let worker = TopologyWorker {
            state: TopologyState {
                description,
                servers: HashMap::new(),
            },
            options,
            establisher,
            update_receiver,
            publisher,
            handle_listener,
            updater: updater.clone(),
            watcher: watcher.clone(),
            check_requester: check_requester.clone(),
        };

        runtime::spawn(worker.execute());

        Ok(Self {
            watcher,
            updater,
            check_requester,
            _worker_handle: worker_handle,
        })
    }

    pub(crate) fn watch(&self) -> TopologyWatcher {
        // `observe_latest` on the clone returns the current state, so a watcher created from a
        // long-lived handle never starts stale.
        self.watcher.clone()
    }

    /// Ask every monitor to check its server now rather than waiting out the heartbeat.
    pub(crate) fn request_update(&self) {
        self.check_requester.request()
    }

    #[cfg(test)]
    pub(crate) fn updater(&self) -> TopologyUpdater {
        self.updater.clone()
    }

    /// Handle an error that occurred during operation execution, updating the topology and
    /// clearing the relevant pool as the SDAM rules dictate.
    pub(crate) async fn handle_application_error(
        &self,
        address: ServerAddress,
        error: Error,
        phase: HandshakePhase,
    ) -> bool {
        self.updater
            .handle_application_error(address, error, phase)
            .await
    }

    /// Stop the topology worker, its monitors, and all of its connection pools.
    pub(crate) async fn shutdown(&self) {
        self.updater.shutdown().await;
    }
}

/// An immutable snapshot of the topology: the description plus the live server handles.
#[derive(Clone, Debug)]
pub(crate) struct TopologyState {
    pub(crate) description: TopologyDescription,
    pub(crate) servers: HashMap<ServerAddress, Arc<Server>>,
}

/// The phase of connection establishment an error surfaced in, along with the generation the
/// connection belonged to. SDAM uses this to discard error reports from connections that
/// predate the most recent pool clear.
#[derive(Debug, Clone)]
pub(crate) enum HandshakePhase {
    /// The error occurred before the initial hello completed (e.g. the TCP connect failed).
    PreHello { generation: PoolGeneration },

    /// The error occurred after the hello succeeded but before authentication finished.
    PostHello { generation: ConnectionGeneration },

    /// The error occurred on a fully established connection.
    AfterCompletion {
        generation: ConnectionGeneration,
        max_wire_version: Option<i32>,
    },
}

impl HandshakePhase {
    pub(crate) fn after_completion(handshaked_connection: &Connection) -> Self {
        Self::AfterCompletion {
            generation: handshaked_connection.generation,
            max_wire_version: handshaked_connection
                .stream_description
                .as_ref()
                .and_then(|sd| sd.max_wire_version),
        }
    }

    fn is_before_completion(&self) -> bool {
        !matches!(self, Self::AfterCompletion { .. })
    }

    /// Whether an error from a connection in this phase is outdated relative to the pool's
    /// current generation.
    fn is_stale(&self, current_generation: PoolGeneration) -> bool {
        let generation = match self {
            Self::PreHello { generation } => generation.0,
            Self::PostHello { generation } | Self::AfterCompletion { generation, .. } => {
                match generation {
                    ConnectionGeneration::Normal(gen) => *gen,
                    ConnectionGeneration::Monitoring => return false,
                }
            }
        };
        generation != current_generation.0
    }
}

#[derive(Debug)]
enum UpdateMessage {
    ServerUpdate(Box<ServerDescription>),
    MonitorError {
        address: ServerAddress,
        error: Error,
    },
    ApplicationError {
        address: ServerAddress,
        error: Error,
        phase: HandshakePhase,
    },
    Shutdown,
}

/// Handle used to update the topology. Each sent update is processed to completion by the
/// worker before the call returns; the returned bool indicates whether the topology changed.
#[derive(Clone, Debug)]
pub(crate) struct TopologyUpdater {
    sender: mpsc::UnboundedSender<AcknowledgedMessage<UpdateMessage, bool>>,
}

impl TopologyUpdater {
    /// Create an updater hooked up to a receiver. Outside of `Topology::new`, this is only
    /// useful for tests that need a pool without a running topology.
    pub(crate) fn channel() -> (TopologyUpdater, UpdateReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (TopologyUpdater { sender }, UpdateReceiver { receiver })
    }

    async fn send_message(&self, update: UpdateMessage) -> bool {
        let (message, receiver) = AcknowledgedMessage::package(update);

        match self.sender.send(message) {
            Ok(_) => receiver.wait_for_acknowledgment().await.unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Update the topology based on the provided server description, returning whether the
    /// topology changed as a result.
    pub(crate) async fn update(&self, sd: ServerDescription) -> bool {
        self.send_message(UpdateMessage::ServerUpdate(Box::new(sd)))
            .await
    }

    /// Handle an error that occurred during a monitor check.
    pub(crate) async fn handle_monitor_error(&self, address: ServerAddress, error: Error) -> bool {
        self.send_message(UpdateMessage::MonitorError { address, error })
            .await
    }

    /// Handle an error that occurred during operation execution or connection establishment.
    pub(crate) async fn handle_application_error(
        &self,
        address: ServerAddress,
        error: Error,
        phase: HandshakePhase,
    ) -> bool {
        self.send_message(UpdateMessage::ApplicationError {
            address,
            error,
            phase,
        })
        .await
    }

    pub(crate) async fn shutdown(&self) {
        self.send_message(UpdateMessage::Shutdown).await;
    }
}

pub(crate) struct UpdateReceiver {
    receiver: mpsc::UnboundedReceiver<AcknowledgedMessage<UpdateMessage, bool>>,
}

impl UpdateReceiver {
    async fn recv(&mut self) -> Option<AcknowledgedMessage<UpdateMessage, bool>> {
        self.receiver.recv().await
    }
}

/// Handle used to observe topology snapshots and wait for changes.
#[derive(Clone, Debug)]
pub(crate) struct TopologyWatcher {
    receiver: watch::Receiver<TopologyState>,
}

impl TopologyWatcher {
    /// Whether the topology worker is still running.
    pub(crate) fn is_alive(&self) -> bool {
        self.receiver.has_changed().is_ok()
    }

    /// Clone the latest state, marking it as seen so `wait_for_update` only returns on newer
    /// ones.
    pub(crate) fn observe_latest(&mut self) -> TopologyState {
        self.receiver.borrow_and_update().clone()
    }

    /// Clone the latest state without consuming any pending change notification.
    pub(crate) fn peek_latest(&self) -> TopologyState {
        self.receiver.borrow().clone()
    }

    /// Wait for the topology to publish a state newer than the last observed one, returning
    /// false if the timeout elapses or the topology worker stops first.
    pub(crate) async fn wait_for_update(&mut self, timeout: Duration) -> bool {
        runtime::timeout(timeout, self.receiver.changed())
            .await
            .map(|changed| changed.is_ok())
            .unwrap_or(false)
    }

    pub(crate) fn server_exists(&self, address: &ServerAddress) -> bool {
        self.receiver.borrow().description.servers.contains_key(address)
    }
}

/// Handle for requesting that the monitors check their servers immediately.
#[derive(Clone, Debug)]
pub(crate) struct TopologyCheckRequester {
    sender: Arc<watch::Sender<()>>,
}

impl TopologyCheckRequester {
    fn new() -> Self {
        let (sender, _) = watch::channel(());
        Self {
            sender: Arc::new(sender),
        }
    }

    fn request(&self) {
        let _ = self.sender.send(());
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<()> {
        self.sender.subscribe()
    }
}

/// The worker task that owns the `TopologyDescription` and applies all updates to it.
struct TopologyWorker {
    state: TopologyState,
    options: ClientOptions,
    establisher: ConnectionEstablisher,
    update_receiver: UpdateReceiver,
    publisher: watch::Sender<TopologyState>,
    handle_listener: WorkerHandleListener,

    updater: TopologyUpdater,
    watcher: TopologyWatcher,
    check_requester: TopologyCheckRequester,
}

impl TopologyWorker {
    async fn execute(mut self) {
        self.sync_servers();
        self.publish_state();

        let mut shutdown_ack = None;
        loop {
            tokio::select! {
                Some(update) = self.update_receiver.recv() => {
                    let (message, ack) = update.into_parts();
                    let changed = match message {
                        UpdateMessage::ServerUpdate(sd) => self.update_server(*sd).await,
                        UpdateMessage::MonitorError { address, error } => {
                            self.handle_monitor_error(address, error).await
                        }
                        UpdateMessage::ApplicationError { address, error, phase } => {
                            self.handle_application_error(address, error, phase).await
                        }
                        UpdateMessage::Shutdown => {
                            shutdown_ack = Some(ack);
                            break;
                        }
                    };
                    ack.acknowledge(changed);
                }
                _ = self.handle_listener.wait_for_all_handle_drops() => break,
                else => break,
            }
        }

        for server in self.state.servers.values() {
            server.pool.shutdown().await;
        }
        tracing::debug!("topology worker stopped");
        if let Some(ack) = shutdown_ack {
            ack.acknowledge(true);
        }
    }

    /// Publish the current state, notifying any tasks waiting on a topology change.
    fn publish_state(&self) {
        let _ = self.publisher.send(self.state.clone());
    }

    /// Reconcile the set of `Server`s (and their monitors) with the set of addresses in the
    /// current description.
    fn sync_servers(&mut self) {
        let addresses: HashSet<ServerAddress> = self
            .state
            .description
            .server_addresses()
            .cloned()
            .collect();

        self.state
            .servers
            .retain(|address, _| addresses.contains(address));

        for address in addresses {
            if self.state.servers.contains_key(&address) {
                continue;
            }
            let server = Arc::new(Server::new(
                address.clone(),
                &self.options,
                self.establisher.clone(),
                self.updater.clone(),
            ));
            self.state.servers.insert(address.clone(), server);

            let monitoring_disabled = self
                .options
                .test_options
                .as_ref()
                .map(|options| options.disable_monitors)
                .unwrap_or(false);
            if !monitoring_disabled {
                Monitor::start(
                    address,
                    self.updater.clone(),
                    self.watcher.clone(),
                    self.check_requester.subscribe(),
                    self.establisher.clone(),
                    self.options.clone(),
                );
            }
        }
    }

    /// Apply a new server description to the topology, returning whether anything changed.
    async fn update_server(&mut self, sd: ServerDescription) -> bool {
        let address = sd.address.clone();
        let server_became_available = sd.is_available();

        let old_description = self.state.description.clone();
        if let Err(e) = self.state.description.update(sd) {
            tracing::warn!(address = %address, error = %e, "invalid topology transition");
            return false;
        }

        let changed = old_description.diff(&self.state.description).is_some();
        if changed {
            self.sync_servers();
        }

        // The server's pool can begin creating connections once the server is known.
        if server_became_available {
            if let Some(server) = self.state.servers.get(&address) {
                server.pool.mark_as_ready().await;
            }
        }

        if changed {
            tracing::debug!(topology = %self.state.description, "topology changed");
        }

        // Always publish: selection tasks blocked on the watch channel re-examine the topology
        // even when the transition was a no-op, bounding their wait at one heartbeat.
        self.publish_state();

        changed
    }

    /// Mark the server at the given address as Unknown, carrying the error that put it there.
    async fn mark_server_as_unknown(&mut self, address: ServerAddress, error: Error) -> bool {
        let description = ServerDescription::new_from_error(address, error);
        self.update_server(description).await
    }

    async fn handle_monitor_error(&mut self, address: ServerAddress, error: Error) -> bool {
        let server = self.state.servers.get(&address).cloned();
        let updated = self
            .mark_server_as_unknown(address.clone(), error.clone())
            .await;

        if updated {
            if let Some(server) = server {
                // The server is unreachable; connections to it are invalid.
                server
                    .pool
                    .clear(Error::pool_cleared_error(&address, &error))
                    .await;
            }
        }

        updated
    }

    async fn handle_application_error(
        &mut self,
        address: ServerAddress,
        error: Error,
        phase: HandshakePhase,
    ) -> bool {
        let server = match self.state.servers.get(&address) {
            Some(server) => server.clone(),
            None => return false,
        };

        // Ignore errors from connections that predate the most recent pool clear; the pool has
        // already reacted to whatever caused it.
        if phase.is_stale(server.pool.generation()) {
            return false;
        }

        if error.is_state_change_error() {
            // A not-primary or node-is-recovering response transitions the server to Unknown,
            // invalidates its pooled connections, and requests an immediate re-check so a new
            // primary is discovered promptly.
            let updated = self.mark_server_as_unknown(address.clone(), error.clone()).await;

            if updated {
                server
                    .pool
                    .clear(Error::pool_cleared_error(&address, &error))
                    .await;
                self.check_requester.request();
            }

            updated
        } else if (error.is_network_error()
            && (phase.is_before_completion() || error.is_non_timeout_network_error()))
            || (phase.is_before_completion() && error.is_auth_error())
        {
            // Network errors invalidate the server, except for timeouts on established
            // connections, which only say something about the operation's deadline.
            // Authentication failures during establishment do the same so the pool pauses
            // instead of hammering the server with doomed handshakes.
            let updated = self.mark_server_as_unknown(address.clone(), error.clone()).await;

            if updated {
                server
                    .pool
                    .clear(Error::pool_cleared_error(&address, &error))
                    .await;
            }

            updated
        } else {
            false
        }
    }
}
