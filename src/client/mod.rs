pub(crate) mod auth;
mod executor;

use std::{
    sync::{
        atomic::{AtomicBool, AtomicI64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use derive_where::derive_where;

use crate::{
    error::{ErrorKind, Result},
    options::{ClientOptions, ServerAddress},
    sdam::{SelectedServer, Topology},
    selection_criteria::{ReadPreference, SelectionCriteria},
};

const DEFAULT_SERVER_SELECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// The client for a MongoDB deployment.
///
/// A `Client` discovers and monitors the servers of the deployment, pools connections to each
/// of them, and dispatches commands via [`Client::run_command`]. It uses
/// [`std::sync::Arc`](https://doc.rust-lang.org/std/sync/struct.Arc.html) internally, so it can
/// be shared safely across threads or async tasks: clones refer to the same topology,
/// connection pools, and credential state.
#[derive(Clone, Debug)]
pub struct Client {
    inner: Arc<ClientInner>,
}

#[derive_where(Debug)]
struct ClientInner {
    topology: Topology,
    #[derive_where(skip)]
    options: ClientOptions,
    shutdown: AtomicBool,
    next_transaction_number: AtomicI64,
}

impl Client {
    /// Creates a new `Client` connected to the cluster specified by `options`, starting the
    /// topology's monitoring tasks.
    ///
    /// This must be called from within an async runtime, as the client immediately spawns its
    /// topology and pool worker tasks.
    pub fn with_options(options: ClientOptions) -> Result<Self> {
        options.validate()?;

        let topology = Topology::new(options.clone())?;
        let inner = Arc::new(ClientInner {
            topology,
            options,
            shutdown: AtomicBool::new(false),
            next_transaction_number: AtomicI64::new(0),
        });

        Ok(Self { inner })
    }

    pub(crate) fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    pub(crate) fn topology(&self) -> &Topology {
        &self.inner.topology
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::SeqCst)
    }

    /// Open connections to every known server until each pool holds `min_pool_size` of them.
    /// This is normally done gradually in the background; calling this method front-loads the
    /// work so that the first operations don't pay connection-establishment latency.
    pub async fn warm_connection_pool(&self) {
        if !self.inner.options.min_pool_size.map_or(false, |size| size > 0) {
            // No-op when min_pool_size is zero or unset.
            return;
        }
        for server in self.inner.topology.watch().peek_latest().servers.values() {
            server.pool.warm().await;
        }
    }

    /// Shut down the client: stop the monitoring tasks and close all pooled connections.
    /// Operations dispatched after this returns will fail with a `Shutdown` error.
    pub async fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.topology.shutdown().await;
    }

    pub(crate) fn next_transaction_number(&self) -> i64 {
        self.inner
            .next_transaction_number
            .fetch_add(1, Ordering::SeqCst)
            + 1
    }

    /// Selects a server according to the given criteria, waiting on topology changes until a
    /// suitable server appears or the deadline passes.
    pub(crate) async fn select_server(
        &self,
        criteria: Option<&SelectionCriteria>,
        operation_deadline: Option<Instant>,
        deprioritized: Option<&ServerAddress>,
    ) -> Result<SelectedServer> {
        let default_criteria = SelectionCriteria::ReadPreference(ReadPreference::Primary);
        let criteria = criteria.unwrap_or(&default_criteria);

        let selection_timeout = self
            .inner
            .options
            .server_selection_timeout
            .unwrap_or(DEFAULT_SERVER_SELECTION_TIMEOUT);
        let mut deadline = Instant::now() + selection_timeout;
        if let Some(operation_deadline) = operation_deadline {
            deadline = deadline.min(operation_deadline);
        }

        let mut watcher = self.inner.topology.watch();
        loop {
            let state = watcher.observe_latest();

            if let Some(server) = crate::sdam::attempt_to_select_server(
                criteria,
                &state.description,
                &state.servers,
                deprioritized,
            )? {
                return Ok(server);
            }

            // Nothing suitable yet: ask the monitors to check now and wait for the topology to
            // move, bounded by the remaining deadline.
            self.inner.topology.request_update();

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || !watcher.wait_for_update(remaining).await {
                return Err(ErrorKind::ServerSelection {
                    message: state
                        .description
                        .server_selection_timeout_error_message(criteria),
                }
                .into());
            }
        }
    }
}
