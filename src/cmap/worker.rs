use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use super::{
    conn::PendingConnection,
    connection_requester,
    connection_requester::{
        ConnectionRequest,
        ConnectionRequestReceiver,
        ConnectionRequestResult,
        ConnectionRequester,
        WeakConnectionRequester,
    },
    establish::ConnectionEstablisher,
    manager,
    manager::{ConnectionSucceeded, ManagementRequestReceiver, PoolManagementRequest, PoolManager},
    options::ConnectionPoolOptions,
    rate_limiter::IngressRateLimiter,
    status,
    status::{PoolGenerationPublisher, PoolGenerationSubscriber},
    Connection,
    DEFAULT_MAX_POOL_SIZE,
};
use crate::{
    client::auth::Credential,
    error::{Error, ErrorKind, Result},
    options::ServerAddress,
    runtime::{self, WorkerHandleListener},
    sdam::TopologyUpdater,
};

const DEFAULT_MAX_CONNECTING: u32 = 2;
const DEFAULT_INGRESS_RATE_PER_SEC: u32 = 20;
const DEFAULT_INGRESS_BURST_CAPACITY_SECS: u32 = 1;
const DEFAULT_INGRESS_MAX_QUEUE_DEPTH: u32 = 10;
const MAINTENANCE_FREQUENCY: Duration = Duration::from_millis(500);

/// The generation of a connection pool: a counter bumped on every clear, used to invalidate all
/// of the pool's extant connections without walking them.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(crate) struct PoolGeneration(pub(crate) u32);

/// A worker task that manages the shared state of the pool.
pub(crate) struct ConnectionPoolWorker {
    /// The address the pool's connections will connect to.
    address: ServerAddress,

    /// Current state of the pool. Determines if connections may be checked out
    /// and if min_pool_size connection creation should continue.
    state: PoolState,

    /// The total number of connections managed by the pool, including connections which are
    /// currently checked out of the pool or have yet to be established.
    total_connection_count: u32,

    /// The number of connections currently being established by this pool.
    pending_connection_count: u32,

    /// The ID of the next connection created by the pool.
    next_connection_id: u32,

    /// The current generation of the pool. The generation is incremented whenever the pool is
    /// cleared. Connections belonging to a previous generation are considered stale and will be
    /// closed when checked back in or when popped off of the set of available connections.
    generation: PoolGeneration,

    /// The established connections that are currently checked into the pool and awaiting usage in
    /// future operations.
    available_connections: VecDeque<Connection>,

    /// Contains the logic for "establishing" a connection. This includes handshaking and
    /// authenticating a connection when it's first created.
    establisher: ConnectionEstablisher,

    /// The credential used to authenticate connections, if any.
    credential: Option<Credential>,

    /// Connections that have been ready for usage in the pool for longer than `max_idle_time`
    /// will be closed either by the background thread or when popped off of the set of available
    /// connections. If `max_idle_time` is `None`, then connections will not be closed due to
    /// being idle.
    max_idle_time: Option<Duration>,

    /// The minimum number of connections that the pool can have at a given time. This includes
    /// connections which are currently checked out of the pool. If fewer than `min_pool_size`
    /// connections are in the pool, the background thread will create more connections and add
    /// them to the pool.
    min_pool_size: Option<u32>,

    /// The maximum number of connections that the pool can manage, including connections checked
    /// out of the pool. If a thread requests a connection and the pool is empty + there are
    /// already max_pool_size connections in use, it will block until one is returned or the
    /// wait_queue_timeout is exceeded.
    max_pool_size: u32,

    /// The maximum number of new connections that can be created concurrently.
    max_connecting: u32,

    /// Token bucket gating new connection establishment.
    rate_limiter: IngressRateLimiter,

    /// How many requests may sit in the wait queue waiting for an establishment slot before
    /// further requests are rejected with a `SystemOverloaded` error.
    ingress_max_queue_depth: u32,

    /// Receiver used to determine if any threads hold references to this pool. If all the
    /// sender ends of this receiver drop, this worker will be notified and drop too.
    handle_listener: WorkerHandleListener,

    /// Receiver for incoming connection check out requests.
    request_receiver: ConnectionRequestReceiver,

    /// Ordered queue of incoming requests waiting for connections.
    wait_queue: VecDeque<ConnectionRequest>,

    /// Receiver for incoming pool management requests (e.g. checking in a connection).
    management_receiver: ManagementRequestReceiver,

    /// Sender used to publish the latest generation.
    generation_publisher: PoolGenerationPublisher,

    /// A pool manager that can be cloned and attached to connections checked out of the pool.
    manager: PoolManager,

    /// A handle used to notify SDAM that a connection establishment error happened. This will
    /// allow the server to transition to Unknown and clear the pool as necessary.
    server_updater: TopologyUpdater,
}

impl ConnectionPoolWorker {
    /// Starts a worker and returns a manager and connection requester.
    /// Once all connection requesters are dropped, the worker will stop executing
    /// and close the pool.
    pub(super) fn start(
        address: ServerAddress,
        establisher: ConnectionEstablisher,
        server_updater: TopologyUpdater,
        options: Option<ConnectionPoolOptions>,
    ) -> (PoolManager, ConnectionRequester, PoolGenerationSubscriber) {
        // A max idle time of zero means that connections should not be closed due to idleness.
        let mut max_idle_time = options.as_ref().and_then(|opts| opts.max_idle_time);
        if max_idle_time == Some(Duration::from_millis(0)) {
            max_idle_time = None;
        }

        let max_pool_size = options
            .as_ref()
            .and_then(|opts| opts.max_pool_size)
            .unwrap_or(DEFAULT_MAX_POOL_SIZE);
        let max_connecting = options
            .as_ref()
            .and_then(|opts| opts.max_connecting)
            .unwrap_or(DEFAULT_MAX_CONNECTING);
        let min_pool_size = options.as_ref().and_then(|opts| opts.min_pool_size);

        let rate_limiter = IngressRateLimiter::new(
            options
                .as_ref()
                .and_then(|opts| opts.ingress_rate_per_sec)
                .unwrap_or(DEFAULT_INGRESS_RATE_PER_SEC),
            options
                .as_ref()
                .and_then(|opts| opts.ingress_burst_capacity_secs)
                .unwrap_or(DEFAULT_INGRESS_BURST_CAPACITY_SECS),
        );
        let ingress_max_queue_depth = options
            .as_ref()
            .and_then(|opts| opts.ingress_max_queue_depth)
            .unwrap_or(DEFAULT_INGRESS_MAX_QUEUE_DEPTH);

        let (handle, handle_listener) = WorkerHandleListener::channel();
        let (connection_requester, request_receiver) = connection_requester::channel(handle);
        let (manager, management_receiver) = manager::channel();

        let generation = PoolGeneration::default();
        let (generation_publisher, generation_subscriber) = status::channel(generation);

        #[cfg(test)]
        let state = if options
            .as_ref()
            .and_then(|opts| opts.ready)
            .unwrap_or(false)
        {
            PoolState::Ready
        } else {
            PoolState::New
        };
        #[cfg(not(test))]
        let state = PoolState::New;

        let credential = options.and_then(|o| o.credential);

        let worker = ConnectionPoolWorker {
            address,
            max_idle_time,
            min_pool_size,
            credential,
            establisher,
            next_connection_id: 1,
            total_connection_count: 0,
            pending_connection_count: 0,
            generation,
            available_connections: VecDeque::new(),
            max_pool_size,
            max_connecting,
            rate_limiter,
            ingress_max_queue_depth,
            request_receiver,
            wait_queue: Default::default(),
            management_receiver,
            manager: manager.clone(),
            handle_listener,
            state,
            generation_publisher,
            server_updater,
        };

        runtime::spawn(async move {
            worker.execute().await;
        });

        (manager, connection_requester, generation_subscriber)
    }

    /// Run the worker task, listening on the various receivers until all handles have been
    /// dropped. Once all handles are dropped, the pool will close any available connections.
    async fn execute(mut self) {
        let mut maintenance_interval = tokio::time::interval(MAINTENANCE_FREQUENCY);
        let mut shutdown_ack = None;

        loop {
            let task = tokio::select! {
                // Ensure that check-in, clear, and ready always have priority over checkout
                // requests. The pool exiting also has priority.
                biased;

                Some(request) = self.management_receiver.recv() => PoolTask::Management(request),
                _ = self.handle_listener.wait_for_all_handle_drops() => {
                    // all worker handles have been dropped meaning this
                    // pool has no more references and can be dropped itself.
                    break
                },
                Some(request) = self.request_receiver.recv() => {
                    PoolTask::CheckOut(request)
                },
                _ = maintenance_interval.tick() => {
                    PoolTask::Maintenance
                },
                else => {
                    break
                }
            };

            match task {
                PoolTask::CheckOut(request) => match self.state {
                    PoolState::Ready => self.receive_checkout_request(request),
                    PoolState::Paused(ref e) => {
                        // if receiver doesn't listen to error that's ok.
                        let _ = request.fulfill(ConnectionRequestResult::PoolCleared(e.clone()));
                    }
                    PoolState::New => {
                        let _ = request.fulfill(ConnectionRequestResult::PoolCleared(
                            ErrorKind::Internal {
                                message: "check out attempted from new pool".to_string(),
                            }
                            .into(),
                        ));
                    }
                },
                PoolTask::Management(request) => match request {
                    PoolManagementRequest::CheckIn(connection) => {
                        self.check_in(*connection);
                    }
                    PoolManagementRequest::Clear {
                        cause,
                        completion_handler,
                    } => {
                        self.clear(cause);
                        completion_handler.acknowledge(());
                    }
                    PoolManagementRequest::MarkAsReady { completion_handler } => {
                        self.mark_as_ready();
                        completion_handler.acknowledge(());
                    }
                    PoolManagementRequest::HandleConnectionSucceeded(conn) => {
                        self.handle_connection_succeeded(conn);
                    }
                    PoolManagementRequest::HandleConnectionFailed => {
                        self.handle_connection_failed();
                    }
                    PoolManagementRequest::Shutdown { completion_handler } => {
                        shutdown_ack = Some(completion_handler);
                        break;
                    }
                },
                PoolTask::Maintenance => {
                    self.perform_maintenance();
                }
            }

            while self.can_service_connection_request() {
                match self.wait_queue.pop_front() {
                    Some(request) => {
                        if !self.check_out(request) {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }

        while let Some(connection) = self.available_connections.pop_front() {
            connection.close_and_drop("pool closed");
        }

        tracing::debug!(address = %self.address, "connection pool closed");
        if let Some(ack) = shutdown_ack {
            ack.acknowledge(());
        }
    }

    fn below_max_connections(&self) -> bool {
        self.total_connection_count < self.max_pool_size
    }

    fn can_service_connection_request(&self) -> bool {
        if !matches!(self.state, PoolState::Ready) {
            return false;
        }

        if !self.available_connections.is_empty() {
            return true;
        }

        self.below_max_connections() && self.pending_connection_count < self.max_connecting
    }

    /// Accept a new checkout request, rejecting it immediately when the wait queue is already
    /// holding `ingress_max_queue_depth` requests with no idle connection to serve them.
    /// Overload rejections never touch the pool generation.
    fn receive_checkout_request(&mut self, request: ConnectionRequest) {
        if !request.is_warm_pool()
            && self.available_connections.is_empty()
            && self.wait_queue.len() >= self.ingress_max_queue_depth as usize
        {
            tracing::warn!(
                address = %self.address,
                queue_depth = self.wait_queue.len(),
                "rejecting connection checkout: establishment queue is saturated",
            );
            let _ = request.fulfill(ConnectionRequestResult::Overloaded(
                Error::system_overloaded(&self.address),
            ));
            return;
        }

        self.wait_queue.push_back(request);
    }

    /// Attempt to fulfill the given request. Returns false if no progress can be made and the
    /// request was put back at the front of the wait queue.
    fn check_out(&mut self, request: ConnectionRequest) -> bool {
        if request.is_warm_pool() {
            if self.total_connection_count >= self.min_pool_size.unwrap_or(0) {
                let _ = request.fulfill(ConnectionRequestResult::PoolWarmed);
                return true;
            }
        } else {
            // first attempt to check out an available connection
            while let Some(mut conn) = self.available_connections.pop_back() {
                // Close the connection if it's stale.
                if conn.generation.is_stale(&self.generation) {
                    self.close_connection(conn, "stale");
                    continue;
                }

                // Close the connection if it's idle.
                if conn.is_idle(self.max_idle_time) {
                    self.close_connection(conn, "idle");
                    continue;
                }

                conn.mark_as_in_use(self.manager.clone());
                if let Err(request) =
                    request.fulfill(ConnectionRequestResult::Pooled(Box::new(conn)))
                {
                    // checking out thread stopped listening, indicating it hit the WaitQueue
                    // timeout, so we put connection back into pool.
                    let mut connection = request.unwrap_pooled_connection();
                    connection.mark_as_available();
                    self.available_connections.push_back(connection);
                }

                return true;
            }
        }

        // otherwise, attempt to create a connection.
        if !self.below_max_connections() || self.pending_connection_count >= self.max_connecting {
            // Put the request at the front of the wait queue so that it will be processed next
            // time a request can be processed.
            self.wait_queue.push_front(request);
            return false;
        }

        if !self.rate_limiter.try_acquire() {
            // No establishment token; the request waits for the bucket to refill (rechecked on
            // the next management event or maintenance tick).
            self.wait_queue.push_front(request);
            return false;
        }

        let establisher = self.establisher.clone();
        let pending_connection = self.create_pending_connection();
        let manager = self.manager.clone();
        let server_updater = self.server_updater.clone();
        let credential = self.credential.clone();

        let handle = runtime::spawn(async move {
            let mut establish_result = establish_connection(
                establisher,
                pending_connection,
                server_updater,
                &manager,
                credential,
            )
            .await;

            if let Ok(ref mut c) = establish_result {
                c.mark_as_in_use(manager.clone());
                manager.handle_connection_succeeded(ConnectionSucceeded::Used);
            }

            establish_result
        });

        // this only fails if the other end stopped listening (e.g. due to timeout), in
        // which case we just let the connection establish in the background.
        let _: std::result::Result<_, _> =
            request.fulfill(ConnectionRequestResult::Establishing(handle));
        true
    }

    fn create_pending_connection(&mut self) -> PendingConnection {
        self.total_connection_count += 1;
        self.pending_connection_count += 1;

        let pending_connection = PendingConnection {
            id: self.next_connection_id,
            address: self.address.clone(),
            generation: self.generation,
            time_created: Instant::now(),
        };
        self.next_connection_id += 1;

        pending_connection
    }

    /// Process a connection establishment failure.
    fn handle_connection_failed(&mut self) {
        // Establishing a pending connection failed, so that must be reflected in to total
        // connection count.
        self.total_connection_count -= 1;
        self.pending_connection_count -= 1;
    }

    /// Process a successful connection establishment, optionally populating the pool with the
    /// resulting connection.
    fn handle_connection_succeeded(&mut self, connection: ConnectionSucceeded) {
        self.pending_connection_count -= 1;
        if let ConnectionSucceeded::ForPool(connection) = connection {
            let mut connection = *connection;
            connection.mark_as_available();
            self.available_connections.push_back(connection);
        }
    }

    fn check_in(&mut self, mut conn: Connection) {
        conn.mark_as_available();

        if conn.has_errored() {
            self.close_connection(conn, "error");
        } else if conn.generation.is_stale(&self.generation) {
            self.close_connection(conn, "stale");
        } else if conn.is_executing() || conn.is_streaming() {
            self.close_connection(conn, "dropped mid-operation");
        } else {
            self.available_connections.push_back(conn);
        }
    }

    fn clear(&mut self, cause: Error) {
        self.generation.0 += 1;
        let prev = std::mem::replace(&mut self.state, PoolState::Paused(cause.clone()));
        self.generation_publisher.publish(self.generation);

        if matches!(prev, PoolState::Ready) {
            tracing::debug!(
                address = %self.address,
                generation = self.generation.0,
                cause = %cause,
                "connection pool cleared",
            );

            for request in self.wait_queue.drain(..) {
                // an error means the other end hung up already, which is okay because we were
                // returning an error anyways
                let _: std::result::Result<_, _> =
                    request.fulfill(ConnectionRequestResult::PoolCleared(cause.clone()));
            }
        }
    }

    fn mark_as_ready(&mut self) {
        if matches!(self.state, PoolState::Ready) {
            return;
        }

        tracing::debug!(address = %self.address, "connection pool ready");
        self.state = PoolState::Ready;
    }

    /// Close a connection and decrement the total connection count.
    fn close_connection(&mut self, connection: Connection, reason: &'static str) {
        connection.close_and_drop(reason);
        self.total_connection_count -= 1;
    }

    /// Ensure all connections in the pool are valid and that the pool is managing at least
    /// min_pool_size connections.
    fn perform_maintenance(&mut self) {
        self.remove_perished_connections();
        if matches!(self.state, PoolState::Ready) {
            self.ensure_min_connections();
        }
    }

    /// Iterate over the connections and remove any that are stale or idle.
    fn remove_perished_connections(&mut self) {
        while let Some(connection) = self.available_connections.pop_front() {
            if connection.generation.is_stale(&self.generation) {
                self.close_connection(connection, "stale");
            } else if connection.is_idle(self.max_idle_time) {
                self.close_connection(connection, "idle");
            } else {
                self.available_connections.push_front(connection);
                // All subsequent connections are either not idle or not stale since they were
                // checked into the pool later, so we can just quit early.
                break;
            };
        }
    }

    /// Populate the pool with enough connections to meet the min_pool_size requirement.
    fn ensure_min_connections(&mut self) {
        if let Some(min_pool_size) = self.min_pool_size {
            while self.total_connection_count < min_pool_size
                && self.pending_connection_count < self.max_connecting
            {
                if !self.rate_limiter.try_acquire() {
                    // Warm-up is background work; it just waits for the next tick.
                    return;
                }
                let pending_connection = self.create_pending_connection();
                let manager = self.manager.clone();
                let establisher = self.establisher.clone();
                let updater = self.server_updater.clone();
                let credential = self.credential.clone();

                runtime::spawn(async move {
                    let connection = establish_connection(
                        establisher,
                        pending_connection,
                        updater,
                        &manager,
                        credential,
                    )
                    .await;

                    if let Ok(connection) = connection {
                        manager.handle_connection_succeeded(ConnectionSucceeded::ForPool(Box::new(
                            connection,
                        )))
                    }
                });
            }
        }
    }
}

/// Helper covering the common connection establishment behavior between
/// connections established in check_out and those established as part of
/// satisfying min_pool_size.
async fn establish_connection(
    establisher: ConnectionEstablisher,
    pending_connection: PendingConnection,
    server_updater: TopologyUpdater,
    manager: &PoolManager,
    credential: Option<Credential>,
) -> Result<Connection> {
    let address = pending_connection.address.clone();

    let establish_result = establisher
        .establish_connection(pending_connection, credential.as_ref())
        .await;

    if let Err(ref e) = establish_result {
        server_updater
            .handle_application_error(
                address.clone(),
                e.cause.clone(),
                e.handshake_phase.clone(),
            )
            .await;
        manager.handle_connection_failed();
    }

    establish_result.map_err(|e| e.cause)
}

/// Warm the pool to its minimum size on behalf of `ConnectionPool::warm`.
pub(super) async fn fill_pool(requester: WeakConnectionRequester) {
    let mut establishing = vec![];
    loop {
        let result = requester.request_warm_pool().await;
        match result {
            None => break,
            Some(ConnectionRequestResult::Establishing(handle)) => {
                // Let connections finish establishing in parallel.
                establishing.push(runtime::spawn(async move {
                    let _ = handle.await;
                    // The connection is dropped here, returning it to the pool.
                }));
            }
            _ => break,
        };
    }
    // Wait for all connections to finish establishing before reporting completion.
    for handle in establishing {
        let _ = handle.await;
    }
}

/// Enum modeling the possible pool states as described in the CMAP spec.
///
/// The "closed" state is omitted here because the pool is considered closed only
/// once it goes out of scope and cannot be manually closed before then.
#[derive(Debug)]
enum PoolState {
    /// Same as Paused, but only for a new pool, not one that has been cleared due to an error.
    New,

    /// Connections may not be checked out nor created in the background to satisfy minPoolSize.
    Paused(Error),

    /// Pool is operational.
    Ready,
}

/// Task for the worker to process.
#[derive(Debug)]
enum PoolTask {
    /// Handle a management request from a `PoolManager`.
    Management(PoolManagementRequest),

    /// Fulfill the given connection request.
    CheckOut(ConnectionRequest),

    /// Perform pool maintenance (ensure min connections, remove stale or idle connections).
    Maintenance,
}
