#[cfg(test)]
mod test;

pub(crate) mod conn;
mod connection_requester;
pub(crate) mod establish;
mod manager;
pub(crate) mod options;
mod rate_limiter;
mod status;
mod worker;

use std::time::{Duration, Instant};

pub(crate) use self::{
    conn::{Command, Connection, RawCommandResponse, StreamDescription},
    status::PoolGenerationSubscriber,
    worker::PoolGeneration,
};
use self::{
    connection_requester::{ConnectionRequestResult, ConnectionRequester},
    establish::ConnectionEstablisher,
    manager::PoolManager,
    options::ConnectionPoolOptions,
    worker::ConnectionPoolWorker,
};
use crate::{
    error::{Error, Result},
    options::ServerAddress,
    runtime,
    sdam::TopologyUpdater,
};

pub(crate) const DEFAULT_MAX_POOL_SIZE: u32 = 10;

/// A pool of connections implementing the CMAP spec.
///
/// This type is actually a handle to task that manages the connections and is cheap to
/// clone and pass around.
#[derive(Clone, Debug)]
pub(crate) struct ConnectionPool {
    address: ServerAddress,
    manager: PoolManager,
    connection_requester: ConnectionRequester,
    generation_subscriber: PoolGenerationSubscriber,

    wait_queue_timeout: Option<Duration>,
}

impl ConnectionPool {
    pub(crate) fn new(
        address: ServerAddress,
        establisher: ConnectionEstablisher,
        server_updater: TopologyUpdater,
        wait_queue_timeout: Option<Duration>,
        options: Option<ConnectionPoolOptions>,
    ) -> Self {
        let (manager, connection_requester, generation_subscriber) =
            ConnectionPoolWorker::start(address.clone(), establisher, server_updater, options);

        Self {
            address,
            manager,
            connection_requester,
            generation_subscriber,
            wait_queue_timeout,
        }
    }

    /// Checks out a connection from the pool. This method will yield until this thread is at the
    /// front of the wait queue, and then will block again if no available connections are in the
    /// pool and the total number of connections is not less than the max pool size.
    ///
    /// Fails with a timeout error if the deadline (or the pool's `wait_queue_timeout`) elapses
    /// first, with a `ConnectionPoolCleared` error if the checkout races with a pool clear, and
    /// with a `SystemOverloaded` error if the ingress rate limiter rejects the request.
    pub(crate) async fn check_out(&self, deadline: Option<Instant>) -> Result<Connection> {
        let time_remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        let effective_timeout = match (self.wait_queue_timeout, time_remaining) {
            (Some(t), Some(r)) => Some(t.min(r)),
            (t, r) => t.or(r),
        };

        let conn = runtime::timeout_opt(effective_timeout, self.check_out_inner())
            .await
            .map_err(|_| {
                Error::network_timeout().with_source(Error::internal(format!(
                    "timed out while checking out a connection from the pool for {}",
                    self.address
                )))
            })??;

        tracing::debug!(
            connection_id = conn.id,
            address = %self.address,
            "connection checked out",
        );
        Ok(conn)
    }

    async fn check_out_inner(&self) -> Result<Connection> {
        let response = self.connection_requester.request(false).await;

        match response {
            ConnectionRequestResult::Pooled(c) => Ok(*c),
            ConnectionRequestResult::Establishing(handle) => handle.await?,
            ConnectionRequestResult::PoolCleared(e) => {
                Err(Error::pool_cleared_error(&self.address, &e))
            }
            ConnectionRequestResult::Overloaded(e) => Err(e),
            ConnectionRequestResult::PoolWarmed => Err(Error::internal(
                "checkout requests cannot be fulfilled by warming the pool",
            )),
        }
    }

    /// Increments the generation of the pool and transitions it to Paused. Rather than eagerly
    /// removing stale connections from the pool, they are left for the background task to clean
    /// up.
    pub(crate) async fn clear(&self, cause: Error) {
        self.manager.clear(cause).await
    }

    /// Mark the pool as "ready" as per the CMAP specification.
    ///
    /// Connections cannot be checked out and the background task cannot create new connections
    /// until the pool has been marked as "ready".
    pub(crate) async fn mark_as_ready(&self) {
        self.manager.mark_as_ready().await
    }

    /// Open connections until the pool holds `min_pool_size` of them, returning once every
    /// establishment has settled.
    pub(crate) async fn warm(&self) {
        worker::fill_pool(self.connection_requester.weak()).await
    }

    pub(crate) fn generation(&self) -> PoolGeneration {
        self.generation_subscriber.generation()
    }

    #[cfg(test)]
    pub(crate) fn generation_subscriber(&self) -> PoolGenerationSubscriber {
        self.generation_subscriber.clone()
    }

    /// Stop the pool's worker, closing all of its idle connections.
    pub(crate) async fn shutdown(&self) {
        if let Some(ack) = self.manager.shutdown() {
            ack.wait_for_acknowledgment().await;
        }
    }
}
