use tokio::sync::mpsc;

use super::Connection;
use crate::{
    error::Error,
    runtime::{AcknowledgedMessage, AcknowledgmentReceiver},
};

/// Returns a new PoolManager/ManagementRequestReceiver pair.
pub(super) fn channel() -> (PoolManager, ManagementRequestReceiver) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (
        PoolManager { sender },
        ManagementRequestReceiver { receiver },
    )
}

/// A handle used to manage the connection pool. This handle does not keep the pool's worker
/// running, unlike `ConnectionRequester`.
#[derive(Clone, Debug)]
pub(crate) struct PoolManager {
    sender: mpsc::UnboundedSender<PoolManagementRequest>,
}

impl PoolManager {
    /// Clear the pool, transitioning it to Paused and incrementing its generation.
    pub(super) async fn clear(&self, cause: Error) {
        let (message, acknowledgment_receiver) = AcknowledgedMessage::package(());
        if self
            .sender
            .send(PoolManagementRequest::Clear {
                completion_handler: message,
                cause,
            })
            .is_ok()
        {
            acknowledgment_receiver.wait_for_acknowledgment().await;
        }
    }

    /// Mark the pool as ready, allowing connections to be created and checked out.
    pub(super) async fn mark_as_ready(&self) {
        let (message, acknowledgment_receiver) = AcknowledgedMessage::package(());
        if self
            .sender
            .send(PoolManagementRequest::MarkAsReady {
                completion_handler: message,
            })
            .is_ok()
        {
            acknowledgment_receiver.wait_for_acknowledgment().await;
        }
    }

    /// Check in the given connection to the pool. This returns an error containing the
    /// connection if the pool's worker has stopped running.
    pub(crate) fn check_in(&self, connection: Connection) -> std::result::Result<(), Connection> {
        if let Err(request) = self
            .sender
            .send(PoolManagementRequest::CheckIn(Box::new(connection)))
        {
            return Err(request.0.unwrap_check_in());
        }
        Ok(())
    }

    /// Notify the pool that establishing a connection succeeded.
    pub(super) fn handle_connection_succeeded(&self, connection: ConnectionSucceeded) {
        let _ = self
            .sender
            .send(PoolManagementRequest::HandleConnectionSucceeded(connection));
    }

    /// Notify the pool that establishing a connection failed.
    pub(super) fn handle_connection_failed(&self) {
        let _ = self.sender.send(PoolManagementRequest::HandleConnectionFailed);
    }

    /// Ask the pool worker to shut down, closing all of its available connections.
    pub(crate) fn shutdown(&self) -> Option<AcknowledgmentReceiver<()>> {
        let (message, acknowledgment_receiver) = AcknowledgedMessage::package(());
        self.sender
            .send(PoolManagementRequest::Shutdown {
                completion_handler: message,
            })
            .ok()?;
        Some(acknowledgment_receiver)
    }
}

#[derive(Debug)]
pub(super) struct ManagementRequestReceiver {
    pub(super) receiver: mpsc::UnboundedReceiver<PoolManagementRequest>,
}

impl ManagementRequestReceiver {
    pub(super) async fn recv(&mut self) -> Option<PoolManagementRequest> {
        self.receiver.recv().await
    }
}

#[derive(Debug)]
pub(super) enum PoolManagementRequest {
    /// Clear the pool, transitioning it to Paused.
    Clear {
        completion_handler: AcknowledgedMessage<()>,
        cause: Error,
    },

    /// Mark the pool as Ready, allowing connections to be created and checked out.
    MarkAsReady {
        completion_handler: AcknowledgedMessage<()>,
    },

    /// Check in the given connection.
    CheckIn(Box<Connection>),

    /// Update the pool based on the given establishment success.
    HandleConnectionSucceeded(ConnectionSucceeded),

    /// Update the pool after an establishment failure.
    HandleConnectionFailed,

    /// Close all connections and stop the worker.
    Shutdown {
        completion_handler: AcknowledgedMessage<()>,
    },
}

impl PoolManagementRequest {
    fn unwrap_check_in(self) -> Connection {
        match self {
            PoolManagementRequest::CheckIn(conn) => *conn,
            _ => panic!("tried to unwrap checkin but got {:?}", self),
        }
    }
}

/// The result of a successful connection establishment: either the connection was immediately
/// handed to the requesting operation, or it was created to satisfy minPoolSize and belongs in
/// the idle queue.
#[derive(Debug)]
pub(super) enum ConnectionSucceeded {
    ForPool(Box<Connection>),
    Used,
}
