mod command;
pub(crate) mod stream_description;
pub(crate) mod wire;

use std::time::{Duration, Instant};

use derive_where::derive_where;
use tokio::{io::BufStream, sync::mpsc};

use self::wire::{Message, MessageFlags, RequestIdGenerator};
use super::manager::PoolManager;
#[cfg(any(
    feature = "zstd-compression",
    feature = "zlib-compression",
    feature = "snappy-compression"
))]
use crate::compression::Compressor;
use crate::{
    cmap::PoolGeneration,
    error::{Error, ErrorKind, Result},
    options::ServerAddress,
    runtime::AsyncStream,
};
pub(crate) use command::{Command, RawCommandResponse};
pub(crate) use stream_description::StreamDescription;

/// A wrapper around the byte stream that tracks all the state needed to run commands over it:
/// the wire codec (request ids and reply correlation), the pool generation it was created under,
/// handshake results, and the last OIDC token it authenticated with.
#[derive_where(Debug)]
pub(crate) struct Connection {
    /// Driver-generated ID for the connection.
    pub(crate) id: u32,

    /// Server-generated ID for the connection.
    pub(crate) server_id: Option<i64>,

    pub(crate) address: ServerAddress,

    pub(crate) generation: ConnectionGeneration,

    pub(crate) time_created: Instant,

    /// The cached StreamDescription from the connection's handshake.
    pub(crate) stream_description: Option<StreamDescription>,

    /// Marks the time when the connection was last checked into the pool. This is used
    /// to detect if the connection is idle.
    ready_and_available_time: Option<Instant>,

    /// PoolManager used to check this connection back in when dropped.
    /// None when checked into the pool.
    pub(super) pool_manager: Option<PoolManager>,

    /// Whether or not a command is currently being run on this connection. This is set to `true`
    /// right before sending bytes to the server and set back to `false` once a full response has
    /// been read.
    command_executing: bool,

    /// Stores a network error encountered while reading or writing. Once the connection has
    /// received an error, it should not be used again and will be closed upon check-in to the
    /// pool.
    error: Option<Error>,

    /// Whether the most recently received message included the moreToCome flag, indicating the
    /// server may send more responses without any additional requests. Attempting to send new
    /// messages on this connection while this value is true will return an error. This value
    /// will remain true until a server response does not include the moreToCome flag.
    more_to_come: bool,

    /// Source of the ids for requests sent on this connection.
    request_id_generator: RequestIdGenerator,

    #[derive_where(skip)]
    stream: BufStream<AsyncStream>,

    /// Compressor to use to compress outgoing messages: the first compressor in the client's
    /// configured list that the server's hello response also listed. Inbound messages are
    /// decompressed with whatever algorithm their envelope names.
    #[cfg(any(
        feature = "zstd-compression",
        feature = "zlib-compression",
        feature = "snappy-compression"
    ))]
    pub(super) compressor: Option<Compressor>,

    /// If the connection is pinned to a cursor or transaction, the channel sender to return this
    /// connection to the pin holder.
    pinned_sender: Option<mpsc::Sender<Connection>>,

    /// The access token used the last time this connection authenticated via MONGODB-OIDC.
    /// Reauthentication passes it to the token cache's invalidate so a stale token can be
    /// dropped without clobbering a newer one fetched by another connection.
    pub(crate) oidc_access_token: Option<String>,
}

impl Connection {
    fn new(
        address: ServerAddress,
        stream: AsyncStream,
        id: u32,
        generation: ConnectionGeneration,
        time_created: Instant,
    ) -> Self {
        Self {
            id,
            server_id: None,
            address,
            generation,
            time_created,
            stream_description: None,
            ready_and_available_time: None,
            pool_manager: None,
            command_executing: false,
            error: None,
            more_to_come: false,
            request_id_generator: RequestIdGenerator::default(),
            stream: BufStream::new(stream),
            #[cfg(any(
                feature = "zstd-compression",
                feature = "zlib-compression",
                feature = "snappy-compression"
            ))]
            compressor: None,
            pinned_sender: None,
            oidc_access_token: None,
        }
    }

    /// Create a connection intended to be stored in a connection pool for operation execution.
    pub(crate) fn new_pooled(pending_connection: PendingConnection, stream: AsyncStream) -> Self {
        let generation = ConnectionGeneration::Normal(pending_connection.generation.0);
        Self::new(
            pending_connection.address,
            stream,
            pending_connection.id,
            generation,
            pending_connection.time_created,
        )
    }

    /// Create a connection intended for monitoring purposes. Monitoring connections do not
    /// belong to a pool and have no generation.
    pub(crate) fn new_monitoring(address: ServerAddress, stream: AsyncStream, id: u32) -> Self {
        Self::new(
            address,
            stream,
            id,
            ConnectionGeneration::Monitoring,
            Instant::now(),
        )
    }

    pub(crate) fn address(&self) -> &ServerAddress {
        &self.address
    }

    /// Helper to mark the time that the connection was checked into the pool for the purpose of
    /// detecting when it becomes idle.
    pub(super) fn mark_as_available(&mut self) {
        self.pool_manager.take();
        self.ready_and_available_time = Some(Instant::now());
    }

    /// Helper to mark that the connection has been checked out of the pool. This ensures that the
    /// connection is not marked as idle based on the time that it's checked out and that it has a
    /// reference to the pool.
    pub(super) fn mark_as_in_use(&mut self, manager: PoolManager) {
        self.pool_manager = Some(manager);
        self.ready_and_available_time.take();
    }

    /// Checks if the connection is idle.
    pub(super) fn is_idle(&self, max_idle_time: Option<Duration>) -> bool {
        self.ready_and_available_time
            .and_then(|ready_and_available_time| {
                max_idle_time.map(|max_idle_time| {
                    Instant::now().duration_since(ready_and_available_time) >= max_idle_time
                })
            })
            .unwrap_or(false)
    }

    /// Checks if the connection is currently executing an operation.
    pub(super) fn is_executing(&self) -> bool {
        self.command_executing
    }

    /// Checks if the connection experienced a network error and should be closed.
    pub(super) fn has_errored(&self) -> bool {
        self.error.is_some()
    }

    /// Whether the server may still send moreToCome replies on this connection.
    pub(crate) fn is_streaming(&self) -> bool {
        self.more_to_come
    }

    /// Mark this connection as broken so that it is closed rather than reused when it returns to
    /// the pool. Used when a deadline expired mid-operation and the stream state is unknown.
    pub(crate) fn mark_broken(&mut self, error: Error) {
        self.error = Some(error);
    }

    pub(crate) fn stream_description(&self) -> Result<&StreamDescription> {
        self.stream_description.as_ref().ok_or_else(|| {
            ErrorKind::Internal {
                message: "Stream checked out but not handshaked".to_string(),
            }
            .into()
        })
    }

    /// Sends a message on this connection and reads the reply, enforcing request/reply
    /// correlation.
    pub(crate) async fn send_message(
        &mut self,
        mut message: Message,
        #[cfg_attr(
            not(any(
                feature = "zstd-compression",
                feature = "zlib-compression",
                feature = "snappy-compression"
            )),
            allow(unused_variables)
        )]
        to_compress: bool,
    ) -> Result<RawCommandResponse> {
        if self.more_to_come {
            return Err(Error::internal(format!(
                "attempted to send a new message to {} but moreToCome bit was set",
                self.address()
            )));
        }

        let request_id = self.request_id_generator.next_id();
        message.request_id = Some(request_id);

        self.command_executing = true;

        #[cfg(any(
            feature = "zstd-compression",
            feature = "zlib-compression",
            feature = "snappy-compression"
        ))]
        let write_result = match self.compressor {
            Some(ref compressor) if to_compress => {
                message
                    .write_compressed_to(&mut self.stream, compressor)
                    .await
            }
            _ => message.write_to(&mut self.stream).await,
        };

        #[cfg(not(any(
            feature = "zstd-compression",
            feature = "zlib-compression",
            feature = "snappy-compression"
        )))]
        let write_result = message.write_to(&mut self.stream).await;

        if let Err(ref err) = write_result {
            self.error = Some(err.clone());
        }
        write_result?;

        let response_message_result = Message::read_from(
            &mut self.stream,
            self.stream_description
                .as_ref()
                .map(|d| d.max_message_size_bytes),
        )
        .await;
        self.command_executing = false;
        if let Err(ref err) = response_message_result {
            self.error = Some(err.clone());
        }

        let response_message = response_message_result?;
        if response_message.response_to != request_id {
            let err = Error::invalid_response(format!(
                "expected response to request {} but got a response to request {}",
                request_id, response_message.response_to
            ));
            self.error = Some(err.clone());
            return Err(err);
        }

        self.more_to_come = response_message.flags.contains(MessageFlags::MORE_TO_COME);

        Ok(RawCommandResponse::new(
            self.address.clone(),
            response_message,
        ))
    }

    /// Sends a command on this connection.
    pub(crate) async fn send_command(&mut self, command: Command) -> Result<RawCommandResponse> {
        let to_compress = command.should_compress();
        let message = Message::from_command(command, None)?;
        self.send_message(message, to_compress).await
    }

    /// Receive the next message from the server without sending anything. This can only be used
    /// while the server is streaming moreToCome replies to an earlier exhaust request.
    pub(crate) async fn receive_message(&mut self) -> Result<RawCommandResponse> {
        if !self.more_to_come {
            return Err(Error::internal(format!(
                "attempted to stream response from connection to {} but moreToCome bit was not set",
                self.address()
            )));
        }

        self.command_executing = true;
        // The request-id round trip is suppressed while the server streams moreToCome replies,
        // so no correlation check happens here.
        let response_message_result = Message::read_from(
            &mut self.stream,
            self.stream_description
                .as_ref()
                .map(|d| d.max_message_size_bytes),
        )
        .await;
        self.command_executing = false;
        if let Err(ref err) = response_message_result {
            self.error = Some(err.clone());
        }

        let response_message = response_message_result?;
        self.more_to_come = response_message.flags.contains(MessageFlags::MORE_TO_COME);

        Ok(RawCommandResponse::new(
            self.address.clone(),
            response_message,
        ))
    }

    /// Pin the connection, removing it from the normal connection pool: once checked back into
    /// the pool, it will be returned to the pin owner via the returned handle rather than making
    /// it available for other operations.
    pub(crate) fn pin(&mut self) -> Result<PinnedConnectionHandle> {
        if self.pinned_sender.is_some() {
            return Err(Error::internal(format!(
                "cannot pin an already-pinned connection (id = {})",
                self.id
            )));
        }
        if self.pool_manager.is_none() {
            return Err(Error::internal(format!(
                "cannot pin a checked-in connection (id = {})",
                self.id
            )));
        }
        let (tx, rx) = mpsc::channel(1);
        self.pinned_sender = Some(tx);
        Ok(PinnedConnectionHandle {
            id: self.id,
            receiver: rx,
        })
    }

    /// Close this connection, cleanly shutting down its stream.
    pub(super) fn close_and_drop(mut self, reason: &'static str) {
        self.close(reason);
    }

    fn close(&mut self, reason: &'static str) {
        self.pool_manager.take();
        tracing::debug!(
            connection_id = self.id,
            server_id = self.server_id,
            address = %self.address,
            reason,
            "closing connection",
        );
    }

    /// Nullify the inner state and return it in a new `Connection` for checking back in to
    /// the pool or pin holder from a `Drop` implementation.
    fn take(&mut self) -> Connection {
        Connection {
            id: self.id,
            server_id: self.server_id,
            address: self.address.clone(),
            generation: self.generation,
            time_created: self.time_created,
            stream_description: self.stream_description.take(),
            ready_and_available_time: None,
            pool_manager: None,
            command_executing: self.command_executing,
            error: self.error.take(),
            more_to_come: self.more_to_come,
            request_id_generator: std::mem::take(&mut self.request_id_generator),
            stream: std::mem::replace(&mut self.stream, BufStream::new(AsyncStream::Null)),
            #[cfg(any(
                feature = "zstd-compression",
                feature = "zlib-compression",
                feature = "snappy-compression"
            ))]
            compressor: self.compressor.clone(),
            pinned_sender: None,
            oidc_access_token: self.oidc_access_token.take(),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // If the connection has a pool manager, that means that the connection is
        // being dropped when it's checked out. If the pin sender is present, the connection was
        // pinned by a transaction or cursor, which gets first claim on it; otherwise it is
        // returned to the pool.
        if let Some(pinned_sender) = self.pinned_sender.take() {
            let mut conn = self.take();
            conn.pool_manager = self.pool_manager.take();
            if let Err(send_error) = pinned_sender.try_send(conn) {
                // The pin owner is gone; route the connection back to the pool.
                let mut conn = match send_error {
                    mpsc::error::TrySendError::Full(c) | mpsc::error::TrySendError::Closed(c) => c,
                };
                if let Some(manager) = conn.pool_manager.take() {
                    if let Err(mut conn) = manager.check_in(conn) {
                        conn.close("pool closed");
                    }
                }
            }
        } else if let Some(manager) = self.pool_manager.take() {
            let conn = self.take();
            if let Err(mut conn) = manager.check_in(conn) {
                conn.close("pool closed");
            }
        }
    }
}

/// A handle to a pinned connection. While this handle lives, checking the connection in returns
/// it to the handle rather than to the pool's idle queue.
#[derive(Debug)]
pub(crate) struct PinnedConnectionHandle {
    id: u32,
    receiver: mpsc::Receiver<Connection>,
}

impl PinnedConnectionHandle {
    /// Retrieve the pinned connection. Will fail if the connection has been unpinned or was
    /// closed due to an error.
    pub(crate) async fn take_connection(&mut self) -> Result<Connection> {
        let mut connection = self.receiver.recv().await.ok_or_else(|| {
            Error::internal(format!(
                "cannot take connection after unpin (id={})",
                self.id
            ))
        })?;

        // The connection must be re-pinned so subsequent drops route back here.
        let (tx, rx) = mpsc::channel(1);
        connection.pinned_sender = Some(tx);
        self.receiver = rx;

        Ok(connection)
    }
}

/// The generation a connection was created under.
///
/// Monitoring connections are not part of a pool and have no generation; application connections
/// record the pool generation at creation time so mass invalidation is a counter bump away.
#[derive(Debug, Clone, Copy)]
pub(crate) enum ConnectionGeneration {
    Monitoring,
    Normal(u32),
}

impl ConnectionGeneration {
    pub(crate) fn is_stale(self, current_generation: &PoolGeneration) -> bool {
        match self {
            ConnectionGeneration::Monitoring => false,
            ConnectionGeneration::Normal(gen) => gen != current_generation.0,
        }
    }
}

/// Contains the information needed to establish a `Connection`.
#[derive(Debug)]
pub(crate) struct PendingConnection {
    pub(crate) id: u32,
    pub(crate) address: ServerAddress,
    pub(crate) generation: PoolGeneration,
    pub(crate) time_created: Instant,
}
