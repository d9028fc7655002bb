use std::time::{Duration, Instant};

use tokio::sync::watch;

use super::{
    description::server::{ServerDescription, TopologyVersion},
    TopologyUpdater,
    TopologyWatcher,
};
use crate::{
    cmap::{establish::ConnectionEstablisher, Connection},
    error::{Error, Result},
    hello::{hello_command, AwaitableHelloOptions, HelloReply},
    options::{ClientOptions, ServerAddress, ServerMonitoringMode},
    runtime::{self, stream::DEFAULT_CONNECT_TIMEOUT},
    sdam::DEFAULT_HEARTBEAT_FREQUENCY,
};

pub(crate) const MIN_HEARTBEAT_FREQUENCY: Duration = Duration::from_millis(500);

/// The weight given to the most recent round trip time sample when updating the exponentially
/// weighted moving average.
const RTT_ALPHA: f64 = 0.2;

/// Monitor that performs regular heartbeats to determine server status. Each known server has
/// one, holding a dedicated monitoring connection that is not drawn from (and does not affect)
/// the server's connection pool.
pub(crate) struct Monitor {
    address: ServerAddress,
    connection: Option<Connection>,
    establisher: ConnectionEstablisher,
    topology_updater: TopologyUpdater,
    topology_watcher: TopologyWatcher,
    check_request_receiver: watch::Receiver<()>,
    client_options: ClientOptions,

    /// The exponentially weighted moving average of this server's hello round trip times.
    average_round_trip_time: Option<Duration>,

    /// The most recent topologyVersion the server reported, used to resume the stream and to
    /// let the server discard stale responses.
    topology_version: Option<TopologyVersion>,
}

impl Monitor {
    pub(crate) fn start(
        address: ServerAddress,
        topology_updater: TopologyUpdater,
        topology_watcher: TopologyWatcher,
        check_request_receiver: watch::Receiver<()>,
        establisher: ConnectionEstablisher,
        client_options: ClientOptions,
    ) {
        let monitor = Self {
            address,
            connection: None,
            establisher,
            topology_updater,
            topology_watcher,
            check_request_receiver,
            client_options,
            average_round_trip_time: None,
            topology_version: None,
        };
        runtime::spawn(monitor.execute());
    }

    async fn execute(mut self) {
        let heartbeat_frequency = self
            .client_options
            .heartbeat_freq
            .unwrap_or(DEFAULT_HEARTBEAT_FREQUENCY);
        let min_frequency = self.client_options.min_heartbeat_frequency();

        while self.is_alive() {
            let mut check_succeeded = self.check_server().await;

            // In streaming mode the server keeps pushing topology changes as moreToCome
            // replies on the same exhaust request; consume them until the stream breaks.
            while check_succeeded && self.is_streaming() && self.is_alive() {
                check_succeeded = self.process_streamed_reply(heartbeat_frequency).await;
            }

            if !self.is_alive() {
                break;
            }

            // A failed check tears down the monitoring connection; wait out the minimum
            // interval and retry rather than sleeping a full heartbeat with the server
            // unobserved.
            runtime::delay_for(min_frequency).await;
            if check_succeeded {
                self.wait_for_check_request(heartbeat_frequency.saturating_sub(min_frequency))
                    .await;
            }
        }
    }

    /// Whether the topology still exists and still contains this monitor's server.
    fn is_alive(&self) -> bool {
        self.topology_watcher.is_alive()
            && self.topology_watcher.server_exists(&self.address)
    }

    fn is_streaming(&self) -> bool {
        self.connection
            .as_ref()
            .map(|conn| conn.is_streaming())
            .unwrap_or(false)
    }

    /// Checks the server by running a hello command, publishing the resulting description.
    /// If an I/O error occurs, the connection will be replaced with a new one on the next check.
    async fn check_server(&mut self) -> bool {
        self.clear_check_requests();

        match self.perform_hello().await {
            Ok(reply) => {
                self.publish_reply(reply).await;
                true
            }
            Err(e) => {
                self.handle_error(e).await;
                false
            }
        }
    }

    async fn perform_hello(&mut self) -> Result<HelloReply> {
        let heartbeat_frequency = self
            .client_options
            .heartbeat_freq
            .unwrap_or(DEFAULT_HEARTBEAT_FREQUENCY);
        let stream_read_timeout = self.stream_read_timeout(heartbeat_frequency);
        let connect_timeout = self.connect_timeout();

        let (hello_ok, awaitable_options) = match self.connection {
            Some(ref conn) => (
                conn.stream_description().ok().map(|sd| sd.hello_ok),
                self.streaming_options(conn, heartbeat_frequency),
            ),
            None => (None, None),
        };

        let mut rtt_sample = None;
        let reply = match self.connection {
            Some(ref mut conn) => {
                let awaited = awaitable_options.is_some();
                let command = hello_command(hello_ok, awaitable_options);

                let timeout = if awaited {
                    stream_read_timeout
                } else {
                    connect_timeout
                };
                let start = Instant::now();
                let response = runtime::timeout(timeout, conn.send_command(command)).await??;
                if !awaited {
                    rtt_sample = Some(start.elapsed());
                }
                response.into_hello_reply()?
            }
            None => {
                let start = Instant::now();
                let (connection, reply) = self
                    .establisher
                    .establish_monitoring_connection(self.address.clone(), 0)
                    .await?;
                rtt_sample = Some(start.elapsed());
                self.connection = Some(connection);
                reply
            }
        };

        if let Some(sample) = rtt_sample {
            self.update_average_round_trip_time(sample);
        }
        Ok(reply)
    }

    /// Wait for the next moreToCome reply on the monitoring connection, publishing it. Any
    /// error (including the read deadline elapsing with no bytes) exits streaming by tearing
    /// the connection down.
    async fn process_streamed_reply(&mut self, heartbeat_frequency: Duration) -> bool {
        let read_timeout = self.stream_read_timeout(heartbeat_frequency);
        let conn = match self.connection {
            Some(ref mut conn) => conn,
            None => return false,
        };

        let result = match runtime::timeout(read_timeout, conn.receive_message()).await {
            Ok(result) => result,
            Err(timeout_error) => Err(timeout_error),
        };

        match result.and_then(|response| response.into_hello_reply()) {
            Ok(reply) => {
                self.publish_reply(reply).await;
                true
            }
            Err(e) => {
                self.handle_error(e).await;
                false
            }
        }
    }

    async fn publish_reply(&mut self, reply: HelloReply) {
        self.topology_version = reply.command_response.topology_version;
        tracing::trace!(
            address = %reply.server_address,
            topology_version = ?self.topology_version,
            "publishing server check result",
        );

        let description = ServerDescription::new_from_hello_reply(
            self.address.clone(),
            reply,
            self.average_round_trip_time.unwrap_or_default(),
        );
        self.topology_updater.update(description).await;
    }

    /// Whether the next hello should be awaitable, and with what options.
    fn streaming_options(
        &self,
        conn: &Connection,
        heartbeat_frequency: Duration,
    ) -> Option<AwaitableHelloOptions> {
        let mode = self
            .client_options
            .server_monitoring_mode
            .clone()
            .unwrap_or(ServerMonitoringMode::Auto);

        if matches!(mode, ServerMonitoringMode::Poll) {
            return None;
        }

        let supports_streaming = conn
            .stream_description()
            .ok()
            .and_then(|sd| sd.max_wire_version)
            .map(|v| v >= 9)
            .unwrap_or(false);
        if !supports_streaming && !matches!(mode, ServerMonitoringMode::Stream) {
            return None;
        }

        self.topology_version
            .map(|topology_version| AwaitableHelloOptions {
                topology_version,
                max_await_time: heartbeat_frequency,
            })
    }

    fn connect_timeout(&self) -> Duration {
        self.client_options
            .connect_timeout
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT)
    }

    /// How long a streaming read may go without producing a reply before the server is
    /// considered unresponsive: the await window plus the time a healthy server would need to
    /// get bytes on the wire.
    fn stream_read_timeout(&self, heartbeat_frequency: Duration) -> Duration {
        heartbeat_frequency + self.connect_timeout()
    }

    fn update_average_round_trip_time(&mut self, sample: Duration) {
        self.average_round_trip_time = Some(match self.average_round_trip_time {
            Some(old_rtt) => Duration::from_secs_f64(
                RTT_ALPHA * sample.as_secs_f64() + (1.0 - RTT_ALPHA) * old_rtt.as_secs_f64(),
            ),
            None => sample,
        });
    }

    /// Publish an Unknown description carrying the error and drop the monitoring connection;
    /// the next check will open a fresh one.
    async fn handle_error(&mut self, error: Error) -> bool {
        self.connection.take();
        self.topology_version = None;
        tracing::debug!(address = %self.address, error = %error, "server check failed");
        self.topology_updater
            .handle_monitor_error(self.address.clone(), error)
            .await
    }

    fn clear_check_requests(&mut self) {
        self.check_request_receiver.borrow_and_update();
    }

    async fn wait_for_check_request(&mut self, timeout: Duration) {
        let _ = runtime::timeout(timeout, self.check_request_receiver.changed()).await;
    }
}
