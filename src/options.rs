//! Contains the types for configuring a [`Client`](crate::Client).
//!
//! Connection-string parsing is not part of the core; options are constructed programmatically
//! (typically by an outer layer that owns URI handling) via [`ClientOptions::builder`].

use std::{
    fmt::{self, Display, Formatter},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

pub use crate::client::auth::{AuthMechanism, Credential};
pub use crate::compression::Compressor;
use crate::{
    error::{Error, ErrorKind, Result},
    selection_criteria::SelectionCriteria,
};

pub(crate) const DEFAULT_PORT: u16 = 27017;

const MAX_APP_NAME_LENGTH: usize = 128;

/// An enum representing the address of a MongoDB server.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ServerAddress {
    /// A TCP/IP host and port combination.
    Tcp {
        /// The hostname or IP address where the MongoDB server can be found.
        host: String,

        /// The TCP port that the MongoDB server is listening on.
        ///
        /// The default is 27017.
        port: Option<u16>,
    },
    /// A Unix Domain Socket path.
    #[cfg(unix)]
    Unix {
        /// The path to the Unix Domain Socket.
        path: PathBuf,
    },
}

impl Default for ServerAddress {
    fn default() -> Self {
        Self::Tcp {
            host: "localhost".into(),
            port: None,
        }
    }
}

impl FromStr for ServerAddress {
    type Err = Error;

    fn from_str(address: &str) -> Result<Self> {
        ServerAddress::parse(address)
    }
}

impl ServerAddress {
    /// Parses an address string into a `ServerAddress`. Hostnames are normalized to lowercase;
    /// IPv6 literals must be bracketed.
    pub fn parse(address: impl AsRef<str>) -> Result<Self> {
        let address = address.as_ref();

        #[cfg(unix)]
        if address.ends_with(".sock") {
            return Ok(ServerAddress::Unix {
                path: PathBuf::from(address),
            });
        }

        let (hostname, port) = if let Some(ip_literal) = address.strip_prefix('[') {
            let (hostname, remainder) = ip_literal.split_once(']').ok_or_else(|| {
                ErrorKind::InvalidArgument {
                    message: format!(
                        "invalid server address: missing closing bracket in {:?}",
                        address
                    ),
                }
            })?;
            let port = match remainder.strip_prefix(':') {
                Some(port) => Some(port),
                None if remainder.is_empty() => None,
                None => {
                    return Err(ErrorKind::InvalidArgument {
                        message: format!(
                            "invalid server address: unexpected trailing content in {:?}",
                            address
                        ),
                    }
                    .into())
                }
            };
            (hostname, port)
        } else {
            match address.split_once(':') {
                Some((hostname, port)) => (hostname, Some(port)),
                None => (address, None),
            }
        };

        if hostname.is_empty() {
            return Err(ErrorKind::InvalidArgument {
                message: format!(
                    "invalid server address {:?}: hostname cannot be empty",
                    address
                ),
            }
            .into());
        }

        let port = port
            .map(|p| {
                p.parse::<u16>().map_err(|_| {
                    Error::from(ErrorKind::InvalidArgument {
                        message: format!(
                            "port must be a number between 1 and 65535, instead got {:?}",
                            p
                        ),
                    })
                })
            })
            .transpose()?;

        Ok(ServerAddress::Tcp {
            host: hostname.to_lowercase(),
            port,
        })
    }

    pub(crate) fn host(&self) -> &str {
        match self {
            Self::Tcp { host, .. } => host.as_str(),
            #[cfg(unix)]
            Self::Unix { path } => path.to_str().unwrap_or(""),
        }
    }

    /// The (host, port) pair to hand to the resolver when opening a transport.
    pub(crate) fn into_resolvable(self) -> (String, u16) {
        match self {
            Self::Tcp { host, port } => (host, port.unwrap_or(DEFAULT_PORT)),
            #[cfg(unix)]
            Self::Unix { path } => (path.to_string_lossy().into_owned(), 0),
        }
    }
}

impl Display for ServerAddress {
    fn fmt(&self, fmt: &mut Formatter) -> fmt::Result {
        match self {
            Self::Tcp { host, port } => {
                if host.contains(':') {
                    // IPv6 literals are bracketed in the canonical form.
                    write!(fmt, "[{}]:{}", host, port.unwrap_or(DEFAULT_PORT))
                } else {
                    write!(fmt, "{}:{}", host, port.unwrap_or(DEFAULT_PORT))
                }
            }
            #[cfg(unix)]
            Self::Unix { path } => write!(fmt, "{}", path.display()),
        }
    }
}

/// The mode the client uses to monitor servers, corresponding to the `serverMonitoringMode`
/// connection string option.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub enum ServerMonitoringMode {
    /// Use the streaming protocol when the server supports it, and polling otherwise.
    Auto,
    /// Always use the polling protocol.
    Poll,
    /// Always use the streaming protocol.
    Stream,
}

/// Extra information to append to the driver version in the metadata of the handshake with the
/// server. This should be used by libraries wrapping the core, e.g. a full driver API layer.
#[derive(Clone, Debug, Deserialize, TypedBuilder, PartialEq)]
#[builder(field_defaults(default, setter(into, strip_option)))]
#[non_exhaustive]
pub struct DriverInfo {
    /// The name of the library wrapping the driver.
    #[builder(!default, setter(!strip_option))]
    pub name: String,

    /// The version of the library wrapping the driver.
    pub version: Option<String>,

    /// Optional platform information for the wrapping driver.
    pub platform: Option<String>,
}

/// Contains the options that can be used to create a new [`Client`](crate::Client).
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(into, strip_option)))]
#[non_exhaustive]
pub struct ClientOptions {
    /// The initial list of seeds that the Client should connect to.
    ///
    /// Note that by default, the driver will autodiscover other nodes in the cluster. To connect
    /// directly to a single server (rather than autodiscovering the rest of the cluster), set the
    /// `direct_connection` field to `true`.
    #[builder(!default, setter(!strip_option))]
    pub hosts: Vec<ServerAddress>,

    /// The application name that the Client will send to the server as part of the handshake.
    /// This can be used in combination with the server logs to determine which Client is
    /// connected to a server.
    pub app_name: Option<String>,

    /// The compressors that the Client is willing to use in the order they are specified
    /// in the configuration.  The Client sends this list of compressors to the server.
    /// The server responds with the intersection of its supported list of compressors.
    pub compressors: Option<Vec<Compressor>>,

    /// The connect timeout passed to each underlying TCP stream when attempting to connect to
    /// the server.
    ///
    /// The default value is 10 seconds.
    pub connect_timeout: Option<Duration>,

    /// The credential to use for authenticating connections made by this client.
    pub credential: Option<Credential>,

    /// Specifies whether the Client should directly connect to a single host rather than
    /// autodiscover all servers in the cluster.
    ///
    /// The default value is false.
    pub direct_connection: Option<bool>,

    /// Extra information to append to the driver version in the metadata of the handshake with
    /// the server. This should be used by libraries wrapping the driver, e.g. a language binding.
    pub driver_info: Option<DriverInfo>,

    /// The amount of time each monitoring task waits between sending a hello to its respective
    /// server.
    ///
    /// The default value is 10 seconds.
    pub heartbeat_freq: Option<Duration>,

    /// Whether or not the client is connecting to a MongoDB cluster through a load balancer.
    pub load_balanced: Option<bool>,

    /// When running a read operation with a ReadPreference that allows selecting secondaries,
    /// `local_threshold` is used to determine how much longer the average round trip time between
    /// the driver and server is allowed compared to the least round trip time of all the suitable
    /// servers.
    ///
    /// The default value is 15 ms.
    pub local_threshold: Option<Duration>,

    /// The amount of time that a connection can remain idle in a connection pool before being
    /// closed. A value of zero indicates that connections should not be closed due to being idle.
    ///
    /// By default, connections will not be closed due to being idle.
    pub max_idle_time: Option<Duration>,

    /// The maximum amount of connections that the Client should allow to be created in a
    /// connection pool for a given server. If an operation is attempted on a server while
    /// `max_pool_size` connections are checked out, the operation will block until an in-progress
    /// operation finishes and its connection is checked back in.
    ///
    /// The default value is 10.
    pub max_pool_size: Option<u32>,

    /// The minimum number of connections that should be available in a server's connection pool
    /// at a given time. If fewer than `min_pool_size` connections are in the pool, connections
    /// will be added to the pool in the background until `min_pool_size` is reached.
    ///
    /// The default value is 0.
    pub min_pool_size: Option<u32>,

    /// The maximum number of new connections that can be created concurrently for a given server.
    ///
    /// The default value is 2.
    pub max_connecting: Option<u32>,

    /// The rate, in new connections per second, at which the ingress rate limiter allows
    /// connection establishment to a given server.
    ///
    /// The default value is 20.
    pub ingress_rate_per_sec: Option<u32>,

    /// The burst capacity of the ingress rate limiter, expressed in seconds worth of
    /// `ingress_rate_per_sec`.
    ///
    /// The default value is 1.
    pub ingress_burst_capacity_secs: Option<u32>,

    /// The number of checkout requests that may queue for an establishment slot before further
    /// requests are rejected with a `SystemOverloaded` error.
    ///
    /// The default value is 10.
    pub ingress_max_queue_depth: Option<u32>,

    /// The name of the replica set that the Client should connect to.
    pub repl_set_name: Option<String>,

    /// Whether or not the client should retry a read operation if the operation fails.
    ///
    /// The default value is true.
    pub retry_reads: Option<bool>,

    /// Whether or not the client should retry a write operation if the operation fails with a
    /// retryable error.
    ///
    /// The default value is true.
    pub retry_writes: Option<bool>,

    /// The default selection criteria for operations that do not specify one.
    pub selection_criteria: Option<SelectionCriteria>,

    /// The amount of time the Client should attempt to select a server for an operation before
    /// timing out.
    ///
    /// The default value is 30 seconds.
    pub server_selection_timeout: Option<Duration>,

    /// The amount of time the Client should wait for data on a socket read during an operation
    /// before timing out. By default, reads are bounded only by the operation's deadline.
    pub socket_timeout: Option<Duration>,

    /// The amount of time a thread waits for a connection to become available in a connection
    /// pool before timing out.
    pub wait_queue_timeout: Option<Duration>,

    /// The protocol the client's monitoring tasks use to learn about topology changes.
    ///
    /// The default value is [`ServerMonitoringMode::Auto`].
    pub server_monitoring_mode: Option<ServerMonitoringMode>,

    /// Internal knobs for the test suite; never set on real clients.
    #[builder(default, setter(skip))]
    pub(crate) test_options: Option<TestOptions>,
}

/// Overrides used by the test suite to make timing-sensitive behavior deterministic.
#[derive(Clone, Debug, Default)]
pub(crate) struct TestOptions {
    /// Don't run monitor tasks, leaving the topology to be driven manually.
    pub(crate) disable_monitors: bool,

    /// Overrides the monitors' minimum delay between hello checks.
    pub(crate) min_heartbeat_freq: Option<Duration>,
}

impl ClientOptions {
    /// Ensure the options are consistent before handing them to a `Client`.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.hosts.is_empty() {
            return Err(ErrorKind::InvalidArgument {
                message: "hosts cannot be empty".to_string(),
            }
            .into());
        }

        if let Some(true) = self.direct_connection {
            if self.hosts.len() > 1 {
                return Err(ErrorKind::InvalidArgument {
                    message: "cannot specify multiple seeds with directConnection=true".to_string(),
                }
                .into());
            }
        }

        if let Some(ref app_name) = self.app_name {
            if app_name.len() > MAX_APP_NAME_LENGTH {
                return Err(ErrorKind::InvalidArgument {
                    message: format!(
                        "appName must be at most {} bytes, instead got {}",
                        MAX_APP_NAME_LENGTH,
                        app_name.len()
                    ),
                }
                .into());
            }
        }

        if let Some(0) = self.max_pool_size {
            return Err(ErrorKind::InvalidArgument {
                message: "maxPoolSize must be greater than 0".to_string(),
            }
            .into());
        }

        if let (Some(min), Some(max)) = (self.min_pool_size, self.max_pool_size) {
            if min > max {
                return Err(ErrorKind::InvalidArgument {
                    message: format!(
                        "minPoolSize ({}) must not exceed maxPoolSize ({})",
                        min, max
                    ),
                }
                .into());
            }
        }

        if let Some(ref compressors) = self.compressors {
            for compressor in compressors {
                compressor.validate()?;
            }
        }

        if let Some(heartbeat_freq) = self.heartbeat_freq {
            if heartbeat_freq < self.min_heartbeat_frequency() {
                return Err(ErrorKind::InvalidArgument {
                    message: format!(
                        "heartbeatFrequencyMS must be at least {}ms",
                        self.min_heartbeat_frequency().as_millis()
                    ),
                }
                .into());
            }
        }

        if let Some(ref credential) = self.credential {
            credential.validate()?;
        }

        Ok(())
    }

    pub(crate) fn min_heartbeat_frequency(&self) -> Duration {
        self.test_options
            .as_ref()
            .and_then(|options| options.min_heartbeat_freq)
            .unwrap_or(crate::sdam::MIN_HEARTBEAT_FREQUENCY)
    }
}
