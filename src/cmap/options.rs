use std::time::Duration;

use crate::{
    client::auth::Credential,
    compression::Compressor,
    options::ClientOptions,
};

/// Contains the options for creating a connection pool.
#[derive(Clone, Default, Debug)]
pub(crate) struct ConnectionPoolOptions {
    /// The application name specified by the user.
    pub(crate) app_name: Option<String>,

    /// The compressors specified by the user, to be sent to the server in the handshake.
    pub(crate) compressors: Option<Vec<Compressor>>,

    /// The amount of time a connection can be idle before it is closed.
    pub(crate) max_idle_time: Option<Duration>,

    /// The maximum number of connections that the pool can have at a given time. This includes
    /// connections which are currently checked out of the pool.
    pub(crate) max_pool_size: Option<u32>,

    /// The minimum number of connections that the pool can have at a given time. This includes
    /// connections which are currently checked out of the pool.
    pub(crate) min_pool_size: Option<u32>,

    /// The maximum number of new connections that can be created concurrently.
    pub(crate) max_connecting: Option<u32>,

    /// The rate at which the ingress rate limiter allows new connection establishment.
    pub(crate) ingress_rate_per_sec: Option<u32>,

    /// The burst capacity of the ingress rate limiter, in seconds worth of rate.
    pub(crate) ingress_burst_capacity_secs: Option<u32>,

    /// The number of checkout requests that may wait for an establishment slot before further
    /// requests are rejected as overloaded.
    pub(crate) ingress_max_queue_depth: Option<u32>,

    /// The credential to use for authenticating connections in this pool.
    pub(crate) credential: Option<Credential>,

    /// Whether the pool should start in the ready state rather than waiting for SDAM to mark it
    /// ready. For testing only.
    #[cfg(test)]
    pub(crate) ready: Option<bool>,
}

impl ConnectionPoolOptions {
    pub(crate) fn from_client_options(options: &ClientOptions) -> Self {
        Self {
            app_name: options.app_name.clone(),
            compressors: options.compressors.clone(),
            max_idle_time: options.max_idle_time,
            max_pool_size: options.max_pool_size,
            min_pool_size: options.min_pool_size,
            max_connecting: options.max_connecting,
            ingress_rate_per_sec: options.ingress_rate_per_sec,
            ingress_burst_capacity_secs: options.ingress_burst_capacity_secs,
            ingress_max_queue_depth: options.ingress_max_queue_depth,
            credential: options.credential.clone(),
            #[cfg(test)]
            ready: None,
        }
    }
}
