mod description;
mod monitor;
mod server;
#[cfg(test)]
mod test;
mod topology;

use std::{fmt, time::Duration};

pub use self::description::{server::ServerType, topology::TopologyType};
pub(crate) use self::{
    description::{
        server::{ServerDescription, TopologyVersion},
        topology::{
            server_selection::{attempt_to_select_server, SelectedServer},
            TopologyDescription,
            DEFAULT_HEARTBEAT_FREQUENCY,
        },
    },
    monitor::MIN_HEARTBEAT_FREQUENCY,
    server::Server,
    topology::{HandshakePhase, Topology, TopologyState, TopologyUpdater, TopologyWatcher},
};
use crate::options::ServerAddress;

/// A description of the most up-to-date information known about a server, for use in custom
/// server selection predicates.
#[derive(Clone)]
pub struct ServerInfo<'a> {
    description: std::borrow::Cow<'a, ServerDescription>,
}

impl<'a> ServerInfo<'a> {
    pub(crate) fn new_borrowed(description: &'a ServerDescription) -> Self {
        Self {
            description: std::borrow::Cow::Borrowed(description),
        }
    }

    /// Gets the address of the server.
    pub fn address(&self) -> &ServerAddress {
        &self.description.address
    }

    /// Gets the weighted average of the time it has taken for a server check to round-trip
    /// to the server.
    ///
    /// This is the value that the driver uses internally to determine the latency window as part
    /// of server selection.
    pub fn average_round_trip_time(&self) -> Option<Duration> {
        self.description.average_round_trip_time
    }

    /// Gets the type of the server.
    pub fn server_type(&self) -> ServerType {
        self.description.server_type
    }

    /// Gets the tags associated with the server, if it is a replica set member.
    pub fn tags(&self) -> Option<&crate::selection_criteria::TagSet> {
        match self.description.reply {
            Ok(Some(ref reply)) => reply.command_response.tags.as_ref(),
            _ => None,
        }
    }
}

impl fmt::Display for ServerInfo<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{{ Address: {}, Type: {:?}",
            self.address(),
            self.server_type(),
        )?;

        match self.description.reply {
            Ok(_) => {
                if let Some(avg_rtt) = self.average_round_trip_time() {
                    write!(f, ", Average RTT: {:?}", avg_rtt)?;
                }
            }
            Err(ref e) => {
                write!(f, ", Error: {}", e)?;
            }
        }

        write!(f, " }}")
    }
}

impl fmt::Debug for ServerInfo<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
