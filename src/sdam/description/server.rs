use std::time::Duration;

use bson::{doc, oid::ObjectId, rawdoc, Bson, DateTime, RawBson};
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, ErrorKind, Result},
    hello::{HelloCommandResponse, HelloReply},
    options::ServerAddress,
    selection_criteria::TagSet,
};

// The wire version range this driver can speak. Servers entirely outside it put the whole
// topology into a compatibility-error state.
const MIN_SUPPORTED_WIRE_VERSION: i32 = 7;
const MAX_SUPPORTED_WIRE_VERSION: i32 = 25;

/// The server release that corresponds to `MIN_SUPPORTED_WIRE_VERSION`, for error messages.
const MIN_SUPPORTED_SERVER_VERSION: &str = "4.0";

/// The role a server plays in its deployment, as inferred from its hello response.
#[derive(Debug, Deserialize, Clone, Copy, Eq, PartialEq, Serialize, Default)]
#[non_exhaustive]
pub enum ServerType {
    /// A lone mongod with no replica set configuration.
    Standalone,

    /// A mongos query router fronting a sharded cluster.
    Mongos,

    /// The writable member of a replica set.
    #[serde(rename = "RSPrimary")]
    RsPrimary,

    /// A readable, replicating member of a replica set.
    #[serde(rename = "RSSecondary")]
    RsSecondary,

    /// A replica set member that votes in elections but holds no data.
    #[serde(rename = "RSArbiter")]
    RsArbiter,

    /// A replica set member that is hidden, still starting up, or recovering.
    #[serde(rename = "RSOther")]
    RsOther,

    /// A mongod that reports replica set machinery but no current membership, e.g. one whose
    /// set is uninitialized or that was removed from the set config.
    #[serde(rename = "RSGhost")]
    RsGhost,

    /// A connection-terminating proxy sitting between the driver and the deployment.
    LoadBalancer,

    /// A server the driver has not heard from yet, or whose last check failed.
    #[serde(alias = "PossiblePrimary")]
    #[default]
    Unknown,
}

impl ServerType {
    /// Arbiters are the one server kind that refuses authentication.
    pub(crate) fn can_auth(self) -> bool {
        self != ServerType::RsArbiter
    }

    pub(crate) fn is_data_bearing(self) -> bool {
        matches!(
            self,
            ServerType::Standalone
                | ServerType::Mongos
                | ServerType::RsPrimary
                | ServerType::RsSecondary
                | ServerType::LoadBalancer
        )
    }

    pub(crate) fn is_available(self) -> bool {
        self != ServerType::Unknown
    }
}

/// The server-side `topologyVersion`: a process id plus a counter the server bumps on every
/// state change, letting the client discard out-of-order hello results.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TopologyVersion {
    pub(crate) process_id: ObjectId,
    pub(crate) counter: i64,
}

impl From<TopologyVersion> for Bson {
    fn from(tv: TopologyVersion) -> Self {
        Bson::Document(doc! {
            "processId": tv.process_id,
            "counter": tv.counter,
        })
    }
}

impl From<TopologyVersion> for RawBson {
    fn from(tv: TopologyVersion) -> Self {
        RawBson::Document(rawdoc! {
            "processId": tv.process_id,
            "counter": tv.counter
        })
    }
}

/// Everything the client currently knows about one server.
///
/// A description is published whole and never mutated afterwards: monitors build a new one from
/// each hello result (or failure) and hand it to the topology, which swaps it in.
#[derive(Debug, Clone)]
pub(crate) struct ServerDescription {
    pub(crate) address: ServerAddress,

    pub(crate) server_type: ServerType,

    /// When the monitor last produced this description.
    pub(crate) last_update_time: Option<DateTime>,

    /// Exponentially weighted moving average of the server's hello round trips.
    pub(crate) average_round_trip_time: Option<Duration>,

    // Three states have to be representable here: a server that has answered a hello, a server
    // whose last check failed, and a server that has been seeded but never checked. Rather than
    // a pair of options (which would admit the nonsense state of a reply *and* an error), the
    // reply slot is a `Result<Option<_>>`: `Ok(Some(reply))`, `Err(check_failure)`, or
    // `Ok(None)` for the not-yet-checked case. Accessors below propagate the error with `?` so
    // callers treat a failed server like one with no data.
    pub(crate) reply: Result<Option<HelloReply>>,
}

impl ServerDescription {
    /// A blank description for a server that has not been checked yet. TCP hostnames are
    /// normalized to lowercase so addresses compare canonically.
    pub(crate) fn new(address: &ServerAddress) -> Self {
        let address = match address {
            ServerAddress::Tcp { host, port } => ServerAddress::Tcp {
                host: host.to_lowercase(),
                port: *port,
            },
            #[cfg(unix)]
            ServerAddress::Unix { path } => ServerAddress::Unix { path: path.clone() },
        };
        Self {
            address,
            server_type: ServerType::Unknown,
            last_update_time: None,
            average_round_trip_time: None,
            reply: Ok(None),
        }
    }

    pub(crate) fn new_from_hello_reply(
        address: ServerAddress,
        mut reply: HelloReply,
        average_rtt: Duration,
    ) -> Self {
        let mut description = Self::new(&address);
        description.server_type = reply.command_response.server_type();
        description.last_update_time = Some(DateTime::now());
        description.average_round_trip_time = Some(average_rtt);

        // Hostnames reported by the server get the same lowercase treatment as our own
        // addresses so that host-list membership checks line up.
        let response = &mut reply.command_response;
        for list in [&mut response.hosts, &mut response.passives, &mut response.arbiters] {
            if let Some(hosts) = list.as_mut() {
                for host in hosts.iter_mut() {
                    *host = host.to_lowercase();
                }
            }
        }
        if let Some(me) = response.me.as_mut() {
            *me = me.to_lowercase();
        }

        description.reply = Ok(Some(reply));
        description
    }

    /// A description recording that the server's last check failed with `error`. Its type is
    /// Unknown and it has no round trip time.
    pub(crate) fn new_from_error(address: ServerAddress, error: Error) -> Self {
        let mut description = Self::new(&address);
        description.last_update_time = Some(DateTime::now());
        description.reply = Err(error);
        description
    }

    /// The hello response, if the server has one; a failed check propagates as the error.
    fn command_response(&self) -> Result<Option<&HelloCommandResponse>> {
        match self.reply {
            Ok(ref reply) => Ok(reply.as_ref().map(|r| &r.command_response)),
            Err(ref e) => Err(e.clone()),
        }
    }

    pub(crate) fn is_available(&self) -> bool {
        self.server_type.is_available()
    }

    /// The message to surface when this server's wire version range does not intersect the
    /// driver's, or `None` when the two are compatible (or the server is unchecked).
    pub(crate) fn wire_version_mismatch(&self) -> Option<String> {
        let response = match self.reply {
            Ok(Some(ref reply)) => &reply.command_response,
            _ => return None,
        };

        let server_min = response.min_wire_version.unwrap_or(0);
        if server_min > MAX_SUPPORTED_WIRE_VERSION {
            return Some(format!(
                "Server at {} wants wire version {} or newer; this driver speaks at most {}",
                self.address, server_min, MAX_SUPPORTED_WIRE_VERSION,
            ));
        }

        let server_max = response.max_wire_version.unwrap_or(0);
        if server_max < MIN_SUPPORTED_WIRE_VERSION {
            return Some(format!(
                "Server at {} speaks at most wire version {}; this driver requires {} (MongoDB \
                 {}) or newer",
                self.address, server_max, MIN_SUPPORTED_WIRE_VERSION, MIN_SUPPORTED_SERVER_VERSION,
            ));
        }

        None
    }

    pub(crate) fn set_name(&self) -> Result<Option<String>> {
        Ok(self
            .command_response()?
            .and_then(|response| response.set_name.clone()))
    }

    pub(crate) fn set_version(&self) -> Result<Option<i32>> {
        Ok(self.command_response()?.and_then(|r| r.set_version))
    }

    pub(crate) fn election_id(&self) -> Result<Option<ObjectId>> {
        Ok(self.command_response()?.and_then(|r| r.election_id))
    }

    pub(crate) fn max_wire_version(&self) -> Result<Option<i32>> {
        Ok(self.command_response()?.and_then(|r| r.max_wire_version))
    }

    pub(crate) fn last_write_date(&self) -> Result<Option<DateTime>> {
        Ok(self
            .command_response()?
            .and_then(|r| r.last_write.as_ref())
            .map(|w| w.last_write_date))
    }

    pub(crate) fn logical_session_timeout(&self) -> Result<Option<Duration>> {
        Ok(self
            .command_response()?
            .and_then(|r| r.logical_session_timeout_minutes)
            .map(|minutes| Duration::from_secs(minutes as u64 * 60)))
    }

    /// Every address this server believes belongs to its replica set: hosts, passives, and
    /// arbiters combined.
    pub(crate) fn known_hosts(&self) -> Result<Vec<ServerAddress>> {
        let mut hosts = Vec::new();
        if let Some(response) = self.command_response()? {
            for list in [&response.hosts, &response.passives, &response.arbiters] {
                for host in list.iter().flatten() {
                    hosts.push(ServerAddress::parse(host)?);
                }
            }
        }
        Ok(hosts)
    }

    /// Whether the address the server calls itself (`me`) disagrees with the address we reached
    /// it at. Such a server is dropped from the topology; it will be re-added under its own
    /// name via some member's host list if it really belongs.
    pub(crate) fn me_mismatch(&self) -> Result<bool> {
        Ok(
            match self.command_response()?.and_then(|r| r.me.as_deref()) {
                Some(me) => me != self.address.to_string(),
                None => false,
            },
        )
    }

    /// The topology version from the latest sighting of this server. Servers attach one to
    /// healthy hello replies and also to state-change error responses.
    pub(crate) fn topology_version(&self) -> Option<TopologyVersion> {
        match self.reply {
            Ok(ref reply) => reply
                .as_ref()
                .and_then(|r| r.command_response.topology_version),
            Err(ref e) => e.topology_version(),
        }
    }

    /// Whether this server carries every tag in `tag_set`. Servers with no hello reply (or no
    /// tags at all) match nothing.
    pub(crate) fn matches_tag_set(&self, tag_set: &TagSet) -> bool {
        let server_tags = match self.reply {
            Ok(Some(ref reply)) => reply.command_response.tags.as_ref(),
            _ => None,
        };
        match server_tags {
            Some(server_tags) => tag_set
                .iter()
                .all(|(key, value)| server_tags.get(key) == Some(value)),
            None => false,
        }
    }
}

// Description equality deliberately looks at a fixed subset of the hello response: the fields
// that can change which servers an operation may be routed to. RTT, update times, and the rest
// churn on every heartbeat and must not count as a topology change.
fn same_routing_fields(a: &HelloCommandResponse, b: &HelloCommandResponse) -> bool {
    if a.server_type() != b.server_type() {
        return false;
    }
    (
        a.min_wire_version,
        a.max_wire_version,
        &a.me,
        &a.hosts,
        &a.passives,
        &a.arbiters,
    ) == (
        b.min_wire_version,
        b.max_wire_version,
        &b.me,
        &b.hosts,
        &b.passives,
        &b.arbiters,
    ) && (
        &a.tags,
        &a.set_name,
        a.set_version,
        a.election_id,
        &a.primary,
        a.logical_session_timeout_minutes,
        a.topology_version,
    ) == (
        &b.tags,
        &b.set_name,
        b.set_version,
        b.election_id,
        &b.primary,
        b.logical_session_timeout_minutes,
        b.topology_version,
    )
}

impl PartialEq for ServerDescription {
    fn eq(&self, other: &Self) -> bool {
        if self.address != other.address || self.server_type != other.server_type {
            return false;
        }

        match (&self.reply, &other.reply) {
            (Ok(a), Ok(b)) => match (a, b) {
                (Some(a), Some(b)) => {
                    same_routing_fields(&a.command_response, &b.command_response)
                }
                (None, None) => true,
                _ => false,
            },
            (Err(a), Err(b)) => {
                // Two failed checks count as the same state when they failed the same way;
                // command errors compare by code so message churn doesn't wake selection up.
                match (a.kind.as_ref(), b.kind.as_ref()) {
                    (ErrorKind::Command(a), ErrorKind::Command(b)) => a.code == b.code,
                    _ => a.to_string() == b.to_string(),
                }
            }
            _ => false,
        }
    }
}
