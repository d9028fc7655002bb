pub(crate) mod server_selection;
#[cfg(test)]
mod test;

use std::{
    collections::{HashMap, HashSet},
    fmt,
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    bson::oid::ObjectId,
    cmap::Command,
    error::{Error, Result},
    options::{ClientOptions, ServerAddress},
    sdam::{
        description::server::{ServerDescription, ServerType},
        ServerInfo,
    },
    selection_criteria::{ReadPreference, SelectionCriteria},
};

pub(crate) const DEFAULT_HEARTBEAT_FREQUENCY: Duration = Duration::from_secs(10);

/// What kind of deployment the client has discovered (or was told) it is talking to.
#[derive(
    Debug, Clone, Copy, Eq, PartialEq, Deserialize, Serialize, Default, derive_more::Display,
)]
#[non_exhaustive]
pub enum TopologyType {
    /// One directly-connected server, whatever its role.
    Single,

    /// A replica set in which no member currently holds the primary role.
    ReplicaSetNoPrimary,

    /// A replica set with a known primary.
    ReplicaSetWithPrimary,

    /// A sharded cluster, addressed through its mongos routers.
    Sharded,

    /// A deployment reached through a load balancer.
    LoadBalanced,

    /// Nothing has been discovered yet.
    #[default]
    Unknown,
}

/// The authoritative picture of the deployment: its type, the description of every member, and
/// the replica set bookkeeping (set name, newest election seen) that the transition rules need.
///
/// Owned and mutated by the topology worker only; everyone else reads published clones.
#[derive(Debug, Clone, Default)]
pub(crate) struct TopologyDescription {
    pub(crate) topology_type: TopologyType,

    /// Per-address descriptions of every member the client currently tracks.
    pub(crate) servers: HashMap<ServerAddress, ServerDescription>,

    /// True when exactly one seed was configured, which licenses the promotion of a discovered
    /// standalone to a Single topology.
    pub(crate) single_seed: bool,

    /// The replica set name, either configured up front or adopted from the first member heard
    /// from. Members claiming a different set are evicted.
    pub(crate) set_name: Option<String>,

    /// The largest replica set config version any claimed primary has presented.
    pub(crate) max_set_version: Option<i32>,

    /// The election id that came with `max_set_version`. Together the pair orders competing
    /// primary claims.
    pub(crate) max_election_id: Option<ObjectId>,

    /// Set when some member's wire version range does not overlap the driver's; selection
    /// refuses to run while this is present.
    pub(crate) compatibility_error: Option<String>,

    /// The smallest logical session timeout advertised across the data-bearing members, or
    /// `None` if any of them omits one.
    pub(crate) logical_session_timeout: Option<Duration>,

    /// Extra round-trip-time slack allowed when choosing among suitable servers.
    pub(crate) local_threshold: Option<Duration>,

    /// How often monitors check their servers.
    pub(crate) heartbeat_freq: Option<Duration>,
}

impl PartialEq for TopologyDescription {
    fn eq(&self, other: &Self) -> bool {
        // Equality exists to answer one question: would a blocked server-selection attempt see
        // anything new? Only the type, the member descriptions, and the compatibility state
        // feed into that answer.
        self.topology_type == other.topology_type
            && self.compatibility_error == other.compatibility_error
            && self.servers == other.servers
    }
}

impl TopologyDescription {
    /// Seed the description from the client options: the initial topology type, the set name if
    /// one was configured, and a blank entry per seed address.
    pub(crate) fn initialize(&mut self, options: &ClientOptions) {
        debug_assert!(
            self.topology_type == TopologyType::Unknown && self.servers.is_empty(),
            "a TopologyDescription may only be initialized once"
        );

        self.topology_type = if options.direct_connection == Some(true) {
            TopologyType::Single
        } else if options.repl_set_name.is_some() {
            TopologyType::ReplicaSetNoPrimary
        } else if options.load_balanced == Some(true) {
            TopologyType::LoadBalanced
        } else {
            TopologyType::Unknown
        };

        for address in &options.hosts {
            self.servers
                .insert(address.clone(), ServerDescription::new(address));
        }

        self.single_seed = options.hosts.len() == 1;
        self.set_name = options.repl_set_name.clone();
        self.local_threshold = options.local_threshold;
        self.heartbeat_freq = options.heartbeat_freq;
    }

    pub(crate) fn topology_type(&self) -> TopologyType {
        self.topology_type
    }

    pub(crate) fn server_addresses(&self) -> impl Iterator<Item = &ServerAddress> {
        self.servers.keys()
    }

    pub(crate) fn get_server_description(
        &self,
        address: &ServerAddress,
    ) -> Option<&ServerDescription> {
        self.servers.get(address)
    }

    pub(crate) fn heartbeat_frequency(&self) -> Duration {
        self.heartbeat_freq.unwrap_or(DEFAULT_HEARTBEAT_FREQUENCY)
    }

    pub(crate) fn compatibility_error(&self) -> Option<&String> {
        self.compatibility_error.as_ref()
    }

    /// Absorb a fresh server description, applying the SDAM transition rules.
    ///
    /// Reports for addresses the topology no longer tracks are dropped, as are reports whose
    /// topology version is older than what is already recorded for the address.
    pub(crate) fn update(&mut self, mut incoming: ServerDescription) -> Result<()> {
        if self.is_outdated_report(&incoming) {
            return Ok(());
        }

        // With directConnection, a server claiming membership in some other replica set is as
        // good as unreachable.
        if self.topology_type == TopologyType::Single {
            if let Some(mismatch) = self.direct_set_name_mismatch(&incoming) {
                incoming = mismatch;
            }
        }

        let server_type = incoming.server_type;
        let address = incoming.address.clone();
        self.servers.insert(address, incoming.clone());

        if self.topology_type == TopologyType::LoadBalanced {
            // There are no monitors behind a load balancer; the synthesized descriptions carry
            // no transition information.
            return Ok(());
        }

        self.apply_transition(incoming, server_type)?;
        self.recompute_session_timeout();
        self.refresh_compatibility_error();

        Ok(())
    }

    /// Whether `incoming` should be discarded without touching the topology: either its address
    /// is not tracked, or the address's current description carries a newer topology version
    /// from the same server process.
    fn is_outdated_report(&self, incoming: &ServerDescription) -> bool {
        let current = match self.servers.get(&incoming.address) {
            Some(current) => current,
            None => return true,
        };

        match (current.topology_version(), incoming.topology_version()) {
            (Some(current_tv), Some(incoming_tv)) => {
                current_tv.process_id == incoming_tv.process_id
                    && incoming_tv.counter < current_tv.counter
            }
            _ => false,
        }
    }

    /// For Single topologies pinned to a set name: if an available server reports a different
    /// set (or none), returns the error description that should replace it.
    fn direct_set_name_mismatch(&self, incoming: &ServerDescription) -> Option<ServerDescription> {
        let expected = self.set_name.as_deref()?;
        if !incoming.is_available() {
            return None;
        }

        let actual = incoming.set_name();
        if matches!(actual.as_ref().map(|n| n.as_deref()), Ok(Some(name)) if name == expected) {
            return None;
        }

        let actual_display = match actual {
            Ok(Some(name)) => format!("{:?}", name),
            Ok(None) => "no replica set name".to_string(),
            Err(e) => format!("<error: {}>", e),
        };
        Some(ServerDescription::new_from_error(
            incoming.address.clone(),
            Error::invalid_argument(format!(
                "the {:?} replica set was requested, but the server at {} reports {}",
                expected, incoming.address, actual_display,
            )),
        ))
    }

    /// The SDAM transition table, keyed by (current topology type, reported server type).
    fn apply_transition(
        &mut self,
        incoming: ServerDescription,
        server_type: ServerType,
    ) -> Result<()> {
        use ServerType as S;
        use TopologyType as T;

        match (self.topology_type, server_type) {
            // Fixed-type topologies never transition.
            (T::Single | T::LoadBalanced, _) => {}

            (_, S::LoadBalancer) => {
                return Err(Error::internal(
                    "a monitored server cannot report itself as a load balancer",
                ))
            }

            // Hellos that carry no membership information change nothing, except that losing
            // the primary mid-set has to be recorded.
            (T::Unknown | T::ReplicaSetNoPrimary, S::Unknown | S::RsGhost) => {}
            (T::ReplicaSetWithPrimary, S::Unknown | S::RsGhost) => self.refresh_primary_flag(),

            // A standalone among multiple seeds cannot be what we are looking for; a lone seed
            // answering as a standalone settles the topology type.
            (T::Unknown, S::Standalone) => {
                if self.single_seed {
                    self.topology_type = T::Single;
                } else {
                    self.servers.remove(&incoming.address);
                }
            }

            (T::Unknown, S::Mongos) => self.topology_type = T::Sharded,

            (T::Unknown | T::ReplicaSetNoPrimary, S::RsPrimary) => {
                self.topology_type = T::ReplicaSetWithPrimary;
                self.on_primary_hello(incoming)?;
            }

            (T::Unknown, S::RsSecondary | S::RsArbiter | S::RsOther) => {
                self.topology_type = T::ReplicaSetNoPrimary;
                self.on_member_hello_without_primary(incoming)?;
            }

            // Once sharded, anything that is not a mongos is evicted.
            (T::Sharded, S::Unknown | S::Mongos) => {}
            (T::Sharded, _) => {
                self.servers.remove(&incoming.address);
            }

            (T::ReplicaSetNoPrimary, S::Standalone | S::Mongos) => {
                self.servers.remove(&incoming.address);
            }

            (T::ReplicaSetNoPrimary, S::RsSecondary | S::RsArbiter | S::RsOther) => {
                self.on_member_hello_without_primary(incoming)?;
            }

            (T::ReplicaSetWithPrimary, S::Standalone | S::Mongos) => {
                self.servers.remove(&incoming.address);
                self.refresh_primary_flag();
            }

            (T::ReplicaSetWithPrimary, S::RsPrimary) => self.on_primary_hello(incoming)?,

            (T::ReplicaSetWithPrimary, S::RsSecondary | S::RsArbiter | S::RsOther) => {
                self.on_member_hello_with_primary(incoming)?;
            }
        }

        Ok(())
    }

    /// A server presented itself as the primary. Order its claim against the newest election
    /// recorded so far, and on success let its host list drive the set membership.
    fn on_primary_hello(&mut self, incoming: ServerDescription) -> Result<()> {
        if !self.confirm_set_name(&incoming)? {
            self.refresh_primary_flag();
            return Ok(());
        }

        if let (Some(set_version), Some(election_id)) =
            (incoming.set_version()?, incoming.election_id()?)
        {
            if self.election_is_stale(set_version, &election_id) {
                // The claim loses to an election we have already seen; treat the server as
                // unknown until its next heartbeat catches it up.
                self.servers.insert(
                    incoming.address.clone(),
                    ServerDescription::new(&incoming.address),
                );
                self.refresh_primary_flag();
                return Ok(());
            }
            self.max_election_id = Some(election_id);
        }

        if let Some(set_version) = incoming.set_version()? {
            if self.max_set_version.map_or(true, |max| set_version > max) {
                self.max_set_version = Some(set_version);
            }
        }

        // There can be only one primary: any other member still claiming the role reverts to
        // Unknown until re-checked.
        let rivals: Vec<ServerAddress> = self
            .servers
            .iter()
            .filter(|(address, description)| {
                *address != &incoming.address
                    && description.server_type == ServerType::RsPrimary
            })
            .map(|(address, _)| address.clone())
            .collect();
        for address in rivals {
            self.servers
                .insert(address.clone(), ServerDescription::new(&address));
        }

        // The primary's host list is authoritative: it introduces members we have not met and
        // retires the ones it no longer lists.
        let member_list: HashSet<ServerAddress> =
            incoming.known_hosts()?.into_iter().collect();
        self.introduce_hosts(member_list.iter().cloned());
        self.servers
            .retain(|address, _| member_list.contains(address));

        self.refresh_primary_flag();
        Ok(())
    }

    /// A secondary, arbiter, or other member reported in while no primary is known. Its host
    /// list can only add members; its self-reported address must match ours to keep it.
    fn on_member_hello_without_primary(&mut self, incoming: ServerDescription) -> Result<()> {
        if !self.confirm_set_name(&incoming)? {
            return Ok(());
        }

        self.introduce_hosts(incoming.known_hosts()?);

        if incoming.me_mismatch()? {
            self.servers.remove(&incoming.address);
        }
        Ok(())
    }

    /// A non-primary member reported in while a primary is known. The primary owns the member
    /// list, so the report can only evict the sender itself.
    fn on_member_hello_with_primary(&mut self, incoming: ServerDescription) -> Result<()> {
        if !self.confirm_set_name(&incoming)? {
            self.refresh_primary_flag();
            return Ok(());
        }

        if incoming.me_mismatch()? {
            self.servers.remove(&incoming.address);
            self.refresh_primary_flag();
        }
        Ok(())
    }

    /// Check the member's replica set name against the topology's, adopting it on first
    /// contact. Returns false (after evicting the member) on a mismatch.
    fn confirm_set_name(&mut self, incoming: &ServerDescription) -> Result<bool> {
        let reported = incoming.set_name()?;
        match self.set_name {
            None => {
                self.set_name = reported;
                Ok(true)
            }
            Some(ref expected) if reported.as_deref() == Some(expected.as_str()) => Ok(true),
            Some(_) => {
                self.servers.remove(&incoming.address);
                Ok(false)
            }
        }
    }

    /// Whether a primary claim with this (setVersion, electionId) pair is older than the
    /// newest pair already observed.
    fn election_is_stale(&self, set_version: i32, election_id: &ObjectId) -> bool {
        let (max_set_version, max_election_id) =
            match (self.max_set_version, self.max_election_id.as_ref()) {
                (Some(v), Some(id)) => (v, id),
                _ => return false,
            };

        max_set_version > set_version
            || (max_set_version == set_version && max_election_id > election_id)
    }

    /// Settle ReplicaSetWithPrimary vs ReplicaSetNoPrimary based on whether any member
    /// currently holds the primary role. Only meaningful on replica set topologies.
    fn refresh_primary_flag(&mut self) {
        let has_primary = self
            .servers
            .values()
            .any(|member| member.server_type == ServerType::RsPrimary);
        self.topology_type = if has_primary {
            TopologyType::ReplicaSetWithPrimary
        } else {
            TopologyType::ReplicaSetNoPrimary
        };
    }

    /// Add a blank description for every address not seen before.
    fn introduce_hosts(&mut self, hosts: impl IntoIterator<Item = ServerAddress>) {
        for host in hosts {
            self.servers
                .entry(host.clone())
                .or_insert_with(|| ServerDescription::new(&host));
        }
    }

    /// Recompute the deployment-wide logical session timeout: the minimum across data-bearing
    /// members, or `None` as soon as one of them does not advertise a timeout.
    fn recompute_session_timeout(&mut self) {
        let mut min_timeout = None;
        for member in self.servers.values() {
            if !member.server_type.is_data_bearing() {
                continue;
            }
            match member.logical_session_timeout().ok().flatten() {
                None => {
                    self.logical_session_timeout = None;
                    return;
                }
                Some(timeout) => {
                    min_timeout = Some(min_timeout.map_or(timeout, |min: Duration| min.min(timeout)));
                }
            }
        }
        self.logical_session_timeout = min_timeout;
    }

    /// Re-derive the compatibility error from the current member set.
    fn refresh_compatibility_error(&mut self) {
        self.compatibility_error = self
            .servers
            .values()
            .find_map(ServerDescription::wire_version_mismatch);
    }

    /// What changed going from `self` to `other`, or `None` when server selection would see the
    /// two as identical.
    pub(crate) fn diff<'a>(
        &'a self,
        other: &'a TopologyDescription,
    ) -> Option<TopologyDescriptionDiff<'a>> {
        if self == other {
            return None;
        }

        let before: HashSet<&ServerAddress> = self.servers.keys().collect();
        let after: HashSet<&ServerAddress> = other.servers.keys().collect();

        Some(TopologyDescriptionDiff {
            removed_addresses: &before - &after,
            added_addresses: &after - &before,
        })
    }

    /// Whether the deployment can accept a `txnNumber` on write commands: a replica set or
    /// sharded cluster whose data-bearing members all support sessions and wire version 8+.
    pub(crate) fn supports_retryable_writes(&self) -> bool {
        if matches!(
            self.topology_type,
            TopologyType::Unknown | TopologyType::Single
        ) {
            return false;
        }
        if self.logical_session_timeout.is_none() {
            return false;
        }
        self.servers.values().all(|member| {
            !member.server_type.is_data_bearing()
                || matches!(member.max_wire_version(), Ok(Some(version)) if version >= 8)
        })
    }

    /// Attach a `$readPreference` to the command as appropriate for the server it is about to
    /// be sent to.
    pub(crate) fn update_command_with_read_pref(
        &self,
        address: &ServerAddress,
        command: &mut Command,
        criteria: Option<&SelectionCriteria>,
    ) -> Result<()> {
        use ServerType as S;
        use TopologyType as T;

        let server_type = self
            .get_server_description(address)
            .map(|description| description.server_type)
            .unwrap_or_default();
        let read_pref = criteria.and_then(SelectionCriteria::as_read_pref);

        let resolved = match (self.topology_type, server_type) {
            // A mongos (or whatever hides behind a load balancer) runs its own selection;
            // forward any non-default preference so it can honor it.
            (T::Sharded, S::Mongos) | (T::Single, S::Mongos) | (T::LoadBalanced, _) => read_pref
                .filter(|rp| !matches!(rp, ReadPreference::Primary))
                .cloned(),

            // Direct connections to a standalone need no routing hints at all.
            (T::Single, S::Standalone) => None,

            // A directly-connected replica set member must serve reads whatever its role.
            (T::Single, _) => match read_pref {
                Some(ReadPreference::Primary) | None => {
                    Some(ReadPreference::PrimaryPreferred { options: None })
                }
                Some(other) => Some(other.clone()),
            },

            _ => match criteria {
                Some(SelectionCriteria::ReadPreference(rp)) => {
                    Some(rp.clone()).filter(|rp| !matches!(rp, ReadPreference::Primary))
                }
                Some(SelectionCriteria::Predicate(_)) => {
                    Some(ReadPreference::PrimaryPreferred { options: None })
                }
                None => None,
            },
        };

        if let Some(read_pref) = resolved {
            command.set_read_preference(read_pref)?;
        }
        Ok(())
    }

    pub(crate) fn has_available_servers(&self) -> bool {
        self.servers.values().any(|member| member.is_available())
    }

    #[cfg(test)]
    pub(crate) fn primary(&self) -> Option<&ServerDescription> {
        self.servers
            .values()
            .find(|member| member.server_type == ServerType::RsPrimary)
    }
}

impl fmt::Display for TopologyDescription {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{ Type: {}", self.topology_type)?;
        if let Some(ref set_name) = self.set_name {
            write!(f, ", Set Name: {}", set_name)?;
        }
        if let Some(max_set_version) = self.max_set_version {
            write!(f, ", Max Set Version: {}", max_set_version)?;
        }
        if let Some(max_election_id) = self.max_election_id {
            write!(f, ", Max Election ID: {}", max_election_id)?;
        }
        if let Some(ref compatibility_error) = self.compatibility_error {
            write!(f, ", Compatibility Error: {}", compatibility_error)?;
        }

        let mut members = self.servers.values();
        if let Some(first) = members.next() {
            write!(f, ", Servers: [ {}", ServerInfo::new_borrowed(first))?;
            for member in members {
                write!(f, ", {}", ServerInfo::new_borrowed(member))?;
            }
            write!(f, " ]")?;
        }

        write!(f, " }}")
    }
}

/// The membership delta between two descriptions, from [`TopologyDescription::diff`].
#[derive(Debug)]
pub(crate) struct TopologyDescriptionDiff<'a> {
    #[allow(unused)]
    pub(crate) removed_addresses: HashSet<&'a ServerAddress>,
    #[allow(unused)]
    pub(crate) added_addresses: HashSet<&'a ServerAddress>,
}
