use std::{collections::HashMap, ops::Deref, sync::Arc, time::Duration};

use rand::Rng;

use super::TopologyDescription;
use crate::{
    bson::DateTime,
    error::{Error, ErrorKind, Result},
    options::ServerAddress,
    sdam::{
        description::server::{ServerDescription, ServerType},
        Server,
        ServerInfo,
    },
    selection_criteria::{ReadPreference, SelectionCriteria, TagSet},
};

const DEFAULT_LOCAL_THRESHOLD: Duration = Duration::from_millis(15);

/// How long a primary is assumed to keep writing after its last observed write, which bounds
/// how small a usable maxStalenessSeconds can be.
pub(crate) const IDLE_WRITE_PERIOD: Duration = Duration::from_secs(10);

/// A server handed out by selection. Holding one counts as an in-flight operation against the
/// server, which is what the power-of-two-choices load comparison reads; the count drops when
/// this is dropped.
#[derive(Debug)]
pub(crate) struct SelectedServer {
    server: Arc<Server>,
}

impl SelectedServer {
    fn new(server: Arc<Server>) -> Self {
        server.increment_operation_count();
        Self { server }
    }
}

impl Deref for SelectedServer {
    type Target = Server;

    fn deref(&self) -> &Server {
        &self.server
    }
}

impl Drop for SelectedServer {
    fn drop(&mut self) {
        self.server.decrement_operation_count();
    }
}

/// Run one pass of server selection against a topology snapshot. Returns `Ok(None)` when no
/// server currently qualifies (the caller decides whether to wait for a topology change and try
/// again), and an error when selection cannot succeed at all.
pub(crate) fn attempt_to_select_server<'a>(
    criteria: &'a SelectionCriteria,
    topology_description: &'a TopologyDescription,
    servers: &'a HashMap<ServerAddress, Arc<Server>>,
    deprioritized: Option<&ServerAddress>,
) -> Result<Option<SelectedServer>> {
    let mut candidates = topology_description.suitable_servers_in_latency_window(criteria)?;

    // A retry prefers to land somewhere other than where the first attempt failed, but a
    // deprioritized server is still better than none.
    if candidates.len() > 1 {
        if let Some(deprioritized) = deprioritized {
            candidates.retain(|description| &description.address != deprioritized);
        }
    }

    let live_candidates: Vec<&Arc<Server>> = candidates
        .iter()
        .filter_map(|description| servers.get(&description.address))
        .collect();

    Ok(pick_from_window(&live_candidates).map(SelectedServer::new))
}

/// The final narrowing step: among the servers left in the latency window, sample two at random
/// and take the one with fewer operations in flight.
fn pick_from_window(window: &[&Arc<Server>]) -> Option<Arc<Server>> {
    match window {
        [] => None,
        [only] => Some(Arc::clone(*only)),
        _ => {
            let mut rng = rand::thread_rng();
            let first = rng.gen_range(0..window.len());
            let mut second = rng.gen_range(0..window.len() - 1);
            if second >= first {
                second += 1;
            }

            let (a, b) = (window[first], window[second]);
            let winner = if b.operation_count() < a.operation_count() {
                b
            } else {
                a
            };
            Some(Arc::clone(winner))
        }
    }
}

impl TopologyDescription {
    pub(crate) fn server_selection_timeout_error_message(
        &self,
        criteria: &SelectionCriteria,
    ) -> String {
        let detail = if self.has_available_servers() {
            format!(
                "none of the available servers match the criteria {:?}",
                criteria
            )
        } else {
            "no servers are available".to_string()
        };
        format!(
            "Server selection timed out: {}. Topology: {}",
            detail, self
        )
    }

    /// The set of servers an operation with the given criteria may be routed to: suitability
    /// filtering (topology rules, tags, staleness) followed by the latency window.
    pub(crate) fn suitable_servers_in_latency_window<'a>(
        &'a self,
        criteria: &'a SelectionCriteria,
    ) -> Result<Vec<&'a ServerDescription>> {
        if let Some(message) = self.compatibility_error() {
            return Err(ErrorKind::IncompatibleServer {
                message: message.clone(),
            }
            .into());
        }

        let mut candidates = match criteria {
            SelectionCriteria::ReadPreference(read_pref) => {
                self.eligible_for_read_preference(read_pref)?
            }
            SelectionCriteria::Predicate(predicate) => self
                .servers
                .values()
                .filter(|description| {
                    // A direct connection pins the topology to its one server; the predicate
                    // alone decides there, data-bearing or not.
                    (self.topology_type == super::TopologyType::Single
                        || description.server_type.is_data_bearing())
                        && predicate(&ServerInfo::new_borrowed(description))
                })
                .collect(),
        };

        self.apply_latency_window(&mut candidates);
        Ok(candidates)
    }

    fn eligible_for_read_preference(
        &self,
        read_pref: &ReadPreference,
    ) -> Result<Vec<&ServerDescription>> {
        use super::TopologyType as T;

        Ok(match self.topology_type {
            T::Unknown => Vec::new(),
            T::Single | T::LoadBalanced => self.servers.values().collect(),
            T::Sharded => self.members_with_type(&[ServerType::Mongos]).collect(),
            T::ReplicaSetWithPrimary | T::ReplicaSetNoPrimary => {
                self.replica_set_candidates(read_pref)?
            }
        })
    }

    /// Resolve a read preference against a replica set, including the preferred modes'
    /// fallback behavior.
    fn replica_set_candidates(
        &self,
        read_pref: &ReadPreference,
    ) -> Result<Vec<&ServerDescription>> {
        const PRIMARY: &[ServerType] = &[ServerType::RsPrimary];
        const SECONDARIES: &[ServerType] = &[ServerType::RsSecondary];
        const READABLE: &[ServerType] = &[ServerType::RsPrimary, ServerType::RsSecondary];

        Ok(match read_pref {
            ReadPreference::Primary => self.members_with_type(PRIMARY).collect(),
            ReadPreference::Secondary { .. } => self.filtered_members(SECONDARIES, read_pref)?,
            ReadPreference::Nearest { .. } => self.filtered_members(READABLE, read_pref)?,
            ReadPreference::PrimaryPreferred { .. } => {
                let primary: Vec<_> = self.members_with_type(PRIMARY).collect();
                if primary.is_empty() {
                    self.filtered_members(SECONDARIES, read_pref)?
                } else {
                    primary
                }
            }
            ReadPreference::SecondaryPreferred { .. } => {
                let secondaries = self.filtered_members(SECONDARIES, read_pref)?;
                if secondaries.is_empty() {
                    self.members_with_type(PRIMARY).collect()
                } else {
                    secondaries
                }
            }
        })
    }

    /// Members of the given types, narrowed by the read preference's max staleness and tag
    /// sets.
    fn filtered_members(
        &self,
        types: &'static [ServerType],
        read_pref: &ReadPreference,
    ) -> Result<Vec<&ServerDescription>> {
        let max_staleness = read_pref.max_staleness();
        if let Some(max_staleness) = max_staleness {
            validate_max_staleness(max_staleness, self.heartbeat_frequency())?;
        }

        let mut members: Vec<_> = self.members_with_type(types).collect();

        if let Some(max_staleness) = max_staleness {
            // A zero (or negative, at the options layer) max staleness means unbounded.
            if !max_staleness.is_zero() {
                self.drop_stale_members(&mut members, max_staleness);
            }
        }

        if let Some(tag_sets) = read_pref.tag_sets() {
            keep_first_matching_tag_set(&mut members, tag_sets);
        }

        Ok(members)
    }

    pub(crate) fn members_with_type<'a>(
        &'a self,
        types: &'a [ServerType],
    ) -> impl Iterator<Item = &'a ServerDescription> {
        self.servers
            .values()
            .filter(move |description| types.contains(&description.server_type))
    }

    /// Drop members whose replication lag, estimated per the max staleness rules, exceeds the
    /// limit. With a known primary each secondary is measured against it; otherwise against
    /// the most recently-written secondary.
    fn drop_stale_members(&self, members: &mut Vec<&ServerDescription>, max_staleness: Duration) {
        let limit = i64::try_from(max_staleness.as_millis()).unwrap_or(i64::MAX);
        let heartbeat = i64::try_from(self.heartbeat_frequency().as_millis()).unwrap_or(i64::MAX);

        let primary = self
            .members_with_type(&[ServerType::RsPrimary])
            .next();

        match primary {
            Some(primary) => {
                let primary_lag = match replication_lag(primary) {
                    Some(lag) => lag,
                    // Without the primary's write info no staleness estimate exists, and the
                    // requested bound cannot be honored for any member.
                    None => {
                        members.clear();
                        return;
                    }
                };
                members.retain(|member| match replication_lag(member) {
                    Some(lag) => lag - primary_lag + heartbeat <= limit,
                    None => false,
                });
            }
            None => {
                let newest_write = self
                    .members_with_type(&[ServerType::RsSecondary])
                    .filter_map(last_write_millis)
                    .max();
                let newest_write = match newest_write {
                    Some(millis) => millis,
                    None => return,
                };
                members.retain(|member| match last_write_millis(member) {
                    Some(written) => newest_write - written + heartbeat <= limit,
                    None => false,
                });
            }
        }
    }

    /// Keep only the servers whose round trip time is within `localThresholdMS` of the fastest
    /// candidate.
    fn apply_latency_window(&self, candidates: &mut Vec<&ServerDescription>) {
        let fastest = candidates
            .iter()
            .filter_map(|description| description.average_round_trip_time)
            .min();

        let cutoff = fastest.map(|fastest| {
            fastest
                .checked_add(self.local_threshold.unwrap_or(DEFAULT_LOCAL_THRESHOLD))
                .unwrap_or(Duration::MAX)
        });

        candidates.retain(|description| {
            match (description.average_round_trip_time, cutoff) {
                (Some(rtt), Some(cutoff)) => rtt <= cutoff,
                // Load balancers are never monitored and so never have an RTT; they are always
                // in the window. Anything else without one is not selectable.
                _ => description.server_type == ServerType::LoadBalancer,
            }
        });
    }
}

/// A member's lag indicator: how long its last write had been sitting there when the monitor
/// last saw it.
fn replication_lag(description: &ServerDescription) -> Option<i64> {
    let observed = description.last_update_time?.timestamp_millis();
    let written = last_write_millis(description)?;
    Some(observed - written)
}

fn last_write_millis(description: &ServerDescription) -> Option<i64> {
    description
        .last_write_date()
        .ok()
        .flatten()
        .map(DateTime::timestamp_millis)
}

/// Tag sets are tried in order; the first one that matches anything wins, and a preference
/// whose tag sets all come up empty matches nothing.
fn keep_first_matching_tag_set(members: &mut Vec<&ServerDescription>, tag_sets: &[TagSet]) {
    if tag_sets.is_empty() {
        return;
    }

    for tag_set in tag_sets {
        let matching: Vec<_> = members
            .iter()
            .copied()
            .filter(|member| member.matches_tag_set(tag_set))
            .collect();
        if !matching.is_empty() {
            *members = matching;
            return;
        }
    }

    members.clear();
}

/// maxStalenessSeconds values below 90 seconds (or below the monitoring cadence plus the
/// primary's idle write period) cannot be estimated meaningfully and are rejected.
fn validate_max_staleness(max_staleness: Duration, heartbeat_frequency: Duration) -> Result<()> {
    let floor = std::cmp::max(
        Duration::from_secs(90),
        heartbeat_frequency
            .checked_add(IDLE_WRITE_PERIOD)
            .unwrap_or(Duration::MAX),
    );

    if max_staleness < floor {
        return Err(Error::invalid_argument(format!(
            "max staleness must be at least {} seconds",
            floor.as_secs()
        )));
    }

    Ok(())
}
