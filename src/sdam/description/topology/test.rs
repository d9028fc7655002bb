use std::time::Duration;

use bson::oid::ObjectId;

use super::{TopologyDescription, TopologyType};
use crate::{
    error::{CommandError, Error, ErrorKind},
    hello::{HelloCommandResponse, HelloReply},
    options::{ClientOptions, ServerAddress},
    sdam::{
        description::server::{ServerDescription, TopologyVersion},
        ServerType,
    },
    selection_criteria::{ReadPreference, SelectionCriteria},
};

fn address(s: &str) -> ServerAddress {
    ServerAddress::parse(s).unwrap()
}

fn topology_with_hosts(hosts: &[&str]) -> TopologyDescription {
    let options = ClientOptions::builder()
        .hosts(hosts.iter().map(|s| address(s)).collect::<Vec<_>>())
        .build();
    let mut description = TopologyDescription::default();
    description.initialize(&options);
    description
}

struct HelloBuilder {
    response: HelloCommandResponse,
}

impl HelloBuilder {
    fn new() -> Self {
        Self {
            response: HelloCommandResponse {
                min_wire_version: Some(7),
                max_wire_version: Some(21),
                ..Default::default()
            },
        }
    }

    fn standalone(mut self) -> Self {
        self.response.is_writable_primary = Some(true);
        self
    }

    fn mongos(mut self) -> Self {
        self.response.is_writable_primary = Some(true);
        self.response.msg = Some("isdbgrid".to_string());
        self
    }

    fn primary(mut self, set_name: &str, hosts: &[&str]) -> Self {
        self.response.is_writable_primary = Some(true);
        self.response.set_name = Some(set_name.to_string());
        self.response.hosts = Some(hosts.iter().map(|h| h.to_string()).collect());
        self
    }

    fn secondary(mut self, set_name: &str, hosts: &[&str]) -> Self {
        self.response.secondary = Some(true);
        self.response.set_name = Some(set_name.to_string());
        self.response.hosts = Some(hosts.iter().map(|h| h.to_string()).collect());
        self
    }

    fn election(mut self, set_version: i32, election_id: ObjectId) -> Self {
        self.response.set_version = Some(set_version);
        self.response.election_id = Some(election_id);
        self
    }

    fn topology_version(mut self, tv: TopologyVersion) -> Self {
        self.response.topology_version = Some(tv);
        self
    }

    fn wire_versions(mut self, min: i32, max: i32) -> Self {
        self.response.min_wire_version = Some(min);
        self.response.max_wire_version = Some(max);
        self
    }

    fn rtt(self, addr: &str, rtt: Duration) -> ServerDescription {
        let reply = HelloReply {
            server_address: address(addr),
            command_response: self.response,
        };
        ServerDescription::new_from_hello_reply(address(addr), reply, rtt)
    }

    fn build(self, addr: &str) -> ServerDescription {
        self.rtt(addr, Duration::from_millis(5))
    }
}

fn oid(byte: u8) -> ObjectId {
    ObjectId::from_bytes([byte; 12])
}

#[test]
fn single_seed_standalone_becomes_single() {
    let mut topology = topology_with_hosts(&["a:27017"]);
    topology
        .update(HelloBuilder::new().standalone().build("a:27017"))
        .unwrap();
    assert_eq!(topology.topology_type(), TopologyType::Single);
}

#[test]
fn multi_seed_standalone_is_removed() {
    let mut topology = topology_with_hosts(&["a:27017", "b:27017"]);
    topology
        .update(HelloBuilder::new().standalone().build("a:27017"))
        .unwrap();
    assert_eq!(topology.topology_type(), TopologyType::Unknown);
    assert!(!topology.servers.contains_key(&address("a:27017")));
}

#[test]
fn mongos_promotes_to_sharded_and_evicts_non_mongos() {
    let mut topology = topology_with_hosts(&["a:27017", "b:27017"]);
    topology
        .update(HelloBuilder::new().mongos().build("a:27017"))
        .unwrap();
    assert_eq!(topology.topology_type(), TopologyType::Sharded);

    // A replica set member has no business in a sharded topology.
    topology
        .update(
            HelloBuilder::new()
                .secondary("rs0", &["b:27017"])
                .build("b:27017"),
        )
        .unwrap();
    assert!(!topology.servers.contains_key(&address("b:27017")));
}

#[test]
fn primary_discovery_syncs_host_list() {
    let mut topology = topology_with_hosts(&["a:27017", "c:27017"]);
    topology
        .update(
            HelloBuilder::new()
                .primary("rs0", &["a:27017", "b:27017"])
                .build("a:27017"),
        )
        .unwrap();

    assert_eq!(topology.topology_type(), TopologyType::ReplicaSetWithPrimary);
    // Servers in the primary's host list are added, servers not in it are removed.
    assert!(topology.servers.contains_key(&address("b:27017")));
    assert!(!topology.servers.contains_key(&address("c:27017")));
    assert_eq!(topology.set_name.as_deref(), Some("rs0"));
}

#[test]
fn stale_primary_claim_is_demoted() {
    let mut topology = topology_with_hosts(&["a:27017", "b:27017"]);
    topology
        .update(
            HelloBuilder::new()
                .primary("rs0", &["a:27017", "b:27017"])
                .election(1, oid(9))
                .build("a:27017"),
        )
        .unwrap();

    // b claims to be primary but with an older election id for the same set version.
    topology
        .update(
            HelloBuilder::new()
                .primary("rs0", &["a:27017", "b:27017"])
                .election(1, oid(1))
                .build("b:27017"),
        )
        .unwrap();

    assert_eq!(
        topology.servers.get(&address("b:27017")).unwrap().server_type,
        ServerType::Unknown
    );
    assert_eq!(
        topology.primary().unwrap().address,
        address("a:27017"),
    );
}

#[test]
fn newer_primary_claim_displaces_old_primary() {
    let mut topology = topology_with_hosts(&["a:27017", "b:27017"]);
    topology
        .update(
            HelloBuilder::new()
                .primary("rs0", &["a:27017", "b:27017"])
                .election(1, oid(1))
                .build("a:27017"),
        )
        .unwrap();

    topology
        .update(
            HelloBuilder::new()
                .primary("rs0", &["a:27017", "b:27017"])
                .election(1, oid(9))
                .build("b:27017"),
        )
        .unwrap();

    assert_eq!(
        topology.primary().unwrap().address,
        address("b:27017"),
    );
    // The old primary is reset to Unknown pending its next heartbeat.
    assert_eq!(
        topology.servers.get(&address("a:27017")).unwrap().server_type,
        ServerType::Unknown
    );
}

#[test]
fn primary_error_leaves_replica_set_without_primary() {
    let mut topology = topology_with_hosts(&["a:27017", "b:27017"]);
    topology
        .update(
            HelloBuilder::new()
                .primary("rs0", &["a:27017", "b:27017"])
                .build("a:27017"),
        )
        .unwrap();

    let error = Error::new(
        ErrorKind::Command(CommandError {
            code: 10107,
            code_name: "NotWritablePrimary".to_string(),
            message: "node is not in primary or recovering state".to_string(),
            topology_version: None,
        }),
        None::<Vec<String>>,
    );
    topology
        .update(ServerDescription::new_from_error(address("a:27017"), error))
        .unwrap();

    assert_eq!(topology.topology_type(), TopologyType::ReplicaSetNoPrimary);
    assert_eq!(
        topology.servers.get(&address("a:27017")).unwrap().server_type,
        ServerType::Unknown
    );
}

#[test]
fn stale_topology_version_is_discarded() {
    let process_id = oid(4);
    let mut topology = topology_with_hosts(&["a:27017"]);

    topology
        .update(
            HelloBuilder::new()
                .primary("rs0", &["a:27017"])
                .topology_version(TopologyVersion {
                    process_id,
                    counter: 5,
                })
                .build("a:27017"),
        )
        .unwrap();

    // An update from an older topology version of the same process must not overwrite.
    topology
        .update(
            HelloBuilder::new()
                .secondary("rs0", &["a:27017"])
                .topology_version(TopologyVersion {
                    process_id,
                    counter: 3,
                })
                .build("a:27017"),
        )
        .unwrap();

    let description = topology.servers.get(&address("a:27017")).unwrap();
    assert_eq!(description.server_type, ServerType::RsPrimary);
    assert_eq!(description.topology_version().unwrap().counter, 5);
}

#[test]
fn incompatible_wire_version_is_surfaced() {
    let mut topology = topology_with_hosts(&["a:27017"]);
    topology
        .update(
            HelloBuilder::new()
                .standalone()
                .wire_versions(2, 5)
                .build("a:27017"),
        )
        .unwrap();

    assert!(topology.compatibility_error().is_some());

    let criteria = SelectionCriteria::ReadPreference(ReadPreference::Primary);
    let error = topology
        .suitable_servers_in_latency_window(&criteria)
        .unwrap_err();
    assert!(matches!(
        *error.kind,
        ErrorKind::IncompatibleServer { .. }
    ));
}

#[test]
fn latency_window_filters_slow_servers() {
    let mut topology = topology_with_hosts(&["a:27017", "b:27017", "c:27017"]);
    for (addr, rtt) in [
        ("a:27017", Duration::from_millis(10)),
        ("b:27017", Duration::from_millis(20)),
        ("c:27017", Duration::from_millis(40)),
    ] {
        topology
            .update(
                HelloBuilder::new()
                    .secondary("rs0", &["a:27017", "b:27017", "c:27017"])
                    .rtt(addr, rtt),
            )
            .unwrap();
    }

    let criteria = SelectionCriteria::ReadPreference(ReadPreference::Secondary { options: None });
    let suitable = topology
        .suitable_servers_in_latency_window(&criteria)
        .unwrap();

    // The default local threshold is 15ms: only servers within min RTT + 15ms survive.
    let mut addresses: Vec<_> = suitable.iter().map(|s| s.address.to_string()).collect();
    addresses.sort();
    assert_eq!(addresses, vec!["a:27017", "b:27017"]);
}

#[test]
fn first_matching_tag_set_wins() {
    let mut topology = topology_with_hosts(&["a:27017", "b:27017"]);

    let mut east = HelloBuilder::new().secondary("rs0", &["a:27017", "b:27017"]);
    east.response.tags = Some(
        [("dc".to_string(), "east".to_string())]
            .into_iter()
            .collect(),
    );
    topology.update(east.build("a:27017")).unwrap();

    let mut west = HelloBuilder::new().secondary("rs0", &["a:27017", "b:27017"]);
    west.response.tags = Some(
        [("dc".to_string(), "west".to_string())]
            .into_iter()
            .collect(),
    );
    topology.update(west.build("b:27017")).unwrap();

    let read_pref = ReadPreference::Secondary { options: None }
        .with_tags(vec![
            [("dc".to_string(), "north".to_string())].into_iter().collect(),
            [("dc".to_string(), "west".to_string())].into_iter().collect(),
        ])
        .unwrap();
    let criteria = SelectionCriteria::ReadPreference(read_pref);

    let suitable = topology
        .suitable_servers_in_latency_window(&criteria)
        .unwrap();
    assert_eq!(suitable.len(), 1);
    assert_eq!(suitable[0].address, address("b:27017"));
}

#[test]
fn secondary_preferred_falls_back_to_primary() {
    let mut topology = topology_with_hosts(&["a:27017"]);
    topology
        .update(
            HelloBuilder::new()
                .primary("rs0", &["a:27017"])
                .build("a:27017"),
        )
        .unwrap();

    let criteria = SelectionCriteria::ReadPreference(ReadPreference::SecondaryPreferred {
        options: None,
    });
    let suitable = topology
        .suitable_servers_in_latency_window(&criteria)
        .unwrap();
    assert_eq!(suitable.len(), 1);
    assert_eq!(suitable[0].server_type, ServerType::RsPrimary);
}
