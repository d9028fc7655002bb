use std::time::Duration;

use super::{attempt_to_select_server, HandshakePhase, Topology, TopologyUpdater};
use crate::{
    cmap::conn::ConnectionGeneration,
    error::{CommandError, Error, ErrorKind},
    hello::{HelloCommandResponse, HelloReply},
    options::{ClientOptions, ServerAddress, TestOptions},
    sdam::{ServerDescription, ServerType},
    selection_criteria::{ReadPreference, SelectionCriteria},
};

fn address(s: &str) -> ServerAddress {
    ServerAddress::parse(s).unwrap()
}

fn primary_description(addr: &str, hosts: &[&str]) -> ServerDescription {
    let response = HelloCommandResponse {
        is_writable_primary: Some(true),
        set_name: Some("rs0".to_string()),
        hosts: Some(hosts.iter().map(|h| h.to_string()).collect()),
        min_wire_version: Some(7),
        max_wire_version: Some(21),
        ..Default::default()
    };
    let reply = HelloReply {
        server_address: address(addr),
        command_response: response,
    };
    ServerDescription::new_from_hello_reply(address(addr), reply, Duration::from_millis(5))
}

fn not_writable_primary_error() -> Error {
    Error::new(
        ErrorKind::Command(CommandError {
            code: 10107,
            code_name: "NotWritablePrimary".to_string(),
            message: "node is not in primary or recovering state".to_string(),
            topology_version: None,
        }),
        None::<Vec<String>>,
    )
}

fn test_topology(hosts: &[&str]) -> Topology {
    let mut options = ClientOptions::builder()
        .hosts(hosts.iter().map(|s| address(s)).collect::<Vec<_>>())
        .build();
    options.test_options = Some(TestOptions {
        disable_monitors: true,
        ..Default::default()
    });
    Topology::new(options).unwrap()
}

#[tokio::test]
async fn primary_stepdown_error_clears_pool_and_marks_unknown() {
    let topology = test_topology(&["a:27017", "b:27017"]);
    let updater: TopologyUpdater = topology.updater();

    assert!(
        updater
            .update(primary_description("a:27017", &["a:27017", "b:27017"]))
            .await
    );

    let state = topology.watch().peek_latest();
    let server = state.servers.get(&address("a:27017")).unwrap().clone();
    assert_eq!(
        state
            .description
            .get_server_description(&address("a:27017"))
            .unwrap()
            .server_type,
        ServerType::RsPrimary
    );
    let generation_before = server.pool.generation();

    let updated = topology
        .handle_application_error(
            address("a:27017"),
            not_writable_primary_error(),
            HandshakePhase::AfterCompletion {
                generation: ConnectionGeneration::Normal(generation_before.0),
                max_wire_version: Some(21),
            },
        )
        .await;
    assert!(updated);

    let state = topology.watch().peek_latest();
    assert_eq!(
        state
            .description
            .get_server_description(&address("a:27017"))
            .unwrap()
            .server_type,
        ServerType::Unknown
    );

    // The stepdown invalidates every pooled connection to the former primary.
    assert_eq!(server.pool.generation().0, generation_before.0 + 1);
}

#[tokio::test]
async fn stale_generation_errors_are_ignored() {
    let topology = test_topology(&["a:27017"]);
    let updater = topology.updater();
    updater
        .update(primary_description("a:27017", &["a:27017"]))
        .await;

    let state = topology.watch().peek_latest();
    let server = state.servers.get(&address("a:27017")).unwrap().clone();

    // Clear the pool once so the current generation is newer than the connection's.
    server.pool.clear(Error::internal("test clear")).await;
    let generation = server.pool.generation();
    assert_eq!(generation.0, 1);

    let updated = topology
        .handle_application_error(
            address("a:27017"),
            not_writable_primary_error(),
            HandshakePhase::AfterCompletion {
                generation: ConnectionGeneration::Normal(0),
                max_wire_version: Some(21),
            },
        )
        .await;

    // The error came from a connection that predates the clear; nothing should change.
    assert!(!updated);
    assert_eq!(server.pool.generation().0, 1);
    let state = topology.watch().peek_latest();
    assert_eq!(
        state
            .description
            .get_server_description(&address("a:27017"))
            .unwrap()
            .server_type,
        ServerType::RsPrimary
    );
}

#[tokio::test]
async fn network_timeout_on_established_connection_is_not_a_state_change() {
    let topology = test_topology(&["a:27017"]);
    let updater = topology.updater();
    updater
        .update(primary_description("a:27017", &["a:27017"]))
        .await;

    let updated = topology
        .handle_application_error(
            address("a:27017"),
            Error::network_timeout(),
            HandshakePhase::AfterCompletion {
                generation: ConnectionGeneration::Normal(0),
                max_wire_version: Some(21),
            },
        )
        .await;

    // A timeout says the operation's deadline was too tight, not that the server is down.
    assert!(!updated);
    let state = topology.watch().peek_latest();
    assert_eq!(
        state
            .description
            .get_server_description(&address("a:27017"))
            .unwrap()
            .server_type,
        ServerType::RsPrimary
    );
}

#[tokio::test]
async fn selection_prefers_less_loaded_server() {
    let topology = test_topology(&["a:27017", "b:27017"]);
    let updater = topology.updater();

    updater
        .update(primary_description("a:27017", &["a:27017", "b:27017"]))
        .await;
    let mut secondary = primary_description("b:27017", &["a:27017", "b:27017"]);
    if let Ok(Some(ref mut reply)) = secondary.reply {
        reply.command_response.is_writable_primary = None;
        reply.command_response.secondary = Some(true);
    }
    secondary.server_type = ServerType::RsSecondary;
    updater.update(secondary).await;

    let state = topology.watch().peek_latest();
    let busy = state.servers.get(&address("a:27017")).unwrap();
    for _ in 0..100 {
        busy.increment_operation_count();
    }

    let criteria = SelectionCriteria::ReadPreference(ReadPreference::Nearest { options: None });
    for _ in 0..20 {
        let selected = attempt_to_select_server(
            &criteria,
            &state.description,
            &state.servers,
            None,
        )
        .unwrap()
        .unwrap();
        // With both servers in the window, power-of-two-choices always lands on the idle one.
        assert_eq!(selected.address, address("b:27017"));
    }
}

#[tokio::test]
async fn selection_observes_topology_changes() {
    let topology = test_topology(&["a:27017"]);
    let updater = topology.updater();

    let mut watcher = topology.watch();
    let state = watcher.observe_latest();
    let criteria = SelectionCriteria::ReadPreference(ReadPreference::Primary);
    assert!(attempt_to_select_server(
        &criteria,
        &state.description,
        &state.servers,
        None
    )
    .unwrap()
    .is_none());

    updater
        .update(primary_description("a:27017", &["a:27017"]))
        .await;

    assert!(watcher.wait_for_update(Duration::from_secs(1)).await);
    let state = watcher.observe_latest();
    let selected = attempt_to_select_server(&criteria, &state.description, &state.servers, None)
        .unwrap()
        .expect("primary should be selectable after the update");
    assert_eq!(selected.address, address("a:27017"));
}
