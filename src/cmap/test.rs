use std::time::{Duration, Instant};

use crate::{
    cmap::{
        establish::{ConnectionEstablisher, EstablisherOptions},
        options::ConnectionPoolOptions,
        ConnectionPool,
    },
    error::{Error, ErrorKind, RETRYABLE_ERROR, SYSTEM_OVERLOADED_ERROR},
    options::{ClientOptions, ServerAddress},
    sdam::TopologyUpdater,
};

fn pool_for_test(options: ConnectionPoolOptions) -> ConnectionPool {
    // A TEST-NET address (RFC 5737): connection attempts will not succeed, which is fine for
    // tests that only exercise queueing behavior.
    let address = ServerAddress::parse("192.0.2.1:27017").unwrap();
    let client_options = ClientOptions::builder().hosts(vec![address.clone()]).build();
    let establisher =
        ConnectionEstablisher::new(EstablisherOptions::from_client_options(&client_options))
            .unwrap();
    let (updater, _receiver) = TopologyUpdater::channel();

    ConnectionPool::new(address, establisher, updater, None, Some(options))
}

#[tokio::test]
async fn checkout_from_paused_pool_fails_immediately() {
    // A pool that SDAM has not yet marked ready refuses checkouts rather than dialing a server
    // that has never responded to a hello.
    let pool = pool_for_test(ConnectionPoolOptions {
        ready: Some(false),
        ..Default::default()
    });

    let error = pool
        .check_out(Some(Instant::now() + Duration::from_secs(1)))
        .await
        .unwrap_err();
    assert!(matches!(
        *error.kind,
        ErrorKind::ConnectionPoolCleared { .. }
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn saturated_wait_queue_rejects_with_overload_labels() {
    let pool = pool_for_test(ConnectionPoolOptions {
        ready: Some(true),
        ingress_rate_per_sec: Some(20),
        ingress_burst_capacity_secs: Some(1),
        ingress_max_queue_depth: Some(1),
        ..Default::default()
    });

    let generation_before = pool.generation();

    let mut handles = Vec::new();
    for _ in 0..100 {
        let pool = pool.clone();
        handles.push(tokio::spawn(async move {
            pool.check_out(Some(Instant::now() + Duration::from_millis(200)))
                .await
        }));
    }

    let mut overloaded = 0;
    for handle in handles {
        if let Err(error) = handle.await.unwrap() {
            if error.is_system_overloaded() {
                assert!(error.contains_label(SYSTEM_OVERLOADED_ERROR));
                assert!(error.contains_label(RETRYABLE_ERROR));
                overloaded += 1;
            }
        }
    }

    // maxConnecting bounds concurrent establishment at 2 and the queue holds 1, so the vast
    // majority of the 100 concurrent requests must be rejected outright.
    assert!(
        overloaded >= 10,
        "expected at least 10 overloaded checkouts, got {}",
        overloaded
    );

    // Overload rejections must never touch the pool generation.
    assert_eq!(pool.generation(), generation_before);
}

#[tokio::test]
async fn clear_increments_generation_and_pauses() {
    let pool = pool_for_test(ConnectionPoolOptions {
        ready: Some(true),
        ..Default::default()
    });

    let mut subscriber = pool.generation_subscriber();
    assert_eq!(pool.generation().0, 0);

    pool.clear(Error::internal("test clear")).await;
    let generation = subscriber
        .wait_for_generation_change(Duration::from_secs(1))
        .await;
    assert_eq!(generation.map(|g| g.0), Some(1));

    // The pool is paused now, so checkouts fail with the clear's cause.
    let error = pool
        .check_out(Some(Instant::now() + Duration::from_secs(1)))
        .await
        .unwrap_err();
    assert!(matches!(
        *error.kind,
        ErrorKind::ConnectionPoolCleared { .. }
    ));

    // A second clear keeps counting up; the generation is monotone.
    pool.clear(Error::internal("test clear 2")).await;
    assert_eq!(pool.generation().0, 2);
}

#[tokio::test]
async fn pinned_connections_return_to_their_pin_holder() {
    use crate::{
        cmap::{conn::Connection, manager},
        runtime::AsyncStream,
    };

    let address = ServerAddress::parse("192.0.2.1:27017").unwrap();
    let (manager, mut receiver) = manager::channel();

    let mut conn = Connection::new_monitoring(address, AsyncStream::Null, 1);
    conn.mark_as_in_use(manager.clone());
    let mut handle = conn.pin().unwrap();

    // Dropping a pinned connection routes it to the pin holder, not back to the pool.
    drop(conn);
    let conn = handle.take_connection().await.unwrap();

    // Once the pin handle is gone the connection returns to the pool on its next drop.
    drop(handle);
    drop(conn);
    match receiver.recv().await.unwrap() {
        manager::PoolManagementRequest::CheckIn(_) => {}
        other => panic!("expected a check-in, got {:?}", other),
    }
}

#[tokio::test]
async fn checkout_respects_deadline() {
    let pool = pool_for_test(ConnectionPoolOptions {
        ready: Some(true),
        // A rate of 1/s with no queue means the second request can neither establish nor queue.
        ingress_rate_per_sec: Some(1),
        ingress_burst_capacity_secs: Some(1),
        ingress_max_queue_depth: Some(10),
        ..Default::default()
    });

    let start = Instant::now();
    let deadline = start + Duration::from_millis(100);
    // The establishment to the black-hole address cannot finish before the deadline.
    let error = pool.check_out(Some(deadline)).await.unwrap_err();
    assert!(
        error.is_network_timeout() || error.is_network_error(),
        "unexpected error: {:?}",
        error
    );
    assert!(start.elapsed() < Duration::from_secs(5));
}
