//! End-to-end behavior of clients, servers and reconnectors over in-memory
//! links.

mod common;

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use neowire::Category;
use neowire::Client;
use neowire::Communicator;
use neowire::Connection;
use neowire::ConnectionConfig;
use neowire::ConnectionId;
use neowire::Connector;
use neowire::Dispatch;
use neowire::ErrorKind;
use neowire::OnDisconnect;
use neowire::Reconnector;
use neowire::Server;
use neowire::Side;
use neowire::State;
use neowire::delay;
use neowire::dialer_fn;
use neowire::mem;
use neowire::mem::MemoryConnector;

use common::Msg;
use common::echo_handler;
use common::negotiator;

fn serve(config: ConnectionConfig) -> (Arc<Server<Msg>>, JoinHandle<neowire::Result<()>>, MemoryConnector) {
    let (listener, dialer) = mem::listener();
    let server = Arc::new(Server::new(Arc::new(listener), negotiator(), echo_handler(), config).unwrap());
    let run = tokio::spawn({
        let server = server.clone();
        async move { server.run().await }
    });
    (server, run, dialer)
}

async fn client(connector: &Connector<Msg>, dialer: &MemoryConnector) -> Client<Msg> {
    let pipe = dialer.connect().await.unwrap();
    connector.client(Arc::new(pipe), None, None).await.unwrap()
}

// --- Test 1: Simple request/response ---

#[tokio::test]
async fn test_simple_request_response() {
    common::init_tracing();
    let config = ConnectionConfig::default().with_response_timeout(Duration::from_secs(1));
    let (server, run, dialer) = serve(config.clone());
    let connector = Connector::new(negotiator(), config).unwrap();
    let client = client(&connector, &dialer).await;

    let reply = tokio::time::timeout(Duration::from_secs(1), client.request(Msg::echo("hello")))
        .await
        .expect("reply within a second")
        .unwrap();
    assert_eq!(reply, Msg::echo("hello"));

    client.close().await.unwrap();
    server.shutdown().await;
    run.await.unwrap().unwrap();
}

// --- Test 2: Response timeout ---

#[tokio::test(start_paused = true)]
async fn test_response_timeout_keeps_connection_open() {
    common::init_tracing();
    let (server, _run, dialer) = serve(ConnectionConfig::default());
    let config = ConnectionConfig::default()
        .with_response_timeout(Duration::from_millis(100))
        .with_cleanup_interval(Duration::from_millis(50));
    let connector = Connector::new(negotiator(), config).unwrap();
    let client = client(&connector, &dialer).await;

    let started = Instant::now();
    let err = client.request(Msg::Sleep(2000)).await.unwrap_err();
    let waited = started.elapsed();
    assert!(matches!(err.kind(), ErrorKind::ResponseTimeout));
    assert!(err.is_timeout());
    assert!(waited >= Duration::from_millis(100), "{:?}", waited);
    assert!(waited <= Duration::from_millis(200), "{:?}", waited);

    // the reply lands long after the call gave up, and is dropped
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(client.state(), State::Running);
    assert_eq!(server.connection_count(), 1);
    assert_eq!(client.request(Msg::echo("after")).await.unwrap(), Msg::echo("after"));

    client.close().await.unwrap();
    server.shutdown().await;
}

// --- Test 3: Unexpected reply ---

#[tokio::test]
async fn test_unexpected_reply_terminates_connection() {
    common::init_tracing();
    let (local, remote) = mem::pipe();
    let connector = Connector::new(negotiator(), ConnectionConfig::default()).unwrap();

    let (ended_tx, ended_rx) = oneshot::channel();
    let on_disconnect: OnDisconnect = Box::new(move |error| {
        let _ = ended_tx.send(error);
    });
    let client = connector
        .client(Arc::new(local), None, Some(on_disconnect))
        .await
        .unwrap();

    let stray = common::encode(2, 12345, &Msg::echo("nobody asked"));
    remote.write_message(&stray, Duration::ZERO).await.unwrap();

    let error = ended_rx.await.unwrap().expect("connection failed");
    assert_eq!(error.category(), Category::Protocol);
    assert!(error.to_string().contains("unexpected reply"), "{}", error);
    assert_eq!(error.connection(), Some(client.id()));

    client.closed().await;
    assert_eq!(client.state(), State::Complete);
}

// --- Test 4: Shutdown during in-flight requests ---

#[tokio::test(start_paused = true)]
async fn test_close_fails_every_in_flight_request() {
    common::init_tracing();
    let (server, _run, dialer) = serve(ConnectionConfig::default().with_dispatch(Dispatch::Spawn));
    let connector = Connector::new(negotiator(), ConnectionConfig::default()).unwrap();
    let client = client(&connector, &dialer).await;

    let requests: Vec<_> = (0..10)
        .map(|_| {
            let client = client.clone();
            tokio::spawn(async move { client.request(Msg::Sleep(10_000)).await })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(10)).await;

    client.close().await.unwrap();
    for request in requests {
        let err = request.await.unwrap().unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Shutdown), "{}", err);
        assert!(err.is_temporary());
    }

    let err = client.close().await.unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::AlreadyClosed));
    assert!(err.to_string().contains("already closed"));

    server.shutdown().await;
}

// --- Test 5: Auto-reconnect ---

#[tokio::test(start_paused = true)]
async fn test_reconnector_survives_server_restart() {
    common::init_tracing();
    let config = ConnectionConfig::default();
    let (server, _run, dialer) = serve(config.clone().with_dispatch(Dispatch::Spawn));
    let target = Arc::new(Mutex::new(dialer));

    let connector = Connector::new(negotiator(), config.clone()).unwrap();
    let dial = dialer_fn({
        let target = target.clone();
        move |on_disconnect: OnDisconnect| -> BoxFuture<'static, neowire::Result<Client<Msg>>> {
            let dialer = target.lock().unwrap().clone();
            let connector = connector.clone();
            async move {
                let pipe = dialer.connect().await?;
                connector.client(Arc::new(pipe), None, Some(on_disconnect)).await
            }
            .boxed()
        }
    });
    let reconnector = Arc::new(Reconnector::new(dial, delay::constant(Duration::from_millis(100))));
    reconnector.dial().await.unwrap();
    let first = reconnector.id().unwrap();
    assert_eq!(reconnector.request(Msg::echo("one")).await.unwrap(), Msg::echo("one"));

    let in_flight = tokio::spawn({
        let reconnector = reconnector.clone();
        async move { reconnector.request(Msg::Sleep(60_000)).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    server.shutdown().await;
    let err = in_flight.await.unwrap().unwrap_err();
    assert!(
        matches!(err.category(), Category::Temporary | Category::Io),
        "{}",
        err
    );

    tokio::time::sleep(Duration::from_millis(500)).await;
    let (restarted, _run, dialer) = serve(config);
    *target.lock().unwrap() = dialer;

    let deadline = Instant::now() + Duration::from_secs(5);
    while reconnector.id() == Some(first) || reconnector.request(Msg::echo("probe")).await.is_err() {
        assert!(Instant::now() < deadline, "no reconnect");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_ne!(reconnector.id(), Some(first));
    assert_eq!(reconnector.request(Msg::echo("two")).await.unwrap(), Msg::echo("two"));

    reconnector.close().await.unwrap();
    reconnector.close().await.unwrap();
    let err = reconnector.request(Msg::echo("closed")).await.unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::NotRunning));

    restarted.shutdown().await;
}

// --- Test 6: Heartbeat-only liveness ---

fn heartbeat_config() -> ConnectionConfig {
    ConnectionConfig::default()
        .with_heartbeat(Duration::from_millis(200), Duration::from_millis(500))
        .with_read_timeout(Duration::from_secs(1))
}

#[tokio::test(start_paused = true)]
async fn test_heartbeats_keep_silent_link_alive() {
    common::init_tracing();
    let (a, b) = mem::pipe();
    let client = Connection::new(ConnectionId(1), Side::Client, heartbeat_config(), Arc::new(a), negotiator(), None).unwrap();
    let server = Connection::new(ConnectionId(2), Side::Server, heartbeat_config(), Arc::new(b), negotiator(), Some(echo_handler())).unwrap();
    let (ended_tx, mut ended) = tokio::sync::mpsc::unbounded_channel();
    client.start(ended_tx.clone()).await.unwrap();
    server.start(ended_tx).await.unwrap();

    for _ in 0..20 {
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(client.state(), State::Running);
        assert_eq!(server.state(), State::Running);
    }
    assert!(ended.try_recv().is_err());
    assert_eq!(client.request(Msg::echo("still alive")).await.unwrap(), Msg::echo("still alive"));
}

#[tokio::test(start_paused = true)]
async fn test_silent_peer_times_out() {
    common::init_tracing();
    let (a, _silent) = mem::pipe();
    let client = Connection::new(ConnectionId(1), Side::Client, heartbeat_config(), Arc::new(a), negotiator(), None).unwrap();
    let (ended_tx, mut ended) = tokio::sync::mpsc::unbounded_channel();
    client.start(ended_tx).await.unwrap();

    let started = Instant::now();
    let end = ended.recv().await.unwrap();
    let error = end.error.expect("timed out");
    assert!(matches!(error.kind(), ErrorKind::ReadTimeout), "{}", error);
    assert_eq!(error.category(), Category::Timeout);
    assert!(started.elapsed() <= Duration::from_millis(1600));
    assert_eq!(client.state(), State::Complete);
}

#[tokio::test(start_paused = true)]
async fn test_pongs_keep_pinging_side_alive() {
    common::init_tracing();
    let (a, b) = mem::pipe();
    let quiet = ConnectionConfig::default().with_heartbeat(Duration::ZERO, Duration::ZERO);
    let pinger = Connection::new(ConnectionId(1), Side::Client, heartbeat_config(), Arc::new(a), negotiator(), None).unwrap();
    let peer = Connection::new(ConnectionId(2), Side::Server, quiet, Arc::new(b), negotiator(), Some(echo_handler())).unwrap();
    let (ended_tx, mut ended) = tokio::sync::mpsc::unbounded_channel();
    pinger.start(ended_tx.clone()).await.unwrap();
    peer.start(ended_tx).await.unwrap();

    // only the pinger sends heartbeats; the answering pongs are all it hears
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(ended.try_recv().is_err());
    assert_eq!(pinger.state(), State::Running);
    assert_eq!(peer.state(), State::Running);
    assert_eq!(pinger.request(Msg::echo("pong fed")).await.unwrap(), Msg::echo("pong fed"));
}
