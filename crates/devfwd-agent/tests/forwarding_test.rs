//! End-to-end tests of the agent over the in-memory transport

use async_trait::async_trait;
use devfwd_agent::{Agent, AgentConfig, Endpoint, ListenQuery, ListenSnapshot, QueryError};
use devfwd_transport::mock::MemoryTransport;
use devfwd_transport::TransportError;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Query whose answer the test changes between polls
#[derive(Clone, Default)]
struct SharedQuery {
    current: Arc<Mutex<Option<ListenSnapshot>>>,
}

impl SharedQuery {
    fn set(&self, ports: &[u16]) {
        let endpoints: Vec<Endpoint> = ports
            .iter()
            .map(|p| Endpoint::new(Ipv4Addr::UNSPECIFIED, *p))
            .collect();
        self.set_endpoints(&endpoints);
    }

    fn set_endpoints(&self, endpoints: &[Endpoint]) {
        *self.current.lock().unwrap() = Some(endpoints.iter().copied().collect());
    }

    fn fail(&self) {
        *self.current.lock().unwrap() = None;
    }
}

#[async_trait]
impl ListenQuery for SharedQuery {
    async fn list_bound_endpoints(&mut self) -> Result<ListenSnapshot, QueryError> {
        self.current
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| QueryError::Parse("scripted failure".to_string()))
    }
}

struct Harness {
    transport: Arc<MemoryTransport>,
    query: SharedQuery,
    cancel: CancellationToken,
    task: JoinHandle<Result<(), devfwd_agent::AgentError>>,
}

fn start(initial: &[u16]) -> Harness {
    start_with(initial, MemoryTransport::new())
}

fn start_with(initial: &[u16], transport: MemoryTransport) -> Harness {
    let transport = Arc::new(transport);
    let query = SharedQuery::default();
    query.set(initial);

    let config = AgentConfig {
        poll_interval: Duration::from_millis(10),
        ..Default::default()
    };
    let cancel = CancellationToken::new();
    let agent = Agent::new(transport.clone(), query.clone(), config);
    let task = tokio::spawn(agent.run(cancel.clone()));

    Harness {
        transport,
        query,
        cancel,
        task,
    }
}

async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let reached = tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "timed out waiting for {}", what);
}

async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn test_added_port_opens_remote_listener() {
    let h = start(&[8080]);

    wait_until("listener on 8080", || h.transport.is_listening(8080)).await;
    assert_eq!(h.transport.open_count(8080), 1);

    h.cancel.cancel();
    assert!(h.task.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_removed_port_closes_listener_and_connections() {
    let local = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = local.local_addr().unwrap().port();
    let h = start(&[port]);

    wait_until("listener", || h.transport.is_listening(port)).await;

    // Relay one connection that stays open
    let mut peer = h.transport.connect(port).unwrap();
    let (mut service, _) = local.accept().await.unwrap();
    peer.write_all(b"hi").await.unwrap();
    let mut buf = [0u8; 2];
    service.read_exact(&mut buf).await.unwrap();

    h.query.set(&[]);
    wait_until("listener closed", || !h.transport.is_listening(port)).await;

    assert!(matches!(
        h.transport.connect(port),
        Err(TransportError::ListenerClosed)
    ));

    // The in-flight relay is torn down with its session
    let mut rest = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(5), peer.read_to_end(&mut rest)).await;
    assert!(read.is_ok(), "relay was not drained");

    h.cancel.cancel();
    assert!(h.task.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_listen_failure_does_not_block_sibling() {
    let transport = MemoryTransport::new();
    transport.fail_listen(4000);
    let h = start_with(&[4000, 4001], transport);

    wait_until("listener on 4001", || h.transport.is_listening(4001)).await;
    assert!(!h.transport.is_listening(4000));

    h.cancel.cancel();
    assert!(h.task.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_dial_failure_keeps_session_alive() {
    let port = free_port().await;
    let h = start(&[port]);
    wait_until("listener", || h.transport.is_listening(port)).await;

    // Nothing listens locally yet: the inbound connection is dropped
    let mut peer = h.transport.connect(port).unwrap();
    let mut buf = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(5), peer.read_to_end(&mut buf)).await;
    assert!(read.is_ok(), "inbound connection was not closed");
    assert!(h.transport.is_listening(port));

    let local = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = local.accept().await.unwrap();
        socket.write_all(b"served").await.unwrap();
    });

    let mut peer = h.transport.connect(port).unwrap();
    let mut buf = [0u8; 6];
    peer.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"served");

    h.cancel.cancel();
    assert!(h.task.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_cancel_stops_every_session() {
    let h = start(&[5000, 5001, 5002]);
    wait_until("all listeners", || h.transport.listening_ports().len() == 3).await;

    h.cancel.cancel();
    let result = tokio::time::timeout(Duration::from_secs(5), h.task)
        .await
        .expect("agent did not stop")
        .unwrap();

    assert!(result.is_ok());
    assert!(h.transport.listening_ports().is_empty());
}

#[tokio::test]
async fn test_query_failure_stops_agent() {
    let h = start(&[6000]);
    wait_until("listener", || h.transport.is_listening(6000)).await;

    h.query.fail();
    let result = tokio::time::timeout(Duration::from_secs(5), h.task)
        .await
        .expect("agent did not stop")
        .unwrap();

    assert!(matches!(result, Err(devfwd_agent::AgentError::Query(_))));
    assert!(h.transport.listening_ports().is_empty());
}

#[tokio::test]
async fn test_port_readded_after_removal() {
    let h = start(&[7000]);
    wait_until("first listener", || h.transport.is_listening(7000)).await;

    h.query.set(&[]);
    wait_until("listener closed", || !h.transport.is_listening(7000)).await;

    h.query.set(&[7000]);
    wait_until("second listener", || h.transport.open_count(7000) == 2).await;
    assert!(h.transport.is_listening(7000));

    h.cancel.cancel();
    assert!(h.task.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_port_stays_forwarded_while_any_family_listens() {
    let v4 = Endpoint::new(Ipv4Addr::UNSPECIFIED, 8080);
    let v6 = Endpoint::new(Ipv6Addr::UNSPECIFIED, 8080);
    let h = start(&[]);
    h.query.set_endpoints(&[v4, v6]);

    wait_until("listener on 8080", || h.transport.is_listening(8080)).await;

    h.query.set_endpoints(&[v6]);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(h.transport.is_listening(8080));
    assert_eq!(h.transport.open_count(8080), 1);

    h.query.set_endpoints(&[]);
    wait_until("listener closed", || !h.transport.is_listening(8080)).await;

    h.cancel.cancel();
    assert!(h.task.await.unwrap().is_ok());
}
