//! Client listener and pumps against an in-process registry

use async_trait::async_trait;
use burrow_auth::{StaticAuthenticator, UserEntry};
use burrow_client::{
    ClientConfig, ClientSession, ListenerStatus, LocalListener, PortForward, PumpSettings,
    TunnelClient,
};
use burrow_control::{RegistryConfig, TunnelRegistry};
use burrow_proto::{
    ConnectionId, ReadResponse, SessionId, SessionInfo, TunnelError, TunnelResult,
    TunnelService, VersionInfo,
};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

fn create_registry() -> Arc<TunnelRegistry> {
    let auth = StaticAuthenticator::new(vec![
        UserEntry::with_password("alice", "pw"),
        UserEntry::with_password("root", "secret").admin(),
    ]);
    Arc::new(TunnelRegistry::new(RegistryConfig::default(), Arc::new(auth)))
}

/// Failure injected by [`FlakyService`]
#[derive(Debug, Clone, Copy)]
enum Fault {
    /// The second Read that carries data is served, then its response lost
    LoseSecondReadResponse,
    /// The first Write is queued by the registry, then its response lost
    LoseFirstWriteResponse,
    /// The first `n` Writes fail before reaching the registry
    RefuseWrites(u32),
}

/// Registry wrapper that drops or refuses calls on the way
struct FlakyService {
    inner: Arc<TunnelRegistry>,
    fault: Fault,
    reads_with_data: AtomicU32,
    writes: AtomicU32,
}

impl FlakyService {
    fn new(inner: Arc<TunnelRegistry>, fault: Fault) -> Arc<Self> {
        Arc::new(Self {
            inner,
            fault,
            reads_with_data: AtomicU32::new(0),
            writes: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl TunnelService for FlakyService {
    async fn login(&self, username: &str, password: &str) -> TunnelResult<SessionId> {
        self.inner.login(username, password).await
    }

    async fn logout(&self, session_id: &str) -> TunnelResult<()> {
        self.inner.logout(session_id).await
    }

    async fn version(&self) -> TunnelResult<VersionInfo> {
        self.inner.version().await
    }

    async fn ping(&self) -> TunnelResult<()> {
        self.inner.ping().await
    }

    async fn connect(&self, session_id: &str, target: &str) -> TunnelResult<ConnectionId> {
        self.inner.connect(session_id, target).await
    }

    async fn disconnect(&self, session_id: &str, connection_id: ConnectionId) -> TunnelResult<()> {
        self.inner.disconnect(session_id, connection_id).await
    }

    async fn read(
        &self,
        session_id: &str,
        connection_id: ConnectionId,
    ) -> TunnelResult<ReadResponse> {
        let response = self.inner.read(session_id, connection_id).await?;
        if let Fault::LoseSecondReadResponse = self.fault {
            if !response.data.is_empty()
                && self.reads_with_data.fetch_add(1, Ordering::SeqCst) == 1
            {
                return Err(TunnelError::transport("response lost"));
            }
        }
        Ok(response)
    }

    async fn write(
        &self,
        session_id: &str,
        connection_id: ConnectionId,
        data: Bytes,
    ) -> TunnelResult<()> {
        let attempt = self.writes.fetch_add(1, Ordering::SeqCst);
        match self.fault {
            Fault::RefuseWrites(n) if attempt < n => {
                Err(TunnelError::not_sent("connection refused"))
            }
            Fault::LoseFirstWriteResponse if attempt == 0 => {
                self.inner.write(session_id, connection_id, data).await?;
                Err(TunnelError::transport("response lost"))
            }
            _ => self.inner.write(session_id, connection_id, data).await,
        }
    }

    async fn monitor(&self, session_id: &str) -> TunnelResult<Vec<SessionInfo>> {
        self.inner.monitor(session_id).await
    }

    async fn kill_session(&self, session_id: &str, target_session_id: &str) -> TunnelResult<()> {
        self.inner.kill_session(session_id, target_session_id).await
    }

    async fn kill_connection(
        &self,
        session_id: &str,
        target_session_id: &str,
        connection_id: ConnectionId,
    ) -> TunnelResult<()> {
        self.inner
            .kill_connection(session_id, target_session_id, connection_id)
            .await
    }
}

fn client_config(forwards: Vec<PortForward>) -> ClientConfig {
    let mut builder = ClientConfig::builder()
        .credentials("alice", "pw")
        .poll_interval(Duration::from_millis(5))
        .accept_poll_interval(Duration::from_millis(20));
    for forward in forwards {
        builder = builder.forward(forward);
    }
    builder.build().unwrap()
}

async fn spawn_echo_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr.to_string()
}

fn listening_addr(client: &TunnelClient, name: &str) -> SocketAddr {
    client
        .listener(name)
        .and_then(|l| l.local_addr())
        .expect("forward not listening")
}

/// Wait until the caller's own session shows `expected` connections
async fn wait_for_connections(registry: &TunnelRegistry, session_id: &str, expected: usize) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let sessions = registry.monitor(session_id).await.unwrap();
        if sessions[0].connections.len() == expected {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "expected {} connections, have {}",
            expected,
            sessions[0].connections.len()
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_full_path_echo_and_disconnect_on_local_close() {
    let registry = create_registry();
    let target = spawn_echo_server().await;
    let config = client_config(vec![PortForward::new("echo", 0, &target)]);
    let client = TunnelClient::start(config, registry.clone()).await.unwrap();
    let addr = listening_addr(&client, "echo");

    let mut local = TcpStream::connect(addr).await.unwrap();
    let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    local.write_all(&payload).await.unwrap();

    let mut echoed = vec![0u8; payload.len()];
    tokio::time::timeout(Duration::from_secs(10), local.read_exact(&mut echoed))
        .await
        .expect("echo timed out")
        .unwrap();
    assert_eq!(echoed, payload);

    let session_id = client.session().session_id();
    wait_for_connections(&registry, &session_id, 1).await;

    drop(local);
    wait_for_connections(&registry, &session_id, 0).await;

    client.shutdown().await.unwrap();
    assert_eq!(registry.session_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_remote_close_reaches_local_socket() {
    let registry = create_registry();

    let target_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target = target_listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        let (mut socket, _) = target_listener.accept().await.unwrap();
        let mut request = [0u8; 64];
        let _ = socket.read(&mut request).await;
        socket
            .write_all(b"HTTP/1.0 200 OK\r\n\r\ndone")
            .await
            .unwrap();
    });

    let config = client_config(vec![PortForward::new("web", 0, &target)]);
    let client = TunnelClient::start(config, registry.clone()).await.unwrap();
    let addr = listening_addr(&client, "web");

    let mut local = TcpStream::connect(addr).await.unwrap();
    local.write_all(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();

    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), local.read_to_end(&mut response))
        .await
        .expect("local socket never closed")
        .unwrap();
    assert!(response.starts_with(b"HTTP/1.0 200 OK"));
    assert!(response.ends_with(b"done"));

    wait_for_connections(&registry, &client.session().session_id(), 0).await;
    client.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unreachable_target_closes_local_socket() {
    let registry = create_registry();
    let config = client_config(vec![PortForward::new("dead", 0, "127.0.0.1:1")]);
    let client = TunnelClient::start(config, registry.clone()).await.unwrap();
    let addr = listening_addr(&client, "dead");

    let mut local = TcpStream::connect(addr).await.unwrap();
    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(Duration::from_secs(5), local.read(&mut buf))
        .await
        .expect("local socket never closed")
        .unwrap_or(0);
    assert_eq!(n, 0);

    // The listener survives the failure
    assert!(matches!(
        client.listeners()[0].1,
        ListenerStatus::Listening(_)
    ));
    client.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_occupied_port_disables_only_that_forward() {
    let registry = create_registry();
    let target = spawn_echo_server().await;
    let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = occupied.local_addr().unwrap().port();

    let config = client_config(vec![
        PortForward::new("taken", port, &target),
        PortForward::new("free", 0, &target),
    ]);
    let client = TunnelClient::start(config, registry.clone()).await.unwrap();

    let statuses = client.listeners();
    assert!(matches!(statuses[0].1, ListenerStatus::Disabled(_)));
    assert!(matches!(statuses[1].1, ListenerStatus::Listening(_)));

    // Still disabled later on: binding is never retried
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(matches!(
        client.listener("taken").unwrap().status(),
        ListenerStatus::Disabled(_)
    ));

    client.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_listener_stop_is_prompt() {
    let registry = create_registry();
    let session = ClientSession::open(registry.clone(), "alice", "pw")
        .await
        .unwrap();
    let settings = PumpSettings {
        poll_interval: Duration::from_millis(5),
        max_transport_retries: 3,
    };
    let accept_poll_interval = Duration::from_millis(50);

    let mut listener = LocalListener::start(
        PortForward::new("idle", 0, "127.0.0.1:9"),
        session,
        settings,
        accept_poll_interval,
        CancellationToken::new(),
    )
    .await;
    let addr = listener.local_addr().unwrap();

    let started = Instant::now();
    listener.stop().await;
    assert!(started.elapsed() < accept_poll_interval * 4);
    assert_eq!(listener.status(), ListenerStatus::Stopped);

    // Port released
    TcpListener::bind(addr).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_relogin_after_session_killed() {
    let registry = create_registry();
    let target = spawn_echo_server().await;
    let config = client_config(vec![PortForward::new("echo", 0, &target)]);
    let client = TunnelClient::start(config, registry.clone()).await.unwrap();
    let addr = listening_addr(&client, "echo");

    let first_session = client.session().session_id();
    let root = registry.login("root", "secret").await.unwrap();
    registry.kill_session(&root, &first_session).await.unwrap();

    let mut local = TcpStream::connect(addr).await.unwrap();
    local.write_all(b"again").await.unwrap();
    let mut echoed = [0u8; 5];
    tokio::time::timeout(Duration::from_secs(5), local.read_exact(&mut echoed))
        .await
        .expect("echo timed out")
        .unwrap();
    assert_eq!(&echoed, b"again");
    assert_ne!(client.session().session_id(), first_session);

    drop(local);
    client.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_kill_connection_closes_local_socket() {
    let registry = create_registry();
    let target = spawn_echo_server().await;
    let config = client_config(vec![PortForward::new("echo", 0, &target)]);
    let client = TunnelClient::start(config, registry.clone()).await.unwrap();
    let addr = listening_addr(&client, "echo");

    let mut local = TcpStream::connect(addr).await.unwrap();
    local.write_all(b"ping").await.unwrap();
    let mut echoed = [0u8; 4];
    tokio::time::timeout(Duration::from_secs(5), local.read_exact(&mut echoed))
        .await
        .expect("echo timed out")
        .unwrap();

    let session_id = client.session().session_id();
    let root = registry.login("root", "secret").await.unwrap();
    registry.kill_connection(&root, &session_id, 1).await.unwrap();

    let mut rest = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), local.read_to_end(&mut rest))
        .await
        .expect("local socket never closed")
        .unwrap_or_default();
    assert!(rest.is_empty());

    client.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_lost_read_response_truncates_instead_of_skipping() {
    let registry = create_registry();
    let target_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target = target_listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        let (mut socket, _) = target_listener.accept().await.unwrap();
        for part in [b"AAAA", b"BBBB", b"CCCC"] {
            socket.write_all(part).await.unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
    });

    let service = FlakyService::new(registry.clone(), Fault::LoseSecondReadResponse);
    let config = client_config(vec![PortForward::new("lossy", 0, &target)]);
    let client = TunnelClient::start(config, service).await.unwrap();
    let addr = listening_addr(&client, "lossy");

    let mut local = TcpStream::connect(addr).await.unwrap();
    let mut received = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), local.read_to_end(&mut received))
        .await
        .expect("local socket never closed")
        .unwrap_or_default();

    // Whatever arrived is an unbroken prefix of what the target sent
    assert!(
        b"AAAABBBBCCCC".starts_with(&received),
        "stream has a gap: {:?}",
        String::from_utf8_lossy(&received)
    );
    assert!(received.len() < 12);
    wait_for_connections(&registry, &client.session().session_id(), 0).await;
    client.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_lost_write_response_never_duplicates() {
    let registry = create_registry();
    let target_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target = target_listener.local_addr().unwrap().to_string();
    let (tx, rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let (mut socket, _) = target_listener.accept().await.unwrap();
        let mut received = Vec::new();
        let _ = socket.read_to_end(&mut received).await;
        let _ = tx.send(received);
    });

    let service = FlakyService::new(registry.clone(), Fault::LoseFirstWriteResponse);
    let config = client_config(vec![PortForward::new("lossy", 0, &target)]);
    let client = TunnelClient::start(config, service).await.unwrap();
    let addr = listening_addr(&client, "lossy");

    let mut local = TcpStream::connect(addr).await.unwrap();
    local.write_all(b"hello").await.unwrap();

    let received = tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .expect("target never saw end of stream")
        .unwrap();
    assert_eq!(received, b"hello");

    drop(local);
    client.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unsent_write_is_repeated() {
    let registry = create_registry();
    let target = spawn_echo_server().await;
    let service = FlakyService::new(registry.clone(), Fault::RefuseWrites(2));
    let config = client_config(vec![PortForward::new("echo", 0, &target)]);
    let client = TunnelClient::start(config, service).await.unwrap();
    let addr = listening_addr(&client, "echo");

    let mut local = TcpStream::connect(addr).await.unwrap();
    local.write_all(b"ping").await.unwrap();
    let mut echoed = [0u8; 4];
    tokio::time::timeout(Duration::from_secs(5), local.read_exact(&mut echoed))
        .await
        .expect("echo timed out")
        .unwrap();
    assert_eq!(&echoed, b"ping");

    drop(local);
    client.shutdown().await.unwrap();
}
