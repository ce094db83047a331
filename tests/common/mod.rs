#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::client::TlsStream;

use ghostcat::{tls, ClientTrust, ConnectOptions, CryptoContext, PeerConnection, RelayServer, ServerConfig};

pub const STEP: Duration = Duration::from_secs(3);

pub struct TestRelay {
    pub server: Arc<RelayServer>,
    pub addr: SocketAddr,
    _dir: TempDir,
}

pub async fn start_relay(auto_shutdown: bool) -> TestRelay {
    start_relay_with(|config| config.auto_shutdown = auto_shutdown).await
}

/// Loopback relay with temp certificates, adjusted by `customize`
pub async fn start_relay_with(customize: impl FnOnce(&mut ServerConfig)) -> TestRelay {
    let dir = tempfile::tempdir().unwrap();
    let mut config = ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        discovery: false,
        certfile: dir.path().join("cert.pem"),
        keyfile: dir.path().join("key.pem"),
        ..ServerConfig::default()
    };
    customize(&mut config);
    let server = RelayServer::from_config(config).unwrap();
    let addr = server.start().await.unwrap();
    TestRelay {
        server,
        addr,
        _dir: dir,
    }
}

pub fn options() -> ConnectOptions {
    ConnectOptions {
        connect_timeout: Duration::from_secs(2),
        ..ConnectOptions::new(ClientTrust::AcceptAnyServerCertificate)
    }
}

pub struct TestClient {
    pub conn: Arc<PeerConnection>,
    pub lines: mpsc::UnboundedReceiver<String>,
}

/// Connect without registering
pub async fn connect(relay: &TestRelay, nick: &str) -> TestClient {
    let (tx, lines) = mpsc::unbounded_channel();
    let handler = move |line: &str| {
        let _ = tx.send(line.to_string());
    };
    let conn = PeerConnection::connect(nick, "127.0.0.1", relay.addr.port(), &options(), Arc::new(handler))
        .await
        .unwrap();
    TestClient {
        conn: Arc::new(conn),
        lines,
    }
}

/// Bare TLS stream to the relay, for writing bytes no client would send
pub async fn raw_tls(relay: &TestRelay) -> TlsStream<TcpStream> {
    let tcp = TcpStream::connect(("127.0.0.1", relay.addr.port())).await.unwrap();
    tls::client_connector(ClientTrust::AcceptAnyServerCertificate)
        .connect(tls::server_name("127.0.0.1").unwrap(), tcp)
        .await
        .unwrap()
}

/// Connect and register under a throwaway identity; returns once the
/// relay has acknowledged the registration with a PEERS line naming us
pub async fn register(relay: &TestRelay, nick: &str) -> TestClient {
    let mut client = connect(relay, nick).await;
    let identity = CryptoContext::new().unwrap();
    client.conn.send_register(&identity.public_key_base64()).unwrap();
    loop {
        let line = client.next_line().await.expect("connection closed while registering");
        if line.starts_with("PEERS|") && line[6..].split(',').any(|n| n == nick) {
            return client;
        }
    }
}

impl TestClient {
    /// Next inbound line, `None` once the connection is gone
    pub async fn next_line(&mut self) -> Option<String> {
        tokio::time::timeout(STEP, self.lines.recv())
            .await
            .expect("timed out waiting for a line")
    }

    /// Skip PEERS lines until exactly `expected` arrives
    pub async fn expect_peers(&mut self, expected: &str) {
        loop {
            let line = self.next_line().await.expect("connection closed");
            if line == expected {
                return;
            }
            assert!(line.starts_with("PEERS|"), "unexpected line {:?}", line);
        }
    }

    pub async fn assert_silent(&mut self, window: Duration) {
        if let Ok(line) = tokio::time::timeout(window, self.lines.recv()).await {
            panic!("expected silence, got {:?}", line);
        }
    }

    /// Wait for the relay to hang up
    pub async fn expect_closed(&mut self) {
        while self.next_line().await.is_some() {}
    }
}
