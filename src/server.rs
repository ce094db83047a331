//! Relay Server
//!
//! Accepts TLS connections, keeps the nickname directory and forwards
//! KEY/MSG lines verbatim by recipient. The relay never decrypts anything.
//!
//! Lifecycle: `Created -> Starting -> Accepting -> Draining -> Stopped`.
//! Both [`RelayServer::start`] and [`RelayServer::stop`] are idempotent.

use parking_lot::Mutex;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::{JoinHandle, JoinSet};
use tokio_rustls::TlsAcceptor;
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::directory::{ConnectionId, Directory, Outbound, SessionHandle};
use crate::discovery;
use crate::protocol::{validate_nickname, Frame, LineReader, BROADCAST};
use crate::tls::{self, TlsError};

/// A client that has not finished the TLS handshake by then is dropped
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long draining waits for connection workers before aborting them
const DRAIN_GRACE: Duration = Duration::from_millis(500);

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),
    #[error("Relay has already been stopped")]
    AlreadyStopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerPhase {
    Created,
    Starting,
    Accepting,
    Draining,
    Stopped,
}

pub struct RelayServer {
    config: ServerConfig,
    acceptor: TlsAcceptor,
    directory: Directory,
    phase: Mutex<ServerPhase>,
    shutdown: watch::Sender<bool>,
    bound: watch::Sender<Option<SocketAddr>>,
    stopped: watch::Sender<bool>,
}

enum StartAction {
    Bind,
    AwaitPort,
    Running(Option<SocketAddr>),
}

impl RelayServer {
    pub fn new(config: ServerConfig, acceptor: TlsAcceptor) -> Arc<Self> {
        Arc::new(Self {
            config,
            acceptor,
            directory: Directory::new(),
            phase: Mutex::new(ServerPhase::Created),
            shutdown: watch::channel(false).0,
            bound: watch::channel(None).0,
            stopped: watch::channel(false).0,
        })
    }

    /// Build the TLS context from the configured certificate source
    pub fn from_config(config: ServerConfig) -> Result<Arc<Self>, ServerError> {
        let acceptor = tls::server_acceptor(config.certificate_provider().as_ref())?;
        Ok(Self::new(config, acceptor))
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    pub fn phase(&self) -> ServerPhase {
        *self.phase.lock()
    }

    pub fn bound_addr(&self) -> Option<SocketAddr> {
        *self.bound.borrow()
    }

    /// Bind the listener and begin accepting. Returns the bound address;
    /// calling it again while running returns the same address.
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr, ServerError> {
        let action = {
            let mut phase = self.phase.lock();
            match *phase {
                ServerPhase::Created => {
                    *phase = ServerPhase::Starting;
                    StartAction::Bind
                }
                ServerPhase::Starting => StartAction::AwaitPort,
                ServerPhase::Accepting => StartAction::Running(self.bound_addr()),
                ServerPhase::Draining | ServerPhase::Stopped => {
                    return Err(ServerError::AlreadyStopped)
                }
            }
        };

        match action {
            StartAction::Running(Some(addr)) => return Ok(addr),
            StartAction::Running(None) | StartAction::AwaitPort => {
                return self.wait_for_port().await.ok_or(ServerError::AlreadyStopped)
            }
            StartAction::Bind => {}
        }

        let addr = self.config.bind_addr();
        let listener = match TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(source) => {
                log::error!("Failed to bind relay on {}: {}", addr, source);
                self.mark_stopped();
                return Err(ServerError::Bind { addr, source });
            }
        };
        let local = match listener.local_addr() {
            Ok(local) => local,
            Err(e) => {
                self.mark_stopped();
                return Err(e.into());
            }
        };

        {
            let mut phase = self.phase.lock();
            // a stop request during bind leaves us Draining; the accept loop
            // will see the shutdown flag and finish the job
            if *phase == ServerPhase::Starting {
                *phase = ServerPhase::Accepting;
            }
        }
        self.bound.send_replace(Some(local));
        log::info!("Relay listening on {}", local);

        let server = Arc::clone(self);
        tokio::spawn(async move { server.accept_loop(listener, local).await });
        Ok(local)
    }

    /// Resolves with the bound address once listening, or with whatever is
    /// known once the relay has stopped (`None` if it never bound).
    pub async fn wait_for_port(&self) -> Option<SocketAddr> {
        let mut bound = self.bound.subscribe();
        let mut stopped = self.stopped.subscribe();
        tokio::select! {
            addr = bound.wait_for(|a| a.is_some()) => addr.ok().and_then(|a| *a),
            _ = wait_flag(&mut stopped) => self.bound_addr(),
        }
    }

    /// Ask the relay to drain without waiting for it
    pub fn request_stop(&self) {
        let mut phase = self.phase.lock();
        match *phase {
            ServerPhase::Created => {
                *phase = ServerPhase::Stopped;
                drop(phase);
                self.stopped.send_replace(true);
                log::info!("Relay stopped before it was started");
            }
            ServerPhase::Starting | ServerPhase::Accepting => {
                *phase = ServerPhase::Draining;
                drop(phase);
                log::info!("Relay draining");
                self.shutdown.send_replace(true);
            }
            ServerPhase::Draining | ServerPhase::Stopped => {}
        }
    }

    /// Stop and wait until every connection is closed
    pub async fn stop(&self) {
        self.request_stop();
        self.wait_stopped().await;
    }

    pub async fn wait_stopped(&self) {
        let mut stopped = self.stopped.subscribe();
        wait_flag(&mut stopped).await;
    }

    fn mark_stopped(&self) {
        *self.phase.lock() = ServerPhase::Stopped;
        self.stopped.send_replace(true);
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, local: SocketAddr) {
        let mut shutdown = self.shutdown.subscribe();
        let mut workers = JoinSet::new();
        let broadcaster = self.spawn_discovery(local.port());

        loop {
            tokio::select! {
                _ = wait_flag(&mut shutdown) => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let server = Arc::clone(&self);
                        workers.spawn(async move { server.handle_connection(stream, peer).await });
                    }
                    Err(e) => {
                        log::warn!("Accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                },
                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            log::error!("Connection worker panicked: {}", e);
                        }
                    }
                }
            }
        }

        drop(listener);
        let sessions = self.directory.drain();
        log::info!("Closing {} session(s)", sessions.len());
        for session in &sessions {
            session.close();
        }

        let joined = tokio::time::timeout(DRAIN_GRACE, async {
            while workers.join_next().await.is_some() {}
        })
        .await;
        if joined.is_err() {
            log::warn!(
                "{} connection worker(s) still running after {:?}, aborting",
                workers.len(),
                DRAIN_GRACE
            );
            workers.shutdown().await;
        }

        if let Some(handle) = broadcaster {
            handle.abort();
            let _ = handle.await;
        }

        self.mark_stopped();
        log::info!("Relay stopped");
    }

    fn spawn_discovery(&self, bound_port: u16) -> Option<JoinHandle<()>> {
        if !self.config.discovery {
            return None;
        }
        let target = SocketAddrV4::new(self.config.discovery_addr, self.config.discovery_port);
        let interval = self.config.discovery_interval();
        let shutdown = self.shutdown.subscribe();
        Some(tokio::spawn(async move {
            if let Err(e) = discovery::run_broadcaster(target, bound_port, interval, shutdown).await {
                log::warn!("Discovery broadcast unavailable: {}", e);
            }
        }))
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let tls = match tokio::time::timeout(HANDSHAKE_TIMEOUT, self.acceptor.accept(stream)).await
        {
            Ok(Ok(tls)) => tls,
            Ok(Err(e)) => {
                log::warn!("TLS handshake failed for {}: {}", peer, e);
                return;
            }
            Err(_) => {
                log::warn!("TLS handshake with {} timed out", peer);
                return;
            }
        };

        let connection_id = Uuid::new_v4();
        log::info!("New TLS connection {} from {}", connection_id, peer);

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let closer = Arc::new(Notify::new());
        let (read_half, write_half) = tokio::io::split(tls);

        let reader = async {
            self.read_lines(read_half, connection_id, &outbound_tx, &closer)
                .await;
            let _ = outbound_tx.send(Outbound::Close);
        };
        let writer = write_lines(write_half, outbound_rx, Arc::clone(&closer));
        tokio::join!(reader, writer);

        let removed = self.directory.remove_connection(connection_id);
        log::info!(
            "Connection {} from {} closed{}",
            connection_id,
            peer,
            if removed.is_empty() {
                String::new()
            } else {
                format!(" ({})", removed.join(","))
            }
        );
        if !removed.is_empty() {
            self.broadcast_peers();
        }

        if self.config.auto_shutdown
            && self.directory.is_empty()
            && self.directory.has_had_clients()
        {
            log::info!("Last client left, shutting down");
            self.request_stop();
        }
    }

    async fn read_lines<R>(
        &self,
        read_half: R,
        connection_id: ConnectionId,
        outbound: &mpsc::UnboundedSender<Outbound>,
        closer: &Arc<Notify>,
    ) where
        R: AsyncRead + Unpin,
    {
        let mut lines = LineReader::new(read_half);
        let mut shutdown = self.shutdown.subscribe();

        loop {
            let next = tokio::select! {
                _ = closer.notified() => break,
                _ = wait_flag(&mut shutdown) => break,
                next = lines.next_line() => next,
            };
            match next {
                Ok(Some(line)) => self.dispatch(connection_id, outbound, closer, &line),
                Ok(None) => break,
                Err(e) => {
                    log::debug!("Read error on {}: {}", connection_id, e);
                    break;
                }
            }
        }
    }

    fn dispatch(
        &self,
        connection_id: ConnectionId,
        outbound: &mpsc::UnboundedSender<Outbound>,
        closer: &Arc<Notify>,
        line: &str,
    ) {
        match Frame::parse(line) {
            Frame::Register { nick, .. } => {
                if let Err(e) = validate_nickname(&nick) {
                    log::debug!("Dropping REGISTER on {}: {}", connection_id, e);
                    return;
                }
                let session =
                    SessionHandle::new(connection_id, nick.clone(), outbound.clone(), closer.clone());
                for displaced in self.directory.register(session) {
                    log::info!(
                        "{} registered again, closing connection {}",
                        nick,
                        displaced.connection_id
                    );
                    displaced.close();
                }
                log::info!("{} registered on connection {}", nick, connection_id);
                self.broadcast_peers();
            }
            Frame::Key { from, to, .. } | Frame::Msg { from, to, .. } => {
                self.route(&from, &to, line)
            }
            Frame::Peers { .. } => {
                log::debug!("Ignoring PEERS sent by connection {}", connection_id)
            }
            Frame::Unrecognized(raw) => {
                log::debug!("Dropping unrecognized line on {}: {:?}", connection_id, raw)
            }
        }
    }

    fn route(&self, from: &str, to: &str, line: &str) {
        let line: Arc<str> = Arc::from(line);
        if to == BROADCAST {
            for session in self.directory.snapshot() {
                if session.nick != from {
                    session.send_line(Arc::clone(&line));
                }
            }
        } else if let Some(session) = self.directory.get(to) {
            session.send_line(line);
        } else {
            log::debug!("No session for {}, dropping line from {}", to, from);
        }
    }

    fn broadcast_peers(&self) {
        let sessions = self.directory.snapshot();
        let nicks = sessions.iter().map(|s| s.nick.clone()).collect();
        let line: Arc<str> = Arc::from(Frame::Peers { nicks }.to_line());
        for session in &sessions {
            session.send_line(Arc::clone(&line));
        }
    }
}

async fn wait_flag(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|set| *set).await;
}

async fn write_lines<W>(
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    closer: Arc<Notify>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(item) = outbound.recv().await {
        let line = match item {
            Outbound::Line(line) => line,
            Outbound::Close => break,
        };
        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');
        let written = async {
            writer.write_all(&buf).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = written {
            log::debug!("Write failed: {}", e);
            closer.notify_one();
            break;
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_config(dir: &std::path::Path) -> ServerConfig {
        ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            discovery: false,
            certfile: dir.join("cert.pem"),
            keyfile: dir.join("key.pem"),
            ..ServerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let server = RelayServer::from_config(local_config(dir.path())).unwrap();
        assert_eq!(server.phase(), ServerPhase::Created);

        let first = server.start().await.unwrap();
        let second = server.start().await.unwrap();
        assert_eq!(first, second);
        assert_ne!(first.port(), 0);
        assert_eq!(server.phase(), ServerPhase::Accepting);
        assert_eq!(server.wait_for_port().await, Some(first));

        server.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let server = RelayServer::from_config(local_config(dir.path())).unwrap();
        server.start().await.unwrap();

        server.stop().await;
        assert_eq!(server.phase(), ServerPhase::Stopped);
        server.stop().await;
        assert_eq!(server.phase(), ServerPhase::Stopped);

        assert!(matches!(
            server.start().await,
            Err(ServerError::AlreadyStopped)
        ));
    }

    #[tokio::test]
    async fn test_stop_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let server = RelayServer::from_config(local_config(dir.path())).unwrap();
        server.stop().await;
        assert_eq!(server.phase(), ServerPhase::Stopped);
        assert_eq!(server.wait_for_port().await, None);
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let holder = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let taken = holder.local_addr().unwrap().port();

        let config = ServerConfig {
            port: taken,
            ..local_config(dir.path())
        };
        let server = RelayServer::from_config(config).unwrap();
        assert!(matches!(server.start().await, Err(ServerError::Bind { .. })));
        assert_eq!(server.phase(), ServerPhase::Stopped);
    }

    #[tokio::test]
    async fn test_wait_for_port_from_another_task() {
        let dir = tempfile::tempdir().unwrap();
        let server = RelayServer::from_config(local_config(dir.path())).unwrap();

        let waiter = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.wait_for_port().await })
        };
        let addr = server.start().await.unwrap();
        assert_eq!(waiter.await.unwrap(), Some(addr));

        server.stop().await;
    }
}
