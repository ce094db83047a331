//! Peer Connection
//!
//! Client side of the relay link: a TLS session, one reader task feeding a
//! caller-supplied [`LineHandler`], and one writer task so lines from
//! concurrent senders never interleave.

use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::ClientConfig;
use crate::discovery::{self, DISCOVERY_PORT};
use crate::protocol::{validate_nickname, Frame, LineReader, ProtocolError};
use crate::tls::{self, ClientTrust};

/// Upper bound on how long [`PeerConnection::close`] waits for each task
pub const CLOSE_GRACE: Duration = Duration::from_millis(500);

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(4);

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Connection to {addr} failed: {reason}")]
    Connect { addr: String, reason: String },
    #[error("Not connected")]
    NotConnected,
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Receives every inbound line, once, in arrival order
pub trait LineHandler: Send + Sync + 'static {
    fn on_line(&self, line: &str);
}

impl<F> LineHandler for F
where
    F: Fn(&str) + Send + Sync + 'static,
{
    fn on_line(&self, line: &str) {
        self(line)
    }
}

/// How to reach and trust a relay. There is no `Default`: the trust
/// policy is always chosen by the caller.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub trust: ClientTrust,
    pub connect_timeout: Duration,
    pub discovery_port: u16,
    pub close_grace: Duration,
}

impl ConnectOptions {
    pub fn new(trust: ClientTrust) -> Self {
        Self {
            trust,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            discovery_port: DISCOVERY_PORT,
            close_grace: CLOSE_GRACE,
        }
    }
}

impl From<&ClientConfig> for ConnectOptions {
    fn from(config: &ClientConfig) -> Self {
        Self {
            trust: config.trust(),
            connect_timeout: config.connect_timeout(),
            discovery_port: config.discovery_port,
            close_grace: CLOSE_GRACE,
        }
    }
}

pub struct PeerConnection {
    nick: String,
    remote: SocketAddr,
    outbound: mpsc::UnboundedSender<String>,
    stop: Arc<watch::Sender<bool>>,
    joined: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    close_grace: Duration,
}

impl PeerConnection {
    /// Connect and complete the TLS handshake within `options.connect_timeout`.
    /// The reader starts only after the handshake succeeded.
    pub async fn connect(
        nick: &str,
        host: &str,
        port: u16,
        options: &ConnectOptions,
        handler: Arc<dyn LineHandler>,
    ) -> Result<Self, ClientError> {
        validate_nickname(nick)?;
        let addr = format!("{}:{}", host, port);
        let connect_err = |reason: String| ClientError::Connect {
            addr: addr.clone(),
            reason,
        };

        let server_name = tls::server_name(host).map_err(|e| connect_err(e.to_string()))?;
        let connector = tls::client_connector(options.trust);
        let attempt = async {
            let tcp = TcpStream::connect((host, port)).await?;
            tcp.set_nodelay(true)?;
            connector.connect(server_name, tcp).await
        };

        let stream = match tokio::time::timeout(options.connect_timeout, attempt).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(connect_err(e.to_string())),
            Err(_) => {
                return Err(connect_err(format!(
                    "TLS connect timed out after {:?}",
                    options.connect_timeout
                )))
            }
        };
        let remote = stream
            .get_ref()
            .0
            .peer_addr()
            .map_err(|e| connect_err(e.to_string()))?;
        log::info!("Connected to relay {} as {}", remote, nick);

        let (read_half, write_half) = tokio::io::split(stream);
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let stop = Arc::new(watch::channel(false).0);

        let reader = tokio::spawn(read_loop(read_half, handler, Arc::clone(&stop)));
        let writer = tokio::spawn(write_loop(write_half, outbound_rx, Arc::clone(&stop)));

        Ok(Self {
            nick: nick.to_string(),
            remote,
            outbound,
            stop,
            joined: watch::channel(false).0,
            tasks: Mutex::new(vec![reader, writer]),
            close_grace: options.close_grace,
        })
    }

    /// Wait up to `discovery_timeout` for a relay announcement and connect
    /// to it; with no announcement, connect to `127.0.0.1:default_port`.
    pub async fn discover_and_connect(
        nick: &str,
        default_port: u16,
        discovery_timeout: Duration,
        options: &ConnectOptions,
        handler: Arc<dyn LineHandler>,
    ) -> Result<Self, ClientError> {
        let announced = match discovery::listen_once(options.discovery_port, discovery_timeout)
            .await
        {
            Ok(found) => found,
            Err(e) => {
                log::warn!(
                    "Discovery listener unavailable on UDP {}: {}",
                    options.discovery_port,
                    e
                );
                None
            }
        };

        match announced {
            Some(addr) => {
                Self::connect(nick, &addr.ip().to_string(), addr.port(), options, handler).await
            }
            None => {
                log::info!(
                    "No relay announced within {:?}, trying 127.0.0.1:{}",
                    discovery_timeout,
                    default_port
                );
                Self::connect(nick, "127.0.0.1", default_port, options, handler).await
            }
        }
    }

    pub fn nick(&self) -> &str {
        &self.nick
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// True once closed locally or by the relay
    pub fn is_closed(&self) -> bool {
        *self.stop.borrow()
    }

    pub fn send_register(&self, public_key_b64: &str) -> Result<(), ClientError> {
        self.send_frame(Frame::Register {
            nick: self.nick.clone(),
            public_key: public_key_b64.to_string(),
        })
    }

    pub fn send_key_exchange(&self, public_key_b64: &str, to: &str) -> Result<(), ClientError> {
        self.send_frame(Frame::Key {
            from: self.nick.clone(),
            to: to.to_string(),
            public_key: public_key_b64.to_string(),
        })
    }

    pub fn send_message(&self, to: &str, payload: &str) -> Result<(), ClientError> {
        self.send_frame(Frame::Msg {
            from: self.nick.clone(),
            to: to.to_string(),
            payload: payload.to_string(),
        })
    }

    /// Queue one validated frame for the writer
    pub fn send_frame(&self, frame: Frame) -> Result<(), ClientError> {
        frame.validate()?;
        if self.is_closed() {
            return Err(ClientError::NotConnected);
        }
        self.outbound
            .send(frame.to_line())
            .map_err(|_| ClientError::NotConnected)
    }

    /// Stop the reader, flush and shut down the stream, and wait (bounded)
    /// for both tasks. Once this returns the line handler is not called
    /// again. Safe to call more than once.
    pub async fn close(&self) {
        self.stop.send_replace(true);

        let handles = std::mem::take(&mut *self.tasks.lock());
        if handles.is_empty() {
            // another caller is joining; wait for it
            let mut joined = self.joined.subscribe();
            let _ = joined.wait_for(|done| *done).await;
            return;
        }

        for mut handle in handles {
            if tokio::time::timeout(self.close_grace, &mut handle).await.is_err() {
                log::warn!(
                    "Connection task did not finish within {:?}, aborting",
                    self.close_grace
                );
                handle.abort();
                let _ = handle.await;
            }
        }

        self.joined.send_replace(true);
        log::info!("Disconnected from relay {}", self.remote);
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        self.stop.send_replace(true);
    }
}

async fn wait_stop(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stopped| *stopped).await;
}

async fn read_loop<R>(read_half: R, handler: Arc<dyn LineHandler>, stop: Arc<watch::Sender<bool>>)
where
    R: AsyncRead + Unpin,
{
    let mut stopped = stop.subscribe();
    let mut lines = LineReader::new(read_half);

    loop {
        let next = tokio::select! {
            _ = wait_stop(&mut stopped) => break,
            next = lines.next_line() => next,
        };
        match next {
            Ok(Some(line)) => {
                if *stop.borrow() {
                    break;
                }
                handler.on_line(&line);
            }
            Ok(None) => {
                log::info!("Relay closed the connection");
                break;
            }
            Err(e) => {
                log::warn!("Read from relay failed: {}", e);
                break;
            }
        }
    }

    stop.send_replace(true);
}

async fn write_loop<W>(
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<String>,
    stop: Arc<watch::Sender<bool>>,
) where
    W: AsyncWrite + Unpin,
{
    let mut stopped = stop.subscribe();

    loop {
        let line = tokio::select! {
            biased;
            line = outbound.recv() => match line {
                Some(line) => line,
                None => break,
            },
            _ = wait_stop(&mut stopped) => {
                while let Ok(line) = outbound.try_recv() {
                    if write_line(&mut writer, &line).await.is_err() {
                        break;
                    }
                }
                break;
            }
        };

        if let Err(e) = write_line(&mut writer, &line).await {
            log::warn!("Write to relay failed: {}", e);
            stop.send_replace(true);
            break;
        }
    }

    let _ = writer.shutdown().await;
}

async fn write_line<W>(writer: &mut W, line: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = Vec::with_capacity(line.len() + 1);
    buf.extend_from_slice(line.as_bytes());
    buf.push(b'\n');
    writer.write_all(&buf).await?;
    writer.flush().await
}
