//! GhostCat Client - Main Entry Point
//!
//! Interactive terminal client. Connects directly, via LAN discovery, or
//! (with `--local`) through a relay started in-process when none answers.

use anyhow::{anyhow, Result};
use clap::Parser;
use log::{info, warn};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use ghostcat::attachment::{self, Plaintext};
use ghostcat::discovery;
use ghostcat::handshake::{HandshakeError, PeerKeyState};
use ghostcat::{
    ClientConfig, ConnectOptions, CryptoContext, InboundEvent, KeyExchangeCoordinator,
    PeerConnection, RelayServer, SendOutcome, ServerConfig,
};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "ghostcat-client")]
#[command(about = "GhostCat end-to-end encrypted chat client")]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/client.toml")]
    config: PathBuf,

    /// Relay host; skips LAN discovery
    #[arg(long)]
    host: Option<String>,

    /// Relay port
    #[arg(short, long)]
    port: Option<u16>,

    /// Nickname
    #[arg(short, long)]
    nick: Option<String>,

    /// Start a relay in this process if none is announced on the LAN
    #[arg(long)]
    local: bool,

    /// Directory for received files
    #[arg(long)]
    download_dir: Option<PathBuf>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,
}

type Coordinator = KeyExchangeCoordinator<Arc<PeerConnection>>;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = if args.config.exists() {
        ClientConfig::from_file(&args.config.to_string_lossy())?
    } else {
        ClientConfig::default()
    };

    let log_level = args.log_level.clone().unwrap_or(config.log_level.clone());
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&log_level)).init();

    if args.host.is_some() {
        config.server_host = args.host.clone();
    }
    if let Some(port) = args.port {
        config.server_port = port;
    }
    if let Some(nick) = args.nick.clone() {
        config.nickname = nick;
    }
    if args.download_dir.is_some() {
        config.download_dir = args.download_dir.clone();
    }

    println!("GhostCat");
    println!("========");
    println!("Nickname: {}", config.nickname);

    let crypto = Arc::new(CryptoContext::new()?);
    let options = ConnectOptions::from(&config);

    // Lines from the relay are handed to the main loop in arrival order
    let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();
    let handler = move |line: &str| {
        let _ = line_tx.send(line.to_string());
    };

    let (connection, local_relay) = open_connection(&config, &options, args.local, handler).await?;
    let connection = Arc::new(connection);
    println!("Connected to relay {}", connection.remote_addr());

    connection.send_register(&crypto.public_key_base64())?;
    let coordinator = KeyExchangeCoordinator::new(
        config.nickname.clone(),
        Arc::clone(&crypto),
        Arc::clone(&connection),
    );

    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<String>();
    let input_task = tokio::spawn(async move {
        if let Err(e) = handle_user_input(cmd_tx).await {
            warn!("Input error: {}", e);
        }
    });

    print_help();
    let mut last_peer: Option<String> = None;

    loop {
        tokio::select! {
            line = line_rx.recv() => {
                let Some(line) = line else {
                    println!("Relay connection lost");
                    break;
                };
                if let Some(event) = coordinator.handle_line(&line) {
                    render_event(event, config.download_dir.as_deref());
                }
            }
            command = cmd_rx.recv() => {
                let Some(command) = command else { break };
                match run_command(&coordinator, command.trim(), &mut last_peer) {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => println!("Error: {}", e),
                }
            }
        }
        prompt();
    }

    input_task.abort();
    connection.close().await;
    if let Some(relay) = local_relay {
        relay.stop().await;
    }
    println!("Goodbye!");
    Ok(())
}

/// Pick a relay the way the config and flags ask for
async fn open_connection<H>(
    config: &ClientConfig,
    options: &ConnectOptions,
    local: bool,
    handler: H,
) -> Result<(PeerConnection, Option<Arc<RelayServer>>)>
where
    H: Fn(&str) + Send + Sync + 'static,
{
    let nick = config.nickname.as_str();
    let handler: Arc<dyn ghostcat::LineHandler> = Arc::new(handler);

    if let Some(host) = &config.server_host {
        println!("Connecting to {}:{}...", host, config.server_port);
        let conn = PeerConnection::connect(nick, host, config.server_port, options, handler).await?;
        return Ok((conn, None));
    }

    if !local {
        println!("Looking for a relay on the LAN...");
        let conn = PeerConnection::discover_and_connect(
            nick,
            config.server_port,
            config.discovery_timeout(),
            options,
            handler,
        )
        .await?;
        return Ok((conn, None));
    }

    println!("Looking for a relay on the LAN...");
    let announced = discovery::listen_once(config.discovery_port, config.discovery_timeout())
        .await
        .unwrap_or_else(|e| {
            warn!("Discovery listener unavailable: {}", e);
            None
        });
    if let Some(addr) = announced {
        let host = addr.ip().to_string();
        let conn = PeerConnection::connect(nick, &host, addr.port(), options, handler).await?;
        return Ok((conn, None));
    }

    println!("No relay found, starting one in this process");
    let relay = RelayServer::from_config(ServerConfig {
        port: 0,
        discovery: true,
        discovery_port: config.discovery_port,
        auto_shutdown: true,
        ..ServerConfig::default()
    })?;
    let addr = relay.start().await?;
    info!("Local relay on {}", addr);

    let conn = PeerConnection::connect(nick, "127.0.0.1", addr.port(), options, handler).await?;
    Ok((conn, Some(relay)))
}

/// Returns Ok(false) when the user asked to quit
fn run_command(
    coordinator: &Coordinator,
    input: &str,
    last_peer: &mut Option<String>,
) -> Result<bool> {
    if input.is_empty() {
        return Ok(true);
    }

    let (command, rest) = input.split_once(' ').unwrap_or((input, ""));
    let rest = rest.trim();

    match command {
        "/quit" | "/exit" => return Ok(false),
        "/help" => print_help(),
        "/peers" => {
            let peers = coordinator.peers();
            if peers.is_empty() {
                println!("No other peers connected");
            }
            for peer in peers {
                let state = match coordinator.peer_state(&peer) {
                    PeerKeyState::Established => "key established",
                    PeerKeyState::Requested => "key requested",
                    PeerKeyState::Unknown => "no key yet",
                };
                println!("  {} ({})", peer, state);
            }
        }
        "/msg" => {
            let (to, text) = rest
                .split_once(' ')
                .ok_or_else(|| anyhow!("Usage: /msg <nick> <text>"))?;
            send_text(coordinator, to, text.trim())?;
            *last_peer = Some(to.to_string());
        }
        "/all" => {
            if rest.is_empty() {
                return Err(anyhow!("Usage: /all <text>"));
            }
            for (peer, outcome) in coordinator.send_to_all(rest.as_bytes()) {
                report_outcome(&peer, rest, outcome);
            }
        }
        "/file" => {
            let (to, path) = rest
                .split_once(' ')
                .ok_or_else(|| anyhow!("Usage: /file <nick> <path>"))?;
            let (name, data) = attachment::load_file(Path::new(path.trim()))?;
            let plaintext = attachment::encode_file(&name, &data)?;
            let label = format!("[file {} ({} bytes)]", name, data.len());
            report_outcome(to, &label, coordinator.send_plaintext(to, &plaintext));
            *last_peer = Some(to.to_string());
        }
        _ if command.starts_with('/') => {
            println!("Unknown command: {}. Type /help for available commands.", command)
        }
        _ => match last_peer.clone() {
            Some(to) => send_text(coordinator, &to, input)?,
            None => println!("No recipient yet; use /msg <nick> <text>"),
        },
    }
    Ok(true)
}

fn send_text(coordinator: &Coordinator, to: &str, text: &str) -> Result<()> {
    if text.is_empty() {
        return Err(anyhow!("Nothing to send"));
    }
    report_outcome(to, text, coordinator.send_plaintext(to, text.as_bytes()));
    Ok(())
}

fn report_outcome(to: &str, text: &str, outcome: Result<SendOutcome, HandshakeError>) {
    match outcome {
        Ok(SendOutcome::Sent) => println!("Me -> {}: {}", to, text),
        Ok(SendOutcome::KeyRequested) => {
            println!("Requested static key from {}; message queued", to)
        }
        Ok(SendOutcome::Deferred) => {
            println!("Still waiting for {}'s key; request repeated, message queued", to)
        }
        Err(e) => println!("Send to {} failed: {}", to, e),
    }
}

fn render_event(event: InboundEvent, download_dir: Option<&Path>) {
    match event {
        InboundEvent::Peers(peers) => {
            if peers.is_empty() {
                println!("\n[peers] nobody else is here");
            } else {
                println!("\n[peers] {}", peers.join(", "));
            }
        }
        InboundEvent::KeyEstablished { peer, flushed, .. } => {
            println!("\nKey established with {}", peer);
            if flushed > 0 {
                println!("Sent {} queued message(s) to {}", flushed, peer);
            }
        }
        InboundEvent::Message {
            from,
            broadcast,
            body,
        } => {
            let label = if broadcast {
                format!("{} (all)", from)
            } else {
                from.clone()
            };
            match body {
                Plaintext::Text(text) => println!("\n{} >> {}", label, text),
                Plaintext::File { name, data } => {
                    match attachment::save_attachment(download_dir, &name, &data) {
                        Ok(path) => println!("\n{} >> file received: {}", label, path.display()),
                        Err(e) => println!("\n{} >> file could not be saved: {}", label, e),
                    }
                }
                Plaintext::MalformedFile { reason } => {
                    println!("\n{} >> (invalid file payload: {})", label, reason)
                }
            }
        }
        InboundEvent::Undecryptable { reason, .. } => println!("\n[dropped] {}", reason),
        InboundEvent::InvalidKey { from, reason } => {
            println!("\n[dropped] invalid key from {}: {}", from, reason)
        }
        InboundEvent::Unrecognized(raw) => println!("\n[RAW] {}", raw),
    }
}

fn print_help() {
    println!();
    println!("Commands:");
    println!("  /peers              - List connected peers");
    println!("  /msg <nick> <text>  - Send an encrypted message");
    println!("  /all <text>         - Send to every peer");
    println!("  /file <nick> <path> - Send a file (max 50 MB)");
    println!("  /quit               - Exit");
    println!("  <text>              - Send to the last peer you messaged");
    prompt();
}

fn prompt() {
    print!("> ");
    let _ = io::stdout().flush();
}

async fn handle_user_input(cmd_tx: mpsc::UnboundedSender<String>) -> Result<()> {
    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();

    while let Some(line) = lines.next_line().await? {
        if cmd_tx.send(line).is_err() {
            break;
        }
    }
    Ok(())
}
