//! Key Exchange Coordinator
//!
//! Per-peer state `Unknown -> Requested -> Established`. Every send to a
//! peer without a cached key puts our static key on the wire as a KEY
//! request and holds the message back, so a request the relay dropped is
//! retried by the next send. An incoming KEY is an answer if its sender is
//! in our pending set and a request otherwise. The pending entry is tested
//! and removed in one step before the reply decision.
//!
//! Requests are answered unless they carry a key we already hold and we
//! sent our own key to that peer within the reply cooldown. A KEY that
//! answers an answer therefore dies out after one round trip.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::attachment::Plaintext;
use crate::client::{ClientError, PeerConnection};
use crate::crypto::context::CryptoContext;
use crate::crypto::keys::PeerPublicKey;
use crate::crypto::CryptoError;
use crate::protocol::{Frame, BROADCAST};

#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("Client error: {0}")]
    Client(#[from] ClientError),
    #[error("Cannot send to {0:?}")]
    InvalidRecipient(String),
    #[error("{0} messages already waiting for {1}'s key")]
    Backlog(usize, String),
}

/// Messages held per peer while its key is outstanding
pub const MAX_DEFERRED: usize = 64;

/// How long an unchanged key is treated as already answered
pub const REPLY_COOLDOWN: Duration = Duration::from_secs(2);

/// Where the coordinator writes KEY and MSG frames
pub trait Outbox: Send + Sync {
    fn send_key_exchange(&self, public_key_b64: &str, to: &str) -> Result<(), ClientError>;
    fn send_message(&self, to: &str, payload: &str) -> Result<(), ClientError>;
}

impl Outbox for PeerConnection {
    fn send_key_exchange(&self, public_key_b64: &str, to: &str) -> Result<(), ClientError> {
        PeerConnection::send_key_exchange(self, public_key_b64, to)
    }

    fn send_message(&self, to: &str, payload: &str) -> Result<(), ClientError> {
        PeerConnection::send_message(self, to, payload)
    }
}

impl<T: Outbox + ?Sized> Outbox for Arc<T> {
    fn send_key_exchange(&self, public_key_b64: &str, to: &str) -> Result<(), ClientError> {
        (**self).send_key_exchange(public_key_b64, to)
    }

    fn send_message(&self, to: &str, payload: &str) -> Result<(), ClientError> {
        (**self).send_message(to, payload)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerKeyState {
    Unknown,
    Requested,
    Established,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Encrypted and queued
    Sent,
    /// Held back; a KEY request went out
    KeyRequested,
    /// Held back behind an outstanding request; the request was sent again
    Deferred,
}

/// What an inbound line meant to this client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    /// Directory update, own nickname removed
    Peers(Vec<String>),
    KeyEstablished {
        peer: String,
        /// We answered a request with our own key
        replied: bool,
        /// Held-back messages sent now that the key is known
        flushed: usize,
    },
    Message {
        from: String,
        broadcast: bool,
        body: Plaintext,
    },
    /// Dropped message; the session carries on
    Undecryptable { from: String, reason: String },
    /// KEY frame with an unusable public key, ignored
    InvalidKey { from: String, reason: String },
    Unrecognized(String),
}

pub struct KeyExchangeCoordinator<O: Outbox> {
    nick: String,
    crypto: Arc<CryptoContext>,
    outbox: O,
    pending: Mutex<HashSet<String>>,
    deferred: Mutex<HashMap<String, Vec<Vec<u8>>>>,
    peers: Mutex<Vec<String>>,
    /// When our key last went to each peer, as request or reply
    key_sent: Mutex<HashMap<String, Instant>>,
    reply_cooldown: Duration,
}

impl<O: Outbox> KeyExchangeCoordinator<O> {
    pub fn new(nick: impl Into<String>, crypto: Arc<CryptoContext>, outbox: O) -> Self {
        Self {
            nick: nick.into(),
            crypto,
            outbox,
            pending: Mutex::new(HashSet::new()),
            deferred: Mutex::new(HashMap::new()),
            peers: Mutex::new(Vec::new()),
            key_sent: Mutex::new(HashMap::new()),
            reply_cooldown: REPLY_COOLDOWN,
        }
    }

    pub fn with_reply_cooldown(mut self, cooldown: Duration) -> Self {
        self.reply_cooldown = cooldown;
        self
    }

    pub fn nick(&self) -> &str {
        &self.nick
    }

    pub fn outbox(&self) -> &O {
        &self.outbox
    }

    pub fn crypto(&self) -> &Arc<CryptoContext> {
        &self.crypto
    }

    /// Peers from the latest PEERS line
    pub fn peers(&self) -> Vec<String> {
        self.peers.lock().clone()
    }

    pub fn peer_state(&self, nick: &str) -> PeerKeyState {
        if self.crypto.knows_peer(nick) {
            PeerKeyState::Established
        } else if self.pending.lock().contains(nick) {
            PeerKeyState::Requested
        } else {
            PeerKeyState::Unknown
        }
    }

    /// Messages held back for `nick`
    pub fn deferred_count(&self, nick: &str) -> usize {
        self.deferred.lock().get(nick).map_or(0, Vec::len)
    }

    /// Encrypt and send to one peer, or hold the message and request the
    /// peer's key if it is not cached yet.
    pub fn send_plaintext(&self, to: &str, plaintext: &[u8]) -> Result<SendOutcome, HandshakeError> {
        if to == BROADCAST || to == self.nick || to.is_empty() {
            return Err(HandshakeError::InvalidRecipient(to.to_string()));
        }

        {
            // checked under the deferred lock so a concurrently arriving key
            // either is seen here or flushes this message
            let mut deferred = self.deferred.lock();
            if !self.crypto.knows_peer(to) {
                let queue = deferred.entry(to.to_string()).or_default();
                if queue.len() >= MAX_DEFERRED {
                    return Err(HandshakeError::Backlog(queue.len(), to.to_string()));
                }
                queue.push(plaintext.to_vec());
                drop(deferred);
                return self.request_key(to);
            }
        }

        let payload = self.crypto.encrypt_for(to, plaintext)?;
        self.outbox.send_message(to, &payload)?;
        Ok(SendOutcome::Sent)
    }

    /// Send to every peer in the latest directory, one envelope each
    pub fn send_to_all(&self, plaintext: &[u8]) -> Vec<(String, Result<SendOutcome, HandshakeError>)> {
        self.peers()
            .into_iter()
            .map(|peer| {
                let outcome = self.send_plaintext(&peer, plaintext);
                (peer, outcome)
            })
            .collect()
    }

    fn request_key(&self, to: &str) -> Result<SendOutcome, HandshakeError> {
        let first = self.pending.lock().insert(to.to_string());
        if first {
            log::debug!("Requesting static key from {}", to);
        } else {
            log::debug!("Repeating key request to {}", to);
        }

        if let Err(e) = self.send_own_key(to) {
            // withdraw the message that triggered this attempt
            let mut deferred = self.deferred.lock();
            if let Some(queue) = deferred.get_mut(to) {
                queue.pop();
                if queue.is_empty() {
                    deferred.remove(to);
                }
            }
            if first {
                self.pending.lock().remove(to);
            }
            return Err(e.into());
        }

        Ok(if first {
            SendOutcome::KeyRequested
        } else {
            SendOutcome::Deferred
        })
    }

    fn send_own_key(&self, to: &str) -> Result<(), ClientError> {
        self.outbox
            .send_key_exchange(&self.crypto.public_key_base64(), to)?;
        self.key_sent.lock().insert(to.to_string(), Instant::now());
        Ok(())
    }

    fn sent_key_recently(&self, to: &str) -> bool {
        self.key_sent
            .lock()
            .get(to)
            .map_or(false, |at| at.elapsed() < self.reply_cooldown)
    }

    /// Forget outstanding requests and held messages for peers that left
    fn update_peers(&self, others: Vec<String>) {
        let previous = std::mem::replace(&mut *self.peers.lock(), others.clone());
        for gone in previous.iter().filter(|p| !others.contains(p)) {
            let was_pending = self.pending.lock().remove(gone);
            let dropped = self.deferred.lock().remove(gone).map_or(0, |q| q.len());
            if was_pending || dropped > 0 {
                log::info!(
                    "{} left; dropping key request and {} held message(s)",
                    gone,
                    dropped
                );
            }
        }
    }

    /// Interpret one line from the relay
    pub fn handle_line(&self, line: &str) -> Option<InboundEvent> {
        match Frame::parse(line) {
            Frame::Peers { nicks } => {
                let others: Vec<String> = nicks.into_iter().filter(|n| *n != self.nick).collect();
                self.update_peers(others.clone());
                Some(InboundEvent::Peers(others))
            }
            Frame::Key {
                from,
                to,
                public_key,
            } => {
                if to != self.nick || from == self.nick {
                    return None;
                }
                Some(self.handle_key(from, &public_key))
            }
            Frame::Msg { from, to, payload } => {
                if to != self.nick && to != BROADCAST {
                    return None;
                }
                Some(self.handle_message(from, to == BROADCAST, &payload))
            }
            Frame::Register { .. } => Some(InboundEvent::Unrecognized(line.to_string())),
            Frame::Unrecognized(raw) => Some(InboundEvent::Unrecognized(raw)),
        }
    }

    fn handle_key(&self, from: String, public_key_b64: &str) -> InboundEvent {
        let key = match PeerPublicKey::from_base64(public_key_b64) {
            Ok(key) => key,
            Err(e) => {
                log::warn!("Ignoring KEY from {}: {}", from, e);
                return InboundEvent::InvalidKey {
                    from,
                    reason: e.to_string(),
                };
            }
        };

        let was_pending = self.pending.lock().remove(&from);
        let unchanged = self.crypto.store_peer_key(&from, key) == Some(key);

        let answer = !was_pending && !(unchanged && self.sent_key_recently(&from));
        let replied = answer
            && match self.send_own_key(&from) {
                Ok(()) => true,
                Err(e) => {
                    log::warn!("Failed to answer key request from {}: {}", from, e);
                    false
                }
            };

        let flushed = self.flush_deferred(&from);
        log::info!(
            "Key established with {} ({}{} deferred message(s) sent)",
            from,
            if replied { "replied, " } else { "" },
            flushed
        );
        InboundEvent::KeyEstablished {
            peer: from,
            replied,
            flushed,
        }
    }

    fn flush_deferred(&self, peer: &str) -> usize {
        let queued = self.deferred.lock().remove(peer).unwrap_or_default();
        let mut sent = 0;
        for plaintext in queued {
            let result = self
                .crypto
                .encrypt_for(peer, &plaintext)
                .map_err(HandshakeError::from)
                .and_then(|payload| Ok(self.outbox.send_message(peer, &payload)?));
            match result {
                Ok(()) => sent += 1,
                Err(e) => log::warn!("Dropping deferred message to {}: {}", peer, e),
            }
        }
        sent
    }

    fn handle_message(&self, from: String, broadcast: bool, payload: &str) -> InboundEvent {
        match self.crypto.decrypt_payload(payload) {
            Ok(bytes) => InboundEvent::Message {
                from,
                broadcast,
                body: Plaintext::parse(&bytes),
            },
            Err(e) => {
                let reason = format!("{} decrypting message from {}", e, from);
                log::warn!("{}", reason);
                InboundEvent::Undecryptable { from, reason }
            }
        }
    }
}
