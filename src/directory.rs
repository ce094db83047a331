//! Session Directory
//!
//! The relay's view of who is connected: nickname -> live session. Workers
//! for every connection mutate it concurrently; the lock is held only for
//! the duration of one map operation and never across an await.
//!
//! There is one `RwLock` for the whole map, but nothing slow happens under
//! it. Routing clones the recipient's [`SessionHandle`] and releases the
//! lock before queueing the line; PEERS broadcasts work from a
//! [`Directory::snapshot`]. Socket writes happen in each connection's own
//! writer task, fed by its unbounded queue, so a stalled client only ever
//! blocks itself and never holds up registration or routing for others.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

/// Identity of one accepted TCP connection
pub type ConnectionId = Uuid;

/// Item in a connection's writer queue
#[derive(Debug, Clone)]
pub enum Outbound {
    Line(Arc<str>),
    Close,
}

/// Write side of a registered connection
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub connection_id: ConnectionId,
    pub nick: String,
    outbound: mpsc::UnboundedSender<Outbound>,
    closer: Arc<Notify>,
}

impl SessionHandle {
    pub fn new(
        connection_id: ConnectionId,
        nick: String,
        outbound: mpsc::UnboundedSender<Outbound>,
        closer: Arc<Notify>,
    ) -> Self {
        Self {
            connection_id,
            nick,
            outbound,
            closer,
        }
    }

    /// Queue a line for this session's writer. Returns false once the
    /// writer has gone away.
    pub fn send_line(&self, line: Arc<str>) -> bool {
        self.outbound.send(Outbound::Line(line)).is_ok()
    }

    /// Flush whatever is queued, then end the connection
    pub fn close(&self) {
        let _ = self.outbound.send(Outbound::Close);
        self.closer.notify_one();
    }
}

struct Entry {
    seq: u64,
    session: SessionHandle,
}

/// Concurrent nickname -> session map
#[derive(Default)]
pub struct Directory {
    sessions: RwLock<HashMap<String, Entry>>,
    next_seq: AtomicU64,
    ever_registered: AtomicBool,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the entry for `session.nick`.
    ///
    /// A connection holds at most one nickname: entries this connection
    /// registered earlier under another name are dropped. Returns sessions
    /// of *other* connections displaced by the same nickname, for the
    /// caller to close.
    pub fn register(&self, session: SessionHandle) -> Vec<SessionHandle> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let mut sessions = self.sessions.write();

        sessions.retain(|_, entry| entry.session.connection_id != session.connection_id);

        let displaced = sessions
            .insert(session.nick.clone(), Entry { seq, session })
            .map(|old| old.session);

        self.ever_registered.store(true, Ordering::Release);
        displaced.into_iter().collect()
    }

    /// Remove every entry owned by `connection_id`. An entry under the same
    /// nickname that a newer connection took over is left alone.
    pub fn remove_connection(&self, connection_id: ConnectionId) -> Vec<String> {
        let mut removed = Vec::new();
        self.sessions.write().retain(|nick, entry| {
            if entry.session.connection_id == connection_id {
                removed.push(nick.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    pub fn get(&self, nick: &str) -> Option<SessionHandle> {
        self.sessions.read().get(nick).map(|e| e.session.clone())
    }

    /// Current sessions in registration order
    pub fn snapshot(&self) -> Vec<SessionHandle> {
        let sessions = self.sessions.read();
        let mut entries: Vec<&Entry> = sessions.values().collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| e.session.clone()).collect()
    }

    pub fn nicknames(&self) -> Vec<String> {
        self.snapshot().into_iter().map(|s| s.nick).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Whether anyone has ever registered; gates auto-shutdown
    pub fn has_had_clients(&self) -> bool {
        self.ever_registered.load(Ordering::Acquire)
    }

    /// Empty the directory, returning everything that was in it
    pub fn drain(&self) -> Vec<SessionHandle> {
        let mut sessions = self.sessions.write();
        let mut entries: Vec<Entry> = sessions.drain().map(|(_, e)| e).collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| e.session).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(nick: &str) -> (SessionHandle, mpsc::UnboundedReceiver<Outbound>) {
        session_on(Uuid::new_v4(), nick)
    }

    fn session_on(
        id: ConnectionId,
        nick: &str,
    ) -> (SessionHandle, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            SessionHandle::new(id, nick.to_string(), tx, Arc::new(Notify::new())),
            rx,
        )
    }

    #[test]
    fn test_registration_order() {
        let dir = Directory::new();
        let (a, _ra) = session("alice");
        let (b, _rb) = session("bob");
        let (c, _rc) = session("carol");
        dir.register(a);
        dir.register(b);
        dir.register(c);

        assert_eq!(dir.nicknames(), vec!["alice", "bob", "carol"]);
        assert_eq!(dir.len(), 3);
        assert!(dir.has_had_clients());
    }

    #[test]
    fn test_last_register_wins() {
        let dir = Directory::new();
        let (first, _r1) = session("alice");
        let (second, _r2) = session("alice");
        let first_id = first.connection_id;
        let second_id = second.connection_id;

        assert!(dir.register(first).is_empty());
        let displaced = dir.register(second);
        assert_eq!(displaced.len(), 1);
        assert_eq!(displaced[0].connection_id, first_id);
        assert_eq!(dir.get("alice").unwrap().connection_id, second_id);

        // the displaced connection's cleanup must not evict the newcomer
        assert!(dir.remove_connection(first_id).is_empty());
        assert_eq!(dir.get("alice").unwrap().connection_id, second_id);
    }

    #[test]
    fn test_rename_on_same_connection() {
        let dir = Directory::new();
        let id = Uuid::new_v4();
        let (old, _r1) = session_on(id, "alice");
        let (new, _r2) = session_on(id, "alicia");

        dir.register(old);
        assert!(dir.register(new).is_empty());
        assert_eq!(dir.nicknames(), vec!["alicia"]);
    }

    #[test]
    fn test_remove_connection() {
        let dir = Directory::new();
        let (a, _ra) = session("alice");
        let (b, _rb) = session("bob");
        let a_id = a.connection_id;
        dir.register(a);
        dir.register(b);

        assert_eq!(dir.remove_connection(a_id), vec!["alice".to_string()]);
        assert_eq!(dir.nicknames(), vec!["bob"]);
        assert!(dir.get("alice").is_none());
    }

    #[test]
    fn test_reregister_moves_to_end() {
        let dir = Directory::new();
        let (a, _ra) = session("alice");
        let (b, _rb) = session("bob");
        let (a2, _ra2) = session("alice");
        dir.register(a);
        dir.register(b);
        dir.register(a2);
        assert_eq!(dir.nicknames(), vec!["bob", "alice"]);
    }

    #[test]
    fn test_close_queues_marker() {
        let (a, mut rx) = session("alice");
        assert!(a.send_line(Arc::from("PEERS|alice")));
        a.close();

        assert!(matches!(rx.try_recv(), Ok(Outbound::Line(l)) if &*l == "PEERS|alice"));
        assert!(matches!(rx.try_recv(), Ok(Outbound::Close)));
    }

    #[test]
    fn test_send_after_writer_gone() {
        let (a, rx) = session("alice");
        drop(rx);
        assert!(!a.send_line(Arc::from("x")));
    }

    #[test]
    fn test_drain() {
        let dir = Directory::new();
        assert!(!dir.has_had_clients());
        let (a, _ra) = session("alice");
        let (b, _rb) = session("bob");
        dir.register(a);
        dir.register(b);

        let drained = dir.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].nick, "alice");
        assert!(dir.is_empty());
        assert!(dir.has_had_clients());
    }

    #[test]
    fn test_concurrent_register_and_remove() {
        let dir = Arc::new(Directory::new());
        let (b, _rb) = session("bob");
        dir.register(b);

        let workers: Vec<_> = (0..8)
            .map(|worker| {
                let dir = Arc::clone(&dir);
                std::thread::spawn(move || {
                    for round in 0..200 {
                        let (s, _rx) = session(&format!("user{}-{}", worker, round));
                        let id = s.connection_id;
                        dir.register(s);
                        assert!(dir.snapshot().iter().any(|s| s.nick == "bob"));
                        assert_eq!(dir.remove_connection(id).len(), 1);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(dir.nicknames(), vec!["bob"]);
    }
}
