use dashmap::DashMap;
use std::collections::BTreeSet;

use crate::session::SessionHandle;

/// Process-wide map from username to the session that currently represents
/// it. Mutations lock only the shard holding the username, so unrelated
/// users never contend.
#[derive(Default)]
pub struct PresenceTable {
    entries: DashMap<String, SessionHandle>,
}

impl PresenceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `username` to `handle`, returning the handle it replaced.
    pub fn register(&self, username: &str, handle: SessionHandle) -> Option<SessionHandle> {
        self.entries.insert(username.to_owned(), handle)
    }

    /// Remove the mapping only while it still points at `handle`. Returns
    /// false when a newer session owns the name.
    pub fn unregister(&self, username: &str, handle: &SessionHandle) -> bool {
        self.entries
            .remove_if(username, |_, current| current.id() == handle.id())
            .is_some()
    }

    pub fn lookup(&self, username: &str) -> Option<SessionHandle> {
        self.entries.get(username).map(|entry| entry.value().clone())
    }

    pub fn is_online(&self, username: &str) -> bool {
        self.entries.contains_key(username)
    }

    pub fn list_online(&self) -> BTreeSet<String> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn register_overwrites_and_returns_previous() {
        let table = PresenceTable::new();
        let (s1, _rx1) = SessionHandle::channel();
        let (s2, _rx2) = SessionHandle::channel();
        assert!(table.register("alice", s1.clone()).is_none());
        let prev = table.register("alice", s2.clone()).unwrap();
        assert_eq!(prev.id(), s1.id());
        assert_eq!(table.lookup("alice").unwrap().id(), s2.id());
    }

    #[test]
    fn stale_unregister_keeps_newer_session() {
        let table = PresenceTable::new();
        let (s1, _rx1) = SessionHandle::channel();
        let (s2, _rx2) = SessionHandle::channel();
        table.register("alice", s1.clone());
        assert!(table.unregister("alice", &s1));
        table.register("alice", s2.clone());
        // late disconnect of the first session
        assert!(!table.unregister("alice", &s1));
        assert_eq!(table.lookup("alice").unwrap().id(), s2.id());
        assert!(table.unregister("alice", &s2));
        assert!(table.lookup("alice").is_none());
        assert!(!table.unregister("nobody", &s2));
    }

    #[test]
    fn list_online_tracks_latest_open_sessions() {
        let table = PresenceTable::new();
        let (a, _ra) = SessionHandle::channel();
        let (b, _rb) = SessionHandle::channel();
        let (a2, _ra2) = SessionHandle::channel();
        table.register("alice", a.clone());
        table.register("bob", b.clone());
        table.register("alice", a2);
        table.unregister("alice", &a);
        assert_eq!(
            table.list_online().into_iter().collect::<Vec<_>>(),
            vec!["alice", "bob"]
        );
        table.unregister("bob", &b);
        assert!(table.is_online("alice"));
        assert!(!table.is_online("bob"));
    }

    #[test]
    fn concurrent_register_unregister_leaves_no_stale_entry() {
        let table = Arc::new(PresenceTable::new());
        let threads: Vec<_> = (0..8)
            .map(|i| {
                let table = table.clone();
                std::thread::spawn(move || {
                    let name = format!("user{}", i % 2);
                    for _ in 0..200 {
                        let (h, _rx) = SessionHandle::channel();
                        table.register(&name, h.clone());
                        table.unregister(&name, &h);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        // the last register for a name is always followed by its own unregister
        assert!(table.list_online().is_empty());
    }
}
