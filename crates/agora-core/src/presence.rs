//! Presence tracking for Agora.
//!
//! A user is online while they hold at least one open connection, no matter
//! how many rooms or tabs those connections are spread across. The registry
//! only reports transitions; persisting the flag and announcing it to rooms
//! is the hub's job.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

/// A change in a user's online status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceTransition {
    /// The first connection opened.
    CameOnline,
    /// The last connection closed.
    WentOffline,
}

#[derive(Debug, Default)]
struct PresenceEntry {
    connections: usize,
    online: bool,
}

/// Reference-counted online state per username.
#[derive(Debug, Default)]
pub struct PresenceRegistry {
    entries: DashMap<String, PresenceEntry>,
}

impl PresenceRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a newly opened connection for `username`.
    ///
    /// Returns [`PresenceTransition::CameOnline`] when this is the user's
    /// first connection and they were not already marked online.
    pub fn connection_opened(&self, username: &str) -> Option<PresenceTransition> {
        if username.is_empty() {
            return None;
        }

        let mut entry = self.entries.entry(username.to_string()).or_default();
        entry.connections += 1;
        if entry.connections == 1 && !entry.online {
            entry.online = true;
            debug!(user = %username, "Presence: user online");
            return Some(PresenceTransition::CameOnline);
        }
        None
    }

    /// Count a closed connection for `username`.
    ///
    /// A user with no counted connections is left untouched. On the last
    /// close the entry is removed and, if the user was online,
    /// [`PresenceTransition::WentOffline`] is returned.
    pub fn connection_closed(&self, username: &str) -> Option<PresenceTransition> {
        let Entry::Occupied(mut occupied) = self.entries.entry(username.to_string()) else {
            return None;
        };

        let entry = occupied.get_mut();
        if entry.connections == 0 {
            return None;
        }
        entry.connections -= 1;
        if entry.connections > 0 {
            return None;
        }

        let removed = occupied.remove();
        if removed.online {
            debug!(user = %username, "Presence: user offline");
            Some(PresenceTransition::WentOffline)
        } else {
            None
        }
    }

    /// Mark users online without counting a connection.
    ///
    /// Used at startup to restore persisted state. Returns how many users
    /// were newly marked.
    pub fn seed<I, S>(&self, usernames: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seeded = 0;
        for username in usernames {
            let username = username.into();
            if username.is_empty() {
                continue;
            }
            let mut entry = self.entries.entry(username).or_default();
            if !entry.online {
                entry.online = true;
                seeded += 1;
            }
        }
        seeded
    }

    /// Check whether a user is online.
    #[must_use]
    pub fn is_online(&self, username: &str) -> bool {
        self.entries.get(username).is_some_and(|e| e.online)
    }

    /// Number of open connections held by a user.
    #[must_use]
    pub fn connection_count(&self, username: &str) -> usize {
        self.entries.get(username).map_or(0, |e| e.connections)
    }

    /// Current online usernames, in no particular order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| e.online)
            .map(|e| e.key().clone())
            .collect()
    }

    /// Number of online users.
    #[must_use]
    pub fn online_count(&self) -> usize {
        self.entries.iter().filter(|e| e.online).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_single_connection_lifecycle() {
        let presence = PresenceRegistry::new();

        assert_eq!(
            presence.connection_opened("alice"),
            Some(PresenceTransition::CameOnline)
        );
        assert!(presence.is_online("alice"));
        assert_eq!(presence.snapshot(), ["alice"]);

        assert_eq!(
            presence.connection_closed("alice"),
            Some(PresenceTransition::WentOffline)
        );
        assert!(!presence.is_online("alice"));
        assert_eq!(presence.connection_count("alice"), 0);
    }

    #[test]
    fn test_multiple_connections_toggle_once() {
        let presence = PresenceRegistry::new();

        assert!(presence.connection_opened("alice").is_some());
        assert!(presence.connection_opened("alice").is_none());
        assert!(presence.connection_opened("alice").is_none());
        assert_eq!(presence.connection_count("alice"), 3);

        assert!(presence.connection_closed("alice").is_none());
        assert!(presence.is_online("alice"));
        assert!(presence.connection_closed("alice").is_none());
        assert!(presence.is_online("alice"));
        assert_eq!(
            presence.connection_closed("alice"),
            Some(PresenceTransition::WentOffline)
        );
        assert!(!presence.is_online("alice"));
    }

    #[test]
    fn test_close_without_open_is_noop() {
        let presence = PresenceRegistry::new();
        assert!(presence.connection_closed("ghost").is_none());
        assert!(presence.connection_opened("").is_none());
        assert_eq!(presence.online_count(), 0);
    }

    #[test]
    fn test_seeded_user() {
        let presence = PresenceRegistry::new();
        assert_eq!(presence.seed(["alice", "bob", ""]), 2);
        assert!(presence.is_online("alice"));

        // Seeded users hold no connections, so a stray close changes nothing.
        assert!(presence.connection_closed("alice").is_none());
        assert!(presence.is_online("alice"));

        // Already online: the first real connection is not a transition.
        assert!(presence.connection_opened("alice").is_none());
        assert_eq!(
            presence.connection_closed("alice"),
            Some(PresenceTransition::WentOffline)
        );
        assert!(!presence.is_online("alice"));
        assert_eq!(presence.online_count(), 1);
    }

    #[test]
    fn test_concurrent_open_close_keeps_invariant() {
        let presence = Arc::new(PresenceRegistry::new());

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let presence = Arc::clone(&presence);
                std::thread::spawn(move || {
                    let mut transitions = 0;
                    for _ in 0..500 {
                        transitions += usize::from(presence.connection_opened("alice").is_some());
                        transitions += usize::from(presence.connection_closed("alice").is_some());
                    }
                    transitions
                })
            })
            .collect();

        let transitions: usize = threads.into_iter().map(|t| t.join().unwrap()).sum();
        assert_eq!(transitions % 2, 0);
        assert_eq!(presence.connection_count("alice"), 0);
        assert!(!presence.is_online("alice"));
    }
}
