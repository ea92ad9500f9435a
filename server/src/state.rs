//! Shared application state: authenticated users, their sessions, and the
//! one-shot keys waiting for a first data-plane contact.
//!
//! All operations are thread safe. The session and id maps are maintained
//! pairwise under one lock; the key table lives under its own lock because
//! the handshake path touches it without caring about sessions.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use keeper_shared::crypto::Key;
use parking_lot::RwLock;
use sqlx::PgPool;
use uuid::Uuid;

use crate::config::Config;

/// Minimal record the system needs about an authenticated user. The
/// cipher is deliberately absent: it belongs to the connection, not the
/// user (a user may reconnect with a fresh key).
pub struct User {
    id: Uuid,
    session: Uuid,
    expiration: SystemTime,
    ip: String,
}

impl User {
    /// Creates a user valid for `lifetime` from now.
    pub fn new(id: Uuid, session: Uuid, lifetime: Duration, ip: impl Into<String>) -> User {
        User {
            id,
            session,
            expiration: SystemTime::now() + lifetime,
            ip: ip.into(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn session(&self) -> Uuid {
        self.session
    }

    pub fn ip(&self) -> &str {
        &self.ip
    }

    pub fn expired(&self) -> bool {
        self.expiration < SystemTime::now()
    }

    /// Expiration as a unix timestamp, for the login response.
    pub fn expiration_unix(&self) -> u64 {
        self.expiration
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

#[derive(Default)]
struct SessionMaps {
    sessions: std::collections::HashMap<Uuid, Arc<User>>,
    users: std::collections::HashMap<Uuid, Arc<User>>,
}

/// Registry of live users and pending handshake keys, plus the handles
/// the rest of the system treats as opaque (config, database pool).
pub struct State {
    config: Config,
    db: Option<PgPool>,
    maps: RwLock<SessionMaps>,
    keys: RwLock<std::collections::HashMap<Uuid, Key>>,
}

impl State {
    pub fn new(config: Config, db: Option<PgPool>) -> Arc<State> {
        Arc::new(State {
            config,
            db,
            maps: RwLock::new(SessionMaps::default()),
            keys: RwLock::new(std::collections::HashMap::new()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The database pool, when the server was launched with one. The core
    /// never touches it; application handlers may.
    pub fn db(&self) -> Option<&PgPool> {
        self.db.as_ref()
    }

    /// Registers a user. A prior user with the same id is replaced and
    /// its session mapping removed.
    pub fn add_user(&self, user: Arc<User>) {
        let mut maps = self.maps.write();
        if let Some(old) = maps.users.remove(&user.id) {
            maps.sessions.remove(&old.session);
        }
        maps.sessions.insert(user.session, Arc::clone(&user));
        maps.users.insert(user.id, user);
    }

    /// Looks a user up by session, falling back to id when the session is
    /// nil. An expired user is purged from both maps and the key table.
    pub fn get_user(&self, session: Uuid, id: Uuid) -> Option<Arc<User>> {
        let user = {
            let maps = self.maps.read();
            if session.is_nil() {
                maps.users.get(&id).cloned()
            } else {
                maps.sessions.get(&session).cloned()
            }
        }?;

        if user.expired() {
            let mut maps = self.maps.write();
            maps.sessions.remove(&user.session);
            maps.users.remove(&user.id);
            drop(maps);
            self.delete_key(user.id);
            return None;
        }

        Some(user)
    }

    /// Creates and stores a fresh one-shot key for `id`, overwriting any
    /// previous one.
    pub fn create_key(&self, id: Uuid) -> Key {
        let key = Key::generate();
        self.keys.write().insert(id, key);
        key
    }

    pub fn get_key(&self, id: Uuid) -> Option<Key> {
        self.keys.read().get(&id).copied()
    }

    pub fn delete_key(&self, id: Uuid) {
        self.keys.write().remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> Arc<State> {
        State::new(Config::default(), None)
    }

    fn user(lifetime: Duration) -> Arc<User> {
        Arc::new(User::new(Uuid::new_v4(), Uuid::new_v4(), lifetime, "127.0.0.1"))
    }

    #[test]
    fn lookup_by_session_and_id() {
        let state = state();
        let user = user(Duration::from_secs(60));
        state.add_user(Arc::clone(&user));

        let by_session = state.get_user(user.session(), Uuid::nil()).unwrap();
        assert_eq!(by_session.id(), user.id());

        let by_id = state.get_user(Uuid::nil(), user.id()).unwrap();
        assert_eq!(by_id.session(), user.session());

        assert!(state.get_user(Uuid::new_v4(), Uuid::nil()).is_none());
    }

    #[test]
    fn same_id_replaces_old_session() {
        let state = state();
        let id = Uuid::new_v4();
        let old = Arc::new(User::new(id, Uuid::new_v4(), Duration::from_secs(60), "a"));
        let new = Arc::new(User::new(id, Uuid::new_v4(), Duration::from_secs(60), "b"));

        state.add_user(Arc::clone(&old));
        state.add_user(Arc::clone(&new));

        assert!(state.get_user(old.session(), Uuid::nil()).is_none());
        let found = state.get_user(new.session(), Uuid::nil()).unwrap();
        assert_eq!(found.ip(), "b");
    }

    #[test]
    fn expired_lookup_purges_everything() {
        let state = state();
        let user = user(Duration::from_secs(0));
        state.add_user(Arc::clone(&user));
        state.create_key(user.id());

        std::thread::sleep(Duration::from_millis(5));

        assert!(state.get_user(user.session(), Uuid::nil()).is_none());
        // Both entries and the pending key are gone.
        assert!(state.get_user(Uuid::nil(), user.id()).is_none());
        assert!(state.get_key(user.id()).is_none());
    }

    #[test]
    fn key_lifecycle() {
        let state = state();
        let id = Uuid::new_v4();

        assert!(state.get_key(id).is_none());
        let key = state.create_key(id);
        assert_eq!(
            state.get_key(id).map(|k| *k.as_bytes()),
            Some(*key.as_bytes())
        );

        // Overwrite is allowed at this layer; the RPC handler enforces
        // the one-pending-key rule.
        let other = state.create_key(id);
        assert_eq!(
            state.get_key(id).map(|k| *k.as_bytes()),
            Some(*other.as_bytes())
        );

        state.delete_key(id);
        assert!(state.get_key(id).is_none());
    }
}
