//! Registry of running matches, the core factories that create them and
//! the tag index that makes them discoverable. Also the acceptor that
//! routes freshly paired connections into their match.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use anyhow::anyhow;
use keeper_shared::codec::Reader;
use keeper_shared::packet::Opcode;
use log::{debug, info};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::connection::Connection;
use crate::index::{Index, IndexCategory, IntCategory, StringCategory};
use crate::listener::Acceptor;
use crate::matches::{Core, Match};
use crate::packets::ClientPacket;
use crate::query::{self, Field};
use crate::state::State;

pub type CoreFactory = Box<dyn Fn() -> Box<dyn Core> + Send + Sync>;

pub struct Manager {
    state: Arc<State>,
    index: Index<Uuid>,
    matches: RwLock<HashMap<Uuid, Arc<Match>>>,
    factories: RwLock<HashMap<String, CoreFactory>>,
    finished: AtomicBool,
}

impl Manager {
    pub fn new(state: Arc<State>) -> Arc<Manager> {
        Arc::new(Manager {
            state,
            index: Index::new(),
            matches: RwLock::new(HashMap::new()),
            factories: RwLock::new(HashMap::new()),
            finished: AtomicBool::new(false),
        })
    }

    pub fn state(&self) -> &Arc<State> {
        &self.state
    }

    /// Finds up to `max` matches. An empty query returns arbitrary ones;
    /// otherwise the query runs against the index and a match qualifies
    /// when at least `ratio` of its fields matched.
    pub fn search(&self, max: u32, ratio: u32, query: &[u8]) -> anyhow::Result<Vec<Uuid>> {
        let max = max.clamp(1, 100) as usize;

        if query.is_empty() {
            let matches = self.matches.read();
            return Ok(matches.keys().take(max).copied().collect());
        }

        let fields = query::parse(query)
            .map_err(|err| anyhow!("failed to parse query:{}: {}", err.offset, err.kind))?;

        let mut buffer: HashMap<Uuid, u32> = HashMap::new();
        self.index.search(&fields, &mut buffer);

        let mut result = Vec::with_capacity(max);
        for (id, count) in buffer {
            if count >= ratio {
                result.push(id);
            }
            if result.len() >= max {
                break;
            }
        }

        Ok(result)
    }

    pub fn get_match(&self, id: Uuid) -> Option<Arc<Match>> {
        self.matches.read().get(&id).cloned()
    }

    /// Registers the match and starts its tick loop on a fresh thread.
    pub fn add_match(&self, match_: Arc<Match>) {
        self.matches.write().insert(match_.id(), Arc::clone(&match_));
        thread::spawn(move || match_.run());
    }

    /// Called by a match on its way out: drops the registry entry and the
    /// tag fields it still had in the index.
    pub fn remove_match(&self, id: Uuid, tag: &[Field]) {
        self.index.remove(tag, &id);
        self.matches.write().remove(&id);
    }

    /// Swaps a match's indexed fields in one go.
    pub fn retag(&self, id: Uuid, old: &[Field], new: &[Field]) {
        self.index.remove(old, &id);
        self.index.insert(new, id);
    }

    /// Registers a core factory under an id the `create-match` RPC will
    /// look up. Startup-time only.
    pub fn register_core(&self, id: impl Into<String>, factory: CoreFactory) {
        self.check();
        let id = id.into();
        info!("Registered match core under {id}.");
        self.factories.write().insert(id, factory);
    }

    pub fn get_core(&self, id: &str) -> Option<Box<dyn Core>> {
        self.factories.read().get(id).map(|factory| factory())
    }

    /// Makes a field name searchable. Startup-time only, like core
    /// registration.
    pub fn add_category(&self, name: impl Into<String>, category: Box<dyn IndexCategory<Uuid>>) {
        self.check();
        self.index.add_category(name, category);
    }

    pub fn add_int_category(&self, name: impl Into<String>) {
        self.add_category(name, Box::new(IntCategory::new()));
    }

    pub fn add_string_category(&self, name: impl Into<String>) {
        self.add_category(name, Box::new(StringCategory::new()));
    }

    fn check(&self) {
        if self.finished.load(Ordering::Acquire) {
            panic!("match manager already finished, do this during initialization");
        }
    }

    /// Freezes registration; called once startup is complete.
    pub fn finish(&self) {
        self.finished.store(true, Ordering::Release);
    }

    pub fn finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }
}

impl Acceptor for Manager {
    /// Routes the handshake into the match named by the payload, spawning
    /// the connection's reader on the way. A missing match is the one
    /// handshake failure the client is told about.
    fn accept(&self, conn: Arc<Connection>, mut packet: ClientPacket) {
        let mut reader = Reader::new(&packet.data);

        let Some(match_id) = reader.uuid() else {
            debug!("Packet from {} is missing match id.", conn.tcp_addr());
            return;
        };

        let Some(match_) = self.get_match(match_id) else {
            if let Err(err) =
                conn.write_packet_tcp(Opcode::MATCH_JOIN_FAIL, b"Match with this id does not exist.")
            {
                debug!("Failed to report missing match: {err}");
            }
            return;
        };

        let meta = reader.rest().to_vec();
        packet.data = meta;

        Arc::clone(&conn).spawn_reader(Arc::clone(&self.state));
        match_.connect_user(Arc::clone(&packet.user), conn, packet.data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::state::User;
    use std::time::Duration;

    fn manager() -> Arc<Manager> {
        Manager::new(State::new(Config::default(), None))
    }

    fn creator() -> Arc<User> {
        Arc::new(User::new(Uuid::new_v4(), Uuid::new_v4(), Duration::from_secs(60), "t"))
    }

    struct Noop;
    impl Core for Noop {}

    #[test]
    fn factories_freeze_after_finish() {
        let manager = manager();
        manager.register_core("demo", Box::new(|| Box::new(Noop) as Box<dyn Core>));
        assert!(manager.get_core("demo").is_some());
        assert!(manager.get_core("missing").is_none());

        assert!(!manager.finished());
        manager.finish();
        assert!(manager.finished());

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            manager.register_core("late", Box::new(|| Box::new(Noop) as Box<dyn Core>));
        }));
        assert!(result.is_err());
    }

    #[test]
    fn empty_search_lists_registered_matches() {
        let manager = manager();
        let user = creator();

        let match_ = Match::new(
            Arc::clone(manager.state()),
            &manager,
            Box::new(Noop),
            &user,
            Uuid::nil(),
            &[],
        )
        .unwrap();
        let id = match_.id();
        manager.matches.write().insert(id, match_);

        assert_eq!(manager.search(10, 0, b"").unwrap(), vec![id]);
        // Clamp kicks in for a zero max.
        assert_eq!(manager.search(0, 0, b"").unwrap().len(), 1);
    }

    #[test]
    fn search_reports_parse_errors_with_offset() {
        let manager = manager();
        let err = manager.search(10, 1, b"bad query").unwrap_err();
        assert_eq!(err.to_string(), "failed to parse query:4: expected ':'");
    }

    #[test]
    fn search_filters_by_ratio() {
        let manager = manager();
        manager.add_string_category("mode");
        manager.add_int_category("size");

        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        manager
            .index
            .insert(&query::parse(b"mode: ffa size: 8").unwrap(), a);
        manager.index.insert(&query::parse(b"mode: ffa").unwrap(), b);

        let mut both = manager.search(10, 1, b"mode: ffa size: 5-10").unwrap();
        both.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(both, expected);

        assert_eq!(manager.search(10, 2, b"mode: ffa size: 5-10").unwrap(), vec![a]);
    }
}
