//! Per-match runtime: the tick loop, the queued-join inbox and the
//! [`Core`] callback surface user code plugs into.
//!
//! A match owns its users. The users map is touched only while the tick
//! thread holds the runner lock for the duration of a tick; joining
//! connections land in a separate mutex-guarded inbox that any thread may
//! append to and the tick loop swaps out whole. The published user count
//! is an atomic so the control plane can read it without touching match
//! internals.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crossbeam_channel::{tick, Receiver};
use keeper_shared::packet::Opcode;
use log::{debug, error};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::connection::Connection;
use crate::manager::Manager;
use crate::packets::ClientPacket;
use crate::query::{self, Field, ParseError};
use crate::state::{State, User};

const DEFAULT_TICK_RATE: u32 = 30;

/// A user as the match sees it: identity plus the paired connection.
#[derive(Clone)]
pub struct MatchUser {
    pub user: Arc<User>,
    pub conn: Arc<Connection>,
}

struct QueuedUser {
    user: Arc<User>,
    conn: Arc<Connection>,
    meta: Vec<u8>,
}

/// A decoded inbound packet glued to the connection it came from.
pub struct Request {
    pub conn: Arc<Connection>,
    pub packet: ClientPacket,
}

/// Verdict of [`Core::on_connection`].
pub enum Join {
    /// Admit the user; the payload is sent back with `MatchJoinSuccess`.
    Accept(Vec<u8>),
    /// Turn the user away; the message is sent with `MatchJoinFail`.
    Reject(String),
}

/// Match logic supplied by the application. Every method has a default so
/// a core implements only what it cares about; an `Err` from any callback
/// is routed through [`Core::on_error`], whose answer decides whether the
/// match terminates (it does by default).
#[allow(unused_variables)]
pub trait Core: Send {
    fn on_init(&mut self, ctx: &mut MatchCtx, meta: &[u8]) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_connection(
        &mut self,
        ctx: &mut MatchCtx,
        user: &MatchUser,
        meta: &[u8],
    ) -> anyhow::Result<Join> {
        Ok(Join::Accept(Vec::new()))
    }

    fn on_disconnection(&mut self, ctx: &mut MatchCtx, user: &MatchUser) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_custom_request(
        &mut self,
        ctx: &mut MatchCtx,
        requests: &[Request],
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_tick(&mut self, ctx: &mut MatchCtx) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_error(&mut self, ctx: &mut MatchCtx, err: &anyhow::Error) -> bool {
        true
    }

    fn on_end(&mut self, ctx: &mut MatchCtx) {}

    /// Answers `find-match` queries. Runs on a control-plane thread
    /// between ticks, so it must not assume tick context.
    fn on_info_request(&mut self, state: &Arc<State>) -> anyhow::Result<Vec<u8>> {
        Ok(Vec::new())
    }
}

/// The state a tick exclusively owns.
struct RunnerState {
    users: HashMap<Uuid, MatchUser>,
    tag: Vec<Field>,
}

/// What a [`Core`] callback gets to work with: the shared state, the
/// match handle and the tick-owned runner state.
pub struct MatchCtx<'a> {
    state: &'a Arc<State>,
    match_: &'a Match,
    runner: &'a mut RunnerState,
}

impl MatchCtx<'_> {
    pub fn state(&self) -> &Arc<State> {
        self.state
    }

    pub fn match_id(&self) -> Uuid {
        self.match_.id
    }

    pub fn creator(&self) -> Uuid {
        self.match_.creator
    }

    pub fn user_amount(&self) -> usize {
        self.runner.users.len()
    }

    pub fn get_user(&self, id: Uuid) -> Option<&MatchUser> {
        self.runner.users.get(&id)
    }

    /// Sends to the listed targets, or to everyone when `targets` is
    /// `None`. An empty list is a no-op. Absent targets are skipped.
    pub fn send_packet(&self, targets: Option<&[Uuid]>, opcode: Opcode, data: &[u8], udp: bool) {
        match targets {
            Some(targets) => {
                for target in targets {
                    if let Some(user) = self.runner.users.get(target) {
                        if let Err(err) = user.conn.write_packet(opcode, data, udp) {
                            debug!("Failed to send packet to {target}: {err}");
                        }
                    }
                }
            }
            None => {
                for (id, user) in &self.runner.users {
                    if let Err(err) = user.conn.write_packet(opcode, data, udp) {
                        debug!("Failed to send packet to {id}: {err}");
                    }
                }
            }
        }
    }

    /// Passes a packet on exactly as its sender addressed it.
    pub fn resend_packet(&self, packet: &ClientPacket) {
        self.send_packet(Some(&packet.targets), packet.opcode, &packet.data, packet.udp);
    }

    /// Target list for a broadcast that skips one user.
    pub fn all_except(&self, except: Uuid) -> Vec<Uuid> {
        self.runner
            .users
            .keys()
            .filter(|&&id| id != except)
            .copied()
            .collect()
    }

    pub fn set_tick_rate(&self, rate: u32) {
        self.match_.set_tick_rate(rate);
    }

    /// Parses and installs a new tag, atomically swapping the old field
    /// set out of the manager's index. A parse error leaves the existing
    /// tag in place.
    pub fn set_tag(&mut self, tag: &[u8]) -> Result<(), ParseError> {
        let fields = query::parse(tag)?;
        if let Some(manager) = self.match_.manager.upgrade() {
            manager.retag(self.match_.id, &self.runner.tag, &fields);
        }
        self.runner.tag = fields;
        Ok(())
    }

    pub fn terminate(&self) {
        self.match_.terminate();
    }
}

/// One hosted match. Shared handle; the tick loop runs on its own thread
/// via [`Match::run`].
pub struct Match {
    id: Uuid,
    creator: Uuid,
    state: Arc<State>,
    manager: Weak<Manager>,
    core: Mutex<Box<dyn Core>>,
    runner: Mutex<RunnerState>,
    queued: Mutex<Vec<QueuedUser>>,
    user_amount: AtomicU32,
    terminated: AtomicBool,
    ticker: Mutex<Receiver<Instant>>,
}

impl Match {
    /// Builds a match and runs the core's `on_init` synchronously; its
    /// error propagates and the match must not be added.
    pub fn new(
        state: Arc<State>,
        manager: &Arc<Manager>,
        core: Box<dyn Core>,
        creator: &Arc<User>,
        id: Uuid,
        meta: &[u8],
    ) -> anyhow::Result<Arc<Match>> {
        let id = if id.is_nil() { Uuid::new_v4() } else { id };

        let match_ = Arc::new(Match {
            id,
            creator: creator.id(),
            state,
            manager: Arc::downgrade(manager),
            core: Mutex::new(core),
            runner: Mutex::new(RunnerState { users: HashMap::new(), tag: Vec::new() }),
            queued: Mutex::new(Vec::new()),
            user_amount: AtomicU32::new(0),
            terminated: AtomicBool::new(false),
            ticker: Mutex::new(tick(tick_interval(DEFAULT_TICK_RATE))),
        });

        let mut core = match_.core.lock();
        let mut runner = match_.runner.lock();
        core.on_init(
            &mut MatchCtx { state: &match_.state, match_: &match_, runner: &mut runner },
            meta,
        )?;
        drop(runner);
        drop(core);

        Ok(match_)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn creator(&self) -> Uuid {
        self.creator
    }

    /// Number of users as of the last tick. Safe from any thread.
    pub fn user_amount(&self) -> u32 {
        self.user_amount.load(Ordering::Acquire)
    }

    /// Queues a user for the tick loop to admit. Thread safe; the match
    /// picks the user up no later than its next tick.
    pub fn connect_user(&self, user: Arc<User>, conn: Arc<Connection>, meta: Vec<u8>) {
        self.queued.lock().push(QueuedUser { user, conn, meta });
    }

    /// The core's answer for `find-match`; an error degrades to empty
    /// info rather than failing the search.
    pub fn info(&self) -> Vec<u8> {
        match self.core.lock().on_info_request(&self.state) {
            Ok(info) => info,
            Err(err) => {
                error!("Error while getting match info: {err}");
                Vec::new()
            }
        }
    }

    pub fn set_tick_rate(&self, rate: u32) {
        assert!(rate > 0, "tick rate cannot be 0");
        *self.ticker.lock() = tick(tick_interval(rate));
    }

    /// Cooperative: the loop observes the flag at its next iteration.
    pub fn terminate(&self) {
        self.terminated.store(true, Ordering::Release);
    }

    /// The match main loop. Runs until termination; `on_end` fires
    /// exactly once on every exit path.
    pub fn run(self: Arc<Self>) {
        self.run_loop();
        self.cleanup();
        debug!("Match {} terminated", self.id);
    }

    fn run_loop(&self) {
        let mut buffer: Vec<ClientPacket> = Vec::new();
        let mut requests: Vec<Request> = Vec::new();
        let mut helper: Vec<Vec<u8>> = Vec::new();

        while !self.terminated.load(Ordering::Acquire) {
            {
                let mut core = self.core.lock();
                let mut runner = self.runner.lock();
                let user_amount = runner.users.len();

                // Disconnections and inbound traffic.
                let ids: Vec<Uuid> = runner.users.keys().copied().collect();
                for id in ids {
                    let Some(member) = runner.users.get(&id).cloned() else { continue };

                    if member.conn.disconnected() {
                        let result = core.on_disconnection(
                            &mut MatchCtx { state: &self.state, match_: self, runner: &mut runner },
                            &member,
                        );
                        if self.handle_err(&mut core, &mut runner, result.err()) {
                            return;
                        }
                        member.conn.close();
                        runner.users.remove(&id);
                        continue;
                    }

                    buffer.clear();
                    requests.clear();
                    member.conn.harvest_packets(&self.state, &mut buffer, &mut helper);
                    for packet in buffer.drain(..) {
                        requests.push(Request { conn: Arc::clone(&member.conn), packet });
                    }

                    let result = core.on_custom_request(
                        &mut MatchCtx { state: &self.state, match_: self, runner: &mut runner },
                        &requests,
                    );
                    if self.handle_err(&mut core, &mut runner, result.err()) {
                        return;
                    }
                }

                // Queued joins, swapped out whole under the lock.
                let joining = std::mem::take(&mut *self.queued.lock());
                for queued in joining {
                    let member = MatchUser { user: queued.user, conn: queued.conn };
                    let verdict = core.on_connection(
                        &mut MatchCtx { state: &self.state, match_: self, runner: &mut runner },
                        &member,
                        &queued.meta,
                    );

                    match verdict {
                        Err(fatal) => {
                            if self.handle_err(&mut core, &mut runner, Some(fatal)) {
                                return;
                            }
                        }
                        Ok(Join::Reject(message)) => {
                            if let Err(err) = member
                                .conn
                                .write_packet_tcp(Opcode::MATCH_JOIN_FAIL, message.as_bytes())
                            {
                                debug!("Failed to reject join: {err}");
                            }
                        }
                        Ok(Join::Accept(meta)) => {
                            if let Err(err) =
                                member.conn.write_packet_tcp(Opcode::MATCH_JOIN_SUCCESS, &meta)
                            {
                                debug!("Failed to confirm join: {err}");
                            }
                            runner.users.insert(member.user.id(), member);
                        }
                    }
                }

                let result = core.on_tick(&mut MatchCtx {
                    state: &self.state,
                    match_: self,
                    runner: &mut runner,
                });
                if self.handle_err(&mut core, &mut runner, result.err()) {
                    return;
                }

                if runner.users.len() != user_amount {
                    self.user_amount
                        .store(runner.users.len() as u32, Ordering::Release);
                }
            }

            // Both locks are released across the wait so the control
            // plane can query info between ticks.
            let ticker = self.ticker.lock().clone();
            let _ = ticker.recv();
        }

        let mut core = self.core.lock();
        let mut runner = self.runner.lock();
        core.on_end(&mut MatchCtx { state: &self.state, match_: self, runner: &mut runner });
    }

    /// Routes a callback error through the core. Returns true when the
    /// match must terminate; `on_end` has then already run.
    fn handle_err(
        &self,
        core: &mut Box<dyn Core>,
        runner: &mut RunnerState,
        err: Option<anyhow::Error>,
    ) -> bool {
        let Some(err) = err else { return false };

        let terminate = core.on_error(
            &mut MatchCtx { state: &self.state, match_: self, runner: &mut *runner },
            &err,
        );
        if terminate {
            core.on_end(&mut MatchCtx { state: &self.state, match_: self, runner: &mut *runner });
        }
        terminate
    }

    /// Releases everything the match held: user connections, the registry
    /// entry and the tag fields in the index.
    fn cleanup(&self) {
        let mut runner = self.runner.lock();
        for (_, member) in runner.users.drain() {
            member.conn.close();
        }
        for queued in self.queued.lock().drain(..) {
            queued.conn.close();
        }
        if let Some(manager) = self.manager.upgrade() {
            manager.remove_match(self.id, &runner.tag);
        }
        runner.tag.clear();
    }
}

fn tick_interval(rate: u32) -> Duration {
    Duration::from_secs_f64(1.0 / f64::from(rate))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "tick rate cannot be 0")]
    fn zero_tick_rate_panics() {
        let state = crate::state::State::new(crate::config::Config::default(), None);
        let manager = Manager::new(state.clone());
        let creator = Arc::new(User::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Duration::from_secs(60),
            "t",
        ));
        struct Noop;
        impl Core for Noop {}
        let match_ =
            Match::new(state, &manager, Box::new(Noop), &creator, Uuid::nil(), &[]).unwrap();
        match_.set_tick_rate(0);
    }

    #[test]
    fn on_init_failure_propagates() {
        let state = crate::state::State::new(crate::config::Config::default(), None);
        let manager = Manager::new(state.clone());
        let creator = Arc::new(User::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Duration::from_secs(60),
            "t",
        ));

        struct Failing;
        impl Core for Failing {
            fn on_init(&mut self, _ctx: &mut MatchCtx, _meta: &[u8]) -> anyhow::Result<()> {
                Err(anyhow::anyhow!("bad meta"))
            }
        }

        let result = Match::new(state, &manager, Box::new(Failing), &creator, Uuid::nil(), &[]);
        assert!(result.is_err());
    }

    #[test]
    fn nil_id_gets_generated() {
        let state = crate::state::State::new(crate::config::Config::default(), None);
        let manager = Manager::new(state.clone());
        let creator = Arc::new(User::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Duration::from_secs(60),
            "t",
        ));

        struct Noop;
        impl Core for Noop {}

        let match_ =
            Match::new(state.clone(), &manager, Box::new(Noop), &creator, Uuid::nil(), &[])
                .unwrap();
        assert!(!match_.id().is_nil());
        assert_eq!(match_.creator(), creator.id());

        let fixed = Uuid::new_v4();
        let match_ =
            Match::new(state, &manager, Box::new(Noop), &creator, fixed, &[]).unwrap();
        assert_eq!(match_.id(), fixed);
    }

    #[test]
    fn tick_rate_controls_loop_frequency() {
        let state = crate::state::State::new(crate::config::Config::default(), None);
        let manager = Manager::new(state.clone());
        let creator = Arc::new(User::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Duration::from_secs(60),
            "t",
        ));

        struct Fast {
            ticks: Arc<AtomicU32>,
        }
        impl Core for Fast {
            fn on_init(&mut self, ctx: &mut MatchCtx, _meta: &[u8]) -> anyhow::Result<()> {
                ctx.set_tick_rate(200);
                Ok(())
            }
            fn on_tick(&mut self, _ctx: &mut MatchCtx) -> anyhow::Result<()> {
                self.ticks.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
        }

        let ticks = Arc::new(AtomicU32::new(0));
        let match_ = Match::new(
            state,
            &manager,
            Box::new(Fast { ticks: Arc::clone(&ticks) }),
            &creator,
            Uuid::nil(),
            &[],
        )
        .unwrap();
        manager.add_match(Arc::clone(&match_));

        std::thread::sleep(Duration::from_millis(300));
        let while_running = ticks.load(Ordering::Relaxed);
        // The 30 Hz default would manage roughly 9 ticks in this window.
        assert!(while_running > 25, "only {while_running} ticks at 200 Hz");

        match_.terminate();
        std::thread::sleep(Duration::from_millis(100));
        let after_terminate = ticks.load(Ordering::Relaxed);
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(ticks.load(Ordering::Relaxed), after_terminate);
    }

    #[test]
    fn init_can_tag_the_match() {
        let state = crate::state::State::new(crate::config::Config::default(), None);
        let manager = Manager::new(state.clone());
        manager.add_string_category("mode");
        let creator = Arc::new(User::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Duration::from_secs(60),
            "t",
        ));

        struct Tagging;
        impl Core for Tagging {
            fn on_init(&mut self, ctx: &mut MatchCtx, _meta: &[u8]) -> anyhow::Result<()> {
                ctx.set_tag(b"mode: deathmatch").map_err(|err| anyhow::anyhow!("{err}"))?;
                // A broken tag must not clobber the good one.
                assert!(ctx.set_tag(b"mode deathmatch").is_err());
                Ok(())
            }
        }

        let match_ =
            Match::new(state, &manager, Box::new(Tagging), &creator, Uuid::nil(), &[]).unwrap();
        let found = manager.search(10, 1, b"mode: death").unwrap();
        assert_eq!(found, vec![match_.id()]);
    }
}
