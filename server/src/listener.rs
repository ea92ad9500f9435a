//! TCP accept loop and the dual-channel handshake.
//!
//! Every accepted socket gets a verifier thread: it must deliver one
//! encrypted `ConnectionRequest` within a second, then its UDP twin must
//! show up in the pending table within three. A paired [`Connection`] is
//! handed to the acceptor named at the head of the handshake payload and
//! the one-shot key that bootstrapped the cipher is discarded.

use std::collections::HashMap;
use std::net::{TcpListener as StdTcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use keeper_shared::codec::Reader;
use keeper_shared::packet::Opcode;
use log::{debug, error, info};
use parking_lot::RwLock;

use crate::connection::Connection;
use crate::packets::{decode_first_contact, read_packet, ClientPacket};
use crate::state::State;
use crate::udp::UdpListener;

/// How many one-second polls the verifier gives the UDP datagram.
const UDP_TRIES: u32 = 3;

/// Takes ownership of a freshly paired connection together with the
/// handshake packet (its payload already stripped of the acceptor id).
pub trait Acceptor: Send + Sync {
    fn accept(&self, conn: Arc<Connection>, packet: ClientPacket);
}

pub struct Listener {
    state: Arc<State>,
    tcp: StdTcpListener,
    udp: Arc<UdpListener>,
    acceptors: RwLock<HashMap<String, Arc<dyn Acceptor>>>,
}

impl Listener {
    /// Binds both data-plane sockets and starts the UDP reader.
    pub fn new(state: Arc<State>, addr: &str) -> anyhow::Result<Arc<Listener>> {
        info!("Listening TCP ({addr})...");
        let tcp = StdTcpListener::bind(addr).context("failed to create inner TCP listener")?;

        info!("Listening UDP ({addr})...");
        let udp = UdpListener::bind(addr).context("failed to create inner UDP listener")?;
        Arc::clone(&udp).spawn_reader(Arc::clone(&state));

        Ok(Arc::new(Listener {
            state,
            tcp,
            udp,
            acceptors: RwLock::new(HashMap::new()),
        }))
    }

    pub fn udp(&self) -> &Arc<UdpListener> {
        &self.udp
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.tcp.local_addr()
    }

    /// Registers the handler for one acceptor id. Call during startup,
    /// before clients connect.
    pub fn register_acceptor(&self, id: impl Into<String>, acceptor: Arc<dyn Acceptor>) {
        let id = id.into();
        info!("Registering acceptor under {id}.");
        self.acceptors.write().insert(id, acceptor);
    }

    /// Starts the accept loop on its own thread.
    pub fn run(self: Arc<Self>) {
        thread::spawn(move || self.accept_loop());
    }

    fn accept_loop(self: Arc<Self>) {
        loop {
            let (stream, addr) = match self.tcp.accept() {
                Ok(accepted) => accepted,
                Err(err) => {
                    error!("tcp server shut down due to error: {err}");
                    std::process::exit(1);
                }
            };

            debug!("Accepted tcp connection from {addr}.");

            let listener = Arc::clone(&self);
            thread::spawn(move || listener.verify(stream));
        }
    }

    /// Runs the handshake for one fresh socket. Every failure path just
    /// drops the stream; the peer learns nothing.
    fn verify(&self, stream: TcpStream) {
        let addr = match stream.peer_addr() {
            Ok(addr) => addr,
            Err(_) => return,
        };

        if stream
            .set_read_timeout(Some(Duration::from_secs(1)))
            .is_err()
        {
            return;
        }
        let data = match read_packet(&stream) {
            Ok(data) => data,
            Err(_) => {
                debug!("Connection {addr} timed out.");
                return;
            }
        };
        if stream.set_read_timeout(None).is_err() {
            return;
        }

        let (packet, cipher) = match decode_first_contact(&self.state, &data, false) {
            Ok(decoded) => decoded,
            Err(err) => {
                debug!("Connection {addr} sent malformed connection request: {err}");
                return;
            }
        };

        if packet.opcode != Opcode::CONNECTION_REQUEST {
            debug!(
                "Initial packet from {addr} has invalid op code. ({} != {})",
                packet.opcode,
                Opcode::CONNECTION_REQUEST
            );
            return;
        }

        for _ in 0..UDP_TRIES {
            thread::sleep(Duration::from_secs(1));
            if let Some(pending) = self.udp.take_pending(packet.session) {
                let conn = Connection::new(stream, Arc::clone(&self.udp), pending, cipher);
                self.accept(packet, conn);
                return;
            }
        }

        debug!("{addr} failed to establish udp connection.");
    }

    fn accept(&self, mut packet: ClientPacket, conn: Arc<Connection>) {
        let mut reader = Reader::new(&packet.data);

        let Some(acceptor_id) = reader.string() else {
            debug!("Failed to read acceptor id from {}.", conn.tcp_addr());
            return;
        };

        let Some(acceptor) = self.acceptors.read().get(&acceptor_id).cloned() else {
            debug!(
                "Failed to find acceptor with id {acceptor_id} for connection {}.",
                conn.tcp_addr()
            );
            return;
        };

        let user_id = packet.user.id();
        let meta = reader.rest().to_vec();
        packet.data = meta;

        acceptor.accept(conn, packet);

        self.state.delete_key(user_id);
    }
}
