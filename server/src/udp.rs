//! UDP side of the data plane: one socket, one reader thread, a packet
//! buffer per established remote and a pending table for handshakes.
//!
//! The reader never decrypts traffic for established remotes, it only
//! clones the datagram into the remote's buffer; the owning match drains
//! and decodes on its own thread. Datagrams from unknown remotes must be
//! a valid `ConnectionRequest` to end up in the pending table, anything
//! else is dropped silently.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::thread;

use keeper_shared::packet::{Opcode, UDP_MAX_PACKET_SIZE};
use log::{debug, error};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::packets::decode_first_contact;
use crate::state::State;

pub struct UdpListener {
    socket: UdpSocket,
    connections: Mutex<HashMap<SocketAddr, Arc<UdpPacketBuffer>>>,
    pending: Mutex<HashMap<Uuid, SocketAddr>>,
}

impl UdpListener {
    pub fn bind(addr: &str) -> std::io::Result<Arc<UdpListener>> {
        let socket = UdpSocket::bind(addr)?;
        Ok(Arc::new(UdpListener {
            socket,
            connections: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
        }))
    }

    pub fn spawn_reader(self: Arc<Self>, state: Arc<State>) {
        thread::spawn(move || self.collect_packets(&state));
    }

    fn collect_packets(&self, state: &State) {
        let mut buffer = [0u8; UDP_MAX_PACKET_SIZE];
        loop {
            let (len, addr) = match self.socket.recv_from(&mut buffer) {
                Ok(received) => received,
                // Reflected ICMP noise from a peer that went away; the
                // socket itself is fine.
                Err(err) if err.kind() == ErrorKind::ConnectionReset => continue,
                Err(err) => {
                    error!("udp server shut down due to error: {err}");
                    std::process::exit(1);
                }
            };

            let packet = buffer[..len].to_vec();

            let established = self.connections.lock().get(&addr).cloned();
            let Some(ingress) = established else {
                self.handle_first_contact(state, packet, addr);
                continue;
            };
            ingress.add(packet);
        }
    }

    /// The pending-table write happens only for a well-formed encrypted
    /// `ConnectionRequest`; the cipher built for the check is discarded,
    /// pairing needs nothing but the session.
    fn handle_first_contact(&self, state: &State, packet: Vec<u8>, addr: SocketAddr) {
        let packet = match decode_first_contact(state, &packet, true) {
            Ok((packet, _cipher)) => packet,
            Err(err) => {
                debug!("Initial udp packet from {addr} is invalid: {err}");
                return;
            }
        };

        if packet.opcode != Opcode::CONNECTION_REQUEST {
            debug!(
                "Initial udp packet from {addr} has invalid op code. ({} != {})",
                packet.opcode,
                Opcode::CONNECTION_REQUEST
            );
            return;
        }

        self.put_pending(packet.session, addr);
    }

    /// Removes and returns the remote address a session's first datagram
    /// came from.
    pub fn take_pending(&self, session: Uuid) -> Option<SocketAddr> {
        self.pending.lock().remove(&session)
    }

    fn put_pending(&self, session: Uuid, addr: SocketAddr) {
        self.pending.lock().insert(session, addr);
    }

    /// Registers an ingress buffer for an established remote.
    pub fn add_connection(&self, addr: SocketAddr) -> Arc<UdpPacketBuffer> {
        let buffer = Arc::new(UdpPacketBuffer::default());
        self.connections.lock().insert(addr, Arc::clone(&buffer));
        buffer
    }

    pub fn remove_connection(&self, addr: SocketAddr) {
        self.connections.lock().remove(&addr);
    }

    pub fn send_to(&self, data: &[u8], addr: SocketAddr) -> std::io::Result<()> {
        self.socket.send_to(data, addr).map(|_| ())
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

/// Raw datagrams queued for one remote until its match harvests them.
#[derive(Default)]
pub struct UdpPacketBuffer {
    buffer: Mutex<Vec<Vec<u8>>>,
}

impl UdpPacketBuffer {
    pub fn add(&self, packet: Vec<u8>) {
        self.buffer.lock().push(packet);
    }

    /// Appends all queued datagrams to `out` in arrival order.
    pub fn harvest(&self, out: &mut Vec<Vec<u8>>) {
        let mut buffer = self.buffer.lock();
        out.append(&mut buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_buffer_preserves_arrival_order() {
        let buffer = UdpPacketBuffer::default();
        buffer.add(vec![1]);
        buffer.add(vec![2]);
        buffer.add(vec![3]);

        let mut out = Vec::new();
        buffer.harvest(&mut out);
        assert_eq!(out, vec![vec![1], vec![2], vec![3]]);

        out.clear();
        buffer.harvest(&mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn pending_entries_are_one_shot() {
        let listener = UdpListener::bind("127.0.0.1:0").unwrap();
        let session = Uuid::new_v4();
        let addr: SocketAddr = "127.0.0.1:9999".parse().unwrap();

        listener.put_pending(session, addr);
        assert_eq!(listener.take_pending(session), Some(addr));
        assert_eq!(listener.take_pending(session), None);
    }

    #[test]
    fn connection_buffers_are_scoped_to_registration() {
        let listener = UdpListener::bind("127.0.0.1:0").unwrap();
        let addr: SocketAddr = "127.0.0.1:9999".parse().unwrap();

        let buffer = listener.add_connection(addr);
        buffer.add(vec![7]);
        listener.remove_connection(addr);

        // The handle stays valid for whoever still holds it; only the
        // routing entry is gone.
        let mut out = Vec::new();
        buffer.harvest(&mut out);
        assert_eq!(out, vec![vec![7]]);
        assert!(listener.connections.lock().is_empty());
    }
}
