//! A paired data-plane connection: one TCP stream, one UDP remote, one
//! cipher.
//!
//! A dedicated reader thread decodes inbound TCP frames into a queue; UDP
//! datagrams land raw in the listener's per-remote buffer. The owning
//! match drains both on its tick. Writes can come from the match thread
//! at any time, the cipher serializes its own IV state.

use std::io::Write;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use keeper_shared::crypto::Cipher;
use keeper_shared::packet::{encode_packet_tcp, encode_packet_udp, Opcode};
use log::debug;
use parking_lot::Mutex;

use crate::packets::{decode_established, read_packet, ClientPacket, ReadError};
use crate::state::State;
use crate::udp::{UdpListener, UdpPacketBuffer};

pub struct Connection {
    tcp: TcpStream,
    tcp_addr: SocketAddr,
    udp: Arc<UdpListener>,
    udp_addr: SocketAddr,
    udp_buffer: Arc<UdpPacketBuffer>,
    cipher: Cipher,
    disconnected: AtomicBool,
    closed: AtomicBool,
    queued: Mutex<Vec<ClientPacket>>,
}

impl Connection {
    pub fn new(
        tcp: TcpStream,
        udp: Arc<UdpListener>,
        udp_addr: SocketAddr,
        cipher: Cipher,
    ) -> Arc<Connection> {
        let tcp_addr = tcp
            .peer_addr()
            .unwrap_or_else(|_| "0.0.0.0:0".parse().expect("static addr"));
        let udp_buffer = udp.add_connection(udp_addr);

        Arc::new(Connection {
            tcp,
            tcp_addr,
            udp,
            udp_addr,
            udp_buffer,
            cipher,
            disconnected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            queued: Mutex::new(Vec::new()),
        })
    }

    pub fn tcp_addr(&self) -> SocketAddr {
        self.tcp_addr
    }

    /// Spawns the reader thread that feeds the inbound TCP queue.
    pub fn spawn_reader(self: Arc<Self>, state: Arc<State>) {
        thread::spawn(move || self.collect_packets(&state));
    }

    fn collect_packets(&self, state: &State) {
        loop {
            let data = match read_packet(&self.tcp) {
                Ok(data) => data,
                Err(ReadError::Disconnected) => {
                    debug!("Connection {} disconnected.", self.tcp_addr);
                    self.disconnected.store(true, Ordering::Release);
                    return;
                }
                Err(err) => {
                    debug!("Error when reading connection {}: {err}", self.tcp_addr);
                    self.disconnected.store(true, Ordering::Release);
                    return;
                }
            };

            match decode_established(state, &data, false, &self.cipher) {
                Ok(packet) => self.queued.lock().push(packet),
                Err(err) => {
                    debug!("Error when decoding packet from {}: {err}", self.tcp_addr)
                }
            }
        }
    }

    /// Drains both channels into `buffer`: queued UDP datagrams first
    /// (decoded here), then the TCP queue in arrival order.
    pub fn harvest_packets(
        &self,
        state: &State,
        buffer: &mut Vec<ClientPacket>,
        helper: &mut Vec<Vec<u8>>,
    ) {
        helper.clear();
        self.udp_buffer.harvest(helper);

        for data in helper.drain(..) {
            match decode_established(state, &data, true, &self.cipher) {
                Ok(packet) => buffer.push(packet),
                Err(err) => {
                    debug!("Error when decoding packet from {}: {err}", self.tcp_addr)
                }
            }
        }

        buffer.append(&mut self.queued.lock());
    }

    pub fn write_packet(&self, opcode: Opcode, data: &[u8], udp: bool) -> std::io::Result<()> {
        if udp {
            self.write_packet_udp(opcode, data)
        } else {
            self.write_packet_tcp(opcode, data)
        }
    }

    pub fn write_packet_tcp(&self, opcode: Opcode, data: &[u8]) -> std::io::Result<()> {
        let frame = encode_packet_tcp(opcode, data, &self.cipher);
        (&self.tcp).write_all(&frame)
    }

    pub fn write_packet_udp(&self, opcode: Opcode, data: &[u8]) -> std::io::Result<()> {
        let frame = encode_packet_udp(opcode, data, &self.cipher);
        self.udp.send_to(&frame, self.udp_addr)
    }

    /// Set by the reader thread on EOF or a read failure; observed by the
    /// match loop on its next tick.
    pub fn disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    /// Idempotent: shuts the TCP stream down (which unblocks the reader)
    /// and releases the UDP ingress slot.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.tcp.shutdown(Shutdown::Both);
            self.udp.remove_connection(self.udp_addr);
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}
