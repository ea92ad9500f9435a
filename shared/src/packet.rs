//! Packet framing: opcode taxonomy, frame layouts for both directions and
//! the decoder for the encrypted inner body.
//!
//! Client frames lead with the clear user id so the receiver can pick the
//! right cipher; the encrypted inner layout is identical on both channels:
//!
//! ```text
//! tcp frame    := u32 size ‖ uuid user_id ‖ enc_tcp(inner ‖ pad)
//! udp datagram := uuid user_id ‖ u32 gen ‖ enc_udp(inner ‖ pad)
//! inner        := uuid session ‖ u32 opcode ‖ u32 target_count
//!                 ‖ uuid[target_count] ‖ payload
//! ```
//!
//! Server frames carry no identity, the client owns exactly one cipher:
//!
//! ```text
//! tcp frame    := u32 size ‖ enc_tcp(u32 opcode ‖ payload ‖ pad)
//! udp datagram := u32 gen ‖ enc_udp(u32 opcode ‖ payload ‖ pad)
//! ```

use std::fmt;

use thiserror::Error;
use uuid::Uuid;

use crate::codec::{Calculator, Reader, Writer};
use crate::crypto::{Cipher, CryptoError, BLOCK_SIZE};

/// Largest datagram the UDP listener will accept.
pub const UDP_MAX_PACKET_SIZE: usize = 65_535;

/// Operation code carried by every packet. Values below
/// [`Opcode::FIRST_CUSTOM`] belong to the protocol; everything above is
/// application-defined and passed through to the match core untouched.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Opcode(pub u32);

impl Opcode {
    pub const ERROR: Opcode = Opcode(0);
    pub const CONNECTION_REQUEST: Opcode = Opcode(1);
    pub const MATCH_JOIN_FAIL: Opcode = Opcode(2);
    pub const MATCH_JOIN_SUCCESS: Opcode = Opcode(3);
    pub const FIRST_CUSTOM: Opcode = Opcode(4);

    pub fn is_custom(self) -> bool {
        self.0 >= Opcode::FIRST_CUSTOM.0
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Opcode::ERROR => "Error",
            Opcode::CONNECTION_REQUEST => "ConnectionRequest",
            Opcode::MATCH_JOIN_FAIL => "MatchJoinFail",
            Opcode::MATCH_JOIN_SUCCESS => "MatchJoinSuccess",
            _ => "Custom",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("packet is missing user id")]
    MissingUserId,
    #[error("packet is missing generation")]
    MissingGen,
    #[error("packet is missing session")]
    MissingSession,
    #[error("packet is missing op code")]
    MissingOpcode,
    #[error("packet is missing target count")]
    MissingTargetCount,
    #[error("packet is missing target")]
    MissingTarget,
    #[error("user id or session is invalid")]
    IdOrSessionInvalid,
    #[error("session is invalid")]
    SessionInvalid,
    #[error("no pending key for this user")]
    MissingKey,
    #[error("failed to decrypt packet: {0}")]
    Crypto(#[from] CryptoError),
}

/// The decrypted inner body of a client packet.
#[derive(Debug, PartialEq, Eq)]
pub struct PacketBody {
    pub session: Uuid,
    pub opcode: Opcode,
    pub targets: Vec<Uuid>,
    pub payload: Vec<u8>,
}

/// Parses the plaintext inner layout shared by both channels.
pub fn decode_body(data: &[u8]) -> Result<PacketBody, PacketError> {
    let mut reader = Reader::new(data);

    let session = reader.uuid().ok_or(PacketError::MissingSession)?;
    let opcode = reader.u32().ok_or(PacketError::MissingOpcode)?;
    let target_count = reader.u32().ok_or(PacketError::MissingTargetCount)?;

    let mut targets = Vec::with_capacity(target_count.min(64) as usize);
    for _ in 0..target_count {
        targets.push(reader.uuid().ok_or(PacketError::MissingTarget)?);
    }

    Ok(PacketBody {
        session,
        opcode: Opcode(opcode),
        targets,
        payload: reader.rest().to_vec(),
    })
}

fn encode_inner(session: Uuid, opcode: Opcode, targets: &[Uuid], payload: &[u8]) -> Vec<u8> {
    let mut calc = Calculator::default();
    calc.uuid().u32().u32();
    for _ in targets {
        calc.uuid();
    }
    calc.rest(payload).pad(BLOCK_SIZE);

    let mut writer = calc.to_writer();
    writer.uuid(session).u32(opcode.0).u32(targets.len() as u32);
    for &target in targets {
        writer.uuid(target);
    }
    writer.rest(payload);
    writer.into_buffer()
}

/// Encodes a server→client TCP frame.
pub fn encode_packet_tcp(opcode: Opcode, data: &[u8], cipher: &Cipher) -> Vec<u8> {
    let mut calc = Calculator::default();
    calc.u32().rest(data).pad(BLOCK_SIZE);

    let mut inner = calc.to_writer();
    inner.u32(opcode.0).rest(data);
    let ciphertext = cipher.encrypt_tcp(inner.into_buffer());

    let mut frame = Writer::with_capacity(4 + ciphertext.len());
    frame.u32(ciphertext.len() as u32).rest(&ciphertext);
    frame.into_buffer()
}

/// Encodes a server→client UDP datagram.
pub fn encode_packet_udp(opcode: Opcode, data: &[u8], cipher: &Cipher) -> Vec<u8> {
    let mut calc = Calculator::default();
    calc.u32().rest(data).pad(BLOCK_SIZE);

    let mut inner = calc.to_writer();
    inner.u32(opcode.0).rest(data);
    let (ciphertext, gen) = cipher.encrypt_udp(inner.into_buffer());

    let mut frame = Writer::with_capacity(4 + ciphertext.len());
    frame.u32(gen).rest(&ciphertext);
    frame.into_buffer()
}

/// Decodes a server→client TCP frame body (the part after the size
/// prefix) into opcode and payload.
pub fn decode_packet_tcp(body: Vec<u8>, cipher: &Cipher) -> Result<(Opcode, Vec<u8>), PacketError> {
    let plain = cipher.decrypt_tcp(body)?;
    split_opcode(&plain)
}

/// Decodes a server→client UDP datagram.
pub fn decode_packet_udp(datagram: &[u8], cipher: &Cipher) -> Result<(Opcode, Vec<u8>), PacketError> {
    let mut reader = Reader::new(datagram);
    let gen = reader.u32().ok_or(PacketError::MissingGen)?;
    let plain = cipher.decrypt_udp(reader.rest().to_vec(), gen)?;
    split_opcode(&plain)
}

fn split_opcode(plain: &[u8]) -> Result<(Opcode, Vec<u8>), PacketError> {
    let mut reader = Reader::new(plain);
    let opcode = reader.u32().ok_or(PacketError::MissingOpcode)?;
    Ok((Opcode(opcode), reader.rest().to_vec()))
}

/// Encodes a client→server TCP frame.
pub fn encode_client_packet_tcp(
    user_id: Uuid,
    session: Uuid,
    opcode: Opcode,
    targets: &[Uuid],
    payload: &[u8],
    cipher: &Cipher,
) -> Vec<u8> {
    let ciphertext = cipher.encrypt_tcp(encode_inner(session, opcode, targets, payload));

    let mut frame = Writer::with_capacity(4 + 16 + ciphertext.len());
    frame
        .u32((16 + ciphertext.len()) as u32)
        .uuid(user_id)
        .rest(&ciphertext);
    frame.into_buffer()
}

/// Encodes a client→server UDP datagram.
pub fn encode_client_packet_udp(
    user_id: Uuid,
    session: Uuid,
    opcode: Opcode,
    targets: &[Uuid],
    payload: &[u8],
    cipher: &Cipher,
) -> Vec<u8> {
    let (ciphertext, gen) = cipher.encrypt_udp(encode_inner(session, opcode, targets, payload));

    let mut frame = Writer::with_capacity(16 + 4 + ciphertext.len());
    frame.uuid(user_id).u32(gen).rest(&ciphertext);
    frame.into_buffer()
}
