//! State-aware packet decoding and the TCP frame reader.
//!
//! Client frames arrive with a clear 16-byte user id so the server can
//! pick the right cipher before touching the ciphertext. Two decode paths
//! exist: the handshake path materializes a cipher from the user's
//! pending one-shot key, the established path reuses the cipher owned by
//! the connection.

use std::io::{self, ErrorKind, Read};
use std::sync::Arc;

use keeper_shared::codec::Reader;
use keeper_shared::crypto::Cipher;
use keeper_shared::packet::{decode_body, Opcode, PacketError};
use thiserror::Error;
use uuid::Uuid;

use crate::state::{State, User};

/// Upper bound on a single TCP frame; anything larger is a broken or
/// hostile peer.
pub const MAX_TCP_PACKET_SIZE: usize = 1_000_000;

/// A fully decoded, authenticated client packet.
pub struct ClientPacket {
    pub opcode: Opcode,
    pub session: Uuid,
    pub targets: Vec<Uuid>,
    pub data: Vec<u8>,
    pub udp: bool,
    pub user: Arc<User>,
}

#[derive(Debug, Error)]
pub enum ReadError {
    #[error("connection closed")]
    Disconnected,
    #[error("packet size {0} exceeds limit")]
    TooLarge(usize),
    #[error("failed to read packet size: {0}")]
    Size(io::Error),
    #[error("failed to read packet content: {0}")]
    Content(io::Error),
}

/// Reads one length-prefixed frame with read-exact semantics. A clean or
/// mid-frame EOF reports a disconnect, everything else is an error.
pub fn read_packet(mut stream: impl Read) -> Result<Vec<u8>, ReadError> {
    let mut size_buf = [0u8; 4];
    stream.read_exact(&mut size_buf).map_err(|err| match err.kind() {
        ErrorKind::UnexpectedEof => ReadError::Disconnected,
        _ => ReadError::Size(err),
    })?;

    let size = u32::from_be_bytes(size_buf) as usize;
    if size > MAX_TCP_PACKET_SIZE {
        return Err(ReadError::TooLarge(size));
    }

    let mut buffer = vec![0u8; size];
    stream.read_exact(&mut buffer).map_err(|err| match err.kind() {
        ErrorKind::UnexpectedEof => ReadError::Disconnected,
        _ => ReadError::Content(err),
    })?;

    Ok(buffer)
}

/// Decodes a frame from an established connection using its cipher.
pub fn decode_established(
    state: &State,
    data: &[u8],
    udp: bool,
    cipher: &Cipher,
) -> Result<ClientPacket, PacketError> {
    let (user_id, gen, ciphertext) = split_frame(data, udp)?;
    let user = state
        .get_user(Uuid::nil(), user_id)
        .ok_or(PacketError::IdOrSessionInvalid)?;

    decrypt_and_check(user, gen, ciphertext, udp, cipher)
}

/// Decodes a first-contact frame: looks up the sender's pending one-shot
/// key and materializes the cipher the connection will keep using.
pub fn decode_first_contact(
    state: &State,
    data: &[u8],
    udp: bool,
) -> Result<(ClientPacket, Cipher), PacketError> {
    let (user_id, gen, ciphertext) = split_frame(data, udp)?;
    let user = state
        .get_user(Uuid::nil(), user_id)
        .ok_or(PacketError::IdOrSessionInvalid)?;
    let key = state.get_key(user_id).ok_or(PacketError::MissingKey)?;

    let cipher = Cipher::with_key(key);
    let packet = decrypt_and_check(user, gen, ciphertext, udp, &cipher)?;
    Ok((packet, cipher))
}

fn split_frame(data: &[u8], udp: bool) -> Result<(Uuid, Option<u32>, &[u8]), PacketError> {
    let mut reader = Reader::new(data);
    let user_id = reader.uuid().ok_or(PacketError::MissingUserId)?;
    let gen = if udp {
        Some(reader.u32().ok_or(PacketError::MissingGen)?)
    } else {
        None
    };
    Ok((user_id, gen, reader.rest()))
}

fn decrypt_and_check(
    user: Arc<User>,
    gen: Option<u32>,
    ciphertext: &[u8],
    udp: bool,
    cipher: &Cipher,
) -> Result<ClientPacket, PacketError> {
    let plaintext = match gen {
        Some(gen) => cipher.decrypt_udp(ciphertext.to_vec(), gen)?,
        None => cipher.decrypt_tcp(ciphertext.to_vec())?,
    };

    let body = decode_body(&plaintext)?;
    if body.session != user.session() {
        return Err(PacketError::SessionInvalid);
    }

    Ok(ClientPacket {
        opcode: body.opcode,
        session: body.session,
        targets: body.targets,
        data: body.payload,
        udp,
        user,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use keeper_shared::packet::{encode_client_packet_tcp, encode_client_packet_udp};
    use std::io::Cursor;
    use std::time::Duration;

    fn state_with_user() -> (Arc<State>, Arc<User>) {
        let state = State::new(Config::default(), None);
        let user = Arc::new(User::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Duration::from_secs(60),
            "127.0.0.1",
        ));
        state.add_user(Arc::clone(&user));
        (state, user)
    }

    #[test]
    fn read_packet_roundtrip() {
        let mut frame = 5u32.to_be_bytes().to_vec();
        frame.extend_from_slice(b"hello");
        assert_eq!(read_packet(Cursor::new(frame)).unwrap(), b"hello");
    }

    #[test]
    fn read_packet_eof_is_disconnect() {
        assert!(matches!(
            read_packet(Cursor::new(Vec::new())),
            Err(ReadError::Disconnected)
        ));

        // EOF mid-body counts as a disconnect too.
        let mut frame = 10u32.to_be_bytes().to_vec();
        frame.extend_from_slice(b"shor");
        assert!(matches!(
            read_packet(Cursor::new(frame)),
            Err(ReadError::Disconnected)
        ));
    }

    #[test]
    fn read_packet_rejects_oversized_frames() {
        let frame = (MAX_TCP_PACKET_SIZE as u32 + 1).to_be_bytes().to_vec();
        assert!(matches!(
            read_packet(Cursor::new(frame)),
            Err(ReadError::TooLarge(_))
        ));
    }

    #[test]
    fn first_contact_materializes_cipher() {
        let (state, user) = state_with_user();
        let key = state.create_key(user.id());
        let client = Cipher::with_key(key);

        let frame = encode_client_packet_tcp(
            user.id(),
            user.session(),
            Opcode::CONNECTION_REQUEST,
            &[],
            b"match",
            &client,
        );

        // The frame body is everything after the size prefix.
        let (packet, cipher) = decode_first_contact(&state, &frame[4..], false).unwrap();
        assert_eq!(packet.opcode, Opcode::CONNECTION_REQUEST);
        assert_eq!(packet.data, b"match");
        assert_eq!(packet.user.id(), user.id());

        // The materialized cipher continues the same TCP stream.
        let next = encode_client_packet_tcp(
            user.id(),
            user.session(),
            Opcode(7),
            &[],
            b"more",
            &client,
        );
        let packet = decode_established(&state, &next[4..], false, &cipher).unwrap();
        assert_eq!(packet.opcode, Opcode(7));
        assert_eq!(packet.data, b"more");
    }

    #[test]
    fn missing_key_and_unknown_user() {
        let (state, user) = state_with_user();
        let client = Cipher::new();

        let frame = encode_client_packet_tcp(
            user.id(),
            user.session(),
            Opcode::CONNECTION_REQUEST,
            &[],
            b"",
            &client,
        );
        assert_eq!(
            decode_first_contact(&state, &frame[4..], false).err(),
            Some(PacketError::MissingKey)
        );

        let stranger = encode_client_packet_tcp(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Opcode::CONNECTION_REQUEST,
            &[],
            b"",
            &client,
        );
        assert_eq!(
            decode_first_contact(&state, &stranger[4..], false).err(),
            Some(PacketError::IdOrSessionInvalid)
        );
    }

    #[test]
    fn wrong_inner_session_is_rejected() {
        let (state, user) = state_with_user();
        let key = state.create_key(user.id());
        let client = Cipher::with_key(key);

        let frame = encode_client_packet_tcp(
            user.id(),
            Uuid::new_v4(),
            Opcode::CONNECTION_REQUEST,
            &[],
            b"",
            &client,
        );
        assert_eq!(
            decode_first_contact(&state, &frame[4..], false).err(),
            Some(PacketError::SessionInvalid)
        );
    }

    #[test]
    fn udp_frame_decodes_with_gen() {
        let (state, user) = state_with_user();
        let key = state.create_key(user.id());
        let client = Cipher::with_key(key);
        let server = Cipher::with_key(key);

        let datagram = encode_client_packet_udp(
            user.id(),
            user.session(),
            Opcode(9),
            &[user.id()],
            b"udp",
            &client,
        );
        let packet = decode_established(&state, &datagram, true, &server).unwrap();
        assert_eq!(packet.opcode, Opcode(9));
        assert_eq!(packet.targets, vec![user.id()]);
        assert!(packet.udp);

        // A bare user id with no generation word is incomplete.
        assert_eq!(
            decode_established(&state, user.id().as_bytes(), true, &server).err(),
            Some(PacketError::MissingGen)
        );
    }
}
