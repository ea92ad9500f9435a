//! # Keeper Wire Protocol Library
//!
//! Everything a keeper client and the keeper server must agree on byte for
//! byte: the typed binary codec, the paired AES-CBC stream ciphers, and the
//! packet framing with its opcode taxonomy.
//!
//! ## Codec (`codec`)
//! Length-prefixed big-endian reads and writes of the primitive shapes used
//! throughout the protocol (u32/u64, uuids, sized byte runs), plus a
//! capacity calculator so frame encoding never reallocates.
//!
//! ## Crypto (`crypto`)
//! A 64-byte [`crypto::Key`] (AES-256 key + two IV seeds) feeds a
//! [`crypto::Cipher`] holding two independent engines:
//!
//! - **TCP**: both sides ratchet their IV after every frame. TCP guarantees
//!   ordered delivery, so the ratchets can never diverge.
//! - **UDP**: every datagram carries a generation number indexing into the
//!   sender's IV ratchet; the receiver keeps a sliding window of past IVs so
//!   reordered or duplicated datagrams still decrypt, while datagrams older
//!   than the window are rejected as lost.
//!
//! ## Packets (`packet`)
//! Frame layouts for both directions and the decoder for the encrypted
//! inner body (session, opcode, targets, payload). Client frames lead with
//! the clear user id so the server can select the right cipher before
//! decrypting anything.

pub mod codec;
pub mod crypto;
pub mod packet;
