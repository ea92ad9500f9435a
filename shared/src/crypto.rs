//! AES-256-CBC engines for the two transport channels.
//!
//! One [`Key`] carries the AES key plus a separate IV seed per channel.
//! Instead of shipping an IV with every message, both peers ratchet their
//! IVs in lockstep: after a frame is processed the IV is replaced with its
//! own block-encryption. The TCP engine can rely on ordered delivery and
//! keeps a single IV per direction; the UDP engine tags every datagram
//! with the generation of the IV that encrypted it and keeps a bounded
//! window of past IVs on the receive side so reordering and duplication
//! survive while anything older than the window is reported lost.

use std::collections::VecDeque;

use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::{Aes256, Block};
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;

pub const KEY_SIZE: usize = 32;
pub const BLOCK_SIZE: usize = 16;

/// How many past IVs the UDP decrypt side retains.
const UDP_WINDOW: usize = 30;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid padding")]
    InvalidPadding,
    #[error("packet lost")]
    PacketLost,
    #[error("ciphertext is not a whole number of blocks")]
    InvalidLength,
}

/// The 64-byte shared secret: AES-256 key, TCP IV seed, UDP IV seed.
#[derive(Clone, Copy)]
pub struct Key([u8; Key::SIZE]);

impl Key {
    pub const SIZE: usize = KEY_SIZE + BLOCK_SIZE * 2;

    /// Generates a key from the OS CSPRNG.
    pub fn generate() -> Key {
        let mut bytes = [0u8; Key::SIZE];
        OsRng.fill_bytes(&mut bytes);
        Key(bytes)
    }

    pub fn from_bytes(bytes: [u8; Key::SIZE]) -> Key {
        Key(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; Key::SIZE] {
        &self.0
    }

    fn tcp_iv(&self) -> [u8; BLOCK_SIZE] {
        self.0[KEY_SIZE..KEY_SIZE + BLOCK_SIZE].try_into().unwrap()
    }

    fn udp_iv(&self) -> [u8; BLOCK_SIZE] {
        self.0[KEY_SIZE + BLOCK_SIZE..].try_into().unwrap()
    }
}

/// Replaces the IV with its own block-encryption.
fn ratchet(aes: &Aes256, iv: &mut [u8; BLOCK_SIZE]) {
    aes.encrypt_block(Block::from_mut_slice(iv));
}

/// In-place CBC over whole blocks. Callers guarantee the length.
fn cbc_encrypt(aes: &Aes256, iv: &[u8; BLOCK_SIZE], buf: &mut [u8]) {
    let mut prev = *iv;
    for chunk in buf.chunks_exact_mut(BLOCK_SIZE) {
        for (byte, mask) in chunk.iter_mut().zip(prev.iter()) {
            *byte ^= mask;
        }
        aes.encrypt_block(Block::from_mut_slice(chunk));
        prev.copy_from_slice(chunk);
    }
}

fn cbc_decrypt(aes: &Aes256, iv: &[u8; BLOCK_SIZE], buf: &mut [u8]) {
    let mut prev = *iv;
    for chunk in buf.chunks_exact_mut(BLOCK_SIZE) {
        let saved: [u8; BLOCK_SIZE] = (&*chunk).try_into().unwrap();
        aes.decrypt_block(Block::from_mut_slice(chunk));
        for (byte, mask) in chunk.iter_mut().zip(prev.iter()) {
            *byte ^= mask;
        }
        prev = saved;
    }
}

/// Engine for the ordered channel: one IV per direction, ratcheted after
/// every frame. Works only because TCP never drops or reorders frames.
struct CbcTcp {
    enc_iv: [u8; BLOCK_SIZE],
    dec_iv: [u8; BLOCK_SIZE],
}

impl CbcTcp {
    fn new(iv: [u8; BLOCK_SIZE]) -> CbcTcp {
        CbcTcp { enc_iv: iv, dec_iv: iv }
    }

    fn encrypt(&mut self, aes: &Aes256, buf: &mut [u8]) {
        cbc_encrypt(aes, &self.enc_iv, buf);
        ratchet(aes, &mut self.enc_iv);
    }

    fn decrypt(&mut self, aes: &Aes256, buf: &mut [u8]) {
        cbc_decrypt(aes, &self.dec_iv, buf);
        ratchet(aes, &mut self.dec_iv);
    }
}

/// Engine for the lossy channel. The encrypt side ratchets monotonically
/// and reports the generation it used; the decrypt side materializes IVs
/// on demand and keeps the last [`UDP_WINDOW`] of them, addressed by the
/// distance from its newest generation.
struct CbcUdp {
    enc_iv: [u8; BLOCK_SIZE],
    enc_gen: u32,
    dec_ivs: VecDeque<[u8; BLOCK_SIZE]>,
    dec_gen: u32,
}

impl CbcUdp {
    fn new(iv: [u8; BLOCK_SIZE]) -> CbcUdp {
        let mut dec_ivs = VecDeque::with_capacity(UDP_WINDOW);
        dec_ivs.push_back(iv);
        CbcUdp { enc_iv: iv, enc_gen: 0, dec_ivs, dec_gen: 0 }
    }

    fn encrypt(&mut self, aes: &Aes256, buf: &mut [u8]) -> u32 {
        let gen = self.enc_gen;
        cbc_encrypt(aes, &self.enc_iv, buf);
        ratchet(aes, &mut self.enc_iv);
        self.enc_gen = self.enc_gen.wrapping_add(1);
        gen
    }

    fn decrypt(&mut self, aes: &Aes256, buf: &mut [u8], gen: u32) -> Result<(), CryptoError> {
        let mut dif = i64::from(self.dec_gen) - i64::from(gen);
        if dif >= self.dec_ivs.len() as i64 {
            return Err(CryptoError::PacketLost);
        }

        // A future generation: ratchet forward until it exists, sliding
        // the window once it is full.
        while dif < 0 {
            let mut next = *self.dec_ivs.back().unwrap();
            ratchet(aes, &mut next);
            if self.dec_ivs.len() == UDP_WINDOW {
                self.dec_ivs.pop_front();
            }
            self.dec_ivs.push_back(next);
            self.dec_gen = self.dec_gen.wrapping_add(1);
            dif += 1;
        }

        let idx = self.dec_ivs.len() - 1 - dif as usize;
        cbc_decrypt(aes, &self.dec_ivs[idx], buf);
        Ok(())
    }
}

/// Binds a [`Key`] to one AES block cipher and the two channel engines.
/// All operations take `&self`; a connection's reader and writer share a
/// cipher through an `Arc`.
pub struct Cipher {
    key: Key,
    aes: Aes256,
    tcp: Mutex<CbcTcp>,
    udp: Mutex<CbcUdp>,
}

impl Cipher {
    /// Creates a cipher with a fresh random key.
    pub fn new() -> Cipher {
        Cipher::with_key(Key::generate())
    }

    pub fn with_key(key: Key) -> Cipher {
        let aes = Aes256::new_from_slice(&key.as_bytes()[..KEY_SIZE])
            .expect("AES-256 key is always 32 bytes");
        Cipher {
            key,
            aes,
            tcp: Mutex::new(CbcTcp::new(key.tcp_iv())),
            udp: Mutex::new(CbcUdp::new(key.udp_iv())),
        }
    }

    pub fn key(&self) -> Key {
        self.key
    }

    pub fn encrypt_tcp(&self, mut plaintext: Vec<u8>) -> Vec<u8> {
        add_padding(&mut plaintext);
        self.tcp.lock().encrypt(&self.aes, &mut plaintext);
        plaintext
    }

    pub fn decrypt_tcp(&self, mut ciphertext: Vec<u8>) -> Result<Vec<u8>, CryptoError> {
        check_blocks(&ciphertext)?;
        self.tcp.lock().decrypt(&self.aes, &mut ciphertext);
        strip_padding(ciphertext)
    }

    /// Returns the ciphertext and the generation that must accompany it.
    pub fn encrypt_udp(&self, mut plaintext: Vec<u8>) -> (Vec<u8>, u32) {
        add_padding(&mut plaintext);
        let gen = self.udp.lock().encrypt(&self.aes, &mut plaintext);
        (plaintext, gen)
    }

    pub fn decrypt_udp(&self, mut ciphertext: Vec<u8>, gen: u32) -> Result<Vec<u8>, CryptoError> {
        check_blocks(&ciphertext)?;
        self.udp.lock().decrypt(&self.aes, &mut ciphertext, gen)?;
        strip_padding(ciphertext)
    }
}

impl Default for Cipher {
    fn default() -> Cipher {
        Cipher::new()
    }
}

fn check_blocks(buf: &[u8]) -> Result<(), CryptoError> {
    if buf.is_empty() || buf.len() % BLOCK_SIZE != 0 {
        return Err(CryptoError::InvalidLength);
    }
    Ok(())
}

/// Appends `16 - (len mod 16)` bytes, each holding the pad length. Always
/// at least one byte, a full block when already aligned.
pub fn add_padding(buf: &mut Vec<u8>) {
    let padding = BLOCK_SIZE - (buf.len() % BLOCK_SIZE);
    buf.resize(buf.len() + padding, padding as u8);
}

/// Validates and removes the padding appended by [`add_padding`].
pub fn remove_padding(buf: &[u8]) -> Result<&[u8], CryptoError> {
    let padding = *buf.last().ok_or(CryptoError::InvalidPadding)? as usize;
    if padding > BLOCK_SIZE {
        return Err(CryptoError::InvalidPadding);
    }
    Ok(&buf[..buf.len() - padding])
}

fn strip_padding(mut buf: Vec<u8>) -> Result<Vec<u8>, CryptoError> {
    let len = remove_padding(&buf)?.len();
    buf.truncate(len);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (Cipher, Cipher) {
        let key = Key::generate();
        (Cipher::with_key(key), Cipher::with_key(key))
    }

    #[test]
    fn tcp_roundtrip_stays_in_sync() {
        let (alice, bob) = pair();

        for i in 0..48usize {
            // Lengths straddling block boundaries, including empty.
            let msg: Vec<u8> = (0..i * 3).map(|b| b as u8).collect();
            let ct = alice.encrypt_tcp(msg.clone());
            assert_eq!(ct.len() % BLOCK_SIZE, 0);
            assert_eq!(bob.decrypt_tcp(ct).unwrap(), msg);

            // And the reverse direction on its own ratchet.
            let reply = vec![i as u8; i];
            let ct = bob.encrypt_tcp(reply.clone());
            assert_eq!(alice.decrypt_tcp(ct).unwrap(), reply);
        }
    }

    #[test]
    fn udp_decrypts_any_order_within_window() {
        let (sender, receiver) = pair();

        let frames: Vec<(Vec<u8>, u32, Vec<u8>)> = (0..10u32)
            .map(|i| {
                let msg = vec![i as u8; 24];
                let (ct, gen) = sender.encrypt_udp(msg.clone());
                assert_eq!(gen, i);
                (ct, gen, msg)
            })
            .collect();

        // Delivery order 2, 0, 3, 1, then the tail reversed.
        for &i in &[2usize, 0, 3, 1, 9, 8, 7, 6, 5, 4] {
            let (ct, gen, msg) = &frames[i];
            assert_eq!(receiver.decrypt_udp(ct.clone(), *gen).unwrap(), *msg);
        }
    }

    #[test]
    fn udp_duplicate_within_window_succeeds() {
        let (sender, receiver) = pair();
        let (ct, gen) = sender.encrypt_udp(b"ping".to_vec());
        assert_eq!(receiver.decrypt_udp(ct.clone(), gen).unwrap(), b"ping");
        assert_eq!(receiver.decrypt_udp(ct, gen).unwrap(), b"ping");
    }

    #[test]
    fn udp_replay_behind_window_is_lost() {
        let (sender, receiver) = pair();

        let mut first = None;
        for i in 0..32u32 {
            let (ct, gen) = sender.encrypt_udp(vec![i as u8; 8]);
            if i == 0 {
                first = Some((ct.clone(), gen));
            }
            receiver.decrypt_udp(ct, gen).unwrap();
        }

        let (ct, gen) = first.unwrap();
        assert_eq!(receiver.decrypt_udp(ct, gen), Err(CryptoError::PacketLost));
    }

    #[test]
    fn padding_is_always_present_and_validated() {
        let mut buf = vec![0u8; 16];
        add_padding(&mut buf);
        assert_eq!(buf.len(), 32);
        assert_eq!(buf[31], 16);
        assert_eq!(remove_padding(&buf).unwrap().len(), 16);

        assert_eq!(remove_padding(&[1, 2, 17]), Err(CryptoError::InvalidPadding));
        assert_eq!(remove_padding(&[]), Err(CryptoError::InvalidPadding));
    }

    #[test]
    fn truncated_ciphertext_is_rejected() {
        let (alice, bob) = pair();
        let mut ct = alice.encrypt_tcp(b"hello".to_vec());
        ct.pop();
        assert_eq!(bob.decrypt_tcp(ct), Err(CryptoError::InvalidLength));
        assert_eq!(
            bob.decrypt_udp(Vec::new(), 0),
            Err(CryptoError::InvalidLength)
        );
    }

    #[test]
    fn key_halves_feed_distinct_channels() {
        let mut bytes = [0u8; Key::SIZE];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = i as u8;
        }
        let key = Key::from_bytes(bytes);
        assert_eq!(key.tcp_iv()[0], 32);
        assert_eq!(key.udp_iv()[0], 48);

        // Same plaintext must not produce the same ciphertext on the two
        // channels, their IV seeds differ.
        let cipher = Cipher::with_key(key);
        let tcp = cipher.encrypt_tcp(vec![7; 16]);
        let (udp, _) = cipher.encrypt_udp(vec![7; 16]);
        assert_ne!(tcp, udp);
    }
}
