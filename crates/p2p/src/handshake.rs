//! Noise XX session handshake.
//!
//! Pattern `Noise_XX_25519_ChaChaPoly_BLAKE2b`, carried over the
//! `/app/handshake/1.0.0` stream as two request/response rounds:
//!
//! ```text
//!   -> e
//!   <- e, ee, s, es   (+ responder's 4-byte short-id payload)
//!   -> s, se          (+ initiator's 4-byte short-id payload)
//! ```
//!
//! After message three both sides hold independent send/receive cipher
//! states with per-direction nonce counters, plus a 32-byte session secret
//! bound to the handshake transcript; that secret is what the guard later
//! checks per stream. Payloads ride encrypted in messages two and three, so
//! short ids are only revealed to an authenticated peer.

use blake2::{Blake2b512, Digest};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use hmac::{Hmac, Mac};
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

const PROTOCOL_NAME: &[u8] = b"Noise_XX_25519_ChaChaPoly_BLAKE2b";
const HASH_LEN: usize = 64;
const DH_LEN: usize = 32;
const TAG_LEN: usize = 16;
/// Handshake payload: one big-endian short id.
pub const PAYLOAD_LEN: usize = 4;

/// Message one: initiator ephemeral.
pub const MSG1_LEN: usize = DH_LEN;
/// Message two: ephemeral + encrypted static + encrypted payload.
pub const MSG2_LEN: usize = DH_LEN + DH_LEN + TAG_LEN + PAYLOAD_LEN + TAG_LEN;
/// Message three: encrypted static + encrypted payload.
pub const MSG3_LEN: usize = DH_LEN + TAG_LEN + PAYLOAD_LEN + TAG_LEN;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("message has wrong length")]
    BadLength,
    #[error("aead verification failed")]
    Aead,
    #[error("handshake used out of order")]
    OutOfOrder,
    #[error("nonce space exhausted")]
    NonceExhausted,
}

/// One direction of an established session.
pub struct CipherState {
    key: [u8; 32],
    nonce: u64,
}

impl CipherState {
    fn new(key: [u8; 32]) -> Self {
        CipherState { key, nonce: 0 }
    }

    fn next_nonce(&mut self) -> Result<Nonce, HandshakeError> {
        if self.nonce == u64::MAX {
            return Err(HandshakeError::NonceExhausted);
        }
        // ChaChaPoly nonce: four zero bytes then the counter, little endian.
        let mut bytes = [0u8; 12];
        bytes[4..].copy_from_slice(&self.nonce.to_le_bytes());
        self.nonce += 1;
        Ok(Nonce::from(bytes))
    }

    pub fn encrypt_with_ad(&mut self, ad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, HandshakeError> {
        let nonce = self.next_nonce()?;
        ChaCha20Poly1305::new(Key::from_slice(&self.key))
            .encrypt(&nonce, Payload { msg: plaintext, aad: ad })
            .map_err(|_| HandshakeError::Aead)
    }

    pub fn decrypt_with_ad(&mut self, ad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, HandshakeError> {
        let nonce = self.next_nonce()?;
        ChaCha20Poly1305::new(Key::from_slice(&self.key))
            .decrypt(&nonce, Payload { msg: ciphertext, aad: ad })
            .map_err(|_| HandshakeError::Aead)
    }

    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, HandshakeError> {
        self.encrypt_with_ad(&[], plaintext)
    }

    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, HandshakeError> {
        self.decrypt_with_ad(&[], ciphertext)
    }
}

impl Drop for CipherState {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// Both directions of an established session plus the transcript-bound
/// secret handed to the guard.
pub struct Session {
    pub send: CipherState,
    pub recv: CipherState,
    /// First 32 bytes of the final handshake hash; identical on both sides.
    pub secret: [u8; 32],
    /// The peer's static Curve25519 key, authenticated by the handshake.
    pub remote_static: [u8; 32],
}

struct SymmetricState {
    ck: [u8; HASH_LEN],
    h: [u8; HASH_LEN],
    k: Option<[u8; 32]>,
    nonce: u64,
}

impl SymmetricState {
    fn new() -> Self {
        // name is shorter than HASHLEN: pad with zeros
        let mut h = [0u8; HASH_LEN];
        h[..PROTOCOL_NAME.len()].copy_from_slice(PROTOCOL_NAME);
        SymmetricState {
            ck: h,
            h,
            k: None,
            nonce: 0,
        }
    }

    fn mix_hash(&mut self, data: &[u8]) {
        let mut hasher = Blake2b512::new();
        hasher.update(self.h);
        hasher.update(data);
        self.h.copy_from_slice(&hasher.finalize());
    }

    fn mix_key(&mut self, ikm: &[u8]) {
        let (ck, temp_k) = hkdf(&self.ck, ikm);
        self.ck = ck;
        let mut k = [0u8; 32];
        k.copy_from_slice(&temp_k[..32]);
        self.k = Some(k);
        self.nonce = 0;
    }

    fn encrypt_and_hash(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, HandshakeError> {
        let out = match self.k {
            Some(key) => {
                let mut state = CipherState { key, nonce: self.nonce };
                let ct = state.encrypt_with_ad(&self.h, plaintext)?;
                self.nonce = state.nonce;
                ct
            }
            None => plaintext.to_vec(),
        };
        self.mix_hash(&out);
        Ok(out)
    }

    fn decrypt_and_hash(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, HandshakeError> {
        let out = match self.k {
            Some(key) => {
                let mut state = CipherState { key, nonce: self.nonce };
                let pt = state.decrypt_with_ad(&self.h, ciphertext)?;
                self.nonce = state.nonce;
                pt
            }
            None => ciphertext.to_vec(),
        };
        self.mix_hash(ciphertext);
        Ok(out)
    }

    fn split(&self) -> (CipherState, CipherState) {
        let (k1, k2) = hkdf(&self.ck, &[]);
        let mut key1 = [0u8; 32];
        let mut key2 = [0u8; 32];
        key1.copy_from_slice(&k1[..32]);
        key2.copy_from_slice(&k2[..32]);
        (CipherState::new(key1), CipherState::new(key2))
    }
}

/// Noise HKDF with two outputs.
fn hkdf(ck: &[u8; HASH_LEN], ikm: &[u8]) -> ([u8; HASH_LEN], [u8; HASH_LEN]) {
    let temp = hmac_hash(ck, ikm);
    let out1 = hmac_hash(&temp, &[0x01]);
    let mut buf = [0u8; HASH_LEN + 1];
    buf[..HASH_LEN].copy_from_slice(&out1);
    buf[HASH_LEN] = 0x02;
    let out2 = hmac_hash(&temp, &buf);
    (out1, out2)
}

fn hmac_hash(key: &[u8; HASH_LEN], data: &[u8]) -> [u8; HASH_LEN] {
    let mut mac = Hmac::<Blake2b512>::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    let mut out = [0u8; HASH_LEN];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

enum Phase {
    /// Initiator: ready to write message one.
    I1,
    /// Initiator: waiting for message two.
    I2,
    /// Initiator: ready to write message three.
    I3,
    /// Responder: waiting for message one.
    R1,
    /// Responder: ready to write message two.
    R2,
    /// Responder: waiting for message three.
    R3,
    Done,
}

/// Driver for one XX handshake, either role.
pub struct Handshake {
    sym: SymmetricState,
    s: StaticSecret,
    e: Option<StaticSecret>,
    rs: Option<PublicKey>,
    re: Option<PublicKey>,
    payload: [u8; PAYLOAD_LEN],
    phase: Phase,
    initiator: bool,
}

impl Handshake {
    /// `payload` is this side's short id, sent encrypted once keys exist.
    pub fn initiator(static_secret: StaticSecret, payload: [u8; PAYLOAD_LEN]) -> Self {
        Self::new(static_secret, payload, true)
    }

    pub fn responder(static_secret: StaticSecret, payload: [u8; PAYLOAD_LEN]) -> Self {
        Self::new(static_secret, payload, false)
    }

    fn new(s: StaticSecret, payload: [u8; PAYLOAD_LEN], initiator: bool) -> Self {
        Handshake {
            sym: SymmetricState::new(),
            s,
            e: None,
            rs: None,
            re: None,
            payload,
            phase: if initiator { Phase::I1 } else { Phase::R1 },
            initiator,
        }
    }

    /// Initiator: `-> e`.
    pub fn write_message_one(&mut self) -> Result<Vec<u8>, HandshakeError> {
        if !matches!(self.phase, Phase::I1) {
            return Err(HandshakeError::OutOfOrder);
        }
        let e = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let e_pub = PublicKey::from(&e);
        self.sym.mix_hash(e_pub.as_bytes());
        self.e = Some(e);
        self.phase = Phase::I2;
        Ok(e_pub.as_bytes().to_vec())
    }

    /// Responder: consume `-> e`.
    pub fn read_message_one(&mut self, msg: &[u8]) -> Result<(), HandshakeError> {
        if !matches!(self.phase, Phase::R1) {
            return Err(HandshakeError::OutOfOrder);
        }
        if msg.len() != MSG1_LEN {
            return Err(HandshakeError::BadLength);
        }
        let mut re = [0u8; DH_LEN];
        re.copy_from_slice(msg);
        self.re = Some(PublicKey::from(re));
        self.sym.mix_hash(&re);
        self.phase = Phase::R2;
        Ok(())
    }

    /// Responder: `<- e, ee, s, es` plus the encrypted payload.
    pub fn write_message_two(&mut self) -> Result<Vec<u8>, HandshakeError> {
        if !matches!(self.phase, Phase::R2) {
            return Err(HandshakeError::OutOfOrder);
        }
        let re = self.re.ok_or(HandshakeError::OutOfOrder)?;

        let e = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let e_pub = PublicKey::from(&e);
        let mut out = e_pub.as_bytes().to_vec();
        self.sym.mix_hash(e_pub.as_bytes());

        // ee
        self.sym.mix_key(e.diffie_hellman(&re).as_bytes());
        // s
        let s_pub = PublicKey::from(&self.s);
        out.extend(self.sym.encrypt_and_hash(s_pub.as_bytes())?);
        // es (responder side: DH(s, re))
        self.sym.mix_key(self.s.diffie_hellman(&re).as_bytes());
        // payload
        let payload = self.payload;
        out.extend(self.sym.encrypt_and_hash(&payload)?);

        self.e = Some(e);
        self.phase = Phase::R3;
        Ok(out)
    }

    /// Initiator: consume message two; returns the responder's payload.
    pub fn read_message_two(&mut self, msg: &[u8]) -> Result<[u8; PAYLOAD_LEN], HandshakeError> {
        if !matches!(self.phase, Phase::I2) {
            return Err(HandshakeError::OutOfOrder);
        }
        if msg.len() != MSG2_LEN {
            return Err(HandshakeError::BadLength);
        }
        let e = self.e.as_ref().ok_or(HandshakeError::OutOfOrder)?;

        let mut re = [0u8; DH_LEN];
        re.copy_from_slice(&msg[..DH_LEN]);
        let re = PublicKey::from(re);
        self.sym.mix_hash(re.as_bytes());

        // ee
        self.sym.mix_key(e.diffie_hellman(&re).as_bytes());
        // s
        let rs_bytes = self
            .sym
            .decrypt_and_hash(&msg[DH_LEN..DH_LEN + DH_LEN + TAG_LEN])?;
        let mut rs = [0u8; DH_LEN];
        rs.copy_from_slice(&rs_bytes);
        let rs = PublicKey::from(rs);
        // es (initiator side: DH(e, rs))
        self.sym.mix_key(e.diffie_hellman(&rs).as_bytes());
        // payload
        let payload_bytes = self.sym.decrypt_and_hash(&msg[DH_LEN + DH_LEN + TAG_LEN..])?;
        let mut payload = [0u8; PAYLOAD_LEN];
        payload.copy_from_slice(&payload_bytes);

        self.re = Some(re);
        self.rs = Some(rs);
        self.phase = Phase::I3;
        Ok(payload)
    }

    /// Initiator: `-> s, se` plus the encrypted payload. Completes the
    /// handshake and yields the session.
    pub fn write_message_three(&mut self) -> Result<(Vec<u8>, Session), HandshakeError> {
        if !matches!(self.phase, Phase::I3) {
            return Err(HandshakeError::OutOfOrder);
        }
        let re = self.re.ok_or(HandshakeError::OutOfOrder)?;

        // s
        let s_pub = PublicKey::from(&self.s);
        let mut out = self.sym.encrypt_and_hash(s_pub.as_bytes())?;
        // se (initiator side: DH(s, re))
        self.sym.mix_key(self.s.diffie_hellman(&re).as_bytes());
        // payload
        let payload = self.payload;
        out.extend(self.sym.encrypt_and_hash(&payload)?);

        self.phase = Phase::Done;
        Ok((out, self.session()?))
    }

    /// Responder: consume message three; returns the initiator's payload and
    /// the session.
    pub fn read_message_three(
        &mut self,
        msg: &[u8],
    ) -> Result<([u8; PAYLOAD_LEN], Session), HandshakeError> {
        if !matches!(self.phase, Phase::R3) {
            return Err(HandshakeError::OutOfOrder);
        }
        if msg.len() != MSG3_LEN {
            return Err(HandshakeError::BadLength);
        }
        let e = self.e.as_ref().ok_or(HandshakeError::OutOfOrder)?;

        // s
        let rs_bytes = self.sym.decrypt_and_hash(&msg[..DH_LEN + TAG_LEN])?;
        let mut rs = [0u8; DH_LEN];
        rs.copy_from_slice(&rs_bytes);
        let rs = PublicKey::from(rs);
        // se (responder side: DH(e, rs))
        self.sym.mix_key(e.diffie_hellman(&rs).as_bytes());
        // payload
        let payload_bytes = self.sym.decrypt_and_hash(&msg[DH_LEN + TAG_LEN..])?;
        let mut payload = [0u8; PAYLOAD_LEN];
        payload.copy_from_slice(&payload_bytes);

        self.rs = Some(rs);
        self.phase = Phase::Done;
        Ok((payload, self.session()?))
    }

    fn session(&self) -> Result<Session, HandshakeError> {
        let (c1, c2) = self.sym.split();
        let rs = self.rs.ok_or(HandshakeError::OutOfOrder)?;
        let mut secret = [0u8; 32];
        secret.copy_from_slice(&self.sym.h[..32]);
        let (send, recv) = if self.initiator { (c1, c2) } else { (c2, c1) };
        Ok(Session {
            send,
            recv,
            secret,
            remote_static: *rs.as_bytes(),
        })
    }
}

/// Raw-bytes request-response codec carrying handshake messages.
#[derive(Clone, Default)]
pub struct HandshakeCodec;

/// Largest legal handshake frame plus slack for the final ack.
const MAX_FRAME: usize = 256;

#[async_trait::async_trait]
impl libp2p::request_response::Codec for HandshakeCodec {
    type Protocol = libp2p::StreamProtocol;
    type Request = Vec<u8>;
    type Response = Vec<u8>;

    async fn read_request<T>(
        &mut self,
        _: &Self::Protocol,
        io: &mut T,
    ) -> std::io::Result<Self::Request>
    where
        T: futures::AsyncRead + Unpin + Send,
    {
        read_frame(io).await
    }

    async fn read_response<T>(
        &mut self,
        _: &Self::Protocol,
        io: &mut T,
    ) -> std::io::Result<Self::Response>
    where
        T: futures::AsyncRead + Unpin + Send,
    {
        read_frame(io).await
    }

    async fn write_request<T>(
        &mut self,
        _: &Self::Protocol,
        io: &mut T,
        req: Self::Request,
    ) -> std::io::Result<()>
    where
        T: futures::AsyncWrite + Unpin + Send,
    {
        use futures::AsyncWriteExt;
        io.write_all(&req).await?;
        io.close().await
    }

    async fn write_response<T>(
        &mut self,
        _: &Self::Protocol,
        io: &mut T,
        resp: Self::Response,
    ) -> std::io::Result<()>
    where
        T: futures::AsyncWrite + Unpin + Send,
    {
        use futures::AsyncWriteExt;
        io.write_all(&resp).await?;
        io.close().await
    }
}

async fn read_frame<T>(io: &mut T) -> std::io::Result<Vec<u8>>
where
    T: futures::AsyncRead + Unpin + Send,
{
    use futures::AsyncReadExt;
    let mut buf = Vec::new();
    io.take(MAX_FRAME as u64 + 1).read_to_end(&mut buf).await?;
    if buf.len() > MAX_FRAME {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "oversized handshake frame",
        ));
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_handshake() -> (Session, Session, [u8; 4], [u8; 4]) {
        let init_static = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let resp_static = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let mut init = Handshake::initiator(init_static, [0, 0, 0, 7]);
        let mut resp = Handshake::responder(resp_static, [0, 0, 0, 9]);

        let m1 = init.write_message_one().unwrap();
        resp.read_message_one(&m1).unwrap();
        let m2 = resp.write_message_two().unwrap();
        let resp_payload = init.read_message_two(&m2).unwrap();
        let (m3, init_session) = init.write_message_three().unwrap();
        let (init_payload, resp_session) = resp.read_message_three(&m3).unwrap();

        (init_session, resp_session, init_payload, resp_payload)
    }

    #[test]
    fn three_messages_establish_matching_sessions() {
        let (mut a, mut b, init_payload, resp_payload) = run_handshake();
        assert_eq!(init_payload, [0, 0, 0, 7]);
        assert_eq!(resp_payload, [0, 0, 0, 9]);
        assert_eq!(a.secret, b.secret);

        let ct = a.send.encrypt(b"hello over noise").unwrap();
        assert_eq!(b.recv.decrypt(&ct).unwrap(), b"hello over noise");

        let ct_back = b.send.encrypt(b"and back").unwrap();
        assert_eq!(a.recv.decrypt(&ct_back).unwrap(), b"and back");
    }

    #[test]
    fn directions_have_independent_nonce_counters() {
        let (mut a, mut b, _, _) = run_handshake();
        // Three sends one way, one the other; counters advance separately.
        for i in 0u8..3 {
            let ct = a.send.encrypt(&[i]).unwrap();
            assert_eq!(b.recv.decrypt(&ct).unwrap(), vec![i]);
        }
        let ct = b.send.encrypt(b"x").unwrap();
        assert_eq!(a.recv.decrypt(&ct).unwrap(), b"x");
    }

    #[test]
    fn tampered_ciphertext_fails_verification() {
        let (mut a, mut b, _, _) = run_handshake();
        let mut ct = a.send.encrypt(b"integrity").unwrap();
        ct[3] ^= 0x80;
        assert_eq!(b.recv.decrypt(&ct), Err(HandshakeError::Aead));
    }

    #[test]
    fn tampered_message_two_aborts() {
        let init_static = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let resp_static = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let mut init = Handshake::initiator(init_static, [0; 4]);
        let mut resp = Handshake::responder(resp_static, [0; 4]);

        let m1 = init.write_message_one().unwrap();
        resp.read_message_one(&m1).unwrap();
        let mut m2 = resp.write_message_two().unwrap();
        *m2.last_mut().unwrap() ^= 0x01;
        assert_eq!(init.read_message_two(&m2), Err(HandshakeError::Aead));
    }

    #[test]
    fn remote_statics_are_exchanged() {
        let init_static = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let resp_static = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let init_pub = *PublicKey::from(&init_static).as_bytes();
        let resp_pub = *PublicKey::from(&resp_static).as_bytes();

        let mut init = Handshake::initiator(init_static, [0; 4]);
        let mut resp = Handshake::responder(resp_static, [0; 4]);
        let m1 = init.write_message_one().unwrap();
        resp.read_message_one(&m1).unwrap();
        let m2 = resp.write_message_two().unwrap();
        init.read_message_two(&m2).unwrap();
        let (m3, init_session) = init.write_message_three().unwrap();
        let (_, resp_session) = resp.read_message_three(&m3).unwrap();

        assert_eq!(init_session.remote_static, resp_pub);
        assert_eq!(resp_session.remote_static, init_pub);
    }

    #[test]
    fn out_of_order_use_is_rejected() {
        let s = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let mut hs = Handshake::initiator(s, [0; 4]);
        assert_eq!(hs.read_message_one(&[0; 32]), Err(HandshakeError::OutOfOrder));
        hs.write_message_one().unwrap();
        assert_eq!(hs.write_message_one().unwrap_err(), HandshakeError::OutOfOrder);
    }

    #[test]
    fn wrong_length_rejected() {
        let s = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let mut resp = Handshake::responder(s, [0; 4]);
        assert_eq!(resp.read_message_one(&[0; 31]), Err(HandshakeError::BadLength));
    }
}
