//! # Circuit State and Onion Layer
//!
//! One circuit occupies two local IDs at every relay (incoming and
//! outgoing link); this module holds the per-hop record plus the crypto
//! and framing that only the exit hop applies:
//!
//! - **Onion box**: X25519 between the client's ephemeral public key and
//!   the router's static secret, HKDF-SHA256 into two direction-separated
//!   ChaCha20-Poly1305 keys. Sealed blobs are `nonce || ciphertext`.
//! - **Message framing**: a message travels as consecutive `MSG` cell
//!   bodies; the first opens with a u64 little-endian total length.
//!   [`Assembler`] reassembles inbound fragments, [`fragment`] splits
//!   outbound responses.
//!
//! Intermediate hops never touch either layer; they rewrite the id field
//! and relay the cell unmodified below TLS.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use tokio::sync::mpsc;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::cell::BODY_BYTES;
use crate::error::{Result, RouterError};

/// Maximum length of an assembled message, and of a single read from an
/// exit destination.
pub const MAX_MSG_BYTES: usize = 1 << 14;

/// Size of the message length prefix in the first fragment.
pub const MSG_LEN_SIZE: usize = 8;

/// Nonce bytes prepended to every sealed blob.
const NONCE_SIZE: usize = 12;

/// Poly1305 tag appended by the AEAD.
const TAG_SIZE: usize = 16;

/// Bytes added by [`OnionContext::seal`].
pub const SEAL_OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;

/// Depth of the cell channel feeding an exit worker.
pub const EXIT_CHANNEL_DEPTH: usize = 64;

/// Key derivation labels for the two traffic directions.
const FORWARD_INFO: &[u8] = b"mixnet-onion-client-to-exit-v1";
const REVERSE_INFO: &[u8] = b"mixnet-onion-exit-to-client-v1";

/// Authenticated public-key box for one circuit's exit hop.
///
/// The proxy seals forward traffic and opens replies; the exit holds the
/// mirror-image context. Both sides derive the same two symmetric keys
/// from the X25519 shared secret, so `proxy.seal → exit.open` and
/// `exit.seal → proxy.open` round-trip while each side's own output is
/// not decryptable by itself.
#[derive(Debug)]
pub struct OnionContext {
    seal_key: Zeroizing<[u8; 32]>,
    open_key: Zeroizing<[u8; 32]>,
}

impl OnionContext {
    /// Exit-side context: opens client traffic, seals replies.
    pub fn exit(client_public: &[u8; 32], router_secret: &StaticSecret) -> Self {
        let shared = router_secret.diffie_hellman(&PublicKey::from(*client_public));
        let (forward, reverse) = derive_keys(shared.as_bytes());
        Self {
            seal_key: reverse,
            open_key: forward,
        }
    }

    /// Proxy-side context: seals requests, opens replies.
    pub fn proxy(ephemeral_secret: &StaticSecret, exit_public: &[u8; 32]) -> Self {
        let shared = ephemeral_secret.diffie_hellman(&PublicKey::from(*exit_public));
        let (forward, reverse) = derive_keys(shared.as_bytes());
        Self {
            seal_key: forward,
            open_key: reverse,
        }
    }

    /// Encrypt and authenticate. Never fails for payloads the cell layer
    /// accepts.
    pub fn seal(&self, plaintext: &[u8]) -> Vec<u8> {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(self.seal_key.as_ref()));
        let mut nonce = [0u8; NONCE_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .expect("ChaCha20-Poly1305 encryption is infallible for in-memory buffers");
        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        sealed
    }

    /// Authenticate and decrypt, or [`RouterError::AuthFail`].
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < SEAL_OVERHEAD {
            return Err(RouterError::AuthFail);
        }
        let cipher = ChaCha20Poly1305::new(Key::from_slice(self.open_key.as_ref()));
        cipher
            .decrypt(Nonce::from_slice(&sealed[..NONCE_SIZE]), &sealed[NONCE_SIZE..])
            .map_err(|_| RouterError::AuthFail)
    }
}

fn derive_keys(shared: &[u8; 32]) -> (Zeroizing<[u8; 32]>, Zeroizing<[u8; 32]>) {
    let hk = Hkdf::<Sha256>::new(None, shared);
    let mut forward = Zeroizing::new([0u8; 32]);
    let mut reverse = Zeroizing::new([0u8; 32]);
    hk.expand(FORWARD_INFO, forward.as_mut())
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    hk.expand(REVERSE_INFO, reverse.as_mut())
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    (forward, reverse)
}

/// Generate the client's ephemeral X25519 keypair for one circuit.
pub fn generate_ephemeral() -> (StaticSecret, [u8; 32]) {
    let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
    let public = PublicKey::from(&secret).to_bytes();
    (secret, public)
}

/// Reassembles a message from consecutive `MSG` cell bodies.
///
/// The first body of a message opens with a u64 little-endian total
/// length; once that many payload bytes have accumulated the message is
/// complete and the assembler resets. Padding past the declared length
/// is ignored.
#[derive(Default, Debug)]
pub struct Assembler {
    pending: Option<Pending>,
}

#[derive(Debug)]
struct Pending {
    expected: usize,
    buf: Vec<u8>,
}

impl Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one cell body; returns the assembled message once complete.
    ///
    /// A declared length above [`MAX_MSG_BYTES`] resets the assembler and
    /// fails with `MsgTooLarge`.
    pub fn feed(&mut self, body: &[u8]) -> Result<Option<Vec<u8>>> {
        let pending = match self.pending.as_mut() {
            Some(pending) => {
                let want = pending.expected - pending.buf.len();
                let take = want.min(body.len());
                pending.buf.extend_from_slice(&body[..take]);
                pending
            }
            None => {
                if body.len() < MSG_LEN_SIZE {
                    return Err(RouterError::BadDirective("short message fragment".into()));
                }
                let mut len = [0u8; MSG_LEN_SIZE];
                len.copy_from_slice(&body[..MSG_LEN_SIZE]);
                let expected = u64::from_le_bytes(len) as usize;
                if expected > MAX_MSG_BYTES {
                    return Err(RouterError::MsgTooLarge);
                }
                let take = expected.min(body.len() - MSG_LEN_SIZE);
                let mut buf = Vec::with_capacity(expected);
                buf.extend_from_slice(&body[MSG_LEN_SIZE..MSG_LEN_SIZE + take]);
                self.pending.insert(Pending { expected, buf })
            }
        };

        if pending.buf.len() == pending.expected {
            let done = self.pending.take().expect("pending just populated");
            Ok(Some(done.buf))
        } else {
            Ok(None)
        }
    }
}

/// Split an outbound message into `MSG` cell bodies, first chunk
/// length-prefixed. Bodies are unpadded; the cell codec zero-fills.
pub fn fragment(msg: &[u8]) -> Vec<Vec<u8>> {
    let first_capacity = BODY_BYTES - MSG_LEN_SIZE;
    let head = msg.len().min(first_capacity);

    let mut first = Vec::with_capacity(MSG_LEN_SIZE + head);
    first.extend_from_slice(&(msg.len() as u64).to_le_bytes());
    first.extend_from_slice(&msg[..head]);

    let mut bodies = vec![first];
    bodies.extend(msg[head..].chunks(BODY_BYTES).map(<[u8]>::to_vec));
    bodies
}

/// Per-hop circuit record, owned by the connection its ID rides on.
///
/// Exit circuits hold the sender half of the channel feeding the exit
/// worker; dropping the record closes the channel and stops the worker.
pub struct Circuit {
    id: u64,
    cell_tx: Option<mpsc::Sender<Vec<u8>>>,
}

impl Circuit {
    /// Record for a relay hop: no local message handling.
    pub fn relay(id: u64) -> Self {
        Self { id, cell_tx: None }
    }

    /// Record for an exit hop, wired to its worker.
    pub fn exit(id: u64, cell_tx: mpsc::Sender<Vec<u8>>) -> Self {
        Self {
            id,
            cell_tx: Some(cell_tx),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Channel toward the exit worker, when this hop terminates the path.
    pub fn exit_sender(&self) -> Option<mpsc::Sender<Vec<u8>>> {
        self.cell_tx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (OnionContext, OnionContext) {
        let router_secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let router_public = PublicKey::from(&router_secret).to_bytes();
        let (eph_secret, eph_public) = generate_ephemeral();
        (
            OnionContext::proxy(&eph_secret, &router_public),
            OnionContext::exit(&eph_public, &router_secret),
        )
    }

    #[test]
    fn seal_open_round_trip_both_directions() {
        let (proxy, exit) = pair();

        let request = exit.open(&proxy.seal(b"forward payload")).unwrap();
        assert_eq!(request, b"forward payload");

        let reply = proxy.open(&exit.seal(b"reverse payload")).unwrap();
        assert_eq!(reply, b"reverse payload");
    }

    #[test]
    fn directions_are_separated() {
        let (proxy, exit) = pair();
        // A side must not accept its own output: the two directions use
        // distinct keys.
        let sealed = proxy.seal(b"loop");
        assert!(matches!(proxy.open(&sealed), Err(RouterError::AuthFail)));
        let sealed = exit.seal(b"loop");
        assert!(matches!(exit.open(&sealed), Err(RouterError::AuthFail)));
    }

    #[test]
    fn tampered_ciphertext_fails_auth() {
        let (proxy, exit) = pair();
        let mut sealed = proxy.seal(b"payload");
        let last = sealed.len() - 1;
        sealed[last] ^= 1;
        assert!(matches!(exit.open(&sealed), Err(RouterError::AuthFail)));
    }

    #[test]
    fn wrong_key_fails_auth() {
        let (proxy, _) = pair();
        let (_, other_exit) = pair();
        let sealed = proxy.seal(b"payload");
        assert!(matches!(other_exit.open(&sealed), Err(RouterError::AuthFail)));
    }

    #[test]
    fn short_blob_fails_auth() {
        let (_, exit) = pair();
        assert!(matches!(exit.open(&[0u8; 10]), Err(RouterError::AuthFail)));
    }

    #[test]
    fn fragment_reassemble_round_trip() {
        for len in [0usize, 1, 100, BODY_BYTES - MSG_LEN_SIZE, BODY_BYTES, 5000, MAX_MSG_BYTES] {
            let msg: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let bodies = fragment(&msg);

            let mut assembler = Assembler::new();
            let mut out = None;
            for (i, body) in bodies.iter().enumerate() {
                // Pad to full body size the way encode_msg does.
                let mut padded = body.clone();
                padded.resize(BODY_BYTES, 0);
                let fed = assembler.feed(&padded).unwrap();
                if i + 1 < bodies.len() {
                    assert!(fed.is_none(), "message of {len} completed early");
                } else {
                    out = fed;
                }
            }
            assert_eq!(out.expect("message must complete"), msg);
        }
    }

    #[test]
    fn fragment_counts() {
        assert_eq!(fragment(&[0u8; 100]).len(), 1);
        assert_eq!(fragment(&vec![0u8; BODY_BYTES - MSG_LEN_SIZE]).len(), 1);
        assert_eq!(fragment(&vec![0u8; BODY_BYTES]).len(), 2);
        assert_eq!(fragment(&vec![0u8; 3 * BODY_BYTES]).len(), 4);
    }

    #[test]
    fn oversized_length_prefix_rejected() {
        let mut assembler = Assembler::new();
        let mut body = vec![0u8; BODY_BYTES];
        body[..MSG_LEN_SIZE].copy_from_slice(&((MAX_MSG_BYTES as u64) + 1).to_le_bytes());
        assert!(matches!(
            assembler.feed(&body),
            Err(RouterError::MsgTooLarge)
        ));

        // The assembler must reset after the failure and accept a fresh
        // message.
        let bodies = fragment(b"after failure");
        let mut padded = bodies[0].clone();
        padded.resize(BODY_BYTES, 0);
        assert_eq!(
            assembler.feed(&padded).unwrap().as_deref(),
            Some(b"after failure".as_ref())
        );
    }

    #[test]
    fn back_to_back_messages() {
        let mut assembler = Assembler::new();
        for round in 0..3 {
            let msg = vec![round as u8; 2500];
            for body in fragment(&msg) {
                let mut padded = body;
                padded.resize(BODY_BYTES, 0);
                if let Some(done) = assembler.feed(&padded).unwrap() {
                    assert_eq!(done, msg);
                }
            }
        }
    }
}
