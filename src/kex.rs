//! Pre-shared key exchange
//!
//! Three messages establish a fresh session key:
//!
//! 1. client → server `KexRequest`: client nonce
//! 2. server → client `KexResponse`: server nonce + server MAC
//! 3. client → server `KexAuth`: client MAC
//!
//! Both MACs and the session key are keyed BLAKE2b over the nonces and the
//! two RaSTA ids, keyed with the pre-shared key. A peer without the PSK can
//! neither produce a valid MAC nor derive the key.
use blake2::digest::consts::U32;
use blake2::digest::Mac;
use blake2::Blake2bMac;
use rand::RngCore;

use crate::errors::{RastaError, Result};

pub const NONCE_LEN: usize = 16;
pub const MAC_LEN: usize = 32;
/// Length of derived session keys
pub const SESSION_KEY_LEN: usize = 32;
/// Largest PSK accepted as a BLAKE2b key
pub const MAX_PSK_LEN: usize = 64;

type Nonce = [u8; NONCE_LEN];

/// Protocol-level key exchange failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KexFailure {
    /// Body has the wrong length
    Malformed,
    /// MAC did not verify
    Unauthenticated,
    /// Message arrived without the matching earlier step
    UnexpectedMessage,
}

/// Key exchange state of one connection
#[derive(Debug, Clone)]
pub struct KeyExchange {
    psk: Vec<u8>,
    client_id: u32,
    server_id: u32,
    client_nonce: Option<Nonce>,
    server_nonce: Option<Nonce>,
}

impl KeyExchange {
    pub fn new(psk: &[u8], client_id: u32, server_id: u32) -> Result<Self> {
        if psk.is_empty() || psk.len() > MAX_PSK_LEN {
            return Err(RastaError::InvalidKeyLength(psk.len()));
        }
        Ok(Self { psk: psk.to_vec(), client_id, server_id, client_nonce: None, server_nonce: None })
    }

    fn mac(&self, label: &[u8], first: &Nonce, second: &Nonce) -> [u8; MAC_LEN] {
        let mut out = [0u8; MAC_LEN];
        // psk length is checked in `new`
        if let Ok(mut mac) = Blake2bMac::<U32>::new_from_slice(&self.psk) {
            mac.update(label);
            mac.update(first);
            mac.update(second);
            mac.update(&self.client_id.to_le_bytes());
            mac.update(&self.server_id.to_le_bytes());
            out.copy_from_slice(&mac.finalize().into_bytes());
        }
        out
    }

    fn session_key(&self, client_nonce: &Nonce, server_nonce: &Nonce) -> Vec<u8> {
        self.mac(b"rasta-session", client_nonce, server_nonce)[..SESSION_KEY_LEN].to_vec()
    }

    fn read_nonce(bytes: &[u8]) -> Nonce {
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&bytes[..NONCE_LEN]);
        nonce
    }

    /// Client: begin a (re)key, returning the KexRequest body
    pub fn start(&mut self) -> Vec<u8> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        self.client_nonce = Some(nonce);
        self.server_nonce = None;
        nonce.to_vec()
    }

    /// Server: answer a KexRequest, returning the KexResponse body and the new key
    pub fn respond(&mut self, request: &[u8]) -> std::result::Result<(Vec<u8>, Vec<u8>), KexFailure> {
        if request.len() != NONCE_LEN {
            return Err(KexFailure::Malformed);
        }
        let client_nonce = Self::read_nonce(request);
        let mut server_nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut server_nonce);
        self.client_nonce = Some(client_nonce);
        self.server_nonce = Some(server_nonce);

        let mut body = server_nonce.to_vec();
        body.extend_from_slice(&self.mac(b"rasta-server", &client_nonce, &server_nonce));
        Ok((body, self.session_key(&client_nonce, &server_nonce)))
    }

    /// Client: check a KexResponse, returning the KexAuth body and the new key
    pub fn authenticate(&mut self, response: &[u8]) -> std::result::Result<(Vec<u8>, Vec<u8>), KexFailure> {
        let client_nonce = self.client_nonce.ok_or(KexFailure::UnexpectedMessage)?;
        if response.len() != NONCE_LEN + MAC_LEN {
            return Err(KexFailure::Malformed);
        }
        let server_nonce = Self::read_nonce(response);
        if response[NONCE_LEN..] != self.mac(b"rasta-server", &client_nonce, &server_nonce) {
            return Err(KexFailure::Unauthenticated);
        }
        self.server_nonce = Some(server_nonce);
        let auth = self.mac(b"rasta-client", &server_nonce, &client_nonce).to_vec();
        Ok((auth, self.session_key(&client_nonce, &server_nonce)))
    }

    /// Server: check the client's KexAuth
    pub fn verify(&mut self, auth: &[u8]) -> std::result::Result<(), KexFailure> {
        let (client_nonce, server_nonce) = match (self.client_nonce, self.server_nonce) {
            (Some(c), Some(s)) => (c, s),
            _ => return Err(KexFailure::UnexpectedMessage),
        };
        if auth.len() != MAC_LEN {
            return Err(KexFailure::Malformed);
        }
        if auth != self.mac(b"rasta-client", &server_nonce, &client_nonce) {
            return Err(KexFailure::Unauthenticated);
        }
        self.client_nonce = None;
        self.server_nonce = None;
        Ok(())
    }
}
