//! Per-session stream cipher contract
//!
//! Every session owns one [`CipherPair`] built from the shared password and
//! the configured method name. The pair holds two fully independent
//! keystream states, one per traffic direction, so interleaved inbound and
//! outbound chunks can never corrupt each other's stream position.
//!
//! The send direction lazily draws a random IV on first use and emits it
//! ahead of the first ciphertext; the receive direction consumes the peer's
//! IV from the head of the inbound stream. Keys are derived from the
//! password with the OpenSSL MD5 bytes-to-key scheme.

use aes::{Aes128, Aes192, Aes256};
use chacha20::ChaCha20;
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use md5::{Digest, Md5};
use rand::RngCore;
use thiserror::Error;

type Aes128Ctr = Ctr128BE<Aes128>;
type Aes192Ctr = Ctr128BE<Aes192>;
type Aes256Ctr = Ctr128BE<Aes256>;

/// Cryptographic errors; fatal to the owning session only
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("unknown cipher method: {0}")]
    UnknownMethod(String),

    #[error("invalid key or IV length")]
    InvalidKeyLength,
}

/// Supported cipher methods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// Identity transform, bytes pass through unchanged
    Plain,
    Aes128Ctr,
    Aes192Ctr,
    Aes256Ctr,
    ChaCha20,
}

impl Method {
    /// Resolve a configured method name.
    ///
    /// The empty string and `"null"` select the identity transform on both
    /// sides. The legacy `"table"` keyword does so only where
    /// `legacy_table_is_plain` is set (the local side); the server side does
    /// not recognize it and rejects it as unknown.
    pub fn parse(name: &str, legacy_table_is_plain: bool) -> Result<Self, CryptoError> {
        match name.to_lowercase().as_str() {
            "" | "null" => Ok(Method::Plain),
            "table" if legacy_table_is_plain => Ok(Method::Plain),
            "aes-128-ctr" => Ok(Method::Aes128Ctr),
            "aes-192-ctr" => Ok(Method::Aes192Ctr),
            "aes-256-ctr" => Ok(Method::Aes256Ctr),
            "chacha20" => Ok(Method::ChaCha20),
            other => Err(CryptoError::UnknownMethod(other.to_string())),
        }
    }

    fn key_len(&self) -> usize {
        match self {
            Method::Plain => 0,
            Method::Aes128Ctr => 16,
            Method::Aes192Ctr => 24,
            Method::Aes256Ctr => 32,
            Method::ChaCha20 => 32,
        }
    }

    fn iv_len(&self) -> usize {
        match self {
            Method::Plain => 0,
            Method::Aes128Ctr | Method::Aes192Ctr | Method::Aes256Ctr => 16,
            Method::ChaCha20 => 12,
        }
    }
}

/// One running keystream position
enum Keystream {
    Aes128(Aes128Ctr),
    Aes192(Aes192Ctr),
    Aes256(Aes256Ctr),
    ChaCha20(ChaCha20),
}

impl Keystream {
    fn new(method: Method, key: &[u8], iv: &[u8]) -> Result<Self, CryptoError> {
        match method {
            Method::Plain => Err(CryptoError::UnknownMethod("plain".to_string())),
            Method::Aes128Ctr => Aes128Ctr::new_from_slices(key, iv)
                .map(Keystream::Aes128)
                .map_err(|_| CryptoError::InvalidKeyLength),
            Method::Aes192Ctr => Aes192Ctr::new_from_slices(key, iv)
                .map(Keystream::Aes192)
                .map_err(|_| CryptoError::InvalidKeyLength),
            Method::Aes256Ctr => Aes256Ctr::new_from_slices(key, iv)
                .map(Keystream::Aes256)
                .map_err(|_| CryptoError::InvalidKeyLength),
            Method::ChaCha20 => ChaCha20::new_from_slices(key, iv)
                .map(Keystream::ChaCha20)
                .map_err(|_| CryptoError::InvalidKeyLength),
        }
    }

    fn apply(&mut self, data: &mut [u8]) {
        match self {
            Keystream::Aes128(c) => c.apply_keystream(data),
            Keystream::Aes192(c) => c.apply_keystream(data),
            Keystream::Aes256(c) => c.apply_keystream(data),
            Keystream::ChaCha20(c) => c.apply_keystream(data),
        }
    }
}

enum SendState {
    Plain,
    /// No IV drawn yet
    Pending,
    Streaming(Keystream),
}

enum RecvState {
    Plain,
    /// Collecting the peer IV, possibly split across chunks
    Pending { iv: Vec<u8> },
    Streaming(Keystream),
}

/// Two independent per-direction transform states owned by one session
pub struct CipherPair {
    method: Method,
    key: Vec<u8>,
    send: SendState,
    recv: RecvState,
}

impl CipherPair {
    /// Build a cipher pair from the shared password and method name.
    ///
    /// Fails only on an unknown method name; failure is fatal to the
    /// session being constructed, never to the listener.
    pub fn new(
        password: &str,
        method: &str,
        legacy_table_is_plain: bool,
    ) -> Result<Self, CryptoError> {
        let method = Method::parse(method, legacy_table_is_plain)?;
        let key = bytes_to_key(password.as_bytes(), method.key_len());
        let (send, recv) = match method {
            Method::Plain => (SendState::Plain, RecvState::Plain),
            _ => (
                SendState::Pending,
                RecvState::Pending {
                    iv: Vec::with_capacity(method.iv_len()),
                },
            ),
        };
        Ok(Self {
            method,
            key,
            send,
            recv,
        })
    }

    /// Transform an outbound chunk.
    ///
    /// The first call prepends the freshly drawn IV to the ciphertext.
    pub fn encrypt(&mut self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        match &mut self.send {
            SendState::Plain => Ok(data.to_vec()),
            SendState::Pending => {
                let iv_len = self.method.iv_len();
                let mut iv = vec![0u8; iv_len];
                rand::thread_rng().fill_bytes(&mut iv);
                let mut keystream = Keystream::new(self.method, &self.key, &iv)?;
                let mut out = Vec::with_capacity(iv_len + data.len());
                out.extend_from_slice(&iv);
                out.extend_from_slice(data);
                keystream.apply(&mut out[iv_len..]);
                self.send = SendState::Streaming(keystream);
                Ok(out)
            }
            SendState::Streaming(keystream) => {
                let mut out = data.to_vec();
                keystream.apply(&mut out);
                Ok(out)
            }
        }
    }

    /// Transform an inbound chunk.
    ///
    /// Consumes the peer IV from the head of the stream; a chunk that only
    /// completes part of the IV yields an empty plaintext.
    pub fn decrypt(&mut self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        match &mut self.recv {
            RecvState::Plain => Ok(data.to_vec()),
            RecvState::Pending { iv } => {
                let need = self.method.iv_len() - iv.len();
                if data.len() < need {
                    iv.extend_from_slice(data);
                    return Ok(Vec::new());
                }
                iv.extend_from_slice(&data[..need]);
                let mut keystream = Keystream::new(self.method, &self.key, iv)?;
                let mut out = data[need..].to_vec();
                keystream.apply(&mut out);
                self.recv = RecvState::Streaming(keystream);
                Ok(out)
            }
            RecvState::Streaming(keystream) => {
                let mut out = data.to_vec();
                keystream.apply(&mut out);
                Ok(out)
            }
        }
    }
}

/// OpenSSL EVP_BytesToKey with MD5 and no salt
fn bytes_to_key(password: &[u8], key_len: usize) -> Vec<u8> {
    let mut key = Vec::with_capacity(key_len + 15);
    let mut digest: Vec<u8> = Vec::new();
    while key.len() < key_len {
        let mut hasher = Md5::new();
        hasher.update(&digest);
        hasher.update(password);
        digest = hasher.finalize().to_vec();
        key.extend_from_slice(&digest);
    }
    key.truncate(key_len);
    key
}
