//! Payload encryption negotiated during the connection handshake.
//!
//! A connection owns exactly one [`Cryptor`] for its whole life. With encryption disabled it is
//! a [`NoopCryptor`]; otherwise it is a [`SymmetricCryptor`] derived from an X25519
//! [`KeyExchange`]. Cryptors keep per-direction counters in `Cell`s and are therefore meant to
//! stay on the connection's thread.
use bytes::Bytes;

mod aead;
mod exchange;

pub use aead::SymmetricCryptor;
pub use exchange::{KeyExchange, Side, PUBLIC_KEY_LEN};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("encrypt payload failed")]
    Seal,
    #[error("decrypt payload failed")]
    Open,
    #[error("unexpected message counter: expected {expected}, got {got}")]
    Replay { expected: u64, got: u64 },
    #[error("sealed payload too short")]
    Truncated,
    #[error("key derivation failed")]
    KeyDerivation,
    #[error("message counter exhausted")]
    CounterExhausted,
    #[error("peer key share is not contributory")]
    NonContributory,
}

/// Symmetric encrypt/decrypt of envelope payloads.
///
/// `aad` is authenticated but not encrypted; callers pass the envelope header fields that the
/// payload must stay bound to.
pub trait Cryptor {
    fn seal(&self, aad: &[u8], plaintext: &[u8]) -> Result<Bytes, CryptoError>;
    fn open(&self, aad: &[u8], sealed: &[u8]) -> Result<Bytes, CryptoError>;

    fn is_encrypting(&self) -> bool {
        true
    }
}

/// Installed when encryption is disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCryptor;

impl Cryptor for NoopCryptor {
    fn seal(&self, _aad: &[u8], plaintext: &[u8]) -> Result<Bytes, CryptoError> {
        Ok(Bytes::copy_from_slice(plaintext))
    }

    fn open(&self, _aad: &[u8], sealed: &[u8]) -> Result<Bytes, CryptoError> {
        Ok(Bytes::copy_from_slice(sealed))
    }

    fn is_encrypting(&self) -> bool {
        false
    }
}
