use std::cell::Cell;

use bytes::{BufMut, Bytes, BytesMut};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};

use super::{CryptoError, Cryptor};

const COUNTER_LEN: usize = 8;
const TAG_LEN: usize = 16;

/// ChaCha20-Poly1305 with one key and one counter per direction.
///
/// A sealed payload is `counter (u64 BE) || ciphertext || tag`. The nonce is the counter
/// left-padded to 96 bits, and the receiving side only accepts the exact next counter, so a
/// replayed, dropped or reordered payload fails to open.
pub struct SymmetricCryptor {
    seal_cipher: ChaCha20Poly1305,
    open_cipher: ChaCha20Poly1305,
    seal_counter: Cell<u64>,
    open_counter: Cell<u64>,
}

impl SymmetricCryptor {
    pub fn from_keys(seal_key: &[u8; 32], open_key: &[u8; 32]) -> Self {
        Self {
            seal_cipher: ChaCha20Poly1305::new(Key::from_slice(seal_key)),
            open_cipher: ChaCha20Poly1305::new(Key::from_slice(open_key)),
            seal_counter: Cell::new(0),
            open_counter: Cell::new(0),
        }
    }
}

fn nonce(counter: u64) -> [u8; 12] {
    let mut n = [0u8; 12];
    n[4..].copy_from_slice(&counter.to_be_bytes());
    n
}

impl Cryptor for SymmetricCryptor {
    fn seal(&self, aad: &[u8], plaintext: &[u8]) -> Result<Bytes, CryptoError> {
        let counter = self.seal_counter.get();
        let next = counter.checked_add(1).ok_or(CryptoError::CounterExhausted)?;
        let ciphertext = self
            .seal_cipher
            .encrypt(
                Nonce::from_slice(&nonce(counter)),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::Seal)?;
        self.seal_counter.set(next);

        let mut out = BytesMut::with_capacity(COUNTER_LEN + ciphertext.len());
        out.put_u64(counter);
        out.extend_from_slice(&ciphertext);
        Ok(out.freeze())
    }

    fn open(&self, aad: &[u8], sealed: &[u8]) -> Result<Bytes, CryptoError> {
        if sealed.len() < COUNTER_LEN + TAG_LEN {
            return Err(CryptoError::Truncated);
        }
        let (head, ciphertext) = sealed.split_at(COUNTER_LEN);
        let mut counter = [0u8; COUNTER_LEN];
        counter.copy_from_slice(head);
        let got = u64::from_be_bytes(counter);
        let expected = self.open_counter.get();
        if got != expected {
            return Err(CryptoError::Replay { expected, got });
        }
        let next = expected
            .checked_add(1)
            .ok_or(CryptoError::CounterExhausted)?;
        let plaintext = self
            .open_cipher
            .decrypt(
                Nonce::from_slice(&nonce(got)),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::Open)?;
        self.open_counter.set(next);
        Ok(plaintext.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (SymmetricCryptor, SymmetricCryptor) {
        let a = [7u8; 32];
        let b = [9u8; 32];
        (
            SymmetricCryptor::from_keys(&a, &b),
            SymmetricCryptor::from_keys(&b, &a),
        )
    }

    #[test]
    fn tampered_ciphertext_rejected() {
        let (alice, bob) = pair();
        let mut sealed = alice.seal(b"aad", b"payload").unwrap().to_vec();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert_eq!(bob.open(b"aad", &sealed), Err(CryptoError::Open));
    }

    #[test]
    fn aad_is_bound() {
        let (alice, bob) = pair();
        let sealed = alice.seal(b"key=1", b"payload").unwrap();
        assert_eq!(bob.open(b"key=2", &sealed), Err(CryptoError::Open));
    }

    #[test]
    fn replay_rejected() {
        let (alice, bob) = pair();
        let first = alice.seal(b"", b"one").unwrap();
        let second = alice.seal(b"", b"two").unwrap();
        assert_eq!(&bob.open(b"", &first).unwrap()[..], b"one");
        assert_eq!(
            bob.open(b"", &first),
            Err(CryptoError::Replay {
                expected: 1,
                got: 0
            })
        );
        assert_eq!(&bob.open(b"", &second).unwrap()[..], b"two");
    }

    #[test]
    fn truncated_rejected() {
        let (_, bob) = pair();
        assert_eq!(bob.open(b"", &[0u8; 10]), Err(CryptoError::Truncated));
    }

    #[test]
    fn empty_plaintext() {
        let (alice, bob) = pair();
        let sealed = alice.seal(b"", b"").unwrap();
        assert_eq!(sealed.len(), COUNTER_LEN + TAG_LEN);
        assert!(bob.open(b"", &sealed).unwrap().is_empty());
    }
}
