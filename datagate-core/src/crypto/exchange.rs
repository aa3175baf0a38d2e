use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey};

use super::{CryptoError, SymmetricCryptor};

pub const PUBLIC_KEY_LEN: usize = 32;

const CLIENT_TO_SERVER: &[u8] = b"datagate client->server";
const SERVER_TO_CLIENT: &[u8] = b"datagate server->client";

/// Which end of the connection is deriving keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Server,
    Client,
}

/// One ephemeral X25519 key share. Consumed by [`KeyExchange::into_cryptor`].
pub struct KeyExchange {
    secret: EphemeralSecret,
    public: PublicKey,
}

impl KeyExchange {
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_key(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.public.to_bytes()
    }

    /// Complete the exchange with the peer's share and derive the directional keys.
    ///
    /// Both ends salt HKDF with `server share || client share`, so they agree on the salt
    /// regardless of which side runs this.
    pub fn into_cryptor(
        self,
        peer: &[u8; PUBLIC_KEY_LEN],
        side: Side,
    ) -> Result<SymmetricCryptor, CryptoError> {
        let ours = self.public.to_bytes();
        let shared = self.secret.diffie_hellman(&PublicKey::from(*peer));
        if !shared.was_contributory() {
            return Err(CryptoError::NonContributory);
        }

        let mut salt = [0u8; 2 * PUBLIC_KEY_LEN];
        let (server, client) = match side {
            Side::Server => (&ours, peer),
            Side::Client => (peer, &ours),
        };
        salt[..PUBLIC_KEY_LEN].copy_from_slice(server);
        salt[PUBLIC_KEY_LEN..].copy_from_slice(client);

        let hk = Hkdf::<Sha256>::new(Some(&salt), shared.as_bytes());
        let mut c2s = [0u8; 32];
        let mut s2c = [0u8; 32];
        hk.expand(CLIENT_TO_SERVER, &mut c2s)
            .map_err(|_| CryptoError::KeyDerivation)?;
        hk.expand(SERVER_TO_CLIENT, &mut s2c)
            .map_err(|_| CryptoError::KeyDerivation)?;

        Ok(match side {
            Side::Server => SymmetricCryptor::from_keys(&s2c, &c2s),
            Side::Client => SymmetricCryptor::from_keys(&c2s, &s2c),
        })
    }
}
