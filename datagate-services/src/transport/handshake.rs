use std::{rc::Rc, time::Duration};

use datagate_core::crypto::{CryptoError, Cryptor, KeyExchange, NoopCryptor, Side};
use monoio::io::{AsyncReadRent, AsyncWriteRent};
use tracing::debug;

use super::{
    frame::{FrameError, Handshake, PROTOCOL_VERSION},
    io::{read_frame, write_frame, ReadError},
};

#[derive(thiserror::Error, Debug)]
pub enum HandshakeError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed handshake: {0}")]
    Frame(#[from] FrameError),
    #[error("connection closed before handshake")]
    Closed,
    #[error("no handshake within {0:?}")]
    Timeout(Duration),
    #[error("envelope {0} received before handshake")]
    Unexpected(u64),
    #[error("unsupported protocol version {0:?}")]
    Version(String),
    #[error("client sent no key share but encryption is required")]
    MissingKey,
    #[error("key agreement failed: {0}")]
    Crypto(#[from] CryptoError),
}

impl From<ReadError> for HandshakeError {
    fn from(value: ReadError) -> Self {
        match value {
            ReadError::Io(e) => HandshakeError::Io(e),
            ReadError::Frame(e) => HandshakeError::Frame(e),
        }
    }
}

impl HandshakeError {
    /// The correlation key of the offending envelope, if the failure was caused by one.
    pub fn offending_key(&self) -> Option<u64> {
        match self {
            HandshakeError::Unexpected(key) => Some(*key),
            _ => None,
        }
    }
}

/// Server side of the connection handshake.
///
/// Sends the server handshake first (with a fresh key share when `encryption` is on), then waits
/// up to `timeout` for the client's. The returned cryptor is installed for the rest of the
/// connection.
pub async fn negotiate<S>(
    io: &mut S,
    encryption: bool,
    timeout: Duration,
    max_frame_size: usize,
) -> Result<Rc<dyn Cryptor>, HandshakeError>
where
    S: AsyncReadRent + AsyncWriteRent,
{
    let exchange = encryption.then(KeyExchange::generate);
    let hello = Handshake::new(exchange.as_ref().map(KeyExchange::public_key));
    write_frame(io, hello.into_envelope().encode()?).await?;

    let reply = match monoio::time::timeout(timeout, read_frame(io, max_frame_size)).await {
        Ok(reply) => reply?.ok_or(HandshakeError::Closed)?,
        Err(_) => return Err(HandshakeError::Timeout(timeout)),
    };
    if !reply.is_handshake() {
        return Err(HandshakeError::Unexpected(reply.correlation_key));
    }
    let reply = Handshake::from_envelope(&reply)?;
    if reply.version != PROTOCOL_VERSION {
        return Err(HandshakeError::Version(reply.version));
    }

    match exchange {
        Some(exchange) => {
            let peer = reply.public_key.ok_or(HandshakeError::MissingKey)?;
            let cryptor = exchange.into_cryptor(&peer, Side::Server)?;
            debug!("handshake complete, payload encryption on");
            Ok(Rc::new(cryptor))
        }
        None => {
            debug!("handshake complete, payload encryption off");
            Ok(Rc::new(NoopCryptor))
        }
    }
}
