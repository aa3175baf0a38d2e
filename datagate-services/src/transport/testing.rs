//! A minimal client speaking the wire protocol, for driving connections in tests.
use std::{net::SocketAddr, time::Duration};

use datagate_core::{
    codec::{Codec, JsonCodec, Value},
    crypto::{Cryptor, KeyExchange, NoopCryptor, Side},
    ErrorKind,
};
use monoio::net::TcpStream;

use super::{
    frame::{Envelope, Handshake},
    io::{read_frame, write_frame},
};

const MAX_FRAME: usize = 1 << 20;

pub struct TestClient {
    stream: TcpStream,
    cryptor: Box<dyn Cryptor>,
}

pub type Answer = (u64, Result<Value, ErrorKind>);

impl TestClient {
    /// Connect without answering the server handshake.
    pub async fn connect_raw(addr: SocketAddr) -> (TcpStream, Handshake) {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let hello = read_frame(&mut stream, MAX_FRAME).await.unwrap().unwrap();
        assert!(hello.is_handshake());
        let hello = Handshake::from_envelope(&hello).unwrap();
        (stream, hello)
    }

    /// Wrap a stream whose handshake was skipped; payloads go out unsealed.
    pub fn from_stream(stream: TcpStream) -> Self {
        Self {
            stream,
            cryptor: Box::new(NoopCryptor),
        }
    }

    pub async fn connect(addr: SocketAddr) -> Self {
        let (mut stream, hello) = Self::connect_raw(addr).await;
        let cryptor: Box<dyn Cryptor> = match hello.public_key {
            Some(server_key) => {
                let exchange = KeyExchange::generate();
                let reply = Handshake::new(Some(exchange.public_key()));
                write_frame(&mut stream, reply.into_envelope().encode().unwrap())
                    .await
                    .unwrap();
                Box::new(exchange.into_cryptor(&server_key, Side::Client).unwrap())
            }
            None => {
                let reply = Handshake::new(None);
                write_frame(&mut stream, reply.into_envelope().encode().unwrap())
                    .await
                    .unwrap();
                Box::new(NoopCryptor)
            }
        };
        Self { stream, cryptor }
    }

    pub fn is_encrypted(&self) -> bool {
        self.cryptor.is_encrypting()
    }

    pub async fn send(&mut self, envelope: Envelope) {
        let sealed = self.seal(envelope);
        self.send_raw(sealed).await;
    }

    /// Seal the payload against the envelope's current header.
    pub fn seal(&mut self, mut envelope: Envelope) -> Envelope {
        envelope.payload = self.cryptor.seal(&envelope.aad().unwrap(), &envelope.payload).unwrap();
        envelope
    }

    /// Send without sealing the payload.
    pub async fn send_raw(&mut self, envelope: Envelope) {
        write_frame(&mut self.stream, envelope.encode().unwrap())
            .await
            .unwrap();
    }

    pub async fn call(&mut self, key: u64, service: &str, method: &str, args: &[Value]) {
        let payload = JsonCodec.encode_args(args).unwrap();
        self.send(Envelope::request(key, service, method, args.len() as u16, payload))
            .await;
    }

    pub async fn cancel(&mut self, key: u64) {
        self.send(Envelope::cancel(key)).await;
    }

    /// Next envelope with its payload opened, or `None` once the server closed.
    pub async fn recv(&mut self) -> Option<Envelope> {
        let next = monoio::time::timeout(
            Duration::from_secs(5),
            read_frame(&mut self.stream, MAX_FRAME),
        )
        .await
        .expect("no frame from server within 5s");
        let mut envelope = match next {
            Ok(Some(envelope)) => envelope,
            Ok(None) | Err(_) => return None,
        };
        envelope.payload = self.cryptor.open(&envelope.aad().unwrap(), &envelope.payload).unwrap();
        Some(envelope)
    }

    pub async fn answer(&mut self) -> Answer {
        let envelope = self.recv().await.expect("connection closed");
        (envelope.correlation_key, decode(&envelope))
    }
}

pub fn decode(envelope: &Envelope) -> Result<Value, ErrorKind> {
    if envelope.is_exception() {
        Err(JsonCodec.decode_error(&envelope.payload).unwrap().kind)
    } else {
        Ok(JsonCodec.decode_value(&envelope.payload).unwrap())
    }
}
