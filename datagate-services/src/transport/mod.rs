//! The socket side of the server: framing, handshake and per-connection service.
mod connection;
mod frame;
mod handshake;
mod io;

#[cfg(test)]
mod testing;

pub use connection::{ConnectionError, ConnectionService, TransportSettings};
pub use frame::{Envelope, Flags, FrameError, Handshake, PROTOCOL_VERSION, WIRE_VERSION};
pub use handshake::{negotiate, HandshakeError};
pub use io::{read_frame, write_frame, ReadError};
