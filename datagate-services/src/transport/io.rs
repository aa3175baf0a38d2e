use std::io;

use bytes::Bytes;
use monoio::{
    buf::IoBufMut,
    io::{AsyncReadRent, AsyncReadRentExt, AsyncWriteRent, AsyncWriteRentExt},
};

use super::frame::{Envelope, FrameError};

#[derive(thiserror::Error, Debug)]
pub enum ReadError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
}

/// Read one frame. `Ok(None)` means the peer closed the connection between frames.
pub async fn read_frame<R: AsyncReadRent>(
    io: &mut R,
    max_frame_size: usize,
) -> Result<Option<Envelope>, ReadError> {
    let (res, prefix) = io.read_exact(Vec::<u8>::with_capacity(4).slice_mut(0..4)).await;
    match res {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let prefix = prefix.into_inner();
    let len = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
    if len > max_frame_size {
        return Err(FrameError::TooLarge(len, max_frame_size).into());
    }
    let (res, body) = io.read_exact(Vec::<u8>::with_capacity(len).slice_mut(0..len)).await;
    res?;
    Ok(Some(Envelope::decode(Bytes::from(body.into_inner()))?))
}

pub async fn write_frame<W: AsyncWriteRent>(io: &mut W, frame: Bytes) -> io::Result<()> {
    let (res, _) = io.write_all(frame).await;
    res?;
    io.flush().await
}
