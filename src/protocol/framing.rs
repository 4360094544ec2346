//! Length-prefixed message framing
//!
//! Every message on the wire is a 4-byte big-endian length followed by
//! exactly that many payload bytes. There is no type tag or checksum at this
//! layer; message meaning lives entirely in the payload.

use bytes::{BufMut, BytesMut};
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::MAX_MESSAGE_SIZE;

/// Size of the length prefix
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Framing errors
#[derive(Error, Debug)]
pub enum FramingError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Message too large: {0} bytes (max: {1})")]
    MessageTooLarge(usize, usize),

    #[error("Connection closed mid-message ({received} of {expected} bytes)")]
    Truncated { received: usize, expected: usize },
}

pub type FramingResult<T> = Result<T, FramingError>;

/// Encode the length header followed by the payload into `buf`
pub fn encode_frame(payload: &[u8], buf: &mut BytesMut) -> FramingResult<()> {
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(FramingError::MessageTooLarge(payload.len(), MAX_MESSAGE_SIZE));
    }

    buf.reserve(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    Ok(())
}

/// Write one message: the length header then the payload.
///
/// Header and payload go out in a single `write_all` so a message is never
/// interleaved with another writer's bytes. Any error leaves the stream in
/// an unknown state and the caller must treat the connection as broken.
pub async fn send<W>(writer: &mut W, payload: &[u8]) -> FramingResult<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    encode_frame(payload, &mut buf)?;

    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read until `buf` is full or the peer closes. Returns the bytes read.
async fn fill<R>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buf.len() {
        let read = reader.read(&mut buf[filled..]).await?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    Ok(filled)
}

/// Read exactly `n` bytes, accumulating across as many reads as needed.
///
/// Returns `Ok(None)` as soon as a read yields zero bytes. A short read on a
/// live connection never counts as success.
pub async fn receive_exact<R>(reader: &mut R, n: usize) -> FramingResult<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = vec![0u8; n];
    if fill(reader, &mut buf).await? < n {
        return Ok(None);
    }
    Ok(Some(buf))
}

/// Read one message.
///
/// `Ok(None)` means the peer closed before any byte of the length header
/// arrived (end of session). A close part-way through a message is an error.
pub async fn receive<R>(reader: &mut R) -> FramingResult<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; LENGTH_PREFIX_SIZE];
    match fill(reader, &mut header).await? {
        0 => return Ok(None),
        LENGTH_PREFIX_SIZE => {}
        received => {
            return Err(FramingError::Truncated {
                received,
                expected: LENGTH_PREFIX_SIZE,
            })
        }
    }

    let length = u32::from_be_bytes(header) as usize;
    if length > MAX_MESSAGE_SIZE {
        return Err(FramingError::MessageTooLarge(length, MAX_MESSAGE_SIZE));
    }

    let mut payload = vec![0u8; length];
    let received = fill(reader, &mut payload).await?;
    if received < length {
        return Err(FramingError::Truncated {
            received,
            expected: length,
        });
    }
    Ok(Some(payload))
}
