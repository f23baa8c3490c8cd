//! Length-prefixed stream framing for pool sessions.
//!
//! # Wire format
//!
//! ```text
//! [4-byte big-endian length][MessagePack payload]
//! ```

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum payload size accepted on either side of a session.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Errors from framing operations.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The underlying stream failed.
    #[error("frame I/O error: {0}")]
    Io(#[from] io::Error),

    /// The announced or supplied payload exceeds [`MAX_FRAME_SIZE`].
    #[error("frame too large: {0} bytes")]
    TooLarge(usize),
}

/// Write `payload` as one length-prefixed frame and flush.
///
/// # Errors
///
/// Returns [`FrameError::TooLarge`] for oversized payloads and
/// [`FrameError::Io`] if the stream fails.
pub async fn write_frame<S: AsyncWrite + Unpin>(
    stream: &mut S,
    payload: &[u8],
) -> Result<(), FrameError> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge(payload.len()));
    }
    let len = payload.len() as u32;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(payload).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one frame. Returns `Ok(None)` if the stream ended cleanly before a
/// new frame started.
///
/// # Errors
///
/// Returns [`FrameError::TooLarge`] if the length prefix exceeds
/// [`MAX_FRAME_SIZE`] and [`FrameError::Io`] on a truncated frame.
pub async fn read_frame<S: AsyncRead + Unpin>(
    stream: &mut S,
) -> Result<Option<Vec<u8>>, FrameError> {
    let mut len_bytes = [0u8; 4];
    match stream.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge(len));
    }

    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_are_read_back_in_order() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"first").await.unwrap();
        write_frame(&mut buf, b"").await.unwrap();
        write_frame(&mut buf, b"third").await.unwrap();

        let mut reader = buf.as_slice();
        assert_eq!(read_frame(&mut reader).await.unwrap().unwrap(), b"first");
        assert_eq!(read_frame(&mut reader).await.unwrap().unwrap(), b"");
        assert_eq!(read_frame(&mut reader).await.unwrap().unwrap(), b"third");
        assert!(read_frame(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_prefix_is_rejected() {
        let announced = (MAX_FRAME_SIZE as u32 + 1).to_be_bytes();
        let mut reader = &announced[..];
        let result = read_frame(&mut reader).await;
        assert!(matches!(result, Err(FrameError::TooLarge(_))));
    }

    #[tokio::test]
    async fn test_truncated_body_is_an_error() {
        let mut buf = 100u32.to_be_bytes().to_vec();
        buf.extend_from_slice(&[1, 2, 3]);
        let mut reader = buf.as_slice();
        let result = read_frame(&mut reader).await;
        assert!(matches!(result, Err(FrameError::Io(_))));
    }
}
