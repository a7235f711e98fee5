//! Length-prefixed framing over worker stdio.
//!
//! ```text
//! [u32 LE: len][payload bytes of len]
//! ```

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the length prefix.
pub const PREFIX_LEN: usize = 4;

/// Read one frame.
///
/// Returns `None` on clean EOF at a frame boundary. EOF inside a frame is
/// an `UnexpectedEof` error; frames above `max_len` are `InvalidData`.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_len: usize,
) -> std::io::Result<Option<Bytes>> {
    let mut len_buf = [0u8; PREFIX_LEN];
    let mut filled = 0;
    while filled < PREFIX_LEN {
        match reader.read(&mut len_buf[filled..]).await? {
            0 if filled == 0 => return Ok(None),
            0 => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("stream ended after {filled} of {PREFIX_LEN} prefix bytes"),
                ));
            }
            n => filled += n,
        }
    }

    let len = u32::from_le_bytes(len_buf) as usize;
    if len > max_len {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame size {len} exceeds maximum {max_len}"),
        ));
    }

    let mut payload = BytesMut::zeroed(len);
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload.freeze()))
}

/// Write one frame and flush.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> std::io::Result<()> {
    let len = u32::try_from(payload.len()).map_err(|_| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("frame size {} does not fit the length prefix", payload.len()),
        )
    })?;
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn prefix_is_little_endian() {
        let (mut a, mut b) = tokio::io::duplex(64);
        write_frame(&mut a, b"abc").await.unwrap();
        let mut raw = [0u8; 7];
        b.read_exact(&mut raw).await.unwrap();
        assert_eq!(&raw, &[3, 0, 0, 0, b'a', b'b', b'c']);
    }

    #[tokio::test]
    async fn frames_are_read_back_in_order() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, b"first").await.unwrap();
        write_frame(&mut a, b"").await.unwrap();
        write_frame(&mut a, b"third").await.unwrap();
        drop(a);

        assert_eq!(read_frame(&mut b, 64).await.unwrap().unwrap(), "first");
        assert_eq!(read_frame(&mut b, 64).await.unwrap().unwrap(), "");
        assert_eq!(read_frame(&mut b, 64).await.unwrap().unwrap(), "third");
        assert!(read_frame(&mut b, 64).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn payload_split_across_writes_is_reassembled() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let reader = tokio::spawn(async move { read_frame(&mut b, 64).await });
        a.write_all(&[5, 0]).await.unwrap();
        tokio::task::yield_now().await;
        a.write_all(&[0, 0, b'h', b'e']).await.unwrap();
        tokio::task::yield_now().await;
        a.write_all(b"llo").await.unwrap();
        assert_eq!(reader.await.unwrap().unwrap().unwrap(), "hello");
    }

    #[tokio::test]
    async fn truncated_payload_is_an_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&[10, 0, 0, 0, 1, 2]).await.unwrap();
        drop(a);
        let err = read_frame(&mut b, 64).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn truncated_prefix_is_an_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&[5, 0]).await.unwrap();
        drop(a);
        let err = read_frame(&mut b, 64).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn oversize_frame_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&1000u32.to_le_bytes()).await.unwrap();
        let err = read_frame(&mut b, 999).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }
}
