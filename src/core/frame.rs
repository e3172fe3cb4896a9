//! Framing: fixed 12-byte header + variable body.
//!
//! Wire layout, all integers big-endian:
//!
//! | field     | size      |
//! |-----------|-----------|
//! | type      | 2 B       |
//! | info_size | 4 B       |
//! | data_size | 4 B       |
//! | reserved  | 2 B       |
//! | info      | info_size |
//! | data      | data_size |
//!
//! The reserved bytes pad the header to 12 and are zero on write, ignored
//! on read. There is no magic, no checksum and no version field; peers are
//! expected to agree on the protocol out of band.

use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Fixed size of the frame header on the wire.
pub const HEADER_LEN: usize = 12;

/// The on-wire unit. `info` carries per-type metadata, `data` the payload;
/// their sizes are derived from the buffers at encode time, so the header
/// counts can never disagree with the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: u16,
    pub info: Vec<u8>,
    pub data: Vec<u8>,
}

impl Frame {
    pub fn new(frame_type: u16, info: Vec<u8>, data: Vec<u8>) -> Self {
        Self {
            frame_type,
            info,
            data,
        }
    }

    /// Total encoded length: header plus both body sections.
    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.info.len() + self.data.len()
    }

    /// Encode into a single contiguous buffer.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.wire_len());
        buf.extend_from_slice(&self.frame_type.to_be_bytes());
        buf.extend_from_slice(&(self.info.len() as u32).to_be_bytes());
        buf.extend_from_slice(&(self.data.len() as u32).to_be_bytes());
        buf.extend_from_slice(&[0u8; 2]);
        buf.extend_from_slice(&self.info);
        buf.extend_from_slice(&self.data);
        buf
    }

    /// Decode one frame from the front of `bytes`. Returns the frame and
    /// the number of bytes consumed. Callers holding a partial buffer get
    /// `NeedMore` and should retry once more data has arrived.
    pub fn decode(bytes: &[u8]) -> Result<(Frame, usize), FrameDecodeError> {
        if bytes.len() < HEADER_LEN {
            return Err(FrameDecodeError::NeedMore);
        }
        let frame_type = u16::from_be_bytes([bytes[0], bytes[1]]);
        let info_size = u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]) as usize;
        let data_size = u32::from_be_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]) as usize;
        // bytes[10..12] reserved

        let total = HEADER_LEN + info_size + data_size;
        if bytes.len() < total {
            return Err(FrameDecodeError::NeedMore);
        }
        let info = bytes[HEADER_LEN..HEADER_LEN + info_size].to_vec();
        let data = bytes[HEADER_LEN + info_size..total].to_vec();
        Ok((
            Frame {
                frame_type,
                info,
                data,
            },
            total,
        ))
    }
}

/// Error decoding a frame from a byte buffer.
#[derive(Debug, Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
}

/// Error reading a frame from a stream.
#[derive(Debug, Error)]
pub enum FrameReadError {
    #[error("frame read error: {0}")]
    Io(#[from] io::Error),
    #[error("frame body of {got} bytes exceeds the {limit}-byte session limit")]
    TooLarge { got: u64, limit: u64 },
}

impl FrameReadError {
    /// True when the peer closed the stream cleanly between frames.
    pub fn is_eof(&self) -> bool {
        matches!(self, FrameReadError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof)
    }
}

/// Read exactly one frame. The codec itself imposes no size cap: callers
/// that must bound memory go through [`read_frame_limited`] instead.
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, FrameReadError>
where
    R: AsyncRead + Unpin,
{
    read_frame_limited(reader, u64::MAX).await
}

/// Read exactly one frame, rejecting bodies larger than `max_body` bytes
/// (info and data combined) before anything is allocated for them.
pub async fn read_frame_limited<R>(reader: &mut R, max_body: u64) -> Result<Frame, FrameReadError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await?;

    let frame_type = u16::from_be_bytes([header[0], header[1]]);
    let info_size = u32::from_be_bytes([header[2], header[3], header[4], header[5]]);
    let data_size = u32::from_be_bytes([header[6], header[7], header[8], header[9]]);

    let body = info_size as u64 + data_size as u64;
    if body > max_body {
        return Err(FrameReadError::TooLarge {
            got: body,
            limit: max_body,
        });
    }

    let mut info = vec![0u8; info_size as usize];
    reader.read_exact(&mut info).await?;
    let mut data = vec![0u8; data_size as usize];
    reader.read_exact(&mut data).await?;

    Ok(Frame {
        frame_type,
        info,
        data,
    })
}

/// Write one frame as a single contiguous buffer.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&frame.encode()).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let cases = vec![
            Frame::new(2, b"info".to_vec(), b"some data".to_vec()),
            Frame::new(0, Vec::new(), Vec::new()),
            Frame::new(u16::MAX, vec![0xAB; 16], Vec::new()),
            Frame::new(6, Vec::new(), vec![0u8; 4096]),
        ];
        for frame in cases {
            let bytes = frame.encode();
            let (decoded, n) = Frame::decode(&bytes).unwrap();
            assert_eq!(n, bytes.len());
            assert_eq!(decoded, frame);
        }
    }

    #[test]
    fn test_wire_layout() {
        let frame = Frame::new(4, vec![0x11, 0x22], vec![0x33, 0x44, 0x55]);
        let bytes = frame.encode();
        assert_eq!(bytes.len(), 12 + 2 + 3);
        assert_eq!(&bytes[0..2], &[0x00, 0x04]); // type
        assert_eq!(&bytes[2..6], &[0, 0, 0, 2]); // info_size
        assert_eq!(&bytes[6..10], &[0, 0, 0, 3]); // data_size
        assert_eq!(&bytes[10..12], &[0, 0]); // reserved
        assert_eq!(&bytes[12..14], &[0x11, 0x22]);
        assert_eq!(&bytes[14..17], &[0x33, 0x44, 0x55]);
    }

    #[test]
    fn test_reserved_bytes_ignored() {
        let mut bytes = Frame::new(5, b"i".to_vec(), b"d".to_vec()).encode();
        bytes[10] = 0xFF;
        bytes[11] = 0xFF;
        let (decoded, _) = Frame::decode(&bytes).unwrap();
        assert_eq!(decoded.frame_type, 5);
        assert_eq!(decoded.info, b"i");
        assert_eq!(decoded.data, b"d");
    }

    #[test]
    fn test_decode_need_more() {
        let bytes = Frame::new(2, b"info".to_vec(), b"data".to_vec()).encode();
        assert!(matches!(
            Frame::decode(&bytes[..4]),
            Err(FrameDecodeError::NeedMore)
        ));
        assert!(matches!(
            Frame::decode(&bytes[..bytes.len() - 1]),
            Err(FrameDecodeError::NeedMore)
        ));
    }

    #[test]
    fn test_decode_consecutive_frames() {
        let a = Frame::new(2, b"first".to_vec(), Vec::new());
        let b = Frame::new(3, Vec::new(), b"second".to_vec());
        let mut buf = a.encode();
        buf.extend_from_slice(&b.encode());

        let (da, n) = Frame::decode(&buf).unwrap();
        let (db, m) = Frame::decode(&buf[n..]).unwrap();
        assert_eq!(da, a);
        assert_eq!(db, b);
        assert_eq!(n + m, buf.len());
    }

    #[tokio::test]
    async fn test_read_write_stream() {
        let frame = Frame::new(6, vec![1, 2, 3], vec![4, 5, 6, 7]);
        let mut buf = Vec::new();
        write_frame(&mut buf, &frame).await.unwrap();

        let mut reader = buf.as_slice();
        let back = read_frame(&mut reader).await.unwrap();
        assert_eq!(back, frame);
    }

    #[tokio::test]
    async fn test_read_frame_eof() {
        let mut reader: &[u8] = &[];
        let err = read_frame(&mut reader).await.unwrap_err();
        assert!(err.is_eof());
    }

    #[tokio::test]
    async fn test_read_frame_truncated_body() {
        let bytes = Frame::new(2, b"info".to_vec(), b"data".to_vec()).encode();
        let mut reader = &bytes[..bytes.len() - 2];
        let err = read_frame(&mut reader).await.unwrap_err();
        assert!(err.is_eof());
    }

    #[tokio::test]
    async fn test_read_frame_limited() {
        let frame = Frame::new(6, vec![0u8; 8], vec![0u8; 100]);
        let bytes = frame.encode();

        let mut reader = bytes.as_slice();
        assert!(matches!(
            read_frame_limited(&mut reader, 64).await,
            Err(FrameReadError::TooLarge { got: 108, limit: 64 })
        ));

        let mut reader = bytes.as_slice();
        let ok = read_frame_limited(&mut reader, 108).await.unwrap();
        assert_eq!(ok, frame);
    }
}
