//! Typed messages: one variant per wire frame type.
//!
//! A [`Frame`] is an untyped byte container; this module gives each frame
//! type a struct with real fields and owns the byte-level body layout in
//! one place. Encoding and decoding dispatch on the type tag:
//!
//! - `TEXT` (2): info = label, data = content, both UTF-8
//! - `SIMPLE_FILE` (3): info = file name, data = whole file content
//! - `FILE_HEADER` (4): info = file_id, data = file_size (8 B BE) || name
//! - `BLOCK_REQUEST` (5): info = file_id, data = start (8 B) || length (8 B)
//! - `BLOCK_RESPONSE` (6): info = start (8 B) || file_id, data = block bytes
//! - `TRANSFER_ERROR` (7): info = file_id, data = UTF-8 reason

use std::fmt;

use thiserror::Error;

use crate::core::frame::Frame;

pub const TYPE_TEXT: u16 = 2;
pub const TYPE_SIMPLE_FILE: u16 = 3;
pub const TYPE_FILE_HEADER: u16 = 4;
pub const TYPE_BLOCK_REQUEST: u16 = 5;
pub const TYPE_BLOCK_RESPONSE: u16 = 6;
pub const TYPE_TRANSFER_ERROR: u16 = 7;

// ── File identity ────────────────────────────────────────────────────────────

/// 16-byte MD5 digest of a file's contents. Doubles as the transfer
/// identifier on the wire and as the final integrity check.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileId([u8; 16]);

impl FileId {
    pub const LEN: usize = 16;

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Parse from a wire slice that must be exactly 16 bytes.
    pub fn parse(slice: &[u8]) -> Result<Self, MessageDecodeError> {
        let bytes: [u8; 16] = slice
            .try_into()
            .map_err(|_| MessageDecodeError::BadFileId { len: slice.len() })?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Lowercase hex rendering, used in logs and staging-directory names.
    pub fn hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex())
    }
}

impl fmt::Debug for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileId({})", self.hex())
    }
}

// ── Message variants ─────────────────────────────────────────────────────────

/// File advertisement, also echoed back by the receiver as the
/// end-of-transfer acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub file_id: FileId,
    pub file_size: u64,
    pub file_name: String,
}

/// Request for `length` bytes of a file starting at byte offset `start`.
/// The sender clips at end of file, so `start + length` may exceed the
/// file size on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRequest {
    pub file_id: FileId,
    pub start: u64,
    pub length: u64,
}

/// One served block. `data` may be shorter than the requested length when
/// the request ran into end of file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockResponse {
    pub file_id: FileId,
    pub start: u64,
    pub data: Vec<u8>,
}

/// A one-shot chat-style message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextMessage {
    pub info: String,
    pub content: String,
}

/// A small file carried whole in a single frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimpleFile {
    pub file_name: String,
    pub content: Vec<u8>,
}

/// Sender-to-receiver error report, e.g. a request for an unknown file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferError {
    pub file_id: FileId,
    pub reason: String,
}

/// All wire message types. Framing is the fixed 12-byte header of the
/// frame module; this enum owns the body layouts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Text(TextMessage),
    SimpleFile(SimpleFile),
    FileHeader(FileHeader),
    BlockRequest(BlockRequest),
    BlockResponse(BlockResponse),
    TransferError(TransferError),
}

/// Error giving a frame its typed view.
#[derive(Debug, Error)]
pub enum MessageDecodeError {
    #[error("unknown frame type {0}")]
    UnknownType(u16),
    #[error("file id must be 16 bytes, got {len}")]
    BadFileId { len: usize },
    #[error("{section} of {frame} frame too short: need {needs} bytes, got {got}")]
    Truncated {
        frame: &'static str,
        section: &'static str,
        needs: usize,
        got: usize,
    },
    #[error("{0} is not valid UTF-8")]
    InvalidUtf8(&'static str),
}

impl WireMessage {
    pub fn frame_type(&self) -> u16 {
        match self {
            WireMessage::Text(_) => TYPE_TEXT,
            WireMessage::SimpleFile(_) => TYPE_SIMPLE_FILE,
            WireMessage::FileHeader(_) => TYPE_FILE_HEADER,
            WireMessage::BlockRequest(_) => TYPE_BLOCK_REQUEST,
            WireMessage::BlockResponse(_) => TYPE_BLOCK_RESPONSE,
            WireMessage::TransferError(_) => TYPE_TRANSFER_ERROR,
        }
    }

    /// Assemble the byte-level body layout for this message.
    pub fn into_frame(self) -> Frame {
        match self {
            WireMessage::Text(m) => Frame::new(
                TYPE_TEXT,
                m.info.into_bytes(),
                m.content.into_bytes(),
            ),
            WireMessage::SimpleFile(f) => {
                Frame::new(TYPE_SIMPLE_FILE, f.file_name.into_bytes(), f.content)
            }
            WireMessage::FileHeader(h) => {
                let mut data = Vec::with_capacity(8 + h.file_name.len());
                data.extend_from_slice(&h.file_size.to_be_bytes());
                data.extend_from_slice(h.file_name.as_bytes());
                Frame::new(TYPE_FILE_HEADER, h.file_id.as_bytes().to_vec(), data)
            }
            WireMessage::BlockRequest(r) => {
                let mut data = Vec::with_capacity(16);
                data.extend_from_slice(&r.start.to_be_bytes());
                data.extend_from_slice(&r.length.to_be_bytes());
                Frame::new(TYPE_BLOCK_REQUEST, r.file_id.as_bytes().to_vec(), data)
            }
            WireMessage::BlockResponse(r) => {
                let mut info = Vec::with_capacity(8 + FileId::LEN);
                info.extend_from_slice(&r.start.to_be_bytes());
                info.extend_from_slice(r.file_id.as_bytes());
                Frame::new(TYPE_BLOCK_RESPONSE, info, r.data)
            }
            WireMessage::TransferError(e) => Frame::new(
                TYPE_TRANSFER_ERROR,
                e.file_id.as_bytes().to_vec(),
                e.reason.into_bytes(),
            ),
        }
    }

    /// Decode a frame into its typed view, dispatching on the type tag.
    pub fn from_frame(frame: Frame) -> Result<Self, MessageDecodeError> {
        match frame.frame_type {
            TYPE_TEXT => Ok(WireMessage::Text(TextMessage {
                info: utf8("text info", frame.info)?,
                content: utf8("text content", frame.data)?,
            })),
            TYPE_SIMPLE_FILE => Ok(WireMessage::SimpleFile(SimpleFile {
                file_name: utf8("simple-file name", frame.info)?,
                content: frame.data,
            })),
            TYPE_FILE_HEADER => {
                let file_id = FileId::parse(&frame.info)?;
                if frame.data.len() < 8 {
                    return Err(MessageDecodeError::Truncated {
                        frame: "header",
                        section: "data",
                        needs: 8,
                        got: frame.data.len(),
                    });
                }
                let file_size = u64_at(&frame.data, 0);
                let file_name = utf8("header file name", frame.data[8..].to_vec())?;
                Ok(WireMessage::FileHeader(FileHeader {
                    file_id,
                    file_size,
                    file_name,
                }))
            }
            TYPE_BLOCK_REQUEST => {
                let file_id = FileId::parse(&frame.info)?;
                if frame.data.len() < 16 {
                    return Err(MessageDecodeError::Truncated {
                        frame: "request",
                        section: "data",
                        needs: 16,
                        got: frame.data.len(),
                    });
                }
                Ok(WireMessage::BlockRequest(BlockRequest {
                    file_id,
                    start: u64_at(&frame.data, 0),
                    length: u64_at(&frame.data, 8),
                }))
            }
            TYPE_BLOCK_RESPONSE => {
                if frame.info.len() < 8 + FileId::LEN {
                    return Err(MessageDecodeError::Truncated {
                        frame: "response",
                        section: "info",
                        needs: 8 + FileId::LEN,
                        got: frame.info.len(),
                    });
                }
                let start = u64_at(&frame.info, 0);
                let file_id = FileId::parse(&frame.info[8..8 + FileId::LEN])?;
                Ok(WireMessage::BlockResponse(BlockResponse {
                    file_id,
                    start,
                    data: frame.data,
                }))
            }
            TYPE_TRANSFER_ERROR => Ok(WireMessage::TransferError(TransferError {
                file_id: FileId::parse(&frame.info)?,
                reason: utf8("error reason", frame.data)?,
            })),
            other => Err(MessageDecodeError::UnknownType(other)),
        }
    }
}

fn u64_at(bytes: &[u8], offset: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_be_bytes(buf)
}

fn utf8(section: &'static str, bytes: Vec<u8>) -> Result<String, MessageDecodeError> {
    String::from_utf8(bytes).map_err(|_| MessageDecodeError::InvalidUtf8(section))
}
