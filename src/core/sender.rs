//! Block sender: serve advertised files to a pulling receiver.
//!
//! The sender is a per-connection service. It advertises one FILE_HEADER
//! per appended file, then answers BLOCK_REQUESTs by reading the asked
//! byte range from disk (clipped at end of file) and writing it back as a
//! BLOCK_RESPONSE. A FILE_HEADER echoed by the peer acknowledges that
//! file; the connection is served until every advertised file has been
//! acknowledged. If the peer stays silent for the re-broadcast interval,
//! all outstanding headers are sent again, which keeps the exchange live
//! when the initial advertisement was missed.

use std::collections::{HashMap, HashSet};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::core::block::BLOCK_SIZE;
use crate::core::frame::{read_frame_limited, write_frame};
use crate::core::message::{
    BlockRequest, BlockResponse, FileHeader, FileId, TransferError, WireMessage,
};
use crate::utils::hash;

/// Idle time on a connection before outstanding headers are re-sent.
pub const REBROADCAST_INTERVAL: Duration = Duration::from_secs(3);

/// Inbound cap while serving: the peer only ever sends requests and
/// header echoes, both small.
const MAX_CONTROL_FRAME: u64 = 64 * 1024;

struct ServedFile {
    path: PathBuf,
    header: FileHeader,
}

/// The advertised-file table plus the per-connection serve loop. Files
/// are appended at startup and live for the process lifetime; serving
/// holds no per-connection state beyond the pending-acknowledgement set.
#[derive(Default)]
pub struct BlockSender {
    files: HashMap<FileId, ServedFile>,
}

impl BlockSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Digest a file and add it to the advertisement table. Appending the
    /// same content twice is idempotent (the digest is the key).
    pub async fn append_file(&mut self, path: &Path) -> Result<FileId> {
        let (file_id, file_size) = hash::digest_file(path)
            .await
            .with_context(|| format!("digesting {}", path.display()))?;

        let file_name = path
            .file_name()
            .context("path has no file name")?
            .to_string_lossy()
            .into_owned();

        info!(file_id = %file_id, file = %file_name, size = file_size, "advertising file");

        self.files.insert(
            file_id,
            ServedFile {
                path: path.to_path_buf(),
                header: FileHeader {
                    file_id,
                    file_size,
                    file_name,
                },
            },
        );
        Ok(file_id)
    }

    /// Serve one connection until every advertised file is acknowledged.
    pub async fn serve<S>(&self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut pending: HashSet<FileId> = self.files.keys().copied().collect();
        if pending.is_empty() {
            warn!("no files to serve, closing connection");
            return Ok(());
        }

        let (mut reader, mut writer) = tokio::io::split(stream);
        self.advertise(&mut writer, &pending).await?;

        loop {
            let frame = match timeout(
                REBROADCAST_INTERVAL,
                read_frame_limited(&mut reader, MAX_CONTROL_FRAME),
            )
            .await
            {
                Err(_elapsed) => {
                    debug!(outstanding = pending.len(), "idle, re-advertising");
                    self.advertise(&mut writer, &pending).await?;
                    continue;
                }
                Ok(Err(e)) => {
                    return Err(e).context("connection lost before all transfers were acknowledged")
                }
                Ok(Ok(frame)) => frame,
            };

            match WireMessage::from_frame(frame) {
                Ok(WireMessage::FileHeader(h)) => {
                    if pending.remove(&h.file_id) {
                        info!(file_id = %h.file_id, "transfer acknowledged by peer");
                        if pending.is_empty() {
                            return Ok(());
                        }
                    } else if self.files.contains_key(&h.file_id) {
                        debug!(file_id = %h.file_id, "duplicate acknowledgement");
                    } else {
                        warn!(file_id = %h.file_id, "acknowledgement for a file we never advertised");
                    }
                }
                Ok(WireMessage::BlockRequest(req)) => {
                    self.answer(&req, &mut writer).await?;
                }
                Ok(other) => {
                    warn!(
                        frame_type = other.frame_type(),
                        "unexpected frame type while serving, closing connection"
                    );
                    return Ok(());
                }
                Err(e) => {
                    warn!(error = %e, "undecodable frame while serving, closing connection");
                    return Ok(());
                }
            }
        }
    }

    async fn advertise<W>(&self, writer: &mut W, pending: &HashSet<FileId>) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        for file_id in pending {
            let header = self.files[file_id].header.clone();
            write_frame(writer, &WireMessage::FileHeader(header).into_frame())
                .await
                .context("writing advertisement")?;
        }
        Ok(())
    }

    /// Answer one block request. An unknown file id is reported to the
    /// peer; a local read error is logged and the request dropped, which
    /// the receiver recovers from on its next sweep.
    async fn answer<W>(&self, req: &BlockRequest, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let Some(served) = self.files.get(&req.file_id) else {
            warn!(file_id = %req.file_id, "request for unknown file");
            let err = WireMessage::TransferError(TransferError {
                file_id: req.file_id,
                reason: "resource not found".into(),
            });
            return write_frame(writer, &err.into_frame())
                .await
                .context("writing error frame");
        };

        match read_range(&served.path, req.start, req.length).await {
            Ok(data) => {
                debug!(
                    file_id = %req.file_id,
                    start = req.start,
                    len = data.len(),
                    "serving block"
                );
                let resp = WireMessage::BlockResponse(BlockResponse {
                    file_id: req.file_id,
                    start: req.start,
                    data,
                });
                write_frame(writer, &resp.into_frame())
                    .await
                    .context("writing block response")
            }
            Err(e) => {
                warn!(
                    file_id = %req.file_id,
                    start = req.start,
                    error = %e,
                    "block read failed, request dropped"
                );
                Ok(())
            }
        }
    }
}

/// Read up to `length` bytes at `start`, clipping at end of file. A start
/// past the end yields an empty buffer.
async fn read_range(path: &Path, start: u64, length: u64) -> std::io::Result<Vec<u8>> {
    let mut file = File::open(path).await?;
    file.seek(SeekFrom::Start(start)).await?;
    let mut data = Vec::with_capacity(length.min(BLOCK_SIZE) as usize);
    file.take(length).read_to_end(&mut data).await?;
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::frame::read_frame;
    use crate::core::message::TextMessage;

    async fn sender_with_file(dir: &Path, content: &[u8]) -> (BlockSender, FileId) {
        let path = dir.join("payload.bin");
        tokio::fs::write(&path, content).await.unwrap();
        let mut sender = BlockSender::new();
        let id = sender.append_file(&path).await.unwrap();
        (sender, id)
    }

    async fn read_message(reader: &mut (impl AsyncRead + Unpin)) -> WireMessage {
        WireMessage::from_frame(read_frame(reader).await.unwrap()).unwrap()
    }

    async fn write_message(writer: &mut (impl AsyncWrite + Unpin), msg: WireMessage) {
        write_frame(writer, &msg.into_frame()).await.unwrap();
    }

    #[tokio::test]
    async fn test_append_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        tokio::fs::write(&path, b"same content").await.unwrap();

        let mut sender = BlockSender::new();
        let a = sender.append_file(&path).await.unwrap();
        let b = sender.append_file(&path).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(sender.files.len(), 1);
    }

    #[tokio::test]
    async fn test_serves_blocks_and_clips_at_eof() {
        let dir = tempfile::tempdir().unwrap();
        let content: Vec<u8> = (0..1000u32).map(|i| (i % 256) as u8).collect();
        let (sender, id) = sender_with_file(dir.path(), &content).await;

        let (theirs, ours) = tokio::io::duplex(64 * 1024);
        let serve = tokio::spawn(async move { sender.serve(theirs).await });
        let (mut reader, mut writer) = tokio::io::split(ours);

        // Advertisement comes first.
        let WireMessage::FileHeader(header) = read_message(&mut reader).await else {
            panic!("expected header");
        };
        assert_eq!(header.file_id, id);
        assert_eq!(header.file_size, 1000);
        assert_eq!(header.file_name, "payload.bin");

        // Whole-range request.
        write_message(
            &mut writer,
            WireMessage::BlockRequest(BlockRequest {
                file_id: id,
                start: 0,
                length: 400,
            }),
        )
        .await;
        let WireMessage::BlockResponse(resp) = read_message(&mut reader).await else {
            panic!("expected response");
        };
        assert_eq!(resp.start, 0);
        assert_eq!(resp.data, &content[..400]);

        // Request overlapping end of file is clipped short.
        write_message(
            &mut writer,
            WireMessage::BlockRequest(BlockRequest {
                file_id: id,
                start: 900,
                length: 400,
            }),
        )
        .await;
        let WireMessage::BlockResponse(resp) = read_message(&mut reader).await else {
            panic!("expected response");
        };
        assert_eq!(resp.start, 900);
        assert_eq!(resp.data, &content[900..]);

        // Acknowledge: serve loop ends cleanly.
        write_message(&mut writer, WireMessage::FileHeader(header)).await;
        serve.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unknown_file_id_reported_to_peer() {
        let dir = tempfile::tempdir().unwrap();
        let (sender, _id) = sender_with_file(dir.path(), b"data").await;

        let (theirs, ours) = tokio::io::duplex(64 * 1024);
        let _serve = tokio::spawn(async move { sender.serve(theirs).await });
        let (mut reader, mut writer) = tokio::io::split(ours);

        let _advert = read_message(&mut reader).await;

        let bogus = FileId::from_bytes([9u8; 16]);
        write_message(
            &mut writer,
            WireMessage::BlockRequest(BlockRequest {
                file_id: bogus,
                start: 0,
                length: 16,
            }),
        )
        .await;

        let WireMessage::TransferError(err) = read_message(&mut reader).await else {
            panic!("expected transfer error");
        };
        assert_eq!(err.file_id, bogus);
    }

    #[tokio::test]
    async fn test_unexpected_frame_type_closes_connection() {
        let dir = tempfile::tempdir().unwrap();
        let (sender, _id) = sender_with_file(dir.path(), b"data").await;

        let (theirs, ours) = tokio::io::duplex(64 * 1024);
        let serve = tokio::spawn(async move { sender.serve(theirs).await });
        let (mut reader, mut writer) = tokio::io::split(ours);

        let _advert = read_message(&mut reader).await;
        write_message(
            &mut writer,
            WireMessage::Text(TextMessage {
                info: "".into(),
                content: "not a request".into(),
            }),
        )
        .await;

        serve.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_rebroadcasts_headers_while_idle() {
        let dir = tempfile::tempdir().unwrap();
        let (sender, id) = sender_with_file(dir.path(), b"data").await;

        let (theirs, ours) = tokio::io::duplex(64 * 1024);
        let _serve = tokio::spawn(async move { sender.serve(theirs).await });
        let (mut reader, _writer) = tokio::io::split(ours);

        // Initial advertisement plus at least two idle re-broadcasts; the
        // paused clock advances through the 3-second timer automatically.
        for _ in 0..3 {
            let WireMessage::FileHeader(h) = read_message(&mut reader).await else {
                panic!("expected header");
            };
            assert_eq!(h.file_id, id);
        }
    }
}
