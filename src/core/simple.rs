//! One-shot transfers: text messages and small whole-file frames.
//!
//! Both types carry no protocol state: the sender writes a single frame
//! and is done, the receiver handles it and completes. Files that do not
//! comfortably fit in one frame belong to the block protocol instead.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::io::AsyncWrite;
use tracing::warn;

use crate::core::dispatch::{completed, completion, Completion, ConnectionHandle, FrameHandler};
use crate::core::frame::write_frame;
use crate::core::message::{SimpleFile, TextMessage, WireMessage};
use crate::core::worker::sanitize_file_name;

// ── Send side ────────────────────────────────────────────────────────────────

/// Write one TEXT frame.
pub async fn send_text<W>(writer: &mut W, info: &str, content: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let msg = WireMessage::Text(TextMessage {
        info: info.to_string(),
        content: content.to_string(),
    });
    write_frame(writer, &msg.into_frame())
        .await
        .context("sending message")
}

/// Read a file whole and write it as one SIMPLE_FILE frame.
pub async fn send_simple_file<W>(writer: &mut W, path: &Path) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let file_name = path
        .file_name()
        .context("path has no file name")?
        .to_string_lossy()
        .into_owned();
    let content = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;

    let msg = WireMessage::SimpleFile(SimpleFile { file_name, content });
    write_frame(writer, &msg.into_frame())
        .await
        .context("sending file")
}

// ── Receive side ─────────────────────────────────────────────────────────────

/// Prints received messages to stdout.
pub struct TextHandler;

impl FrameHandler for TextHandler {
    fn handle(&self, msg: WireMessage, _conn: &ConnectionHandle) -> Completion {
        match msg {
            WireMessage::Text(t) => {
                println!("[message] {}: {}", t.info, t.content);
            }
            other => warn!(
                frame_type = other.frame_type(),
                "text handler got an unexpected frame type"
            ),
        }
        completed()
    }
}

/// Writes received whole-file frames into the output directory.
pub struct SimpleFileHandler {
    out_dir: PathBuf,
}

impl SimpleFileHandler {
    pub fn new(out_dir: PathBuf) -> Self {
        Self { out_dir }
    }
}

impl FrameHandler for SimpleFileHandler {
    fn handle(&self, msg: WireMessage, _conn: &ConnectionHandle) -> Completion {
        let WireMessage::SimpleFile(file) = msg else {
            warn!("simple-file handler got an unexpected frame type");
            return completed();
        };

        let out_dir = self.out_dir.clone();
        let (tx, rx) = completion();
        tokio::spawn(async move {
            match save_file(&out_dir, &file).await {
                Ok(path) => {
                    println!("[file] {}: {} bytes saved", path.display(), file.content.len());
                }
                Err(e) => warn!(file = %file.file_name, "failed to save file: {e:#}"),
            }
            let _ = tx.send(());
        });
        rx
    }
}

async fn save_file(out_dir: &Path, file: &SimpleFile) -> Result<PathBuf> {
    let name = sanitize_file_name(&file.file_name)?;
    let path = out_dir.join(name);
    tokio::fs::write(&path, &file.content)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::frame::read_frame;
    use crate::core::message::TYPE_SIMPLE_FILE;
    use tokio::sync::mpsc;

    fn test_conn() -> (ConnectionHandle, mpsc::Receiver<crate::core::frame::Frame>) {
        let (tx, rx) = mpsc::channel(4);
        (ConnectionHandle::new(tx), rx)
    }

    #[tokio::test]
    async fn test_send_text_roundtrip() {
        let mut buf = Vec::new();
        send_text(&mut buf, "alice", "hello").await.unwrap();

        let mut reader = buf.as_slice();
        let frame = read_frame(&mut reader).await.unwrap();
        let WireMessage::Text(t) = WireMessage::from_frame(frame).unwrap() else {
            panic!("expected text");
        };
        assert_eq!(t.info, "alice");
        assert_eq!(t.content, "hello");
    }

    #[tokio::test]
    async fn test_send_simple_file_carries_name_and_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("small.txt");
        tokio::fs::write(&path, b"tiny payload").await.unwrap();

        let mut buf = Vec::new();
        send_simple_file(&mut buf, &path).await.unwrap();

        let mut reader = buf.as_slice();
        let frame = read_frame(&mut reader).await.unwrap();
        assert_eq!(frame.frame_type, TYPE_SIMPLE_FILE);
        let WireMessage::SimpleFile(f) = WireMessage::from_frame(frame).unwrap() else {
            panic!("expected simple file");
        };
        assert_eq!(f.file_name, "small.txt");
        assert_eq!(f.content, b"tiny payload");
    }

    #[tokio::test]
    async fn test_handler_saves_file() {
        let dir = tempfile::tempdir().unwrap();
        let handler = SimpleFileHandler::new(dir.path().to_path_buf());

        let msg = WireMessage::SimpleFile(SimpleFile {
            file_name: "note.txt".into(),
            content: b"saved".to_vec(),
        });
        let (conn, _rx) = test_conn();
        let completion = handler.handle(msg, &conn);
        let _ = completion.await;

        let saved = tokio::fs::read(dir.path().join("note.txt")).await.unwrap();
        assert_eq!(saved, b"saved");
    }

    #[tokio::test]
    async fn test_handler_rejects_traversal_names() {
        let dir = tempfile::tempdir().unwrap();
        let handler = SimpleFileHandler::new(dir.path().to_path_buf());

        let msg = WireMessage::SimpleFile(SimpleFile {
            file_name: "../escape".into(),
            content: b"nope".to_vec(),
        });
        let (conn, _rx) = test_conn();
        let completion = handler.handle(msg, &conn);
        let _ = completion.await;

        assert!(!dir.path().parent().unwrap().join("escape").exists());
        assert!(!dir.path().join("escape").exists());
    }
}
