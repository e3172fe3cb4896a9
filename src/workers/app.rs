//! Role wiring: build the protocol actors for the chosen CLI role and
//! drive connections until the work is done or the stop signal fires.
//!
//! Four roles fall out of `send`/`recv` crossed with listen/dial:
//! - send + listen: perform the send action once per accepted connection,
//!   indefinitely (a serving sender keeps offering its payload)
//! - send + dial: connect, perform the action once, exit
//! - recv + listen: accept connections and serve each session until the
//!   peer hangs up
//! - recv + dial: connect and run the session until the first dispatched
//!   frame reports completion, then exit

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpStream;
use tracing::warn;

use crate::core::dispatch::Dispatcher;
use crate::core::message::{
    TYPE_BLOCK_RESPONSE, TYPE_FILE_HEADER, TYPE_SIMPLE_FILE, TYPE_TEXT, TYPE_TRANSFER_ERROR,
};
use crate::core::receiver::ReceiverMaster;
use crate::core::sender::BlockSender;
use crate::core::simple::{self, SimpleFileHandler, TextHandler};
use crate::net::{self, Endpoint};
use crate::utils::sos::SignalOfStop;
use crate::workers::args::{Cli, Command, FileConfig, RecvArgs, SendArgs};

pub async fn run(cli: Cli, sos: SignalOfStop) -> Result<()> {
    match cli.command {
        Command::Send(args) => run_send(args, sos).await,
        Command::Recv(args) => run_recv(args, sos).await,
    }
}

// ── Send role ────────────────────────────────────────────────────────────────

#[derive(Clone)]
enum SendAction {
    Text { info: String, content: String },
    File(std::path::PathBuf),
    Blocks(Arc<BlockSender>),
}

async fn run_send(args: SendArgs, sos: SignalOfStop) -> Result<()> {
    let action = if let Some(content) = args.message {
        SendAction::Text {
            info: args.info,
            content,
        }
    } else if let Some(path) = args.file {
        SendAction::File(path)
    } else if let Some(path) = args.bigfile {
        let mut sender = BlockSender::new();
        sender.append_file(&path).await?;
        SendAction::Blocks(Arc::new(sender))
    } else {
        // clap's payload group guarantees one of the three was given
        unreachable!("payload group enforces a send action");
    };

    match args.endpoint.endpoint() {
        Endpoint::Connect(addr) => {
            let stream = net::dial(&addr).await?;
            perform(action, stream).await
        }
        Endpoint::Listen(addr) => {
            net::listen(&addr, sos, |stream, peer| {
                let action = action.clone();
                tokio::spawn(async move {
                    if let Err(e) = perform(action, stream).await {
                        warn!(peer = %peer, "send failed: {e:#}");
                    }
                });
            })
            .await
        }
    }
}

async fn perform(action: SendAction, mut stream: TcpStream) -> Result<()> {
    match action {
        SendAction::Text { info, content } => simple::send_text(&mut stream, &info, &content).await,
        SendAction::File(path) => simple::send_simple_file(&mut stream, &path).await,
        SendAction::Blocks(sender) => sender.serve(stream).await,
    }
}

// ── Receive role ─────────────────────────────────────────────────────────────

/// The full receive-side handler registry: the block-transfer master for
/// types 4, 6 and 7, plus the one-shot text and simple-file handlers.
pub fn receive_dispatcher(out_dir: std::path::PathBuf, window: usize) -> Arc<Dispatcher> {
    let master = Arc::new(ReceiverMaster::new(out_dir.clone(), window));

    let mut dispatcher = Dispatcher::new();
    dispatcher.register(TYPE_FILE_HEADER, master.clone());
    dispatcher.register(TYPE_BLOCK_RESPONSE, master.clone());
    dispatcher.register(TYPE_TRANSFER_ERROR, master);
    dispatcher.register(TYPE_TEXT, Arc::new(TextHandler));
    dispatcher.register(TYPE_SIMPLE_FILE, Arc::new(SimpleFileHandler::new(out_dir)));
    Arc::new(dispatcher)
}

async fn run_recv(args: RecvArgs, sos: SignalOfStop) -> Result<()> {
    let cfg = args.resolve(FileConfig::discover());
    tokio::fs::create_dir_all(&cfg.out_dir)
        .await
        .with_context(|| format!("creating output directory {}", cfg.out_dir.display()))?;

    let dispatcher = receive_dispatcher(cfg.out_dir, cfg.window);

    match args.endpoint.endpoint() {
        Endpoint::Connect(addr) => {
            let stream = net::dial(&addr).await?;
            net::run_session(stream, dispatcher, true).await
        }
        Endpoint::Listen(addr) => {
            net::listen(&addr, sos, move |stream, peer| {
                let dispatcher = dispatcher.clone();
                tokio::spawn(async move {
                    if let Err(e) = net::run_session(stream, dispatcher, false).await {
                        warn!(peer = %peer, "session failed: {e:#}");
                    }
                });
            })
            .await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use md5::{Digest, Md5};
    use std::path::Path;

    use crate::core::block::{block_file_name, stage_dir, BLOCK_SIZE};
    use crate::core::message::FileId;

    fn digest_bytes(content: &[u8]) -> FileId {
        let mut hasher = Md5::new();
        hasher.update(content);
        FileId::from_bytes(hasher.finalize().into())
    }

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 256) as u8).collect()
    }

    /// Wire a block sender to a full receive stack over an in-memory
    /// stream and drive the transfer to completion.
    async fn transfer(content: &[u8], name: &str, out_dir: &Path, window: usize) {
        let src = tempfile::tempdir().unwrap();
        let path = src.path().join(name);
        tokio::fs::write(&path, content).await.unwrap();

        let mut sender = BlockSender::new();
        sender.append_file(&path).await.unwrap();

        let (send_side, recv_side) = tokio::io::duplex(256 * 1024);
        let serve = tokio::spawn(async move { sender.serve(send_side).await });

        let dispatcher = receive_dispatcher(out_dir.to_path_buf(), window);
        net::run_session(recv_side, dispatcher, true).await.unwrap();
        serve.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_transfer_empty_file() {
        let out = tempfile::tempdir().unwrap();
        transfer(b"", "empty.bin", out.path(), 1).await;

        let artifact = tokio::fs::read(out.path().join("empty.bin")).await.unwrap();
        assert!(artifact.is_empty());
    }

    #[tokio::test]
    async fn test_transfer_exactly_one_block() {
        let out = tempfile::tempdir().unwrap();
        let content = vec![0xAB; BLOCK_SIZE as usize];
        transfer(&content, "one.bin", out.path(), 1).await;

        let artifact = tokio::fs::read(out.path().join("one.bin")).await.unwrap();
        assert_eq!(artifact, content);
    }

    #[tokio::test]
    async fn test_transfer_one_and_a_half_blocks() {
        let out = tempfile::tempdir().unwrap();
        let content = patterned(3 * BLOCK_SIZE as usize / 2);
        transfer(&content, "onehalf.bin", out.path(), 1).await;

        let artifact = tokio::fs::read(out.path().join("onehalf.bin")).await.unwrap();
        assert_eq!(artifact, content);
        assert!(!stage_dir(out.path(), &digest_bytes(&content)).exists());
    }

    #[tokio::test]
    async fn test_transfer_with_wider_window() {
        let out = tempfile::tempdir().unwrap();
        let content = patterned(3 * BLOCK_SIZE as usize);
        transfer(&content, "wide.bin", out.path(), 4).await;

        let artifact = tokio::fs::read(out.path().join("wide.bin")).await.unwrap();
        assert_eq!(artifact, content);
    }

    #[tokio::test]
    async fn test_transfer_resumes_from_staged_block() {
        let out = tempfile::tempdir().unwrap();
        let content = patterned(3 * BLOCK_SIZE as usize);
        let id = digest_bytes(&content);

        // A previous run already staged the middle block.
        let stage = stage_dir(out.path(), &id);
        tokio::fs::create_dir_all(&stage).await.unwrap();
        tokio::fs::write(
            stage.join(block_file_name(1)),
            &content[BLOCK_SIZE as usize..2 * BLOCK_SIZE as usize],
        )
        .await
        .unwrap();

        transfer(&content, "resume.bin", out.path(), 1).await;

        let artifact = tokio::fs::read(out.path().join("resume.bin")).await.unwrap();
        assert_eq!(artifact, content);
        assert!(!stage.exists());
    }

    #[tokio::test]
    async fn test_transfer_detects_tampered_block() {
        let out = tempfile::tempdir().unwrap();
        let content = patterned(2 * BLOCK_SIZE as usize);
        let id = digest_bytes(&content);

        // Garbage of the correct size squats on block 0: nothing gets
        // re-downloaded, so the merge completes and verification fails.
        let stage = stage_dir(out.path(), &id);
        tokio::fs::create_dir_all(&stage).await.unwrap();
        tokio::fs::write(stage.join(block_file_name(0)), vec![0xEE; BLOCK_SIZE as usize])
            .await
            .unwrap();
        tokio::fs::write(
            stage.join(block_file_name(1)),
            &content[BLOCK_SIZE as usize..],
        )
        .await
        .unwrap();

        transfer(&content, "tampered.bin", out.path(), 1).await;

        // The broken artifact is left for the user; staging is gone.
        let artifact = tokio::fs::read(out.path().join("tampered.bin")).await.unwrap();
        assert_ne!(artifact, content);
        assert!(!stage.exists());
    }

    #[tokio::test]
    async fn test_recv_session_handles_text_and_small_file() {
        let out = tempfile::tempdir().unwrap();
        let dispatcher = receive_dispatcher(out.path().to_path_buf(), 1);

        let (mut send_side, recv_side) = tokio::io::duplex(64 * 1024);
        let session = tokio::spawn(net::run_session(recv_side, dispatcher, false));

        simple::send_text(&mut send_side, "bob", "short note").await.unwrap();

        let src = tempfile::tempdir().unwrap();
        let path = src.path().join("attached.txt");
        tokio::fs::write(&path, b"attachment body").await.unwrap();
        simple::send_simple_file(&mut send_side, &path).await.unwrap();

        drop(send_side);
        session.await.unwrap().unwrap();

        // The save runs on a spawned task; give it a moment to land.
        let saved_path = out.path().join("attached.txt");
        for _ in 0..100 {
            if saved_path.exists() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let saved = tokio::fs::read(&saved_path).await.unwrap();
        assert_eq!(saved, b"attachment body");
    }
}
