//! Transport plumbing: TCP listen/dial and the per-connection session.
//!
//! A receive session splits the connection into:
//! - a reader loop (this task) that reads frames and hands them to the
//!   dispatcher, and
//! - one writer task draining a bounded frame queue. Every protocol actor
//!   that wants to transmit holds a [`ConnectionHandle`] feeding that
//!   queue, so writes on a connection are serialized by construction no
//!   matter how many workers share it.
//!
//! The protocol is transport-agnostic: everything here is generic over
//! `AsyncRead + AsyncWrite`, so a TLS stream composes at this seam.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::core::dispatch::{Completion, ConnectionHandle, Dispatcher};
use crate::core::frame::{read_frame_limited, write_frame, Frame};
use crate::utils::sos::SignalOfStop;

/// Session cap on a single frame body. Sized for the whole-file frame of
/// the simple-file path; block responses stay far below it.
pub const MAX_FRAME_BODY: u64 = 64 * 1024 * 1024;

/// Outbound frames queued per connection before senders wait.
const OUTBOUND_QUEUE: usize = 32;

/// Where to reach the peer: bind and wait, or dial out.
#[derive(Debug, Clone)]
pub enum Endpoint {
    Listen(String),
    Connect(String),
}

// ── Receive session ──────────────────────────────────────────────────────────

enum SessionEnd {
    /// The first dispatched frame reported completion (client mode).
    Completed,
    /// The peer closed the stream.
    PeerClosed,
    Failed(anyhow::Error),
}

/// Read frames and dispatch them until the stream ends. With
/// `until_first_completion`, the session also ends once the completion
/// signal of the first dispatched frame fires; that is how a receiving
/// client knows the exchange it came for is over.
pub async fn run_session<S>(
    stream: S,
    dispatcher: Arc<Dispatcher>,
    until_first_completion: bool,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);

    let (out_tx, mut out_rx) = mpsc::channel::<Frame>(OUTBOUND_QUEUE);
    let writer_task = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if let Err(e) = write_frame(&mut writer, &frame).await {
                warn!(error = %e, "connection write failed, discarding outbound frames");
                break;
            }
        }
    });

    let conn = ConnectionHandle::new(out_tx);
    let mut first: Option<Completion> = None;

    let end = loop {
        tokio::select! {
            _ = async { first.as_mut().expect("guarded").await }, if first.is_some() => {
                break SessionEnd::Completed;
            }
            read = read_frame_limited(&mut reader, MAX_FRAME_BODY) => {
                match read {
                    Ok(frame) => {
                        let completion = dispatcher.dispatch(frame, &conn);
                        if until_first_completion && first.is_none() {
                            first = Some(completion);
                        }
                    }
                    Err(e) if e.is_eof() => break SessionEnd::PeerClosed,
                    Err(e) => break SessionEnd::Failed(
                        anyhow::Error::from(e).context("reading frame"),
                    ),
                }
            }
        }
    };

    // Our own handle must go away for the writer to ever drain out.
    drop(conn);

    match end {
        SessionEnd::Completed => {
            // Let queued frames (the final header echo) flush. The writer
            // ends once every worker has dropped its handle.
            let _ = writer_task.await;
            debug!("session complete");
            Ok(())
        }
        SessionEnd::PeerClosed => {
            writer_task.abort();
            if let Some(mut completion) = first {
                // The peer may hang up right after the exchange finished;
                // only an unfinished exchange makes this an abort. Staging
                // state stays on disk, a later run resumes from it.
                if completion.try_recv().is_err() {
                    anyhow::bail!("connection closed mid-transfer");
                }
            }
            debug!("peer closed the connection");
            Ok(())
        }
        SessionEnd::Failed(e) => {
            writer_task.abort();
            Err(e)
        }
    }
}

// ── Listen / dial ────────────────────────────────────────────────────────────

/// Accept connections until cancelled, handing each to `accept`. The
/// callback must not block: it spawns whatever work the connection needs.
pub async fn listen<F>(addr: &str, sos: SignalOfStop, mut accept: F) -> Result<()>
where
    F: FnMut(TcpStream, SocketAddr),
{
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(addr = %listener.local_addr()?, "listening");

    loop {
        tokio::select! {
            _ = sos.wait() => {
                info!("listener shutting down");
                return Ok(());
            }
            conn = listener.accept() => match conn {
                Ok((stream, peer)) => {
                    info!(peer = %peer, "connection accepted");
                    accept(stream, peer);
                }
                Err(e) => warn!(error = %e, "accept failed"),
            }
        }
    }
}

/// Dial the peer.
pub async fn dial(addr: &str) -> Result<TcpStream> {
    let stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("connecting to {addr}"))?;
    info!(peer = %stream.peer_addr()?, "connected");
    Ok(stream)
}
