//! Frame dispatcher: route inbound frames to the handler registered for
//! their type.
//!
//! The dispatcher is a pure demultiplexer. It owns no connection and
//! never reads from one; the session loop in `net` reads frames and feeds
//! them here. Each dispatch returns a [`Completion`] signal that fires
//! once the handler is finished with the frame; a receiving client uses
//! the first frame's signal to know when to terminate. Frames with no
//! registered handler (or an undecodable body) are logged and complete
//! immediately.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::core::frame::Frame;
use crate::core::message::WireMessage;

// ── Outbound side of a connection ────────────────────────────────────────────

/// Cloneable write access to a connection. Every outbound frame goes
/// through the connection's single writer task, which is what keeps
/// concurrent writers (workers, handlers) from interleaving frames.
#[derive(Clone)]
pub struct ConnectionHandle {
    outbound: mpsc::Sender<Frame>,
}

impl ConnectionHandle {
    pub fn new(outbound: mpsc::Sender<Frame>) -> Self {
        Self { outbound }
    }

    /// Queue a message for transmission. Fails once the writer task is
    /// gone, i.e. the connection is closed.
    pub async fn send(&self, msg: WireMessage) -> anyhow::Result<()> {
        self.outbound
            .send(msg.into_frame())
            .await
            .map_err(|_| anyhow::anyhow!("connection writer closed"))
    }
}

// ── Completion signalling ────────────────────────────────────────────────────

/// Single-shot notification that a handler has finished with a frame.
/// The sender side may be dropped without firing; awaiting callers treat
/// both outcomes as done.
pub type Completion = oneshot::Receiver<()>;

/// A fresh completion pair.
pub fn completion() -> (oneshot::Sender<()>, Completion) {
    oneshot::channel()
}

/// An already-fired completion signal.
pub fn completed() -> Completion {
    let (tx, rx) = oneshot::channel();
    let _ = tx.send(());
    rx
}

// ── Handler registry ─────────────────────────────────────────────────────────

/// Contract for per-type frame handlers. `handle` must not block: long
/// work is spawned and reported through the returned completion signal.
pub trait FrameHandler: Send + Sync {
    fn handle(&self, msg: WireMessage, conn: &ConnectionHandle) -> Completion;
}

/// The `type → handler` registry. Built once at startup and shared
/// read-only across sessions.
#[derive(Default)]
pub struct Dispatcher {
    handlers: HashMap<u16, Arc<dyn FrameHandler>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, frame_type: u16, handler: Arc<dyn FrameHandler>) {
        self.handlers.insert(frame_type, handler);
    }

    /// Route one frame. Unknown or undecodable frames are non-fatal.
    pub fn dispatch(&self, frame: Frame, conn: &ConnectionHandle) -> Completion {
        let Some(handler) = self.handlers.get(&frame.frame_type) else {
            warn!(
                frame_type = frame.frame_type,
                info_size = frame.info.len(),
                data_size = frame.data.len(),
                "no handler registered for frame type, dropping"
            );
            return completed();
        };

        match WireMessage::from_frame(frame) {
            Ok(msg) => handler.handle(msg, conn),
            Err(e) => {
                warn!(error = %e, "undecodable frame body, dropping");
                completed()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::core::message::{TextMessage, TYPE_TEXT};

    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl FrameHandler for Recorder {
        fn handle(&self, msg: WireMessage, _conn: &ConnectionHandle) -> Completion {
            if let WireMessage::Text(t) = msg {
                self.seen.lock().unwrap().push(t.content);
            }
            completed()
        }
    }

    fn test_conn() -> (ConnectionHandle, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(8);
        (ConnectionHandle::new(tx), rx)
    }

    #[tokio::test]
    async fn test_routes_to_registered_handler() {
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        let mut dispatcher = Dispatcher::new();
        dispatcher.register(TYPE_TEXT, recorder.clone());

        let (conn, _rx) = test_conn();
        let frame = WireMessage::Text(TextMessage {
            info: "".into(),
            content: "ping".into(),
        })
        .into_frame();

        dispatcher.dispatch(frame, &conn).await.unwrap();
        assert_eq!(*recorder.seen.lock().unwrap(), vec!["ping".to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_type_completes_immediately() {
        let dispatcher = Dispatcher::new();
        let (conn, _rx) = test_conn();
        let completion = dispatcher.dispatch(Frame::new(999, Vec::new(), Vec::new()), &conn);
        // Must resolve without anyone else driving it.
        let _ = completion.await;
    }

    #[tokio::test]
    async fn test_connection_handle_delivers_frames() {
        let (conn, mut rx) = test_conn();
        conn.send(WireMessage::Text(TextMessage {
            info: "i".into(),
            content: "c".into(),
        }))
        .await
        .unwrap();

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.frame_type, TYPE_TEXT);
    }
}
