//! Receiver master: one worker per file id in flight.
//!
//! The master is the frame handler for FILE_HEADER and BLOCK_RESPONSE.
//! A header for an unknown file id spawns and registers a worker
//! (re-broadcast headers are idempotent); responses are routed to the
//! owning worker's channel. Each worker reports completion over a
//! single-shot channel carrying its file id, at which point the master
//! unregisters it. The completion signal handed back to the dispatcher
//! fires when the number of live workers returns to zero, which is what
//! lets a receiving client terminate once everything offered to it has
//! been transferred.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::core::dispatch::{completed, completion, Completion, ConnectionHandle, FrameHandler};
use crate::core::message::{BlockResponse, FileHeader, FileId, WireMessage};
use crate::core::worker::{TransferWorker, TransferVerdict};

/// Queued responses per worker; beyond this the response is dropped and
/// the worker re-requests on its next sweep.
const RESPONSE_QUEUE: usize = 8;

#[derive(Default)]
struct MasterState {
    workers: HashMap<FileId, mpsc::Sender<BlockResponse>>,
    waiters: Vec<oneshot::Sender<()>>,
}

pub struct ReceiverMaster {
    out_dir: PathBuf,
    window: usize,
    state: Arc<Mutex<MasterState>>,
}

impl ReceiverMaster {
    pub fn new(out_dir: PathBuf, window: usize) -> Self {
        Self {
            out_dir,
            window,
            state: Arc::new(Mutex::new(MasterState::default())),
        }
    }

    /// A signal that fires once no workers are live. Fires immediately
    /// when none are.
    fn completion_when_idle(&self) -> Completion {
        let mut state = self.state.lock().unwrap();
        if state.workers.is_empty() {
            return completed();
        }
        let (tx, rx) = completion();
        state.waiters.push(tx);
        rx
    }

    fn spawn_worker(&self, header: FileHeader, conn: &ConnectionHandle) {
        let file_id = header.file_id;
        let mut state = self.state.lock().unwrap();
        if state.workers.contains_key(&file_id) {
            debug!(file_id = %file_id, "file already being received, header ignored");
            return;
        }

        let worker = match TransferWorker::new(header, &self.out_dir, self.window) {
            Ok(worker) => worker,
            Err(e) => {
                warn!(file_id = %file_id, "rejecting transfer: {e:#}");
                return;
            }
        };

        let (resp_tx, resp_rx) = mpsc::channel(RESPONSE_QUEUE.max(self.window * 2));
        state.workers.insert(file_id, resp_tx);
        drop(state);

        let (done_tx, done_rx) = oneshot::channel::<FileId>();
        let conn = conn.clone();
        tokio::spawn(async move {
            match worker.run(conn, resp_rx).await {
                Ok(TransferVerdict::Ok) => {}
                Ok(TransferVerdict::Broken) => {
                    warn!(file_id = %file_id, "transfer finished broken");
                }
                Err(e) => {
                    warn!(file_id = %file_id, "transfer worker failed: {e:#}");
                }
            }
            let _ = done_tx.send(file_id);
        });

        let registry = self.state.clone();
        tokio::spawn(async move {
            // The send side is dropped without firing only if the worker
            // task panicked; unregister either way.
            let _ = done_rx.await;
            let mut state = registry.lock().unwrap();
            state.workers.remove(&file_id);
            info!(file_id = %file_id, live = state.workers.len(), "worker finished");
            if state.workers.is_empty() {
                for waiter in state.waiters.drain(..) {
                    let _ = waiter.send(());
                }
            }
        });
    }

    fn route_response(&self, resp: BlockResponse) {
        let tx = {
            let state = self.state.lock().unwrap();
            state.workers.get(&resp.file_id).cloned()
        };
        let Some(tx) = tx else {
            warn!(file_id = %resp.file_id, "response for an unknown file, dropping");
            return;
        };
        match tx.try_send(resp) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(resp)) => {
                warn!(
                    file_id = %resp.file_id,
                    "worker response queue full, dropping block (it will be re-requested)"
                );
            }
            Err(mpsc::error::TrySendError::Closed(resp)) => {
                debug!(file_id = %resp.file_id, "worker already finished, response dropped");
            }
        }
    }
}

impl FrameHandler for ReceiverMaster {
    fn handle(&self, msg: WireMessage, conn: &ConnectionHandle) -> Completion {
        match msg {
            WireMessage::FileHeader(header) => {
                self.spawn_worker(header, conn);
                self.completion_when_idle()
            }
            WireMessage::BlockResponse(resp) => {
                self.route_response(resp);
                completed()
            }
            WireMessage::TransferError(e) => {
                warn!(file_id = %e.file_id, reason = %e.reason, "sender reported an error");
                completed()
            }
            other => {
                warn!(
                    frame_type = other.frame_type(),
                    "receiver master got an unexpected frame type, dropping"
                );
                completed()
            }
        }
    }
}
