//! Transfer worker: drive one file to completion.
//!
//! A worker owns exactly one transfer. Its life is a straight line
//! through the phases below; the interesting machinery is the REQUESTING
//! phase, which pipelines block requests against a semaphore window while
//! responses stream back through the master.
//!
//! - RESUMING: create or reopen the staging directory and trust whatever
//!   correctly-named, correctly-sized `{i}.block` files it already holds.
//! - REQUESTING: sweep the missing blocks in ascending order, one request
//!   per free window slot; a saved block releases its slot. Every request
//!   for a block counts against a bounded attempt budget; running out
//!   ends the transfer as broken with the staging directory kept, so a
//!   later run can resume instead of starting over.
//! - MERGING: append all blocks into block 0, rename it into place,
//!   remove the staging directory. I/O failures here are fatal.
//! - VERIFYING: stream the merged artifact through MD5 and compare with
//!   the file id. A mismatch leaves the artifact for inspection.
//!
//! After verification the worker echoes the FILE_HEADER back, which is
//! what releases the sender's serve loop for this file.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::core::block::{
    block_count, block_file_name, block_len, parse_block_file_name, stage_dir, BlockBitmap,
    BLOCK_SIZE, MAX_BLOCK_ATTEMPTS,
};
use crate::core::dispatch::ConnectionHandle;
use crate::core::message::{BlockRequest, BlockResponse, FileHeader, WireMessage};
use crate::utils::hash;

/// How long to wait for any response while requests are outstanding
/// before the whole window is requeued.
const STALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifecycle phases, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerPhase {
    Init,
    Resuming,
    Requesting,
    Merging,
    Verifying,
    Done,
}

/// Terminal outcome of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferVerdict {
    /// Artifact merged and its MD5 matches the file id.
    Ok,
    /// The transfer ended without a verified artifact: either the merged
    /// file failed verification, or the block budget ran out.
    Broken,
}

pub struct TransferWorker {
    header: FileHeader,
    num_blocks: u64,
    stage_dir: PathBuf,
    out_path: PathBuf,
    window: usize,
    saved: BlockBitmap,
    phase: WorkerPhase,
}

impl TransferWorker {
    /// Build a worker from an advertised header. Fails if the advertised
    /// file name is not a plain name (path traversal).
    pub fn new(header: FileHeader, out_dir: &Path, window: usize) -> Result<Self> {
        let file_name = sanitize_file_name(&header.file_name)?;
        let out_path = out_dir.join(file_name);
        let stage_dir = stage_dir(out_dir, &header.file_id);
        let num_blocks = block_count(header.file_size);
        Ok(Self {
            num_blocks,
            stage_dir,
            out_path,
            window: window.max(1),
            saved: BlockBitmap::new(num_blocks),
            phase: WorkerPhase::Init,
            header,
        })
    }

    fn enter(&mut self, phase: WorkerPhase) {
        debug!(file_id = %self.header.file_id, from = ?self.phase, to = ?phase, "worker phase");
        self.phase = phase;
    }

    /// Run the transfer to its terminal state. `responses` is fed by the
    /// receiver master, which routes BLOCK_RESPONSE frames by file id.
    pub async fn run(
        mut self,
        conn: ConnectionHandle,
        responses: mpsc::Receiver<BlockResponse>,
    ) -> Result<TransferVerdict> {
        info!(
            file_id = %self.header.file_id,
            file = %self.header.file_name,
            size = self.header.file_size,
            blocks = self.num_blocks,
            "transfer started"
        );

        self.enter(WorkerPhase::Resuming);
        self.resume().await?;

        self.enter(WorkerPhase::Requesting);
        if !self.request_missing(&conn, responses).await? {
            warn!(
                file_id = %self.header.file_id,
                "giving up on transfer; staged blocks are kept for a later resume"
            );
            self.enter(WorkerPhase::Done);
            return Ok(TransferVerdict::Broken);
        }

        self.enter(WorkerPhase::Merging);
        self.merge().await?;

        self.enter(WorkerPhase::Verifying);
        let verdict = self.verify().await?;

        // Header echo: tells the sender this exchange is over, verified or
        // not. Stray re-broadcasts still in flight are absorbed by the
        // session reader for as long as the connection lives.
        conn.send(WireMessage::FileHeader(self.header.clone()))
            .await
            .context("sending acknowledgement")?;

        self.enter(WorkerPhase::Done);
        Ok(verdict)
    }

    // ── Resumption ───────────────────────────────────────────────────────────

    /// Create the staging directory if needed, otherwise rebuild the
    /// saved-block bitmap from its contents.
    async fn resume(&mut self) -> Result<()> {
        match fs::metadata(&self.stage_dir).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => bail!(
                "staging path {} exists and is not a directory; remove it first",
                self.stage_dir.display()
            ),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                fs::create_dir_all(&self.stage_dir)
                    .await
                    .with_context(|| format!("creating {}", self.stage_dir.display()))?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    fs::set_permissions(&self.stage_dir, std::fs::Permissions::from_mode(0o755))
                        .await?;
                }
            }
            Err(e) => {
                return Err(e).with_context(|| format!("probing {}", self.stage_dir.display()))
            }
        }

        let mut entries = fs::read_dir(&self.stage_dir)
            .await
            .with_context(|| format!("scanning {}", self.stage_dir.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(index) = name.to_str().and_then(parse_block_file_name) else {
                debug!(name = ?name, "ignoring non-block file in staging directory");
                continue;
            };
            if index >= self.num_blocks {
                warn!(
                    block = index,
                    blocks = self.num_blocks,
                    "staged block outside the file range, ignoring"
                );
                continue;
            }
            let size = entry.metadata().await?.len();
            let expected = block_len(index, self.header.file_size);
            if size != expected {
                warn!(
                    block = index,
                    size,
                    expected,
                    "staged block has the wrong size, will re-download"
                );
                continue;
            }
            self.saved.set(index);
        }

        if self.saved.saved_count() > 0 {
            info!(
                file_id = %self.header.file_id,
                saved = self.saved.saved_count(),
                blocks = self.num_blocks,
                "resuming from staged blocks"
            );
        }
        Ok(())
    }

    // ── Request pipeline ─────────────────────────────────────────────────────

    /// Pull every missing block. Returns `true` once all blocks are
    /// staged, `false` when a block exhausted its attempt budget.
    async fn request_missing(
        &mut self,
        conn: &ConnectionHandle,
        mut responses: mpsc::Receiver<BlockResponse>,
    ) -> Result<bool> {
        let window = Arc::new(Semaphore::new(self.window));
        let mut in_flight: HashMap<u64, OwnedSemaphorePermit> = HashMap::new();
        let mut attempts: HashMap<u64, u32> = HashMap::new();
        let mut queue: VecDeque<u64> = VecDeque::new();

        loop {
            if self.saved.is_complete() {
                debug!(file_id = %self.header.file_id, "all blocks saved");
                return Ok(true);
            }
            if queue.is_empty() && in_flight.is_empty() {
                // New sweep over everything still missing, ascending.
                queue.extend(self.saved.missing());
            }

            tokio::select! {
                permit = window.clone().acquire_owned(), if !queue.is_empty() => {
                    let Ok(permit) = permit else {
                        bail!("request window closed");
                    };
                    let Some(index) = queue.pop_front() else {
                        continue;
                    };
                    if self.saved.is_set(index) {
                        // A duplicate response filled it while queued.
                        continue;
                    }

                    let tries = attempts.entry(index).or_insert(0);
                    *tries += 1;
                    if *tries > MAX_BLOCK_ATTEMPTS {
                        warn!(
                            block = index,
                            attempts = MAX_BLOCK_ATTEMPTS,
                            "block exhausted its attempts"
                        );
                        return Ok(false);
                    }

                    conn.send(WireMessage::BlockRequest(BlockRequest {
                        file_id: self.header.file_id,
                        start: index * BLOCK_SIZE,
                        length: BLOCK_SIZE,
                    }))
                    .await
                    .context("sending block request")?;
                    debug!(block = index, attempt = *tries, "block requested");
                    in_flight.insert(index, permit);
                }
                resp = responses.recv() => {
                    let Some(resp) = resp else {
                        bail!("response channel closed mid-transfer");
                    };
                    self.accept_response(resp, &mut in_flight).await;
                }
                _ = tokio::time::sleep(STALL_TIMEOUT), if !in_flight.is_empty() => {
                    warn!(
                        outstanding = in_flight.len(),
                        "no response for {}s, requeueing outstanding blocks",
                        STALL_TIMEOUT.as_secs()
                    );
                    for (index, permit) in in_flight.drain() {
                        drop(permit);
                        queue.push_back(index);
                    }
                }
            }
        }
    }

    /// Stage one response. Saving marks the block and frees its window
    /// slot; failures leave the block unsaved for the next sweep.
    async fn accept_response(
        &mut self,
        resp: BlockResponse,
        in_flight: &mut HashMap<u64, OwnedSemaphorePermit>,
    ) {
        if resp.file_id != self.header.file_id {
            warn!(
                got = %resp.file_id,
                own = %self.header.file_id,
                "response routed to the wrong worker, dropping"
            );
            return;
        }
        if resp.start % BLOCK_SIZE != 0 {
            warn!(start = resp.start, "misaligned block response, dropping");
            return;
        }
        let index = resp.start / BLOCK_SIZE;
        if index >= self.num_blocks {
            warn!(block = index, blocks = self.num_blocks, "response outside the file, dropping");
            return;
        }

        let expected = block_len(index, self.header.file_size);
        if resp.data.len() as u64 != expected {
            warn!(
                block = index,
                got = resp.data.len(),
                expected,
                "block response has the wrong length, dropping"
            );
        } else {
            let duplicate = self.saved.is_set(index);
            match self.save_block(index, &resp.data).await {
                Ok(()) => {
                    self.saved.set(index);
                    if duplicate {
                        debug!(block = index, "duplicate block rewritten");
                    } else {
                        debug!(
                            block = index,
                            saved = self.saved.saved_count(),
                            blocks = self.num_blocks,
                            "block saved"
                        );
                    }
                }
                Err(e) => {
                    warn!(block = index, error = %e, "failed to save block, will retry");
                }
            }
        }

        if in_flight.remove(&index).is_none() {
            debug!(block = index, "response without a matching outstanding request");
        }
    }

    async fn save_block(&self, index: u64, data: &[u8]) -> io::Result<()> {
        let path = self.stage_dir.join(block_file_name(index));
        let mut opts = OpenOptions::new();
        opts.write(true).create(true).truncate(true);
        #[cfg(unix)]
        opts.mode(0o666);
        let mut file = opts.open(&path).await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(())
    }

    // ── Merge & verify ───────────────────────────────────────────────────────

    /// Concatenate the staged blocks into the final artifact, ascending,
    /// then drop the staging directory. An empty file has no blocks and
    /// its artifact is created directly.
    async fn merge(&self) -> Result<()> {
        if self.num_blocks == 0 {
            fs::write(&self.out_path, b"")
                .await
                .with_context(|| format!("creating {}", self.out_path.display()))?;
            fs::remove_dir_all(&self.stage_dir)
                .await
                .context("removing staging directory")?;
            return Ok(());
        }

        let first = self.stage_dir.join(block_file_name(0));
        let mut merged = OpenOptions::new()
            .append(true)
            .open(&first)
            .await
            .with_context(|| format!("opening {}", first.display()))?;

        for index in 1..self.num_blocks {
            let path = self.stage_dir.join(block_file_name(index));
            let mut part = File::open(&path)
                .await
                .with_context(|| format!("opening {}", path.display()))?;
            tokio::io::copy(&mut part, &mut merged)
                .await
                .with_context(|| format!("appending block {index}"))?;
            drop(part);
            fs::remove_file(&path)
                .await
                .with_context(|| format!("removing merged block {index}"))?;
        }

        merged.flush().await?;
        drop(merged);

        fs::rename(&first, &self.out_path)
            .await
            .with_context(|| format!("renaming artifact to {}", self.out_path.display()))?;
        fs::remove_dir_all(&self.stage_dir)
            .await
            .context("removing staging directory")?;

        info!(
            file = %self.header.file_name,
            blocks = self.num_blocks,
            "blocks merged"
        );
        Ok(())
    }

    /// Stream the artifact through MD5 and compare with the file id. A
    /// broken artifact is left on disk for the user to inspect.
    async fn verify(&self) -> Result<TransferVerdict> {
        let (digest, _) = hash::digest_file(&self.out_path)
            .await
            .context("hashing merged artifact")?;

        if digest == self.header.file_id {
            info!(file = %self.header.file_name, "transfer complete and verified");
            Ok(TransferVerdict::Ok)
        } else {
            warn!(
                file = %self.header.file_name,
                expected = %self.header.file_id,
                actual = %digest,
                "artifact failed verification; remove the file and try again"
            );
            Ok(TransferVerdict::Broken)
        }
    }
}

/// Accept only plain file names from the wire: anything with a path
/// separator or a dot-dot component could escape the output directory.
pub(crate) fn sanitize_file_name(name: &str) -> Result<&str> {
    if name.is_empty() {
        bail!("empty file name in header");
    }
    if name.contains('/') || name.contains('\\') {
        bail!("file name {name:?} contains a path separator");
    }
    if name == "." || name == ".." {
        bail!("file name {name:?} is not a plain name");
    }
    Ok(name)
}
