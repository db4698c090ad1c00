//! Background anchoring of record digests.
//!
//! Record writes enqueue an [`AnchorJob`] and return immediately.  A single
//! worker drains the queue, retries transient ledger failures, writes the
//! outcome back into the record envelope and audits every attempt's result.
//! Jobs that exhaust their retries are appended to a JSON-lines dead-letter
//! outbox; [`AnchorQueue::replay_dead_letters`] feeds them back in, skipping
//! lines already replayed (tracked by id in a state file).

use crate::audit::{record_logged, AuditAction, AuditEntry, AuditOutcome, AuditSink};
use crate::canonical::ContentDigest;
use crate::envelope::AnchorStatus;
use crate::ledger::{AnchorError, AnchorReference, LedgerAnchor};
use crate::store::RecordStore;
use blake2::digest::{consts::U32, Digest};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

type Blake2b256 = blake2::Blake2b<U32>;

const REPLAY_STATE_SCHEMA: &str = "medledger.anchor-replay-state.v1";
/// Dead-letter reason for jobs refused by a full queue.
pub const QUEUE_FULL: &str = "anchor queue full";

/// Request to anchor one record version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorJob {
    /// Record id.
    pub record_id: String,
    /// Version whose digest is anchored.
    pub version: u32,
    /// Digest to anchor.
    pub digest: ContentDigest,
    /// Actor the outcome is audited under.
    pub actor: String,
    /// Enqueue time, unix milliseconds.
    pub enqueued_at_ms: u64,
}

impl AnchorJob {
    /// New job stamped now.
    pub fn new(
        record_id: impl Into<String>,
        version: u32,
        digest: ContentDigest,
        actor: impl Into<String>,
    ) -> Self {
        Self {
            record_id: record_id.into(),
            version,
            digest,
            actor: actor.into(),
            enqueued_at_ms: now_millis(),
        }
    }
}

/// A job that exhausted its retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// The failed job.
    pub job: AnchorJob,
    /// Last error.
    pub error: String,
    /// Failure time, unix milliseconds.
    pub failed_at_ms: u64,
}

/// Where [`AnchorQueue::enqueue`] put a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// Handed to the worker.
    Queued,
    /// The queue was full; the job went to the dead-letter outbox and nothing
    /// will anchor it until it is replayed.
    DeadLettered,
}

/// Queue failures.
#[derive(Debug, Error)]
pub enum AnchorQueueError {
    #[error("anchor queue is shut down")]
    /// The worker no longer accepts jobs.
    Closed,
    #[error("dead-letter outbox error: {0}")]
    /// The outbox or replay state could not be read or written.
    DeadLetter(String),
}

/// Queue tuning.
#[derive(Debug, Clone)]
pub struct AnchorQueueConfig {
    /// Channel capacity; overflow goes straight to the dead-letter outbox.
    pub capacity: usize,
    /// Attempts per job.  Each attempt already includes the ledger's own retries.
    pub job_attempts: u32,
    /// Base pause between job attempts.
    pub retry_delay: Duration,
    /// Dead-letter outbox; `None` keeps failures in the log only.
    pub dead_letter_path: Option<PathBuf>,
}

impl Default for AnchorQueueConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            job_attempts: 3,
            retry_delay: Duration::from_millis(500),
            dead_letter_path: None,
        }
    }
}

/// Counts returned by [`AnchorQueue::replay_dead_letters`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplaySummary {
    /// Jobs re-enqueued in this run.
    pub enqueued: usize,
    /// Lines skipped because they were replayed before.
    pub skipped: usize,
    /// Jobs that met a full queue and were written back to the outbox.
    pub deferred: usize,
    /// State file used for idempotency.
    pub state_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct ReplayState {
    schema: String,
    updated_at_ms: u64,
    processed_ids: Vec<String>,
}

struct Worker {
    ledger: Arc<LedgerAnchor>,
    store: Arc<dyn RecordStore>,
    audit: Arc<dyn AuditSink>,
    config: AnchorQueueConfig,
}

/// Handle to the anchoring worker.
pub struct AnchorQueue {
    sender: Mutex<Option<mpsc::Sender<AnchorJob>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    dead_letter_path: Option<PathBuf>,
}

impl std::fmt::Debug for AnchorQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnchorQueue")
            .field("dead_letter_path", &self.dead_letter_path)
            .finish()
    }
}

impl AnchorQueue {
    /// Spawns the worker on the current tokio runtime.
    pub fn spawn(
        ledger: Arc<LedgerAnchor>,
        store: Arc<dyn RecordStore>,
        audit: Arc<dyn AuditSink>,
        config: AnchorQueueConfig,
    ) -> Self {
        let (sender, mut receiver) = mpsc::channel::<AnchorJob>(config.capacity.max(1));
        let dead_letter_path = config.dead_letter_path.clone();
        let worker = Worker {
            ledger,
            store,
            audit,
            config,
        };
        let handle = tokio::spawn(async move {
            while let Some(job) = receiver.recv().await {
                worker.run(job).await;
            }
            debug!(evt = "ANCHOR_WORKER_STOP", "anchor worker drained");
        });
        Self {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(handle)),
            dead_letter_path,
        }
    }

    /// Enqueues without waiting.  A full queue dead-letters the job instead of
    /// blocking; the caller owns recording that outcome on the version.
    pub fn enqueue(&self, job: AnchorJob) -> Result<Enqueued, AnchorQueueError> {
        let sender = self
            .sender
            .lock()
            .ok()
            .and_then(|guard| guard.clone())
            .ok_or(AnchorQueueError::Closed)?;
        match sender.try_send(job) {
            Ok(()) => Ok(Enqueued::Queued),
            Err(mpsc::error::TrySendError::Full(job)) => {
                warn!(evt = "ANCHOR_QUEUE_FULL", record = %job.record_id, "anchor queue full, dead-lettering");
                match &self.dead_letter_path {
                    Some(path) => {
                        append_dead_letter(path, &job, QUEUE_FULL)?;
                        Ok(Enqueued::DeadLettered)
                    }
                    None => Err(AnchorQueueError::DeadLetter(
                        "anchor queue full and no dead-letter outbox configured".into(),
                    )),
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(AnchorQueueError::Closed),
        }
    }

    /// Stops accepting jobs and waits for queued ones to finish.
    pub async fn shutdown(&self) {
        let sender = self.sender.lock().ok().and_then(|mut guard| guard.take());
        drop(sender);
        let handle = self.worker.lock().ok().and_then(|mut guard| guard.take());
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                error!(evt = "ANCHOR_WORKER_PANIC", error = %err, "anchor worker ended abnormally");
            }
        }
    }

    /// Re-enqueues dead letters not replayed before.
    pub fn replay_dead_letters(
        &self,
        state_path: Option<&Path>,
    ) -> Result<ReplaySummary, AnchorQueueError> {
        let outbox_path = self
            .dead_letter_path
            .as_deref()
            .ok_or_else(|| AnchorQueueError::DeadLetter("no dead-letter outbox configured".into()))?;
        let state_path = state_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| outbox_path.with_file_name("anchor_replay_state.json"));

        let outbox = if outbox_path.exists() {
            fs::read_to_string(outbox_path).map_err(|err| {
                AnchorQueueError::DeadLetter(format!(
                    "failed to read outbox {}: {err}",
                    outbox_path.display()
                ))
            })?
        } else {
            String::new()
        };
        let mut state = load_replay_state(&state_path)?;
        let mut seen = state.processed_ids.iter().cloned().collect::<HashSet<_>>();

        let mut enqueued = 0usize;
        let mut skipped = 0usize;
        let mut deferred = 0usize;
        for raw in outbox.lines() {
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }
            let id = dead_letter_id(line);
            if seen.contains(&id) {
                skipped += 1;
                continue;
            }
            let letter: DeadLetter = serde_json::from_str(line).map_err(|err| {
                AnchorQueueError::DeadLetter(format!("invalid dead-letter record: {err}"))
            })?;
            let mut job = letter.job;
            job.enqueued_at_ms = now_millis();
            match self.enqueue(job)? {
                Enqueued::Queued => enqueued += 1,
                Enqueued::DeadLettered => deferred += 1,
            }
            seen.insert(id);
        }

        let mut processed_ids = seen.into_iter().collect::<Vec<_>>();
        processed_ids.sort();
        state.schema = REPLAY_STATE_SCHEMA.to_string();
        state.updated_at_ms = now_millis();
        state.processed_ids = processed_ids;
        save_replay_state(&state_path, &state)?;
        info!(evt = "ANCHOR_REPLAY", enqueued, skipped, deferred, state = %state_path.display(), "dead letters replayed");
        Ok(ReplaySummary {
            enqueued,
            skipped,
            deferred,
            state_path,
        })
    }
}

impl Worker {
    async fn run(&self, job: AnchorJob) {
        let attempts = self.config.job_attempts.max(1);
        let mut attempt = 1u32;
        loop {
            let result = self.ledger.anchor(&job.digest).await;
            let retry = matches!(result, Err(AnchorError::TransientFailure { .. })) && attempt < attempts;
            if retry {
                if let Err(err) = &result {
                    debug!(evt = "ANCHOR_JOB_RETRY", record = %job.record_id, attempt, error = %err, "anchor job will retry");
                }
                tokio::time::sleep(self.config.retry_delay.saturating_mul(attempt)).await;
                attempt += 1;
                continue;
            }
            apply_anchor_result(&*self.store, &*self.audit, &job, &result);
            if let Err(err) = &result {
                if dead_letters(err) {
                    if let Some(path) = &self.config.dead_letter_path {
                        if let Err(dl_err) = append_dead_letter(path, &job, &err.to_string()) {
                            error!(evt = "ANCHOR_DEAD_LETTER_FAILED", record = %job.record_id, error = %dl_err, "dead letter not written");
                        }
                    }
                }
            }
            return;
        }
    }
}

fn dead_letters(err: &AnchorError) -> bool {
    !matches!(err, AnchorError::Unavailable(_))
}

/// Writes an anchoring outcome into the envelope and the audit trail.
pub(crate) fn apply_anchor_result(
    store: &dyn RecordStore,
    audit: &dyn AuditSink,
    job: &AnchorJob,
    result: &Result<AnchorReference, AnchorError>,
) {
    let version = job.version;
    let update = match result {
        Ok(reference) => {
            let reference = reference.clone();
            store.update(&job.record_id, &mut |env| env.set_anchor(version, reference.clone()))
        }
        Err(err) => {
            let status = match err {
                AnchorError::Unavailable(_) => AnchorStatus::Unavailable,
                _ => AnchorStatus::Failed,
            };
            let message = err.to_string();
            store.update(&job.record_id, &mut |env| {
                env.set_anchor_status(version, status, Some(message.clone()))
            })
        }
    };

    match result {
        Ok(reference) => {
            info!(evt = "ANCHOR_JOB_DONE", record = %job.record_id, version, tx = %reference.transaction_id, "record version anchored");
        }
        Err(AnchorError::Unavailable(reason)) => {
            warn!(evt = "ANCHOR_DEGRADED", record = %job.record_id, version, %reason, "record stored without ledger anchor");
        }
        Err(err) => {
            warn!(evt = "ANCHOR_JOB_FAILED", record = %job.record_id, version, error = %err, "anchor job failed");
        }
    }
    let mut entry = anchor_audit_entry(&job.actor, &job.record_id, result)
        .detail("version", job.version)
        .detail("digest", job.digest.to_hex());
    if let Err(err) = &update {
        error!(evt = "ANCHOR_STATUS_WRITE_FAILED", record = %job.record_id, error = %err, "anchor outcome not stored");
        entry = entry.detail("storeError", err.to_string());
    }
    let _ = record_logged(audit, entry);
}

/// Anchor audit entry for `result`: `Success` with the transaction, `Degraded`
/// when the ledger is disabled, `Failure` otherwise.
pub(crate) fn anchor_audit_entry(
    actor: &str,
    resource: &str,
    result: &Result<AnchorReference, AnchorError>,
) -> AuditEntry {
    match result {
        Ok(reference) => AuditEntry::new(actor, AuditAction::Anchor, resource, AuditOutcome::Success)
            .detail("transactionId", reference.transaction_id.clone())
            .detail("blockNumber", reference.block_number)
            .detail("anchoredAt", reference.anchored_at),
        Err(AnchorError::Unavailable(reason)) => {
            AuditEntry::new(actor, AuditAction::Anchor, resource, AuditOutcome::Degraded)
                .detail("reason", reason.clone())
        }
        Err(err) => AuditEntry::new(actor, AuditAction::Anchor, resource, AuditOutcome::Failure)
            .detail("error", err.to_string()),
    }
}

fn append_dead_letter(path: &Path, job: &AnchorJob, error: &str) -> Result<(), AnchorQueueError> {
    let letter = DeadLetter {
        job: job.clone(),
        error: error.to_string(),
        failed_at_ms: now_millis(),
    };
    let mut line = serde_json::to_vec(&letter)
        .map_err(|err| AnchorQueueError::DeadLetter(format!("failed to encode dead letter: {err}")))?;
    line.push(b'\n');
    let io_err = |err: std::io::Error| {
        AnchorQueueError::DeadLetter(format!("failed to write {}: {err}", path.display()))
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(io_err)?;
    file.write_all(&line).map_err(io_err)?;
    file.sync_data().map_err(io_err)?;
    warn!(evt = "ANCHOR_DEAD_LETTER", record = %job.record_id, version = job.version, %error, "anchor job dead-lettered");
    Ok(())
}

/// Outbox lines already written, oldest first.
pub fn read_dead_letters(path: &Path) -> Result<Vec<DeadLetter>, AnchorQueueError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let text = fs::read_to_string(path).map_err(|err| {
        AnchorQueueError::DeadLetter(format!("failed to read outbox {}: {err}", path.display()))
    })?;
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str(line).map_err(|err| {
                AnchorQueueError::DeadLetter(format!("invalid dead-letter record: {err}"))
            })
        })
        .collect()
}

fn dead_letter_id(raw_line: &str) -> String {
    let mut hasher = Blake2b256::new();
    hasher.update(b"medledger-anchor-dead-letter-id-v1");
    hasher.update(raw_line.as_bytes());
    hex::encode(hasher.finalize())
}

fn load_replay_state(path: &Path) -> Result<ReplayState, AnchorQueueError> {
    if !path.exists() {
        return Ok(ReplayState {
            schema: REPLAY_STATE_SCHEMA.to_string(),
            updated_at_ms: now_millis(),
            processed_ids: Vec::new(),
        });
    }
    let bytes = fs::read(path).map_err(|err| {
        AnchorQueueError::DeadLetter(format!("failed to read replay state {}: {err}", path.display()))
    })?;
    serde_json::from_slice(&bytes).map_err(|err| {
        AnchorQueueError::DeadLetter(format!("invalid replay state {}: {err}", path.display()))
    })
}

fn save_replay_state(path: &Path, state: &ReplayState) -> Result<(), AnchorQueueError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|err| {
            AnchorQueueError::DeadLetter(format!("failed to create {}: {err}", parent.display()))
        })?;
    }
    let encoded = serde_json::to_vec_pretty(state)
        .map_err(|err| AnchorQueueError::DeadLetter(format!("failed to encode replay state: {err}")))?;
    fs::write(path, encoded).map_err(|err| {
        AnchorQueueError::DeadLetter(format!("failed to write replay state {}: {err}", path.display()))
    })
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
