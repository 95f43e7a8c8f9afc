use meisai_core::{
    ImportProgress, ImportSession, ImportSource, MeisaiError, RecordId, RowError, RowErrorKind,
    RowOutcome, SessionId, StatementFields, StatementRecord, StatementRepository, StreamError,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::chunk::{Chunk, ChunkReassembler, MismatchPolicy};
use crate::csv;
use crate::hash::fingerprint;
use crate::index::{Classification, HashIndex};
use crate::registry::SessionRegistry;

/// Pause between lookups while another import holds a claim on the same
/// fingerprint.
const CLAIM_WAIT: Duration = Duration::from_millis(5);
const CLAIM_WAIT_ATTEMPTS: u32 = 40;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineOptions {
    /// Rows between progress snapshots within a chunk.
    pub progress_interval: u64,
    /// Capacity of the per-session progress queue.
    pub progress_buffer: usize,
    /// Capacity of the per-session chunk queue.
    pub chunk_buffer: usize,
    /// A finished import whose error rate exceeds this fails instead of
    /// completing.
    pub max_error_rate: f64,
    pub mismatch_policy: MismatchPolicy,
    /// Overwrite the stored record when a row changed at the same natural
    /// key. Only meaningful with change detection on the index.
    pub update_existing: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        PipelineOptions {
            progress_interval: 100,
            progress_buffer: 64,
            chunk_buffer: 16,
            max_error_rate: 1.0,
            mismatch_policy: MismatchPolicy::Reject,
            update_existing: false,
        }
    }
}

/// A whole statement file delivered at once.
#[derive(Debug, Clone, Deserialize)]
pub struct FileImportRequest {
    #[serde(flatten)]
    pub source: ImportSource,
    pub file_content: String,
}

/// Caller side of a streamed import.
///
/// Chunks go in through `chunks`; snapshots come out of `progress`. The
/// worker waits while `progress` is full, until the caller reads, drops the
/// receiver or cancels the session. `join` yields the terminal session.
pub struct StreamHandle {
    pub session_id: SessionId,
    pub chunks: mpsc::Sender<Chunk>,
    pub progress: mpsc::Receiver<ImportProgress>,
    pub join: JoinHandle<ImportSession>,
}

/// What happened to one data row.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum RowDecision {
    Added(RecordId),
    Updated(RecordId),
    Duplicate,
    Failed(RowError),
}

impl RowDecision {
    fn outcome(&self) -> RowOutcome {
        match self {
            RowDecision::Added(_) | RowDecision::Updated(_) => RowOutcome::Success,
            RowDecision::Duplicate => RowOutcome::Duplicate,
            RowDecision::Failed(_) => RowOutcome::Error,
        }
    }
}

struct Worker {
    session: ImportSession,
    reassembler: ChunkReassembler,
    /// Rows seen so far, header included.
    line: u64,
    header_seen: bool,
    since_progress: u64,
    progress: Option<mpsc::Sender<ImportProgress>>,
    cancel: watch::Receiver<bool>,
}

impl Worker {
    fn new(
        session: ImportSession,
        policy: MismatchPolicy,
        progress: Option<mpsc::Sender<ImportProgress>>,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        let reassembler = ChunkReassembler::new(session.session_id, policy);
        Worker {
            session,
            reassembler,
            line: 0,
            header_seen: false,
            since_progress: 0,
            progress,
            cancel,
        }
    }
}

/// Drives rows through parse, fingerprint, index and storage, keeping the
/// session counters and progress queue current.
#[derive(Clone)]
pub struct IngestPipeline {
    index: Arc<HashIndex>,
    store: Arc<dyn StatementRepository>,
    registry: SessionRegistry,
    options: PipelineOptions,
}

impl IngestPipeline {
    pub fn new(
        index: Arc<HashIndex>,
        store: Arc<dyn StatementRepository>,
        registry: SessionRegistry,
        options: PipelineOptions,
    ) -> Self {
        IngestPipeline {
            index,
            store,
            registry,
            options,
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn index(&self) -> &Arc<HashIndex> {
        &self.index
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// Imports a complete file. Rows are counted up front so the session
    /// carries a confirmed total while it runs. Always returns the terminal
    /// session, failed or not.
    pub async fn import_file(&self, request: FileImportRequest) -> ImportSession {
        let session = ImportSession::new(request.source);
        let session_id = session.session_id;
        let cancel = self.registry.register(session.clone()).await;
        tracing::info!(
            session_id = %session_id,
            file_name = %session.file_name,
            bytes = request.file_content.len(),
            "file import started"
        );

        let mut worker = Worker::new(session, self.options.mismatch_policy, None, cancel.clone());
        let chunk = Chunk {
            session_id,
            chunk_number: 0,
            data: request.file_content.into_bytes(),
            is_last: true,
        };
        let outcome = self.run_file(&mut worker, chunk, &cancel).await;
        self.finish(worker, outcome).await
    }

    async fn run_file(
        &self,
        worker: &mut Worker,
        chunk: Chunk,
        cancel: &watch::Receiver<bool>,
    ) -> Result<(), MeisaiError> {
        let rows = worker.reassembler.push(chunk)?.unwrap_or_default();
        worker.session.start()?;
        let non_blank = rows.iter().filter(|r| !is_blank(r)).count() as u64;
        worker.session.confirm_total(non_blank.saturating_sub(1))?;
        self.registry.publish(&worker.session).await;
        self.process_rows(worker, rows, cancel).await
    }

    /// Opens a streamed import and spawns its worker task.
    pub async fn start_stream(&self, source: ImportSource, estimated_rows: Option<u64>) -> StreamHandle {
        let mut session = ImportSession::new(source);
        session.estimated_rows = estimated_rows;
        let session_id = session.session_id;
        let cancel = self.registry.register(session.clone()).await;

        let (chunk_tx, chunk_rx) = mpsc::channel(self.options.chunk_buffer.max(1));
        let (progress_tx, progress_rx) = mpsc::channel(self.options.progress_buffer.max(1));
        let pipeline = self.clone();
        let join = tokio::spawn(async move {
            pipeline
                .run_stream(session, chunk_rx, progress_tx, cancel)
                .await
        });
        tracing::info!(session_id = %session_id, ?estimated_rows, "stream import opened");

        StreamHandle {
            session_id,
            chunks: chunk_tx,
            progress: progress_rx,
            join,
        }
    }

    async fn run_stream(
        self,
        session: ImportSession,
        mut chunks: mpsc::Receiver<Chunk>,
        progress: mpsc::Sender<ImportProgress>,
        mut cancel: watch::Receiver<bool>,
    ) -> ImportSession {
        let mut worker = Worker::new(
            session,
            self.options.mismatch_policy,
            Some(progress),
            cancel.clone(),
        );
        let outcome: Result<(), MeisaiError> = loop {
            let chunk = tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => break Err(StreamError::Cancelled.into()),
                next = chunks.recv() => match next {
                    Some(chunk) => chunk,
                    None => break Err(StreamError::Aborted.into()),
                },
            };
            match self.feed(&mut worker, chunk, &cancel).await {
                Ok(true) => break Ok(()),
                Ok(false) => {}
                Err(e) => break Err(e),
            }
        };
        self.finish(worker, outcome).await
    }

    /// Returns `true` once the final chunk has been processed.
    async fn feed(
        &self,
        worker: &mut Worker,
        chunk: Chunk,
        cancel: &watch::Receiver<bool>,
    ) -> Result<bool, MeisaiError> {
        let chunk_number = chunk.chunk_number;
        let is_last = chunk.is_last;
        let Some(rows) = worker.reassembler.push(chunk)? else {
            return Ok(false);
        };
        worker.session.start()?;
        self.process_rows(worker, rows, cancel).await?;
        tracing::debug!(
            session_id = %worker.session.session_id,
            chunk_number,
            processed = worker.session.processed_rows,
            "chunk processed"
        );
        if is_last {
            return Ok(true);
        }
        self.emit_progress(worker).await;
        Ok(false)
    }

    async fn process_rows(
        &self,
        worker: &mut Worker,
        rows: Vec<Vec<u8>>,
        cancel: &watch::Receiver<bool>,
    ) -> Result<(), MeisaiError> {
        for row in rows {
            if *cancel.borrow() {
                return Err(StreamError::Cancelled.into());
            }
            if is_blank(&row) {
                continue;
            }
            worker.line += 1;
            if !worker.header_seen {
                worker.header_seen = true;
                csv::check_header(&row)?;
                continue;
            }

            let decision = self.apply_row(&row, worker.line, self.options.update_existing).await;
            if let RowDecision::Failed(err) = &decision {
                tracing::debug!(session_id = %worker.session.session_id, error = %err, "row rejected");
            }
            worker.session.record(decision.outcome())?;

            worker.since_progress += 1;
            if worker.since_progress >= self.options.progress_interval.max(1) {
                self.emit_progress(worker).await;
            }
        }
        Ok(())
    }

    /// Parses, classifies and stores one data row.
    pub(crate) async fn apply_row(&self, row: &[u8], line: u64, update_existing: bool) -> RowDecision {
        let fields = match csv::parse_row(row, line) {
            Ok(fields) => fields,
            Err(e) => return RowDecision::Failed(e),
        };
        let hash = fingerprint(&fields);
        match self.claim(&hash, &fields).await {
            Classification::Duplicate { record_id: Some(_) } => RowDecision::Duplicate,
            Classification::Duplicate { record_id: None } => {
                RowDecision::Failed(RowError::new(line, RowErrorKind::InFlight))
            }
            Classification::New => {
                let record = StatementRecord::new(fields, hash.clone());
                match self.store_new(&record).await {
                    Ok(id) => {
                        self.index.commit(&hash, id);
                        RowDecision::Added(id)
                    }
                    Err(e) => match self.stored_id(&hash).await {
                        // Stored earlier but missing from the index, e.g. after a clear.
                        Some(id) => {
                            self.index.commit(&hash, id);
                            tracing::debug!(record_id = %id, "row already stored; index repaired");
                            RowDecision::Duplicate
                        }
                        None => {
                            self.index.release(&hash);
                            RowDecision::Failed(RowError::new(line, RowErrorKind::Storage(e.to_string())))
                        }
                    },
                }
            }
            Classification::Changed {
                previous_record_id: Some(id),
                changed_fields,
                ..
            } if update_existing => match self.store_update(id, fields, &hash).await {
                Ok(()) => {
                    self.index.commit(&hash, id);
                    tracing::info!(record_id = %id, ?changed_fields, "record updated in place");
                    RowDecision::Updated(id)
                }
                Err(e) => {
                    self.index.release(&hash);
                    RowDecision::Failed(RowError::new(line, RowErrorKind::Storage(e.to_string())))
                }
            },
            Classification::Changed {
                previous_record_id, ..
            } => {
                self.index.release(&hash);
                let kind = match previous_record_id {
                    Some(id) => RowErrorKind::Conflict(id),
                    None => RowErrorKind::InFlight,
                };
                RowDecision::Failed(RowError::new(line, kind))
            }
        }
    }

    /// Classifies and claims `hash`. While another import holds an
    /// uncommitted claim on it, waits for that claim to settle; a claim still
    /// pending after the wait comes back unchanged.
    async fn claim(&self, hash: &str, fields: &StatementFields) -> Classification {
        let mut attempts = 0;
        loop {
            let decision = self.index.classify(hash, fields);
            let pending = matches!(decision, Classification::Duplicate { record_id: None });
            if !pending || attempts == CLAIM_WAIT_ATTEMPTS {
                return decision;
            }
            attempts += 1;
            tokio::time::sleep(CLAIM_WAIT).await;
        }
    }

    async fn stored_id(&self, hash: &str) -> Option<RecordId> {
        match self.store.get_by_hash(hash).await {
            Ok(found) => found.and_then(|r| r.id),
            Err(e) => {
                tracing::warn!(error = %e, "hash lookup after failed insert");
                None
            }
        }
    }

    async fn store_new(&self, record: &StatementRecord) -> Result<RecordId, MeisaiError> {
        self.store
            .create_record(record)
            .await?
            .id
            .ok_or_else(|| MeisaiError::storage("store returned a record without an id"))
    }

    async fn store_update(&self, id: RecordId, fields: StatementFields, hash: &str) -> Result<(), MeisaiError> {
        let existing = self
            .store
            .get_record(id)
            .await?
            .ok_or(MeisaiError::RecordNotFound(id))?;
        let updated = StatementRecord {
            id: Some(id),
            fields,
            content_hash: hash.to_string(),
            external_reference_number: existing.external_reference_number,
        };
        self.store.update_record(&updated).await
    }

    /// Publishes the session and queues a snapshot. A full queue is waited
    /// on until the session is cancelled, after which snapshots are dropped.
    async fn emit_progress(&self, worker: &mut Worker) {
        worker.since_progress = 0;
        self.registry.publish(&worker.session).await;
        let Some(tx) = worker.progress.clone() else {
            return;
        };
        let delivered = match tx.try_send(worker.session.progress()) {
            Ok(()) => true,
            Err(TrySendError::Closed(_)) => false,
            Err(TrySendError::Full(snapshot)) => tokio::select! {
                sent = tx.send(snapshot) => sent.is_ok(),
                _ = cancelled(&mut worker.cancel) => false,
            },
        };
        if !delivered {
            tracing::debug!(
                session_id = %worker.session.session_id,
                cancelled = *worker.cancel.borrow(),
                "progress delivery stopped"
            );
            worker.progress = None;
        }
    }

    async fn finish(&self, mut worker: Worker, outcome: Result<(), MeisaiError>) -> ImportSession {
        let session_id = worker.session.session_id;
        let result = outcome.and_then(|()| self.settle(&mut worker.session));
        match result {
            Ok(()) => tracing::info!(
                session_id = %session_id,
                processed = worker.session.processed_rows,
                success = worker.session.success_rows,
                duplicates = worker.session.duplicate_rows,
                errors = worker.session.error_rows,
                "import completed"
            ),
            Err(e) => {
                worker.reassembler.discard();
                tracing::warn!(
                    session_id = %session_id,
                    processed = worker.session.processed_rows,
                    error = %e,
                    "import failed"
                );
                if !worker.session.is_terminal() {
                    // Only errors on a terminal session, excluded above.
                    worker.session.fail(e.to_string()).ok();
                }
            }
        }
        self.emit_progress(&mut worker).await;
        worker.session
    }

    fn settle(&self, session: &mut ImportSession) -> Result<(), MeisaiError> {
        let rate = session.error_rate();
        if rate > self.options.max_error_rate {
            return Err(StreamError::ErrorRateExceeded {
                rate,
                max: self.options.max_error_rate,
            }
            .into());
        }
        session.confirm_total(session.processed_rows)?;
        session.complete()
    }
}

fn is_blank(row: &[u8]) -> bool {
    row.iter().all(u8::is_ascii_whitespace)
}

/// Resolves once the cancel flag is set. A closed sender never cancels.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        let flag = *rx.borrow_and_update();
        if flag {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
