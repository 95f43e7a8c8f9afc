use meisai_core::{
    ImportSession, MappingRepository, MeisaiError, Result, SessionId, StatementRepository,
};
use meisai_import::{
    Chunk, HashIndex, HashIndexAdmin, IngestPipeline, LinkingService, MatchEngine, SessionRegistry,
    StreamHandle,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::config::Settings;

/// The sending half of a streamed import that is still accepting chunks.
struct OpenStream {
    chunks: mpsc::Sender<Chunk>,
    join: JoinHandle<ImportSession>,
}

#[derive(Clone)]
pub struct AppState {
    pub pipeline: IngestPipeline,
    pub admin: HashIndexAdmin,
    pub linking: Arc<LinkingService>,
    pub records: Arc<dyn StatementRepository>,
    streams: Arc<Mutex<HashMap<SessionId, OpenStream>>>,
}

impl AppState {
    /// Wires the ingestion and linking services over one store, warming the
    /// hash index from it when configured to.
    pub async fn build<S>(settings: &Settings, store: Arc<S>) -> Result<AppState>
    where
        S: StatementRepository + MappingRepository + 'static,
    {
        let index = Arc::new(HashIndex::with_change_detection(settings.import.detect_changes));
        if settings.hash_index.warm_start {
            let stored = store.list_records().await?;
            index.warm(&stored);
        }

        let records: Arc<dyn StatementRepository> = store.clone();
        let mappings: Arc<dyn MappingRepository> = store;
        let pipeline = IngestPipeline::new(
            index,
            records.clone(),
            SessionRegistry::with_retention(settings.import.retained_sessions),
            settings.import.pipeline.clone(),
        );
        let linking = LinkingService::new(
            mappings,
            records.clone(),
            MatchEngine::new(settings.matching.engine.clone()),
            settings.matching.auto_confirm_threshold,
        );

        Ok(AppState {
            admin: HashIndexAdmin::new(pipeline.clone()),
            pipeline,
            linking: Arc::new(linking),
            records,
            streams: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Keeps the chunk sender of a new stream so later requests can feed it.
    /// Progress snapshots are drained into the log; clients poll the session.
    pub async fn open_stream(&self, handle: StreamHandle) -> SessionId {
        let StreamHandle {
            session_id,
            chunks,
            mut progress,
            join,
        } = handle;

        tokio::spawn(async move {
            while let Some(p) = progress.recv().await {
                tracing::debug!(
                    session_id = %p.session_id,
                    processed = p.processed_rows,
                    total = p.total_rows,
                    percent = p.progress_percentage,
                    "import progress"
                );
            }
        });

        self.streams
            .lock()
            .await
            .insert(session_id, OpenStream { chunks, join });
        session_id
    }

    pub async fn chunk_sender(&self, id: SessionId) -> Option<mpsc::Sender<Chunk>> {
        self.streams.lock().await.get(&id).map(|s| s.chunks.clone())
    }

    /// Stops accepting chunks for `id` and waits for the worker to settle
    /// the session.
    pub async fn finish_stream(&self, id: SessionId) -> Result<ImportSession> {
        let open = self.streams.lock().await.remove(&id);
        match open {
            Some(OpenStream { chunks, join }) => {
                drop(chunks);
                join.await.map_err(MeisaiError::storage)
            }
            None => self.pipeline.registry().get(id).await,
        }
    }

    /// Forgets the stream without waiting; the worker observes the cancel
    /// flag on its own.
    pub async fn drop_stream(&self, id: SessionId) {
        self.streams.lock().await.remove(&id);
    }
}
