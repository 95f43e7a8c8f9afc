use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use meisai_core::{
    ImportSource, ImportStatus, MappingFilter, MappingId, MappingUpdate, MeisaiError, NewMapping,
    RecordId, SessionId, StatementRecord,
};
use meisai_import::{
    is_fingerprint, Chunk, FileImportRequest, HashIndexEntry, ImportOptions, MatchCandidate, SessionFilter,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::PathBuf;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::error::ApiResult;
use crate::state::AppState;

pub fn router(state: AppState, max_upload_bytes: usize) -> Router {
    let imports = Router::new()
        .route("/", post(import_file).get(list_imports))
        .route("/stream", post(start_stream))
        .route("/{id}", get(get_import).delete(cancel_import))
        .route("/{id}/chunks", post(push_chunk));

    let hash_index = Router::new()
        .route("/", axum::routing::delete(clear_index))
        .route("/import", post(hash_import))
        .route("/stats", get(index_stats))
        .route("/check", post(check_hashes))
        .route("/{hash}", get(lookup_hash));

    let mappings = Router::new()
        .route("/", post(create_mapping).get(list_mappings))
        .route(
            "/{id}",
            get(get_mapping).patch(update_mapping).delete(delete_mapping),
        )
        .route("/{id}/confirm", post(confirm_mapping))
        .route("/{id}/deactivate", post(deactivate_mapping))
        .route("/{id}/reject", post(reject_mapping));

    let records = Router::new()
        .route("/match", post(match_batch))
        .route("/{id}", get(get_record))
        .route("/{id}/match", post(match_record))
        .route("/{id}/proposals", post(record_proposals));

    Router::new()
        .route("/health", get(health))
        .nest("/imports", imports)
        .nest("/hash-index", hash_index)
        .nest("/mappings", mappings)
        .nest("/records", records)
        .with_state(state)
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

// ── Imports ──────────────────────────────────────────────────────────────────

async fn import_file(
    State(state): State<AppState>,
    Json(request): Json<FileImportRequest>,
) -> impl IntoResponse {
    let session = state.pipeline.import_file(request).await;
    (StatusCode::CREATED, Json(session))
}

#[derive(Debug, Deserialize)]
struct StreamRequest {
    #[serde(flatten)]
    source: ImportSource,
    estimated_rows: Option<u64>,
}

async fn start_stream(
    State(state): State<AppState>,
    Json(request): Json<StreamRequest>,
) -> ApiResult<Response> {
    let handle = state
        .pipeline
        .start_stream(request.source, request.estimated_rows)
        .await;
    let id = state.open_stream(handle).await;
    let session = state.pipeline.registry().get(id).await?;
    Ok((StatusCode::CREATED, Json(session)).into_response())
}

#[derive(Debug, Deserialize)]
struct ChunkParams {
    chunk_number: u64,
    #[serde(default)]
    is_last: bool,
    /// Session the chunk claims to belong to, when it differs from the path.
    session_id: Option<SessionId>,
}

/// Feeds one chunk to a streamed import. The final chunk, or a chunk the
/// worker can no longer take, returns the settled session.
async fn push_chunk(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
    Query(params): Query<ChunkParams>,
    body: Bytes,
) -> ApiResult<Response> {
    let Some(sender) = state.chunk_sender(id).await else {
        let session = state.pipeline.registry().get(id).await?;
        return Err(MeisaiError::validation(format!(
            "import {id} is {} and no longer accepts chunks",
            session.status
        ))
        .into());
    };

    let chunk = Chunk {
        session_id: params.session_id.unwrap_or(id),
        chunk_number: params.chunk_number,
        data: body.to_vec(),
        is_last: params.is_last,
    };
    let delivered = sender.send(chunk).await.is_ok();
    drop(sender);

    if params.is_last || !delivered {
        let session = state.finish_stream(id).await?;
        return Ok((StatusCode::OK, Json(session)).into_response());
    }
    let session = state.pipeline.registry().get(id).await?;
    Ok((StatusCode::ACCEPTED, Json(session)).into_response())
}

async fn get_import(State(state): State<AppState>, Path(id): Path<SessionId>) -> ApiResult<Response> {
    let session = state.pipeline.registry().get(id).await?;
    Ok(Json(session).into_response())
}

async fn cancel_import(State(state): State<AppState>, Path(id): Path<SessionId>) -> ApiResult<Response> {
    let session = state.pipeline.registry().cancel(id).await?;
    state.drop_stream(id).await;
    Ok(Json(session).into_response())
}

#[derive(Debug, Default, Deserialize)]
struct ListParams {
    status: Option<ImportStatus>,
    account_type: Option<String>,
    account_id: Option<String>,
    page: Option<usize>,
    page_size: Option<usize>,
}

async fn list_imports(State(state): State<AppState>, Query(params): Query<ListParams>) -> impl IntoResponse {
    let filter = SessionFilter {
        status: params.status,
        account_type: params.account_type,
        account_id: params.account_id,
    };
    let page = state
        .pipeline
        .registry()
        .list(&filter, params.page.unwrap_or(1), params.page_size.unwrap_or(50))
        .await;
    Json(page)
}

// ── Hash index ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct HashImportRequest {
    csv_path: PathBuf,
    #[serde(default)]
    options: ImportOptions,
}

async fn hash_import(
    State(state): State<AppState>,
    Json(request): Json<HashImportRequest>,
) -> ApiResult<Response> {
    let report = state.admin.import(&request.csv_path, request.options).await?;
    Ok(Json(report).into_response())
}

async fn index_stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.admin.stats())
}

/// What the live index and the store each know about one content hash.
#[derive(Debug, Serialize)]
struct HashLookup {
    content_hash: String,
    indexed: Option<HashIndexEntry>,
    stored: Option<StatementRecord>,
}

async fn lookup_hash(State(state): State<AppState>, Path(hash): Path<String>) -> ApiResult<Response> {
    if !is_fingerprint(&hash) {
        return Err(MeisaiError::validation(format!("'{hash}' is not a content hash")).into());
    }
    let indexed = state.pipeline.index().get(&hash);
    let stored = state.records.get_by_hash(&hash).await?;
    Ok(Json(HashLookup {
        content_hash: hash,
        indexed,
        stored,
    })
    .into_response())
}

#[derive(Debug, Deserialize)]
struct CheckRequest {
    hashes: Vec<String>,
}

async fn check_hashes(
    State(state): State<AppState>,
    Json(request): Json<CheckRequest>,
) -> ApiResult<Response> {
    let found = state.records.check_duplicates_by_hash(&request.hashes).await?;
    Ok(Json(found).into_response())
}

async fn clear_index(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "cleared": state.admin.clear() }))
}

// ── Mappings ─────────────────────────────────────────────────────────────────

async fn create_mapping(
    State(state): State<AppState>,
    Json(mapping): Json<NewMapping>,
) -> ApiResult<Response> {
    let created = state.linking.create(mapping).await?;
    Ok((StatusCode::CREATED, Json(created)).into_response())
}

async fn list_mappings(
    State(state): State<AppState>,
    Query(filter): Query<MappingFilter>,
) -> ApiResult<Response> {
    Ok(Json(state.linking.list(&filter).await?).into_response())
}

async fn get_mapping(State(state): State<AppState>, Path(id): Path<MappingId>) -> ApiResult<Response> {
    Ok(Json(state.linking.get(id).await?).into_response())
}

async fn update_mapping(
    State(state): State<AppState>,
    Path(id): Path<MappingId>,
    Json(update): Json<MappingUpdate>,
) -> ApiResult<Response> {
    Ok(Json(state.linking.update(id, update).await?).into_response())
}

async fn delete_mapping(State(state): State<AppState>, Path(id): Path<MappingId>) -> ApiResult<Response> {
    state.linking.delete(id).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn confirm_mapping(State(state): State<AppState>, Path(id): Path<MappingId>) -> ApiResult<Response> {
    Ok(Json(state.linking.confirm(id).await?).into_response())
}

async fn deactivate_mapping(
    State(state): State<AppState>,
    Path(id): Path<MappingId>,
) -> ApiResult<Response> {
    Ok(Json(state.linking.deactivate(id).await?).into_response())
}

#[derive(Debug, Deserialize)]
struct RejectRequest {
    reason: String,
}

async fn reject_mapping(
    State(state): State<AppState>,
    Path(id): Path<MappingId>,
    Json(request): Json<RejectRequest>,
) -> ApiResult<Response> {
    Ok(Json(state.linking.reject(id, &request.reason).await?).into_response())
}

// ── Records and matching ─────────────────────────────────────────────────────

async fn get_record(State(state): State<AppState>, Path(id): Path<RecordId>) -> ApiResult<Response> {
    let record = state
        .records
        .get_record(id)
        .await?
        .ok_or(MeisaiError::RecordNotFound(id))?;
    Ok(Json(record).into_response())
}

#[derive(Debug, Deserialize)]
struct MatchRequest {
    candidates: Vec<MatchCandidate>,
}

async fn match_record(
    State(state): State<AppState>,
    Path(id): Path<RecordId>,
    Json(request): Json<MatchRequest>,
) -> ApiResult<Response> {
    let scored = state.linking.propose(id, &request.candidates).await?;
    Ok(Json(scored).into_response())
}

async fn record_proposals(
    State(state): State<AppState>,
    Path(id): Path<RecordId>,
    Json(request): Json<MatchRequest>,
) -> ApiResult<Response> {
    let outcome = state.linking.propose_and_record(id, &request.candidates).await?;
    Ok((StatusCode::CREATED, Json(outcome)).into_response())
}

#[derive(Debug, Deserialize)]
struct BatchMatchRequest {
    record_ids: Vec<RecordId>,
    candidates: Vec<MatchCandidate>,
}

async fn match_batch(
    State(state): State<AppState>,
    Json(request): Json<BatchMatchRequest>,
) -> ApiResult<Response> {
    for candidate in &request.candidates {
        candidate.validate()?;
    }
    let mut records = Vec::with_capacity(request.record_ids.len());
    for id in request.record_ids {
        let record = state
            .records
            .get_record(id)
            .await?
            .ok_or(MeisaiError::RecordNotFound(id))?;
        records.push(record);
    }
    let proposals = state.linking.engine().propose_batch(&records, &request.candidates);
    Ok(Json(proposals).into_response())
}
