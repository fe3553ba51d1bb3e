use std::collections::HashMap;

use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, DefaultBodyLimit, Json, Path, Query, Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Router,
};
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    app_state::AppState,
    config::PublicUrlConfig,
    document,
    error::{ApiError, ApiResult},
    models::{FileRecord, GraphPayload, GraphView, ShareUpsert, COMPLETED_TTL_DAYS},
    processor::{ProcessSummary, StorageEvent},
    storage::PRESIGN_TTL,
};

/// Tamaño máximo de un cuerpo de petición (la subida va en base64).
pub const MAX_BODY_BYTES: usize = 50 * 1024 * 1024;

// --- Payloads y Respuestas de la API ---

#[derive(Deserialize)]
pub struct UploadPayload {
    file_content: Option<String>,
    file_name: Option<String>,
    content_type: Option<String>,
}

#[derive(Serialize)]
pub struct UploadResponse {
    file_id: String,
    original_filename: String,
    text_length: usize,
    message: String,
    process_url: String,
}

#[derive(Deserialize)]
pub struct PresignQuery {
    file_name: Option<String>,
    content_type: Option<String>,
}

#[derive(Serialize)]
pub struct PresignResponse {
    presigned_url: String,
    file_name: String,
    file_id: String,
}

#[derive(Deserialize)]
pub struct DirectUploadQuery {
    content_type: String,
    expires: i64,
    signature: String,
}

#[derive(Deserialize)]
pub struct TextPayload {
    text: Option<String>,
}

#[derive(Deserialize)]
pub struct SharePayload {
    file_id: Option<String>,
    graph_data: Option<serde_json::Value>,
}

#[derive(Serialize)]
pub struct ShareResponse {
    share_id: String,
    share_url: String,
    expires_at: i64,
}

// --- Router ---

pub fn create_router(app_state: AppState) -> Router {
    let protected = Router::new()
        .route("/upload", post(upload_handler))
        .route("/presigned-url", get(presigned_url_handler))
        .route("/direct-upload/*key", put(direct_upload_handler))
        .route("/events/storage", post(storage_events_handler))
        .route("/process_file/:file_id", post(process_file_handler))
        .route("/get_knowledge_graph", post(knowledge_graph_handler))
        .route("/share", post(share_handler))
        .route("/view-graph/:id", get(view_graph_handler))
        .route_layer(middleware::from_fn_with_state(app_state.clone(), require_api_key));

    Router::new()
        .route("/health", get(health_handler).options(health_preflight_handler))
        .merge(protected)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(app_state)
}

/// Con `API_KEY` configurada, exige la cabecera `X-Api-Key`.
async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if let Some(expected) = &state.config.api_key {
        let provided = request
            .headers()
            .get("x-api-key")
            .and_then(|v| v.to_str().ok());
        if provided != Some(expected.as_str()) {
            warn!("Petición rechazada sin API key válida: {}", request.uri().path());
            return Err(ApiError::Forbidden("Forbidden".to_string()));
        }
    }
    Ok(next.run(request).await)
}

fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> ApiResult<T> {
    payload
        .map(|Json(p)| p)
        .map_err(|e| ApiError::Validation(e.body_text()))
}

// --- Handlers ---

fn health_headers() -> [(header::HeaderName, HeaderValue); 3] {
    [
        (header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*")),
        (header::ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static("Content-Type, X-Api-Key")),
        (header::ACCESS_CONTROL_ALLOW_METHODS, HeaderValue::from_static("GET, OPTIONS")),
    ]
}

#[axum::debug_handler]
async fn health_handler() -> impl IntoResponse {
    (health_headers(), Json(json!({ "message": "healthy server" })))
}

#[axum::debug_handler]
async fn health_preflight_handler() -> impl IntoResponse {
    (StatusCode::OK, health_headers(), "")
}

#[axum::debug_handler]
async fn upload_handler(
    State(state): State<AppState>,
    payload: Result<Json<UploadPayload>, JsonRejection>,
) -> ApiResult<Json<UploadResponse>> {
    let payload = json_body(payload)?;
    let content = payload
        .file_content
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| ApiError::Validation("No file content provided".to_string()))?;
    let file_name = base_name(payload.file_name.as_deref().unwrap_or("uploaded_file.txt"));
    let content_type = payload.content_type.unwrap_or_else(|| "text/plain".to_string());

    let file_data = base64::engine::general_purpose::STANDARD
        .decode(content.trim())
        .map_err(|e| ApiError::Decode(format!("Invalid base64 file content: {e}")))?;

    let extracted_text = document::extract_text(file_data.clone(), &content_type, &file_name).await?;
    if extracted_text.trim().is_empty() {
        return Err(ApiError::Validation("No text could be extracted from file".to_string()));
    }

    let record = FileRecord {
        file_id: Uuid::new_v4().to_string(),
        original_filename: file_name,
        content_type,
        text_length: extracted_text.chars().count(),
    };
    let now = chrono::Utc::now().to_rfc3339();

    let original_key = record.original_key();
    state
        .storage
        .put_object(
            &original_key,
            file_data,
            &record.content_type,
            HashMap::from([
                ("file_id".to_string(), record.file_id.clone()),
                ("original_filename".to_string(), record.original_filename.clone()),
                ("upload_timestamp".to_string(), now.clone()),
            ]),
        )
        .await?;
    state
        .storage
        .put_object(
            &record.text_key(),
            extracted_text.into_bytes(),
            "text/plain",
            HashMap::from([
                ("file_id".to_string(), record.file_id.clone()),
                ("original_filename".to_string(), record.original_filename.clone()),
                ("text_length".to_string(), record.text_length.to_string()),
                ("extraction_timestamp".to_string(), now),
            ]),
        )
        .await?;
    state.emit_object_created(&original_key);

    info!("Fichero '{}' subido como {} ({} caracteres).", record.original_filename, record.file_id, record.text_length);
    Ok(Json(UploadResponse {
        process_url: format!("/process_file/{}", record.file_id),
        file_id: record.file_id,
        original_filename: record.original_filename,
        text_length: record.text_length,
        message: "File uploaded and text extracted successfully".to_string(),
    }))
}

#[axum::debug_handler]
async fn presigned_url_handler(
    State(state): State<AppState>,
    Query(params): Query<PresignQuery>,
) -> ApiResult<Json<PresignResponse>> {
    let file_id = Uuid::new_v4().to_string();
    let file_name = params
        .file_name
        .filter(|n| !n.is_empty())
        .map(|n| base_name(&n))
        .unwrap_or_else(|| format!("file-{}.txt", Uuid::new_v4()));
    let content_type = params
        .content_type
        .filter(|c| !c.is_empty())
        .unwrap_or_else(|| {
            mime_guess::from_path(&file_name)
                .first_or_octet_stream()
                .essence_str()
                .to_string()
        });

    let key = format!("uploads/{file_id}/{file_name}");
    let presigned_url = state.storage.presign_put(&key, &content_type, PRESIGN_TTL).await?;

    Ok(Json(PresignResponse {
        presigned_url,
        file_name,
        file_id,
    }))
}

#[axum::debug_handler]
async fn direct_upload_handler(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(params): Query<DirectUploadQuery>,
    body: Bytes,
) -> ApiResult<StatusCode> {
    if !state
        .storage
        .verify_direct_upload(&key, &params.content_type, params.expires, &params.signature)
    {
        return Err(ApiError::Forbidden("Invalid or expired upload signature".to_string()));
    }

    state
        .storage
        .put_object(&key, body.to_vec(), &params.content_type, HashMap::new())
        .await?;
    info!("Subida directa recibida: {key} ({} bytes)", body.len());
    state.emit_object_created(&key);
    Ok(StatusCode::OK)
}

#[axum::debug_handler]
async fn storage_events_handler(
    State(state): State<AppState>,
    payload: Result<Json<StorageEvent>, JsonRejection>,
) -> ApiResult<Json<ProcessSummary>> {
    let event = json_body(payload)?;
    Ok(Json(state.processor.process_event(event).await))
}

#[axum::debug_handler]
async fn process_file_handler(
    State(state): State<AppState>,
    Path(file_id): Path<String>,
) -> ApiResult<Json<GraphView>> {
    if file_id.is_empty() || file_id.contains(['/', '\\']) || file_id.contains("..") {
        return Err(ApiError::Validation(format!("Invalid file id: {file_id}")));
    }
    match state.processor.process_extracted_text(&file_id).await? {
        Some(entry) => Ok(Json(entry.into())),
        None => Err(ApiError::NotFound(format!("No extracted text found for file {file_id}"))),
    }
}

#[axum::debug_handler]
async fn knowledge_graph_handler(
    State(state): State<AppState>,
    payload: Result<Json<TextPayload>, JsonRejection>,
) -> ApiResult<Json<GraphPayload>> {
    let text = json_body(payload)?
        .text
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| ApiError::Validation("No text provided".to_string()))?;

    Ok(Json(state.extractor.extract(&text).await?))
}

#[axum::debug_handler]
async fn share_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<SharePayload>, JsonRejection>,
) -> ApiResult<Json<ShareResponse>> {
    let payload = json_body(payload)?;
    let missing = || ApiError::Validation("Missing file_id or graph_data".to_string());

    let file_id = payload.file_id.filter(|f| !f.is_empty()).ok_or_else(missing)?;
    let raw_graph = payload
        .graph_data
        .filter(|g| match g {
            serde_json::Value::Null => false,
            serde_json::Value::Object(map) => !map.is_empty(),
            serde_json::Value::Array(items) => !items.is_empty(),
            serde_json::Value::String(raw) => !raw.is_empty(),
            serde_json::Value::Bool(flag) => *flag,
            _ => true,
        })
        .ok_or_else(missing)?;
    let graph_data: GraphPayload = serde_json::from_value(raw_graph)
        .map_err(|e| ApiError::Validation(format!("Invalid graph_data: {e}")))?;

    let now = chrono::Utc::now().timestamp();
    let upsert = ShareUpsert {
        file_id,
        share_id: Uuid::new_v4().to_string(),
        graph_data,
        expires_at: now + COMPLETED_TTL_DAYS * 24 * 60 * 60,
    };
    let entry = state.cache.upsert_share(&upsert, now).await?;

    let host = headers.get(header::HOST).and_then(|h| h.to_str().ok());
    let share_url = share_url(&state.config.public_url, host, &entry.share_id);
    info!("Enlace compartido para {}: {}", entry.file_id, share_url);

    Ok(Json(ShareResponse {
        share_id: entry.share_id,
        share_url,
        expires_at: entry.expires_at,
    }))
}

#[axum::debug_handler]
async fn view_graph_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let now = chrono::Utc::now().timestamp();
    match state.cache.record_view(&id, now).await? {
        Some(entry) => Ok(Json(GraphView::from(entry)).into_response()),
        None => Ok((
            StatusCode::NOT_FOUND,
            Json(json!({
                "status": "Processing",
                "message": "Graph not found or being processed. Please try again in a few moments."
            })),
        )
            .into_response()),
    }
}

// --- Utilidades ---

/// Último componente de un nombre de fichero enviado por el cliente.
fn base_name(name: &str) -> String {
    name.rsplit(['/', '\\'])
        .find(|s| !s.is_empty() && *s != "..")
        .unwrap_or("uploaded_file.txt")
        .to_string()
}

/// URL pública del visor: API Gateway si hay `API_ID`, después
/// `PUBLIC_BASE_URL` y, en último caso, la cabecera `Host`.
pub fn share_url(cfg: &PublicUrlConfig, host: Option<&str>, share_id: &str) -> String {
    if let Some(api_id) = &cfg.api_id {
        return format!(
            "https://{api_id}.execute-api.{}.amazonaws.com/{}/view-graph/{share_id}",
            cfg.region, cfg.stage
        );
    }
    if let Some(base) = &cfg.base_url {
        return format!("{}/view-graph/{share_id}", base.trim_end_matches('/'));
    }
    format!("http://{}/view-graph/{share_id}", host.unwrap_or("localhost"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn share_url_prefers_api_gateway_then_base_then_host() {
        let mut cfg = PublicUrlConfig {
            api_id: Some("abc123".into()),
            region: "eu-west-1".into(),
            stage: "Prod".into(),
            base_url: Some("https://kg.example.com/".into()),
        };
        assert_eq!(
            share_url(&cfg, Some("h:1"), "s1"),
            "https://abc123.execute-api.eu-west-1.amazonaws.com/Prod/view-graph/s1"
        );
        cfg.api_id = None;
        assert_eq!(share_url(&cfg, Some("h:1"), "s1"), "https://kg.example.com/view-graph/s1");
        cfg.base_url = None;
        assert_eq!(share_url(&cfg, Some("h:1"), "s1"), "http://h:1/view-graph/s1");
    }

    #[test]
    fn base_name_strips_directories() {
        assert_eq!(base_name("../../etc/passwd"), "passwd");
        assert_eq!(base_name("C:\\docs\\report.pdf"), "report.pdf");
        assert_eq!(base_name("dir/.."), "dir");
        assert_eq!(base_name("plain.txt"), "plain.txt");
    }
}
