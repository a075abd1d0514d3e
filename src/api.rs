use std::path::Path as FsPath;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Multipart, Path, Query, State,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::io::StreamReader;

use crate::{
    config::{validate_room_config, RoomConfig},
    error::PanelError,
    logs,
    state::AppState,
};

#[derive(Serialize)]
struct ApiError {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
}

fn err_response(status: StatusCode, msg: impl Into<String>) -> Response {
    (
        status,
        Json(ApiError {
            error: msg.into(),
            code: None,
        }),
    )
        .into_response()
}

impl IntoResponse for PanelError {
    fn into_response(self) -> Response {
        let status = match &self {
            PanelError::AlreadyRunning
            | PanelError::NotRunning
            | PanelError::PortInUse { .. }
            | PanelError::RoomExists(_)
            | PanelError::InstanceBusy => StatusCode::CONFLICT,
            PanelError::IllegalPath(_) | PanelError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            PanelError::NotFound(_) | PanelError::UnknownRoom(_) => StatusCode::NOT_FOUND,
            PanelError::NotProvisioned(_) => StatusCode::PRECONDITION_FAILED,
            PanelError::SpawnFailed(_)
            | PanelError::StopFailed(_)
            | PanelError::BackupFailed(_)
            | PanelError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (
            status,
            Json(ApiError {
                error: self.to_string(),
                code: Some(self.code()),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<T, PanelError>;

async fn persist_or_500(state: &AppState) -> Result<(), Response> {
    state.persist().await.map_err(|e| {
        tracing::error!("Failed to persist config: {:#}", e);
        err_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })
}

pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

pub async fn list_rooms(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.supervisor.list().await)
}

pub async fn get_room(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.supervisor.status(&id).await?))
}

fn check_room_input(state: &AppState, input: &RoomConfig) -> ApiResult<()> {
    validate_room_config(input).map_err(PanelError::InvalidConfig)?;
    if let Some(holder) = state.store().port_holder(input.port, &input.id) {
        return Err(PanelError::PortInUse {
            port: input.port,
            holder,
        });
    }
    Ok(())
}

pub async fn create_room(
    State(state): State<AppState>,
    Json(mut input): Json<RoomConfig>,
) -> Response {
    if let Err(e) = check_room_input(&state, &input) {
        return e.into_response();
    }

    if input.directory.is_empty() {
        let dir = FsPath::new(&state.agent.data_directory).join(&input.id);
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            return PanelError::Io(e).into_response();
        }
        input.directory = dir.to_string_lossy().into_owned();
    }

    let id = input.id.clone();
    if let Err(e) = state.store().insert_new(input) {
        return e.into_response();
    }
    if let Err(resp) = persist_or_500(&state).await {
        return resp;
    }
    tracing::info!(room = %id, "Created room");
    match state.supervisor.status(&id).await {
        Ok(view) => (StatusCode::CREATED, Json(view)).into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn update_room(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(mut input): Json<RoomConfig>,
) -> Response {
    if input.id != id {
        return err_response(StatusCode::BAD_REQUEST, "id in path must match id in body");
    }
    let existing = match state.store().require(&id) {
        Ok(slot) => slot.config(),
        Err(e) => return e.into_response(),
    };
    if input.directory.is_empty() {
        input.directory = existing.directory;
    }
    if let Err(e) = check_room_input(&state, &input) {
        return e.into_response();
    }
    if let Err(e) = state.store().upsert(input).await {
        return e.into_response();
    }
    if let Err(resp) = persist_or_500(&state).await {
        return resp;
    }
    match state.supervisor.status(&id).await {
        Ok(view) => Json(view).into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn delete_room(Path(id): Path<String>, State(state): State<AppState>) -> Response {
    if let Err(e) = state.supervisor.delete(&id).await {
        return e.into_response();
    }
    if let Err(resp) = persist_or_500(&state).await {
        return resp;
    }
    StatusCode::NO_CONTENT.into_response()
}

pub async fn start_room_handler(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.supervisor.start(&id).await?))
}

pub async fn stop_room_handler(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.supervisor.stop(&id).await?))
}

pub async fn restart_room_handler(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.supervisor.restart(&id).await?))
}

pub async fn room_status(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.supervisor.status(&id).await?))
}

#[derive(Deserialize)]
pub struct LogQuery {
    lines: Option<usize>,
}

pub async fn room_logs(
    Path(id): Path<String>,
    Query(q): Query<LogQuery>,
    State(state): State<AppState>,
) -> ApiResult<impl IntoResponse> {
    state.store().require(&id)?;
    let lines = logs::tail(
        &state.supervisor.settings().log_dir,
        &id,
        q.lines.unwrap_or(logs::DEFAULT_TAIL_LINES),
    )
    .await?;
    Ok(Json(serde_json::json!({ "lines": lines })))
}

pub async fn clear_room_logs(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<impl IntoResponse> {
    state.store().require(&id)?;
    logs::clear(&state.supervisor.settings().log_dir, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct PathQuery {
    #[serde(default)]
    path: String,
}

pub async fn browse_files(
    Path(id): Path<String>,
    Query(q): Query<PathQuery>,
    State(state): State<AppState>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.files.list(&id, &q.path).await?))
}

pub async fn read_file(
    Path(id): Path<String>,
    Query(q): Query<PathQuery>,
    State(state): State<AppState>,
) -> ApiResult<impl IntoResponse> {
    let bytes = state.files.read(&id, &q.path).await?;
    Ok(([(header::CONTENT_TYPE, "application/octet-stream")], bytes))
}

#[derive(Deserialize)]
pub struct SaveFileRequest {
    path: String,
    #[serde(default)]
    content: String,
}

pub async fn save_file(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(req): Json<SaveFileRequest>,
) -> ApiResult<impl IntoResponse> {
    state
        .files
        .write(&id, &req.path, req.content.as_bytes())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_file(
    Path(id): Path<String>,
    Query(q): Query<PathQuery>,
    State(state): State<AppState>,
) -> ApiResult<impl IntoResponse> {
    state.files.delete(&id, &q.path).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Multipart upload: an optional `path` field naming the target directory,
/// followed by a `file` field.
pub async fn upload_file(
    Path(id): Path<String>,
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Response {
    let mut dir = String::new();
    let mut uploaded = Vec::new();

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return err_response(StatusCode::BAD_REQUEST, e.to_string()),
        };

        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("path") => match field.text().await {
                Ok(text) => dir = text,
                Err(e) => return err_response(StatusCode::BAD_REQUEST, e.to_string()),
            },
            Some("file") => {
                let Some(file_name) = field.file_name().map(str::to_string) else {
                    return err_response(StatusCode::BAD_REQUEST, "file field has no filename");
                };
                let target = if dir.trim_matches('/').is_empty() {
                    file_name.clone()
                } else {
                    format!("{}/{}", dir.trim_end_matches('/'), file_name)
                };

                let stream = field.map(|chunk| chunk.map_err(std::io::Error::other));
                let reader = StreamReader::new(stream);
                tokio::pin!(reader);
                if let Err(e) = state.files.upload(&id, &target, &mut reader).await {
                    return e.into_response();
                }
                uploaded.push(file_name);
            }
            _ => {}
        }
    }

    if uploaded.is_empty() {
        return err_response(StatusCode::BAD_REQUEST, "no file field in upload");
    }
    Json(serde_json::json!({ "uploaded": uploaded })).into_response()
}

pub async fn create_backup(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<impl IntoResponse> {
    Ok((StatusCode::CREATED, Json(state.backups.create(&id).await?)))
}

pub async fn list_backups(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.backups.list(&id).await?))
}

pub async fn restore_backup(
    Path((id, name)): Path<(String, String)>,
    State(state): State<AppState>,
) -> ApiResult<impl IntoResponse> {
    state.backups.restore(&id, &name).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct AuditQuery {
    limit: Option<usize>,
}

pub async fn audit_log(
    Query(q): Query<AuditQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    Json(state.audit.recent(q.limit.unwrap_or(100)))
}

pub async fn events_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_events_ws(socket, state))
}

async fn handle_events_ws(mut socket: WebSocket, state: AppState) {
    let mut events_rx = state.events.subscribe();

    loop {
        tokio::select! {
            event = events_rx.recv() => {
                match event {
                    Ok(change) => {
                        let Ok(json) = serde_json::to_string(&change) else {
                            continue;
                        };
                        if socket.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "Status subscriber lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            ws_msg = socket.recv() => {
                match ws_msg {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kinds_map_to_distinct_statuses() {
        let cases = [
            (PanelError::AlreadyRunning, StatusCode::CONFLICT),
            (PanelError::NotRunning, StatusCode::CONFLICT),
            (PanelError::InstanceBusy, StatusCode::CONFLICT),
            (PanelError::RoomExists("room1".to_string()), StatusCode::CONFLICT),
            (
                PanelError::BackupFailed("tar exited with 2".to_string()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                PanelError::IllegalPath("../x".to_string()),
                StatusCode::BAD_REQUEST,
            ),
            (PanelError::NotFound("x".to_string()), StatusCode::NOT_FOUND),
            (
                PanelError::NotProvisioned("room1".to_string()),
                StatusCode::PRECONDITION_FAILED,
            ),
            (
                PanelError::StopFailed("EPERM".to_string()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, want) in cases {
            assert_eq!(err.into_response().status(), want);
        }
    }
}
