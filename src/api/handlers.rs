use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    Json as RequestJson,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;

use crate::logic::{TableField, TableFieldError};
use crate::model::{
    FieldConfig, Fields, ParentRecord, RelationKind, RelationRegistry, Row, RowKey, SessionId, SyncPlan,
    SyncReport, TableView,
};
use crate::store::{RelationStore, Session, SessionCache, StoreError};

/// Everything the handlers share: the store, the relationship registry, the
/// configured fields and the open field sessions.
pub struct AppContext<S> {
    pub store: S,
    pub registry: RelationRegistry,
    pub fields: Vec<FieldConfig>,
    pub sessions: SessionCache,
}

impl<S: RelationStore> AppContext<S> {
    pub fn new(store: S, registry: RelationRegistry, fields: Vec<FieldConfig>, sessions: SessionCache) -> Self {
        Self {
            store,
            registry,
            fields,
            sessions,
        }
    }

    fn field_config(&self, name: &str) -> Option<&FieldConfig> {
        self.fields.iter().find(|field| field.name == name)
    }
}

pub type AppState<S> = Arc<AppContext<S>>;

type ApiError = (StatusCode, Json<ErrorResponse>);

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub backend: String,
    pub open_sessions: usize,
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
pub struct ListResponse<T> {
    pub items: Vec<T>,
    pub total: usize,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(message: &str) -> Self {
        Self {
            error: message.to_string(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct OpenSessionRequest {
    /// Omitted for a record that is still being created
    #[serde(default)]
    pub parent: Option<ParentRecord>,
}

#[derive(Debug, Deserialize)]
pub struct RowRequest {
    #[serde(default)]
    pub data: Fields,
    /// Current state of the enclosing form, handed to hooks
    #[serde(default)]
    pub parent_state: Fields,
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub session_id: SessionId,
    pub field: String,
    pub parent: Option<ParentRecord>,
    pub relationship: Option<RelationKind>,
    pub created_at: DateTime<Utc>,
    pub dirty: bool,
    pub view: TableView,
    pub rows: Vec<Row>,
}

#[derive(Debug, Serialize)]
pub struct RowMutationResponse {
    pub key: RowKey,
    /// false when no row had the key
    pub changed: bool,
    pub rows: Vec<Row>,
}

#[derive(Debug, Serialize)]
pub struct PlanResponse {
    pub plan: Option<SyncPlan>,
}

#[derive(Debug, Serialize)]
pub struct SaveResponse {
    /// None when the field has no relationship to save into
    pub report: Option<SyncReport>,
    pub rows: Vec<Row>,
}

fn store_error(e: StoreError) -> ApiError {
    let status = if e.is_constraint() {
        StatusCode::CONFLICT
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, Json(ErrorResponse::new(&e.to_string())))
}

fn field_error(e: TableFieldError) -> ApiError {
    match e {
        TableFieldError::ActionDisabled(_) => (StatusCode::FORBIDDEN, Json(ErrorResponse::new(&e.to_string()))),
        TableFieldError::Store(e) => store_error(e),
    }
}

fn row_key(segment: &str) -> RowKey {
    segment.parse().unwrap_or_else(|never: Infallible| match never {})
}

async fn find_session<S: RelationStore>(state: &AppContext<S>, session_id: &str) -> Result<Session, ApiError> {
    match state.sessions.get(session_id).await {
        Some(session) => Ok(session),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new(&format!("Session '{}' not found", session_id))),
        )),
    }
}

fn session_response(session: &Session, field: &TableField) -> SessionResponse {
    SessionResponse {
        session_id: session.id.clone(),
        field: field.name().to_string(),
        parent: field.parent().cloned(),
        relationship: field.bound_relationship().map(|relationship| relationship.kind()),
        created_at: session.created_at,
        dirty: session.dirty,
        view: field.table_view(),
        rows: field.rows().to_vec(),
    }
}

pub async fn health_check<S: RelationStore>(State(state): State<AppState<S>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        backend: state.store.backend_name().to_string(),
        open_sessions: state.sessions.len().await,
        timestamp: Utc::now().to_rfc3339(),
    })
}

pub async fn list_fields<S: RelationStore>(State(state): State<AppState<S>>) -> Json<ListResponse<TableView>> {
    let items: Vec<TableView> = state
        .fields
        .iter()
        .map(|config| TableField::from_config(config).table_view())
        .collect();
    let total = items.len();
    Json(ListResponse { items, total })
}

/// Opens a field session bound to the given parent record and loads its rows
pub async fn open_session<S: RelationStore>(
    State(state): State<AppState<S>>,
    Path(field_name): Path<String>,
    request: Option<RequestJson<OpenSessionRequest>>,
) -> Result<Json<SessionResponse>, ApiError> {
    let Some(config) = state.field_config(&field_name) else {
        return Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new(&format!("Field '{}' not found", field_name))),
        ));
    };
    let request = request.map(|RequestJson(request)| request).unwrap_or_default();

    let mut field = TableField::from_config(config);
    field
        .hydrate(&state.store, &state.registry, request.parent)
        .await
        .map_err(store_error)?;

    let session = state.sessions.open(field).await;
    log::info!("Opened session {} for field '{}'", session.id, field_name);

    let field = session.field.lock().await;
    Ok(Json(session_response(&session, &field)))
}

pub async fn get_session<S: RelationStore>(
    State(state): State<AppState<S>>,
    Path(session_id): Path<SessionId>,
) -> Result<Json<SessionResponse>, ApiError> {
    let session = find_session(&state, &session_id).await?;
    let field = session.field.lock().await;
    Ok(Json(session_response(&session, &field)))
}

/// Discards the session and any unsaved edits
pub async fn close_session<S: RelationStore>(
    State(state): State<AppState<S>>,
    Path(session_id): Path<SessionId>,
) -> Result<StatusCode, ApiError> {
    if state.sessions.remove(&session_id).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new(&format!("Session '{}' not found", session_id))),
        ))
    }
}

pub async fn create_row<S: RelationStore>(
    State(state): State<AppState<S>>,
    Path(session_id): Path<SessionId>,
    RequestJson(request): RequestJson<RowRequest>,
) -> Result<Json<RowMutationResponse>, ApiError> {
    let session = find_session(&state, &session_id).await?;
    let mut field = session.field.lock().await;

    let key = field
        .create_record(request.data, &request.parent_state)
        .map_err(field_error)?;
    state.sessions.mark_dirty(&session_id).await;

    Ok(Json(RowMutationResponse {
        key,
        changed: true,
        rows: field.rows().to_vec(),
    }))
}

pub async fn update_row<S: RelationStore>(
    State(state): State<AppState<S>>,
    Path((session_id, key)): Path<(SessionId, String)>,
    RequestJson(request): RequestJson<RowRequest>,
) -> Result<Json<RowMutationResponse>, ApiError> {
    let session = find_session(&state, &session_id).await?;
    let mut field = session.field.lock().await;

    let key = row_key(&key);
    let changed = field
        .update_record(&key, request.data, &request.parent_state)
        .map_err(field_error)?;
    if changed {
        state.sessions.mark_dirty(&session_id).await;
    }

    Ok(Json(RowMutationResponse {
        key,
        changed,
        rows: field.rows().to_vec(),
    }))
}

pub async fn delete_row<S: RelationStore>(
    State(state): State<AppState<S>>,
    Path((session_id, key)): Path<(SessionId, String)>,
) -> Result<Json<RowMutationResponse>, ApiError> {
    let session = find_session(&state, &session_id).await?;
    let mut field = session.field.lock().await;

    let key = row_key(&key);
    let changed = field.delete_record(&key).map_err(field_error)?;
    if changed {
        state.sessions.mark_dirty(&session_id).await;
    }

    Ok(Json(RowMutationResponse {
        key,
        changed,
        rows: field.rows().to_vec(),
    }))
}

/// What a save would write right now, without writing it
pub async fn preview_session<S: RelationStore>(
    State(state): State<AppState<S>>,
    Path(session_id): Path<SessionId>,
) -> Result<Json<PlanResponse>, ApiError> {
    let session = find_session(&state, &session_id).await?;
    let field = session.field.lock().await;

    let plan = field.preview(&state.store).await.map_err(store_error)?;
    Ok(Json(PlanResponse { plan }))
}

/// Reconciles the session's working list with the store.
/// On failure the working list is kept so the client can fix and retry.
pub async fn save_session<S: RelationStore>(
    State(state): State<AppState<S>>,
    Path(session_id): Path<SessionId>,
) -> Result<Json<SaveResponse>, ApiError> {
    let session = find_session(&state, &session_id).await?;
    let mut field = session.field.lock().await;

    let report = match field.save(&state.store).await {
        Ok(report) => report,
        Err(e) => {
            log::warn!("Save of session {} failed: {}", session_id, e);
            return Err(store_error(e));
        }
    };
    state.sessions.mark_clean(&session_id).await;

    Ok(Json(SaveResponse {
        report,
        rows: field.rows().to_vec(),
    }))
}
