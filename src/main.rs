use axum::{
    Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, patch, post, put},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::{OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;

use visit_core::constants::DEFAULT_VISIT_DATA_DIR;
use visit_core::{
    ClinicalDraft, CloseOutcome, Collaborators, DraftSynchronizer, EditorConfig, EditorError,
    EditorView, FieldPath, FileDraftStore, NoSuggestions, SuggestionService, VisitStatusSnapshot,
    cache_capacity_from_env_value, specialty_schema_from_path,
};
use visit_uuid::VisitId;

mod suggestions;

use suggestions::HttpSuggestionService;

/// One open editing session and the channel its status snapshots arrive on.
#[derive(Clone)]
struct Session {
    editor: DraftSynchronizer,
    status: Arc<watch::Sender<VisitStatusSnapshot>>,
}

/// Application state shared across REST API handlers
///
/// Holds the resolved editor configuration, the collaborators every session shares, and
/// the open sessions keyed by visit.
#[derive(Clone)]
struct AppState {
    config: Arc<EditorConfig>,
    store: Arc<FileDraftStore>,
    suggestions: Arc<dyn SuggestionService>,
    sessions: Arc<Mutex<HashMap<VisitId, Session>>>,
}

impl AppState {
    fn sessions(&self) -> MutexGuard<'_, HashMap<VisitId, Session>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn session(&self, visit_id: VisitId) -> Result<Session, ApiError> {
        self.sessions().get(&visit_id).cloned().ok_or_else(|| {
            ApiError::new(
                StatusCode::NOT_FOUND,
                format!("no open session for visit {visit_id}"),
            )
        })
    }
}

#[derive(Serialize, ToSchema)]
struct HealthRes {
    status: String,
    message: String,
}

#[derive(Serialize, ToSchema)]
struct ErrorRes {
    error: String,
}

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
struct OpenSessionReq {
    /// Latest status snapshot from the queue/payment bridge
    #[schema(value_type = Object)]
    status: VisitStatusSnapshot,
    /// Non-sensitive ambient fields passed to the suggestion service
    #[serde(default)]
    #[schema(value_type = Object)]
    context: Map<String, Value>,
}

#[derive(Deserialize, ToSchema)]
struct SetFieldReq {
    /// Dotted field path, e.g. `specialtyData.odontogram`
    path: String,
    #[schema(value_type = Object)]
    value: Value,
}

#[derive(Deserialize, ToSchema)]
struct SaveReq {
    #[serde(default, rename = "final")]
    finalise: bool,
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
struct SaveRes {
    visit_id: String,
    finalised: bool,
    #[schema(value_type = String)]
    persisted_at: DateTime<Utc>,
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
struct ViewRes {
    #[schema(value_type = Object)]
    view: EditorView,
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
struct CloseRes {
    closed: bool,
    discarded_unsaved: bool,
    #[schema(value_type = Object)]
    warning: Option<visit_core::UnloadWarning>,
}

#[derive(Deserialize)]
struct CloseQuery {
    discard: Option<bool>,
}

struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<EditorError> for ApiError {
    fn from(err: EditorError) -> Self {
        Self::new(editor_error_status(&err), err.to_string())
    }
}

impl axum::response::IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (
            self.status,
            Json(ErrorRes {
                error: self.message,
            }),
        )
            .into_response()
    }
}

fn editor_error_status(err: &EditorError) -> StatusCode {
    match err {
        EditorError::GateDenied(_) => StatusCode::FORBIDDEN,
        EditorError::Persist(_) | EditorError::Suggestion(_) => StatusCode::BAD_GATEWAY,
        EditorError::SessionClosed => StatusCode::GONE,
        EditorError::RecordFinalised => StatusCode::CONFLICT,
        EditorError::InvalidInput(_)
        | EditorError::InvalidFieldPath(_)
        | EditorError::InvalidSnapshot(_) => StatusCode::BAD_REQUEST,
        EditorError::NoRuntime
        | EditorError::InvalidSpecialtySchema(_)
        | EditorError::ConfigRead(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn parse_visit_id(raw: &str) -> Result<VisitId, ApiError> {
    VisitId::parse(raw).map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, e.to_string()))
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health,
        open_session,
        update_status,
        set_field,
        save,
        get_view,
        close_session
    ),
    components(schemas(
        HealthRes,
        ErrorRes,
        OpenSessionReq,
        SetFieldReq,
        SaveReq,
        SaveRes,
        ViewRes,
        CloseRes
    ))
)]
struct ApiDoc;

/// Main entry point for the visit editor host
///
/// Serves the REST API for editing sessions. Each open visit gets its own
/// synchroniser, autosave timer and suggestion cache.
///
/// # Environment Variables
/// - `VISIT_REST_ADDR`: REST server address (default: "0.0.0.0:3000")
/// - `VISIT_DATA_DIR`: Directory for persisted drafts (default: "visit_data")
/// - `VISIT_SUGGESTION_URL`: Suggestion service endpoint (suggestions disabled if unset)
/// - `VISIT_SPECIALTY_SCHEMA`: Path to a YAML specialty schema (default: dental)
/// - `VISIT_SUGGESTION_CACHE_CAPACITY`: Suggestion cache entries per session (default: 512)
///
/// # Returns
/// * `Ok(())` - If the server starts and runs successfully
/// * `Err(anyhow::Error)` - If configuration is invalid or the server fails
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("visit_run=info".parse()?)
                .add_directive("visit_core=info".parse()?),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let rest_addr = std::env::var("VISIT_REST_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".into());
    let data_dir = std::env::var("VISIT_DATA_DIR")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_VISIT_DATA_DIR));
    let schema_path = std::env::var("VISIT_SPECIALTY_SCHEMA")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from);

    let cache_capacity =
        cache_capacity_from_env_value(std::env::var("VISIT_SUGGESTION_CACHE_CAPACITY").ok())?;
    let specialty_schema = specialty_schema_from_path(schema_path.as_deref())?;
    let config = Arc::new(EditorConfig::new(cache_capacity, specialty_schema));

    let suggestions: Arc<dyn SuggestionService> = match std::env::var("VISIT_SUGGESTION_URL") {
        Ok(url) if !url.trim().is_empty() => {
            tracing::info!("++ Suggestions from {}", url);
            Arc::new(HttpSuggestionService::new(url)?)
        }
        _ => {
            tracing::info!("++ No VISIT_SUGGESTION_URL set, suggestions disabled");
            Arc::new(NoSuggestions)
        }
    };

    tracing::info!("++ Drafts stored under {}", data_dir.display());
    tracing::info!("++ Starting visit editor REST on {}", rest_addr);

    let state = AppState {
        config,
        store: Arc::new(FileDraftStore::new(data_dir)),
        suggestions,
        sessions: Arc::new(Mutex::new(HashMap::new())),
    };

    let rest_app = Router::new()
        .route("/health", get(health))
        .route("/visits/:visit_id/session", post(open_session))
        .route("/visits/:visit_id/status", put(update_status))
        .route("/visits/:visit_id/fields", patch(set_field))
        .route("/visits/:visit_id/save", post(save))
        .route("/visits/:visit_id", get(get_view).delete(close_session))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&rest_addr).await?;
    axum::serve(listener, rest_app).await?;

    Ok(())
}

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Health check response", body = HealthRes)
    )
)]
/// Health check endpoint for the REST API
///
/// Used for monitoring and load balancer health checks.
async fn health() -> Json<HealthRes> {
    Json(HealthRes {
        status: "ok".into(),
        message: "visit editor is running".into(),
    })
}

#[utoipa::path(
    post,
    path = "/visits/{visit_id}/session",
    request_body = OpenSessionReq,
    params(("visit_id" = String, Path, description = "Visit UUID")),
    responses(
        (status = 201, description = "Session opened", body = ViewRes),
        (status = 403, description = "Visit cannot be opened yet", body = ErrorRes),
        (status = 409, description = "Session already open or record finalised", body = ErrorRes)
    )
)]
/// Open an editing session for a visit
///
/// Resumes the last persisted draft if there is one, otherwise starts an empty draft.
/// The autosave timer starts immediately.
async fn open_session(
    State(state): State<AppState>,
    Path(visit_id): Path<String>,
    Json(req): Json<OpenSessionReq>,
) -> Result<(StatusCode, Json<ViewRes>), ApiError> {
    let visit_id = parse_visit_id(&visit_id)?;
    if state.sessions().contains_key(&visit_id) {
        return Err(ApiError::new(
            StatusCode::CONFLICT,
            format!("a session for visit {visit_id} is already open"),
        ));
    }

    let draft = match state.store.load(visit_id).await {
        Ok(Some(draft)) if draft.is_finalised() => {
            return Err(ApiError::new(
                StatusCode::CONFLICT,
                format!("visit {visit_id} has been finalised"),
            ));
        }
        Ok(Some(draft)) => draft,
        Ok(None) => ClinicalDraft::new(visit_id),
        Err(e) => {
            tracing::error!("Load draft error: {:?}", e);
            return Err(ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to load draft",
            ));
        }
    };

    let (status_tx, status_rx) = watch::channel(req.status);
    let collaborators = Collaborators {
        store: state.store.clone(),
        suggestions: state.suggestions.clone(),
        status: Arc::new(status_rx),
    };
    let editor = DraftSynchronizer::open(state.config.clone(), draft, collaborators, req.context)?;
    editor.on_mount()?;

    let view = editor.view();
    let session = Session {
        editor,
        status: Arc::new(status_tx),
    };
    let previous = state.sessions().insert(visit_id, session);
    if let Some(previous) = previous {
        // lost a race with a concurrent open; keep the newer session
        previous.editor.on_unmount();
    }

    Ok((StatusCode::CREATED, Json(ViewRes { view })))
}

#[utoipa::path(
    put,
    path = "/visits/{visit_id}/status",
    params(("visit_id" = String, Path, description = "Visit UUID")),
    responses(
        (status = 200, description = "Snapshot applied", body = ViewRes),
        (status = 404, description = "No open session", body = ErrorRes)
    )
)]
/// Push the latest status snapshot for a visit
async fn update_status(
    State(state): State<AppState>,
    Path(visit_id): Path<String>,
    Json(snapshot): Json<VisitStatusSnapshot>,
) -> Result<Json<ViewRes>, ApiError> {
    let session = state.session(parse_visit_id(&visit_id)?)?;
    session.status.send_replace(snapshot);
    Ok(Json(ViewRes {
        view: session.editor.view(),
    }))
}

#[utoipa::path(
    patch,
    path = "/visits/{visit_id}/fields",
    request_body = SetFieldReq,
    params(("visit_id" = String, Path, description = "Visit UUID")),
    responses(
        (status = 200, description = "Field written", body = ViewRes),
        (status = 400, description = "Invalid field path or value", body = ErrorRes),
        (status = 403, description = "Visit not editable", body = ErrorRes),
        (status = 404, description = "No open session", body = ErrorRes)
    )
)]
/// Write one field of the draft
///
/// Marks the draft dirty and, for fields bound to a suggestion channel, schedules a
/// debounced suggestion request.
async fn set_field(
    State(state): State<AppState>,
    Path(visit_id): Path<String>,
    Json(req): Json<SetFieldReq>,
) -> Result<Json<ViewRes>, ApiError> {
    let session = state.session(parse_visit_id(&visit_id)?)?;
    if !session.editor.view().can_edit {
        return Err(EditorError::GateDenied(visit_core::Capability::Edit).into());
    }

    let path = FieldPath::parse(&req.path).map_err(EditorError::from)?;
    session.editor.set_field(&path, req.value)?;
    Ok(Json(ViewRes {
        view: session.editor.view(),
    }))
}

#[utoipa::path(
    post,
    path = "/visits/{visit_id}/save",
    request_body = SaveReq,
    params(("visit_id" = String, Path, description = "Visit UUID")),
    responses(
        (status = 200, description = "Draft saved", body = SaveRes),
        (status = 403, description = "Finalisation not permitted", body = ErrorRes),
        (status = 404, description = "No open session", body = ErrorRes),
        (status = 502, description = "Persistence failed", body = ErrorRes)
    )
)]
/// Save the draft, optionally finalising the record
async fn save(
    State(state): State<AppState>,
    Path(visit_id): Path<String>,
    Json(req): Json<SaveReq>,
) -> Result<Json<SaveRes>, ApiError> {
    let session = state.session(parse_visit_id(&visit_id)?)?;
    let ack = session.editor.save(req.finalise).await?;
    Ok(Json(SaveRes {
        visit_id: ack.visit_id.to_string(),
        finalised: ack.options.finalise,
        persisted_at: ack.persisted_at,
    }))
}

#[utoipa::path(
    get,
    path = "/visits/{visit_id}",
    params(("visit_id" = String, Path, description = "Visit UUID")),
    responses(
        (status = 200, description = "Current read model", body = ViewRes),
        (status = 404, description = "No open session", body = ErrorRes)
    )
)]
/// Current draft, dirty state and gate flags for a visit
async fn get_view(
    State(state): State<AppState>,
    Path(visit_id): Path<String>,
) -> Result<Json<ViewRes>, ApiError> {
    let session = state.session(parse_visit_id(&visit_id)?)?;
    Ok(Json(ViewRes {
        view: session.editor.view(),
    }))
}

#[utoipa::path(
    delete,
    path = "/visits/{visit_id}",
    params(
        ("visit_id" = String, Path, description = "Visit UUID"),
        ("discard" = Option<bool>, Query, description = "Close even if there are unsaved changes")
    ),
    responses(
        (status = 200, description = "Session closed", body = CloseRes),
        (status = 404, description = "No open session", body = ErrorRes),
        (status = 409, description = "Unsaved changes; session left open", body = CloseRes)
    )
)]
/// Close an editing session
///
/// A session with unsaved changes stays open and answers with the unload warning unless
/// `discard=true` is given.
async fn close_session(
    State(state): State<AppState>,
    Path(visit_id): Path<String>,
    Query(query): Query<CloseQuery>,
) -> Result<(StatusCode, Json<CloseRes>), ApiError> {
    let visit_id = parse_visit_id(&visit_id)?;
    let session = state.session(visit_id)?;

    match session.editor.close(query.discard.unwrap_or(false)) {
        CloseOutcome::Blocked(warning) => Ok((
            StatusCode::CONFLICT,
            Json(CloseRes {
                closed: false,
                discarded_unsaved: false,
                warning: Some(warning),
            }),
        )),
        CloseOutcome::Closed { discarded_unsaved } => {
            state.sessions().remove(&visit_id);
            if discarded_unsaved {
                tracing::info!("Discarded unsaved changes for visit {}", visit_id);
            }
            Ok((
                StatusCode::OK,
                Json(CloseRes {
                    closed: true,
                    discarded_unsaved,
                    warning: None,
                }),
            ))
        }
    }
}
