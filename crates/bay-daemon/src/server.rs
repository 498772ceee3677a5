use std::{env, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{anyhow, bail, Context, Result};
use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bay_db::{Database, SandboxRecord, SandboxStatus};
use bay_driver::docker::{ConnectMode, DockerConfig};
use bay_driver::k8s::K8sConfig;
use bay_kernel::{
    build_driver, config::default_instance_id, require_capability, resolve_endpoint, BayError,
    DriverConfig, GarbageCollector, GcConfig, LockRegistry, ProfileRegistry, RuntimeClient,
    SandboxManager,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::info;
use utoipa::{IntoParams, OpenApi, ToSchema};

pub async fn run() -> Result<()> {
    let config = AppConfig::from_env()?;

    let db = Database::connect(&config.db_url)
        .await
        .context("failed to open database")?;

    let driver = build_driver(&config.driver).map_err(|err| anyhow!(err))?;

    let mut profiles = ProfileRegistry::default();
    if let Some(path) = &config.profiles_file {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read profiles file {path}"))?;
        let count = profiles.load_json(&raw).map_err(|err| anyhow!(err))?;
        info!(count, path = %path, "loaded profiles");
    }

    let http = RuntimeClient::new().map_err(|err| anyhow!(err))?;
    let sandboxes = SandboxManager::new(
        driver.clone(),
        db.clone(),
        Arc::new(profiles),
        LockRegistry::new(),
        http.clone(),
    );
    let gc = GarbageCollector::new(db.clone(), driver, sandboxes.clone(), config.gc.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(gc.clone().run_loop(shutdown_rx));

    let state = Arc::new(AppState {
        sandboxes,
        gc,
        http,
    });

    let app = build_router(state).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listen socket")?;

    info!(addr = %config.listen_addr, instance_id = %config.gc.instance_id, "bay-daemon listening");
    axum::serve(listener, app)
        .await
        .context("HTTP server exited")?;

    let _ = shutdown_tx.send(true);
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api-docs/openapi.json", get(openapi_spec))
        .route(
            "/api/v1/sandboxes",
            post(create_sandbox).get(list_sandboxes),
        )
        .route(
            "/api/v1/sandboxes/:id",
            get(get_sandbox).delete(delete_sandbox),
        )
        .route("/api/v1/sandboxes/:id/stop", post(stop_sandbox))
        .route("/api/v1/sandboxes/:id/extend_ttl", post(extend_ttl))
        .route("/api/v1/sandboxes/:id/keepalive", post(keepalive))
        .route("/api/v1/sandboxes/:id/exec", post(exec_capability))
        .route("/api/v1/admin/gc/run", post(run_gc))
        .with_state(state)
}

struct AppState {
    sandboxes: SandboxManager,
    gc: GarbageCollector,
    http: RuntimeClient,
}

#[derive(Debug, Clone)]
struct AppConfig {
    listen_addr: SocketAddr,
    db_url: String,
    driver: DriverConfig,
    gc: GcConfig,
    profiles_file: Option<String>,
}

impl AppConfig {
    fn from_env() -> Result<Self> {
        let listen_addr = env::var("BAY_API_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
            .parse()
            .context("invalid BAY_API_ADDR")?;

        let db_url = env::var("BAY_DB_DSN")
            .or_else(|_| env::var("DATABASE_URL"))
            .context("BAY_DB_DSN or DATABASE_URL must be configured")?;

        let instance_id = env::var("BAY_GC_INSTANCE_ID")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(default_instance_id);

        let gc = GcConfig {
            instance_id: instance_id.clone(),
            interval: Duration::from_secs(u64_env("BAY_GC_INTERVAL_SECONDS").unwrap_or(5)),
            idle_session_enabled: bool_env("BAY_GC_IDLE_SESSIONS").unwrap_or(true),
            expired_sandbox_enabled: bool_env("BAY_GC_EXPIRED_SANDBOXES").unwrap_or(true),
            orphan_container_enabled: bool_env("BAY_GC_ORPHAN_CONTAINERS").unwrap_or(true),
            orphan_workspace_enabled: bool_env("BAY_GC_ORPHAN_WORKSPACES").unwrap_or(true),
            workspace_grace: Duration::from_secs(
                u64_env("BAY_GC_WORKSPACE_GRACE_SECONDS").unwrap_or(300),
            ),
        };

        let driver_kind = env::var("BAY_DRIVER").unwrap_or_else(|_| "docker".to_string());
        let driver = match driver_kind.as_str() {
            "docker" => DriverConfig::Docker(DockerConfig {
                socket: env::var("BAY_DOCKER_SOCKET").ok().filter(|s| !s.is_empty()),
                network: env::var("BAY_DOCKER_NETWORK").ok().filter(|s| !s.is_empty()),
                connect_mode: match env::var("BAY_DOCKER_CONNECT_MODE") {
                    Ok(raw) => raw.parse::<ConnectMode>().map_err(|err| anyhow!(err))?,
                    Err(_) => ConnectMode::Auto,
                },
                host_address: env::var("BAY_DOCKER_HOST_ADDRESS")
                    .unwrap_or_else(|_| "127.0.0.1".to_string()),
                publish_ports: bool_env("BAY_DOCKER_PUBLISH_PORTS").unwrap_or(true),
                host_port: env::var("BAY_DOCKER_HOST_PORT")
                    .ok()
                    .and_then(|raw| raw.parse().ok()),
                instance_id: instance_id.clone(),
            }),
            "k8s" => DriverConfig::K8s(K8sConfig {
                namespace: env::var("BAY_K8S_NAMESPACE").unwrap_or_else(|_| "default".to_string()),
                kubeconfig: env::var("BAY_K8S_KUBECONFIG").ok().filter(|s| !s.is_empty()),
                storage_class: env::var("BAY_K8S_STORAGE_CLASS")
                    .ok()
                    .filter(|s| !s.is_empty()),
                default_storage_size: env::var("BAY_K8S_STORAGE_SIZE")
                    .unwrap_or_else(|_| "1Gi".to_string()),
                image_pull_secrets: env::var("BAY_K8S_IMAGE_PULL_SECRETS")
                    .map(|raw| {
                        raw.split(',')
                            .map(str::trim)
                            .filter(|s| !s.is_empty())
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default(),
                pod_startup_timeout: u64_env("BAY_K8S_POD_STARTUP_TIMEOUT").unwrap_or(120),
                label_prefix: env::var("BAY_K8S_LABEL_PREFIX")
                    .unwrap_or_else(|_| "bay".to_string()),
                instance_id,
            }),
            other => bail!("unknown driver kind: {other}"),
        };

        Ok(Self {
            listen_addr,
            db_url,
            driver,
            gc,
            profiles_file: env::var("BAY_PROFILES_FILE").ok().filter(|s| !s.is_empty()),
        })
    }
}

fn bool_env(name: &str) -> Option<bool> {
    let raw = env::var(name).ok()?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn u64_env(name: &str) -> Option<u64> {
    env::var(name).ok()?.trim().parse().ok()
}

/// Owner principal for the request. Authentication is an external
/// collaborator; the daemon only threads the principal through.
fn owner_from(headers: &HeaderMap) -> String {
    headers
        .get("x-bay-owner")
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .unwrap_or("default")
        .to_string()
}

// ----------------------------------------------------------------------
// Error mapping
// ----------------------------------------------------------------------

struct ApiError(BayError);

impl From<BayError> for ApiError {
    fn from(err: BayError) -> Self {
        Self(err)
    }
}

fn status_for(err: &BayError) -> StatusCode {
    match err.code() {
        "not_found" => StatusCode::NOT_FOUND,
        "conflict" | "sandbox_expired" | "sandbox_ttl_infinite" => StatusCode::CONFLICT,
        "session_not_ready" => StatusCode::SERVICE_UNAVAILABLE,
        "capability_not_supported" | "validation_error" => StatusCode::BAD_REQUEST,
        "driver_error" => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.0.code().to_string(),
                message: self.0.to_string(),
                details: self.0.details(),
            },
        };

        let mut response = (status, Json(body)).into_response();
        if let Some(retry_after_ms) = self.0.retry_after_ms() {
            let seconds = retry_after_ms.div_ceil(1000).max(1);
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(seconds));
        }
        response
    }
}

// ----------------------------------------------------------------------
// Request / response bodies
// ----------------------------------------------------------------------

#[derive(Debug, Deserialize, ToSchema)]
struct CreateSandboxBody {
    #[serde(default = "default_profile_id")]
    profile_id: String,
    cargo_id: Option<String>,
    ttl: Option<i64>,
}

fn default_profile_id() -> String {
    bay_kernel::config::DEFAULT_PROFILE_ID.to_string()
}

#[derive(Debug, Serialize, ToSchema)]
struct SandboxResponse {
    id: String,
    profile_id: String,
    cargo_id: String,
    status: String,
    current_session_id: Option<String>,
    created_at: String,
    last_active_at: String,
    expires_at: Option<String>,
    idle_expires_at: Option<String>,
}

impl SandboxResponse {
    fn from_record(record: &SandboxRecord, status: SandboxStatus) -> Self {
        Self {
            id: record.id.clone(),
            profile_id: record.profile_id.clone(),
            cargo_id: record.cargo_id.clone(),
            status: status.as_str().to_string(),
            current_session_id: record.current_session_id.clone(),
            created_at: record.created_at.to_rfc3339(),
            last_active_at: record.last_active_at.to_rfc3339(),
            expires_at: record.expires_at.map(|ts| ts.to_rfc3339()),
            idle_expires_at: record.idle_expires_at.map(|ts| ts.to_rfc3339()),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
struct SandboxListResponse {
    items: Vec<SandboxResponse>,
    next_cursor: Option<String>,
}

#[derive(Debug, Deserialize, IntoParams)]
struct SandboxListQuery {
    status: Option<String>,
    limit: Option<usize>,
    cursor: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
struct ExtendTtlBody {
    extend_by: i64,
}

#[derive(Debug, Deserialize, ToSchema)]
struct ExecBody {
    capability: String,
    /// Runtime API path; defaults to `/<capability>`.
    path: Option<String>,
    #[serde(default)]
    #[schema(value_type = Object)]
    payload: Value,
}

#[derive(Debug, Serialize, ToSchema)]
struct GcRunResponse {
    idle_sessions: usize,
    expired_sandboxes: usize,
    orphan_containers: usize,
    orphan_workspaces: usize,
}

#[derive(Debug, Serialize, ToSchema)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Serialize, ToSchema)]
struct ErrorDetail {
    code: String,
    message: String,
    #[schema(value_type = Option<Object>)]
    details: Option<Value>,
}

#[derive(OpenApi)]
#[openapi(
    paths(
        healthz,
        create_sandbox,
        list_sandboxes,
        get_sandbox,
        delete_sandbox,
        stop_sandbox,
        extend_ttl,
        keepalive,
        exec_capability,
        run_gc
    ),
    components(schemas(
        CreateSandboxBody,
        SandboxResponse,
        SandboxListResponse,
        ExtendTtlBody,
        ExecBody,
        GcRunResponse,
        ErrorBody,
        ErrorDetail
    ))
)]
struct ApiDoc;

async fn openapi_spec() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

// ----------------------------------------------------------------------
// Handlers
// ----------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/healthz",
    responses((status = 200, description = "Service is healthy"))
)]
async fn healthz() -> StatusCode {
    StatusCode::OK
}

#[utoipa::path(
    post,
    path = "/api/v1/sandboxes",
    request_body = CreateSandboxBody,
    responses(
        (status = 201, description = "Sandbox created", body = SandboxResponse),
        (status = 400, description = "Invalid request", body = ErrorBody)
    )
)]
async fn create_sandbox(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<CreateSandboxBody>,
) -> Result<(StatusCode, Json<SandboxResponse>), ApiError> {
    let owner = owner_from(&headers);
    let record = state
        .sandboxes
        .create(
            &owner,
            &payload.profile_id,
            payload.cargo_id.as_deref(),
            payload.ttl,
        )
        .await?;

    let (record, status) = state.sandboxes.get_with_status(&record.id, &owner).await?;
    Ok((
        StatusCode::CREATED,
        Json(SandboxResponse::from_record(&record, status)),
    ))
}

#[utoipa::path(
    get,
    path = "/api/v1/sandboxes",
    params(SandboxListQuery),
    responses(
        (status = 200, description = "List sandboxes", body = SandboxListResponse),
        (status = 400, description = "Invalid status filter", body = ErrorBody)
    )
)]
async fn list_sandboxes(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<SandboxListQuery>,
) -> Result<Json<SandboxListResponse>, ApiError> {
    let owner = owner_from(&headers);

    let status = query
        .status
        .as_deref()
        .map(|raw| {
            raw.parse::<SandboxStatus>()
                .map_err(|_| BayError::Validation(format!("invalid status filter: {raw}")))
        })
        .transpose()?;

    let limit = query.limit.unwrap_or(50).clamp(1, 200);
    let (items, next_cursor) = state
        .sandboxes
        .list(&owner, status, limit, query.cursor.as_deref())
        .await?;

    Ok(Json(SandboxListResponse {
        items: items
            .iter()
            .map(|item| SandboxResponse::from_record(&item.sandbox, item.status))
            .collect(),
        next_cursor,
    }))
}

#[utoipa::path(
    get,
    path = "/api/v1/sandboxes/{id}",
    params(("id" = String, Path, description = "Sandbox id")),
    responses(
        (status = 200, description = "Sandbox detail", body = SandboxResponse),
        (status = 404, description = "Unknown sandbox", body = ErrorBody)
    )
)]
async fn get_sandbox(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<SandboxResponse>, ApiError> {
    let owner = owner_from(&headers);
    let (record, status) = state.sandboxes.get_with_status(&id, &owner).await?;
    Ok(Json(SandboxResponse::from_record(&record, status)))
}

#[utoipa::path(
    delete,
    path = "/api/v1/sandboxes/{id}",
    params(("id" = String, Path, description = "Sandbox id")),
    responses(
        (status = 204, description = "Sandbox deleted"),
        (status = 404, description = "Unknown sandbox", body = ErrorBody)
    )
)]
async fn delete_sandbox(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let owner = owner_from(&headers);
    let record = state.sandboxes.get(&id, &owner).await?;
    state.sandboxes.delete(&record).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    post,
    path = "/api/v1/sandboxes/{id}/stop",
    params(("id" = String, Path, description = "Sandbox id")),
    responses(
        (status = 200, description = "Compute reclaimed", body = SandboxResponse),
        (status = 404, description = "Unknown sandbox", body = ErrorBody)
    )
)]
async fn stop_sandbox(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<SandboxResponse>, ApiError> {
    let owner = owner_from(&headers);
    let record = state.sandboxes.get(&id, &owner).await?;
    state.sandboxes.stop(&record).await?;

    let (record, status) = state.sandboxes.get_with_status(&id, &owner).await?;
    Ok(Json(SandboxResponse::from_record(&record, status)))
}

#[utoipa::path(
    post,
    path = "/api/v1/sandboxes/{id}/extend_ttl",
    params(("id" = String, Path, description = "Sandbox id")),
    request_body = ExtendTtlBody,
    responses(
        (status = 200, description = "TTL extended", body = SandboxResponse),
        (status = 409, description = "Expired or infinite TTL", body = ErrorBody)
    )
)]
async fn extend_ttl(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(payload): Json<ExtendTtlBody>,
) -> Result<Json<SandboxResponse>, ApiError> {
    let owner = owner_from(&headers);
    let record = state
        .sandboxes
        .extend_ttl(&id, &owner, payload.extend_by)
        .await?;

    let session = state.sandboxes.get_current_session(&record).await?;
    let status = record.compute_status(chrono::Utc::now(), session.as_ref());
    Ok(Json(SandboxResponse::from_record(&record, status)))
}

#[utoipa::path(
    post,
    path = "/api/v1/sandboxes/{id}/keepalive",
    params(("id" = String, Path, description = "Sandbox id")),
    responses(
        (status = 204, description = "Idle deadline refreshed"),
        (status = 404, description = "Unknown sandbox", body = ErrorBody)
    )
)]
async fn keepalive(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let owner = owner_from(&headers);
    let record = state.sandboxes.get(&id, &owner).await?;
    state.sandboxes.keepalive(&record).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    post,
    path = "/api/v1/sandboxes/{id}/exec",
    params(("id" = String, Path, description = "Sandbox id")),
    request_body = ExecBody,
    responses(
        (status = 200, description = "Runtime response"),
        (status = 400, description = "Capability not declared by profile", body = ErrorBody),
        (status = 503, description = "Session starting, retry later", body = ErrorBody)
    )
)]
async fn exec_capability(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(payload): Json<ExecBody>,
) -> Result<Response, ApiError> {
    let owner = owner_from(&headers);
    let sandbox = state.sandboxes.get(&id, &owner).await?;
    let profile = state
        .sandboxes
        .profiles()
        .get(&sandbox.profile_id)
        .cloned()
        .ok_or_else(|| BayError::Validation(format!("invalid profile: {}", sandbox.profile_id)))?;

    // Capability enforcement happens before any compute is started.
    require_capability(&profile, &payload.capability)?;

    let session = state.sandboxes.ensure_running(&sandbox).await?;
    let resolved = resolve_endpoint(&profile, &session, &payload.capability)?;

    let path = payload
        .path
        .unwrap_or_else(|| format!("/{}", payload.capability));
    let url = format!("{}{}", resolved.endpoint.trim_end_matches('/'), path);

    let response = state
        .http
        .inner()
        .post(&url)
        .json(&payload.payload)
        .send()
        .await
        .map_err(|err| {
            BayError::Internal(anyhow!("runtime dispatch to {url} failed: {err}"))
        })?;

    let status =
        StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let body: Value = response.json().await.unwrap_or(Value::Null);

    state
        .sandboxes
        .session_manager()
        .touch(&session.id)
        .await?;

    Ok((status, Json(body)).into_response())
}

#[utoipa::path(
    post,
    path = "/api/v1/admin/gc/run",
    responses((status = 200, description = "One synchronous GC cycle", body = GcRunResponse))
)]
async fn run_gc(State(state): State<Arc<AppState>>) -> Json<GcRunResponse> {
    let report = state.gc.run_cycle().await;
    Json(GcRunResponse {
        idle_sessions: report.idle_sessions,
        expired_sandboxes: report.expired_sandboxes,
        orphan_containers: report.orphan_containers,
        orphan_workspaces: report.orphan_workspaces,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_env_accepts_common_spellings() {
        env::set_var("BAY_TEST_FLAG", "true");
        assert_eq!(bool_env("BAY_TEST_FLAG"), Some(true));
        env::set_var("BAY_TEST_FLAG", "0");
        assert_eq!(bool_env("BAY_TEST_FLAG"), Some(false));
        env::set_var("BAY_TEST_FLAG", "sideways");
        assert_eq!(bool_env("BAY_TEST_FLAG"), None);
        env::remove_var("BAY_TEST_FLAG");
        assert_eq!(bool_env("BAY_TEST_FLAG"), None);
    }

    #[test]
    fn owner_defaults_when_header_missing() {
        let headers = HeaderMap::new();
        assert_eq!(owner_from(&headers), "default");

        let mut headers = HeaderMap::new();
        headers.insert("x-bay-owner", HeaderValue::from_static("agent-7"));
        assert_eq!(owner_from(&headers), "agent-7");
    }

    #[test]
    fn error_codes_map_to_http_statuses() {
        assert_eq!(
            status_for(&BayError::NotFound("x".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&BayError::SandboxTtlInfinite {
                sandbox_id: "sandbox-1".into()
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&BayError::SessionNotReady {
                sandbox_id: "sandbox-1".into(),
                retry_after_ms: 1000
            }),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&BayError::CapabilityNotSupported {
                capability: "browser".into(),
                profile_id: "p".into(),
                available: vec![]
            }),
            StatusCode::BAD_REQUEST
        );
    }
}
