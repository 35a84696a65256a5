use crate::accounts::AccountStore;
use crate::balancer::LoadBalancer;
use crate::client::OrchidsClient;
use crate::config::{AdminCredentials, SessionCredentials, UpstreamEndpoints, env_non_empty};
use crate::error::{AppError, AppResult};
use axum::Router;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use std::path::PathBuf;
use std::sync::{Arc, Once, OnceLock};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<RuntimeConfig>,
    pub http: reqwest::Client,
    pub metrics: PrometheusHandle,
    pub endpoints: Arc<UpstreamEndpoints>,
    pub account_store: AccountStore,
    pub balancer: LoadBalancer,
    pub static_client: Option<OrchidsClient>,
}

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static METRICS_ERROR: OnceLock<AppError> = OnceLock::new();
static METRICS_INIT: Once = Once::new();

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub listen: String,
    pub metrics_path: String,
    pub database_dsn: String,
    pub admin_path: String,
    pub endpoints: UpstreamEndpoints,
    pub static_credentials: Option<SessionCredentials>,
    pub admin: Option<AdminCredentials>,
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let listen = env_non_empty("ORCHIDS_LISTEN")
            .or_else(|| env_non_empty("PORT").map(|port| format!("0.0.0.0:{}", port.trim())))
            .unwrap_or_else(|| "0.0.0.0:3002".to_string());
        let metrics_path =
            env_non_empty("ORCHIDS_METRICS_PATH").unwrap_or_else(|| "/metrics".to_string());
        let admin_path = env_non_empty("ADMIN_PATH").unwrap_or_else(|| "/api".to_string());

        let mut endpoints = UpstreamEndpoints::default();
        if let Some(url) = env_non_empty("ORCHIDS_CLERK_BASE_URL") {
            endpoints.clerk_base_url = url;
        }
        if let Some(url) = env_non_empty("ORCHIDS_AGENT_URL") {
            endpoints.agent_url = url;
        }
        if let Some(ms) = env_non_empty("ORCHIDS_UPSTREAM_TIMEOUT_MS").and_then(|v| v.parse().ok())
        {
            endpoints.timeout_ms = ms;
        }

        Self {
            listen,
            metrics_path,
            database_dsn: resolve_database_dsn(),
            admin_path,
            endpoints,
            static_credentials: SessionCredentials::from_env(),
            admin: AdminCredentials::from_env(),
        }
    }
}

pub async fn load_state() -> AppResult<AppState> {
    load_state_with_runtime(RuntimeConfig::from_env()).await
}

pub async fn load_state_with_runtime(runtime: RuntimeConfig) -> AppResult<AppState> {
    let http = reqwest::Client::builder()
        .user_agent("orchids-gateway/0.1")
        .build()
        .map_err(|err| AppError::internal("http_client_init_failed", err.to_string()))?;

    ensure_sqlite_file(&runtime.database_dsn)
        .map_err(|err| AppError::internal("database_init_failed", err))?;

    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(
            runtime
                .database_dsn
                .parse::<sqlx::sqlite::SqliteConnectOptions>()
                .map_err(|err| AppError::internal("database_dsn_parse_failed", err.to_string()))?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .busy_timeout(std::time::Duration::from_secs(5)),
        )
        .await
        .map_err(|err| AppError::internal("database_init_failed", err.to_string()))?;

    let account_store = AccountStore::new(pool)
        .await
        .map_err(|err| AppError::internal("account_store_init_failed", err))?;
    let balancer = LoadBalancer::new(Arc::new(account_store.clone()));

    let endpoints = Arc::new(runtime.endpoints.clone());
    let static_client = runtime
        .static_credentials
        .clone()
        .map(|creds| OrchidsClient::new(http.clone(), endpoints.clone(), creds));
    if let Some(creds) = &runtime.static_credentials {
        tracing::info!(session_id = %creds.session_id, "static upstream credentials configured");
    }
    if runtime.admin.is_none() {
        tracing::info!("ADMIN_USER/ADMIN_PASS not set, admin api disabled");
    }

    let metrics = init_metrics()?;

    Ok(AppState {
        runtime: Arc::new(runtime),
        http,
        metrics,
        endpoints,
        account_store,
        balancer,
        static_client,
    })
}

fn init_metrics() -> AppResult<PrometheusHandle> {
    METRICS_INIT.call_once(|| {
        match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                let _ = METRICS_HANDLE.set(handle);
            }
            Err(err) => {
                let _ = METRICS_ERROR.set(AppError::internal(
                    "metrics_init_failed",
                    err.to_string(),
                ));
            }
        }
    });

    if let Some(err) = METRICS_ERROR.get() {
        return Err(err.clone());
    }
    METRICS_HANDLE
        .get()
        .cloned()
        .ok_or_else(|| AppError::internal("metrics_init_failed", "metrics recorder not available"))
}

fn resolve_database_dsn() -> String {
    env_non_empty("ORCHIDS_DATABASE_DSN")
        .or_else(|| env_non_empty("DATABASE_URL"))
        .unwrap_or_else(|| "sqlite://./data/orchids.db".to_string())
}

fn ensure_sqlite_file(dsn: &str) -> Result<(), String> {
    let dsn = dsn.trim();
    if !dsn.starts_with("sqlite://") {
        return Ok(());
    }
    if dsn.contains(":memory:") || dsn.contains("mode=memory") {
        return Ok(());
    }
    let path_part = dsn.trim_start_matches("sqlite://");
    let path_part = path_part.split('?').next().unwrap_or("");
    if path_part.is_empty() {
        return Ok(());
    }
    let path = PathBuf::from(path_part);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|err| format!("sqlite_dir_create_failed: {err}"))?;
        }
    }
    if !path.exists() {
        std::fs::File::create(&path).map_err(|err| format!("sqlite_file_create_failed: {err}"))?;
    }
    Ok(())
}

pub fn build_app(state: AppState) -> Router {
    let metrics_path = state.runtime.metrics_path.clone();
    let admin_path = normalize_prefix(&state.runtime.admin_path);
    Router::<AppState>::new()
        .merge(build_openai_router(&metrics_path))
        .nest(&admin_path, build_admin_router())
        .with_state(state)
        .layer(SetRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
            MakeRequestUuid,
        ))
        .layer(PropagateRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
        ))
        .layer(TraceLayer::new_for_http())
}

fn normalize_prefix(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return "/api".to_string();
    }
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

fn build_openai_router(metrics_path: &str) -> Router<AppState> {
    Router::new()
        .route("/v1/models", get(crate::handlers::list_models))
        .route(
            "/v1/chat/completions",
            post(crate::handlers::create_chat_completions),
        )
        .route(
            "/v1/images/generations",
            post(crate::handlers::create_image_generation),
        )
        .route(
            "/v1/videos/generations",
            post(crate::handlers::create_video_generation),
        )
        .route(metrics_path, get(crate::handlers::metrics))
}

fn build_admin_router() -> Router<AppState> {
    Router::new()
        .route(
            "/accounts",
            get(crate::admin::list_accounts).post(crate::admin::create_account),
        )
        .route("/accounts/export", get(crate::admin::export_accounts))
        .route("/accounts/import", post(crate::admin::import_accounts))
        .route(
            "/accounts/{id}",
            get(crate::admin::get_account)
                .put(crate::admin::update_account)
                .delete(crate::admin::delete_account),
        )
}
