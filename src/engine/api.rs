//! HotPush API Module
//! Distribution endpoint: update checks, package downloads, install telemetry
//! and release administration

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, patch, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::engine::admin::{self, AdminError, PatchFields};
use crate::engine::audit::{AuditAction, AuditEntry, AuditLog};
use crate::engine::config::ServerConfig;
use crate::engine::packages::{PackageError, PackageStore};
use crate::engine::protocol::{
    CheckUpdateRequest, CheckUpdateResponse, InstallStatus, PromoteRequest, ReportInstallRequest,
    UpdateInfo, DEPLOYMENT_KEY_HEADER,
};
use crate::engine::publish::{PublishError, PublishOutcome, PublishRequest, Publisher};
use crate::engine::release::{
    JsonReleaseStore, Platform, Release, ReleaseStore, Scope, StoreError, DEFAULT_ENVIRONMENT,
};
use crate::engine::resolver::{Resolution, ResolveRequest, Resolver, RolloutSampler, ThreadRngSampler};

/// Room for the multipart framing and metadata fields around the package
const MULTIPART_OVERHEAD: usize = 1024 * 1024;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Missing deployment key")]
    AuthMissing,

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::AuthMissing => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Internal(message) => {
                error!(error = %message, "Request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::VersionNotFound { .. } | StoreError::EmptySource(_) => {
                ApiError::NotFound(e.to_string())
            }
            StoreError::InvalidScope(_) => ApiError::BadRequest(e.to_string()),
            StoreError::DuplicateVersion { .. } => ApiError::Conflict(e.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<AdminError> for ApiError {
    fn from(e: AdminError) -> Self {
        match e {
            AdminError::VersionNotFound { .. } | AdminError::EmptySource(_) => {
                ApiError::NotFound(e.to_string())
            }
            AdminError::InvalidField(_) | AdminError::EmptyPatch => {
                ApiError::BadRequest(e.to_string())
            }
            AdminError::Store(inner) => inner.into(),
        }
    }
}

impl From<PublishError> for ApiError {
    fn from(e: PublishError) -> Self {
        match e {
            PublishError::Store(inner) => inner.into(),
            PublishError::DuplicateVersion(_) => ApiError::Conflict(e.to_string()),
            PublishError::InvalidPackage(_)
            | PublishError::HashMismatch { .. }
            | PublishError::InvalidField(_) => ApiError::BadRequest(e.to_string()),
            PublishError::Package(_) | PublishError::Io(_) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<PackageError> for ApiError {
    fn from(e: PackageError) -> Self {
        match e {
            PackageError::NotFound(_) => ApiError::NotFound(e.to_string()),
            PackageError::Io(_) => ApiError::Internal(e.to_string()),
        }
    }
}

#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<dyn ReleaseStore>,
    pub packages: PackageStore,
    pub publisher: Publisher,
    pub sampler: Arc<dyn RolloutSampler>,
    pub audit: Option<Arc<AuditLog>>,
    /// Base URL used to build `downloadUrl`, without a trailing slash
    pub public_url: String,
    pub max_package_bytes: usize,
}

impl ApiState {
    pub fn new(
        store: Arc<dyn ReleaseStore>,
        packages: PackageStore,
        sampler: Arc<dyn RolloutSampler>,
        public_url: &str,
    ) -> Self {
        let publisher = Publisher::new(store.clone(), packages.clone(), 3);
        Self {
            store,
            packages,
            publisher,
            sampler,
            audit: None,
            public_url: public_url.trim_end_matches('/').to_string(),
            max_package_bytes: 256 * 1024 * 1024,
        }
    }

    pub fn with_audit(mut self, audit: Arc<AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn with_diff_history(mut self, diff_history: usize) -> Self {
        self.publisher = Publisher::new(self.store.clone(), self.packages.clone(), diff_history);
        self
    }

    /// File-backed state laid out as the config describes
    pub fn from_config(config: &ServerConfig) -> Result<Self, StoreError> {
        let store = Arc::new(JsonReleaseStore::open(&config.releases_dir())?);
        let packages = PackageStore::open(&config.packages_dir())?;
        let audit = Arc::new(AuditLog::open(&config.audit_log())?);

        let mut state = Self::new(store, packages, Arc::new(ThreadRngSampler), &config.public_url())
            .with_audit(audit)
            .with_diff_history(config.publish.diff_history);
        state.max_package_bytes = config.publish.max_package_bytes;
        Ok(state)
    }

    fn record(&self, entry: AuditEntry) {
        if let Some(audit) = &self.audit {
            if let Err(e) = audit.append(&entry) {
                warn!(error = %e, "Failed to write audit entry");
            }
        }
    }

    /// Best-effort statistics update
    fn bump_stats(&self, scope: &Scope, version: &str, edit: &mut dyn FnMut(&mut Release)) {
        if let Err(e) = self.store.mutate(scope, version, edit) {
            warn!(scope = %scope, version, error = %e, "Failed to update release stats");
        }
    }
}

pub fn create_router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    let body_limit = state.max_package_bytes.saturating_add(MULTIPART_OVERHEAD);

    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/check-update", post(check_update))
        .route("/api/packages/{reference}", get(download_package))
        .route("/api/report-install", post(report_install))
        .route("/api/releases", get(list_releases).post(publish_release))
        .route("/api/releases/promote", post(promote_releases))
        .route("/api/releases/{platform}/{version}", patch(patch_release))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(state: ApiState, addr: &str) -> std::io::Result<()> {
    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr, "Distribution endpoint listening");
    axum::serve(listener, app).await
}

fn deployment_key(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get(DEPLOYMENT_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or(ApiError::AuthMissing)
}

fn scope_for(key: &str, platform: Platform, environment: Option<&str>) -> Result<Scope, ApiError> {
    let environment = environment
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .unwrap_or(DEFAULT_ENVIRONMENT);
    let scope = Scope::new(key, platform).with_environment(environment);
    if !scope.environment_is_valid() {
        return Err(ApiError::BadRequest(format!(
            "invalid environment '{}'",
            environment
        )));
    }
    Ok(scope)
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Release store and package lookups block; keep them off the async workers
async fn blocking<T, F>(work: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, ApiError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
}

async fn check_update(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(request): Json<CheckUpdateRequest>,
) -> Result<Json<CheckUpdateResponse>, ApiError> {
    let key = deployment_key(&headers)?;
    let scope = scope_for(&key, request.platform, request.environment.as_deref())?;
    let response = blocking(move || offer_update(&state, &scope, &request)).await?;
    Ok(Json(response))
}

fn offer_update(
    state: &ApiState,
    scope: &Scope,
    request: &CheckUpdateRequest,
) -> Result<CheckUpdateResponse, ApiError> {
    let resolver = Resolver::new(state.store.as_ref(), state.sampler.as_ref());
    let resolution = resolver.resolve(
        scope,
        &ResolveRequest {
            current_version: &request.current_version,
            host_binary_version: request.app_version.as_deref(),
        },
    )?;

    let offer = match resolution {
        Resolution::NoUpdate => return Ok(CheckUpdateResponse::no_update()),
        Resolution::Update(offer) => offer,
    };
    let release = &offer.release;

    // Fall back to the full package if the delta file has gone missing or the
    // client has no base tree to apply it to
    let delta = if offer.is_diff && !request.full_package_only {
        match (
            PackageStore::digest_of(&offer.package_reference),
            state.packages.size_of(&offer.package_reference),
        ) {
            (Some(digest), Ok(size)) => Some((digest.to_string(), size)),
            (_, Err(e)) => {
                warn!(reference = %offer.package_reference, error = %e, "Delta package unavailable");
                None
            }
            (None, Ok(_)) => None,
        }
    } else {
        None
    };
    let (reference, hash, size, is_diff) = match delta {
        Some((digest, size)) => (offer.package_reference.as_str(), digest, size, true),
        None => (
            release.package_reference.as_str(),
            release.content_hash.clone(),
            release.size_bytes,
            false,
        ),
    };

    let download_url = reqwest::Url::parse_with_params(
        &format!("{}/api/packages/{}", state.public_url, reference),
        &[
            ("platform", scope.platform.as_str()),
            ("version", release.version.as_str()),
            ("environment", scope.environment.as_str()),
        ],
    )
    .map_err(|e| ApiError::Internal(format!("invalid public URL: {}", e)))?;

    state.bump_stats(scope, &release.version, &mut |r| r.stats.checks += 1);
    info!(
        scope = %scope,
        from = %request.current_version,
        to = %release.version,
        is_diff,
        "Offering update"
    );

    Ok(CheckUpdateResponse::available(UpdateInfo {
        version: release.version.clone(),
        download_url: download_url.to_string(),
        hash,
        size,
        description: release.description.clone(),
        mandatory: release.mandatory,
        is_diff,
    }))
}

#[derive(Debug, Deserialize)]
struct DownloadParams {
    platform: Option<Platform>,
    version: Option<String>,
    environment: Option<String>,
}

async fn download_package(
    State(state): State<ApiState>,
    Path(reference): Path<String>,
    Query(params): Query<DownloadParams>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let path = state
        .packages
        .path_for(&reference)
        .ok_or_else(|| ApiError::NotFound(format!("Package not found: {}", reference)))?;
    let bytes = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ApiError::NotFound(format!("Package not found: {}", reference)))
        }
        Err(e) => return Err(ApiError::Internal(e.to_string())),
    };

    // Downloads are only attributed when the client identifies itself
    if let (Ok(key), Some(platform), Some(version)) =
        (deployment_key(&headers), params.platform, params.version.as_deref())
    {
        if let Ok(scope) = scope_for(&key, platform, params.environment.as_deref()) {
            let version = version.to_string();
            blocking(move || {
                state.bump_stats(&scope, &version, &mut |r| r.stats.downloads += 1);
                Ok(())
            })
            .await?;
        }
    }

    Ok(([(header::CONTENT_TYPE, "application/zip")], bytes).into_response())
}

async fn report_install(
    State(state): State<ApiState>,
    Json(report): Json<ReportInstallRequest>,
) -> Result<StatusCode, ApiError> {
    let key = report.deployment_key.trim();
    if key.is_empty() {
        return Err(ApiError::AuthMissing);
    }
    let scope = scope_for(key, report.platform, report.environment.as_deref())?;
    let status = report.status;

    let store = state.store.clone();
    let (record_scope, version) = (scope.clone(), report.version.clone());
    blocking(move || {
        store.mutate(&record_scope, &version, &mut |r| match status {
            InstallStatus::Success => r.stats.installs += 1,
            InstallStatus::Failure => r.stats.failures += 1,
        })?;
        Ok(())
    })
    .await?;
    info!(scope = %scope, version = %report.version, status = ?status, "Install reported");
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Deserialize)]
struct ScopeParams {
    platform: Platform,
    environment: Option<String>,
}

async fn list_releases(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(params): Query<ScopeParams>,
) -> Result<Json<Vec<Release>>, ApiError> {
    let key = deployment_key(&headers)?;
    let scope = scope_for(&key, params.platform, params.environment.as_deref())?;
    let releases = blocking(move || Ok(state.store.list(&scope)?)).await?;
    Ok(Json(releases))
}

fn field_text(name: &str, value: &str) -> Result<bool, ApiError> {
    match value.trim() {
        "true" | "1" => Ok(true),
        "false" | "0" | "" => Ok(false),
        other => Err(ApiError::BadRequest(format!(
            "field '{}' must be a boolean, got '{}'",
            name, other
        ))),
    }
}

async fn publish_release(
    State(state): State<ApiState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<PublishOutcome>), ApiError> {
    let key = deployment_key(&headers)?;

    let mut package: Option<Vec<u8>> = None;
    let mut version: Option<String> = None;
    let mut platform: Option<Platform> = None;
    let mut environment: Option<String> = None;
    let mut request = PublishRequest::new("", Vec::new());

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        if name == "package" {
            let bytes = field
                .bytes()
                .await
                .map_err(|e| ApiError::BadRequest(e.to_string()))?;
            package = Some(bytes.to_vec());
            continue;
        }

        let value = field
            .text()
            .await
            .map_err(|e| ApiError::BadRequest(e.to_string()))?;
        match name.as_str() {
            "version" => version = Some(value),
            "platform" => {
                platform = Some(
                    value
                        .parse::<Platform>()
                        .map_err(|e| ApiError::BadRequest(e.to_string()))?,
                )
            }
            "environment" => environment = Some(value),
            "hash" if !value.trim().is_empty() => request.hash = Some(value.trim().to_string()),
            "description" => request.description = value,
            "mandatory" => request.mandatory = field_text("mandatory", &value)?,
            "rollout" => {
                request.rollout = value.trim().parse().map_err(|_| {
                    ApiError::BadRequest(format!("field 'rollout' must be an integer, got '{}'", value))
                })?
            }
            "targetBinaryVersion" if !value.trim().is_empty() => {
                request.target_binary_version = value
            }
            _ => {}
        }
    }

    let package = package.ok_or_else(|| ApiError::BadRequest("missing field 'package'".into()))?;
    let version = version.ok_or_else(|| ApiError::BadRequest("missing field 'version'".into()))?;
    let platform =
        platform.ok_or_else(|| ApiError::BadRequest("missing field 'platform'".into()))?;
    let scope = scope_for(&key, platform, environment.as_deref())?;
    request.version = version;
    request.package = package;

    let publisher = state.publisher.clone();
    let publish_scope = scope.clone();
    let outcome = blocking(move || Ok(publisher.publish(&publish_scope, request)?)).await?;

    state.record(
        AuditEntry::new(AuditAction::Publish, &scope, &outcome.release.version).with_details(
            json!({
                "contentHash": outcome.release.content_hash,
                "deltas": outcome.deltas.len(),
            }),
        ),
    );
    Ok((StatusCode::CREATED, Json(outcome)))
}

#[derive(Debug, Deserialize)]
struct EnvironmentParams {
    environment: Option<String>,
}

async fn patch_release(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path((platform, version)): Path<(Platform, String)>,
    Query(params): Query<EnvironmentParams>,
    Json(fields): Json<PatchFields>,
) -> Result<Json<Release>, ApiError> {
    let key = deployment_key(&headers)?;
    let scope = scope_for(&key, platform, params.environment.as_deref())?;

    let store = state.store.clone();
    let (patch_scope, patch_fields) = (scope.clone(), fields.clone());
    let release =
        blocking(move || Ok(admin::patch(store.as_ref(), &patch_scope, &version, &patch_fields)?))
            .await?;
    let details = serde_json::to_value(&fields).ok();
    let mut entry = AuditEntry::new(AuditAction::Patch, &scope, &release.version);
    if let Some(details) = details {
        entry = entry.with_details(details);
    }
    state.record(entry);
    Ok(Json(release))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PromoteResult {
    pub platform: Platform,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub release: Option<Release>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PromoteResponse {
    pub results: Vec<PromoteResult>,
}

async fn promote_releases(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(request): Json<PromoteRequest>,
) -> Result<Json<PromoteResponse>, ApiError> {
    let key = deployment_key(&headers)?;
    if request.platforms.is_empty() {
        return Err(ApiError::BadRequest("no platforms given".to_string()));
    }
    // Validates both environment names up front
    scope_for(&key, request.platforms[0], Some(&request.from))?;
    scope_for(&key, request.platforms[0], Some(&request.to))?;

    let store = state.store.clone();
    let (promote_key, promote) = (key.clone(), request.clone());
    let outcomes = blocking(move || {
        Ok(admin::promote_platforms(
            store.as_ref(),
            &promote_key,
            &promote.platforms,
            &promote.from,
            &promote.to,
            promote.rollout,
        ))
    })
    .await?;

    let results = outcomes
        .into_iter()
        .map(|outcome| match outcome.result {
            Ok(release) => {
                let target = Scope::new(&key, outcome.platform).with_environment(&request.to);
                state.record(
                    AuditEntry::new(AuditAction::Promote, &target, &release.version)
                        .with_details(json!({ "from": request.from })),
                );
                PromoteResult {
                    platform: outcome.platform,
                    success: true,
                    release: Some(release),
                    error: None,
                }
            }
            Err(e) => {
                warn!(platform = %outcome.platform, error = %e, "Promote failed");
                PromoteResult {
                    platform: outcome.platform,
                    success: false,
                    release: None,
                    error: Some(e.to_string()),
                }
            }
        })
        .collect();

    Ok(Json(PromoteResponse { results }))
}
