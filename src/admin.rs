use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::codec;
use crate::exclusion::{ExclusionSet, Exclusions};
use crate::proxy::ProxyClient;
use crate::queue::{Enqueued, Queue, QueueError};
use crate::record::ModuleVersion;
use crate::report::Reporter;
use crate::store::Store;
use crate::util::Scope;

pub struct AdminState {
    pub store: Arc<Store>,
    pub queue: Arc<dyn Queue>,
    pub exclusions: Arc<Exclusions>,
    pub proxy: Arc<ProxyClient>,
    pub reporter: Reporter,
    pub app_label: Arc<str>,
}

/// Admin and diagnostics surface. Authentication happens out of band (a
/// fronting proxy); handlers assume an operator.
pub fn router(state: Arc<AdminState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/enqueue", post(enqueue))
        .route("/exclude", post(exclude))
        .route("/status/*rest", get(status))
        .route("/debug/outcomes", get(outcomes))
        .route("/debug/module/*rest", get(debug_module))
        .route("/debug/latest/*module", get(debug_latest))
        .route("/debug/package/*rest", get(debug_package))
        .route("/debug/search", get(debug_search))
        .with_state(state)
}

pub async fn serve(
    addr: &str,
    state: Arc<AdminState>,
    shutdown: CancellationToken,
) -> color_eyre::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "admin server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

enum AdminError {
    BadRequest(String),
    NotAvailable,
    Busy,
    Internal(String),
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AdminError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            AdminError::NotAvailable => (StatusCode::NOT_FOUND, "not available".into()),
            AdminError::Busy => (StatusCode::SERVICE_UNAVAILABLE, "queue is full".into()),
            AdminError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, m),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<sqlx::Error> for AdminError {
    fn from(e: sqlx::Error) -> Self {
        AdminError::Internal(e.to_string())
    }
}

async fn healthz(State(state): State<Arc<AdminState>>) -> Response {
    if state.store.healthy().await {
        (StatusCode::OK, "ok").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "store unreachable").into_response()
    }
}

#[derive(Deserialize)]
struct EnqueueParams {
    module: String,
    version: Option<String>,
}

/// `POST /enqueue?module=M&version=V`: force one identity onto the queue.
/// Without a version the proxy's `@latest` resolution is used.
async fn enqueue(
    State(state): State<Arc<AdminState>>,
    Query(params): Query<EnqueueParams>,
) -> Result<Json<serde_json::Value>, AdminError> {
    let version = match params.version {
        Some(v) => v,
        None => {
            let scope = Scope::with_timeout(Duration::from_secs(30));
            state
                .proxy
                .latest(&params.module, &scope)
                .await
                .map_err(|e| AdminError::BadRequest(format!("cannot resolve @latest: {e}")))?
                .version
                .to_string()
        }
    };

    let id = ModuleVersion::new(&params.module, &version);
    let outcome = state
        .queue
        .enqueue(id.clone(), &state.app_label)
        .await
        .map_err(|e| match e {
            QueueError::Full => AdminError::Busy,
            QueueError::Backend(m) => AdminError::Internal(m),
        })?;

    Ok(Json(serde_json::json!({
        "module": id.module_path,
        "version": id.version,
        "outcome": match outcome {
            Enqueued::Enqueued => "enqueued",
            Enqueued::Deduped => "deduped",
        },
    })))
}

#[derive(Deserialize)]
struct ExcludeParams {
    prefix: String,
    reason: String,
    #[serde(default)]
    author: Option<String>,
}

/// `POST /exclude?prefix=P&reason=R`: append an exclusion and cascade a
/// delete of matching content, then refresh the cache immediately.
async fn exclude(
    State(state): State<Arc<AdminState>>,
    Query(params): Query<ExcludeParams>,
) -> Result<Json<serde_json::Value>, AdminError> {
    if params.prefix.is_empty() {
        return Err(AdminError::BadRequest("prefix is required".into()));
    }
    let author = params.author.as_deref().unwrap_or("admin");
    state
        .store
        .add_exclusion(&params.prefix, &params.reason, author)
        .await?;

    let entries = state.store.load_exclusions().await?;
    state.exclusions.replace(ExclusionSet::build(entries)).await;

    Ok(Json(serde_json::json!({ "excluded": params.prefix })))
}

/// `GET /status/{module...}/{version}`: current FetchStatus plus the
/// reporter's recent failures for the identity.
async fn status(
    State(state): State<Arc<AdminState>>,
    Path(rest): Path<String>,
) -> Result<Json<serde_json::Value>, AdminError> {
    let (module, version) = rest
        .rsplit_once('/')
        .ok_or_else(|| AdminError::BadRequest("expected /status/{module}/{version}".into()))?;

    let id = ModuleVersion::new(module, version);
    let status = state
        .store
        .get_status(&id)
        .await?
        .ok_or(AdminError::NotAvailable)?;

    let snapshot = state.reporter.snapshot().await;
    let history: Vec<_> = snapshot
        .recent_failures
        .into_iter()
        .filter(|f| f.module_path == id.module_path && f.version == id.version)
        .collect();

    Ok(Json(serde_json::json!({
        "status": status,
        "recent_failures": history,
    })))
}

async fn outcomes(State(state): State<Arc<AdminState>>) -> Json<serde_json::Value> {
    let snapshot = state.reporter.snapshot().await;
    Json(serde_json::to_value(&snapshot).unwrap_or_default())
}

fn split_module_version(rest: &str) -> Result<ModuleVersion, AdminError> {
    let (m, v) = rest
        .rsplit_once('/')
        .ok_or_else(|| AdminError::BadRequest("expected {module}/{version}".into()))?;
    Ok(ModuleVersion::new(m, v))
}

/// `GET /debug/module/{module...}/{version}`: the stored record, sans
/// binary blobs. Excluded or absent identities read as "not available".
async fn debug_module(
    State(state): State<Arc<AdminState>>,
    Path(rest): Path<String>,
) -> Result<Json<serde_json::Value>, AdminError> {
    let id = split_module_version(&rest)?;
    let record = state
        .store
        .get_module(&id)
        .await?
        .ok_or(AdminError::NotAvailable)?;

    Ok(Json(serde_json::json!({
        "module": record.id.module_path,
        "version": record.id.version,
        "commit_time": record.commit_time,
        "redistributable": record.redistributable,
        "has_go_mod": record.has_go_mod,
        "licenses": record.licenses,
        "source_info": record.source_info,
        "packages": record
            .packages
            .iter()
            .map(|p| serde_json::json!({
                "import_path": p.import_path,
                "name": p.name,
                "synopsis": p.synopsis,
                "symbols": p.exported_api.len(),
            }))
            .collect::<Vec<_>>(),
    })))
}

/// `GET /debug/latest/{module...}`: the LatestView pointer.
async fn debug_latest(
    State(state): State<Arc<AdminState>>,
    Path(module): Path<String>,
) -> Result<Json<serde_json::Value>, AdminError> {
    let latest = state
        .store
        .get_latest(&module)
        .await?
        .ok_or(AdminError::NotAvailable)?;
    Ok(Json(serde_json::json!({
        "module": latest.id.module_path,
        "version": latest.id.version,
        "packages": latest.packages.len(),
    })))
}

/// `GET /debug/package/{import_path...}/{version}`: one package with its
/// documentation blob decoded.
async fn debug_package(
    State(state): State<Arc<AdminState>>,
    Path(rest): Path<String>,
) -> Result<Json<serde_json::Value>, AdminError> {
    let (import_path, version) = rest
        .rsplit_once('/')
        .ok_or_else(|| AdminError::BadRequest("expected {import_path}/{version}".into()))?;
    let pkg = state
        .store
        .get_package(import_path, version)
        .await?
        .ok_or(AdminError::NotAvailable)?;

    let doc = if pkg.doc_source.is_empty() {
        None
    } else {
        Some(
            codec::decode_package(&pkg.doc_source)
                .map_err(|e| AdminError::Internal(format!("corrupt doc blob: {e}")))?,
        )
    };

    Ok(Json(serde_json::json!({
        "import_path": pkg.import_path,
        "name": pkg.name,
        "synopsis": pkg.synopsis,
        "imports": pkg.imports,
        "exported_api": pkg.exported_api,
        "doc": doc,
    })))
}

#[derive(Deserialize)]
struct SearchParams {
    q: String,
    #[serde(default = "default_search_limit")]
    limit: i64,
}

fn default_search_limit() -> i64 {
    20
}

/// `GET /debug/search?q=prefix`: the indexable columns search feeds on.
async fn debug_search(
    State(state): State<Arc<AdminState>>,
    Query(params): Query<SearchParams>,
) -> Result<Json<serde_json::Value>, AdminError> {
    let results = state
        .store
        .search_by_name(&params.q, params.limit.clamp(1, 200))
        .await?;
    Ok(Json(serde_json::json!({ "results": results })))
}

#[cfg(test)]
mod tests {
    #[test]
    fn status_path_split() {
        let rest = "github.com/user/repo/v1.2.3";
        let (m, v) = rest.rsplit_once('/').unwrap();
        assert_eq!(m, "github.com/user/repo");
        assert_eq!(v, "v1.2.3");
    }
}
