//! HTTP Surface
//!
//! Thin axum layer over the orchestrator. Every route is scoped to the
//! organization named in the `x-organization-id` header; handlers do no
//! scan logic of their own.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::providers::CloudCredential;
use crate::scan::aggregate;
use crate::scan::types::{CloudProvider, FindingStatus, Severity};
use crate::scan::{Orchestrator, ScanError, TicketBridge};

const ORG_HEADER: &str = "x-organization-id";

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub tickets: TicketBridge,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/scans", post(start_scan))
        .route("/api/scans/:id", get(scan_status))
        .route("/api/scans/:id/findings", get(scan_findings))
        .route("/api/scans/:id/frameworks", get(scan_frameworks))
        .route("/api/history", get(history))
        .route("/api/findings", get(org_findings))
        .route("/api/findings/:id/ticket", post(open_ticket))
        .route("/api/credentials", put(put_credential))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Request-level failure carrying the HTTP status for a `ScanError`.
struct ApiFailure(StatusCode, String);

impl From<ScanError> for ApiFailure {
    fn from(err: ScanError) -> Self {
        let status = match &err {
            ScanError::Conflict { .. } => StatusCode::CONFLICT,
            ScanError::ScanNotFound(_)
            | ScanError::FindingNotFound(_)
            | ScanError::CredentialNotFound(_) => StatusCode::NOT_FOUND,
            ScanError::CredentialResolution(_) | ScanError::TicketRejected(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            ScanError::AuthFailure(_) => StatusCode::BAD_GATEWAY,
            ScanError::Aggregation(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiFailure(status, err.to_string())
    }
}

impl IntoResponse for ApiFailure {
    fn into_response(self) -> Response {
        (self.0, Json(serde_json::json!({ "error": self.1 }))).into_response()
    }
}

fn organization(headers: &HeaderMap) -> Result<String, ApiFailure> {
    headers
        .get(ORG_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            ApiFailure(
                StatusCode::BAD_REQUEST,
                format!("missing {ORG_HEADER} header"),
            )
        })
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "posture-engine",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

#[derive(Deserialize)]
struct StartScanRequest {
    cloud_account_id: String,
    #[serde(default = "default_scan_type")]
    scan_type: String,
    framework_id: Option<String>,
}

fn default_scan_type() -> String {
    "full".to_string()
}

async fn start_scan(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<StartScanRequest>,
) -> Result<Response, ApiFailure> {
    let org = organization(&headers)?;
    let scan = state
        .orchestrator
        .start_scan(&org, &req.cloud_account_id, &req.scan_type, req.framework_id)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(scan)).into_response())
}

async fn scan_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiFailure> {
    let org = organization(&headers)?;
    let scan = state.orchestrator.status(&org, id).await?;
    Ok(Json(scan).into_response())
}

async fn scan_findings(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiFailure> {
    let org = organization(&headers)?;
    let scan = state.orchestrator.status(&org, id).await?;
    let findings = state.orchestrator.findings(&org, id).await?;
    Ok(Json(serde_json::json!({
        "findings": findings,
        "inconclusive_controls": scan.inconclusive_controls,
    }))
    .into_response())
}

async fn scan_frameworks(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiFailure> {
    let org = organization(&headers)?;
    let frameworks = state.orchestrator.frameworks(&org, id).await?;
    Ok(Json(frameworks).into_response())
}

#[derive(Deserialize)]
struct HistoryQuery {
    cloud_account_id: Option<String>,
    since: Option<chrono::DateTime<chrono::Utc>>,
}

async fn history(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HistoryQuery>,
) -> Result<Response, ApiFailure> {
    let org = organization(&headers)?;
    let mut rows = state
        .orchestrator
        .history(&org, query.cloud_account_id.as_deref())
        .await;
    if let Some(since) = query.since {
        rows.retain(|r| r.summary.started_at >= since);
    }
    Ok(Json(rows).into_response())
}

#[derive(Deserialize)]
struct FindingsQuery {
    framework_id: Option<String>,
    severity: Option<Severity>,
    status: Option<FindingStatus>,
}

async fn org_findings(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<FindingsQuery>,
) -> Result<Response, ApiFailure> {
    let org = organization(&headers)?;
    let mut findings = state.orchestrator.store().findings_for_org(&org).await;
    if let Some(framework_id) = &query.framework_id {
        findings.retain(|f| f.framework_ids.iter().any(|fw| fw == framework_id));
    }
    if let Some(severity) = query.severity {
        findings.retain(|f| f.severity == severity);
    }
    if let Some(status) = query.status {
        findings.retain(|f| f.status == status);
    }
    aggregate::sort_for_display(&mut findings);
    Ok(Json(findings).into_response())
}

async fn open_ticket(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiFailure> {
    let org = organization(&headers)?;
    let finding = state.orchestrator.store().get_finding(&org, id).await?;
    let ticket = state
        .tickets
        .open(&org, state.orchestrator.catalog(), &finding)
        .await?;
    Ok((StatusCode::CREATED, Json(ticket)).into_response())
}

#[derive(Deserialize)]
struct PutCredentialRequest {
    cloud_account_id: String,
    provider: CloudProvider,
    access_key_id: Option<String>,
    secret_access_key: Option<String>,
    role_arn: Option<String>,
    external_id: Option<String>,
    #[serde(default = "default_active")]
    is_active: bool,
}

fn default_active() -> bool {
    true
}

async fn put_credential(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<PutCredentialRequest>,
) -> Result<Response, ApiFailure> {
    let org = organization(&headers)?;
    let credential = CloudCredential {
        organization_id: org,
        cloud_account_id: req.cloud_account_id,
        provider: req.provider,
        access_key_id: req.access_key_id,
        secret_access_key: req.secret_access_key,
        role_arn: req.role_arn,
        external_id: req.external_id,
        is_active: req.is_active,
    };
    state.orchestrator.store().upsert_credential(credential).await;
    Ok(StatusCode::NO_CONTENT.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tower::ServiceExt;

    use crate::providers::{CloudApi, Resource, ResourceKind, SessionFactory};
    use crate::scan::error::ApiError;
    use crate::scan::{CheckRegistry, ControlCatalog, HarnessConfig, ScanStore};

    struct SlowApi;

    #[async_trait]
    impl CloudApi for SlowApi {
        fn provider(&self) -> CloudProvider {
            CloudProvider::Aws
        }

        fn account_id(&self) -> &str {
            "123456789012"
        }

        async fn list(&self, kind: ResourceKind) -> Result<Vec<Resource>, ApiError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(vec![Resource::new("r-1", kind, json!({}))])
        }
    }

    struct SlowFactory;

    #[async_trait]
    impl SessionFactory for SlowFactory {
        async fn open(
            &self,
            _credential: &CloudCredential,
        ) -> Result<Arc<dyn CloudApi>, ScanError> {
            Ok(Arc::new(SlowApi))
        }
    }

    fn app() -> Router {
        let orchestrator = Arc::new(Orchestrator::new(
            ScanStore::new(),
            CheckRegistry::builtin(),
            ControlCatalog::builtin(),
            Arc::new(SlowFactory),
            HarnessConfig::default(),
        ));
        router(AppState {
            orchestrator,
            tickets: TicketBridge::new(),
        })
    }

    fn request(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(ORG_HEADER, "org-1")
            .header("content-type", "application/json");
        match body {
            Some(v) => builder.body(Body::from(v.to_string())).unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn body_json(response: Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_needs_no_organization() {
        let response = app()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn missing_organization_header_is_rejected() {
        let response = app()
            .oneshot(
                Request::get("/api/history")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn scan_for_unregistered_account_is_404() {
        let response = app()
            .oneshot(request(
                "POST",
                "/api/scans",
                Some(json!({ "cloud_account_id": "acct-1" })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn scan_lifecycle_over_http() {
        let app = app();

        let response = app
            .clone()
            .oneshot(request(
                "PUT",
                "/api/credentials",
                Some(json!({
                    "cloud_account_id": "acct-1",
                    "provider": "aws",
                    "role_arn": "arn:aws:iam::123456789012:role/scanner",
                    "external_id": "ext-1",
                })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app
            .clone()
            .oneshot(request(
                "POST",
                "/api/scans",
                Some(json!({ "cloud_account_id": "acct-1" })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let scan = body_json(response).await;
        assert_eq!(scan["status"], "running");
        let scan_id = scan["id"].as_str().unwrap().to_string();

        // Same tuple while the first scan is still listing resources.
        let response = app
            .clone()
            .oneshot(request(
                "POST",
                "/api/scans",
                Some(json!({ "cloud_account_id": "acct-1" })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = app
            .clone()
            .oneshot(request("GET", &format!("/api/scans/{scan_id}"), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // Another organization cannot see the scan.
        let response = app
            .clone()
            .oneshot(
                Request::get(format!("/api/scans/{scan_id}"))
                    .header(ORG_HEADER, "org-2")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
