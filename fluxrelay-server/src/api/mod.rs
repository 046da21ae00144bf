//! HTTP API endpoints (InfluxDB 1.x compatible)

use axum::{
    extract::{DefaultBodyLimit, Query, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    middleware,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Form, Router,
};
use base64::Engine;
use bytes::Bytes;
use fluxrelay_core::auth::User;
use fluxrelay_core::config::MAX_WRITE_BODY;
use fluxrelay_core::launcher::Launcher;
use fluxrelay_core::query::QueryRequest;
use fluxrelay_core::tsdb::{QueryResponse, WriteRequest};
use fluxrelay_core::write::decode_body;
use fluxrelay_core::RelayError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::debug;

/// Application state
pub type AppState = Arc<Launcher>;

/// Header marking responses produced by the coordinator
pub const VERSION_HEADER: &str = "x-influxdb-version";

/// Create the API router
pub fn create_router(launcher: Arc<Launcher>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ping", get(ping).head(ping))
        .route("/write", post(write))
        .route("/query", get(query_get).post(query_post))
        .layer(DefaultBodyLimit::max(MAX_WRITE_BODY))
        .layer(middleware::map_response(mark_relay))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(launcher)
}

async fn mark_relay(mut response: Response) -> Response {
    response
        .headers_mut()
        .insert(HeaderName::from_static(VERSION_HEADER), HeaderValue::from_static("relay"));
    response
}

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct WriteParams {
    db: Option<String>,
    rp: Option<String>,
    precision: Option<String>,
    u: Option<String>,
    p: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct QueryParams {
    db: Option<String>,
    q: Option<String>,
    epoch: Option<String>,
    u: Option<String>,
    p: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PingParams {
    verbose: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PingResponse {
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// A core error rendered as `{"error": "..."}` with its status
pub struct ApiError(RelayError);

impl From<RelayError> for ApiError {
    fn from(e: RelayError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        debug!(status = status.as_u16(), error = %self.0, "request failed");
        (status, Json(ErrorResponse { error: self.0.to_string() })).into_response()
    }
}

// ============================================================================
// Credentials
// ============================================================================

/// `u`/`p` parameters, else HTTP basic auth
fn credentials(u: Option<&str>, p: Option<&str>, headers: &HeaderMap) -> Option<(String, String)> {
    if let Some(user) = u {
        return Some((user.to_string(), p.unwrap_or_default().to_string()));
    }
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ").or_else(|| value.strip_prefix("basic "))?;
    let decoded = base64::engine::general_purpose::STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}

fn authenticate(launcher: &Launcher, u: Option<&str>, p: Option<&str>, headers: &HeaderMap) -> Result<Option<User>, ApiError> {
    let creds = credentials(u, p, headers);
    Ok(launcher.authenticate(creds.as_ref().map(|(u, p)| (u.as_str(), p.as_str())))?)
}

// ============================================================================
// Handlers
// ============================================================================

async fn ping(State(launcher): State<AppState>, Query(params): Query<PingParams>) -> Result<Response, ApiError> {
    let version = launcher.ping().await?;
    let verbose = matches!(params.verbose.as_deref(), Some("true") | Some("1"));
    if verbose {
        Ok((StatusCode::OK, Json(PingResponse { version })).into_response())
    } else {
        Ok(StatusCode::NO_CONTENT.into_response())
    }
}

async fn write(
    State(launcher): State<AppState>,
    Query(params): Query<WriteParams>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let user = authenticate(&launcher, params.u.as_deref(), params.p.as_deref(), &headers)?;
    let database = params
        .db
        .filter(|db| !db.is_empty())
        .ok_or_else(|| RelayError::BadRequest("database is required".into()))?;
    let encoding = headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok());
    let body = decode_body(body, encoding, MAX_WRITE_BODY)?;

    let mut request = WriteRequest::new(database, body);
    if let Some(rp) = params.rp {
        request = request.with_retention_policy(rp);
    }
    if let Some(precision) = params.precision {
        request = request.with_precision(precision);
    }
    launcher.write(&request, user.as_ref()).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn query_get(
    State(launcher): State<AppState>,
    Query(params): Query<QueryParams>,
    headers: HeaderMap,
) -> Result<Json<QueryResponse>, ApiError> {
    run_query(&launcher, params, &headers).await
}

/// Parameters may come in the URL or a form body; the body wins
async fn query_post(
    State(launcher): State<AppState>,
    Query(url): Query<QueryParams>,
    headers: HeaderMap,
    form: Option<Form<QueryParams>>,
) -> Result<Json<QueryResponse>, ApiError> {
    let form = form.map(|Form(f)| f).unwrap_or_default();
    let params = QueryParams {
        db: form.db.or(url.db),
        q: form.q.or(url.q),
        epoch: form.epoch.or(url.epoch),
        u: form.u.or(url.u),
        p: form.p.or(url.p),
    };
    run_query(&launcher, params, &headers).await
}

async fn run_query(launcher: &Launcher, params: QueryParams, headers: &HeaderMap) -> Result<Json<QueryResponse>, ApiError> {
    let user = authenticate(launcher, params.u.as_deref(), params.p.as_deref(), headers)?;
    let query = params
        .q
        .filter(|q| !q.trim().is_empty())
        .ok_or_else(|| RelayError::BadRequest("missing required parameter \"q\"".into()))?;
    let request = QueryRequest {
        database: params.db.unwrap_or_default(),
        query,
        epoch: params.epoch,
        user,
    };
    Ok(Json(launcher.query(&request).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use fluxrelay_core::launcher::ClusterConfig;
    use fluxrelay_core::meta::MemoryMetaStore;
    use fluxrelay_core::tsdb::MemoryCluster;
    use tempfile::TempDir;
    use tower::ServiceExt;

    async fn app(dir: &TempDir, auth_enabled: bool) -> (Router, Arc<Launcher>, Arc<MemoryCluster>) {
        let cluster = Arc::new(MemoryCluster::new());
        let config = ClusterConfig {
            node_name: "n1".into(),
            data_location: "n1:8086".into(),
            recovery_dir: dir.path().to_path_buf(),
            virtual_tokens: 4,
            auth_enabled,
            ..Default::default()
        };
        let launcher = Arc::new(
            Launcher::start(config, Arc::new(MemoryMetaStore::new()), cluster.clone())
                .await
                .unwrap(),
        );
        (create_router(launcher.clone()), launcher, cluster)
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_basic_credentials() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic Ym9iOnB3"));
        assert_eq!(credentials(None, None, &headers), Some(("bob".into(), "pw".into())));
        assert_eq!(
            credentials(Some("amy"), Some("x"), &headers),
            Some(("amy".into(), "x".into()))
        );
        assert_eq!(credentials(None, None, &HeaderMap::new()), None);
    }

    #[tokio::test]
    async fn test_ping() {
        let dir = TempDir::new().unwrap();
        let (app, launcher, _) = app(&dir, false).await;
        let response = app
            .clone()
            .oneshot(Request::get("/ping").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(response.headers()[VERSION_HEADER], "relay");

        let response = app
            .oneshot(Request::get("/ping?verbose=true").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_json(response).await["version"].is_string());
        launcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_write_accepts_large_batches() {
        let dir = TempDir::new().unwrap();
        let (app, launcher, cluster) = app(&dir, false).await;
        launcher
            .query(&QueryRequest {
                database: "db".into(),
                query: "CREATE DATABASE db".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        // past the 2MB default of the HTTP framework
        let body = format!("log,host=a msg=\"{}\" 10", "x".repeat(3 * 1024 * 1024));
        let response = app
            .oneshot(Request::post("/write?db=db").body(Body::from(body)).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(cluster.get("n1:8086").points("db").len(), 1);
        launcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_write_and_query() {
        let dir = TempDir::new().unwrap();
        let (app, launcher, cluster) = app(&dir, false).await;

        let response = app
            .clone()
            .oneshot(
                Request::post("/query")
                    .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .body(Body::from("q=CREATE+DATABASE+db"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(
                Request::post("/write?db=db&precision=s")
                    .body(Body::from("cpu,host=a value=1 10"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(cluster.get("n1:8086").points("db")[0].timestamp, 10_000_000_000);

        let response = app
            .clone()
            .oneshot(
                Request::get("/query?db=db&epoch=s&q=SELECT%20value%20FROM%20cpu")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["results"][0]["series"][0]["values"][0], serde_json::json!([10, 1.0]));

        let response = app
            .oneshot(Request::post("/write").body(Body::from("cpu value=1")).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_json(response).await["error"].is_string());
        launcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_auth_required() {
        let dir = TempDir::new().unwrap();
        let (app, launcher, _) = app(&dir, true).await;

        let response = app
            .clone()
            .oneshot(
                Request::get("/query?q=SHOW%20DATABASES")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(
                Request::get("/query?q=CREATE%20USER%20root%20WITH%20PASSWORD%20'pw'%20WITH%20ALL%20PRIVILEGES")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(Request::post("/write?db=db").body(Body::from("cpu value=1")).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .oneshot(
                Request::get("/query?q=SHOW%20NODES&u=root&p=wrong")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        launcher.shutdown().await;
    }
}
