use crate::config::{EngineConfig, ServerConfig};
use crate::normalize::DocumentFormat;
use anyhow::{Context, Result};
use axum::{
    extract::{Query, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing::{error, info, warn};

const UPSTREAM_ACCEPT: &str = "application/vnd.google-earth.kml+xml, application/xml, text/xml";

pub struct AppState {
    pub config: ServerConfig,
    pub client: reqwest::Client,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("lotmap/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { config, client })
    }
}

#[derive(Deserialize)]
pub struct PublicParams {
    path: Option<String>,
}

#[derive(Deserialize)]
pub struct ProxyParams {
    url: Option<String>,
    path: Option<String>,
}

#[derive(Debug, Error)]
pub enum ServeError {
    #[error("parameter '{0}' is required")]
    MissingParam(&'static str),
    #[error("invalid path")]
    InvalidPath,
    #[error("document not found")]
    NotFound,
    #[error("document content is not valid {0}")]
    InvalidContent(&'static str),
    #[error("upstream answered {0}")]
    Upstream(StatusCode),
    #[error("failed to read document: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to fetch document: {0}")]
    Http(#[from] reqwest::Error),
}

impl ServeError {
    fn status(&self) -> StatusCode {
        match self {
            ServeError::MissingParam(_) | ServeError::InvalidPath | ServeError::InvalidContent(_) => {
                StatusCode::BAD_REQUEST
            }
            ServeError::NotFound => StatusCode::NOT_FOUND,
            ServeError::Upstream(status) => *status,
            ServeError::Io(_) | ServeError::Http(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServeError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "document request failed");
        } else {
            warn!(error = %self, %status, "document request rejected");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let public_dir = state.config.public_dir.clone();
    Router::new()
        .route("/api/kml/public", get(public_handler))
        .route("/api/kml", get(proxy_handler))
        .fallback_service(ServeDir::new(public_dir))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn start_server(config: EngineConfig) -> Result<()> {
    let port = config.server.port;
    let state = Arc::new(AppState::new(config.server)?);
    let addr = SocketAddr::from(([127, 0, 0, 1], port));

    info!(%addr, public_dir = ?state.config.public_dir, "starting document server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    axum::serve(listener, router(state)).await?;
    Ok(())
}

/// `requested` joined onto `root`, refusing anything that could climb out of it.
fn contained_path(root: &Path, requested: &str) -> Result<PathBuf, ServeError> {
    let relative = Path::new(requested.trim_start_matches('/'));
    let climbs = relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if climbs || relative.as_os_str().is_empty() {
        return Err(ServeError::InvalidPath);
    }
    Ok(root.join(relative))
}

async fn read_public(root: &Path, requested: &str) -> Result<(Vec<u8>, DocumentFormat), ServeError> {
    let path = contained_path(root, requested)?;
    let file = match tokio::fs::canonicalize(&path).await {
        Ok(p) => p,
        Err(_) => return Err(ServeError::NotFound),
    };
    // symlinks may still point outside
    let root = tokio::fs::canonicalize(root).await?;
    if !file.starts_with(&root) {
        return Err(ServeError::InvalidPath);
    }
    if !tokio::fs::metadata(&file).await?.is_file() {
        return Err(ServeError::NotFound);
    }

    let bytes = tokio::fs::read(&file).await?;
    let format = DocumentFormat::from_path(requested).unwrap_or(DocumentFormat::Kml);
    if !looks_like(format, &bytes) {
        return Err(ServeError::InvalidContent(format.name()));
    }
    Ok((bytes, format))
}

fn looks_like(format: DocumentFormat, bytes: &[u8]) -> bool {
    match format {
        DocumentFormat::Kml => {
            let text = String::from_utf8_lossy(bytes);
            text.contains("<?xml") || text.contains("<kml")
        }
        DocumentFormat::GeoJson => serde_json::from_slice::<serde_json::Value>(bytes).is_ok(),
    }
}

fn document_response(bytes: Vec<u8>, format: DocumentFormat, max_age: Option<u32>) -> Response {
    let mut response = (StatusCode::OK, bytes).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(format.content_type()));
    if let Some(max_age) = max_age {
        if let Ok(value) = HeaderValue::from_str(&format!("public, max-age={max_age}")) {
            headers.insert(header::CACHE_CONTROL, value);
        }
    }
    response
}

pub async fn public_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<PublicParams>,
) -> Result<Response, ServeError> {
    let requested = params.path.filter(|p| !p.is_empty()).ok_or(ServeError::MissingParam("path"))?;
    let (bytes, format) = read_public(&state.config.public_dir, &requested).await?;
    info!(path = %requested, bytes = bytes.len(), "serving public document");
    Ok(document_response(bytes, format, Some(state.config.cache_max_age_secs)))
}

/// `?url=` fetches a remote document server-side; `?path=` serves a local one.
pub async fn proxy_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ProxyParams>,
) -> Result<Response, ServeError> {
    let max_age = Some(state.config.cache_max_age_secs);

    if let Some(url) = params.url.filter(|u| !u.is_empty()) {
        let upstream = state
            .client
            .get(&url)
            .header(header::ACCEPT, UPSTREAM_ACCEPT)
            .send()
            .await?;
        let status = upstream.status();
        if !status.is_success() {
            let status = StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
            return Err(ServeError::Upstream(status));
        }
        let format = upstream
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(DocumentFormat::from_content_type)
            .or_else(|| DocumentFormat::from_path(&url))
            .unwrap_or(DocumentFormat::Kml);
        let bytes = upstream.bytes().await?;
        info!(%url, bytes = bytes.len(), "proxied remote document");
        return Ok(document_response(bytes.to_vec(), format, max_age));
    }

    let requested = params.path.filter(|p| !p.is_empty()).ok_or(ServeError::MissingParam("url"))?;
    let (bytes, format) = read_public(&state.config.public_dir, &requested).await?;
    Ok(document_response(bytes, format, max_age))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn state(dir: &TempDir) -> Arc<AppState> {
        let config = ServerConfig { public_dir: dir.path().to_path_buf(), ..ServerConfig::default() };
        Arc::new(AppState::new(config).unwrap())
    }

    fn public_dir() -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("kml/setores")).unwrap();
        fs::write(
            dir.path().join("kml/setores/setor-a.kml"),
            r#"<?xml version="1.0"?><kml><Document/></kml>"#,
        )
        .unwrap();
        fs::write(dir.path().join("kml/setores/broken.kml"), "not a map").unwrap();
        fs::write(dir.path().join("lotes.geojson"), r#"{"type":"FeatureCollection","features":[]}"#).unwrap();
        dir
    }

    async fn public(state: Arc<AppState>, path: Option<&str>) -> Response {
        let params = PublicParams { path: path.map(str::to_string) };
        match public_handler(State(state), Query(params)).await {
            Ok(r) => r,
            Err(e) => e.into_response(),
        }
    }

    #[tokio::test]
    async fn serves_kml_with_cache_headers() {
        let dir = public_dir();
        let resp = public(state(&dir), Some("/kml/setores/setor-a.kml")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "application/vnd.google-earth.kml+xml");
        assert_eq!(resp.headers()[header::CACHE_CONTROL], "public, max-age=3600");

        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert!(body.starts_with(b"<?xml"));
    }

    #[tokio::test]
    async fn geojson_gets_its_own_content_type() {
        let dir = public_dir();
        let resp = public(state(&dir), Some("/lotes.geojson")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "application/geo+json");
    }

    #[tokio::test]
    async fn rejects_bad_requests() {
        let dir = public_dir();
        let s = state(&dir);
        assert_eq!(public(s.clone(), None).await.status(), StatusCode::BAD_REQUEST);
        assert_eq!(public(s.clone(), Some("/../etc/passwd")).await.status(), StatusCode::BAD_REQUEST);
        assert_eq!(public(s.clone(), Some("/kml/missing.kml")).await.status(), StatusCode::NOT_FOUND);
        assert_eq!(public(s.clone(), Some("/kml/setores")).await.status(), StatusCode::NOT_FOUND);
        assert_eq!(public(s, Some("/kml/setores/broken.kml")).await.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn proxy_needs_url_or_path() {
        let dir = public_dir();
        let s = state(&dir);

        let err = proxy_handler(State(s.clone()), Query(ProxyParams { url: None, path: None }))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);

        let params = ProxyParams { url: None, path: Some("/kml/setores/setor-a.kml".into()) };
        let resp = proxy_handler(State(s), Query(params)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
