use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use tracing::debug;
use url::Url;

use crate::config::{EngineConfig, OriginConfig};
use crate::error::LayerError;
use crate::normalize::{normalize, DocumentFormat, NormalizeReport};
use crate::resolver::{parse_upload_response, DocumentHost};

const KML_ACCEPT: &str =
    "application/vnd.google-earth.kml+xml, application/geo+json, application/json, application/xml, text/xml";

#[derive(Debug, Clone)]
pub struct FetchedDocument {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

#[async_trait]
pub trait DocumentFetcher: Send + Sync {
    async fn get(&self, uri: &str) -> Result<FetchedDocument, LayerError>;
}

/// URI the engine actually GETs for a resolved document: same-origin URIs
/// are used as they are, anything else goes through the proxy route as `url=`.
pub fn retrieval_uri(origin: &OriginConfig, document_uri: &str) -> String {
    let base = origin.base_url.trim_end_matches('/');
    if same_origin(base, document_uri) {
        return document_uri.to_string();
    }
    let proxy = format!("{base}{}", origin.proxy_route);
    match Url::parse_with_params(&proxy, &[("url", document_uri)]) {
        Ok(url) => url.to_string(),
        Err(_) => format!("{proxy}?url={document_uri}"),
    }
}

/// Scheme, host and port all match; a shared string prefix is not enough.
fn same_origin(base: &str, document_uri: &str) -> bool {
    match (Url::parse(base), Url::parse(document_uri)) {
        (Ok(base), Ok(doc)) => base.origin() == doc.origin(),
        _ => false,
    }
}

/// Fetch + format detection + normalization, bounded by `timeout`.
pub async fn load_document(
    fetcher: &dyn DocumentFetcher,
    uri: &str,
    timeout: Duration,
    source_key: &str,
) -> Result<NormalizeReport, LayerError> {
    let doc = tokio::time::timeout(timeout, fetcher.get(uri))
        .await
        .map_err(|_| LayerError::FetchTimeout { uri: uri.to_string(), after: timeout })??;

    let format = doc
        .content_type
        .as_deref()
        .and_then(DocumentFormat::from_content_type)
        .or_else(|| DocumentFormat::from_path(uri))
        .or_else(|| DocumentFormat::sniff(&doc.bytes))
        .ok_or_else(|| LayerError::Parse {
            format: "unknown",
            reason: format!("cannot tell the document format of {uri:?}"),
        })?;

    debug!(key = source_key, uri, format = format.name(), bytes = doc.bytes.len(), "document fetched");
    normalize(&doc.bytes, format, source_key)
}

/// reqwest-backed implementation of both the document host and fetcher.
pub struct HttpDocumentHost {
    client: reqwest::Client,
    origin: OriginConfig,
    upload_endpoint: String,
}

impl HttpDocumentHost {
    pub fn new(config: &EngineConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("lotmap/", env!("CARGO_PKG_VERSION")))
            .timeout(config.loader.fetch_timeout())
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()?;
        Ok(Self {
            client,
            origin: config.origin.clone(),
            upload_endpoint: config.upload.endpoint.clone(),
        })
    }
}

#[async_trait]
impl DocumentHost for HttpDocumentHost {
    async fn probe(&self, uri: &str) -> bool {
        match self.client.head(uri).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!(uri, error = %e, "probe failed");
                false
            }
        }
    }

    async fn fetch_raw(&self, path: &str) -> Result<Vec<u8>, LayerError> {
        let uri = format!("{}{}", self.origin.base_url.trim_end_matches('/'), path);
        let fetched = self.get(&uri).await?;
        Ok(fetched.bytes)
    }

    async fn upload(&self, file_name: &str, bytes: Vec<u8>) -> Result<String, LayerError> {
        let part = Part::bytes(bytes)
            .file_name(file_name.to_string())
            .mime_str(DocumentFormat::Kml.content_type())
            .map_err(|e| LayerError::Upload(e.to_string()))?;
        let form = Form::new()
            .text("uid", "kmlviewer-")
            .text("title", file_name.to_string())
            .part("file1", part)
            .text("usespecdir", "ok")
            .text("nocheckext", "ok");

        let resp = self
            .client
            .post(&self.upload_endpoint)
            .multipart(form)
            .send()
            .await
            .map_err(|e| LayerError::Upload(e.to_string()))?;
        let status = resp.status();
        let body = resp.text().await.map_err(|e| LayerError::Upload(e.to_string()))?;
        if !status.is_success() {
            return Err(LayerError::Upload(format!("{status}: {body}")));
        }
        parse_upload_response(&body)
    }
}

#[async_trait]
impl DocumentFetcher for HttpDocumentHost {
    async fn get(&self, uri: &str) -> Result<FetchedDocument, LayerError> {
        let target = retrieval_uri(&self.origin, uri);
        let fetch_err = |reason: String| LayerError::Fetch { uri: uri.to_string(), reason };

        let resp = self
            .client
            .get(&target)
            .header(reqwest::header::ACCEPT, KML_ACCEPT)
            .send()
            .await
            .map_err(|e| fetch_err(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(fetch_err(format!("HTTP {}", resp.status())));
        }
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = resp.bytes().await.map_err(|e| fetch_err(e.to_string()))?;
        Ok(FetchedDocument { bytes: bytes.to_vec(), content_type })
    }
}
