//! Abstract overlay requests -> concrete document locations.
//!
//! Resolution order for each layer: a cached URI from earlier in the session,
//! then the same-origin public route if a probe says it is reachable, then an
//! upload of the raw document to the external host. A layer for which all of
//! these fail is reported as a `Resolution` error before any load starts.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{DocumentsConfig, EngineConfig, OriginConfig, UploadConfig};
use crate::error::LayerError;

pub const GENERAL_KEY: &str = "general";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerRequest {
    General,
    Sectors(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OriginKind {
    General,
    Sector,
}

/// A desired layer before its document has been loaded.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerStub {
    pub source_key: String,
    pub origin: OriginKind,
    /// Sector slug for sector layers.
    pub sector: Option<String>,
    pub static_path: String,
    pub public_uri: String,
    pub file_name: String,
    pub cached_uri: Option<String>,
    pub upload_enabled: bool,
}

pub fn sector_key(slug: &str) -> String {
    format!("sector:{slug}")
}

/// The sidebar choice between the general map and individual sectors.
/// The two are mutually exclusive; with nothing chosen the general map shows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapSelection {
    pub general: bool,
    pub sectors: Vec<String>,
}

impl Default for MapSelection {
    fn default() -> Self {
        Self { general: true, sectors: Vec::new() }
    }
}

impl MapSelection {
    pub fn toggle_general(&mut self) {
        self.general = !self.general;
        if self.general {
            self.sectors.clear();
        }
    }

    pub fn toggle_sector(&mut self, slug: &str) {
        self.general = false;
        if let Some(pos) = self.sectors.iter().position(|s| s == slug) {
            self.sectors.remove(pos);
        } else {
            self.sectors.push(slug.to_string());
        }
    }

    /// Selects every known sector, or clears them if all were already selected.
    pub fn toggle_all(&mut self, known: &[String]) {
        self.general = false;
        let all_selected = !known.is_empty() && known.iter().all(|s| self.sectors.contains(s));
        self.sectors = if all_selected { Vec::new() } else { known.to_vec() };
    }

    pub fn request(&self) -> LayerRequest {
        if self.general || self.sectors.is_empty() {
            LayerRequest::General
        } else {
            LayerRequest::Sectors(self.sectors.clone())
        }
    }
}

/// Where raw documents live and how to get a durable URI for one.
#[async_trait]
pub trait DocumentHost: Send + Sync {
    /// Lightweight existence check (an HTTP HEAD for the real host).
    async fn probe(&self, uri: &str) -> bool;
    /// Raw bytes of a same-origin static document.
    async fn fetch_raw(&self, path: &str) -> Result<Vec<u8>, LayerError>;
    /// Uploads a document to external hosting and returns its durable URI.
    async fn upload(&self, file_name: &str, bytes: Vec<u8>) -> Result<String, LayerError>;
}

pub struct Resolver {
    origin: OriginConfig,
    documents: DocumentsConfig,
    upload: UploadConfig,
    cache: HashMap<String, String>,
}

impl Resolver {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            origin: config.origin.clone(),
            documents: config.documents.clone(),
            upload: config.upload.clone(),
            cache: HashMap::new(),
        }
    }

    /// One stub per layer, in request order, duplicates removed.
    pub fn plan(&self, request: &LayerRequest) -> Vec<LayerStub> {
        match request {
            LayerRequest::General => vec![self.stub(
                GENERAL_KEY.to_string(),
                OriginKind::General,
                None,
                self.documents.general_path.clone(),
            )],
            LayerRequest::Sectors(slugs) => {
                let mut seen = Vec::new();
                slugs
                    .iter()
                    .filter(|slug| {
                        let fresh = !seen.contains(slug);
                        seen.push(*slug);
                        fresh
                    })
                    .map(|slug| {
                        self.stub(
                            sector_key(slug),
                            OriginKind::Sector,
                            Some(slug.clone()),
                            self.documents.sector_path(slug),
                        )
                    })
                    .collect()
            }
        }
    }

    fn stub(&self, key: String, origin: OriginKind, sector: Option<String>, path: String) -> LayerStub {
        let file_name = path.rsplit('/').next().unwrap_or("document.kml").to_string();
        LayerStub {
            cached_uri: self.cache.get(&key).cloned(),
            public_uri: public_uri(&self.origin, &path),
            source_key: key,
            origin,
            sector,
            static_path: path,
            file_name,
            upload_enabled: self.upload.enabled,
        }
    }

    pub fn remember(&mut self, key: &str, uri: &str) {
        self.cache.insert(key.to_string(), uri.to_string());
    }

    pub fn cached(&self, key: &str) -> Option<&str> {
        self.cache.get(key).map(String::as_str)
    }
}

/// `{base}{public_route}?path=<path>`.
pub fn public_uri(origin: &OriginConfig, path: &str) -> String {
    let base = format!("{}{}", origin.base_url.trim_end_matches('/'), origin.public_route);
    match Url::parse_with_params(&base, &[("path", path)]) {
        Ok(url) => url.to_string(),
        Err(_) => format!("{base}?path={path}"),
    }
}

pub async fn resolve(
    stub: &LayerStub,
    host: &dyn DocumentHost,
    probe_timeout: Duration,
) -> Result<String, LayerError> {
    if let Some(uri) = &stub.cached_uri {
        debug!(key = %stub.source_key, %uri, "using cached document uri");
        return Ok(uri.clone());
    }

    match tokio::time::timeout(probe_timeout, host.probe(&stub.public_uri)).await {
        Ok(true) => {
            info!(key = %stub.source_key, uri = %stub.public_uri, "public route available");
            return Ok(stub.public_uri.clone());
        }
        Ok(false) => warn!(key = %stub.source_key, "public route not reachable"),
        Err(_) => warn!(key = %stub.source_key, ?probe_timeout, "public route probe timed out"),
    }

    if !stub.upload_enabled {
        return Err(LayerError::Resolution {
            key: stub.source_key.clone(),
            reason: "public route unreachable and upload fallback disabled".to_string(),
        });
    }

    let fallback = async {
        let bytes = host.fetch_raw(&stub.static_path).await?;
        host.upload(&stub.file_name, bytes).await
    };
    match tokio::time::timeout(probe_timeout, fallback).await {
        Ok(Ok(uri)) => {
            info!(key = %stub.source_key, %uri, "document uploaded to external host");
            Ok(uri)
        }
        Ok(Err(e)) => Err(LayerError::Resolution {
            key: stub.source_key.clone(),
            reason: e.to_string(),
        }),
        Err(_) => Err(LayerError::Resolution {
            key: stub.source_key.clone(),
            reason: format!("upload fallback timed out after {probe_timeout:?}"),
        }),
    }
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    #[serde(default)]
    error: Vec<String>,
    tempname: Option<String>,
    tempname2: Option<String>,
}

/// Body of the external host's upload response -> durable URI.
pub fn parse_upload_response(body: &str) -> Result<String, LayerError> {
    if body.trim().is_empty() {
        return Err(LayerError::Upload("empty response from upload host".to_string()));
    }
    let response: UploadResponse = serde_json::from_str(body)
        .map_err(|e| LayerError::Upload(format!("response is not valid JSON: {e}")))?;

    let errors: Vec<&str> = response
        .error
        .iter()
        .map(|m| m.trim())
        .filter(|m| !m.is_empty())
        .collect();
    if !errors.is_empty() {
        return Err(LayerError::Upload(errors.join(", ")));
    }

    [response.tempname, response.tempname2]
        .into_iter()
        .flatten()
        .find(|u| !u.trim().is_empty())
        .ok_or_else(|| LayerError::Upload("no document uri in upload response".to_string()))
}
