use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::fs;
use std::time::Duration;
use anyhow::{Context, Result};

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub origin: OriginConfig,
    pub documents: DocumentsConfig,
    pub upload: UploadConfig,
    pub loader: LoaderConfig,
    pub viewport: ViewportConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct OriginConfig {
    pub base_url: String,
    pub public_route: String,
    pub proxy_route: String,
}

impl Default for OriginConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".to_string(),
            public_route: "/api/kml/public".to_string(),
            proxy_route: "/api/kml".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DocumentsConfig {
    pub general_path: String,
    pub sector_path_template: String, // `{slug}` is substituted
    pub sectors: Vec<SectorConfig>,
}

impl Default for DocumentsConfig {
    fn default() -> Self {
        Self {
            general_path: "/kml/mapas-gerais/mapa-geral.kml".to_string(),
            sector_path_template: "/kml/setores/{slug}.kml".to_string(),
            sectors: Vec::new(),
        }
    }
}

impl DocumentsConfig {
    pub fn sector_path(&self, slug: &str) -> String {
        self.sector_path_template.replace("{slug}", slug)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SectorConfig {
    pub slug: String,
    pub name: String,
    pub color: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct UploadConfig {
    pub enabled: bool,
    pub endpoint: String,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: "https://excelviewer.herokuapp.com/upload/".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoaderConfig {
    pub fetch_timeout_ms: u64,
    pub probe_timeout_ms: u64,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self { fetch_timeout_ms: 10_000, probe_timeout_ms: 10_000 }
    }
}

impl LoaderConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// Camera framing. The delays exist because renderers materialize geometry
/// some time after reporting a layer as loaded; tests set both to zero.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ViewportConfig {
    pub settle_delay_ms: u64,
    pub corrective_delay_ms: u64,
    pub padding: u32,
    pub max_zoom: f64,
}

impl Default for ViewportConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: 800,
            corrective_delay_ms: 500,
            padding: 50,
            max_zoom: 16.0,
        }
    }
}

impl ViewportConfig {
    pub fn immediate() -> Self {
        Self { settle_delay_ms: 0, corrective_delay_ms: 0, ..Self::default() }
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn corrective_delay(&self) -> Duration {
        Duration::from_millis(self.corrective_delay_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub public_dir: PathBuf,
    pub cache_max_age_secs: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            public_dir: PathBuf::from("public"),
            cache_max_age_secs: 3600,
        }
    }
}

impl EngineConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: EngineConfig = toml::from_str(&content)
            .with_context(|| "Failed to parse TOML configuration")?;
        Ok(config)
    }
}
