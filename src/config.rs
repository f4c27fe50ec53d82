use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub paths: PathsConfig,
    pub store: StoreConfig,
    pub geocoder: GeocoderConfig,
    #[serde(default)]
    pub vendors: VendorsConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PathsConfig {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    #[serde(default = "default_progress_file")]
    pub progress_file: PathBuf,
    #[serde(default = "default_status_file")]
    pub status_file: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
}

fn default_progress_file() -> PathBuf {
    PathBuf::from("progress.json")
}
fn default_status_file() -> PathBuf {
    PathBuf::from("status.json")
}
fn default_include_globs() -> Vec<String> {
    vec!["*.parquet".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GeocoderConfig {
    pub base_url: String,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_cache_ttl_days")]
    pub cache_ttl_days: u64,
}

fn default_max_in_flight() -> usize {
    5
}
fn default_timeout_secs() -> u64 {
    10
}
fn default_cache_ttl_days() -> u64 {
    30
}

impl GeocoderConfig {
    pub fn cache_ttl(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.cache_ttl_days * 24 * 60 * 60)
    }

    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct VendorsConfig {
    /// Comma-separated seed list for an empty vendor set.
    #[serde(default)]
    pub defaults: String,
}

impl VendorsConfig {
    pub fn default_list(&self) -> Vec<String> {
        self.defaults
            .split(',')
            .map(|v| v.trim().to_lowercase())
            .filter(|v| !v.is_empty())
            .collect()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct OutputConfig {
    #[serde(default = "default_compression")]
    pub compression: String,
    #[serde(default = "default_dedupe")]
    pub dedupe_by_ref_id: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            compression: default_compression(),
            dedupe_by_ref_id: default_dedupe(),
        }
    }
}

fn default_compression() -> String {
    "snappy".to_string()
}
fn default_dedupe() -> bool {
    true
}

impl Config {
    /// Config rooted at `base`, with a placeholder geocoder URL.
    pub fn minimal(base: &Path) -> Self {
        Self {
            paths: PathsConfig {
                input_dir: base.join("input"),
                output_dir: base.join("output"),
                progress_file: base.join("progress.json"),
                status_file: base.join("status.json"),
                include_globs: default_include_globs(),
            },
            store: StoreConfig {
                path: base.join("data/denrich.sqlite"),
            },
            geocoder: GeocoderConfig {
                base_url: "http://127.0.0.1:2322".to_string(),
                max_in_flight: default_max_in_flight(),
                timeout_secs: default_timeout_secs(),
                cache_ttl_days: default_cache_ttl_days(),
            },
            vendors: VendorsConfig::default(),
            output: OutputConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    let url = config.geocoder.base_url.trim();
    if url.is_empty() {
        anyhow::bail!("geocoder.base_url must be set");
    }
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        anyhow::bail!("geocoder.base_url must be an http(s) URL, got '{}'", url);
    }
    if config.geocoder.max_in_flight == 0 {
        anyhow::bail!("geocoder.max_in_flight must be >= 1");
    }
    if config.geocoder.timeout_secs == 0 {
        anyhow::bail!("geocoder.timeout_secs must be > 0");
    }
    if config.geocoder.cache_ttl_days == 0 {
        anyhow::bail!("geocoder.cache_ttl_days must be > 0");
    }
    if config.paths.include_globs.is_empty() {
        anyhow::bail!("paths.include_globs must not be empty");
    }

    match config.output.compression.as_str() {
        "snappy" | "zstd" | "none" => {}
        other => anyhow::bail!(
            "Unknown output compression: '{}'. Must be snappy, zstd, or none.",
            other
        ),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[paths]
input_dir = "temp"
output_dir = "processed_dir"

[store]
path = "data/denrich.sqlite"

[geocoder]
base_url = "http://localhost:2322"

[vendors]
defaults = "Samsung, apple,,xiaomi "
"#;

    #[test]
    fn parses_with_defaults() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        validate(&config).unwrap();
        assert_eq!(config.geocoder.max_in_flight, 5);
        assert_eq!(config.geocoder.timeout_secs, 10);
        assert_eq!(config.geocoder.cache_ttl().as_secs(), 2_592_000);
        assert_eq!(config.paths.progress_file, PathBuf::from("progress.json"));
        assert_eq!(config.output.compression, "snappy");
        assert!(config.output.dedupe_by_ref_id);
        assert_eq!(
            config.vendors.default_list(),
            vec!["samsung", "apple", "xiaomi"]
        );
    }

    #[test]
    fn rejects_bad_values() {
        let mut config: Config = toml::from_str(SAMPLE).unwrap();
        config.geocoder.max_in_flight = 0;
        assert!(validate(&config).is_err());

        let mut config: Config = toml::from_str(SAMPLE).unwrap();
        config.geocoder.base_url = "ftp://geo".into();
        assert!(validate(&config).is_err());

        let mut config: Config = toml::from_str(SAMPLE).unwrap();
        config.output.compression = "lzo".into();
        assert!(validate(&config).is_err());
    }
}
