use crate::fetch::HttpClientConfig;
use crate::paths::GalleryPaths;
use crate::rewrite::DEFAULT_ARCHIVE_ROOT;
use crate::snapshots::{TimeRange, DEFAULT_CDX_ENDPOINT, DEFAULT_SITE_ROOT};
use crate::{HarvestError, Result};
use serde::{Deserialize, Serialize};

const DEFAULT_WORKERS: usize = 1;
const MAX_WORKERS: usize = 16;
const MAX_ATTEMPTS: u32 = 10;
const MAX_PAGE_DELAY_MS: u64 = 10_000;
const MAX_PROFILE_ID_LEN: usize = 50;
/// Sibling directories of the per-profile dirs under the base dir.
const RESERVED_PROFILE_IDS: &[&str] = &["config", "logs"];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarvestConfig {
    pub archive_root: String,
    pub cdx_endpoint: String,
    /// Host (and optional path) the profile pages were captured under.
    pub site_root: String,
    pub http: HttpClientConfig,
    pub workers: usize,
    pub page_delay_ms: u64,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            archive_root: DEFAULT_ARCHIVE_ROOT.to_string(),
            cdx_endpoint: DEFAULT_CDX_ENDPOINT.to_string(),
            site_root: DEFAULT_SITE_ROOT.to_string(),
            http: HttpClientConfig::default(),
            workers: DEFAULT_WORKERS,
            page_delay_ms: 0,
        }
    }
}

pub fn load_harvest_config(paths: &GalleryPaths) -> Result<HarvestConfig> {
    let path = paths.harvest_config_path();
    if !path.exists() {
        return Ok(HarvestConfig::default());
    }
    let bytes = std::fs::read(&path)?;
    let parsed: HarvestConfig = serde_json::from_slice(&bytes).map_err(|e| {
        HarvestError::InvalidRequest(format!(
            "failed to parse harvest config at {}: {e}",
            path.to_string_lossy()
        ))
    })?;
    Ok(parsed)
}

pub fn save_harvest_config(paths: &GalleryPaths, config: &HarvestConfig) -> Result<()> {
    let path = paths.harvest_config_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(config)?;
    std::fs::write(&path, format!("{json}\n"))?;
    Ok(())
}

/// Fully validated inputs for one profile run.
#[derive(Debug, Clone, Serialize)]
pub struct HarvestRequest {
    pub profile_id: String,
    pub range: TimeRange,
    pub archive_root: String,
    pub cdx_endpoint: String,
    pub site_root: String,
    pub http: HttpClientConfig,
    pub workers: usize,
    pub page_delay_ms: u64,
}

/// Command-line overrides layered on top of the loaded config.
#[derive(Debug, Clone, Default)]
pub struct HarvestOverrides {
    pub from: Option<String>,
    pub to: Option<String>,
    pub workers: Option<usize>,
    pub max_attempts: Option<u32>,
}

pub fn build_harvest_request(
    config: &HarvestConfig,
    profile_id: &str,
    overrides: HarvestOverrides,
) -> Result<HarvestRequest> {
    let profile_id = normalize_profile_id(profile_id)?;
    let from = normalize_archive_timestamp(overrides.from.as_deref(), "from")?;
    let to = normalize_archive_timestamp(overrides.to.as_deref(), "to")?;
    if let (Some(from), Some(to)) = (&from, &to) {
        if pad_timestamp(from, '0') > pad_timestamp(to, '9') {
            return Err(HarvestError::InvalidRequest(format!(
                "time range is empty: from={from} is after to={to}"
            )));
        }
    }

    let archive_root = config.archive_root.trim().trim_end_matches('/').to_string();
    if !archive_root.starts_with("http://") && !archive_root.starts_with("https://") {
        return Err(HarvestError::InvalidRequest(format!(
            "archive_root must be an http(s) URL, got {archive_root:?}"
        )));
    }

    let mut http = config.http.clone();
    http.max_attempts = overrides
        .max_attempts
        .unwrap_or(http.max_attempts)
        .clamp(1, MAX_ATTEMPTS);

    Ok(HarvestRequest {
        profile_id,
        range: TimeRange { from, to },
        archive_root,
        cdx_endpoint: config.cdx_endpoint.trim().to_string(),
        site_root: config.site_root.trim().trim_end_matches('/').to_string(),
        http,
        workers: overrides
            .workers
            .unwrap_or(config.workers)
            .clamp(1, MAX_WORKERS),
        page_delay_ms: config.page_delay_ms.min(MAX_PAGE_DELAY_MS),
    })
}

fn normalize_profile_id(raw: &str) -> Result<String> {
    let trimmed = raw.trim().trim_start_matches('@');
    if trimmed.is_empty() {
        return Err(HarvestError::InvalidRequest(
            "profile id must not be empty".to_string(),
        ));
    }
    if trimmed.len() > MAX_PROFILE_ID_LEN
        || !trimmed
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
    {
        return Err(HarvestError::InvalidRequest(format!(
            "invalid profile id {trimmed:?}; expected letters, digits or underscores"
        )));
    }
    if RESERVED_PROFILE_IDS
        .iter()
        .any(|reserved| trimmed.eq_ignore_ascii_case(reserved))
    {
        return Err(HarvestError::InvalidRequest(format!(
            "profile id {trimmed:?} collides with the {} directory",
            trimmed.to_ascii_lowercase()
        )));
    }
    Ok(trimmed.to_string())
}

fn normalize_archive_timestamp(value: Option<&str>, label: &str) -> Result<Option<String>> {
    let Some(raw) = value else {
        return Ok(None);
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    if trimmed.len() > 14 || !trimmed.chars().all(|ch| ch.is_ascii_digit()) {
        return Err(HarvestError::InvalidRequest(format!(
            "--{label} must be 1-14 digits (YYYYMMDDhhmmss prefix), got {trimmed:?}"
        )));
    }
    Ok(Some(trimmed.to_string()))
}

fn pad_timestamp(value: &str, fill: char) -> String {
    let mut out = value.to_string();
    while out.len() < 14 {
        out.push(fill);
    }
    out
}
