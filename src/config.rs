//! Hub configuration: routing document plus lost-detection settings.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::RetryPolicy;
use crate::routing::RoutingConfig;

pub const DEFAULT_LOST_THRESHOLD_SECONDS: u64 = 3600;
pub const DEFAULT_LOST_SCAN_PAGE_SIZE: usize = 100;
pub const DEFAULT_LOST_SCAN_INTERVAL_SECONDS: u64 = 60;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("route {0} has an empty destination")]
    EmptyDestination(usize),
    #[error("{location}: exponential backoff base {base} exceeds max {max}")]
    InvalidBackoff {
        location: String,
        base: u32,
        max: u32,
    },
    #[error("lostScanPageSize must be at least 1")]
    EmptyScanPage,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HubConfig {
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default = "default_lost_threshold")]
    pub lost_threshold_seconds: u64,
    #[serde(default = "default_lost_scan_page_size")]
    pub lost_scan_page_size: usize,
    /// Seconds between lost-dispatch scans.
    #[serde(default = "default_lost_scan_interval")]
    pub lost_scan_interval: u64,
}

fn default_lost_threshold() -> u64 {
    DEFAULT_LOST_THRESHOLD_SECONDS
}

fn default_lost_scan_page_size() -> usize {
    DEFAULT_LOST_SCAN_PAGE_SIZE
}

fn default_lost_scan_interval() -> u64 {
    DEFAULT_LOST_SCAN_INTERVAL_SECONDS
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            routing: RoutingConfig::default(),
            lost_threshold_seconds: DEFAULT_LOST_THRESHOLD_SECONDS,
            lost_scan_page_size: DEFAULT_LOST_SCAN_PAGE_SIZE,
            lost_scan_interval: DEFAULT_LOST_SCAN_INTERVAL_SECONDS,
        }
    }
}

impl HubConfig {
    pub fn new(routing: RoutingConfig) -> Self {
        Self {
            routing,
            ..Default::default()
        }
    }

    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: HubConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    /// Checks that serde cannot express. Unparseable paths only warn:
    /// they are allowed and never match.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lost_scan_page_size == 0 {
            return Err(ConfigError::EmptyScanPage);
        }

        check_policy("defaults", self.routing.defaults.retry_delay.as_ref())?;

        for (index, route) in self.routing.routes.iter().enumerate() {
            if route.destination.trim().is_empty() {
                return Err(ConfigError::EmptyDestination(index));
            }
            check_policy(&format!("route {index}"), route.retry_delay.as_ref())?;

            for path in route.condition.invalid_paths() {
                tracing::warn!(
                    route = index,
                    destination = %route.destination,
                    path,
                    "route condition has an unparseable path; it will never match"
                );
            }
        }

        Ok(())
    }
}

fn check_policy(location: &str, policy: Option<&RetryPolicy>) -> Result<(), ConfigError> {
    match policy {
        Some(RetryPolicy::Exponential { base, max }) if base > max => {
            Err(ConfigError::InvalidBackoff {
                location: location.to_string(),
                base: *base,
                max: *max,
            })
        }
        _ => Ok(()),
    }
}
