//! Operator configuration and image catalog

use std::collections::BTreeMap;
use std::env;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::updater::{RolloutStrategy, UpdaterOptions};
use crate::{Error, Result};

/// Operator configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of Alerts reconciled concurrently
    pub threadiness: usize,
    /// Requeue delay after a successful pass
    pub resync_interval: Duration,
    /// Steady rate of reconcile starts across all Alerts
    pub reconcile_qps: u32,
    /// Reconcile starts allowed in a burst above `reconcile_qps`
    pub reconcile_burst: u32,
    pub dry_run: bool,
    pub strict_selectors: bool,
    pub rollout: RolloutStrategy,
    pub metrics_port: u16,
    /// Restrict the watch to one namespace; all namespaces when unset
    pub watch_namespace: Option<String>,
    pub image_catalog_path: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            threadiness: 2,
            resync_interval: Duration::from_secs(300),
            reconcile_qps: 10,
            reconcile_burst: 100,
            dry_run: false,
            strict_selectors: false,
            rollout: RolloutStrategy::default(),
            metrics_port: 8080,
            watch_namespace: None,
            image_catalog_path: None,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let threadiness = match var("THREADINESS") {
            Some(v) => parse_number::<usize>("THREADINESS", &v)?.max(1),
            None => defaults.threadiness,
        };
        let resync_interval = match var("RESYNC_INTERVAL_SECS") {
            Some(v) => Duration::from_secs(parse_number::<u64>("RESYNC_INTERVAL_SECS", &v)?),
            None => defaults.resync_interval,
        };
        let reconcile_qps = match var("RECONCILE_QPS") {
            Some(v) => parse_positive("RECONCILE_QPS", &v)?,
            None => defaults.reconcile_qps,
        };
        let reconcile_burst = match var("RECONCILE_BURST") {
            Some(v) => parse_positive("RECONCILE_BURST", &v)?,
            None => defaults.reconcile_burst,
        };
        let metrics_port = match var("METRICS_PORT") {
            Some(v) => parse_number::<u16>("METRICS_PORT", &v)?,
            None => defaults.metrics_port,
        };
        let rollout = match var("ROLLOUT_STRATEGY") {
            Some(v) => v.parse()?,
            None => defaults.rollout,
        };

        Ok(Config {
            threadiness,
            resync_interval,
            reconcile_qps,
            reconcile_burst,
            dry_run: var("DRY_RUN").map(|v| parse_bool(&v)).unwrap_or(false),
            strict_selectors: var("STRICT_SELECTORS")
                .map(|v| parse_bool(&v))
                .unwrap_or(false),
            rollout,
            metrics_port,
            watch_namespace: var("WATCH_NAMESPACE"),
            image_catalog_path: var("IMAGE_CATALOG_PATH"),
        })
    }

    /// Engine options derived from this configuration
    pub fn updater_options(&self) -> UpdaterOptions {
        UpdaterOptions {
            dry_run: self.dry_run,
            force_patch: false,
            rollout: self.rollout,
            strict_selectors: self.strict_selectors,
        }
    }

    /// Load the image catalog from `image_catalog_path`, or the built-in one
    pub fn load_image_catalog(&self) -> Result<ImageCatalog> {
        match &self.image_catalog_path {
            Some(path) => ImageCatalog::from_file(path),
            None => Ok(ImageCatalog::default()),
        }
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| Error::ConfigError(format!("{}={}: {}", key, value, e)))
}

fn parse_positive(key: &str, value: &str) -> Result<u32> {
    match parse_number::<u32>(key, value)? {
        0 => Err(Error::ConfigError(format!("{} must be greater than zero", key))),
        n => Ok(n),
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Image component names
pub const ALERT_COMPONENT: &str = "blackduck-alert";
pub const CFSSL_COMPONENT: &str = "blackduck-cfssl";

/// Release version to image tag table, loaded once at startup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageCatalog {
    /// Registry and repository prefix, e.g. `docker.io/blackducksoftware`
    pub registry: String,
    /// version -> component -> tag
    pub versions: BTreeMap<String, BTreeMap<String, String>>,
}

impl Default for ImageCatalog {
    fn default() -> Self {
        let release = |alert: &str, cfssl: &str| -> BTreeMap<String, String> {
            [
                (ALERT_COMPONENT.to_string(), alert.to_string()),
                (CFSSL_COMPONENT.to_string(), cfssl.to_string()),
            ]
            .into()
        };
        let versions = [
            ("3.1.0", release("3.1.0", "1.0.0")),
            ("4.0.0", release("4.0.0", "1.0.0")),
            ("4.1.0", release("4.1.0", "1.0.0")),
            ("4.2.0", release("4.2.0", "1.0.0")),
            ("5.0.0", release("5.0.0", "1.0.0")),
            ("5.0.1", release("5.0.1", "1.0.0")),
            ("5.0.2", release("5.0.2", "1.0.0")),
            ("5.1.0", release("5.1.0", "1.0.1")),
            ("5.2.0", release("5.2.0", "1.0.1")),
            ("5.3.0", release("5.3.0", "1.0.1")),
        ]
        .into_iter()
        .map(|(v, images)| (v.to_string(), images))
        .collect();

        Self {
            registry: "docker.io/blackducksoftware".to_string(),
            versions,
        }
    }
}

impl ImageCatalog {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let catalog: ImageCatalog = serde_yaml::from_str(yaml)
            .map_err(|e| Error::ConfigError(format!("invalid image catalog: {}", e)))?;
        if catalog.registry.trim().is_empty() {
            return Err(Error::ConfigError(
                "image catalog registry cannot be empty".to_string(),
            ));
        }
        Ok(catalog)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|e| {
            Error::ConfigError(format!("cannot read image catalog {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&yaml)
    }

    /// Full image reference for `component` at release `version`
    pub fn image(&self, version: &str, component: &str) -> Option<String> {
        let tag = self.versions.get(version)?.get(component)?;
        Some(format!("{}/{}:{}", self.registry.trim_end_matches('/'), component, tag))
    }

    pub fn supports(&self, version: &str) -> bool {
        self.versions.contains_key(version)
    }
}
