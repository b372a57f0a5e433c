//! Controller implementations for watching and reconciling resources

pub mod alert_controller;
pub mod backoff;

use kube::Client;
use std::sync::Arc;

use crate::config::{Config, ImageCatalog};

/// Shared context for controllers
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Operator configuration
    pub config: Config,
    /// Image table consulted by the Alert builders
    pub catalog: ImageCatalog,
}

impl Context {
    /// Create a new context
    pub fn new(client: Client, config: Config, catalog: ImageCatalog) -> Arc<Self> {
        Arc::new(Self {
            client,
            config,
            catalog,
        })
    }
}
