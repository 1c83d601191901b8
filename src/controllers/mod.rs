use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::Client;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::error;

use crate::Metrics;

pub mod oneagent;

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
        }
    }
}

/// State shared between the controller and the web server
#[derive(Clone)]
pub struct State {
    /// Diagnostics populated by the reconciler
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    pub registry: prometheus::Registry,
    /// Only watch OneAgents in this namespace, all namespaces if unset
    watch_namespace: Option<String>,
    /// Delay before retrying a failed reconciliation
    error_requeue: Duration,
}

/// State wrapper around the controller outputs for the web server
impl State {
    pub fn new(watch_namespace: Option<String>, error_requeue: Duration) -> Self {
        Self {
            diagnostics: Arc::new(RwLock::new(Diagnostics::default())),
            registry: prometheus::Registry::default(),
            watch_namespace,
            error_requeue,
        }
    }

    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }
}

/// Initialize the controller and shared state (given the crd is installed)
pub async fn run(state: State) {
    let client = match Client::try_default().await {
        Ok(client) => client,
        Err(e) => {
            error!("Failed to create kube Client: {e:?}");
            std::process::exit(1);
        }
    };

    let metrics = match Metrics::default().register(&state.registry) {
        Ok(metrics) => metrics,
        Err(e) => {
            error!("Failed to register metrics: {e:?}");
            std::process::exit(1);
        }
    };

    oneagent::run(client, metrics, state).await
}
