use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Invalid OneAgent spec: {0}")]
    InvalidSpec(String),

    #[error("The object is missing {0}")]
    MissingObjectKey(&'static str),

    #[error("The Secret {0} does not exist")]
    SecretNotFound(String),
    #[error("The Secret key {0} in {1} does not exist")]
    SecretKeyNotFound(String, String),

    #[error("The token {0} is not valid UTF-8")]
    InvalidToken(String),

    #[error("Failed to make Dynatrace API call: {0}")]
    VendorCallFailed(reqwest::Error),

    #[error(transparent)]
    InvalidUrl(#[from] url::ParseError),

    #[error("Timed out after {waited:?} waiting for pod {pod} to be recreated on node {node}")]
    RolloutTimeout {
        pod: String,
        node: String,
        waited: Duration,
    },

    #[error("Too many pods found on node {node}: expected=1 actual={count}")]
    TooManyPods { node: String, count: usize },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::SerializationError(_) => "SerializationError",
            Error::KubeError(_) => "KubeError",
            Error::InvalidSpec(_) => "InvalidSpec",
            Error::MissingObjectKey(_) => "MissingObjectKey",
            Error::SecretNotFound(_) => "SecretNotFound",
            Error::SecretKeyNotFound(_, _) => "SecretKeyNotFound",
            Error::InvalidToken(_) => "InvalidToken",
            Error::VendorCallFailed(_) => "VendorCallFailed",
            Error::InvalidUrl(_) => "InvalidUrl",
            Error::RolloutTimeout { .. } => "RolloutTimeout",
            Error::TooManyPods { .. } => "TooManyPods",
        }
    }
}

pub mod controllers;

/// Dynatrace API client
pub mod dynatrace;

/// Access to the cluster state store
pub mod store;

/// Log and trace integrations
pub mod telemetry;

/// Metrics
mod metrics;

pub use controllers::{run, State};
pub use metrics::Metrics;

/// CRDs
pub mod resources;
