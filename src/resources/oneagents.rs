use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::api::core::v1::{
    EnvVar, EnvVarSource, ResourceRequirements, SecretKeySelector, Toleration,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::schema::Schema;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;
use url::Url;

use crate::{Error, Result};

pub const DEFAULT_IMAGE: &str = "docker.io/dynatrace/oneagent:latest";
pub const DEFAULT_WAIT_READY_SECONDS: u16 = 300;

pub const INSTALLER_TOKEN_ENV: &str = "ONEAGENT_INSTALLER_TOKEN";
pub const INSTALLER_SCRIPT_URL_ENV: &str = "ONEAGENT_INSTALLER_SCRIPT_URL";

/// Secret key holding the token used to query the Dynatrace API
pub const API_TOKEN_KEY: &str = "apiToken";
/// Secret key holding the token used to download the OneAgent installer
pub const PAAS_TOKEN_KEY: &str = "paasToken";

/// OneAgent deploys the Dynatrace OneAgent to every eligible node of the cluster and keeps
/// it on the latest version published by the Dynatrace environment.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[cfg_attr(test, derive(Default))]
#[kube(
    kind = "OneAgent",
    group = "dynatrace.com",
    version = "v1alpha1",
    namespaced,
    printcolumn = r#"{"name":"ApiUrl", "type":"string", "jsonPath":".spec.apiUrl"}"#,
    printcolumn = r#"{"name":"Tokens", "type":"string", "jsonPath":".spec.tokens"}"#,
    printcolumn = r#"{"name":"Version", "type":"string", "jsonPath":".status.version"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[kube(status = "OneAgentStatus", shortname = "oa")]
#[serde(rename_all = "camelCase")]
pub struct OneAgentSpec {
    /// Dynatrace API endpoint, eg `https://<environment>.live.dynatrace.com/api`
    pub api_url: String,

    /// Disable certificate validation checks for the Dynatrace API. Defaults to false.
    #[serde(default)]
    pub skip_cert_check: bool,

    /// Name of the Secret holding the `apiToken` and `paasToken` keys. Defaults to the name of this OneAgent.
    #[serde(default)]
    pub tokens: String,

    /// OneAgent container image. Defaults to docker.io/dynatrace/oneagent:latest
    #[serde(default)]
    pub image: String,

    /// Arguments passed to the OneAgent installer
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// List of environment variables to set in the OneAgent container
    #[serde(default)]
    #[schemars(schema_with = "env_schema")]
    pub env: Vec<EnvVar>,

    /// Node selector to control on which nodes the OneAgent is deployed
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,

    /// Tolerations of the OneAgent pods
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,

    /// Priority class assigned to the OneAgent pods
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority_class_name: Option<String>,

    /// Compute resources of the OneAgent container
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// Disable the automatic rollout of new OneAgent versions. Defaults to false.
    #[serde(default)]
    pub disable_agent_update: bool,

    /// Open egress to the Dynatrace environment through Istio. Defaults to false.
    #[serde(default)]
    pub enable_istio: bool,

    /// Seconds to wait for a replacement pod to become ready on a node during an update. Defaults to 300.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_ready_seconds: Option<u16>,
}

fn env_schema(g: &mut schemars::gen::SchemaGenerator) -> Schema {
    serde_json::from_value(json!({
        "items": EnvVar::json_schema(g),
        "nullable": true,
        "type": "array",
        "x-kubernetes-list-map-keys": ["name"],
        "x-kubernetes-list-type": "map"
    }))
    .unwrap()
}

/// Status of the OneAgent rollout
#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OneAgentStatus {
    /// Latest OneAgent version published by the Dynatrace environment
    #[serde(default)]
    pub version: String,
    /// Last time the operator updated this object
    pub updated_timestamp: Option<Time>,
    /// Known OneAgent pods, keyed by pod name
    #[serde(default)]
    pub items: BTreeMap<String, OneAgentInstance>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OneAgentInstance {
    pub node_name: String,
    pub version: String,
    pub ready: bool,
}

impl OneAgent {
    /// Fill in optional fields. Defaults are only persisted when the object is next written.
    pub fn apply_defaults(&mut self) {
        if self.spec.image.is_empty() {
            self.spec.image = DEFAULT_IMAGE.to_owned();
        }

        if self.spec.wait_ready_seconds.is_none() {
            self.spec.wait_ready_seconds = Some(DEFAULT_WAIT_READY_SECONDS);
        }

        if !self.spec.api_url.is_empty()
            && !self
                .spec
                .env
                .iter()
                .any(|e| e.name == INSTALLER_SCRIPT_URL_ENV)
        {
            self.spec.env.push(EnvVar {
                name: INSTALLER_SCRIPT_URL_ENV.into(),
                value: Some(installer_script_url(&self.spec.api_url)),
                value_from: None,
            });
        }
    }

    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.spec.api_url.is_empty() {
            problems.push(".spec.apiUrl is missing".to_owned());
        } else {
            match Url::parse(&self.spec.api_url) {
                Ok(url) if matches!(url.scheme(), "http" | "https") && url.has_host() => {}
                Ok(_) => problems.push(".spec.apiUrl must be an http(s) URL".to_owned()),
                Err(err) => problems.push(format!(".spec.apiUrl is invalid: {err}")),
            }
        }

        if self.spec.image.is_empty() {
            problems.push(".spec.image is missing".to_owned());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::InvalidSpec(problems.join(", ")))
        }
    }

    /// Ensure the installer token is the first env var, so that the installer script url can reference it.
    ///
    /// Returns true if the spec was modified.
    pub fn ensure_installer_token_env(&mut self) -> bool {
        if self
            .spec
            .env
            .first()
            .is_some_and(|e| e.name == INSTALLER_TOKEN_ENV)
        {
            return false;
        }

        self.spec.env.retain(|e| e.name != INSTALLER_TOKEN_ENV);
        self.spec.env.insert(
            0,
            EnvVar {
                name: INSTALLER_TOKEN_ENV.into(),
                value: None,
                value_from: Some(EnvVarSource {
                    secret_key_ref: Some(SecretKeySelector {
                        name: self.spec.tokens.clone().into(),
                        key: PAAS_TOKEN_KEY.into(),
                        optional: None,
                    }),
                    ..Default::default()
                }),
            },
        );

        true
    }

    /// How long a single node may take to get a ready replacement pod during an update
    pub fn wait_ready(&self) -> Duration {
        Duration::from_secs(
            self.spec
                .wait_ready_seconds
                .unwrap_or(DEFAULT_WAIT_READY_SECONDS)
                .into(),
        )
    }
}

fn installer_script_url(api_url: &str) -> String {
    format!(
        "{}/v1/deployment/installer/agent/unix/default/latest?Api-Token=$({INSTALLER_TOKEN_ENV})&arch=x86&flavor=default",
        api_url.trim_end_matches('/')
    )
}
