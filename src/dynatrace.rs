use std::fmt;
use std::future::Future;

use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use serde::Deserialize;
use tracing::*;
use url::Url;

use crate::resources::oneagents::{OneAgentSpec, API_TOKEN_KEY, PAAS_TOKEN_KEY};
use crate::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OsType {
    Unix,
    Windows,
}

impl OsType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OsType::Unix => "unix",
            OsType::Windows => "windows",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstallerType {
    Default,
    Paas,
}

impl InstallerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstallerType::Default => "default",
            InstallerType::Paas => "paas",
        }
    }
}

/// The tokens read from the credentials Secret of a OneAgent
#[derive(Clone, PartialEq, Eq)]
pub struct Tokens {
    pub api_token: String,
    pub paas_token: String,
}

// never print the tokens themselves
impl fmt::Debug for Tokens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tokens").finish_non_exhaustive()
    }
}

impl Tokens {
    pub fn from_secret(secret: &Secret) -> Result<Self> {
        Ok(Self {
            api_token: token(secret, API_TOKEN_KEY)?,
            paas_token: token(secret, PAAS_TOKEN_KEY)?,
        })
    }
}

fn token(secret: &Secret, key: &str) -> Result<String> {
    let bytes = secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        // we trim because secrets very regularly have trailing newlines
        .map(|token| token.0.trim_ascii().to_vec())
        .ok_or_else(|| Error::SecretKeyNotFound(key.to_owned(), secret.name_any()))?;

    String::from_utf8(bytes).map_err(|_| Error::InvalidToken(key.to_owned()))
}

/// Source of truth for which OneAgent version should be running
pub trait AgentVersionSource: Send + Sync {
    /// The Dynatrace API endpoint this client talks to
    fn endpoint(&self) -> &Url;

    /// The latest OneAgent version available for the given installer
    fn latest_version(
        &self,
        os: OsType,
        installer: InstallerType,
    ) -> impl Future<Output = Result<String>> + Send;
}

/// Builds a Dynatrace API client for a OneAgent
pub trait VendorClientBuilder: Send + Sync {
    type Client: AgentVersionSource;

    fn build(&self, spec: &OneAgentSpec, tokens: Tokens) -> Result<Self::Client>;
}

#[derive(Clone, Debug)]
pub struct DynatraceClient {
    http_client: reqwest::Client,
    endpoint: Url,
    tokens: Tokens,
}

impl DynatraceClient {
    pub fn new(endpoint: Url, tokens: Tokens, skip_cert_check: bool) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .danger_accept_invalid_certs(skip_cert_check)
            .build()
            .map_err(Error::VendorCallFailed)?;

        Ok(Self {
            http_client,
            endpoint,
            tokens,
        })
    }

    fn url(&self, path: &str) -> Result<Url> {
        // the api url usually ends in /api, which must be kept when joining
        let mut base = self.endpoint.clone();
        if !base.path().ends_with('/') {
            base.set_path(&format!("{}/", base.path()));
        }
        Ok(base.join(path.trim_start_matches('/'))?)
    }
}

impl AgentVersionSource for DynatraceClient {
    fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    async fn latest_version(&self, os: OsType, installer: InstallerType) -> Result<String> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct LatestAgentVersion {
            latest_agent_version: String,
        }

        let url = self.url(&format!(
            "v1/deployment/installer/agent/{}/{}/latest/metainfo",
            os.as_str(),
            installer.as_str()
        ))?;

        debug!(%url, "Querying latest OneAgent version");

        let resp: LatestAgentVersion = self
            .http_client
            .get(url)
            .header(
                reqwest::header::AUTHORIZATION,
                format!("Api-Token {}", self.tokens.paas_token),
            )
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(Error::VendorCallFailed)?
            .error_for_status()
            .map_err(Error::VendorCallFailed)?
            .json()
            .await
            .map_err(Error::VendorCallFailed)?;

        Ok(resp.latest_agent_version)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DynatraceClientBuilder;

impl VendorClientBuilder for DynatraceClientBuilder {
    type Client = DynatraceClient;

    fn build(&self, spec: &OneAgentSpec, tokens: Tokens) -> Result<DynatraceClient> {
        DynatraceClient::new(Url::parse(&spec.api_url)?, tokens, spec.skip_cert_check)
    }
}
