use std::collections::BTreeMap;
use std::fmt::Debug;
use std::future::Future;

use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::core::NamespaceResourceScope;
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::{Error, Result};

pub const FIELD_MANAGER: &str = "oneagent-operator";

/// Namespaced objects the operator reads and writes
pub trait ClusterResource:
    Resource<Scope = NamespaceResourceScope, DynamicType = ()>
    + Clone
    + Debug
    + DeserializeOwned
    + Serialize
    + Send
    + Sync
    + 'static
{
}

impl<K> ClusterResource for K where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + Debug
        + DeserializeOwned
        + Serialize
        + Send
        + Sync
        + 'static
{
}

/// The cluster state store.
///
/// Writes are conditional on `metadata.resourceVersion` when it is set, so a write based on a stale read fails.
pub trait ClusterStore: Send + Sync {
    /// Returns `None` if the object does not exist
    fn get<K: ClusterResource>(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = Result<Option<K>>> + Send;

    fn create<K: ClusterResource>(&self, obj: &K) -> impl Future<Output = Result<K>> + Send;

    /// Replace everything but the status of an object
    fn update<K: ClusterResource>(&self, obj: &K) -> impl Future<Output = Result<K>> + Send;

    /// Replace only the status of an object
    fn update_status<K: ClusterResource>(&self, obj: &K)
        -> impl Future<Output = Result<K>> + Send;

    /// Deleting an object which is already gone succeeds
    fn delete<K: ClusterResource>(&self, obj: &K) -> impl Future<Output = Result<()>> + Send;

    fn list<K: ClusterResource>(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> impl Future<Output = Result<Vec<K>>> + Send;
}

/// [`ClusterStore`] backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api_for<K: ClusterResource>(&self, obj: &K) -> Result<(Api<K>, String)> {
        let namespace = obj
            .namespace()
            .ok_or(Error::MissingObjectKey("metadata.namespace"))?;
        let name = obj
            .meta()
            .name
            .clone()
            .ok_or(Error::MissingObjectKey("metadata.name"))?;
        Ok((Api::namespaced(self.client.clone(), &namespace), name))
    }
}

fn post_params() -> PostParams {
    PostParams {
        dry_run: false,
        field_manager: Some(FIELD_MANAGER.to_owned()),
    }
}

pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

impl ClusterStore for KubeStore {
    async fn get<K: ClusterResource>(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create<K: ClusterResource>(&self, obj: &K) -> Result<K> {
        let (api, _) = self.api_for(obj)?;
        Ok(api.create(&post_params(), obj).await?)
    }

    async fn update<K: ClusterResource>(&self, obj: &K) -> Result<K> {
        let (api, name) = self.api_for(obj)?;
        Ok(api.replace(&name, &post_params(), obj).await?)
    }

    async fn update_status<K: ClusterResource>(&self, obj: &K) -> Result<K> {
        let (api, name) = self.api_for(obj)?;
        let data = serde_json::to_vec(obj)?;
        Ok(api.replace_status(&name, &post_params(), data).await?)
    }

    async fn delete<K: ClusterResource>(&self, obj: &K) -> Result<()> {
        let (api, name) = self.api_for(obj)?;
        match api.delete(&name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            // for idempotency we have to allow 404
            Err(kube::Error::Api(err)) if err.code == 404 => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn list<K: ClusterResource>(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<K>> {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().labels(&label_selector(labels));
        Ok(api.list(&params).await?.items)
    }
}
