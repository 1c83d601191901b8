use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::{Resource, ResourceExt};

use crate::resources::oneagents::OneAgent;
use crate::{Error, Result};

pub mod daemonset;
pub mod istio;
pub mod rollout;
pub mod version;

pub const APP_MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY: &str = "oneagent-operator";

/// Labels selecting the OneAgent pods of an instance
pub fn agent_labels(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from_iter([
        ("dynatrace".into(), "oneagent".into()),
        ("oneagent".into(), name.into()),
    ])
}

pub fn label_selector(name: &str) -> LabelSelector {
    LabelSelector {
        match_labels: Some(agent_labels(name)),
        match_expressions: None,
    }
}

/// Metadata for an object owned by the OneAgent, so that it is garbage collected along with it
pub fn object_meta(oa: &OneAgent, name: &str) -> Result<ObjectMeta> {
    let namespace = oa
        .namespace()
        .ok_or(Error::MissingObjectKey("metadata.namespace"))?;
    let owner_reference = oa
        .controller_owner_ref(&())
        .ok_or(Error::MissingObjectKey("metadata.uid"))?;

    let mut labels = agent_labels(&oa.name_any());
    labels.insert(APP_MANAGED_BY_LABEL.into(), MANAGED_BY.into());

    Ok(ObjectMeta {
        name: Some(name.into()),
        namespace: Some(namespace),
        labels: Some(labels),
        owner_references: Some(vec![owner_reference]),
        ..Default::default()
    })
}
