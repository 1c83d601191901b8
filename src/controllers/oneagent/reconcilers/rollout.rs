use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use super::agent_labels;
use crate::metrics::Metrics;
use crate::resources::oneagents::{OneAgent, OneAgentInstance};
use crate::store::ClusterStore;
use crate::{Error, Result};

/// Delay between two checks for a replacement pod
pub const SPLAY: Duration = Duration::from_secs(10);

pub fn pod_node(pod: &Pod) -> Option<&str> {
    pod.spec
        .as_ref()
        .and_then(|s| s.node_name.as_deref())
        .filter(|n| !n.is_empty())
}

fn is_running(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .is_some_and(|phase| phase == "Running")
}

pub fn is_pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

#[derive(Debug, PartialEq, Eq)]
pub enum NodeState {
    /// No replacement is running yet, or it is not ready
    Waiting,
    /// Exactly one running replacement, and it is ready
    Ready,
    TooManyPods(usize),
}

/// Inspect the running agent pods on a node, ignoring the pod that was just deleted
pub fn probe_node(pods: &[Pod], node: &str, replaced: &str) -> NodeState {
    let running: Vec<&Pod> = pods
        .iter()
        .filter(|p| pod_node(p) == Some(node))
        .filter(|p| p.metadata.name.as_deref() != Some(replaced))
        .filter(|p| is_running(p))
        .collect();

    match running.as_slice() {
        [] => NodeState::Waiting,
        [pod] if is_pod_ready(pod) => NodeState::Ready,
        [_] => NodeState::Waiting,
        many => NodeState::TooManyPods(many.len()),
    }
}

/// How often a node is checked before giving up on it
pub fn max_polls(timeout: Duration, splay: Duration) -> u128 {
    if splay.is_zero() {
        return 1;
    }
    timeout.as_millis().div_ceil(splay.as_millis())
}

/// Work out the version running in every listed pod, and which pods run something other than `desired`.
///
/// Pods that were already recorded keep their version, new pods run `desired` as the image is always pulled.
/// While `desired` is empty no version is known, and new pods are left unrecorded.
/// Pods which are not scheduled yet are recorded but never restarted.
pub fn pods_to_restart(
    pods: &[Pod],
    desired: &str,
    recorded: &BTreeMap<String, OneAgentInstance>,
) -> (Vec<Pod>, BTreeMap<String, OneAgentInstance>) {
    let mut stale = Vec::new();
    let mut items = BTreeMap::new();

    for pod in pods {
        let name = pod.name_any();
        let version = match recorded.get(&name) {
            Some(instance) => instance.version.clone(),
            None if desired.is_empty() => continue,
            None => desired.to_owned(),
        };

        if version != desired && pod_node(pod).is_some() {
            stale.push(pod.clone());
        }

        items.insert(
            name,
            OneAgentInstance {
                node_name: pod_node(pod).unwrap_or_default().to_owned(),
                version,
                ready: is_pod_ready(pod),
            },
        );
    }

    (stale, items)
}

/// Replaces stale agent pods one node at a time
pub struct Rollout<'a, S> {
    store: &'a S,
    metrics: &'a Metrics,
    namespace: String,
    instance: String,
    wait_ready: Duration,
}

impl<'a, S: ClusterStore> Rollout<'a, S> {
    pub fn new(store: &'a S, metrics: &'a Metrics, oa: &OneAgent) -> Result<Self> {
        Ok(Self {
            store,
            metrics,
            namespace: oa
                .namespace()
                .ok_or(Error::MissingObjectKey("metadata.namespace"))?,
            instance: oa.name_any(),
            wait_ready: oa.wait_ready(),
        })
    }

    /// Delete each pod in turn, and only move on once its node runs a ready replacement.
    ///
    /// Stops at the first node which fails, pods replaced so far stay replaced.
    pub async fn run(&self, stale: &[Pod]) -> Result<()> {
        for pod in stale {
            let name = pod.name_any();
            let Some(node) = pod_node(pod) else {
                continue;
            };

            info!(pod = %name, node, "Restarting OneAgent pod");
            self.store.delete(pod).await?;
            self.metrics.pod_restarted(&self.namespace, &self.instance);

            self.wait_for_replacement(&name, node).await?;
        }

        Ok(())
    }

    async fn wait_for_replacement(&self, replaced: &str, node: &str) -> Result<()> {
        let labels = agent_labels(&self.instance);
        let polls = max_polls(self.wait_ready, SPLAY);

        for poll in 1..=polls {
            tokio::time::sleep(SPLAY).await;

            // always ask the API server, a cached pod may still claim to be ready
            let pods: Vec<Pod> = match self.store.list(&self.namespace, &labels).await {
                Ok(pods) => pods,
                Err(err) => {
                    warn!(node, "Failed to list OneAgent pods: {err}");
                    continue;
                }
            };

            match probe_node(&pods, node, replaced) {
                NodeState::Ready => {
                    info!(node, "OneAgent pod is ready");
                    return Ok(());
                }
                NodeState::Waiting => {
                    debug!(node, poll, polls, "Waiting for OneAgent pod to become ready")
                }
                NodeState::TooManyPods(count) => {
                    return Err(Error::TooManyPods {
                        node: node.to_owned(),
                        count,
                    })
                }
            }
        }

        Err(Error::RolloutTimeout {
            pod: replaced.to_owned(),
            node: node.to_owned(),
            waited: self.wait_ready,
        })
    }
}
