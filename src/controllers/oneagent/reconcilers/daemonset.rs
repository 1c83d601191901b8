use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, ExecAction, HostPathVolumeSource, PodSpec, PodTemplateSpec, Probe,
    ResourceRequirements, SecurityContext, Toleration, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use tracing::{debug, info};

use super::{agent_labels, label_selector, object_meta};
use crate::resources::oneagents::{OneAgent, OneAgentSpec};
use crate::store::ClusterStore;
use crate::{Error, Result};

pub const CONTAINER_NAME: &str = "dynatrace-oneagent";
pub const SERVICE_ACCOUNT_NAME: &str = "dynatrace-oneagent";

const HOST_ROOT_VOLUME: &str = "host-root";
const HOST_ROOT_MOUNT_PATH: &str = "/mnt/root";

fn oneagent_container(spec: &OneAgentSpec) -> Container {
    Container {
        name: CONTAINER_NAME.into(),
        image: Some(spec.image.clone()),
        image_pull_policy: Some("Always".into()),
        args: Some(spec.args.clone()),
        env: Some(spec.env.clone()),
        resources: spec.resources.clone(),
        // the watchdog process name is truncated to 15 characters in /proc/<pid>/stat
        readiness_probe: Some(Probe {
            exec: Some(ExecAction {
                command: Some(vec![
                    "/bin/sh".into(),
                    "-c".into(),
                    "grep -q oneagentwatchdo /proc/[0-9]*/stat".into(),
                ]),
            }),
            initial_delay_seconds: Some(30),
            period_seconds: Some(30),
            timeout_seconds: Some(1),
            ..Default::default()
        }),
        security_context: Some(SecurityContext {
            privileged: Some(true),
            ..Default::default()
        }),
        volume_mounts: Some(vec![VolumeMount {
            name: HOST_ROOT_VOLUME.into(),
            mount_path: HOST_ROOT_MOUNT_PATH.into(),
            ..Default::default()
        }]),
        ..Default::default()
    }
}

/// The pod spec running the OneAgent on every selected node
pub fn oneagent_pod_spec(spec: &OneAgentSpec) -> PodSpec {
    PodSpec {
        containers: vec![oneagent_container(spec)],
        host_network: Some(true),
        host_pid: Some(true),
        host_ipc: Some(true),
        node_selector: Some(spec.node_selector.clone()),
        priority_class_name: spec.priority_class_name.clone(),
        service_account_name: Some(SERVICE_ACCOUNT_NAME.into()),
        tolerations: Some(spec.tolerations.clone()),
        volumes: Some(vec![Volume {
            name: HOST_ROOT_VOLUME.into(),
            host_path: Some(HostPathVolumeSource {
                path: "/".into(),
                type_: None,
            }),
            ..Default::default()
        }]),
        ..Default::default()
    }
}

pub fn oneagent_daemonset(oa: &OneAgent) -> Result<DaemonSet> {
    let name = oa.name_any();

    Ok(DaemonSet {
        metadata: object_meta(oa, &name)?,
        spec: Some(DaemonSetSpec {
            selector: label_selector(&name),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(agent_labels(&name)),
                    ..Default::default()
                }),
                spec: Some(oneagent_pod_spec(&oa.spec)),
            },
            ..Default::default()
        }),
        status: None,
    })
}

/// The parts of the pod template which follow the OneAgent spec.
///
/// Unset and empty values compare equal, as the API server drops empty collections.
#[derive(Debug, PartialEq)]
struct TemplateFields<'a> {
    image: Option<&'a str>,
    args: &'a [String],
    env: &'a [EnvVar],
    resources: Option<&'a ResourceRequirements>,
    node_selector: Option<&'a BTreeMap<String, String>>,
    tolerations: &'a [Toleration],
    priority_class_name: Option<&'a str>,
}

fn template_fields(pod: &PodSpec) -> Option<TemplateFields<'_>> {
    let container = pod.containers.iter().find(|c| c.name == CONTAINER_NAME)?;

    Some(TemplateFields {
        image: container.image.as_deref().filter(|i| !i.is_empty()),
        args: container.args.as_deref().unwrap_or_default(),
        env: container.env.as_deref().unwrap_or_default(),
        resources: container
            .resources
            .as_ref()
            .filter(|r| **r != ResourceRequirements::default()),
        node_selector: pod.node_selector.as_ref().filter(|m| !m.is_empty()),
        tolerations: pod.tolerations.as_deref().unwrap_or_default(),
        priority_class_name: pod.priority_class_name.as_deref().filter(|p| !p.is_empty()),
    })
}

/// Whether the actual pod template has drifted from what the spec asks for
pub fn has_spec_changed(actual: Option<&PodTemplateSpec>, spec: &OneAgentSpec) -> bool {
    let desired = oneagent_pod_spec(spec);
    let Some(actual) = actual.and_then(|t| t.spec.as_ref()) else {
        return true;
    };

    match (template_fields(actual), template_fields(&desired)) {
        (Some(actual), Some(desired)) => actual != desired,
        _ => true,
    }
}

/// Create the DaemonSet if it is missing, or replace it if its template drifted from the spec.
///
/// Returns true if the DaemonSet was written.
pub async fn reconcile_daemonset<S: ClusterStore>(store: &S, oa: &OneAgent) -> Result<bool> {
    let mut desired = oneagent_daemonset(oa)?;
    let namespace = oa
        .namespace()
        .ok_or(Error::MissingObjectKey("metadata.namespace"))?;
    let name = oa.name_any();

    match store.get::<DaemonSet>(&namespace, &name).await? {
        None => {
            info!("Creating DaemonSet {name}");
            store.create(&desired).await?;
            Ok(true)
        }
        Some(actual) => {
            let template = actual.spec.as_ref().map(|s| &s.template);
            if !has_spec_changed(template, &oa.spec) {
                debug!("DaemonSet {name} is up to date");
                return Ok(false);
            }

            info!("Updating DaemonSet {name}");
            desired.metadata.resource_version = actual.metadata.resource_version;
            store.update(&desired).await?;
            Ok(true)
        }
    }
}
