use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::DaemonSet;
use kube::runtime::events::Recorder;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{
    api::{Api, ListParams, ResourceExt},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        events::{Event, EventType},
        watcher::Config,
    },
    Resource,
};
use tokio::sync::RwLock;
use tracing::*;

use crate::controllers::{Diagnostics, State};
use crate::dynatrace::DynatraceClientBuilder;
use crate::resources::oneagents::OneAgent;
use crate::store::KubeStore;
use crate::{telemetry, Error, Metrics, Result};

use super::reconciler::Reconciler;
use super::reconcilers::istio::IstioMesh;
use super::reconcilers::{APP_MANAGED_BY_LABEL, MANAGED_BY};

type OneAgentReconciler = Reconciler<KubeStore, DynatraceClientBuilder, IstioMesh<KubeStore>>;

// Context for our reconciler
pub(super) struct Context {
    /// Converges a single OneAgent
    pub reconciler: OneAgentReconciler,
    /// Kubernetes event recorder
    pub recorder: Recorder,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Metrics,
    /// Delay before retrying a failed reconciliation
    pub error_requeue: Duration,
}

impl Context {
    pub fn new(client: Client, metrics: Metrics, state: State) -> Arc<Context> {
        let store = KubeStore::new(client.clone());
        Arc::new(Context {
            reconciler: Reconciler::new(
                store.clone(),
                DynatraceClientBuilder,
                IstioMesh::new(store),
                metrics.clone(),
            ),
            recorder: Recorder::new(client, "oneagent-operator".into()),
            diagnostics: state.diagnostics.clone(),
            metrics,
            error_requeue: state.error_requeue,
        })
    }
}

#[instrument(skip(ctx, oa), fields(namespace = %oa.namespace().unwrap_or_default(), name = %oa.name_any(), trace_id))]
async fn reconcile(oa: Arc<OneAgent>, ctx: Arc<Context>) -> Result<Action> {
    if let Some(trace_id) = telemetry::get_trace_id() {
        Span::current().record("trace_id", field::display(&trace_id));
    }
    let _timer = ctx.metrics.count_and_measure::<OneAgent>();
    ctx.diagnostics.write().await.last_event = Utc::now();

    let namespace = oa
        .namespace()
        .ok_or(Error::MissingObjectKey("metadata.namespace"))?;
    let name = oa.name_any();

    info!("Reconciling OneAgent \"{name}\"");
    match ctx.reconciler.reconcile(&namespace, &name).await {
        Ok(action) => Ok(action),
        Err(err) => {
            warn!("reconcile failed: {:?}", err);

            ctx.recorder
                .publish(
                    &Event {
                        type_: EventType::Warning,
                        reason: "FailedReconcile".into(),
                        note: Some(err.to_string()),
                        action: "Reconcile".into(),
                        secondary: None,
                    },
                    &oa.object_ref(&()),
                )
                .await?;

            ctx.metrics.reconcile_failure(oa.as_ref(), &err);
            Err(err)
        }
    }
}

fn error_policy(_oa: Arc<OneAgent>, _error: &Error, ctx: Arc<Context>) -> Action {
    Action::requeue(ctx.error_requeue)
}

/// Run the OneAgent controller until a shutdown signal arrives
pub async fn run(client: Client, metrics: Metrics, state: State) {
    let (oa_api, ds_api) = match &state.watch_namespace {
        Some(namespace) => (
            Api::<OneAgent>::namespaced(client.clone(), namespace),
            Api::<DaemonSet>::namespaced(client.clone(), namespace),
        ),
        None => (
            Api::<OneAgent>::all(client.clone()),
            Api::<DaemonSet>::all(client.clone()),
        ),
    };

    if let Err(e) = oa_api.list(&ListParams::default().limit(1)).await {
        error!("OneAgent is not queryable; {e:?}. Is the CRD installed?");
        std::process::exit(1);
    }

    // all daemonsets we create have this label
    let cfg = Config::default().labels(&format!("{APP_MANAGED_BY_LABEL}={MANAGED_BY}"));

    let ds_watcher = watcher(ds_api, cfg)
        .map(|event| ensure_deletion_change(event))
        .touched_objects()
        .predicate_filter(changed_predicate);

    Controller::new(oa_api, Config::default())
        .shutdown_on_signal()
        .owns_stream(ds_watcher)
        .run(reconcile, error_policy, Context::new(client, metrics, state))
        .filter_map(|x| async move { Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}

// deletion apparently doesn't lead to any change in metadata otherwise, which means the changed_predicate
// would drop them.
fn ensure_deletion_change<K: Resource, E>(
    mut event: Result<watcher::Event<K>, E>,
) -> Result<watcher::Event<K>, E> {
    if let Ok(watcher::Event::Delete(ref mut object)) = event {
        let meta = object.meta_mut();
        meta.generation = match meta.generation {
            Some(val) => Some(val + 1),
            None => Some(0),
        }
    }
    event
}

fn changed_predicate<K: Resource>(obj: &K) -> Option<u64> {
    let mut hasher = DefaultHasher::new();
    if let Some(g) = obj.meta().generation {
        // covers spec but not metadata or status
        g.hash(&mut hasher)
    }
    obj.labels().hash(&mut hasher);
    obj.annotations().hash(&mut hasher);
    // ignore status
    Some(hasher.finish())
}
