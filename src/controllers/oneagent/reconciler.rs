use std::time::Duration;

use chrono::{SubsecRound, Utc};
use k8s_openapi::api::core::v1::{Pod, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use super::reconcilers::agent_labels;
use super::reconcilers::daemonset::reconcile_daemonset;
use super::reconcilers::istio::MeshIntegration;
use super::reconcilers::rollout::{pods_to_restart, Rollout};
use super::reconcilers::version::{record_desired_version, resolve_desired_version};
use crate::dynatrace::{Tokens, VendorClientBuilder};
use crate::metrics::Metrics;
use crate::resources::oneagents::{OneAgent, OneAgentStatus};
use crate::store::ClusterStore;
use crate::{Error, Result};

/// Requeue while the OneAgent is still converging
pub const MEDIUM_REQUEUE: Duration = Duration::from_secs(5 * 60);
/// Requeue once the OneAgent has converged
pub const LONG_REQUEUE: Duration = Duration::from_secs(30 * 60);

/// Converges a single OneAgent per call. Holds no state between calls.
pub struct Reconciler<S, B, M> {
    store: S,
    clients: B,
    mesh: M,
    metrics: Metrics,
}

impl<S, B, M> Reconciler<S, B, M>
where
    S: ClusterStore,
    B: VendorClientBuilder,
    M: MeshIntegration,
{
    pub fn new(store: S, clients: B, mesh: M, metrics: Metrics) -> Self {
        Self {
            store,
            clients,
            mesh,
            metrics,
        }
    }

    /// Run one tick for the named OneAgent
    #[instrument(skip(self))]
    pub async fn reconcile(&self, namespace: &str, name: &str) -> Result<Action> {
        let Some(mut oa) = self.store.get::<OneAgent>(namespace, name).await? else {
            // owned objects are garbage collected through their owner references
            debug!("OneAgent no longer exists");
            return Ok(Action::await_change());
        };

        oa.apply_defaults();
        oa.validate()?;

        if oa.spec.tokens.is_empty() {
            info!("Defaulting .spec.tokens to {name}");
            oa.spec.tokens = name.to_owned();
            self.persist(&mut oa).await?;
            return Ok(Action::requeue(Duration::ZERO));
        }

        let client = self.vendor_client(&oa).await?;

        if oa.spec.enable_istio {
            match self.mesh.reconcile(&oa, &client).await {
                Ok(true) => {
                    info!("Updated Istio objects");
                    self.persist(&mut oa).await?;
                    return Ok(Action::requeue(Duration::ZERO));
                }
                Ok(false) => {}
                Err(err) => warn!("Failed to reconcile Istio objects: {err}"),
            }
        }

        let injected_token = oa.ensure_installer_token_env();
        reconcile_daemonset(&self.store, &oa).await?;
        if injected_token {
            // don't start a rollout before the env change is persisted
            self.persist(&mut oa).await?;
            return Ok(Action::requeue(MEDIUM_REQUEUE));
        }

        if oa.spec.disable_agent_update {
            debug!("Automatic OneAgent updates are disabled");
            return Ok(Action::requeue(LONG_REQUEUE));
        }

        if self.reconcile_version(&mut oa, &client).await? {
            self.persist(&mut oa).await?;
            return Ok(Action::requeue(MEDIUM_REQUEUE));
        }

        Ok(Action::requeue(LONG_REQUEUE))
    }

    async fn vendor_client(&self, oa: &OneAgent) -> Result<B::Client> {
        let namespace = oa
            .namespace()
            .ok_or(Error::MissingObjectKey("metadata.namespace"))?;

        let secret: Secret = self
            .store
            .get(&namespace, &oa.spec.tokens)
            .await?
            .ok_or_else(|| Error::SecretNotFound(oa.spec.tokens.clone()))?;

        self.clients.build(&oa.spec, Tokens::from_secret(&secret)?)
    }

    /// Record the desired version and the version of every pod, restarting stale pods along the way.
    ///
    /// Returns true if the status changed. A failed rollout leaves the status untouched.
    async fn reconcile_version(&self, oa: &mut OneAgent, client: &B::Client) -> Result<bool> {
        let namespace = oa
            .namespace()
            .ok_or(Error::MissingObjectKey("metadata.namespace"))?;
        let labels = agent_labels(&oa.name_any());

        let recorded = oa.status.clone().unwrap_or_default();
        let mut status = recorded.clone();

        let desired = resolve_desired_version(client).await;
        if let Some(desired) = &desired {
            record_desired_version(&mut status, desired);
        }
        let target = desired.clone().unwrap_or_else(|| status.version.clone());

        let pods: Vec<Pod> = self.store.list(&namespace, &labels).await?;
        let (stale, mut items) = pods_to_restart(&pods, &target, &status.items);

        // without an answer from the environment there is nothing to roll out
        if desired.is_some() && !stale.is_empty() {
            info!(pods = stale.len(), "Rolling out OneAgent {target}");
            Rollout::new(&self.store, &self.metrics, oa)?
                .run(&stale)
                .await?;

            let pods: Vec<Pod> = self.store.list(&namespace, &labels).await?;
            (_, items) = pods_to_restart(&pods, &target, &items);
        }
        status.items = items;

        if status == recorded {
            return Ok(false);
        }

        oa.status = Some(status);
        Ok(true)
    }

    /// Write the spec and then the status of a OneAgent.
    ///
    /// The spec is written with an empty status, as the status is only ever taken from the status write.
    /// On failure the in-memory status is restored.
    pub async fn persist(&self, oa: &mut OneAgent) -> Result<()> {
        let mut status = oa.status.take().unwrap_or_default();
        // the API server keeps whole seconds
        status.updated_timestamp = Some(Time(Utc::now().trunc_subsecs(0)));

        oa.status = Some(OneAgentStatus::default());
        match self.store.update(oa).await {
            Ok(updated) => *oa = updated,
            Err(err) => {
                oa.status = Some(status);
                return Err(err);
            }
        }

        oa.status = Some(status);
        *oa = self.store.update_status(oa).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};

    use k8s_openapi::api::apps::v1::DaemonSet;
    use k8s_openapi::ByteString;
    use kube::api::ObjectMeta;

    use super::*;
    use crate::controllers::oneagent::reconcilers::rollout::pod_node;
    use crate::controllers::oneagent::reconcilers::testing::{oneagent, running, NAME, NAMESPACE};
    use crate::controllers::oneagent::reconcilers::version::testing::FixedVersion;
    use crate::dynatrace::AgentVersionSource;
    use crate::resources::oneagents::OneAgentSpec;
    use crate::store::testing::MemoryStore;

    /// Hands out clients reporting whatever version is currently set
    #[derive(Clone, Default)]
    struct FakeClients {
        version: Arc<Mutex<Option<String>>>,
        client: Arc<Mutex<Option<FixedVersion>>>,
    }

    impl FakeClients {
        fn set_version(&self, version: Option<&str>) {
            *self.version.lock().unwrap() = version.map(str::to_owned);
        }

        fn calls(&self) -> usize {
            self.client
                .lock()
                .unwrap()
                .as_ref()
                .map_or(0, FixedVersion::calls)
        }
    }

    impl VendorClientBuilder for FakeClients {
        type Client = FixedVersion;

        fn build(&self, _: &OneAgentSpec, tokens: Tokens) -> Result<FixedVersion> {
            assert_eq!(tokens.paas_token, "paas");
            let mut client = self
                .client
                .lock()
                .unwrap()
                .get_or_insert_with(|| FixedVersion::new(None))
                .clone();
            client.version = self.version.lock().unwrap().clone();
            Ok(client)
        }
    }

    #[derive(Clone, Default)]
    struct FakeMesh {
        changed: bool,
        fail: bool,
        calls: Arc<Mutex<usize>>,
    }

    impl MeshIntegration for FakeMesh {
        async fn reconcile<C: AgentVersionSource>(&self, _: &OneAgent, _: &C) -> Result<bool> {
            *self.calls.lock().unwrap() += 1;
            if self.fail {
                return Err(Error::InvalidSpec("no host".into()));
            }
            Ok(self.changed)
        }
    }

    fn secret() -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(NAME.into()),
                namespace: Some(NAMESPACE.into()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([
                ("apiToken".to_owned(), ByteString(b"api".to_vec())),
                ("paasToken".to_owned(), ByteString(b"paas\n".to_vec())),
            ])),
            ..Default::default()
        }
    }

    struct Fixture {
        store: MemoryStore,
        clients: FakeClients,
        mesh: FakeMesh,
        reconciler: Reconciler<MemoryStore, FakeClients, FakeMesh>,
    }

    impl Fixture {
        fn new(oa: OneAgent) -> Self {
            Self::with_mesh(oa, FakeMesh::default())
        }

        fn with_mesh(oa: OneAgent, mesh: FakeMesh) -> Self {
            let store = MemoryStore::default();
            store.insert(oa);
            store.insert(secret());
            let clients = FakeClients::default();
            let reconciler = Reconciler::new(
                store.clone(),
                clients.clone(),
                mesh.clone(),
                Metrics::default(),
            );
            Self {
                store,
                clients,
                mesh,
                reconciler,
            }
        }

        async fn tick(&self) -> Result<Action> {
            self.reconciler.reconcile(NAMESPACE, NAME).await
        }

        /// Tick until the steady state is reached
        async fn converge(&self) {
            for _ in 0..5 {
                if self.tick().await.unwrap() == Action::requeue(LONG_REQUEUE) {
                    self.store.clear_mutations();
                    return;
                }
            }
            panic!("OneAgent did not converge");
        }

        fn stored(&self) -> OneAgent {
            self.store.object(NAMESPACE, NAME).unwrap()
        }

        fn status(&self) -> OneAgentStatus {
            self.stored().status.unwrap_or_default()
        }

        fn replace_pods_on_delete(&self) {
            self.store.on_pod_delete(|old| {
                let node = pod_node(old).unwrap_or_default();
                vec![running(&format!("{}-new", old.name_any()), node)]
            });
        }
    }

    fn without_tokens() -> OneAgent {
        let mut oa = oneagent();
        oa.spec.tokens = String::new();
        oa
    }

    #[tokio::test]
    async fn deleted_oneagent_awaits_change() {
        let fixture = Fixture::new(oneagent());
        fixture.store.remove::<OneAgent>(NAMESPACE, NAME);

        assert_eq!(fixture.tick().await.unwrap(), Action::await_change());
        assert!(fixture.store.mutations().is_empty());
    }

    #[tokio::test]
    async fn invalid_spec_fails_without_writes() {
        let mut oa = oneagent();
        oa.spec.api_url = "ftp://env.live.dynatrace.com".into();
        let fixture = Fixture::new(oa);

        assert!(matches!(fixture.tick().await, Err(Error::InvalidSpec(_))));
        assert!(fixture.store.mutations().is_empty());
    }

    #[tokio::test]
    async fn tokens_are_defaulted_before_anything_else() {
        let fixture = Fixture::new(without_tokens());

        assert_eq!(
            fixture.tick().await.unwrap(),
            Action::requeue(Duration::ZERO)
        );
        assert_eq!(
            fixture.store.mutations(),
            vec!["update OneAgent/oneagent", "update_status OneAgent/oneagent"]
        );
        assert_eq!(fixture.stored().spec.tokens, NAME);
        assert!(fixture
            .store
            .object::<DaemonSet>(NAMESPACE, NAME)
            .is_none());
    }

    #[tokio::test]
    async fn missing_secret_fails_the_tick() {
        let fixture = Fixture::new(oneagent());
        fixture.store.remove::<Secret>(NAMESPACE, NAME);

        assert!(matches!(
            fixture.tick().await,
            Err(Error::SecretNotFound(name)) if name == NAME
        ));
    }

    #[tokio::test]
    async fn converged_oneagent_is_not_written_again() {
        let fixture = Fixture::new(without_tokens());
        fixture.clients.set_version(Some("1.0"));
        fixture.store.insert(running("oneagent-a", "node-a"));
        fixture.store.insert(running("oneagent-b", "node-b"));

        assert_eq!(
            fixture.tick().await.unwrap(),
            Action::requeue(Duration::ZERO)
        );

        fixture.store.clear_mutations();
        assert_eq!(fixture.tick().await.unwrap(), Action::requeue(MEDIUM_REQUEUE));
        assert_eq!(
            fixture.store.mutations(),
            vec![
                "create DaemonSet/oneagent",
                "update OneAgent/oneagent",
                "update_status OneAgent/oneagent"
            ]
        );

        fixture.store.clear_mutations();
        assert_eq!(fixture.tick().await.unwrap(), Action::requeue(MEDIUM_REQUEUE));
        assert_eq!(
            fixture.store.mutations(),
            vec!["update OneAgent/oneagent", "update_status OneAgent/oneagent"]
        );
        let status = fixture.status();
        assert_eq!(status.version, "1.0");
        assert_eq!(status.items.len(), 2);
        assert!(status.items.values().all(|i| i.version == "1.0" && i.ready));
        assert!(status.updated_timestamp.is_some());

        fixture.store.clear_mutations();
        assert_eq!(fixture.tick().await.unwrap(), Action::requeue(LONG_REQUEUE));
        assert!(fixture.store.mutations().is_empty());

        assert_eq!(fixture.tick().await.unwrap(), Action::requeue(LONG_REQUEUE));
        assert!(fixture.store.mutations().is_empty());
    }

    #[tokio::test]
    async fn changed_spec_updates_the_daemonset() {
        let fixture = Fixture::new(oneagent());
        fixture.converge().await;

        let mut oa = fixture.stored();
        oa.spec.image = "registry.local/oneagent:1.2".into();
        fixture.store.update(&oa).await.unwrap();
        fixture.store.clear_mutations();

        assert_eq!(fixture.tick().await.unwrap(), Action::requeue(LONG_REQUEUE));
        assert_eq!(fixture.store.mutations(), vec!["update DaemonSet/oneagent"]);
    }

    #[tokio::test(start_paused = true)]
    async fn new_version_is_rolled_out_node_by_node() {
        let fixture = Fixture::new(oneagent());
        fixture.clients.set_version(Some("1.0"));
        fixture.store.insert(running("oneagent-a", "node-a"));
        fixture.store.insert(running("oneagent-b", "node-b"));
        fixture.converge().await;
        fixture.replace_pods_on_delete();

        fixture.clients.set_version(Some("2.0"));
        assert_eq!(fixture.tick().await.unwrap(), Action::requeue(MEDIUM_REQUEUE));
        assert_eq!(
            fixture.store.mutations(),
            vec![
                "delete Pod/oneagent-a",
                "delete Pod/oneagent-b",
                "update OneAgent/oneagent",
                "update_status OneAgent/oneagent"
            ]
        );

        let status = fixture.status();
        assert_eq!(status.version, "2.0");
        assert_eq!(
            status.items.keys().collect::<Vec<_>>(),
            vec!["oneagent-a-new", "oneagent-b-new"]
        );
        assert!(status.items.values().all(|i| i.version == "2.0"));

        fixture.store.clear_mutations();
        assert_eq!(fixture.tick().await.unwrap(), Action::requeue(LONG_REQUEUE));
        assert!(fixture.store.mutations().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_rollout_keeps_the_recorded_version() {
        let mut oa = oneagent();
        oa.spec.wait_ready_seconds = Some(30);
        let fixture = Fixture::new(oa);
        fixture.clients.set_version(Some("1.0"));
        fixture.store.insert(running("oneagent-a", "node-a"));
        fixture.store.insert(running("oneagent-b", "node-b"));
        fixture.converge().await;

        fixture.clients.set_version(Some("2.0"));
        assert!(matches!(
            fixture.tick().await,
            Err(Error::RolloutTimeout { node, .. }) if node == "node-a"
        ));
        assert_eq!(fixture.store.mutations(), vec!["delete Pod/oneagent-a"]);
        assert_eq!(fixture.status().version, "1.0");
        assert!(fixture.store.object::<Pod>(NAMESPACE, "oneagent-b").is_some());

        // the next tick picks up where this one stopped
        fixture.store.insert(running("oneagent-a-new", "node-a"));
        fixture.replace_pods_on_delete();
        fixture.store.clear_mutations();
        assert_eq!(fixture.tick().await.unwrap(), Action::requeue(MEDIUM_REQUEUE));
        assert_eq!(
            fixture.store.mutations(),
            vec![
                "delete Pod/oneagent-b",
                "update OneAgent/oneagent",
                "update_status OneAgent/oneagent"
            ]
        );
        assert_eq!(fixture.status().version, "2.0");
    }

    #[tokio::test]
    async fn vendor_failure_still_converges_the_daemonset() {
        let fixture = Fixture::new(oneagent());

        assert_eq!(fixture.tick().await.unwrap(), Action::requeue(MEDIUM_REQUEUE));
        assert!(fixture
            .store
            .object::<DaemonSet>(NAMESPACE, NAME)
            .is_some());

        fixture.store.clear_mutations();
        assert_eq!(fixture.tick().await.unwrap(), Action::requeue(LONG_REQUEUE));
        assert!(fixture.store.mutations().is_empty());
        assert_eq!(fixture.status().version, "");
        assert_eq!(fixture.clients.calls(), 1);
    }

    #[tokio::test]
    async fn empty_version_is_ignored() {
        let fixture = Fixture::new(oneagent());
        fixture.clients.set_version(Some("1.0"));
        fixture.store.insert(running("oneagent-a", "node-a"));
        fixture.converge().await;

        fixture.clients.set_version(Some(""));
        assert_eq!(fixture.tick().await.unwrap(), Action::requeue(LONG_REQUEUE));
        assert!(fixture.store.mutations().is_empty());
        assert_eq!(fixture.status().version, "1.0");
        assert_eq!(fixture.status().items["oneagent-a"].version, "1.0");
        assert!(fixture.store.object::<Pod>(NAMESPACE, "oneagent-a").is_some());
    }

    #[tokio::test]
    async fn pods_started_before_any_version_are_not_restarted() {
        let fixture = Fixture::new(oneagent());
        fixture.store.insert(running("oneagent-a", "node-a"));
        fixture.store.insert(running("oneagent-b", "node-b"));
        fixture.converge().await;
        assert!(fixture.status().items.is_empty());

        fixture.clients.set_version(Some("1.0"));
        assert_eq!(fixture.tick().await.unwrap(), Action::requeue(MEDIUM_REQUEUE));
        assert_eq!(
            fixture.store.mutations(),
            vec!["update OneAgent/oneagent", "update_status OneAgent/oneagent"]
        );

        let status = fixture.status();
        assert_eq!(status.version, "1.0");
        assert_eq!(
            status.items.keys().collect::<Vec<_>>(),
            vec!["oneagent-a", "oneagent-b"]
        );
        assert!(status.items.values().all(|i| i.version == "1.0"));
    }

    #[tokio::test]
    async fn disabled_updates_skip_version_checks() {
        let mut oa = oneagent();
        oa.spec.disable_agent_update = true;
        let fixture = Fixture::new(oa);
        fixture.clients.set_version(Some("1.0"));

        fixture.converge().await;
        assert_eq!(fixture.tick().await.unwrap(), Action::requeue(LONG_REQUEUE));
        assert_eq!(fixture.clients.calls(), 0);
        assert_eq!(fixture.status().version, "");
    }

    #[tokio::test]
    async fn mesh_changes_are_persisted_first() {
        let mut oa = oneagent();
        oa.spec.enable_istio = true;
        let fixture = Fixture::with_mesh(
            oa,
            FakeMesh {
                changed: true,
                ..Default::default()
            },
        );

        assert_eq!(
            fixture.tick().await.unwrap(),
            Action::requeue(Duration::ZERO)
        );
        assert_eq!(
            fixture.store.mutations(),
            vec!["update OneAgent/oneagent", "update_status OneAgent/oneagent"]
        );
        assert_eq!(*fixture.mesh.calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn mesh_failures_do_not_block_the_daemonset() {
        let mut oa = oneagent();
        oa.spec.enable_istio = true;
        let fixture = Fixture::with_mesh(
            oa,
            FakeMesh {
                fail: true,
                ..Default::default()
            },
        );

        assert_eq!(fixture.tick().await.unwrap(), Action::requeue(MEDIUM_REQUEUE));
        assert!(fixture
            .store
            .object::<DaemonSet>(NAMESPACE, NAME)
            .is_some());
    }

    #[tokio::test]
    async fn mesh_is_skipped_unless_enabled() {
        let fixture = Fixture::new(oneagent());
        fixture.tick().await.unwrap();
        assert_eq!(*fixture.mesh.calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn persisted_status_reads_back_unchanged() {
        let fixture = Fixture::new(oneagent());
        let mut oa = fixture.stored();
        oa.status = Some(OneAgentStatus {
            version: "1.0".into(),
            ..Default::default()
        });

        fixture.reconciler.persist(&mut oa).await.unwrap();

        assert_eq!(fixture.stored().status, oa.status);
        assert_eq!(fixture.status().version, "1.0");
        assert!(fixture.status().updated_timestamp.is_some());
    }

    #[tokio::test]
    async fn failed_persist_restores_the_status() {
        let fixture = Fixture::new(oneagent());
        let mut oa = fixture.stored();
        oa.status = Some(OneAgentStatus {
            version: "1.0".into(),
            ..Default::default()
        });
        fixture.store.fail_next_status_update();

        assert!(fixture.reconciler.persist(&mut oa).await.is_err());
        assert_eq!(oa.status.unwrap().version, "1.0");
        assert_eq!(fixture.status().version, "");
    }

    #[tokio::test]
    async fn stale_writes_are_rejected() {
        let fixture = Fixture::new(oneagent());
        let mut stale = fixture.stored();

        let mut concurrent = fixture.stored();
        concurrent.spec.args = vec!["--set-host-group=prod".into()];
        fixture.store.update(&concurrent).await.unwrap();

        assert!(matches!(
            fixture.reconciler.persist(&mut stale).await,
            Err(Error::KubeError(kube::Error::Api(err))) if err.code == 409
        ));
    }
}
