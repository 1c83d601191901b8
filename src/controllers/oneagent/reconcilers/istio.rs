use std::future::Future;

use kube::ResourceExt;
use tracing::{debug, info};
use url::Url;

use super::object_meta;
use crate::dynatrace::AgentVersionSource;
use crate::resources::istio::{
    Destination, HttpMatchRequest, HttpRoute, PortSelector, RouteDestination, ServiceEntry,
    ServiceEntryPort, ServiceEntrySpec, TlsMatchAttributes, TlsRoute, VirtualService,
    VirtualServiceSpec,
};
use crate::resources::oneagents::OneAgent;
use crate::store::{ClusterResource, ClusterStore};
use crate::{Error, Result};

/// Hook run before the DaemonSet is converged when `.spec.enableIstio` is set
pub trait MeshIntegration: Send + Sync {
    /// Returns true if anything in the cluster was changed
    fn reconcile<C: AgentVersionSource>(
        &self,
        oa: &OneAgent,
        client: &C,
    ) -> impl Future<Output = Result<bool>> + Send;
}

/// Opens egress from the mesh to the Dynatrace API endpoint
#[derive(Clone)]
pub struct IstioMesh<S> {
    store: S,
}

impl<S: ClusterStore> IstioMesh<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    async fn ensure_created<K: ClusterResource>(&self, obj: K) -> Result<bool> {
        let namespace = obj
            .namespace()
            .ok_or(Error::MissingObjectKey("metadata.namespace"))?;
        let name = obj.name_any();

        if self.store.get::<K>(&namespace, &name).await?.is_some() {
            debug!("{} {name} already exists", K::kind(&()));
            return Ok(false);
        }

        info!("Creating {} {name}", K::kind(&()));
        self.store.create(&obj).await?;
        Ok(true)
    }
}

struct Endpoint<'a> {
    host: &'a str,
    port: u16,
    https: bool,
}

impl<'a> Endpoint<'a> {
    fn from_url(url: &'a Url) -> Result<Self> {
        let host = url
            .host_str()
            .ok_or_else(|| Error::InvalidSpec(format!("{url} has no host")))?;
        let https = url.scheme() == "https";
        let port = url
            .port_or_known_default()
            .unwrap_or(if https { 443 } else { 80 });
        Ok(Self { host, port, https })
    }

    fn protocol(&self) -> &'static str {
        if self.https {
            "HTTPS"
        } else {
            "HTTP"
        }
    }

    fn port_name(&self) -> String {
        format!("{}-{}", self.protocol().to_lowercase(), self.port)
    }
}

fn service_entry(oa: &OneAgent, endpoint: &Endpoint) -> Result<ServiceEntry> {
    let name = format!("{}-{}", oa.name_any(), endpoint.host);
    Ok(ServiceEntry {
        metadata: object_meta(oa, &name)?,
        spec: ServiceEntrySpec {
            hosts: vec![endpoint.host.into()],
            addresses: vec![],
            ports: vec![ServiceEntryPort {
                name: endpoint.port_name(),
                number: endpoint.port,
                protocol: endpoint.protocol().into(),
            }],
            location: Some("MESH_EXTERNAL".into()),
            resolution: Some("DNS".into()),
        },
    })
}

fn virtual_service(oa: &OneAgent, endpoint: &Endpoint) -> Result<VirtualService> {
    let name = format!("{}-{}", oa.name_any(), endpoint.host);
    let route = vec![RouteDestination {
        destination: Destination {
            host: endpoint.host.into(),
            port: Some(PortSelector {
                number: endpoint.port,
            }),
        },
    }];

    let (http, tls) = if endpoint.https {
        (
            vec![],
            vec![TlsRoute {
                r#match: vec![TlsMatchAttributes {
                    sni_hosts: vec![endpoint.host.into()],
                    port: Some(endpoint.port),
                }],
                route,
            }],
        )
    } else {
        (
            vec![HttpRoute {
                r#match: vec![HttpMatchRequest {
                    port: Some(endpoint.port),
                }],
                route,
            }],
            vec![],
        )
    };

    Ok(VirtualService {
        metadata: object_meta(oa, &name)?,
        spec: VirtualServiceSpec {
            hosts: vec![endpoint.host.into()],
            http,
            tls,
        },
    })
}

impl<S: ClusterStore> MeshIntegration for IstioMesh<S> {
    async fn reconcile<C: AgentVersionSource>(&self, oa: &OneAgent, client: &C) -> Result<bool> {
        let endpoint = Endpoint::from_url(client.endpoint())?;

        let created_entry = self.ensure_created(service_entry(oa, &endpoint)?).await?;
        let created_service = self.ensure_created(virtual_service(oa, &endpoint)?).await?;

        Ok(created_entry || created_service)
    }
}
