//! Kubernetes API adapter
//!
//! Reads Services and the local Node through `kube`, and turns the Service
//! watch into a stream of [`ServiceKey`]s. Only keys travel to the
//! reconciler: it re-reads the Service itself, so a stale watch object can
//! never be applied.

use crate::core::error::Result;
use crate::reconciler::ClusterSource;
use crate::service::{PodCidrs, ServiceKey, ServiceRecord};
use futures::stream::BoxStream;
use futures::{StreamExt, future};
use k8s_openapi::api::core::v1::{Node, Service};
use kube::api::ListParams;
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Api, Client};
use tracing::{debug, warn};

#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    /// Connects with the in-cluster service account, or the local kubeconfig.
    ///
    /// # Errors
    ///
    /// Returns `Err` if no usable client configuration is found.
    pub async fn connect() -> Result<Self> {
        let client = Client::try_default().await?;
        Ok(Self { client })
    }

    /// Pod CIDRs from `spec.podCIDRs` of `node_name`.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the Node cannot be read.
    pub async fn node_pod_cidrs(&self, node_name: &str) -> Result<PodCidrs> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let node = nodes.get(node_name).await?;
        let cidrs = PodCidrs::from_node(&node);
        debug!(node = node_name, ?cidrs, "node pod CIDRs");
        Ok(cidrs)
    }

    /// Keys of Services as they are added, changed or deleted.
    ///
    /// The initial listing is delivered as ordinary events. Watch errors are
    /// logged and retried with backoff; the stream does not end on its own.
    pub fn service_keys(&self) -> BoxStream<'static, ServiceKey> {
        let services: Api<Service> = Api::all(self.client.clone());
        watcher(services, watcher::Config::default())
            .default_backoff()
            .filter_map(|event| {
                future::ready(match event {
                    Ok(
                        watcher::Event::Apply(svc)
                        | watcher::Event::InitApply(svc)
                        | watcher::Event::Delete(svc),
                    ) => Some(ServiceKey::of(&svc)),
                    Ok(watcher::Event::Init | watcher::Event::InitDone) => None,
                    Err(e) => {
                        warn!("Service watch error: {e}");
                        None
                    }
                })
            })
            .boxed()
    }
}

impl ClusterSource for KubeCluster {
    async fn get_service(&self, key: &ServiceKey) -> Result<Option<ServiceRecord>> {
        let services: Api<Service> = Api::namespaced(self.client.clone(), &key.namespace);
        let service = services.get_opt(&key.name).await?;
        Ok(service.as_ref().map(ServiceRecord::from_service))
    }

    async fn list_services(&self) -> Result<Vec<ServiceRecord>> {
        let services: Api<Service> = Api::all(self.client.clone());
        let list = services.list(&ListParams::default()).await?;
        Ok(list.items.iter().map(ServiceRecord::from_service).collect())
    }
}
