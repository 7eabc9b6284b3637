/// Capability contract over the provisioned Kubernetes cluster
///
/// Mirrors the infrastructure boundary: the engine reads nodes, pods,
/// secrets and writes the addon presence sentinels through this trait; a
/// kube-client implementation and an in-memory fake behave identically.
pub mod fake;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Node, Pod, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::{Api, ListParams, PostParams};
use kube::Client;

pub use fake::FakeClusterApi;

/// Reduced node view.
#[derive(Debug, Clone)]
pub struct NodeSummary {
    pub name: String,
    pub ready: bool,
}

/// Reduced pod view.
#[derive(Debug, Clone)]
pub struct PodSummary {
    pub name: String,
    pub phase: String,
    pub ready: bool,
}

impl PodSummary {
    pub fn is_healthy(&self) -> bool {
        self.phase == "Running" && self.ready
    }
}

#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// True when the API server answers.
    async fn api_healthy(&self) -> Result<bool>;

    async fn list_nodes(&self) -> Result<Vec<NodeSummary>>;

    async fn node_ready(&self, name: &str) -> Result<bool>;

    async fn delete_node(&self, name: &str) -> Result<()>;

    /// Pods matching a `k=v,k=v` label selector in a namespace.
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<PodSummary>>;

    async fn get_secret_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, Vec<u8>>>>;

    /// Create or update one key of a secret; used for the one-time persist
    /// of generated material and for addon credential secrets.
    async fn put_secret_key(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: &[u8],
    ) -> Result<()>;

    async fn ensure_namespace(&self, name: &str) -> Result<()>;

    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>>;

    async fn upsert_config_map(
        &self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, String>,
    ) -> Result<()>;
}

/// Late-bound construction: a real client can only exist once a kubeconfig
/// does, which is mid-reconcile on first provisioning.
#[async_trait]
pub trait ClusterApiFactory: Send + Sync {
    async fn connect(&self, kubeconfig: &str) -> Result<Arc<dyn ClusterApi>>;
}

/// kube-client implementation.
#[derive(Clone)]
pub struct KubeClusterApi {
    client: Client,
}

impl KubeClusterApi {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect with the ambient configuration (in-cluster or KUBECONFIG).
    pub async fn ambient() -> Result<Self> {
        let client = Client::try_default()
            .await
            .context("failed to build Kubernetes client")?;
        Ok(Self { client })
    }

    /// Connect using an explicit kubeconfig document.
    pub async fn from_kubeconfig(kubeconfig: &str) -> Result<Self> {
        let parsed = kube::config::Kubeconfig::from_yaml(kubeconfig)
            .context("failed to parse kubeconfig")?;
        let config = kube::Config::from_custom_kubeconfig(parsed, &Default::default())
            .await
            .context("failed to load kubeconfig")?;
        let client = Client::try_from(config).context("failed to build Kubernetes client")?;
        Ok(Self { client })
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }
}

fn node_is_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

fn pod_summary(pod: &Pod) -> PodSummary {
    let phase = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.clone())
        .unwrap_or_default();
    let ready = pod
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false);
    PodSummary {
        name: pod.metadata.name.clone().unwrap_or_default(),
        phase,
        ready,
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn api_healthy(&self) -> Result<bool> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        Ok(nodes.list(&ListParams::default().limit(1)).await.is_ok())
    }

    async fn list_nodes(&self) -> Result<Vec<NodeSummary>> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let list = nodes
            .list(&ListParams::default())
            .await
            .context("failed to list nodes")?;
        Ok(list
            .items
            .iter()
            .map(|node| NodeSummary {
                name: node.metadata.name.clone().unwrap_or_default(),
                ready: node_is_ready(node),
            })
            .collect())
    }

    async fn node_ready(&self, name: &str) -> Result<bool> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        match nodes.get_opt(name).await.context("failed to get node")? {
            Some(node) => Ok(node_is_ready(&node)),
            None => Ok(false),
        }
    }

    async fn delete_node(&self, name: &str) -> Result<()> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        match nodes.delete(name, &Default::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(err)) if err.code == 404 => Ok(()),
            Err(e) => Err(e).context("failed to delete node"),
        }
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<PodSummary>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let list = pods
            .list(&ListParams::default().labels(selector))
            .await
            .with_context(|| format!("failed to list pods in {}", namespace))?;
        Ok(list.items.iter().map(pod_summary).collect())
    }

    async fn get_secret_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, Vec<u8>>>> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = secrets
            .get_opt(name)
            .await
            .with_context(|| format!("failed to get secret {}/{}", namespace, name))?;
        Ok(secret.map(|s| {
            s.data
                .unwrap_or_default()
                .into_iter()
                .map(|(k, ByteString(v))| (k, v))
                .collect()
        }))
    }

    async fn put_secret_key(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: &[u8],
    ) -> Result<()> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        match secrets.get_opt(name).await? {
            Some(mut secret) => {
                secret
                    .data
                    .get_or_insert_with(BTreeMap::new)
                    .insert(key.to_string(), ByteString(value.to_vec()));
                secret.metadata.managed_fields = None;
                secrets
                    .replace(name, &PostParams::default(), &secret)
                    .await
                    .with_context(|| format!("failed to update secret {}/{}", namespace, name))?;
            }
            None => {
                let mut data = BTreeMap::new();
                data.insert(key.to_string(), ByteString(value.to_vec()));
                let secret = Secret {
                    metadata: ObjectMeta {
                        name: Some(name.to_string()),
                        namespace: Some(namespace.to_string()),
                        ..Default::default()
                    },
                    data: Some(data),
                    ..Default::default()
                };
                secrets
                    .create(&PostParams::default(), &secret)
                    .await
                    .with_context(|| format!("failed to create secret {}/{}", namespace, name))?;
            }
        }
        Ok(())
    }

    async fn ensure_namespace(&self, name: &str) -> Result<()> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        match namespaces.create(&PostParams::default(), &namespace).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(err)) if err.code == 409 => Ok(()),
            Err(e) => Err(e).with_context(|| format!("failed to create namespace {}", name)),
        }
    }

    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>> {
        let config_maps: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let cm = config_maps
            .get_opt(name)
            .await
            .with_context(|| format!("failed to get configmap {}/{}", namespace, name))?;
        Ok(cm.map(|cm| cm.data.unwrap_or_default()))
    }

    async fn upsert_config_map(
        &self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, String>,
    ) -> Result<()> {
        let config_maps: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let desired = ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        };
        match config_maps.create(&PostParams::default(), &desired).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(err)) if err.code == 409 => {
                config_maps
                    .replace(name, &PostParams::default(), &desired)
                    .await
                    .with_context(|| {
                        format!("failed to update configmap {}/{}", namespace, name)
                    })?;
                Ok(())
            }
            Err(e) => Err(e).with_context(|| format!("failed to create configmap {}/{}", namespace, name)),
        }
    }
}

/// Factory producing real clients from an in-memory kubeconfig.
pub struct KubeClusterApiFactory;

#[async_trait]
impl ClusterApiFactory for KubeClusterApiFactory {
    async fn connect(&self, kubeconfig: &str) -> Result<Arc<dyn ClusterApi>> {
        Ok(Arc::new(KubeClusterApi::from_kubeconfig(kubeconfig).await?))
    }
}
