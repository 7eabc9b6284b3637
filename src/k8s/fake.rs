/// In-memory fake cluster for tests
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;

use super::{ClusterApi, ClusterApiFactory, NodeSummary, PodSummary};

#[derive(Default)]
struct Inner {
    api_healthy: bool,
    nodes: BTreeMap<String, bool>,
    /// (namespace, pod labels, pod)
    pods: Vec<(String, HashMap<String, String>, PodSummary)>,
    secrets: HashMap<(String, String), BTreeMap<String, Vec<u8>>>,
    namespaces: Vec<String>,
    config_maps: HashMap<(String, String), BTreeMap<String, String>>,
}

pub struct FakeClusterApi {
    inner: Mutex<Inner>,
}

impl Default for FakeClusterApi {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeClusterApi {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                api_healthy: true,
                ..Inner::default()
            }),
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn set_api_healthy(&self, healthy: bool) {
        self.inner.lock().unwrap().api_healthy = healthy;
    }

    pub fn set_node(&self, name: &str, ready: bool) {
        self.inner
            .lock()
            .unwrap()
            .nodes
            .insert(name.to_string(), ready);
    }

    /// Populate ready pods for a namespace + label set, replacing earlier
    /// entries with the same labels.
    pub fn set_pods(&self, namespace: &str, labels: &[(&str, &str)], count: u32, healthy: bool) {
        let labels: HashMap<String, String> = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let mut inner = self.inner.lock().unwrap();
        inner
            .pods
            .retain(|(ns, pod_labels, _)| !(ns == namespace && *pod_labels == labels));
        for i in 0..count {
            inner.pods.push((
                namespace.to_string(),
                labels.clone(),
                PodSummary {
                    name: format!("pod-{}", i),
                    phase: if healthy { "Running" } else { "Pending" }.to_string(),
                    ready: healthy,
                },
            ));
        }
    }

    pub fn set_secret(&self, namespace: &str, name: &str, data: BTreeMap<String, Vec<u8>>) {
        self.inner
            .lock()
            .unwrap()
            .secrets
            .insert((namespace.to_string(), name.to_string()), data);
    }

    pub fn namespaces(&self) -> Vec<String> {
        self.inner.lock().unwrap().namespaces.clone()
    }

    pub fn config_map_names(&self) -> Vec<(String, String)> {
        self.inner
            .lock()
            .unwrap()
            .config_maps
            .keys()
            .cloned()
            .collect()
    }

    fn selector_matches(selector: &str, labels: &HashMap<String, String>) -> bool {
        selector.split(',').filter(|s| !s.is_empty()).all(|pair| {
            match pair.split_once('=') {
                Some((k, v)) => labels.get(k.trim()).is_some_and(|found| found == v.trim()),
                None => false,
            }
        })
    }
}

#[async_trait]
impl ClusterApi for FakeClusterApi {
    async fn api_healthy(&self) -> Result<bool> {
        Ok(self.inner.lock().unwrap().api_healthy)
    }

    async fn list_nodes(&self) -> Result<Vec<NodeSummary>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .nodes
            .iter()
            .map(|(name, &ready)| NodeSummary {
                name: name.clone(),
                ready,
            })
            .collect())
    }

    async fn node_ready(&self, name: &str) -> Result<bool> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .nodes
            .get(name)
            .copied()
            .unwrap_or(false))
    }

    async fn delete_node(&self, name: &str) -> Result<()> {
        self.inner.lock().unwrap().nodes.remove(name);
        Ok(())
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<PodSummary>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .pods
            .iter()
            .filter(|(ns, labels, _)| {
                ns == namespace && Self::selector_matches(selector, labels)
            })
            .map(|(_, _, pod)| pod.clone())
            .collect())
    }

    async fn get_secret_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, Vec<u8>>>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .secrets
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn put_secret_key(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: &[u8],
    ) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .secrets
            .entry((namespace.to_string(), name.to_string()))
            .or_default()
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn ensure_namespace(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.namespaces.iter().any(|ns| ns == name) {
            inner.namespaces.push(name.to_string());
        }
        Ok(())
    }

    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .config_maps
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn upsert_config_map(
        &self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, String>,
    ) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .config_maps
            .insert((namespace.to_string(), name.to_string()), data);
        Ok(())
    }
}

/// Factory ignoring the kubeconfig and returning one shared fake.
pub struct FakeClusterApiFactory {
    pub api: Arc<FakeClusterApi>,
}

impl FakeClusterApiFactory {
    pub fn new(api: Arc<FakeClusterApi>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl ClusterApiFactory for FakeClusterApiFactory {
    async fn connect(&self, _kubeconfig: &str) -> Result<Arc<dyn ClusterApi>> {
        Ok(self.api.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pod_selector_matching() {
        let fake = FakeClusterApi::new();
        fake.set_pods("kube-system", &[("k8s-app", "cilium")], 2, true);
        fake.set_pods("kube-system", &[("app", "coredns")], 1, true);

        let cilium = fake
            .list_pods("kube-system", "k8s-app=cilium")
            .await
            .unwrap();
        assert_eq!(cilium.len(), 2);
        assert!(cilium.iter().all(|p| p.is_healthy()));

        let none = fake.list_pods("other", "k8s-app=cilium").await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_set_pods_replaces() {
        let fake = FakeClusterApi::new();
        fake.set_pods("kube-system", &[("k8s-app", "cilium")], 2, false);
        fake.set_pods("kube-system", &[("k8s-app", "cilium")], 2, true);

        let pods = fake
            .list_pods("kube-system", "k8s-app=cilium")
            .await
            .unwrap();
        assert_eq!(pods.len(), 2);
        assert!(pods.iter().all(|p| p.is_healthy()));
    }

    #[tokio::test]
    async fn test_secret_roundtrip() {
        let fake = FakeClusterApi::new();
        fake.put_secret_key("kube-system", "hcloud", "token", b"abc")
            .await
            .unwrap();
        let data = fake
            .get_secret_data("kube-system", "hcloud")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(data.get("token").unwrap(), b"abc");
    }
}
