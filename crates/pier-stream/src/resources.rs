//! Resource kinds that can be watched and the summaries pushed to clients.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Pods,
    Deployments,
    Services,
    ConfigMaps,
    Secrets,
    StatefulSets,
    DaemonSets,
    Ingresses,
    NetworkPolicies,
    PersistentVolumeClaims,
    Nodes,
    PersistentVolumes,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 12] = [
        ResourceKind::Pods,
        ResourceKind::Deployments,
        ResourceKind::Services,
        ResourceKind::ConfigMaps,
        ResourceKind::Secrets,
        ResourceKind::StatefulSets,
        ResourceKind::DaemonSets,
        ResourceKind::Ingresses,
        ResourceKind::NetworkPolicies,
        ResourceKind::PersistentVolumeClaims,
        ResourceKind::Nodes,
        ResourceKind::PersistentVolumes,
    ];

    /// Lowercase plural as used in URLs and by `kubectl get`.
    pub fn plural(self) -> &'static str {
        match self {
            ResourceKind::Pods => "pods",
            ResourceKind::Deployments => "deployments",
            ResourceKind::Services => "services",
            ResourceKind::ConfigMaps => "configmaps",
            ResourceKind::Secrets => "secrets",
            ResourceKind::StatefulSets => "statefulsets",
            ResourceKind::DaemonSets => "daemonsets",
            ResourceKind::Ingresses => "ingresses",
            ResourceKind::NetworkPolicies => "networkpolicies",
            ResourceKind::PersistentVolumeClaims => "persistentvolumeclaims",
            ResourceKind::Nodes => "nodes",
            ResourceKind::PersistentVolumes => "persistentvolumes",
        }
    }

    /// The object `kind` field.
    pub fn kind_name(self) -> &'static str {
        match self {
            ResourceKind::Pods => "Pod",
            ResourceKind::Deployments => "Deployment",
            ResourceKind::Services => "Service",
            ResourceKind::ConfigMaps => "ConfigMap",
            ResourceKind::Secrets => "Secret",
            ResourceKind::StatefulSets => "StatefulSet",
            ResourceKind::DaemonSets => "DaemonSet",
            ResourceKind::Ingresses => "Ingress",
            ResourceKind::NetworkPolicies => "NetworkPolicy",
            ResourceKind::PersistentVolumeClaims => "PersistentVolumeClaim",
            ResourceKind::Nodes => "Node",
            ResourceKind::PersistentVolumes => "PersistentVolume",
        }
    }

    pub fn is_namespaced(self) -> bool {
        !matches!(self, ResourceKind::Nodes | ResourceKind::PersistentVolumes)
    }

    pub fn from_plural(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.plural() == value)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.plural())
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ObjectMeta {
    name: String,
    namespace: Option<String>,
    labels: BTreeMap<String, String>,
    creation_timestamp: Option<String>,
    resource_version: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct PodShape {
    kind: Option<String>,
    metadata: ObjectMeta,
    spec: PodSpecShape,
    status: PodStatusShape,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct PodSpecShape {
    node_name: Option<String>,
    containers: Vec<NamedShape>,
    init_containers: Vec<NamedShape>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct PodStatusShape {
    phase: Option<String>,
    #[serde(rename = "podIP")]
    pod_ip: Option<String>,
    container_statuses: Vec<ContainerStatusShape>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct NamedShape {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ContainerStatusShape {
    restart_count: u32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GenericShape {
    kind: Option<String>,
    metadata: ObjectMeta,
}

/// Returns `false` when the object carries a `kind` that differs from the
/// expected one. Objects without a `kind` are accepted on shape alone.
fn kind_matches(found: Option<&str>, expected: ResourceKind) -> bool {
    found.map_or(true, |kind| kind == expected.kind_name())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSummary {
    pub name: String,
    pub namespace: String,
    pub phase: String,
    pub node_name: Option<String>,
    #[serde(rename = "podIP")]
    pub pod_ip: Option<String>,
    pub restart_count: u32,
    pub containers: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub creation_timestamp: Option<String>,
}

impl PodSummary {
    pub fn from_object(object: &Value) -> Option<Self> {
        let pod: PodShape = serde_json::from_value(object.clone()).ok()?;
        if !kind_matches(pod.kind.as_deref(), ResourceKind::Pods) || pod.metadata.name.is_empty() {
            return None;
        }
        Some(PodSummary {
            name: pod.metadata.name,
            namespace: pod.metadata.namespace.unwrap_or_default(),
            phase: pod.status.phase.unwrap_or_else(|| "Unknown".to_string()),
            node_name: pod.spec.node_name,
            pod_ip: pod.status.pod_ip,
            restart_count: pod.status.container_statuses.iter().map(|s| s.restart_count).sum(),
            containers: pod.spec.containers.into_iter().map(|c| c.name).collect(),
            labels: pod.metadata.labels,
            creation_timestamp: pod.metadata.creation_timestamp,
        })
    }
}

/// Container names declared by a pod object, init containers included.
pub fn pod_container_names(object: &Value) -> Vec<String> {
    let Ok(pod) = serde_json::from_value::<PodShape>(object.clone()) else {
        return Vec::new();
    };
    pod.spec
        .containers
        .into_iter()
        .chain(pod.spec.init_containers)
        .map(|c| c.name)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSummary {
    pub kind: String,
    pub name: String,
    pub namespace: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub creation_timestamp: Option<String>,
    pub resource_version: Option<String>,
}

impl ResourceSummary {
    pub fn from_object(expected: ResourceKind, object: &Value) -> Option<Self> {
        let shape: GenericShape = serde_json::from_value(object.clone()).ok()?;
        if !kind_matches(shape.kind.as_deref(), expected) || shape.metadata.name.is_empty() {
            return None;
        }
        Some(ResourceSummary {
            kind: expected.kind_name().to_string(),
            name: shape.metadata.name,
            namespace: shape.metadata.namespace,
            labels: shape.metadata.labels,
            creation_timestamp: shape.metadata.creation_timestamp,
            resource_version: shape.metadata.resource_version,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pod() -> Value {
        json!({
            "kind": "Pod",
            "metadata": {
                "name": "web-0",
                "namespace": "shop",
                "labels": {"app": "web"},
                "creationTimestamp": "2024-05-01T10:00:00Z"
            },
            "spec": {
                "nodeName": "node-a",
                "containers": [{"name": "app"}, {"name": "sidecar"}],
                "initContainers": [{"name": "migrate"}]
            },
            "status": {
                "phase": "Running",
                "podIP": "10.1.2.3",
                "containerStatuses": [{"restartCount": 2}, {"restartCount": 1}]
            }
        })
    }

    #[test]
    fn summarizes_pod() {
        let summary = PodSummary::from_object(&pod()).expect("pod summary");
        assert_eq!(summary.name, "web-0");
        assert_eq!(summary.namespace, "shop");
        assert_eq!(summary.phase, "Running");
        assert_eq!(summary.node_name.as_deref(), Some("node-a"));
        assert_eq!(summary.restart_count, 3);
        assert_eq!(summary.containers, vec!["app", "sidecar"]);

        let encoded = serde_json::to_value(&summary).expect("encode");
        assert_eq!(encoded["podIP"], "10.1.2.3");
        assert_eq!(encoded["restartCount"], 3);
    }

    #[test]
    fn container_names_include_init_containers() {
        assert_eq!(pod_container_names(&pod()), vec!["app", "sidecar", "migrate"]);
    }

    #[test]
    fn rejects_other_kinds() {
        let service = json!({"kind": "Service", "metadata": {"name": "web"}});
        assert!(PodSummary::from_object(&service).is_none());
        assert!(ResourceSummary::from_object(ResourceKind::Deployments, &service).is_none());
        let summary = ResourceSummary::from_object(ResourceKind::Services, &service).expect("service");
        assert_eq!(summary.kind, "Service");
    }

    #[test]
    fn plural_round_trips() {
        for kind in ResourceKind::ALL {
            assert_eq!(ResourceKind::from_plural(kind.plural()), Some(kind));
        }
        assert_eq!(ResourceKind::from_plural("widgets"), None);
        assert!(!ResourceKind::Nodes.is_namespaced());
    }
}
