use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How an override's percentage combines with the global one.
/// `Override` replaces it, `Additive` shifts it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum OverrideType {
    #[default]
    Override,
    Additive,
}

#[derive(CustomResource, Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[kube(group = "kubedynamicscaler.io", version = "v1", kind = "ReplicasOverride")]
#[kube(shortname = "ro", namespaced, status = "ReplicasOverrideStatus")]
#[kube(printcolumn = r#"{"name":"Type","type":"string","jsonPath":".spec.overrideType"}"#)]
#[kube(printcolumn = r#"{"name":"Percentage","type":"integer","jsonPath":".spec.replicasPercentage"}"#)]
#[kube(printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#)]
#[serde(rename_all = "camelCase")]
pub struct ReplicasOverrideSpec {
    /// Selects Deployments by label. Only one of the three selector forms
    /// should be set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<TargetSelector>,

    /// Direct reference to a single Deployment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_ref: Option<DeploymentReference>,

    /// Direct reference to a single HPA. Such an override drives the HPA's
    /// min/max limits and never touches Deployment replicas.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hpa_ref: Option<HpaReference>,

    #[serde(default)]
    pub override_type: OverrideType,

    /// Percentage of the original replicas, e.g. 150 means 150%.
    #[serde(default = "default_replicas_percentage")]
    #[schemars(range(min = 0, max = 1000))]
    pub replicas_percentage: i32,

    /// Lower bound for the computed size. Falls back to the global config.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(range(min = 1))]
    pub min_replicas: Option<i32>,

    /// Upper bound for the computed size. Falls back to the global config.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(range(min = 1))]
    pub max_replicas: Option<i32>,
}

fn default_replicas_percentage() -> i32 {
    100
}

impl Default for ReplicasOverrideSpec {
    fn default() -> Self {
        ReplicasOverrideSpec {
            selector: None,
            deployment_ref: None,
            hpa_ref: None,
            override_type: OverrideType::default(),
            replicas_percentage: default_replicas_percentage(),
            min_replicas: None,
            max_replicas: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TargetSelector {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentReference {
    pub name: String,
    /// Empty means any namespace.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HpaReference {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReplicasOverrideStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub affected_deployments: Vec<AffectedDeployment>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<Time>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,
}

/// One Deployment currently scaled by an override.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AffectedDeployment {
    pub name: String,
    pub namespace: String,
    pub original_replicas: i32,
    pub current_replicas: i32,
    pub current_percentage: i32,
}

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[kube(group = "kubedynamicscaler.io", version = "v1", kind = "GlobalReplicasIgnore")]
#[kube(shortname = "gri", namespaced, status = "GlobalReplicasIgnoreStatus")]
#[kube(printcolumn = r#"{"name":"Ignored Namespaces","type":"string","jsonPath":".spec.ignoreNamespaces"}"#)]
#[kube(printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#)]
#[serde(rename_all = "camelCase")]
pub struct GlobalReplicasIgnoreSpec {
    /// Namespaces exempt from scaling altogether.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ignore_namespaces: Vec<String>,

    /// Individual workloads exempt from scaling.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ignore_resources: Vec<IgnoredResource>,

    /// Workloads carrying any of these label pairs are exempt.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub ignore_labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum IgnoredResourceKind {
    Deployment,
    StatefulSet,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IgnoredResource {
    pub kind: IgnoredResourceKind,
    pub name: String,
    /// Empty means any namespace.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GlobalReplicasIgnoreStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ignored_deployments: Vec<IgnoredDeployment>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<Time>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IgnoredDeployment {
    pub name: String,
    pub namespace: String,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_spec_defaults() {
        let spec: ReplicasOverrideSpec = serde_yaml::from_str("{}").unwrap();
        assert_eq!(spec.override_type, OverrideType::Override);
        assert_eq!(spec.replicas_percentage, 100);
        assert!(spec.selector.is_none());
        assert!(spec.deployment_ref.is_none());
        assert!(spec.hpa_ref.is_none());
        assert!(spec.min_replicas.is_none());
        assert!(spec.max_replicas.is_none());
    }

    #[test]
    fn override_spec_round_trips_camel_case() {
        let yaml = r#"
deploymentRef:
  name: frontend
  namespace: shop
overrideType: additive
replicasPercentage: 150
minReplicas: 2
"#;
        let spec: ReplicasOverrideSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.override_type, OverrideType::Additive);
        assert_eq!(spec.replicas_percentage, 150);
        let dref = spec.deployment_ref.as_ref().unwrap();
        assert_eq!(dref.name, "frontend");
        assert_eq!(dref.namespace, "shop");
        assert_eq!(spec.min_replicas, Some(2));
    }

    #[test]
    fn ignore_spec_parses_resource_kinds() {
        let yaml = r#"
ignoreNamespaces: [kube-system]
ignoreResources:
  - kind: Deployment
    name: critical-app
  - kind: StatefulSet
    name: etcd
    namespace: infra
ignoreLabels:
  scaling.disabled: "true"
"#;
        let spec: GlobalReplicasIgnoreSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.ignore_namespaces, vec!["kube-system"]);
        assert_eq!(spec.ignore_resources.len(), 2);
        assert_eq!(spec.ignore_resources[0].kind, IgnoredResourceKind::Deployment);
        assert!(spec.ignore_resources[0].namespace.is_empty());
        assert_eq!(spec.ignore_resources[1].kind, IgnoredResourceKind::StatefulSet);
        assert_eq!(spec.ignore_labels.get("scaling.disabled").unwrap(), "true");
    }
}
