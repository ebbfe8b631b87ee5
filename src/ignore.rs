use crate::types::{GlobalReplicasIgnore, IgnoredResourceKind};
use k8s_openapi::api::apps::v1::Deployment;

pub const REASON_NAMESPACE: &str = "Namespace is in ignore list";
pub const REASON_RESOURCE: &str = "Deployment is in ignore list";
pub const REASON_LABEL: &str = "Deployment has ignored label";

/// Whether a single ignore rule exempts the Deployment, and why. Rules are
/// checked in order: namespace, resource, label.
pub fn should_ignore_by(
    deployment: &Deployment,
    ignore: &GlobalReplicasIgnore,
) -> Option<&'static str> {
    let name = deployment.metadata.name.as_deref().unwrap_or_default();
    let namespace = deployment.metadata.namespace.as_deref().unwrap_or_default();

    if ignore
        .spec
        .ignore_namespaces
        .iter()
        .any(|ns| ns == namespace)
    {
        return Some(REASON_NAMESPACE);
    }

    for resource in &ignore.spec.ignore_resources {
        if resource.kind == IgnoredResourceKind::Deployment
            && resource.name == name
            && (resource.namespace.is_empty() || resource.namespace == namespace)
        {
            return Some(REASON_RESOURCE);
        }
    }

    if let Some(labels) = deployment.metadata.labels.as_ref() {
        for (key, value) in &ignore.spec.ignore_labels {
            if labels.get(key) == Some(value) {
                return Some(REASON_LABEL);
            }
        }
    }

    None
}

/// Whether any ignore rule exempts the Deployment. Namespace rules are
/// checked across every ignore first, then resources, then labels, so the
/// reported reason is stable regardless of which object carries the rule.
pub fn should_ignore<'a, I>(deployment: &Deployment, ignores: I) -> Option<&'static str>
where
    I: IntoIterator<Item = &'a GlobalReplicasIgnore> + Clone,
{
    let namespace = deployment.metadata.namespace.as_deref().unwrap_or_default();
    if ignores
        .clone()
        .into_iter()
        .any(|ignore| ignore.spec.ignore_namespaces.iter().any(|ns| ns == namespace))
    {
        return Some(REASON_NAMESPACE);
    }

    let name = deployment.metadata.name.as_deref().unwrap_or_default();
    for ignore in ignores.clone() {
        for resource in &ignore.spec.ignore_resources {
            if resource.kind == IgnoredResourceKind::Deployment
                && resource.name == name
                && (resource.namespace.is_empty() || resource.namespace == namespace)
            {
                return Some(REASON_RESOURCE);
            }
        }
    }

    if let Some(labels) = deployment.metadata.labels.as_ref() {
        for ignore in ignores {
            for (key, value) in &ignore.spec.ignore_labels {
                if labels.get(key) == Some(value) {
                    return Some(REASON_LABEL);
                }
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GlobalReplicasIgnoreSpec, IgnoredResource};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn deployment(name: &str, namespace: &str, labels: &[(&str, &str)]) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                labels: if labels.is_empty() {
                    None
                } else {
                    Some(
                        labels
                            .iter()
                            .map(|(k, v)| (k.to_string(), v.to_string()))
                            .collect(),
                    )
                },
                ..ObjectMeta::default()
            },
            ..Deployment::default()
        }
    }

    fn ignore(spec: GlobalReplicasIgnoreSpec) -> GlobalReplicasIgnore {
        GlobalReplicasIgnore::new("rules", spec)
    }

    #[test]
    fn ignores_by_namespace() {
        let rules = ignore(GlobalReplicasIgnoreSpec {
            ignore_namespaces: vec!["kube-system".to_string()],
            ..GlobalReplicasIgnoreSpec::default()
        });
        let d = deployment("coredns", "kube-system", &[]);
        assert_eq!(should_ignore_by(&d, &rules), Some(REASON_NAMESPACE));
        assert_eq!(should_ignore(&d, [&rules]), Some(REASON_NAMESPACE));
    }

    #[test]
    fn ignores_by_resource_name() {
        let rules = ignore(GlobalReplicasIgnoreSpec {
            ignore_resources: vec![IgnoredResource {
                kind: IgnoredResourceKind::Deployment,
                name: "critical-app".to_string(),
                namespace: "production".to_string(),
            }],
            ..GlobalReplicasIgnoreSpec::default()
        });
        let d = deployment("critical-app", "production", &[]);
        assert_eq!(should_ignore_by(&d, &rules), Some(REASON_RESOURCE));
        // Same name elsewhere is not exempt.
        let other = deployment("critical-app", "staging", &[]);
        assert_eq!(should_ignore_by(&other, &rules), None);
    }

    #[test]
    fn resource_without_namespace_matches_anywhere() {
        let rules = ignore(GlobalReplicasIgnoreSpec {
            ignore_resources: vec![IgnoredResource {
                kind: IgnoredResourceKind::Deployment,
                name: "critical-app".to_string(),
                namespace: String::new(),
            }],
            ..GlobalReplicasIgnoreSpec::default()
        });
        let d = deployment("critical-app", "staging", &[]);
        assert_eq!(should_ignore_by(&d, &rules), Some(REASON_RESOURCE));
    }

    #[test]
    fn statefulset_rules_do_not_match_deployments() {
        let rules = ignore(GlobalReplicasIgnoreSpec {
            ignore_resources: vec![IgnoredResource {
                kind: IgnoredResourceKind::StatefulSet,
                name: "critical-app".to_string(),
                namespace: String::new(),
            }],
            ..GlobalReplicasIgnoreSpec::default()
        });
        let d = deployment("critical-app", "production", &[]);
        assert_eq!(should_ignore_by(&d, &rules), None);
    }

    #[test]
    fn ignores_by_label_value() {
        let mut labels = BTreeMap::new();
        labels.insert("scaling.disabled".to_string(), "true".to_string());
        let rules = ignore(GlobalReplicasIgnoreSpec {
            ignore_labels: labels,
            ..GlobalReplicasIgnoreSpec::default()
        });
        let d = deployment("web", "default", &[("scaling.disabled", "true")]);
        assert_eq!(should_ignore_by(&d, &rules), Some(REASON_LABEL));
        // The value has to match exactly.
        let other = deployment("web", "default", &[("scaling.disabled", "false")]);
        assert_eq!(should_ignore_by(&other, &rules), None);
    }

    #[test]
    fn namespace_reason_wins_across_rules() {
        let by_label = ignore(GlobalReplicasIgnoreSpec {
            ignore_labels: [("tier".to_string(), "infra".to_string())].into(),
            ..GlobalReplicasIgnoreSpec::default()
        });
        let by_namespace = ignore(GlobalReplicasIgnoreSpec {
            ignore_namespaces: vec!["infra".to_string()],
            ..GlobalReplicasIgnoreSpec::default()
        });
        let d = deployment("web", "infra", &[("tier", "infra")]);
        assert_eq!(
            should_ignore(&d, [&by_label, &by_namespace]),
            Some(REASON_NAMESPACE)
        );
    }

    #[test]
    fn unmatched_deployment_is_eligible() {
        let rules = ignore(GlobalReplicasIgnoreSpec {
            ignore_namespaces: vec!["kube-system".to_string()],
            ..GlobalReplicasIgnoreSpec::default()
        });
        let d = deployment("web", "default", &[]);
        assert_eq!(should_ignore(&d, [&rules]), None);
    }
}
