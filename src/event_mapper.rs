use crate::ignore::should_ignore;
use crate::resolver::matches_deployment;
use crate::store::PolicySnapshot;
use crate::types::ReplicasOverride;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use kube::runtime::reflector::ObjectRef;

/// A reconciliation request along the global-config path. The source
/// implementation reused the override request key with an empty name for
/// this; a dedicated variant keeps the two paths apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GlobalRequest {
    Workload { namespace: String, name: String },
    AllWorkloads,
}

fn override_ref(override_: &ReplicasOverride) -> Option<ObjectRef<ReplicasOverride>> {
    let name = override_.metadata.name.as_deref()?;
    let namespace = override_.metadata.namespace.as_deref()?;
    Some(ObjectRef::new(name).within(namespace))
}

fn workload_request(deployment: &Deployment) -> Option<GlobalRequest> {
    Some(GlobalRequest::Workload {
        namespace: deployment.metadata.namespace.clone()?,
        name: deployment.metadata.name.clone()?,
    })
}

/// The Deployment an HPA scales, if it targets an apps/v1 Deployment.
pub fn hpa_target_deployment(hpa: &HorizontalPodAutoscaler) -> Option<(String, String)> {
    let spec = hpa.spec.as_ref()?;
    let target = &spec.scale_target_ref;
    if target.kind != "Deployment" || target.api_version.as_deref() != Some("apps/v1") {
        return None;
    }
    Some((hpa.metadata.namespace.clone()?, target.name.clone()))
}

/// A Deployment change maps to one request per matching override, or a
/// global request when none match. Ignored Deployments map to nothing.
pub fn map_deployment_event(
    snapshot: &PolicySnapshot,
    deployment: &Deployment,
) -> (Vec<ObjectRef<ReplicasOverride>>, Option<GlobalRequest>) {
    if should_ignore(deployment, snapshot.ignores()).is_some() {
        return (Vec::new(), None);
    }
    let refs: Vec<_> = snapshot
        .overrides()
        .filter(|override_| matches_deployment(override_, deployment))
        .filter_map(override_ref)
        .collect();
    if refs.is_empty() {
        let request = workload_request(deployment);
        (refs, request)
    } else {
        (refs, None)
    }
}

/// Overrides selecting an HPA directly through hpaRef.
pub fn overrides_for_hpa(
    snapshot: &PolicySnapshot,
    hpa: &HorizontalPodAutoscaler,
) -> Vec<ObjectRef<ReplicasOverride>> {
    let name = hpa.metadata.name.as_deref().unwrap_or_default();
    let namespace = hpa.metadata.namespace.as_deref().unwrap_or_default();
    snapshot
        .overrides()
        .filter(|override_| match &override_.spec.hpa_ref {
            Some(hpa_ref) => {
                hpa_ref.name == name
                    && (hpa_ref.namespace.is_empty() || hpa_ref.namespace == namespace)
            }
            None => false,
        })
        .filter_map(override_ref)
        .collect()
}

/// An HPA change maps through hpaRef overrides plus its target Deployment's
/// own mapping.
pub fn map_hpa_event(
    snapshot: &PolicySnapshot,
    hpa: &HorizontalPodAutoscaler,
    target: Option<&Deployment>,
) -> (Vec<ObjectRef<ReplicasOverride>>, Option<GlobalRequest>) {
    let mut refs = overrides_for_hpa(snapshot, hpa);
    let mut global = None;
    if let Some(deployment) = target {
        let (deployment_refs, deployment_global) = map_deployment_event(snapshot, deployment);
        refs.extend(deployment_refs);
        if refs.is_empty() {
            global = deployment_global;
        }
    }
    (refs, global)
}

/// A config-document change re-evaluates every non-ignored Deployment along
/// the global path.
pub fn map_config_event(snapshot: &PolicySnapshot, deployments: &[Deployment]) -> Vec<GlobalRequest> {
    deployments
        .iter()
        .filter(|deployment| should_ignore(deployment, snapshot.ignores()).is_none())
        .filter_map(workload_request)
        .collect()
}
