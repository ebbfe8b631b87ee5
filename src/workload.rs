use crate::annotations::{
    is_managed, mark_deployment_managed, original_replicas, revert_deployment, stamp_update,
    ManagementMode,
};
use crate::event_mapper::hpa_target_deployment;
use crate::hpa::{apply_policy_to_hpa, revert_hpa_by_name};
use crate::resolver::EffectivePolicy;
use crate::types::AffectedDeployment;
use crate::{is_conflict, is_not_found, Error, UPDATE_ATTEMPTS};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use kube::{
    api::{Api, ListParams, PostParams},
    Client,
};
use tracing::*;

/// The HPA scaling a Deployment, if any.
pub async fn find_hpa_for_deployment(
    client: &Client,
    namespace: &str,
    name: &str,
) -> Result<Option<HorizontalPodAutoscaler>, Error> {
    let api = Api::<HorizontalPodAutoscaler>::namespaced(client.clone(), namespace);
    let hpas = api
        .list(&ListParams::default())
        .await
        .map_err(Error::ListHpasFailed)?;
    Ok(hpas.items.into_iter().find(|hpa| {
        hpa_target_deployment(hpa)
            .map(|(hpa_namespace, target)| hpa_namespace == namespace && target == name)
            .unwrap_or(false)
    }))
}

/// Drives one Deployment toward the effective policy. When an HPA selects
/// it, only the management annotations are written here and sizing is
/// delegated to the HPA driver. Returns the status record, or None when the
/// Deployment is gone.
pub async fn apply_policy_to_deployment(
    client: &Client,
    namespace: &str,
    name: &str,
    effective: &EffectivePolicy,
    hpa: Option<&HorizontalPodAutoscaler>,
) -> Result<Option<AffectedDeployment>, Error> {
    let api = Api::<Deployment>::namespaced(client.clone(), namespace);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let Some(mut deployment) = api.get_opt(name).await.map_err(Error::GetDeploymentFailed)?
        else {
            return Ok(None);
        };
        let mode = if hpa.is_some() {
            ManagementMode::Hpa
        } else {
            ManagementMode::Direct
        };
        mark_deployment_managed(&mut deployment, effective.mode.into(), mode, hpa);
        let original = original_replicas(&deployment)
            .map_err(|bad| Error::corrupt_annotation(namespace, name, bad))?;

        if let Some(hpa) = hpa {
            // HPA precedence: the HPA owns spec.replicas, this write carries
            // annotations only.
            match api.replace(name, &PostParams::default(), &deployment).await {
                Ok(_) => {}
                Err(err) if is_conflict(&err) && attempt < UPDATE_ATTEMPTS => continue,
                Err(err) if is_not_found(&err) => return Ok(None),
                Err(err) => return Err(Error::UpdateDeploymentFailed(err)),
            }
            let hpa_name = hpa
                .metadata
                .name
                .as_deref()
                .ok_or(Error::MissingObjectKey(".metadata.name"))?;
            apply_policy_to_hpa(client, namespace, hpa_name, effective).await?;
            let current = deployment
                .spec
                .as_ref()
                .and_then(|spec| spec.replicas)
                .unwrap_or(original);
            return Ok(Some(AffectedDeployment {
                name: name.to_string(),
                namespace: namespace.to_string(),
                original_replicas: original,
                current_replicas: current,
                current_percentage: effective.percentage,
            }));
        }

        let target = effective.target_replicas(original);
        let current = deployment.spec.as_ref().and_then(|spec| spec.replicas);
        if current == Some(target) {
            info!(
                deployment = name,
                namespace = namespace,
                replicas = target,
                "Deployment already at desired replicas, skipping update"
            );
            return Ok(Some(AffectedDeployment {
                name: name.to_string(),
                namespace: namespace.to_string(),
                original_replicas: original,
                current_replicas: target,
                current_percentage: effective.percentage,
            }));
        }

        if let Some(spec) = deployment.spec.as_mut() {
            spec.replicas = Some(target);
        }
        stamp_update(&mut deployment);
        info!(
            deployment = name,
            namespace = namespace,
            original_replicas = original,
            new_replicas = target,
            percentage = effective.percentage,
            "Updating deployment replicas"
        );
        match api.replace(name, &PostParams::default(), &deployment).await {
            Ok(_) => {
                return Ok(Some(AffectedDeployment {
                    name: name.to_string(),
                    namespace: namespace.to_string(),
                    original_replicas: original,
                    current_replicas: target,
                    current_percentage: effective.percentage,
                }))
            }
            Err(err) if is_conflict(&err) && attempt < UPDATE_ATTEMPTS => {
                info!(
                    deployment = name,
                    attempt = attempt,
                    "Conflict while updating deployment, retrying"
                );
                continue;
            }
            Err(err) if is_not_found(&err) => return Ok(None),
            Err(err) => return Err(Error::UpdateDeploymentFailed(err)),
        }
    }
}

/// Reverts a Deployment to its captured original size and strips the
/// management annotations, then does the same for any HPA scaling it.
pub async fn revert_workload(client: &Client, namespace: &str, name: &str) -> Result<(), Error> {
    let api = Api::<Deployment>::namespaced(client.clone(), namespace);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let Some(mut deployment) = api.get_opt(name).await.map_err(Error::GetDeploymentFailed)?
        else {
            break;
        };
        if !is_managed(&deployment) {
            break;
        }
        let changed = revert_deployment(&mut deployment)
            .map_err(|bad| Error::corrupt_annotation(namespace, name, bad))?;
        if !changed {
            break;
        }
        info!(
            deployment = name,
            namespace = namespace,
            "Reverting deployment to original replicas"
        );
        match api.replace(name, &PostParams::default(), &deployment).await {
            Ok(_) => break,
            Err(err) if is_conflict(&err) && attempt < UPDATE_ATTEMPTS => continue,
            Err(err) if is_not_found(&err) => break,
            Err(err) => return Err(Error::UpdateDeploymentFailed(err)),
        }
    }

    if let Some(hpa) = find_hpa_for_deployment(client, namespace, name).await? {
        if let Some(hpa_name) = hpa.metadata.name.as_deref() {
            revert_hpa_by_name(client, namespace, hpa_name).await?;
        }
    }
    Ok(())
}
