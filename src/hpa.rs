use crate::annotations::{
    is_hpa_managed, mark_hpa_managed, original_hpa_limits, revert_hpa, stamp_hpa_update,
};
use crate::resolver::EffectivePolicy;
use crate::{is_conflict, is_not_found, Error, UPDATE_ATTEMPTS};
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use kube::{
    api::{Api, PostParams},
    Client,
};
use tracing::*;

/// Drives an HPA's min/max toward the effective policy. Captures the
/// original limits on first contact and skips the write when already
/// converged. Returns the applied limits, or None when the HPA is gone.
pub async fn apply_policy_to_hpa(
    client: &Client,
    namespace: &str,
    name: &str,
    effective: &EffectivePolicy,
) -> Result<Option<(i32, i32)>, Error> {
    let api = Api::<HorizontalPodAutoscaler>::namespaced(client.clone(), namespace);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let Some(mut hpa) = api.get_opt(name).await.map_err(Error::GetHpaFailed)? else {
            return Ok(None);
        };
        mark_hpa_managed(&mut hpa, effective.mode.into());
        let (original_min, original_max) = original_hpa_limits(&hpa)
            .map_err(|bad| Error::corrupt_annotation(namespace, name, bad))?;
        let (new_min, new_max) = effective.hpa_limits(original_min, original_max);

        let converged = hpa
            .spec
            .as_ref()
            .map(|spec| spec.min_replicas == Some(new_min) && spec.max_replicas == new_max)
            .unwrap_or(false);
        if converged {
            return Ok(Some((new_min, new_max)));
        }

        if let Some(spec) = hpa.spec.as_mut() {
            spec.min_replicas = Some(new_min);
            spec.max_replicas = new_max;
        }
        stamp_hpa_update(&mut hpa);

        info!(
            hpa = name,
            namespace = namespace,
            original_min = original_min,
            original_max = original_max,
            new_min = new_min,
            new_max = new_max,
            percentage = effective.percentage,
            "Updating HPA limits"
        );
        match api.replace(name, &PostParams::default(), &hpa).await {
            Ok(_) => return Ok(Some((new_min, new_max))),
            Err(err) if is_conflict(&err) && attempt < UPDATE_ATTEMPTS => {
                info!(hpa = name, attempt = attempt, "Conflict while updating HPA, retrying");
                continue;
            }
            Err(err) if is_not_found(&err) => return Ok(None),
            Err(err) => return Err(Error::UpdateHpaFailed(err)),
        }
    }
}

/// Restores a managed HPA to its captured original limits and strips the
/// management annotations. No-op for unmanaged or missing HPAs.
pub async fn revert_hpa_by_name(client: &Client, namespace: &str, name: &str) -> Result<(), Error> {
    let api = Api::<HorizontalPodAutoscaler>::namespaced(client.clone(), namespace);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let Some(mut hpa) = api.get_opt(name).await.map_err(Error::GetHpaFailed)? else {
            return Ok(());
        };
        if !is_hpa_managed(&hpa) {
            return Ok(());
        }
        let changed =
            revert_hpa(&mut hpa).map_err(|bad| Error::corrupt_annotation(namespace, name, bad))?;
        if !changed {
            return Ok(());
        }
        info!(hpa = name, namespace = namespace, "Reverting HPA to original limits");
        match api.replace(name, &PostParams::default(), &hpa).await {
            Ok(_) => return Ok(()),
            Err(err) if is_conflict(&err) && attempt < UPDATE_ATTEMPTS => continue,
            Err(err) if is_not_found(&err) => return Ok(()),
            Err(err) => return Err(Error::UpdateHpaFailed(err)),
        }
    }
}
