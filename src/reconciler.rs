use crate::annotations::{is_managed, is_override_managed};
use crate::event_mapper::GlobalRequest;
use crate::ignore::should_ignore;
use crate::resolver::{effective_for_override, matches_deployment, resolve};
use crate::store::{PolicySnapshot, PolicyStore};
use crate::types::{AffectedDeployment, ReplicasOverride};
use crate::workload::{apply_policy_to_deployment, find_hpa_for_deployment, revert_workload};
use crate::{hpa, is_conflict, is_not_found, Error, UPDATE_ATTEMPTS};
use chrono::Utc;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{
    api::{Api, ListParams, PostParams},
    runtime::controller::Action,
    Client,
};
use kube_client;
use kube_core;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{Duration, MissedTickBehavior};
use tracing::*;

// Data we want access to in error/reconcile calls
pub struct Data {
    pub client: Client,
    pub store: Arc<PolicyStore>,
}

/// What happened to one workload during a pass.
#[derive(Debug)]
pub enum WorkloadOutcome {
    /// Exempted by an ignore rule; previously-managed objects were reverted.
    Ignored { reason: &'static str },
    /// Driven toward its effective policy. `selected` names the override
    /// that produced the policy, if any.
    Managed {
        selected: Option<(String, String)>,
        record: AffectedDeployment,
    },
    /// The Deployment disappeared mid-pass.
    Vanished,
}

fn override_key(override_: &ReplicasOverride) -> Option<(String, String)> {
    Some((
        override_.metadata.namespace.clone()?,
        override_.metadata.name.clone()?,
    ))
}

/// Runs one workload through the management state machine: revert when
/// ignored or orphaned by its override, otherwise drive toward the policy
/// the resolver picks.
pub async fn process_workload(
    client: &Client,
    snapshot: &PolicySnapshot,
    deployment: &Deployment,
) -> Result<WorkloadOutcome, Error> {
    let name = deployment
        .metadata
        .name
        .as_deref()
        .ok_or(Error::MissingObjectKey(".metadata.name"))?;
    let namespace = deployment
        .metadata
        .namespace
        .as_deref()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;

    if let Some(reason) = should_ignore(deployment, snapshot.ignores()) {
        if is_managed(deployment) {
            info!(
                deployment = name,
                namespace = namespace,
                reason = reason,
                "Managed deployment is now ignored, reverting"
            );
            revert_workload(client, namespace, name).await?;
        }
        return Ok(WorkloadOutcome::Ignored { reason });
    }

    let (effective, selected) = resolve(deployment, snapshot);
    if selected.is_none() && is_override_managed(deployment) {
        // The override that managed this deployment is gone and nothing
        // replaced it. Restore the original before global management takes
        // over with a fresh capture.
        revert_workload(client, namespace, name).await?;
    }

    let hpa = find_hpa_for_deployment(client, namespace, name).await?;
    match apply_policy_to_deployment(client, namespace, name, &effective, hpa.as_ref()).await? {
        Some(record) => Ok(WorkloadOutcome::Managed {
            selected: selected.and_then(override_key),
            record,
        }),
        None => Ok(WorkloadOutcome::Vanished),
    }
}

/// Walks every deployment in every namespace through `process_workload`.
/// Failures on one workload or one namespace are logged and skipped, never
/// aborting the pass.
pub async fn sweep_cluster(
    client: &Client,
    snapshot: &PolicySnapshot,
) -> Result<Vec<WorkloadOutcome>, Error> {
    let namespaces = Api::<Namespace>::all(client.clone())
        .list(&ListParams::default())
        .await
        .map_err(Error::ListNamespacesFailed)?;

    // Ignored namespaces are walked too: a deployment managed before its
    // namespace entered an ignore list still has to be reverted, and
    // `process_workload` only gets the chance if it sees the deployment.
    let mut outcomes = Vec::new();
    for namespace in namespaces.items {
        let Some(namespace) = namespace.metadata.name.as_deref() else {
            continue;
        };
        let deployments = match Api::<Deployment>::namespaced(client.clone(), namespace)
            .list(&ListParams::default())
            .await
        {
            Ok(deployments) => deployments,
            Err(err) => {
                warn!(
                    namespace = namespace,
                    "Failed to list deployments, skipping namespace: {}", err
                );
                continue;
            }
        };
        for deployment in &deployments.items {
            match process_workload(client, snapshot, deployment).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => warn!(
                    deployment = deployment.metadata.name.as_deref().unwrap_or_default(),
                    namespace = namespace,
                    "Failed to process deployment, skipping: {}",
                    err
                ),
            }
        }
    }
    Ok(outcomes)
}

/// Controller triggers this on every ReplicasOverride change, on mapped
/// Deployment/HPA changes, and on the periodic requeue.
pub async fn reconcile(
    override_from_cache: Arc<ReplicasOverride>,
    ctx: Arc<Data>,
) -> Result<Action, Error> {
    let client = &ctx.client;

    let name = override_from_cache
        .metadata
        .name
        .as_deref()
        .ok_or(Error::MissingObjectKey(".metadata.name"))?;
    let namespace = override_from_cache
        .metadata
        .namespace
        .as_deref()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;

    let api = Api::<ReplicasOverride>::namespaced(client.clone(), namespace);

    // Get the ReplicasOverride before taking any reconciliation actions.
    let get_result = api.get(name).await;
    match get_result {
        Err(kube_client::error::Error::Api(kube_core::ErrorResponse { reason, .. }))
            if &reason == "NotFound" =>
        {
            info!("{} not found, end reconcile", name);
            return Ok(Action::await_change());
        }
        Err(err) => return Err(Error::OverrideGetFailed(err)),
        _ => {}
    }
    let override_ = get_result.unwrap();
    let snapshot = ctx.store.snapshot();

    // An hpaRef-only override drives the named HPA directly and never walks
    // deployments.
    if let Some(hpa_ref) = override_.spec.hpa_ref.as_ref() {
        let hpa_namespace = if hpa_ref.namespace.is_empty() {
            namespace
        } else {
            hpa_ref.namespace.as_str()
        };
        let effective = effective_for_override(&snapshot.config, &override_);
        hpa::apply_policy_to_hpa(client, hpa_namespace, &hpa_ref.name, &effective).await?;
        update_override_status(client, namespace, name, Vec::new()).await?;
        return Ok(Action::requeue(Duration::from_secs(300)));
    }

    // Cleanup pass: previously-affected deployments that no longer match
    // this override are reverted or handed to whatever policy now applies.
    let previously_affected = override_
        .status
        .as_ref()
        .map(|status| status.affected_deployments.clone())
        .unwrap_or_default();
    for record in &previously_affected {
        let deployment_api = Api::<Deployment>::namespaced(client.clone(), &record.namespace);
        let deployment = match deployment_api.get_opt(&record.name).await {
            Ok(Some(deployment)) => deployment,
            Ok(None) => continue,
            Err(err) => {
                warn!(
                    deployment = record.name.as_str(),
                    namespace = record.namespace.as_str(),
                    "Failed to fetch previously-affected deployment: {}",
                    err
                );
                continue;
            }
        };
        if matches_deployment(&override_, &deployment)
            && should_ignore(&deployment, snapshot.ignores()).is_none()
        {
            continue;
        }
        if let Err(err) = process_workload(client, &snapshot, &deployment).await {
            warn!(
                deployment = record.name.as_str(),
                namespace = record.namespace.as_str(),
                "Failed to revert previously-affected deployment: {}",
                err
            );
        }
    }

    // Full pass over the cluster, collecting the deployments this override
    // now governs.
    let outcomes = sweep_cluster(client, &snapshot).await?;
    let affected: Vec<AffectedDeployment> = outcomes
        .into_iter()
        .filter_map(|outcome| match outcome {
            WorkloadOutcome::Managed {
                selected: Some((selected_namespace, selected_name)),
                record,
            } if selected_namespace == namespace && selected_name == name => Some(record),
            _ => None,
        })
        .collect();

    update_override_status(client, namespace, name, affected).await?;

    Ok(Action::requeue(Duration::from_secs(300)))
}

/// The controller triggers this on reconcile errors
pub fn error_policy(_object: Arc<ReplicasOverride>, error: &Error, _ctx: Arc<Data>) -> Action {
    warn!("Reconcile failed due to error: {}", error);
    Action::requeue(Duration::from_secs(10))
}

/// Read-modify-write of the override status with conflict retry. Skips the
/// write entirely when the affected list is unchanged, so steady state does
/// not churn resource versions.
async fn update_override_status(
    client: &Client,
    namespace: &str,
    name: &str,
    affected: Vec<AffectedDeployment>,
) -> Result<(), Error> {
    let api = Api::<ReplicasOverride>::namespaced(client.clone(), namespace);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let Some(mut latest) = api.get_opt(name).await.map_err(Error::OverrideGetFailed)? else {
            return Ok(());
        };
        let unchanged = latest
            .status
            .as_ref()
            .map(|status| status.affected_deployments == affected)
            .unwrap_or(affected.is_empty());
        if unchanged {
            return Ok(());
        }
        let status = latest.status.get_or_insert_with(Default::default);
        status.affected_deployments = affected.clone();
        status.last_update_time = Some(Time(Utc::now()));
        let data = serde_json::to_vec(&latest).map_err(Error::StatusEncodeFailed)?;
        match api.replace_status(name, &PostParams::default(), data).await {
            Ok(_) => return Ok(()),
            Err(err) if is_conflict(&err) && attempt < UPDATE_ATTEMPTS => continue,
            Err(err) if is_not_found(&err) => return Ok(()),
            Err(err) => return Err(Error::StatusUpdateFailed(err)),
        }
    }
}

/// Serializes global-path reconciliations: targeted requests from the event
/// mappers, full sweeps on policy upheaval, and a periodic sweep bounding
/// drift. The first tick also brings the cluster under management at start.
pub async fn run_global_worker(
    client: Client,
    store: Arc<PolicyStore>,
    mut requests: UnboundedReceiver<GlobalRequest>,
) {
    let mut sweep = tokio::time::interval(Duration::from_secs(300));
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            request = requests.recv() => match request {
                Some(GlobalRequest::Workload { namespace, name }) => {
                    if let Err(err) = reconcile_single_workload(&client, &store, &namespace, &name).await {
                        warn!(
                            deployment = name.as_str(),
                            namespace = namespace.as_str(),
                            "Global reconciliation failed: {}",
                            err
                        );
                    }
                }
                Some(GlobalRequest::AllWorkloads) => run_global_sweep(&client, &store).await,
                None => return,
            },
            _ = sweep.tick() => run_global_sweep(&client, &store).await,
        }
    }
}

async fn reconcile_single_workload(
    client: &Client,
    store: &PolicyStore,
    namespace: &str,
    name: &str,
) -> Result<(), Error> {
    let api = Api::<Deployment>::namespaced(client.clone(), namespace);
    let Some(deployment) = api.get_opt(name).await.map_err(Error::GetDeploymentFailed)? else {
        return Ok(());
    };
    let snapshot = store.snapshot();
    process_workload(client, &snapshot, &deployment).await?;
    Ok(())
}

async fn run_global_sweep(client: &Client, store: &PolicyStore) {
    let snapshot = store.snapshot();
    if let Err(err) = sweep_cluster(client, &snapshot).await {
        warn!("Global sweep failed: {}", err);
    }
}
