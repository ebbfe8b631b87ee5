use crate::ignore::should_ignore_by;
use crate::reconciler::Data;
use crate::types::{GlobalReplicasIgnore, IgnoredDeployment};
use crate::{is_conflict, is_not_found, Error, UPDATE_ATTEMPTS};
use chrono::Utc;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{
    api::{Api, ListParams, PostParams},
    runtime::controller::Action,
    Client,
};
use kube_client;
use kube_core;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::*;

/// Mirrors the set of currently-ignored deployments into the ignore
/// object's status.
pub async fn reconcile(
    ignore_from_cache: Arc<GlobalReplicasIgnore>,
    ctx: Arc<Data>,
) -> Result<Action, Error> {
    let client = &ctx.client;

    let name = ignore_from_cache
        .metadata
        .name
        .as_deref()
        .ok_or(Error::MissingObjectKey(".metadata.name"))?;
    let namespace = ignore_from_cache
        .metadata
        .namespace
        .as_deref()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;

    let api = Api::<GlobalReplicasIgnore>::namespaced(client.clone(), namespace);
    let get_result = api.get(name).await;
    match get_result {
        Err(kube_client::error::Error::Api(kube_core::ErrorResponse { reason, .. }))
            if &reason == "NotFound" =>
        {
            info!("{} not found, end reconcile", name);
            return Ok(Action::await_change());
        }
        Err(err) => return Err(Error::IgnoreGetFailed(err)),
        _ => {}
    }
    let ignore = get_result.unwrap();

    let deployments = Api::<Deployment>::all(client.clone())
        .list(&ListParams::default())
        .await
        .map_err(Error::ListDeploymentsFailed)?;

    let ignored: Vec<IgnoredDeployment> = deployments
        .items
        .iter()
        .filter_map(|deployment| {
            should_ignore_by(deployment, &ignore).map(|reason| IgnoredDeployment {
                name: deployment.metadata.name.clone().unwrap_or_default(),
                namespace: deployment.metadata.namespace.clone().unwrap_or_default(),
                reason: reason.to_string(),
            })
        })
        .collect();

    update_ignore_status(client, namespace, name, ignored).await?;

    Ok(Action::requeue(Duration::from_secs(300)))
}

pub fn error_policy(_object: Arc<GlobalReplicasIgnore>, error: &Error, _ctx: Arc<Data>) -> Action {
    warn!("Reconcile failed due to error: {}", error);
    Action::requeue(Duration::from_secs(10))
}

async fn update_ignore_status(
    client: &Client,
    namespace: &str,
    name: &str,
    ignored: Vec<IgnoredDeployment>,
) -> Result<(), Error> {
    let api = Api::<GlobalReplicasIgnore>::namespaced(client.clone(), namespace);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let Some(mut latest) = api.get_opt(name).await.map_err(Error::IgnoreGetFailed)? else {
            return Ok(());
        };
        let unchanged = latest
            .status
            .as_ref()
            .map(|status| status.ignored_deployments == ignored)
            .unwrap_or(ignored.is_empty());
        if unchanged {
            return Ok(());
        }
        let status = latest.status.get_or_insert_with(Default::default);
        status.ignored_deployments = ignored.clone();
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
