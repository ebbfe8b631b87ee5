pub mod annotations;
pub mod config;
pub mod event_mapper;
pub mod hpa;
pub mod ignore;
pub mod ignore_reconciler;
pub mod reconciler;
pub mod resolver;
pub mod scaling;
pub mod store;
pub mod types;
pub mod workload;

use anyhow::Result;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use kube::{
    api::{Api, ListParams},
    runtime::{
        controller::{self, Action, Controller},
        reflector::{self, ObjectRef},
        watcher,
    },
    Client, CustomResourceExt, Resource,
};
use std::{env, sync::Arc};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::*;

use crate::annotations::BadAnnotation;
use crate::event_mapper::{hpa_target_deployment, map_deployment_event, map_hpa_event};
use crate::reconciler::Data;
use crate::store::PolicyStore;
use crate::types::{GlobalReplicasIgnore, ReplicasOverride};

/// Bound on optimistic-concurrency retries for any single cluster write.
pub const UPDATE_ATTEMPTS: u32 = 3;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to get ReplicasOverride: {0}")]
    OverrideGetFailed(#[source] kube::Error),
    #[error("Failed to get GlobalReplicasIgnore: {0}")]
    IgnoreGetFailed(#[source] kube::Error),
    #[error("Failed to list namespaces: {0}")]
    ListNamespacesFailed(#[source] kube::Error),
    #[error("Failed to list deployments: {0}")]
    ListDeploymentsFailed(#[source] kube::Error),
    #[error("Failed to list HPAs: {0}")]
    ListHpasFailed(#[source] kube::Error),
    #[error("Failed to get Deployment: {0}")]
    GetDeploymentFailed(#[source] kube::Error),
    #[error("Failed to get HPA: {0}")]
    GetHpaFailed(#[source] kube::Error),
    #[error("Failed to update Deployment: {0}")]
    UpdateDeploymentFailed(#[source] kube::Error),
    #[error("Failed to update HPA: {0}")]
    UpdateHpaFailed(#[source] kube::Error),
    #[error("Failed to update status: {0}")]
    StatusUpdateFailed(#[source] kube::Error),
    #[error("Failed to serialize status: {0}")]
    StatusEncodeFailed(#[source] serde_json::Error),
    #[error("Corrupt {annotation} annotation on {namespace}/{name}: {value:?}")]
    CorruptAnnotation {
        annotation: &'static str,
        namespace: String,
        name: String,
        value: String,
    },
    #[error("MissingObjectKey: {0}")]
    MissingObjectKey(&'static str),
}

impl Error {
    pub fn corrupt_annotation(namespace: &str, name: &str, bad: BadAnnotation) -> Self {
        Error::CorruptAnnotation {
            annotation: bad.key,
            namespace: namespace.to_string(),
            name: name.to_string(),
            value: bad.value,
        }
    }
}

pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(
        err,
        kube_client::Error::Api(kube_core::ErrorResponse { reason, .. }) if reason == "Conflict"
    )
}

pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(
        err,
        kube_client::Error::Api(kube_core::ErrorResponse { reason, .. }) if reason == "NotFound"
    )
}

pub fn report_controller_reconciled<K, QueueErr>(
    controller_name: &str,
    result: &Result<(ObjectRef<K>, Action), controller::Error<Error, QueueErr>>,
) where
    K: Resource,
    QueueErr: std::error::Error,
{
    match result {
        Ok((obj, _)) => {
            tracing::info!(
                controller.name = controller_name,
                object = %obj,
                "Reconciled object"
            );
        }
        Err(err) => {
            tracing::error!(
                controller.name = controller_name,
                error = err as &dyn std::error::Error,
                "Failed to reconcile object",
            );
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = env::args().collect();
    let cmd = args[1].clone();
    if cmd == String::from("export") {
        info!("exporting custom resource definitions");
        println!("{}", serde_yaml::to_string(&ReplicasOverride::crd())?);
        println!("{}", serde_yaml::to_string(&GlobalReplicasIgnore::crd())?);
    } else if cmd == String::from("run") {
        info!("running kubedynamicscaler");
        let client = Client::try_default().await?;
        let store = Arc::new(PolicyStore::new());

        let config_namespace = config::config_namespace();
        match config::load_config(&client, &config_namespace).await {
            Ok(config) => store.set_config(config),
            Err(err) => warn!("Failed to load initial config, using defaults: {}", err),
        }

        let (global_tx, global_rx) = mpsc::unbounded_channel();

        // Cache of all Deployments; the HPA and config event mappers resolve
        // targets through it without blocking the watch callbacks.
        let (deployment_reader, deployment_writer) = reflector::store::<Deployment>();
        let deployment_reflector = reflector::reflector(
            deployment_writer,
            watcher(Api::<Deployment>::all(client.clone()), ListParams::default()),
        );
        tokio::spawn(async move {
            let mut stream = deployment_reflector.boxed();
            while let Some(event) = stream.next().await {
                if let Err(err) = event {
                    warn!("Deployment reflector failed: {}", err);
                }
            }
        });

        tokio::spawn(store::watch_overrides(
            client.clone(),
            store.clone(),
            global_tx.clone(),
        ));
        tokio::spawn(store::watch_ignores(
            client.clone(),
            store.clone(),
            global_tx.clone(),
        ));
        tokio::spawn(store::watch_config(
            client.clone(),
            store.clone(),
            config_namespace,
            deployment_reader.clone(),
            global_tx.clone(),
        ));
        tokio::spawn(reconciler::run_global_worker(
            client.clone(),
            store.clone(),
            global_rx,
        ));

        let data = Arc::new(Data {
            client: client.clone(),
            store: store.clone(),
        });

        let deployment_mapper = {
            let store = store.clone();
            let global_tx = global_tx.clone();
            move |deployment: Deployment| {
                let snapshot = store.snapshot();
                let (refs, global) = map_deployment_event(&snapshot, &deployment);
                if let Some(request) = global {
                    let _ = global_tx.send(request);
                }
                refs
            }
        };
        let hpa_mapper = {
            let store = store.clone();
            let global_tx = global_tx.clone();
            let deployments = deployment_reader.clone();
            move |hpa: HorizontalPodAutoscaler| {
                let snapshot = store.snapshot();
                let target = hpa_target_deployment(&hpa).and_then(|(namespace, name)| {
                    deployments.get(&ObjectRef::new(&name).within(&namespace))
                });
                let (refs, global) = map_hpa_event(&snapshot, &hpa, target.as_ref().map(|v| &**v));
                if let Some(request) = global {
                    let _ = global_tx.send(request);
                }
                refs
            }
        };

        let override_reconciler = Controller::new(
            Api::<ReplicasOverride>::all(client.clone()),
            ListParams::default(),
        )
        .shutdown_on_signal()
        .watches(
            Api::<Deployment>::all(client.clone()),
            ListParams::default(),
            deployment_mapper,
        )
        .watches(
            Api::<HorizontalPodAutoscaler>::all(client.clone()),
            ListParams::default(),
            hpa_mapper,
        )
        .run(reconciler::reconcile, reconciler::error_policy, data.clone())
        .map(|res| report_controller_reconciled("replicas-override", &res));

        let ignore_status_reconciler = Controller::new(
            Api::<GlobalReplicasIgnore>::all(client.clone()),
            ListParams::default(),
        )
        .shutdown_on_signal()
        .run(
            ignore_reconciler::reconcile,
            ignore_reconciler::error_policy,
            data,
        )
        .map(|res| report_controller_reconciled("global-replicas-ignore", &res));

        futures::stream::select(override_reconciler, ignore_status_reconciler)
            .collect::<()>()
            .await;
        info!("controller terminated");
    } else {
        warn!("wrong command; please use \"export\" or \"run\"");
    }
    Ok(())
}
