use crate::annotations::ManagedBy;
use crate::config::GlobalConfig;
use crate::scaling;
use crate::store::PolicySnapshot;
use crate::types::ReplicasOverride;
use k8s_openapi::api::apps::v1::Deployment;

/// Which policy kind produced an effective policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyMode {
    DirectOverride,
    Global,
}

/// The composed scaling policy for one workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectivePolicy {
    pub percentage: i32,
    pub min: i32,
    pub max: i32,
    pub mode: PolicyMode,
}

impl From<PolicyMode> for ManagedBy {
    fn from(mode: PolicyMode) -> Self {
        match mode {
            PolicyMode::DirectOverride => ManagedBy::Override,
            PolicyMode::Global => ManagedBy::Global,
        }
    }
}

impl EffectivePolicy {
    pub fn target_replicas(&self, original: i32) -> i32 {
        scaling::target_replicas(original, self.percentage, self.min, self.max)
    }

    pub fn hpa_limits(&self, original_min: i32, original_max: i32) -> (i32, i32) {
        scaling::hpa_limits(original_min, original_max, self.percentage, self.min, self.max)
    }
}

/// Whether an override selects the Deployment. A deploymentRef wins over a
/// selector; hpaRef-only overrides never select Deployments (they are
/// resolved through the HPA driver).
pub fn matches_deployment(override_: &ReplicasOverride, deployment: &Deployment) -> bool {
    let name = deployment.metadata.name.as_deref().unwrap_or_default();
    let namespace = deployment.metadata.namespace.as_deref().unwrap_or_default();

    if let Some(dref) = &override_.spec.deployment_ref {
        return dref.name == name && (dref.namespace.is_empty() || dref.namespace == namespace);
    }
    if let Some(selector) = &override_.spec.selector {
        if selector.match_labels.is_empty() {
            return false;
        }
        let Some(labels) = deployment.metadata.labels.as_ref() else {
            return false;
        };
        return selector
            .match_labels
            .iter()
            .all(|(key, value)| labels.get(key) == Some(value));
    }
    false
}

fn bounded(percentage: i32, min: i32, max: i32, mode: PolicyMode) -> EffectivePolicy {
    let min = min.min(max);
    EffectivePolicy {
        percentage,
        min,
        max,
        mode,
    }
}

pub fn effective_for_global(config: &GlobalConfig) -> EffectivePolicy {
    bounded(
        config.global_percentage,
        config.min_replicas,
        config.max_replicas,
        PolicyMode::Global,
    )
}

/// Composes one override with the global config.
pub fn effective_for_override(config: &GlobalConfig, override_: &ReplicasOverride) -> EffectivePolicy {
    let percentage = scaling::compose_percentage(
        config.global_percentage,
        override_.spec.replicas_percentage,
        override_.spec.override_type,
    );
    bounded(
        percentage,
        override_.spec.min_replicas.unwrap_or(config.min_replicas),
        override_.spec.max_replicas.unwrap_or(config.max_replicas),
        PolicyMode::DirectOverride,
    )
}

/// The effective policy for a workload: the first matching override in
/// lexicographic (namespace, name) order, or the global config. The snapshot
/// iterates a BTreeMap, so the pick is deterministic.
pub fn resolve<'a>(
    deployment: &Deployment,
    snapshot: &'a PolicySnapshot,
) -> (EffectivePolicy, Option<&'a ReplicasOverride>) {
    match snapshot
        .overrides()
        .find(|override_| matches_deployment(override_, deployment))
    {
        Some(override_) => (
            effective_for_override(&snapshot.config, override_),
            Some(override_),
        ),
        None => (effective_for_global(&snapshot.config), None),
    }
}
