use chrono::{SecondsFormat, Utc};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;

// Deployment annotations
pub const ORIGINAL_REPLICAS_ANNOTATION: &str = "kubedynamicscaler.io/original-replicas";
pub const OVERRIDE_CONTROLLER_ANNOTATION: &str = "kubedynamicscaler.io/override-controller";
pub const LAST_UPDATE_ANNOTATION: &str = "kubedynamicscaler.io/last-update";
pub const MANAGED_ANNOTATION: &str = "kubedynamicscaler.io/managed";
pub const GLOBAL_CONFIG_MANAGED_ANNOTATION: &str = "kubedynamicscaler.io/global-config-managed";
pub const MANAGEMENT_MODE_ANNOTATION: &str = "kubedynamicscaler.io/management-mode";

// HPA annotations
pub const HPA_MANAGED_ANNOTATION: &str = "kubedynamicscaler.io/hpa-managed";
pub const HPA_ORIGINAL_MIN_ANNOTATION: &str = "kubedynamicscaler.io/hpa-original-min";
pub const HPA_ORIGINAL_MAX_ANNOTATION: &str = "kubedynamicscaler.io/hpa-original-max";
pub const LAST_HPA_UPDATE_ANNOTATION: &str = "kubedynamicscaler.io/last-hpa-update";

const DEPLOYMENT_MANAGEMENT_ANNOTATIONS: [&str; 6] = [
    ORIGINAL_REPLICAS_ANNOTATION,
    OVERRIDE_CONTROLLER_ANNOTATION,
    LAST_UPDATE_ANNOTATION,
    MANAGED_ANNOTATION,
    GLOBAL_CONFIG_MANAGED_ANNOTATION,
    MANAGEMENT_MODE_ANNOTATION,
];

const HPA_MANAGEMENT_ANNOTATIONS: [&str; 7] = [
    HPA_MANAGED_ANNOTATION,
    HPA_ORIGINAL_MIN_ANNOTATION,
    HPA_ORIGINAL_MAX_ANNOTATION,
    LAST_HPA_UPDATE_ANNOTATION,
    OVERRIDE_CONTROLLER_ANNOTATION,
    MANAGED_ANNOTATION,
    GLOBAL_CONFIG_MANAGED_ANNOTATION,
];

/// Which policy kind governs a managed object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagedBy {
    Override,
    Global,
}

/// Whether replicas are written directly or through an HPA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagementMode {
    Direct,
    Hpa,
}

impl ManagementMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ManagementMode::Direct => "direct",
            ManagementMode::Hpa => "hpa",
        }
    }
}

/// An annotation whose value could not be parsed back. Surfaced to the
/// caller; the object is left untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BadAnnotation {
    pub key: &'static str,
    pub value: String,
}

fn annotations_mut(meta: &mut ObjectMeta) -> &mut BTreeMap<String, String> {
    meta.annotations.get_or_insert_with(BTreeMap::new)
}

fn annotation<'a>(meta: &'a ObjectMeta, key: &str) -> Option<&'a str> {
    meta.annotations
        .as_ref()
        .and_then(|ann| ann.get(key))
        .map(String::as_str)
}

fn parse_annotation(meta: &ObjectMeta, key: &'static str) -> Result<Option<i32>, BadAnnotation> {
    match annotation(meta, key) {
        None => Ok(None),
        Some(value) => value.parse::<i32>().map(Some).map_err(|_| BadAnnotation {
            key,
            value: value.to_string(),
        }),
    }
}

fn set_managed_by(ann: &mut BTreeMap<String, String>, by: ManagedBy) {
    match by {
        ManagedBy::Override => {
            ann.insert(OVERRIDE_CONTROLLER_ANNOTATION.to_string(), "true".to_string());
            ann.insert(MANAGED_ANNOTATION.to_string(), "true".to_string());
            ann.remove(GLOBAL_CONFIG_MANAGED_ANNOTATION);
        }
        ManagedBy::Global => {
            ann.insert(GLOBAL_CONFIG_MANAGED_ANNOTATION.to_string(), "true".to_string());
            ann.remove(OVERRIDE_CONTROLLER_ANNOTATION);
            ann.remove(MANAGED_ANNOTATION);
        }
    }
}

/// Takes a Deployment under management. The first call captures the original
/// size; later calls only refresh the mode markers. When an HPA selects the
/// Deployment at capture time the HPA's minReplicas is the original, since
/// the HPA owns the replica count from then on.
pub fn mark_deployment_managed(
    deployment: &mut Deployment,
    by: ManagedBy,
    mode: ManagementMode,
    hpa: Option<&HorizontalPodAutoscaler>,
) {
    let captured = match hpa {
        Some(hpa) => hpa
            .spec
            .as_ref()
            .and_then(|spec| spec.min_replicas)
            .unwrap_or(1),
        None => deployment
            .spec
            .as_ref()
            .and_then(|spec| spec.replicas)
            .unwrap_or(1),
    };
    let ann = annotations_mut(&mut deployment.metadata);
    ann.entry(ORIGINAL_REPLICAS_ANNOTATION.to_string())
        .or_insert_with(|| captured.to_string());
    set_managed_by(ann, by);
    ann.insert(MANAGEMENT_MODE_ANNOTATION.to_string(), mode.as_str().to_string());
}

/// Takes an HPA under management, capturing its original min/max once.
pub fn mark_hpa_managed(hpa: &mut HorizontalPodAutoscaler, by: ManagedBy) {
    let (min, max) = match hpa.spec.as_ref() {
        Some(spec) => (spec.min_replicas.unwrap_or(1), spec.max_replicas),
        None => (1, 1),
    };
    let ann = annotations_mut(&mut hpa.metadata);
    ann.entry(HPA_ORIGINAL_MIN_ANNOTATION.to_string())
        .or_insert_with(|| min.to_string());
    ann.entry(HPA_ORIGINAL_MAX_ANNOTATION.to_string())
        .or_insert_with(|| max.to_string());
    ann.insert(HPA_MANAGED_ANNOTATION.to_string(), "true".to_string());
    set_managed_by(ann, by);
}

fn utc_now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn stamp_update(deployment: &mut Deployment) {
    annotations_mut(&mut deployment.metadata)
        .insert(LAST_UPDATE_ANNOTATION.to_string(), utc_now_rfc3339());
}

pub fn stamp_hpa_update(hpa: &mut HorizontalPodAutoscaler) {
    annotations_mut(&mut hpa.metadata)
        .insert(LAST_HPA_UPDATE_ANNOTATION.to_string(), utc_now_rfc3339());
}

/// Original replicas as captured at first management; falls back to the
/// current spec when the annotation is absent.
pub fn original_replicas(deployment: &Deployment) -> Result<i32, BadAnnotation> {
    match parse_annotation(&deployment.metadata, ORIGINAL_REPLICAS_ANNOTATION)? {
        Some(original) => Ok(original),
        None => Ok(deployment
            .spec
            .as_ref()
            .and_then(|spec| spec.replicas)
            .unwrap_or(1)),
    }
}

/// Original HPA limits; missing annotations fall back to the live spec, a
/// missing minReplicas to 1.
pub fn original_hpa_limits(hpa: &HorizontalPodAutoscaler) -> Result<(i32, i32), BadAnnotation> {
    let min = match parse_annotation(&hpa.metadata, HPA_ORIGINAL_MIN_ANNOTATION)? {
        Some(min) => min,
        None => hpa
            .spec
            .as_ref()
            .and_then(|spec| spec.min_replicas)
            .unwrap_or(1),
    };
    let max = match parse_annotation(&hpa.metadata, HPA_ORIGINAL_MAX_ANNOTATION)? {
        Some(max) => max,
        None => hpa.spec.as_ref().map(|spec| spec.max_replicas).unwrap_or(min),
    };
    Ok((min, max))
}

fn annotation_is_true(meta: &ObjectMeta, key: &str) -> bool {
    annotation(meta, key) == Some("true")
}

pub fn is_override_managed(deployment: &Deployment) -> bool {
    annotation_is_true(&deployment.metadata, OVERRIDE_CONTROLLER_ANNOTATION)
}

pub fn is_managed(deployment: &Deployment) -> bool {
    annotation_is_true(&deployment.metadata, OVERRIDE_CONTROLLER_ANNOTATION)
        || annotation_is_true(&deployment.metadata, GLOBAL_CONFIG_MANAGED_ANNOTATION)
}

pub fn is_hpa_managed(hpa: &HorizontalPodAutoscaler) -> bool {
    annotation_is_true(&hpa.metadata, HPA_MANAGED_ANNOTATION)
}

/// Restores the captured original replicas and strips every management
/// annotation. No-op on an unmanaged Deployment. Returns whether the object
/// changed.
pub fn revert_deployment(deployment: &mut Deployment) -> Result<bool, BadAnnotation> {
    if deployment.metadata.annotations.is_none() {
        return Ok(false);
    }
    let original = parse_annotation(&deployment.metadata, ORIGINAL_REPLICAS_ANNOTATION)?;
    let mut changed = false;
    if let Some(original) = original {
        if let Some(spec) = deployment.spec.as_mut() {
            if spec.replicas != Some(original) {
                spec.replicas = Some(original);
                changed = true;
            }
        }
    }
    let ann = annotations_mut(&mut deployment.metadata);
    for key in DEPLOYMENT_MANAGEMENT_ANNOTATIONS {
        changed |= ann.remove(key).is_some();
    }
    Ok(changed)
}

/// Restores the captured original min/max and strips every management
/// annotation. No-op on an unmanaged HPA.
pub fn revert_hpa(hpa: &mut HorizontalPodAutoscaler) -> Result<bool, BadAnnotation> {
    if hpa.metadata.annotations.is_none() {
        return Ok(false);
    }
    let original_min = parse_annotation(&hpa.metadata, HPA_ORIGINAL_MIN_ANNOTATION)?;
    let original_max = parse_annotation(&hpa.metadata, HPA_ORIGINAL_MAX_ANNOTATION)?;
    let mut changed = false;
    if let Some(spec) = hpa.spec.as_mut() {
        if let Some(min) = original_min {
            if spec.min_replicas != Some(min) {
                spec.min_replicas = Some(min);
                changed = true;
            }
        }
        if let Some(max) = original_max {
            if spec.max_replicas != max {
                spec.max_replicas = max;
                changed = true;
            }
        }
    }
    let ann = annotations_mut(&mut hpa.metadata);
    for key in HPA_MANAGEMENT_ANNOTATIONS {
        changed |= ann.remove(key).is_some();
    }
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::DeploymentSpec;
    use k8s_openapi::api::autoscaling::v2::{
        CrossVersionObjectReference, HorizontalPodAutoscalerSpec,
    };

    fn deployment(replicas: i32) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some("default".to_string()),
                ..ObjectMeta::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(replicas),
                ..DeploymentSpec::default()
            }),
            ..Deployment::default()
        }
    }

    fn hpa(min: Option<i32>, max: i32) -> HorizontalPodAutoscaler {
        HorizontalPodAutoscaler {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some("default".to_string()),
                ..ObjectMeta::default()
            },
            spec: Some(HorizontalPodAutoscalerSpec {
                min_replicas: min,
                max_replicas: max,
                scale_target_ref: CrossVersionObjectReference {
                    api_version: Some("apps/v1".to_string()),
                    kind: "Deployment".to_string(),
                    name: "web".to_string(),
                },
                ..HorizontalPodAutoscalerSpec::default()
            }),
            ..HorizontalPodAutoscaler::default()
        }
    }

    fn ann<'a>(deployment: &'a Deployment, key: &str) -> Option<&'a str> {
        annotation(&deployment.metadata, key)
    }

    #[test]
    fn first_mark_captures_original_once() {
        let mut d = deployment(3);
        mark_deployment_managed(&mut d, ManagedBy::Global, ManagementMode::Direct, None);
        assert_eq!(ann(&d, ORIGINAL_REPLICAS_ANNOTATION), Some("3"));
        assert_eq!(ann(&d, GLOBAL_CONFIG_MANAGED_ANNOTATION), Some("true"));
        assert_eq!(ann(&d, MANAGEMENT_MODE_ANNOTATION), Some("direct"));

        // A later pass at a different size must not re-capture.
        d.spec.as_mut().unwrap().replicas = Some(5);
        mark_deployment_managed(&mut d, ManagedBy::Global, ManagementMode::Direct, None);
        assert_eq!(ann(&d, ORIGINAL_REPLICAS_ANNOTATION), Some("3"));
    }

    #[test]
    fn capture_uses_hpa_min_when_hpa_selects() {
        let mut d = deployment(7);
        let h = hpa(Some(2), 10);
        mark_deployment_managed(&mut d, ManagedBy::Global, ManagementMode::Hpa, Some(&h));
        assert_eq!(ann(&d, ORIGINAL_REPLICAS_ANNOTATION), Some("2"));
        assert_eq!(ann(&d, MANAGEMENT_MODE_ANNOTATION), Some("hpa"));
    }

    #[test]
    fn managed_by_is_exclusive() {
        let mut d = deployment(4);
        mark_deployment_managed(&mut d, ManagedBy::Override, ManagementMode::Direct, None);
        assert_eq!(ann(&d, OVERRIDE_CONTROLLER_ANNOTATION), Some("true"));
        assert_eq!(ann(&d, MANAGED_ANNOTATION), Some("true"));
        assert_eq!(ann(&d, GLOBAL_CONFIG_MANAGED_ANNOTATION), None);

        mark_deployment_managed(&mut d, ManagedBy::Global, ManagementMode::Direct, None);
        assert_eq!(ann(&d, OVERRIDE_CONTROLLER_ANNOTATION), None);
        assert_eq!(ann(&d, GLOBAL_CONFIG_MANAGED_ANNOTATION), Some("true"));
        // Original survives the mode flip.
        assert_eq!(ann(&d, ORIGINAL_REPLICAS_ANNOTATION), Some("4"));
    }

    #[test]
    fn revert_round_trips_deployment() {
        let mut d = deployment(4);
        mark_deployment_managed(&mut d, ManagedBy::Override, ManagementMode::Direct, None);
        stamp_update(&mut d);
        d.spec.as_mut().unwrap().replicas = Some(8);

        let changed = revert_deployment(&mut d).unwrap();
        assert!(changed);
        assert_eq!(d.spec.as_ref().unwrap().replicas, Some(4));
        for key in DEPLOYMENT_MANAGEMENT_ANNOTATIONS {
            assert_eq!(ann(&d, key), None, "{} should be gone", key);
        }
    }

    #[test]
    fn revert_is_noop_without_annotations() {
        let mut d = deployment(4);
        assert!(!revert_deployment(&mut d).unwrap());
        assert_eq!(d.spec.as_ref().unwrap().replicas, Some(4));
    }

    #[test]
    fn revert_round_trips_hpa() {
        let mut h = hpa(Some(2), 10);
        mark_hpa_managed(&mut h, ManagedBy::Override);
        stamp_hpa_update(&mut h);
        {
            let spec = h.spec.as_mut().unwrap();
            spec.min_replicas = Some(3);
            spec.max_replicas = 15;
        }

        let changed = revert_hpa(&mut h).unwrap();
        assert!(changed);
        let spec = h.spec.as_ref().unwrap();
        assert_eq!(spec.min_replicas, Some(2));
        assert_eq!(spec.max_replicas, 10);
        assert!(h.metadata.annotations.as_ref().unwrap().is_empty());
    }

    #[test]
    fn hpa_capture_is_idempotent() {
        let mut h = hpa(Some(2), 10);
        mark_hpa_managed(&mut h, ManagedBy::Global);
        h.spec.as_mut().unwrap().min_replicas = Some(5);
        h.spec.as_mut().unwrap().max_replicas = 20;
        mark_hpa_managed(&mut h, ManagedBy::Global);
        assert_eq!((original_hpa_limits(&h)).unwrap(), (2, 10));
    }

    #[test]
    fn corrupt_original_is_an_error() {
        let mut d = deployment(4);
        annotations_mut(&mut d.metadata)
            .insert(ORIGINAL_REPLICAS_ANNOTATION.to_string(), "four".to_string());
        let err = original_replicas(&d).unwrap_err();
        assert_eq!(err.key, ORIGINAL_REPLICAS_ANNOTATION);
        assert_eq!(err.value, "four");
        // Revert must refuse to guess.
        assert!(revert_deployment(&mut d).is_err());
    }

    #[test]
    fn original_readers_fall_back_to_spec() {
        let d = deployment(6);
        assert_eq!(original_replicas(&d).unwrap(), 6);
        let h = hpa(None, 9);
        assert_eq!(original_hpa_limits(&h).unwrap(), (1, 9));
    }
}
