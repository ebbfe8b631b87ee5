use k8s_openapi::api::core::v1::ConfigMap;
use kube::{api::Api, Client};
use serde::{Deserialize, Serialize};
use std::env;
use thiserror::Error;

/// Name of the ConfigMap carrying the global configuration.
pub const CONFIG_MAP_NAME: &str = "replicas-controller-config";
/// Key inside the ConfigMap holding the YAML document.
pub const CONFIG_MAP_KEY: &str = "config.yaml";
/// Namespace the ConfigMap lives in unless overridden.
pub const DEFAULT_CONFIG_NAMESPACE: &str = "kubedynamicscaler-system";
/// Environment variable overriding the ConfigMap namespace.
pub const ENV_CONFIG_NAMESPACE: &str = "CONFIG_NAMESPACE";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to get ConfigMap: {0}")]
    GetFailed(#[source] kube::Error),
    #[error("ConfigMap {0} not found")]
    NotFound(String),
    #[error("ConfigMap key {0} not found")]
    MissingKey(&'static str),
    #[error("Failed to parse config: {0}")]
    ParseFailed(#[source] serde_yaml::Error),
    #[error("Invalid config bounds: minReplicas {min} > maxReplicas {max}")]
    InvalidBounds { min: i32, max: i32 },
}

/// Cluster-wide scaling defaults, loaded from the config document.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GlobalConfig {
    /// Default percentage applied to workloads no override selects.
    pub global_percentage: i32,
    pub min_replicas: i32,
    pub max_replicas: i32,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        GlobalConfig {
            global_percentage: 100,
            min_replicas: 1,
            max_replicas: 100,
        }
    }
}

/// Namespace of the config document, resolved once at startup.
pub fn config_namespace() -> String {
    env::var(ENV_CONFIG_NAMESPACE)
        .ok()
        .filter(|ns| !ns.is_empty())
        .unwrap_or_else(|| DEFAULT_CONFIG_NAMESPACE.to_string())
}

pub fn parse_config(data: &str) -> Result<GlobalConfig, ConfigError> {
    let config: GlobalConfig = serde_yaml::from_str(data).map_err(ConfigError::ParseFailed)?;
    if config.min_replicas > config.max_replicas {
        return Err(ConfigError::InvalidBounds {
            min: config.min_replicas,
            max: config.max_replicas,
        });
    }
    Ok(config)
}

/// Fetches and parses the config document. Callers keep their previous
/// snapshot on any error.
pub async fn load_config(client: &Client, namespace: &str) -> Result<GlobalConfig, ConfigError> {
    let cm_api = Api::<ConfigMap>::namespaced(client.clone(), namespace);
    let cm = cm_api
        .get_opt(CONFIG_MAP_NAME)
        .await
        .map_err(ConfigError::GetFailed)?
        .ok_or_else(|| ConfigError::NotFound(format!("{}/{}", namespace, CONFIG_MAP_NAME)))?;
    let data = cm
        .data
        .as_ref()
        .and_then(|data| data.get(CONFIG_MAP_KEY))
        .ok_or(ConfigError::MissingKey(CONFIG_MAP_KEY))?;
    parse_config(data)
}
