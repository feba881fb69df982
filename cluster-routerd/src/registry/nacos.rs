//! Nacos naming-service adapter (HTTP open API)

use std::collections::HashMap;
use std::time::Duration;
use async_trait::async_trait;
use anyhow::{Context, Result};
use serde::Deserialize;
use shared::types::ServiceInstance;
use crate::config::NacosConfig;
use crate::error::RegistryError;
use super::{keep_instance, InstanceFilter, ServiceRegistry};

const INSTANCE_LIST_PATH: &str = "/nacos/v1/ns/instance/list";

const DEFAULT_NAMESPACE: &str = "public";

/// Port assumed when Nacos omits one
const DEFAULT_INSTANCE_PORT: u16 = 8000;

pub struct NacosRegistry {
    client: reqwest::Client,
    server: String,
    namespace: Option<String>,
    group: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InstanceList {
    #[serde(default)]
    hosts: Vec<NacosHost>,
}

#[derive(Debug, Deserialize)]
struct NacosHost {
    ip: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_true")]
    healthy: bool,
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

fn default_port() -> u16 {
    DEFAULT_INSTANCE_PORT
}

fn default_true() -> bool {
    true
}

impl From<NacosHost> for ServiceInstance {
    fn from(host: NacosHost) -> Self {
        ServiceInstance {
            address: host.ip,
            port: host.port,
            // a disabled instance takes no traffic, same as an unhealthy one
            healthy: host.healthy && host.enabled,
            attributes: host.metadata,
        }
    }
}

impl NacosRegistry {
    pub fn new(config: &NacosConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("Failed to create Nacos HTTP client")?;

        Ok(Self {
            client,
            server: config.server.trim_end_matches('/').to_string(),
            // Nacos 1.x resolves the default namespace only when none is sent
            namespace: config
                .namespace
                .clone()
                .filter(|s| !s.is_empty() && s != DEFAULT_NAMESPACE),
            group: config.group.clone().filter(|s| !s.is_empty()),
        })
    }
}

#[async_trait]
impl ServiceRegistry for NacosRegistry {
    async fn resolve_instances(
        &self,
        service_name: &str,
        filter: InstanceFilter,
    ) -> Result<Vec<ServiceInstance>, RegistryError> {
        let url = format!("{}{}", self.server, INSTANCE_LIST_PATH);

        let mut query: Vec<(&str, &str)> = vec![
            ("serviceName", service_name),
            ("healthyOnly", if filter.healthy_only() { "true" } else { "false" }),
        ];
        if let Some(namespace) = &self.namespace {
            query.push(("namespaceId", namespace.as_str()));
        }
        if let Some(group) = &self.group {
            query.push(("groupName", group.as_str()));
        }

        let resp = self.client.get(&url).query(&query).send().await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(RegistryError::Unavailable(format!(
                "Nacos returned {} for {}: {}",
                status, service_name, body
            )));
        }

        let list: InstanceList = resp.json().await.map_err(|e| {
            RegistryError::Unavailable(format!("Malformed Nacos response for {}: {}", service_name, e))
        })?;

        let instances: Vec<ServiceInstance> = list
            .hosts
            .into_iter()
            .map(ServiceInstance::from)
            .filter(|instance| keep_instance(instance, filter))
            .collect();

        if instances.is_empty() {
            tracing::warn!("No instances registered for {}", service_name);
        } else {
            tracing::debug!("Resolved {} instance(s) for {}", instances.len(), service_name);
        }

        Ok(instances)
    }
}
