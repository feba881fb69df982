//! Service registry lookups
//!
//! Every call is a fresh lookup: no caching and no retries at this layer.

pub mod dns_sd;
pub mod nacos;

use std::sync::Arc;
use async_trait::async_trait;
use anyhow::Result;
use shared::types::ServiceInstance;
use crate::config::RegistryConfig;
use crate::error::RegistryError;

/// Which instances a lookup returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InstanceFilter {
    /// Only instances the registry reports healthy (dispatch)
    #[default]
    HealthyOnly,
    /// Everything registered, healthy or not (diagnostics)
    All,
}

impl InstanceFilter {
    pub fn healthy_only(&self) -> bool {
        matches!(self, InstanceFilter::HealthyOnly)
    }
}

#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    /// Resolve the instances currently registered under `service_name`.
    /// An empty list is a valid answer.
    async fn resolve_instances(
        &self,
        service_name: &str,
        filter: InstanceFilter,
    ) -> Result<Vec<ServiceInstance>, RegistryError>;
}

/// Running registry adapter plus whatever it needs shut down on exit.
pub struct RegistryHandle {
    pub registry: Arc<dyn ServiceRegistry>,
    pub browser: Option<dns_sd::DnsSdRegistry>,
}

/// Build the adapter named in the configuration. Must run inside the runtime
/// since the DNS-SD adapter spawns its browser task.
pub fn build(
    config: &RegistryConfig,
    daemon: Option<&mdns_sd::ServiceDaemon>,
) -> Result<RegistryHandle> {
    match config {
        RegistryConfig::Nacos(nacos_config) => {
            let registry = nacos::NacosRegistry::new(nacos_config)?;
            tracing::info!("Using Nacos registry at {}", nacos_config.server);
            Ok(RegistryHandle {
                registry: Arc::new(registry),
                browser: None,
            })
        }
        RegistryConfig::Mdns(_) => {
            let daemon = daemon
                .ok_or_else(|| anyhow::anyhow!("mDNS registry requires an mDNS daemon"))?;
            let registry = dns_sd::DnsSdRegistry::spawn(daemon.clone())?;
            tracing::info!("Using DNS-SD registry for {}", shared::protocol::INSTANCE_SERVICE_TYPE);
            Ok(RegistryHandle {
                registry: Arc::new(registry.clone()),
                browser: Some(registry),
            })
        }
    }
}

pub(crate) fn keep_instance(instance: &ServiceInstance, filter: InstanceFilter) -> bool {
    !filter.healthy_only() || instance.healthy
}
