//! Test doubles shared by the unit tests

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use async_trait::async_trait;
use shared::types::ServiceInstance;
use crate::error::RegistryError;
use crate::monitor::prober::ReachabilityProber;
use crate::registry::{InstanceFilter, ServiceRegistry};

/// Registry that answers every lookup with a fixed list (or fails when
/// built with `down()`) and records what it was asked.
pub struct FixedRegistry {
    instances: Option<Vec<ServiceInstance>>,
    calls: AtomicUsize,
    last_service: Mutex<Option<String>>,
}

impl FixedRegistry {
    pub fn with(instances: Vec<ServiceInstance>) -> Arc<Self> {
        Arc::new(Self {
            instances: Some(instances),
            calls: AtomicUsize::new(0),
            last_service: Mutex::new(None),
        })
    }

    pub fn down() -> Arc<Self> {
        Arc::new(Self {
            instances: None,
            calls: AtomicUsize::new(0),
            last_service: Mutex::new(None),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_service(&self) -> Option<String> {
        self.last_service.lock().unwrap().clone()
    }
}

#[async_trait]
impl ServiceRegistry for FixedRegistry {
    async fn resolve_instances(
        &self,
        service_name: &str,
        filter: InstanceFilter,
    ) -> Result<Vec<ServiceInstance>, RegistryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_service.lock().unwrap() = Some(service_name.to_string());
        let instances = self
            .instances
            .clone()
            .ok_or_else(|| RegistryError::Unavailable("connection refused".to_string()))?;
        Ok(instances
            .into_iter()
            .filter(|i| !filter.healthy_only() || i.healthy)
            .collect())
    }
}

/// Prober where an address is reachable iff it is in the set. Tracks probe
/// count and peak concurrency.
#[derive(Default)]
pub struct FakeProber {
    reachable: Mutex<HashSet<String>>,
    probes: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    delay: Option<Duration>,
}

impl FakeProber {
    pub fn reachable(addresses: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            reachable: Mutex::new(addresses.iter().map(|a| a.to_string()).collect()),
            ..Default::default()
        })
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay: Some(delay),
            ..Default::default()
        })
    }

    pub fn set_reachable(&self, address: &str, up: bool) {
        let mut set = self.reachable.lock().unwrap();
        if up {
            set.insert(address.to_string());
        } else {
            set.remove(address);
        }
    }

    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReachabilityProber for FakeProber {
    async fn probe(&self, address: &str) -> bool {
        self.probes.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.reachable.lock().unwrap().contains(address)
    }
}
