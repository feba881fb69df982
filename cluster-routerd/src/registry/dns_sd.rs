//! DNS-SD registry adapter
//!
//! Inference instances advertise `_model-inference._tcp.local.` with a
//! `service=<service name>` TXT record. A browser task follows the multicast
//! announcements and feeds a table owned by a dedicated thread; lookups are
//! answered from that live view.

use std::collections::HashMap;
use std::net::IpAddr;
use std::thread;
use async_trait::async_trait;
use anyhow::{Context, Result};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use shared::protocol::{INSTANCE_SERVICE_TYPE, TXT_HEALTHY, TXT_SERVICE};
use shared::types::ServiceInstance;
use crate::error::RegistryError;
use super::{keep_instance, InstanceFilter, ServiceRegistry};

/// An announced instance together with the model service it serves
#[derive(Debug, Clone, PartialEq)]
pub struct Announcement {
    pub fullname: String,
    pub service_name: String,
    pub instance: ServiceInstance,
}

/// Commands sent to the table thread
enum TableCommand {
    Announce(Announcement),
    Withdraw(String),
    Lookup {
        service_name: String,
        filter: InstanceFilter,
        reply: oneshot::Sender<Result<Vec<ServiceInstance>, RegistryError>>,
    },
    /// The browser is gone; the view can no longer be trusted
    Close(String),
    Shutdown,
}

/// Announced instances keyed by DNS-SD full name
#[derive(Debug, Default)]
struct InstanceTable {
    entries: HashMap<String, Announcement>,
    closed: Option<String>,
}

impl InstanceTable {
    fn announce(&mut self, announcement: Announcement) {
        self.entries.insert(announcement.fullname.clone(), announcement);
    }

    fn withdraw(&mut self, fullname: &str) -> bool {
        self.entries.remove(fullname).is_some()
    }

    fn close(&mut self, reason: String) {
        self.entries.clear();
        self.closed = Some(reason);
    }

    fn lookup(&self, service_name: &str, filter: InstanceFilter) -> Result<Vec<ServiceInstance>, RegistryError> {
        if let Some(reason) = &self.closed {
            return Err(RegistryError::Unavailable(format!("DNS-SD browser stopped: {}", reason)));
        }

        let mut found: Vec<&Announcement> = self
            .entries
            .values()
            .filter(|a| a.service_name == service_name && keep_instance(&a.instance, filter))
            .collect();
        found.sort_by(|a, b| a.fullname.cmp(&b.fullname));
        Ok(found.into_iter().map(|a| a.instance.clone()).collect())
    }
}

/// Handle to the instance table thread
#[derive(Clone)]
struct TableHandle {
    tx: mpsc::Sender<TableCommand>,
}

impl TableHandle {
    fn spawn() -> Self {
        let (tx, mut rx) = mpsc::channel::<TableCommand>(256);

        thread::spawn(move || {
            let mut table = InstanceTable::default();
            while let Some(cmd) = rx.blocking_recv() {
                match cmd {
                    TableCommand::Announce(announcement) => {
                        tracing::debug!(
                            "Instance {} serves {} at {}",
                            announcement.fullname,
                            announcement.service_name,
                            announcement.instance.base_url()
                        );
                        table.announce(announcement);
                    }
                    TableCommand::Withdraw(fullname) => {
                        if table.withdraw(&fullname) {
                            tracing::debug!("Instance withdrawn: {}", fullname);
                        }
                    }
                    TableCommand::Lookup { service_name, filter, reply } => {
                        let _ = reply.send(table.lookup(&service_name, filter));
                    }
                    TableCommand::Close(reason) => {
                        tracing::error!("DNS-SD instance table closed: {}", reason);
                        table.close(reason);
                    }
                    TableCommand::Shutdown => {
                        tracing::info!("DNS-SD instance table shutting down");
                        break;
                    }
                }
            }
        });

        Self { tx }
    }

    async fn send(&self, cmd: TableCommand) -> std::result::Result<(), RegistryError> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| RegistryError::Unavailable("DNS-SD instance table is closed".to_string()))
    }

    async fn lookup(
        &self,
        service_name: &str,
        filter: InstanceFilter,
    ) -> std::result::Result<Vec<ServiceInstance>, RegistryError> {
        let (reply, rx) = oneshot::channel();
        self.send(TableCommand::Lookup {
            service_name: service_name.to_string(),
            filter,
            reply,
        })
        .await?;

        rx.await
            .map_err(|_| RegistryError::Unavailable("DNS-SD instance table dropped the lookup".to_string()))?
    }
}

#[derive(Clone)]
pub struct DnsSdRegistry {
    table: TableHandle,
    cancel: CancellationToken,
    daemon: ServiceDaemon,
}

impl DnsSdRegistry {
    /// Start browsing for inference instances and spawn the table thread.
    pub fn spawn(daemon: ServiceDaemon) -> Result<Self> {
        let receiver = daemon
            .browse(INSTANCE_SERVICE_TYPE)
            .with_context(|| format!("Failed to browse {}", INSTANCE_SERVICE_TYPE))?;

        let table = TableHandle::spawn();
        let cancel = CancellationToken::new();
        tokio::spawn(run_browser(receiver, table.clone(), cancel.clone()));

        Ok(Self { table, cancel, daemon })
    }

    /// Stop browsing and close the table
    pub async fn shutdown(&self) -> Result<()> {
        self.cancel.cancel();
        if let Err(e) = self.daemon.stop_browse(INSTANCE_SERVICE_TYPE) {
            tracing::warn!("Failed to stop browsing {}: {}", INSTANCE_SERVICE_TYPE, e);
        }
        self.table
            .send(TableCommand::Shutdown)
            .await
            .context("DNS-SD instance table already closed")?;
        Ok(())
    }
}

#[async_trait]
impl ServiceRegistry for DnsSdRegistry {
    async fn resolve_instances(
        &self,
        service_name: &str,
        filter: InstanceFilter,
    ) -> std::result::Result<Vec<ServiceInstance>, RegistryError> {
        let instances = self.table.lookup(service_name, filter).await?;
        if instances.is_empty() {
            tracing::warn!("No instances announced for {}", service_name);
        }
        Ok(instances)
    }
}

/// Follow browse events until cancelled. If the event channel ends first,
/// the table is closed so lookups fail instead of serving a frozen view.
async fn run_browser(
    receiver: flume::Receiver<ServiceEvent>,
    table: TableHandle,
    cancel: CancellationToken,
) {
    tracing::info!("Browsing {}", INSTANCE_SERVICE_TYPE);

    loop {
        tokio::select! {
            event = receiver.recv_async() => {
                let cmd = match event {
                    Ok(ServiceEvent::ServiceResolved(info)) => match announcement_from(&info) {
                        Some(announcement) => TableCommand::Announce(announcement),
                        None => continue,
                    },
                    Ok(ServiceEvent::ServiceRemoved(_typ, fullname)) => TableCommand::Withdraw(fullname),
                    Ok(ServiceEvent::SearchStopped(_)) => {
                        let _ = table.send(TableCommand::Close("browse stopped".to_string())).await;
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        let _ = table.send(TableCommand::Close(format!("browse channel closed: {}", e))).await;
                        break;
                    }
                };
                if table.send(cmd).await.is_err() {
                    tracing::warn!("DNS-SD instance table is gone, stopping browser");
                    break;
                }
            }

            _ = cancel.cancelled() => {
                tracing::info!("DNS-SD browser shutting down");
                break;
            }
        }
    }
}

/// Convert a resolved announcement into an instance entry. Announcements
/// without a `service` TXT record or without an address are ignored.
fn announcement_from(info: &ServiceInfo) -> Option<Announcement> {
    let service_name = match info.get_property_val_str(TXT_SERVICE) {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => {
            tracing::debug!("Skipping {} - no {} TXT record", info.get_fullname(), TXT_SERVICE);
            return None;
        }
    };

    // Prefer IPv4, the inference hosts are usually dual-stacked
    let addresses = info.get_addresses();
    let address = addresses
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addresses.iter().next())
        .map(IpAddr::to_string)?;

    let attributes: HashMap<String, String> = info
        .get_properties()
        .iter()
        .map(|prop| (prop.key().to_string(), prop.val_str().to_string()))
        .collect();

    let healthy = !matches!(info.get_property_val_str(TXT_HEALTHY), Some(v) if v.eq_ignore_ascii_case("false"));

    Some(Announcement {
        fullname: info.get_fullname().to_string(),
        service_name,
        instance: ServiceInstance {
            address,
            port: info.get_port(),
            healthy,
            attributes,
        },
    })
}
