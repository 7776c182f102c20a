// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Local-network worker discovery over DNS-SD.
//!
//! Workers advertise under a versioned service type; the leading segment
//! of an advertised instance name is the worker's unique id. The
//! discovery loop enumerates advertisements, skips ids already known and
//! the local worker's own id, and admits a new worker only after one of
//! its advertised addresses answers a bounded-deadline ping. Enumeration
//! failures back off and retry; the loop terminates only on cancellation.

use crate::client::{TcpWorkerClient, WorkerClient};
use crate::core::WorkerCoreProvider;
use crate::fulfiller::Fulfiller;
use crate::protocol::PROTOCOL_VERSION;
use crate::worker::Worker;
use anyhow::Result;
use async_trait::async_trait;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Versioned DNS-SD service type, e.g. `_lnx1-forge._tcp.local.`.
/// Incompatible platforms and protocol revisions never see each other.
pub fn service_type() -> String {
    format!("_{}{}-forge._tcp.local.", platform_tag(), PROTOCOL_VERSION)
}

fn platform_tag() -> &'static str {
    if cfg!(target_os = "windows") {
        "win"
    } else if cfg!(target_os = "macos") {
        "mac"
    } else {
        "lnx"
    }
}

/// One observed worker advertisement.
#[derive(Debug, Clone)]
pub struct Advertisement {
    pub worker_id: String,
    pub display_name: String,
    /// Candidate addresses, tried in order until one answers a ping.
    pub addresses: Vec<SocketAddr>,
}

/// Enumeration seam over the advertisement source, so tests can inject
/// fleets without touching the network.
#[async_trait]
pub trait ServiceBrowser: Send + Sync {
    async fn enumerate(&self) -> Result<Vec<Advertisement>>;
}

/// Production browser over an mDNS daemon.
pub struct MdnsBrowser {
    _daemon: ServiceDaemon,
    events: mdns_sd::Receiver<ServiceEvent>,
    known: Mutex<HashMap<String, Advertisement>>,
}

impl MdnsBrowser {
    pub fn new() -> Result<Self> {
        let daemon = ServiceDaemon::new()?;
        let events = daemon.browse(&service_type())?;
        Ok(Self {
            _daemon: daemon,
            events,
            known: Mutex::new(HashMap::new()),
        })
    }

    fn advertisement_from(info: &ServiceInfo) -> Option<Advertisement> {
        let fullname = info.get_fullname();
        let worker_id = fullname.split('.').next()?.to_string();
        if worker_id.is_empty() {
            return None;
        }
        let display_name = info
            .get_property_val_str("name")
            .unwrap_or(worker_id.as_str())
            .to_string();
        let port = info.get_port();
        let mut addresses: Vec<SocketAddr> = info
            .get_addresses()
            .iter()
            .map(|ip| SocketAddr::new(*ip, port))
            .collect();
        addresses.sort();
        if addresses.is_empty() {
            return None;
        }
        Some(Advertisement {
            worker_id,
            display_name,
            addresses,
        })
    }
}

#[async_trait]
impl ServiceBrowser for MdnsBrowser {
    async fn enumerate(&self) -> Result<Vec<Advertisement>> {
        // Fold everything the daemon pushed since the last cycle into the
        // known set, then snapshot it.
        while let Ok(event) = self.events.try_recv() {
            match event {
                ServiceEvent::ServiceResolved(info) => {
                    if let Some(ad) = Self::advertisement_from(&info) {
                        self.known
                            .lock()
                            .insert(info.get_fullname().to_string(), ad);
                    }
                }
                ServiceEvent::ServiceRemoved(_ty, fullname) => {
                    self.known.lock().remove(&fullname);
                }
                _ => {}
            }
        }
        Ok(self.known.lock().values().cloned().collect())
    }
}

/// Advertises a worker under the versioned service type until dropped.
pub struct Announcer {
    daemon: ServiceDaemon,
    fullname: String,
}

impl Announcer {
    pub fn announce(worker_id: &str, display_name: &str, port: u16) -> Result<Self> {
        let daemon = ServiceDaemon::new()?;
        let hostname = format!("{worker_id}.local.");
        let properties = [("name", display_name)];
        let info = ServiceInfo::new(
            &service_type(),
            worker_id,
            &hostname,
            "",
            port,
            &properties[..],
        )?
        .enable_addr_auto();
        let fullname = info.get_fullname().to_string();
        daemon.register(info)?;
        tracing::info!(worker_id, port, "announcing worker on local network");
        Ok(Self { daemon, fullname })
    }
}

impl Drop for Announcer {
    fn drop(&mut self) {
        let _ = self.daemon.unregister(&self.fullname);
    }
}

/// Builds a [`WorkerClient`] for one candidate address.
pub type ClientFactory = Arc<dyn Fn(SocketAddr) -> Arc<dyn WorkerClient> + Send + Sync>;

/// Loop timing and probing knobs.
#[derive(Debug, Clone, Copy)]
pub struct DiscoverySettings {
    pub poll_interval: Duration,
    /// Fixed delay after an enumeration failure.
    pub error_backoff: Duration,
    pub ping_deadline: Duration,
    pub connect_timeout: Duration,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            error_backoff: Duration::from_secs(5),
            ping_deadline: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// The background loop that feeds the remote fulfiller.
pub struct Discovery {
    browser: Arc<dyn ServiceBrowser>,
    client_factory: ClientFactory,
    local_worker_id: Option<String>,
    settings: DiscoverySettings,
}

impl Discovery {
    pub fn new(
        browser: Arc<dyn ServiceBrowser>,
        client_factory: ClientFactory,
        local_worker_id: Option<String>,
        settings: DiscoverySettings,
    ) -> Self {
        Self {
            browser,
            client_factory,
            local_worker_id,
            settings,
        }
    }

    /// Factory producing TCP clients with the settings' connect timeout.
    pub fn tcp_client_factory(settings: &DiscoverySettings) -> ClientFactory {
        let connect_timeout = settings.connect_timeout;
        Arc::new(move |addr| {
            Arc::new(TcpWorkerClient::new(addr, connect_timeout)) as Arc<dyn WorkerClient>
        })
    }

    pub fn spawn(self, fulfiller: Arc<Fulfiller>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run(fulfiller, cancel).await;
        })
    }

    async fn run(self, fulfiller: Arc<Fulfiller>, cancel: CancellationToken) {
        tracing::debug!(service = %service_type(), "discovery loop started");
        loop {
            let delay = match self.scan_once(&fulfiller).await {
                Ok(()) => self.settings.poll_interval,
                Err(e) => {
                    // Transient discovery errors never terminate the loop.
                    tracing::error!("worker discovery failed: {:#}", e);
                    self.settings.error_backoff
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        tracing::debug!("discovery loop stopped");
    }

    /// One enumeration cycle: admit every advertisement that is new,
    /// not the local worker, and reachable.
    pub(crate) async fn scan_once(&self, fulfiller: &Arc<Fulfiller>) -> Result<()> {
        let advertisements = self.browser.enumerate().await?;
        for ad in advertisements {
            if self.local_worker_id.as_deref() == Some(ad.worker_id.as_str()) {
                continue;
            }
            if fulfiller.contains_provider(&ad.worker_id) {
                continue;
            }
            self.try_admit(fulfiller, &ad).await;
        }
        Ok(())
    }

    /// Tries each advertised address in turn; the first that answers a
    /// bounded-deadline ping wins. Only then is a provider constructed
    /// and registered.
    async fn try_admit(&self, fulfiller: &Arc<Fulfiller>, ad: &Advertisement) {
        for addr in &ad.addresses {
            let client = (self.client_factory)(*addr);
            match client.ping(self.settings.ping_deadline).await {
                Ok(()) => {
                    let worker =
                        Worker::new(ad.worker_id.clone(), ad.display_name.clone(), client, false);
                    let provider = WorkerCoreProvider::new(worker);
                    if fulfiller.register_provider(provider) {
                        tracing::info!(
                            worker = %ad.display_name,
                            id = %ad.worker_id,
                            %addr,
                            "admitted remote worker"
                        );
                    }
                    return;
                }
                Err(e) => {
                    tracing::debug!(
                        worker = %ad.display_name,
                        %addr,
                        "advertised address did not answer ping: {:#}",
                        e
                    );
                }
            }
        }
        tracing::debug!(
            worker = %ad.display_name,
            "no advertised address answered; not admitting"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::WorkerStream;
    use crate::fulfiller::FulfillerSettings;
    use crate::subpool::Subpool;

    struct FixedBrowser {
        ads: Vec<Advertisement>,
    }

    #[async_trait]
    impl ServiceBrowser for FixedBrowser {
        async fn enumerate(&self) -> Result<Vec<Advertisement>> {
            Ok(self.ads.clone())
        }
    }

    struct ProbeClient {
        addr: SocketAddr,
        reachable: bool,
        pinged: Arc<Mutex<Vec<SocketAddr>>>,
    }

    #[async_trait]
    impl WorkerClient for ProbeClient {
        async fn open_stream(&self) -> Result<WorkerStream> {
            anyhow::bail!("unused")
        }

        async fn ping(&self, _deadline: Duration) -> Result<()> {
            self.pinged.lock().push(self.addr);
            if self.reachable {
                Ok(())
            } else {
                anyhow::bail!("no route to {}", self.addr)
            }
        }
    }

    fn probing_factory(
        reachable: Vec<SocketAddr>,
        pinged: Arc<Mutex<Vec<SocketAddr>>>,
    ) -> ClientFactory {
        Arc::new(move |addr| {
            Arc::new(ProbeClient {
                addr,
                reachable: reachable.contains(&addr),
                pinged: pinged.clone(),
            }) as Arc<dyn WorkerClient>
        })
    }

    fn remote_fulfiller() -> Arc<Fulfiller> {
        Fulfiller::new("remote", Subpool::new("remote"), FulfillerSettings::default())
    }

    fn ad(id: &str, addrs: &[&str]) -> Advertisement {
        Advertisement {
            worker_id: id.to_string(),
            display_name: id.to_string(),
            addresses: addrs.iter().map(|a| a.parse().unwrap()).collect(),
        }
    }

    #[tokio::test]
    async fn test_first_answering_address_wins() {
        let dead: SocketAddr = "10.0.0.1:7000".parse().unwrap();
        let live: SocketAddr = "10.0.0.2:7000".parse().unwrap();
        let pinged = Arc::new(Mutex::new(Vec::new()));

        let discovery = Discovery::new(
            Arc::new(FixedBrowser {
                ads: vec![ad("w-1", &["10.0.0.1:7000", "10.0.0.2:7000"])],
            }),
            probing_factory(vec![live], pinged.clone()),
            None,
            DiscoverySettings::default(),
        );
        let fulfiller = remote_fulfiller();

        discovery.scan_once(&fulfiller).await.unwrap();

        assert_eq!(*pinged.lock(), vec![dead, live]);
        assert!(fulfiller.contains_provider("w-1"));
    }

    #[tokio::test]
    async fn test_unreachable_worker_is_not_admitted() {
        let pinged = Arc::new(Mutex::new(Vec::new()));
        let discovery = Discovery::new(
            Arc::new(FixedBrowser {
                ads: vec![ad("w-1", &["10.0.0.1:7000"])],
            }),
            probing_factory(vec![], pinged),
            None,
            DiscoverySettings::default(),
        );
        let fulfiller = remote_fulfiller();

        discovery.scan_once(&fulfiller).await.unwrap();
        assert!(!fulfiller.contains_provider("w-1"));
    }

    #[tokio::test]
    async fn test_never_admits_duplicates_or_local_id() {
        let live: SocketAddr = "10.0.0.2:7000".parse().unwrap();
        let pinged = Arc::new(Mutex::new(Vec::new()));
        let discovery = Discovery::new(
            Arc::new(FixedBrowser {
                ads: vec![
                    ad("w-1", &["10.0.0.2:7000"]),
                    ad("w-1", &["10.0.0.2:7000"]),
                    ad("me", &["10.0.0.2:7000"]),
                ],
            }),
            probing_factory(vec![live], pinged.clone()),
            Some("me".to_string()),
            DiscoverySettings::default(),
        );
        let fulfiller = remote_fulfiller();

        discovery.scan_once(&fulfiller).await.unwrap();
        // Repeat scans must not re-admit either.
        discovery.scan_once(&fulfiller).await.unwrap();

        assert_eq!(fulfiller.provider_ids(), vec!["w-1".to_string()]);
        // Exactly one probe: the duplicate and the local id were never
        // even pinged, and repeat scans did not re-probe.
        assert_eq!(pinged.lock().len(), 1);
    }

    #[test]
    fn test_service_type_is_versioned() {
        let ty = service_type();
        assert!(ty.starts_with('_'));
        assert!(ty.contains(&format!("{}-forge", PROTOCOL_VERSION)));
        assert!(ty.ends_with("._tcp.local."));
    }
}
