//! Start-or-reuse lifecycle of the local proxy.

use crate::error::Result;
use crate::server::{self, RunningProxy};
use crate::service::ProxyService;
use crate::singleton::{LockGuard, Occupancy, SharedProxy, SingletonCoordinator};
use crate::status::ProxyStatus;
use ccrelay_config::CcrelayConfig;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Added to the health-check timeout when waiting for a starting owner.
const READY_SLACK: Duration = Duration::from_secs(5);

/// What a launcher ended up with.
#[derive(Debug)]
pub enum Launch {
    Started(ProxyInstance),
    Reused(SharedProxy),
}

impl Launch {
    pub fn url(&self) -> String {
        match self {
            Self::Started(instance) => instance.url(),
            Self::Reused(shared) => shared.url().to_string(),
        }
    }

    pub fn api_key(&self) -> &str {
        match self {
            Self::Started(instance) => instance.api_key(),
            Self::Reused(shared) => shared.api_key(),
        }
    }

    pub fn is_reused(&self) -> bool {
        matches!(self, Self::Reused(_))
    }

    /// Other launchers currently sharing a proxy this one owns.
    pub fn active_leases(&self) -> usize {
        match self {
            Self::Started(instance) => instance.service.leases().active(),
            Self::Reused(_) => 0,
        }
    }

    pub async fn status(&self) -> Result<ProxyStatus> {
        match self {
            Self::Started(instance) => Ok(instance.status()),
            Self::Reused(shared) => shared.fetch_status().await,
        }
    }

    /// Resolve once no other launcher holds a lease on a proxy this one
    /// owns. Immediate for a reused proxy.
    pub async fn wait_for_leases(&self) {
        if let Self::Started(instance) = self {
            instance.wait_for_leases().await;
        }
    }

    /// Drain a proxy this launcher owns right away, or give back the lease on
    /// a reused one, which keeps running.
    pub async fn shutdown(self) {
        match self {
            Self::Started(instance) => instance.shutdown().await,
            Self::Reused(mut shared) => {
                if let Err(e) = shared.release_lease().await {
                    warn!(error = %e, url = %shared.url(), "failed to release lease");
                }
            }
        }
    }

    /// Wait for other launchers to let go, then shut down.
    pub async fn release(self) {
        self.wait_for_leases().await;
        self.shutdown().await;
    }
}

/// A proxy owned by this process.
pub struct ProxyInstance {
    service: Arc<ProxyService>,
    server: RunningProxy,
    cancel: CancellationToken,
    background: Vec<JoinHandle<()>>,
    lock: LockGuard,
}

impl std::fmt::Debug for ProxyInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyInstance")
            .field("addr", &self.server.local_addr())
            .field("service", &self.service)
            .finish_non_exhaustive()
    }
}

impl ProxyInstance {
    pub fn url(&self) -> String {
        self.server.url()
    }

    pub fn api_key(&self) -> &str {
        self.service.proxy_api_key()
    }

    pub fn service(&self) -> &Arc<ProxyService> {
        &self.service
    }

    pub fn status(&self) -> ProxyStatus {
        self.service.status()
    }

    pub async fn wait_for_leases(&self) {
        let active = self.service.leases().active();
        if active > 0 {
            info!(active, "waiting for launchers sharing this proxy");
        }
        self.service.leases().wait_idle().await;
    }

    /// Stop the frontend, then the background timers, then release the lock.
    pub async fn shutdown(self) {
        let Self {
            service: _,
            server,
            cancel,
            background,
            lock,
        } = self;

        server.shutdown().await;
        cancel.cancel();
        for handle in background {
            if let Err(e) = handle.await {
                debug!(error = %e, "background task ended abnormally");
            }
        }
        drop(lock);
        info!("proxy stopped");
    }
}

/// Start a proxy for `config`, or reuse the one already serving its port.
///
/// Configuration errors surface before the port is touched.
pub async fn start_or_reuse(config: &CcrelayConfig, state_dir: &Path) -> Result<Launch> {
    let service = Arc::new(ProxyService::new(config)?);
    launch(service, state_dir).await
}

/// Like [`start_or_reuse`] with a prebuilt service.
///
/// The lock records are written as soon as the port is bound, so launchers
/// arriving during the initial health checks reuse this proxy instead of
/// seeing a foreign process.
pub async fn launch(service: Arc<ProxyService>, state_dir: &Path) -> Result<Launch> {
    let settings = service.settings();
    let coordinator =
        SingletonCoordinator::new(state_dir, settings.proxy.host.clone(), settings.proxy.port);

    let listener = match coordinator.inspect().await? {
        Occupancy::Reuse(mut shared) => {
            shared
                .wait_ready(settings.health_check.timeout() + READY_SLACK)
                .await?;
            shared.acquire_lease().await?;
            return Ok(Launch::Reused(shared));
        }
        Occupancy::Vacant(listener) => listener,
    };

    let url = format!("http://{}", listener.local_addr()?);
    let lock = coordinator.claim(&url, service.proxy_api_key())?;

    // Health is known before the first request is served.
    service.perform_initial_health_checks().await;

    let server = server::start(service.clone(), listener)?;
    let cancel = CancellationToken::new();
    let background = service.spawn_background(&cancel);

    info!(
        url = %server.url(),
        strategy = %service.strategy(),
        endpoints = service.registry().len(),
        "proxy started"
    );

    Ok(Launch::Started(ProxyInstance {
        service,
        server,
        cancel,
        background,
        lock,
    }))
}
