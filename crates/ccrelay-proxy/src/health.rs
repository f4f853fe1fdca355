//! Endpoint health tracking.
//!
//! Each endpoint moves through `Unknown -> Healthy <-> Unhealthy`. Any
//! failure, whether from a probe or a live request, bans the endpoint for
//! the configured duration. A ban always runs to completion: a probe that
//! succeeds mid-ban restores `Healthy` but the endpoint stays ineligible
//! until the ban elapses. Expired bans are cleared lazily on access.

use crate::probe::{check_with_timeout, Probe, ProbeKind};
use crate::registry::{Endpoint, EndpointRegistry};
use ccrelay_config::{FailedEndpointSettings, HealthCheckSettings};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone)]
pub struct HealthState {
    pub status: HealthStatus,
    pub banned_until: Option<Instant>,
    pub consecutive_failures: u32,
    pub last_checked_at: Option<Instant>,
    pub total_requests: u64,
    pub total_failures: u64,
    pub last_error: Option<String>,
}

impl HealthState {
    fn new(status: HealthStatus) -> Self {
        Self {
            status,
            banned_until: None,
            consecutive_failures: 0,
            last_checked_at: None,
            total_requests: 0,
            total_failures: 0,
            last_error: None,
        }
    }

    /// Drop a ban whose deadline has passed. Returns true if one was cleared.
    fn expire_ban(&mut self, now: Instant) -> bool {
        match self.banned_until {
            Some(until) if until <= now => {
                self.banned_until = None;
                // Re-admit the endpoint; the next probe or request revalidates.
                if self.status == HealthStatus::Unhealthy {
                    self.status = HealthStatus::Healthy;
                }
                true
            }
            _ => false,
        }
    }

    pub fn is_eligible_at(&self, now: Instant) -> bool {
        self.status == HealthStatus::Healthy && self.banned_until.map_or(true, |until| until <= now)
    }

    /// Remaining ban time, if banned.
    pub fn banned_for(&self, now: Instant) -> Option<Duration> {
        self.banned_until
            .filter(|until| *until > now)
            .map(|until| until - now)
    }
}

/// Per-endpoint health state, each behind its own lock.
#[derive(Debug)]
pub struct HealthMonitor {
    states: HashMap<String, Mutex<HealthState>>,
    settings: HealthCheckSettings,
    ban_duration: Duration,
}

impl HealthMonitor {
    pub fn new(
        registry: &EndpointRegistry,
        settings: &HealthCheckSettings,
        failed: &FailedEndpointSettings,
    ) -> Self {
        // Without probing nothing would ever leave `Unknown`.
        let initial = if settings.enabled {
            HealthStatus::Unknown
        } else {
            HealthStatus::Healthy
        };

        let states = registry
            .endpoints()
            .iter()
            .map(|e| (e.name.clone(), Mutex::new(HealthState::new(initial))))
            .collect();

        Self {
            states,
            settings: settings.clone(),
            ban_duration: failed.ban_duration(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.enabled
    }

    pub fn is_eligible(&self, name: &str) -> bool {
        self.is_eligible_at(name, Instant::now())
    }

    pub fn is_eligible_at(&self, name: &str, now: Instant) -> bool {
        let Some(state) = self.states.get(name) else {
            return false;
        };
        let mut state = state.lock();
        if state.expire_ban(now) {
            info!(endpoint = %name, "ban expired");
        }
        state.is_eligible_at(now)
    }

    /// Count a routed request against the endpoint.
    pub fn record_request(&self, name: &str) {
        if let Some(state) = self.states.get(name) {
            state.lock().total_requests += 1;
        }
    }

    pub fn record_success(&self, name: &str) {
        self.record_success_at(name, Instant::now());
    }

    pub fn record_success_at(&self, name: &str, now: Instant) {
        let Some(state) = self.states.get(name) else {
            return;
        };
        let mut state = state.lock();
        state.expire_ban(now);
        if state.status != HealthStatus::Healthy {
            debug!(endpoint = %name, "endpoint healthy");
        }
        state.status = HealthStatus::Healthy;
        state.consecutive_failures = 0;
        state.last_checked_at = Some(now);
        state.last_error = None;
    }

    pub fn record_failure(&self, name: &str, error: &str) {
        self.record_failure_at(name, error, Instant::now());
    }

    /// Mark the endpoint unhealthy and (re)start its ban.
    pub fn record_failure_at(&self, name: &str, error: &str, now: Instant) {
        let Some(state) = self.states.get(name) else {
            return;
        };
        let mut state = state.lock();
        state.status = HealthStatus::Unhealthy;
        state.consecutive_failures += 1;
        state.total_failures += 1;
        state.last_checked_at = Some(now);
        state.last_error = Some(error.to_string());
        state.banned_until = Some(now + self.ban_duration);
        warn!(
            endpoint = %name,
            failures = state.consecutive_failures,
            ban_secs = self.ban_duration.as_secs(),
            error = %error,
            "endpoint banned"
        );
    }

    /// Current state with any expired ban already cleared.
    pub fn snapshot(&self, name: &str) -> Option<HealthState> {
        self.snapshot_at(name, Instant::now())
    }

    pub fn snapshot_at(&self, name: &str, now: Instant) -> Option<HealthState> {
        let state = self.states.get(name)?;
        let mut state = state.lock();
        state.expire_ban(now);
        Some(state.clone())
    }

    /// Probe every endpoint concurrently and record the outcomes.
    pub async fn sweep(&self, endpoints: &[Arc<Endpoint>], probe: &dyn Probe) {
        let timeout = self.settings.timeout();
        let checks = endpoints.iter().map(|endpoint| async move {
            let result = check_with_timeout(probe, endpoint, ProbeKind::Health, timeout).await;
            (endpoint, result)
        });

        for (endpoint, result) in join_all(checks).await {
            match result {
                Ok(latency) => {
                    debug!(endpoint = %endpoint.name, latency_ms = latency.as_millis() as u64, "health probe ok");
                    self.record_success(&endpoint.name);
                }
                Err(e) => {
                    debug!(endpoint = %endpoint.name, error = %e, "health probe failed");
                    self.record_failure(&endpoint.name, &e.to_string());
                }
            }
        }
    }

    /// One synchronous round before the frontend opens its port. Each probe
    /// is bounded by the health-check timeout.
    pub async fn perform_initial_health_checks(
        &self,
        registry: &EndpointRegistry,
        probe: &dyn Probe,
    ) {
        if !self.settings.enabled {
            return;
        }
        self.sweep(registry.endpoints(), probe).await;
    }

    /// Periodic sweeps until `cancel` fires. Returns `None` when health
    /// checking is disabled.
    pub fn spawn(
        self: Arc<Self>,
        registry: Arc<EndpointRegistry>,
        probe: Arc<dyn Probe>,
        cancel: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        if !self.settings.enabled {
            return None;
        }

        let period = self.settings.interval();
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        self.sweep(registry.endpoints(), probe.as_ref()).await;
                    }
                }
            }
            debug!("health monitor stopped");
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::ProbeError;
    use async_trait::async_trait;
    use std::collections::HashSet;

    struct ScriptedProbe {
        failing: HashSet<String>,
    }

    #[async_trait]
    impl Probe for ScriptedProbe {
        async fn check(&self, endpoint: &Endpoint, _kind: ProbeKind) -> Result<Duration, ProbeError> {
            if self.failing.contains(&endpoint.name) {
                Err(ProbeError::Status(500))
            } else {
                Ok(Duration::from_millis(5))
            }
        }
    }

    struct HangingProbe;

    #[async_trait]
    impl Probe for HangingProbe {
        async fn check(&self, _endpoint: &Endpoint, _kind: ProbeKind) -> Result<Duration, ProbeError> {
            std::future::pending().await
        }
    }

    fn registry() -> EndpointRegistry {
        EndpointRegistry::new(vec![
            Endpoint::for_tests("a", "https://a.example.com", 1),
            Endpoint::for_tests("b", "https://b.example.com", 2),
        ])
        .unwrap()
    }

    fn monitor(enabled: bool, ban_secs: u64) -> HealthMonitor {
        let health = HealthCheckSettings {
            enabled,
            interval_ms: 1_000,
            timeout_ms: 50,
        };
        let failed = FailedEndpointSettings {
            ban_duration_seconds: ban_secs,
        };
        HealthMonitor::new(&registry(), &health, &failed)
    }

    #[test]
    fn test_initial_state_depends_on_health_checking() {
        let probed = monitor(true, 10);
        assert_eq!(probed.snapshot("a").unwrap().status, HealthStatus::Unknown);
        assert!(!probed.is_eligible("a"));

        let reactive = monitor(false, 10);
        assert_eq!(reactive.snapshot("a").unwrap().status, HealthStatus::Healthy);
        assert!(reactive.is_eligible("a"));
    }

    #[test]
    fn test_ban_holds_for_its_full_duration() {
        let monitor = monitor(false, 60);
        let t = Instant::now();
        monitor.record_failure_at("a", "boom", t);

        assert!(!monitor.is_eligible_at("a", t));
        assert!(!monitor.is_eligible_at("a", t + Duration::from_secs(59)));

        // A successful probe mid-ban does not lift the ban early.
        monitor.record_success_at("a", t + Duration::from_secs(30));
        assert!(!monitor.is_eligible_at("a", t + Duration::from_secs(31)));

        assert!(monitor.is_eligible_at("a", t + Duration::from_secs(60)));
        let state = monitor.snapshot_at("a", t + Duration::from_secs(60)).unwrap();
        assert!(state.banned_until.is_none());
        assert_eq!(state.consecutive_failures, 0);
    }

    #[test]
    fn test_expired_ban_readmits_without_probe() {
        let monitor = monitor(false, 5);
        let t = Instant::now();
        monitor.record_failure_at("a", "boom", t);
        monitor.record_failure_at("a", "boom", t);

        let state = monitor.snapshot_at("a", t).unwrap();
        assert_eq!(state.status, HealthStatus::Unhealthy);
        assert_eq!(state.consecutive_failures, 2);
        assert_eq!(state.banned_for(t), Some(Duration::from_secs(5)));

        assert!(monitor.is_eligible_at("a", t + Duration::from_secs(5)));
        // Failures carry over until something succeeds.
        let state = monitor.snapshot_at("a", t + Duration::from_secs(5)).unwrap();
        assert_eq!(state.status, HealthStatus::Healthy);
        assert_eq!(state.consecutive_failures, 2);
    }

    #[test]
    fn test_request_counters() {
        let monitor = monitor(false, 5);
        monitor.record_request("a");
        monitor.record_request("a");
        monitor.record_failure("a", "503");
        let state = monitor.snapshot("a").unwrap();
        assert_eq!(state.total_requests, 2);
        assert_eq!(state.total_failures, 1);
        assert_eq!(state.last_error.as_deref(), Some("503"));
        assert!(monitor.snapshot("missing").is_none());
        assert!(!monitor.is_eligible("missing"));
    }

    #[tokio::test]
    async fn test_initial_checks_probe_every_endpoint() {
        let registry = registry();
        let monitor = monitor(true, 60);
        let probe = ScriptedProbe {
            failing: HashSet::from(["b".to_string()]),
        };

        monitor.perform_initial_health_checks(&registry, &probe).await;

        assert!(monitor.is_eligible("a"));
        assert!(!monitor.is_eligible("b"));
        assert_eq!(monitor.snapshot("b").unwrap().status, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_slow_probe_is_recorded_unhealthy() {
        let registry = registry();
        let monitor = monitor(true, 60);

        monitor.perform_initial_health_checks(&registry, &HangingProbe).await;

        let state = monitor.snapshot("a").unwrap();
        assert_eq!(state.status, HealthStatus::Unhealthy);
        assert!(state.last_error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_disabled_monitor_spawns_nothing() {
        let registry = Arc::new(registry());
        let monitor = Arc::new(monitor(false, 60));
        let handle = monitor.spawn(
            registry,
            Arc::new(HangingProbe),
            CancellationToken::new(),
        );
        assert!(handle.is_none());
    }

    #[tokio::test]
    async fn test_background_task_stops_on_cancel() {
        let registry = Arc::new(registry());
        let monitor = Arc::new(monitor(true, 60));
        let cancel = CancellationToken::new();
        let handle = monitor
            .spawn(
                registry,
                Arc::new(ScriptedProbe {
                    failing: HashSet::new(),
                }),
                cancel.clone(),
            )
            .unwrap();

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
