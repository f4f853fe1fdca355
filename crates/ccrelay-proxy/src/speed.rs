//! Rolling-window latency sampling for `SpeedFirst` selection.

use crate::probe::{check_with_timeout, Probe, ProbeKind};
use crate::registry::{Endpoint, EndpointRegistry};
use ccrelay_config::{SpeedFirstSettings, SpeedTestStrategy};
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

type Window = VecDeque<(Instant, u64)>;

/// Per-endpoint latency windows. Samples are evicted by age, never by count.
#[derive(Debug)]
pub struct SpeedSampler {
    windows: HashMap<String, Mutex<Window>>,
    settings: SpeedFirstSettings,
}

impl SpeedSampler {
    pub fn new(registry: &EndpointRegistry, settings: &SpeedFirstSettings) -> Self {
        let windows = registry
            .endpoints()
            .iter()
            .map(|e| (e.name.clone(), Mutex::new(VecDeque::new())))
            .collect();
        Self {
            windows,
            settings: settings.clone(),
        }
    }

    /// Whether live request latencies are the sample source.
    pub fn samples_live_traffic(&self) -> bool {
        self.settings.speed_test_strategy == SpeedTestStrategy::ResponseTime
    }

    /// Probe used by the background speed test, if any.
    pub fn probe_kind(&self) -> Option<ProbeKind> {
        match self.settings.speed_test_strategy {
            SpeedTestStrategy::ResponseTime => None,
            SpeedTestStrategy::HeadRequest => Some(ProbeKind::Head),
            SpeedTestStrategy::Ping => Some(ProbeKind::Ping),
        }
    }

    pub fn record(&self, name: &str, latency: Duration) {
        self.record_at(name, latency, Instant::now());
    }

    pub fn record_at(&self, name: &str, latency: Duration, now: Instant) {
        if let Some(window) = self.windows.get(name) {
            let mut window = window.lock();
            evict(&mut window, now, self.settings.window());
            window.push_back((now, latency.as_millis() as u64));
        }
    }

    /// Mean latency in ms, or `None` while the endpoint is unranked.
    pub fn average(&self, name: &str) -> Option<f64> {
        self.average_at(name, Instant::now())
    }

    pub fn average_at(&self, name: &str, now: Instant) -> Option<f64> {
        let min_samples = self.settings.min_samples.max(1);
        self.with_window(name, now, |window| {
            if window.len() < min_samples {
                None
            } else {
                mean(window)
            }
        })
    }

    /// Mean of whatever is in the window, ranked or not. Display only.
    pub fn raw_average(&self, name: &str) -> Option<f64> {
        self.with_window(name, Instant::now(), mean)
    }

    pub fn sample_count_at(&self, name: &str, now: Instant) -> usize {
        self.with_window(name, now, |window| Some(window.len()))
            .unwrap_or(0)
    }

    fn with_window<T>(
        &self,
        name: &str,
        now: Instant,
        f: impl FnOnce(&Window) -> Option<T>,
    ) -> Option<T> {
        let window = self.windows.get(name)?;
        let mut window = window.lock();
        evict(&mut window, now, self.settings.window());
        f(&window)
    }

    /// Run one speed test against every endpoint concurrently. Failed probes
    /// leave no sample.
    pub async fn sweep(&self, endpoints: &[Arc<Endpoint>], probe: &dyn Probe, timeout: Duration) {
        let Some(kind) = self.probe_kind() else {
            return;
        };

        let checks = endpoints.iter().map(|endpoint| async move {
            (endpoint, check_with_timeout(probe, endpoint, kind, timeout).await)
        });

        for (endpoint, result) in join_all(checks).await {
            match result {
                Ok(latency) => self.record(&endpoint.name, latency),
                Err(e) => debug!(endpoint = %endpoint.name, error = %e, "speed test failed"),
            }
        }
    }

    /// Background speed tests every `speedTestIntervalSeconds`. Only runs
    /// for `SpeedFirst` with an active (non live-traffic) test strategy.
    pub fn spawn(
        self: Arc<Self>,
        speed_first: bool,
        registry: Arc<EndpointRegistry>,
        probe: Arc<dyn Probe>,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        if !speed_first || self.probe_kind().is_none() {
            return None;
        }

        let period = self.settings.speed_test_interval();
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        self.sweep(registry.endpoints(), probe.as_ref(), timeout).await;
                    }
                }
            }
            debug!("speed sampler stopped");
        }))
    }
}

fn evict(window: &mut Window, now: Instant, max_age: Duration) {
    while let Some(&(at, _)) = window.front() {
        if now.saturating_duration_since(at) > max_age {
            window.pop_front();
        } else {
            break;
        }
    }
}

fn mean(window: &Window) -> Option<f64> {
    if window.is_empty() {
        return None;
    }
    let total: u64 = window.iter().map(|(_, ms)| ms).sum();
    Some(total as f64 / window.len() as f64)
}
