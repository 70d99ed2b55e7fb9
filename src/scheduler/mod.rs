//! Scheduler loop.
//!
//! One thread ticks every `monitoring-ticker` seconds and runs, in order:
//! save, git sync (push when needed, tenant pull, token refresh), peer
//! heartbeats. Each managed cluster runs its own monitor thread. Background
//! failures are logged and retried on the next tick; nothing here aborts the
//! loop.

mod signal;

pub use signal::{install, ShutdownState, SignalAction};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::arbitration::RoundReport;
use crate::fleet::{ClusterHandle, Fleet, FleetError};
use crate::git::{GitError, TenantUpdate};
use crate::timing::{Interval, TickConfig};

/// What one tick did.
#[derive(Debug, Default)]
pub struct TickReport {
    /// The save wrote at least one artifact.
    pub saved: bool,
    pub save_failed: bool,
    pub pushed: bool,
    pub tenant: Option<TenantUpdate>,
    pub token_refreshed: bool,
    pub arbitration: Option<RoundReport>,
}

/// What shutdown did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    pub ticks: u64,
    pub final_save_changed: bool,
    pub pushed: bool,
    pub backed_up: usize,
}

struct Monitor {
    stop: Arc<ShutdownState>,
    handle: JoinHandle<()>,
}

/// Per-cluster monitor threads, kept in step with the fleet's cluster map.
#[derive(Default)]
struct MonitorPool {
    monitors: BTreeMap<String, Monitor>,
}

impl MonitorPool {
    fn sync(&mut self, clusters: Vec<Arc<dyn ClusterHandle>>, period: Duration) {
        let live: Vec<String> = clusters.iter().map(|c| c.name().to_string()).collect();
        let gone: Vec<String> = self
            .monitors
            .keys()
            .filter(|name| !live.contains(*name))
            .cloned()
            .collect();
        for name in gone {
            if let Some(monitor) = self.monitors.remove(&name) {
                stop_monitor(&name, monitor);
            }
        }

        for cluster in clusters {
            let name = cluster.name().to_string();
            if self.monitors.contains_key(&name) {
                continue;
            }
            let stop = Arc::new(ShutdownState::new());
            let flag = Arc::clone(&stop);
            let thread_name = format!("monitor-{}", name);
            let spawned = std::thread::Builder::new().name(thread_name).spawn(move || {
                debug!(cluster = %cluster.name(), "cluster monitor started");
                loop {
                    cluster.monitor_tick();
                    if flag.sleep(period) {
                        break;
                    }
                }
                debug!(cluster = %cluster.name(), "cluster monitor stopped");
            });
            match spawned {
                Ok(handle) => {
                    self.monitors.insert(name, Monitor { stop, handle });
                }
                Err(e) => error!(cluster = %name, error = %e, "failed to start cluster monitor"),
            }
        }
    }

    fn stop_all(&mut self) {
        for (name, monitor) in std::mem::take(&mut self.monitors) {
            stop_monitor(&name, monitor);
        }
    }

    fn len(&self) -> usize {
        self.monitors.len()
    }
}

fn stop_monitor(name: &str, monitor: Monitor) {
    monitor.stop.request_stop();
    if monitor.handle.join().is_err() {
        warn!(cluster = %name, "cluster monitor panicked");
    }
}

/// Drives the fleet until shutdown.
pub struct Scheduler {
    fleet: Arc<Fleet>,
    timing: TickConfig,
    shutdown: Arc<ShutdownState>,
}

impl Scheduler {
    pub fn new(fleet: Arc<Fleet>, timing: TickConfig, shutdown: Arc<ShutdownState>) -> Self {
        Self {
            fleet,
            timing,
            shutdown,
        }
    }

    pub fn fleet(&self) -> &Arc<Fleet> {
        &self.fleet
    }

    fn cluster_handles(&self) -> Vec<Arc<dyn ClusterHandle>> {
        self.fleet
            .clusters()
            .into_iter()
            .map(|c| c as Arc<dyn ClusterHandle>)
            .collect()
    }

    /// One pass: save, git sync, heartbeat.
    pub fn tick(&self, now: Instant) -> TickReport {
        let mut report = TickReport::default();

        match self.fleet.save() {
            Ok(changed) => report.saved = changed,
            Err(e) => {
                report.save_failed = true;
                warn!(error = %e, "save failed, retrying next tick");
            }
        }

        match self.fleet.push_if_needed() {
            Ok(pushed) => report.pushed = pushed,
            Err(e) => warn!(error = %e, "push failed, retrying next tick"),
        }
        report.tenant = self.fleet.pull_tenant_if_due(now);
        if let Some(update) = &report.tenant {
            if update.any() {
                info!(update = ?update, "tenant files reloaded");
            }
        }
        match self.fleet.refresh_git_token_if_due(now) {
            Ok(refreshed) => report.token_refreshed = refreshed,
            // Already logged at error level by the refresh itself.
            Err(FleetError::Git(GitError::InvalidGrant(_))) => {}
            Err(e) => warn!(error = %e, "token refresh failed"),
        }

        report.arbitration = self.fleet.arbitrate();
        report
    }

    /// Tick until a stop is requested, then shut down.
    pub fn run(&self) -> ShutdownReport {
        let mut monitors = MonitorPool::default();
        let mut interval = Interval::new(self.timing.tick(), Instant::now());
        let mut ticks = 0u64;
        info!(
            tick_seconds = self.timing.tick_seconds,
            clusters = self.fleet.cluster_names().len(),
            "scheduler started"
        );

        while !self.shutdown.is_stop_requested() {
            monitors.sync(self.cluster_handles(), self.timing.tick());
            let now = Instant::now();
            interval.mark(now);
            let report = self.tick(now);
            ticks += 1;
            debug!(
                tick = ticks,
                monitors = monitors.len(),
                saved = report.saved,
                pushed = report.pushed,
                split_brain = report.arbitration.as_ref().map(|r| r.split_brain),
                "tick complete"
            );
            if self.shutdown.sleep(interval.remaining(Instant::now())) {
                break;
            }
        }

        monitors.stop_all();
        let mut report = self.shutdown();
        report.ticks = ticks;
        report
    }

    /// Final save, then the pending push and the backup export unless a
    /// second signal arrived.
    pub fn shutdown(&self) -> ShutdownReport {
        let mut report = ShutdownReport::default();
        info!("shutting down, running final save");
        match self.fleet.save() {
            Ok(changed) => report.final_save_changed = changed,
            Err(e) => error!(error = %e, "final save failed"),
        }
        if self.shutdown.is_immediate_exit() {
            warn!("immediate exit requested, skipping push and backup");
            return report;
        }

        if self.fleet.push_requested() {
            match self.fleet.push_if_needed() {
                Ok(pushed) => report.pushed = pushed,
                Err(e) => error!(error = %e, "final push failed"),
            }
        }
        match self.fleet.export_backup() {
            Ok(files) => report.backed_up = files,
            Err(e) => warn!(error = %e, "backup export failed"),
        }
        info!(
            saved = report.final_save_changed,
            pushed = report.pushed,
            backed_up = report.backed_up,
            "shutdown complete"
        );
        report
    }
}
