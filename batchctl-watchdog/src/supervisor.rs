//! Worker-liveness supervision loop: structured like the teacher's `hook-janitor` cleanup
//! loop (`tokio::time::interval` ticking a bounded-concurrency unit of work), generalized from
//! "clean up stale rows" to "detect a dead worker and restart it".

use std::collections::VecDeque;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use batchctl_common::health::HealthHandle;
use batchctl_common::store::Store;

use crate::config::Config;

#[derive(Debug)]
enum Classification {
    Healthy,
    Unhealthy(&'static str),
}

/// Sliding-hour ring of restart timestamps, used to enforce `RestartBudget`.
struct RestartLedger {
    events: VecDeque<DateTime<Utc>>,
}

impl RestartLedger {
    fn new() -> Self {
        Self {
            events: VecDeque::new(),
        }
    }

    /// Drops entries older than an hour, then returns the count of entries remaining (this
    /// count does NOT include the restart currently being considered).
    fn count_within_hour(&mut self, now: DateTime<Utc>) -> usize {
        let cutoff = now - chrono::Duration::hours(1);
        while matches!(self.events.front(), Some(t) if *t < cutoff) {
            self.events.pop_front();
        }
        self.events.len()
    }

    fn record(&mut self, now: DateTime<Utc>) {
        self.events.push_back(now);
    }
}

pub struct Supervisor {
    store: Store,
    config: Config,
    health: HealthHandle,
    ledger: RestartLedger,
    escalated: bool,
}

impl Supervisor {
    pub fn new(store: Store, config: Config, health: HealthHandle) -> Self {
        Self {
            store,
            config,
            health,
            ledger: RestartLedger::new(),
            escalated: false,
        }
    }

    pub async fn run(mut self) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.config.watchdog_interval_secs));
        loop {
            interval.tick().await;
            if self.escalated {
                // Restart budget was already exhausted; stay unhealthy and keep observing
                // without spawning more workers until an operator intervenes.
                self.health.report_status(
                    batchctl_common::health::ComponentStatus::Unhealthy,
                ).await;
                continue;
            }
            self.tick().await;
        }
    }

    async fn tick(&mut self) {
        match self.classify().await {
            Classification::Healthy => {
                self.health.report_healthy().await;
            }
            Classification::Unhealthy(reason) => {
                warn!(reason, "worker is unhealthy, considering restart");
                self.handle_unhealthy(reason).await;
            }
        }
    }

    async fn classify(&self) -> Classification {
        let heartbeat = match self.store.read_heartbeat().await {
            Ok(Some(h)) => h,
            Ok(None) => return Classification::Unhealthy("heartbeat never initialized"),
            Err(e) => {
                error!(error = %e, "failed to read heartbeat");
                return Classification::Unhealthy("store unreachable");
            }
        };

        let age = Utc::now() - heartbeat.last_seen;
        if age > chrono::Duration::seconds(self.config.stale_threshold_secs) {
            return Classification::Unhealthy("heartbeat stale");
        }

        if let Some(pid) = heartbeat.worker_pid {
            if !pid_is_alive(pid) {
                return Classification::Unhealthy("recorded pid is not a live process");
            }
        }

        Classification::Healthy
    }

    async fn handle_unhealthy(&mut self, reason: &'static str) {
        let now = Utc::now();
        let recent_restarts = self.ledger.count_within_hour(now);

        if recent_restarts >= self.config.restart_budget {
            error!(
                recent_restarts,
                budget = self.config.restart_budget,
                "restart budget exhausted, escalating instead of restarting"
            );
            self.escalated = true;
            self.health
                .report_status(batchctl_common::health::ComponentStatus::Unhealthy)
                .await;
            return;
        }

        self.ledger.record(now);

        if let Ok(Some(heartbeat)) = self.store.read_heartbeat().await {
            if let Some(pid) = heartbeat.worker_pid {
                kill_zombie(pid);
            }
        }
        self.clear_gpu_residue().await;
        self.spawn_worker(reason);
    }

    async fn clear_gpu_residue(&self) {
        let Some(pattern) = &self.config.gpu_residue_pattern else {
            return;
        };
        let status = tokio::process::Command::new("pkill")
            .arg("-9")
            .arg("-f")
            .arg(pattern)
            .status()
            .await;
        if let Err(e) = status {
            warn!(error = %e, "failed to run gpu residue cleanup command");
        }
    }

    fn spawn_worker(&self, reason: &'static str) {
        info!(reason, path = %self.config.worker_bin_path, "spawning replacement worker");
        match tokio::process::Command::new(&self.config.worker_bin_path).spawn() {
            Ok(mut child) => {
                metrics::counter!(batchctl_common::metrics::names::WORKER_RESTARTS_TOTAL)
                    .increment(1);
                tokio::spawn(async move {
                    let _ = child.wait().await;
                });
            }
            Err(e) => {
                error!(error = %e, "failed to spawn replacement worker");
            }
        }
    }
}

/// True if `pid` names a running process, checked via `/proc/{pid}` on Linux.
fn pid_is_alive(pid: i32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

fn kill_zombie(pid: i32) {
    match std::process::Command::new("kill").arg("-9").arg(pid.to_string()).status() {
        Ok(_) => info!(pid, "sent SIGKILL to presumed-zombie worker"),
        Err(e) => warn!(pid, error = %e, "failed to signal zombie worker"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restart_ledger_prunes_entries_older_than_an_hour() {
        let mut ledger = RestartLedger::new();
        let now = Utc::now();
        ledger.record(now - chrono::Duration::hours(2));
        ledger.record(now - chrono::Duration::minutes(10));

        assert_eq!(ledger.count_within_hour(now), 1);
    }

    #[test]
    fn restart_ledger_counts_recent_restarts() {
        let mut ledger = RestartLedger::new();
        let now = Utc::now();
        for _ in 0..3 {
            ledger.record(now);
        }
        assert_eq!(ledger.count_within_hour(now), 3);
    }
}
