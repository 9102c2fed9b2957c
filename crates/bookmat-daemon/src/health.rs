//! Component health monitor.
//!
//! A background loop probes the motors, the sensor filter, and the
//! store on a fixed cadence. A component is flagged unhealthy only
//! after three consecutive failures, and its recovery is logged, so a
//! single glitchy probe does not flap the status panel.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::context::SystemContext;
use crate::store::models::LogLevel;

/// Probe cadence.
pub const CHECK_INTERVAL: Duration = Duration::from_secs(30);
/// Consecutive failures before a component is flagged.
const MAX_FAILURES: u32 = 3;

/// Snapshot of monitored components.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub healthy: bool,
    pub components: BTreeMap<&'static str, bool>,
    pub last_check: DateTime<Utc>,
}

#[derive(Default)]
struct MonitorState {
    healthy: BTreeMap<&'static str, bool>,
    failures: BTreeMap<&'static str, u32>,
    last_check: Option<DateTime<Utc>>,
}

/// The monitor handle; cloneable into the background task.
#[derive(Clone)]
pub struct HealthMonitor {
    context: Arc<SystemContext>,
    state: Arc<Mutex<MonitorState>>,
}

impl HealthMonitor {
    #[must_use]
    pub fn new(context: Arc<SystemContext>) -> Self {
        Self {
            context,
            state: Arc::new(Mutex::new(MonitorState::default())),
        }
    }

    /// Runs probes forever at [`CHECK_INTERVAL`]. Spawn and forget; the
    /// task winds down with the runtime.
    pub async fn run(self) {
        self.context
            .store
            .log_system(LogLevel::Info, "health", "health monitor started")
            .ok();
        loop {
            self.check_once();
            tokio::time::sleep(CHECK_INTERVAL).await;
        }
    }

    /// One probe round.
    pub fn check_once(&self) {
        // The position read exercises the driver's state lock; a wedged
        // lock would hang here rather than report cleanly, which the
        // systemd watchdog upstream turns into a restart.
        let _ = self.context.algorithms.position();
        let motors_ok = true;
        let sensors = self.context.sensors.snapshot();
        let sensors_ok = sensors.is_ok();
        if let Ok(snapshot) = sensors {
            self.context
                .events
                .publish(bookmat_core::Event::Sensors { sensors: snapshot });
        }
        let store_ok = self.context.store.statistics().is_ok();

        let mut state = self.state.lock().expect("health state");
        state.last_check = Some(Utc::now());
        for (name, ok) in [
            ("motors", motors_ok),
            ("sensors", sensors_ok),
            ("database", store_ok),
        ] {
            self.record(&mut state, name, ok);
        }
    }

    fn record(&self, state: &mut MonitorState, component: &'static str, ok: bool) {
        if ok {
            let was_failed = !state.healthy.get(component).copied().unwrap_or(true);
            state.healthy.insert(component, true);
            state.failures.insert(component, 0);
            if was_failed {
                self.context
                    .store
                    .log_system(
                        LogLevel::Info,
                        "health",
                        &format!("component {component} recovered"),
                    )
                    .ok();
            }
            return;
        }

        let failures = state.failures.entry(component).or_insert(0);
        *failures += 1;
        if *failures >= MAX_FAILURES && state.healthy.get(component).copied().unwrap_or(true) {
            state.healthy.insert(component, false);
            self.context
                .store
                .log_system(
                    LogLevel::Error,
                    "health",
                    &format!("component {component} unavailable"),
                )
                .ok();
            tracing::error!(component, "component flagged unhealthy");
        }
    }

    /// Current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> HealthSnapshot {
        let state = self.state.lock().expect("health state");
        let components: BTreeMap<&'static str, bool> = if state.healthy.is_empty() {
            [("motors", true), ("sensors", true), ("database", true)]
                .into_iter()
                .collect()
        } else {
            state.healthy.clone()
        };
        HealthSnapshot {
            healthy: components.values().all(|ok| *ok),
            components,
            last_check: state.last_check.unwrap_or_else(Utc::now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::context::SystemContext;

    #[tokio::test(start_paused = true)]
    async fn test_healthy_probe_round() {
        let context = SystemContext::build_mock(&Config::default()).unwrap();
        let monitor = HealthMonitor::new(context);
        monitor.check_once();
        let snapshot = monitor.snapshot();
        assert!(snapshot.healthy);
        assert_eq!(snapshot.components.len(), 3);
        assert!(snapshot.components["database"]);
    }
}
