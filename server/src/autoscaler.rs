//! Feedback-controlled client autoscaling
//!
//! Every `autoscale.period` seconds the autoscaler samples the registered
//! client count and the task pressure and asks the launcher for more clients
//! when warranted. The fixed policy simply tops the population up to
//! `max(init, min)`. The dynamic policy estimates time-to-completion from
//! the rolling average task duration and the fleet's executor throughput,
//! and launches while `toc / (factor × avg_duration) > 1`, bounded by `max`.
//! Clients are never terminated here; attrition happens through the client
//! idle timeout.

use anyhow::Result;
use shared::config::{AutoscaleConfig, ClientConfig};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::database::TaskStore;
use crate::dispatcher::Registrations;
use crate::launcher::Launcher;

/// The rolling average covers this many sample periods.
const DURATION_WINDOW_PERIODS: u64 = 5;

/// Sampled state and the decision derived from it, exposed for tests.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaleDecision {
    pub active: usize,
    pub pressure: Option<f64>,
    pub launches: usize,
}

pub struct Autoscaler {
    config: AutoscaleConfig,
    client: ClientConfig,
    registrations: Registrations,
    store: Option<Arc<Mutex<TaskStore>>>,
    launcher: Launcher,
    shutdown: broadcast::Receiver<()>,
}

impl Autoscaler {
    pub fn new(
        config: AutoscaleConfig,
        client: ClientConfig,
        registrations: Registrations,
        store: Option<Arc<Mutex<TaskStore>>>,
        launcher: Launcher,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            config,
            client,
            registrations,
            store,
            launcher,
            shutdown,
        }
    }

    /// Control loop; runs until shutdown.
    pub async fn run(mut self) -> Result<()> {
        info!(
            policy = %self.config.policy,
            init = self.config.size.init,
            min = self.config.size.min,
            max = self.config.size.max,
            "Autoscaler started"
        );

        // Bring the initial population up immediately; the periodic loop
        // only corrects from there.
        let mut interval = tokio::time::interval(Duration::from_secs(self.config.period.max(1)));
        interval.tick().await;
        for _ in 0..self.config.size.init {
            if let Err(e) = self.launcher.launch() {
                warn!("Launcher failed during initial population: {}", e);
                break;
            }
        }

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.shutdown.recv() => {
                    info!("Autoscaler received shutdown signal");
                    return Ok(());
                }
            }

            let active = self.registrations.lock().await.len();
            let decision = self.decide(active).await?;
            if let Some(pressure) = decision.pressure {
                debug!(
                    active = decision.active,
                    pressure, "Autoscaler sampled task pressure"
                );
            }
            for _ in 0..decision.launches {
                if let Err(e) = self.launcher.launch() {
                    // A launcher failure skips the rest of this cycle.
                    warn!("Launcher failed: {}", e);
                    break;
                }
            }
        }
    }

    /// Decide how many launches this cycle wants.
    pub(crate) async fn decide(&self, active: usize) -> Result<ScaleDecision> {
        match self.config.policy.as_str() {
            "fixed" => {
                let target = self.config.size.init.max(self.config.size.min);
                Ok(ScaleDecision {
                    active,
                    pressure: None,
                    launches: target.saturating_sub(active),
                })
            }
            _ => {
                if active < self.config.size.min {
                    return Ok(ScaleDecision {
                        active,
                        pressure: None,
                        launches: 1,
                    });
                }
                let Some(store) = &self.store else {
                    return Ok(ScaleDecision {
                        active,
                        pressure: None,
                        launches: 0,
                    });
                };

                let (remaining, avg_duration) = {
                    let mut store = store.lock().await;
                    let remaining = store.count_remaining()?;
                    let window = self.config.period * DURATION_WINDOW_PERIODS;
                    let avg = store.recent_avg_duration(window)?;
                    (remaining, avg)
                };

                if remaining == 0 {
                    return Ok(ScaleDecision {
                        active,
                        pressure: Some(0.0),
                        launches: 0,
                    });
                }

                let pressure = compute_pressure(
                    remaining,
                    avg_duration,
                    active,
                    self.client.num_tasks,
                    self.config.factor,
                );

                let wants_launch = match pressure {
                    // No throughput data yet: cold-start one client so work
                    // begins to flow.
                    None => active == 0,
                    Some(pressure) => pressure > 1.0,
                };
                let launches = if wants_launch && active < self.config.size.max {
                    1
                } else {
                    0
                };
                Ok(ScaleDecision {
                    active,
                    pressure,
                    launches,
                })
            }
        }
    }
}

/// Dimensionless task pressure: `toc / (factor × avg_duration)` where
/// `toc = remaining / throughput` and `throughput` is total executors over
/// the average duration. None when there is no data to estimate from.
pub fn compute_pressure(
    remaining: i64,
    avg_duration: Option<f64>,
    active: usize,
    num_tasks: usize,
    factor: f64,
) -> Option<f64> {
    let avg = avg_duration?;
    if avg <= 0.0 || active == 0 || num_tasks == 0 || factor <= 0.0 {
        return None;
    }
    let executors = (active * num_tasks) as f64;
    let throughput = executors / avg;
    let toc = remaining as f64 / throughput;
    Some(toc / (factor * avg))
}
