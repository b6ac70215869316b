// Cron engine: in-memory registrations for every pipeline/job carrying a
// cron trigger, driven by a single tick loop. Missed fires during downtime
// are not replayed; on (re-)registration the next fire is computed from now.

use crate::config::SchedulerConfig;
use crate::errors::{ScheduleError, StoreError, TriggerError};
use crate::models::{FreestyleJob, Pipeline, TriggerKind, TriggerSource};
use crate::runs::RunFactory;
use crate::schedule;
use crate::scheduler::queue::TargetId;
use chrono::{DateTime, Utc};
use cron::Schedule as CronSchedule;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{debug, error, info, instrument, warn};

struct CronLine {
    schedule: CronSchedule,
    next_fire: DateTime<Utc>,
}

struct Registration {
    lines: Vec<CronLine>,
}

pub struct CronEngine {
    config: SchedulerConfig,
    factory: Arc<RunFactory>,
    registrations: Mutex<HashMap<TargetId, Registration>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl CronEngine {
    pub fn new(config: SchedulerConfig, factory: Arc<RunFactory>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            factory,
            registrations: Mutex::new(HashMap::new()),
            shutdown_tx,
        }
    }

    /// Register the cron triggers of a pipeline; a pipeline without any
    /// enabled cron trigger ends up unregistered.
    pub fn register_pipeline(&self, pipeline: &Pipeline) -> Result<(), ScheduleError> {
        let now = Utc::now();
        let mut lines = Vec::new();
        for trigger in &pipeline.spec.triggers {
            if trigger.kind != TriggerKind::Cron || !trigger.enabled {
                continue;
            }
            let Some(expression) = trigger.schedule.as_deref() else {
                continue;
            };
            let parsed = schedule::parse_cron(expression)?;
            let next_fire = schedule::next_fire(&parsed, now)?;
            lines.push(CronLine {
                schedule: parsed,
                next_fire,
            });
        }
        self.apply(TargetId::Pipeline(pipeline.id), lines, &pipeline.name);
        Ok(())
    }

    /// Register a freestyle job's cron trigger, if any and enabled
    pub fn register_job(&self, job: &FreestyleJob) -> Result<(), ScheduleError> {
        let mut lines = Vec::new();
        if job.enabled {
            if let Some(expression) = job.triggers.cron.as_deref() {
                let parsed = schedule::parse_cron(expression)?;
                let next_fire = schedule::next_fire(&parsed, Utc::now())?;
                lines.push(CronLine {
                    schedule: parsed,
                    next_fire,
                });
            }
        }
        self.apply(TargetId::Job(job.id), lines, &job.name);
        Ok(())
    }

    pub fn unregister(&self, target: TargetId) {
        if self.lock_registrations().remove(&target).is_some() {
            info!(target = ?target, "Unregistered cron target");
        }
    }

    fn apply(&self, target: TargetId, lines: Vec<CronLine>, name: &str) {
        let mut registrations = self.lock_registrations();
        if lines.is_empty() {
            registrations.remove(&target);
        } else {
            info!(target = ?target, name = %name, schedules = lines.len(), "Registered cron target");
            registrations.insert(target, Registration { lines });
        }
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Run the tick loop until shutdown. Spawned by the supervisor.
    #[instrument(skip(self))]
    pub async fn run(self: Arc<Self>) {
        info!(
            tick_interval_seconds = self.config.tick_interval_seconds,
            "Cron engine started"
        );
        let mut ticker = interval(Duration::from_secs(self.config.tick_interval_seconds));
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.fire_due(Utc::now()).await;
                }
                _ = shutdown_rx.recv() => {
                    info!("Cron engine stopping");
                    return;
                }
            }
        }
    }

    /// Fire every registration whose next instant has passed, then advance it.
    /// Public for tests; the loop above is the production driver.
    pub async fn fire_due(&self, now: DateTime<Utc>) {
        let due: Vec<TargetId> = {
            let mut registrations = self.lock_registrations();
            let mut due = Vec::new();
            for (target, registration) in registrations.iter_mut() {
                let mut fired = false;
                for line in &mut registration.lines {
                    if line.next_fire <= now {
                        fired = true;
                        match schedule::next_fire(&line.schedule, now) {
                            Ok(next) => line.next_fire = next,
                            Err(e) => {
                                warn!(target = ?target, error = %e, "No further fire instants");
                            }
                        }
                    }
                }
                if fired {
                    due.push(*target);
                }
            }
            due
        };

        for target in due {
            self.fire(target).await;
        }
    }

    async fn fire(&self, target: TargetId) {
        metrics::counter!("gagos_cron_fires_total").increment(1);
        let result = match target {
            TargetId::Pipeline(id) => self
                .factory
                .trigger_pipeline(id, HashMap::new(), TriggerSource::Cron, None, None)
                .await
                .map(|run| run.id),
            TargetId::Job(id) => self
                .factory
                .trigger_job(id, HashMap::new(), TriggerSource::Cron, None, None)
                .await
                .map(|build| build.id),
        };
        match result {
            Ok(id) => debug!(target = ?target, id = %id, "Cron trigger accepted"),
            // A saturated queue means a prior instance still runs; the next
            // tick covers this fire
            Err(TriggerError::Busy) => {
                warn!(target = ?target, "Cron tick dropped, target queue is full");
            }
            Err(TriggerError::Store(StoreError::NotFound(what))) => {
                warn!(target = ?target, what = %what, "Cron target vanished, unregistering");
                self.unregister(target);
            }
            Err(e) => {
                error!(target = ?target, error = %e, "Cron trigger failed");
            }
        }
    }

    fn lock_registrations(&self) -> std::sync::MutexGuard<'_, HashMap<TargetId, Registration>> {
        self.registrations.lock().unwrap_or_else(|e| e.into_inner())
    }
}
