//! Periodic refresh timer that follows the settings.

use std::time::Duration;
use tokio::{
    sync::{mpsc::UnboundedSender, watch},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior, interval_at},
};

use crate::{
    error::{ConfigError, EngineError},
    provider::ProviderId,
    settings::RefreshInterval,
};

/// Settings the scheduler decides on, read under one lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleInput {
    pub provider: ProviderId,
    pub interval: RefreshInterval,
    pub credential_required: bool,
    pub credential_present: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScheduleOutcome {
    /// Manual refresh only; no timer.
    Manual,
    /// A credential is missing; no timer.
    NotConfigured(ConfigError),
    Started,
    Updated,
    Unchanged,
}

/// One timer firing. Ticks from a cancelled timer carry an old generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerTick {
    pub generation: u64,
}

/// A tokio task that sends a tick every period. The first tick comes one
/// full period after start; dropping the timer aborts the task.
#[derive(Debug)]
struct RefreshTimer {
    period: Duration,
    period_tx: watch::Sender<Duration>,
    task: JoinHandle<()>,
}

impl RefreshTimer {
    fn spawn(
        period: Duration,
        ticks: UnboundedSender<SchedulerTick>,
        generation: u64,
    ) -> Result<Self, EngineError> {
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|e| EngineError::Timer(e.to_string()))?;

        let (period_tx, mut period_rx) = watch::channel(period);
        let first = Instant::now() + period;

        let task = runtime.spawn(async move {
            let mut interval = interval_at(first, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if ticks.send(SchedulerTick { generation }).is_err() {
                            break;
                        }
                    }
                    changed = period_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let period = *period_rx.borrow_and_update();
                        interval = interval_at(Instant::now() + period, period);
                        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    }
                }
            }
        });

        Ok(Self {
            period,
            period_tx,
            task,
        })
    }

    fn set_period(&mut self, period: Duration) -> Result<(), EngineError> {
        self.period_tx
            .send(period)
            .map_err(|_| EngineError::Timer("timer task is gone".to_string()))?;
        self.period = period;
        Ok(())
    }
}

impl Drop for RefreshTimer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[derive(Debug)]
pub struct Scheduler {
    ticks: UnboundedSender<SchedulerTick>,
    timer: Option<RefreshTimer>,
    generation: u64,
}

impl Scheduler {
    pub fn new(ticks: UnboundedSender<SchedulerTick>) -> Self {
        Self {
            ticks,
            timer: None,
            generation: 0,
        }
    }

    pub fn has_timer(&self) -> bool {
        self.timer.is_some()
    }

    pub fn period(&self) -> Option<Duration> {
        self.timer.as_ref().map(|t| t.period)
    }

    /// Whether `tick` came from the live timer.
    pub fn is_current(&self, tick: SchedulerTick) -> bool {
        self.timer.is_some() && tick.generation == self.generation
    }

    /// Starts, retunes or removes the timer to match `input`. On error the
    /// timer is removed and automatic refresh stays off until the next call.
    pub fn check_and_reschedule(
        &mut self,
        input: &ScheduleInput,
    ) -> Result<ScheduleOutcome, EngineError> {
        if input.credential_required && !input.credential_present {
            self.cancel();
            return Ok(ScheduleOutcome::NotConfigured(ConfigError::MissingCredential(
                input.provider,
            )));
        }

        let period = match input.interval.as_duration() {
            None => {
                self.cancel();
                return Ok(ScheduleOutcome::Manual);
            }
            Some(period) if period.is_zero() => {
                self.cancel();
                return Err(ConfigError::InvalidInterval.into());
            }
            Some(period) => period,
        };

        match &mut self.timer {
            Some(timer) if timer.period == period => Ok(ScheduleOutcome::Unchanged),
            Some(timer) => match timer.set_period(period) {
                Ok(()) => {
                    tracing::debug!(?period, "refresh timer updated");
                    Ok(ScheduleOutcome::Updated)
                }
                Err(err) => {
                    self.cancel();
                    Err(err)
                }
            },
            None => {
                self.generation += 1;
                self.timer = Some(RefreshTimer::spawn(
                    period,
                    self.ticks.clone(),
                    self.generation,
                )?);
                tracing::debug!(?period, "refresh timer started");
                Ok(ScheduleOutcome::Started)
            }
        }
    }

    pub fn cancel(&mut self) {
        if self.timer.take().is_some() {
            tracing::debug!("refresh timer cancelled");
        }
    }
}
