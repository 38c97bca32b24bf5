use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{MissedTickBehavior, interval};
use tracing::info;

use super::http::HttpEngine;
use super::runner::{RunOptions, RunReport, RunTarget, run_plan};
use crate::error::{Error, Result};

pub const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Repeat a plan every `every`; `runs: None` repeats until cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    pub every: Duration,
    pub runs: Option<u32>,
}

impl Schedule {
    pub fn new(every: Duration, runs: Option<u32>) -> Result<Self> {
        if every < MIN_INTERVAL {
            return Err(Error::invalid("Schedule interval must be at least 1s"));
        }
        if runs == Some(0) {
            return Err(Error::invalid("Schedule must run at least once"));
        }
        Ok(Self { every, runs })
    }
}

/// Run the plan now and on every tick after that. Each report is handed to
/// `on_report` as it completes; all of them are returned.
pub async fn run_scheduled(
    schedule: Schedule,
    plan: &[RunTarget],
    options: &RunOptions,
    http: &HttpEngine,
    cancel_rx: &mut broadcast::Receiver<()>,
    mut on_report: impl FnMut(&RunReport),
) -> Vec<RunReport> {
    let mut ticker = interval(schedule.every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut reports = Vec::new();

    loop {
        tokio::select! {
            _ = ticker.tick() => {},
            Ok(()) = cancel_rx.recv() => break,
        }

        let report = run_plan(plan.to_vec(), options.clone(), http, cancel_rx).await;
        let cancelled = report.cancelled;
        on_report(&report);
        reports.push(report);
        info!(iteration = reports.len(), "scheduled run complete");

        if cancelled || schedule.runs.is_some_and(|runs| reports.len() >= runs as usize) {
            break;
        }
    }
    reports
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::cancel::{CancelRegistry, never};
    use crate::engine::http::HttpSettings;

    #[test]
    fn interval_must_be_at_least_a_second() {
        assert!(Schedule::new(Duration::from_millis(500), None).is_err());
        assert!(Schedule::new(Duration::from_secs(1), Some(0)).is_err());
        assert!(Schedule::new(Duration::from_secs(2), Some(3)).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn stops_after_requested_runs() {
        let http = HttpEngine::new(HttpSettings::default()).unwrap();
        let schedule = Schedule::new(Duration::from_secs(60), Some(3)).unwrap();
        let mut seen = 0;
        let reports = run_scheduled(schedule, &[], &RunOptions::default(), &http, &mut never(), |_| seen += 1).await;
        assert_eq!(reports.len(), 3);
        assert_eq!(seen, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_ends_an_open_schedule() {
        let http = HttpEngine::new(HttpSettings::default()).unwrap();
        let registry = CancelRegistry::new();
        let mut rx = registry.register("sched");
        let schedule = Schedule::new(Duration::from_secs(60), None).unwrap();

        let mut count = 0;
        let reports = run_scheduled(schedule, &[], &RunOptions::default(), &http, &mut rx, |_| {
            count += 1;
            if count == 2 {
                registry.cancel("sched");
            }
        })
        .await;
        assert_eq!(reports.len(), 2);
    }
}
