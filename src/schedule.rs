// src/schedule.rs

//! Fixed-interval scheduling for `watch`
//!
//! The pipeline and the drift monitor each get their own [`Schedule`] and
//! run on separate threads, so a long build never delays a monitoring pass.

use crate::cancel::CancelFlag;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::info;

/// Longest sleep between cancellation checks
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Timing state of one periodic task
#[derive(Debug, Clone)]
pub struct Schedule {
    name: String,
    interval: Duration,
    last_run: Option<DateTime<Utc>>,
    next_run: Option<DateTime<Utc>>,
}

impl Schedule {
    /// First run is due immediately
    pub fn new(name: impl Into<String>, interval: Duration) -> Self {
        Self {
            name: name.into(),
            interval,
            last_run: None,
            next_run: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn should_run(&self) -> bool {
        match self.next_run {
            Some(next) => Utc::now() >= next,
            None => true,
        }
    }

    /// Record a finished run and plan the next one
    pub fn record_run(&mut self) {
        let now = Utc::now();
        self.last_run = Some(now);
        self.next_run = Some(now + chrono::Duration::from_std(self.interval).unwrap_or_default());
    }

    pub fn last_run(&self) -> Option<DateTime<Utc>> {
        self.last_run
    }

    pub fn time_until_next(&self) -> Option<Duration> {
        self.next_run.map(|next| {
            let now = Utc::now();
            if next > now {
                (next - now).to_std().unwrap_or(Duration::ZERO)
            } else {
                Duration::ZERO
            }
        })
    }

    pub fn status_line(&self) -> String {
        match self.next_run {
            Some(next) if next > Utc::now() => {
                format!("{}: {}", self.name, format_duration(next - Utc::now()))
            }
            _ => format!("{}: due now", self.name),
        }
    }
}

fn format_duration(duration: chrono::Duration) -> String {
    let total_secs = duration.num_seconds();
    if total_secs < 0 {
        return "overdue".to_string();
    }

    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;

    if hours > 24 {
        format!("next run in {} day(s)", hours / 24)
    } else if hours > 0 {
        format!("next run in {}h {}m", hours, minutes)
    } else if minutes > 0 {
        format!("next run in {} minute(s)", minutes)
    } else {
        "next run soon".to_string()
    }
}

/// Run `task` on `schedule` until cancellation
pub fn run_every<F: FnMut()>(mut schedule: Schedule, cancel: &CancelFlag, mut task: F) {
    info!("Scheduling {} every {:?}", schedule.name(), schedule.interval);
    while !cancel.is_cancelled() {
        if schedule.should_run() {
            info!("Running scheduled {}", schedule.name());
            task();
            schedule.record_run();
            info!("{}", schedule.status_line());
        }

        let sleep = schedule
            .time_until_next()
            .map(|d| d.min(POLL_INTERVAL))
            .unwrap_or(POLL_INTERVAL);
        std::thread::sleep(sleep);
    }
    info!("Stopped scheduling {}", schedule.name());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_run_is_due() {
        let mut schedule = Schedule::new("monitor", Duration::from_secs(3600));
        assert!(schedule.should_run());
        assert!(schedule.last_run().is_none());

        schedule.record_run();
        assert!(!schedule.should_run());
        assert!(schedule.time_until_next().unwrap() > Duration::from_secs(3500));
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(chrono::Duration::hours(2)), "next run in 2h 0m");
        assert_eq!(
            format_duration(chrono::Duration::minutes(45)),
            "next run in 45 minute(s)"
        );
        assert_eq!(format_duration(chrono::Duration::days(2)), "next run in 2 day(s)");
    }

    #[test]
    fn test_run_every_stops_when_cancelled() {
        let cancel = CancelFlag::new();
        let mut runs = 0;
        let flag = cancel.clone();
        run_every(Schedule::new("test", Duration::from_secs(3600)), &cancel, || {
            runs += 1;
            flag.cancel();
        });
        assert_eq!(runs, 1);
    }
}
