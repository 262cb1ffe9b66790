//! Retry and backoff decisions
//!
//! Pure functions over the job ledger: a series that keeps failing is left
//! alone for an exponentially growing window before the sweep tries again.

use crate::db::models::{JobStatus, SyncJob};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

/// Backoff bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Consecutive failures tolerated before backing off; 0 disables backoff
    pub failure_threshold: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            base_backoff: Duration::minutes(5),
            max_backoff: Duration::hours(6),
        }
    }
}

impl RetryPolicy {
    /// How many recent jobs `decide` needs to see
    pub fn history_window(&self) -> usize {
        self.failure_threshold as usize + 16
    }

    /// Backoff after `failures` consecutive failures (at least the threshold)
    pub fn backoff_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(self.failure_threshold).min(30);
        let secs = self
            .base_backoff
            .num_seconds()
            .saturating_mul(1i64 << exponent)
            .min(self.max_backoff.num_seconds());
        Duration::seconds(secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum SyncDecision {
    Proceed,
    BackOff {
        until: DateTime<Utc>,
        consecutive_failures: u32,
    },
}

/// Decide whether a series may be synced now.
///
/// `recent` is newest first. Running jobs are ignored; failures are counted
/// back to the most recent success or partial.
pub fn decide(recent: &[SyncJob], now: DateTime<Utc>, policy: &RetryPolicy) -> SyncDecision {
    if policy.failure_threshold == 0 {
        return SyncDecision::Proceed;
    }

    let mut failures = 0u32;
    let mut last_failure = None;
    for job in recent.iter().filter(|j| j.status != JobStatus::Running) {
        if job.status != JobStatus::Failed {
            break;
        }
        if last_failure.is_none() {
            last_failure = Some(job.end_time.unwrap_or(job.start_time));
        }
        failures += 1;
    }

    let Some(last_failure) = last_failure else {
        return SyncDecision::Proceed;
    };
    if failures < policy.failure_threshold {
        return SyncDecision::Proceed;
    }

    let until = last_failure + policy.backoff_for(failures);
    if now < until {
        SyncDecision::BackOff {
            until,
            consecutive_failures: failures,
        }
    } else {
        SyncDecision::Proceed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{SeriesId, SyncMode};
    use chrono::TimeZone;

    fn t(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 8, 7, minute, 0).unwrap()
    }

    fn job(id: i64, status: JobStatus, end_minute: u32) -> SyncJob {
        SyncJob {
            id,
            series: SeriesId::new("future", "RB2401", "daily").unwrap(),
            mode: SyncMode::Incremental,
            start_time: t(end_minute),
            end_time: (status != JobStatus::Running).then(|| t(end_minute)),
            status,
            rows_fetched: 0,
            rows_written: 0,
            error: None,
        }
    }

    #[test]
    fn test_proceeds_below_threshold() {
        let policy = RetryPolicy::default();
        let recent = vec![job(2, JobStatus::Failed, 2), job(1, JobStatus::Failed, 1)];
        assert_eq!(decide(&recent, t(3), &policy), SyncDecision::Proceed);
        assert_eq!(decide(&[], t(3), &policy), SyncDecision::Proceed);
    }

    #[test]
    fn test_backs_off_after_threshold() {
        let policy = RetryPolicy::default();
        let recent = vec![
            job(4, JobStatus::Failed, 4),
            job(3, JobStatus::Failed, 3),
            job(2, JobStatus::Failed, 2),
            job(1, JobStatus::Success, 1),
        ];

        assert_eq!(
            decide(&recent, t(5), &policy),
            SyncDecision::BackOff {
                until: t(9),
                consecutive_failures: 3
            }
        );
        assert_eq!(decide(&recent, t(9), &policy), SyncDecision::Proceed);
    }

    #[test]
    fn test_success_resets_and_running_is_ignored() {
        let policy = RetryPolicy::default();
        let recent = vec![
            job(5, JobStatus::Running, 5),
            job(4, JobStatus::Partial, 4),
            job(3, JobStatus::Failed, 3),
            job(2, JobStatus::Failed, 2),
            job(1, JobStatus::Failed, 1),
        ];
        assert_eq!(decide(&recent, t(5), &policy), SyncDecision::Proceed);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_for(3), Duration::minutes(5));
        assert_eq!(policy.backoff_for(4), Duration::minutes(10));
        assert_eq!(policy.backoff_for(6), Duration::minutes(40));
        assert_eq!(policy.backoff_for(40), Duration::hours(6));
    }

    #[test]
    fn test_zero_threshold_disables_backoff() {
        let policy = RetryPolicy {
            failure_threshold: 0,
            ..Default::default()
        };
        let recent = vec![job(1, JobStatus::Failed, 1)];
        assert_eq!(decide(&recent, t(1), &policy), SyncDecision::Proceed);
    }
}
