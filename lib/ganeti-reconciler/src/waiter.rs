// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Polls submitted jobs until they settle or a deadline passes.

use std::time::Duration;

use slog::{debug, Logger};
use tokio::time::Instant;

use crate::gateway::{Gateway, GatewayError, JobHandle, JobStatus};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    Success,
    Failed(String),
    TimedOut,
}

/// Waits on one job handle at a time.
///
/// The deadline is measured from the moment the handle was submitted, not
/// from the first poll. A job that reaches a terminal state on the poll that
/// straddles the deadline is reported with that state; a timed-out job is
/// left running on the cluster.
pub struct JobWaiter<'a, G: Gateway + ?Sized> {
    gateway: &'a G,
    poll_interval: Duration,
    log: Logger,
}

impl<'a, G: Gateway + ?Sized> JobWaiter<'a, G> {
    pub fn new(gateway: &'a G, poll_interval: Duration, log: Logger) -> Self {
        Self { gateway, poll_interval, log }
    }

    pub async fn wait(
        &self,
        job: &JobHandle,
        timeout: Duration,
    ) -> Result<WaitOutcome, GatewayError> {
        let deadline = job.submitted_at() + timeout;
        let mut polls: u32 = 0;
        loop {
            polls += 1;
            match self.gateway.poll_job(job).await? {
                JobStatus::Success => {
                    debug!(self.log, "job finished";
                        "job" => %job, "polls" => polls);
                    return Ok(WaitOutcome::Success);
                }
                JobStatus::Failed(reason) => {
                    debug!(self.log, "job failed";
                        "job" => %job, "reason" => &reason);
                    return Ok(WaitOutcome::Failed(reason));
                }
                JobStatus::Running => {}
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(WaitOutcome::TimedOut);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use crate::gateway::{JobId, MockGateway};

    fn logger() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    #[tokio::test(start_paused = true)]
    async fn polls_until_the_job_succeeds() {
        let polls = Arc::new(AtomicU32::new(0));
        let mut gw = MockGateway::new();
        let counter = polls.clone();
        gw.expect_poll_job().returning(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) < 3 {
                Ok(JobStatus::Running)
            } else {
                Ok(JobStatus::Success)
            }
        });

        let waiter = JobWaiter::new(&gw, Duration::from_secs(2), logger());
        let start = Instant::now();
        let job = JobHandle::new(JobId::new("42"));
        let outcome = waiter.wait(&job, Duration::from_secs(300)).await;
        assert_eq!(outcome.unwrap(), WaitOutcome::Success);
        assert_eq!(polls.load(Ordering::SeqCst), 4);
        assert_eq!(start.elapsed(), Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn failure_reason_is_returned() {
        let mut gw = MockGateway::new();
        gw.expect_poll_job()
            .times(1)
            .returning(|_| Ok(JobStatus::Failed("disk full".to_string())));

        let waiter = JobWaiter::new(&gw, Duration::from_secs(1), logger());
        let job = JobHandle::new(JobId::new("7"));
        assert_eq!(
            waiter.wait(&job, Duration::from_secs(10)).await.unwrap(),
            WaitOutcome::Failed("disk full".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_counts_from_submission() {
        let mut gw = MockGateway::new();
        gw.expect_poll_job().returning(|_| Ok(JobStatus::Running));

        let job = JobHandle::new(JobId::new("9"));
        tokio::time::advance(Duration::from_secs(4)).await;

        let waiter = JobWaiter::new(&gw, Duration::from_secs(3), logger());
        let start = Instant::now();
        let outcome = waiter.wait(&job, Duration::from_secs(10)).await;
        assert_eq!(outcome.unwrap(), WaitOutcome::TimedOut);
        // Four seconds had already passed, so only six remain; the last
        // sleep is cut short to land on the deadline.
        assert_eq!(start.elapsed(), Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn poll_errors_are_propagated() {
        let mut gw = MockGateway::new();
        gw.expect_poll_job()
            .returning(|_| Err(GatewayError::new("connection refused")));

        let waiter = JobWaiter::new(&gw, Duration::from_secs(1), logger());
        let job = JobHandle::new(JobId::new("1"));
        let err = waiter.wait(&job, Duration::from_secs(5)).await.unwrap_err();
        assert_eq!(err.to_string(), "connection refused");
    }
}
