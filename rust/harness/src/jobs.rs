//! Supervision of asynchronous side jobs (notifications, diagnostics).
//!
//! Side jobs never influence the training result: their failures are logged
//! and counted, not returned.

use std::{
    future::Future,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use tokio::task::{JoinError, JoinHandle};

/// Outcome of a side job.
pub type SideJobResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

struct SideJob {
    name: String,
    handle: JoinHandle<SideJobResult>,
}

type JobList = Arc<Mutex<Vec<SideJob>>>;

const WAIT_INTERVAL: Duration = Duration::from_millis(10);

/// Tracks submitted side jobs and reaps them on a fixed polling interval.
///
/// Must be created inside a tokio runtime.
pub struct JobSupervisor {
    jobs: JobList,
    failures: Arc<AtomicUsize>,
    poller: JoinHandle<()>,
}

impl JobSupervisor {
    #[must_use]
    pub fn new(polling_time: Duration) -> Self {
        let jobs: JobList = Arc::default();
        let failures = Arc::new(AtomicUsize::new(0));

        let poller = {
            let jobs = jobs.clone();
            let failures = failures.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(polling_time).await;
                    for job in take_jobs(&jobs, true) {
                        let outcome = job.handle.await;
                        record(&job.name, outcome, &failures);
                    }
                }
            })
        };

        Self {
            jobs,
            failures,
            poller,
        }
    }

    /// Spawn `job` in the background.
    pub fn submit<F>(&self, name: impl Into<String>, job: F)
    where
        F: Future<Output = SideJobResult> + Send + 'static,
    {
        let name = name.into();
        tracing::debug!("Submitting side job {name}");
        let handle = tokio::spawn(job);
        lock(&self.jobs).push(SideJob { name, handle });
    }

    /// Jobs submitted but not yet reaped.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        lock(&self.jobs).len()
    }

    /// Side jobs that have failed so far.
    #[must_use]
    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::Relaxed)
    }

    /// Wait for every outstanding job to finish, without a time limit.
    ///
    /// Unfinished jobs stay tracked while waiting, so a cancelled wait still
    /// leaves them to [`abort`](Self::abort).
    pub async fn ensure_all_done(&self) {
        loop {
            for job in take_jobs(&self.jobs, true) {
                let outcome = job.handle.await;
                record(&job.name, outcome, &self.failures);
            }
            if self.outstanding() == 0 {
                return;
            }
            tokio::time::sleep(WAIT_INTERVAL).await;
        }
    }

    /// Wait for every outstanding job, giving up after `timeout`.
    pub async fn drain(&self, timeout: Duration) -> Result<(), SupervisorError> {
        tokio::time::timeout(timeout, self.ensure_all_done())
            .await
            .map_err(|_| SupervisorError::DrainTimeout {
                timeout,
                outstanding: self.outstanding(),
            })
    }

    /// Cancel every outstanding job and stop polling. Returns how many jobs
    /// were cancelled before finishing.
    pub fn abort(&self) -> usize {
        self.poller.abort();
        let jobs = take_jobs(&self.jobs, false);
        let mut cancelled = 0;
        for job in jobs {
            if !job.handle.is_finished() {
                tracing::info!("Cancelling side job {}", job.name);
                job.handle.abort();
                cancelled += 1;
            }
        }
        cancelled
    }
}

impl Drop for JobSupervisor {
    fn drop(&mut self) {
        self.poller.abort();
    }
}

fn lock(jobs: &JobList) -> std::sync::MutexGuard<'_, Vec<SideJob>> {
    jobs.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Remove jobs from the list: only finished ones when `finished_only`.
fn take_jobs(jobs: &JobList, finished_only: bool) -> Vec<SideJob> {
    let mut jobs = lock(jobs);
    if !finished_only {
        return std::mem::take(&mut *jobs);
    }
    let (done, running): (Vec<_>, Vec<_>) = std::mem::take(&mut *jobs)
        .into_iter()
        .partition(|job| job.handle.is_finished());
    *jobs = running;
    done
}

fn record(name: &str, outcome: Result<SideJobResult, JoinError>, failures: &AtomicUsize) {
    match outcome {
        Ok(Ok(())) => tracing::debug!("Side job {name} finished"),
        Ok(Err(e)) => {
            failures.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("Side job {name} failed: {e}");
        }
        Err(e) => {
            failures.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("Side job {name} did not complete: {e}");
        }
    }
}

/// Errors that can occur when waiting on side jobs.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("{outstanding} side jobs still running after {timeout:?}")]
    DrainTimeout {
        timeout: Duration,
        outstanding: usize,
    },
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use super::*;

    #[tokio::test]
    async fn test_ensure_all_done_counts_failures() {
        let supervisor = JobSupervisor::new(Duration::from_secs(60));
        supervisor.submit("ok", async { Ok(()) });
        supervisor.submit("bad", async { Err("mail relay refused".into()) });
        supervisor.submit("slow", async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(())
        });

        supervisor.ensure_all_done().await;

        assert_eq!(supervisor.outstanding(), 0);
        assert_eq!(supervisor.failures(), 1);
    }

    #[tokio::test]
    async fn test_poller_reaps_finished_jobs() {
        let supervisor = JobSupervisor::new(Duration::from_millis(5));
        supervisor.submit("quick", async { Ok(()) });

        for _ in 0..200 {
            if supervisor.outstanding() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(supervisor.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_drain_times_out_then_abort_cancels() {
        let finished = Arc::new(AtomicBool::new(false));
        let supervisor = JobSupervisor::new(Duration::from_secs(60));
        {
            let finished = finished.clone();
            supervisor.submit("stuck", async move {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                finished.store(true, Ordering::SeqCst);
                Ok(())
            });
        }

        let err = supervisor
            .drain(Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SupervisorError::DrainTimeout { outstanding: 1, .. }
        ));

        assert_eq!(supervisor.abort(), 1);
        assert_eq!(supervisor.outstanding(), 0);
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_panicking_job_is_a_failure() {
        let supervisor = JobSupervisor::new(Duration::from_secs(60));
        supervisor.submit("boom", async { panic!("side job panicked") });
        supervisor.ensure_all_done().await;
        assert_eq!(supervisor.failures(), 1);
    }
}
