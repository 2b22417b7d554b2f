//! Progress, completion and failure notifications.

use std::{future::Future, path::Path, process::Stdio, sync::Arc, time::Duration};

use tokio::{io::AsyncWriteExt, process::Command};

use crate::jobs::{JobSupervisor, SideJobResult};

/// Delivers a notification to the operator.
pub trait Notifier: Send + Sync + 'static {
    fn notify(
        &self,
        subject: &str,
        message: &str,
    ) -> impl Future<Output = Result<(), NotifyError>> + Send;
}

/// Sends mail through a `mail`-compatible program: `<program> -s <subject>
/// <address>` with the message on stdin.
#[derive(Debug, Clone)]
pub struct MailNotifier {
    program: String,
    address: String,
}

impl MailNotifier {
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self::with_program("mail", address)
    }

    #[must_use]
    pub fn with_program(program: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            address: address.into(),
        }
    }
}

impl Notifier for MailNotifier {
    async fn notify(&self, subject: &str, message: &str) -> Result<(), NotifyError> {
        let mut words = self.program.split_whitespace();
        let exe = words.next().ok_or(NotifyError::NoProgram)?;

        let mut child = Command::new(exe)
            .args(words)
            .arg("-s")
            .arg(subject)
            .arg(&self.address)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(NotifyError::Spawn)?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(message.as_bytes())
                .await
                .map_err(NotifyError::Io)?;
        }

        let output = child.wait_with_output().await.map_err(NotifyError::Io)?;
        if output.status.success() {
            Ok(())
        } else {
            Err(NotifyError::Failed {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

/// Decides when to report and formats what is sent.
///
/// Without a notifier every report is a no-op.
pub struct ReportingHook<N> {
    notifier: Option<Arc<N>>,
    experiment: String,
    reporting_interval: f64,
}

impl<N: Notifier> ReportingHook<N> {
    #[must_use]
    pub fn new(notifier: Option<N>, dir: &Path, reporting_interval: f64) -> Self {
        Self {
            notifier: notifier.map(Arc::new),
            experiment: dir.display().to_string(),
            reporting_interval,
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.notifier.is_some()
    }

    /// Iterations between progress reports: `round(num_iters *
    /// reporting_interval)`, at least one. `None` when the interval is not
    /// positive.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn interval_iters(&self, num_iters: usize) -> Option<usize> {
        (self.reporting_interval > 0.0)
            .then(|| ((num_iters as f64 * self.reporting_interval).round() as usize).max(1))
    }

    /// Whether a progress report is due after iteration `iter`.
    #[must_use]
    pub fn is_due(&self, iter: usize, num_iters: usize) -> bool {
        self.is_enabled()
            && self
                .interval_iters(num_iters)
                .is_some_and(|every| iter % every == 0)
    }

    /// Send a progress report in the background.
    pub fn progress(&self, supervisor: &JobSupervisor, iter: usize, report: String) {
        let subject = format!("Update : Expt {} : Iter {iter}", self.experiment);
        self.submit(supervisor, format!("report-iter-{iter}"), subject, report);
    }

    /// Send the final report in the background.
    pub fn complete(&self, supervisor: &JobSupervisor, report: String) {
        let subject = format!("Update : Expt {} : complete", self.experiment);
        self.submit(supervisor, "report-complete".to_string(), subject, report);
    }

    /// Announce that the run died, waiting at most `timeout`.
    ///
    /// Delivery failures are logged. Returns whether a notification was
    /// delivered.
    pub async fn failure(&self, timeout: Duration) -> bool {
        let Some(notifier) = &self.notifier else {
            return false;
        };
        let message = format!(
            "Training session for experiment {} died due to an error.",
            self.experiment
        );
        match tokio::time::timeout(timeout, notifier.notify(&message, &message)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::warn!("Failed to send failure notification: {e}");
                false
            }
            Err(_) => {
                tracing::warn!("Failure notification timed out after {timeout:?}");
                false
            }
        }
    }

    fn submit(&self, supervisor: &JobSupervisor, name: String, subject: String, message: String) {
        let Some(notifier) = &self.notifier else {
            return;
        };
        let notifier = notifier.clone();
        supervisor.submit(name, async move {
            let result: SideJobResult = notifier.notify(&subject, &message).await.map_err(Into::into);
            result
        });
    }
}

/// Errors from notification delivery.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("no mail program configured")]
    NoProgram,
    #[error("failed to spawn mail program: {0}")]
    Spawn(std::io::Error),
    #[error("failed to talk to mail program: {0}")]
    Io(std::io::Error),
    #[error("mail program exited with code {code:?}: {stderr}")]
    Failed { code: Option<i32>, stderr: String },
}
