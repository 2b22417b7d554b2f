//! Logging context and progress display for one run.

use std::path::Path;

use indicatif::{ProgressBar, ProgressStyle};
use tracing::Span;

use crate::state::Phase;

const BAR_TEMPLATE: &str = "{spinner:.green} [{elapsed_precise}] {msg:36} [{wide_bar:.cyan/blue}] {pos:>4}/{len:4} ({percent:>2}%) [{eta:>5}]";

/// Owns the run's tracing span and its iteration progress bar.
///
/// Handed to the scheduler explicitly; nothing here is global.
pub struct RunObserver {
    span: Span,
    progress: ProgressBar,
}

impl RunObserver {
    /// Observer drawing a progress bar on stderr.
    #[must_use]
    pub fn new(dir: &Path) -> Self {
        Self::with_bar(dir, ProgressBar::new(0))
    }

    /// Observer that logs but draws nothing.
    #[must_use]
    pub fn hidden(dir: &Path) -> Self {
        Self::with_bar(dir, ProgressBar::hidden())
    }

    fn with_bar(dir: &Path, progress: ProgressBar) -> Self {
        let style = ProgressStyle::default_bar()
            .template(BAR_TEMPLATE)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#*-");
        progress.set_style(style);
        Self {
            span: tracing::info_span!("train", dir = %dir.display()),
            progress,
        }
    }

    #[must_use]
    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn start_iterations(&self, num_iters: usize, first: usize) {
        self.progress.set_length(num_iters as u64);
        self.progress.set_position(first.min(num_iters) as u64);
        self.progress.set_message("iterating");
    }

    pub fn iteration_done(&self, iter: usize, num_jobs: usize, learning_rate: f64) {
        tracing::info!("Iteration {iter} done: {num_jobs} jobs, learning rate {learning_rate:.3e}");
        self.progress.inc(1);
        self.progress
            .set_message(format!("iter {iter}, {num_jobs} jobs, lr {learning_rate:.2e}"));
    }

    pub fn phase(&self, phase: Phase) {
        tracing::info!("Phase: {phase}");
        self.progress.set_message(phase.to_string());
    }

    pub fn finish(&self, message: impl Into<String>) {
        self.progress.finish_with_message(message.into());
    }

    pub fn abandon(&self, message: impl Into<String>) {
        self.progress.abandon_with_message(message.into());
    }
}
