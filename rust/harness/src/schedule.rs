//! Learning-rate schedules.

/// Position in the run a learning rate is requested for.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduleInput {
    pub iter: usize,
    pub num_jobs: usize,
    pub num_iters: usize,
    pub archives_processed: usize,
    pub archives_to_process: f64,
}

/// Maps a position in the run to the learning rate passed to the trainer.
pub trait LearningRateSchedule: Send + Sync {
    fn learning_rate(&self, input: &ScheduleInput) -> f64;
}

/// Effective learning rate decaying geometrically from `initial` to `final`
/// with the fraction of data processed, scaled by the number of jobs (the
/// trainer averages the parallel models).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExponentialDecay {
    pub initial_effective_lrate: f64,
    pub final_effective_lrate: f64,
}

impl ExponentialDecay {
    #[must_use]
    pub fn new(initial_effective_lrate: f64, final_effective_lrate: f64) -> Self {
        Self {
            initial_effective_lrate,
            final_effective_lrate,
        }
    }
}

impl LearningRateSchedule for ExponentialDecay {
    fn learning_rate(&self, input: &ScheduleInput) -> f64 {
        let effective = if input.iter + 1 >= input.num_iters || input.archives_to_process <= 0.0 {
            self.final_effective_lrate
        } else {
            let fraction = input.archives_processed as f64 / input.archives_to_process;
            self.initial_effective_lrate
                * (self.final_effective_lrate / self.initial_effective_lrate).powf(fraction)
        };
        input.num_jobs as f64 * effective
    }
}
