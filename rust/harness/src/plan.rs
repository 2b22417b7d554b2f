//! Immutable training plan derived once from the options, the model vars and
//! the archive pool.

use std::collections::BTreeSet;

use rnn_config::{ModelVars, TrainOptions};

use crate::{
    config::ConfigError,
    ramp::ParallelismRamp,
    window::{TruncationWindow, normalize_bptt_steps},
};

/// Everything the iteration loop needs to know about the run's shape.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingPlan {
    pub num_epochs: f64,
    pub num_archives: usize,
    pub num_jobs_initial: usize,
    pub num_jobs_final: usize,
    pub chunk_width: i64,
    pub model_left_context: i64,
    pub model_right_context: i64,
    pub chunk_left_context: i64,
    pub chunk_right_context: i64,
    /// After translating a deprecated `num_bptt_steps`.
    pub deriv_truncate_margin: Option<i64>,
    pub num_iters: usize,
    pub num_archives_to_process: f64,
}

impl TrainingPlan {
    /// Derive the plan, checking the constraints that depend on the archive
    /// count and the network depth.
    pub fn derive(
        options: &TrainOptions,
        vars: &ModelVars,
        num_archives: usize,
    ) -> Result<Self, ConfigError> {
        let trainer = &options.trainer;
        if trainer.num_jobs_final > num_archives {
            return Err(ConfigError::InsufficientArchives {
                num_jobs_final: trainer.num_jobs_final,
                num_archives,
            });
        }

        let num_iters = compute_num_iters(
            trainer.num_epochs,
            num_archives,
            trainer.num_jobs_initial,
            trainer.num_jobs_final,
        );
        let finish_add_layers_iter = vars.num_hidden_layers * trainer.add_layers_period;
        if num_iters <= finish_add_layers_iter {
            return Err(ConfigError::InsufficientIterations {
                num_iters,
                required: finish_add_layers_iter + 1,
            });
        }

        let deriv_truncate_margin = normalize_bptt_steps(
            trainer.num_bptt_steps,
            options.egs.chunk_width,
            trainer.deriv_truncate_margin,
        );

        Ok(Self {
            num_epochs: trainer.num_epochs,
            num_archives,
            num_jobs_initial: trainer.num_jobs_initial,
            num_jobs_final: trainer.num_jobs_final,
            chunk_width: options.egs.chunk_width,
            model_left_context: vars.model_left_context,
            model_right_context: vars.model_right_context,
            chunk_left_context: options.egs.chunk_left_context,
            chunk_right_context: options.egs.chunk_right_context,
            deriv_truncate_margin,
            num_iters,
            num_archives_to_process: trainer.num_epochs * num_archives as f64,
        })
    }

    /// Total left context each example must carry.
    #[must_use]
    pub fn left_context(&self) -> i64 {
        self.chunk_left_context + self.model_left_context
    }

    #[must_use]
    pub fn right_context(&self) -> i64 {
        self.chunk_right_context + self.model_right_context
    }

    #[must_use]
    pub fn ramp(&self) -> ParallelismRamp {
        ParallelismRamp::new(self.num_jobs_initial, self.num_jobs_final, self.num_iters)
    }

    #[must_use]
    pub fn deriv_window(&self) -> TruncationWindow {
        TruncationWindow::compute(
            self.chunk_width,
            self.deriv_truncate_margin,
            self.model_left_context,
            self.model_right_context,
        )
    }
}

/// Iterations needed to see every archive `num_epochs` times when the job
/// count ramps linearly, so that `num_iters * avg_jobs ≈ epochs * archives`.
///
/// Never less than one.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn compute_num_iters(
    num_epochs: f64,
    num_archives: usize,
    num_jobs_initial: usize,
    num_jobs_final: usize,
) -> usize {
    let jobs = (num_jobs_initial + num_jobs_final).max(1) as f64;
    let exact = (2.0 * num_epochs * num_archives as f64 / jobs).round();
    if exact < 1.0 {
        tracing::warn!(
            "{num_epochs} epochs over {num_archives} archives rounds to {exact} iterations; \
             running a single iteration instead"
        );
        return 1;
    }
    exact as usize
}

/// Checkpoint indices averaged into the final model.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CombinationSet(BTreeSet<usize>);

impl CombinationSet {
    /// Pick the trailing checkpoints to combine.
    ///
    /// The window covers roughly half an epoch at the final job count, capped
    /// at half the run. A window larger than `max_models_combine` is
    /// subsampled downward from `num_iters`.
    #[must_use]
    pub fn select(plan: &TrainingPlan, max_models_combine: usize) -> Self {
        let max_models = max_models_combine.max(1);
        let per_epoch = plan.num_archives / plan.num_jobs_final.max(1);
        let window = (per_epoch / 2 + 1).min(plan.num_iters / 2).max(1);

        let indices = if window > max_models {
            let stride = window.div_ceil(max_models);
            (0..window)
                .step_by(stride)
                .map(|offset| plan.num_iters - offset)
                .collect()
        } else {
            (plan.num_iters + 1 - window..=plan.num_iters).collect()
        };
        Self(indices)
    }

    #[must_use]
    pub fn from_indices(indices: impl IntoIterator<Item = usize>) -> Self {
        Self(indices.into_iter().collect())
    }

    #[must_use]
    pub fn contains(&self, index: usize) -> bool {
        self.0.contains(&index)
    }

    /// Indices in ascending order.
    #[must_use]
    pub fn indices(&self) -> Vec<usize> {
        self.0.iter().copied().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    fn vars(num_hidden_layers: usize) -> ModelVars {
        ModelVars {
            model_left_context: 10,
            model_right_context: 10,
            num_hidden_layers,
            add_lda: false,
            include_log_softmax: true,
            num_targets: None,
        }
    }

    fn options(num_epochs: f64, ji: usize, jf: usize) -> TrainOptions {
        let mut opts = TrainOptions::new("exp/rnn", "data/train", "data/targets.scp");
        opts.trainer.num_epochs = num_epochs;
        opts.trainer.num_jobs_initial = ji;
        opts.trainer.num_jobs_final = jf;
        opts
    }

    #[test]
    fn test_num_iters_example() {
        assert_eq!(compute_num_iters(2.0, 10, 1, 2), 13);
    }

    #[test_case(0.01, 1, 1, 1 ; "tiny_budget_clamps")]
    #[test_case(0.0, 10, 1, 1 ; "zero_epochs_clamps")]
    #[test_case(1.0, 100, 4, 4 ; "even")]
    fn test_num_iters_at_least_one(epochs: f64, archives: usize, ji: usize, jf: usize) {
        assert!(compute_num_iters(epochs, archives, ji, jf) >= 1);
    }

    #[test]
    fn test_derive_example() {
        let plan = TrainingPlan::derive(&options(2.0, 1, 2), &vars(1), 10).unwrap();
        assert_eq!(plan.num_iters, 13);
        assert_eq!(plan.ramp().num_jobs(6), 1);
        assert_eq!(plan.num_archives_to_process, 20.0);
        assert_eq!(plan.left_context(), 50);
        assert_eq!(plan.right_context(), 10);
        let window = plan.deriv_window();
        assert_eq!(window.min_deriv_time, Some(-18));
        assert_eq!(window.max_deriv_time, Some(37));
    }

    #[test]
    fn test_bptt_steps_override_margin() {
        let mut opts = options(2.0, 1, 2);
        opts.trainer.num_bptt_steps = Some(40);
        let plan = TrainingPlan::derive(&opts, &vars(1), 10).unwrap();
        assert_eq!(plan.deriv_truncate_margin, Some(18));
    }

    #[test]
    fn test_too_many_final_jobs() {
        let err = TrainingPlan::derive(&options(2.0, 1, 12), &vars(1), 10).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InsufficientArchives {
                num_jobs_final: 12,
                num_archives: 10
            }
        ));
    }

    #[test]
    fn test_too_few_iterations_for_layerwise_training() {
        let err = TrainingPlan::derive(&options(2.0, 1, 2), &vars(7), 10).unwrap_err();
        assert!(matches!(err, ConfigError::InsufficientIterations { num_iters: 13, .. }));
    }

    #[test]
    fn test_combination_trailing_window() {
        let plan = TrainingPlan::derive(&options(2.0, 1, 2), &vars(1), 10).unwrap();
        let set = CombinationSet::select(&plan, 20);
        assert_eq!(set.indices(), vec![11, 12, 13]);
    }

    #[test]
    fn test_combination_subsampled() {
        let plan = TrainingPlan::derive(&options(4.0, 2, 2), &vars(0), 200).unwrap();
        // 400 iterations, window min(51, 200) = 51, stride ceil(51 / 20) = 3
        assert_eq!(plan.num_iters, 400);
        let set = CombinationSet::select(&plan, 20);
        assert_eq!(set.len(), 17);
        assert!(set.contains(400));
        assert!(set.contains(397));
        assert!(!set.contains(399));
        assert_eq!(set.indices()[0], 400 - 48);
    }

    #[test_case(1.0, 1, 1, 1, 20 ; "single_iteration")]
    #[test_case(3.0, 3, 12, 40, 5 ; "small_max")]
    #[test_case(6.0, 2, 8, 100, 20 ; "default_max")]
    #[test_case(10.0, 1, 1, 1000, 1 ; "max_one")]
    fn test_combination_bounds(epochs: f64, ji: usize, jf: usize, archives: usize, max: usize) {
        let plan = TrainingPlan::derive(&options(epochs, ji, jf), &vars(0), archives).unwrap();
        let set = CombinationSet::select(&plan, max);
        assert!(!set.is_empty());
        assert!(set.len() <= max);
        assert!(set.contains(plan.num_iters));
        assert!(set.indices().iter().all(|&i| i >= 1 && i <= plan.num_iters));
    }
}
