//! Number of parallel training jobs per iteration.

/// Linear ramp from `num_jobs_initial` to `num_jobs_final` over the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParallelismRamp {
    pub num_jobs_initial: usize,
    pub num_jobs_final: usize,
    pub num_iters: usize,
}

impl ParallelismRamp {
    #[must_use]
    pub fn new(num_jobs_initial: usize, num_jobs_final: usize, num_iters: usize) -> Self {
        Self {
            num_jobs_initial,
            num_jobs_final,
            num_iters,
        }
    }

    /// Jobs for iteration `iter`, rounding half up.
    ///
    /// Defined for `iter == num_iters` as well, where it equals
    /// `num_jobs_final`, even though that iteration never runs.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn num_jobs(&self, iter: usize) -> usize {
        let initial = self.num_jobs_initial as f64;
        let delta = self.num_jobs_final as f64 - initial;
        let progress = iter as f64 / self.num_iters.max(1) as f64;
        (0.5 + initial + delta * progress).floor() as usize
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test]
    fn test_end_to_end_example() {
        let ramp = ParallelismRamp::new(1, 2, 13);
        assert_eq!(ramp.num_jobs(6), 1);
        assert_eq!(ramp.num_jobs(7), 2);
    }

    #[test]
    fn test_half_rounds_up() {
        // 1 + 1 * 1/2 = 1.5
        assert_eq!(ParallelismRamp::new(1, 2, 2).num_jobs(1), 2);
        // 4 - 1 * 1/2 = 3.5
        assert_eq!(ParallelismRamp::new(4, 3, 2).num_jobs(1), 4);
    }

    #[test_case(1, 8, 40 ; "increasing")]
    #[test_case(8, 2, 33 ; "decreasing")]
    #[test_case(3, 3, 7 ; "constant")]
    #[test_case(2, 16, 1 ; "single_iteration")]
    fn test_boundaries_and_monotonicity(initial: usize, final_: usize, num_iters: usize) {
        let ramp = ParallelismRamp::new(initial, final_, num_iters);
        assert_eq!(ramp.num_jobs(0), initial);
        assert_eq!(ramp.num_jobs(num_iters), final_);

        let jobs: Vec<usize> = (0..=num_iters).map(|i| ramp.num_jobs(i)).collect();
        for pair in jobs.windows(2) {
            if final_ >= initial {
                assert!(pair[1] >= pair[0], "not non-decreasing: {jobs:?}");
            } else {
                assert!(pair[1] <= pair[0], "not non-increasing: {jobs:?}");
            }
        }
    }
}
