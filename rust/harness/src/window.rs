//! Backpropagation time window for chunked recurrent training.

/// Frames (relative to the start of a chunk's output) between which
/// derivatives are propagated. `None` bounds mean unconstrained.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TruncationWindow {
    pub min_deriv_time: Option<i64>,
    pub max_deriv_time: Option<i64>,
}

impl TruncationWindow {
    #[must_use]
    pub fn compute(
        chunk_width: i64,
        deriv_truncate_margin: Option<i64>,
        model_left_context: i64,
        model_right_context: i64,
    ) -> Self {
        match deriv_truncate_margin {
            Some(margin) => Self {
                min_deriv_time: Some(-margin - model_left_context),
                max_deriv_time: Some(chunk_width - 1 + margin + model_right_context),
            },
            None => Self::default(),
        }
    }

    #[must_use]
    pub fn is_unconstrained(&self) -> bool {
        self.min_deriv_time.is_none() && self.max_deriv_time.is_none()
    }
}

/// Offset subtracted from the bptt step count, assuming input splicing spans
/// frames -2..=2.
pub const BPTT_SPLICE_OFFSET: i64 = 2;

/// Translate the deprecated `num_bptt_steps` option into a truncation
/// margin. Returns `margin` unchanged when no step count was given.
#[must_use]
pub fn normalize_bptt_steps(
    num_bptt_steps: Option<i64>,
    chunk_width: i64,
    margin: Option<i64>,
) -> Option<i64> {
    let Some(steps) = num_bptt_steps else {
        return margin;
    };
    let translated = steps - chunk_width - BPTT_SPLICE_OFFSET;
    tracing::warn!(
        "num_bptt_steps (deprecated) is set, so deriv_truncate_margin is set to \
         (num_bptt_steps - chunk_width - {BPTT_SPLICE_OFFSET}) = {translated}. \
         Prefer setting deriv_truncate_margin directly."
    );
    Some(translated)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_example() {
        let window = TruncationWindow::compute(20, Some(8), 10, 10);
        assert_eq!(window.min_deriv_time, Some(-18));
        assert_eq!(window.max_deriv_time, Some(37));
    }

    #[test]
    fn test_unset_margin_is_unconstrained() {
        let window = TruncationWindow::compute(20, None, 10, 10);
        assert!(window.is_unconstrained());
    }

    #[test]
    fn test_bptt_translation() {
        assert_eq!(normalize_bptt_steps(Some(40), 20, Some(8)), Some(18));
        assert_eq!(normalize_bptt_steps(None, 20, Some(8)), Some(8));
        assert_eq!(normalize_bptt_steps(None, 20, None), None);
    }
}
