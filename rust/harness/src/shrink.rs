//! Parameter shrinkage against nonlinearity saturation.

use std::{future::Future, path::Path};

use crate::toolkit::ToolkitError;

/// Measures how saturated the sigmoid/tanh units of a checkpoint are.
pub trait SaturationProbe: Send + Sync {
    /// Saturation in `[0, 1]`.
    fn measure_saturation(
        &self,
        checkpoint: &Path,
    ) -> impl Future<Output = Result<f64, ToolkitError>> + Send;
}

/// Decides the per-iteration shrink factor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShrinkagePolicy {
    pub shrink_value: f64,
    pub saturation_threshold: f64,
}

impl ShrinkagePolicy {
    #[must_use]
    pub fn new(shrink_value: f64, saturation_threshold: f64) -> Self {
        Self {
            shrink_value,
            saturation_threshold,
        }
    }

    #[must_use]
    #[allow(clippy::float_cmp)]
    pub fn is_enabled(&self) -> bool {
        self.shrink_value != 1.0
    }

    /// Shrink factor for iteration `iter`, starting from `checkpoint`.
    ///
    /// Returns `1.0` without probing when shrinkage is disabled. The first
    /// iteration always shrinks; later ones only when measured saturation
    /// exceeds the threshold.
    pub async fn evaluate<P: SaturationProbe>(
        &self,
        iter: usize,
        checkpoint: &Path,
        probe: &P,
    ) -> Result<f64, ShrinkError> {
        if !self.is_enabled() {
            return Ok(1.0);
        }
        if iter == 0 {
            return Ok(self.shrink_value);
        }

        let saturation = probe.measure_saturation(checkpoint).await?;
        if !(0.0..=1.0).contains(&saturation) {
            return Err(ShrinkError::OutOfRange(
                saturation,
                checkpoint.display().to_string(),
            ));
        }

        let shrink = saturation > self.saturation_threshold;
        tracing::debug!(
            "Iteration {iter}: saturation {saturation:.3} (threshold {:.3}), shrink: {shrink}",
            self.saturation_threshold
        );
        Ok(if shrink { self.shrink_value } else { 1.0 })
    }
}

/// Errors that can occur while deciding on shrinkage.
#[derive(Debug, thiserror::Error)]
pub enum ShrinkError {
    #[error("saturation probe failed: {0}")]
    Probe(#[from] ToolkitError),
    #[error("saturation {0} of model {1} is outside [0, 1]")]
    OutOfRange(f64, String),
}
