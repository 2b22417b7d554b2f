//! Stage markers used to resume a partially completed run.

use serde::{Deserialize, Serialize};

/// A unit of work the scheduler may skip when resuming.
///
/// Every stage has an integer ordinal. Setup stages are negative, iteration
/// `i` is `i`, and the tail stages follow the last iteration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
    InitNetwork,
    GenerateEgs,
    Preconditioning,
    PrepareInitial,
    Iteration(usize),
    Combine,
    Priors,
    Cleanup,
}

impl Stage {
    #[must_use]
    pub fn ordinal(self, num_iters: usize) -> i64 {
        let n = num_iters as i64;
        match self {
            Self::InitNetwork => -4,
            Self::GenerateEgs => -3,
            Self::Preconditioning => -2,
            Self::PrepareInitial => -1,
            Self::Iteration(iter) => iter as i64,
            Self::Combine => n,
            Self::Priors => n + 1,
            Self::Cleanup => n + 2,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InitNetwork => write!(f, "init-network"),
            Self::GenerateEgs => write!(f, "generate-egs"),
            Self::Preconditioning => write!(f, "preconditioning"),
            Self::PrepareInitial => write!(f, "prepare-initial"),
            Self::Iteration(iter) => write!(f, "iteration {iter}"),
            Self::Combine => write!(f, "combine"),
            Self::Priors => write!(f, "priors"),
            Self::Cleanup => write!(f, "cleanup"),
        }
    }
}

/// User-facing start stage: an integer ordinal or one of the symbolic tail
/// stages, which only resolve once the iteration count is known.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StageSpec {
    Index(i64),
    Combine,
    Priors,
    Cleanup,
}

impl Default for StageSpec {
    fn default() -> Self {
        Self::Index(-4)
    }
}

impl StageSpec {
    #[must_use]
    pub fn resolve(self, num_iters: usize) -> i64 {
        match self {
            Self::Index(i) => i,
            Self::Combine => Stage::Combine.ordinal(num_iters),
            Self::Priors => Stage::Priors.ordinal(num_iters),
            Self::Cleanup => Stage::Cleanup.ordinal(num_iters),
        }
    }

    /// Whether `stage` should run when starting from this spec.
    ///
    /// For setup stages `num_iters` is irrelevant: their ordinals are negative
    /// and every symbolic spec resolves to a non-negative ordinal.
    #[must_use]
    pub fn admits(self, stage: Stage, num_iters: usize) -> bool {
        self.resolve(num_iters) <= stage.ordinal(num_iters)
    }
}

impl std::fmt::Display for StageSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Index(i) => write!(f, "{i}"),
            Self::Combine => write!(f, "combine"),
            Self::Priors => write!(f, "priors"),
            Self::Cleanup => write!(f, "cleanup"),
        }
    }
}

impl std::str::FromStr for StageSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(i) = s.parse::<i64>() {
            return Ok(Self::Index(i));
        }
        match s.to_lowercase().as_str() {
            "combine" | "combining" => Ok(Self::Combine),
            "priors" | "estimating-priors" => Ok(Self::Priors),
            "cleanup" | "cleaning-up" => Ok(Self::Cleanup),
            _ => Err(format!(
                "unknown stage '{s}'. Use an integer, combine, priors or cleanup"
            )),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StageRepr {
    Index(i64),
    Name(String),
}

impl Serialize for StageSpec {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Index(i) => serializer.serialize_i64(*i),
            _ => serializer.serialize_str(&self.to_string()),
        }
    }
}

impl<'de> Deserialize<'de> for StageSpec {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match StageRepr::deserialize(deserializer)? {
            StageRepr::Index(i) => Ok(Self::Index(i)),
            StageRepr::Name(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// Command-line overrides for where a run starts and stops.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::Args))]
pub struct StageArgs {
    /// Stage to start from (integer, or combine/priors/cleanup)
    #[cfg_attr(feature = "clap", arg(long))]
    pub stage: Option<StageSpec>,
    /// Stop before running this iteration
    #[cfg_attr(feature = "clap", arg(long))]
    pub exit_stage: Option<usize>,
}
