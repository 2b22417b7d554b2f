//! Training options and derived job-dispatch options.

use std::path::PathBuf;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{DropoutSchedule, StageArgs, StageSpec};

/// Options controlling example (egs) extraction.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EgsOptions {
    /// Number of output labels in each training sequence.
    #[serde(default = "default_chunk_width")]
    pub chunk_width: i64,
    /// Steps of left context used to estimate recurrent state before the
    /// first label.
    #[serde(default = "default_chunk_left_context")]
    pub chunk_left_context: i64,
    #[serde(default)]
    pub chunk_right_context: i64,
    /// Pre-existing egs directory. When set, egs are not generated and never
    /// removed by cleanup.
    #[serde(default)]
    pub dir: Option<PathBuf>,
    /// Stage passed through to egs generation.
    #[serde(default)]
    pub stage: i64,
    #[serde(default)]
    pub opts: Option<String>,
    #[serde(default)]
    pub cmvn_opts: Option<String>,
}

fn default_chunk_width() -> i64 {
    20
}
fn default_chunk_left_context() -> i64 {
    40
}

impl Default for EgsOptions {
    fn default() -> Self {
        Self {
            chunk_width: default_chunk_width(),
            chunk_left_context: default_chunk_left_context(),
            chunk_right_context: 0,
            dir: None,
            stage: 0,
            opts: None,
            cmvn_opts: None,
        }
    }
}

/// Trainer and optimization options.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TrainerOptions {
    #[serde(default = "default_num_epochs")]
    pub num_epochs: f64,
    #[serde(default = "default_num_jobs_initial")]
    pub num_jobs_initial: usize,
    #[serde(default = "default_num_jobs_final")]
    pub num_jobs_final: usize,
    #[serde(default = "default_initial_effective_lrate")]
    pub initial_effective_lrate: f64,
    #[serde(default = "default_final_effective_lrate")]
    pub final_effective_lrate: f64,
    #[serde(default = "default_max_models_combine")]
    pub max_models_combine: usize,
    #[serde(default = "default_add_layers_period")]
    pub add_layers_period: usize,
    /// Number of egs in each archive.
    #[serde(default = "default_samples_per_iter")]
    pub samples_per_iter: usize,
    #[serde(default = "default_prior_subset_size")]
    pub prior_subset_size: usize,
    #[serde(default = "default_num_jobs_compute_prior")]
    pub num_jobs_compute_prior: usize,
    #[serde(default = "default_momentum")]
    pub momentum: f64,
    /// Factor applied to parameter matrices when nonlinearities saturate.
    /// `1.0` disables shrinkage.
    #[serde(default = "default_shrink_value")]
    pub shrink_value: f64,
    #[serde(default = "default_shrink_saturation_threshold")]
    pub shrink_saturation_threshold: f64,
    #[serde(default = "default_cv_minibatch_size")]
    pub cv_minibatch_size: usize,
    /// Sequences processed in parallel in every minibatch.
    #[serde(default = "default_num_chunk_per_minibatch")]
    pub num_chunk_per_minibatch: usize,
    /// Deprecated, translated into `deriv_truncate_margin`.
    #[serde(default)]
    pub num_bptt_steps: Option<i64>,
    /// Margin (in input frames) around the required part of each chunk that
    /// derivatives are backpropagated to. `"none"` leaves them unconstrained.
    #[serde(
        default = "default_deriv_truncate_margin",
        serialize_with = "serialize_margin",
        deserialize_with = "deserialize_margin"
    )]
    pub deriv_truncate_margin: Option<i64>,
    #[serde(default = "default_max_param_change")]
    pub max_param_change: f64,
    #[serde(default = "default_shuffle_buffer_size")]
    pub shuffle_buffer_size: usize,
    #[serde(default)]
    pub dropout_schedule: Option<DropoutSchedule>,
    #[serde(default = "default_max_lda_jobs")]
    pub max_lda_jobs: usize,
    #[serde(default = "default_rand_prune")]
    pub rand_prune: f64,
}

fn default_num_epochs() -> f64 {
    8.0
}
fn default_num_jobs_initial() -> usize {
    1
}
fn default_num_jobs_final() -> usize {
    8
}
fn default_initial_effective_lrate() -> f64 {
    0.0003
}
fn default_final_effective_lrate() -> f64 {
    0.00003
}
fn default_max_models_combine() -> usize {
    20
}
fn default_add_layers_period() -> usize {
    2
}
fn default_samples_per_iter() -> usize {
    20000
}
fn default_prior_subset_size() -> usize {
    20000
}
fn default_num_jobs_compute_prior() -> usize {
    10
}
fn default_momentum() -> f64 {
    0.5
}
fn default_shrink_value() -> f64 {
    0.99
}
fn default_shrink_saturation_threshold() -> f64 {
    0.40
}
fn default_cv_minibatch_size() -> usize {
    256
}
fn default_num_chunk_per_minibatch() -> usize {
    100
}
#[allow(clippy::unnecessary_wraps)]
fn default_deriv_truncate_margin() -> Option<i64> {
    Some(8)
}
fn default_max_param_change() -> f64 {
    2.0
}
fn default_shuffle_buffer_size() -> usize {
    5000
}
fn default_max_lda_jobs() -> usize {
    10
}
fn default_rand_prune() -> f64 {
    4.0
}

#[derive(Deserialize)]
#[serde(untagged)]
enum MarginRepr {
    Frames(i64),
    Keyword(String),
}

fn deserialize_margin<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
    match MarginRepr::deserialize(deserializer)? {
        MarginRepr::Frames(n) => Ok(Some(n)),
        MarginRepr::Keyword(s) if s.eq_ignore_ascii_case("none") => Ok(None),
        MarginRepr::Keyword(s) => Err(serde::de::Error::custom(format!(
            "invalid deriv_truncate_margin '{s}': expected an integer or \"none\""
        ))),
    }
}

#[allow(clippy::ref_option)]
fn serialize_margin<S: Serializer>(margin: &Option<i64>, serializer: S) -> Result<S::Ok, S::Error> {
    match margin {
        Some(n) => serializer.serialize_i64(*n),
        None => serializer.serialize_str("none"),
    }
}

impl Default for TrainerOptions {
    fn default() -> Self {
        Self {
            num_epochs: default_num_epochs(),
            num_jobs_initial: default_num_jobs_initial(),
            num_jobs_final: default_num_jobs_final(),
            initial_effective_lrate: default_initial_effective_lrate(),
            final_effective_lrate: default_final_effective_lrate(),
            max_models_combine: default_max_models_combine(),
            add_layers_period: default_add_layers_period(),
            samples_per_iter: default_samples_per_iter(),
            prior_subset_size: default_prior_subset_size(),
            num_jobs_compute_prior: default_num_jobs_compute_prior(),
            momentum: default_momentum(),
            shrink_value: default_shrink_value(),
            shrink_saturation_threshold: default_shrink_saturation_threshold(),
            cv_minibatch_size: default_cv_minibatch_size(),
            num_chunk_per_minibatch: default_num_chunk_per_minibatch(),
            num_bptt_steps: None,
            deriv_truncate_margin: default_deriv_truncate_margin(),
            max_param_change: default_max_param_change(),
            shuffle_buffer_size: default_shuffle_buffer_size(),
            dropout_schedule: None,
            max_lda_jobs: default_max_lda_jobs(),
            rand_prune: default_rand_prune(),
        }
    }
}

/// Full set of options for one training experiment.
///
/// Constructed once (from TOML plus command-line overrides) and never
/// mutated afterwards.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TrainOptions {
    /// Experiment directory. Must contain `configs/` with `vars`.
    pub dir: PathBuf,
    /// Directory with the training features.
    pub feat_dir: PathBuf,
    /// Targets for training.
    pub targets_scp: PathBuf,
    #[serde(default)]
    pub online_ivector_dir: Option<PathBuf>,
    #[serde(default)]
    pub transform_dir: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub use_dense_targets: bool,
    #[serde(default)]
    pub stage: StageSpec,
    #[serde(default)]
    pub exit_stage: Option<usize>,
    #[serde(default)]
    pub srand: i64,
    #[serde(default = "default_true")]
    pub use_gpu: bool,
    /// Launcher prefix for parallel jobs (e.g. `run.pl`, `queue.pl --mem 2G`).
    #[serde(default = "default_command")]
    pub command: String,
    /// Launcher for egs generation; defaults to `command`.
    #[serde(default)]
    pub egs_command: Option<String>,
    /// Address for progress and failure notifications.
    #[serde(default)]
    pub email: Option<String>,
    /// Fraction of the iterations between progress notifications.
    #[serde(default = "default_reporting_interval")]
    pub reporting_interval: f64,
    /// Seconds between polls of background jobs.
    #[serde(default = "default_background_polling_time")]
    pub background_polling_time: f64,
    #[serde(default = "default_true")]
    pub cleanup: bool,
    #[serde(default = "default_true")]
    pub remove_egs: bool,
    /// Every checkpoint whose index is a multiple of this survives cleanup.
    #[serde(default = "default_preserve_model_interval")]
    pub preserve_model_interval: usize,
    #[serde(default)]
    pub egs: EgsOptions,
    #[serde(default)]
    pub trainer: TrainerOptions,
}

fn default_true() -> bool {
    true
}
fn default_command() -> String {
    "run.pl".into()
}
fn default_reporting_interval() -> f64 {
    0.1
}
fn default_background_polling_time() -> f64 {
    60.0
}
fn default_preserve_model_interval() -> usize {
    100
}

impl TrainOptions {
    /// Options with every default applied.
    #[must_use]
    pub fn new(
        dir: impl Into<PathBuf>,
        feat_dir: impl Into<PathBuf>,
        targets_scp: impl Into<PathBuf>,
    ) -> Self {
        Self {
            dir: dir.into(),
            feat_dir: feat_dir.into(),
            targets_scp: targets_scp.into(),
            online_ivector_dir: None,
            transform_dir: None,
            use_dense_targets: true,
            stage: StageSpec::default(),
            exit_stage: None,
            srand: 0,
            use_gpu: true,
            command: default_command(),
            egs_command: None,
            email: None,
            reporting_interval: default_reporting_interval(),
            background_polling_time: default_background_polling_time(),
            cleanup: true,
            remove_egs: true,
            preserve_model_interval: default_preserve_model_interval(),
            egs: EgsOptions::default(),
            trainer: TrainerOptions::default(),
        }
    }

    /// Apply command-line stage overrides, returning the final options.
    #[must_use]
    pub fn with_stages(mut self, args: &StageArgs) -> Self {
        if let Some(stage) = args.stage {
            self.stage = stage;
        }
        if args.exit_stage.is_some() {
            self.exit_stage = args.exit_stage;
        }
        self
    }
}

/// Job-dispatch options derived once from [`TrainOptions`].
///
/// Opaque to the scheduler; only passed through to external jobs.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunOpts {
    pub command: String,
    pub egs_command: String,
    pub train_queue_opt: String,
    pub parallel_train_opts: String,
    pub combine_queue_opt: String,
    pub prior_gpu_opt: String,
    pub prior_queue_opt: String,
    pub num_jobs_compute_prior: usize,
}

impl RunOpts {
    #[must_use]
    pub fn from_options(options: &TrainOptions) -> Self {
        let (train_queue_opt, parallel_train_opts, combine_queue_opt, prior_gpu_opt, prior_queue_opt) =
            if options.use_gpu {
                ("--gpu 1", "", "--gpu 1", "--use-gpu=yes", "--gpu 1")
            } else {
                ("", "--use-gpu=no", "", "--use-gpu=no", "")
            };
        Self {
            command: options.command.clone(),
            egs_command: options
                .egs_command
                .clone()
                .unwrap_or_else(|| options.command.clone()),
            train_queue_opt: train_queue_opt.into(),
            parallel_train_opts: parallel_train_opts.into(),
            combine_queue_opt: combine_queue_opt.into(),
            prior_gpu_opt: prior_gpu_opt.into(),
            prior_queue_opt: prior_queue_opt.into(),
            num_jobs_compute_prior: options.trainer.num_jobs_compute_prior,
        }
    }
}
