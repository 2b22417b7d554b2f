//! External collaborators: network initialization, egs generation, the
//! per-iteration trainer, combination and posterior estimation.
//!
//! [`Toolkit`] is the seam the scheduler talks to. [`CommandToolkit`] runs
//! each operation as a configured program, passing inputs as `--key value`
//! arguments and streaming its output to `<dir>/log/`.

use std::{
    collections::VecDeque,
    fmt::Display,
    future::Future,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
};

use rnn_config::{DropoutEdit, RunOpts};
use serde::{Deserialize, Serialize};
use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::Command,
    sync::Mutex,
};

use crate::{shrink::SaturationProbe, state::now_timestamp, window::TruncationWindow};

/// Lines of stderr kept for error messages.
const STDERR_TAIL: usize = 20;

/// Whether a program's stdout is returned besides being logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stdout {
    Log,
    Capture,
}

/// Operations the scheduler delegates to the training toolkit.
pub trait Toolkit: SaturationProbe + Send + Sync + 'static {
    /// Write `<dir>/init.raw` from `<dir>/configs/init.config`.
    fn init_network(
        &self,
        dir: &Path,
        run_opts: &RunOpts,
    ) -> impl Future<Output = Result<(), ToolkitError>> + Send;

    fn generate_egs(
        &self,
        request: &EgsRequest,
    ) -> impl Future<Output = Result<(), ToolkitError>> + Send;

    /// Dimension of the features in `feat_dir`.
    fn feat_dim(&self, feat_dir: &Path) -> impl Future<Output = Result<i64, ToolkitError>> + Send;

    /// Dimension of the online ivectors, `0` when none are used.
    fn ivector_dim(
        &self,
        ivector_dir: Option<&Path>,
    ) -> impl Future<Output = Result<i64, ToolkitError>> + Send;

    /// Dimension of dense targets.
    fn target_dim(
        &self,
        targets_scp: &Path,
    ) -> impl Future<Output = Result<i64, ToolkitError>> + Send;

    fn compute_preconditioning_matrix(
        &self,
        request: &PreconditionRequest,
    ) -> impl Future<Output = Result<(), ToolkitError>> + Send;

    /// Write checkpoint `0` from `init.raw` and the configs.
    fn prepare_initial_network(
        &self,
        dir: &Path,
        run_opts: &RunOpts,
    ) -> impl Future<Output = Result<(), ToolkitError>> + Send;

    /// Train from checkpoint `iter` and write checkpoint `iter + 1`.
    fn train_one_iteration(
        &self,
        request: &IterationRequest,
    ) -> impl Future<Output = Result<(), ToolkitError>> + Send;

    /// Train/validation objective diagnostics for checkpoint `iter`.
    fn compute_diagnostics(
        &self,
        request: &DiagnosticsRequest,
    ) -> impl Future<Output = Result<(), ToolkitError>> + Send;

    /// Average the requested checkpoints into `<dir>/final.raw`.
    fn combine_models(
        &self,
        request: &CombineRequest,
    ) -> impl Future<Output = Result<(), ToolkitError>> + Send;

    fn compute_average_posterior(
        &self,
        request: &PosteriorRequest,
    ) -> impl Future<Output = Result<(), ToolkitError>> + Send;

    /// Human-readable accuracy report over the logs in `dir`.
    fn accuracy_report(
        &self,
        dir: &Path,
    ) -> impl Future<Output = Result<String, ToolkitError>> + Send;

    /// One-paragraph summary of the finished experiment.
    fn summarize_dir(
        &self,
        dir: &Path,
    ) -> impl Future<Output = Result<String, ToolkitError>> + Send;
}

/// How targets are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    Dense,
    Sparse,
}

impl Display for TargetType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dense => write!(f, "dense"),
            Self::Sparse => write!(f, "sparse"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EgsRequest {
    pub feat_dir: PathBuf,
    pub targets_scp: PathBuf,
    pub egs_dir: PathBuf,
    pub left_context: i64,
    pub right_context: i64,
    pub valid_left_context: i64,
    pub valid_right_context: i64,
    pub frames_per_eg: i64,
    pub srand: i64,
    pub egs_opts: Option<String>,
    pub cmvn_opts: Option<String>,
    pub online_ivector_dir: Option<PathBuf>,
    pub transform_dir: Option<PathBuf>,
    pub samples_per_iter: usize,
    pub stage: i64,
    pub target_type: TargetType,
    /// `-1` when unknown.
    pub num_targets: i64,
    pub run_opts: RunOpts,
}

impl EgsRequest {
    #[must_use]
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Args::default();
        args.push("data", self.feat_dir.display())
            .push("targets-scp", self.targets_scp.display())
            .push("egs-dir", self.egs_dir.display())
            .push("left-context", self.left_context)
            .push("right-context", self.right_context)
            .push("valid-left-context", self.valid_left_context)
            .push("valid-right-context", self.valid_right_context)
            .push("frames-per-eg", self.frames_per_eg)
            .push("srand", self.srand)
            .push_opt("egs-opts", self.egs_opts.as_ref())
            .push_opt("cmvn-opts", self.cmvn_opts.as_ref())
            .push_opt(
                "online-ivector-dir",
                self.online_ivector_dir.as_ref().map(|p| p.display()),
            )
            .push_opt("transform-dir", self.transform_dir.as_ref().map(|p| p.display()))
            .push("samples-per-iter", self.samples_per_iter)
            .push("stage", self.stage)
            .push("target-type", self.target_type)
            .push("num-targets", self.num_targets)
            .push("cmd", &self.run_opts.egs_command);
        args.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PreconditionRequest {
    pub dir: PathBuf,
    pub egs_dir: PathBuf,
    pub num_archives: usize,
    pub max_lda_jobs: usize,
    pub rand_prune: f64,
    pub run_opts: RunOpts,
}

impl PreconditionRequest {
    #[must_use]
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Args::default();
        args.push("dir", self.dir.display())
            .push("egs-dir", self.egs_dir.display())
            .push("num-lda-jobs", self.num_archives.min(self.max_lda_jobs))
            .push("rand-prune", self.rand_prune)
            .push("cmd", &self.run_opts.command);
        args.0
    }
}

/// Inputs of one training iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct IterationRequest {
    pub dir: PathBuf,
    pub iter: usize,
    pub srand: i64,
    pub egs_dir: PathBuf,
    pub num_jobs: usize,
    pub num_archives_processed: usize,
    pub num_archives: usize,
    pub learning_rate: f64,
    pub dropout_edits: Vec<DropoutEdit>,
    pub shrinkage_value: f64,
    pub minibatch_size: usize,
    pub num_hidden_layers: usize,
    pub add_layers_period: usize,
    pub left_context: i64,
    pub right_context: i64,
    pub deriv_window: TruncationWindow,
    pub momentum: f64,
    pub max_param_change: f64,
    pub shuffle_buffer_size: usize,
    pub cv_minibatch_size: usize,
    pub run_opts: RunOpts,
}

impl IterationRequest {
    #[must_use]
    pub fn to_args(&self) -> Vec<String> {
        let edits = self
            .dropout_edits
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");

        let mut args = Args::default();
        args.push("dir", self.dir.display())
            .push("iter", self.iter)
            .push("srand", self.srand)
            .push("egs-dir", self.egs_dir.display())
            .push("num-jobs", self.num_jobs)
            .push("num-archives-processed", self.num_archives_processed)
            .push("num-archives", self.num_archives)
            .push("learning-rate", self.learning_rate)
            .push_opt("dropout-edits", (!edits.is_empty()).then_some(edits))
            .push("shrinkage-value", self.shrinkage_value)
            .push("minibatch-size", self.minibatch_size)
            .push("num-hidden-layers", self.num_hidden_layers)
            .push("add-layers-period", self.add_layers_period)
            .push("left-context", self.left_context)
            .push("right-context", self.right_context)
            .push_opt("min-deriv-time", self.deriv_window.min_deriv_time)
            .push_opt("max-deriv-time", self.deriv_window.max_deriv_time)
            .push("momentum", self.momentum)
            .push("max-param-change", self.max_param_change)
            .push("shuffle-buffer-size", self.shuffle_buffer_size)
            .push("cv-minibatch-size", self.cv_minibatch_size)
            .push("cmd", &self.run_opts.command)
            .push("queue-opt", &self.run_opts.train_queue_opt)
            .push("parallel-train-opts", &self.run_opts.parallel_train_opts);
        args.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiagnosticsRequest {
    pub dir: PathBuf,
    pub iter: usize,
    pub egs_dir: PathBuf,
    pub left_context: i64,
    pub right_context: i64,
    pub run_opts: RunOpts,
}

impl DiagnosticsRequest {
    #[must_use]
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Args::default();
        args.push("dir", self.dir.display())
            .push("iter", self.iter)
            .push("egs-dir", self.egs_dir.display())
            .push("left-context", self.left_context)
            .push("right-context", self.right_context)
            .push("cmd", &self.run_opts.command);
        args.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CombineRequest {
    pub dir: PathBuf,
    pub num_iters: usize,
    /// Checkpoint indices to average, ascending.
    pub models: Vec<usize>,
    pub egs_dir: PathBuf,
    pub left_context: i64,
    pub right_context: i64,
    pub chunk_width: i64,
    pub run_opts: RunOpts,
}

impl CombineRequest {
    #[must_use]
    pub fn to_args(&self) -> Vec<String> {
        let models = self
            .models
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");

        let mut args = Args::default();
        args.push("dir", self.dir.display())
            .push("num-iters", self.num_iters)
            .push("models", models)
            .push("egs-dir", self.egs_dir.display())
            .push("left-context", self.left_context)
            .push("right-context", self.right_context)
            .push("chunk-width", self.chunk_width)
            .push("cmd", &self.run_opts.command)
            .push("queue-opt", &self.run_opts.combine_queue_opt);
        args.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PosteriorRequest {
    pub dir: PathBuf,
    pub egs_dir: PathBuf,
    pub num_archives: usize,
    pub left_context: i64,
    pub right_context: i64,
    pub prior_subset_size: usize,
    pub run_opts: RunOpts,
}

impl PosteriorRequest {
    #[must_use]
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Args::default();
        args.push("dir", self.dir.display())
            .push("model", "final")
            .push("egs-dir", self.egs_dir.display())
            .push("num-archives", self.num_archives)
            .push("left-context", self.left_context)
            .push("right-context", self.right_context)
            .push("prior-subset-size", self.prior_subset_size)
            .push("num-jobs", self.run_opts.num_jobs_compute_prior)
            .push("cmd", &self.run_opts.command)
            .push("gpu-opt", &self.run_opts.prior_gpu_opt)
            .push("queue-opt", &self.run_opts.prior_queue_opt);
        args.0
    }
}

/// `--key value` argument list.
#[derive(Default)]
struct Args(Vec<String>);

impl Args {
    fn push(&mut self, key: &str, value: impl Display) -> &mut Self {
        self.0.push(format!("--{key}"));
        self.0.push(value.to_string());
        self
    }

    fn push_opt(&mut self, key: &str, value: Option<impl Display>) -> &mut Self {
        if let Some(value) = value {
            self.push(key, value);
        }
        self
    }
}

/// Programs run by [`CommandToolkit`], from the `[toolkit]` config table.
///
/// Each entry is a command line; its first word is the executable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolkitPrograms {
    #[serde(default = "default_init_network")]
    pub init_network: String,
    #[serde(default = "default_generate_egs")]
    pub generate_egs: String,
    /// Prints the dimension of an scp'd feature matrix to stdout.
    #[serde(default = "default_feat_to_dim")]
    pub feat_to_dim: String,
    #[serde(default = "default_compute_preconditioning_matrix")]
    pub compute_preconditioning_matrix: String,
    #[serde(default = "default_prepare_initial_network")]
    pub prepare_initial_network: String,
    /// Prints the saturation of the model given by `--model` to stdout.
    #[serde(default = "default_measure_saturation")]
    pub measure_saturation: String,
    #[serde(default = "default_train_one_iteration")]
    pub train_one_iteration: String,
    #[serde(default = "default_compute_diagnostics")]
    pub compute_diagnostics: String,
    #[serde(default = "default_combine_models")]
    pub combine_models: String,
    #[serde(default = "default_compute_average_posterior")]
    pub compute_average_posterior: String,
    #[serde(default = "default_accuracy_report")]
    pub accuracy_report: String,
    #[serde(default = "default_summarize_dir")]
    pub summarize_dir: String,
}

fn default_init_network() -> String {
    "steps/nnet3/rnn/init_network.sh".into()
}
fn default_generate_egs() -> String {
    "steps/nnet3/get_egs_targets.sh".into()
}
fn default_feat_to_dim() -> String {
    "feat-to-dim".into()
}
fn default_compute_preconditioning_matrix() -> String {
    "steps/nnet3/rnn/compute_preconditioning_matrix.sh".into()
}
fn default_prepare_initial_network() -> String {
    "steps/nnet3/rnn/prepare_initial_network.sh".into()
}
fn default_measure_saturation() -> String {
    "steps/nnet3/rnn/measure_saturation.sh".into()
}
fn default_train_one_iteration() -> String {
    "steps/nnet3/rnn/train_one_iteration.sh".into()
}
fn default_compute_diagnostics() -> String {
    "steps/nnet3/rnn/compute_diagnostics.sh".into()
}
fn default_combine_models() -> String {
    "steps/nnet3/rnn/combine_models.sh".into()
}
fn default_compute_average_posterior() -> String {
    "steps/nnet3/rnn/compute_average_posterior.sh".into()
}
fn default_accuracy_report() -> String {
    "steps/nnet3/report/generate_accuracy_report.sh".into()
}
fn default_summarize_dir() -> String {
    "steps/info/nnet3_dir_info.pl".into()
}

impl Default for ToolkitPrograms {
    fn default() -> Self {
        Self {
            init_network: default_init_network(),
            generate_egs: default_generate_egs(),
            feat_to_dim: default_feat_to_dim(),
            compute_preconditioning_matrix: default_compute_preconditioning_matrix(),
            prepare_initial_network: default_prepare_initial_network(),
            measure_saturation: default_measure_saturation(),
            train_one_iteration: default_train_one_iteration(),
            compute_diagnostics: default_compute_diagnostics(),
            combine_models: default_combine_models(),
            compute_average_posterior: default_compute_average_posterior(),
            accuracy_report: default_accuracy_report(),
            summarize_dir: default_summarize_dir(),
        }
    }
}

/// Runs toolkit operations as subprocesses of this experiment.
#[derive(Debug, Clone)]
pub struct CommandToolkit {
    programs: ToolkitPrograms,
    log_dir: PathBuf,
}

impl CommandToolkit {
    /// Toolkit logging under `<dir>/log`.
    #[must_use]
    pub fn new(programs: ToolkitPrograms, dir: &Path) -> Self {
        Self {
            programs,
            log_dir: dir.join("log"),
        }
    }

    #[must_use]
    pub fn log_path(&self, op: &str, iter: Option<usize>) -> PathBuf {
        match iter {
            Some(iter) => self.log_dir.join(format!("{op}.{iter}.log")),
            None => self.log_dir.join(format!("{op}.log")),
        }
    }

    /// Run `program` with `args`, streaming its output into the op's log.
    async fn execute(
        &self,
        op: &str,
        iter: Option<usize>,
        program: &str,
        args: Vec<String>,
    ) -> Result<(), ToolkitError> {
        self.run_logged(op, iter, program, args, Stdout::Log)
            .await
            .map(drop)
    }

    /// Like [`execute`](Self::execute), also returning stdout.
    async fn capture(
        &self,
        op: &str,
        program: &str,
        args: Vec<String>,
    ) -> Result<String, ToolkitError> {
        self.run_logged(op, None, program, args, Stdout::Capture)
            .await
    }

    async fn run_logged(
        &self,
        op: &str,
        iter: Option<usize>,
        program: &str,
        args: Vec<String>,
        mode: Stdout,
    ) -> Result<String, ToolkitError> {
        let mut words = program.split_whitespace();
        let exe = words
            .next()
            .ok_or_else(|| ToolkitError::NoProgram(op.to_string()))?;
        let mut full_args: Vec<String> = words.map(str::to_string).collect();
        full_args.extend(args);

        tokio::fs::create_dir_all(&self.log_dir)
            .await
            .map_err(|e| ToolkitError::Io(self.log_dir.clone(), e))?;
        let log_path = self.log_path(op, iter);
        let mut log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
            .map_err(|e| ToolkitError::Io(log_path.clone(), e))?;

        let cmdline = format!("{exe} {}", full_args.join(" "));
        tracing::debug!("Running {op}: {cmdline}");
        let header = format!("# {cmdline}\n# Started at {}\n", now_timestamp());
        write_flushed(&mut log, &header)
            .await
            .map_err(|e| ToolkitError::Io(log_path.clone(), e))?;
        let log = Arc::new(Mutex::new(log));

        let mut child = Command::new(exe)
            .args(&full_args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ToolkitError::Spawn(op.to_string(), e))?;

        // Stream stdout to the log, keeping it only when the caller wants it
        let stdout_task = child.stdout.take().map(|stdout| {
            let log = log.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                let mut captured = String::new();
                while let Ok(Some(line)) = lines.next_line().await {
                    append_line(&log, &line).await;
                    if mode == Stdout::Capture {
                        captured.push_str(&line);
                        captured.push('\n');
                    }
                }
                captured
            })
        });

        // Stream stderr to the log and keep the last lines for error reporting
        let stderr_task = child.stderr.take().map(|stderr| {
            let log = log.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                let mut tail = VecDeque::with_capacity(STDERR_TAIL);
                while let Ok(Some(line)) = lines.next_line().await {
                    append_line(&log, &line).await;
                    if tail.len() >= STDERR_TAIL {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
                tail.into_iter().collect::<Vec<_>>()
            })
        });

        let status = child
            .wait()
            .await
            .map_err(|e| ToolkitError::Spawn(op.to_string(), e))?;
        let stdout = match stdout_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };
        let tail = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => Vec::new(),
        };

        let footer = format!(
            "# Ended (code {}) at {}\n",
            status.code().map_or_else(|| "none".to_string(), |c| c.to_string()),
            now_timestamp()
        );
        if let Err(e) = write_flushed(&mut *log.lock().await, &footer).await {
            tracing::warn!("Failed to write {}: {e}", log_path.display());
        }

        if status.success() {
            Ok(stdout)
        } else {
            Err(ToolkitError::Failed {
                op: op.to_string(),
                code: status.code(),
                log: log_path,
                stderr: tail.join("\n"),
            })
        }
    }

    async fn execute_parsed<T: std::str::FromStr>(
        &self,
        op: &str,
        program: &str,
        args: Vec<String>,
    ) -> Result<T, ToolkitError> {
        let output = self.capture(op, program, args).await?;
        output.trim().parse().map_err(|_| ToolkitError::Parse {
            op: op.to_string(),
            output: output.trim().to_string(),
        })
    }

    async fn scp_dim(&self, op: &str, scp: &Path) -> Result<i64, ToolkitError> {
        let args = vec![
            "--print-args=false".to_string(),
            format!("scp:{}", scp.display()),
            "-".to_string(),
        ];
        self.execute_parsed(op, &self.programs.feat_to_dim, args)
            .await
    }
}

async fn write_flushed(file: &mut File, text: &str) -> std::io::Result<()> {
    file.write_all(text.as_bytes()).await?;
    file.flush().await
}

/// Append one output line to a shared op log. Log write failures never fail
/// the operation.
async fn append_line(log: &Mutex<File>, line: &str) {
    let mut file = log.lock().await;
    let _ = write_flushed(&mut file, &format!("{line}\n")).await;
}

impl SaturationProbe for CommandToolkit {
    async fn measure_saturation(&self, checkpoint: &Path) -> Result<f64, ToolkitError> {
        let args = vec!["--model".to_string(), checkpoint.display().to_string()];
        self.execute_parsed("saturation", &self.programs.measure_saturation, args)
            .await
    }
}

impl Toolkit for CommandToolkit {
    async fn init_network(&self, dir: &Path, run_opts: &RunOpts) -> Result<(), ToolkitError> {
        let mut args = Args::default();
        args.push("dir", dir.display())
            .push("config", dir.join("configs/init.config").display())
            .push("srand", -2)
            .push("cmd", &run_opts.command);
        self.execute("nnet_init", None, &self.programs.init_network, args.0)
            .await
    }

    async fn generate_egs(&self, request: &EgsRequest) -> Result<(), ToolkitError> {
        self.execute("egs", None, &self.programs.generate_egs, request.to_args())
            .await
    }

    async fn feat_dim(&self, feat_dir: &Path) -> Result<i64, ToolkitError> {
        self.scp_dim("feat_dim", &feat_dir.join("feats.scp")).await
    }

    async fn ivector_dim(&self, ivector_dir: Option<&Path>) -> Result<i64, ToolkitError> {
        match ivector_dir {
            Some(dir) => self.scp_dim("ivector_dim", &dir.join("ivector_online.scp")).await,
            None => Ok(0),
        }
    }

    async fn target_dim(&self, targets_scp: &Path) -> Result<i64, ToolkitError> {
        self.scp_dim("target_dim", targets_scp).await
    }

    async fn compute_preconditioning_matrix(
        &self,
        request: &PreconditionRequest,
    ) -> Result<(), ToolkitError> {
        self.execute(
            "lda",
            None,
            &self.programs.compute_preconditioning_matrix,
            request.to_args(),
        )
        .await
    }

    async fn prepare_initial_network(
        &self,
        dir: &Path,
        run_opts: &RunOpts,
    ) -> Result<(), ToolkitError> {
        let mut args = Args::default();
        args.push("dir", dir.display())
            .push("cmd", &run_opts.command);
        self.execute(
            "prepare_initial_network",
            None,
            &self.programs.prepare_initial_network,
            args.0,
        )
        .await
    }

    async fn train_one_iteration(&self, request: &IterationRequest) -> Result<(), ToolkitError> {
        self.execute(
            "train",
            Some(request.iter),
            &self.programs.train_one_iteration,
            request.to_args(),
        )
        .await
    }

    async fn compute_diagnostics(&self, request: &DiagnosticsRequest) -> Result<(), ToolkitError> {
        self.execute(
            "compute_prob",
            Some(request.iter),
            &self.programs.compute_diagnostics,
            request.to_args(),
        )
        .await
    }

    async fn combine_models(&self, request: &CombineRequest) -> Result<(), ToolkitError> {
        self.execute("combine", None, &self.programs.combine_models, request.to_args())
            .await
    }

    async fn compute_average_posterior(
        &self,
        request: &PosteriorRequest,
    ) -> Result<(), ToolkitError> {
        self.execute(
            "get_post",
            None,
            &self.programs.compute_average_posterior,
            request.to_args(),
        )
        .await
    }

    async fn accuracy_report(&self, dir: &Path) -> Result<String, ToolkitError> {
        let args = vec!["--dir".to_string(), dir.display().to_string()];
        self.capture("report", &self.programs.accuracy_report, args)
            .await
    }

    async fn summarize_dir(&self, dir: &Path) -> Result<String, ToolkitError> {
        let args = vec![dir.display().to_string()];
        self.capture("dir_info", &self.programs.summarize_dir, args)
            .await
    }
}

/// Errors from external toolkit operations.
#[derive(Debug, thiserror::Error)]
pub enum ToolkitError {
    #[error("no program configured for {0}")]
    NoProgram(String),
    #[error("failed to spawn {0}: {1}")]
    Spawn(String, std::io::Error),
    #[error("failed to access {0}: {1}")]
    Io(PathBuf, std::io::Error),
    #[error("{op} exited with code {code:?} (see {path}):\n{stderr}", path = .log.display())]
    Failed {
        op: String,
        code: Option<i32>,
        log: PathBuf,
        stderr: String,
    },
    #[error("could not parse output of {op}: '{output}'")]
    Parse { op: String, output: String },
}
