//! The staged training loop: setup, iterations, combination, priors and
//! cleanup, resumable at any stage.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use rnn_config::{ModelVars, RunOpts, Stage, TrainOptions};
use tracing::Instrument;

use crate::{
    archive::{ArchivePool, Geometry, GeometryError},
    checkpoint::{CheckpointError, CheckpointStore},
    config::{self, ConfigError, HarnessSettings},
    jobs::{JobSupervisor, SideJobResult},
    observer::RunObserver,
    plan::{CombinationSet, TrainingPlan},
    report::{Notifier, ReportingHook},
    schedule::{ExponentialDecay, LearningRateSchedule, ScheduleInput},
    shrink::{ShrinkError, ShrinkagePolicy},
    state::{Phase, StateError, StateManager},
    toolkit::{
        CombineRequest, DiagnosticsRequest, EgsRequest, IterationRequest, PosteriorRequest,
        PreconditionRequest, TargetType, Toolkit, ToolkitError,
    },
};

/// How a successful run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every stage ran; `final.raw` and `accuracy.report` exist.
    Completed { num_iters: usize },
    /// Stopped before iteration `iter` as requested.
    ExitedEarly { iter: usize },
}

/// Drives one experiment through its stages.
pub struct Scheduler<T, N> {
    options: TrainOptions,
    run_opts: RunOpts,
    toolkit: Arc<T>,
    hook: ReportingHook<N>,
    schedule: Box<dyn LearningRateSchedule>,
    settings: HarnessSettings,
    state: StateManager,
    observer: RunObserver,
}

/// Everything fixed once the archives are known.
struct Prepared {
    vars: ModelVars,
    pool: ArchivePool,
    plan: TrainingPlan,
    combination: CombinationSet,
}

impl<T: Toolkit, N: Notifier> Scheduler<T, N> {
    /// Scheduler with the default exponential learning-rate decay, a hidden
    /// progress bar and state kept in `<dir>/state.json`.
    #[must_use]
    pub fn new(options: TrainOptions, toolkit: T, notifier: Option<N>) -> Self {
        let run_opts = RunOpts::from_options(&options);
        let hook = ReportingHook::new(notifier, &options.dir, options.reporting_interval);
        let schedule = ExponentialDecay::new(
            options.trainer.initial_effective_lrate,
            options.trainer.final_effective_lrate,
        );
        let state = StateManager::for_dir(&options.dir);
        let observer = RunObserver::hidden(&options.dir);
        Self {
            options,
            run_opts,
            toolkit: Arc::new(toolkit),
            hook,
            schedule: Box::new(schedule),
            settings: HarnessSettings::default(),
            state,
            observer,
        }
    }

    #[must_use]
    pub fn with_schedule(mut self, schedule: impl LearningRateSchedule + 'static) -> Self {
        self.schedule = Box::new(schedule);
        self
    }

    #[must_use]
    pub fn with_settings(mut self, settings: HarnessSettings) -> Self {
        self.settings = settings;
        self
    }

    #[must_use]
    pub fn with_observer(mut self, observer: RunObserver) -> Self {
        self.observer = observer;
        self
    }

    #[must_use]
    pub fn options(&self) -> &TrainOptions {
        &self.options
    }

    #[must_use]
    pub fn state_manager(&self) -> &StateManager {
        &self.state
    }

    /// Run every admitted stage.
    ///
    /// On failure a single failure notification is sent, outstanding side
    /// jobs are cancelled and the original error is returned.
    pub async fn run(&self) -> Result<RunOutcome, TrainError> {
        let span = self.observer.span().clone();
        self.run_inner().instrument(span).await
    }

    async fn run_inner(&self) -> Result<RunOutcome, TrainError> {
        let mut supervisor = None;
        match self.attempt(&mut supervisor).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                tracing::error!("Training failed: {e}");
                let timeout = Duration::from_secs(self.settings.notify_timeout_secs);
                self.hook.failure(timeout).await;
                let cancelled = supervisor.as_ref().map_or(0, JobSupervisor::abort);
                if cancelled > 0 {
                    tracing::info!("Cancelled {cancelled} side jobs");
                }
                if let Err(state_err) = self.state.mark_failed(&e.to_string()) {
                    tracing::error!("Failed to record failure: {state_err}");
                }
                self.observer.abandon("failed");
                Err(e)
            }
        }
    }

    /// Everything a run does up to recording its outcome. The supervisor is
    /// left in `supervisor` so a failed attempt can cancel its side jobs.
    async fn attempt(
        &self,
        supervisor: &mut Option<JobSupervisor>,
    ) -> Result<RunOutcome, TrainError> {
        if self.state.recover_crashed()? {
            tracing::warn!("Previous run in {} did not exit cleanly", self.options.dir.display());
        }
        self.state.mark_started(std::process::id())?;

        let polling = config::polling_interval(self.options.background_polling_time)?;
        let supervisor = supervisor.insert(JobSupervisor::new(polling));

        let outcome = self.train(supervisor).await?;
        self.finish_side_jobs(supervisor).await;
        match outcome {
            RunOutcome::Completed { num_iters } => {
                self.state.mark_completed()?;
                self.observer
                    .finish(format!("done after {num_iters} iterations"));
            }
            RunOutcome::ExitedEarly { iter } => {
                self.state.mark_exited(iter)?;
                self.observer.finish(format!("exited before iteration {iter}"));
            }
        }
        Ok(outcome)
    }

    async fn finish_side_jobs(&self, supervisor: &JobSupervisor) {
        match self.settings.drain_timeout_secs {
            Some(secs) => {
                if let Err(e) = supervisor.drain(Duration::from_secs(secs)).await {
                    tracing::warn!("{e}; cancelling them");
                    supervisor.abort();
                }
            }
            None => supervisor.ensure_all_done().await,
        }
        if supervisor.failures() > 0 {
            tracing::warn!("{} side jobs failed", supervisor.failures());
        }
    }

    async fn train(&self, supervisor: &JobSupervisor) -> Result<RunOutcome, TrainError> {
        let prepared = self.setup().await?;
        let Prepared {
            vars,
            pool,
            plan,
            combination,
        } = &prepared;
        let opts = &self.options;
        let num_iters = plan.num_iters;
        self.state.set_num_iters(num_iters)?;

        let store = CheckpointStore::new(&opts.dir, combination.clone(), opts.preserve_model_interval);
        tracing::info!(
            "Training will run for {} epochs = {num_iters} iterations",
            plan.num_epochs
        );
        tracing::debug!("Models to combine: {:?}", combination.indices());

        self.enter_phase(Phase::Iterating)?;
        let start = opts.stage.resolve(num_iters);
        self.observer
            .start_iterations(num_iters, usize::try_from(start).unwrap_or(0));

        let mut archives_processed = 0;
        for iter in 0..num_iters {
            if opts.exit_stage == Some(iter) {
                tracing::info!("Exiting early due to exit_stage {iter}");
                return Ok(RunOutcome::ExitedEarly { iter });
            }
            let num_jobs = plan.ramp().num_jobs(iter);
            if opts.stage.admits(Stage::Iteration(iter), num_iters) {
                self.iteration(supervisor, &prepared, &store, iter, num_jobs, archives_processed)
                    .await?;
            }
            archives_processed += num_jobs;
        }

        let left_context = plan.left_context();
        let right_context = plan.right_context();

        if opts.stage.admits(Stage::Combine, num_iters) {
            self.enter_phase(Phase::Combining)?;
            tracing::info!("Doing final combination to produce final.raw");
            let request = CombineRequest {
                dir: opts.dir.clone(),
                num_iters,
                models: combination.indices(),
                egs_dir: pool.dir.clone(),
                left_context,
                right_context,
                chunk_width: plan.chunk_width,
                run_opts: self.run_opts.clone(),
            };
            self.toolkit.combine_models(&request).await?;
            if !store.final_path().is_file() {
                return Err(TrainError::NoFinalModel(store.final_path()));
            }
            self.stage_done(Stage::Combine, num_iters)?;
        }

        if vars.include_log_softmax && opts.stage.admits(Stage::Priors, num_iters) {
            self.enter_phase(Phase::EstimatingPriors)?;
            tracing::info!("Getting average posterior for purposes of adjusting the priors");
            let request = PosteriorRequest {
                dir: opts.dir.clone(),
                egs_dir: pool.dir.clone(),
                num_archives: plan.num_archives,
                left_context,
                right_context,
                prior_subset_size: opts.trainer.prior_subset_size,
                run_opts: self.run_opts.clone(),
            };
            self.toolkit.compute_average_posterior(&request).await?;
            self.stage_done(Stage::Priors, num_iters)?;
        }

        if opts.cleanup && opts.stage.admits(Stage::Cleanup, num_iters) {
            self.enter_phase(Phase::CleaningUp)?;
            tracing::info!("Cleaning up the experiment directory {}", opts.dir.display());
            store.clean(num_iters)?;
            // Externally supplied egs were not created by this experiment.
            if opts.remove_egs && opts.egs.dir.is_none() {
                pool.remove();
            }
            self.stage_done(Stage::Cleanup, num_iters)?;
        }

        self.final_report(supervisor).await?;
        Ok(RunOutcome::Completed { num_iters })
    }

    /// Validate, run the setup stages and derive the plan.
    async fn setup(&self) -> Result<Prepared, TrainError> {
        let opts = &self.options;
        let dir = &opts.dir;
        let stage = opts.stage;

        let vars = config::validate(opts)?;
        let left_context = opts.egs.chunk_left_context + vars.model_left_context;
        let right_context = opts.egs.chunk_right_context + vars.model_right_context;

        let feat_dim = self.toolkit.feat_dim(&opts.feat_dir).await?;
        let ivector_dim = self
            .toolkit
            .ivector_dim(opts.online_ivector_dir.as_deref())
            .await?;

        if stage.admits(Stage::InitNetwork, 0) {
            tracing::info!("Initializing a basic network");
            self.toolkit.init_network(dir, &self.run_opts).await?;
            self.stage_done(Stage::InitNetwork, 0)?;
        }

        let egs_dir = opts.egs.dir.clone().unwrap_or_else(|| dir.join("egs"));
        if opts.egs.dir.is_none() && stage.admits(Stage::GenerateEgs, 0) {
            tracing::info!("Generating egs");
            let (target_type, num_targets) = self.target_spec(&vars).await?;
            let request = EgsRequest {
                feat_dir: opts.feat_dir.clone(),
                targets_scp: opts.targets_scp.clone(),
                egs_dir: egs_dir.clone(),
                left_context,
                right_context,
                valid_left_context: left_context + opts.egs.chunk_width,
                valid_right_context: right_context + opts.egs.chunk_width,
                frames_per_eg: opts.egs.chunk_width,
                srand: opts.srand,
                egs_opts: opts.egs.opts.clone(),
                cmvn_opts: opts.egs.cmvn_opts.clone(),
                online_ivector_dir: opts.online_ivector_dir.clone(),
                transform_dir: opts.transform_dir.clone(),
                samples_per_iter: opts.trainer.samples_per_iter,
                stage: opts.egs.stage,
                target_type,
                num_targets,
                run_opts: self.run_opts.clone(),
            };
            self.toolkit.generate_egs(&request).await?;
            self.stage_done(Stage::GenerateEgs, 0)?;
        }

        let pool = ArchivePool::open(&egs_dir)?;
        pool.verify(&Geometry {
            feat_dim,
            ivector_dim,
            left_context,
            right_context,
            chunk_width: opts.egs.chunk_width,
        })?;
        let plan = TrainingPlan::derive(opts, &vars, pool.num_archives)?;
        pool.copy_properties_to(dir)?;

        if vars.add_lda && stage.admits(Stage::Preconditioning, 0) {
            tracing::info!("Computing the preconditioning matrix for input features");
            let request = PreconditionRequest {
                dir: dir.clone(),
                egs_dir: pool.dir.clone(),
                num_archives: pool.num_archives,
                max_lda_jobs: opts.trainer.max_lda_jobs,
                rand_prune: opts.trainer.rand_prune,
                run_opts: self.run_opts.clone(),
            };
            self.toolkit.compute_preconditioning_matrix(&request).await?;
            self.stage_done(Stage::Preconditioning, 0)?;
        }

        if stage.admits(Stage::PrepareInitial, 0) {
            tracing::info!("Preparing the initial network");
            self.toolkit
                .prepare_initial_network(dir, &self.run_opts)
                .await?;
            self.stage_done(Stage::PrepareInitial, 0)?;
        }

        let combination = CombinationSet::select(&plan, opts.trainer.max_models_combine);
        Ok(Prepared {
            vars,
            pool,
            plan,
            combination,
        })
    }

    /// Target type and count passed to egs generation; `-1` when unknown.
    async fn target_spec(&self, vars: &ModelVars) -> Result<(TargetType, i64), TrainError> {
        if !self.options.use_dense_targets {
            let num_targets = vars
                .num_targets
                .ok_or_else(|| ConfigError::MissingNumTargets(config::vars_path(&self.options.dir)))?;
            return Ok((TargetType::Sparse, num_targets));
        }
        let Some(expected) = vars.num_targets else {
            return Ok((TargetType::Dense, -1));
        };
        let found = self.toolkit.target_dim(&self.options.targets_scp).await?;
        if found != expected {
            return Err(ConfigError::TargetMismatch { expected, found }.into());
        }
        Ok((TargetType::Dense, expected))
    }

    async fn iteration(
        &self,
        supervisor: &JobSupervisor,
        prepared: &Prepared,
        store: &CheckpointStore,
        iter: usize,
        num_jobs: usize,
        archives_processed: usize,
    ) -> Result<(), TrainError> {
        let opts = &self.options;
        let trainer = &opts.trainer;
        let plan = &prepared.plan;

        let model = store.path(iter);
        if !model.is_file() {
            return Err(TrainError::MissingCheckpoint(iter, model));
        }

        let learning_rate = self.schedule.learning_rate(&ScheduleInput {
            iter,
            num_jobs,
            num_iters: plan.num_iters,
            archives_processed,
            archives_to_process: plan.num_archives_to_process,
        });
        let shrinkage_value =
            ShrinkagePolicy::new(trainer.shrink_value, trainer.shrink_saturation_threshold)
                .evaluate(iter, &model, self.toolkit.as_ref())
                .await?;
        let data_fraction = archives_processed as f64 / plan.num_archives_to_process;
        let dropout_edits = trainer
            .dropout_schedule
            .as_ref()
            .map(|schedule| schedule.edits(data_fraction))
            .unwrap_or_default();

        let request = IterationRequest {
            dir: opts.dir.clone(),
            iter,
            srand: opts.srand,
            egs_dir: prepared.pool.dir.clone(),
            num_jobs,
            num_archives_processed: archives_processed,
            num_archives: plan.num_archives,
            learning_rate,
            dropout_edits,
            shrinkage_value,
            minibatch_size: trainer.num_chunk_per_minibatch,
            num_hidden_layers: prepared.vars.num_hidden_layers,
            add_layers_period: trainer.add_layers_period,
            left_context: plan.left_context(),
            right_context: plan.right_context(),
            deriv_window: plan.deriv_window(),
            momentum: trainer.momentum,
            max_param_change: trainer.max_param_change,
            shuffle_buffer_size: trainer.shuffle_buffer_size,
            cv_minibatch_size: trainer.cv_minibatch_size,
            run_opts: self.run_opts.clone(),
        };
        self.toolkit.train_one_iteration(&request).await?;
        if !store.exists(iter + 1) {
            return Err(TrainError::NoCheckpointProduced(iter + 1, store.path(iter + 1)));
        }

        let diagnostics = DiagnosticsRequest {
            dir: opts.dir.clone(),
            iter,
            egs_dir: prepared.pool.dir.clone(),
            left_context: plan.left_context(),
            right_context: plan.right_context(),
            run_opts: self.run_opts.clone(),
        };
        let toolkit = self.toolkit.clone();
        supervisor.submit(format!("diagnostics-{iter}"), async move {
            let result: SideJobResult = toolkit
                .compute_diagnostics(&diagnostics)
                .await
                .map_err(Into::into);
            result
        });

        if opts.cleanup {
            store.retire(iter as i64 - 2)?;
        }

        if self.hook.is_due(iter, plan.num_iters) {
            match self.toolkit.accuracy_report(&opts.dir).await {
                Ok(report) => self.hook.progress(supervisor, iter, report),
                Err(e) => tracing::warn!("Skipping progress report for iteration {iter}: {e}"),
            }
        }

        self.observer.iteration_done(iter, num_jobs, learning_rate);
        self.stage_done(Stage::Iteration(iter), plan.num_iters)
    }

    /// Persist the accuracy report, send it, and log the directory summary.
    async fn final_report(&self, supervisor: &JobSupervisor) -> Result<(), TrainError> {
        let dir = &self.options.dir;
        let report = self.toolkit.accuracy_report(dir).await?;
        let path = report_path(dir);
        tokio::fs::write(&path, &report)
            .await
            .map_err(|e| TrainError::Io(path, e))?;
        self.hook.complete(supervisor, report);

        match self.toolkit.summarize_dir(dir).await {
            Ok(summary) => tracing::info!("{}", summary.trim_end()),
            Err(e) => tracing::warn!("Could not summarize {}: {e}", dir.display()),
        }
        Ok(())
    }

    fn enter_phase(&self, phase: Phase) -> Result<(), TrainError> {
        self.observer.phase(phase);
        self.state.mark_phase(phase)?;
        Ok(())
    }

    fn stage_done(&self, stage: Stage, num_iters: usize) -> Result<(), TrainError> {
        self.state.mark_stage_completed(stage.ordinal(num_iters))?;
        Ok(())
    }
}

/// `<dir>/accuracy.report`.
#[must_use]
pub fn report_path(dir: &Path) -> PathBuf {
    dir.join("accuracy.report")
}

/// One iteration of a dry run.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedIteration {
    pub iter: usize,
    pub num_jobs: usize,
    pub archives_processed: usize,
    pub learning_rate: f64,
}

/// What a run would do, derived without invoking the toolkit.
#[derive(Debug, Clone)]
pub struct DryRun {
    pub plan: TrainingPlan,
    pub combination: CombinationSet,
    pub iterations: Vec<PlannedIteration>,
}

/// Derive the plan from the experiment directory and existing egs.
pub fn dry_run(options: &TrainOptions) -> Result<DryRun, TrainError> {
    let vars = config::validate(options)?;
    let egs_dir = options
        .egs
        .dir
        .clone()
        .unwrap_or_else(|| options.dir.join("egs"));
    let pool = ArchivePool::open(&egs_dir)?;
    let plan = TrainingPlan::derive(options, &vars, pool.num_archives)?;
    let combination = CombinationSet::select(&plan, options.trainer.max_models_combine);
    let schedule = ExponentialDecay::new(
        options.trainer.initial_effective_lrate,
        options.trainer.final_effective_lrate,
    );

    let ramp = plan.ramp();
    let mut archives_processed = 0;
    let mut iterations = Vec::with_capacity(plan.num_iters);
    for iter in 0..plan.num_iters {
        let num_jobs = ramp.num_jobs(iter);
        let learning_rate = schedule.learning_rate(&ScheduleInput {
            iter,
            num_jobs,
            num_iters: plan.num_iters,
            archives_processed,
            archives_to_process: plan.num_archives_to_process,
        });
        iterations.push(PlannedIteration {
            iter,
            num_jobs,
            archives_processed,
            learning_rate,
        });
        archives_processed += num_jobs;
    }

    Ok(DryRun {
        plan,
        combination,
        iterations,
    })
}

/// Errors that abort a training run.
#[derive(Debug, thiserror::Error)]
pub enum TrainError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("egs directory error: {0}")]
    Geometry(#[from] GeometryError),
    #[error("toolkit error: {0}")]
    Toolkit(#[from] ToolkitError),
    #[error("shrinkage error: {0}")]
    Shrink(#[from] ShrinkError),
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
    #[error("state error: {0}")]
    State(#[from] StateError),
    #[error("checkpoint {0} needed by iteration {0} does not exist: {1}")]
    MissingCheckpoint(usize, PathBuf),
    #[error("training finished but did not write checkpoint {0} ({1})")]
    NoCheckpointProduced(usize, PathBuf),
    #[error("combination finished but did not write {0}")]
    NoFinalModel(PathBuf),
    #[error("failed to write {0}: {1}")]
    Io(PathBuf, std::io::Error),
}
