//! Deterministic in-process toolkit and notifier for driving the scheduler.

#![allow(dead_code)]

use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use rnn_config::{RunOpts, TrainOptions};
use rnn_harness::{
    Notifier, Scheduler,
    checkpoint::checkpoint_path,
    config::{HarnessSettings, vars_path},
    report::NotifyError,
    shrink::SaturationProbe,
    toolkit::{
        CombineRequest, DiagnosticsRequest, EgsRequest, IterationRequest, PosteriorRequest,
        PreconditionRequest, Toolkit, ToolkitError,
    },
};
use tempfile::TempDir;

pub const FEAT_DIM: i64 = 40;
pub const NUM_ARCHIVES: usize = 10;

pub const VARS: &str = "model_left_context=10\nmodel_right_context=10\nnum_hidden_layers=1\n\
                        add_lda=true\ninclude_log_softmax=true\n";

/// What the fake toolkit was asked to do.
#[derive(Debug, Default)]
pub struct Calls {
    pub egs: usize,
    pub iterations: Vec<(usize, usize, f64, f64)>,
    pub diagnostics: Vec<usize>,
    pub combined: Vec<usize>,
    pub priors: usize,
}

#[derive(Clone, Default)]
pub struct FakeToolkit {
    pub calls: Arc<Mutex<Calls>>,
    pub fail_at: Option<usize>,
    pub target_dim: i64,
}

impl FakeToolkit {
    pub fn failing_at(iter: usize) -> Self {
        Self {
            fail_at: Some(iter),
            ..Self::default()
        }
    }

    pub fn iterations(&self) -> Vec<usize> {
        self.calls
            .lock()
            .unwrap()
            .iterations
            .iter()
            .map(|&(iter, ..)| iter)
            .collect()
    }
}

fn io(path: &Path) -> impl FnOnce(std::io::Error) -> ToolkitError + '_ {
    move |e| ToolkitError::Io(path.to_path_buf(), e)
}

fn write(path: &Path, contents: &str) -> Result<(), ToolkitError> {
    fs::write(path, contents).map_err(io(path))
}

fn read(path: &Path) -> Result<String, ToolkitError> {
    fs::read_to_string(path).map_err(io(path))
}

/// Write an egs directory with `NUM_ARCHIVES` archives.
pub fn write_egs(egs_dir: &Path, left_context: i64, right_context: i64, chunk_width: i64) {
    let info = egs_dir.join("info");
    fs::create_dir_all(&info).unwrap();
    for (name, value) in [
        ("feat_dim", FEAT_DIM),
        ("ivector_dim", 0),
        ("left_context", left_context),
        ("right_context", right_context),
        ("frames_per_eg", chunk_width),
        ("num_archives", NUM_ARCHIVES as i64),
    ] {
        fs::write(info.join(name), value.to_string()).unwrap();
    }
    fs::write(egs_dir.join("cmvn_opts"), "--norm-means=false").unwrap();
    for n in 1..=NUM_ARCHIVES {
        fs::write(egs_dir.join(format!("egs.{n}.ark")), format!("archive {n}")).unwrap();
    }
}

impl SaturationProbe for FakeToolkit {
    async fn measure_saturation(&self, checkpoint: &Path) -> Result<f64, ToolkitError> {
        let model = read(checkpoint)?;
        Ok(if model.len() % 2 == 0 { 0.5 } else { 0.1 })
    }
}

impl Toolkit for FakeToolkit {
    async fn init_network(&self, dir: &Path, _run_opts: &RunOpts) -> Result<(), ToolkitError> {
        write(&dir.join("init.raw"), "init")
    }

    async fn generate_egs(&self, request: &EgsRequest) -> Result<(), ToolkitError> {
        self.calls.lock().unwrap().egs += 1;
        write_egs(
            &request.egs_dir,
            request.left_context,
            request.right_context,
            request.frames_per_eg,
        );
        Ok(())
    }

    async fn feat_dim(&self, _feat_dir: &Path) -> Result<i64, ToolkitError> {
        Ok(FEAT_DIM)
    }

    async fn ivector_dim(&self, _ivector_dir: Option<&Path>) -> Result<i64, ToolkitError> {
        Ok(0)
    }

    async fn target_dim(&self, _targets_scp: &Path) -> Result<i64, ToolkitError> {
        Ok(self.target_dim)
    }

    async fn compute_preconditioning_matrix(
        &self,
        request: &PreconditionRequest,
    ) -> Result<(), ToolkitError> {
        write(&request.dir.join("lda.mat"), "lda")
    }

    async fn prepare_initial_network(
        &self,
        dir: &Path,
        _run_opts: &RunOpts,
    ) -> Result<(), ToolkitError> {
        let init = read(&dir.join("init.raw"))?;
        write(&checkpoint_path(dir, 0), &format!("{init}+lda"))
    }

    async fn train_one_iteration(&self, request: &IterationRequest) -> Result<(), ToolkitError> {
        if self.fail_at == Some(request.iter) {
            return Err(ToolkitError::Failed {
                op: "train_one_iteration".into(),
                code: Some(1),
                log: request.dir.join(format!("log/train.{}.log", request.iter)),
                stderr: "simulated failure".into(),
            });
        }
        self.calls.lock().unwrap().iterations.push((
            request.iter,
            request.num_jobs,
            request.learning_rate,
            request.shrinkage_value,
        ));

        let model = read(&checkpoint_path(&request.dir, request.iter))?;
        let next = format!(
            "{model}\n{}:{}:{}:{:.6e}:{}",
            request.iter,
            request.num_jobs,
            request.num_archives_processed,
            request.learning_rate,
            request.shrinkage_value
        );
        write(&checkpoint_path(&request.dir, request.iter + 1), &next)
    }

    async fn compute_diagnostics(&self, request: &DiagnosticsRequest) -> Result<(), ToolkitError> {
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.calls.lock().unwrap().diagnostics.push(request.iter);
        Ok(())
    }

    async fn combine_models(&self, request: &CombineRequest) -> Result<(), ToolkitError> {
        let mut combined = String::new();
        for &index in &request.models {
            combined.push_str(&read(&checkpoint_path(&request.dir, index))?);
            combined.push_str("\n--\n");
        }
        self.calls.lock().unwrap().combined.clone_from(&request.models);
        write(&request.dir.join("final.raw"), &combined)
    }

    async fn compute_average_posterior(&self, request: &PosteriorRequest) -> Result<(), ToolkitError> {
        self.calls.lock().unwrap().priors += 1;
        write(&request.dir.join("post.vec"), "priors")
    }

    async fn accuracy_report(&self, _dir: &Path) -> Result<String, ToolkitError> {
        Ok("iter  train  valid\n   0   0.50   0.48\n".into())
    }

    async fn summarize_dir(&self, dir: &Path) -> Result<String, ToolkitError> {
        Ok(format!("summary of {}", dir.display()))
    }
}

/// Notifier that keeps every message, or refuses every message when
/// `fail` is set.
#[derive(Clone, Default)]
pub struct Recorder {
    pub sent: Arc<Mutex<Vec<(String, String)>>>,
    pub fail: bool,
}

impl Recorder {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn subjects(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(subject, _)| subject.clone())
            .collect()
    }
}

impl Notifier for Recorder {
    async fn notify(&self, subject: &str, message: &str) -> Result<(), NotifyError> {
        if self.fail {
            return Err(NotifyError::Failed {
                code: Some(1),
                stderr: "relay refused".into(),
            });
        }
        self.sent
            .lock()
            .unwrap()
            .push((subject.to_string(), message.to_string()));
        Ok(())
    }
}

/// Experiment directory with configs, 2 epochs over 10 archives and a
/// 1 -> 2 job ramp: 13 iterations.
pub fn experiment() -> (TempDir, TrainOptions) {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir_all(dir.path().join("configs")).unwrap();
    fs::write(vars_path(dir.path()), VARS).unwrap();

    let mut opts = TrainOptions::new(dir.path(), "data/train", "data/targets.scp");
    opts.trainer.num_epochs = 2.0;
    opts.trainer.num_jobs_initial = 1;
    opts.trainer.num_jobs_final = 2;
    opts.background_polling_time = 0.05;
    (dir, opts)
}

pub fn scheduler(
    opts: TrainOptions,
    toolkit: FakeToolkit,
    recorder: Option<Recorder>,
) -> Scheduler<FakeToolkit, Recorder> {
    Scheduler::new(opts, toolkit, recorder).with_settings(HarnessSettings {
        notify_timeout_secs: 5,
        drain_timeout_secs: Some(30),
        ..HarnessSettings::default()
    })
}

pub fn checkpoint(dir: &Path, index: usize) -> PathBuf {
    checkpoint_path(dir, index)
}
