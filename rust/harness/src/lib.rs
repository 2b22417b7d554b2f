#![warn(clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::cast_precision_loss,
    clippy::cast_possible_wrap,
    clippy::too_many_lines
)]

//! RNN Training Harness
//!
//! Drives a recurrent acoustic model through its training stages: network
//! initialization, egs generation, preconditioning, the iteration loop,
//! model combination, prior estimation and cleanup. Runs can be resumed from
//! any stage.

pub mod archive;
pub mod checkpoint;
pub mod config;
pub mod jobs;
pub mod observer;
pub mod plan;
pub mod ramp;
pub mod report;
pub mod schedule;
pub mod scheduler;
pub mod shrink;
pub mod state;
pub mod toolkit;
pub mod window;

pub use config::{ExperimentConfig, HarnessSettings};
pub use plan::{CombinationSet, TrainingPlan};
pub use report::{MailNotifier, Notifier};
pub use scheduler::{RunOutcome, Scheduler, TrainError};
pub use state::{RunState, RunStatus, StateManager};
pub use toolkit::{CommandToolkit, Toolkit};
