//! Option types shared by the training harness.

mod dropout;
mod options;
mod stage;
mod vars;

pub use dropout::*;
pub use options::*;
pub use stage::*;
pub use vars::*;

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test]
    fn test_train_options_defaults() {
        let opts: TrainOptions = toml::from_str(
            r#"
dir = "exp/rnn"
feat_dir = "data/train"
targets_scp = "data/train/targets.scp"
"#,
        )
        .unwrap();
        assert_eq!(opts.egs.chunk_width, 20);
        assert_eq!(opts.egs.chunk_left_context, 40);
        assert_eq!(opts.trainer.deriv_truncate_margin, Some(8));
        assert_eq!(opts.trainer.shrink_value, 0.99);
        assert_eq!(opts.stage, StageSpec::Index(-4));
        assert_eq!(opts.preserve_model_interval, 100);
        assert_eq!(opts, TrainOptions::new("exp/rnn", "data/train", "data/train/targets.scp"));
    }

    #[test]
    fn test_nested_tables_and_margin_none() {
        let opts: TrainOptions = toml::from_str(
            r#"
dir = "exp/rnn"
feat_dir = "data/train"
targets_scp = "t.scp"
stage = "combine"

[egs]
chunk_width = 40

[trainer]
num_jobs_final = 12
deriv_truncate_margin = "none"
dropout_schedule = "0,0.2@0.5,0"
"#,
        )
        .unwrap();
        assert_eq!(opts.stage, StageSpec::Combine);
        assert_eq!(opts.egs.chunk_width, 40);
        assert_eq!(opts.trainer.num_jobs_final, 12);
        assert_eq!(opts.trainer.deriv_truncate_margin, None);
        assert!(opts.trainer.dropout_schedule.is_some());
    }

    #[test]
    fn test_stage_overrides() {
        let opts = TrainOptions::new("d", "f", "t").with_stages(&StageArgs {
            stage: Some(StageSpec::Index(7)),
            exit_stage: Some(9),
        });
        assert_eq!(opts.stage, StageSpec::Index(7));
        assert_eq!(opts.exit_stage, Some(9));
    }

    #[test]
    fn test_run_opts_gpu_and_cpu() {
        let mut opts = TrainOptions::new("d", "f", "t");
        let gpu = RunOpts::from_options(&opts);
        assert_eq!(gpu.train_queue_opt, "--gpu 1");
        assert_eq!(gpu.egs_command, "run.pl");

        opts.use_gpu = false;
        opts.egs_command = Some("queue.pl --mem 4G".into());
        let cpu = RunOpts::from_options(&opts);
        assert_eq!(cpu.parallel_train_opts, "--use-gpu=no");
        assert_eq!(cpu.prior_gpu_opt, "--use-gpu=no");
        assert_eq!(cpu.egs_command, "queue.pl --mem 4G");
    }

    #[test_case("-4", StageSpec::Index(-4) ; "setup")]
    #[test_case("12", StageSpec::Index(12) ; "iteration")]
    #[test_case("combine", StageSpec::Combine ; "combine")]
    #[test_case("Priors", StageSpec::Priors ; "priors_case_insensitive")]
    #[test_case("cleanup", StageSpec::Cleanup ; "cleanup")]
    fn test_stage_spec_from_str(input: &str, expected: StageSpec) {
        assert_eq!(input.parse::<StageSpec>().unwrap(), expected);
    }

    #[test]
    fn test_stage_spec_rejects_unknown() {
        assert!("bogus".parse::<StageSpec>().is_err());
    }

    #[test]
    fn test_stage_spec_serde() {
        assert_eq!(serde_json::from_str::<StageSpec>("5").unwrap(), StageSpec::Index(5));
        assert_eq!(
            serde_json::from_str::<StageSpec>("\"priors\"").unwrap(),
            StageSpec::Priors
        );
        assert_eq!(serde_json::to_string(&StageSpec::Cleanup).unwrap(), "\"cleanup\"");
    }

    #[test]
    fn test_stage_ordinals_and_admission() {
        let n = 13;
        assert_eq!(Stage::InitNetwork.ordinal(n), -4);
        assert_eq!(Stage::Iteration(6).ordinal(n), 6);
        assert_eq!(Stage::Combine.ordinal(n), 13);
        assert_eq!(Stage::Priors.ordinal(n), 14);
        assert_eq!(Stage::Cleanup.ordinal(n), 15);

        let from_five = StageSpec::Index(5);
        assert!(!from_five.admits(Stage::PrepareInitial, n));
        assert!(!from_five.admits(Stage::Iteration(4), n));
        assert!(from_five.admits(Stage::Iteration(5), n));
        assert!(from_five.admits(Stage::Cleanup, n));

        let from_priors = StageSpec::Priors;
        assert!(!from_priors.admits(Stage::InitNetwork, 0));
        assert!(!from_priors.admits(Stage::Combine, n));
        assert!(from_priors.admits(Stage::Priors, n));
        assert!(from_priors.admits(Stage::Cleanup, n));
    }

    #[test]
    fn test_vars_parse() {
        let vars = ModelVars::parse(
            "model_left_context=10\nright_context=4\nnum_hidden_layers=3\nadd_lda=false\ninclude_log_softmax=true\n",
            "vars",
        )
        .unwrap();
        assert_eq!(vars.model_left_context, 10);
        assert_eq!(vars.model_right_context, 4);
        assert_eq!(vars.num_hidden_layers, 3);
        assert!(!vars.add_lda);
        assert!(vars.include_log_softmax);
        assert_eq!(vars.num_targets, None);
    }

    #[test]
    fn test_vars_missing_key_names_field() {
        let err = ModelVars::parse("model_left_context=1\n", "exp/configs/vars").unwrap_err();
        assert!(matches!(err, VarsError::Missing("model_right_context", _)));
        assert!(err.to_string().contains("exp/configs/vars"));
    }

    #[test]
    fn test_vars_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vars");
        std::fs::write(
            &path,
            "model_left_context=2\nmodel_right_context=2\nnum_hidden_layers=1\nadd_lda=true\ninclude_log_softmax=false\nnum_targets=40\n",
        )
        .unwrap();
        let vars = ModelVars::load(&path).unwrap();
        assert!(vars.add_lda);
        assert_eq!(vars.num_targets, Some(40));
    }

    #[test]
    fn test_vars_rejects_bad_bool() {
        let err = ModelVars::parse(
            "model_left_context=1\nmodel_right_context=1\nnum_hidden_layers=1\nadd_lda=yes\ninclude_log_softmax=true\n",
            "vars",
        )
        .unwrap_err();
        assert!(matches!(err, VarsError::Invalid("add_lda", _)));
    }

    #[test_case(0.0, 0.0 ; "start")]
    #[test_case(0.25, 0.25 ; "ramp_up")]
    #[test_case(0.5, 0.5 ; "peak")]
    #[test_case(0.75, 0.25 ; "ramp_down")]
    #[test_case(1.0, 0.0 ; "end")]
    fn test_dropout_interpolation(fraction: f64, expected: f64) {
        let schedule: DropoutSchedule = "0,0.5@0.5,0".parse().unwrap();
        let edits = schedule.edits(fraction);
        assert_eq!(edits.len(), 1);
        assert_eq!(edits[0].pattern, "*");
        assert!((edits[0].proportion - expected).abs() < 1e-12);
    }

    #[test]
    fn test_dropout_patterns_and_display() {
        let schedule: DropoutSchedule = "lstm*=0,0.3,0 tdnn*=0.1,0.1".parse().unwrap();
        let edits = schedule.edits(0.5);
        assert_eq!(edits[0].pattern, "lstm*");
        assert!((edits[0].proportion - 0.3).abs() < 1e-12);
        assert_eq!(
            edits[1].to_string(),
            "set-dropout-proportion name=tdnn* proportion=0.1"
        );
        assert_eq!(schedule.to_string(), "lstm*=0,0.3@0.5,0 tdnn*=0.1,0.1");
    }

    #[test]
    fn test_dropout_rejects_invalid() {
        assert!("0.5".parse::<DropoutSchedule>().is_err());
        assert!("0,1.5,0".parse::<DropoutSchedule>().is_err());
        assert!("0,0.2@0.8,0.1@0.4,0".parse::<DropoutSchedule>().is_err());
        assert!("".parse::<DropoutSchedule>().is_err());
    }
}
