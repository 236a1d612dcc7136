use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use plane::ml::{
    corpus::{TrainingSample, TranslationCorpus},
    seq2seq::translator::{CharacterTranslator, TrainEvaluation, TranslatorBuilder},
    NodeValue, RngStrategy, ShuffleRng,
};

use crate::{
    bounded::BoundedValueLogger,
    config::{TrainerConfig, TrainerOptimizer},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerReport {
    pub epoch: usize,
    pub training: TrainEvaluation,
    pub validation: Option<TrainEvaluation>,
    pub ms_per_epoch: u128,
    pub generated_time: u128,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerStateMetadata {
    pub current_epoch: usize,
    pub epochs: usize,
    pub output_label: Option<String>,
    pub total_train_seconds: u64,
    pub training_report: Option<TrainerReport>,
    pub training_error_history: Vec<(usize, NodeValue)>,
}

pub struct TrainerState {
    pub translator: CharacterTranslator,
    optimizer: TrainerOptimizer,
    rng: RngStrategy,
    batch_size: usize,
    epochs: usize,
    quiet_epochs: bool,
    output_label: Option<String>,
    epoch: usize,
    training_loss_logger: BoundedValueLogger<NodeValue>,
    last_report: Option<TrainerReport>,
    total_train_time: Duration,
}

impl TrainerState {
    pub fn new(translator: CharacterTranslator, config: &TrainerConfig, rng: RngStrategy) -> Self {
        Self {
            translator,
            optimizer: config.solver.optimizer(config.train_rate),
            rng,
            batch_size: config.batch_size.max(1),
            epochs: config.epochs,
            quiet_epochs: config.quiet_epochs,
            output_label: config.output_label.clone(),
            epoch: 0,
            training_loss_logger: BoundedValueLogger::new(1000),
            last_report: None,
            total_train_time: Duration::ZERO,
        }
    }

    #[instrument(level = "info", skip_all, fields(epoch = self.epoch + 1))]
    fn train_epoch(&mut self, samples: &mut Vec<TrainingSample>) -> Result<TrainEvaluation> {
        self.rng.shuffle_vec(samples);

        let mut loss_sum = 0.0;
        let mut accuracy_sum = 0.0;
        for (batch_idx, batch) in samples.chunks(self.batch_size).enumerate() {
            let evaluation = self
                .translator
                .train_evaluated(batch, &self.optimizer)
                .with_context(|| {
                    format!(
                        "failed to train translator (epoch = {}, batch = {})",
                        self.epoch + 1,
                        batch_idx + 1
                    )
                })?;

            let batch_len = batch.len() as NodeValue;
            loss_sum += evaluation.loss * batch_len;
            accuracy_sum += evaluation.accuracy * batch_len;
        }

        let samples_len = samples.len().max(1) as NodeValue;
        Ok(TrainEvaluation {
            loss: loss_sum / samples_len,
            accuracy: accuracy_sum / samples_len,
        })
    }

    pub fn run_epoch(
        &mut self,
        training_samples: &mut Vec<TrainingSample>,
        validation_samples: &[TrainingSample],
    ) -> Result<()> {
        let started = Instant::now();
        let training = self.train_epoch(training_samples)?;
        let train_duration = started.elapsed();
        self.total_train_time += train_duration;

        if !training.loss.is_finite() {
            bail!(
                "training loss is not finite at epoch {}: {}",
                self.epoch + 1,
                training.loss
            );
        }
        self.training_loss_logger.push(training.loss);

        let validation = if validation_samples.is_empty() {
            None
        } else {
            Some(self.translator.evaluate(validation_samples)?)
        };

        let report = validate::generate_training_report(
            self.epoch,
            training,
            validation,
            train_duration,
        );
        if !self.quiet_epochs || validate::should_report_round(self.epoch, self.epochs) {
            validate::log_training_round(&report);
        }

        self.last_report = Some(report);
        self.epoch += 1;
        Ok(())
    }

    pub fn metadata(&self) -> TrainerStateMetadata {
        TrainerStateMetadata {
            current_epoch: self.epoch,
            epochs: self.epochs,
            output_label: self.output_label.clone(),
            total_train_seconds: self.total_train_time.as_secs(),
            training_report: self.last_report.clone(),
            training_error_history: self
                .training_loss_logger
                .iter()
                .map(|(epoch, loss)| (epoch, *loss))
                .collect(),
        }
    }
}

pub fn setup_and_train_translator(config: TrainerConfig) -> Result<CharacterTranslator> {
    info!("Loading phrase pairs from '{}'", config.input_txt_path);
    let corpus = TranslationCorpus::read_from_file(&config.input_txt_path, config.num_samples)?;
    info!("Loaded corpus: [ {} ]", corpus.summary());

    let (mut training_samples, validation_samples) =
        corpus.split_validation(config.validation_split)?;
    if training_samples.is_empty() {
        bail!("no training samples left after the validation split");
    }
    info!(
        "Split samples: [ train_set = {}, validation_set = {} ]",
        training_samples.len(),
        validation_samples.len()
    );

    let rng = RngStrategy::from_seed(config.seed);
    let translator = TranslatorBuilder::for_corpus(&corpus)
        .with_latent_dim(config.latent_dim)
        .with_rng(rng.clone())
        .build()?;
    info!(
        "Built translator: [ latent_dim = {}, solver = {:?}, train_rate = {} ]",
        translator.latent_dim(),
        config.solver,
        config.train_rate
    );

    let mut state = TrainerState::new(translator, &config, rng);
    for _ in 0..config.epochs {
        state.run_epoch(&mut training_samples, &validation_samples)?;
    }
    info!("Completed {} epochs", config.epochs);

    let metadata = state.metadata();
    let fpath = writer::write_model_to_disk(&state.translator, &config, &metadata)?;
    info!("Saved model to '{}'", fpath.display());
    writer::plot_training_loss(&config, &metadata)?;

    preview_translations(&state.translator, &corpus, config.preview_count);
    Ok(state.translator)
}

fn preview_translations(
    translator: &CharacterTranslator,
    corpus: &TranslationCorpus,
    preview_count: usize,
) {
    for pair in corpus.pairs().iter().take(preview_count) {
        match translator.decode_sequence(&pair.input) {
            Ok(decoded) => info!(
                "Input sentence: {:?} | Decoded sentence: {:?}",
                pair.input, decoded
            ),
            Err(e) => warn!("Failed to decode {:?}: {e}", pair.input),
        }
    }
}

pub mod validate {
    use std::time::Duration;

    use tracing::info;

    use plane::ml::seq2seq::translator::TrainEvaluation;

    use super::TrainerReport;

    pub fn generate_training_report(
        epoch: usize,
        training: TrainEvaluation,
        validation: Option<TrainEvaluation>,
        duration: Duration,
    ) -> TrainerReport {
        let generated_time = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|x| x.as_millis())
            .unwrap_or_default();

        TrainerReport {
            epoch,
            training,
            validation,
            ms_per_epoch: duration.as_millis(),
            generated_time,
        }
    }

    pub fn log_training_round(report: &TrainerReport) {
        let validation = report
            .validation
            .map(|validation| {
                format!(
                    ", val_loss = {:<12.10}, val_pred_acc: {:0>4.1}%",
                    validation.loss,
                    validation.accuracy * 100.0
                )
            })
            .unwrap_or_default();

        info!(
            "epoch = {:<6} |  train_loss = {:<12.10}, train_pred_acc: {:0>4.1}%{validation} (ms/epoch={:>4})",
            report.epoch + 1,
            report.training.loss,
            report.training.accuracy * 100.0,
            report.ms_per_epoch
        );
    }

    pub fn should_report_round(round: usize, training_rounds: usize) -> bool {
        let round_1based = round + 1;

        round_1based <= 3
            || (round_1based <= 100 && round_1based % 10 == 0)
            || (round_1based <= 1000 && round_1based % 100 == 0)
            || (round_1based <= 10000 && round_1based % 1000 == 0)
            || round_1based == training_rounds
    }
}

pub mod writer {
    use std::{fs::File, io::Write, path::PathBuf};

    use anyhow::{Context, Result};
    use serde_json::Value;

    use plane::ml::seq2seq::translator::CharacterTranslator;

    use crate::config::TrainerConfig;

    use super::TrainerStateMetadata;

    #[cfg(not(feature = "plot"))]
    pub fn plot_training_loss(
        _config: &TrainerConfig,
        _metadata: &TrainerStateMetadata,
    ) -> Result<Option<PathBuf>> {
        Ok(None)
    }

    #[cfg(feature = "plot")]
    pub fn plot_training_loss(
        config: &TrainerConfig,
        metadata: &TrainerStateMetadata,
    ) -> Result<Option<PathBuf>> {
        use plotly::{Plot, Scatter};
        use tracing::info;

        let x_points = metadata
            .training_error_history
            .iter()
            .map(|x| x.0 + 1)
            .collect();

        let y_points = metadata
            .training_error_history
            .iter()
            .map(|x| x.1)
            .collect();

        let mut plot = Plot::new();

        let trace = Scatter::new(x_points, y_points);
        plot.add_trace(trace.name("train_loss"));

        let title = format!(
            "Training Progess [{}]",
            config.output_label.as_deref().unwrap_or("untitled")
        );
        let title = plotly::common::Title::new(&title);
        plot.set_layout(plot.layout().clone().title(title));

        let fpath = path::create_output_fpath(
            ("loss", ".html"),
            &config.output_dir,
            config.output_label.as_deref(),
            Some(metadata),
        )?;
        plot.write_html(&fpath);
        info!("Saved training loss plot to '{}'", fpath.display());

        Ok(Some(fpath))
    }

    pub fn write_model_to_disk(
        translator: &CharacterTranslator,
        config: &TrainerConfig,
        state: &TrainerStateMetadata,
    ) -> Result<PathBuf> {
        let snapshot = translator.snapshot()?;
        let mut snapshot: Value = serde_json::from_str(&snapshot)?;

        snapshot["_trainer_config"] = serde_json::to_value(config)?;
        snapshot["_trainer_state"] = serde_json::to_value(state)?;

        let snapshot_pretty = serde_json::to_string_pretty(&snapshot)?;
        let fpath = path::create_output_fpath(
            ("model", ".json"),
            &config.output_dir,
            config.output_label.as_deref(),
            Some(state),
        )?;

        File::create(&fpath)
            .and_then(|mut file| file.write_all(snapshot_pretty.as_bytes()))
            .with_context(|| format!("failed to write model to {}", fpath.display()))?;

        Ok(fpath)
    }

    mod path {
        use std::{
            fs::DirBuilder,
            path::{Path, PathBuf},
            time::SystemTime,
        };

        use anyhow::{Context, Result};

        use super::TrainerStateMetadata;

        pub fn create_output_fpath(
            fname_prefix_ext: (&str, &str),
            output_dir: &str,
            output_label: Option<&str>,
            state: Option<&TrainerStateMetadata>,
        ) -> Result<PathBuf> {
            let dir_path = create_output_dir(output_dir, output_label)?;
            let fname_description = match state {
                Some(state) => metadata_fname_description(state),
                None => systime().to_string(),
            };
            let (fname_prefix, fname_ext) = fname_prefix_ext;
            let fpath = dir_path.join(format!("{fname_prefix}-{fname_description}{fname_ext}"));

            if let Ok(true) = fpath.try_exists() {
                let fpath_prefix = dir_path.join(format!("{fname_prefix}-{fname_description}"));
                if let Some(value) = get_next_path(fpath_prefix, fname_ext) {
                    return Ok(value);
                }
            }
            Ok(fpath)
        }

        fn metadata_fname_description(state: &TrainerStateMetadata) -> String {
            let report = state.training_report.as_ref();
            let accuracy = report.map(|report| report.validation.unwrap_or(report.training).accuracy);
            let accuracy_pct = (accuracy.unwrap_or_default() * 100.0).round();
            format!("e{}-{accuracy_pct}pct", state.current_epoch)
        }

        fn systime() -> u128 {
            SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|x| x.as_millis())
                .unwrap_or_default()
        }

        fn get_next_path(fpath_prefix: PathBuf, fpath_postfix: &str) -> Option<PathBuf> {
            let fpath_prefix = fpath_prefix.to_str()?;
            let fpath_postfix = fpath_postfix.trim_start_matches('.');
            for i in 2..50 {
                let fpath: PathBuf = format!("{fpath_prefix}.{i}.{fpath_postfix}").into();
                if let Ok(false) = fpath.try_exists() {
                    return Some(fpath);
                }
            }
            None
        }

        fn create_output_dir(output_dir: &str, output_label: Option<&str>) -> Result<PathBuf> {
            let dir_path = Path::new(output_dir);
            let dir_path = match output_label {
                Some(label) => dir_path.join(label),
                None => dir_path.to_path_buf(),
            };
            DirBuilder::new()
                .recursive(true)
                .create(&dir_path)
                .with_context(|| format!("failed to create output dir {}", dir_path.display()))?;
            Ok(dir_path)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use clap::Parser;
    use test_log::test;

    use super::*;

    const PHRASES: &str = "Go.\tVa !\tCC-BY 2.0 (France)\n\
                           Hi.\tSalut !\tCC-BY 2.0 (France)\n\
                           Run!\tCours !\tCC-BY 2.0 (France)\n\
                           Wow!\tÇa alors !\tCC-BY 2.0 (France)\n\
                           Fire!\tAu feu !\tCC-BY 2.0 (France)\n";

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("charseq_train_{name}_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn small_config(dir: &Path) -> TrainerConfig {
        let input_path = dir.join("phrases.txt");
        std::fs::write(&input_path, PHRASES).unwrap();

        TrainerConfig::parse_from([
            "train",
            "--input-txt-path",
            input_path.to_str().unwrap(),
            "--latent-dim",
            "8",
            "--batch-size",
            "2",
            "--epochs",
            "3",
            "--seed",
            "1234",
            "--output-dir",
            dir.join("out").to_str().unwrap(),
            "--output-label",
            "small",
            "--preview-count",
            "2",
        ])
    }

    #[test]
    fn should_report_early_and_final_rounds() {
        let reported: Vec<usize> = (0..250)
            .filter(|round| validate::should_report_round(*round, 250))
            .map(|round| round + 1)
            .collect();

        assert_eq!(&[1, 2, 3, 10, 20], &reported[..5]);
        assert!(reported.contains(&200));
        assert!(!reported.contains(&210));
        assert_eq!(Some(&250), reported.last());
    }

    #[test_log::test]
    fn can_train_and_save_small_translator() {
        let dir = scratch_dir("end_to_end");
        let config = small_config(&dir);

        let translator = setup_and_train_translator(config.clone()).unwrap();
        assert_eq!(8, translator.latent_dim());

        let model_dir = dir.join("out").join("small");
        let saved: Vec<PathBuf> = std::fs::read_dir(&model_dir)
            .unwrap()
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.extension().map_or(false, |ext| ext == "json"))
            .collect();
        assert_eq!(1, saved.len());
        assert!(saved[0].to_string_lossy().contains("model-e3-"));

        let mut saved_json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&saved[0]).unwrap()).unwrap();
        let saved_config: TrainerConfig =
            serde_json::from_value(saved_json["_trainer_config"].take()).unwrap();
        let state: TrainerStateMetadata =
            serde_json::from_value(saved_json["_trainer_state"].take()).unwrap();
        if let serde_json::Value::Object(fields) = &mut saved_json {
            fields.remove("_trainer_config");
            fields.remove("_trainer_state");
        }
        let snapshot = saved_json.to_string();
        assert_eq!(config.latent_dim, saved_config.latent_dim);
        assert_eq!(3, state.current_epoch);
        assert_eq!(3, state.training_error_history.len());
        assert_eq!(2, state.training_report.unwrap().epoch);

        let restored = CharacterTranslator::from_snapshot(&snapshot).unwrap();
        assert_eq!(translator, restored);

        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test_log::test]
    fn training_fails_on_missing_input() {
        let dir = scratch_dir("missing_input");
        let config = TrainerConfig {
            input_txt_path: dir.join("missing.txt").to_string_lossy().to_string(),
            ..small_config(&dir)
        };

        let err = setup_and_train_translator(config).unwrap_err();
        assert!(format!("{err:#}").contains("missing.txt"), "{err:#}");

        std::fs::remove_dir_all(dir).unwrap();
    }
}
