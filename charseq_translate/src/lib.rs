use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use plane::ml::{
    corpus::{parse_pairs, PhrasePair},
    seq2seq::translator::CharacterTranslator,
};

/// Training details recovered from a saved model, absent when the file is a bare snapshot.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ExtractedModelConfig {
    pub input_txt_path: Option<String>,
    pub num_samples: Option<usize>,
    pub output_label: Option<String>,
    #[serde(skip)]
    pub current_epoch: Option<usize>,
}

pub fn load<P: AsRef<Path>>(model_fpath: P) -> Result<(CharacterTranslator, ExtractedModelConfig)> {
    let model_fpath = model_fpath.as_ref();
    let json = std::fs::read_to_string(model_fpath)
        .with_context(|| format!("failed to read model file {}", model_fpath.display()))?;

    let (translator, config) = from_json(&json)
        .with_context(|| format!("failed to load model from {}", model_fpath.display()))?;

    info!(
        "Loaded translator from '{}' (latent_dim = {}, epochs = {})",
        model_fpath.display(),
        translator.latent_dim(),
        config
            .current_epoch
            .map_or_else(|| "unknown".to_string(), |x| x.to_string())
    );
    Ok((translator, config))
}

pub fn from_json(json: &str) -> Result<(CharacterTranslator, ExtractedModelConfig)> {
    let (snapshot, config) = extract_config(json)?;
    let translator = CharacterTranslator::from_snapshot(&snapshot)
        .context("failed to rebuild translator from snapshot state")?;

    Ok((translator, config))
}

fn extract_config(json: &str) -> Result<(String, ExtractedModelConfig)> {
    let mut snapshot: Value = serde_json::from_str(json).context("model file is not valid json")?;

    let (config, state) = match &mut snapshot {
        Value::Object(fields) => (
            fields.remove("_trainer_config"),
            fields.remove("_trainer_state"),
        ),
        _ => (None, None),
    };

    let mut extracted: ExtractedModelConfig = match config {
        Some(config) => serde_json::from_value(config)
            .context("unable to extract trainer config from saved model")?,
        None => ExtractedModelConfig::default(),
    };
    extracted.current_epoch = state
        .as_ref()
        .and_then(|state| state["current_epoch"].as_u64())
        .map(|x| x as usize);

    let snapshot = serde_json::to_string(&snapshot)?;
    Ok((snapshot, extracted))
}

pub fn read_dataset_pairs<P: AsRef<Path>>(input_txt_path: P, count: usize) -> Result<Vec<PhrasePair>> {
    let input_txt_path = input_txt_path.as_ref();
    let text = std::fs::read_to_string(input_txt_path)
        .with_context(|| format!("failed to read phrase pairs from {}", input_txt_path.display()))?;
    parse_pairs(&text, count)
}

/// Finds the model in the same directory as `curr_fpath` with the highest trained epoch.
pub fn latest_model_in_dir(curr_fpath: &Path) -> Result<Option<PathBuf>> {
    let model_dir = match curr_fpath.parent() {
        Some(dir) if dir.as_os_str().is_empty() => Path::new("."),
        Some(dir) => dir,
        None => return Ok(None),
    };

    let epoch_models: Vec<(usize, PathBuf)> = model_dir
        .read_dir()
        .with_context(|| format!("failed to open model dir {}", model_dir.display()))?
        .flatten()
        .filter_map(|f| {
            let epoch = f
                .file_name()
                .to_string_lossy()
                .split_once("model-e")
                .and_then(|split| split.1.split('-').next())
                .and_then(|epoch_str| epoch_str.parse::<usize>().ok())?;
            Some((epoch, f.path()))
        })
        .collect();

    Ok(epoch_models
        .into_iter()
        .max_by_key(|(epoch, _)| *epoch)
        .map(|(_, fpath)| fpath))
}

#[cfg(test)]
mod tests {
    use plane::ml::{
        corpus::TranslationCorpus, seq2seq::translator::TranslatorBuilder, RngStrategy,
    };

    use super::*;

    const PHRASES: &str = "Go.\tVa !\nHi.\tSalut !\nRun!\tCours !\n";

    fn new_translator() -> CharacterTranslator {
        let corpus = TranslationCorpus::from_text(PHRASES, 10).unwrap();
        TranslatorBuilder::for_corpus(&corpus)
            .with_latent_dim(6)
            .with_rng(RngStrategy::testable(1234))
            .build()
            .unwrap()
    }

    fn scratch_dir(name: &str) -> PathBuf {
        let dir =
            std::env::temp_dir().join(format!("charseq_translate_{name}_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test_log::test]
    fn can_load_model_with_trainer_metadata() {
        let translator = new_translator();
        let mut json: Value = serde_json::from_str(&translator.snapshot().unwrap()).unwrap();
        json["_trainer_config"] = serde_json::json!({
            "input_txt_path": "fra.txt",
            "num_samples": 10000,
            "latent_dim": 6,
            "solver": "rmsprop"
        });
        json["_trainer_state"] = serde_json::json!({ "current_epoch": 42 });

        let (loaded, config) = from_json(&json.to_string()).unwrap();
        assert_eq!(translator, loaded);
        assert_eq!(Some("fra.txt".to_string()), config.input_txt_path);
        assert_eq!(Some(10000), config.num_samples);
        assert_eq!(Some(42), config.current_epoch);
    }

    #[test]
    fn can_load_bare_snapshot() {
        let translator = new_translator();
        let (loaded, config) = from_json(&translator.snapshot_pretty().unwrap()).unwrap();

        assert_eq!(translator, loaded);
        assert_eq!(ExtractedModelConfig::default(), config);
        assert_eq!(
            translator.decode_sequence("Hi.").unwrap(),
            loaded.decode_sequence("Hi.").unwrap()
        );
    }

    #[test_log::test]
    fn load_reports_invalid_model_files() {
        let dir = scratch_dir("invalid");
        let fpath = dir.join("model-e1-0pct.json");
        std::fs::write(&fpath, "not json").unwrap();

        assert!(load(&fpath).is_err());
        assert!(load(dir.join("missing.json")).is_err());
        assert!(from_json("{\"encoder\": 1}").is_err());

        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn can_find_latest_model_in_dir() {
        let dir = scratch_dir("latest");
        for fname in ["model-e5-20pct.json", "model-e40-75pct.json", "model-e9-30pct.json", "notes.txt"] {
            std::fs::write(dir.join(fname), "{}").unwrap();
        }

        let latest = latest_model_in_dir(&dir.join("model-e5-20pct.json")).unwrap();
        assert_eq!(Some(dir.join("model-e40-75pct.json")), latest);

        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn can_read_dataset_pairs() {
        let dir = scratch_dir("dataset");
        let fpath = dir.join("fra.txt");
        std::fs::write(&fpath, PHRASES).unwrap();

        let pairs = read_dataset_pairs(&fpath, 2).unwrap();
        assert_eq!(2, pairs.len());
        assert_eq!("Salut !", pairs[1].target_phrase());

        std::fs::remove_dir_all(dir).unwrap();
    }
}
