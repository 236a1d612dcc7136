use std::{fmt, path::Path};

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::ml::{linear::Linear, vocab::CharVocab};

pub const START_TOKEN: char = '\t';
pub const END_TOKEN: char = '\n';
pub const PAD_TOKEN: char = ' ';

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhrasePair {
    pub input: String,
    /// stored as `START_TOKEN + phrase + END_TOKEN`
    pub target: String,
}

impl PhrasePair {
    pub fn new(input: &str, target: &str) -> Self {
        Self {
            input: input.to_string(),
            target: format!("{START_TOKEN}{target}{END_TOKEN}"),
        }
    }

    /// target phrase without its start and end tokens
    pub fn target_phrase(&self) -> &str {
        self.target
            .strip_prefix(START_TOKEN)
            .and_then(|x| x.strip_suffix(END_TOKEN))
            .unwrap_or(&self.target)
    }
}

/// One teacher-forcing example.
///
/// `decoder_target[t]` is the index of the character the decoder should emit after
/// reading row `t` of `decoder_input`. Positions past the phrase hold the padding
/// index and are scored like any other position.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSample {
    pub encoder_input: Linear,
    pub decoder_input: Linear,
    pub decoder_target: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TranslationCorpus {
    pairs: Vec<PhrasePair>,
    input_vocab: CharVocab,
    target_vocab: CharVocab,
    max_encoder_seq_len: usize,
    max_decoder_seq_len: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CorpusSummary {
    pub samples: usize,
    pub input_tokens: usize,
    pub target_tokens: usize,
    pub max_encoder_seq_len: usize,
    pub max_decoder_seq_len: usize,
}

impl fmt::Display for CorpusSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "samples = {}, unique input tokens = {}, unique output tokens = {}, \
             max input seq len = {}, max output seq len = {}",
            self.samples,
            self.input_tokens,
            self.target_tokens,
            self.max_encoder_seq_len,
            self.max_decoder_seq_len
        )
    }
}

/// Reads at most `num_samples` tab-separated pairs, ignoring columns past the second.
pub fn parse_pairs(text: &str, num_samples: usize) -> Result<Vec<PhrasePair>> {
    let mut pairs = vec![];

    for (line_idx, line) in text.lines().enumerate() {
        if pairs.len() >= num_samples {
            break;
        }
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }

        let mut columns = line.split('\t');
        let (input, target) = match (columns.next(), columns.next()) {
            (Some(input), Some(target)) => (input, target),
            _ => bail!(
                "line {}: expected tab-separated input and target phrases",
                line_idx + 1
            ),
        };

        pairs.push(PhrasePair::new(input, target));
    }

    Ok(pairs)
}

impl TranslationCorpus {
    pub fn from_pairs(pairs: Vec<PhrasePair>) -> Result<Self> {
        if pairs.is_empty() {
            bail!("corpus contains no phrase pairs");
        }

        let input_vocab = CharVocab::from_chars(
            pairs
                .iter()
                .flat_map(|pair| pair.input.chars())
                .chain([PAD_TOKEN]),
        );
        let target_vocab = CharVocab::from_chars(
            pairs
                .iter()
                .flat_map(|pair| pair.target.chars())
                .chain([PAD_TOKEN]),
        );

        let max_encoder_seq_len = pairs
            .iter()
            .map(|pair| pair.input.chars().count())
            .max()
            .unwrap_or_default();
        let max_decoder_seq_len = pairs
            .iter()
            .map(|pair| pair.target.chars().count())
            .max()
            .unwrap_or_default();

        Ok(Self {
            pairs,
            input_vocab,
            target_vocab,
            max_encoder_seq_len,
            max_decoder_seq_len,
        })
    }

    pub fn from_text(text: &str, num_samples: usize) -> Result<Self> {
        Self::from_pairs(parse_pairs(text, num_samples)?)
    }

    #[instrument(level = "info", skip_all, fields(path = %path.as_ref().display()))]
    pub fn read_from_file<P: AsRef<Path>>(path: P, num_samples: usize) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read phrase pairs from {}", path.display()))?;
        debug!("read {} bytes of phrase pairs", text.len());

        Self::from_text(&text, num_samples)
            .with_context(|| format!("failed to parse phrase pairs from {}", path.display()))
    }

    pub fn to_training_sample(&self, pair: &PhrasePair) -> Result<TrainingSample> {
        let encoder_input =
            self.input_vocab
                .encode_one_hot(&pair.input, self.max_encoder_seq_len, PAD_TOKEN)?;
        let decoder_input =
            self.target_vocab
                .encode_one_hot(&pair.target, self.max_decoder_seq_len, PAD_TOKEN)?;

        let pad_idx = self.target_vocab.token_encode(PAD_TOKEN)?;
        let target_tokens: Vec<usize> = pair
            .target
            .chars()
            .skip(1)
            .map(|c| self.target_vocab.token_encode(c))
            .collect::<Result<_>>()?;

        let decoder_target = (0..self.max_decoder_seq_len)
            .map(|t| target_tokens.get(t).copied().unwrap_or(pad_idx))
            .collect();

        Ok(TrainingSample {
            encoder_input,
            decoder_input,
            decoder_target,
        })
    }

    #[instrument(level = "info", skip_all)]
    pub fn training_samples(&self) -> Result<Vec<TrainingSample>> {
        self.pairs
            .iter()
            .map(|pair| self.to_training_sample(pair))
            .collect()
    }

    /// Returns `(training, validation)` where validation is the trailing
    /// `floor(len * fraction)` samples, in corpus order.
    pub fn split_validation(
        &self,
        fraction: f64,
    ) -> Result<(Vec<TrainingSample>, Vec<TrainingSample>)> {
        let validation_count = self.validation_count(fraction)?;
        let mut training = self.training_samples()?;
        let validation = training.split_off(training.len() - validation_count);
        Ok((training, validation))
    }

    fn validation_count(&self, fraction: f64) -> Result<usize> {
        if !(0.0..1.0).contains(&fraction) {
            return Err(anyhow!(
                "validation split must be within [0, 1), got {fraction}"
            ));
        }
        Ok((self.pairs.len() as f64 * fraction).floor() as usize)
    }

    pub fn summary(&self) -> CorpusSummary {
        CorpusSummary {
            samples: self.pairs.len(),
            input_tokens: self.input_vocab.len(),
            target_tokens: self.target_vocab.len(),
            max_encoder_seq_len: self.max_encoder_seq_len,
            max_decoder_seq_len: self.max_decoder_seq_len,
        }
    }

    pub fn pairs(&self) -> &[PhrasePair] {
        &self.pairs
    }

    pub fn input_vocab(&self) -> &CharVocab {
        &self.input_vocab
    }

    pub fn target_vocab(&self) -> &CharVocab {
        &self.target_vocab
    }

    pub fn max_encoder_seq_len(&self) -> usize {
        self.max_encoder_seq_len
    }

    pub fn max_decoder_seq_len(&self) -> usize {
        self.max_decoder_seq_len
    }
}
