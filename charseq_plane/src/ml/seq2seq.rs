pub mod translator {
    use std::ops::Deref;

    use anyhow::{bail, Context, Result};
    use itertools::Itertools;
    use serde::{Deserialize, Serialize};
    use tracing::{instrument, warn};

    use crate::ml::{
        corpus::{TrainingSample, END_TOKEN, PAD_TOKEN, START_TOKEN},
        dense::Dense,
        linear::Linear,
        lstm::{Lstm, LstmForward, LstmState},
        solver::source::OptimizerSource,
        vocab::CharVocab,
        LayerValues, NodeValue,
    };

    pub use builder::TranslatorBuilder;

    /// Encoder/decoder LSTM pair with a time-distributed softmax output.
    ///
    /// The decoder is seeded with the encoder's final `(h, c)`. During training it
    /// reads the shifted target sequence; at inference it reads its own argmax output.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct CharacterTranslator {
        encoder: Lstm,
        decoder: Lstm,
        output: Dense,
        input_vocab: CharVocab,
        target_vocab: CharVocab,
        max_encoder_seq_len: usize,
        max_decoder_seq_len: usize,
        latent_dim: usize,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
    pub struct TrainEvaluation {
        pub loss: NodeValue,
        /// fraction of target positions whose argmax matches
        pub accuracy: NodeValue,
    }

    struct SampleForward {
        encoder: LstmForward,
        decoder: LstmForward,
        probabilities: Linear,
    }

    struct SampleScore {
        loss: NodeValue,
        correct: usize,
        counted: usize,
    }

    impl SampleScore {
        fn aggregate(scores: &[SampleScore]) -> TrainEvaluation {
            let loss: LayerValues = scores.iter().map(|score| score.loss).collect();
            let correct: usize = scores.iter().map(|score| score.correct).sum();
            let counted: usize = scores.iter().map(|score| score.counted).sum();
            let accuracy = if counted > 0 {
                correct as NodeValue / counted as NodeValue
            } else {
                0.0
            };

            TrainEvaluation {
                loss: loss.ave(),
                accuracy,
            }
        }
    }

    impl CharacterTranslator {
        pub fn snapshot(&self) -> Result<String> {
            Ok(serde_json::to_string(self)?)
        }

        pub fn snapshot_pretty(&self) -> Result<String> {
            Ok(serde_json::to_string_pretty(self)?)
        }

        pub fn from_snapshot(json: &str) -> Result<Self> {
            serde_json::from_str(json).context("failed to parse translator snapshot")
        }

        /// Runs one optimisation step over `samples` and returns their mean loss
        /// measured before the update.
        pub fn train<T: Deref<Target = O>, O: OptimizerSource>(
            &mut self,
            samples: &[TrainingSample],
            optimizer: T,
        ) -> Result<NodeValue> {
            Ok(self.train_evaluated(samples, optimizer)?.loss)
        }

        /// Same as [`CharacterTranslator::train`], also reporting the pre-update accuracy.
        #[instrument(level = "info", name = "translator_train", skip_all)]
        pub fn train_evaluated<T: Deref<Target = O>, O: OptimizerSource>(
            &mut self,
            samples: &[TrainingSample],
            optimizer: T,
        ) -> Result<TrainEvaluation> {
            if samples.is_empty() {
                bail!("can not train on an empty batch");
            }
            let batch_len = samples.len() as NodeValue;

            #[cfg(feature = "threadpool")]
            use rayon::prelude::*;

            let samples_iter = {
                #[cfg(feature = "threadpool")]
                {
                    samples.par_iter()
                }
                #[cfg(not(feature = "threadpool"))]
                {
                    samples.iter()
                }
            };
            let scores = samples_iter
                .map(|sample| self.backward_sample(sample, batch_len))
                .collect::<Result<Vec<SampleScore>>>();

            // queued gradients are dropped when any part of the batch fails
            let scores = match scores {
                Ok(scores) => scores,
                Err(e) => {
                    self.discard_gradients()?;
                    return Err(e);
                }
            };

            let evaluation = SampleScore::aggregate(&scores);
            if !evaluation.loss.is_finite() {
                self.discard_gradients()?;
                bail!("training loss is not finite: {}", evaluation.loss);
            }

            if let Err(e) = self.apply_gradients(&*optimizer) {
                self.discard_gradients()?;
                return Err(e);
            }

            Ok(evaluation)
        }

        fn apply_gradients<O: OptimizerSource>(&mut self, optimizer: &O) -> Result<()> {
            self.output.apply_gradients(optimizer, "output")?;
            self.decoder.apply_gradients(optimizer, "decoder")?;
            self.encoder.apply_gradients(optimizer, "encoder")
        }

        fn discard_gradients(&self) -> Result<()> {
            self.output.discard_gradients()?;
            self.decoder.discard_gradients()?;
            self.encoder.discard_gradients()
        }

        /// Mean loss and per-position argmax accuracy, without touching any gradients.
        #[instrument(level = "info", skip_all)]
        pub fn evaluate(&self, samples: &[TrainingSample]) -> Result<TrainEvaluation> {
            if samples.is_empty() {
                bail!("can not evaluate an empty sample set");
            }

            #[cfg(feature = "threadpool")]
            use rayon::prelude::*;

            let samples_iter = {
                #[cfg(feature = "threadpool")]
                {
                    samples.par_iter()
                }
                #[cfg(not(feature = "threadpool"))]
                {
                    samples.iter()
                }
            };
            let scores = samples_iter
                .map(|sample| {
                    let forward = self.forward_sample(sample)?;
                    self.score(&forward.probabilities, &sample.decoder_target)
                })
                .collect::<Result<Vec<SampleScore>>>()?;

            Ok(SampleScore::aggregate(&scores))
        }

        fn forward_sample(&self, sample: &TrainingSample) -> Result<SampleForward> {
            let initial_state = LstmState::zero(self.latent_dim);
            let encoder = self
                .encoder
                .forward(&sample.encoder_input, &initial_state)
                .context("encoder forward pass failed")?;
            let decoder = self
                .decoder
                .forward(&sample.decoder_input, &encoder.final_state)
                .context("decoder forward pass failed")?;
            let probabilities = self.output.forward(&decoder.outputs)?;

            Ok(SampleForward {
                encoder,
                decoder,
                probabilities,
            })
        }

        fn score(&self, probabilities: &Linear, targets: &[usize]) -> Result<SampleScore> {
            if targets.len() != probabilities.count() {
                bail!(
                    "decoder target has {} positions, expected {}",
                    targets.len(),
                    probabilities.count()
                );
            }

            let mut losses = Vec::with_capacity(targets.len());
            let mut correct = 0;

            for (row, &target_idx) in probabilities.rows_iter().zip_eq(targets) {
                let row = LayerValues::from(row);
                losses.push(row.cross_entropy_error(target_idx)?);
                if row.position_max() == Some(target_idx) {
                    correct += 1;
                }
            }

            Ok(SampleScore {
                loss: LayerValues::new(losses).ave(),
                correct,
                counted: targets.len(),
            })
        }

        /// Queues this sample's share of the batch gradients.
        fn backward_sample(
            &self,
            sample: &TrainingSample,
            batch_len: NodeValue,
        ) -> Result<SampleScore> {
            let forward = self.forward_sample(sample)?;
            let targets = &sample.decoder_target;
            let score = self.score(&forward.probabilities, targets)?;
            let scale = 1.0 / (score.counted as NodeValue * batch_len);

            let mut output_gradients = Linear::with_dimensions(&forward.probabilities);
            for ((row, &target_idx), gradients) in forward
                .probabilities
                .rows_iter()
                .zip(targets)
                .zip(output_gradients.rows_iter_mut())
            {
                let dlogits = LayerValues::from(row).cross_entropy_error_d(target_idx)?;
                gradients
                    .iter_mut()
                    .zip(dlogits.iter())
                    .for_each(|(x, d)| *x = d * scale);
            }

            let decoder_output_gradients = self
                .output
                .backward(&forward.decoder.outputs, &output_gradients)?;

            let (_, encoder_state_gradients) = self.decoder.backward(
                &sample.decoder_input,
                &forward.decoder,
                &decoder_output_gradients,
                &LstmState::zero(self.latent_dim),
            )?;

            // only the encoder's final state reaches the loss
            let encoder_output_gradients =
                Linear::new(sample.encoder_input.count(), self.latent_dim);
            self.encoder.backward(
                &sample.encoder_input,
                &forward.encoder,
                &encoder_output_gradients,
                &encoder_state_gradients,
            )?;

            Ok(score)
        }

        /// Encodes `text` into the state that seeds the decoder.
        pub fn encode(&self, text: &str) -> Result<LstmState> {
            let char_count = text.chars().count();
            let text: String = if char_count > self.max_encoder_seq_len {
                warn!(
                    "input of {char_count} characters truncated to {}",
                    self.max_encoder_seq_len
                );
                text.chars().take(self.max_encoder_seq_len).collect()
            } else {
                text.to_string()
            };

            let inputs =
                self.input_vocab
                    .encode_one_hot(&text, self.max_encoder_seq_len, PAD_TOKEN)?;
            let encoded = self
                .encoder
                .forward(&inputs, &LstmState::zero(self.latent_dim))?;

            Ok(encoded.final_state)
        }

        /// Feeds one target token through the decoder, returning the next-token
        /// probabilities and the advanced state.
        pub fn decode_step(
            &self,
            token_idx: usize,
            state: &LstmState,
        ) -> Result<(LayerValues, LstmState)> {
            let state = self.decoder.step_token(token_idx, state)?;
            let probabilities = self.output.forward_row(state.hidden.as_slice())?;
            Ok((probabilities, state))
        }

        pub fn decode_sequence(&self, text: &str) -> Result<String> {
            self.translate_iter(text)?.collect()
        }

        /// Greedy decode, yielding characters until the end token or the length bound.
        pub fn translate_iter<'a>(
            &'a self,
            text: &str,
        ) -> Result<impl Iterator<Item = Result<char>> + 'a> {
            let mut state = self.encode(text)?;
            let mut curr_token = self.target_vocab.token_encode(START_TOKEN)?;
            let mut decoded_len = 0;
            let mut finished = false;

            Ok(std::iter::from_fn(move || {
                if finished || decoded_len >= self.max_decoder_seq_len {
                    return None;
                }

                match self.predict_next(curr_token, &state) {
                    Ok((_, END_TOKEN, _)) => {
                        finished = true;
                        None
                    }
                    Ok((token_idx, token, next_state)) => {
                        curr_token = token_idx;
                        state = next_state;
                        decoded_len += 1;
                        Some(Ok(token))
                    }
                    Err(e) => {
                        finished = true;
                        Some(Err(e))
                    }
                }
            }))
        }

        fn predict_next(
            &self,
            token_idx: usize,
            state: &LstmState,
        ) -> Result<(usize, char, LstmState)> {
            let (probabilities, state) = self.decode_step(token_idx, state)?;
            let arg_max_idx = probabilities
                .position_max()
                .context("failed to perform argmax on probabilities")?;
            let token = self
                .target_vocab
                .token_decode(arg_max_idx)
                .context("sampled token should be in vocab dict")?;

            Ok((arg_max_idx, token, state))
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

        pub fn latent_dim(&self) -> usize {
            self.latent_dim
        }
    }

    pub mod builder {
        use anyhow::{bail, Result};

        use crate::ml::{
            corpus::{TranslationCorpus, END_TOKEN, START_TOKEN},
            dense::Dense,
            layer::LayerInitStrategy,
            lstm::Lstm,
            vocab::CharVocab,
            NetworkActivationMode, RngStrategy,
        };

        use super::CharacterTranslator;

        #[derive(Debug, Clone)]
        pub struct TranslatorBuilder {
            input_vocab: CharVocab,
            target_vocab: CharVocab,
            max_encoder_seq_len: usize,
            max_decoder_seq_len: usize,
            latent_dim: usize,
            init_strategy: LayerInitStrategy,
            rng: RngStrategy,
        }

        impl TranslatorBuilder {
            pub fn new(
                input_vocab: CharVocab,
                target_vocab: CharVocab,
                max_encoder_seq_len: usize,
                max_decoder_seq_len: usize,
            ) -> Self {
                Self {
                    input_vocab,
                    target_vocab,
                    max_encoder_seq_len,
                    max_decoder_seq_len,
                    latent_dim: 256,
                    init_strategy: LayerInitStrategy::GlorotUniform,
                    rng: RngStrategy::default(),
                }
            }

            pub fn for_corpus(corpus: &TranslationCorpus) -> Self {
                Self::new(
                    corpus.input_vocab().clone(),
                    corpus.target_vocab().clone(),
                    corpus.max_encoder_seq_len(),
                    corpus.max_decoder_seq_len(),
                )
            }

            pub fn with_latent_dim(mut self, latent_dim: usize) -> Self {
                self.latent_dim = latent_dim;
                self
            }

            pub fn with_init_strategy(mut self, init_strategy: LayerInitStrategy) -> Self {
                self.init_strategy = init_strategy;
                self
            }

            pub fn with_rng(mut self, rng: RngStrategy) -> Self {
                self.rng = rng;
                self
            }

            pub fn latent_dim(&self) -> usize {
                self.latent_dim
            }

            pub fn build(self) -> Result<CharacterTranslator> {
                if self.latent_dim == 0 {
                    bail!("latent dimension must be non-zero");
                }
                if self.input_vocab.is_empty() {
                    bail!("input vocabulary is empty");
                }
                if self.max_decoder_seq_len == 0 {
                    bail!("maximum decoder sequence length must be non-zero");
                }
                for token in [START_TOKEN, END_TOKEN] {
                    if !self.target_vocab.contains(token) {
                        bail!("target vocabulary is missing control token {token:?}");
                    }
                }

                let rng = self.rng.upgrade();
                let strategy = &self.init_strategy;
                let encoder = Lstm::new(self.input_vocab.len(), self.latent_dim, strategy, &rng);
                let decoder = Lstm::new(self.target_vocab.len(), self.latent_dim, strategy, &rng);
                let mut output = Dense::new(self.latent_dim, self.target_vocab.len(), strategy, &rng);
                output.set_activation(NetworkActivationMode::SoftMaxCrossEntropy);

                Ok(CharacterTranslator {
                    encoder,
                    decoder,
                    output,
                    input_vocab: self.input_vocab,
                    target_vocab: self.target_vocab,
                    max_encoder_seq_len: self.max_encoder_seq_len,
                    max_decoder_seq_len: self.max_decoder_seq_len,
                    latent_dim: self.latent_dim,
                })
            }
        }
    }

}
