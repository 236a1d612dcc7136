use std::ops::{Deref, DerefMut};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::ml::{RngStrategy, RNG};

pub type NodeValue = f64;

/// Smallest probability fed into a log-loss, keeps the loss finite on a confident miss.
pub const PROBABILITY_EPSILON: NodeValue = 1e-7;

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerValues(Vec<NodeValue>);

impl<T> From<T> for LayerValues
where
    T: AsRef<[NodeValue]>,
{
    fn from(value: T) -> Self {
        Self(value.as_ref().to_vec())
    }
}

impl FromIterator<NodeValue> for LayerValues {
    fn from_iter<T: IntoIterator<Item = NodeValue>>(iter: T) -> Self {
        LayerValues(iter.into_iter().collect())
    }
}

impl Deref for LayerValues {
    type Target = Vec<NodeValue>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for LayerValues {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl LayerValues {
    pub fn new(inner: Vec<NodeValue>) -> Self {
        Self(inner)
    }
    pub fn one_hot(len: usize, idx: usize) -> Self {
        (0..len).map(|i| if i == idx { 1.0 } else { 0.0 }).collect()
    }
    pub fn ave(&self) -> NodeValue {
        if !self.is_empty() {
            self.iter().sum::<NodeValue>() / self.len() as NodeValue
        } else {
            0.0
        }
    }
    pub fn position_max(&self) -> Option<usize> {
        itertools::Itertools::position_max_by(self.iter(), |x, y| {
            x.partial_cmp(y).unwrap_or(std::cmp::Ordering::Equal)
        })
    }

    /// Negative log-likelihood of `target_idx` under these probabilities.
    pub fn cross_entropy_error(&self, target_idx: usize) -> Result<NodeValue> {
        let probability = self.get(target_idx).ok_or_else(|| {
            anyhow!(
                "target index {target_idx} out of range for {} probabilities",
                self.len()
            )
        })?;

        Ok(-probability.max(PROBABILITY_EPSILON).ln())
    }

    /// Gradient of [`cross_entropy_error`] with respect to the softmax logits.
    ///
    /// Zero once the target probability drops below [`PROBABILITY_EPSILON`], where the
    /// clamped loss is flat.
    ///
    /// [`cross_entropy_error`]: LayerValues::cross_entropy_error
    pub fn cross_entropy_error_d(&self, target_idx: usize) -> Result<LayerValues> {
        let probability = self.get(target_idx).ok_or_else(|| {
            anyhow!(
                "target index {target_idx} out of range for {} probabilities",
                self.len()
            )
        })?;

        if *probability < PROBABILITY_EPSILON {
            return Ok(LayerValues::new(vec![0.0; self.len()]));
        }

        Ok(self
            .iter()
            .enumerate()
            .map(|(i, p)| if i == target_idx { p - 1.0 } else { *p })
            .collect())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum LayerInitStrategy {
    GlorotUniform,
    Kaiming,
    KaimingZeroBias,
}

impl Default for LayerInitStrategy {
    fn default() -> Self {
        Self::GlorotUniform
    }
}

impl LayerInitStrategy {
    pub fn apply<'a>(
        &self,
        weights: impl Iterator<Item = &'a mut NodeValue>,
        bias: impl Iterator<Item = &'a mut NodeValue>,
        inputs_count: usize,
        outputs_count: usize,
        rng: &RngStrategy,
    ) {
        use LayerInitStrategy::*;

        match self {
            GlorotUniform => {
                let limit = (6.0 / (inputs_count + outputs_count).max(1) as NodeValue).sqrt();
                for value in weights {
                    *value = Self::full_rand(rng) * limit;
                }
                for value in bias {
                    *value = 0.0;
                }
            }
            Kaiming => {
                let scale_factor = (inputs_count.max(1) as NodeValue).powf(-0.5) * 5.0 / 3.0;
                for value in weights.chain(bias) {
                    *value = rng.rand_normal(0.0, 1.0) * scale_factor;
                }
            }
            KaimingZeroBias => {
                let scale_factor = (inputs_count.max(1) as NodeValue).powf(-0.5) * 5.0 / 3.0;
                for value in weights {
                    *value = rng.rand_normal(0.0, 1.0) * scale_factor;
                }
                for value in bias {
                    *value = 0.0;
                }
            }
        }
    }

    fn full_rand(rng: &dyn RNG) -> NodeValue {
        (rng.rand() * 2.0) - 1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn can_compute_cross_entropy_and_gradient() {
        let probabilities = LayerValues::new(vec![0.25, 0.5, 0.25]);

        let loss = probabilities.cross_entropy_error(1).unwrap();
        assert!((loss - 0.5_f64.ln().abs()).abs() < 1e-12);

        let grads = probabilities.cross_entropy_error_d(1).unwrap();
        assert_eq!(LayerValues::new(vec![0.25, -0.5, 0.25]), grads);

        assert!(probabilities.cross_entropy_error(3).is_err());
        assert!(probabilities.cross_entropy_error_d(3).is_err());
    }

    #[test]
    fn cross_entropy_is_finite_on_zero_probability() {
        let probabilities = LayerValues::new(vec![1.0, 0.0]);
        let loss = probabilities.cross_entropy_error(1).unwrap();
        assert!(loss.is_finite());
        assert!(loss > 10.0);
    }

    #[test]
    fn cross_entropy_gradient_follows_clamped_loss() {
        let tiny = PROBABILITY_EPSILON / 10.0;
        let clamped = LayerValues::new(vec![1.0 - tiny, tiny]);
        let flatter = LayerValues::new(vec![1.0 - tiny / 2.0, tiny / 2.0]);
        assert_eq!(
            clamped.cross_entropy_error(1).unwrap(),
            flatter.cross_entropy_error(1).unwrap()
        );
        assert_eq!(
            LayerValues::new(vec![0.0, 0.0]),
            clamped.cross_entropy_error_d(1).unwrap()
        );

        let unclamped = LayerValues::new(vec![0.75, 0.25]);
        assert_eq!(
            LayerValues::new(vec![0.75, -0.75]),
            unclamped.cross_entropy_error_d(1).unwrap()
        );
    }

    #[test]
    fn can_locate_position_max() {
        let values = LayerValues::new(vec![0.1, 0.7, 0.2]);
        assert_eq!(Some(1), values.position_max());
        assert_eq!(None, LayerValues::default().position_max());
        assert_eq!(LayerValues::new(vec![0.0, 0.0, 1.0]), LayerValues::one_hot(3, 2));
    }

    #[test]
    fn glorot_uniform_is_bounded_with_zero_bias() {
        let rng = RngStrategy::testable(12345);
        let mut weights = vec![0.0; 24 * 32];
        let mut bias = vec![1.0; 32];
        LayerInitStrategy::GlorotUniform.apply(weights.iter_mut(), bias.iter_mut(), 24, 32, &rng);

        let limit = (6.0_f64 / 56.0).sqrt();
        assert!(weights.iter().all(|x| x.abs() <= limit));
        assert!(weights.iter().any(|x| *x != 0.0));
        assert!(bias.iter().all(|x| *x == 0.0));
    }
}
