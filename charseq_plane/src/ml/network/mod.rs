use serde::{Deserialize, Serialize};

pub use layer::{LayerValues, NodeValue};

pub mod dense;
pub mod layer;
pub mod linear;
pub mod lstm;
pub mod params;
pub mod solver;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum NetworkActivationMode {
    Linear,
    #[serde(alias = "SoftMax")]
    SoftMaxCrossEntropy,
    Sigmoid,
    Tanh,
}

impl std::fmt::Display for NetworkActivationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let json = serde_json::to_string(&self).map_err(|_| std::fmt::Error)?;
        let json = json.trim_matches('"');
        write!(f, "{}", json)
    }
}

impl NetworkActivationMode {
    pub fn apply(&self, output: &LayerValues) -> LayerValues {
        match self {
            NetworkActivationMode::Linear => output.clone(),
            NetworkActivationMode::SoftMaxCrossEntropy => {
                let max = output
                    .iter()
                    .copied()
                    .max_by(|x, y| x.partial_cmp(y).unwrap_or(std::cmp::Ordering::Equal))
                    .unwrap_or_default();

                let exp_iter = output.iter().map(|x| (x - max).exp());
                let sum: NodeValue = exp_iter.clone().sum();
                LayerValues::new(exp_iter.map(|x| x / sum).collect())
            }
            NetworkActivationMode::Sigmoid => output.iter().map(|x| sigmoid(*x)).collect(),
            NetworkActivationMode::Tanh => output.iter().map(|x| x.tanh()).collect(),
        }
    }

    /// Derivative expressed through the activated values.
    ///
    /// Softmax passes gradients through unchanged, as its caller already
    /// supplies `probabilities - one_hot(target)`.
    pub fn derivative(&self, activation: &LayerValues) -> LayerValues {
        match self {
            NetworkActivationMode::Linear | NetworkActivationMode::SoftMaxCrossEntropy => {
                activation.iter().map(|_| 1.0).collect()
            }
            NetworkActivationMode::Sigmoid => activation.iter().map(|x| x * (1.0 - x)).collect(),
            NetworkActivationMode::Tanh => activation.iter().map(|x| 1.0 - x.powi(2)).collect(),
        }
    }

    pub fn is_softmax(&self) -> bool {
        matches!(self, NetworkActivationMode::SoftMaxCrossEntropy)
    }
}

impl Default for NetworkActivationMode {
    fn default() -> Self {
        Self::SoftMaxCrossEntropy
    }
}

pub fn sigmoid(x: NodeValue) -> NodeValue {
    1.0 / (1.0 + (-x).exp())
}
