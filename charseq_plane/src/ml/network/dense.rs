use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::ml::{
    layer::LayerInitStrategy, LayerValues, NetworkActivationMode, NodeValue, RngStrategy,
};

use super::{
    linear::Linear,
    params::{
        keys::{DenseBias, DenseWeight},
        ParameterStore, TrainableLinear, TrainableParameter,
    },
    solver::source::OptimizerSource,
};

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct Dense {
    weights: TrainableLinear,
    bias: TrainableLinear,
    activation: Option<NetworkActivationMode>,
    inputs_count: usize,
}

impl Dense {
    pub fn new(
        inputs_count: usize,
        outputs_count: usize,
        strategy: &LayerInitStrategy,
        rng: &RngStrategy,
    ) -> Self {
        let mut weights = Linear::new(inputs_count, outputs_count);
        weights.initialize_as_layer(strategy, rng);

        let mut bias = Linear::new(1, outputs_count);
        bias.initialize_as_layer_bias(strategy, rng);

        Self {
            weights: weights.into(),
            bias: bias.into(),
            activation: None,
            inputs_count,
        }
    }

    pub fn forward_row(&self, inputs: &[NodeValue]) -> Result<LayerValues> {
        let inputs = Linear::from_row(inputs);
        let outputs = self.forward(&inputs)?;
        outputs.as_single_stride()
    }

    pub fn forward(&self, inputs: &Linear) -> Result<Linear> {
        let mut weighted_inputs = self.compute_weighted_inputs(inputs)?;

        if let Some(activation) = &self.activation {
            weighted_inputs.rows_iter_mut().for_each(|row| {
                let activation_row = activation.apply(&row.into());
                row.clone_from_slice(&activation_row)
            });
        }

        Ok(weighted_inputs)
    }

    fn compute_weighted_inputs(&self, inputs: &Linear) -> Result<Linear> {
        if inputs.stride() != self.inputs_count {
            Err(anyhow!(
                "mismatched input vector size: expected {}, got {}",
                self.inputs_count,
                inputs.stride()
            ))?;
        }

        // -> output = inputs * weights + bias
        let output = inputs.matrix_product(self.weights.value());
        let bias = self.bias.iter().stack(inputs.count());
        Ok(output.iter().add(bias).collect())
    }

    /// Queues kernel and bias gradients and returns the input gradients.
    ///
    /// With a softmax activation `output_gradients` are taken as logit gradients.
    pub fn backward(&self, inputs: &Linear, output_gradients: &Linear) -> Result<Linear> {
        let weighted_inputs_gradients = match &self.activation {
            Some(activation) if !activation.is_softmax() => {
                let mut activated = self.forward(inputs)?;
                activated
                    .rows_iter_mut()
                    .zip(output_gradients.rows_iter())
                    .for_each(|(x, grads)| {
                        let derivative = activation.derivative(&(&*x).into());
                        derivative
                            .iter()
                            .zip(grads)
                            .zip(x.iter_mut())
                            .for_each(|((d, grad), x)| *x = d * grad)
                    });
                activated
            }
            _ => output_gradients.clone(),
        };

        // -> weights_gradients = inputs.T * weighted_inputs_gradients
        let weights_gradients = inputs.matrix_product_lhs_transposed(&weighted_inputs_gradients);
        let bias_gradients = weighted_inputs_gradients.iter_transpose().flatten_sum();

        self.queue_gradients(DenseWeight, weights_gradients.iter().boxed())?;
        self.queue_gradients(DenseBias, bias_gradients.iter_transpose().boxed())?;

        // -> input_gradients = weighted_inputs_gradients * weights.T
        let input_gradients =
            weighted_inputs_gradients.matrix_product_rhs_transposed(self.weights.value());

        Ok(input_gradients)
    }

    pub fn set_activation(&mut self, activation: NetworkActivationMode) {
        self.activation = Some(activation);
    }

    pub fn apply_gradients<T: OptimizerSource>(&mut self, optimizer: &T, scope: &str) -> Result<()> {
        self.apply_param_gradients(DenseWeight, optimizer, scope)?;
        self.apply_param_gradients(DenseBias, optimizer, scope)?;
        Ok(())
    }

    pub fn discard_gradients(&self) -> Result<()> {
        self.discard_param_gradients(DenseWeight)?;
        self.discard_param_gradients(DenseBias)
    }
}

impl TrainableParameter<DenseWeight> for Dense {
    fn store(&self) -> Option<ParameterStore> {
        Some(self.weights.parameters())
    }

    fn param_mut(&mut self) -> Option<&mut TrainableLinear> {
        Some(&mut self.weights)
    }
}

impl TrainableParameter<DenseBias> for Dense {
    fn store(&self) -> Option<ParameterStore> {
        Some(self.bias.parameters())
    }

    fn param_mut(&mut self) -> Option<&mut TrainableLinear> {
        Some(&mut self.bias)
    }
}

#[cfg(test)]
mod tests {
    use crate::ml::{
        network::tests::helpers::{assert_input_gradients, assert_optimisation_converges, new_linear},
        solver,
    };

    use super::*;

    #[test]
    fn dense_can_minimise() {
        let seq_len = 4;
        let embed_dim = 8;
        let output_dim = 12;
        let strategy = LayerInitStrategy::Kaiming;

        let learn_rate = 0.01;
        let total_iterations = 25;
        let optimizer = solver::SGDOptimizer::new_cache(learn_rate);

        assert_optimisation_converges(
            &move |rng| {
                let dense = Dense::new(embed_dim, output_dim, &strategy, &rng);
                let inputs = new_linear(seq_len, embed_dim, &rng);
                let target = new_linear(seq_len, output_dim, &rng);
                (dense, inputs, target)
            },
            &move |dense, inputs| dense.forward(inputs).unwrap(),
            &move |dense, inputs, dloss| {
                let grads = dense.backward(inputs, &dloss).unwrap();

                *inputs = inputs.iter().apply_gradients(grads.iter(), learn_rate);
                dense.apply_gradients(&optimizer, "dense").unwrap();
                grads
            },
            total_iterations,
        );
    }

    #[test]
    fn dense_can_compute_valid_gradients_for_simple_feed_forward() {
        computed_dloss_dinput_delta(|_| (), LayerInitStrategy::Kaiming);
    }

    #[test]
    fn dense_can_compute_valid_gradients_for_tanh_feed_forward() {
        computed_dloss_dinput_delta(
            |dense| dense.set_activation(NetworkActivationMode::Tanh),
            LayerInitStrategy::GlorotUniform,
        );
    }

    #[test]
    fn dense_can_compute_valid_gradients_for_sigmoid_feed_forward() {
        computed_dloss_dinput_delta(
            |dense| dense.set_activation(NetworkActivationMode::Sigmoid),
            LayerInitStrategy::Kaiming,
        );
    }

    #[test]
    fn dense_softmax_rows_are_probabilities() {
        let rng = RngStrategy::testable(12345);
        let mut dense = Dense::new(6, 5, &LayerInitStrategy::GlorotUniform, &rng);
        dense.set_activation(NetworkActivationMode::SoftMaxCrossEntropy);

        let inputs = new_linear(3, 6, &rng);
        let outputs = dense.forward(&inputs).unwrap();

        assert_eq!((3, 5), (outputs.count(), outputs.stride()));
        for row in outputs.rows_iter() {
            assert!((row.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn dense_rejects_mismatched_inputs() {
        let rng = RngStrategy::testable(12345);
        let dense = Dense::new(6, 5, &LayerInitStrategy::GlorotUniform, &rng);
        assert!(dense.forward(&Linear::new(2, 4)).is_err());
        assert!(dense.forward_row(&[0.0; 4]).is_err());
    }

    fn computed_dloss_dinput_delta(configure_fn: impl Fn(&mut Dense), strategy: LayerInitStrategy) {
        let seq_len = 4;
        let embed_dim = 8;
        let output_dim = 12;

        assert_input_gradients(
            &move |rng| {
                let mut dense = Dense::new(embed_dim, output_dim, &strategy, &rng);
                configure_fn(&mut dense);
                let inputs = new_linear(seq_len, embed_dim, &rng);
                let target = new_linear(seq_len, output_dim, &rng);
                (dense, inputs, target)
            },
            &move |dense, inputs| dense.forward(inputs).unwrap(),
            &move |dense, inputs, dloss| dense.backward(inputs, &dloss).unwrap(),
        );
    }
}
