use anyhow::{anyhow, Context, Result};
use itertools::izip;
use serde::{Deserialize, Serialize};

use crate::ml::{layer::LayerInitStrategy, sigmoid, LayerValues, NodeValue, RngStrategy};

use super::{
    linear::Linear,
    params::{
        keys::{LstmBias, LstmKernel, LstmRecurrentKernel},
        ParameterStore, TrainableLinear, TrainableParameter,
    },
    solver::source::OptimizerSource,
};

/// Hidden and cell vectors carried between timesteps, each `1 x units`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LstmState {
    pub hidden: Linear,
    pub cell: Linear,
}

impl LstmState {
    pub fn zero(units: usize) -> Self {
        Self {
            hidden: Linear::new(1, units),
            cell: Linear::new(1, units),
        }
    }

    fn validate(&self, units: usize) -> Result<()> {
        let expected = (1, units);
        for (name, value) in [("hidden", &self.hidden), ("cell", &self.cell)] {
            let actual = (value.count(), value.stride());
            if actual != expected {
                return Err(anyhow!(
                    "invalid {name} state shape: expected {expected:?}, got {actual:?}"
                ));
            }
        }
        Ok(())
    }
}

/// Long short-term memory layer.
///
/// Gate blocks are laid out along the `4 * units` axis in the order
/// input, forget, candidate, output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lstm {
    kernel: TrainableLinear,
    recurrent_kernel: TrainableLinear,
    bias: TrainableLinear,
    inputs_count: usize,
    units: usize,
}

pub struct LstmForward {
    pub outputs: Linear,
    pub final_state: LstmState,
    cache: LstmCache,
}

struct LstmCache {
    // states[t] is the state fed into step t, the last entry is the final state
    states: Vec<LstmState>,
    steps: Vec<LstmStepCache>,
}

struct LstmStepCache {
    input: LayerValues,
    forget: LayerValues,
    candidate: LayerValues,
    output: LayerValues,
    cell_tanh: LayerValues,
}

impl Lstm {
    pub fn new(
        inputs_count: usize,
        units: usize,
        strategy: &LayerInitStrategy,
        rng: &RngStrategy,
    ) -> Self {
        let gates_count = 4 * units;

        let mut kernel = Linear::new(inputs_count, gates_count);
        kernel.initialize_as_layer(strategy, rng);

        let mut recurrent_kernel = Linear::new(units, gates_count);
        recurrent_kernel.initialize_as_layer(strategy, rng);

        let mut bias = Linear::new(1, gates_count);
        bias.initialize_as_layer_bias(strategy, rng);
        bias.rows_iter_mut().for_each(|row| {
            row[units..2 * units].iter_mut().for_each(|x| *x = 1.0);
        });

        Self {
            kernel: kernel.into(),
            recurrent_kernel: recurrent_kernel.into(),
            bias: bias.into(),
            inputs_count,
            units,
        }
    }

    pub fn forward(&self, inputs: &Linear, initial_state: &LstmState) -> Result<LstmForward> {
        if inputs.stride() != self.inputs_count {
            Err(anyhow!(
                "mismatched input vector size: expected {}, got {}",
                self.inputs_count,
                inputs.stride()
            ))?;
        }
        initial_state.validate(self.units)?;

        let projected = self.project_inputs(inputs);
        let mut outputs = Linear::new(inputs.count(), self.units);
        let mut states = Vec::with_capacity(inputs.count() + 1);
        let mut steps = Vec::with_capacity(inputs.count());
        states.push(initial_state.clone());

        for (t, projected_row) in projected.rows_iter().enumerate() {
            let previous = states.last().context("missing previous lstm state")?;
            let (state, step) = self.cell_step(projected_row, previous);
            outputs.copy_stride_into(state.hidden.as_slice(), t);
            states.push(state);
            steps.push(step);
        }

        let final_state = states.last().cloned().context("missing final lstm state")?;
        Ok(LstmForward {
            outputs,
            final_state,
            cache: LstmCache { states, steps },
        })
    }

    /// Advances a single timestep from a dense input row.
    pub fn step(&self, input_row: &[NodeValue], state: &LstmState) -> Result<LstmState> {
        if input_row.len() != self.inputs_count {
            Err(anyhow!(
                "mismatched input vector size: expected {}, got {}",
                self.inputs_count,
                input_row.len()
            ))?;
        }
        state.validate(self.units)?;

        let projected = self.project_inputs(&Linear::from_row(input_row));
        let (state, _) = self.cell_step(projected.as_slice(), state);
        Ok(state)
    }

    /// Same as [`Lstm::step`] for a one-hot input, selecting a kernel row instead of a product.
    pub fn step_token(&self, token_idx: usize, state: &LstmState) -> Result<LstmState> {
        state.validate(self.units)?;
        let kernel_row = self.kernel.value().row(token_idx).with_context(|| {
            format!(
                "token index {token_idx} out of range for {} inputs",
                self.inputs_count
            )
        })?;

        let projected: Vec<NodeValue> = kernel_row
            .iter()
            .zip(self.bias.value().as_slice())
            .map(|(w, b)| w + b)
            .collect();
        let (state, _) = self.cell_step(&projected, state);
        Ok(state)
    }

    fn project_inputs(&self, inputs: &Linear) -> Linear {
        // -> projected = inputs * kernel + bias
        let projected = inputs.matrix_product(self.kernel.value());
        if inputs.count() == 0 {
            return projected;
        }
        let bias = self.bias.iter().stack(inputs.count());
        projected.iter().add(bias).collect()
    }

    fn cell_step(&self, projected: &[NodeValue], previous: &LstmState) -> (LstmState, LstmStepCache) {
        let units = self.units;
        let recurrent = previous.hidden.matrix_product(self.recurrent_kernel.value());
        let z: Vec<NodeValue> = projected
            .iter()
            .zip(recurrent.as_slice())
            .map(|(x, h)| x + h)
            .collect();

        let input: LayerValues = z[..units].iter().map(|x| sigmoid(*x)).collect();
        let forget: LayerValues = z[units..2 * units].iter().map(|x| sigmoid(*x)).collect();
        let candidate: LayerValues = z[2 * units..3 * units].iter().map(|x| x.tanh()).collect();
        let output: LayerValues = z[3 * units..].iter().map(|x| sigmoid(*x)).collect();

        let cell: Vec<NodeValue> = izip!(
            forget.iter(),
            previous.cell.as_slice(),
            input.iter(),
            candidate.iter()
        )
        .map(|(f, c_prev, i, g)| f * c_prev + i * g)
        .collect();
        let cell_tanh: LayerValues = cell.iter().map(|x| x.tanh()).collect();
        let hidden: Vec<NodeValue> = output
            .iter()
            .zip(cell_tanh.iter())
            .map(|(o, c)| o * c)
            .collect();

        let state = LstmState {
            hidden: Linear::from_row(&hidden),
            cell: Linear::from_row(&cell),
        };
        let step = LstmStepCache {
            input,
            forget,
            candidate,
            output,
            cell_tanh,
        };
        (state, step)
    }

    /// Back-propagates through every timestep of `forward`.
    ///
    /// `output_gradients` is `T x units` (zeros when only the final state is consumed),
    /// `final_state_gradients` carries the loss gradient of the final `(h, c)`.
    /// Queues parameter gradients and returns the input gradients with the
    /// gradients of the initial state.
    pub fn backward(
        &self,
        inputs: &Linear,
        forward: &LstmForward,
        output_gradients: &Linear,
        final_state_gradients: &LstmState,
    ) -> Result<(Linear, LstmState)> {
        let units = self.units;
        let seq_len = inputs.count();
        let cache = &forward.cache;

        if output_gradients.count() != seq_len || output_gradients.stride() != units {
            Err(anyhow!(
                "mismatched output gradients shape: expected {:?}, got {:?}",
                (seq_len, units),
                (output_gradients.count(), output_gradients.stride())
            ))?;
        }
        if cache.steps.len() != seq_len {
            Err(anyhow!("forward pass does not match inputs sequence length"))?;
        }
        final_state_gradients.validate(units)?;

        let mut dh_next = final_state_gradients.hidden.as_slice().to_vec();
        let mut dc_next = final_state_gradients.cell.as_slice().to_vec();
        if seq_len == 0 {
            return Ok((Linear::new(0, self.inputs_count), final_state_gradients.clone()));
        }

        let mut gate_gradients = Linear::new(seq_len, 4 * units);

        for t in (0..seq_len).rev() {
            let step = &cache.steps[t];
            let prev_cell = cache.states[t].cell.as_slice();
            let doutput = output_gradients.row(t).context("missing output gradient row")?;

            let mut dz = vec![0.0; 4 * units];
            let mut dc_prev = vec![0.0; units];

            for j in 0..units {
                let (i, f, g, o) = (
                    step.input[j],
                    step.forget[j],
                    step.candidate[j],
                    step.output[j],
                );
                let tanh_c = step.cell_tanh[j];

                let dh = doutput[j] + dh_next[j];
                let dc = dc_next[j] + dh * o * (1.0 - tanh_c * tanh_c);

                dz[j] = dc * g * i * (1.0 - i);
                dz[units + j] = dc * prev_cell[j] * f * (1.0 - f);
                dz[2 * units + j] = dc * i * (1.0 - g * g);
                dz[3 * units + j] = dh * tanh_c * o * (1.0 - o);

                dc_prev[j] = dc * f;
            }

            // -> dh_prev = dz * recurrent_kernel.T
            let dh_prev = Linear::from_row(&dz)
                .matrix_product_rhs_transposed(self.recurrent_kernel.value());
            gate_gradients.copy_stride_into(&dz, t);

            dh_next = dh_prev.as_slice().to_vec();
            dc_next = dc_prev;
        }

        let previous_hidden = Linear::from_iter(
            units,
            cache.states[..seq_len]
                .iter()
                .flat_map(|state| state.hidden.as_slice().iter().copied()),
        )?;

        // -> kernel_gradients = inputs.T * dz
        let kernel_gradients = inputs.matrix_product_lhs_transposed(&gate_gradients);
        // -> recurrent_kernel_gradients = h_prev.T * dz
        let recurrent_kernel_gradients =
            previous_hidden.matrix_product_lhs_transposed(&gate_gradients);
        let bias_gradients = gate_gradients.iter_transpose().flatten_sum();

        self.queue_gradients(LstmKernel, kernel_gradients.iter().boxed())?;
        self.queue_gradients(LstmRecurrentKernel, recurrent_kernel_gradients.iter().boxed())?;
        self.queue_gradients(LstmBias, bias_gradients.iter_transpose().boxed())?;

        // -> input_gradients = dz * kernel.T
        let input_gradients = gate_gradients.matrix_product_rhs_transposed(self.kernel.value());
        let initial_state_gradients = LstmState {
            hidden: Linear::from_row(&dh_next),
            cell: Linear::from_row(&dc_next),
        };

        Ok((input_gradients, initial_state_gradients))
    }

    pub fn apply_gradients<T: OptimizerSource>(&mut self, optimizer: &T, scope: &str) -> Result<()> {
        self.apply_param_gradients(LstmKernel, optimizer, scope)?;
        self.apply_param_gradients(LstmRecurrentKernel, optimizer, scope)?;
        self.apply_param_gradients(LstmBias, optimizer, scope)?;
        Ok(())
    }

    /// Drops gradients queued by [`Lstm::backward`] since the last update.
    pub fn discard_gradients(&self) -> Result<()> {
        self.discard_param_gradients(LstmKernel)?;
        self.discard_param_gradients(LstmRecurrentKernel)?;
        self.discard_param_gradients(LstmBias)
    }
}

impl TrainableParameter<LstmKernel> for Lstm {
    fn store(&self) -> Option<ParameterStore> {
        Some(self.kernel.parameters())
    }

    fn param_mut(&mut self) -> Option<&mut TrainableLinear> {
        Some(&mut self.kernel)
    }
}

impl TrainableParameter<LstmRecurrentKernel> for Lstm {
    fn store(&self) -> Option<ParameterStore> {
        Some(self.recurrent_kernel.parameters())
    }

    fn param_mut(&mut self) -> Option<&mut TrainableLinear> {
        Some(&mut self.recurrent_kernel)
    }
}

impl TrainableParameter<LstmBias> for Lstm {
    fn store(&self) -> Option<ParameterStore> {
        Some(self.bias.parameters())
    }

    fn param_mut(&mut self) -> Option<&mut TrainableLinear> {
        Some(&mut self.bias)
    }
}
