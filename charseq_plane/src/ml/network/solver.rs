use anyhow::{anyhow, Result};

use crate::ml::NodeValue;

use self::source::{DefaultOptimizerCache, DynamicOptimizerFactory, OptimizerSource};

use super::linear::Linear;

pub trait Optimizer {
    fn update(&mut self, target: &mut Linear, dloss_dtarget: &Linear) -> Result<()>;
}

impl<O: Optimizer + ?Sized> Optimizer for Box<O> {
    fn update(&mut self, target: &mut Linear, dloss_dtarget: &Linear) -> Result<()> {
        (**self).update(target, dloss_dtarget)
    }
}

pub struct AdamOptimizer {
    momentum: Linear,
    rms: Linear,
    beta: (NodeValue, NodeValue),
    epsilon: NodeValue,
    eta: NodeValue,
    t: u64,
}

impl AdamOptimizer {
    pub fn new(param_count: usize, param_dimension: usize, learn_rate: NodeValue) -> Self {
        Self::new_builder(param_count, param_dimension)
            .with_eta(learn_rate)
            .build()
    }

    pub fn new_builder(param_count: usize, param_dimension: usize) -> builder::AdamOptimizerBuilder {
        builder::AdamOptimizerBuilder::new(param_count, param_dimension)
    }

    pub fn new_cache(learn_rate: NodeValue) -> impl OptimizerSource {
        DefaultOptimizerCache::new(DynamicOptimizerFactory::new(
            move |param_count, param_dimension| Self::new(param_count, param_dimension, learn_rate),
        ))
    }
}

impl Optimizer for AdamOptimizer {
    fn update(&mut self, target: &mut Linear, dloss_dtarget: &Linear) -> Result<()> {
        let beta1 = self.beta.0;
        let beta2 = self.beta.1;
        let t = self.t as NodeValue;

        let gradient_squared = dloss_dtarget.iter().powf_scalar(2.0);

        self.momentum = self
            .momentum
            .iter()
            .multiply_scalar(beta1)
            .add(dloss_dtarget.iter().multiply_scalar(1.0 - beta1))
            .collect();

        self.rms = self
            .rms
            .iter()
            .multiply_scalar(beta2)
            .add(gradient_squared.multiply_scalar(1.0 - beta2))
            .collect();

        let momentum_corrected = &self
            .momentum
            .iter()
            .multiply_scalar(1.0 / (1.0 - beta1.powf(t)))
            .collect();

        let rms_corrected = &self
            .rms
            .iter()
            .multiply_scalar(1.0 / (1.0 - beta2.powf(t)))
            .collect();

        let eta_correction = momentum_corrected
            .iter()
            .div(rms_corrected.iter().powf_scalar(0.5), Some(self.epsilon))
            .multiply_scalar(-self.eta);

        let next_value = target.iter().add(eta_correction).collect();
        if !next_value.is_finite() {
            Err(anyhow!("failed to update target: invalid gradients"))?;
        }

        self.t += 1;
        *target = next_value;
        Ok(())
    }
}

/// Root-mean-square propagation, the training default.
pub struct RMSpropOptimizer {
    cache: Linear,
    gamma: NodeValue,
    epsilon: NodeValue,
    eta: NodeValue,
}

impl RMSpropOptimizer {
    pub fn new(param_count: usize, param_dimension: usize) -> Self {
        Self {
            cache: Linear::new(param_count, param_dimension),
            gamma: 0.9,
            epsilon: 1e-7,
            eta: 0.001,
        }
    }

    pub fn with_gamma(mut self, gamma: NodeValue) -> Self {
        self.gamma = gamma;
        self
    }

    pub fn with_epsilon(mut self, epsilon: NodeValue) -> Self {
        self.epsilon = epsilon;
        self
    }

    pub fn with_eta(mut self, eta: NodeValue) -> Self {
        self.eta = eta;
        self
    }

    pub fn new_cache(learn_rate: NodeValue) -> impl OptimizerSource {
        DefaultOptimizerCache::new(DynamicOptimizerFactory::new(
            move |param_count, param_dimension| {
                Self::new(param_count, param_dimension).with_eta(learn_rate)
            },
        ))
    }
}

impl Optimizer for RMSpropOptimizer {
    fn update(&mut self, target: &mut Linear, dloss_dtarget: &Linear) -> Result<()> {
        let gamma = self.gamma;
        let epsilon = self.epsilon;
        let eta = self.eta;

        let gradient_squared = dloss_dtarget.iter().powf_scalar(2.0);
        self.cache = self
            .cache
            .iter()
            .multiply_scalar(gamma)
            .add(gradient_squared.multiply_scalar(1.0 - gamma))
            .collect();

        let eta_correction = dloss_dtarget
            .iter()
            .div(self.cache.iter().powf_scalar(0.5), Some(epsilon))
            .multiply_scalar(-eta);

        let next_value = target.iter().add(eta_correction).collect();
        if !next_value.is_finite() {
            Err(anyhow!("failed to update target: invalid gradients"))?;
        }

        *target = next_value;
        Ok(())
    }
}

pub struct SGDOptimizer {
    learn_rate: NodeValue,
}

impl SGDOptimizer {
    pub fn new(learn_rate: NodeValue) -> Self {
        Self { learn_rate }
    }

    pub fn new_cache(learn_rate: NodeValue) -> impl OptimizerSource {
        DefaultOptimizerCache::new(DynamicOptimizerFactory::new(move |_, _| {
            Self::new(learn_rate)
        }))
    }
}

impl Optimizer for SGDOptimizer {
    fn update(&mut self, target: &mut Linear, dloss_dtarget: &Linear) -> Result<()> {
        let next_value = target
            .iter()
            .apply_gradients(dloss_dtarget.iter(), self.learn_rate);
        if !next_value.is_finite() {
            Err(anyhow!("failed to update target: invalid gradients"))?;
        }

        *target = next_value;
        Ok(())
    }
}

pub mod source {
    use std::{cell::RefCell, collections::HashMap, rc::Rc, sync::Arc};

    use tracing::debug;

    use super::{lazy::LazyOptimizer, Linear, Optimizer};

    /// Hands out one optimizer state per named parameter.
    pub trait OptimizerSource: Clone {
        type Optimizer: Optimizer;

        fn create(
            &self,
            param_count: usize,
            param_dimension: usize,
            instance_name: String,
        ) -> Self::Optimizer;
        fn create_lazy_named(&self, instance_name: String) -> LazyOptimizer<'_, Self::Optimizer>;
        fn instance_count(&self) -> usize;
    }

    pub trait DefaultOptimizerFactory<O>: Clone {
        fn create(&self, param_count: usize, param_dimension: usize) -> O;
    }

    pub struct DefaultOptimizerCache<F, O>
    where
        F: DefaultOptimizerFactory<O>,
    {
        factory: F,
        instances: Rc<RefCell<HashMap<String, Rc<RefCell<O>>>>>,
    }

    impl<F, O> Clone for DefaultOptimizerCache<F, O>
    where
        F: DefaultOptimizerFactory<O>,
    {
        fn clone(&self) -> Self {
            Self {
                factory: self.factory.clone(),
                instances: self.instances.clone(),
            }
        }
    }

    impl<F: DefaultOptimizerFactory<O>, O> DefaultOptimizerCache<F, O> {
        pub fn new(factory: F) -> Self {
            Self {
                factory,
                instances: Rc::new(RefCell::new(HashMap::new())),
            }
        }

        fn new_instance(&self, param_count: usize, param_dimension: usize) -> O {
            self.factory.create(param_count, param_dimension)
        }
    }

    impl<F, O> OptimizerSource for DefaultOptimizerCache<F, O>
    where
        F: DefaultOptimizerFactory<O>,
        O: Optimizer + 'static,
    {
        type Optimizer = OptimizerCacheEntry<O>;

        fn create(
            &self,
            param_count: usize,
            param_dimension: usize,
            instance_name: String,
        ) -> Self::Optimizer {
            let value = self
                .instances
                .borrow_mut()
                .entry(instance_name)
                .or_insert_with_key(|key| {
                    debug!("Created new optimiser instance with key='{}'", key);
                    let value = self.new_instance(param_count, param_dimension);
                    Rc::new(RefCell::new(value))
                })
                .clone();
            OptimizerCacheEntry(value)
        }

        fn create_lazy_named(&self, instance_name: String) -> LazyOptimizer<'_, Self::Optimizer> {
            LazyOptimizer::new(move |param_count, param_dimension| {
                self.create(param_count, param_dimension, instance_name)
            })
        }

        fn instance_count(&self) -> usize {
            self.instances.borrow().len()
        }
    }

    pub struct OptimizerCacheEntry<O>(Rc<RefCell<O>>);

    impl<T: Optimizer> Optimizer for OptimizerCacheEntry<T> {
        fn update(&mut self, target: &mut Linear, dloss_dtarget: &Linear) -> anyhow::Result<()> {
            self.0.borrow_mut().update(target, dloss_dtarget)
        }
    }

    pub struct DynamicOptimizerFactory<O> {
        inner: Arc<dyn Fn(usize, usize) -> O>,
    }

    impl<O> Clone for DynamicOptimizerFactory<O> {
        fn clone(&self) -> Self {
            Self {
                inner: self.inner.clone(),
            }
        }
    }

    impl<O> DynamicOptimizerFactory<O> {
        pub fn new<F: Fn(usize, usize) -> O + 'static>(inner: F) -> Self {
            Self {
                inner: Arc::new(inner),
            }
        }
    }

    impl<O> DefaultOptimizerFactory<O> for DynamicOptimizerFactory<O> {
        fn create(&self, param_count: usize, param_dimension: usize) -> O {
            (self.inner)(param_count, param_dimension)
        }
    }
}

pub mod lazy {
    use anyhow::{Context, Result};

    use super::{Linear, Optimizer};

    /// Defers building optimizer state until the first gradient reveals its shape.
    pub struct LazyOptimizer<'a, O> {
        factory: Option<Box<dyn FnOnce(usize, usize) -> O + 'a>>,
        instance: Option<O>,
    }

    impl<'a, O: Optimizer> LazyOptimizer<'a, O> {
        pub fn new<F: FnOnce(usize, usize) -> O + 'a>(factory: F) -> Self {
            Self {
                factory: Some(Box::new(factory)),
                instance: None,
            }
        }
    }

    impl<'a, O: Optimizer> Optimizer for LazyOptimizer<'a, O> {
        fn update(&mut self, target: &mut Linear, dloss_dtarget: &Linear) -> Result<()> {
            if self.instance.is_none() {
                let factory = self
                    .factory
                    .take()
                    .context("lazy optimizer factory was already consumed")?;
                self.instance = Some(factory(dloss_dtarget.count(), dloss_dtarget.stride()));
            }

            let instance = self
                .instance
                .as_mut()
                .context("lazy optimizer instance missing")?;
            instance.update(target, dloss_dtarget)
        }
    }
}

pub mod builder {
    use super::*;

    pub struct AdamOptimizerBuilder {
        momentum: Linear,
        rms: Linear,
        beta: (NodeValue, NodeValue),
        epsilon: NodeValue,
        eta: NodeValue,
    }

    impl AdamOptimizerBuilder {
        pub fn new(param_count: usize, param_dimension: usize) -> Self {
            Self {
                momentum: Linear::new(param_count, param_dimension),
                rms: Linear::new(param_count, param_dimension),
                beta: (0.9, 0.999),
                epsilon: 1e-7,
                eta: 0.001,
            }
        }

        pub fn with_eta(mut self, eta: NodeValue) -> Self {
            self.eta = eta;
            self
        }

        pub fn build(self) -> AdamOptimizer {
            AdamOptimizer {
                momentum: self.momentum,
                rms: self.rms,
                beta: self.beta,
                epsilon: self.epsilon,
                eta: self.eta,
                t: 1,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use crate::ml::network::tests::helpers::{assert_optimisation_converges, new_linear};

    use super::*;

    fn assert_optimizer_converges<O: Optimizer>(optimizer: O) {
        let batch_count = 12;
        let input_dimension = 48;
        let output_dimension = 8;

        let iters = 100;
        let optimizer = RefCell::new(optimizer);

        assert_optimisation_converges(
            &move |rng| {
                let weights = new_linear(output_dimension, input_dimension, &rng);
                let inputs = new_linear(batch_count, input_dimension, &rng);
                let target = new_linear(batch_count, output_dimension, &rng);
                (weights, inputs, target)
            },
            &move |weights, inputs| inputs.matrix_product_rhs_transposed(&weights),
            &move |weights, inputs, dloss| {
                let dweights = dloss.matrix_product_lhs_transposed(&inputs);
                let dinputs = dloss.matrix_product(&weights);
                optimizer.borrow_mut().update(weights, &dweights).unwrap();
                dinputs
            },
            iters,
        );
    }

    #[test]
    fn adam_can_optimise_linear() {
        assert_optimizer_converges(AdamOptimizer::new_builder(8, 48).with_eta(0.1).build());
    }

    #[test]
    fn rms_prop_can_optimise_linear() {
        assert_optimizer_converges(
            RMSpropOptimizer::new(8, 48)
                .with_eta(0.01)
                .with_gamma(0.999),
        );
    }

    #[test]
    fn sgd_can_optimise_linear() {
        assert_optimizer_converges(SGDOptimizer::new(0.01));
    }

    #[test]
    fn boxed_optimizer_can_optimise_linear() {
        let optimizer: Box<dyn Optimizer> = Box::new(RMSpropOptimizer::new(8, 48).with_eta(0.01));
        assert_optimizer_converges(optimizer);
    }

    #[test]
    fn optimizer_rejects_non_finite_update() {
        let mut target = Linear::with_value(1, 2, 1.0);
        let grads = Linear::with_value(1, 2, NodeValue::NAN);

        let mut optimizer = SGDOptimizer::new(0.1);
        assert!(optimizer.update(&mut target, &grads).is_err());
        assert_eq!(Linear::with_value(1, 2, 1.0), target);
    }

    #[test]
    fn optimizer_cache_reuses_named_instances() {
        let cache = RMSpropOptimizer::new_cache(0.01);
        let mut target = Linear::with_value(2, 3, 1.0);
        let grads = Linear::with_value(2, 3, 0.1);

        cache
            .create_lazy_named("layer.kernel".to_string())
            .update(&mut target, &grads)
            .unwrap();
        cache
            .create_lazy_named("layer.kernel".to_string())
            .update(&mut target, &grads)
            .unwrap();
        assert_eq!(1, cache.instance_count());

        cache
            .create_lazy_named("layer.bias".to_string())
            .update(&mut target, &grads)
            .unwrap();
        assert_eq!(2, cache.instance_count());
    }
}
