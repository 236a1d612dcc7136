use std::sync::{Arc, Mutex, RwLock};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::ml::NodeValue;

use super::{
    linear::{BoxedLinearIter, Linear, LinearIter},
    solver::{source::OptimizerSource, Optimizer},
};

/// A layer parameter addressed by a key type, so one layer can expose several
/// parameters through the same trait.
pub trait TrainableParameter<P: keys::TrainableParameterKey> {
    fn store(&self) -> Option<ParameterStore>;
    fn param_mut(&mut self) -> Option<&mut TrainableLinear>;
    fn queue_gradients(&self, _: P, gradients: BoxedLinearIter) -> Result<()> {
        match self.store() {
            Some(store) => store.add_gradients(gradients),
            None => Ok(()),
        }
    }
    fn discard_param_gradients(&self, _: P) -> Result<()> {
        match self.store() {
            Some(store) => store.clear(),
            None => Ok(()),
        }
    }
    fn apply_param_gradients<T: OptimizerSource>(
        &mut self,
        _: P,
        optimizer: &T,
        scope: &str,
    ) -> Result<()> {
        if let Some(store) = self.store() {
            let instance_name = format!("{scope}.{}", P::NAME);
            store.apply_param_gradients(optimizer, instance_name, self.param_mut())?;
        }
        Ok(())
    }
}

#[derive(Debug, Default, PartialEq, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrainableLinear {
    value: Linear,
    #[serde(skip)]
    parameters: ParameterStore,
}

impl TrainableLinear {
    pub fn parameters(&self) -> ParameterStore {
        self.parameters.clone()
    }

    pub fn value(&self) -> &Linear {
        &self.value
    }

    pub fn value_mut(&mut self) -> &mut Linear {
        &mut self.value
    }

    pub fn iter<'a>(&'a self) -> LinearIter<'a, impl Iterator<Item = NodeValue> + 'a> {
        self.value.iter()
    }

    pub fn stride(&self) -> usize {
        self.value.stride()
    }

    pub fn count(&self) -> usize {
        self.value.count()
    }
}

impl From<Linear> for TrainableLinear {
    fn from(value: Linear) -> Self {
        Self {
            value,
            parameters: Default::default(),
        }
    }
}

/// Gradient accumulator shared by every clone of a [`TrainableLinear`].
///
/// Writers that lose the race for the accumulator push into an overflow queue,
/// which is folded back in before the optimizer runs.
#[derive(Debug, Default, Clone)]
pub struct ParameterStore(Arc<RwLock<Option<Linear>>>, Arc<Mutex<Vec<Linear>>>);

impl PartialEq for ParameterStore {
    fn eq(&self, _: &Self) -> bool {
        true
    }
}

impl ParameterStore {
    fn add_gradients(&self, gradients: BoxedLinearIter) -> Result<()> {
        let mut store = match self.0.try_write() {
            Ok(store) => store,
            Err(_) => return self.enqueue_gradient(gradients.collect()),
        };
        Self::accumulate(&mut *store, gradients);
        Ok(())
    }

    fn accumulate(store: &mut Option<Linear>, gradients: BoxedLinearIter) {
        *store = Some(match store.take() {
            Some(existing) => existing.iter().add(gradients).collect(),
            None => gradients.collect(),
        });
    }

    fn apply_param_gradients<T: OptimizerSource>(
        &self,
        optimizer: &T,
        instance_name: String,
        param: Option<&mut TrainableLinear>,
    ) -> Result<()> {
        let mut store = self
            .0
            .write()
            .map_err(|_| anyhow!("parameter store lock poisoned"))?;
        for pending in self.dequeue_all()? {
            Self::accumulate(&mut *store, pending.iter().boxed());
        }

        let gradients = match store.take() {
            Some(gradients) => gradients,
            None => return Ok(()),
        };
        if let Some(param) = param {
            let param = param.value_mut();
            let mut opt_param = optimizer.create_lazy_named(instance_name);
            opt_param.update(param, &gradients)?;
        }
        Ok(())
    }

    /// Drops every pending gradient without touching the parameter.
    pub fn clear(&self) -> Result<()> {
        let mut store = self
            .0
            .write()
            .map_err(|_| anyhow!("parameter store lock poisoned"))?;
        store.take();
        self.dequeue_all()?;
        Ok(())
    }

    fn enqueue_gradient(&self, gradients: Linear) -> Result<()> {
        self.1
            .lock()
            .map_err(|_| anyhow!("parameter queue lock poisoned"))?
            .push(gradients);
        Ok(())
    }

    fn dequeue_all(&self) -> Result<Vec<Linear>> {
        let mut queue = self
            .1
            .lock()
            .map_err(|_| anyhow!("parameter queue lock poisoned"))?;
        Ok(queue.drain(..).collect())
    }

    /// Runs `action` over the pending gradient sum, `None` when nothing is queued.
    pub fn peek_gradients<T>(&self, action: impl FnOnce(Option<&Linear>) -> T) -> Result<T> {
        let mut store = self
            .0
            .write()
            .map_err(|_| anyhow!("parameter store lock poisoned"))?;
        for pending in self.dequeue_all()? {
            Self::accumulate(&mut *store, pending.iter().boxed());
        }
        Ok(action(store.as_ref()))
    }
}

pub mod keys {
    use std::fmt::Debug;

    pub use dense::*;
    pub use lstm::*;

    pub trait TrainableParameterKey: Debug {
        const NAME: &'static str;
    }

    pub mod dense {
        #[derive(Debug, Clone, Copy, PartialEq)]
        pub struct DenseWeight;
        impl super::TrainableParameterKey for DenseWeight {
            const NAME: &'static str = "kernel";
        }

        #[derive(Debug, Clone, Copy, PartialEq)]
        pub struct DenseBias;
        impl super::TrainableParameterKey for DenseBias {
            const NAME: &'static str = "bias";
        }
    }

    pub mod lstm {
        #[derive(Debug, Clone, Copy, PartialEq)]
        pub struct LstmKernel;
        impl super::TrainableParameterKey for LstmKernel {
            const NAME: &'static str = "kernel";
        }

        #[derive(Debug, Clone, Copy, PartialEq)]
        pub struct LstmRecurrentKernel;
        impl super::TrainableParameterKey for LstmRecurrentKernel {
            const NAME: &'static str = "recurrent_kernel";
        }

        #[derive(Debug, Clone, Copy, PartialEq)]
        pub struct LstmBias;
        impl super::TrainableParameterKey for LstmBias {
            const NAME: &'static str = "bias";
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::ml::solver::SGDOptimizer;

    use super::{keys::DenseWeight, *};

    struct Holder(TrainableLinear);

    impl TrainableParameter<DenseWeight> for Holder {
        fn store(&self) -> Option<ParameterStore> {
            Some(self.0.parameters())
        }

        fn param_mut(&mut self) -> Option<&mut TrainableLinear> {
            Some(&mut self.0)
        }
    }

    #[test]
    fn queued_gradients_accumulate_until_applied() {
        let mut holder = Holder(Linear::with_value(1, 2, 1.0).into());
        let grads = Linear::with_value(1, 2, 0.5);

        holder.queue_gradients(DenseWeight, grads.iter().boxed()).unwrap();
        holder.queue_gradients(DenseWeight, grads.iter().boxed()).unwrap();

        let store = holder.0.parameters();
        let pending = store.peek_gradients(|x| x.cloned()).unwrap();
        assert_eq!(Some(Linear::with_value(1, 2, 1.0)), pending);

        let optimizer = SGDOptimizer::new_cache(0.1);
        holder
            .apply_param_gradients(DenseWeight, &optimizer, "holder")
            .unwrap();

        assert_eq!(&Linear::with_value(1, 2, 0.9), holder.0.value());
        assert_eq!(None, store.peek_gradients(|x| x.cloned()).unwrap());
    }

    #[test]
    fn overflow_queue_is_folded_into_gradients() {
        let param: TrainableLinear = Linear::new(1, 3).into();
        let store = param.parameters();

        let guard = store.0.read().unwrap();
        store
            .add_gradients(Linear::with_value(1, 3, 2.0).iter().boxed())
            .unwrap();
        drop(guard);
        store
            .add_gradients(Linear::with_value(1, 3, 1.0).iter().boxed())
            .unwrap();

        let pending = store.peek_gradients(|x| x.cloned()).unwrap();
        assert_eq!(Some(Linear::with_value(1, 3, 3.0)), pending);
    }

    #[test]
    fn discarded_gradients_are_never_applied() {
        let mut holder = Holder(Linear::with_value(1, 2, 1.0).into());
        let store = holder.0.parameters();

        let guard = store.0.read().unwrap();
        store
            .add_gradients(Linear::with_value(1, 2, 5.0).iter().boxed())
            .unwrap();
        drop(guard);
        holder
            .queue_gradients(DenseWeight, Linear::with_value(1, 2, 5.0).iter().boxed())
            .unwrap();

        holder.discard_param_gradients(DenseWeight).unwrap();
        assert_eq!(None, store.peek_gradients(|x| x.cloned()).unwrap());

        let optimizer = SGDOptimizer::new_cache(0.1);
        holder
            .apply_param_gradients(DenseWeight, &optimizer, "holder")
            .unwrap();
        assert_eq!(&Linear::with_value(1, 2, 1.0), holder.0.value());
    }

    #[test]
    fn deserialized_parameter_has_fresh_store() {
        let param: TrainableLinear = Linear::with_value(2, 2, 0.25).into();
        let json = serde_json::to_string(&param).unwrap();
        let restored: TrainableLinear = serde_json::from_str(&json).unwrap();

        assert_eq!(param.value(), restored.value());
        assert_eq!(None, restored.parameters().peek_gradients(|x| x.cloned()).unwrap());
    }
}
