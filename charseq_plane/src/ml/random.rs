use std::{ops::Deref, sync::Arc};

use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};

use crate::ml::NodeValue;

use self::rc::ArcRNG;

use super::cell::MutexCell;

#[derive(Clone, Serialize, Deserialize)]
#[serde(from = "source::RngStrategySource")]
pub enum RngStrategy {
    Default,

    Debug {
        seed: u32,
    },

    #[serde(serialize_with = "serialize_cached")]
    Cached(ArcRNG, Arc<RngStrategy>),
}

impl Default for RngStrategy {
    fn default() -> Self {
        Self::Default.upgrade()
    }
}

impl Deref for RngStrategy {
    type Target = dyn RNG;

    fn deref(&self) -> &Self::Target {
        self
    }
}

impl RNG for RngStrategy {
    fn rand(&self) -> NodeValue {
        self.with_rng(|x| x.rand())
    }

    fn rand_normal(&self, mu: NodeValue, sigma: NodeValue) -> NodeValue {
        self.with_rng(|x| x.rand_normal(mu, sigma))
    }
}

impl RngStrategy {
    pub fn testable(seed: u32) -> Self {
        RngStrategy::Debug { seed }.upgrade()
    }

    pub fn from_seed(seed: Option<u32>) -> Self {
        match seed {
            Some(seed) => Self::testable(seed),
            None => Self::default(),
        }
    }

    pub fn to_arc(&self) -> Arc<dyn RNG> {
        match self {
            RngStrategy::Cached(instance, _) => instance.rng.clone(),
            rng => rng.factory().into(),
        }
    }

    pub fn with_rng<F: FnOnce(&dyn RNG) -> O, O>(&self, func: F) -> O {
        match self {
            RngStrategy::Cached(instance, _) => func(instance.as_ref()),
            rng => func(&*rng.factory()),
        }
    }

    pub fn upgrade(self) -> Self {
        match self {
            RngStrategy::Cached(instance, strategy) => RngStrategy::Cached(instance, strategy),
            rng => RngStrategy::Cached(rng.to_arc().into(), Arc::new(rng)),
        }
    }

    fn factory(&self) -> Box<dyn RNG> {
        match self {
            RngStrategy::Default => Box::new(StdRandom::from_entropy()),
            RngStrategy::Debug { seed } => Box::new(StdRandom::new(*seed)),
            RngStrategy::Cached(_, inner) => inner.factory(),
        }
    }

    /// Returns `true` if the rng strategy is [`Cached`].
    ///
    /// [`Cached`]: RngStrategy::Cached
    #[must_use]
    pub fn is_cached(&self) -> bool {
        matches!(self, Self::Cached(..))
    }

    /// Returns `true` if the rng strategy is [`Debug`], directly or behind a cache.
    ///
    /// [`Debug`]: RngStrategy::Debug
    #[must_use]
    pub fn is_debug(&self) -> bool {
        match self {
            Self::Debug { .. } => true,
            Self::Cached(_, inner) => inner.is_debug(),
            _ => false,
        }
    }
}

fn serialize_cached<S>(
    _: &ArcRNG,
    inner: &Arc<RngStrategy>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    let mut inner = inner;
    while let RngStrategy::Cached(_, child) = &**inner {
        inner = child;
    }
    inner.serialize(serializer)
}

impl std::fmt::Debug for RngStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Default => write!(f, "Default"),
            Self::Debug { seed } => f.debug_struct("Debug").field("seed", seed).finish(),
            Self::Cached(_, inner) => f.debug_struct("Cached").field("inner", inner).finish(),
        }
    }
}

mod source {
    use serde::Deserialize;

    use super::RngStrategy;

    #[derive(Deserialize)]
    pub enum RngStrategySource {
        Default,
        Debug { seed: u32 },
        Cached(Box<RngStrategySource>),
    }

    impl From<RngStrategySource> for RngStrategy {
        fn from(value: RngStrategySource) -> Self {
            match value {
                RngStrategySource::Default => RngStrategy::Default.upgrade(),
                RngStrategySource::Debug { seed } => RngStrategy::Debug { seed }.upgrade(),
                RngStrategySource::Cached(inner) => RngStrategy::from(*inner),
            }
        }
    }
}

mod rc {
    use std::{ops::Deref, sync::Arc};

    use super::{RngStrategy, RNG};

    #[derive(Clone)]
    pub struct ArcRNG {
        pub rng: Arc<dyn RNG>,
    }

    impl Default for ArcRNG {
        fn default() -> Self {
            Self {
                rng: Arc::new(RngStrategy::default()),
            }
        }
    }

    impl Deref for ArcRNG {
        type Target = Arc<dyn RNG>;

        fn deref(&self) -> &Self::Target {
            &self.rng
        }
    }

    impl From<Arc<dyn RNG>> for ArcRNG {
        fn from(value: Arc<dyn RNG>) -> Self {
            Self { rng: value }
        }
    }
}

pub struct StdRandom(MutexCell<StdRng>);

impl StdRandom {
    pub fn new(seed: u32) -> Self {
        Self(MutexCell::new(StdRng::seed_from_u64(seed as u64)))
    }

    pub fn from_entropy() -> Self {
        Self(MutexCell::new(StdRng::from_entropy()))
    }
}

impl RNG for StdRandom {
    fn rand(&self) -> NodeValue {
        self.0.with_inner(|inner| inner.gen::<NodeValue>())
    }

    fn rand_normal(&self, mu: NodeValue, sigma: NodeValue) -> NodeValue {
        let z: NodeValue = self.0.with_inner(|inner| StandardNormal.sample(inner));
        mu + sigma * z
    }
}

pub trait RNG: Send + Sync {
    /// uniform sample in `[0, 1)`
    fn rand(&self) -> NodeValue;
    fn rand_range(&self, min: usize, exclusive_max: usize) -> usize {
        let sampled = (self.rand() * (exclusive_max - min) as NodeValue) as usize + min;
        sampled.min(exclusive_max.saturating_sub(1).max(min))
    }
    fn rand_normal(&self, mu: NodeValue, sigma: NodeValue) -> NodeValue {
        use std::f64::consts::PI;
        let u1 = 1.0 - self.rand();
        let u2 = self.rand();
        let z0 = (-2.0 * u1.ln()).sqrt() * (2.0 * PI as NodeValue * u2).cos();
        mu + sigma * z0
    }
}

pub trait ShuffleRng {
    fn shuffle_vec<T>(&self, vec: &mut Vec<T>);
}

impl<T: Deref<Target = dyn RNG>> ShuffleRng for T {
    fn shuffle_vec<E>(&self, vec: &mut Vec<E>) {
        let len = vec.len();

        for i in 0..len {
            let j = self.rand_range(i, len);
            vec.swap(i, j);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rng_strategy_can_be_serialized() {
        let rng_from_variant = RngStrategy::Default;
        let json = serde_json::to_string(&rng_from_variant).unwrap();
        assert_eq!("\"Default\"", json);

        let rng_upgraded = rng_from_variant.upgrade();
        let json = serde_json::to_string(&rng_upgraded).unwrap();
        assert_eq!("{\"Cached\":\"Default\"}", json);

        let rng_from_factory = RngStrategy::testable(1234);
        let json = serde_json::to_string(&rng_from_factory).unwrap();
        assert_eq!("{\"Cached\":{\"Debug\":{\"seed\":1234}}}", json);
    }

    #[test]
    fn rng_strategy_can_be_deserialized() {
        let src_rng = RngStrategy::default();
        let json = serde_json::to_string(&src_rng).unwrap();
        let rng: RngStrategy = serde_json::from_str(&json).unwrap();
        assert!(rng.is_cached());
        assert!(!rng.is_debug());

        let src_rng = RngStrategy::testable(1234);
        let json = serde_json::to_string(&src_rng).unwrap();
        let rng: RngStrategy = serde_json::from_str(&json).unwrap();
        assert!(rng.is_cached());
        assert!(rng.is_debug());

        let rng: RngStrategy = serde_json::from_str("{\"Debug\":{\"seed\":7}}").unwrap();
        assert!(rng.is_cached());
        assert!(rng.is_debug());
    }

    #[test]
    fn seeded_rng_strategy_is_reproducible() {
        let rng_1 = RngStrategy::testable(42);
        let rng_2 = RngStrategy::testable(42);

        let samples_1: Vec<_> = (0..16).map(|_| rng_1.rand_range(0, 1000)).collect();
        let samples_2: Vec<_> = (0..16).map(|_| rng_2.rand_range(0, 1000)).collect();

        assert_eq!(samples_1, samples_2);
        assert!(samples_1.iter().any(|x| *x != samples_1[0]));
    }

    #[test]
    fn std_random_samples_uniformly() {
        let rng = StdRandom::new(6);
        let mut buckets = vec![0; 13];
        let span = 1.0 / buckets.len() as f64;

        let iters = 10_000;
        for _ in 0..iters {
            let bucket_idx = (rng.rand() / span) as usize;
            buckets[bucket_idx] += 1;
        }

        let min_expected = iters / (buckets.len() + 1);
        for (i, bucket) in buckets.iter().enumerate() {
            assert!(*bucket > min_expected, "bucket[{i}] distribution is not even {buckets:?}");
        }
    }

    #[test]
    fn std_random_samples_normal_distribution() {
        let rng = StdRandom::new(6);
        let iters = 10_000;
        let samples: Vec<_> = (0..iters).map(|_| rng.rand_normal(1.0, 2.0)).collect();

        let mean = samples.iter().sum::<f64>() / iters as f64;
        let variance = samples.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / iters as f64;

        assert!((mean - 1.0).abs() < 0.1, "mean = {mean}");
        assert!((variance.sqrt() - 2.0).abs() < 0.1, "stddev = {}", variance.sqrt());
    }

    #[test]
    fn shuffle_vec_keeps_all_elements() {
        let rng = RngStrategy::testable(99);
        let mut values: Vec<usize> = (0..50).collect();
        rng.shuffle_vec(&mut values);

        assert_ne!((0..50).collect::<Vec<_>>(), values);
        values.sort();
        assert_eq!((0..50).collect::<Vec<_>>(), values);
    }
}
