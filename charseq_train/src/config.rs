use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};

use plane::ml::{
    solver::{
        source::{DefaultOptimizerCache, DynamicOptimizerFactory},
        AdamOptimizer, Optimizer, RMSpropOptimizer, SGDOptimizer,
    },
    NodeValue,
};

#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
#[command(name = "train", author, version, about, long_about = None)]
pub struct TrainerConfig {
    #[arg(short = 'i', long, default_value = "fra.txt")]
    pub input_txt_path: String,

    #[arg(short = 'n', long, default_value_t = 10000)]
    pub num_samples: usize,

    #[arg(short = 'd', long, default_value_t = 256)]
    pub latent_dim: usize,

    #[arg(short = 'b', long, default_value_t = 64)]
    pub batch_size: usize,

    #[arg(short = 'e', long, default_value_t = 100)]
    pub epochs: usize,

    #[arg(short = 'X', long, default_value_t = 0.2)]
    pub validation_split: NodeValue,

    #[arg(short = 'r', long, default_value_t = 1e-3)]
    pub train_rate: NodeValue,

    #[arg(short = 's', long, value_enum, default_value_t = SolverKind::Rmsprop)]
    #[serde(default)]
    pub solver: SolverKind,

    #[arg(long, default_value = None)]
    #[serde(default)]
    pub seed: Option<u32>,

    #[arg(short = 'o', long, default_value = "out")]
    pub output_dir: String,

    #[arg(short = 'O', long, default_value = None)]
    #[serde(default)]
    pub output_label: Option<String>,

    #[arg(short = 'p', long, default_value_t = 20)]
    pub preview_count: usize,

    #[arg(short = 'q', long, default_value_t = false)]
    #[serde(default)]
    pub quiet_epochs: bool,
}

#[derive(ValueEnum, Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SolverKind {
    #[default]
    Rmsprop,
    Adam,
    Sgd,
}

pub type TrainerOptimizer =
    DefaultOptimizerCache<DynamicOptimizerFactory<Box<dyn Optimizer>>, Box<dyn Optimizer>>;

impl SolverKind {
    pub fn optimizer(self, learn_rate: NodeValue) -> TrainerOptimizer {
        DefaultOptimizerCache::new(DynamicOptimizerFactory::new(
            move |param_count, param_dimension| -> Box<dyn Optimizer> {
                match self {
                    SolverKind::Rmsprop => Box::new(
                        RMSpropOptimizer::new(param_count, param_dimension).with_eta(learn_rate),
                    ),
                    SolverKind::Adam => {
                        Box::new(AdamOptimizer::new(param_count, param_dimension, learn_rate))
                    }
                    SolverKind::Sgd => Box::new(SGDOptimizer::new(learn_rate)),
                }
            },
        ))
    }
}
