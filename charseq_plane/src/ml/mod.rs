pub mod cell;
pub mod corpus;
mod network;
mod random;
pub mod seq2seq;
pub mod vocab;

pub use network::*;
pub use random::*;
