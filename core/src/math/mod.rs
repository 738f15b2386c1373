pub mod matrix;
pub mod optimizer;
pub mod special;
pub mod stats;

pub use matrix::MatrixHelper;
pub use optimizer::{LeastSquaresModel, LevenbergMarquardt, Observations, OptimizerSettings, Solution};
pub use stats::StatsHelper;
