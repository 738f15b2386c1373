//! Channel to energy calibration and rebinning onto a uniform energy grid.

pub mod function;
pub mod rebin;

pub use function::{Calibration, Direction};
pub use rebin::{CalbinOptions, RebinMode, Rebinner};
