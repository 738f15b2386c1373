pub mod histogram;
pub mod markers;

pub use histogram::{Bin, RegionData, Spectrum};
pub use markers::{Interval, MarkerKind, MarkerSet};
